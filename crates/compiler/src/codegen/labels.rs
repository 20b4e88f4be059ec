//! Program-wide label naming
//!
//! Labels are derived from the unit name and the instruction id only, so
//! identical IR always yields identical label text. A block's leading named
//! label becomes the mangled name itself; every other instruction label is
//! `<unit>_<id>`, and synthesized anchors append a suffix to that.
//!
//! Mangling can map distinct names onto the same text, so every label that
//! will be defined is checked for uniqueness up front.

use super::CodeGenError;
use super::globals::global_label;
use super::state::mangle_name;
use crate::call_graph::CallGraph;
use std::collections::{BTreeMap, BTreeSet};
use tpc_core::{InstrId, IrOp, IrProgram};

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    bases: Vec<String>,
    names: BTreeMap<InstrId, String>,
    /// Unit index and position within the unit's walk
    locations: BTreeMap<InstrId, (usize, usize)>,
    /// Block index and position within the block
    origins: BTreeMap<InstrId, (usize, usize)>,
    targets: BTreeSet<InstrId>,
    pops: BTreeSet<InstrId>,
}

impl LabelTable {
    pub fn build(program: &IrProgram, graph: &CallGraph) -> Result<Self, CodeGenError> {
        let mut table = LabelTable::default();

        for (unit, node) in graph.nodes().iter().enumerate() {
            let base = match &node.name {
                Some(name) => mangle_name(name),
                None => format!("block{}", node.head()),
            };
            let mut offset = 0;
            for &index in &node.blocks {
                let block = &program.blocks[index];
                for (position, instr) in block.instructions.iter().enumerate() {
                    if table.origins.insert(instr.id, (index, position)).is_some() {
                        return Err(CodeGenError::Malformed(format!(
                            "instruction id {} used twice",
                            instr.id
                        )));
                    }
                    table.locations.insert(instr.id, (unit, offset + position));
                    let name = if position == 0 && block.declared_name().is_some() {
                        base.clone()
                    } else {
                        format!("{}_{}", base, instr.id)
                    };
                    table.names.insert(instr.id, name);
                }
                offset += block.instructions.len();
            }
            table.bases.push(base);
        }

        for block in &program.blocks {
            for instr in &block.instructions {
                match &instr.op {
                    IrOp::Branch { target } => {
                        table.targets.insert(*target);
                    }
                    IrOp::BranchIfFalse { target } => {
                        table.targets.insert(*target);
                        table.pops.insert(*target);
                    }
                    IrOp::ProcessInit { continuation, .. } => {
                        table.targets.insert(*continuation);
                    }
                    IrOp::ProcessStart { entry, .. } => {
                        table.targets.insert(*entry);
                    }
                    IrOp::AltDisable { statement, end, .. } => {
                        table.targets.insert(*statement);
                        table.targets.insert(*end);
                    }
                    _ => {}
                }
                for referenced in instr.op.references() {
                    if !table.origins.contains_key(&referenced) {
                        return Err(CodeGenError::Malformed(format!(
                            "instruction {} refers to unknown instruction {}",
                            instr.id, referenced
                        )));
                    }
                }
            }
        }

        table.check_unique(program)?;
        Ok(table)
    }

    /// Every label the emitted code can define, each exactly once.
    fn check_unique(&self, program: &IrProgram) -> Result<(), CodeGenError> {
        let mut defined: BTreeSet<String> = BTreeSet::new();
        let mut define = |label: String| {
            if defined.insert(label.clone()) {
                Ok(())
            } else {
                Err(CodeGenError::Malformed(format!("label '{}' defined twice", label)))
            }
        };

        for block in &program.blocks {
            for (position, instr) in block.instructions.iter().enumerate() {
                let name = self.label(instr.id)?;
                if (position == 0 && block.declared_name().is_some()) || self.is_target(instr.id) {
                    define(name.to_string())?;
                }
                match &instr.op {
                    IrOp::ProcessInit { .. } | IrOp::LoadGlobal { .. } | IrOp::StoreGlobal { .. } => {
                        define(format!("{}_pc", name))?;
                    }
                    IrOp::ProcessStart { .. } => define(format!("{}_next", name))?,
                    _ => {}
                }
            }
        }
        for global in &program.globals {
            define(global_label(&global.name))?;
        }
        Ok(())
    }

    /// Label prefix of unit `index`.
    pub fn base(&self, index: usize) -> &str {
        self.bases.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn label(&self, id: InstrId) -> Result<&str, CodeGenError> {
        self.names
            .get(&id)
            .map(String::as_str)
            .ok_or_else(|| CodeGenError::Malformed(format!("no instruction with id {}", id)))
    }

    /// A synthesized label tied to instruction `id`.
    pub fn anchor(&self, id: InstrId, suffix: &str) -> Result<String, CodeGenError> {
        Ok(format!("{}_{}", self.label(id)?, suffix))
    }

    /// Unit and position of `id` in that unit's walk.
    pub fn location(&self, id: InstrId) -> Result<(usize, usize), CodeGenError> {
        self.locations
            .get(&id)
            .copied()
            .ok_or_else(|| CodeGenError::Malformed(format!("no instruction with id {}", id)))
    }

    /// Block and position of `id` as written in the IR.
    pub fn origin(&self, id: InstrId) -> Result<(usize, usize), CodeGenError> {
        self.origins
            .get(&id)
            .copied()
            .ok_or_else(|| CodeGenError::Malformed(format!("no instruction with id {}", id)))
    }

    pub fn is_target(&self, id: InstrId) -> bool {
        self.targets.contains(&id)
    }

    pub fn needs_pop(&self, id: InstrId) -> bool {
        self.pops.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpc_core::{FrameDecl, ProgramBuilder};

    #[test]
    fn test_names_and_targets() {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        let done = pb.reserve();
        let mut b = pb.block(0);
        let entry = b.label("main-loop");
        b.push(IrOp::MethodStart);
        b.constant(0);
        b.push(IrOp::BranchIfFalse { target: done });
        b.push_reserved(done, IrOp::Label { name: None });
        b.push(IrOp::MethodEnd);
        b.finish();
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        let table = LabelTable::build(&program, &graph).unwrap();
        assert_eq!(table.label(entry).unwrap(), "main_loop");
        assert_eq!(table.label(done).unwrap(), "main_loop_0");
        assert_eq!(table.anchor(done, "pc").unwrap(), "main_loop_0_pc");
        assert!(table.is_target(done));
        assert!(table.needs_pop(done));
        assert!(!table.is_target(entry));
        assert_eq!(table.location(done).unwrap(), (0, 4));
    }

    #[test]
    fn test_dangling_reference_is_malformed() {
        let mut pb = ProgramBuilder::new();
        let mut b = pb.block(0);
        b.push(IrOp::Branch { target: InstrId(99) });
        b.finish();
        let program = pb.build();
        let graph = CallGraph::build(&program).unwrap();
        assert!(matches!(
            LabelTable::build(&program, &graph),
            Err(CodeGenError::Malformed(_))
        ));
    }

    fn assert_collision(program: &IrProgram) {
        let graph = CallGraph::build(program).unwrap();
        match LabelTable::build(program, &graph) {
            Err(CodeGenError::Malformed(message)) => assert!(message.contains("defined twice")),
            other => panic!("Expected a label collision, got {:?}", other),
        }
    }

    #[test]
    fn test_block_name_colliding_with_jump_label() {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        pb.frame(FrameDecl::function(1));
        let target = pb.reserve();
        let mut b = pb.block(0);
        b.label("f");
        b.push(IrOp::Branch { target });
        b.push_reserved(target, IrOp::Label { name: None });
        b.finish();
        let mut b = pb.block(1);
        b.label(&format!("f_{}", target));
        b.finish();
        assert_collision(&pb.build());
    }

    #[test]
    fn test_names_mangling_to_the_same_label() {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        pb.frame(FrameDecl::function(1));
        let mut b = pb.block(0);
        b.label("a-b");
        b.finish();
        let mut b = pb.block(1);
        b.label("a_b");
        b.finish();
        assert_collision(&pb.build());
    }

    #[test]
    fn test_merged_block_uses_unit_positions() {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        let tail = pb.reserve();
        let mut b = pb.block(0);
        b.label("main");
        b.push(IrOp::MethodStart);
        b.push(IrOp::Branch { target: tail });
        b.finish();
        let mut b = pb.block(0);
        b.push_reserved(tail, IrOp::Label { name: None });
        b.push(IrOp::MethodEnd);
        b.finish();
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        let table = LabelTable::build(&program, &graph).unwrap();
        assert_eq!(table.location(tail).unwrap(), (0, 3));
        assert_eq!(table.origin(tail).unwrap(), (1, 0));
        assert_eq!(table.label(tail).unwrap(), format!("main_{}", tail));
    }
}
