//! Block dependency graph and ordering
//!
//! A caller's call sites can only be sized once the callee's frame is
//! known, and a PAR can only reserve memory for a process once the process
//! body has been sized. This module orders blocks so that every dependency
//! comes first.
//!
//! # Units
//!
//! Blocks are generated in units. A block with a leading named label heads
//! its own unit. A plain block (no leading name) is merged into the unit of
//! the first named block running in the same frame, after it and in block
//! order; a frame without a named block is headed by its first block. A
//! unit is walked as one instruction sequence, so jumps between its blocks
//! are ordinary in-function jumps.
//!
//! # Edges
//!
//! - `Call { function }` depends on the unit whose leading label is
//!   `function`. Calls to names without a block are left to lowering, which
//!   reports them as unknown functions.
//! - `ProcessStart { entry }` depends on the unit containing `entry`.
//!
//! # Order
//!
//! Post-order depth-first traversal from every unit nothing depends on, in
//! unit order. The source language has no recursion, so a cycle is a broken
//! front end and is reported with its path rather than broken arbitrarily.
//! Units that are only reachable from a cycle are caught too: nothing may
//! drop out of the order silently.

use crate::codegen::CodeGenError;
use std::collections::{BTreeMap, BTreeSet};
use tpc_core::{FrameId, InstrId, IrOp, IrProgram};

/// One node per generation unit.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub name: Option<String>,
    /// Block indices of the unit, head first
    pub blocks: Vec<usize>,
    /// Units this unit depends on
    pub callees: BTreeSet<usize>,
    /// Whether any unit depends on this one
    pub called: bool,
}

impl DependencyNode {
    /// Index of the block heading the unit.
    pub fn head(&self) -> usize {
        self.blocks[0]
    }
}

#[derive(Debug, Clone)]
pub struct CallGraph {
    nodes: Vec<DependencyNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Group block indices into units, each head first.
fn group_units(program: &IrProgram) -> Result<Vec<Vec<usize>>, CodeGenError> {
    let mut heads: BTreeMap<FrameId, usize> = BTreeMap::new();
    for (index, block) in program.blocks.iter().enumerate() {
        if block.declared_name().is_some() {
            heads.entry(block.frame).or_insert(index);
        }
    }
    for (index, block) in program.blocks.iter().enumerate() {
        heads.entry(block.frame).or_insert(index);
    }

    let mut units: Vec<Vec<usize>> = Vec::new();
    let mut unit_of: BTreeMap<usize, usize> = BTreeMap::new();
    for (index, block) in program.blocks.iter().enumerate() {
        if block.declared_name().is_some() || heads.get(&block.frame) == Some(&index) {
            unit_of.insert(index, units.len());
            units.push(vec![index]);
        }
    }
    for (index, block) in program.blocks.iter().enumerate() {
        if unit_of.contains_key(&index) {
            continue;
        }
        if block.is_function() {
            return Err(CodeGenError::Malformed(format!(
                "plain block {} in frame {} has its own MethodStart",
                index, block.frame
            )));
        }
        let unit = heads
            .get(&block.frame)
            .and_then(|head| unit_of.get(head))
            .copied()
            .ok_or_else(|| CodeGenError::Logic(format!("block {} has no unit", index)))?;
        units[unit].push(index);
    }
    Ok(units)
}

impl CallGraph {
    /// Build the dependency graph of a program.
    pub fn build(program: &IrProgram) -> Result<Self, CodeGenError> {
        let units = group_units(program)?;
        let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
        let mut by_instr: BTreeMap<InstrId, usize> = BTreeMap::new();
        for (unit, blocks) in units.iter().enumerate() {
            for block in blocks.iter().map(|i| &program.blocks[*i]) {
                if let Some(name) = block.declared_name()
                    && by_name.insert(name, unit).is_some()
                {
                    return Err(CodeGenError::Malformed(format!(
                        "block name '{}' declared twice",
                        name
                    )));
                }
                for instr in &block.instructions {
                    by_instr.insert(instr.id, unit);
                }
            }
        }

        let mut nodes: Vec<DependencyNode> = units
            .into_iter()
            .map(|blocks| {
                let mut callees = BTreeSet::new();
                let instructions = blocks
                    .iter()
                    .flat_map(|i| &program.blocks[*i].instructions);
                for instr in instructions {
                    let callee = match &instr.op {
                        IrOp::Call { function, .. } => by_name.get(function.as_str()).copied(),
                        IrOp::ProcessStart { entry, .. } => by_instr.get(entry).copied(),
                        _ => None,
                    };
                    // A self dependency is kept so the traversal reports it.
                    if let Some(callee) = callee {
                        callees.insert(callee);
                    }
                }
                DependencyNode {
                    name: program.blocks[blocks[0]].declared_name().map(str::to_string),
                    blocks,
                    callees,
                    called: false,
                }
            })
            .collect();

        let called: BTreeSet<usize> = nodes.iter().flat_map(|n| n.callees.iter().copied()).collect();
        for index in called {
            nodes[index].called = true;
        }
        Ok(CallGraph { nodes })
    }

    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    /// The unit headed by the block declaring `name`.
    pub fn unit_named(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name.as_deref() == Some(name))
    }

    /// Unit indices, every dependency before its dependents.
    pub fn order(&self) -> Result<Vec<usize>, CodeGenError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut path = Vec::new();

        for root in 0..self.nodes.len() {
            if !self.nodes[root].called {
                self.visit(root, &mut marks, &mut path, &mut order)?;
            }
        }
        // Anything left is only reachable through a cycle.
        for index in 0..self.nodes.len() {
            if marks[index] == Mark::Unvisited {
                self.visit(index, &mut marks, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), CodeGenError> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = path.iter().position(|i| *i == index).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|i| self.display_name(*i)).collect();
                cycle.push(self.display_name(index));
                return Err(CodeGenError::CallGraphCycle(cycle));
            }
            Mark::Unvisited => {}
        }

        marks[index] = Mark::InProgress;
        path.push(index);
        for callee in &self.nodes[index].callees {
            self.visit(*callee, marks, path, order)?;
        }
        path.pop();
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    pub fn display_name(&self, index: usize) -> String {
        match self.nodes.get(index) {
            Some(DependencyNode { name: Some(name), .. }) => name.clone(),
            Some(node) => format!("block{}", node.head()),
            None => format!("unit{}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpc_core::{FrameDecl, FrameId, IrBlock, IrInstruction, ProgramBuilder};

    fn make_block(pb: &mut ProgramBuilder, name: &str, calls: Vec<&str>) {
        let mut b = pb.block(0);
        b.label(name);
        for callee in calls {
            b.call(callee, 0, 0);
        }
        b.finish();
    }

    fn names(graph: &CallGraph, order: &[usize]) -> Vec<String> {
        order.iter().map(|i| graph.display_name(*i)).collect()
    }

    #[test]
    fn test_callee_before_caller() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "f", vec!["g"]);
        make_block(&mut pb, "g", vec!["h"]);
        make_block(&mut pb, "h", vec![]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        let order = graph.order().unwrap();
        assert_eq!(names(&graph, &order), vec!["h", "g", "f"]);
        assert!(graph.nodes()[2].called);
        assert!(!graph.nodes()[0].called);
    }

    #[test]
    fn test_shared_callee_emitted_once() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "main", vec!["a", "b"]);
        make_block(&mut pb, "a", vec!["util"]);
        make_block(&mut pb, "b", vec!["util"]);
        make_block(&mut pb, "util", vec![]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        let order = graph.order().unwrap();
        assert_eq!(names(&graph, &order), vec!["util", "a", "b", "main"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "main", vec!["ping"]);
        make_block(&mut pb, "ping", vec!["pong"]);
        make_block(&mut pb, "pong", vec!["ping"]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        match graph.order() {
            Err(CodeGenError::CallGraphCycle(path)) => {
                assert_eq!(path, vec!["ping", "pong", "ping"]);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_without_entry_point_is_reported() {
        // Every block is called, so no traversal starts from a root.
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "even", vec!["odd"]);
        make_block(&mut pb, "odd", vec!["even"]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        assert!(matches!(
            graph.order(),
            Err(CodeGenError::CallGraphCycle(_))
        ));
    }

    #[test]
    fn test_direct_recursion_is_a_cycle() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "countdown", vec!["countdown"]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        assert!(matches!(
            graph.order(),
            Err(CodeGenError::CallGraphCycle(_))
        ));
    }

    #[test]
    fn test_unknown_callees_are_skipped() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "foo", vec!["missing"]);
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        assert!(graph.nodes()[0].callees.is_empty());
        assert_eq!(graph.order().unwrap(), vec![0]);
    }

    #[test]
    fn test_process_body_before_starter() {
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        pb.frame(FrameDecl::process(1, 0));
        let entry = pb.reserve();
        let starter = pb.reserve();

        let mut b = pb.block(0);
        b.label("main");
        b.push_reserved(
            starter,
            IrOp::ProcessStart {
                entry,
                frame: FrameId(1),
                priority: Default::default(),
            },
        );
        b.finish();

        let mut b = pb.block(1);
        b.push_reserved(entry, IrOp::Label { name: None });
        b.push(IrOp::ProcessEnd { creator: starter });
        b.finish();

        let program = pb.build();
        let graph = CallGraph::build(&program).unwrap();
        assert_eq!(graph.order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let program = IrProgram {
            blocks: vec![
                IrBlock {
                    frame: FrameId(0),
                    instructions: vec![IrInstruction {
                        id: InstrId(0),
                        op: IrOp::Label {
                            name: Some("f".to_string()),
                        },
                    }],
                },
                IrBlock {
                    frame: FrameId(1),
                    instructions: vec![IrInstruction {
                        id: InstrId(1),
                        op: IrOp::Label {
                            name: Some("f".to_string()),
                        },
                    }],
                },
            ],
            ..IrProgram::default()
        };
        assert!(matches!(
            CallGraph::build(&program),
            Err(CodeGenError::Malformed(_))
        ));
    }

    #[test]
    fn test_plain_blocks_join_their_frame() {
        // The plain block comes first but still merges behind `main`.
        let mut pb = ProgramBuilder::new();
        pb.frame(FrameDecl::function(0));
        pb.frame(FrameDecl::function(1));
        let mut b = pb.block(0);
        b.push(IrOp::Label { name: None });
        b.call("helper", 0, 0);
        b.finish();
        let mut b = pb.block(0);
        b.label("main");
        b.push(IrOp::MethodStart);
        b.finish();
        let mut b = pb.block(1);
        b.label("helper");
        b.finish();
        let program = pb.build();

        let graph = CallGraph::build(&program).unwrap();
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.nodes()[0].blocks, vec![1, 0]);
        assert_eq!(graph.unit_named("main"), Some(0));
        // The plain block's call is a dependency of the whole unit.
        assert_eq!(names(&graph, &graph.order().unwrap()), vec!["helper", "main"]);
    }

    #[test]
    fn test_plain_block_with_prologue_rejected() {
        let mut pb = ProgramBuilder::new();
        make_block(&mut pb, "main", vec![]);
        let mut b = pb.block(0);
        b.push(IrOp::MethodStart);
        b.finish();
        assert!(matches!(
            CallGraph::build(&pb.build()),
            Err(CodeGenError::Malformed(_))
        ));
    }
}
