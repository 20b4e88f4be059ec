//! Programmatic IR construction
//!
//! Hands out fresh instruction ids so that front ends and tests can build
//! programs without tracking numbering by hand. Forward references (branch
//! targets, continuations) are obtained with [`ProgramBuilder::reserve`] and
//! bound later with [`BlockBuilder::push_reserved`].

use crate::ir::{FrameDecl, FrameId, GlobalDecl, InstrId, IrBlock, IrInstruction, IrOp, IrProgram};

#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: IrProgram,
    next_id: u32,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&mut self, decl: FrameDecl) -> &mut Self {
        self.program.frames.push(decl);
        self
    }

    pub fn global(&mut self, name: &str, ty: &str, bytes: u32) -> &mut Self {
        self.program.globals.push(GlobalDecl {
            name: name.to_string(),
            ty: ty.to_string(),
        });
        self.program.types.insert(ty.to_string(), bytes);
        self
    }

    /// A fresh id for an instruction that will be pushed later.
    pub fn reserve(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Start a block running in `frame`; finish it with [`BlockBuilder::finish`].
    pub fn block(&mut self, frame: u32) -> BlockBuilder<'_> {
        BlockBuilder {
            owner: self,
            block: IrBlock {
                frame: FrameId(frame),
                instructions: Vec::new(),
            },
        }
    }

    pub fn build(self) -> IrProgram {
        self.program
    }
}

pub struct BlockBuilder<'a> {
    owner: &'a mut ProgramBuilder,
    block: IrBlock,
}

impl BlockBuilder<'_> {
    /// Append an instruction with a fresh id.
    pub fn push(&mut self, op: IrOp) -> InstrId {
        let id = self.owner.reserve();
        self.push_reserved(id, op);
        id
    }

    /// Append an instruction under an id obtained from `reserve`.
    pub fn push_reserved(&mut self, id: InstrId, op: IrOp) {
        self.block.instructions.push(IrInstruction { id, op });
    }

    /// Reserve an id without leaving the block.
    pub fn reserve(&mut self) -> InstrId {
        self.owner.reserve()
    }

    pub fn label(&mut self, name: &str) -> InstrId {
        self.push(IrOp::Label {
            name: Some(name.to_string()),
        })
    }

    pub fn constant(&mut self, value: i64) -> InstrId {
        self.push(IrOp::Const { value })
    }

    pub fn call(&mut self, function: &str, arguments: u32, results: u32) -> InstrId {
        self.push(IrOp::Call {
            function: function.to_string(),
            arguments,
            results,
        })
    }

    pub fn finish(self) {
        self.owner.program.blocks.push(self.block);
    }
}
