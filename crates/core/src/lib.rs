//! tpc Core: the data shared between a front end, the backend and an assembler
//!
//! This crate defines the two interfaces of the transputer backend:
//!
//! - `ir`: the unique-id, stack-oriented IR produced by a front end. Every
//!   instruction carries a stable [`InstrId`] so that jump, process and guard
//!   targets can refer to other instructions.
//! - `asm`: the symbolic machine-instruction stream consumed by an assembler.
//!   Operands are literals, labels, or label differences which the assembler
//!   resolves once the final code layout is known.
//!
//! `builder` offers a small programmatic way to assemble IR programs with
//! fresh instruction ids, used by front ends and by tests.

pub mod asm;
pub mod builder;
pub mod ir;

pub use asm::{AsmLine, Instruction, MachineBlock, Opcode, Operand};
pub use builder::{BlockBuilder, ProgramBuilder};
pub use ir::{
    FrameDecl, FrameId, FrameKind, GlobalDecl, GuardKind, InstrId, IrBlock, IrInstruction, IrOp,
    IrProgram, Priority, VarKind,
};
