//! Transputer code generation
//!
//! Lowers the stack IR into symbolic transputer instructions.
//!
//! # Strategy
//!
//! Blocks are generated in dependency order (see [`crate::call_graph`]), so a
//! block's callees and started processes are fully sized before its own call
//! sites and PARs reserve memory for them. Plain blocks are merged into the
//! function running in their frame. Each unit is then walked several times
//! by the same lowering code:
//!
//! 1. A *shape* walk finds every value that is ever pushed below a full
//!    register window.
//! 2. A *size* walk allocates temporaries exactly as emission will and
//!    measures the frame's temporary high water.
//! 3. An *emit* walk produces instructions from the frozen [`BlockPlan`].
//!
//! Walks 1 and 2 are Pass 1; walk 3 is Pass 2.
//!
//! # Machine model
//!
//! Three value registers `A`, `B`, `C` form the evaluation stack; loading
//! pushes `A` into `B` and `B` into `C`, and whatever was in `C` is lost.
//! Channel input and output, timer waits and calls may deschedule the process
//! or clobber every register, so nothing may be left in a register below
//! their operands.

mod calls;
mod concurrency;
mod error;
pub mod frame;
mod globals;
mod labels;
mod lowering;
mod program;
pub mod stack_tracker;
pub mod state;
mod values;

pub use error::CodeGenError;
pub use frame::{CallConvention, FrameModel, TempRegion};
pub use labels::LabelTable;
pub use stack_tracker::{StackBranch, StackItem, StackItemId, StackTracker};
pub use state::{Annotation, BlockPlan, CallLayout, ReturnLayout, mangle_name};

use crate::call_graph::CallGraph;
use crate::config::BackendConfig;
use std::collections::BTreeMap;
use tpc_core::{InstrId, IrInstruction, IrProgram};

/// Code generator for one program.
pub struct CodeGen<'a> {
    program: &'a IrProgram,
    config: BackendConfig,
    graph: CallGraph,
    frames: FrameModel,
    labels: LabelTable,
    /// Frozen plans by unit index
    plans: BTreeMap<usize, BlockPlan>,
}

impl<'a> CodeGen<'a> {
    pub fn new(program: &'a IrProgram, config: BackendConfig) -> Result<Self, CodeGenError> {
        let graph = CallGraph::build(program)?;
        let labels = LabelTable::build(program, &graph)?;
        Ok(CodeGen {
            program,
            config,
            graph,
            frames: FrameModel::new(&program.frames)?,
            labels,
            plans: BTreeMap::new(),
        })
    }

    pub fn frames(&self) -> &FrameModel {
        &self.frames
    }

    /// The plan Pass 1 produced for the block declaring `name`.
    pub fn plan(&self, name: &str) -> Option<&BlockPlan> {
        self.plans.get(&self.graph.unit_named(name)?)
    }

    fn instruction(&self, id: InstrId) -> Result<&IrInstruction, CodeGenError> {
        let (block, position) = self.labels.origin(id)?;
        self.program
            .blocks
            .get(block)
            .and_then(|b| b.instructions.get(position))
            .ok_or_else(|| CodeGenError::Logic(format!("instruction {} moved", id)))
    }
}
