//! Program Code Generation
//!
//! Entry point for generating a whole program: orders the units, runs both
//! passes over each one and appends the global data section.

use super::state::{Annotation, Discoveries, GenerationState, Mode};
use super::{BlockPlan, CodeGen, CodeGenError};
use std::collections::BTreeMap;
use tpc_core::{AsmLine, FrameId, IrInstruction, IrOp, MachineBlock, Opcode};
use tracing::{debug, warn};

impl CodeGen<'_> {
    /// Generate machine code for every unit, callees first.
    pub fn generate(&mut self) -> Result<Vec<MachineBlock>, CodeGenError> {
        let order = self.graph.order()?;
        self.check_frame_ownership()?;

        let mut blocks = Vec::with_capacity(order.len() + 1);
        for unit in order {
            let plan = self.preprocess(unit)?;
            let frame = self.unit_frame(unit)?;
            self.frames
                .set_sized(frame, plan.temporaries, plan.covered.clone())?;

            let lines = self.emit_unit(unit, &plan)?;
            blocks.push(MachineBlock {
                name: self.graph.display_name(unit),
                lines,
            });
            self.plans.insert(unit, plan);
        }

        if let Some(data) = self.global_section()? {
            blocks.push(data);
        }
        Ok(blocks)
    }

    /// A frame's size is measured from the one unit that runs in it.
    fn check_frame_ownership(&self) -> Result<(), CodeGenError> {
        let mut owners: BTreeMap<FrameId, usize> = BTreeMap::new();
        for unit in 0..self.graph.nodes().len() {
            let frame = self.unit_frame(unit)?;
            self.frames.frame(frame)?;
            if let Some(other) = owners.insert(frame, unit) {
                return Err(CodeGenError::Malformed(format!(
                    "frame {} runs both {} and {}",
                    frame,
                    self.labels.base(other),
                    self.labels.base(unit)
                )));
            }
        }
        Ok(())
    }

    fn unit_frame(&self, unit: usize) -> Result<FrameId, CodeGenError> {
        self.graph
            .nodes()
            .get(unit)
            .and_then(|node| self.program.blocks.get(node.head()))
            .map(|block| block.frame)
            .ok_or_else(|| CodeGenError::Logic(format!("no unit {}", unit)))
    }

    /// Instructions of a unit in walk order.
    fn unit_instructions(&self, unit: usize) -> impl Iterator<Item = &IrInstruction> + '_ {
        self.graph
            .nodes()
            .get(unit)
            .into_iter()
            .flat_map(|node| node.blocks.iter())
            .filter_map(|index| self.program.blocks.get(*index))
            .flat_map(|block| block.instructions.iter())
    }

    /// Pass 1: find the spills, then size the frame.
    fn preprocess(&self, unit: usize) -> Result<BlockPlan, CodeGenError> {
        let mut plan = BlockPlan::default();
        for instr in self.unit_instructions(unit) {
            if self.labels.is_target(instr.id) {
                plan.annotations.insert(
                    instr.id,
                    Annotation {
                        needs_label: true,
                        needs_pop_after_label: self.labels.needs_pop(instr.id),
                        ..Annotation::default()
                    },
                );
            }
        }

        let (shape, _) = self.walk(unit, Mode::Shape, &plan)?;
        plan.absorb(&shape);

        let (sized, _) = self.walk(unit, Mode::Size, &plan)?;
        if plan.misses(&sized) {
            return Err(CodeGenError::Logic(format!(
                "sizing walk of '{}' found spills the shape walk missed",
                self.labels.base(unit)
            )));
        }
        plan.temporaries = sized.high_water;
        plan.covered = sized.covered;
        plan.calls = sized.calls;
        plan.returns = sized.returns;

        debug!(
            block = %self.labels.base(unit),
            temporaries = plan.temporaries,
            spills = plan.spill_count(),
            "pass 1 complete"
        );
        Ok(plan)
    }

    /// Pass 2.
    fn emit_unit(&self, unit: usize, plan: &BlockPlan) -> Result<Vec<AsmLine>, CodeGenError> {
        let (found, lines) = self.walk(unit, Mode::Emit, plan)?;
        if found.high_water > plan.temporaries || plan.misses(&found) {
            return Err(CodeGenError::Logic(format!(
                "emission of '{}' disagrees with its plan",
                self.labels.base(unit)
            )));
        }
        debug!(block = %self.labels.base(unit), lines = lines.len(), "pass 2 complete");
        Ok(lines)
    }

    /// One linear walk over a unit.
    pub(super) fn walk(
        &self,
        unit: usize,
        mode: Mode,
        plan: &BlockPlan,
    ) -> Result<(Discoveries, Vec<AsmLine>), CodeGenError> {
        let frame = self.unit_frame(unit)?;
        let mut st = GenerationState::new(
            mode,
            plan,
            unit,
            frame,
            self.labels.base(unit).to_string(),
        );

        let mut falls_through = false;
        for (position, instr) in self.unit_instructions(unit).enumerate() {
            st.current = instr.id;
            st.position = position;
            st.tracker.activate(position, falls_through)?;
            self.enter(&mut st, instr)?;
            self.lower_or_suppress(&mut st, instr)?;
            falls_through = !instr.op.is_terminator();
        }

        self.finish(&st, falls_through)?;
        Ok((st.found, st.lines))
    }

    /// Labels and bookkeeping that precede an instruction.
    fn enter(&self, st: &mut GenerationState<'_>, instr: &IrInstruction) -> Result<(), CodeGenError> {
        let frame = self.frames.frame(st.frame)?;
        let leading = st.position == 0 && matches!(instr.op, IrOp::Label { name: Some(_) });
        let plan = st.plan;
        let annotation = plan.annotation(instr.id);

        if leading {
            st.emit_label(self.labels.label(instr.id)?);
        } else if let Some(a) = annotation
            && a.needs_label
            && !matches!(instr.op, IrOp::AltEnd)
        {
            let pop = a.needs_pop_after_label;
            st.emit_label(self.labels.label(instr.id)?);
            if pop {
                st.emit_op(Opcode::Pop);
            }
        }

        if st.position == 0 && frame.is_process() {
            self.initialise_channels(st, frame.channels);
        }

        if st
            .pars
            .last()
            .is_some_and(|par| par.continuation == instr.id)
        {
            self.join_processes(st)?;
        }
        Ok(())
    }

    /// Lower one instruction, substituting a placeholder for recoverable
    /// failures when errors are suppressed.
    fn lower_or_suppress(
        &self,
        st: &mut GenerationState<'_>,
        instr: &IrInstruction,
    ) -> Result<(), CodeGenError> {
        match self.lower(st, instr) {
            Ok(()) => Ok(()),
            Err(err) if err.is_suppressible() && self.config.suppresses_errors() => {
                if st.emits() {
                    warn!(block = %st.base, instr = %instr.id, "{}", err);
                }
                st.emit_line(AsmLine::Unrecognized {
                    construct: instr.op.mnemonic().to_string(),
                });
                let results = self.frames.frame(st.frame)?.results;
                let (pops, pushes) = instr.op.stack_effect(results);
                st.discard(pops)?;
                st.produce(pushes)
            }
            Err(err) => Err(err),
        }
    }

    fn finish(&self, st: &GenerationState<'_>, falls_through: bool) -> Result<(), CodeGenError> {
        let unbalanced = |detail: String| CodeGenError::UnbalancedBlock {
            block: st.base.clone(),
            detail,
        };
        if falls_through {
            return Err(unbalanced("control falls off the end".to_string()));
        }
        if let Some(par) = st.pars.last() {
            return Err(unbalanced(format!("PAR {} is never joined", par.init)));
        }
        if let Some(alt) = st.alts.last() {
            return Err(unbalanced(format!("ALT {} is never ended", alt.init)));
        }
        if st.tracker.size() > 0 {
            return Err(unbalanced(format!(
                "{} value(s) left on the evaluation stack",
                st.tracker.size()
            )));
        }
        if st.temps().depth() > 0 {
            return Err(unbalanced(format!(
                "{} temporaries still live",
                st.temps().depth()
            )));
        }
        Ok(())
    }
}
