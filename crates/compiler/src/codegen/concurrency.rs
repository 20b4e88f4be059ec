//! PAR and ALT lowering
//!
//! # PAR
//!
//! `ProcessInit` reserves, in the starting block's temporaries, a two-word
//! join record (successor address, then count one word above) and one
//! region per started process. `ProcessStart` writes the static link and
//! the join pointer into the top of the child's workspace and starts it.
//! Every branch finishes with `endp` on the join record; the last one to
//! finish resumes at the continuation with `Wptr` pointing at the record,
//! which is undone there.
//!
//! # ALT
//!
//! Guard conditions and resources are evaluated once, into temporaries, by
//! `AltEnable`. The enable and disable sequences both read the temporaries,
//! so no guard expression is computed twice.

use super::state::{AltContext, GenerationState, GuardSlot, ParContext};
use super::{CodeGen, CodeGenError};
use crate::codegen::frame::SCHEDULER_WORDS;
use std::collections::BTreeSet;
use tpc_core::{FrameId, GuardKind, InstrId, Instruction, IrOp, Opcode, Priority};

impl CodeGen<'_> {
    pub(super) fn lower_process_init(
        &self,
        st: &mut GenerationState<'_>,
        processes: u32,
        continuation: InstrId,
        frames: &[FrameId],
    ) -> Result<(), CodeGenError> {
        st.require_empty()?;
        if frames.len() as u32 + 1 != processes {
            return Err(CodeGenError::Malformed(format!(
                "PAR {} runs {} process(es) but starts {}",
                st.current,
                processes,
                frames.len()
            )));
        }
        let mut sizes = Vec::with_capacity(frames.len());
        for id in frames {
            let frame = self.frames.frame(*id)?;
            if !frame.is_process() || frame.parent != Some(st.frame) {
                return Err(CodeGenError::Malformed(format!(
                    "PAR {} starts frame {}, which is not a process nested in {}",
                    st.current, id, st.frame
                )));
            }
            if frame.temporaries().is_none() {
                return Err(CodeGenError::FrameNotSized(*id));
            }
            sizes.push(self.frames.full_size(*id, Some(st.frame))?);
        }
        let resume = self.target_position(st, continuation)?;

        let first = st.allocate_many(2)?;
        let join = first + 1;
        let mut workspaces = Vec::with_capacity(frames.len());
        for (id, size) in frames.iter().zip(&sizes) {
            let region = st.allocate_many(*size)?;
            workspaces.push((*id, region + size - 1));
            st.found.covered.insert(*id);
        }
        let reserved = st.temps().depth() - first;

        let anchor = self.labels.anchor(st.current, "pc")?;
        st.emit_lit(Opcode::Ldc, i64::from(processes));
        st.emit_lit(Opcode::Stl, st.temporary(first));
        st.emit(Instruction::difference(
            Opcode::Ldc,
            self.labels.label(continuation)?,
            anchor.as_str(),
        ));
        st.emit_op(Opcode::Ldpi);
        st.emit_label(anchor);
        st.emit_lit(Opcode::Stl, st.temporary(join));

        st.pars.push(ParContext {
            init: st.current,
            continuation,
            join,
            first,
            reserved,
            workspaces,
            started: BTreeSet::new(),
        });
        st.tracker.fork(resume, st.position)
    }

    pub(super) fn lower_process_start(
        &self,
        st: &mut GenerationState<'_>,
        entry: InstrId,
        frame: FrameId,
        priority: Priority,
    ) -> Result<(), CodeGenError> {
        if priority != Priority::Inherit {
            return Err(CodeGenError::unsupported(format!("{:?} priority process", priority)));
        }
        st.require_empty()?;
        let child = self.frames.frame(frame)?;
        if child.parent != Some(st.frame) {
            return Err(CodeGenError::Malformed(format!(
                "process frame {} is not nested in {}",
                frame, st.frame
            )));
        }
        let (block, _) = self.labels.origin(entry)?;
        if self.program.blocks[block].frame != frame {
            return Err(CodeGenError::Malformed(format!(
                "entry {} does not run in frame {}",
                entry, frame
            )));
        }
        let temporaries = child
            .temporaries()
            .ok_or(CodeGenError::FrameNotSized(frame))?;

        let par = st.pars.last().ok_or_else(|| {
            CodeGenError::Malformed(format!("process start {} outside a PAR", st.current))
        })?;
        let bottom = par
            .workspaces
            .iter()
            .find(|(id, _)| *id == frame)
            .map(|(_, bottom)| *bottom)
            .ok_or_else(|| {
                CodeGenError::Malformed(format!("PAR {} reserved no workspace for {}", par.init, frame))
            })?;
        if par.started.contains(&frame) {
            return Err(CodeGenError::Malformed(format!(
                "frame {} started twice by PAR {}",
                frame, par.init
            )));
        }
        let join = par.join;

        let workspace = st.temporary(bottom) + i64::from(SCHEDULER_WORDS);
        let linkage = 1 + i64::from(temporaries) + i64::from(child.linkage_offset());
        let next = self.labels.anchor(st.current, "next")?;

        st.emit_lit(Opcode::Ldlp, st.fixed_base());
        st.emit_lit(Opcode::Ldlp, workspace);
        st.emit_lit(Opcode::Stnl, linkage + 1);
        st.emit_lit(Opcode::Ldlp, st.temporary(join));
        st.emit_lit(Opcode::Ldlp, workspace);
        st.emit_lit(Opcode::Stnl, linkage);
        st.emit(Instruction::difference(
            Opcode::Ldc,
            self.labels.label(entry)?,
            next.as_str(),
        ));
        st.emit_lit(Opcode::Ldlp, workspace);
        st.emit_op(Opcode::Startp);
        st.emit_label(next);

        if let Some(par) = st.pars.last_mut() {
            par.started.insert(frame);
        }
        Ok(())
    }

    pub(super) fn lower_process_end(&self, st: &mut GenerationState<'_>, creator: InstrId) -> Result<(), CodeGenError> {
        st.require_empty()?;
        match &self.instruction(creator)?.op {
            IrOp::ProcessInit { .. } => {
                let par = st
                    .pars
                    .iter()
                    .rev()
                    .find(|par| par.init == creator)
                    .ok_or_else(|| {
                        CodeGenError::Malformed(format!(
                            "process end {} outside PAR {}",
                            st.current, creator
                        ))
                    })?;
                let join = par.join;
                st.emit_lit(Opcode::Ldlp, st.temporary(join));
            }
            IrOp::ProcessStart { .. } => {
                let frame = self.frames.frame(st.frame)?;
                if !frame.is_process() {
                    return Err(CodeGenError::Malformed(format!(
                        "process end {} in function frame {}",
                        st.current, frame.id
                    )));
                }
                st.emit_lit(Opcode::Ldl, st.fixed_base() + i64::from(frame.linkage_offset()));
            }
            other => {
                return Err(CodeGenError::Malformed(format!(
                    "process end {} names {} as its creator",
                    st.current,
                    other.mnemonic()
                )));
            }
        }
        st.emit_op(Opcode::Endp);
        Ok(())
    }

    /// Resume after every branch of the innermost PAR has finished.
    pub(super) fn join_processes(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        let par = st
            .pars
            .pop()
            .ok_or_else(|| CodeGenError::Logic("join without an open PAR".to_string()))?;
        if par.started.len() != par.workspaces.len() {
            return Err(CodeGenError::Malformed(format!(
                "PAR {} started {} of its {} process(es)",
                par.init,
                par.started.len(),
                par.workspaces.len()
            )));
        }
        st.require_empty()?;
        st.emit_lit(Opcode::Ajw, -st.temporary(par.join));
        st.release_many(par.first, par.reserved)
    }

    pub(super) fn lower_alt_init(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        st.require_empty()?;
        let timed = st.plan.timed_alts.contains(&st.current);
        st.emit_op(if timed { Opcode::Talt } else { Opcode::Alt });
        st.alts.push(AltContext {
            init: st.current,
            timed,
            guards: Vec::new(),
            statements: Vec::new(),
            end: None,
        });
        Ok(())
    }

    pub(super) fn lower_alt_enable(&self, st: &mut GenerationState<'_>, guard: GuardKind) -> Result<(), CodeGenError> {
        let init = st
            .alts
            .last()
            .map(|alt| alt.init)
            .ok_or_else(|| CodeGenError::Malformed(format!("guard {} outside an ALT", st.current)))?;
        if guard == GuardKind::Timer {
            st.found.timed_alts.insert(init);
        }

        let operands = if guard.has_resource() { 2 } else { 1 };
        st.take_operands(operands, 0)?;
        st.require_empty()?;
        let condition = st.allocate()?;
        let resource = if guard.has_resource() {
            Some(st.allocate()?)
        } else {
            None
        };

        if let Some(resource) = resource {
            st.emit_lit(Opcode::Stl, st.temporary(resource));
        }
        st.emit_lit(Opcode::Stl, st.temporary(condition));

        if let Some(resource) = resource {
            st.emit_lit(Opcode::Ldl, st.temporary(resource));
        }
        st.emit_lit(Opcode::Ldl, st.temporary(condition));
        st.emit_op(match guard {
            GuardKind::Channel | GuardKind::Port => Opcode::Enbc,
            GuardKind::Timer => Opcode::Enbt,
            GuardKind::Skip => Opcode::Enbs,
        });

        let enable = st.current;
        if let Some(alt) = st.alts.last_mut() {
            alt.guards.push(GuardSlot {
                enable,
                guard,
                condition,
                resource,
            });
        }
        Ok(())
    }

    pub(super) fn lower_alt_wait(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        st.require_empty()?;
        let alt = st
            .alts
            .last()
            .ok_or_else(|| CodeGenError::Malformed(format!("wait {} outside an ALT", st.current)))?;
        st.emit_op(if alt.timed { Opcode::Taltwt } else { Opcode::Altwt });
        Ok(())
    }

    pub(super) fn lower_alt_disable(
        &self,
        st: &mut GenerationState<'_>,
        enable: InstrId,
        statement: InstrId,
        end: InstrId,
    ) -> Result<(), CodeGenError> {
        st.require_empty()?;
        let slot = st
            .alts
            .last()
            .and_then(|alt| alt.guards.iter().find(|g| g.enable == enable))
            .cloned()
            .ok_or_else(|| {
                CodeGenError::Malformed(format!(
                    "disable {} names {}, which enables no guard of the open ALT",
                    st.current, enable
                ))
            })?;
        self.target_position(st, statement)?;
        if self.target_position(st, end)? <= st.position
            || !matches!(self.instruction(end)?.op, IrOp::AltEnd)
        {
            return Err(CodeGenError::Malformed(format!(
                "disable {} names {} as its end, which is not a later ALT end",
                st.current, end
            )));
        }
        if let Some(known) = st.alts.last().and_then(|alt| alt.end)
            && known != end
        {
            return Err(CodeGenError::Malformed(format!(
                "disable {} ends at {} but an earlier disable ends at {}",
                st.current, end, known
            )));
        }
        let (to, from) = (self.labels.label(statement)?, self.labels.label(end)?);

        if let Some(resource) = slot.resource {
            st.emit_lit(Opcode::Ldl, st.temporary(resource));
        }
        st.emit_lit(Opcode::Ldl, st.temporary(slot.condition));
        st.emit(Instruction::difference(Opcode::Ldc, to, from));
        st.emit_op(match slot.guard {
            GuardKind::Channel | GuardKind::Port => Opcode::Disc,
            GuardKind::Timer => Opcode::Dist,
            GuardKind::Skip => Opcode::Diss,
        });

        if let Some(alt) = st.alts.last_mut() {
            alt.statements.push(statement);
            alt.end = Some(end);
        }
        Ok(())
    }

    pub(super) fn lower_alt_end(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        st.require_empty()?;
        let alt = st
            .alts
            .pop()
            .ok_or_else(|| CodeGenError::Malformed(format!("ALT end {} without an ALT", st.current)))?;
        if alt.statements.len() != alt.guards.len() {
            return Err(CodeGenError::Malformed(format!(
                "ALT {} enables {} guard(s) but disables {}",
                alt.init,
                alt.guards.len(),
                alt.statements.len()
            )));
        }
        if let Some(end) = alt.end
            && end != st.current
        {
            return Err(CodeGenError::Malformed(format!(
                "ALT {} is disabled towards {} but ends at {}",
                alt.init, end, st.current
            )));
        }

        st.emit_op(Opcode::Altend);
        st.emit_label(self.labels.label(st.current)?);

        for slot in alt.guards.iter().rev() {
            if let Some(resource) = slot.resource {
                st.release(resource)?;
            }
            st.release(slot.condition)?;
        }
        for statement in &alt.statements {
            let position = self.target_position(st, *statement)?;
            st.tracker.fork(position, st.position)?;
        }
        Ok(())
    }
}
