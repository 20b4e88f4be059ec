//! Instruction lowering
//!
//! One closed match over the IR instruction kinds. Expression, variable,
//! communication and jump lowerings live here; calls, PAR/ALT and globals
//! have their own modules.

use super::state::GenerationState;
use super::{CodeGen, CodeGenError};
use tpc_core::{FrameId, Instruction, IrInstruction, IrOp, Opcode, VarKind};

/// Machine-specific operations reachable through `IrOp::Intrinsic`.
fn intrinsic(name: &str) -> Option<(Opcode, u32, u32)> {
    match name {
        "mint" => Some((Opcode::Mint, 0, 1)),
        "testerr" => Some((Opcode::Testerr, 0, 1)),
        "seterr" => Some((Opcode::Seterr, 0, 0)),
        "stoperr" => Some((Opcode::Stoperr, 0, 0)),
        _ => None,
    }
}

impl CodeGen<'_> {
    pub(super) fn lower(&self, st: &mut GenerationState<'_>, instr: &IrInstruction) -> Result<(), CodeGenError> {
        use Opcode::*;
        match &instr.op {
            IrOp::Const { value } => {
                st.emit_lit(Ldc, *value);
                st.produce(1)
            }

            IrOp::Add => self.operator(st, &[Add]),
            IrOp::Sub => self.operator(st, &[Sub]),
            IrOp::Mul => self.operator(st, &[Mul]),
            IrOp::Div => self.operator(st, &[Div]),
            IrOp::Rem => self.operator(st, &[Rem]),
            IrOp::Neg => {
                st.take_operands(1, 0)?;
                st.emit_op(Not);
                st.emit_lit(Adc, 1);
                st.produce(1)
            }

            IrOp::Gt => self.operator(st, &[Gt]),
            IrOp::Lt => self.operator(st, &[Rev, Gt]),
            IrOp::Ge => self.comparison(st, &[Rev, Gt], 1),
            IrOp::Le => self.comparison(st, &[Gt], 1),
            IrOp::Eq => self.comparison(st, &[Diff], 1),
            IrOp::Ne => self.comparison(st, &[Diff], 2),

            IrOp::BitAnd | IrOp::And => self.operator(st, &[And]),
            IrOp::BitOr | IrOp::Or => self.operator(st, &[Or]),
            IrOp::BitXor => self.operator(st, &[Xor]),
            IrOp::Shl => self.operator(st, &[Shl]),
            IrOp::Shr => self.operator(st, &[Shr]),
            IrOp::BitNot => {
                st.take_operands(1, 0)?;
                st.emit_op(Not);
                st.produce(1)
            }
            IrOp::Not => {
                st.take_operands(1, 0)?;
                st.emit_lit(Eqc, 0);
                st.produce(1)
            }

            IrOp::LoadLocal { index } => self.load_variable(st, VarKind::Local, *index),
            IrOp::StoreLocal { index } => self.store_variable(st, VarKind::Local, *index),
            IrOp::LoadArgument { index } => self.load_variable(st, VarKind::Argument, *index),
            IrOp::StoreArgument { index } => self.store_variable(st, VarKind::Argument, *index),
            IrOp::LoadChannel { index } => self.load_variable(st, VarKind::Channel, *index),
            IrOp::LoadGlobal { name } => self.load_global(st, name),
            IrOp::StoreGlobal { name } => self.store_global(st, name),

            IrOp::ChannelRead => {
                // in: A = count, B = channel, C = buffer (the scratch word)
                st.take_operands(1, 2)?;
                st.emit_lit(Ldlp, 0);
                st.emit_op(Rev);
                st.emit_lit(Ldc, i64::from(self.config.word_bytes));
                st.emit_op(In);
                st.emit_lit(Ldl, 0);
                st.produce(1)
            }
            IrOp::ChannelWrite => {
                // outword: A = value, B = channel
                st.take_operands(2, 1)?;
                st.emit_op(Rev);
                st.emit_op(Outword);
                Ok(())
            }
            IrOp::PortRead { address } => {
                st.emit_lit(Ldc, *address);
                st.emit_lit(Ldnl, 0);
                st.produce(1)
            }
            IrOp::PortWrite { address } => {
                st.take_operands(1, 1)?;
                st.emit_lit(Ldc, *address);
                st.emit_lit(Stnl, 0);
                Ok(())
            }
            IrOp::TimerRead => {
                st.emit_op(Ldtimer);
                st.produce(1)
            }
            IrOp::TimerWait => {
                st.take_operands(1, 2)?;
                st.emit_op(Tin);
                Ok(())
            }

            IrOp::ProcessInit {
                processes,
                continuation,
                frames,
            } => self.lower_process_init(st, *processes, *continuation, frames),
            IrOp::ProcessStart {
                entry,
                frame,
                priority,
            } => self.lower_process_start(st, *entry, *frame, *priority),
            IrOp::ProcessEnd { creator } => self.lower_process_end(st, *creator),

            IrOp::AltInit => self.lower_alt_init(st),
            IrOp::AltEnable { guard } => self.lower_alt_enable(st, *guard),
            IrOp::AltWait => self.lower_alt_wait(st),
            IrOp::AltDisable {
                enable,
                statement,
                end,
            } => self.lower_alt_disable(st, *enable, *statement, *end),
            IrOp::AltEnd => self.lower_alt_end(st),

            IrOp::Branch { target } => {
                st.require_empty()?;
                let position = self.target_position(st, *target)?;
                st.emit(Instruction::label(J, self.labels.label(*target)?));
                st.tracker.fork(position, st.position)
            }
            IrOp::BranchIfFalse { target } => {
                st.take_operands(1, 0)?;
                st.require_empty()?;
                let position = self.target_position(st, *target)?;
                st.emit(Instruction::label(Cj, self.labels.label(*target)?));
                st.tracker.fork(position, st.position)
            }
            IrOp::Call {
                function,
                arguments,
                results,
            } => self.lower_call(st, function, *arguments, *results),
            IrOp::MethodStart => self.lower_method_start(st),
            IrOp::MethodEnd => self.lower_method_end(st),
            IrOp::Label { .. } | IrOp::Skip => Ok(()),
            IrOp::Stop => {
                st.require_empty()?;
                st.emit_op(Stopp);
                Ok(())
            }

            IrOp::Intrinsic { name, pops, pushes } => {
                let (opcode, expected_pops, expected_pushes) = intrinsic(name)
                    .ok_or_else(|| CodeGenError::unsupported(format!("intrinsic '{}'", name)))?;
                if (*pops, *pushes) != (expected_pops, expected_pushes) {
                    return Err(CodeGenError::Malformed(format!(
                        "intrinsic '{}' takes {} and yields {} value(s), declared {} and {}",
                        name, expected_pops, expected_pushes, pops, pushes
                    )));
                }
                st.take_operands(*pops, 0)?;
                st.emit_op(opcode);
                st.produce(*pushes)
            }
        }
    }

    /// Binary operator: two operands in, one result out.
    fn operator(&self, st: &mut GenerationState<'_>, code: &[Opcode]) -> Result<(), CodeGenError> {
        st.take_operands(2, 0)?;
        for opcode in code {
            st.emit_op(*opcode);
        }
        st.produce(1)
    }

    /// Comparison derived from `gt` or `diff`, followed by `inversions`
    /// times `eqc 0`.
    fn comparison(
        &self,
        st: &mut GenerationState<'_>,
        code: &[Opcode],
        inversions: u32,
    ) -> Result<(), CodeGenError> {
        st.take_operands(2, 0)?;
        for opcode in code {
            st.emit_op(*opcode);
        }
        for _ in 0..inversions {
            st.emit_lit(Opcode::Eqc, 0);
        }
        st.produce(1)
    }

    fn load_variable(&self, st: &mut GenerationState<'_>, kind: VarKind, index: u32) -> Result<(), CodeGenError> {
        let access = self.frames.owner(st.frame, kind, index)?;
        let owner = self.frames.frame(access.frame)?;
        let offset = i64::from(owner.variable_offset(kind, access.relative));
        let (local, non_local) = match kind {
            VarKind::Channel => (Opcode::Ldlp, Opcode::Ldnlp),
            _ => (Opcode::Ldl, Opcode::Ldnl),
        };
        if access.hops == 0 {
            st.emit_lit(local, st.fixed_base() + offset);
        } else {
            self.climb(st, access.hops)?;
            st.emit_lit(non_local, offset);
        }
        st.produce(1)
    }

    fn store_variable(&self, st: &mut GenerationState<'_>, kind: VarKind, index: u32) -> Result<(), CodeGenError> {
        let access = self.frames.owner(st.frame, kind, index)?;
        let owner = self.frames.frame(access.frame)?;
        let offset = i64::from(owner.variable_offset(kind, access.relative));
        if access.hops == 0 {
            st.take_operands(1, 0)?;
            st.emit_lit(Opcode::Stl, st.fixed_base() + offset);
        } else {
            st.take_operands(1, 1)?;
            self.climb(st, access.hops)?;
            st.emit_lit(Opcode::Stnl, offset);
        }
        Ok(())
    }

    /// Load the fixed base of the frame `hops` static links up.
    pub(super) fn climb(&self, st: &mut GenerationState<'_>, hops: u32) -> Result<(), CodeGenError> {
        let chain = self.frames.chain(st.frame, hops)?;
        for (step, frame) in chain[..hops as usize].iter().enumerate() {
            let link = frame.link_offset().ok_or_else(|| {
                CodeGenError::Logic(format!("frame {} has no static link", frame.id))
            })?;
            if step == 0 {
                st.emit_lit(Opcode::Ldl, st.fixed_base() + i64::from(link));
            } else {
                st.emit_lit(Opcode::Ldnl, i64::from(link));
            }
        }
        Ok(())
    }

    /// Load the fixed base of `target`, the current frame or an ancestor.
    pub(super) fn load_fixed_base(&self, st: &mut GenerationState<'_>, target: FrameId) -> Result<(), CodeGenError> {
        match self.frames.distance(st.frame, target)? {
            Some(0) => {
                st.emit_lit(Opcode::Ldlp, st.fixed_base());
                Ok(())
            }
            Some(hops) => self.climb(st, hops),
            None => Err(CodeGenError::Malformed(format!(
                "frame {} is not visible from frame {}",
                target, st.frame
            ))),
        }
    }

    /// Position of a jump target, which must be in the current block.
    pub(super) fn target_position(
        &self,
        st: &GenerationState<'_>,
        target: tpc_core::InstrId,
    ) -> Result<usize, CodeGenError> {
        let (unit, position) = self.labels.location(target)?;
        if unit != st.unit {
            return Err(CodeGenError::Malformed(format!(
                "instruction {} jumps to {} in another function",
                st.current, target
            )));
        }
        Ok(position)
    }

    /// `mint; stl` every channel word of the current frame.
    pub(super) fn initialise_channels(&self, st: &mut GenerationState<'_>, channels: u32) {
        for channel in 0..channels {
            st.emit_op(Opcode::Mint);
            st.emit_lit(Opcode::Stl, st.fixed_base() + i64::from(channel));
        }
    }
}
