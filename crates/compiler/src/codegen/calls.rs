//! Calls and returns
//!
//! The last three arguments travel in `A`, `B`, `C` and are saved by `call`
//! just below the callee's linkage word. Earlier arguments are already in
//! the caller's temporaries when the call is reached (they were pushed
//! below a full window), and the caller positions `Wptr` so that those
//! temporaries coincide with the callee's stack area. Deep results come
//! back through the same area, so the caller finds them exactly where the
//! arguments were.

use super::state::{CallLayout, GenerationState, Mode, ReturnLayout, mangle_name};
use super::stack_tracker::{StackItem, StackItemId};
use super::{CodeGen, CodeGenError};
use crate::codegen::frame::REGISTERS;
use tpc_core::{FrameKind, Instruction, Opcode};

impl CodeGen<'_> {
    pub(super) fn lower_call(
        &self,
        st: &mut GenerationState<'_>,
        function: &str,
        arguments: u32,
        results: u32,
    ) -> Result<(), CodeGenError> {
        let block = self
            .program
            .block_named(function)
            .ok_or_else(|| CodeGenError::UnknownFunction(function.to_string()))?;
        let callee = self.frames.frame(block.frame)?;
        if callee.kind != FrameKind::Function {
            return Err(CodeGenError::Malformed(format!(
                "'{}' runs in process frame {}",
                function, callee.id
            )));
        }
        if callee.arguments != arguments || callee.results != results {
            return Err(CodeGenError::Malformed(format!(
                "'{}' takes {} argument(s) and returns {}, called with {} and {}",
                function, callee.arguments, callee.results, arguments, results
            )));
        }
        if callee.temporaries().is_none() {
            return Err(CodeGenError::CalleeNotSized(function.to_string()));
        }
        let full = self.frames.full_size(callee.id, None)?;
        if let Some(parent) = callee.parent
            && self.frames.distance(st.frame, parent)?.is_none()
        {
            return Err(CodeGenError::Malformed(format!(
                "'{}' is nested in frame {}, which is not visible from frame {}",
                function, parent, st.frame
            )));
        }

        let convention = callee.convention();
        if let Some(parent) = callee.parent {
            st.push_item(StackItemId::new(st.current, StackItemId::LINK_SLOT));
            self.load_fixed_base(st, parent)?;
        }

        let total = convention.arguments;
        let in_registers = convention.register_arguments();
        let items = st.pop_operands(total, REGISTERS - in_registers)?;
        let stack_arguments = convention.stack_arguments();
        let stack_results = convention.stack_results();
        let area = convention.stack_area();

        if st.mode == Mode::Shape {
            self.push_results(st, results, &[])?;
            return Ok(());
        }

        let (deep, register) = items.split_at(stack_arguments as usize);
        st.load(register, &[])?;
        let base = self.stack_area_base(st, deep)?;

        if stack_results > stack_arguments {
            st.allocate_many(stack_results - stack_arguments)?;
        }
        let first = st.allocate_many(full)?;
        let shift = st.fixed_base() - i64::from(first);
        st.emit_lit(Opcode::Ajw, shift);
        st.emit(Instruction::label(Opcode::Call, mangle_name(function)));
        st.emit_lit(Opcode::Ajw, -shift);
        st.release_many(first, full)?;

        if stack_arguments > stack_results {
            st.release_many(base + stack_results, stack_arguments - stack_results)?;
        }
        for item in deep {
            st.homes.remove(&item.id);
        }

        let homes: Vec<u32> = (0..stack_results).map(|i| base + i).collect();
        self.push_results(st, results, &homes)?;

        st.found.calls.push(CallLayout {
            site: st.current,
            stack_arguments,
            stack_results,
            stack_area: area,
            callee_depth: first,
        });
        Ok(())
    }

    /// Depth of the first stack argument. The stack arguments must be the
    /// topmost temporaries, first argument deepest.
    fn stack_area_base(&self, st: &GenerationState<'_>, deep: &[StackItem]) -> Result<u32, CodeGenError> {
        let depth = st.temps().depth();
        let count = deep.len() as u32;
        let base = depth
            .checked_sub(count)
            .ok_or(CodeGenError::SpillOrder { at: st.current })?;
        for (offset, item) in deep.iter().enumerate() {
            if st.homes.get(&item.id) != Some(&(base + offset as u32)) {
                return Err(CodeGenError::SpillOrder { at: st.current });
            }
        }
        Ok(base)
    }

    /// Push the results of a call; the first `homes.len()` already sit in
    /// their temporaries.
    fn push_results(&self, st: &mut GenerationState<'_>, results: u32, homes: &[u32]) -> Result<(), CodeGenError> {
        let ids: Vec<StackItemId> = (0..results)
            .map(|slot| StackItemId::new(st.current, slot))
            .collect();
        for id in &ids {
            st.push_item(*id);
        }
        for (id, home) in ids.iter().zip(homes) {
            st.homes.insert(*id, *home);
        }
        st.settle(&ids[homes.len()..])?;
        st.check_registers()
    }

    /// Function prologue: claim the frame's words and clear its channels.
    pub(super) fn lower_method_start(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        let frame = self.frames.frame(st.frame)?;
        if frame.is_process() {
            return Err(CodeGenError::Malformed(format!(
                "method start in process frame {}",
                frame.id
            )));
        }
        st.require_empty()?;
        let words = self.frame_words(st)?;
        st.emit_lit(Opcode::Ajw, -words);
        self.initialise_channels(st, frame.channels);
        Ok(())
    }

    /// Function epilogue: leave the results where the caller expects them,
    /// release the frame and return.
    pub(super) fn lower_method_end(&self, st: &mut GenerationState<'_>) -> Result<(), CodeGenError> {
        let frame = self.frames.frame(st.frame)?;
        if frame.is_process() {
            return Err(CodeGenError::Malformed(format!(
                "method end in process frame {}",
                frame.id
            )));
        }
        let convention = frame.convention();
        let stack_results = convention.stack_results();
        let items = st.pop_operands(frame.results, 0)?;
        st.require_empty()?;

        let linkage = st.fixed_base() + i64::from(frame.linkage_offset());
        let result_slots: Vec<u32> = (0..stack_results).map(|i| convention.result_slot(i)).collect();
        let (deep, register) = items.split_at(stack_results as usize);

        if st.mode != Mode::Shape {
            let mut copies = Vec::with_capacity(deep.len());
            for (item, slot) in deep.iter().zip(&result_slots) {
                let home = st.homes.get(&item.id).copied().ok_or_else(|| {
                    CodeGenError::Logic(format!(
                        "result {}:{} of '{}' has no temporary",
                        item.id.producer, item.id.slot, st.base
                    ))
                })?;
                copies.push((home, linkage + i64::from(*slot)));
            }
            st.load(register, &copies)?;
            for item in deep.iter().rev() {
                if let Some(home) = st.homes.remove(&item.id) {
                    st.release(home)?;
                }
            }
        }

        if st.temps().depth() > 0 && st.mode != Mode::Shape {
            return Err(CodeGenError::UnbalancedBlock {
                block: st.base.clone(),
                detail: format!("{} temporaries live at return", st.temps().depth()),
            });
        }

        let words = self.frame_words(st)?;
        st.emit_lit(Opcode::Ajw, words);
        st.emit_op(Opcode::Ret);
        st.found.returns = Some(ReturnLayout {
            stack_results,
            stack_area: convention.stack_area(),
            result_slots,
        });
        Ok(())
    }

    /// Words of the current function frame from `Wptr` up to its linkage.
    fn frame_words(&self, st: &GenerationState<'_>) -> Result<i64, CodeGenError> {
        let frame = self.frames.frame(st.frame)?;
        Ok(st.fixed_base() + i64::from(frame.linkage_offset()))
    }
}
