//! Register window traffic
//!
//! Moves values between the simulated stack and the registers: operands are
//! reloaded from their temporaries before an instruction consumes them, and
//! results that will be pushed below a full window are stored as soon as
//! they are produced.
//!
//! Spilled values always form the bottom of the stack, so a group of
//! operands has its spilled members first.

use super::CodeGenError;
use super::stack_tracker::{StackItem, StackItemId};
use super::state::{GenerationState, Mode};
use tpc_core::{InstrId, Opcode};
use tracing::trace;

impl GenerationState<'_> {
    pub(super) fn push_item(&mut self, id: StackItemId) {
        for overflowed in self.tracker.push(id) {
            trace!(
                block = %self.base,
                producer = %overflowed.producer,
                slot = overflowed.slot,
                "value overflows the register window"
            );
            self.found.spills.insert(overflowed);
        }
    }

    /// Push `count` results of the current instruction.
    pub(super) fn produce(&mut self, count: u32) -> Result<(), CodeGenError> {
        let ids: Vec<StackItemId> = (0..count)
            .map(|slot| StackItemId::new(self.current, slot))
            .collect();
        for id in &ids {
            self.push_item(*id);
        }
        self.settle(&ids)?;
        self.check_registers()
    }

    /// Store the just-pushed `ids` that live in temporaries.
    pub(super) fn settle(&mut self, ids: &[StackItemId]) -> Result<(), CodeGenError> {
        if self.mode == Mode::Shape {
            return Ok(());
        }
        let spilled = self.spilled_prefix(ids.iter().copied(), self.current)?;
        if spilled == 0 {
            return Ok(());
        }
        let homes = ids[..spilled]
            .iter()
            .map(|_| self.allocate())
            .collect::<Result<Vec<u32>, _>>()?;
        for (id, home) in ids.iter().zip(&homes) {
            self.homes.insert(*id, *home);
        }
        let scratch = ids[spilled..]
            .iter()
            .map(|_| self.allocate())
            .collect::<Result<Vec<u32>, _>>()?;
        for slot in scratch.iter().rev() {
            self.emit_lit(Opcode::Stl, self.temporary(*slot));
        }
        for home in homes.iter().rev() {
            self.emit_lit(Opcode::Stl, self.temporary(*home));
        }
        for slot in &scratch {
            self.emit_lit(Opcode::Ldl, self.temporary(*slot));
        }
        for slot in scratch.iter().rev() {
            self.release(*slot)?;
        }
        Ok(())
    }

    /// Pop `count` operands into registers, with `extra` registers of
    /// pressure on top of them. Returns the operands bottom first.
    pub(super) fn take_operands(&mut self, count: u32, extra: u32) -> Result<Vec<StackItem>, CodeGenError> {
        let items = self.pop_operands(count, extra)?;
        self.load(&items, &[])?;
        Ok(items)
    }

    /// Pop `count` values without loading them (placeholders, discarded
    /// values). Their temporaries are released.
    pub(super) fn discard(&mut self, count: u32) -> Result<(), CodeGenError> {
        let items = self.pop_operands(count, 0)?;
        if self.mode == Mode::Shape {
            return Ok(());
        }
        for item in items.iter().rev() {
            if let Some(home) = self.homes.remove(&item.id) {
                self.release(home)?;
            }
        }
        Ok(())
    }

    pub(super) fn pop_operands(&mut self, count: u32, extra: u32) -> Result<Vec<StackItem>, CodeGenError> {
        for index in 0..extra {
            self.push_item(StackItemId::phantom(self.current, index));
        }
        for _ in 0..extra {
            self.tracker.pop();
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let item = self
                .tracker
                .pop()
                .ok_or(CodeGenError::StackUnderflow { at: self.current })?;
            items.push(item);
        }
        items.reverse();
        Ok(items)
    }

    /// Number of leading spilled items; the rest must not be spilled.
    fn spilled_prefix(
        &self,
        ids: impl Iterator<Item = StackItemId>,
        at: InstrId,
    ) -> Result<usize, CodeGenError> {
        let flags: Vec<bool> = ids.map(|id| self.is_spilled(id)).collect();
        let spilled = flags.iter().take_while(|f| **f).count();
        if flags[spilled..].iter().any(|f| *f) {
            return Err(CodeGenError::SpillOrder { at });
        }
        Ok(spilled)
    }

    /// Bring `items` into `A`, `B`, `C` (last item in `A`) and release
    /// their temporaries.
    ///
    /// `copies` are word moves (`ldl` temporary, `stl` offset) that must
    /// run while the registers are free.
    pub(super) fn load(&mut self, items: &[StackItem], copies: &[(u32, i64)]) -> Result<(), CodeGenError> {
        if self.mode == Mode::Shape {
            return Ok(());
        }
        let spilled = self.spilled_prefix(items.iter().map(|i| i.id), self.current)?;
        let mut homes = Vec::with_capacity(spilled);
        for item in &items[..spilled] {
            let home = self.homes.get(&item.id).copied().ok_or_else(|| {
                CodeGenError::Logic(format!(
                    "value {}:{} has no temporary",
                    item.id.producer, item.id.slot
                ))
            })?;
            homes.push(home);
        }

        let in_registers = items.len() - spilled;
        if copies.is_empty() && spilled == 0 {
            return Ok(());
        }
        if copies.is_empty() && in_registers == 0 {
            for home in &homes {
                self.emit_lit(Opcode::Ldl, self.temporary(*home));
            }
        } else if copies.is_empty() && spilled == 1 && in_registers == 1 {
            self.emit_lit(Opcode::Ldl, self.temporary(homes[0]));
            self.emit_op(Opcode::Rev);
        } else {
            let scratch = (0..in_registers)
                .map(|_| self.allocate())
                .collect::<Result<Vec<u32>, _>>()?;
            for slot in scratch.iter().rev() {
                self.emit_lit(Opcode::Stl, self.temporary(*slot));
            }
            for (from, to) in copies {
                self.emit_lit(Opcode::Ldl, self.temporary(*from));
                self.emit_lit(Opcode::Stl, *to);
            }
            for home in &homes {
                self.emit_lit(Opcode::Ldl, self.temporary(*home));
            }
            for slot in &scratch {
                self.emit_lit(Opcode::Ldl, self.temporary(*slot));
            }
            for slot in scratch.iter().rev() {
                self.release(*slot)?;
            }
        }

        for item in items[..spilled].iter().rev() {
            if let Some(home) = self.homes.remove(&item.id) {
                self.release(home)?;
            }
        }
        Ok(())
    }
}
