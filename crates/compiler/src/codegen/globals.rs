//! Global Data Handling
//!
//! Globals live in one data section emitted after all code. Code reaches
//! them position-independently: the distance from an anchor label to the
//! global is added to the anchor's address with `ldpi`.

use super::state::{GenerationState, mangle_name};
use super::{CodeGen, CodeGenError};
use tpc_core::{AsmLine, Instruction, MachineBlock, Opcode};

/// Name of the block holding the data section.
pub const GLOBALS_BLOCK: &str = "globals";

/// Assembler label of a global.
pub fn global_label(name: &str) -> String {
    format!("G_{}", mangle_name(name))
}

impl CodeGen<'_> {
    pub(super) fn load_global(&self, st: &mut GenerationState<'_>, name: &str) -> Result<(), CodeGenError> {
        self.global_address(st, name)?;
        st.emit_lit(Opcode::Ldnl, 0);
        st.produce(1)
    }

    pub(super) fn store_global(&self, st: &mut GenerationState<'_>, name: &str) -> Result<(), CodeGenError> {
        if self.program.global(name).is_none() {
            return Err(CodeGenError::UnknownGlobal(name.to_string()));
        }
        st.take_operands(1, 1)?;
        self.global_address(st, name)?;
        st.emit_lit(Opcode::Stnl, 0);
        Ok(())
    }

    /// Load the address of a global into `A`.
    fn global_address(&self, st: &mut GenerationState<'_>, name: &str) -> Result<(), CodeGenError> {
        if self.program.global(name).is_none() {
            return Err(CodeGenError::UnknownGlobal(name.to_string()));
        }
        let anchor = self.labels.anchor(st.current, "pc")?;
        st.emit(Instruction::difference(Opcode::Ldc, global_label(name), anchor.as_str()));
        st.emit_op(Opcode::Ldpi);
        st.emit_label(anchor);
        Ok(())
    }

    /// The data section, or `None` when the program has no globals.
    ///
    /// Every global is padded to a whole number of words so that the next
    /// one stays addressable with `ldnl`/`stnl`.
    pub(super) fn global_section(&self) -> Result<Option<MachineBlock>, CodeGenError> {
        if self.program.globals.is_empty() {
            return Ok(None);
        }
        let word = self.config.word_bytes;
        let mut block = MachineBlock::new(GLOBALS_BLOCK);
        for global in &self.program.globals {
            let bytes = self.program.type_size(&global.ty).ok_or_else(|| {
                CodeGenError::Malformed(format!(
                    "global '{}' has unknown type '{}'",
                    global.name, global.ty
                ))
            })?;
            let padded = bytes.div_ceil(word).max(1) * word;
            block.lines.push(AsmLine::Label(global_label(&global.name)));
            block.lines.push(AsmLine::Reserve { bytes: padded });
        }
        Ok(Some(block))
    }
}
