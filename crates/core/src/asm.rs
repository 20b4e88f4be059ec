//! Symbolic machine-instruction stream
//!
//! The backend emits [`MachineBlock`]s made of labels, instructions with
//! symbolic operands, and data reservations. Label differences are left for
//! the assembler, which knows the final size of every prefixed instruction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transputer instruction mnemonics used by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    // Direct functions
    J,
    Ldlp,
    Ldnl,
    Ldc,
    Ldnlp,
    Ldl,
    Adc,
    Call,
    Cj,
    Ajw,
    Eqc,
    Stl,
    Stnl,

    // Indirect (operations)
    Rev,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Gt,
    Diff,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Ldpi,
    Ret,
    Mint,
    Pop,
    In,
    Outword,
    Ldtimer,
    Tin,
    Startp,
    Endp,
    Stopp,
    Alt,
    Talt,
    Enbc,
    Enbt,
    Enbs,
    Altwt,
    Taltwt,
    Disc,
    Dist,
    Diss,
    Altend,
    Testerr,
    Seterr,
    Stoperr,
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        use Opcode::*;
        match self {
            J => "j",
            Ldlp => "ldlp",
            Ldnl => "ldnl",
            Ldc => "ldc",
            Ldnlp => "ldnlp",
            Ldl => "ldl",
            Adc => "adc",
            Call => "call",
            Cj => "cj",
            Ajw => "ajw",
            Eqc => "eqc",
            Stl => "stl",
            Stnl => "stnl",
            Rev => "rev",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Gt => "gt",
            Diff => "diff",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            Shl => "shl",
            Shr => "shr",
            Ldpi => "ldpi",
            Ret => "ret",
            Mint => "mint",
            Pop => "pop",
            In => "in",
            Outword => "outword",
            Ldtimer => "ldtimer",
            Tin => "tin",
            Startp => "startp",
            Endp => "endp",
            Stopp => "stopp",
            Alt => "alt",
            Talt => "talt",
            Enbc => "enbc",
            Enbt => "enbt",
            Enbs => "enbs",
            Altwt => "altwt",
            Taltwt => "taltwt",
            Disc => "disc",
            Dist => "dist",
            Diss => "diss",
            Altend => "altend",
            Testerr => "testerr",
            Seterr => "seterr",
            Stoperr => "stoperr",
        }
    }

}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Symbolic instruction operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Literal(i64),
    Label(String),
    /// `to - from`, resolved by the assembler
    Difference { to: String, from: String },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Label(l) => write!(f, "{}", l),
            Operand::Difference { to, from } => write!(f, "{} - {}", to, from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Option<Operand>,
}

impl Instruction {
    pub fn op(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            operand: None,
        }
    }

    pub fn literal(opcode: Opcode, value: i64) -> Self {
        Instruction {
            opcode,
            operand: Some(Operand::Literal(value)),
        }
    }

    pub fn label(opcode: Opcode, label: impl Into<String>) -> Self {
        Instruction {
            opcode,
            operand: Some(Operand::Label(label.into())),
        }
    }

    pub fn difference(opcode: Opcode, to: impl Into<String>, from: impl Into<String>) -> Self {
        Instruction {
            opcode,
            operand: Some(Operand::Difference {
                to: to.into(),
                from: from.into(),
            }),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Some(operand) => write!(f, "{} {}", self.opcode, operand),
            None => write!(f, "{}", self.opcode),
        }
    }
}

/// One line of the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsmLine {
    Label(String),
    Instr(Instruction),
    /// Uninitialised data
    Reserve { bytes: u32 },
    /// Placeholder left where an IR construct could not be lowered
    Unrecognized { construct: String },
}

impl AsmLine {
    pub fn as_instruction(&self) -> Option<&Instruction> {
        match self {
            AsmLine::Instr(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for AsmLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmLine::Label(l) => write!(f, "{}:", l),
            AsmLine::Instr(i) => write!(f, "    {}", i),
            AsmLine::Reserve { bytes } => write!(f, "    .space {}", bytes),
            AsmLine::Unrecognized { construct } => write!(f, "    .unrecognized {}", construct),
        }
    }
}

/// Output of one IR block, or the global data section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineBlock {
    pub name: String,
    pub lines: Vec<AsmLine>,
}

impl MachineBlock {
    pub fn new(name: impl Into<String>) -> Self {
        MachineBlock {
            name: name.into(),
            lines: Vec::new(),
        }
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.lines.iter().filter_map(AsmLine::as_instruction)
    }

    /// Number of instructions with the given opcode.
    pub fn count(&self, opcode: Opcode) -> usize {
        self.instructions().filter(|i| i.opcode == opcode).count()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            AsmLine::Label(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for MachineBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {}", self.name)?;
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_operands() {
        assert_eq!(Instruction::literal(Opcode::Ldc, -3).to_string(), "ldc -3");
        assert_eq!(Instruction::op(Opcode::Startp).to_string(), "startp");
        assert_eq!(
            Instruction::difference(Opcode::Ldc, "main_4", "main_4_pc").to_string(),
            "ldc main_4 - main_4_pc"
        );
    }

    #[test]
    fn test_block_render_and_count() {
        let mut block = MachineBlock::new("main");
        block.lines.push(AsmLine::Label("main".to_string()));
        block.lines.push(AsmLine::Instr(Instruction::literal(Opcode::Ajw, -2)));
        block.lines.push(AsmLine::Instr(Instruction::op(Opcode::Mint)));
        block.lines.push(AsmLine::Reserve { bytes: 8 });
        let text = block.to_string();
        assert!(text.contains("main:\n"));
        assert!(text.contains("    ajw -2\n"));
        assert!(text.contains(".space 8"));
        assert_eq!(block.count(Opcode::Mint), 1);
        assert_eq!(block.labels().collect::<Vec<_>>(), vec!["main"]);
    }
}
