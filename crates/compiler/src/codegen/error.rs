//! Code generation error types.

use std::fmt;
use tpc_core::{FrameId, InstrId, VarKind};

/// Error type for code generation operations.
///
/// Lowering failures that only affect one instruction are
/// [suppressible](CodeGenError::is_suppressible); everything else describes a
/// broken invariant of the input or of the backend itself and always aborts.
#[derive(Debug)]
pub enum CodeGenError {
    /// No lowering rule for an instruction (unknown intrinsic, priority)
    Unsupported { construct: String },
    UnknownVariable {
        kind: VarKind,
        index: u32,
        frame: FrameId,
    },
    UnknownGlobal(String),
    UnknownFunction(String),

    /// A pop on an empty evaluation stack
    StackUnderflow { at: InstrId },
    /// More than three values would have to be held in registers
    RegisterOverflow { at: InstrId, registers: usize },
    /// Two paths reach one instruction with different stack shapes
    InconsistentJoin { index: usize, detail: String },
    /// A temporary was released while not on top of the temporary stack
    TemporaryOrder { released: u32, top: Option<u32> },
    /// Spilled values do not sit where the lowering needs them
    SpillOrder { at: InstrId },
    /// A block ends with values, temporaries or constructs still open
    UnbalancedBlock { block: String, detail: String },
    /// Ill-formed input: bad references, misplaced construct instructions
    Malformed(String),

    /// A jump or scheduling point reached with values still pending
    PendingValuesAtJump { at: InstrId, pending: usize },
    CallGraphCycle(Vec<String>),
    /// A call was sized before its callee
    CalleeNotSized(String),
    /// A process frame was reserved before its block was sized
    FrameNotSized(FrameId),

    /// A logical error in the backend itself
    Logic(String),
}

impl CodeGenError {
    /// Whether the driver may replace the instruction by a placeholder and
    /// carry on.
    pub fn is_suppressible(&self) -> bool {
        matches!(
            self,
            CodeGenError::Unsupported { .. }
                | CodeGenError::UnknownVariable { .. }
                | CodeGenError::UnknownGlobal(_)
                | CodeGenError::UnknownFunction(_)
        )
    }

    pub(super) fn unsupported(construct: impl Into<String>) -> Self {
        CodeGenError::Unsupported {
            construct: construct.into(),
        }
    }
}

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeGenError::Unsupported { construct } => {
                write!(f, "unsupported construct: {}", construct)
            }
            CodeGenError::UnknownVariable { kind, index, frame } => {
                write!(f, "unknown {} {} in frame {}", kind, index, frame)
            }
            CodeGenError::UnknownGlobal(name) => write!(f, "unknown global '{}'", name),
            CodeGenError::UnknownFunction(name) => write!(f, "unknown function '{}'", name),
            CodeGenError::StackUnderflow { at } => {
                write!(f, "evaluation stack underflow at instruction {}", at)
            }
            CodeGenError::RegisterOverflow { at, registers } => write!(
                f,
                "{} values held in registers after instruction {} (at most 3)",
                registers, at
            ),
            CodeGenError::InconsistentJoin { index, detail } => {
                write!(f, "inconsistent stack join at index {}: {}", index, detail)
            }
            CodeGenError::TemporaryOrder { released, top } => match top {
                Some(top) => write!(
                    f,
                    "temporary {} released while temporary {} is on top",
                    released, top
                ),
                None => write!(f, "temporary {} released from an empty region", released),
            },
            CodeGenError::SpillOrder { at } => {
                write!(f, "spilled values out of order at instruction {}", at)
            }
            CodeGenError::UnbalancedBlock { block, detail } => {
                write!(f, "block '{}' is unbalanced: {}", block, detail)
            }
            CodeGenError::Malformed(msg) => write!(f, "malformed program: {}", msg),
            CodeGenError::PendingValuesAtJump { at, pending } => write!(
                f,
                "{} value(s) pending on the evaluation stack at instruction {}",
                pending, at
            ),
            CodeGenError::CallGraphCycle(path) => {
                write!(f, "call graph cycle: {}", path.join(" -> "))
            }
            CodeGenError::CalleeNotSized(name) => {
                write!(f, "call to '{}' sized before its callee", name)
            }
            CodeGenError::FrameNotSized(frame) => {
                write!(f, "frame {} reserved before it was sized", frame)
            }
            CodeGenError::Logic(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for CodeGenError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppressible_classes() {
        assert!(CodeGenError::unsupported("intrinsic frob").is_suppressible());
        assert!(CodeGenError::UnknownGlobal("x".to_string()).is_suppressible());
        assert!(!CodeGenError::StackUnderflow { at: InstrId(1) }.is_suppressible());
        assert!(!CodeGenError::PendingValuesAtJump {
            at: InstrId(1),
            pending: 1
        }
        .is_suppressible());
        assert!(!CodeGenError::CallGraphCycle(vec![]).is_suppressible());
    }

    #[test]
    fn test_cycle_message_names_path() {
        let err = CodeGenError::CallGraphCycle(vec![
            "f".to_string(),
            "g".to_string(),
            "f".to_string(),
        ]);
        assert_eq!(err.to_string(), "call graph cycle: f -> g -> f");
    }
}
