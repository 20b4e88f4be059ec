//! Unique-id stack IR
//!
//! A program is a list of blocks plus the front end's scope table. Each
//! block is an ordered list of instructions; an instruction is identified by
//! an opaque [`InstrId`] that stays stable for the life of the program, so
//! operands such as branch targets or process entry points refer to other
//! instructions by id rather than by position.
//!
//! Values flow through an implicit evaluation stack: an instruction pops its
//! operands (the last operand on top) and pushes its results. See
//! [`IrOp::stack_effect`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of one IR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrId(pub u32);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a frame (workspace) in the front end's scope table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a frame is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Entered through `call`, left through `ret`.
    Function,
    /// Entered through `startp`, left through `endp`.
    Process,
}

/// One scope of the front end's scope table.
///
/// Variable indices are numbered cumulatively down the static chain: a
/// frame's own locals start where its parent's numbering ends, so a nested
/// scope sees the enclosing scope's variables under their original indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDecl {
    pub id: FrameId,
    pub kind: FrameKind,
    /// Lexically enclosing frame (static chain)
    #[serde(default)]
    pub parent: Option<FrameId>,
    #[serde(default)]
    pub arguments: u32,
    #[serde(default)]
    pub results: u32,
    #[serde(default)]
    pub locals: u32,
    #[serde(default)]
    pub channels: u32,
}

impl FrameDecl {
    pub fn function(id: u32) -> Self {
        FrameDecl {
            id: FrameId(id),
            kind: FrameKind::Function,
            parent: None,
            arguments: 0,
            results: 0,
            locals: 0,
            channels: 0,
        }
    }

    pub fn process(id: u32, parent: u32) -> Self {
        FrameDecl {
            id: FrameId(id),
            kind: FrameKind::Process,
            parent: Some(FrameId(parent)),
            arguments: 0,
            results: 0,
            locals: 0,
            channels: 0,
        }
    }

    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(FrameId(parent));
        self
    }

    pub fn with_signature(mut self, arguments: u32, results: u32) -> Self {
        self.arguments = arguments;
        self.results = results;
        self
    }

    pub fn with_locals(mut self, locals: u32) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }
}

/// The three variable namespaces a frame declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Argument,
    Local,
    Channel,
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Argument => write!(f, "argument"),
            VarKind::Local => write!(f, "local"),
            VarKind::Channel => write!(f, "channel"),
        }
    }
}

/// Readiness condition of one ALT guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    /// Input ready on a soft channel
    Channel,
    /// Input ready on a hard link channel at a fixed address
    Port,
    /// Timer deadline reached
    Timer,
    /// Always ready
    Skip,
}

impl GuardKind {
    /// Whether the guard carries a resource (channel, port or deadline)
    /// in addition to its boolean condition.
    pub fn has_resource(&self) -> bool {
        !matches!(self, GuardKind::Skip)
    }
}

/// Scheduling priority requested for a started process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Run at the priority of the starting process
    #[default]
    Inherit,
    High,
    Low,
}

/// Instruction kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IrOp {
    Const {
        value: i64,
    },

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,

    // Comparison (booleans are 0 / 1)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Bitwise and boolean
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    And,
    Or,
    Not,

    // Variables
    LoadLocal {
        index: u32,
    },
    StoreLocal {
        index: u32,
    },
    LoadArgument {
        index: u32,
    },
    StoreArgument {
        index: u32,
    },
    /// Push the address of a channel word
    LoadChannel {
        index: u32,
    },
    LoadGlobal {
        name: String,
    },
    StoreGlobal {
        name: String,
    },

    // Communication
    /// Pops a channel address, pushes the word read from it
    ChannelRead,
    /// Pops the value, then the channel address on top
    ChannelWrite,
    PortRead {
        address: i64,
    },
    PortWrite {
        address: i64,
    },
    TimerRead,
    /// Pops a deadline and waits for it
    TimerWait,

    // Processes
    ProcessInit {
        processes: u32,
        continuation: InstrId,
        /// Frames of the started processes (one per `ProcessStart`)
        frames: Vec<FrameId>,
    },
    ProcessStart {
        entry: InstrId,
        frame: FrameId,
        #[serde(default)]
        priority: Priority,
    },
    ProcessEnd {
        /// The `ProcessStart` that started this process, or the
        /// `ProcessInit` for the branch run by the starting process itself
        creator: InstrId,
    },

    // Alternation
    AltInit,
    AltEnable {
        guard: GuardKind,
    },
    AltWait,
    AltDisable {
        enable: InstrId,
        statement: InstrId,
        end: InstrId,
    },
    AltEnd,

    // Control
    Branch {
        target: InstrId,
    },
    BranchIfFalse {
        target: InstrId,
    },
    Call {
        function: String,
        arguments: u32,
        results: u32,
    },
    MethodStart,
    MethodEnd,
    Label {
        #[serde(default)]
        name: Option<String>,
    },
    Skip,
    Stop,

    /// A machine-specific operation passed through by name
    Intrinsic {
        name: String,
        #[serde(default)]
        pops: u32,
        #[serde(default)]
        pushes: u32,
    },
}

impl IrOp {
    /// Values popped and pushed by this instruction.
    ///
    /// `MethodEnd` pops the enclosing function's results; that count lives in
    /// the frame table, so the value is supplied by the caller.
    pub fn stack_effect(&self, method_results: u32) -> (u32, u32) {
        use IrOp::*;
        match self {
            Const { .. } | LoadLocal { .. } | LoadArgument { .. } | LoadChannel { .. }
            | LoadGlobal { .. } | PortRead { .. } | TimerRead => (0, 1),
            Add | Sub | Mul | Div | Rem | Eq | Ne | Lt | Le | Gt | Ge | BitAnd | BitOr
            | BitXor | Shl | Shr | And | Or => (2, 1),
            Neg | BitNot | Not | ChannelRead => (1, 1),
            StoreLocal { .. } | StoreArgument { .. } | StoreGlobal { .. } | PortWrite { .. }
            | TimerWait | BranchIfFalse { .. } => (1, 0),
            ChannelWrite => (2, 0),
            AltEnable { guard } => {
                if guard.has_resource() {
                    (2, 0)
                } else {
                    (1, 0)
                }
            }
            Call {
                arguments, results, ..
            } => (*arguments, *results),
            MethodEnd => (method_results, 0),
            Intrinsic { pops, pushes, .. } => (*pops, *pushes),
            ProcessInit { .. } | ProcessStart { .. } | ProcessEnd { .. } | AltInit | AltWait
            | AltDisable { .. } | AltEnd | Branch { .. } | MethodStart | Label { .. } | Skip
            | Stop => (0, 0),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            IrOp::Branch { .. }
                | IrOp::MethodEnd
                | IrOp::ProcessEnd { .. }
                | IrOp::AltEnd
                | IrOp::Stop
        )
    }

    /// Other instructions this instruction refers to.
    pub fn references(&self) -> Vec<InstrId> {
        match self {
            IrOp::Branch { target } | IrOp::BranchIfFalse { target } => vec![*target],
            IrOp::ProcessInit { continuation, .. } => vec![*continuation],
            IrOp::ProcessStart { entry, .. } => vec![*entry],
            IrOp::ProcessEnd { creator } => vec![*creator],
            IrOp::AltDisable {
                enable,
                statement,
                end,
            } => vec![*enable, *statement, *end],
            _ => Vec::new(),
        }
    }

    /// Short lowercase name used in diagnostics and placeholders.
    pub fn mnemonic(&self) -> &str {
        use IrOp::*;
        match self {
            Const { .. } => "const",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Neg => "neg",
            Eq => "eq",
            Ne => "ne",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            BitAnd => "bit_and",
            BitOr => "bit_or",
            BitXor => "bit_xor",
            BitNot => "bit_not",
            Shl => "shl",
            Shr => "shr",
            And => "and",
            Or => "or",
            Not => "not",
            LoadLocal { .. } => "load_local",
            StoreLocal { .. } => "store_local",
            LoadArgument { .. } => "load_argument",
            StoreArgument { .. } => "store_argument",
            LoadChannel { .. } => "load_channel",
            LoadGlobal { .. } => "load_global",
            StoreGlobal { .. } => "store_global",
            ChannelRead => "channel_read",
            ChannelWrite => "channel_write",
            PortRead { .. } => "port_read",
            PortWrite { .. } => "port_write",
            TimerRead => "timer_read",
            TimerWait => "timer_wait",
            ProcessInit { .. } => "process_init",
            ProcessStart { .. } => "process_start",
            ProcessEnd { .. } => "process_end",
            AltInit => "alt_init",
            AltEnable { .. } => "alt_enable",
            AltWait => "alt_wait",
            AltDisable { .. } => "alt_disable",
            AltEnd => "alt_end",
            Branch { .. } => "branch",
            BranchIfFalse { .. } => "branch_if_false",
            Call { .. } => "call",
            MethodStart => "method_start",
            MethodEnd => "method_end",
            Label { .. } => "label",
            Skip => "skip",
            Stop => "stop",
            Intrinsic { name, .. } => name,
        }
    }
}

/// One IR instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrInstruction {
    pub id: InstrId,
    #[serde(flatten)]
    pub op: IrOp,
}

/// An ordered list of instructions running in one frame.
///
/// A function block starts with a named `Label` and `MethodStart` and ends
/// with `MethodEnd`; a process block starts with a named `Label` and ends
/// with `ProcessEnd`. A plain block has no leading name and continues the
/// function running in the same frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrBlock {
    pub frame: FrameId,
    pub instructions: Vec<IrInstruction>,
}

impl IrBlock {
    /// Name declared by the block's leading label.
    pub fn declared_name(&self) -> Option<&str> {
        match self.instructions.first().map(|i| &i.op) {
            Some(IrOp::Label { name: Some(name) }) => Some(name),
            _ => None,
        }
    }

    /// Whether the block is framed by `MethodStart` / `MethodEnd`.
    pub fn is_function(&self) -> bool {
        self.instructions
            .iter()
            .any(|i| matches!(i.op, IrOp::MethodStart))
    }

    /// Names of the functions called from this block, in first-call order.
    pub fn called_functions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for instr in &self.instructions {
            if let IrOp::Call { function, .. } = &instr.op
                && !names.contains(&function.as_str())
            {
                names.push(function);
            }
        }
        names
    }

    /// Position of an instruction within the block.
    pub fn position(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }
}

/// A top-level (file-scope) variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    /// Key into [`IrProgram::types`]
    #[serde(rename = "type")]
    pub ty: String,
}

/// A complete program handed to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrProgram {
    #[serde(default)]
    pub frames: Vec<FrameDecl>,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
    /// Size in bytes of every type a global may have
    #[serde(default)]
    pub types: BTreeMap<String, u32>,
    pub blocks: Vec<IrBlock>,
}

impl IrProgram {
    pub fn frame(&self, id: FrameId) -> Option<&FrameDecl> {
        self.frames.iter().find(|f| f.id == id)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalDecl> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn type_size(&self, ty: &str) -> Option<u32> {
        self.types.get(ty).copied()
    }

    /// The block whose leading label declares `name`.
    pub fn block_named(&self, name: &str) -> Option<&IrBlock> {
        self.blocks.iter().find(|b| b.declared_name() == Some(name))
    }
}
