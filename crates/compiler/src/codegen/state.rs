//! Generation state and the Pass 1 side table
//!
//! Everything that changes while one block is walked lives in
//! [`GenerationState`]; what Pass 1 learns about the block is frozen into a
//! [`BlockPlan`] that later walks only read.

use super::CodeGenError;
use super::frame::{REGISTERS, TempRegion, temporary_offset};
use super::stack_tracker::{StackItemId, StackTracker};
use std::collections::{BTreeMap, BTreeSet};
use tpc_core::{AsmLine, FrameId, GuardKind, InstrId, Instruction, Opcode};

/// Which walk over a block is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Discover which values overflow the register window
    Shape,
    /// Allocate every temporary as emission will and measure the high water
    Size,
    /// Produce machine code
    Emit,
}

/// Per-instruction facts established before emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    pub needs_label: bool,
    /// A `cj` lands here leaving its zero in `A`
    pub needs_pop_after_label: bool,
    /// Result slots that live in a temporary
    pub spill_slots: BTreeSet<u32>,
}

/// Stack traffic of one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLayout {
    pub site: InstrId,
    pub stack_arguments: u32,
    pub stack_results: u32,
    pub stack_area: u32,
    /// Temporary depth where the callee's region starts
    pub callee_depth: u32,
}

/// Where a function leaves the results it cannot return in registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnLayout {
    pub stack_results: u32,
    pub stack_area: u32,
    /// Slots above the linkage word, first deep result first
    pub result_slots: Vec<u32>,
}

/// The Pass 1 side table for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPlan {
    pub annotations: BTreeMap<InstrId, Annotation>,
    /// Temporary high water of the block's frame
    pub temporaries: u32,
    /// `AltInit`s with at least one timer guard
    pub timed_alts: BTreeSet<InstrId>,
    /// Process frames whose memory this block reserves
    pub covered: BTreeSet<FrameId>,
    pub calls: Vec<CallLayout>,
    pub returns: Option<ReturnLayout>,
}

impl BlockPlan {
    pub fn annotation(&self, id: InstrId) -> Option<&Annotation> {
        self.annotations.get(&id)
    }

    pub fn is_spilled(&self, item: StackItemId) -> bool {
        self.annotations
            .get(&item.producer)
            .is_some_and(|a| a.spill_slots.contains(&item.slot))
    }

    pub fn spill_count(&self) -> usize {
        self.annotations.values().map(|a| a.spill_slots.len()).sum()
    }

    fn spills(&self) -> BTreeSet<StackItemId> {
        self.annotations
            .iter()
            .flat_map(|(id, a)| a.spill_slots.iter().map(|slot| StackItemId::new(*id, *slot)))
            .collect()
    }

    /// Fold the findings of a walk into the plan.
    pub fn absorb(&mut self, found: &Discoveries) {
        for item in &found.spills {
            self.annotations
                .entry(item.producer)
                .or_default()
                .spill_slots
                .insert(item.slot);
        }
        self.timed_alts.extend(found.timed_alts.iter().copied());
    }

    /// Whether `found` holds spills this plan does not know about.
    pub fn misses(&self, found: &Discoveries) -> bool {
        !found.spills.is_subset(&self.spills())
    }
}

/// What one walk learned.
#[derive(Debug, Clone, Default)]
pub struct Discoveries {
    pub spills: BTreeSet<StackItemId>,
    pub timed_alts: BTreeSet<InstrId>,
    pub covered: BTreeSet<FrameId>,
    pub high_water: u32,
    pub calls: Vec<CallLayout>,
    pub returns: Option<ReturnLayout>,
}

/// Memory reserved by an open PAR.
#[derive(Debug, Clone)]
pub struct ParContext {
    pub init: InstrId,
    pub continuation: InstrId,
    /// Slot holding the continuation address; the count is one slot below
    pub join: u32,
    /// First slot of the whole reservation
    pub first: u32,
    pub reserved: u32,
    /// Started frame and the slot at the bottom of its region
    pub workspaces: Vec<(FrameId, u32)>,
    pub started: BTreeSet<FrameId>,
}

#[derive(Debug, Clone)]
pub struct GuardSlot {
    pub enable: InstrId,
    pub guard: GuardKind,
    pub condition: u32,
    pub resource: Option<u32>,
}

/// An open ALT.
#[derive(Debug, Clone)]
pub struct AltContext {
    pub init: InstrId,
    pub timed: bool,
    pub guards: Vec<GuardSlot>,
    /// Guard statements, in disable order
    pub statements: Vec<InstrId>,
    /// The `AltEnd` every disable names
    pub end: Option<InstrId>,
}

/// Mutable state of one walk over one block.
pub struct GenerationState<'p> {
    pub mode: Mode,
    pub plan: &'p BlockPlan,
    /// Unit being walked, see [`crate::call_graph`]
    pub unit: usize,
    pub frame: FrameId,
    /// Label prefix of the unit
    pub base: String,
    pub current: InstrId,
    pub position: usize,
    pub tracker: StackTracker,
    /// Temporaries holding spilled values
    pub homes: BTreeMap<StackItemId, u32>,
    pub pars: Vec<ParContext>,
    pub alts: Vec<AltContext>,
    pub found: Discoveries,
    pub lines: Vec<AsmLine>,
}

impl<'p> GenerationState<'p> {
    pub fn new(mode: Mode, plan: &'p BlockPlan, unit: usize, frame: FrameId, base: String) -> Self {
        GenerationState {
            mode,
            plan,
            unit,
            frame,
            base,
            current: InstrId(0),
            position: 0,
            tracker: StackTracker::new(),
            homes: BTreeMap::new(),
            pars: Vec::new(),
            alts: Vec::new(),
            found: Discoveries::default(),
            lines: Vec::new(),
        }
    }

    pub fn emits(&self) -> bool {
        self.mode == Mode::Emit
    }

    pub fn emit_line(&mut self, line: AsmLine) {
        if self.emits() {
            self.lines.push(line);
        }
    }

    pub fn emit(&mut self, instr: Instruction) {
        self.emit_line(AsmLine::Instr(instr));
    }

    pub fn emit_op(&mut self, opcode: Opcode) {
        self.emit(Instruction::op(opcode));
    }

    pub fn emit_lit(&mut self, opcode: Opcode, value: i64) {
        self.emit(Instruction::literal(opcode, value));
    }

    pub fn emit_label(&mut self, label: impl Into<String>) {
        self.emit_line(AsmLine::Label(label.into()));
    }

    /// Offset from `Wptr` of a temporary of this block's frame.
    pub fn temporary(&self, slot: u32) -> i64 {
        temporary_offset(self.plan.temporaries, slot)
    }

    /// Offset from `Wptr` of the frame's fixed base.
    pub fn fixed_base(&self) -> i64 {
        1 + i64::from(self.plan.temporaries)
    }

    pub fn temps(&self) -> &TempRegion {
        self.tracker.temps()
    }

    pub fn allocate(&mut self) -> Result<u32, CodeGenError> {
        let slot = self.tracker.temps_mut().allocate()?;
        self.note_depth();
        Ok(slot)
    }

    pub fn allocate_many(&mut self, count: u32) -> Result<u32, CodeGenError> {
        let first = self.tracker.temps_mut().allocate_many(count)?;
        self.note_depth();
        Ok(first)
    }

    pub fn release(&mut self, slot: u32) -> Result<(), CodeGenError> {
        self.tracker.temps_mut().release(slot)
    }

    pub fn release_many(&mut self, first: u32, count: u32) -> Result<(), CodeGenError> {
        self.tracker.temps_mut().release_many(first, count)
    }

    fn note_depth(&mut self) {
        let depth = self.tracker.temps().depth();
        self.found.high_water = self.found.high_water.max(depth);
    }

    pub fn is_spilled(&self, item: StackItemId) -> bool {
        self.plan.is_spilled(item)
    }

    /// Fail unless the evaluation stack is empty.
    pub fn require_empty(&self) -> Result<(), CodeGenError> {
        match self.tracker.size() {
            0 => Ok(()),
            pending => Err(CodeGenError::PendingValuesAtJump {
                at: self.current,
                pending,
            }),
        }
    }

    /// Values currently held in registers.
    pub fn registers_in_use(&self) -> usize {
        self.tracker
            .items()
            .iter()
            .filter(|item| !self.is_spilled(item.id))
            .count()
    }

    pub fn check_registers(&self) -> Result<(), CodeGenError> {
        if self.mode == Mode::Shape {
            return Ok(());
        }
        let registers = self.registers_in_use();
        if registers > REGISTERS as usize {
            return Err(CodeGenError::RegisterOverflow {
                at: self.current,
                registers,
            });
        }
        Ok(())
    }
}

/// Mangle an IR name into an assembler identifier.
///
/// Assembler identifiers can contain letters, digits, `_`, `.` and `$`.
/// Other characters are escaped:
/// - `-` -> `_`
/// - `?` -> `_Q_`
/// - `>` -> `_GT_`, `<` -> `_LT_`
/// - `!` -> `_BANG_`, `*` -> `_STAR_`, `/` -> `_SLASH_`
/// - `+` -> `_PLUS_`, `=` -> `_EQ_`
/// - anything else is hex-encoded as `_xNN_`
pub fn mangle_name(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        match c {
            '?' => result.push_str("_Q_"),
            '>' => result.push_str("_GT_"),
            '<' => result.push_str("_LT_"),
            '!' => result.push_str("_BANG_"),
            '*' => result.push_str("_STAR_"),
            '/' => result.push_str("_SLASH_"),
            '+' => result.push_str("_PLUS_"),
            '=' => result.push_str("_EQ_"),
            '-' => result.push('_'),
            '_' | '.' | '$' => result.push(c),
            c if c.is_ascii_alphanumeric() => result.push(c),
            _ => result.push_str(&format!("_x{:02X}_", c as u32)),
        }
    }
    result
}
