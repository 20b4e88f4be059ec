//! Workspace layout
//!
//! Every scope runs in one workspace addressed by word offsets from `Wptr`:
//!
//! ```text
//!   0                 scratch word (outword, in, altend selector)
//!   1 .. 1+T          temporaries, depth d at 1+(T-1-d)
//!   1+T               fixed base: channels
//!   base+C            locals
//!   base+C+L          return address / join pointer
//!   base+C+L+1 ..+3   register arguments (static link first)
//!   base+C+L+4 ..     stack area shared with the caller
//! ```
//!
//! Static links hold an ancestor's fixed base, so everything above the
//! temporaries can be addressed without knowing the ancestor's `T`.

use super::CodeGenError;
use std::collections::{BTreeMap, BTreeSet};
use tpc_core::{FrameDecl, FrameId, FrameKind, VarKind};

/// Words written below the callee's workspace by `call`.
pub const CALL_LINKAGE_WORDS: u32 = 4;

/// Words below `Wptr` used by the scheduler and by `alt`/`talt`.
pub const SCHEDULER_WORDS: u32 = 5;

/// Join pointer and static link at the top of a process workspace.
pub const PROCESS_LINK_WORDS: u32 = 2;

/// Number of value registers.
pub const REGISTERS: u32 = 3;

fn too_large(what: &str) -> CodeGenError {
    CodeGenError::Malformed(format!("{} does not fit in a 32-bit word count", what))
}

/// Offset from `Wptr` of the temporary at `slot`.
pub fn temporary_offset(temporaries: u32, slot: u32) -> i64 {
    i64::from(temporaries) - i64::from(slot)
}

/// The stack-disciplined temporary region of the current frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TempRegion {
    depth: u32,
}

impl TempRegion {
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn top(&self) -> Option<u32> {
        self.depth.checked_sub(1)
    }

    pub fn allocate(&mut self) -> Result<u32, CodeGenError> {
        self.allocate_many(1)
    }

    /// Allocate `count` adjacent slots; returns the lowest.
    pub fn allocate_many(&mut self, count: u32) -> Result<u32, CodeGenError> {
        let first = self.depth;
        self.depth = first
            .checked_add(count)
            .ok_or_else(|| too_large("temporary region"))?;
        Ok(first)
    }

    pub fn release(&mut self, slot: u32) -> Result<(), CodeGenError> {
        if self.top() != Some(slot) {
            return Err(CodeGenError::TemporaryOrder {
                released: slot,
                top: self.top(),
            });
        }
        self.depth -= 1;
        Ok(())
    }

    /// Release `count` slots starting at `first`, topmost first.
    pub fn release_many(&mut self, first: u32, count: u32) -> Result<(), CodeGenError> {
        for slot in (first..first + count).rev() {
            self.release(slot)?;
        }
        Ok(())
    }
}

/// Register/stack split of a call with a given arity.
///
/// `arguments` counts the static link when the callee has one; it is always
/// the last argument and therefore always travels in `A`. Slots are relative
/// to the callee's linkage word (`C+L` above its fixed base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallConvention {
    pub arguments: u32,
    pub results: u32,
}

impl CallConvention {
    pub fn new(arguments: u32, results: u32) -> Self {
        CallConvention { arguments, results }
    }

    pub fn register_arguments(&self) -> u32 {
        self.arguments.min(REGISTERS)
    }

    pub fn stack_arguments(&self) -> u32 {
        self.arguments.saturating_sub(REGISTERS)
    }

    pub fn stack_results(&self) -> u32 {
        self.results.saturating_sub(REGISTERS)
    }

    /// Words of the area shared by stack arguments and stack results.
    pub fn stack_area(&self) -> u32 {
        self.stack_arguments().max(self.stack_results())
    }

    pub fn argument_slot(&self, index: u32) -> u32 {
        if index >= self.stack_arguments() {
            1 + (self.arguments - 1 - index)
        } else {
            CALL_LINKAGE_WORDS + (self.stack_area() - 1 - index)
        }
    }

    /// Slot of one of the deep results (`index < stack_results()`).
    pub fn result_slot(&self, index: u32) -> u32 {
        CALL_LINKAGE_WORDS + (self.stack_area() - 1 - index)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub kind: FrameKind,
    pub parent: Option<FrameId>,
    pub arguments: u32,
    pub results: u32,
    pub locals: u32,
    pub channels: u32,
    /// First cumulative index of each variable kind declared here
    pub argument_base: u32,
    pub local_base: u32,
    pub channel_base: u32,
    temporaries: Option<u32>,
    covered: BTreeSet<FrameId>,
}

impl Frame {
    fn base(&self, kind: VarKind) -> u32 {
        match kind {
            VarKind::Argument => self.argument_base,
            VarKind::Local => self.local_base,
            VarKind::Channel => self.channel_base,
        }
    }

    fn count(&self, kind: VarKind) -> u32 {
        match kind {
            VarKind::Argument => self.arguments,
            VarKind::Local => self.locals,
            VarKind::Channel => self.channels,
        }
    }

    pub fn is_process(&self) -> bool {
        self.kind == FrameKind::Process
    }

    pub fn temporaries(&self) -> Option<u32> {
        self.temporaries
    }

    pub fn is_covered(&self, child: FrameId) -> bool {
        self.covered.contains(&child)
    }

    /// Convention used to call this frame, static link included.
    pub fn convention(&self) -> CallConvention {
        CallConvention::new(
            self.arguments + u32::from(self.parent.is_some()),
            self.results,
        )
    }

    /// Return address of a function, join pointer of a process.
    pub fn linkage_offset(&self) -> u32 {
        self.channels + self.locals
    }

    /// Fixed-relative offset of the static link.
    pub fn link_offset(&self) -> Option<u32> {
        self.parent.map(|_| self.linkage_offset() + 1)
    }

    /// Fixed-relative offset of one of this frame's own variables.
    pub fn variable_offset(&self, kind: VarKind, relative: u32) -> u32 {
        match kind {
            VarKind::Channel => relative,
            VarKind::Local => self.channels + relative,
            VarKind::Argument => self.linkage_offset() + self.convention().argument_slot(relative),
        }
    }

    /// Workspace words at and above `Wptr`.
    pub fn words(&self) -> Result<u32, CodeGenError> {
        let temporaries = self
            .temporaries
            .ok_or(CodeGenError::FrameNotSized(self.id))?;
        let link = if self.is_process() { PROCESS_LINK_WORDS } else { 0 };
        [temporaries, self.channels, self.locals, link]
            .into_iter()
            .try_fold(1u32, |words, part| words.checked_add(part))
            .ok_or_else(|| too_large(&format!("frame {}", self.id)))
    }
}

/// Where a variable lives relative to the frame that uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub frame: FrameId,
    /// Static-chain boundaries between the user and the owner
    pub hops: u32,
    /// Index within the owner's own declarations
    pub relative: u32,
}

/// All frames of a program, with their sizes filled in as blocks are
/// preprocessed.
#[derive(Debug, Clone, Default)]
pub struct FrameModel {
    frames: BTreeMap<FrameId, Frame>,
}

impl FrameModel {
    pub fn new(decls: &[FrameDecl]) -> Result<Self, CodeGenError> {
        let mut by_id: BTreeMap<FrameId, &FrameDecl> = BTreeMap::new();
        for decl in decls {
            if by_id.insert(decl.id, decl).is_some() {
                return Err(CodeGenError::Malformed(format!(
                    "frame {} declared twice",
                    decl.id
                )));
            }
            // Everything addressed relative to the fixed base must stay in range.
            let area = decl.arguments.max(decl.results);
            [decl.channels, decl.locals, CALL_LINKAGE_WORDS, PROCESS_LINK_WORDS, 1]
                .into_iter()
                .try_fold(area, |words, part| words.checked_add(part))
                .ok_or_else(|| too_large(&format!("frame {}", decl.id)))?;
            if decl.kind == FrameKind::Process {
                if decl.parent.is_none() {
                    return Err(CodeGenError::Malformed(format!(
                        "process frame {} has no parent",
                        decl.id
                    )));
                }
                if decl.arguments > 0 || decl.results > 0 {
                    return Err(CodeGenError::Malformed(format!(
                        "process frame {} declares arguments or results",
                        decl.id
                    )));
                }
            }
        }

        let mut frames = BTreeMap::new();
        for decl in decls {
            let mut bases = [0u32; 3];
            let mut seen = BTreeSet::from([decl.id]);
            let mut cursor = decl.parent;
            while let Some(id) = cursor {
                let parent = by_id.get(&id).ok_or_else(|| {
                    CodeGenError::Malformed(format!(
                        "frame {} has unknown parent {}",
                        decl.id, id
                    ))
                })?;
                if !seen.insert(id) {
                    return Err(CodeGenError::Malformed(format!(
                        "static chain of frame {} loops through {}",
                        decl.id, id
                    )));
                }
                for (base, count) in bases
                    .iter_mut()
                    .zip([parent.arguments, parent.locals, parent.channels])
                {
                    *base = base
                        .checked_add(count)
                        .ok_or_else(|| too_large(&format!("variable numbering of frame {}", decl.id)))?;
                }
                cursor = parent.parent;
            }
            for (base, count) in bases.iter().zip([decl.arguments, decl.locals, decl.channels]) {
                base.checked_add(count)
                    .ok_or_else(|| too_large(&format!("variable numbering of frame {}", decl.id)))?;
            }
            frames.insert(
                decl.id,
                Frame {
                    id: decl.id,
                    kind: decl.kind,
                    parent: decl.parent,
                    arguments: decl.arguments,
                    results: decl.results,
                    locals: decl.locals,
                    channels: decl.channels,
                    argument_base: bases[0],
                    local_base: bases[1],
                    channel_base: bases[2],
                    temporaries: None,
                    covered: BTreeSet::new(),
                },
            );
        }
        Ok(FrameModel { frames })
    }

    pub fn frame(&self, id: FrameId) -> Result<&Frame, CodeGenError> {
        self.frames
            .get(&id)
            .ok_or_else(|| CodeGenError::Malformed(format!("unknown frame {}", id)))
    }

    /// Record the result of preprocessing the block that runs in `id`.
    pub fn set_sized(
        &mut self,
        id: FrameId,
        temporaries: u32,
        covered: BTreeSet<FrameId>,
    ) -> Result<(), CodeGenError> {
        let frame = self
            .frames
            .get_mut(&id)
            .ok_or_else(|| CodeGenError::Malformed(format!("unknown frame {}", id)))?;
        frame.temporaries = Some(temporaries);
        frame.covered = covered;
        Ok(())
    }

    /// Walk the static chain from `from` to the frame declaring `index`.
    pub fn owner(&self, from: FrameId, kind: VarKind, index: u32) -> Result<Access, CodeGenError> {
        let mut hops = 0;
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let frame = self.frame(id)?;
            let base = frame.base(kind);
            if index >= base && index < base + frame.count(kind) {
                return Ok(Access {
                    frame: id,
                    hops,
                    relative: index - base,
                });
            }
            hops += 1;
            cursor = frame.parent;
        }
        Err(CodeGenError::UnknownVariable {
            kind,
            index,
            frame: from,
        })
    }

    /// Static-chain boundaries from `from` up to `target`, if `target` is
    /// `from` or one of its ancestors.
    pub fn distance(&self, from: FrameId, target: FrameId) -> Result<Option<u32>, CodeGenError> {
        let mut hops = 0;
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if id == target {
                return Ok(Some(hops));
            }
            hops += 1;
            cursor = self.frame(id)?.parent;
        }
        Ok(None)
    }

    /// The frames crossed when climbing `hops` boundaries from `from`,
    /// starting with `from` itself.
    pub fn chain(&self, from: FrameId, hops: u32) -> Result<Vec<&Frame>, CodeGenError> {
        let mut chain = Vec::with_capacity(hops as usize + 1);
        let mut frame = self.frame(from)?;
        chain.push(frame);
        for _ in 0..hops {
            let parent = frame.parent.ok_or_else(|| {
                CodeGenError::Logic(format!("frame {} has no static link", frame.id))
            })?;
            frame = self.frame(parent)?;
            chain.push(frame);
        }
        Ok(chain)
    }

    /// Memory to reserve for one activation of `id`.
    ///
    /// Covers the frame's own words, its linkage and scheduler overhead and
    /// every descendant process frame it does not reserve itself.
    /// `counted_parent` names a frame already accounted for by the caller of
    /// this computation; it is skipped wherever it appears among the
    /// descendants.
    pub fn full_size(&self, id: FrameId, counted_parent: Option<FrameId>) -> Result<u32, CodeGenError> {
        let frame = self.frame(id)?;
        let overflow = || too_large(&format!("activation of frame {}", id));
        let linkage = if frame.is_process() { 0 } else { CALL_LINKAGE_WORDS };
        let mut size = frame
            .words()?
            .checked_add(SCHEDULER_WORDS + linkage)
            .ok_or_else(overflow)?;
        for child in self.frames.values() {
            if child.parent == Some(id)
                && child.is_process()
                && !frame.is_covered(child.id)
                && counted_parent != Some(child.id)
            {
                size = size
                    .checked_add(self.full_size(child.id, counted_parent)?)
                    .ok_or_else(overflow)?;
            }
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> FrameModel {
        let decls = vec![
            FrameDecl::function(0).with_locals(2).with_channels(1),
            FrameDecl::function(1)
                .with_parent(0)
                .with_signature(2, 1)
                .with_locals(3),
            FrameDecl::process(2, 1).with_locals(1),
        ];
        FrameModel::new(&decls).unwrap()
    }

    #[test]
    fn test_cumulative_numbering_and_owner() {
        let m = model();
        assert_eq!(m.frame(FrameId(1)).unwrap().local_base, 2);
        assert_eq!(m.frame(FrameId(2)).unwrap().local_base, 5);

        let access = m.owner(FrameId(2), VarKind::Local, 1).unwrap();
        assert_eq!(
            access,
            Access {
                frame: FrameId(0),
                hops: 2,
                relative: 1
            }
        );
        let access = m.owner(FrameId(2), VarKind::Local, 5).unwrap();
        assert_eq!(access.hops, 0);
        assert_eq!(access.relative, 0);

        assert!(matches!(
            m.owner(FrameId(2), VarKind::Local, 9),
            Err(CodeGenError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_temporaries_are_lifo() {
        let mut temps = TempRegion::default();
        let a = temps.allocate().unwrap();
        let b = temps.allocate().unwrap();
        assert!(matches!(
            temps.release(a),
            Err(CodeGenError::TemporaryOrder { released: 0, top: Some(1) })
        ));
        temps.release(b).unwrap();
        temps.release(a).unwrap();
        assert_eq!(temps.depth(), 0);

        let first = temps.allocate_many(3).unwrap();
        temps.release_many(first, 3).unwrap();
        assert_eq!(temps.depth(), 0);

        temps.allocate().unwrap();
        assert!(matches!(
            temps.allocate_many(u32::MAX),
            Err(CodeGenError::Malformed(_))
        ));
        assert_eq!(temps.depth(), 1);
    }

    #[test]
    fn test_temporary_offsets_run_downward() {
        // Deepest temporary sits just below the fixed base.
        assert_eq!(temporary_offset(4, 0), 4);
        assert_eq!(temporary_offset(4, 3), 1);
    }

    #[test]
    fn test_convention_slots() {
        let conv = CallConvention::new(5, 4);
        assert_eq!(conv.register_arguments(), 3);
        assert_eq!(conv.stack_arguments(), 2);
        assert_eq!(conv.stack_results(), 1);
        assert_eq!(conv.stack_area(), 2);
        assert_eq!(conv.argument_slot(4), 1);
        assert_eq!(conv.argument_slot(2), 3);
        assert_eq!(conv.argument_slot(0), 5);
        assert_eq!(conv.argument_slot(1), 4);
        assert_eq!(conv.result_slot(0), 5);
    }

    #[test]
    fn test_full_size_requires_sizing() {
        let mut m = model();
        assert!(matches!(
            m.full_size(FrameId(1), None),
            Err(CodeGenError::FrameNotSized(_))
        ));

        m.set_sized(FrameId(2), 0, BTreeSet::new()).unwrap();
        m.set_sized(FrameId(1), 2, BTreeSet::new()).unwrap();
        // process 2: 1 + 0 + 0 + 1 + 2 words, plus scheduler
        assert_eq!(m.full_size(FrameId(2), None).unwrap(), 4 + 5);
        // function 1: 1 + 2 + 3 words + linkage + scheduler + uncovered child
        assert_eq!(m.full_size(FrameId(1), None).unwrap(), 6 + 4 + 5 + 9);

        m.set_sized(FrameId(1), 2, BTreeSet::from([FrameId(2)]))
            .unwrap();
        assert_eq!(m.full_size(FrameId(1), None).unwrap(), 15);
        assert_eq!(m.full_size(FrameId(1), Some(FrameId(2))).unwrap(), 15);
    }

    #[test]
    fn test_argument_offsets_include_static_link() {
        let m = model();
        let f = m.frame(FrameId(1)).unwrap();
        // link in A, argument 1 in B, argument 0 in C
        assert_eq!(f.link_offset(), Some(4));
        assert_eq!(f.variable_offset(VarKind::Argument, 1), 5);
        assert_eq!(f.variable_offset(VarKind::Argument, 0), 6);
        assert_eq!(f.variable_offset(VarKind::Local, 2), 2);
    }

    #[test]
    fn test_rejects_bad_chains() {
        let decls = vec![FrameDecl::function(0).with_parent(7)];
        assert!(matches!(
            FrameModel::new(&decls),
            Err(CodeGenError::Malformed(_))
        ));
        let decls = vec![
            FrameDecl::function(0).with_parent(1),
            FrameDecl::function(1).with_parent(0),
        ];
        assert!(matches!(
            FrameModel::new(&decls),
            Err(CodeGenError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_frames_are_rejected() {
        let decls = vec![FrameDecl::function(0).with_locals(u32::MAX - 2)];
        assert!(matches!(
            FrameModel::new(&decls),
            Err(CodeGenError::Malformed(_))
        ));

        // Each frame fits on its own but the cumulative numbering does not.
        let decls = vec![
            FrameDecl::function(0).with_locals(u32::MAX - 8),
            FrameDecl::function(1).with_parent(0).with_locals(u32::MAX - 8),
        ];
        assert!(matches!(
            FrameModel::new(&decls),
            Err(CodeGenError::Malformed(_))
        ));

        let mut m = FrameModel::new(&[FrameDecl::function(0).with_locals(u32::MAX - 16)]).unwrap();
        m.set_sized(FrameId(0), 64, BTreeSet::new()).unwrap();
        assert!(matches!(
            m.frame(FrameId(0)).unwrap().words(),
            Err(CodeGenError::Malformed(_))
        ));
        assert!(matches!(
            m.full_size(FrameId(0), None),
            Err(CodeGenError::Malformed(_))
        ));
    }
}
