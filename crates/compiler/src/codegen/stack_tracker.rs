//! Evaluation-stack simulation
//!
//! Models the three-register window while a block is walked. Every value is
//! a [`StackItem`] that remembers how deep it has ever been pushed; once an
//! item has been the fourth value it cannot live in a register and must be
//! kept in a temporary for its whole lifetime.
//!
//! Jumps fork the model: the state at the jump is copied into a new
//! [`StackBranch`] that becomes active when the walk reaches the target, so a
//! single linear walk models every path. Paths meeting at one index must
//! agree on their shape.

use super::CodeGenError;
use super::frame::{REGISTERS, TempRegion};
use tpc_core::InstrId;

/// One abstract value: the `slot`-th result of `producer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackItemId {
    pub producer: InstrId,
    pub slot: u32,
}

impl StackItemId {
    /// Slot of the static link pushed by a call.
    pub const LINK_SLOT: u32 = u32::MAX;

    pub fn new(producer: InstrId, slot: u32) -> Self {
        StackItemId { producer, slot }
    }

    /// Placeholder modelling registers an instruction needs beyond its
    /// operands.
    pub fn phantom(producer: InstrId, index: u32) -> Self {
        StackItemId {
            producer,
            slot: Self::LINK_SLOT - 1 - index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackItem {
    pub id: StackItemId,
    /// Values currently above this one
    pub depth: u32,
    pub max_depth: u32,
}

/// Number of pending values and live temporaries at one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub values: usize,
    pub temporaries: u32,
}

#[derive(Debug, Clone)]
pub struct StackBranch {
    pub from: usize,
    pub items: Vec<StackItem>,
    pub temps: TempRegion,
}

impl StackBranch {
    fn shape(&self) -> Shape {
        Shape {
            values: self.items.len(),
            temporaries: self.temps.depth(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackTracker {
    branches: Vec<StackBranch>,
    active: usize,
    /// Shape recorded when each index was entered, for backward jumps
    visited: Vec<(usize, Shape)>,
}

impl Default for StackTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StackTracker {
    pub fn new() -> Self {
        StackTracker {
            branches: vec![StackBranch {
                from: 0,
                items: Vec::new(),
                temps: TempRegion::default(),
            }],
            active: 0,
            visited: Vec::new(),
        }
    }

    fn current(&self) -> &StackBranch {
        &self.branches[self.active]
    }

    fn current_mut(&mut self) -> &mut StackBranch {
        &mut self.branches[self.active]
    }

    pub fn size(&self) -> usize {
        self.current().items.len()
    }

    pub fn items(&self) -> &[StackItem] {
        &self.current().items
    }

    pub fn shape(&self) -> Shape {
        self.current().shape()
    }

    pub fn temps(&self) -> &TempRegion {
        &self.current().temps
    }

    pub fn temps_mut(&mut self) -> &mut TempRegion {
        &mut self.current_mut().temps
    }

    /// Push a value; returns the items that just became a fourth value.
    pub fn push(&mut self, id: StackItemId) -> Vec<StackItemId> {
        let mut overflowed = Vec::new();
        let branch = self.current_mut();
        for item in &mut branch.items {
            item.depth += 1;
            if item.depth > item.max_depth {
                item.max_depth = item.depth;
                if item.max_depth == REGISTERS {
                    overflowed.push(item.id);
                }
            }
        }
        branch.items.push(StackItem {
            id,
            depth: 0,
            max_depth: 0,
        });
        overflowed
    }

    pub fn pop(&mut self) -> Option<StackItem> {
        let branch = self.current_mut();
        let item = branch.items.pop()?;
        for below in &mut branch.items {
            below.depth -= 1;
        }
        Some(item)
    }

    /// Copy the current state to become active at `target`.
    pub fn fork(&mut self, target: usize, current: usize) -> Result<(), CodeGenError> {
        let shape = self.shape();
        if target <= current {
            if let Some((_, seen)) = self.visited.iter().find(|(index, _)| *index == target) {
                check_join(target, *seen, shape)?;
            }
            return Ok(());
        }
        if let Some(existing) = self.branches.iter().find(|b| b.from == target) {
            return check_join(target, existing.shape(), shape);
        }
        let mut branch = self.current().clone();
        branch.from = target;
        self.branches.push(branch);
        Ok(())
    }

    /// Enter `index`, switching to a branch forked there if any.
    pub fn activate(&mut self, index: usize, fell_through: bool) -> Result<(), CodeGenError> {
        if let Some(pos) = self.branches.iter().position(|b| b.from == index)
            && pos != self.active
        {
            if fell_through {
                check_join(index, self.branches[pos].shape(), self.shape())?;
            }
            self.active = pos;
        }
        let shape = self.shape();
        self.visited.push((index, shape));
        Ok(())
    }
}

fn check_join(index: usize, expected: Shape, found: Shape) -> Result<(), CodeGenError> {
    if expected == found {
        return Ok(());
    }
    Err(CodeGenError::InconsistentJoin {
        index,
        detail: format!(
            "{} value(s) and {} temporaries on one path, {} and {} on another",
            expected.values, expected.temporaries, found.values, found.temporaries
        ),
    })
}
