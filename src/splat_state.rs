// splat_state.rs - Per-splat edit state
// Bits: 0=selected, 1=locked, 2=deleted. Deleted splats are skipped by the
// projector and never reach the sorter.

/// Splat state bit constants as stored in the device state buffer
pub mod state_bits {
    pub const NORMAL: u32 = 0;
    /// Splat is selected (bit 0)
    pub const SELECTED: u32 = 1;
    /// Splat is locked (bit 1)
    pub const LOCKED: u32 = 2;
    /// Splat is deleted (bit 2)
    pub const DELETED: u32 = 4;
}

/// Whether a splat with these state bits takes part in a frame
#[inline]
pub fn is_renderable(bits: u32) -> bool {
    bits & state_bits::DELETED == 0
}

/// Selection operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionOp {
    /// Replace current selection with new selection
    #[default]
    Set,
    /// Add to current selection
    Add,
    /// Remove from current selection
    Remove,
}

const SELECTED: u8 = state_bits::SELECTED as u8;
const LOCKED: u8 = state_bits::LOCKED as u8;
const DELETED: u8 = state_bits::DELETED as u8;

/// Host copy of the per-splat state (one u8 per splat)
#[derive(Debug, Clone, Default)]
pub struct SplatState {
    pub states: Vec<u8>,
    /// Number of selected splats (cached)
    pub num_selected: u32,
    pub num_locked: u32,
    pub num_deleted: u32,
    /// State changed since the last upload
    pub dirty: bool,
}

impl SplatState {
    /// All splats normal
    pub fn new(num_splats: usize) -> Self {
        Self {
            states: vec![0; num_splats],
            dirty: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Apply a selection op; locked and deleted splats cannot be selected
    pub fn apply(&mut self, op: SelectionOp, indices: &[u32]) {
        match op {
            SelectionOp::Set => {
                self.deselect_all();
                self.select(indices);
            }
            SelectionOp::Add => self.select(indices),
            SelectionOp::Remove => self.deselect(indices),
        }
    }

    pub fn select(&mut self, indices: &[u32]) {
        for &idx in indices {
            if let Some(state) = self.states.get_mut(idx as usize) {
                if *state & (SELECTED | LOCKED | DELETED) == 0 {
                    *state |= SELECTED;
                    self.num_selected += 1;
                }
            }
        }
        self.dirty = true;
    }

    pub fn deselect(&mut self, indices: &[u32]) {
        for &idx in indices {
            if let Some(state) = self.states.get_mut(idx as usize) {
                if *state & SELECTED != 0 {
                    *state &= !SELECTED;
                    self.num_selected -= 1;
                }
            }
        }
        self.dirty = true;
    }

    pub fn deselect_all(&mut self) {
        for state in &mut self.states {
            *state &= !SELECTED;
        }
        self.num_selected = 0;
        self.dirty = true;
    }

    /// Mark selected splats deleted
    pub fn delete_selected(&mut self) {
        for state in &mut self.states {
            if *state & SELECTED != 0 {
                *state = (*state | DELETED) & !SELECTED;
                self.num_deleted += 1;
            }
        }
        self.num_selected = 0;
        self.dirty = true;
    }

    pub fn undelete_all(&mut self) {
        for state in &mut self.states {
            *state &= !DELETED;
        }
        self.num_deleted = 0;
        self.dirty = true;
    }

    pub fn lock_selected(&mut self) {
        for state in &mut self.states {
            if *state & SELECTED != 0 {
                *state = (*state | LOCKED) & !SELECTED;
                self.num_locked += 1;
            }
        }
        self.num_selected = 0;
        self.dirty = true;
    }

    pub fn unlock_all(&mut self) {
        for state in &mut self.states {
            *state &= !LOCKED;
        }
        self.num_locked = 0;
        self.dirty = true;
    }

    pub fn selected_indices(&self) -> Vec<u32> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, &s)| s & SELECTED != 0)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.states.get(index).is_some_and(|s| s & DELETED != 0)
    }

    /// Recompute the cached counters from the state array
    pub fn recount(&mut self) {
        self.num_selected = 0;
        self.num_locked = 0;
        self.num_deleted = 0;
        for &state in &self.states {
            if state & SELECTED != 0 { self.num_selected += 1; }
            if state & LOCKED != 0 { self.num_locked += 1; }
            if state & DELETED != 0 { self.num_deleted += 1; }
        }
    }
}
