use std::sync::Arc;

use crate::{animation::AnimationTable, id::FrameId, surface::SurfaceHandle};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Delivered and confirmed.
    Known,
    /// Sent or queued, not yet confirmed.
    Pending,
    Unknown,
}

/// What one viewer has of one resource's animation.
#[derive(Default)]
pub struct ViewerKnowledge {
    known: hashbrown::HashSet<FrameId>,
    pending: hashbrown::HashSet<FrameId>,
    /// Frame last displayed on each surface.
    displayed: hashbrown::HashMap<SurfaceHandle, FrameId>,
    editing: bool,
    /// The table the above sets refer to.
    table: std::sync::Weak<AnimationTable>,
}

impl ViewerKnowledge {
    #[must_use]
    pub fn state(&self, frame: FrameId) -> FrameState {
        if self.known.contains(&frame) {
            FrameState::Known
        } else if self.pending.contains(&frame) {
            FrameState::Pending
        } else {
            FrameState::Unknown
        }
    }
    /// Returns false if the frame was already pending or known.
    pub fn mark_pending(&mut self, frame: FrameId) -> bool {
        !self.known.contains(&frame) && self.pending.insert(frame)
    }
    /// A send succeeded. Returns false if the frame wasn't pending, such as after a reset.
    pub fn confirm(&mut self, frame: FrameId) -> bool {
        if self.pending.remove(&frame) {
            self.known.insert(frame);
            true
        } else {
            false
        }
    }
    /// A send failed, so the frame is up for sending again.
    pub fn fail(&mut self, frame: FrameId) -> bool {
        self.pending.remove(&frame)
    }
    /// Point this knowledge at `table`. Frame IDs of a rebuilt table are all new, so everything is forgotten
    /// if it changed. Returns whether it did.
    pub fn observe_table(&mut self, table: &Arc<AnimationTable>) -> bool {
        if std::ptr::eq(self.table.as_ptr(), Arc::as_ptr(table)) {
            return false;
        }
        self.known.clear();
        self.pending.clear();
        self.displayed.clear();
        self.table = Arc::downgrade(table);
        true
    }
    #[must_use]
    pub fn needs_show(&self, surface: SurfaceHandle, frame: FrameId) -> bool {
        self.displayed.get(&surface) != Some(&frame)
    }
    pub fn shown(&mut self, surface: SurfaceHandle, frame: FrameId) {
        self.displayed.insert(surface, frame);
    }
    #[must_use]
    pub fn is_editing(&self) -> bool {
        self.editing
    }
    /// Returns true if this changed the editing state.
    pub fn set_editing(&mut self, editing: bool) -> bool {
        if self.editing == editing {
            return false;
        }
        self.editing = editing;
        // Whatever was on screen got replaced by the reset, or by the edit preview.
        self.displayed.clear();
        true
    }
    #[must_use]
    pub fn known_len(&self) -> usize {
        self.known.len()
    }
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
