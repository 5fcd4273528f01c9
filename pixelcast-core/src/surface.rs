//! Surfaces are the fixed-size tiles a resource is made of, each known to the outside world by a [`SurfaceHandle`].

use std::sync::atomic::{AtomicU32, Ordering};

/// Width and height of every surface, in pixels.
pub const SURFACE_SIZE: u32 = 128;
/// Length of the palette-index buffer of one surface.
pub const SURFACE_BYTES: usize = (SURFACE_SIZE * SURFACE_SIZE) as usize;

/// Persistent external handle of one surface.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SurfaceHandle(pub u32);
impl std::fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("surface handle space exhausted")]
    Exhausted,
    #[error("surface allocation refused: {0}")]
    Refused(String),
}

/// Source of fresh surface handles. The placement layer owns this - it may need to hop
/// onto a serialized context to mint handles, so implementations are allowed to block.
pub trait SurfaceAllocator: Send + Sync {
    fn allocate(&self, count: usize) -> Result<Vec<SurfaceHandle>, AllocationError>;
    /// Note that `handle` is already in use (restored from storage, or tombstoned).
    fn observe(&self, _handle: SurfaceHandle) {}
}

/// Hands out handles counting up, never reusing one.
#[derive(Default)]
pub struct SequentialAllocator {
    next: AtomicU32,
}
impl SequentialAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }
}
impl SurfaceAllocator for SequentialAllocator {
    fn allocate(&self, count: usize) -> Result<Vec<SurfaceHandle>, AllocationError> {
        let count = u32::try_from(count).map_err(|_| AllocationError::Exhausted)?;
        let start = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(count)
            })
            .map_err(|_| AllocationError::Exhausted)?;
        Ok((start..start + count).map(SurfaceHandle).collect())
    }
    fn observe(&self, handle: SurfaceHandle) {
        self.next
            .fetch_max(handle.0.saturating_add(1), Ordering::AcqRel);
    }
}
