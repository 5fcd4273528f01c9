//! # IDs
//! Two kinds of identity live here.
//!
//! [`LocalId<T>`] is a process-unique ID namespaced by the type T, used for things that never outlive
//! the process (creation tasks, for instance). Use its `Default` impl to get a fresh one.
//!
//! [`ResourceId`] and [`FrameId`] are numeric IDs which *are* visible to the outside world - resource IDs are
//! persisted, frame IDs are sent to viewers. They are drawn by an [`IdAllocator`] from two disjoint ranges,
//! so that a frame ID can never be mistaken for a resource ID.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// Collection of pending IDs by namespace type.
static ID_SERVER: parking_lot::RwLock<
    std::collections::BTreeMap<std::any::TypeId, AtomicU64>,
> = parking_lot::const_rwlock(std::collections::BTreeMap::new());

/// ID that is guarunteed unique within this execution of the program.
/// IDs with different namespaces may share a value but should not be considered equal.
pub struct LocalId<T: std::any::Any> {
    id: std::num::NonZeroU64,
    _phantom: std::marker::PhantomData<fn() -> T>,
}
impl<T: std::any::Any> Clone for LocalId<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: std::any::Any> Copy for LocalId<T> {}
impl<T: std::any::Any> PartialEq for LocalId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T: std::any::Any> Eq for LocalId<T> {}
impl<T: std::any::Any> std::hash::Hash for LocalId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl<T: std::any::Any> LocalId<T> {
    /// Get the raw numeric value of this ID.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.id.get()
    }
}
impl<T: std::any::Any> Default for LocalId<T> {
    fn default() -> Self {
        let ty = std::any::TypeId::of::<T>();
        let read = ID_SERVER.upgradable_read();
        let id = if let Some(atomic) = read.get(&ty) {
            atomic.fetch_add(1, Ordering::Relaxed)
        } else {
            // First ID of this namespace. Only happens a handful of times per run.
            let mut write = parking_lot::RwLockUpgradableReadGuard::upgrade(read);
            // Another thread may have raced us to the upgrade.
            write
                .entry(ty)
                .or_insert_with(|| AtomicU64::new(1))
                .fetch_add(1, Ordering::Relaxed)
        };
        // 2^64 allocations won't happen within a process lifetime.
        let Some(id) = std::num::NonZeroU64::new(id) else {
            log::error!("{} ID overflow!", std::any::type_name::<T>());
            std::process::abort();
        };
        Self {
            id,
            _phantom: std::marker::PhantomData,
        }
    }
}
impl<T: std::any::Any> std::fmt::Display for LocalId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = std::any::type_name::<T>();
        write!(f, "{}#{}", name.rsplit("::").next().unwrap_or(name), self.id)
    }
}
impl<T: std::any::Any> std::fmt::Debug for LocalId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// First frame ID. Resource IDs live strictly below this, frame IDs at or above.
pub const FRAME_ID_BASE: u32 = 1 << 30;

/// Persistent ID of a registered resource.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ResourceId(u32);
impl ResourceId {
    /// Wrap a raw value, None if it falls within the frame ID range.
    #[must_use]
    pub fn new(raw: u32) -> Option<Self> {
        (raw < FRAME_ID_BASE).then_some(Self(raw))
    }
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}
impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// Identifies one distinct animation frame of one surface.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FrameId(u32);
impl FrameId {
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}
impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    #[error("resource id space exhausted")]
    Exhausted,
}

/// Hands out [`ResourceId`]s and [`FrameId`]s. Shared by the registry and every animation encoder.
pub struct IdAllocator {
    next_resource: AtomicU32,
    next_frame: AtomicU32,
}
impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next_resource: AtomicU32::new(0),
            next_frame: AtomicU32::new(FRAME_ID_BASE),
        }
    }
}
impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Take the next unused resource ID. IDs are never handed out twice, even if the
    /// resource they were given to is deleted.
    pub fn next_resource_id(&self) -> Result<ResourceId, IdError> {
        self.next_resource
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < FRAME_ID_BASE).then_some(next + 1)
            })
            .map(ResourceId)
            .map_err(|_| IdError::Exhausted)
    }
    /// Note that `id` is in use, so that future allocations land past it.
    pub fn observe(&self, id: ResourceId) {
        self.next_resource.fetch_max(id.0 + 1, Ordering::AcqRel);
    }
    /// Peek the ID the next call to [`Self::next_resource_id`] would return.
    #[must_use]
    pub fn peek_resource_id(&self) -> u32 {
        self.next_resource.load(Ordering::Acquire)
    }
    /// Take the next frame ID. Frame IDs are only meaningful for the lifetime of the process,
    /// so on exhaustion the counter wraps back to [`FRAME_ID_BASE`].
    pub fn next_frame_id(&self) -> FrameId {
        let result = self
            .next_frame
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                Some(if next == u32::MAX {
                    FRAME_ID_BASE
                } else {
                    next + 1
                })
            });
        // Closure always returns Some.
        let id = match result {
            Ok(id) | Err(id) => id,
        };
        if id == u32::MAX {
            log::warn!("Frame ID space wrapped around");
        }
        FrameId(id)
    }
}
