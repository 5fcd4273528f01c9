//! # Lazy backing data
//!
//! Source data of a resource (the RGBA tiles of a still image, the raw bytes of an animation) is large, and only
//! needed while (re)building the resource's caches. A [`Lazy`] holds it in one of three states:
//!
//! * `Strong` - freshly created, only exists in memory.
//! * `Weak` - persisted, and materialized at some point. The value is kept only as long as someone else holds it.
//! * `Stored` - persisted and not in memory.
//!
//! The transition from memory to storage happens exactly once, via [`Lazy::persist`]. After that the
//! backing location is fixed - trying to move it elsewhere is an error.

use std::sync::{Arc, Weak};

use crate::{
    id::ResourceId,
    storage::{Storage, StorageError},
};

#[derive(thiserror::Error, Debug)]
pub enum LazyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("bad image data: {0}")]
    Image(#[from] image::ImageError),
    #[error("already stored under {stored}, can't move to {requested}")]
    Relocation {
        stored: ResourceId,
        requested: ResourceId,
    },
}

/// Data that can live in a content-addressed source file.
pub trait Backing: Send + Sync + Sized + 'static {
    /// Extension of the stored file.
    const EXTENSION: &'static str;
    fn encode(&self) -> Result<Vec<u8>, LazyError>;
    fn decode(bytes: &[u8]) -> Result<Self, LazyError>;
}

impl Backing for image::RgbaImage {
    const EXTENSION: &'static str = "png";
    fn encode(&self) -> Result<Vec<u8>, LazyError> {
        let mut bytes = std::io::Cursor::new(Vec::new());
        self.write_to(&mut bytes, image::ImageFormat::Png)?;
        Ok(bytes.into_inner())
    }
    fn decode(bytes: &[u8]) -> Result<Self, LazyError> {
        Ok(image::load_from_memory_with_format(bytes, image::ImageFormat::Png)?.into_rgba8())
    }
}

/// Opaque bytes, stored as-is.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Blob(pub Vec<u8>);
impl Backing for Blob {
    const EXTENSION: &'static str = "bin";
    fn encode(&self) -> Result<Vec<u8>, LazyError> {
        Ok(self.0.clone())
    }
    fn decode(bytes: &[u8]) -> Result<Self, LazyError> {
        Ok(Self(bytes.to_vec()))
    }
}

/// Where a value is persisted.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SourceRef {
    pub resource: ResourceId,
    pub filename: String,
}

enum State<T> {
    Strong(Arc<T>),
    Weak { value: Weak<T>, source: SourceRef },
    Stored(SourceRef),
}

pub struct Lazy<T: Backing> {
    state: parking_lot::Mutex<State<T>>,
}
pub type LazyImage = Lazy<image::RgbaImage>;

impl<T: Backing> Lazy<T> {
    #[must_use]
    pub fn strong(value: T) -> Self {
        Self {
            state: parking_lot::Mutex::new(State::Strong(Arc::new(value))),
        }
    }
    /// A value known to exist in storage.
    #[must_use]
    pub fn stored(source: SourceRef) -> Self {
        Self {
            state: parking_lot::Mutex::new(State::Stored(source)),
        }
    }
    /// Where this is stored, or None if it hasn't been persisted yet.
    #[must_use]
    pub fn source(&self) -> Option<SourceRef> {
        match &*self.state.lock() {
            State::Strong(_) => None,
            State::Weak { source, .. } | State::Stored(source) => Some(source.clone()),
        }
    }
    /// Whether the value currently lives in memory.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        match &*self.state.lock() {
            State::Strong(_) => true,
            State::Weak { value, .. } => value.strong_count() > 0,
            State::Stored(_) => false,
        }
    }
    /// Fetch the value, reading it from `storage` if it isn't in memory.
    pub fn get(&self, storage: &dyn Storage) -> Result<Arc<T>, LazyError> {
        let source = {
            let state = self.state.lock();
            match &*state {
                State::Strong(value) => return Ok(value.clone()),
                State::Weak { value, source } => match value.upgrade() {
                    Some(value) => return Ok(value),
                    None => source.clone(),
                },
                State::Stored(source) => source.clone(),
            }
        };
        // Read without holding the lock, racing readers just both decode.
        let bytes = storage.get_source(source.resource, &source.filename)?;
        let value = Arc::new(T::decode(&bytes)?);
        let mut state = self.state.lock();
        // Only cache if nobody changed the state under us.
        let unchanged = match &*state {
            State::Stored(current) | State::Weak { source: current, .. } => *current == source,
            State::Strong(_) => false,
        };
        if unchanged {
            *state = State::Weak {
                value: Arc::downgrade(&value),
                source,
            };
        }
        Ok(value)
    }
    /// Write the value to storage under `resource`, dropping the strong reference.
    /// Persisting again to the same resource is a no-op, to any other is an error.
    pub fn persist(
        &self,
        resource: ResourceId,
        storage: &dyn Storage,
    ) -> Result<SourceRef, LazyError> {
        let mut state = self.state.lock();
        match &*state {
            State::Strong(value) => {
                let value = value.clone();
                let bytes = value.encode()?;
                let filename = storage.put_source(resource, T::EXTENSION, &bytes)?;
                let source = SourceRef { resource, filename };
                *state = State::Weak {
                    value: Arc::downgrade(&value),
                    source: source.clone(),
                };
                Ok(source)
            }
            State::Weak { source, .. } | State::Stored(source) => {
                if source.resource == resource {
                    Ok(source.clone())
                } else {
                    Err(LazyError::Relocation {
                        stored: source.resource,
                        requested: resource,
                    })
                }
            }
        }
    }
    /// Copy into a fresh, unpersisted value. Used when cloning a resource, whose copy needs
    /// its own backing location.
    pub fn detach(&self, storage: &dyn Storage) -> Result<Self, LazyError>
    where
        T: Clone,
    {
        let value = self.get(storage)?;
        Ok(Self::strong(T::clone(&value)))
    }
}

impl<T: Backing> std::fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.lock() {
            State::Strong(_) => f.write_str("Lazy::Strong"),
            State::Weak { source, .. } => write!(f, "Lazy::Weak({})", source.filename),
            State::Stored(source) => write!(f, "Lazy::Stored({})", source.filename),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryStorage;

    fn id(raw: u32) -> ResourceId {
        ResourceId::new(raw).unwrap()
    }

    #[test]
    fn persist_once() {
        let storage = MemoryStorage::new();
        let lazy = Lazy::strong(Blob(vec![1, 2, 3]));
        assert!(lazy.source().is_none());
        let first = lazy.persist(id(1), &storage).unwrap();
        let again = lazy.persist(id(1), &storage).unwrap();
        assert_eq!(first, again);
        assert!(matches!(
            lazy.persist(id(2), &storage),
            Err(LazyError::Relocation { .. })
        ));
        assert_eq!(storage.source_count(id(1)), 1);
    }
    #[test]
    fn weak_then_reload() {
        let storage = MemoryStorage::new();
        let lazy = Lazy::strong(Blob(vec![9; 16]));
        let held = lazy.get(&storage).unwrap();
        lazy.persist(id(0), &storage).unwrap();
        // Still alive through `held`.
        assert!(lazy.is_materialized());
        drop(held);
        assert!(!lazy.is_materialized());
        assert_eq!(lazy.get(&storage).unwrap().0, vec![9; 16]);
    }
    #[test]
    fn stored_missing_source() {
        let storage = MemoryStorage::new();
        let lazy: Lazy<Blob> = Lazy::stored(SourceRef {
            resource: id(5),
            filename: "gone.bin".to_owned(),
        });
        assert!(matches!(
            lazy.get(&storage),
            Err(LazyError::Storage(StorageError::MissingSource { .. }))
        ));
    }
    #[test]
    fn image_roundtrip_through_png() {
        let storage = MemoryStorage::new();
        let image = image::RgbaImage::from_fn(4, 4, |x, y| image::Rgba([x as u8, y as u8, 7, 255]));
        let lazy = LazyImage::strong(image.clone());
        let source = lazy.persist(id(3), &storage).unwrap();
        assert!(source.filename.ends_with(".png"));
        let reloaded = LazyImage::stored(source);
        assert_eq!(*reloaded.get(&storage).unwrap(), image);
    }
    #[test]
    fn detached_copy_is_unpersisted() {
        let storage = MemoryStorage::new();
        let lazy = Lazy::strong(Blob(vec![4]));
        lazy.persist(id(1), &storage).unwrap();
        let copy = lazy.detach(&storage).unwrap();
        assert!(copy.source().is_none());
        copy.persist(id(2), &storage).unwrap();
    }
}
