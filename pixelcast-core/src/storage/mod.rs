//! # Persistence
//!
//! Everything the pipeline writes to durable storage goes through the [`Storage`] trait: one document per resource,
//! the content-addressed source files backing each resource's lazy images, and the tombstone log.

mod fs;
mod memory;
pub mod tombstones;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::{id::ResourceId, resource::document::ResourceDocument, surface::SurfaceHandle};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{id} has no source {filename:?}")]
    MissingSource { id: ResourceId, filename: String },
    #[error("invalid source filename {0:?}")]
    BadFilename(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub trait Storage: Send + Sync {
    /// Write (or overwrite) the document of a resource.
    fn save_resource_data(
        &self,
        id: ResourceId,
        document: &ResourceDocument,
    ) -> Result<(), StorageError>;
    /// Read the document of a resource, `None` if there isn't one.
    fn load_resource_data(&self, id: ResourceId)
        -> Result<Option<ResourceDocument>, StorageError>;
    /// Remove the document and every source of a resource. Removing something that doesn't exist is not an error.
    fn delete_resource_data(&self, id: ResourceId) -> Result<(), StorageError>;
    /// IDs of every stored resource, in ascending order.
    fn list_resource_ids(&self) -> Result<Vec<ResourceId>, StorageError>;
    /// Store source bytes for a resource, returning the content-addressed filename they can be fetched by.
    /// Storing identical bytes twice yields the same name.
    fn put_source(
        &self,
        id: ResourceId,
        extension: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError>;
    fn get_source(&self, id: ResourceId, filename: &str) -> Result<Vec<u8>, StorageError>;
    /// Remove a source no longer referenced. Removing one that isn't there is not an error.
    fn delete_source(&self, id: ResourceId, filename: &str) -> Result<(), StorageError>;
    /// Every tombstoned surface handle ever recorded.
    fn load_tombstones(&self) -> Result<Vec<SurfaceHandle>, StorageError>;
    fn append_tombstones(&self, handles: &[SurfaceHandle]) -> Result<(), StorageError>;
    /// Resource IDs below this were handed out at some point, even if nothing is stored under them anymore.
    /// Zero if never recorded.
    fn load_next_id(&self) -> Result<u32, StorageError>;
    fn save_next_id(&self, next: u32) -> Result<(), StorageError>;
}

/// Filename under which `bytes` are stored.
#[must_use]
pub fn content_name(bytes: &[u8], extension: &str) -> String {
    format!("{}.{extension}", blake3::hash(bytes).to_hex())
}

/// Reject names that could escape a resource's directory.
pub(crate) fn check_filename(filename: &str) -> Result<(), StorageError> {
    let bad = filename.is_empty()
        || filename.contains(|c: char| c == '/' || c == '\\')
        || filename.starts_with('.')
        || filename.contains("..");
    if bad {
        Err(StorageError::BadFilename(filename.to_owned()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test]
    fn content_names_stable() {
        let a = content_name(b"hello", "png");
        assert_eq!(a, content_name(b"hello", "png"));
        assert_ne!(a, content_name(b"hellp", "png"));
        assert!(a.ends_with(".png"));
    }
    #[test]
    fn filename_checks() {
        assert!(check_filename("abc.png").is_ok());
        for bad in ["", "../x", "a/b", "a\\b", ".hidden"] {
            assert!(check_filename(bad).is_err(), "{bad:?} accepted");
        }
    }
}
