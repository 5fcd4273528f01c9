use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::{check_filename, content_name, Storage, StorageError};
use crate::{id::ResourceId, resource::document::ResourceDocument, surface::SurfaceHandle};

/// Storage held entirely in memory. Documents are kept serialized, so what comes back out
/// went through the same serde path as [`super::FsStorage`].
#[derive(Default)]
pub struct MemoryStorage {
    documents: parking_lot::RwLock<std::collections::BTreeMap<ResourceId, String>>,
    sources: parking_lot::RwLock<hashbrown::HashMap<(ResourceId, String), Vec<u8>>>,
    tombstones: parking_lot::Mutex<Vec<SurfaceHandle>>,
    next_id: AtomicU32,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}
impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Make every following document save fail, for exercising rollback paths.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }
    /// Number of successful document saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }
    #[must_use]
    pub fn source_count(&self, id: ResourceId) -> usize {
        self.sources.read().keys().filter(|(key, _)| *key == id).count()
    }
}

impl Storage for MemoryStorage {
    fn save_resource_data(
        &self,
        id: ResourceId,
        document: &ResourceDocument,
    ) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable("saves disabled".to_owned()));
        }
        let json = serde_json::to_string(document)?;
        self.documents.write().insert(id, json);
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn load_resource_data(
        &self,
        id: ResourceId,
    ) -> Result<Option<ResourceDocument>, StorageError> {
        self.documents
            .read()
            .get(&id)
            .map(|json| serde_json::from_str(json))
            .transpose()
            .map_err(Into::into)
    }
    fn delete_resource_data(&self, id: ResourceId) -> Result<(), StorageError> {
        self.documents.write().remove(&id);
        self.sources.write().retain(|(key, _), _| *key != id);
        Ok(())
    }
    fn list_resource_ids(&self) -> Result<Vec<ResourceId>, StorageError> {
        Ok(self.documents.read().keys().copied().collect())
    }
    fn put_source(
        &self,
        id: ResourceId,
        extension: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let filename = content_name(bytes, extension);
        check_filename(&filename)?;
        self.sources
            .write()
            .entry((id, filename.clone()))
            .or_insert_with(|| bytes.to_vec());
        Ok(filename)
    }
    fn get_source(&self, id: ResourceId, filename: &str) -> Result<Vec<u8>, StorageError> {
        check_filename(filename)?;
        self.sources
            .read()
            .get(&(id, filename.to_owned()))
            .cloned()
            .ok_or_else(|| StorageError::MissingSource {
                id,
                filename: filename.to_owned(),
            })
    }
    fn delete_source(&self, id: ResourceId, filename: &str) -> Result<(), StorageError> {
        check_filename(filename)?;
        self.sources.write().remove(&(id, filename.to_owned()));
        Ok(())
    }
    fn load_tombstones(&self) -> Result<Vec<SurfaceHandle>, StorageError> {
        Ok(self.tombstones.lock().clone())
    }
    fn append_tombstones(&self, handles: &[SurfaceHandle]) -> Result<(), StorageError> {
        self.tombstones.lock().extend_from_slice(handles);
        Ok(())
    }
    fn load_next_id(&self) -> Result<u32, StorageError> {
        Ok(self.next_id.load(Ordering::Acquire))
    }
    fn save_next_id(&self, next: u32) -> Result<(), StorageError> {
        self.next_id.store(next, Ordering::Release);
        Ok(())
    }
}
