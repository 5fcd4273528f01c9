//! Directory-backed storage.
//!
//! ```text
//! <root>/resources/<id>/data.json
//! <root>/resources/<id>/<blake3>.<ext>
//! <root>/tombstones.bin
//! <root>/next_id
//! <root>/deleted.json      (legacy, migrated on first load)
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use super::{check_filename, content_name, tombstones, Storage, StorageError};
use crate::{id::ResourceId, resource::document::ResourceDocument, surface::SurfaceHandle};

const DATA_FILE: &str = "data.json";
const TOMBSTONE_FILE: &str = "tombstones.bin";
const LEGACY_TOMBSTONE_FILE: &str = "deleted.json";
const NEXT_ID_FILE: &str = "next_id";

pub struct FsStorage {
    root: PathBuf,
    // Appends and the legacy migration must not interleave.
    tombstone_lock: parking_lot::Mutex<()>,
}
impl FsStorage {
    /// Open (creating if needed) storage rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("resources"))?;
        Ok(Self {
            root,
            tombstone_lock: parking_lot::Mutex::new(()),
        })
    }
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
    fn resource_dir(&self, id: ResourceId) -> PathBuf {
        self.root.join("resources").join(id.get().to_string())
    }
    /// Write to a sibling temp file then rename over, so a crash never leaves a half-written file.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, path)?;
        Ok(())
    }
    fn append_log(&self, handles: &[SurfaceHandle]) -> Result<(), StorageError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(TOMBSTONE_FILE))?;
        file.write_all(&tombstones::encode(handles))?;
        file.sync_data()?;
        Ok(())
    }
    /// Fold the legacy JSON tombstone list into the log, then remove it.
    fn migrate_legacy(&self) -> Result<(), StorageError> {
        let legacy = self.root.join(LEGACY_TOMBSTONE_FILE);
        let json = match std::fs::read_to_string(&legacy) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let handles = tombstones::decode_legacy(&json)?;
        self.append_log(&handles)?;
        std::fs::remove_file(&legacy)?;
        log::info!("Migrated {} legacy tombstones", handles.len());
        Ok(())
    }
}

impl Storage for FsStorage {
    fn save_resource_data(
        &self,
        id: ResourceId,
        document: &ResourceDocument,
    ) -> Result<(), StorageError> {
        let dir = self.resource_dir(id);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(document)?;
        Self::write_atomic(&dir.join(DATA_FILE), &json)
    }
    fn load_resource_data(
        &self,
        id: ResourceId,
    ) -> Result<Option<ResourceDocument>, StorageError> {
        match std::fs::read(self.resource_dir(id).join(DATA_FILE)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn delete_resource_data(&self, id: ResourceId) -> Result<(), StorageError> {
        match std::fs::remove_dir_all(self.resource_dir(id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
    fn list_resource_ids(&self) -> Result<Vec<ResourceId>, StorageError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.root.join("resources"))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            // Anything that isn't a numeric dir isn't ours.
            let id = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
                .and_then(ResourceId::new);
            match id {
                Some(id) => ids.push(id),
                None => log::debug!("Skipping foreign entry {:?}", entry.path()),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
    fn put_source(
        &self,
        id: ResourceId,
        extension: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        let filename = content_name(bytes, extension);
        check_filename(&filename)?;
        let dir = self.resource_dir(id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&filename);
        // Content addressed - if it's there, it's already right.
        if !path.exists() {
            Self::write_atomic(&path, bytes)?;
        }
        Ok(filename)
    }
    fn get_source(&self, id: ResourceId, filename: &str) -> Result<Vec<u8>, StorageError> {
        check_filename(filename)?;
        match std::fs::read(self.resource_dir(id).join(filename)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::MissingSource {
                    id,
                    filename: filename.to_owned(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
    fn delete_source(&self, id: ResourceId, filename: &str) -> Result<(), StorageError> {
        check_filename(filename)?;
        match std::fs::remove_file(self.resource_dir(id).join(filename)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
    fn load_tombstones(&self) -> Result<Vec<SurfaceHandle>, StorageError> {
        let _lock = self.tombstone_lock.lock();
        self.migrate_legacy()?;
        match std::fs::read(self.root.join(TOMBSTONE_FILE)) {
            Ok(bytes) => Ok(tombstones::decode(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
    fn append_tombstones(&self, handles: &[SurfaceHandle]) -> Result<(), StorageError> {
        if handles.is_empty() {
            return Ok(());
        }
        let _lock = self.tombstone_lock.lock();
        self.append_log(handles)
    }
    fn load_next_id(&self) -> Result<u32, StorageError> {
        match std::fs::read_to_string(self.root.join(NEXT_ID_FILE)) {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|_| StorageError::Unavailable(format!("corrupt {NEXT_ID_FILE}: {text:?}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
    fn save_next_id(&self, next: u32) -> Result<(), StorageError> {
        Self::write_atomic(&self.root.join(NEXT_ID_FILE), next.to_string().as_bytes())
    }
}
