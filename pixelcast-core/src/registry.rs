//! # Surface registry
//!
//! Owns every live resource, indexed both by ID and by each of its surfaces, plus the set of tombstoned surfaces.
//! Mutations (register, delete, rename, reassign) are serialized by a single lock, since they must keep both
//! indexes in step. Lookups go straight to the sharded maps and never wait on a mutation.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::{
    id::{IdAllocator, IdError, ResourceId},
    painter::PaintQueue,
    resource::{LoadContext, LoadError, Resource, ResourceError},
    sink::OwnerId,
    storage::{Storage, StorageError},
    surface::SurfaceHandle,
};

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("owner already has a resource named {0:?}")]
    DuplicateName(String),
    #[error("{0} belongs to another resource")]
    SurfaceInUse(SurfaceHandle),
    #[error("{0} was tombstoned")]
    SurfaceTombstoned(SurfaceHandle),
    #[error("{0} is already registered")]
    IdInUse(ResourceId),
    #[error("no resource {0}")]
    NotFound(ResourceId),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Registry {
    write_lock: parking_lot::Mutex<()>,
    by_id: DashMap<ResourceId, Arc<Resource>>,
    by_surface: DashMap<SurfaceHandle, Arc<Resource>>,
    tombstones: DashSet<SurfaceHandle>,
    ids: Arc<IdAllocator>,
    storage: Arc<dyn Storage>,
    painter: PaintQueue,
}

impl Registry {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, ids: Arc<IdAllocator>, painter: PaintQueue) -> Self {
        Self {
            write_lock: parking_lot::Mutex::new(()),
            by_id: DashMap::new(),
            by_surface: DashMap::new(),
            tombstones: DashSet::new(),
            ids,
            storage,
            painter,
        }
    }
    #[must_use]
    pub fn ids(&self) -> &Arc<IdAllocator> {
        &self.ids
    }

    // ---- Reads

    #[must_use]
    pub fn lookup_by_id(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }
    #[must_use]
    pub fn lookup_by_surface(&self, surface: SurfaceHandle) -> Option<Arc<Resource>> {
        self.by_surface.get(&surface).map(|entry| entry.value().clone())
    }
    /// Resources of `owner` accepted by `filter`, in ID order.
    #[must_use]
    pub fn list_by_owner(
        &self,
        owner: OwnerId,
        filter: impl Fn(&Resource) -> bool,
    ) -> Vec<Arc<Resource>> {
        let mut found: Vec<_> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().owner() == owner && filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|resource| resource.id());
        found
    }
    /// Resource of `owner` with the given name, compared case-insensitively.
    #[must_use]
    pub fn find_by_name(&self, owner: OwnerId, name: &str) -> Option<Arc<Resource>> {
        self.by_id
            .iter()
            .find(|entry| {
                entry.value().owner() == owner && crate::util::names_match(&entry.value().name(), name)
            })
            .map(|entry| entry.value().clone())
    }
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Resource>> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
    #[must_use]
    pub fn is_tombstoned(&self, surface: SurfaceHandle) -> bool {
        self.tombstones.contains(&surface)
    }
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
    #[must_use]
    pub fn tombstones(&self) -> Vec<SurfaceHandle> {
        self.tombstones.iter().map(|surface| *surface).collect()
    }

    // ---- Mutations

    /// Check a resource can be indexed, and give it an ID if it has none.
    /// Returns the ID and whether it was freshly allocated.
    fn admit(&self, resource: &Resource) -> Result<(ResourceId, bool), RegistryError> {
        let name = resource.name();
        if self.find_by_name(resource.owner(), &name).is_some() {
            return Err(RegistryError::DuplicateName(name));
        }
        for surface in resource.surfaces() {
            if self.by_surface.contains_key(surface) {
                return Err(RegistryError::SurfaceInUse(*surface));
            }
            if resource.tombstones_surfaces() && self.tombstones.contains(surface) {
                return Err(RegistryError::SurfaceTombstoned(*surface));
            }
        }
        match resource.id() {
            Some(id) => {
                if self.by_id.contains_key(&id) {
                    return Err(RegistryError::IdInUse(id));
                }
                self.ids.observe(id);
                Ok((id, false))
            }
            None => {
                let id = self.ids.next_resource_id()?;
                if resource.assign_id(id).is_err() {
                    // Someone raced an ID onto an unregistered resource. Not supposed to happen.
                    log::error!("Resource gained an ID mid-registration");
                    return Err(RegistryError::IdInUse(id));
                }
                Ok((id, true))
            }
        }
    }
    fn index(&self, id: ResourceId, resource: &Arc<Resource>) {
        self.by_id.insert(id, resource.clone());
        for surface in resource.surfaces() {
            self.by_surface.insert(*surface, resource.clone());
        }
    }
    fn unindex(&self, id: ResourceId, resource: &Arc<Resource>) {
        self.by_id.remove(&id);
        for surface in resource.surfaces() {
            self.by_surface
                .remove_if(surface, |_, owner| Arc::ptr_eq(owner, resource));
        }
    }
    /// Index and persist a resource, assigning its ID if it has none. If it can't be persisted,
    /// it is unindexed again and the error returned.
    pub fn register(&self, resource: Arc<Resource>) -> Result<ResourceId, RegistryError> {
        let _lock = self.write_lock.lock();
        let (id, fresh) = self.admit(&resource)?;
        self.index(id, &resource);
        if let Err(e) = resource.save() {
            self.unindex(id, &resource);
            if fresh {
                // A retry gets a new ID, so nothing may stay tied to this one.
                if let Err(release) = resource.release_id() {
                    log::warn!("Couldn't take back sources written under {id}: {release}");
                }
                if let Err(cleanup) = self.storage.delete_resource_data(id) {
                    log::warn!("Couldn't clean up after failed registration of {id}: {cleanup}");
                }
            }
            return Err(e.into());
        }
        log::info!(
            "Registered {id} {:?} ({} surfaces)",
            resource.name(),
            resource.surfaces().len()
        );
        Ok(id)
    }
    /// Index a resource that was loaded from storage, without writing it back.
    pub fn restore(&self, resource: Arc<Resource>) -> Result<ResourceId, RegistryError> {
        let _lock = self.write_lock.lock();
        let (id, _) = self.admit(&resource)?;
        self.index(id, &resource);
        Ok(id)
    }
    /// Read back tombstones and every stored resource. Resources that fail to load are logged and skipped.
    pub fn load_all(&self, context: &LoadContext) -> Result<Vec<Arc<Resource>>, RegistryError> {
        let tombstones = self.storage.load_tombstones()?;
        let tombstone_count = tombstones.len();
        for surface in tombstones {
            self.tombstones.insert(surface);
        }
        log::info!("Loaded {tombstone_count} tombstones");
        // IDs of deleted resources left no document behind, but still mustn't be handed out again.
        if let Some(last) = self.storage.load_next_id()?.checked_sub(1).and_then(ResourceId::new) {
            self.ids.observe(last);
        }

        let mut loaded = Vec::new();
        for id in self.storage.list_resource_ids()? {
            let document = match self.storage.load_resource_data(id) {
                Ok(Some(document)) => document,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Couldn't read {id}: {e}");
                    continue;
                }
            };
            if document.id != id {
                log::error!("{id} holds the document of {}, skipping", document.id);
                continue;
            }
            let restored = Resource::from_document(document, context.clone())
                .map_err(RegistryError::from)
                .map(Arc::new)
                .and_then(|resource| {
                    self.restore(resource.clone())?;
                    Ok(resource)
                });
            match restored {
                Ok(resource) => loaded.push(resource),
                Err(e) => log::error!("Couldn't restore {id}: {e}"),
            }
        }
        log::info!("Restored {} resources", loaded.len());
        Ok(loaded)
    }
    /// Unregister a resource, tombstone its surfaces and delete its storage.
    pub fn delete(&self, id: ResourceId) -> Result<Arc<Resource>, RegistryError> {
        let _lock = self.write_lock.lock();
        let resource = self.lookup_by_id(id).ok_or(RegistryError::NotFound(id))?;
        self.unindex(id, &resource);
        resource.invalidate();

        let surfaces = resource.surfaces();
        if resource.tombstones_surfaces() {
            for surface in surfaces {
                self.tombstones.insert(*surface);
            }
            if let Err(e) = self.storage.append_tombstones(surfaces) {
                log::error!("Failed to record tombstones of {id}: {e}");
            }
            self.painter.schedule(surfaces);
        }
        if let Err(e) = self.storage.save_next_id(self.ids.peek_resource_id()) {
            log::error!("Failed to record ID watermark: {e}");
        }
        if let Err(e) = self.storage.delete_resource_data(id) {
            log::error!("Failed to delete storage of {id}: {e}");
        }
        log::info!("Deleted {id} {:?}", resource.name());
        Ok(resource)
    }
    /// Rename, keeping names unique per owner.
    pub fn rename(&self, id: ResourceId, name: &str) -> Result<(), RegistryError> {
        let _lock = self.write_lock.lock();
        let resource = self.lookup_by_id(id).ok_or(RegistryError::NotFound(id))?;
        if let Some(other) = self.find_by_name(resource.owner(), name) {
            // Changing only the case of its own name is fine.
            if !Arc::ptr_eq(&other, &resource) {
                return Err(RegistryError::DuplicateName(name.to_owned()));
            }
        }
        resource.set_name(name.to_owned())?;
        Ok(())
    }
    /// Hand a resource to another owner, who mustn't already have one of the same name.
    pub fn reassign_owner(&self, id: ResourceId, owner: OwnerId) -> Result<(), RegistryError> {
        let _lock = self.write_lock.lock();
        let resource = self.lookup_by_id(id).ok_or(RegistryError::NotFound(id))?;
        if resource.owner() == owner {
            return Ok(());
        }
        let name = resource.name();
        if self.find_by_name(owner, &name).is_some() {
            return Err(RegistryError::DuplicateName(name));
        }
        resource.set_owner(owner)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        dither::DitherKind,
        lazy::{Blob, Lazy},
        painter::paint_channel,
        resource::{
            test::{baked, context},
            Media, NewResource,
        },
        storage::MemoryStorage,
        surface::SURFACE_BYTES,
    };

    struct Fixture {
        storage: Arc<MemoryStorage>,
        context: LoadContext,
        registry: Registry,
        painted: crossbeam::channel::Receiver<SurfaceHandle>,
    }
    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let context = context(storage.clone());
        let (queue, painted) = paint_channel();
        let registry = Registry::new(storage.clone(), context.ids.clone(), queue);
        Fixture {
            storage,
            context,
            registry,
            painted,
        }
    }
    fn handles(range: std::ops::Range<u32>) -> Vec<SurfaceHandle> {
        range.map(SurfaceHandle).collect()
    }

    #[test]
    fn ids_monotonic_and_indexed() {
        let f = fixture();
        let owner = uuid::Uuid::new_v4();
        let a = f
            .registry
            .register(Arc::new(baked(&f.context, "a", owner, handles(0..2), 1)))
            .unwrap();
        let b = f
            .registry
            .register(Arc::new(baked(&f.context, "b", owner, handles(2..3), 1)))
            .unwrap();
        assert!(b > a);
        assert_eq!(f.registry.lookup_by_surface(SurfaceHandle(1)).unwrap().id(), Some(a));
        assert_eq!(f.registry.lookup_by_surface(SurfaceHandle(2)).unwrap().id(), Some(b));
        assert_eq!(f.registry.list_by_owner(owner, |_| true).len(), 2);
        assert_eq!(
            f.registry
                .list_by_owner(owner, |r| r.name().starts_with('b'))
                .len(),
            1
        );
        assert_eq!(f.storage.save_count(), 2);
    }
    #[test]
    fn duplicate_names_rejected_per_owner() {
        let f = fixture();
        let owner = uuid::Uuid::new_v4();
        f.registry
            .register(Arc::new(baked(&f.context, "Sunset", owner, handles(0..1), 1)))
            .unwrap();
        let again = f
            .registry
            .register(Arc::new(baked(&f.context, "sunset", owner, handles(1..2), 1)));
        assert!(matches!(again, Err(RegistryError::DuplicateName(_))));
        // Another owner may use it.
        f.registry
            .register(Arc::new(baked(
                &f.context,
                "sunset",
                uuid::Uuid::new_v4(),
                handles(1..2),
                1,
            )))
            .unwrap();
    }
    #[test]
    fn surface_conflicts() {
        let f = fixture();
        f.registry
            .register(Arc::new(baked(&f.context, "a", uuid::Uuid::nil(), handles(0..2), 1)))
            .unwrap();
        let clash = f
            .registry
            .register(Arc::new(baked(&f.context, "b", uuid::Uuid::nil(), handles(1..3), 1)));
        assert!(matches!(clash, Err(RegistryError::SurfaceInUse(SurfaceHandle(1)))));
    }
    #[test]
    fn failed_save_rolls_back() {
        let f = fixture();
        f.storage.set_fail_saves(true);
        let result = f
            .registry
            .register(Arc::new(baked(&f.context, "a", uuid::Uuid::nil(), handles(0..2), 1)));
        assert!(result.is_err());
        assert!(f.registry.is_empty());
        assert!(f.registry.lookup_by_surface(SurfaceHandle(0)).is_none());
        // Persisted sources were cleaned up.
        assert_eq!(f.storage.source_count(ResourceId::new(0).unwrap()), 0);

        f.storage.set_fail_saves(false);
        let id = f
            .registry
            .register(Arc::new(baked(&f.context, "a", uuid::Uuid::nil(), handles(0..2), 1)))
            .unwrap();
        // The ID burnt by the failed attempt isn't reused.
        assert_eq!(id.get(), 1);
    }
    #[test]
    fn retry_after_failed_save_takes_fresh_id() {
        let f = fixture();
        let resource = Arc::new(baked(&f.context, "a", uuid::Uuid::nil(), handles(0..2), 7));
        f.storage.set_fail_saves(true);
        assert!(f.registry.register(resource.clone()).is_err());
        assert_eq!(resource.id(), None);

        f.storage.set_fail_saves(false);
        let id = f.registry.register(resource.clone()).unwrap();
        assert_eq!(id.get(), 1);
        assert_eq!(resource.id(), Some(id));
        assert_eq!(f.storage.source_count(ResourceId::new(0).unwrap()), 0);
        assert_eq!(f.storage.source_count(id), 1);
        assert!(f.storage.load_resource_data(id).unwrap().is_some());
        assert_eq!(resource.surface_pixels(1).unwrap()[0], 7);
    }
    #[test]
    fn delete_tombstones() {
        let f = fixture();
        let id = f
            .registry
            .register(Arc::new(baked(&f.context, "a", uuid::Uuid::nil(), handles(0..3), 1)))
            .unwrap();
        let resource = f.registry.delete(id).unwrap();
        assert!(!resource.is_valid());
        assert!(f.registry.lookup_by_id(id).is_none());
        for surface in handles(0..3) {
            assert!(f.registry.is_tombstoned(surface));
            assert!(f.registry.lookup_by_surface(surface).is_none());
        }
        assert_eq!(f.storage.load_tombstones().unwrap(), handles(0..3));
        assert!(f.storage.load_resource_data(id).unwrap().is_none());
        // The watermark survives a restart even with nothing left stored.
        assert_eq!(f.storage.load_next_id().unwrap(), id.get() + 1);
        assert_eq!(f.painted.try_iter().count(), 3);

        // Never reused, neither the ID nor the surfaces.
        let reuse = f
            .registry
            .register(Arc::new(baked(&f.context, "b", uuid::Uuid::nil(), handles(2..4), 1)));
        assert!(matches!(
            reuse,
            Err(RegistryError::SurfaceTombstoned(SurfaceHandle(2)))
        ));
        let next = f
            .registry
            .register(Arc::new(baked(&f.context, "b", uuid::Uuid::nil(), handles(4..5), 1)))
            .unwrap();
        assert!(next > id);
        assert!(matches!(f.registry.delete(id), Err(RegistryError::NotFound(_))));
    }
    #[test]
    fn delete_overlay_leaves_surfaces_alone() {
        let f = fixture();
        let palettes = (0..2)
            .map(|_| Lazy::strong(Blob(vec![3; SURFACE_BYTES])))
            .collect();
        let overlay = Resource::new(
            NewResource {
                name: "overlay".to_owned(),
                owner: uuid::Uuid::nil(),
                width: 2,
                height: 1,
                ditherer: DitherKind::default(),
                surfaces: handles(0..2),
                media: Media::Overlay { palettes },
            },
            f.context.clone(),
            None,
        )
        .unwrap();
        let id = f.registry.register(Arc::new(overlay)).unwrap();
        f.registry.delete(id).unwrap();

        assert!(f.painted.try_iter().next().is_none());
        assert!(f.storage.load_tombstones().unwrap().is_empty());
        assert!(!f.registry.is_tombstoned(SurfaceHandle(0)));
    }
    #[test]
    fn rename_and_reassign() {
        let f = fixture();
        let (alice, bob) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        let a = f
            .registry
            .register(Arc::new(baked(&f.context, "a", alice, handles(0..1), 1)))
            .unwrap();
        f.registry
            .register(Arc::new(baked(&f.context, "b", alice, handles(1..2), 1)))
            .unwrap();
        f.registry
            .register(Arc::new(baked(&f.context, "c", bob, handles(2..3), 1)))
            .unwrap();

        assert!(matches!(
            f.registry.rename(a, "B"),
            Err(RegistryError::DuplicateName(_))
        ));
        f.registry.rename(a, "A").unwrap();
        f.registry.rename(a, "c").unwrap();
        assert!(matches!(
            f.registry.reassign_owner(a, bob),
            Err(RegistryError::DuplicateName(_))
        ));
        f.registry.rename(a, "d").unwrap();
        f.registry.reassign_owner(a, bob).unwrap();
        let resource = f.registry.lookup_by_id(a).unwrap();
        assert_eq!(resource.owner(), bob);
        assert!(resource.has_permission(bob, crate::permission::PermissionLevel::All));
        assert!(!resource.has_permission(alice, crate::permission::PermissionLevel::Get));
        let stored = f.storage.load_resource_data(a).unwrap().unwrap();
        assert_eq!(stored.owner, bob);
        assert_eq!(stored.name, "d");
    }
    #[test]
    fn reload_preserves_ids() {
        let f = fixture();
        let owner = uuid::Uuid::new_v4();
        let a = f
            .registry
            .register(Arc::new(baked(&f.context, "a", owner, handles(0..1), 1)))
            .unwrap();
        let b = f
            .registry
            .register(Arc::new(baked(&f.context, "b", owner, handles(1..2), 1)))
            .unwrap();
        f.registry.delete(a).unwrap();

        // A fresh process over the same storage.
        let context = context(f.storage.clone());
        let (queue, _painted) = paint_channel();
        let registry = Registry::new(f.storage.clone(), context.ids.clone(), queue);
        let loaded = registry.load_all(&context).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(registry.lookup_by_id(b).unwrap().name(), "b");
        assert!(registry.is_tombstoned(SurfaceHandle(0)));
        let next = registry
            .register(Arc::new(baked(&context, "c", owner, handles(2..3), 1)))
            .unwrap();
        assert!(next > b);
    }
}
