//! # Resources
//!
//! A resource is a named, owned grid of surfaces showing one image (or animation). Its geometry and surfaces
//! are fixed at creation. Everything else (name, owner, permissions, markers, playback, even the media itself)
//! may change afterwards, and every such change is persisted *before* it becomes visible in memory - if the write
//! fails, the resource is left as it was.

pub mod document;
pub mod media;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crate::{
    animation::{AnimationError, AnimationTable},
    config::Limits,
    dither::DitherKind,
    id::{IdAllocator, ResourceId},
    lazy::{LazyError, SourceRef},
    marker::{Marker, MarkerError, MarkerSets},
    media::MediaError,
    permission::{AccessControl, PermissionLevel},
    storage::{Storage, StorageError},
    surface::SurfaceHandle,
};
use document::{ResourceDocument, DOCUMENT_VERSION};
pub use media::{ColorCache, Geometry, Media};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Lazy(#[from] LazyError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Animation(#[from] AnimationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("expected {expected} surfaces, found {got}")]
    Shape { expected: usize, got: usize },
    #[error("palette buffer is {0} bytes")]
    BadPalette(usize),
    #[error("unsupported document version {0}")]
    Version(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("resource is not registered")]
    Unregistered,
    #[error("resource has been deleted")]
    Invalidated,
    #[error("{0} media can't be updated")]
    NotUpdatable(&'static str),
}

/// What a resource needs to load and persist itself.
#[derive(Clone)]
pub struct LoadContext {
    pub storage: Arc<dyn Storage>,
    pub ids: Arc<IdAllocator>,
    pub limits: Limits,
}

/// Animation playback position. Ticks are those of the distribution engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Playback {
    /// Tick at which playback was paused.
    pub paused_at: Option<u64>,
    /// Added to the global tick to get this animation's tick.
    pub offset: u64,
}
impl Playback {
    /// Animation tick to show at global tick `now`.
    #[must_use]
    pub fn tick_at(&self, now: u64) -> u64 {
        self.paused_at.unwrap_or(now).wrapping_add(self.offset)
    }
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
    pub fn pause(&mut self, now: u64) {
        self.paused_at.get_or_insert(now);
    }
    /// Continue from the frame that was paused on.
    pub fn resume(&mut self, now: u64) {
        if let Some(paused_at) = self.paused_at.take() {
            self.offset = self.offset.wrapping_add(paused_at).wrapping_sub(now);
        }
    }
}

/// The mutable, non-media properties of a resource.
#[derive(Clone, Debug)]
pub struct ResourceMeta {
    pub name: String,
    pub owner: uuid::Uuid,
    pub access: AccessControl,
    pub markers: MarkerSets,
    pub playback: Playback,
}


/// Everything needed to construct a fresh, unregistered resource.
pub struct NewResource {
    pub name: String,
    pub owner: uuid::Uuid,
    pub width: u32,
    pub height: u32,
    pub ditherer: DitherKind,
    pub surfaces: Vec<SurfaceHandle>,
    pub media: Media,
}

pub struct Resource {
    id: parking_lot::RwLock<Option<ResourceId>>,
    valid: AtomicBool,
    geometry: Geometry,
    creation_time: chrono::DateTime<chrono::Utc>,
    surfaces: Vec<SurfaceHandle>,
    // Lock order: meta before media before cache.
    meta: parking_lot::RwLock<ResourceMeta>,
    media: parking_lot::RwLock<Media>,
    cache: parking_lot::RwLock<Option<ColorCache>>,
    /// Outstanding [`CacheLock`]s. Automatic cache transitions are suspended while nonzero.
    cache_locks: AtomicUsize,
    context: LoadContext,
}

/// Suspends automatic cache transitions of a resource while held.
pub struct CacheLock<'a> {
    resource: &'a Resource,
}
impl Drop for CacheLock<'_> {
    fn drop(&mut self) {
        self.resource.cache_locks.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Resource {
    /// Build a new resource. It has no ID until registered.
    pub fn new(
        new: NewResource,
        context: LoadContext,
        colors: Option<ColorCache>,
    ) -> Result<Self, LoadError> {
        let geometry = Geometry {
            width: new.width,
            height: new.height,
            ditherer: new.ditherer,
        };
        let tiles = geometry.tiles();
        if new.surfaces.len() != tiles {
            return Err(LoadError::Shape {
                expected: tiles,
                got: new.surfaces.len(),
            });
        }
        new.media.check_shape(tiles)?;
        Ok(Self {
            id: parking_lot::RwLock::new(None),
            valid: AtomicBool::new(true),
            geometry,
            creation_time: chrono::Utc::now(),
            surfaces: new.surfaces,
            meta: parking_lot::RwLock::new(ResourceMeta {
                name: new.name,
                owner: new.owner,
                access: AccessControl::new(),
                markers: MarkerSets::new(tiles),
                playback: Playback::default(),
            }),
            media: parking_lot::RwLock::new(new.media),
            cache: parking_lot::RwLock::new(colors),
            cache_locks: AtomicUsize::new(0),
            context,
        })
    }
    /// Reconstruct a persisted resource, keeping its ID. Sources are read lazily.
    pub fn from_document(document: ResourceDocument, context: LoadContext) -> Result<Self, LoadError> {
        if document.version > DOCUMENT_VERSION {
            return Err(LoadError::Version(document.version));
        }
        let geometry = Geometry {
            width: document.width,
            height: document.height,
            ditherer: document.ditherer,
        };
        let tiles = geometry.tiles();
        if document.surfaces.len() != tiles {
            return Err(LoadError::Shape {
                expected: tiles,
                got: document.surfaces.len(),
            });
        }
        let markers = if document.markers.is_empty() {
            MarkerSets::new(tiles)
        } else if document.markers.len() == tiles {
            MarkerSets::from_sets(document.markers)
        } else {
            return Err(LoadError::Shape {
                expected: tiles,
                got: document.markers.len(),
            });
        };
        let media = Media::from_document(&document.media, document.id);
        media.check_shape(tiles)?;
        Ok(Self {
            id: parking_lot::RwLock::new(Some(document.id)),
            valid: AtomicBool::new(true),
            geometry,
            creation_time: document.creation_time,
            surfaces: document.surfaces,
            meta: parking_lot::RwLock::new(ResourceMeta {
                name: document.name,
                owner: document.owner,
                access: AccessControl::from_entries(document.access),
                markers,
                playback: document.playback,
            }),
            media: parking_lot::RwLock::new(media),
            cache: parking_lot::RwLock::new(None),
            cache_locks: AtomicUsize::new(0),
            context,
        })
    }
    /// A copy of this resource's media and markers on new surfaces, owned by someone else.
    /// Permissions and playback state aren't carried over.
    pub fn deep_clone(
        &self,
        owner: uuid::Uuid,
        name: String,
        surfaces: Vec<SurfaceHandle>,
    ) -> Result<Self, LoadError> {
        let meta = self.meta.read();
        let media = self.media.read().deep_clone(&*self.context.storage)?;
        let copy = Self::new(
            NewResource {
                name,
                owner,
                width: self.geometry.width,
                height: self.geometry.height,
                ditherer: self.geometry.ditherer,
                surfaces,
                media,
            },
            self.context.clone(),
            None,
        )?;
        copy.meta.write().markers = meta.markers.clone();
        Ok(copy)
    }

    #[must_use]
    pub fn id(&self) -> Option<ResourceId> {
        *self.id.read()
    }
    /// Give the resource its ID. Fails with the current one if it already has one.
    pub(crate) fn assign_id(&self, id: ResourceId) -> Result<(), ResourceId> {
        let mut current = self.id.write();
        match *current {
            Some(existing) => Err(existing),
            None => {
                *current = Some(id);
                Ok(())
            }
        }
    }
    /// Give back an ID that registration handed out but couldn't keep. Sources already written under it are
    /// pulled back into memory, so the resource can later be stored under another one.
    pub(crate) fn release_id(&self) -> Result<(), LoadError> {
        *self.id.write() = None;
        let mut media = self.media.write();
        let detached = media.deep_clone(&*self.context.storage)?;
        *media = detached;
        Ok(())
    }
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
    /// Mark as deleted. Waits out any in-flight write so nothing is persisted after this returns.
    pub(crate) fn invalidate(&self) {
        let _meta = self.meta.write();
        self.valid.store(false, Ordering::Release);
    }
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
    #[must_use]
    pub fn width(&self) -> u32 {
        self.geometry.width
    }
    #[must_use]
    pub fn height(&self) -> u32 {
        self.geometry.height
    }
    #[must_use]
    pub fn surfaces(&self) -> &[SurfaceHandle] {
        &self.surfaces
    }
    /// Index of a surface within this resource.
    #[must_use]
    pub fn surface_index(&self, handle: SurfaceHandle) -> Option<usize> {
        self.surfaces.iter().position(|h| *h == handle)
    }
    #[must_use]
    pub fn creation_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.creation_time
    }
    #[must_use]
    pub fn name(&self) -> String {
        self.meta.read().name.clone()
    }
    #[must_use]
    pub fn owner(&self) -> uuid::Uuid {
        self.meta.read().owner
    }
    /// A snapshot of the mutable properties.
    #[must_use]
    pub fn meta(&self) -> ResourceMeta {
        self.meta.read().clone()
    }
    #[must_use]
    pub fn playback(&self) -> Playback {
        self.meta.read().playback
    }
    #[must_use]
    pub fn has_permission(&self, viewer: uuid::Uuid, permission: PermissionLevel) -> bool {
        let meta = self.meta.read();
        meta.access.has_permission(meta.owner, viewer, permission)
    }
    /// Markers of one surface, the cursor set of a repaint.
    #[must_use]
    pub fn cursors(&self, surface_index: usize) -> Vec<Marker> {
        self.meta.read().markers.on(surface_index).to_vec()
    }
    #[must_use]
    pub fn requires_animation(&self) -> bool {
        self.media.read().requires_animation()
    }
    #[must_use]
    pub fn is_updatable(&self) -> bool {
        self.media.read().is_updatable()
    }
    #[must_use]
    pub fn tombstones_surfaces(&self) -> bool {
        self.media.read().tombstones_surfaces()
    }
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.media.read().kind_name()
    }

    // ---- Persistence

    fn document(&self, meta: &ResourceMeta, media: &Media) -> Result<ResourceDocument, ResourceError> {
        let id = self.id().ok_or(ResourceError::Unregistered)?;
        Ok(ResourceDocument {
            version: DOCUMENT_VERSION,
            id,
            name: meta.name.clone(),
            owner: meta.owner,
            creation_time: self.creation_time,
            width: self.geometry.width,
            height: self.geometry.height,
            ditherer: self.geometry.ditherer,
            surfaces: self.surfaces.clone(),
            markers: meta.markers.sets().to_vec(),
            access: meta.access.entries(),
            playback: meta.playback,
            media: media.save(id, &*self.context.storage)?,
        })
    }
    fn persist(&self, meta: &ResourceMeta, media: &Media) -> Result<(), ResourceError> {
        if !self.is_valid() {
            return Err(ResourceError::Invalidated);
        }
        let document = self.document(meta, media)?;
        self.context
            .storage
            .save_resource_data(document.id, &document)?;
        Ok(())
    }
    /// Write the current state to storage.
    pub fn save(&self) -> Result<(), ResourceError> {
        let meta = self.meta.read();
        let media = self.media.read();
        self.persist(&meta, &media)
    }
    /// Apply `change` to a copy of the meta, persist the copy, and only then make it current.
    fn modify_meta<T>(
        &self,
        change: impl FnOnce(&mut ResourceMeta) -> Result<T, ResourceError>,
    ) -> Result<T, ResourceError> {
        let mut meta = self.meta.write();
        let mut next = meta.clone();
        let result = change(&mut next)?;
        self.persist(&next, &self.media.read())?;
        *meta = next;
        Ok(result)
    }

    // ---- Meta operations. Name uniqueness is the registry's business, see `Registry::rename`.

    pub(crate) fn set_name(&self, name: String) -> Result<(), ResourceError> {
        self.modify_meta(|meta| {
            meta.name = name;
            Ok(())
        })
    }
    pub(crate) fn set_owner(&self, owner: uuid::Uuid) -> Result<(), ResourceError> {
        self.modify_meta(|meta| {
            meta.owner = owner;
            Ok(())
        })
    }
    /// Set the level of a viewer (or [`crate::permission::EVERYONE`]). Returns their previous explicit level.
    pub fn set_permission(
        &self,
        viewer: uuid::Uuid,
        level: PermissionLevel,
    ) -> Result<Option<PermissionLevel>, ResourceError> {
        self.modify_meta(|meta| Ok(meta.access.set(viewer, level)))
    }
    pub fn add_marker(&self, surface_index: usize, marker: Marker) -> Result<(), ResourceError> {
        self.modify_meta(|meta| Ok(meta.markers.add(surface_index, marker)?))
    }
    /// Remove a marker by name, returning the index of the surface it was on.
    pub fn remove_marker(&self, name: &str) -> Result<usize, ResourceError> {
        self.modify_meta(|meta| Ok(meta.markers.remove(name)?.0))
    }
    pub fn clear_markers(&self) -> Result<(), ResourceError> {
        self.modify_meta(|meta| {
            meta.markers.clear();
            Ok(())
        })
    }
    /// Pause or resume at global tick `now`. No-op if already in that state.
    pub fn set_paused(&self, paused: bool, now: u64) -> Result<(), ResourceError> {
        if self.playback().is_paused() == paused {
            return Ok(());
        }
        self.modify_meta(|meta| {
            if paused {
                meta.playback.pause(now);
            } else {
                meta.playback.resume(now);
            }
            Ok(())
        })
    }

    // ---- Cache

    #[must_use]
    pub fn has_color_cached(&self) -> bool {
        self.cache.read().is_some()
    }
    #[must_use]
    pub fn is_cache_locked(&self) -> bool {
        self.cache_locks.load(Ordering::Acquire) != 0
    }
    /// Suspend automatic cache transitions until the returned guard is dropped. Guards may overlap freely.
    pub fn lock_cache(&self) -> CacheLock<'_> {
        self.cache_locks.fetch_add(1, Ordering::AcqRel);
        CacheLock { resource: self }
    }
    /// Decode the media into the color cache, if not already there.
    pub fn load_cache(&self) -> Result<(), LoadError> {
        if self.has_color_cached() {
            return Ok(());
        }
        // Held until the cache is in place, so an update can't slip in between and be overwritten.
        let media = self.media.read();
        let colors = media.load(self.geometry, &self.context)?;
        log::debug!(
            "Cached {} of {} {:?}",
            crate::util::bytes(colors.memory_usage()),
            media.kind_name(),
            self.id()
        );
        self.cache.write().get_or_insert(colors);
        Ok(())
    }
    pub fn unload_cache(&self) {
        if let Some(colors) = self.cache.write().take() {
            log::debug!(
                "Evicted {} from {:?}",
                crate::util::bytes(colors.memory_usage()),
                self.id()
            );
        }
    }
    /// The animation table, if this is an animated resource with a loaded cache.
    #[must_use]
    pub fn animation(&self) -> Option<Arc<AnimationTable>> {
        match &*self.cache.read() {
            Some(ColorCache::Animated(table)) => Some(table.clone()),
            _ => None,
        }
    }
    /// Pixels of one surface. Served from the cache if possible, otherwise decoded on the spot (without caching).
    #[must_use]
    pub fn surface_pixels(&self, surface_index: usize) -> Option<Arc<[u8]>> {
        if let Some(colors) = &*self.cache.read() {
            return colors.surface(surface_index);
        }
        match self
            .media
            .read()
            .load_surface(surface_index, self.geometry, &self.context)
        {
            Ok(pixels) => Some(pixels),
            Err(e) => {
                log::warn!("Couldn't decode surface {surface_index} of {:?}: {e}", self.id());
                None
            }
        }
    }

    // ---- Media replacement

    /// Swap out the media. The new media is persisted first, and sources only the old media used are removed.
    ///
    /// If the cache was loaded it is replaced by `colors`, when the caller already decoded them, or else rebuilt
    /// from the new media.
    pub fn update(&self, media: Media, colors: Option<ColorCache>) -> Result<(), ResourceError> {
        if !self.is_updatable() {
            return Err(ResourceError::NotUpdatable(self.kind_name()));
        }
        let tiles = self.geometry.tiles();
        media.check_shape(tiles)?;
        if let Some(colors) = &colors {
            if colors.tiles() != tiles {
                return Err(LoadError::Shape {
                    expected: tiles,
                    got: colors.tiles(),
                }
                .into());
            }
        }
        let _lock = self.lock_cache();
        let was_cached = self.has_color_cached();
        // Build the new cache before touching anything, so a bad source changes nothing.
        let colors = match colors {
            Some(colors) if was_cached => Some(colors),
            None if was_cached => Some(media.load(self.geometry, &self.context)?),
            _ => None,
        };
        let meta = self.meta.read();
        let mut current = self.media.write();
        self.persist(&meta, &media)?;
        let stale = current.sources();
        *current = media;
        *self.cache.write() = colors;
        self.delete_stale_sources(stale, &current.sources());
        Ok(())
    }
    /// Remove sources of this resource that are no longer referenced. Identical content shares a name, so
    /// anything still in `kept` stays.
    fn delete_stale_sources(&self, stale: Vec<SourceRef>, kept: &[SourceRef]) {
        let Some(id) = self.id() else {
            return;
        };
        for source in stale {
            if source.resource != id || kept.contains(&source) {
                continue;
            }
            if let Err(e) = self.context.storage.delete_source(id, &source.filename) {
                log::warn!("Couldn't remove stale source {:?} of {id}: {e}", source.filename);
            }
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}
