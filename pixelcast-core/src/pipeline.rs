//! # Pipeline
//!
//! Ties the pieces together: requests are admitted, built on the [`CreationQueue`], registered in the [`Registry`],
//! handed a [`CacheController`], and picked up by the [`DistributionEngine`] from there. Deleted resources have
//! their surfaces painted over by the [`TombstonePainter`].
//!
//! Permission checks belong to whoever calls in here. See [`Resource::has_permission`].

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    animation::AnimationEncoder,
    cache::{CacheController, CachePolicy},
    config::{Config, ConfigError},
    creation::{CreationError, CreationQueue, CreationTask, EnqueueRejected, JobContext},
    dither::DitherKind,
    distribution::{DistributionEngine, SendExecutor},
    id::{IdAllocator, ResourceId},
    lazy::{Blob, Lazy, LazyImage},
    marker::Marker,
    media::{self, MediaSource},
    painter::{paint_channel, TombstonePainter},
    permission::PermissionLevel,
    registry::{Registry, RegistryError},
    resource::{ColorCache, Geometry, LoadContext, LoadError, Media, NewResource, Resource, ResourceError},
    schedule::{Scheduler, TaskHandle},
    sink::{DeliveryError, DeliverySink, OwnerId, Presence, ViewerId},
    storage::Storage,
    surface::{AllocationError, SurfaceAllocator, SurfaceHandle},
};

#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    #[error("owner already has a resource named {0:?}")]
    DuplicateName(String),
    #[error("{width}x{height} is too large, the limit is {max_width}x{max_height}")]
    TooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },
    #[error("a resource can't be empty")]
    Empty,
    #[error("overlay needs {expected} surfaces, got {got}")]
    OverlayShape { expected: usize, got: usize },
    #[error("no resource {0}")]
    NotFound(ResourceId),
    #[error("{0} media can't be updated")]
    NotUpdatable(&'static str),
    #[error(transparent)]
    Rejected(#[from] EnqueueRejected),
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("couldn't start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("no resource {0}")]
    NotFound(ResourceId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// What to make of the source image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MediaKind {
    /// Animated if the source is an animated GIF, still otherwise.
    #[default]
    Auto,
    /// Only the first frame, even of an animation.
    Still,
    /// Dithered once, the source isn't kept.
    Baked,
    /// Dithered once and drawn over existing surfaces instead of fresh ones.
    Overlay { surfaces: Vec<SurfaceHandle> },
}

pub struct CreateRequest {
    pub owner: OwnerId,
    pub name: String,
    /// In surfaces.
    pub width: u32,
    pub height: u32,
    pub source: MediaSource,
    pub kind: MediaKind,
    pub ditherer: DitherKind,
}

/// The outside world, as far as the pipeline is concerned.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub allocator: Arc<dyn SurfaceAllocator>,
    pub presence: Arc<dyn Presence>,
    pub sink: Arc<dyn DeliverySink>,
    pub scheduler: Arc<dyn Scheduler>,
}

/// State shared with creation jobs.
struct Shared {
    context: LoadContext,
    registry: Arc<Registry>,
    allocator: Arc<dyn SurfaceAllocator>,
    presence: Arc<dyn Presence>,
    sink: Arc<dyn DeliverySink>,
    scheduler: Arc<dyn Scheduler>,
    controllers: DashMap<ResourceId, Arc<CacheController>>,
    cache_policy: CachePolicy,
    cache_period: std::time::Duration,
    ms_per_tick: u32,
}

impl Shared {
    /// Put a registered resource under cache control.
    fn govern(&self, resource: &Arc<Resource>) {
        let Some(id) = resource.id() else {
            return;
        };
        let controller = CacheController::start(
            resource.clone(),
            self.cache_policy,
            self.presence.clone(),
            &*self.scheduler,
            self.cache_period,
        );
        if let Some(previous) = self.controllers.insert(id, controller) {
            previous.close();
        }
    }
    fn repaint_surface(&self, resource: &Resource, index: usize) -> Result<(), DeliveryError> {
        let (Some(surface), Some(pixels)) = (
            resource.surfaces().get(index),
            resource.surface_pixels(index),
        ) else {
            return Ok(());
        };
        self.sink.repaint(*surface, &pixels, &resource.cursors(index))
    }
    fn repaint(&self, resource: &Resource) -> Result<(), DeliveryError> {
        (0..resource.surfaces().len()).try_for_each(|index| self.repaint_surface(resource, index))
    }
    /// Decode `bytes` into media, along with the cache for it.
    fn build_media(
        &self,
        context: &JobContext,
        bytes: Vec<u8>,
        geometry: Geometry,
        kind: &MediaKind,
    ) -> Result<(Media, ColorCache), CreationError> {
        let animated = matches!(kind, MediaKind::Auto) && media::is_animated(&bytes)?;
        if animated {
            return self.build_animation(context, bytes, geometry);
        }
        context.progress("decoding");
        let image = media::decode_still(&bytes, geometry.width, geometry.height)?;
        context.check()?;
        let tiles = media::split(&image, geometry.width, geometry.height);
        context.progress("dithering");
        let colors = media::dither_tiles(&tiles, geometry.ditherer.ditherer());
        context.check()?;
        let palettes = || -> Vec<Lazy<Blob>> {
            colors
                .iter()
                .map(|pixels| Lazy::strong(Blob(pixels.to_vec())))
                .collect()
        };
        let media = match kind {
            MediaKind::Auto | MediaKind::Still => Media::Still {
                images: tiles.into_iter().map(LazyImage::strong).collect(),
            },
            MediaKind::Baked => Media::Baked {
                palettes: palettes(),
            },
            MediaKind::Overlay { .. } => Media::Overlay {
                palettes: palettes(),
            },
        };
        Ok((media, ColorCache::Still(colors)))
    }
    fn build_animation(
        &self,
        context: &JobContext,
        bytes: Vec<u8>,
        geometry: Geometry,
    ) -> Result<(Media, ColorCache), CreationError> {
        let ditherer = geometry.ditherer.ditherer();
        let mut encoder = AnimationEncoder::new(&self.context.ids, geometry.tiles());
        let frames = media::decode_frames(
            bytes.clone(),
            geometry.width,
            geometry.height,
            &self.context.limits,
            self.ms_per_tick,
        )?;
        for (index, frame) in frames.enumerate() {
            context.check()?;
            context.progress(format!("frame {}", index + 1));
            let (image, ticks) = frame?;
            let tiles = media::split(&image, geometry.width, geometry.height);
            encoder
                .push_frame(media::dither_tiles(&tiles, ditherer), ticks)
                .map_err(LoadError::from)?;
        }
        let table = encoder.finish().map_err(LoadError::from)?;
        log::debug!(
            "Encoded {} ticks into {} distinct frames",
            table.len(),
            table.distinct_frames()
        );
        Ok((
            Media::Animated {
                source: Lazy::strong(Blob(bytes)),
                ms_per_tick: self.ms_per_tick,
            },
            ColorCache::Animated(Arc::new(table)),
        ))
    }
    fn create(&self, context: &JobContext, request: CreateRequest) -> Result<Arc<Resource>, CreationError> {
        context.progress("reading");
        let bytes = media::read_limited(request.source, self.context.limits.max_source_bytes)?;
        context.check()?;
        let geometry = Geometry {
            width: request.width,
            height: request.height,
            ditherer: request.ditherer,
        };
        let (media, colors) = self.build_media(context, bytes, geometry, &request.kind)?;
        context.check()?;
        let surfaces = match request.kind {
            MediaKind::Overlay { surfaces } => surfaces,
            _ => self.allocator.allocate(geometry.tiles())?,
        };
        let resource = Arc::new(Resource::new(
            NewResource {
                name: request.name,
                owner: request.owner,
                width: request.width,
                height: request.height,
                ditherer: request.ditherer,
                surfaces,
                media,
            },
            self.context.clone(),
            Some(colors),
        )?);
        // Handles that were allocated are simply never used if this fails. Allocators don't reuse them anyway.
        context.commit()?;
        self.registry.register(resource.clone())?;
        self.govern(&resource);
        if let Err(e) = self.repaint(&resource) {
            log::warn!("Couldn't paint new {:?}: {e}", resource.id());
        }
        Ok(resource)
    }
    fn update(
        &self,
        context: &JobContext,
        resource: &Arc<Resource>,
        source: MediaSource,
    ) -> Result<Arc<Resource>, CreationError> {
        context.progress("reading");
        let bytes = media::read_limited(source, self.context.limits.max_source_bytes)?;
        let (media, colors) =
            self.build_media(context, bytes, resource.geometry(), &MediaKind::Auto)?;
        context.commit()?;
        resource.update(media, Some(colors))?;
        if let Err(e) = self.repaint(resource) {
            log::warn!("Couldn't paint updated {:?}: {e}", resource.id());
        }
        Ok(resource.clone())
    }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    queue: CreationQueue,
    engine: Arc<DistributionEngine>,
    painter: parking_lot::Mutex<Option<TombstonePainter>>,
    tasks: parking_lot::Mutex<Vec<TaskHandle>>,
    closed: std::sync::atomic::AtomicBool,
    config: Config,
}

impl Pipeline {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        executor: SendExecutor,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let ids = Arc::new(IdAllocator::new());
        let (paint_queue, paint_receiver) = paint_channel();
        let registry = Arc::new(Registry::new(
            collaborators.storage.clone(),
            ids.clone(),
            paint_queue,
        ));
        let queue = CreationQueue::new(&config.creation, collaborators.scheduler.clone())?;
        let engine = Arc::new(DistributionEngine::new(
            &config.distribution,
            registry.clone(),
            collaborators.presence.clone(),
            collaborators.sink.clone(),
            executor,
        ));
        let painter = TombstonePainter::new(
            paint_receiver,
            collaborators.sink.clone(),
            registry.clone(),
        );
        let shared = Arc::new(Shared {
            context: LoadContext {
                storage: collaborators.storage,
                ids,
                limits: config.limits.clone(),
            },
            registry,
            allocator: collaborators.allocator,
            presence: collaborators.presence,
            sink: collaborators.sink,
            scheduler: collaborators.scheduler,
            controllers: DashMap::new(),
            cache_policy: CachePolicy::from(&config.cache),
            cache_period: config.cache.tick_period(),
            ms_per_tick: config.animation.ms_per_tick,
        });
        Ok(Self {
            shared,
            queue,
            engine,
            painter: parking_lot::Mutex::new(Some(painter)),
            tasks: parking_lot::Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
            config,
        })
    }
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }
    #[must_use]
    pub fn engine(&self) -> &Arc<DistributionEngine> {
        &self.engine
    }
    #[must_use]
    pub fn queue(&self) -> &CreationQueue {
        &self.queue
    }
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
    #[must_use]
    pub fn controller(&self, id: ResourceId) -> Option<Arc<CacheController>> {
        self.shared.controllers.get(&id).map(|entry| entry.clone())
    }
    fn lookup(&self, id: ResourceId) -> Result<Arc<Resource>, PipelineError> {
        self.shared
            .registry
            .lookup_by_id(id)
            .ok_or(PipelineError::NotFound(id))
    }

    // ---- Lifecycle

    /// Read every stored resource back in, and put them under cache control.
    pub fn restore(&self) -> Result<usize, PipelineError> {
        let resources = self.shared.registry.load_all(&self.shared.context)?;
        let allocator = &self.shared.allocator;
        for surface in self.shared.registry.tombstones() {
            allocator.observe(surface);
        }
        for resource in &resources {
            for surface in resource.surfaces() {
                allocator.observe(*surface);
            }
            self.shared.govern(resource);
        }
        Ok(resources.len())
    }
    /// Begin distributing and painting tombstones.
    pub fn start(&self) {
        let scheduler = &*self.shared.scheduler;
        let mut tasks = self.tasks.lock();
        tasks.push(
            self.engine
                .start(scheduler, self.config.distribution.tick_period()),
        );
        if let Some(painter) = self.painter.lock().take() {
            tasks.push(painter.start(scheduler, self.config.cache.tick_period()));
        }
        log::info!("Pipeline started");
    }
    /// Stop every background task and cancel pending creations. Resources stay registered.
    pub fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }
        self.queue.shutdown();
        for entry in self.shared.controllers.iter() {
            entry.value().close();
        }
        self.shared.controllers.clear();
        log::info!("Pipeline closed");
    }

    // ---- Creation

    /// Check a request, then queue it. The task yields the registered resource.
    pub fn create(
        &self,
        request: CreateRequest,
    ) -> Result<CreationTask<Arc<Resource>>, AdmissionError> {
        let (width, height) = (request.width, request.height);
        if width == 0 || height == 0 {
            return Err(AdmissionError::Empty);
        }
        let limits = &self.config.limits;
        if width > limits.max_width || height > limits.max_height {
            return Err(AdmissionError::TooLarge {
                width,
                height,
                max_width: limits.max_width,
                max_height: limits.max_height,
            });
        }
        if let MediaKind::Overlay { surfaces } = &request.kind {
            let expected = width as usize * height as usize;
            if surfaces.len() != expected {
                return Err(AdmissionError::OverlayShape {
                    expected,
                    got: surfaces.len(),
                });
            }
        }
        if self
            .shared
            .registry
            .find_by_name(request.owner, &request.name)
            .is_some()
        {
            return Err(AdmissionError::DuplicateName(request.name));
        }
        let shared = self.shared.clone();
        let name = request.name.clone();
        Ok(self.queue.enqueue(
            request.owner,
            &name,
            width,
            height,
            move |context| shared.create(context, request),
        )?)
    }
    /// Replace the media of a resource with a new source, decoded on the creation queue on behalf of `requester`.
    pub fn update(
        &self,
        id: ResourceId,
        requester: OwnerId,
        source: MediaSource,
    ) -> Result<CreationTask<Arc<Resource>>, AdmissionError> {
        let resource = self
            .shared
            .registry
            .lookup_by_id(id)
            .ok_or(AdmissionError::NotFound(id))?;
        if !resource.is_updatable() {
            return Err(AdmissionError::NotUpdatable(resource.kind_name()));
        }
        let shared = self.shared.clone();
        Ok(self.queue.enqueue(
            requester,
            &resource.name(),
            resource.width(),
            resource.height(),
            move |context| shared.update(context, &resource, source),
        )?)
    }
    /// Copy a resource onto fresh surfaces for `owner`.
    pub fn clone_resource(
        &self,
        id: ResourceId,
        owner: OwnerId,
        name: &str,
    ) -> Result<Arc<Resource>, PipelineError> {
        let original = self.lookup(id)?;
        if self.shared.registry.find_by_name(owner, name).is_some() {
            return Err(RegistryError::DuplicateName(name.to_owned()).into());
        }
        let surfaces = self.shared.allocator.allocate(original.surfaces().len())?;
        let copy = Arc::new(original.deep_clone(owner, name.to_owned(), surfaces)?);
        self.shared.registry.register(copy.clone())?;
        self.shared.govern(&copy);
        if let Err(e) = self.shared.repaint(&copy) {
            log::warn!("Couldn't paint clone {:?}: {e}", copy.id());
        }
        Ok(copy)
    }
    pub fn delete(&self, id: ResourceId) -> Result<Arc<Resource>, PipelineError> {
        if let Some((_, controller)) = self.shared.controllers.remove(&id) {
            controller.close();
        }
        let resource = self.shared.registry.delete(id)?;
        self.engine.forget_resource(id);
        resource.unload_cache();
        Ok(resource)
    }

    // ---- Edits

    /// Redraw every surface of a resource for everyone.
    pub fn repaint(&self, id: ResourceId) -> Result<(), PipelineError> {
        Ok(self.shared.repaint(&*self.lookup(id)?)?)
    }
    pub fn rename(&self, id: ResourceId, name: &str) -> Result<(), PipelineError> {
        Ok(self.shared.registry.rename(id, name)?)
    }
    pub fn reassign_owner(&self, id: ResourceId, owner: OwnerId) -> Result<(), PipelineError> {
        Ok(self.shared.registry.reassign_owner(id, owner)?)
    }
    pub fn set_permission(
        &self,
        id: ResourceId,
        viewer: ViewerId,
        level: PermissionLevel,
    ) -> Result<Option<PermissionLevel>, PipelineError> {
        Ok(self.lookup(id)?.set_permission(viewer, level)?)
    }
    pub fn add_marker(
        &self,
        id: ResourceId,
        surface_index: usize,
        marker: Marker,
    ) -> Result<(), PipelineError> {
        let resource = self.lookup(id)?;
        resource.add_marker(surface_index, marker)?;
        Ok(self.shared.repaint_surface(&resource, surface_index)?)
    }
    pub fn remove_marker(&self, id: ResourceId, name: &str) -> Result<(), PipelineError> {
        let resource = self.lookup(id)?;
        let surface_index = resource.remove_marker(name)?;
        Ok(self.shared.repaint_surface(&resource, surface_index)?)
    }
    pub fn clear_markers(&self, id: ResourceId) -> Result<(), PipelineError> {
        let resource = self.lookup(id)?;
        resource.clear_markers()?;
        Ok(self.shared.repaint(&resource)?)
    }
    /// Pause or resume an animation at the current distribution tick.
    pub fn set_paused(&self, id: ResourceId, paused: bool) -> Result<(), PipelineError> {
        Ok(self.lookup(id)?.set_paused(paused, self.engine.now())?)
    }

    // ---- Viewers

    pub fn viewer_connected(&self, viewer: ViewerId) {
        self.engine.viewer_connected(viewer);
    }
    pub fn viewer_disconnected(&self, viewer: ViewerId) {
        self.engine.viewer_disconnected(viewer);
    }
}
impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::CachePolicyKind,
        media::test::{gif, png},
        schedule::ManualScheduler,
        sink::test::{RecordingSink, Sent, TestPresence},
        storage::MemoryStorage,
        surface::SequentialAllocator,
    };

    struct Setup {
        pipeline: Pipeline,
        storage: Arc<MemoryStorage>,
        sink: Arc<RecordingSink>,
        presence: Arc<TestPresence>,
        scheduler: Arc<ManualScheduler>,
    }
    fn setup_with(storage: Arc<MemoryStorage>) -> Setup {
        let sink = Arc::new(RecordingSink::default());
        let presence = Arc::new(TestPresence::default());
        let scheduler = Arc::new(ManualScheduler::new());
        let mut config = Config::default();
        config.distribution.connect_grace_ticks = 0;
        config.cache.policy = CachePolicyKind::Dynamic;
        config.cache.idle_threshold_ticks = 2;
        let pipeline = Pipeline::new(
            config,
            Collaborators {
                storage: storage.clone(),
                allocator: Arc::new(SequentialAllocator::new()),
                presence: presence.clone(),
                sink: sink.clone(),
                scheduler: scheduler.clone(),
            },
            SendExecutor::Inline,
        )
        .unwrap();
        Setup {
            pipeline,
            storage,
            sink,
            presence,
            scheduler,
        }
    }
    fn setup() -> Setup {
        setup_with(Arc::new(MemoryStorage::new()))
    }
    fn request(owner: OwnerId, name: &str, source: Vec<u8>, kind: MediaKind) -> CreateRequest {
        CreateRequest {
            owner,
            name: name.to_owned(),
            width: 2,
            height: 1,
            source: MediaSource::Bytes(source),
            kind,
            ditherer: DitherKind::NearestColor,
        }
    }

    #[test]
    fn create_registers_and_paints() {
        let s = setup();
        let owner = uuid::Uuid::new_v4();
        let task = s
            .pipeline
            .create(request(owner, "Sunset", png(20, 10, [255, 128, 0, 255]), MediaKind::Auto))
            .unwrap();
        let resource = task.wait().unwrap();
        let id = resource.id().unwrap();
        assert_eq!(resource.kind_name(), "still");
        assert_eq!(resource.surfaces(), &[SurfaceHandle(0), SurfaceHandle(1)]);
        assert!(s.pipeline.registry().lookup_by_id(id).is_some());
        assert!(s.pipeline.controller(id).is_some());
        assert!(s.storage.load_resource_data(id).unwrap().is_some());
        assert_eq!(
            s.sink.take(),
            vec![Sent::Repaint(SurfaceHandle(0)), Sent::Repaint(SurfaceHandle(1))]
        );
        // Names are per owner, and case doesn't matter.
        assert!(matches!(
            s.pipeline
                .create(request(owner, "SUNSET", png(1, 1, [0; 4]), MediaKind::Auto)),
            Err(AdmissionError::DuplicateName(_))
        ));
        assert!(s
            .pipeline
            .create(request(uuid::Uuid::new_v4(), "sunset", png(1, 1, [0; 4]), MediaKind::Baked))
            .unwrap()
            .wait()
            .is_ok());
    }
    #[test]
    fn admission() {
        let s = setup();
        let owner = uuid::Uuid::new_v4();
        let mut big = request(owner, "big", Vec::new(), MediaKind::Auto);
        big.width = s.pipeline.config().limits.max_width + 1;
        assert!(matches!(
            s.pipeline.create(big),
            Err(AdmissionError::TooLarge { .. })
        ));
        let mut empty = request(owner, "empty", Vec::new(), MediaKind::Auto);
        empty.height = 0;
        assert!(matches!(s.pipeline.create(empty), Err(AdmissionError::Empty)));
        assert!(matches!(
            s.pipeline.create(request(
                owner,
                "overlay",
                Vec::new(),
                MediaKind::Overlay {
                    surfaces: vec![SurfaceHandle(3)]
                }
            )),
            Err(AdmissionError::OverlayShape {
                expected: 2,
                got: 1
            })
        ));
    }
    #[test]
    fn failed_decode_reported() {
        let s = setup();
        let owner = uuid::Uuid::new_v4();
        let task = s
            .pipeline
            .create(request(owner, "junk", vec![1, 2, 3, 4], MediaKind::Auto))
            .unwrap();
        assert!(matches!(task.wait(), Err(CreationError::Media(_))));
        assert!(s.pipeline.registry().is_empty());
        assert!(!s.pipeline.queue().is_busy(owner));
    }
    #[test]
    fn animated_distributed() {
        let s = setup();
        let viewer = uuid::Uuid::new_v4();
        s.presence.set(&[viewer]);
        s.pipeline.start();
        let source = gif(&[([255, 0, 0, 255], 100), ([0, 255, 0, 255], 100)], 32);
        let resource = s
            .pipeline
            .create(request(uuid::Uuid::new_v4(), "blink", source, MediaKind::Auto))
            .unwrap()
            .wait()
            .unwrap();
        assert!(resource.requires_animation());
        let table = resource.animation().unwrap();
        assert_eq!(table.tiles(), 2);
        let _ = s.sink.take();
        s.scheduler.tick();
        assert!(s.sink.pushes() > 0);
    }
    #[test]
    fn delete_tombstones_and_paints() {
        let s = setup();
        s.pipeline.start();
        let resource = s
            .pipeline
            .create(request(uuid::Uuid::new_v4(), "gone", png(4, 4, [9, 9, 9, 255]), MediaKind::Auto))
            .unwrap()
            .wait()
            .unwrap();
        let id = resource.id().unwrap();
        let _ = s.sink.take();
        s.pipeline.delete(id).unwrap();
        assert!(s.pipeline.registry().lookup_by_id(id).is_none());
        assert!(s.pipeline.controller(id).is_none());
        assert!(!resource.is_valid());
        assert!(resource
            .surfaces()
            .iter()
            .all(|surface| s.pipeline.registry().is_tombstoned(*surface)));
        s.scheduler.tick();
        let sent = s.sink.take();
        assert!(sent.contains(&Sent::Repaint(SurfaceHandle(0))));
        assert!(sent.contains(&Sent::Repaint(SurfaceHandle(1))));
        assert!(matches!(
            s.pipeline.delete(id),
            Err(PipelineError::Registry(RegistryError::NotFound(_)))
        ));
    }
    #[test]
    fn clone_and_edit() {
        let s = setup();
        let owner = uuid::Uuid::new_v4();
        let original = s
            .pipeline
            .create(request(owner, "art", png(8, 8, [0, 0, 255, 255]), MediaKind::Baked))
            .unwrap()
            .wait()
            .unwrap();
        let id = original.id().unwrap();
        s.pipeline
            .add_marker(
                id,
                1,
                Marker {
                    name: "pin".to_owned(),
                    x: 0,
                    y: 0,
                    direction: 0,
                    kind: 0,
                    caption: None,
                },
            )
            .unwrap();
        let other = uuid::Uuid::new_v4();
        let copy = s.pipeline.clone_resource(id, other, "art").unwrap();
        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.owner(), other);
        assert_eq!(copy.surfaces(), &[SurfaceHandle(2), SurfaceHandle(3)]);
        assert_eq!(copy.cursors(1).len(), 1);
        assert_eq!(copy.surface_pixels(0), original.surface_pixels(0));
        assert!(matches!(
            s.pipeline.clone_resource(id, other, "ART"),
            Err(PipelineError::Registry(RegistryError::DuplicateName(_)))
        ));

        s.pipeline.rename(id, "masterpiece").unwrap();
        assert_eq!(original.name(), "masterpiece");
        assert!(s.pipeline.reassign_owner(id, other).is_ok());
        assert_eq!(original.owner(), other);
        assert!(matches!(
            s.pipeline.reassign_owner(copy.id().unwrap(), other),
            Ok(())
        ));
        s.pipeline.remove_marker(id, "pin").unwrap();
        assert!(original.cursors(1).is_empty());
    }
    #[test]
    fn update_rebuilds() {
        let s = setup();
        let owner = uuid::Uuid::new_v4();
        let resource = s
            .pipeline
            .create(request(owner, "sky", png(2, 1, [0, 0, 255, 255]), MediaKind::Auto))
            .unwrap()
            .wait()
            .unwrap();
        let before = resource.surface_pixels(0).unwrap();
        let id = resource.id().unwrap();
        s.pipeline
            .update(id, owner, MediaSource::Bytes(png(2, 1, [255, 255, 0, 255])))
            .unwrap()
            .wait()
            .unwrap();
        let after = resource.surface_pixels(0).unwrap();
        assert_ne!(after, before);
        // The cache built while decoding is the one served, and it matches the stored media.
        resource.unload_cache();
        assert_eq!(resource.surface_pixels(0).unwrap(), after);
        // Both tiles are the same solid color, so they share one source. The blue one is gone.
        assert_eq!(s.storage.source_count(id), 1);

        let baked = s
            .pipeline
            .create(request(owner, "flat", png(1, 1, [1, 2, 3, 255]), MediaKind::Baked))
            .unwrap()
            .wait()
            .unwrap();
        assert!(matches!(
            s.pipeline
                .update(baked.id().unwrap(), owner, MediaSource::Bytes(Vec::new())),
            Err(AdmissionError::NotUpdatable("baked"))
        ));
    }
    #[test]
    fn restore_keeps_ids() {
        let storage = Arc::new(MemoryStorage::new());
        let (id, doomed_id, surfaces) = {
            let s = setup_with(storage.clone());
            let resource = s
                .pipeline
                .create(request(uuid::Uuid::new_v4(), "kept", png(4, 2, [7, 70, 170, 255]), MediaKind::Auto))
                .unwrap()
                .wait()
                .unwrap();
            let doomed = s
                .pipeline
                .create(request(uuid::Uuid::new_v4(), "doomed", png(4, 2, [0; 4]), MediaKind::Auto))
                .unwrap()
                .wait()
                .unwrap();
            let doomed_id = doomed.id().unwrap();
            s.pipeline.delete(doomed_id).unwrap();
            (resource.id().unwrap(), doomed_id, resource.surfaces().to_vec())
        };
        let s = setup_with(storage);
        assert_eq!(s.pipeline.restore().unwrap(), 1);
        let resource = s.pipeline.registry().lookup_by_id(id).unwrap();
        assert_eq!(resource.surfaces(), surfaces.as_slice());
        assert_eq!(s.pipeline.registry().tombstone_count(), 2);
        // Fresh surfaces land past both the restored and the tombstoned ones.
        let fresh = s
            .pipeline
            .create(request(uuid::Uuid::new_v4(), "new", png(1, 1, [0; 4]), MediaKind::Auto))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(fresh.surfaces(), &[SurfaceHandle(4), SurfaceHandle(5)]);
        // The deleted resource's ID isn't handed out again either.
        assert!(fresh.id().unwrap() > doomed_id);
        assert!(doomed_id > id);
    }
    #[test]
    fn close_stops_everything() {
        let s = setup();
        s.pipeline.start();
        let resource = s
            .pipeline
            .create(request(uuid::Uuid::new_v4(), "x", png(1, 1, [0; 4]), MediaKind::Auto))
            .unwrap()
            .wait()
            .unwrap();
        assert!(s.scheduler.live_tasks() >= 3);
        s.pipeline.close();
        assert_eq!(s.scheduler.live_tasks(), 0);
        assert!(s.pipeline.registry().lookup_by_id(resource.id().unwrap()).is_some());
        assert!(matches!(
            s.pipeline
                .create(request(uuid::Uuid::new_v4(), "y", png(1, 1, [0; 4]), MediaKind::Auto)),
            Err(AdmissionError::Rejected(EnqueueRejected::ShuttingDown))
        ));
    }
}
