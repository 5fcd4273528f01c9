//! # Distribution
//!
//! Once per tick, work out which animation frame each viewer should be seeing on each surface of each animated
//! resource, and get it there with as little traffic as possible.
//!
//! Every distinct frame is uploaded to a viewer once ([`DeliverySink::push_frame`]) and from then on only referred
//! to by ID ([`DeliverySink::show_frame`]), and only when the displayed frame actually changes. Uploads go through a
//! per-viewer [`RateLimiter`] and are performed by a [`SendExecutor`], which reports back whether they landed.
//!
//! Viewers previewing an edit of a resource get its base image instead, so the animation doesn't fight the preview.

mod knowledge;
mod rate_limit;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub use knowledge::{FrameState, ViewerKnowledge};
pub use rate_limit::RateLimiter;

use crate::{
    config::DistributionConfig,
    id::{FrameId, ResourceId},
    registry::Registry,
    resource::Resource,
    schedule::{Scheduler, TaskHandle},
    sink::{DeliveryError, DeliverySink, Presence, ViewerId},
};

/// One frame upload to one viewer.
#[derive(Clone)]
pub struct SendOp {
    pub viewer: ViewerId,
    pub resource: ResourceId,
    pub frame: FrameId,
    pub tile: usize,
    pub pixels: Arc<[u8]>,
}
impl std::fmt::Debug for SendOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOp")
            .field("viewer", &self.viewer)
            .field("resource", &self.resource)
            .field("frame", &self.frame)
            .field("tile", &self.tile)
            .finish_non_exhaustive()
    }
}

/// Outcome of a [`SendOp`].
#[derive(Debug)]
pub struct Delivery {
    pub viewer: ViewerId,
    pub resource: ResourceId,
    pub frame: FrameId,
    pub result: Result<(), DeliveryError>,
}

/// Where uploads run.
pub enum SendExecutor {
    /// On the distribution tick itself.
    Inline,
    Pool(rayon::ThreadPool),
}
impl SendExecutor {
    pub fn pool(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("pixelcast-send-{idx}"))
            .build()
            .map(Self::Pool)
    }
    fn execute(
        &self,
        op: SendOp,
        sink: &Arc<dyn DeliverySink>,
        results: &crossbeam::channel::Sender<Delivery>,
    ) {
        let send = {
            let sink = sink.clone();
            let results = results.clone();
            move || {
                let result = sink.push_frame(op.viewer, op.frame, op.tile, &op.pixels);
                // Engine gone means nobody cares about the result anymore.
                let _ = results.send(Delivery {
                    viewer: op.viewer,
                    resource: op.resource,
                    frame: op.frame,
                    result,
                });
            }
        };
        match self {
            Self::Inline => send(),
            Self::Pool(pool) => pool.spawn(send),
        }
    }
}

struct EngineState {
    knowledge: hashbrown::HashMap<(ViewerId, ResourceId), ViewerKnowledge>,
    limiter: RateLimiter<SendOp>,
}

pub struct DistributionEngine {
    registry: Arc<Registry>,
    presence: Arc<dyn Presence>,
    sink: Arc<dyn DeliverySink>,
    executor: SendExecutor,
    results: (
        crossbeam::channel::Sender<Delivery>,
        crossbeam::channel::Receiver<Delivery>,
    ),
    state: parking_lot::Mutex<EngineState>,
    now: AtomicU64,
}

impl DistributionEngine {
    #[must_use]
    pub fn new(
        config: &DistributionConfig,
        registry: Arc<Registry>,
        presence: Arc<dyn Presence>,
        sink: Arc<dyn DeliverySink>,
        executor: SendExecutor,
    ) -> Self {
        Self {
            registry,
            presence,
            sink,
            executor,
            results: crossbeam::channel::unbounded(),
            state: parking_lot::Mutex::new(EngineState {
                knowledge: hashbrown::HashMap::new(),
                limiter: RateLimiter::new(config.rate_limit, config.connect_grace_ticks),
            }),
            now: AtomicU64::new(0),
        }
    }
    /// Ticks run so far. This is the clock animation playback is measured against.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
    pub fn viewer_connected(&self, viewer: ViewerId) {
        let now = self.now();
        self.state.lock().limiter.connect(viewer, now);
        log::debug!("Viewer {viewer} connected at tick {now}");
    }
    /// Drop everything known about a viewer. In-flight sends to them are ignored when they complete.
    pub fn viewer_disconnected(&self, viewer: ViewerId) {
        let mut state = self.state.lock();
        state.knowledge.retain(|(v, _), _| *v != viewer);
        let dropped = state.limiter.disconnect(viewer);
        log::debug!("Viewer {viewer} disconnected, dropped {dropped} queued sends");
    }
    /// Drop everything about a resource, for every viewer.
    pub fn forget_resource(&self, resource: ResourceId) {
        let mut state = self.state.lock();
        state.knowledge.retain(|(_, r), _| *r != resource);
        state.limiter.retain(|op| op.resource != resource);
    }
    /// Where a viewer's knowledge of a frame stands.
    #[must_use]
    pub fn frame_state(&self, viewer: ViewerId, resource: ResourceId, frame: FrameId) -> FrameState {
        self.state
            .lock()
            .knowledge
            .get(&(viewer, resource))
            .map_or(FrameState::Unknown, |knowledge| knowledge.state(frame))
    }
    /// Sends waiting in a viewer's queue.
    #[must_use]
    pub fn queued(&self, viewer: ViewerId) -> usize {
        self.state.lock().limiter.queued(viewer)
    }
    /// Run one distribution step.
    pub fn tick(&self) {
        let now = self.now.fetch_add(1, Ordering::AcqRel) + 1;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for delivery in self.results.1.try_iter() {
            Self::record(&mut state.knowledge, delivery);
        }
        for resource in self.registry.all() {
            if resource.requires_animation() {
                self.distribute(&resource, now, &mut state.knowledge, &mut state.limiter);
            }
        }
        let sends = state.limiter.drain(now);
        drop(guard);
        for (_, op) in sends {
            self.executor.execute(op, &self.sink, &self.results.0);
        }
    }
    fn record(
        knowledge: &mut hashbrown::HashMap<(ViewerId, ResourceId), ViewerKnowledge>,
        delivery: Delivery,
    ) {
        let Some(knowledge) = knowledge.get_mut(&(delivery.viewer, delivery.resource)) else {
            return;
        };
        match delivery.result {
            Ok(()) => {
                knowledge.confirm(delivery.frame);
            }
            Err(e) => {
                log::debug!(
                    "Sending {} to {} failed, will retry: {e}",
                    delivery.frame,
                    delivery.viewer
                );
                knowledge.fail(delivery.frame);
            }
        }
    }
    fn distribute(
        &self,
        resource: &Resource,
        now: u64,
        knowledge: &mut hashbrown::HashMap<(ViewerId, ResourceId), ViewerKnowledge>,
        limiter: &mut RateLimiter<SendOp>,
    ) {
        let Some(id) = resource.id() else {
            return;
        };
        // No cache, no table. The cache controller loads it once someone's looking.
        let Some(table) = resource.animation() else {
            return;
        };
        let viewers = self.presence.viewers_of(resource);
        if viewers.is_empty() {
            return;
        }
        let tick = resource.playback().tick_at(now);
        for viewer in viewers {
            let knowledge = knowledge.entry((viewer, id)).or_default();
            knowledge.observe_table(&table);
            let editing = self.presence.is_editing(viewer, resource);
            if knowledge.set_editing(editing) && editing {
                self.reset(viewer, resource);
            }
            if editing {
                continue;
            }
            for (tile, surface) in resource.surfaces().iter().enumerate() {
                let Some(frame) = table.frame_id(tick, tile, true) else {
                    continue;
                };
                match knowledge.state(frame) {
                    FrameState::Known => {
                        if knowledge.needs_show(*surface, frame) {
                            match self.sink.show_frame(viewer, *surface, frame) {
                                Ok(()) => knowledge.shown(*surface, frame),
                                Err(e) => log::debug!("Couldn't show {frame} to {viewer}: {e}"),
                            }
                        }
                    }
                    FrameState::Pending => (),
                    FrameState::Unknown => {
                        let Some(pixels) = table.pixels_for(frame) else {
                            continue;
                        };
                        knowledge.mark_pending(frame);
                        limiter.enqueue(
                            viewer,
                            SendOp {
                                viewer,
                                resource: id,
                                frame,
                                tile,
                                pixels,
                            },
                        );
                    }
                }
            }
        }
    }
    /// Show a viewer the plain base image of every surface.
    fn reset(&self, viewer: ViewerId, resource: &Resource) {
        for (index, surface) in resource.surfaces().iter().enumerate() {
            let Some(pixels) = resource.surface_pixels(index) else {
                continue;
            };
            if let Err(e) =
                self.sink
                    .reset_viewer(viewer, *surface, &pixels, &resource.cursors(index))
            {
                log::warn!("Couldn't reset {surface} for {viewer}: {e}");
            }
        }
    }
    /// Tick on `scheduler` until the handle is cancelled.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler, period: std::time::Duration) -> TaskHandle {
        let weak = Arc::downgrade(self);
        scheduler.every(
            period,
            Box::new(move || {
                if let Some(this) = weak.upgrade() {
                    this.tick();
                }
            }),
        )
    }
}
