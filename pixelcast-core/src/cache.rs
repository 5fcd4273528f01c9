//! # Cache control
//!
//! Decides, per resource, whether its decoded pixels stay in memory.
//!
//! * [`CachePolicy::Dynamic`] loads the cache as soon as anyone is viewing the resource, and evicts it after
//!   a run of ticks with no viewers.
//! * [`CachePolicy::Persistent`] loads once on start and never evicts on its own.
//!
//! A failed load isn't retried by the controller until the next tick that wants it loaded. Until then readers fall
//! back to decoding on demand, see [`Resource::surface_pixels`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use crate::{
    config::{CacheConfig, CachePolicyKind},
    resource::Resource,
    schedule::{Scheduler, TaskHandle},
    sink::Presence,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    Dynamic { idle_threshold: u32 },
    Persistent,
}
impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        match config.policy {
            CachePolicyKind::Dynamic => Self::Dynamic {
                idle_threshold: config.idle_threshold_ticks,
            },
            CachePolicyKind::Persistent => Self::Persistent,
        }
    }
}

pub struct CacheController {
    resource: Arc<Resource>,
    presence: Arc<dyn Presence>,
    policy: CachePolicy,
    idle_ticks: parking_lot::Mutex<u32>,
    closed: AtomicBool,
    task: parking_lot::Mutex<Option<TaskHandle>>,
}

impl CacheController {
    /// Start governing `resource`. Dynamic controllers tick on `scheduler` every `period`.
    pub fn start(
        resource: Arc<Resource>,
        policy: CachePolicy,
        presence: Arc<dyn Presence>,
        scheduler: &dyn Scheduler,
        period: std::time::Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            resource,
            presence,
            policy,
            idle_ticks: parking_lot::Mutex::new(0),
            closed: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
        });
        match policy {
            CachePolicy::Persistent => this.load(),
            CachePolicy::Dynamic { .. } => {
                // Weak, so a controller dropped without close doesn't keep ticking forever.
                let weak: Weak<Self> = Arc::downgrade(&this);
                let handle = scheduler.every(
                    period,
                    Box::new(move || {
                        if let Some(this) = weak.upgrade() {
                            this.tick();
                        }
                    }),
                );
                *this.task.lock() = Some(handle);
            }
        }
        this
    }
    #[must_use]
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
    fn load(&self) {
        if let Err(e) = self.resource.load_cache() {
            log::error!("Failed to load cache of {:?}: {e}", self.resource.id());
        }
    }
    /// One step of the dynamic policy. Does nothing for persistent controllers.
    pub fn tick(&self) {
        let CachePolicy::Dynamic { idle_threshold } = self.policy else {
            return;
        };
        if self.is_closed() {
            return;
        }
        if !self.resource.is_valid() {
            self.close();
            return;
        }
        if self.resource.is_cache_locked() {
            return;
        }
        let mut idle = self.idle_ticks.lock();
        if self.presence.has_viewers(&self.resource) {
            *idle = 0;
            if !self.resource.has_color_cached() {
                self.load();
            }
        } else {
            *idle = idle.saturating_add(1);
            if *idle > idle_threshold && self.resource.has_color_cached() {
                self.resource.unload_cache();
            }
        }
    }
    /// Evict the cache now, regardless of policy.
    pub fn unload(&self) {
        self.resource.unload_cache();
    }
    /// Stop ticking. Safe to call repeatedly, and concurrently with a tick.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
    }
}
impl Drop for CacheController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        resource::test::{baked, context},
        schedule::ManualScheduler,
        sink::test::TestPresence,
        storage::MemoryStorage,
        surface::SurfaceHandle,
    };
    use std::time::Duration;

    fn setup() -> (Arc<Resource>, Arc<TestPresence>, ManualScheduler) {
        let context = context(Arc::new(MemoryStorage::new()));
        let resource = Arc::new(baked(
            &context,
            "cached",
            uuid::Uuid::nil(),
            vec![SurfaceHandle(0)],
            2,
        ));
        (resource, Arc::new(TestPresence::default()), ManualScheduler::new())
    }

    #[test]
    fn dynamic_loads_and_evicts() {
        let (resource, presence, scheduler) = setup();
        let controller = CacheController::start(
            resource.clone(),
            CachePolicy::Dynamic { idle_threshold: 3 },
            presence.clone(),
            &scheduler,
            Duration::from_millis(1),
        );
        scheduler.tick();
        assert!(!resource.has_color_cached());

        presence.set(&[uuid::Uuid::new_v4()]);
        scheduler.tick();
        assert!(resource.has_color_cached());

        presence.set(&[]);
        scheduler.tick_n(3);
        assert!(resource.has_color_cached());
        scheduler.tick();
        assert!(!resource.has_color_cached());

        // Back within one tick of a viewer showing up.
        presence.set(&[uuid::Uuid::new_v4()]);
        scheduler.tick();
        assert!(resource.has_color_cached());
        controller.close();
    }
    #[test]
    fn locked_suspends() {
        let (resource, presence, scheduler) = setup();
        let _controller = CacheController::start(
            resource.clone(),
            CachePolicy::Dynamic { idle_threshold: 0 },
            presence.clone(),
            &scheduler,
            Duration::from_millis(1),
        );
        presence.set(&[uuid::Uuid::new_v4()]);
        {
            let _lock = resource.lock_cache();
            scheduler.tick();
            assert!(!resource.has_color_cached());
        }
        scheduler.tick();
        assert!(resource.has_color_cached());
    }
    #[test]
    fn persistent_loads_once() {
        let (resource, presence, scheduler) = setup();
        let controller = CacheController::start(
            resource.clone(),
            CachePolicy::Persistent,
            presence,
            &scheduler,
            Duration::from_millis(1),
        );
        assert!(resource.has_color_cached());
        assert_eq!(scheduler.live_tasks(), 0);
        scheduler.tick_n(500);
        assert!(resource.has_color_cached());
        controller.unload();
        assert!(!resource.has_color_cached());
    }
    #[test]
    fn close_is_idempotent() {
        let (resource, presence, scheduler) = setup();
        let controller = CacheController::start(
            resource,
            CachePolicy::Dynamic { idle_threshold: 1 },
            presence,
            &scheduler,
            Duration::from_millis(1),
        );
        assert_eq!(scheduler.live_tasks(), 1);
        controller.close();
        controller.close();
        assert!(controller.is_closed());
        assert_eq!(scheduler.live_tasks(), 0);
        scheduler.tick();
    }
    #[test]
    fn invalidated_resource_closes() {
        let (resource, presence, scheduler) = setup();
        let controller = CacheController::start(
            resource.clone(),
            CachePolicy::Dynamic { idle_threshold: 1 },
            presence,
            &scheduler,
            Duration::from_millis(1),
        );
        resource.invalidate();
        scheduler.tick();
        assert!(controller.is_closed());
    }
}
