//! # Creation queue
//!
//! Decoding and dithering a new resource can take seconds, so it happens on a bounded worker pool instead of
//! on whatever thread asked for it. Each owner may have only one job in flight at a time.
//!
//! Every task gets a monitor on the [`Scheduler`], which keeps the task's queue position fresh while it waits, and
//! cancels it once it has been running for longer than the processing timeout. Time spent running is counted in
//! monitor ticks, so a stalled scheduler can't time out a job that never got to make progress.
//!
//! A task completes exactly once: with the job's result, with [`CreationError::Cancelled`], or with
//! [`CreationError::TimedOut`], whichever comes first. Jobs learn about cancellation through
//! [`JobContext::check`], and protect irreversible steps with [`JobContext::commit`].

mod task;

use std::sync::Arc;

pub use task::{CreationTask, JobContext, TaskStatus};
use task::{Cancellable, TaskShared};

use crate::{
    config::CreationConfig,
    lazy::LazyError,
    media::MediaError,
    registry::RegistryError,
    resource::{LoadError, ResourceError},
    schedule::Scheduler,
    sink::OwnerId,
    surface::AllocationError,
};

pub type TaskId = crate::id::LocalId<CreationQueue>;

#[derive(thiserror::Error, Debug)]
pub enum CreationError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Lazy(#[from] LazyError),
    #[error("cancelled")]
    Cancelled,
    #[error("took too long")]
    TimedOut,
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueRejected {
    #[error("{0} already has a creation in progress")]
    OwnerBusy(OwnerId),
    #[error("creation queue is shut down")]
    ShuttingDown,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    owners: hashbrown::HashSet<OwnerId>,
    /// Tasks not yet picked up by a worker, oldest first.
    order: std::collections::VecDeque<TaskId>,
    /// Every task not yet completed.
    tasks: hashbrown::HashMap<TaskId, Arc<dyn Cancellable>>,
}

#[derive(Default)]
struct QueueState {
    pending: parking_lot::Mutex<Pending>,
}
impl QueueState {
    fn started(&self, id: TaskId) {
        self.pending.lock().order.retain(|queued| *queued != id);
    }
    fn release(&self, owner: OwnerId, id: TaskId) {
        let mut pending = self.pending.lock();
        pending.owners.remove(&owner);
        pending.order.retain(|queued| *queued != id);
        pending.tasks.remove(&id);
    }
    fn position(&self, id: TaskId) -> Option<usize> {
        self.pending.lock().order.iter().position(|queued| *queued == id)
    }
}

pub struct CreationQueue {
    pool: rayon::ThreadPool,
    scheduler: Arc<dyn Scheduler>,
    monitor_period: std::time::Duration,
    processing_timeout: std::time::Duration,
    state: Arc<QueueState>,
}

impl CreationQueue {
    pub fn new(
        config: &CreationConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism.max(1))
            .thread_name(|idx| format!("pixelcast-create-{idx}"))
            .build()?;
        Ok(Self {
            pool,
            scheduler,
            monitor_period: config.monitor_period(),
            processing_timeout: config.processing_timeout(),
            state: Arc::default(),
        })
    }
    /// Queue `job` on behalf of `owner`. Rejected if that owner already has a job queued or running.
    pub fn enqueue<T, F>(
        &self,
        owner: OwnerId,
        name: &str,
        width: u32,
        height: u32,
        job: F,
    ) -> Result<CreationTask<T>, EnqueueRejected>
    where
        T: Send + 'static,
        F: FnOnce(&JobContext) -> Result<T, CreationError> + Send + 'static,
    {
        let id = TaskId::default();
        let description = format!("{id} ({name:?}, {width}x{height}, for {owner})");
        let (shared, receiver) = {
            let mut pending = self.state.pending.lock();
            if pending.closed {
                return Err(EnqueueRejected::ShuttingDown);
            }
            if !pending.owners.insert(owner) {
                return Err(EnqueueRejected::OwnerBusy(owner));
            }
            let position = pending.order.len();
            pending.order.push_back(id);
            let (shared, receiver) = TaskShared::<T>::new(
                id,
                owner,
                description,
                position,
                Arc::downgrade(&self.state),
            );
            pending.tasks.insert(id, shared.clone());
            (shared, receiver)
        };
        log::info!("Queued {}", shared.description);

        let monitor = {
            let shared = shared.clone();
            let period = self.monitor_period;
            let timeout = self.processing_timeout;
            let mut ticks = 0;
            self.scheduler.every(
                period,
                Box::new(move || shared.monitor_tick(&mut ticks, period, timeout)),
            )
        };
        *shared.monitor.lock() = Some(monitor);

        let worker = shared.clone();
        self.pool.spawn(move || worker.run(job));
        Ok(CreationTask { shared, receiver })
    }
    #[must_use]
    pub fn is_busy(&self, owner: OwnerId) -> bool {
        self.state.pending.lock().owners.contains(&owner)
    }
    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.pending.lock().order.len()
    }
    /// Number of tasks not yet completed, waiting or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.pending.lock().tasks.len()
    }
    /// Cancel every uncompleted task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tasks: Vec<_> = self.state.pending.lock().tasks.values().cloned().collect();
        // Cancelling takes the pending lock again to release the task.
        tasks.iter().filter(|task| task.cancel()).count()
    }
    /// Reject all further work and cancel what's queued.
    pub fn shutdown(&self) {
        self.state.pending.lock().closed = true;
        let cancelled = self.cancel_all();
        if cancelled != 0 {
            log::info!("Cancelled {cancelled} creation tasks on shutdown");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schedule::ManualScheduler;
    use crossbeam::channel::{bounded, Receiver, Sender};
    use std::time::Duration;

    fn queue(parallelism: usize) -> (CreationQueue, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = CreationConfig {
            parallelism,
            processing_timeout_ms: 30,
            monitor_period_ms: 10,
        };
        let queue = CreationQueue::new(&config, scheduler.clone()).unwrap();
        (queue, scheduler)
    }
    /// A job that reports when it starts, then waits to be released.
    fn gated(
        started: Sender<()>,
        release: Receiver<()>,
    ) -> impl FnOnce(&JobContext) -> Result<u32, CreationError> + Send + 'static {
        move |_| {
            started.send(()).unwrap();
            release.recv().unwrap();
            Ok(7)
        }
    }
    fn recv(receiver: &Receiver<()>) {
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn one_per_owner() {
        let (queue, _scheduler) = queue(2);
        let owner = uuid::Uuid::new_v4();
        let (started_tx, started) = bounded(1);
        let (release_tx, release) = bounded(1);
        let first = queue
            .enqueue(owner, "a", 1, 1, gated(started_tx, release))
            .unwrap();
        recv(&started);
        assert!(matches!(
            queue.enqueue(owner, "b", 1, 1, |_| Ok(0u32)),
            Err(EnqueueRejected::OwnerBusy(o)) if o == owner,
        ));
        // Someone else isn't affected.
        let other = queue
            .enqueue(uuid::Uuid::new_v4(), "c", 1, 1, |_| Ok(1u32))
            .unwrap();
        assert_eq!(other.wait().unwrap(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(first.wait().unwrap(), 7);
        assert!(!queue.is_busy(owner));
        let third = queue.enqueue(owner, "d", 1, 1, |_| Ok(3u32)).unwrap();
        assert_eq!(third.wait().unwrap(), 3);
    }
    #[test]
    fn positions() {
        let (queue, scheduler) = queue(1);
        let (started_tx, started) = bounded(1);
        let (release_tx, release) = bounded(1);
        let running = queue
            .enqueue(uuid::Uuid::new_v4(), "a", 1, 1, gated(started_tx, release))
            .unwrap();
        recv(&started);
        let second = queue
            .enqueue(uuid::Uuid::new_v4(), "b", 1, 1, |_| Ok(2u32))
            .unwrap();
        let third = queue
            .enqueue(uuid::Uuid::new_v4(), "c", 1, 1, |_| Ok(3u32))
            .unwrap();
        assert_eq!(second.position(), Some(0));
        assert_eq!(third.position(), Some(1));
        assert_eq!(queue.waiting(), 2);

        // Leaving the queue moves everyone behind up, once the monitor notices.
        assert!(second.cancel());
        scheduler.tick();
        assert_eq!(third.position(), Some(0));
        assert!(matches!(running.status(), TaskStatus::Processing { ticks: 1 }));

        release_tx.send(()).unwrap();
        assert_eq!(running.wait().unwrap(), 7);
        assert!(matches!(second.wait(), Err(CreationError::Cancelled)));
        assert_eq!(third.wait().unwrap(), 3);
        assert_eq!(queue.in_flight(), 0);
    }
    #[test]
    fn times_out() {
        let (queue, scheduler) = queue(1);
        let owner = uuid::Uuid::new_v4();
        let (started_tx, started) = bounded(1);
        let (stopped_tx, stopped) = bounded(1);
        let task = queue
            .enqueue(owner, "slow", 1, 1, move |context| {
                started_tx.send(()).unwrap();
                while !context.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                stopped_tx.send(()).unwrap();
                context.check().map(|()| 0u32)
            })
            .unwrap();
        recv(&started);
        // 10ms * 3 ticks isn't over 30ms yet.
        scheduler.tick_n(3);
        assert!(queue.is_busy(owner));
        scheduler.tick();
        assert!(!queue.is_busy(owner));
        assert!(matches!(task.wait(), Err(CreationError::TimedOut)));
        recv(&stopped);
        assert_eq!(scheduler.live_tasks(), 0);
    }
    #[test]
    fn committed_job_is_not_timed_out() {
        let (queue, scheduler) = queue(1);
        let (started_tx, started) = bounded(1);
        let (release_tx, release) = bounded::<()>(1);
        let task = queue
            .enqueue(uuid::Uuid::new_v4(), "commit", 1, 1, move |context| {
                context.commit()?;
                started_tx.send(()).unwrap();
                release.recv().unwrap();
                Ok(5u32)
            })
            .unwrap();
        recv(&started);
        scheduler.tick_n(10);
        assert!(!task.cancel());
        release_tx.send(()).unwrap();
        assert_eq!(task.wait().unwrap(), 5);
    }
    #[test]
    fn panic_is_captured() {
        let (queue, _scheduler) = queue(1);
        let owner = uuid::Uuid::new_v4();
        let task = queue
            .enqueue(owner, "boom", 1, 1, |_| -> Result<u32, CreationError> {
                panic!("decoder exploded")
            })
            .unwrap();
        match task.wait() {
            Err(CreationError::Panicked(message)) => assert!(message.contains("decoder exploded")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!queue.is_busy(owner));
    }
    #[test]
    fn progress_and_errors() {
        let (queue, _scheduler) = queue(1);
        let (done_tx, done) = bounded(1);
        let mut task = queue
            .enqueue(uuid::Uuid::new_v4(), "p", 1, 1, move |context| {
                context.progress("dithering");
                done_tx.send(()).unwrap();
                Err::<u32, _>(CreationError::Other("no".to_owned()))
            })
            .unwrap();
        recv(&done);
        assert_eq!(task.progress().as_deref(), Some("dithering"));
        let result = loop {
            if let Some(result) = task.try_result() {
                break result;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(matches!(result, Err(CreationError::Other(_))));
        assert_eq!(task.status(), TaskStatus::Finished);
    }
    #[test]
    fn shutdown_cancels_and_rejects() {
        let (queue, _scheduler) = queue(1);
        let (started_tx, started) = bounded(1);
        let (release_tx, release) = bounded(1);
        let running = queue
            .enqueue(uuid::Uuid::new_v4(), "a", 1, 1, gated(started_tx, release))
            .unwrap();
        recv(&started);
        let waiting = queue
            .enqueue(uuid::Uuid::new_v4(), "b", 1, 1, |_| Ok(0u32))
            .unwrap();
        queue.shutdown();
        assert!(matches!(
            queue.enqueue(uuid::Uuid::new_v4(), "c", 1, 1, |_| Ok(0u32)),
            Err(EnqueueRejected::ShuttingDown)
        ));
        assert!(matches!(running.wait(), Err(CreationError::Cancelled)));
        assert!(matches!(waiting.wait(), Err(CreationError::Cancelled)));
        // Let the worker go, its result goes nowhere.
        release_tx.send(()).unwrap();
    }
    #[test]
    fn async_result() {
        let (queue, _scheduler) = queue(1);
        let task = queue
            .enqueue(uuid::Uuid::new_v4(), "a", 1, 1, |_| Ok(9u32))
            .unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(runtime.block_on(task.result()).unwrap(), 9);
    }
}
