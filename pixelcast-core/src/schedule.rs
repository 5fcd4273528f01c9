//! # Scheduling
//!
//! Every background activity in the pipeline (cache control, creation monitors, distribution, tombstone painting)
//! is a closure run at a fixed interval. Components are handed a [`Scheduler`] rather than spawning their own timers,
//! so tests can drive them tick-by-tick with a [`ManualScheduler`].

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Cancels a repeating task. Clones refer to the same task.
#[derive(Clone, Default, Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}
impl TaskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Stop the task. Once this returns, no new run of the task will begin,
    /// though one that is already running is allowed to finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` once every `period` until the returned handle is cancelled.
    fn every(&self, period: Duration, task: Task) -> TaskHandle;
}

/// Run one iteration of a task, catching and logging a panic instead of taking down the scheduler.
fn run_guarded(task: &mut Task) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task())) {
        log::error!(
            "Scheduled task panicked: {}",
            crate::util::panic_message(&*panic)
        );
    }
}

/// Runs tasks on a tokio runtime.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}
impl TokioScheduler {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}
impl Scheduler for TokioScheduler {
    fn every(&self, period: Duration, mut task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancel = handle.clone();
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // A slow tick shouldn't result in a burst of catch-up ticks.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if cancel.is_cancelled() {
                    break;
                }
                run_guarded(&mut task);
            }
        });
        handle
    }
}

/// A scheduler that only runs tasks when told to. Every call to [`ManualScheduler::tick`]
/// runs each live task exactly once, regardless of its period.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: parking_lot::Mutex<Vec<(TaskHandle, Task)>>,
    ticks: AtomicU64,
}
impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    pub fn tick(&self) {
        // Take the tasks out, so that tasks scheduling other tasks don't deadlock.
        let mut running = std::mem::take(&mut *self.tasks.lock());
        running.retain(|(handle, _)| !handle.is_cancelled());
        for (handle, task) in &mut running {
            if !handle.is_cancelled() {
                run_guarded(task);
            }
        }
        let mut lock = self.tasks.lock();
        // Anything scheduled during the run landed in the now-empty list.
        running.append(&mut lock);
        *lock = running;
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
    pub fn tick_n(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
    /// Count of tasks that have not been cancelled.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(handle, _)| !handle.is_cancelled())
            .count()
    }
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
impl Scheduler for ManualScheduler {
    fn every(&self, _period: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        self.tasks.lock().push((handle.clone(), task));
        handle
    }
}
