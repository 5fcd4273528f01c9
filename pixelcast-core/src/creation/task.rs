//! The caller's and the job's views of one creation task.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use super::{CreationError, QueueState, TaskId};
use crate::{schedule::TaskHandle, sink::OwnerId};

/// Where a task is at, as last observed by its monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for a worker, with this many jobs ahead of it.
    Queued { position: usize },
    /// Running for this many monitor ticks.
    Processing { ticks: u64 },
    Finished,
}

mod state {
    pub const QUEUED: u8 = 0;
    pub const RUNNING: u8 = 1;
    /// Past the point of no return, cancellation is ignored.
    pub const COMMITTED: u8 = 2;
    pub const CANCELLED: u8 = 3;
    pub const TIMED_OUT: u8 = 4;
}

/// Type-erased control block, shared by the task, its job and its monitor.
pub(super) struct Control {
    state: AtomicU8,
    finished: AtomicBool,
    status: parking_lot::Mutex<TaskStatus>,
    progress: parking_lot::Mutex<Option<String>>,
}
impl Control {
    pub(super) fn new(position: usize) -> Self {
        Self {
            state: AtomicU8::new(state::QUEUED),
            finished: AtomicBool::new(false),
            status: parking_lot::Mutex::new(TaskStatus::Queued { position }),
            progress: parking_lot::Mutex::new(None),
        }
    }
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
    /// Move a queued or running task into an aborted state. False if it's committed or already aborted.
    fn abort(&self, to: u8) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                matches!(current, state::QUEUED | state::RUNNING).then_some(to)
            })
            .is_ok()
    }
    fn abort_error(&self) -> Option<CreationError> {
        match self.state() {
            state::CANCELLED => Some(CreationError::Cancelled),
            state::TIMED_OUT => Some(CreationError::TimedOut),
            _ => None,
        }
    }
    fn set_status(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }
}

/// Handed to a running job, to observe cancellation and report progress.
pub struct JobContext {
    control: Arc<Control>,
}
impl JobContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.abort_error().is_some()
    }
    /// Bail out if the task has been cancelled or timed out.
    pub fn check(&self) -> Result<(), CreationError> {
        self.control.abort_error().map_or(Ok(()), Err)
    }
    /// Declare that the job is about to apply side effects it can't undo. From here on the task
    /// can no longer be cancelled or time out. Fails if that already happened.
    pub fn commit(&self) -> Result<(), CreationError> {
        if self.control.transition(state::RUNNING, state::COMMITTED)
            || self.control.state() == state::COMMITTED
        {
            Ok(())
        } else {
            self.check()?;
            Err(CreationError::Other("job committed before starting".to_owned()))
        }
    }
    pub fn progress(&self, message: impl Into<String>) {
        *self.control.progress.lock() = Some(message.into());
    }
}

/// Something that can be cancelled without knowing its result type.
pub(super) trait Cancellable: Send + Sync {
    fn cancel(&self) -> bool;
}

pub(super) struct TaskShared<T> {
    pub(super) id: TaskId,
    pub(super) owner: OwnerId,
    pub(super) description: String,
    pub(super) control: Arc<Control>,
    sender: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<Result<T, CreationError>>>>,
    pub(super) monitor: parking_lot::Mutex<Option<TaskHandle>>,
    queue: std::sync::Weak<QueueState>,
}

impl<T: Send + 'static> TaskShared<T> {
    pub(super) fn new(
        id: TaskId,
        owner: OwnerId,
        description: String,
        position: usize,
        queue: std::sync::Weak<QueueState>,
    ) -> (Arc<Self>, tokio::sync::oneshot::Receiver<Result<T, CreationError>>) {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let shared = Arc::new(Self {
            id,
            owner,
            description,
            control: Arc::new(Control::new(position)),
            sender: parking_lot::Mutex::new(Some(sender)),
            monitor: parking_lot::Mutex::new(None),
            queue,
        });
        (shared, receiver)
    }
    /// Deliver the result. Only the first call does anything, returning whether it was that first call.
    pub(super) fn complete(&self, result: Result<T, CreationError>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        self.control.finished.store(true, Ordering::Release);
        self.control.set_status(TaskStatus::Finished);
        // Release the owner before the result is observable, so the caller may immediately enqueue again.
        if let Some(queue) = self.queue.upgrade() {
            queue.release(self.owner, self.id);
        }
        self.stop_monitor();
        match &result {
            Ok(_) => log::info!("{} finished", self.description),
            Err(e) => log::warn!("{} failed: {e}", self.description),
        }
        // Caller may have dropped their end, that's fine.
        let _ = sender.send(result);
        true
    }
    fn stop_monitor(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel();
        }
    }
    /// Worker side: run the job unless it was cancelled while waiting.
    pub(super) fn run<F>(self: Arc<Self>, job: F)
    where
        F: FnOnce(&JobContext) -> Result<T, CreationError>,
    {
        if !self.control.transition(state::QUEUED, state::RUNNING) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.started(self.id);
        }
        self.control.set_status(TaskStatus::Processing { ticks: 0 });
        log::debug!("{} started", self.description);
        let context = JobContext {
            control: self.control.clone(),
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&context)))
            .unwrap_or_else(|panic| {
                Err(CreationError::Panicked(crate::util::panic_message(&*panic)))
            });
        if !self.complete(result) {
            log::debug!("{} finished after being abandoned", self.description);
        }
    }
    /// Monitor side: refresh the queue position, or enforce the processing timeout.
    pub(super) fn monitor_tick(
        &self,
        ticks: &mut u64,
        period: std::time::Duration,
        timeout: std::time::Duration,
    ) {
        if self.control.finished.load(Ordering::Acquire) {
            self.stop_monitor();
            return;
        }
        match self.control.state() {
            state::QUEUED => {
                if let Some(position) = self.queue.upgrade().and_then(|q| q.position(self.id)) {
                    log::trace!("{} queued at {position}", self.description);
                    self.control.set_status(TaskStatus::Queued { position });
                }
            }
            current @ (state::RUNNING | state::COMMITTED) => {
                *ticks += 1;
                self.control
                    .set_status(TaskStatus::Processing { ticks: *ticks });
                let elapsed =
                    period.saturating_mul(u32::try_from(*ticks).unwrap_or(u32::MAX));
                if current == state::RUNNING
                    && elapsed > timeout
                    && self.control.abort(state::TIMED_OUT)
                {
                    log::warn!(
                        "{} still running after {:?}, cancelling",
                        self.description,
                        elapsed
                    );
                    self.complete(Err(CreationError::TimedOut));
                }
            }
            _ => (),
        }
    }
}

impl<T: Send + 'static> Cancellable for TaskShared<T> {
    fn cancel(&self) -> bool {
        if self.control.abort(state::CANCELLED) {
            self.complete(Err(CreationError::Cancelled))
        } else {
            false
        }
    }
}

/// Handle to a queued or running creation job.
pub struct CreationTask<T> {
    pub(super) shared: Arc<TaskShared<T>>,
    pub(super) receiver: tokio::sync::oneshot::Receiver<Result<T, CreationError>>,
}
impl<T: Send + 'static> CreationTask<T> {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.shared.id
    }
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.shared.owner
    }
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.shared.control.status.lock().clone()
    }
    /// Last reported position in the queue, None once started.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        match self.status() {
            TaskStatus::Queued { position } => Some(position),
            _ => None,
        }
    }
    /// Last message reported by the job.
    #[must_use]
    pub fn progress(&self) -> Option<String> {
        self.shared.control.progress.lock().clone()
    }
    /// Request cancellation. A queued job never runs. A running one is told to stop, and the task completes
    /// with [`CreationError::Cancelled`] right away. Returns false if it was too late.
    pub fn cancel(&self) -> bool {
        Cancellable::cancel(&*self.shared)
    }
    /// Block until the task completes. Must not be called from within an async context.
    pub fn wait(self) -> Result<T, CreationError> {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Err(CreationError::Other("task dropped".to_owned())))
    }
    /// Wait for the task to complete.
    pub async fn result(self) -> Result<T, CreationError> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(CreationError::Other("task dropped".to_owned())))
    }
    /// The result, if ready.
    pub fn try_result(&mut self) -> Option<Result<T, CreationError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(tokio::sync::oneshot::error::TryRecvError::Empty) => None,
            Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                Some(Err(CreationError::Other("task dropped".to_owned())))
            }
        }
    }
}
impl<T> std::fmt::Debug for CreationTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationTask")
            .field("id", &self.shared.id)
            .field("description", &self.shared.description)
            .finish_non_exhaustive()
    }
}
