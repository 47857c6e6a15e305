use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::execution::{ExecutionState, TaskExecution};

pub(crate) const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;

/// Bounded pool running task executions on a tokio runtime.
pub(crate) struct Scheduler {
    runtime: Handle,
    permits: Arc<Semaphore>,
    suspended: watch::Sender<bool>,
    shutdown: CancellationToken,
    next_task_id: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(runtime: Handle, max_concurrent_tasks: usize) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            suspended,
            shutdown: CancellationToken::new(),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Token for a new task; cancelled together with the scheduler.
    pub(crate) fn task_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Queues the execution and returns at once. The spawned future owns the
    /// execution; the handle only observes it.
    pub(crate) fn submit(&self, execution: TaskExecution) -> TaskHandle {
        let execution = Arc::new(execution);
        let handle = TaskHandle {
            id: execution.id(),
            execution: Arc::downgrade(&execution),
        };

        let permits = Arc::clone(&self.permits);
        let mut suspended = self.suspended.subscribe();
        self.runtime.spawn(async move {
            let token = execution.cancellation_token().clone();
            // A permit taken while the queue is suspended goes back to the pool.
            let _permit = loop {
                let resumed = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    resumed = wait_until_resumed(&mut suspended) => resumed,
                };
                if !resumed {
                    execution.cancel();
                    return;
                }

                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = Arc::clone(&permits).acquire_owned() => Some(permit),
                };
                let permit = match permit {
                    None => {
                        execution.cancel();
                        return;
                    }
                    Some(Ok(permit)) => permit,
                    Some(Err(_)) => {
                        execution.fail(Error::SchedulerClosed);
                        return;
                    }
                };
                if !*suspended.borrow_and_update() {
                    break permit;
                }
                drop(permit);
            };
            execution.run().await;
        });
        handle
    }

    pub(crate) fn suspend(&self) {
        debug!("task queue suspended");
        self.suspended.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        debug!("task queue resumed");
        self.suspended.send_replace(false);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.permits.close();
    }
}

async fn wait_until_resumed(suspended: &mut watch::Receiver<bool>) -> bool {
    loop {
        let is_suspended = *suspended.borrow_and_update();
        if !is_suspended {
            return true;
        }
        if suspended.changed().await.is_err() {
            return false;
        }
    }
}

/// Caller-side view of a submitted task.
///
/// Holding a handle does not keep the task alive.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    id: u64,
    execution: Weak<TaskExecution>,
}

impl TaskHandle {
    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Self {
        Self {
            id,
            execution: Weak::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the task. No completion is delivered once this returns true.
    pub fn cancel(&self) -> bool {
        self.execution
            .upgrade()
            .is_some_and(|execution| execution.cancel())
    }

    pub fn state(&self) -> ExecutionState {
        self.execution
            .upgrade()
            .map_or(ExecutionState::Finished, |execution| execution.state())
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ExecutionState::Finished
    }
}
