//! Owned handles for background loops
//!
//! Every periodic task (nonce resync, gas refresh, filter polling, fanout) is
//! spawned behind a [`TaskHandle`]. Dropping the handle cancels the task;
//! [`TaskHandle::shutdown`] cancels it and waits for it to exit.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `task` on the runtime; it must exit once `cancel` fires
    pub fn spawn<F>(name: &'static str, cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            cancel,
            join: Some(tokio::spawn(task)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Cancel the task and wait until it has exited
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!("Background task {} panicked: {}", self.name, e);
                }
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
