//! Shared start/stop plumbing for the long-running service loops.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a spawned service loop. Dropping it does NOT stop the task;
/// call [`ServiceTask::stop`] so the loop is awaited to completion — stop
/// is a barrier: once it returns, no further state mutation happens from
/// that loop.
pub(crate) struct ServiceTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ServiceTask {
    pub(crate) fn new(shutdown: watch::Sender<bool>, handle: JoinHandle<()>) -> Self {
        ServiceTask { shutdown, handle }
    }

    /// Signal the loop to exit and await its termination.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
