//! Main controller implementation.
//!
//! Wires the watchers, the work queue and the reconcile workers together and
//! owns their tasks until shutdown.

use crate::error::ControllerError;
use crate::objects::ResourceKind;
use crate::queue::{spawn_workers, KeyHandler, WorkQueue};
use crate::reconciler::Reconciler;
use crate::watcher::{WatchScope, Watcher};
use futures::future::{join_all, select_all};
use kube::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for MonitoringInstance resources.
pub struct Controller {
    instance_watcher: JoinHandle<Result<(), ControllerError>>,
    owned_watchers: Vec<JoinHandle<Result<(), ControllerError>>>,
    workers: Vec<JoinHandle<()>>,
    queue: Arc<WorkQueue>,
    shutdown_grace: Duration,
}

impl Controller {
    /// Starts the watchers and `workers` reconcile workers.
    pub fn new(
        client: Client,
        scope: WatchScope,
        queue: Arc<WorkQueue>,
        reconciler: Arc<Reconciler>,
        workers: usize,
        shutdown_grace: Duration,
    ) -> Self {
        info!("Initializing Monitoring Controller");

        let watcher = Arc::new(Watcher::new(client, Arc::clone(&queue), scope));

        let instance_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_instances().await })
        };

        let owned_watchers = ResourceKind::ALL
            .into_iter()
            .map(|kind| {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move { watcher.watch_owned(kind).await })
            })
            .collect();

        let handler: Arc<dyn KeyHandler> = reconciler;
        let workers = spawn_workers(workers, &queue, &handler);

        Self {
            instance_watcher,
            owned_watchers,
            workers,
            queue,
            shutdown_grace,
        }
    }

    /// Runs the controller until `shutdown` resolves or a watcher exits.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), ControllerError> {
        info!("Monitoring Controller running");

        let aborts: Vec<_> = self.owned_watchers.iter().map(JoinHandle::abort_handle).collect();
        let instance_abort = self.instance_watcher.abort_handle();
        let owned = select_all(std::mem::take(&mut self.owned_watchers));

        // Watchers only return on failure.
        let result = tokio::select! {
            result = &mut self.instance_watcher => watcher_exit("MonitoringInstance", result),
            (result, _, _) = owned => watcher_exit("owned object", result),
            () = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        instance_abort.abort();
        for abort in aborts {
            abort.abort();
        }
        self.drain().await;
        result
    }

    /// Stops the queue and waits for in-flight reconciles up to the grace period.
    async fn drain(self) {
        self.queue.shut_down();
        let in_flight = self.queue.in_flight();
        if in_flight > 0 {
            info!("Waiting up to {:?} for {} in-flight reconcile(s)", self.shutdown_grace, in_flight);
        }
        if tokio::time::timeout(self.shutdown_grace, join_all(self.workers))
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed with reconciles still running");
        }
    }
}

fn watcher_exit(
    what: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{what} watcher panicked: {e}")))?
        .map_err(|e| ControllerError::Watch(format!("{what} watcher error: {e}")))
}
