use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::Trigger;
use crate::runtime::{bounded, WorkerHandle, WorkerRuntime};

/// Periodically checks that running workers are still alive
#[derive(Clone)]
pub struct HealthMonitor {
    runtime: Arc<dyn WorkerRuntime>,
    interval: Duration,
    op_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, interval: Duration, op_timeout: Duration) -> Self {
        Self {
            runtime,
            interval,
            op_timeout,
        }
    }

    /// Handles whose worker is no longer running.
    ///
    /// A probe that errors or times out says nothing about the worker, so it
    /// is not reported.
    pub async fn probe(&self, handles: &[WorkerHandle]) -> Vec<WorkerHandle> {
        let mut set = JoinSet::new();
        for handle in handles.iter().cloned() {
            let runtime = Arc::clone(&self.runtime);
            let limit = self.op_timeout;
            set.spawn(async move {
                let result =
                    bounded("inspect", &handle.feed, limit, runtime.is_running(&handle)).await;
                (handle, result)
            });
        }

        let mut crashed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => {}
                Ok((handle, Ok(false))) => crashed.push(handle),
                Ok((handle, Err(e))) => {
                    warn!(feed = %handle.feed, worker = %handle, error = %e, "Health probe failed");
                }
                Err(e) => warn!(error = %e, "Health probe task aborted"),
            }
        }
        crashed.sort_by(|a, b| a.feed.cmp(&b.feed));
        crashed
    }

    /// Probe whatever is currently running every interval, until `triggers` closes.
    pub async fn run(
        self,
        running: watch::Receiver<Vec<WorkerHandle>>,
        triggers: mpsc::UnboundedSender<Trigger>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; the initial pass just confirmed everything
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let handles = running.borrow().clone();
            if handles.is_empty() {
                continue;
            }
            debug!(count = handles.len(), "Probing workers");
            for handle in self.probe(&handles).await {
                if triggers.send(Trigger::Crashed(handle)).is_err() {
                    return;
                }
            }
            if triggers.is_closed() {
                return;
            }
        }
    }
}
