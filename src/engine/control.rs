use std::future::Future;
use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EngineError, Reconciler};
use crate::config::{has_changed, ConfigLoader};
use crate::feed::{FeedSet, FeedState, FeedStatus};
use crate::runtime::WorkerHandle;

/// Why the control loop should wake up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic timer
    Tick,
    /// File-system notification on the configuration
    ConfigChanged,
    /// Health monitor found this worker dead
    Crashed(WorkerHandle),
}

/// Everything that piled up while the previous pass ran
#[derive(Debug, Default)]
pub struct PendingWork {
    pub tick: bool,
    pub config_changed: bool,
    pub crashed: Vec<WorkerHandle>,
}

impl PendingWork {
    pub fn add(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Tick => self.tick = true,
            Trigger::ConfigChanged => self.config_changed = true,
            Trigger::Crashed(handle) => {
                if !self.crashed.contains(&handle) {
                    self.crashed.push(handle);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.tick && !self.config_changed && self.crashed.is_empty()
    }
}

/// What the loop leaves behind
#[derive(Debug)]
pub struct RunSummary {
    /// Some feed reached `Running` at some point
    pub ever_running: bool,
    pub state: FeedState,
}

/// Sole owner of the feed state. Passes are strictly serialized.
pub struct ControlLoop {
    reconciler: Reconciler,
    loader: ConfigLoader,
    config_path: PathBuf,
    desired: FeedSet,
    state: FeedState,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    running: watch::Sender<Vec<WorkerHandle>>,
    ever_running: bool,
}

impl ControlLoop {
    pub fn new(
        reconciler: Reconciler,
        loader: ConfigLoader,
        config_path: PathBuf,
        triggers: mpsc::UnboundedReceiver<Trigger>,
    ) -> Self {
        let (running, _) = watch::channel(Vec::new());
        Self {
            reconciler,
            loader,
            config_path,
            desired: FeedSet::default(),
            state: FeedState::new(),
            triggers,
            running,
            ever_running: false,
        }
    }

    /// Running set, refreshed after every pass
    pub fn subscribe(&self) -> watch::Receiver<Vec<WorkerHandle>> {
        self.running.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> &FeedState {
        &self.state
    }

    /// First load, orphan discovery and the initial pass.
    ///
    /// Fails when the configuration cannot be read, the runtime is unreachable,
    /// or no feed came up. Returns the number of running feeds.
    pub async fn bootstrap(&mut self) -> Result<usize, EngineError> {
        let loaded = self.loader.load(&self.config_path)?;
        for problem in &loaded.invalid {
            warn!(error = %problem, "Configuration problem");
        }
        self.desired = loaded.set;
        info!(
            path = %self.config_path.display(),
            feeds = self.desired.len(),
            valid = self.desired.valid_count(),
            "Configuration loaded"
        );

        self.reconciler.ping().await?;

        match self.reconciler.discover_orphans(&self.desired).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Cleared leftover workers"),
            Err(e) => warn!(error = %e, "Could not list existing workers"),
        }

        self.pass(Uuid::new_v4()).await;

        let running = self.running_count();
        if running == 0 {
            return Err(EngineError::NothingStarted {
                total: self.desired.len(),
            });
        }
        Ok(running)
    }

    /// Serve triggers until `shutdown` resolves or every sender is gone, then
    /// stop the running workers.
    pub async fn run<S>(mut self, shutdown: S) -> RunSummary
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let first = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                trigger = self.triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => {
                        debug!("Trigger channel closed");
                        break;
                    }
                },
            };
            let work = self.drain(first);
            self.process(work).await;
        }

        let state = std::mem::take(&mut self.state);
        self.state = self.reconciler.shutdown(state).await;
        self.publish();

        RunSummary {
            ever_running: self.ever_running,
            state: self.state,
        }
    }

    /// Coalesce everything already queued behind `first`
    pub fn drain(&mut self, first: Trigger) -> PendingWork {
        let mut work = PendingWork::default();
        work.add(first);
        while let Ok(trigger) = self.triggers.try_recv() {
            work.add(trigger);
        }
        work
    }

    /// Handle one batch. Returns whether a reconciliation pass ran.
    pub async fn process(&mut self, work: PendingWork) -> bool {
        if work.is_empty() {
            return false;
        }
        let id = Uuid::new_v4();
        let crashed = !work.crashed.is_empty();

        if crashed {
            info!(pass = %id, count = work.crashed.len(), "Recovering crashed workers");
            let state = std::mem::take(&mut self.state);
            self.state = self.reconciler.recover(work.crashed, state).await;
        }

        let reloaded = (work.config_changed || work.tick) && self.refresh_config();
        if !(reloaded || work.tick || crashed) {
            debug!(pass = %id, "Configuration unchanged, skipping pass");
            return false;
        }

        self.pass(id).await;
        true
    }

    async fn pass(&mut self, id: Uuid) {
        debug!(pass = %id, "Reconciling");
        let state = std::mem::take(&mut self.state);
        self.state = self.reconciler.reconcile(&self.desired, state).await;
        self.publish();

        let failed = self
            .state
            .values()
            .filter(|r| r.status == FeedStatus::Failed)
            .count();
        debug!(
            pass = %id,
            running = self.running_count(),
            failed,
            total = self.state.len(),
            "Pass complete"
        );
    }

    /// Reload when the configuration actually changed. Returns whether it did.
    fn refresh_config(&mut self) -> bool {
        let version = match has_changed(&self.config_path, &self.desired.version) {
            Ok((false, version)) => {
                self.desired.version = version;
                return false;
            }
            Ok((true, version)) => version,
            Err(e) => {
                error!(error = %e, "Cannot check configuration, keeping current feeds");
                return false;
            }
        };

        match self.loader.load(&self.config_path) {
            Ok(loaded) => {
                for problem in &loaded.invalid {
                    warn!(error = %problem, "Configuration problem");
                }
                info!(
                    feeds = loaded.set.len(),
                    valid = loaded.set.valid_count(),
                    "Configuration reloaded"
                );
                self.desired = loaded.set;
                true
            }
            Err(e) => {
                error!(error = %e, "Reload failed, keeping current feeds");
                // Do not retry the same broken content on every tick
                self.desired.version = version;
                false
            }
        }
    }

    fn publish(&mut self) {
        let handles = Reconciler::running_handles(&self.state);
        if !handles.is_empty() {
            self.ever_running = true;
        }
        self.running.send_replace(handles);
    }

    fn running_count(&self) -> usize {
        self.state.values().filter(|r| r.is_running()).count()
    }
}
