use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::Diagnostics;
use crate::feed::{FailureKind, FeedRecord, FeedSet, FeedSpec, FeedState, FeedStatus};
use crate::runtime::{
    bounded, worker_name, LabelSelector, RuntimeError, StartOptions, WorkerHandle, WorkerRuntime,
};

/// Knobs of the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Workers are named `<prefix>-<feed>`
    pub prefix: String,
    /// Label that marks a worker as ours
    pub owner: LabelSelector,
    /// Deadline for any single runtime call
    pub op_timeout: Duration,
    /// Grace period handed to the runtime before it kills a worker
    pub stop_timeout: Duration,
    /// Wait between a start and the liveness confirmation
    pub startup_grace: Duration,
    /// Minimum time between two starts of one feed
    pub min_restart_interval: Duration,
    /// Feeds worked on concurrently within a pass
    pub max_parallel: usize,
    /// Tear down owned workers whose feed is not configured
    pub remove_orphans: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            prefix: "ldes-consumer".into(),
            owner: LabelSelector::new("com.docker.compose.project", "kgap"),
            op_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            startup_grace: Duration::ZERO,
            min_restart_interval: Duration::ZERO,
            max_parallel: 4,
            remove_orphans: false,
        }
    }
}

/// Work for one feed within a pass
#[derive(Debug)]
enum Job {
    /// Feed left the configuration
    Remove(FeedRecord),
    /// First start, or a retry of a failed one
    Start(FeedRecord),
    /// Spec edited: tear down, then start with the new spec
    Replace(FeedRecord, FeedSpec),
    /// Worker found dead
    Recover(FeedRecord),
    /// Engine is exiting
    Shutdown(FeedRecord),
}

/// Drives workers toward the desired feed set
#[derive(Clone)]
pub struct Reconciler {
    runtime: Arc<dyn WorkerRuntime>,
    settings: Arc<ReconcilerSettings>,
    diagnostics: Diagnostics,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn WorkerRuntime>,
        settings: ReconcilerSettings,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
            diagnostics,
        }
    }

    /// Is the runtime reachable at all?
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        bounded("ping", "*", self.settings.op_timeout, self.runtime.ping()).await
    }

    /// One full pass: removals, additions and edits.
    ///
    /// Unchanged feeds are left alone unless they are waiting for a retry.
    pub async fn reconcile(&self, desired: &FeedSet, mut state: FeedState) -> FeedState {
        let now = Utc::now();
        let mut jobs = Vec::new();

        let removed: Vec<String> = state
            .keys()
            .filter(|name| !desired.contains(name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(record) = state.remove(&name) {
                jobs.push((name, Job::Remove(record)));
            }
        }

        for (name, spec) in &desired.feeds {
            match state.remove(name) {
                None => match spec.validate() {
                    Ok(()) => jobs.push((name.clone(), Job::Start(FeedRecord::new(spec.clone())))),
                    Err(reason) => {
                        warn!(feed = %name, reason = %reason, "Feed is invalid, not starting");
                        let mut record = FeedRecord::new(spec.clone());
                        record.fail(FailureKind::InvalidSpec, reason);
                        state.insert(name.clone(), record);
                    }
                },
                Some(record) if record.spec.is_equivalent(spec) => {
                    if spec.validate().is_ok()
                        && record.due_for_start(now, self.settings.min_restart_interval)
                    {
                        jobs.push((name.clone(), Job::Start(record)));
                    } else {
                        state.insert(name.clone(), record);
                    }
                }
                Some(record) => {
                    info!(feed = %name, "Feed configuration changed");
                    jobs.push((name.clone(), Job::Replace(record, spec.clone())));
                }
            }
        }

        if jobs.is_empty() {
            debug!("Nothing to reconcile");
        }
        self.absorb(state, jobs).await
    }

    /// Handle workers the health monitor found dead.
    ///
    /// Reports for handles that no longer match a running record are stale and ignored.
    pub async fn recover(&self, crashed: Vec<WorkerHandle>, mut state: FeedState) -> FeedState {
        let mut jobs = Vec::new();
        for handle in crashed {
            let current = state
                .get(&handle.feed)
                .map(|r| r.is_running() && r.handle.as_ref() == Some(&handle))
                .unwrap_or(false);
            if !current {
                debug!(feed = %handle.feed, worker = %handle, "Ignoring stale crash report");
                continue;
            }
            if let Some(record) = state.remove(&handle.feed) {
                jobs.push((handle.feed.clone(), Job::Recover(record)));
            }
        }
        self.absorb(state, jobs).await
    }

    /// Stop every running worker before exit. Never fails.
    pub async fn shutdown(&self, mut state: FeedState) -> FeedState {
        let running: Vec<String> = state
            .iter()
            .filter(|(_, r)| r.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        info!(count = running.len(), "Stopping running workers");

        let mut jobs = Vec::new();
        for name in running {
            if let Some(record) = state.remove(&name) {
                jobs.push((name, Job::Shutdown(record)));
            }
        }
        self.absorb(state, jobs).await
    }

    /// Deal with workers left behind by an earlier engine lifetime.
    ///
    /// Live workers of configured feeds stay put so the first pass adopts them.
    /// Dead ones are cleared so the feed can start under its name. Workers of
    /// unconfigured feeds are torn down only when `remove_orphans` is set.
    pub async fn discover_orphans(&self, desired: &FeedSet) -> Result<usize, RuntimeError> {
        let owner = &self.settings.owner;
        let workers = bounded(
            "list",
            "*",
            self.settings.op_timeout,
            self.runtime.list_by_label(owner),
        )
        .await?;

        let own_prefix = format!("{}-", self.settings.prefix);
        let mut handled = 0;
        for worker in workers {
            let Some(suffix) = worker.handle.worker_name.strip_prefix(&own_prefix) else {
                continue;
            };
            let feed = if worker.handle.feed.is_empty() {
                suffix.to_string()
            } else {
                worker.handle.feed.clone()
            };
            let handle = WorkerHandle { feed, ..worker.handle };

            let configured = desired
                .get(&handle.feed)
                .map(|spec| spec.validate().is_ok())
                .unwrap_or(false);

            if configured {
                if worker.running {
                    info!(feed = %handle.feed, worker = %handle, "Found running worker, will adopt");
                } else {
                    info!(feed = %handle.feed, worker = %handle, "Clearing dead worker from a previous run");
                    self.capture(&handle).await;
                    self.discard(&handle).await;
                    handled += 1;
                }
            } else if self.settings.remove_orphans {
                info!(feed = %handle.feed, worker = %handle, "Removing orphaned worker");
                self.capture(&handle).await;
                if worker.running {
                    self.stop(&handle).await;
                }
                self.discard(&handle).await;
                handled += 1;
            } else {
                warn!(feed = %handle.feed, worker = %handle, "Orphaned worker left in place");
            }
        }
        Ok(handled)
    }

    /// Handles of every running record
    pub fn running_handles(state: &FeedState) -> Vec<WorkerHandle> {
        state
            .values()
            .filter(|r| r.is_running())
            .filter_map(|r| r.handle.clone())
            .collect()
    }

    /// Run jobs concurrently and fold their records back into `state`.
    async fn absorb(&self, mut state: FeedState, jobs: Vec<(String, Job)>) -> FeedState {
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut set = JoinSet::new();
        for (name, job) in jobs {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let record = this.run(job).await;
                (name, record)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Some(record))) => {
                    state.insert(name, record);
                }
                Ok((_, None)) => {}
                Err(e) => error!(error = %e, "Feed task aborted"),
            }
        }
        state
    }

    async fn run(&self, job: Job) -> Option<FeedRecord> {
        match job {
            Job::Remove(mut record) => {
                info!(feed = %record.name(), "Feed removed from configuration");
                if self.teardown(&mut record).await {
                    record.set_status(FeedStatus::Removed);
                    None
                } else {
                    Some(record)
                }
            }
            Job::Start(record) => Some(self.start(record).await),
            Job::Replace(mut old, spec) => {
                if !self.teardown(&mut old).await {
                    // Old worker may still be alive; retry on a later pass
                    old.spec = spec;
                    return Some(old);
                }
                let mut record = FeedRecord::new(spec);
                record.restarts = old.restarts;
                match record.spec.validate() {
                    Ok(()) => Some(self.start(record).await),
                    Err(reason) => {
                        warn!(feed = %record.name(), reason = %reason, "Feed is invalid, not starting");
                        record.fail(FailureKind::InvalidSpec, reason);
                        Some(record)
                    }
                }
            }
            Job::Recover(record) => Some(self.recover_one(record).await),
            Job::Shutdown(record) => Some(self.shutdown_one(record).await),
        }
    }

    /// Start sequence: Starting -> Running, or Failed.
    async fn start(&self, mut record: FeedRecord) -> FeedRecord {
        if record.handle.is_some() && !self.teardown(&mut record).await {
            return record;
        }

        let feed = record.name().to_string();
        let name = worker_name(&self.settings.prefix, &feed);
        let opts = StartOptions {
            replace_stopped: record.spec.remove_on_exit,
        };

        record.mark_start();
        info!(feed = %feed, worker = %name, attempt = record.restarts + 1, "Starting worker");

        let started = bounded(
            "start",
            &feed,
            self.settings.op_timeout,
            self.runtime.start(&name, &record.spec, opts),
        )
        .await;

        match started {
            Ok(handle) => {
                record.handle = Some(handle);
                self.confirm(record).await
            }
            Err(RuntimeError::AlreadyRunning(handle)) => {
                info!(feed = %feed, worker = %handle, "Adopting running worker");
                record.handle = Some(handle);
                record.set_status(FeedStatus::Running);
                record
            }
            Err(e) => {
                let kind = match e {
                    RuntimeError::NameConflict { .. } => FailureKind::NameConflict,
                    RuntimeError::Timeout { .. } => FailureKind::Timeout,
                    _ => FailureKind::StartFailed,
                };
                error!(feed = %feed, error = %e, "Failed to start worker");
                record.fail(kind, e.to_string());
                record
            }
        }
    }

    /// Confirm a freshly started worker is alive
    async fn confirm(&self, mut record: FeedRecord) -> FeedRecord {
        let Some(handle) = record.handle.clone() else {
            return record;
        };
        if !self.settings.startup_grace.is_zero() {
            tokio::time::sleep(self.settings.startup_grace).await;
        }

        let probe = bounded(
            "inspect",
            &handle.feed,
            self.settings.op_timeout,
            self.runtime.is_running(&handle),
        )
        .await;

        match probe {
            Ok(true) => {
                info!(feed = %handle.feed, worker = %handle, "Worker running");
                record.set_status(FeedStatus::Running);
            }
            Ok(false) => {
                error!(feed = %handle.feed, worker = %handle, "Worker exited during startup");
                self.capture(&handle).await;
                self.discard(&handle).await;
                record.handle = None;
                record.fail(FailureKind::StartFailed, "worker exited during startup");
            }
            Err(e) => {
                // The health monitor settles it on its next probe
                warn!(feed = %handle.feed, error = %e, "Could not confirm worker liveness");
                record.set_status(FeedStatus::Running);
            }
        }
        record
    }

    async fn recover_one(&self, mut record: FeedRecord) -> FeedRecord {
        let Some(handle) = record.handle.clone() else {
            return record;
        };
        let feed = handle.feed.clone();
        warn!(feed = %feed, worker = %handle, "Worker is not running");

        self.capture(&handle).await;
        record.set_status(FeedStatus::Crashed);

        let exit_code = bounded(
            "inspect",
            &feed,
            self.settings.op_timeout,
            self.runtime.exit_code(&handle),
        )
        .await
        .unwrap_or(None);

        let policy = record.spec.restart_policy;
        if policy.restarts_after(exit_code) {
            if self.discard(&handle).await {
                record.handle = None;
            }
            if record.due_for_start(Utc::now(), self.settings.min_restart_interval) {
                return self.start(record).await;
            }
            info!(
                feed = %feed,
                min_restart_interval = ?self.settings.min_restart_interval,
                "Restart deferred"
            );
            return record;
        }

        if exit_code == Some(0) {
            info!(feed = %feed, "Worker finished");
            record.set_status(FeedStatus::Stopped);
        } else {
            let reason = match exit_code {
                Some(code) => format!("worker exited with code {}", code),
                None => "worker stopped".to_string(),
            };
            warn!(feed = %feed, policy = %policy, reason = %reason, "Not restarting");
            record.fail(FailureKind::CrashedNoRestart, reason);
        }
        if record.spec.remove_on_exit && self.discard(&handle).await {
            record.handle = None;
        }
        record
    }

    async fn shutdown_one(&self, mut record: FeedRecord) -> FeedRecord {
        let Some(handle) = record.handle.clone() else {
            return record;
        };
        record.set_status(FeedStatus::Stopping);
        if !self.stop(&handle).await {
            return record;
        }
        record.set_status(FeedStatus::Stopped);
        self.capture(&handle).await;
        if record.spec.remove_on_exit && self.discard(&handle).await {
            record.handle = None;
            record.set_status(FeedStatus::Removed);
        }
        record
    }

    /// Stop then remove the record's worker. `false` leaves the handle in place.
    async fn teardown(&self, record: &mut FeedRecord) -> bool {
        let Some(handle) = record.handle.clone() else {
            return true;
        };
        record.set_status(FeedStatus::Stopping);
        if !self.stop(&handle).await {
            record.fail(FailureKind::StopFailed, "worker could not be stopped");
            return false;
        }
        record.set_status(FeedStatus::Stopped);
        if !self.discard(&handle).await {
            record.fail(FailureKind::StopFailed, "worker could not be removed");
            return false;
        }
        record.handle = None;
        record.set_status(FeedStatus::Removed);
        true
    }

    async fn stop(&self, handle: &WorkerHandle) -> bool {
        info!(feed = %handle.feed, worker = %handle, "Stopping worker");
        let limit = self.settings.op_timeout + self.settings.stop_timeout;
        match bounded(
            "stop",
            &handle.feed,
            limit,
            self.runtime.stop(handle, self.settings.stop_timeout),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(feed = %handle.feed, worker = %handle, error = %e, "Failed to stop worker");
                false
            }
        }
    }

    async fn discard(&self, handle: &WorkerHandle) -> bool {
        match bounded(
            "remove",
            &handle.feed,
            self.settings.op_timeout,
            self.runtime.remove(handle),
        )
        .await
        {
            Ok(()) => {
                debug!(feed = %handle.feed, worker = %handle, "Worker removed");
                true
            }
            Err(e) => {
                warn!(feed = %handle.feed, worker = %handle, error = %e, "Failed to remove worker");
                false
            }
        }
    }

    /// Save the worker's output; never blocks reconciliation on failure
    async fn capture(&self, handle: &WorkerHandle) {
        match bounded(
            "logs",
            &handle.feed,
            self.settings.op_timeout,
            self.runtime.capture_logs(handle),
        )
        .await
        {
            Ok(bytes) => {
                self.diagnostics.persist(&handle.feed, &bytes).await;
            }
            Err(e) => {
                warn!(feed = %handle.feed, worker = %handle, error = %e, "Could not capture logs");
            }
        }
    }
}
