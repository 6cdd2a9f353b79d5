use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::FeedSpec;
use crate::runtime::WorkerHandle;

/// Lifecycle state of a feed's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Starting,
    Running,
    Crashed,
    Failed,
    Stopping,
    Stopped,
    Removed,
}

/// Why a feed is not running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Mandatory configuration is missing; waits for a config edit
    InvalidSpec,
    StartFailed,
    /// The previous worker could not be stopped or removed
    StopFailed,
    Timeout,
    /// A worker with our name exists and is not ours to take over
    NameConflict,
    /// Crashed under `RestartPolicy::Never`; waits for a config edit
    CrashedNoRestart,
}

impl FailureKind {
    /// Retried on the next natural trigger?
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::StartFailed | Self::StopFailed | Self::Timeout | Self::NameConflict
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

/// The reconciler's working state for one feed
#[derive(Debug, Clone)]
pub struct FeedRecord {
    /// Most recently applied spec
    pub spec: FeedSpec,
    pub handle: Option<WorkerHandle>,
    pub status: FeedStatus,
    pub failure: Option<Failure>,
    pub last_transition: DateTime<Utc>,
    /// When a start was last attempted
    pub last_start: Option<DateTime<Utc>>,
    /// Starts after the first one
    pub restarts: u32,
}

/// Records keyed by feed name
pub type FeedState = BTreeMap<String, FeedRecord>;

impl FeedRecord {
    pub fn new(spec: FeedSpec) -> Self {
        Self {
            spec,
            handle: None,
            status: FeedStatus::Starting,
            failure: None,
            last_transition: Utc::now(),
            last_start: None,
            restarts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Change status and stamp the transition time
    pub fn set_status(&mut self, status: FeedStatus) {
        self.status = status;
        self.last_transition = Utc::now();
        if status == FeedStatus::Running {
            self.failure = None;
        }
    }

    /// Mark failed with a reason
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.failure = Some(Failure {
            kind,
            reason: reason.into(),
        });
        self.set_status(FeedStatus::Failed);
    }

    /// Note a start attempt
    pub fn mark_start(&mut self) {
        if self.last_start.is_some() {
            self.restarts = self.restarts.saturating_add(1);
        }
        self.last_start = Some(Utc::now());
        self.set_status(FeedStatus::Starting);
    }

    pub fn is_running(&self) -> bool {
        self.status == FeedStatus::Running
    }

    /// Parked records only move again when their spec changes.
    pub fn is_parked(&self) -> bool {
        match self.status {
            FeedStatus::Failed => self
                .failure
                .as_ref()
                .map(|f| !f.kind.is_retriable())
                .unwrap_or(true),
            FeedStatus::Stopped | FeedStatus::Removed => true,
            _ => false,
        }
    }

    /// Waiting for another start attempt, and allowed to have one now?
    pub fn due_for_start(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        let waiting = match self.status {
            FeedStatus::Crashed => true,
            FeedStatus::Failed => !self.is_parked(),
            _ => false,
        };
        if !waiting {
            return false;
        }
        match self.last_start {
            None => true,
            Some(at) => {
                let min = chrono::Duration::from_std(min_interval)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now.signed_duration_since(at) >= min
            }
        }
    }
}
