//! Boundary to the container runtime that hosts feed workers.
//!
//! The engine never talks to a runtime directly; everything goes through
//! [`WorkerRuntime`]. Commands are assumed to be delivered at least once, so
//! implementations treat "already stopped" and "already removed" as success.

mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerCli;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::feed::FeedSpec;

/// Label carrying the feed name on every worker we create
pub const FEED_LABEL: &str = "feedvisor.feed";

/// Reference to a worker created by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    /// `<prefix>-<feed>`
    pub worker_name: String,
    pub feed: String,
    /// Runtime-assigned id; empty when only the name is known
    pub id: String,
}

impl WorkerHandle {
    pub fn new(
        worker_name: impl Into<String>,
        feed: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            feed: feed.into(),
            id: id.into(),
        }
    }

    /// Most precise reference the runtime accepts
    pub fn reference(&self) -> &str {
        if self.id.is_empty() {
            &self.worker_name
        } else {
            &self.id
        }
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.worker_name)
    }
}

/// Deterministic worker name for a feed
pub fn worker_name(prefix: &str, feed: &str) -> String {
    format!("{}-{}", prefix, feed)
}

/// `key=value` label match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Remove a stopped worker of ours that holds the name
    pub replace_stopped: bool,
}

/// Result of a label listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub handle: WorkerHandle,
    pub running: bool,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("worker {} is already running", .0.worker_name)]
    AlreadyRunning(WorkerHandle),

    #[error("worker name {worker} is taken: {reason}")]
    NameConflict { worker: String, reason: String },

    #[error("{op} timed out for feed {feed}")]
    Timeout { op: &'static str, feed: String },

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{op} failed for {worker}: {message}")]
    Command {
        op: &'static str,
        worker: String,
        message: String,
    },

    #[error("failed to invoke runtime: {0}")]
    Io(#[from] std::io::Error),
}

/// Start/stop/inspect capability of a worker runtime
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Reachability check
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create and start a worker.
    ///
    /// Returns [`RuntimeError::AlreadyRunning`] when a live worker of ours
    /// already holds the name, and [`RuntimeError::NameConflict`] when the name
    /// belongs to someone else or to a stopped worker that may not be replaced.
    async fn start(
        &self,
        worker_name: &str,
        spec: &FeedSpec,
        opts: StartOptions,
    ) -> Result<WorkerHandle, RuntimeError>;

    /// Graceful stop, forced after `timeout`
    async fn stop(&self, handle: &WorkerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError>;

    async fn is_running(&self, handle: &WorkerHandle) -> Result<bool, RuntimeError>;

    /// Exit code of a stopped worker, when the runtime records one
    async fn exit_code(&self, _handle: &WorkerHandle) -> Result<Option<i64>, RuntimeError> {
        Ok(None)
    }

    async fn capture_logs(&self, handle: &WorkerHandle) -> Result<Vec<u8>, RuntimeError>;

    async fn list_by_label(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<WorkerSummary>, RuntimeError>;
}

/// Run a runtime call under a deadline
pub async fn bounded<T, F>(
    op: &'static str,
    feed: &str,
    limit: Duration,
    call: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            op,
            feed: feed.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_name_convention() {
        assert_eq!(worker_name("ldes-consumer", "marine"), "ldes-consumer-marine");
    }

    #[test]
    fn test_handle_reference_prefers_id() {
        let handle = WorkerHandle::new("ldes-consumer-a", "a", "");
        assert_eq!(handle.reference(), "ldes-consumer-a");

        let handle = WorkerHandle::new("ldes-consumer-a", "a", "f00d");
        assert_eq!(handle.reference(), "f00d");
    }

    #[test]
    fn test_selector_display() {
        let selector = LabelSelector::new("com.docker.compose.project", "kgap");
        assert_eq!(selector.to_string(), "com.docker.compose.project=kgap");
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), RuntimeError> =
            bounded("stop", "a", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(RuntimeError::Timeout { op, feed }) => {
                assert_eq!(op, "stop");
                assert_eq!(feed, "a");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded("start", "a", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
