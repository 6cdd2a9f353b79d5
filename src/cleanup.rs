//! One-shot removal of every worker the engine ever created for a project.

use std::time::Duration;

use tracing::{info, warn};

use crate::runtime::{LabelSelector, RuntimeError, WorkerRuntime};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub found: usize,
    pub removed: usize,
}

/// Stop and remove owned workers whose name starts with `<prefix>-`.
///
/// Only the listing can fail; per-worker errors are logged and skipped.
pub async fn cleanup(
    runtime: &dyn WorkerRuntime,
    owner: &LabelSelector,
    prefix: &str,
    stop_timeout: Duration,
) -> Result<CleanupReport, RuntimeError> {
    let workers = runtime.list_by_label(owner).await?;
    info!(owner = %owner, count = workers.len(), "Found labelled workers");

    let own_prefix = format!("{}-", prefix);
    let workers: Vec<_> = workers
        .into_iter()
        .filter(|w| w.handle.worker_name.starts_with(&own_prefix))
        .collect();

    let mut report = CleanupReport {
        found: workers.len(),
        removed: 0,
    };
    if workers.is_empty() {
        info!(prefix = %prefix, "No workers to clean up");
        return Ok(report);
    }

    for worker in workers {
        let handle = &worker.handle;
        if worker.running {
            match runtime.stop(handle, stop_timeout).await {
                Ok(()) => info!(worker = %handle, "Stopped"),
                Err(e) => warn!(worker = %handle, error = %e, "Failed to stop"),
            }
        }
        match runtime.remove(handle).await {
            Ok(()) => {
                info!(worker = %handle, "Removed");
                report.removed += 1;
            }
            Err(e) => warn!(worker = %handle, error = %e, "Failed to remove"),
        }
    }

    info!(removed = report.removed, found = report.found, "Cleanup complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{Call, FakeRuntime};

    #[tokio::test]
    async fn test_cleanup_removes_prefixed_workers() {
        let runtime = FakeRuntime::new();
        runtime.seed("ldes-consumer-a", "a", true, true);
        runtime.seed("ldes-consumer-b", "b", false, true);
        runtime.seed("graphdb", "", true, true);
        runtime.seed("ldes-consumer-foreign", "foreign", true, false);

        let owner = LabelSelector::new("com.docker.compose.project", "kgap");
        let report = cleanup(&runtime, &owner, "ldes-consumer", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report, CleanupReport { found: 2, removed: 2 });
        assert!(runtime.worker("ldes-consumer-a").is_none());
        assert!(runtime.worker("ldes-consumer-b").is_none());
        assert!(runtime.worker("graphdb").is_some());
        assert!(runtime.worker("ldes-consumer-foreign").is_some());
        assert_eq!(runtime.count(&Call::Stop("ldes-consumer-a".into())), 1);
        assert_eq!(runtime.count(&Call::Stop("ldes-consumer-b".into())), 0);
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_to_do() {
        let runtime = FakeRuntime::new();
        let owner = LabelSelector::new("com.docker.compose.project", "kgap");
        let report = cleanup(&runtime, &owner, "ldes-consumer", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
