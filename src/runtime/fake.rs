//! In-memory runtime that records every call.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    LabelSelector, RuntimeError, StartOptions, WorkerHandle, WorkerRuntime, WorkerSummary,
};
use crate::feed::FeedSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(String),
    Stop(String),
    Remove(String),
    IsRunning(String),
    ExitCode(String),
    CaptureLogs(String),
    List,
}

#[derive(Debug, Clone)]
pub struct FakeWorker {
    pub id: String,
    pub feed: String,
    pub running: bool,
    pub owned: bool,
    pub spec: Option<FeedSpec>,
    pub exit_code: Option<i64>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, FakeWorker>,
    calls: Vec<Call>,
    failing_starts: HashSet<String>,
    dead_on_start: HashSet<String>,
    hanging_starts: HashSet<String>,
    failing_probes: HashSet<String>,
    failing_logs: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a worker already exists
    pub fn seed(&self, worker_name: &str, feed: &str, running: bool, owned: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.insert(
            worker_name.to_string(),
            FakeWorker {
                id: Uuid::new_v4().to_string(),
                feed: feed.to_string(),
                running,
                owned,
                spec: None,
                exit_code: None,
            },
        );
    }

    /// Worker dies on its own
    pub fn kill(&self, worker_name: &str, exit_code: Option<i64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(worker) = inner.workers.get_mut(worker_name) {
            worker.running = false;
            worker.exit_code = exit_code;
        }
    }

    pub fn fail_start(&self, worker_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_starts
            .insert(worker_name.to_string());
    }

    pub fn heal_start(&self, worker_name: &str) {
        self.inner.lock().unwrap().failing_starts.remove(worker_name);
    }

    /// Start succeeds but the worker exits right away
    pub fn die_on_start(&self, worker_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .dead_on_start
            .insert(worker_name.to_string());
    }

    pub fn hang_start(&self, worker_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .hanging_starts
            .insert(worker_name.to_string());
    }

    pub fn fail_probe(&self, worker_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_probes
            .insert(worker_name.to_string());
    }

    pub fn fail_logs(&self) {
        self.inner.lock().unwrap().failing_logs = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls other than read-only probes
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Start(_) | Call::Stop(_) | Call::Remove(_)))
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn worker(&self, worker_name: &str) -> Option<FakeWorker> {
        self.inner.lock().unwrap().workers.get(worker_name).cloned()
    }

    /// Live workers serving `feed`
    pub fn live_for(&self, feed: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .workers
            .values()
            .filter(|w| w.feed == feed && w.running)
            .count()
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start(
        &self,
        worker_name: &str,
        spec: &FeedSpec,
        opts: StartOptions,
    ) -> Result<WorkerHandle, RuntimeError> {
        self.record(Call::Start(worker_name.to_string()));

        let hang = self.inner.lock().unwrap().hanging_starts.contains(worker_name);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.failing_starts.contains(worker_name) {
            return Err(RuntimeError::Command {
                op: "run",
                worker: worker_name.to_string(),
                message: "image not found".into(),
            });
        }

        if let Some(existing) = inner.workers.get(worker_name) {
            let handle = WorkerHandle::new(worker_name, &spec.name, &existing.id);
            if !existing.owned {
                return Err(RuntimeError::NameConflict {
                    worker: worker_name.to_string(),
                    reason: "not ours".into(),
                });
            }
            if existing.running {
                return Err(RuntimeError::AlreadyRunning(handle));
            }
            if !opts.replace_stopped {
                return Err(RuntimeError::NameConflict {
                    worker: worker_name.to_string(),
                    reason: "stopped worker holds the name".into(),
                });
            }
            inner.workers.remove(worker_name);
        }

        let id = Uuid::new_v4().to_string();
        let running = !inner.dead_on_start.contains(worker_name);
        inner.workers.insert(
            worker_name.to_string(),
            FakeWorker {
                id: id.clone(),
                feed: spec.name.clone(),
                running,
                owned: true,
                spec: Some(spec.clone()),
                exit_code: if running { None } else { Some(1) },
            },
        );
        Ok(WorkerHandle::new(worker_name, &spec.name, id))
    }

    async fn stop(&self, handle: &WorkerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record(Call::Stop(handle.worker_name.clone()));
        let mut inner = self.inner.lock().unwrap();
        if let Some(worker) = inner.workers.get_mut(&handle.worker_name) {
            worker.running = false;
        }
        Ok(())
    }

    async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError> {
        self.record(Call::Remove(handle.worker_name.clone()));
        self.inner.lock().unwrap().workers.remove(&handle.worker_name);
        Ok(())
    }

    async fn is_running(&self, handle: &WorkerHandle) -> Result<bool, RuntimeError> {
        self.record(Call::IsRunning(handle.worker_name.clone()));
        let inner = self.inner.lock().unwrap();
        if inner.failing_probes.contains(&handle.worker_name) {
            return Err(RuntimeError::Unavailable("daemon hiccup".into()));
        }
        Ok(inner
            .workers
            .get(&handle.worker_name)
            .map(|w| w.running && (handle.id.is_empty() || w.id == handle.id))
            .unwrap_or(false))
    }

    async fn exit_code(&self, handle: &WorkerHandle) -> Result<Option<i64>, RuntimeError> {
        self.record(Call::ExitCode(handle.worker_name.clone()));
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .workers
            .get(&handle.worker_name)
            .and_then(|w| w.exit_code))
    }

    async fn capture_logs(&self, handle: &WorkerHandle) -> Result<Vec<u8>, RuntimeError> {
        self.record(Call::CaptureLogs(handle.worker_name.clone()));
        if self.inner.lock().unwrap().failing_logs {
            return Err(RuntimeError::Command {
                op: "logs",
                worker: handle.worker_name.clone(),
                message: "log driver unavailable".into(),
            });
        }
        Ok(format!("last words of {}\n", handle.worker_name).into_bytes())
    }

    async fn list_by_label(
        &self,
        _selector: &LabelSelector,
    ) -> Result<Vec<WorkerSummary>, RuntimeError> {
        self.record(Call::List);
        let inner = self.inner.lock().unwrap();
        let mut workers: Vec<WorkerSummary> = inner
            .workers
            .iter()
            .filter(|(_, w)| w.owned)
            .map(|(name, w)| WorkerSummary {
                handle: WorkerHandle::new(name, &w.feed, &w.id),
                running: w.running,
            })
            .collect();
        workers.sort_by(|a, b| a.handle.worker_name.cmp(&b.handle.worker_name));
        Ok(workers)
    }
}
