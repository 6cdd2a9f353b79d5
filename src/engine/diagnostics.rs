use std::path::PathBuf;

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Where captured worker output goes
#[derive(Debug, Clone)]
pub struct Diagnostics {
    logs_dir: Option<PathBuf>,
}

impl Diagnostics {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir: Some(logs_dir),
        }
    }

    /// Captures are logged but not written anywhere
    pub fn disabled() -> Self {
        Self { logs_dir: None }
    }

    /// `<logs_dir>/<feed>_<YYYYmmdd-HHMMSS>.log`
    pub fn log_path(&self, feed: &str, at: DateTime<Local>) -> Option<PathBuf> {
        self.logs_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.log", feed, at.format("%Y%m%d-%H%M%S"))))
    }

    /// Write captured output; failures are logged, never returned.
    pub async fn persist(&self, feed: &str, bytes: &[u8]) -> Option<PathBuf> {
        let path = self.log_path(feed, Local::now())?;
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(feed = %feed, error = %e, "Failed to create logs directory");
                return None;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let result = match file {
            Ok(mut file) => file.write_all(bytes).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(feed = %feed, path = %path.display(), bytes = bytes.len(), "Worker logs saved");
                Some(path)
            }
            Err(e) => {
                warn!(feed = %feed, path = %path.display(), error = %e, "Failed to save worker logs");
                None
            }
        }
    }
}
