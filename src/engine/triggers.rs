//! Sources that wake the control loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Trigger;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Send `Tick` every `interval` until the receiver goes away
pub fn spawn_ticker(
    interval: Duration,
    tx: mpsc::UnboundedSender<Trigger>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(Trigger::Tick).is_err() {
                break;
            }
        }
    })
}

/// Watch the configuration and send `ConfigChanged` on edits.
///
/// A single file is watched through its parent directory so editors that
/// replace the file on save are still seen. The returned debouncer must be
/// kept alive for as long as notifications are wanted.
pub fn watch_config(
    path: &Path,
    tx: mpsc::UnboundedSender<Trigger>,
) -> notify::Result<Debouncer<notify::RecommendedWatcher>> {
    let (dir, file) = if path.is_dir() {
        (path.to_path_buf(), None)
    } else {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        (dir, path.file_name().map(|name| name.to_os_string()))
    };

    let mut debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
        Ok(events) => {
            let relevant = events
                .iter()
                .any(|event| is_relevant(&event.path, file.as_deref()));
            if relevant {
                debug!("Configuration change detected");
                let _ = tx.send(Trigger::ConfigChanged);
            }
        }
        Err(e) => warn!(error = %e, "File watcher error"),
    })?;

    debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
    info!(path = %dir.display(), "Watching configuration");
    Ok(debouncer)
}

fn is_relevant(changed: &Path, file: Option<&std::ffi::OsStr>) -> bool {
    match file {
        Some(name) => changed.file_name() == Some(name),
        None => matches!(
            changed.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ),
    }
}

/// Resolve on SIGINT, SIGTERM or SIGQUIT
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            None
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGQUIT");
            None
        }
    };

    let term = async {
        match term.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let quit = async {
        match quit.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => warn!(error = %e, "Failed to listen for SIGINT"),
        },
        _ = term => info!("Received SIGTERM"),
        _ = quit => info!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_file_filter() {
        let file = Some(OsStr::new("ldes-feeds.yaml"));
        assert!(is_relevant(Path::new("/data/ldes-feeds.yaml"), file));
        assert!(!is_relevant(Path::new("/data/other.yaml"), file));
    }

    #[test]
    fn test_directory_filter() {
        assert!(is_relevant(Path::new("/feeds/marine.yml"), None));
        assert!(is_relevant(Path::new("/feeds/vocab.yaml"), None));
        assert!(!is_relevant(Path::new("/feeds/.marine.yaml.swp"), None));
    }

    #[tokio::test]
    async fn test_ticker_sends_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn_ticker(Duration::from_millis(10), tx);

        let trigger = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(trigger, Some(Trigger::Tick));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
