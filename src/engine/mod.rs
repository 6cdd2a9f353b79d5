//! Reconciliation engine: one control loop owning the feed state, fed by
//! a timer, a file watcher and a health monitor.

mod control;
mod diagnostics;
mod health;
mod reconciler;
mod triggers;

pub use control::{ControlLoop, Trigger};
pub use diagnostics::Diagnostics;
pub use health::HealthMonitor;
pub use reconciler::{Reconciler, ReconcilerSettings};
pub use triggers::{spawn_ticker, wait_for_shutdown_signal, watch_config};

use thiserror::Error;

use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// Errors that stop the engine from starting
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("none of the {total} configured feeds reached running")]
    NothingStarted { total: usize },
}
