use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use super::FeedDefaults;
use crate::engine::ReconcilerSettings;
use crate::feed::RestartPolicy;
use crate::runtime::LabelSelector;

/// Engine-wide settings shared by every subcommand
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Feed document, or a directory with one YAML file per feed
    #[arg(long, env = "LDES_CONFIG_PATH", default_value = "/data/ldes-feeds.yaml")]
    pub config: PathBuf,

    /// Worker name prefix; workers are named `<prefix>-<feed>`
    #[arg(long, env = "LDES_CONSUMER_PREFIX", default_value = "ldes-consumer")]
    pub prefix: String,

    /// Project value of the ownership label
    #[arg(long, env = "COMPOSE_PROJECT_NAME", default_value = "kgap")]
    pub project: String,

    /// Label key marking workers as owned by the project
    #[arg(long, env = "OWNER_LABEL", default_value = "com.docker.compose.project")]
    pub owner_label: String,
}

impl Settings {
    pub fn owner(&self) -> LabelSelector {
        LabelSelector::new(&self.owner_label, &self.project)
    }
}

/// Settings of the `run` subcommand
#[derive(Debug, Clone, Args)]
pub struct RunSettings {
    /// Worker image
    #[arg(
        long,
        env = "LDES2SPARQL_IMAGE",
        default_value = "ghcr.io/maregraph-eu/ldes2sparql:latest"
    )]
    pub image: String,

    /// Network workers attach to
    #[arg(long, env = "DOCKER_NETWORK")]
    pub network: Option<String>,

    /// Graph prefix for default target graphs (`urn:kgap:<prefix>:<feed>`)
    #[arg(long, env = "GRAPH_PREFIX", default_value = "ldes")]
    pub graph_prefix: String,

    /// Restart policy for feeds that do not set one
    #[arg(long, env = "RESTART", value_enum, default_value_t = RestartPolicy::OnFailure)]
    pub default_restart: RestartPolicy,

    /// Stop and remove owned workers whose feed is no longer configured
    #[arg(long, env = "REMOVE_ORPHANS", default_value_t = false)]
    pub remove_orphans: bool,

    /// Holds per-feed state directories and captured logs
    #[arg(long, env = "FEEDVISOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds between health probes and periodic passes
    #[arg(long, default_value_t = 10)]
    pub monitor_interval: u64,

    /// Seconds any single runtime call may take
    #[arg(long, default_value_t = 30)]
    pub op_timeout: u64,

    /// Seconds a worker gets to stop before it is killed
    #[arg(long, default_value_t = 10)]
    pub stop_timeout: u64,

    /// Milliseconds to wait after a start before confirming liveness
    #[arg(long, default_value_t = 2000)]
    pub startup_grace_ms: u64,

    /// Minimum seconds between two starts of the same feed (0 = no throttle)
    #[arg(long, env = "MIN_RESTART_INTERVAL", default_value_t = 0)]
    pub min_restart_interval: u64,

    /// Feeds handled concurrently within one pass
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Ignore file-system notifications and rely on periodic checks only
    #[arg(long, default_value_t = false)]
    pub no_watch: bool,
}

impl RunSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("feedvisor")
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir().join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval.max(1))
    }

    pub fn feed_defaults(&self) -> FeedDefaults {
        FeedDefaults {
            graph_prefix: self.graph_prefix.clone(),
            restart_policy: self.default_restart,
        }
    }

    pub fn reconciler(&self, settings: &Settings) -> ReconcilerSettings {
        ReconcilerSettings {
            prefix: settings.prefix.clone(),
            owner: settings.owner(),
            op_timeout: Duration::from_secs(self.op_timeout.max(1)),
            stop_timeout: Duration::from_secs(self.stop_timeout),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            min_restart_interval: Duration::from_secs(self.min_restart_interval),
            max_parallel: self.max_parallel.max(1),
            remove_orphans: self.remove_orphans,
        }
    }
}
