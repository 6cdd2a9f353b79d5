use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Keys the engine sets itself in a worker's environment.
const RESERVED_KEYS: [&str; 5] = [
    "LDES",
    "SPARQL_ENDPOINT",
    "TARGET_GRAPH",
    "POLLING_FREQUENCY",
    "OPERATION_MODE",
];

pub const DEFAULT_POLLING_INTERVAL: u64 = 60;

/// How the worker moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperationMode {
    /// One-shot replication of the feed
    #[default]
    #[serde(alias = "replication")]
    Replication,
    /// Continuous synchronization
    #[serde(alias = "sync")]
    Sync,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replication => f.write_str("Replication"),
            Self::Sync => f.write_str("Sync"),
        }
    }
}

/// Whether a worker that stopped on its own is started again
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Run once; a crash parks the feed as failed
    #[serde(alias = "no")]
    #[value(alias = "no")]
    Never,
    /// Restart unless the worker exited cleanly
    #[default]
    #[serde(alias = "on_failure")]
    #[value(alias = "on_failure")]
    OnFailure,
    /// Restart whenever the worker is found dead
    #[serde(alias = "unless-stopped")]
    #[value(alias = "unless-stopped")]
    Always,
}

impl RestartPolicy {
    /// Decide on a restart given the worker's exit code, when the runtime knows it.
    pub fn restarts_after(&self, exit_code: Option<i64>) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure => exit_code != Some(0),
            Self::Always => true,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::OnFailure => f.write_str("on-failure"),
            Self::Always => f.write_str("always"),
        }
    }
}

/// Declarative description of one feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSpec {
    /// Unique key, also the suffix of the worker name
    pub name: String,
    /// LDES endpoint the worker reads from
    pub source: String,
    /// SPARQL endpoint the worker writes to
    pub destination: String,
    /// Named graph receiving the data
    pub target_context: String,
    /// Seconds between polls of the source
    pub polling_interval: u64,
    pub operation_mode: OperationMode,
    /// Free-form passthrough parameters, minus reserved keys
    pub extra_parameters: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    /// Remove the worker once it stops
    pub remove_on_exit: bool,
}

impl FeedSpec {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            target_context: default_target_context("ldes", &name),
            name,
            source: source.into(),
            destination: destination.into(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            operation_mode: OperationMode::default(),
            extra_parameters: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            remove_on_exit: false,
        }
    }

    /// Mandatory fields present and the name usable as a worker name?
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_feed_name(&self.name) {
            return Err(format!(
                "name '{}' must be alphanumeric with '-', '_' or '.'",
                self.name
            ));
        }
        let mut missing = Vec::new();
        if self.source.trim().is_empty() {
            missing.push("url");
        }
        if self.destination.trim().is_empty() {
            missing.push("sparql_endpoint");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required field(s): {}", missing.join(", ")))
        }
    }

    /// Same declaration, regardless of the name it is filed under.
    pub fn is_equivalent(&self, other: &FeedSpec) -> bool {
        self.source == other.source
            && self.destination == other.destination
            && self.target_context == other.target_context
            && self.polling_interval == other.polling_interval
            && self.operation_mode == other.operation_mode
            && self.extra_parameters == other.extra_parameters
            && self.restart_policy == other.restart_policy
            && self.remove_on_exit == other.remove_on_exit
    }

    /// Environment handed to the worker: engine keys first, then the passthrough.
    pub fn worker_parameters(&self) -> Vec<(String, String)> {
        let polling_ms = self.polling_interval.saturating_mul(1000);
        let mut params = vec![
            ("LDES".to_string(), self.source.clone()),
            ("SPARQL_ENDPOINT".to_string(), self.destination.clone()),
            ("TARGET_GRAPH".to_string(), self.target_context.clone()),
            ("POLLING_FREQUENCY".to_string(), polling_ms.to_string()),
            ("OPERATION_MODE".to_string(), self.operation_mode.to_string()),
        ];
        params.extend(
            self.extra_parameters
                .iter()
                .filter(|(k, _)| !is_reserved(k))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }
}

/// Worker names are `<prefix>-<feed>`, so feeds follow container naming rules.
fn is_valid_feed_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

pub fn default_target_context(graph_prefix: &str, feed: &str) -> String {
    format!("urn:kgap:{}:{}", graph_prefix, feed)
}

/// Identity of one load of the configuration source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigVersion {
    pub modified: Option<SystemTime>,
    pub len: u64,
    pub fingerprint: u64,
}

impl ConfigVersion {
    /// Stat-level equality; cheap to obtain.
    pub fn same_stat(&self, other: &ConfigVersion) -> bool {
        self.modified == other.modified && self.len == other.len
    }
}

/// Every feed from one configuration load
#[derive(Debug, Clone, Default)]
pub struct FeedSet {
    pub version: ConfigVersion,
    pub feeds: BTreeMap<String, FeedSpec>,
}

impl FeedSet {
    pub fn new(version: ConfigVersion) -> Self {
        Self {
            version,
            feeds: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, spec: FeedSpec) {
        self.feeds.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&FeedSpec> {
        self.feeds.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.feeds.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Feeds that can actually be started
    pub fn valid_count(&self) -> usize {
        self.feeds.values().filter(|s| s.validate().is_ok()).count()
    }
}

impl FromIterator<FeedSpec> for FeedSet {
    fn from_iter<I: IntoIterator<Item = FeedSpec>>(iter: I) -> Self {
        let mut set = FeedSet::default();
        for spec in iter {
            set.insert(spec);
        }
        set
    }
}
