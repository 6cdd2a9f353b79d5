use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::feed::{
    default_target_context, ConfigVersion, FeedSet, FeedSpec, OperationMode,
    RestartPolicy, DEFAULT_POLLING_INTERVAL,
};

/// Per-feed worker options accepted as top-level keys, passed on upper-cased
const WORKER_OPTIONS: [&str; 13] = [
    "shape",
    "follow",
    "materialize",
    "order",
    "last_version_only",
    "before",
    "after",
    "concurrent_fetches",
    "for_virtuoso",
    "query_timeout",
    "access_token",
    "perf_name",
    "failure_is_fatal",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("feed '{feed}' is invalid: {reason}")]
    Invalid { feed: String, reason: String },
}

/// Values a feed inherits when its entry leaves them out
#[derive(Debug, Clone)]
pub struct FeedDefaults {
    pub graph_prefix: String,
    pub restart_policy: RestartPolicy,
}

impl Default for FeedDefaults {
    fn default() -> Self {
        Self {
            graph_prefix: "ldes".into(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Outcome of one load: every feed, plus what was wrong with the invalid ones
#[derive(Debug)]
pub struct LoadedConfig {
    pub set: FeedSet,
    pub invalid: Vec<ConfigError>,
}

/// Reads feed documents
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    defaults: FeedDefaults,
}

impl ConfigLoader {
    pub fn new(defaults: FeedDefaults) -> Self {
        Self { defaults }
    }

    /// Load a feed document, or a directory holding one document per feed.
    pub fn load(&self, path: &Path) -> Result<LoadedConfig, ConfigError> {
        let meta = fs::metadata(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        if meta.is_dir() {
            self.load_dir(path)
        } else {
            self.load_file(path)
        }
    }

    fn load_file(&self, path: &Path) -> Result<LoadedConfig, ConfigError> {
        // Stat before reading; a later edit then always looks like a change
        let stat = stat_of(path)?;
        let content = read(path)?;
        let version = ConfigVersion {
            fingerprint: fingerprint_str(&content),
            ..stat
        };
        let document: Value = serde_yaml::from_str(&content).map_err(|e| malformed(path, e))?;

        let mut set = FeedSet::new(version);
        let mut invalid = Vec::new();

        let feeds = match document {
            Value::Null => {
                warn!(path = %path.display(), "Configuration is empty");
                return Ok(LoadedConfig { set, invalid });
            }
            Value::Mapping(mut top) => top.remove("feeds"),
            _ => return Err(malformed(path, "top level must be a mapping")),
        };

        let entries: Vec<(String, Value)> = match feeds {
            None | Some(Value::Null) => {
                warn!(path = %path.display(), "No 'feeds' section found in configuration");
                Vec::new()
            }
            Some(Value::Mapping(map)) => map
                .into_iter()
                .map(|(k, v)| (scalar(&k).unwrap_or_default(), v))
                .collect(),
            Some(Value::Sequence(list)) => list
                .into_iter()
                .map(|v| {
                    let name = v
                        .as_mapping()
                        .and_then(|m| m.get("name"))
                        .and_then(scalar)
                        .unwrap_or_default();
                    (name, v)
                })
                .collect(),
            Some(_) => return Err(malformed(path, "'feeds' must be a mapping or a list")),
        };

        for (name, entry) in entries {
            if set.contains(&name) {
                invalid.push(ConfigError::Invalid {
                    feed: name.clone(),
                    reason: "declared more than once; keeping the first".into(),
                });
                continue;
            }
            let spec = self.parse_feed(&name, &entry);
            if let Err(reason) = spec.validate() {
                invalid.push(ConfigError::Invalid {
                    feed: name.clone(),
                    reason,
                });
            }
            set.insert(spec);
        }

        debug!(path = %path.display(), feeds = set.len(), "Loaded configuration");
        Ok(LoadedConfig { set, invalid })
    }

    fn load_dir(&self, dir: &Path) -> Result<LoadedConfig, ConfigError> {
        let stat = stat_of(dir)?;
        let mut hasher = DefaultHasher::new();
        let mut entries = Vec::new();
        for path in yaml_files(dir)? {
            let content = read(&path)?;
            path.file_name().hash(&mut hasher);
            content.hash(&mut hasher);
            entries.push((path, content));
        }

        let mut set = FeedSet::new(ConfigVersion {
            fingerprint: hasher.finish(),
            ..stat
        });
        let mut invalid = Vec::new();

        for (path, content) in entries {
            let name = feed_name_from_file(&path);
            if set.contains(&name) {
                invalid.push(ConfigError::Invalid {
                    feed: name,
                    reason: format!(
                        "{} maps to a feed name already taken; keeping the first",
                        path.display()
                    ),
                });
                continue;
            }
            let entry: Value = match serde_yaml::from_str(&content) {
                Ok(Value::Null) => {
                    warn!(path = %path.display(), "Empty feed file");
                    continue;
                }
                Ok(entry) => entry,
                Err(e) => {
                    invalid.push(ConfigError::Invalid {
                        feed: name.clone(),
                        reason: format!("unparseable file {}: {}", path.display(), e),
                    });
                    set.insert(self.parse_feed(&name, &Value::Null));
                    continue;
                }
            };

            let spec = self.parse_feed(&name, &entry);
            if let Err(reason) = spec.validate() {
                invalid.push(ConfigError::Invalid {
                    feed: name.clone(),
                    reason,
                });
            }
            set.insert(spec);
        }

        debug!(path = %dir.display(), feeds = set.len(), "Loaded configuration directory");
        Ok(LoadedConfig { set, invalid })
    }

    /// Build a spec from one entry, falling back to defaults for bad optional values.
    fn parse_feed(&self, name: &str, entry: &Value) -> FeedSpec {
        let empty = Mapping::new();
        let map = match entry {
            Value::Mapping(map) => map,
            _ => {
                warn!(feed = %name, "Feed entry is not a mapping");
                &empty
            }
        };

        let mut env = environment(name, map);

        let source = declared_or_env(name, "LDES", field(map, &["url", "source"]), &mut env);
        let destination = declared_or_env(
            name,
            "SPARQL_ENDPOINT",
            field(map, &["sparql_endpoint", "destination"]),
            &mut env,
        );
        let mut spec = FeedSpec::new(
            name,
            source.unwrap_or_default(),
            destination.unwrap_or_default(),
        );

        spec.target_context = declared_or_env(
            name,
            "TARGET_GRAPH",
            field(map, &["target_graph", "target_context"]),
            &mut env,
        )
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_target_context(&self.defaults.graph_prefix, name));

        let env_millis = env.remove("POLLING_FREQUENCY");
        spec.polling_interval = match (field(map, &["polling_interval"]), env_millis) {
            (None, None) => DEFAULT_POLLING_INTERVAL,
            (Some(value), millis) => {
                if millis.is_some() {
                    warn!(
                        feed = %name,
                        key = "POLLING_FREQUENCY",
                        "Environment key conflicts with feed field, ignoring"
                    );
                }
                parse_interval(value).unwrap_or_else(|| {
                    warn!(feed = %name, value = ?value, "Invalid polling_interval, using default");
                    DEFAULT_POLLING_INTERVAL
                })
            }
            (None, Some(millis)) => interval_from_millis(&millis).unwrap_or_else(|| {
                warn!(feed = %name, value = %millis, "Invalid POLLING_FREQUENCY, using default");
                DEFAULT_POLLING_INTERVAL
            }),
        };

        let mode = declared_or_env(
            name,
            "OPERATION_MODE",
            field(map, &["operation_mode"]),
            &mut env,
        );
        spec.operation_mode = match mode {
            None => OperationMode::default(),
            Some(mode) => serde_yaml::from_value(Value::String(mode.clone())).unwrap_or_else(|_| {
                warn!(feed = %name, mode = %mode, "Unknown operation_mode, using default");
                OperationMode::default()
            }),
        };

        let policy = declared_or_env(
            name,
            "RESTART",
            field(map, &["restart", "restart_policy"]),
            &mut env,
        );
        spec.restart_policy = match policy {
            None => self.defaults.restart_policy,
            Some(policy) => RestartPolicy::from_str(&policy, true).unwrap_or_else(|_| {
                warn!(feed = %name, policy = %policy, "Unknown restart policy, using default");
                self.defaults.restart_policy
            }),
        };

        spec.remove_on_exit = field(map, &["remove", "REMOVE", "remove_on_exit"])
            .map(|v| match v {
                Value::Bool(b) => *b,
                other => scalar(other)
                    .map(|s| s.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            })
            .unwrap_or(false);

        for option in WORKER_OPTIONS {
            let Some(value) = map.get(option) else {
                continue;
            };
            match scalar(value) {
                Some(v) => {
                    spec.extra_parameters.insert(option.to_ascii_uppercase(), v);
                }
                None => warn!(feed = %name, key = %option, "Worker option is not a scalar, ignoring"),
            }
        }
        // Explicit environment entries win over top-level options
        spec.extra_parameters.extend(env);

        spec
    }
}

/// Cheap change check. Stats first; only reads content when the stat moved.
pub fn has_changed(path: &Path, last: &ConfigVersion) -> Result<(bool, ConfigVersion), ConfigError> {
    let stat = stat_of(path)?;
    if stat.same_stat(last) {
        return Ok((false, *last));
    }
    let current = ConfigVersion {
        fingerprint: fingerprint(path)?,
        ..stat
    };
    Ok((current.fingerprint != last.fingerprint, current))
}

/// Full version: stat plus content fingerprint
#[cfg(test)]
pub fn version_of(path: &Path) -> Result<ConfigVersion, ConfigError> {
    Ok(ConfigVersion {
        fingerprint: fingerprint(path)?,
        ..stat_of(path)?
    })
}

fn stat_of(path: &Path) -> Result<ConfigVersion, ConfigError> {
    let meta = fs::metadata(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Ok(ConfigVersion {
            modified: meta.modified().ok(),
            len: meta.len(),
            fingerprint: 0,
        });
    }

    let mut version = ConfigVersion {
        modified: meta.modified().ok(),
        len: 0,
        fingerprint: 0,
    };
    for file in yaml_files(path)? {
        if let Ok(meta) = fs::metadata(&file) {
            version.len = version.len.saturating_add(meta.len());
            version.modified = version.modified.max(meta.modified().ok());
        }
    }
    Ok(version)
}

fn fingerprint(path: &Path) -> Result<u64, ConfigError> {
    let mut hasher = DefaultHasher::new();
    if path.is_dir() {
        for file in yaml_files(path)? {
            file.file_name().hash(&mut hasher);
            read(&file)?.hash(&mut hasher);
        }
    } else {
        return Ok(fingerprint_str(&read(path)?));
    }
    Ok(hasher.finish())
}

fn fingerprint_str(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// `*.yaml` / `*.yml` directly inside `dir`, sorted
fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Unreadable {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

/// `My_Feed.yaml` -> `my-feed`
pub fn feed_name_from_file(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .replace(['_', ' '], "-")
        .to_lowercase()
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn malformed(path: &Path, reason: impl ToString) -> ConfigError {
    ConfigError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn field<'a>(map: &'a Mapping, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| map.get(*k))
}

/// Scalar entries of the feed's `environment` mapping
fn environment(name: &str, map: &Mapping) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match field(map, &["environment"]) {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(entries)) => {
            for (key, value) in entries {
                let Some(key) = scalar(key) else {
                    continue;
                };
                match value {
                    Value::Null => {
                        warn!(feed = %name, key = %key, "Skipping environment variable with null value");
                    }
                    other => match scalar(other) {
                        Some(v) => {
                            env.insert(key, v);
                        }
                        None => {
                            warn!(feed = %name, key = %key, "Environment value is not a scalar, ignoring");
                        }
                    },
                }
            }
        }
        Some(_) => {
            warn!(feed = %name, "'environment' is not a mapping; skipping");
        }
    }
    env
}

/// A feed field, falling back to its environment key.
///
/// The key is always taken out of `env`; on a conflict the field wins.
fn declared_or_env(
    name: &str,
    key: &str,
    declared: Option<&Value>,
    env: &mut BTreeMap<String, String>,
) -> Option<String> {
    let from_env = env.remove(key);
    match declared.and_then(scalar) {
        Some(value) => {
            if from_env.as_ref().is_some_and(|e| *e != value) {
                warn!(feed = %name, key = %key, "Environment key conflicts with feed field, ignoring");
            }
            Some(value)
        }
        None => from_env,
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `POLLING_FREQUENCY` milliseconds to whole seconds; at least one second.
fn interval_from_millis(millis: &str) -> Option<u64> {
    let millis = millis.trim().parse::<f64>().ok()?;
    if millis.is_finite() && millis > 0.0 {
        Some(((millis / 1000.0).round() as u64).max(1))
    } else {
        None
    }
}

/// Seconds, from a number or a numeric string; must be positive.
fn parse_interval(value: &Value) -> Option<u64> {
    let secs = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if secs.is_finite() && secs >= 1.0 {
        Some(secs.round() as u64)
    } else {
        None
    }
}
