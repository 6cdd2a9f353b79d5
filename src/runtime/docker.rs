use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    LabelSelector, RuntimeError, StartOptions, WorkerHandle, WorkerRuntime, WorkerSummary,
    FEED_LABEL,
};
use crate::feed::FeedSpec;

const SERVICE_LABEL: &str = "com.docker.compose.service";

/// `docker` CLI backed runtime
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path or name of the docker binary
    binary: String,
    image: String,
    network: Option<String>,
    /// Label marking workers as ours
    owner: LabelSelector,
    /// Host directory holding one `<feed>` state directory per worker
    state_dir: PathBuf,
}

/// Subset of `docker inspect` output
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
    id: String,
    state: InspectedState,
    config: InspectedConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl Inspected {
    fn is_owned_by(&self, owner: &LabelSelector) -> bool {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&owner.key))
            .map(|value| value == &owner.value)
            .unwrap_or(false)
    }
}

impl DockerCli {
    pub fn new(image: impl Into<String>, owner: LabelSelector, state_dir: PathBuf) -> Self {
        Self {
            binary: "docker".into(),
            image: image.into(),
            network: None,
            owner,
            state_dir,
        }
    }

    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    #[cfg(test)]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments for `docker run`
    fn run_args(&self, worker_name: &str, spec: &FeedSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            worker_name.into(),
            "--label".into(),
            self.owner.to_string(),
            "--label".into(),
            format!("{}={}", SERVICE_LABEL, worker_name),
            "--label".into(),
            format!("{}={}", FEED_LABEL, spec.name),
            "-v".into(),
            format!("{}:/state", self.state_dir.join(&spec.name).display()),
        ];

        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        for (key, value) in spec.worker_parameters() {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<Output, RuntimeError> {
        debug!(command = %args.join(" "), "docker");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::Unavailable(format!("{} not found", self.binary))
                } else {
                    RuntimeError::Io(e)
                }
            })
    }

    async fn inspect(&self, reference: &str) -> Result<Option<Inspected>, RuntimeError> {
        let output = self
            .docker(&[
                "inspect".into(),
                "--type".into(),
                "container".into(),
                reference.into(),
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(command_error("inspect", reference, &stderr));
        }

        let mut entries: Vec<Inspected> =
            serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::Command {
                op: "inspect",
                worker: reference.to_string(),
                message: format!("unreadable inspect output: {}", e),
            })?;
        Ok(entries.pop())
    }
}

#[async_trait]
impl WorkerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let output = self
            .docker(&[
                "version".into(),
                "--format".into(),
                "{{.Server.Version}}".into(),
            ])
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        debug!(version = %String::from_utf8_lossy(&output.stdout).trim(), "docker daemon reachable");
        Ok(())
    }

    async fn start(
        &self,
        worker_name: &str,
        spec: &FeedSpec,
        opts: StartOptions,
    ) -> Result<WorkerHandle, RuntimeError> {
        if let Some(existing) = self.inspect(worker_name).await? {
            let handle = WorkerHandle::new(worker_name, &spec.name, &existing.id);
            if !existing.is_owned_by(&self.owner) {
                return Err(RuntimeError::NameConflict {
                    worker: worker_name.to_string(),
                    reason: format!("existing container lacks label {}", self.owner),
                });
            }
            if existing.state.running {
                return Err(RuntimeError::AlreadyRunning(handle));
            }
            if !opts.replace_stopped {
                return Err(RuntimeError::NameConflict {
                    worker: worker_name.to_string(),
                    reason: "a stopped container holds the name".into(),
                });
            }
            info!(worker = %worker_name, "Removing stopped container before start");
            self.remove(&handle).await?;
        }

        tokio::fs::create_dir_all(self.state_dir.join(&spec.name)).await?;

        let output = self.docker(&self.run_args(worker_name, spec)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is already in use") {
                return Err(RuntimeError::NameConflict {
                    worker: worker_name.to_string(),
                    reason: stderr.trim().to_string(),
                });
            }
            return Err(command_error("run", worker_name, &stderr));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(WorkerHandle::new(worker_name, &spec.name, id))
    }

    async fn stop(&self, handle: &WorkerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        let output = self
            .docker(&[
                "stop".into(),
                "-t".into(),
                timeout.as_secs().to_string(),
                handle.reference().into(),
            ])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing(&stderr) {
                return Err(command_error("stop", &handle.worker_name, &stderr));
            }
        }
        Ok(())
    }

    async fn remove(&self, handle: &WorkerHandle) -> Result<(), RuntimeError> {
        let output = self
            .docker(&["rm".into(), "-f".into(), handle.reference().into()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing(&stderr) && !stderr.contains("already in progress") {
                return Err(command_error("rm", &handle.worker_name, &stderr));
            }
        }
        Ok(())
    }

    async fn is_running(&self, handle: &WorkerHandle) -> Result<bool, RuntimeError> {
        Ok(self
            .inspect(handle.reference())
            .await?
            .map(|c| c.state.running)
            .unwrap_or(false))
    }

    async fn exit_code(&self, handle: &WorkerHandle) -> Result<Option<i64>, RuntimeError> {
        Ok(self
            .inspect(handle.reference())
            .await?
            .filter(|c| !c.state.running)
            .and_then(|c| c.state.exit_code))
    }

    async fn capture_logs(&self, handle: &WorkerHandle) -> Result<Vec<u8>, RuntimeError> {
        let output = self
            .docker(&["logs".into(), handle.reference().into()])
            .await?;
        if !output.status.success() {
            return Err(command_error(
                "logs",
                &handle.worker_name,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        Ok(bytes)
    }

    async fn list_by_label(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<WorkerSummary>, RuntimeError> {
        let output = self
            .docker(&[
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                format!("label={}", selector),
                "--format".into(),
                format!("{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Label \"{}\"}}}}", FEED_LABEL),
            ])
            .await?;
        if !output.status.success() {
            return Err(command_error(
                "ps",
                &selector.to_string(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn command_error(op: &'static str, worker: &str, stderr: &str) -> RuntimeError {
    RuntimeError::Command {
        op,
        worker: worker.to_string(),
        message: stderr.trim().to_string(),
    }
}

/// Parse `ID\tNAME\tSTATE\tFEED` lines
fn parse_listing(stdout: &str) -> Vec<WorkerSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let name = fields.next()?.trim();
            let state = fields.next().unwrap_or("").trim();
            let feed = fields.next().unwrap_or("").trim();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            Some(WorkerSummary {
                handle: WorkerHandle::new(name, feed, id),
                running: state == "running",
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::OperationMode;

    fn cli() -> DockerCli {
        DockerCli::new(
            "ghcr.io/maregraph-eu/ldes2sparql:latest",
            LabelSelector::new("com.docker.compose.project", "kgap"),
            PathBuf::from("/data/ldes-consumer/state"),
        )
    }

    #[test]
    fn test_run_args_carry_identity_and_environment() {
        let mut spec = FeedSpec::new("marine", "http://ldes", "http://sparql");
        spec.operation_mode = OperationMode::Sync;
        spec.extra_parameters.insert("FOLLOW".into(), "true".into());

        let args = cli()
            .with_network(Some("kgap_default".into()))
            .run_args("ldes-consumer-marine", &spec);

        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name ldes-consumer-marine"));
        assert!(joined.contains("--label com.docker.compose.project=kgap"));
        assert!(joined.contains("--label feedvisor.feed=marine"));
        assert!(joined.contains("--network kgap_default"));
        assert!(joined.contains("-v /data/ldes-consumer/state/marine:/state"));
        assert!(joined.contains("-e LDES=http://ldes"));
        assert!(joined.contains("-e OPERATION_MODE=Sync"));
        assert!(joined.contains("-e FOLLOW=true"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("ghcr.io/maregraph-eu/ldes2sparql:latest")
        );
    }

    #[test]
    fn test_run_args_without_network() {
        let spec = FeedSpec::new("a", "http://ldes", "http://sparql");
        let args = cli().run_args("ldes-consumer-a", &spec);
        assert!(!args.contains(&"--network".to_string()));
    }

    #[test]
    fn test_parse_listing() {
        let stdout = "abc123\tldes-consumer-a\trunning\ta\n\
                      def456\tldes-consumer-b\texited\tb\n\
                      \n";
        let workers = parse_listing(stdout);
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].handle.worker_name, "ldes-consumer-a");
        assert_eq!(workers[0].handle.feed, "a");
        assert!(workers[0].running);
        assert!(!workers[1].running);
        assert_eq!(workers[1].handle.id, "def456");
    }

    #[test]
    fn test_inspect_ownership() {
        let json = r#"[{
            "Id": "abc",
            "State": {"Running": true, "ExitCode": 0},
            "Config": {"Labels": {"com.docker.compose.project": "kgap"}}
        }]"#;
        let mut entries: Vec<Inspected> = serde_json::from_str(json).unwrap();
        let entry = entries.pop().unwrap();
        assert!(entry.is_owned_by(&LabelSelector::new("com.docker.compose.project", "kgap")));
        assert!(!entry.is_owned_by(&LabelSelector::new("com.docker.compose.project", "other")));

        let json = r#"[{"Id": "x", "State": {"Running": false}, "Config": {"Labels": null}}]"#;
        let mut entries: Vec<Inspected> = serde_json::from_str(json).unwrap();
        let entry = entries.pop().unwrap();
        assert!(!entry.is_owned_by(&LabelSelector::new("com.docker.compose.project", "kgap")));
        assert!(entry.state.exit_code.is_none());
    }

    #[test]
    fn test_missing_detection() {
        assert!(is_missing("Error: No such container: ldes-consumer-a"));
        assert!(is_missing("Error: No such object: abc"));
        assert!(!is_missing("permission denied"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let cli = cli().with_binary("/nonexistent/docker-binary");
        match cli.ping().await {
            Err(RuntimeError::Unavailable(_)) => {}
            other => panic!("expected unavailable, got {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timed_out_command_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        use crate::runtime::bounded;

        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("docker");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cli = cli().with_binary(script.display().to_string());
        let result = bounded("ping", "*", Duration::from_millis(300), cli.ping()).await;
        assert!(matches!(result, Err(RuntimeError::Timeout { .. })));

        let Ok(pid) = std::fs::read_to_string(&pid_file) else {
            return;
        };
        let stat = PathBuf::from("/proc").join(pid.trim()).join("stat");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let gone = match std::fs::read_to_string(&stat) {
                Err(_) => true,
                Ok(line) => line
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
            };
            if gone {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "docker child outlived its timeout"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
