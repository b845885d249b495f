//! Docker adapter
//!
//! Talks to the local Docker daemon by running the `docker` CLI, so it honours
//! `DOCKER_HOST`, contexts and credentials exactly like an operator's shell.
//! Every one-shot command is bounded by the configured timeout and killed if
//! it overruns.
//!
//! Listing asks `docker ps` for the ownership label by key through a Go
//! template instead of reading the rendered `Labels` column, which joins all
//! labels with unescaped commas and cannot be split back reliably. Listed
//! instances therefore carry at most one label: the ownership label.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    ContainerRuntime, EventSubscription, InstanceId, ObjectKind, ObservedInstance, RuntimeError,
    RuntimeEvent,
};
use crate::config::RuntimeConfig;

/// Buffered events/errors per subscription
const EVENT_BUFFER: usize = 64;

/// `docker` CLI backed runtime
pub struct DockerCli {
    binary: String,
    platform: Option<String>,
    timeout: Duration,
    owner_label: String,
    ps_format: String,
}

/// One line of `docker ps` rendered with [`ps_format`]
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    /// Value of the ownership label, empty when the container has none
    #[serde(rename = "Owner", default)]
    owner: String,
}

/// One line of `docker events --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct EventLine {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
}

#[derive(Debug, Default, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
}

impl DockerCli {
    pub fn new(config: &RuntimeConfig, owner_label: &str) -> Self {
        Self {
            binary: config.docker_bin.clone(),
            platform: config.platform.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
            owner_label: owner_label.to_string(),
            ps_format: ps_format(owner_label),
        }
    }

    /// Run one docker subcommand to completion and return its stdout
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.binary, args.first().copied().unwrap_or_default());
        trace!(command = %command, ?args, "Running docker command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RuntimeError::Spawn(format!("{}: {}", self.binary, e))),
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_all(&self) -> Result<Vec<ObservedInstance>, RuntimeError> {
        let stdout = self
            .run(&["ps", "--all", "--no-trunc", "--format", &self.ps_format])
            .await?;

        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_ps_line(line, &self.owner_label))
            .collect()
    }

    async fn create(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
        name: &str,
    ) -> Result<InstanceId, RuntimeError> {
        let label_args: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut args = vec!["create", "--name", name];
        for label in &label_args {
            args.push("--label");
            args.push(label);
        }
        if let Some(platform) = &self.platform {
            args.push("--platform");
            args.push(platform);
        }
        args.push(image);

        let stdout = self.run(&args).await.map_err(|e| match e {
            RuntimeError::CommandFailed { ref stderr, .. } if stderr.contains("is already in use") => {
                RuntimeError::NameConflict(name.to_string())
            }
            other => other,
        })?;

        // Pull progress may precede the ID on stdout
        let id = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| RuntimeError::InvalidOutput("docker create printed no container ID".to_string()))?;

        Ok(InstanceId::new(id))
    }

    async fn start(&self, id: &InstanceId) -> Result<(), RuntimeError> {
        self.run(&["start", id.as_str()]).await.map(|_| ())
    }

    async fn remove(&self, id: &InstanceId, force: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(id.as_str());

        self.run(&args).await.map_err(|e| match e {
            RuntimeError::CommandFailed { ref stderr, .. } if stderr.contains("No such container") => {
                RuntimeError::NotFound(id.clone())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventSubscription, RuntimeError> {
        let mut child = Command::new(&self.binary)
            .args([
                "events",
                "--filter",
                "type=container",
                "--filter",
                "event=destroy",
                "--format",
                "{{json .}}",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Spawn("docker events: stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Spawn("docker events: stderr not captured".to_string()))?;

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (error_tx, errors) = mpsc::channel(EVENT_BUFFER);

        let stderr_tx = error_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(RuntimeError::EventStream(line)).await.is_err() {
                    break;
                }
            }
        });

        // Owns the child; dropping it on exit kills `docker events`
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_event_line(&line) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                debug!("Event subscriber dropped, stopping docker events");
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = error_tx.send(e).await;
                        }
                    },
                    Ok(None) => {
                        let status = child.wait().await;
                        let reason = match status {
                            Ok(status) => format!("docker events exited with {}", status),
                            Err(e) => format!("docker events exited: {}", e),
                        };
                        warn!(reason = %reason, "Docker event stream ended");
                        let _ = error_tx.send(RuntimeError::EventStream(reason)).await;
                        break;
                    }
                    Err(e) => {
                        let _ = error_tx
                            .send(RuntimeError::EventStream(format!("reading docker events: {}", e)))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(EventSubscription { events, errors })
    }
}

/// `docker ps` template emitting one JSON object per container, with the
/// ownership label looked up by key.
fn ps_format(owner_label: &str) -> String {
    // A JSON string literal is also a valid Go template string literal
    let key = serde_json::Value::String(owner_label.to_string());
    format!(
        "{{\"ID\":{{{{json .ID}}}},\"Names\":{{{{json .Names}}}},\"Image\":{{{{json .Image}}}},\"State\":{{{{json .State}}}},\"Owner\":{{{{json (.Label {})}}}}}}",
        key
    )
}

fn parse_ps_line(line: &str, owner_label: &str) -> Result<ObservedInstance, RuntimeError> {
    let ps: PsLine = serde_json::from_str(line)
        .map_err(|e| RuntimeError::InvalidOutput(format!("docker ps line {:?}: {}", line, e)))?;

    // Names is comma separated; the first entry is the primary name
    let name = ps.names.split(',').next().unwrap_or_default().to_string();

    // An empty owner cannot name a deployment; treat it as unlabelled
    let mut labels = HashMap::new();
    if !ps.owner.is_empty() {
        labels.insert(owner_label.to_string(), ps.owner);
    }

    Ok(ObservedInstance {
        id: InstanceId::new(ps.id),
        name,
        image: ps.image,
        state: ps.state,
        labels,
    })
}

fn parse_event_line(line: &str) -> Result<RuntimeEvent, RuntimeError> {
    let event: EventLine = serde_json::from_str(line)
        .map_err(|e| RuntimeError::InvalidOutput(format!("docker event {:?}: {}", line, e)))?;

    Ok(RuntimeEvent {
        kind: ObjectKind::from(event.kind.as_str()),
        action: event.action,
        object_id: event.actor.id,
    })
}
