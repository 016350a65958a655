//! Stdio worker: a child process speaking JSON lines.
//!
//! Request:  `{"id":"req-1","type":"prompt","text":"..."}`
//! Replies:  `{"id":"req-1","type":"delta","text":"..."}` (any number)
//!           `{"id":"req-1","type":"done","text":"..."}` or
//!           `{"id":"req-1","type":"error","message":"..."}`

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_core::config::PoolConfig;
use switchyard_core::{Result, SwitchyardError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::profile::CapabilityProfile;
use crate::worker::{Launcher, WorkerEvent, WorkerProcess};

#[derive(Serialize)]
struct WorkerRequest<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct WorkerMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A spawned worker process.
pub struct StdioWorker {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_request: u64,
    stop_grace: Duration,
    prompt_timeout: Duration,
}

impl StdioWorker {
    /// Spawn `command` with the profile applied and wait out the startup grace period.
    pub async fn spawn(
        worker_id: &str,
        command: &str,
        base_args: &[String],
        profile: &CapabilityProfile,
        spawn_grace: Duration,
        stop_grace: Duration,
        prompt_timeout: Duration,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(base_args)
            .args(&profile.args)
            .envs(&profile.env)
            .env("SWITCHYARD_WORKER_ID", worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &profile.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SwitchyardError::Worker(format!("failed to start '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwitchyardError::Worker("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwitchyardError::Worker("worker stdout unavailable".into()))?;

        tokio::time::sleep(spawn_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(SwitchyardError::Worker(format!(
                "'{command}' exited during startup ({status})"
            )));
        }

        tracing::debug!("🚀 Worker {worker_id} started (pid {:?})", child.id());
        Ok(Self {
            id: worker_id.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_request: 1,
            stop_grace,
            prompt_timeout,
        })
    }

    async fn read_reply(
        &mut self,
        request_id: &str,
        events: Option<&mpsc::UnboundedSender<WorkerEvent>>,
    ) -> Result<String> {
        loop {
            let Some(raw) = self.stdout.next_line().await? else {
                return Err(SwitchyardError::Worker(format!(
                    "worker {} closed its output mid-request",
                    self.id
                )));
            };
            let msg: WorkerMessage = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(_) => {
                    tracing::debug!("Worker {} non-JSON line ignored: {raw}", self.id);
                    continue;
                }
            };
            if msg.id.as_deref() != Some(request_id) {
                continue;
            }
            match msg.kind.as_str() {
                "delta" => {
                    if let (Some(tx), Some(chunk)) = (events, msg.text) {
                        let _ = tx.send(WorkerEvent::Delta(chunk));
                    }
                }
                "done" => return Ok(msg.text.unwrap_or_default()),
                "error" => {
                    let message = msg
                        .message
                        .or(msg.text)
                        .unwrap_or_else(|| "worker reported an error".into());
                    return Err(SwitchyardError::Worker(message));
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl WorkerProcess for StdioWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn prompt(
        &mut self,
        text: &str,
        events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    ) -> Result<String> {
        let request_id = format!("req-{}", self.next_request);
        self.next_request += 1;

        let mut line = serde_json::to_string(&WorkerRequest {
            id: &request_id,
            kind: "prompt",
            text,
        })?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SwitchyardError::Worker(format!("worker {} is stopping", self.id)))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let limit = self.prompt_timeout;
        let outcome = tokio::time::timeout(limit, self.read_reply(&request_id, events.as_ref())).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The output stream is now out of step with requests; the process is done.
                tracing::warn!(
                    "⏱️ Worker {} gave no reply within {}ms, killing",
                    self.id,
                    limit.as_millis()
                );
                let _ = self.child.kill().await;
                Err(SwitchyardError::Worker(format!(
                    "worker {} did not reply within {}ms",
                    self.id,
                    limit.as_millis()
                )))
            }
        }
    }

    async fn stop(&mut self) {
        // Closing stdin asks the worker to exit on its own.
        self.stdin.take();
        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(_) => tracing::debug!("Worker {} exited", self.id),
            Err(_) => {
                tracing::warn!("⚠️ Worker {} ignored shutdown, killing", self.id);
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Spawns [`StdioWorker`]s using the pool's command line.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    spawn_grace: Duration,
    stop_grace: Duration,
    prompt_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            spawn_grace: Duration::from_millis(config.spawn_grace_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            prompt_timeout: Duration::from_millis(config.prompt_timeout_ms),
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, worker_id: &str, profile: &CapabilityProfile) -> Result<Box<dyn WorkerProcess>> {
        let worker = StdioWorker::spawn(
            worker_id,
            &self.command,
            &self.args,
            profile,
            self.spawn_grace,
            self.stop_grace,
            self.prompt_timeout,
        )
        .await?;
        Ok(Box::new(worker))
    }
}
