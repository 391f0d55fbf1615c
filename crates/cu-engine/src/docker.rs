//! Docker-compatible engine backend.
//!
//! Drives the `docker` CLI (or anything that speaks the same flags, such as
//! `podman`). Files move in and out of containers as tar streams through
//! `docker cp`, so no host directories are ever mounted.

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use cu_state::FsSnapshot;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::client::{
    ContainerEngine, ContainerId, ContainerSpec, EngineSession, ExecOutput, ExecRequest,
};
use crate::error::EngineError;
use crate::Result;

/// Environment variable selecting the engine binary.
pub const ENGINE_ENV: &str = "CONTAINER_USE_ENGINE";

/// Keeps a container alive without relying on `sleep infinity` support.
const IDLE_SCRIPT: &str = "trap 'exit 0' TERM INT; while :; do sleep 3600 & wait $!; done";

/// Whether stderr text means the daemon itself could not be reached.
pub fn is_daemon_error(stderr: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(cannot connect to the docker daemon|is the docker daemon running|error during connect|connection refused|docker\.sock|podman\.sock|dial unix)",
            )
            .ok()
        })
        .as_ref()
        .map(|re| re.is_match(stderr))
        .unwrap_or(false)
}

/// Whether stderr text means the image could not be obtained.
pub fn is_image_error(stderr: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(pull access denied|manifest unknown|manifest for .* not found|repository does not exist|no such image|invalid reference format|unable to find image)",
            )
            .ok()
        })
        .as_ref()
        .map(|re| re.is_match(stderr))
        .unwrap_or(false)
}

/// Container engine backed by a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl DockerEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Use `$CONTAINER_USE_ENGINE`, falling back to `docker`.
    pub fn from_env() -> Self {
        let binary = std::env::var(ENGINE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "docker".to_string());
        Self::new(binary)
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn connect(&self) -> Result<Box<dyn EngineSession>> {
        let output = run_cli(&self.binary, &["version", "--format", "{{.Server.Version}}"], None)
            .await
            .map_err(|e| match e {
                EngineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    EngineError::BinaryNotFound(self.binary.clone())
                }
                other => other,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            if is_daemon_error(&stderr) || output.stdout.is_empty() {
                return Err(EngineError::DaemonUnreachable {
                    engine: self.binary.clone(),
                    detail: stderr,
                });
            }
            return Err(EngineError::Command {
                engine: self.binary.clone(),
                command: "version".to_string(),
                stderr,
            });
        }

        let server_version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(engine = %self.binary, server_version = %server_version, "connected to container engine");
        Ok(Box::new(DockerSession {
            binary: self.binary.clone(),
            live: Mutex::new(HashMap::new()),
        }))
    }
}

/// One connection's worth of containers. Anything still alive when the
/// session is dropped is force-removed.
#[derive(Debug)]
pub struct DockerSession {
    binary: String,
    /// container id -> image
    live: Mutex<HashMap<String, String>>,
}

impl DockerSession {
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        run_cli(&self.binary, args, stdin).await
    }

    /// Run and fail on a nonzero exit.
    async fn is_running(&self, container: &ContainerId) -> bool {
        match self
            .run(&["inspect", "--format", "{{.State.Running}}", &container.0], None)
            .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            _ => false,
        }
    }

    async fn checked(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            return Err(self.classify(args, &output));
        }
        Ok(output.stdout)
    }

    fn classify(&self, args: &[&str], output: &Output) -> EngineError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_daemon_error(&stderr) {
            return EngineError::DaemonUnreachable {
                engine: self.binary.clone(),
                detail: stderr,
            };
        }
        EngineError::Command {
            engine: self.binary.clone(),
            command: args.first().copied().unwrap_or_default().to_string(),
            stderr,
        }
    }

    fn image_of(&self, container: &ContainerId) -> Result<String> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&container.0)
            .cloned()
            .ok_or_else(|| EngineError::ContainerNotFound(container.0.clone()))
    }

    async fn image_entrypoint(&self, image: &str) -> Result<Vec<String>> {
        let raw = self
            .checked(
                &["image", "inspect", "--format", "{{json .Config.Entrypoint}}", image],
                None,
            )
            .await?;
        let parsed: Option<Vec<String>> = serde_json::from_slice(&raw)?;
        Ok(parsed.unwrap_or_default())
    }
}

#[async_trait]
impl EngineSession for DockerSession {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let mut args: Vec<String> = vec!["create".into(), "-w".into(), spec.workdir.clone()];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            "--entrypoint".into(),
            "sh".into(),
            spec.image.clone(),
            "-c".into(),
            IDLE_SCRIPT.into(),
        ]);
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.run(&argv, None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(if is_daemon_error(&stderr) {
                EngineError::DaemonUnreachable {
                    engine: self.binary.clone(),
                    detail: stderr,
                }
            } else if is_image_error(&stderr) {
                EngineError::ImagePull {
                    image: spec.image.clone(),
                    detail: stderr,
                }
            } else {
                EngineError::ContainerStart {
                    image: spec.image.clone(),
                    detail: stderr,
                }
            });
        }

        let id = ContainerId(String::from_utf8_lossy(&output.stdout).trim().to_string());
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.0.clone(), spec.image.clone());

        let started = self.run(&["start", &id.0], None).await?;
        if !started.status.success() {
            let detail = String::from_utf8_lossy(&started.stderr).trim().to_string();
            self.discard(&id);
            return Err(EngineError::ContainerStart {
                image: spec.image.clone(),
                detail,
            });
        }

        self.checked(&["exec", &id.0, "mkdir", "-p", &spec.workdir], None)
            .await?;
        debug!(container = %id, image = %spec.image, "container started");
        Ok(id)
    }

    async fn copy_in(
        &self,
        container: &ContainerId,
        dest: &str,
        snapshot: &FsSnapshot,
    ) -> Result<()> {
        let archive = snapshot.to_tar()?;
        let target = format!("{}:{}", container.0, dest);
        self.checked(&["cp", "-", &target], Some(&archive)).await?;
        debug!(container = %container, files = snapshot.len(), "copied snapshot into container");
        Ok(())
    }

    async fn exec(&self, container: &ContainerId, request: &ExecRequest) -> Result<ExecOutput> {
        if request.argv.is_empty() {
            return Err(EngineError::InvalidCommand("empty command".to_string()));
        }

        let mut command = Vec::new();
        if request.use_entrypoint {
            let image = self.image_of(container)?;
            command.extend(self.image_entrypoint(&image).await?);
        }
        command.extend(request.argv.iter().cloned());

        let mut args: Vec<&str> = vec!["exec", "-w", request.workdir.as_str(), container.0.as_str()];
        args.extend(command.iter().map(String::as_str));

        let pending = self.run(&args, None);
        let output = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                EngineError::Timeout {
                    limit_ms: limit.as_millis() as u64,
                }
            })??,
            None => pending.await?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if is_lost_container(output.status.code(), &stderr) && !self.is_running(container).await {
            return Err(EngineError::ContainerNotFound(container.0.clone()));
        }

        let exit_code = output.status.code().ok_or(EngineError::Terminated)?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }

    async fn export(&self, container: &ContainerId, path: &str) -> Result<FsSnapshot> {
        let source = format!("{}:{}/.", container.0, path.trim_end_matches('/'));
        let archive = self.checked(&["cp", &source, "-"], None).await?;
        Ok(FsSnapshot::from_tar(&archive)?)
    }

    async fn remove(&self, container: &ContainerId) -> Result<()> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&container.0);
        self.checked(&["rm", "-f", &container.0], None).await?;
        debug!(container = %container, "container removed");
        Ok(())
    }

    fn discard(&self, container: &ContainerId) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&container.0);
        force_remove(&self.binary, &container.0);
    }
}

impl Drop for DockerSession {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(|e| e.into_inner());
        for (id, _) in live.drain() {
            force_remove(&self.binary, &id);
        }
    }
}

/// Whether a failed `exec` looks like the engine losing the container rather
/// than the user's command failing. `docker exec` reports its own failures
/// with status 125; anything else came from inside the container.
fn is_lost_container(exit_code: Option<i32>, stderr: &str) -> bool {
    exit_code == Some(125)
        && stderr.contains("Error response from daemon")
        && (stderr.contains("No such container") || stderr.contains("is not running"))
}

fn force_remove(binary: &str, id: &str) {
    let spawned = std::process::Command::new(binary)
        .args(["rm", "-f", id])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(err) = spawned {
        warn!(container = %id, error = %err, "failed to schedule container removal");
    }
}

async fn run_cli(binary: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(data)) = (pipe, stdin) {
            pipe.write_all(data).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    match fed {
        Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err.into()),
        _ => Ok(output),
    }
}
