//! Isolated execution of repository-derived packaging operations.
//!
//! Untrusted commands (recipe rendering, source archive creation) never run
//! in the worker's own process. Each invocation gets a fresh scratch
//! directory, runs inside a locked-down container (or directly, for tests),
//! is bounded by a hard wall-clock timeout, and hands back only the declared
//! artifact. The scratch directory is torn down unconditionally, whatever
//! the outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::store::FailureKind;

/// One locally-resolved packaging operation to run in isolation.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Files seeded into the scratch directory before execution
    /// (relative path, content)
    pub inputs: Vec<(String, String)>,
    /// Artifact the command must produce, relative to the scratch directory
    pub expected_artifact: String,
}

/// The only state that crosses back out of the sandbox.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    /// sha256 of the artifact content
    pub digest: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("sandbox timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("sandbox command failed (exit {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("sandbox resource limit hit: {detail}")]
    ResourceExhausted { detail: String },

    #[error("sandbox setup failed: {0}")]
    Setup(String),
}

impl SandboxError {
    /// Timeouts and resource exhaustion are worth retrying; a command that
    /// ran and failed means the repository content or recipe is broken.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SandboxError::TimedOut { .. } | SandboxError::ResourceExhausted { .. } => {
                FailureKind::Transient
            }
            SandboxError::ExecutionFailed { .. } | SandboxError::Setup(_) => FailureKind::Permanent,
        }
    }
}

pub struct SandboxRunner {
    config: SandboxConfig,
    scratch_root: PathBuf,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Place scratch directories under a caller-owned root. Lets tests
    /// assert teardown without racing other runners.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Execute `spec` under a hard wall-clock bound and return the declared
    /// artifact. The scratch directory is removed on every path.
    pub async fn run(
        &self,
        spec: &SandboxSpec,
        timeout: Duration,
    ) -> Result<Artifact, SandboxError> {
        let scratch = self
            .scratch_root
            .join(format!("forgeci-sandbox-{}", Uuid::new_v4()));
        fs::create_dir_all(&scratch).map_err(|e| SandboxError::Setup(e.to_string()))?;

        let result = self.execute(spec, &scratch, timeout).await;
        // Single teardown point covering success, failure, and timeout.
        if let Err(e) = fs::remove_dir_all(&scratch) {
            tracing::warn!(scratch = %scratch.display(), error = %e, "Failed to remove sandbox scratch dir");
        }
        result
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        scratch: &Path,
        timeout: Duration,
    ) -> Result<Artifact, SandboxError> {
        for (name, content) in &spec.inputs {
            let path = scratch.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| SandboxError::Setup(e.to_string()))?;
            }
            fs::write(&path, content).map_err(|e| SandboxError::Setup(e.to_string()))?;
        }

        let mut command = self.build_command(spec, scratch);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| SandboxError::TimedOut { timeout })?
            .map_err(|e| SandboxError::Setup(e.to_string()))?;

        let captured = output.stdout.len() + output.stderr.len();
        if captured > self.config.max_output_bytes {
            return Err(SandboxError::ResourceExhausted {
                detail: format!(
                    "output of {captured} bytes exceeds cap of {}",
                    self.config.max_output_bytes
                ),
            });
        }

        if !output.status.success() {
            return Err(SandboxError::ExecutionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let artifact_path = scratch.join(&spec.expected_artifact);
        let bytes = fs::read(&artifact_path).map_err(|_| SandboxError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: format!(
                "declared artifact {} was not produced",
                spec.expected_artifact
            ),
        })?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        fs::create_dir_all(&self.config.artifact_dir)
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        let file_name = artifact_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let dest = self
            .config
            .artifact_dir
            .join(format!("{}-{file_name}", Uuid::new_v4()));
        fs::copy(&artifact_path, &dest).map_err(|e| SandboxError::Setup(e.to_string()))?;

        Ok(Artifact {
            path: dest,
            digest,
            size_bytes: bytes.len() as u64,
        })
    }

    fn build_command(&self, spec: &SandboxSpec, scratch: &Path) -> Command {
        if !self.config.use_container {
            let mut command = Command::new(&spec.program);
            command.args(&spec.args);
            command.current_dir(scratch);
            return command;
        }

        let mut command = Command::new("docker");
        command.arg("run").arg("--rm");
        if self.config.network_disabled {
            command.arg("--network=none");
        }
        if let Some(limit) = &self.config.memory_limit {
            command.arg(format!("--memory={limit}"));
        }
        if let Some(limit) = &self.config.cpu_limit {
            command.arg(format!("--cpus={limit}"));
        }
        command.arg("--cap-drop=ALL");
        command.arg("--security-opt=no-new-privileges");
        command.arg("-v");
        command.arg(format!("{}:/work", scratch.display()));
        command.args(["-w", "/work"]);
        command.arg(&self.config.image);
        command.arg(&spec.program);
        command.args(&spec.args);
        command
    }
}
