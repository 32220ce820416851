//! Containerized `ansible-playbook` runs.

use super::{output_excerpt, with_deadline};
use crate::handler::{Handler, HandlerError, JobPayload};
use crate::schema::JobKind;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Payload of a `playbook` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybookJob {
    /// Container image that ships `ansible-playbook`.
    pub image: String,
    /// Playbook path relative to the workspace.
    pub playbook: String,
    /// Inventory path relative to the workspace.
    pub inventory: String,
    /// Private key on the worker host, mounted read-only into the container.
    pub key_file: PathBuf,
    /// Directory on the worker host holding the playbook and inventory.
    pub workspace: PathBuf,
    /// `key=value` pairs passed as `-e`.
    #[serde(default)]
    pub extra_vars: Vec<String>,
    /// Arguments joined into `--ssh-extra-args`.
    #[serde(default)]
    pub ssh_args: Vec<String>,
}

impl JobPayload for PlaybookJob {
    const KIND: JobKind = JobKind::Playbook;
}

/// The program that starts containers, plus any arguments it always needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    program: OsString,
    leading_args: Vec<OsString>,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime {
    /// Use `program` (`docker`, `podman`, …) to run containers.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments inserted before the generated `run …` arguments.
    #[must_use]
    pub fn with_leading_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Arguments passed to the container runtime for `job`.
pub fn build_args(job: &PlaybookJob) -> Vec<OsString> {
    let mut workspace_mount = job.workspace.clone().into_os_string();
    workspace_mount.push(":/workspace:ro");
    let mut key_mount = job.key_file.clone().into_os_string();
    key_mount.push(":/ssh/id_key:ro");

    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--rm".into(),
        "-v".into(),
        workspace_mount,
        "-v".into(),
        key_mount,
        "-w".into(),
        "/workspace".into(),
        job.image.clone().into(),
        "ansible-playbook".into(),
        "-i".into(),
        job.inventory.clone().into(),
        "--private-key".into(),
        "/ssh/id_key".into(),
    ];
    for var in &job.extra_vars {
        args.push("-e".into());
        args.push(var.into());
    }
    if !job.ssh_args.is_empty() {
        args.push("--ssh-extra-args".into());
        args.push(job.ssh_args.join(" ").into());
    }
    args.push(job.playbook.clone().into());
    args
}

/// Runs [`PlaybookJob`]s in a container.
#[derive(Debug, Clone, Default)]
pub struct PlaybookHandler {
    runtime: ContainerRuntime,
    timeout: Option<Duration>,
}

impl PlaybookHandler {
    /// Create a handler that starts containers with `runtime`.
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            timeout: None,
        }
    }

    /// Kill runs that take longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(&self, job: &PlaybookJob) -> Command {
        let mut command = Command::new(&self.runtime.program);
        command
            .args(&self.runtime.leading_args)
            .args(build_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Wait for `child` and collect stdout followed by stderr.
async fn collect(mut child: tokio::process::Child) -> Result<(std::process::ExitStatus, Vec<u8>), HandlerError> {
    let mut stdout = child.stdout.take().context("child stdout was not captured")?;
    let mut stderr = child.stderr.take().context("child stderr was not captured")?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let (status, read_out, read_err) = tokio::join!(
        child.wait(),
        stdout.read_to_end(&mut out),
        stderr.read_to_end(&mut err)
    );
    let status = status.context("failed to wait for the container runtime")?;
    read_out.context("failed to read playbook stdout")?;
    read_err.context("failed to read playbook stderr")?;

    out.extend_from_slice(&err);
    Ok((status, out))
}

impl Handler for PlaybookHandler {
    type Payload = PlaybookJob;

    async fn run(&self, job: PlaybookJob, cancel: CancellationToken) -> Result<(), HandlerError> {
        info!(image = %job.image, playbook = %job.playbook, "Running playbook…");
        let mut command = self.command(&job);
        debug!(command = ?command.as_std(), "Spawning container runtime");

        let child = command
            .spawn()
            .with_context(|| format!("failed to start {:?}", self.runtime.program))?;

        // Dropping the collecting future drops the child, which kills it.
        let (status, output) = tokio::select! {
            () = cancel.cancelled() => return Err(HandlerError::Canceled),
            result = with_deadline(self.timeout, collect(child)) => result?,
        };

        if !status.success() {
            return Err(anyhow!("playbook run failed with {status}: {}", output_excerpt(&output)).into());
        }

        info!(playbook = %job.playbook, "Playbook finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_matches, assert_ok};
    use std::time::Instant;

    fn job() -> PlaybookJob {
        PlaybookJob {
            image: "cytopia/ansible:latest".into(),
            playbook: "site.yml".into(),
            inventory: "hosts.ini".into(),
            key_file: "/keys/id_ed25519".into(),
            workspace: "/srv/checkout".into(),
            extra_vars: vec![],
            ssh_args: vec![],
        }
    }

    /// A runtime that hands the generated arguments to a shell snippet.
    fn sh(script: &str) -> PlaybookHandler {
        PlaybookHandler::new(ContainerRuntime::new("sh").with_leading_args(["-c", script, "sh"]))
    }

    #[test]
    fn minimal_arguments() {
        let args = build_args(&job());
        assert_eq!(
            args,
            [
                "run",
                "--rm",
                "-v",
                "/srv/checkout:/workspace:ro",
                "-v",
                "/keys/id_ed25519:/ssh/id_key:ro",
                "-w",
                "/workspace",
                "cytopia/ansible:latest",
                "ansible-playbook",
                "-i",
                "hosts.ini",
                "--private-key",
                "/ssh/id_key",
                "site.yml",
            ]
        );
    }

    #[test]
    fn extra_vars_and_ssh_args() {
        let job = PlaybookJob {
            extra_vars: vec!["env=prod".into(), "tier=web".into()],
            ssh_args: vec!["-o".into(), "StrictHostKeyChecking=no".into()],
            ..job()
        };
        let args = build_args(&job);
        let tail: Vec<_> = args[14..].iter().map(|arg| arg.to_string_lossy()).collect();
        assert_eq!(
            tail,
            [
                "-e",
                "env=prod",
                "-e",
                "tier=web",
                "--ssh-extra-args",
                "-o StrictHostKeyChecking=no",
                "site.yml",
            ]
        );
    }

    #[test]
    fn runtime_defaults_to_docker() {
        assert_eq!(ContainerRuntime::default(), ContainerRuntime::new("docker"));
    }

    #[tokio::test]
    async fn zero_exit_succeeds() {
        let handler = sh(r#"test "$1" = run && test "$2" = --rm"#);
        assert_ok!(handler.run(job(), CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn failure_includes_exit_status_and_output() {
        let handler = sh("echo 'PLAY RECAP'; echo 'unreachable=1' >&2; exit 4");
        let err = handler.run(job(), CancellationToken::new()).await.unwrap_err();

        assert!(err.is_retryable());
        let message = err.to_string();
        assert!(message.starts_with("playbook run failed with exit status: 4"), "{message}");
        assert!(message.contains("PLAY RECAP"), "{message}");
        assert!(message.contains("unreachable=1"), "{message}");
    }

    #[tokio::test]
    async fn missing_runtime_is_retryable() {
        let handler = PlaybookHandler::new(ContainerRuntime::new("/nonexistent/docker"));
        let err = handler.run(job(), CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("failed to start"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let handler = sh("sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = handler.run(job(), cancel).await.unwrap_err();
        assert_matches!(err, HandlerError::Canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let handler = sh("sleep 30").with_timeout(Duration::from_millis(100));
        let started = Instant::now();

        let err = handler.run(job(), CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "timed out after 100ms");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
