//! Host bootstrap over SSH.
//!
//! The handler opens a session with in-memory key material, runs
//! `sudo bash -s` on the target and streams the bootstrap script to its stdin.

use super::{output_excerpt, with_deadline};
use crate::handler::{Handler, HandlerError, JobPayload};
use crate::schema::JobKind;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const fn default_port() -> u16 {
    22
}

/// Payload of a `bootstrap` job.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapJob {
    /// Address of the target host.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub user: String,
    /// PEM or OpenSSH encoded private key used to authenticate.
    pub private_key: String,
    /// Account the script should create on the host.
    #[serde(default)]
    pub create_user: Option<String>,
    /// Run `sudo` without prompting and tell the script not to ask questions.
    #[serde(default)]
    pub non_interactive: bool,
    /// Body of the bootstrap script.
    pub script: String,
}

impl fmt::Debug for BootstrapJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapJob")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .field("create_user", &self.create_user)
            .field("non_interactive", &self.non_interactive)
            .field("script", &format_args!("<{} bytes>", self.script.len()))
            .finish()
    }
}

impl JobPayload for BootstrapJob {
    const KIND: JobKind = JobKind::Bootstrap;
}

/// Quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The remote command that runs the script read from stdin.
pub fn build_command(job: &BootstrapJob) -> String {
    let mut command = String::from("sudo ");
    if job.non_interactive {
        command.push_str("-n ");
    }
    command.push_str("bash -s --");
    if let Some(user) = &job.create_user {
        command.push_str(" --create-user ");
        command.push_str(&shell_quote(user));
    }
    if job.non_interactive {
        command.push_str(" --non-interactive");
    }
    command
}

/// What a remote command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit status reported by the server, if any.
    pub exit_status: Option<u32>,
    /// Interleaved stdout and stderr.
    pub output: Vec<u8>,
}

/// Runs one command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync + 'static {
    /// Connect to `job.host` as `job.user`, run `command` and feed it `stdin`.
    async fn exec(&self, job: &BootstrapJob, command: &str, stdin: &[u8]) -> Result<RemoteOutput, HandlerError>;
}

/// [`RemoteShell`] backed by `russh`.
#[derive(Clone)]
pub struct SshShell {
    config: Arc<client::Config>,
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Longest pause between keepalive requests on an open session.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

impl SshShell {
    /// Create a shell that drops connections whose server stops answering for
    /// `inactivity_timeout`.
    ///
    /// Keepalives are sent well within that window, so a script that prints
    /// nothing for a long time keeps its session. Limit run time with
    /// [`BootstrapHandler::with_timeout`] instead.
    pub fn new(inactivity_timeout: Duration) -> Self {
        let keepalive = KEEPALIVE_INTERVAL
            .min(inactivity_timeout / 2)
            .max(Duration::from_secs(1));
        let config = client::Config {
            inactivity_timeout: Some(inactivity_timeout),
            keepalive_interval: Some(keepalive),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }

    async fn run(&self, job: &BootstrapJob, key: KeyPair, command: &str, stdin: &[u8]) -> anyhow::Result<RemoteOutput> {
        let client = HostKeyLogger {
            host: job.host.clone(),
        };
        let mut session = client::connect(Arc::clone(&self.config), (job.host.as_str(), job.port), client)
            .await
            .with_context(|| format!("failed to connect to {}:{}", job.host, job.port))?;

        let authenticated = session
            .authenticate_publickey(&job.user, Arc::new(key))
            .await
            .context("public key authentication failed")?;
        if !authenticated {
            bail!("{}@{} rejected the public key", job.user, job.host);
        }

        let mut channel = session
            .channel_open_session()
            .await
            .context("failed to open a session channel")?;
        channel
            .exec(true, command)
            .await
            .context("failed to start the remote command")?;
        channel.data(stdin).await.context("failed to send the script")?;
        channel.eof().await.context("failed to close the remote stdin")?;

        let mut result = RemoteOutput::default();
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                    result.output.extend_from_slice(&data);
                }
                ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
                _ => {}
            }
        }

        if let Err(error) = session.disconnect(Disconnect::ByApplication, "", "English").await {
            debug!("Failed to disconnect cleanly: {error}");
        }
        Ok(result)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, job: &BootstrapJob, command: &str, stdin: &[u8]) -> Result<RemoteOutput, HandlerError> {
        let key = russh_keys::decode_secret_key(&job.private_key, None)
            .context("failed to decode the private key")
            .map_err(HandlerError::permanent)?;
        Ok(self.run(job, key, command, stdin).await?)
    }
}

/// Accepts any host key and logs its fingerprint.
struct HostKeyLogger {
    host: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(host = %self.host, fingerprint = %server_public_key.fingerprint(), "Accepting host key");
        Ok(true)
    }
}

/// Runs [`BootstrapJob`]s through a [`RemoteShell`].
pub struct BootstrapHandler<S = SshShell> {
    shell: S,
    timeout: Option<Duration>,
}

impl<S: RemoteShell> BootstrapHandler<S> {
    /// Create a handler without a time limit.
    pub fn new(shell: S) -> Self {
        Self { shell, timeout: None }
    }

    /// Fail runs that take longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S: RemoteShell> Handler for BootstrapHandler<S> {
    type Payload = BootstrapJob;

    async fn run(&self, job: BootstrapJob, cancel: CancellationToken) -> Result<(), HandlerError> {
        let command = build_command(&job);
        info!(host = %job.host, port = job.port, user = %job.user, "Bootstrapping host…");
        debug!(%command, "Running remote command");

        let exec = with_deadline(self.timeout, self.shell.exec(&job, &command, job.script.as_bytes()));
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(HandlerError::Canceled),
            result = exec => result?,
        };

        match result.exit_status {
            Some(0) => {
                info!(host = %job.host, "Host bootstrapped");
                Ok(())
            }
            Some(status) => Err(anyhow!(
                "bootstrap script exited with status {status}: {}",
                output_excerpt(&result.output)
            )
            .into()),
            None => Err(anyhow!(
                "bootstrap script ended without an exit status: {}",
                output_excerpt(&result.output)
            )
            .into()),
        }
    }
}
