//! Resilient in-cluster command execution.
//!
//! [`CommandExecutor::execute`] runs a shell command inside a pod in three
//! strictly ordered steps:
//!
//! 1. A readiness gate polls the pod's live status under a backoff schedule
//!    until the required condition holds.
//! 2. An exec upgrade stream is opened against the pod (stdin and TTY off,
//!    stdout/stderr captured).
//! 3. The stream is driven to completion. A failure matching the known
//!    dial-reset signature — the node proxy racing the stream's discovery of
//!    a live endpoint — retries the stream step under its own schedule; any
//!    other failure is terminal.
//!
//! The two retry classes carry separate budgets so a flapping readiness
//! probe cannot eat the stream budget, and vice versa.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::{retry_classified, BackoffConfig, RetryClass};

/// Error-message signature of the transient exec dial failure.
///
/// Covers both the `error dialing backend: EOF` and the
/// `error dialing backend: connection reset before response` spellings.
const DIAL_RESET_SIGNATURE: &str = "error dialing backend";

/// Identifies an addressable pod inside the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    /// Namespace the pod lives in
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodRef {
    /// Create a pod reference from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// All arguments needed to execute a command inside a container.
///
/// Immutable once constructed; printing renders the space-joined argv.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    command: String,
    args: Vec<String>,
}

impl ShellCommand {
    /// Create a new command. The executable is mandatory; there can be zero
    /// to n arguments.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The full argv: executable followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.args.len());
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured output of a completed in-pod command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout
    pub stdout: Vec<u8>,
    /// Everything the command wrote to stderr
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Stdout as lossy UTF-8
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as lossy UTF-8
    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The pod condition the readiness gate waits for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedStatus {
    /// Phase is Running
    Started,
    /// The ContainersReady condition is True
    Ready,
}

impl fmt::Display for ExpectedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedStatus::Started => write!(f, "started"),
            ExpectedStatus::Ready => write!(f, "ready"),
        }
    }
}

/// Whether a live pod satisfies the expected status
fn status_satisfied(pod: &Pod, expected: ExpectedStatus) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    match expected {
        ExpectedStatus::Started => status.phase.as_deref() == Some("Running"),
        ExpectedStatus::Ready => status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "ContainersReady" && c.status == "True"),
    }
}

/// Render the observed pod state for diagnostics
fn observed_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "<no status>".to_string())
}

/// Reads a pod's live status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodReader: Send + Sync {
    /// Fetch the current state of the referenced pod
    async fn get_pod(&self, pod: &PodRef) -> Result<Pod>;
}

/// Opens an exec stream to a pod and drives it to completion
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecStreamer: Send + Sync {
    /// Run the command in the pod, buffering stdout and stderr.
    ///
    /// A non-success termination status is an error carrying the buffered
    /// output.
    async fn stream(&self, pod: &PodRef, command: &ShellCommand) -> Result<ExecOutput>;
}

/// [`PodReader`] backed by the Kubernetes API
pub struct KubePodReader {
    client: Client,
}

impl KubePodReader {
    /// Create a reader over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodReader for KubePodReader {
    async fn get_pod(&self, pod: &PodRef) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        Ok(api.get(&pod.name).await?)
    }
}

/// [`ExecStreamer`] backed by the Kubernetes exec subresource (SPDY/WebSocket
/// upgrade)
pub struct KubeExecStreamer {
    client: Client,
}

impl KubeExecStreamer {
    /// Create a streamer over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Whether a stream failure is the transient dial-reset race.
///
/// Only the failure's own message (or the establishment transport error) is
/// inspected; the buffered command output can legitimately contain the
/// signature and must never trigger a retry.
fn is_dial_reset(err: &Error) -> RetryClass {
    let transient = match err {
        Error::StreamExecution { message, .. } => message.contains(DIAL_RESET_SIGNATURE),
        Error::StreamEstablishment { source, .. } => {
            source.to_string().contains(DIAL_RESET_SIGNATURE)
        }
        _ => false,
    };
    if transient {
        RetryClass::Retryable
    } else {
        RetryClass::Terminal
    }
}

/// The failure message of a non-success termination status, if any
fn termination_failure(status: &Status) -> Option<String> {
    if status.status.as_deref() != Some("Failure") {
        return None;
    }
    Some(
        status
            .message
            .clone()
            .or_else(|| status.reason.clone())
            .unwrap_or_default(),
    )
}

fn stream_failure(pod: &PodRef, stdout: &[u8], stderr: &[u8], message: impl Into<String>) -> Error {
    Error::StreamExecution {
        pod: pod.to_string(),
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
        message: message.into(),
    }
}

#[async_trait]
impl ExecStreamer for KubeExecStreamer {
    async fn stream(&self, pod: &PodRef, command: &ShellCommand) -> Result<ExecOutput> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        // Note: with a TTY the shell may emit ANSI codes into stdout.
        let params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached =
            api.exec(&pod.name, command.argv(), &params)
                .await
                .map_err(|source| Error::StreamEstablishment {
                    pod: pod.to_string(),
                    source,
                })?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| stream_failure(pod, &[], &[], "exec stream exposed no stdout"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| stream_failure(pod, &[], &[], "exec stream exposed no stderr"))?;
        let status = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_read, err_read) = futures::future::join(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
        )
        .await;
        if let Err(e) = out_read.and(err_read) {
            return Err(stream_failure(
                pod,
                &stdout,
                &stderr,
                format!("reading exec streams failed: {e}"),
            ));
        }

        let termination = match status {
            Some(status) => status.await,
            None => None,
        };
        attached.join().await.map_err(|e| {
            stream_failure(
                pod,
                &stdout,
                &stderr,
                format!("exec stream did not shut down cleanly: {e}"),
            )
        })?;

        if let Some(message) = termination.as_ref().and_then(termination_failure) {
            return Err(stream_failure(pod, &stdout, &stderr, message));
        }

        debug!(pod = %pod, command = %command, "Exec stream completed");
        Ok(ExecOutput { stdout, stderr })
    }
}

/// Executes shell commands inside pods, recovering from known transient
/// failures.
pub struct CommandExecutor {
    reader: Arc<dyn PodReader>,
    streamer: Arc<dyn ExecStreamer>,
    gate_backoff: BackoffConfig,
    stream_backoff: BackoffConfig,
}

impl CommandExecutor {
    /// Create an executor over the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self::with_collaborators(
            Arc::new(KubePodReader::new(client.clone())),
            Arc::new(KubeExecStreamer::new(client)),
        )
    }

    /// Create an executor with explicit collaborators (used by tests to
    /// substitute fakes)
    pub fn with_collaborators(reader: Arc<dyn PodReader>, streamer: Arc<dyn ExecStreamer>) -> Self {
        Self {
            reader,
            streamer,
            gate_backoff: BackoffConfig::default(),
            stream_backoff: BackoffConfig::default(),
        }
    }

    /// Override the readiness-gate backoff schedule
    pub fn gate_backoff(mut self, config: BackoffConfig) -> Self {
        self.gate_backoff = config;
        self
    }

    /// Override the stream-recovery backoff schedule
    pub fn stream_backoff(mut self, config: BackoffConfig) -> Self {
        self.stream_backoff = config;
        self
    }

    /// Execute a command in a pod once it satisfies `expected`.
    ///
    /// The readiness gate always completes (success or timeout) strictly
    /// before the stream is opened. Concurrent calls against the same pod
    /// are not coordinated; stdout interleaving is the caller's problem.
    pub async fn execute(
        &self,
        pod: &PodRef,
        command: &ShellCommand,
        expected: ExpectedStatus,
    ) -> Result<ExecOutput> {
        self.wait_for_status(pod, expected).await?;

        retry_classified(
            &self.stream_backoff,
            "exec_stream",
            is_dial_reset,
            || self.streamer.stream(pod, command),
        )
        .await
    }

    /// Poll the pod until `expected` holds or the gate schedule exhausts.
    ///
    /// Only the distinguished condition-pending kind is retried; transport
    /// errors surface immediately so a flapping probe cannot hide them.
    async fn wait_for_status(&self, pod: &PodRef, expected: ExpectedStatus) -> Result<()> {
        let result = retry_classified(
            &self.gate_backoff,
            "pod_readiness_gate",
            |err: &Error| match err {
                Error::ConditionPending { .. } => RetryClass::Retryable,
                _ => RetryClass::Terminal,
            },
            || async {
                let live = self.reader.get_pod(pod).await?;
                if status_satisfied(&live, expected) {
                    Ok(())
                } else {
                    Err(Error::ConditionPending {
                        pod: pod.to_string(),
                        expected: expected.to_string(),
                        observed: observed_phase(&live),
                    })
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(Error::ConditionPending {
                pod,
                expected,
                observed,
            }) => Err(Error::PreconditionTimeout {
                pod,
                expected,
                last_observed: observed,
            }),
            Err(e) => Err(e),
        }
    }
}
