//! Error types for remote connection management and command execution.
//!
//! This module defines every error the crate surfaces: descriptor and key
//! setup problems, dial failures (including the distinguished connect
//! timeout), session acquisition failures, and commands that ran on the
//! remote host but did not succeed.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Substring the protocol layer uses when a connection attempt timed out.
const CONNECT_TIMEOUT_SIGNATURE: &str = "timed out while connecting to ssh";

/// How a remote command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited with this status code.
    Code(u32),
    /// The process was terminated by a signal.
    Signal(String),
    /// The channel closed without the server reporting an exit status.
    Missing,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "Process exited with status {code}"),
            ExitOutcome::Signal(signal) => write!(f, "Process exited with signal {signal}"),
            ExitOutcome::Missing => write!(f, "Process exited without exit status or exit signal"),
        }
    }
}

/// Errors that can occur while connecting to a host or running a command on it.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The connection descriptor is malformed (empty host, empty user, port 0, ...).
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// The configured private key file could not be read.
    #[error("while reading private ssh key {path}: {source}")]
    PrivateKey {
        path: String,
        #[source]
        source: russh::keys::Error,
    },

    /// A connection attempt exceeded the per-attempt timeout.
    ///
    /// Dial attempts that fail this way are never retried.
    #[error("timed out connecting to ssh daemon")]
    ConnectTimeout,

    /// The server's host key did not pass verification.
    #[error("host key verification failed for {0}")]
    HostKeyRejected(String),

    /// None of the offered credentials were accepted by the server.
    #[error("ssh authentication failed for {0}")]
    AuthenticationFailed(String),

    /// Signing through the SSH agent failed.
    #[error("ssh agent error: {0}")]
    AgentError(String),

    /// Network level I/O failure.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// The target's connection could not be established.
    ///
    /// The failure is cached by the pool; every caller for the same target
    /// observes the same underlying error.
    #[error("connection to {target} unavailable: {source}")]
    Unavailable {
        target: String,
        #[source]
        source: Arc<RemoteError>,
    },

    /// Opening an execution channel on a healthy connection failed.
    #[error("while open ssh session: {0}")]
    SessionOpen(#[source] Box<RemoteError>),

    /// The connection has been shut down by its manager.
    #[error("connect closed")]
    ConnectClosedError,

    /// The command ran on the remote host but did not exit successfully.
    ///
    /// Captured output is carried alongside the exit outcome.
    #[error("command `{command}` failed: {outcome}")]
    CommandFailed {
        command: String,
        outcome: ExitOutcome,
        stdout: String,
        stderr: String,
    },

    /// A host operation failed while running `command`.
    #[error("Command failed: {command}")]
    Operation {
        command: String,
        #[source]
        source: Box<RemoteError>,
    },

    /// A command succeeded but produced output that could not be interpreted.
    #[error("unexpected output from `{command}`: {reason}")]
    UnexpectedOutput { command: String, reason: String },

    /// The requested remote object does not exist.
    #[error("{0}")]
    NotFound(String),

    /// An argument passed to a host operation is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Neither `yum` nor `apt` is available on the host.
    #[error("No package manager found")]
    NoPackageManager,

    /// No supported service manager is available on the host.
    #[error("No service manager found")]
    NoServiceManager,

    /// A replayed transcript had no entry for the requested command.
    #[error("replay mismatch: {0}")]
    ReplayMismatchError(String),

    #[error("internal error: {0}")]
    InternalServerError(String),
}

impl RemoteError {
    /// Wraps `self` with the command that was being run.
    pub fn while_running(self, command: impl Into<String>) -> Self {
        RemoteError::Operation {
            command: command.into(),
            source: Box::new(self),
        }
    }

    /// Returns true for the distinguished connect-timeout kind.
    pub fn is_connect_timeout(&self) -> bool {
        is_connect_timeout(self)
    }

    /// Returns true when a command ran remotely and failed.
    ///
    /// Context wrappers added by host operations are looked through.
    pub fn is_exec_error(&self) -> bool {
        matches!(self.innermost(), RemoteError::CommandFailed { .. })
    }

    /// Exit code of a failed command, if the failure was a non-zero exit.
    pub fn exit_status(&self) -> Option<u32> {
        match self.innermost() {
            RemoteError::CommandFailed {
                outcome: ExitOutcome::Code(code),
                ..
            } => Some(*code),
            _ => None,
        }
    }

    /// Captured `(stdout, stderr)` of a failed command.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self.innermost() {
            RemoteError::CommandFailed { stdout, stderr, .. } => {
                Some((stdout.as_str(), stderr.as_str()))
            }
            _ => None,
        }
    }

    /// The cached dial failure behind an [`RemoteError::Unavailable`].
    pub fn dial_failure(&self) -> Option<&RemoteError> {
        let mut current = self;
        while let RemoteError::Operation { source, .. } = current {
            current = source;
        }
        match current {
            RemoteError::Unavailable { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Whether a failed dial attempt may be retried.
    ///
    /// Setup problems and connect timeouts are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RemoteError::InvalidDescriptor(_)
                | RemoteError::PrivateKey { .. }
                | RemoteError::ConnectTimeout
                | RemoteError::HostKeyRejected(_)
                | RemoteError::ConnectClosedError
        ) && !is_connect_timeout(self)
    }

    /// Steps through `Operation`, `Unavailable` and `SessionOpen` wrappers.
    fn innermost(&self) -> &RemoteError {
        let mut current = self;
        loop {
            current = match current {
                RemoteError::Operation { source, .. } => source.as_ref(),
                RemoteError::Unavailable { source, .. } => source.as_ref(),
                RemoteError::SessionOpen(source) => source.as_ref(),
                _ => return current,
            };
        }
    }
}

/// Classifies `err` as a connect timeout.
///
/// An error is a connect timeout if it is, or wraps, a
/// [`RemoteError::ConnectTimeout`], or its message carries the protocol
/// layer's timed-out-connecting signature.
pub fn is_connect_timeout(err: &RemoteError) -> bool {
    matches!(err.innermost(), RemoteError::ConnectTimeout)
        || err.to_string().contains(CONNECT_TIMEOUT_SIGNATURE)
}
