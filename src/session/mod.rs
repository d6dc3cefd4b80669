//! SSH connection pooling and command execution.
//!
//! This module turns a registered target into a live, authenticated SSH
//! connection, shares that connection between concurrent callers, bounds the
//! number of sessions open on it, and runs single commands to completion.
//!
//! # Main Components
//!
//! - [`ConnectionManager`] - Registry of pooled connections keyed by [`TargetHandle`]
//! - [`SshDialer`] - Dials and authenticates with a bounded retry loop
//! - [`SessionLimiter`] - Bounds concurrently open sessions per connection
//! - [`PooledConnection`] - A live connection that runs commands through its limiter
//! - [`Command`] / [`CommandOutput`] - Command configuration and captured output
//!
//! The transport sits behind the [`Dial`], [`RemoteConnection`] and
//! [`ExecChannel`] traits; [`SshDialer`] implements them over russh and
//! [`SessionReplayer`] implements them over a recorded transcript.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use log::{debug, trace, warn};
use moka::future::Cache;
use russh::client::{self as russh_client, Handle};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};

use crate::config::{self, DialPolicy, ManagerConfig};
use crate::descriptor::{ConnectionDescriptor, EscalationMethod};
use crate::error::{ExitOutcome, RemoteError};

pub use client::PooledConnection;
pub use dialer::{SshChannel, SshConnection, SshDialer, retry_dial};
pub use limiter::{Session, SessionLimiter};
pub use manager::{ConnectionManager, TargetHandle};
pub use recording::{
    NormalizeOptions, ReplayChannel, ReplayConnection, ReplayedCommand, SessionEvent,
    SessionRecordEntry, SessionRecordLevel, SessionRecorder, SessionReplayer,
};
pub use security::{ConnectionSecurityOptions, SecurityLevel};

/// Establishes connections to registered targets.
pub trait Dial: Send + Sync + 'static {
    type Connection: RemoteConnection;

    /// Produces a live, authenticated connection or the error that prevented it.
    fn dial(
        &self,
        target: &TargetHandle,
    ) -> impl Future<Output = Result<Self::Connection, RemoteError>> + Send;
}

/// A live connection able to open execution channels.
pub trait RemoteConnection: Send + Sync + 'static {
    type Channel: ExecChannel;

    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel, RemoteError>> + Send;

    /// Whether the underlying transport has gone away.
    fn is_closed(&self) -> bool;

    fn disconnect(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// One command-execution channel.
pub trait ExecChannel: Send + 'static {
    /// Requests execution of `command`.
    fn exec(&mut self, command: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Writes `data` to the command's standard input and closes it.
    fn send_stdin(&mut self, data: &[u8]) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Next event from the remote side; `None` once the channel is closed.
    fn next_event(&mut self) -> impl Future<Output = Option<ChannelEvent>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Events delivered by an [`ExecChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
}

/// Configuration for a command to execute on a host.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Command {
    /// Shell command line, run as a single invocation by the remote shell.
    pub command: String,

    /// Run through the target's privilege escalation method, if one is configured.
    #[serde(default)]
    pub sudo: bool,

    /// Text written to the command's standard input before it is closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Command line actually sent to the host.
    ///
    /// With `sudo` set and sudo configured on the target, the command is
    /// prefixed with `sudo`, or, when a sudo password is configured, the
    /// password is piped into `sudo --stdin` which runs the command through
    /// `sh -c`. Both the password and the command are interpolated literally
    /// with no quoting, so they must come from trusted input.
    pub fn render(&self, descriptor: &ConnectionDescriptor) -> String {
        let escalation = match &descriptor.privilege_escalation {
            Some(escalation) if self.sudo => escalation,
            _ => return self.command.clone(),
        };
        match (escalation.method, escalation.password.as_deref()) {
            (EscalationMethod::Sudo, None | Some("")) => format!("sudo {}", self.command),
            (EscalationMethod::Sudo, Some(secret)) => format!(
                "echo '{secret}' | sudo --prompt='' --stdin sh -c \"{}\"",
                self.command
            ),
        }
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

mod auth;
mod client;
mod dialer;
mod limiter;
mod manager;
mod recording;
mod security;

#[cfg(test)]
pub(crate) mod testing;
