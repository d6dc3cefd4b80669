//! # linuxbox - Pooled SSH Command Execution for Linux Hosts
//!
//! `linuxbox` runs shell commands on remote Linux machines over SSH. Callers
//! register a target once and then issue commands concurrently; the crate
//! dials each target at most once, shares the connection between every
//! caller, and bounds how many sessions run on it at the same time.
//!
//! ## Features
//!
//! - **Connection Pooling**: One authenticated connection per registered target, dialed on first use
//! - **Single-Flight Dialing**: Concurrent first uses of a target wait for one dial and share its outcome
//! - **Bounded Sessions**: At most `session_limit` commands run on a connection at once
//! - **Bounded Retries**: Unreachable or unresponsive hosts are retried for a fixed window
//! - **Privilege Escalation**: Optional `sudo`, with or without a password piped to `sudo --stdin`
//! - **Host Operations**: Files, users, systemd services and yum/apt packages in [`linux`]
//! - **Transcripts**: Record commands to JSONL and replay them offline through the same API
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linuxbox::descriptor::ConnectionDescriptor;
//! use linuxbox::linux::{file, systemd};
//! use linuxbox::session::ConnectionManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::new();
//!     let target = manager.register(
//!         ConnectionDescriptor::new("192.168.1.20", "deploy")
//!             .with_private_key("/home/deploy/.ssh/id_ed25519", None)
//!             .with_sudo(None),
//!     )?;
//!
//!     // A single command, escalated through sudo.
//!     let output = manager.run(&target, true, "uptime", "").await?;
//!     println!("{}", output.stdout);
//!
//!     // Host operations share the same pooled connection.
//!     let host = manager.host(&target);
//!     let details = file::get_details(&host, "/etc/nginx/nginx.conf", true).await?;
//!     println!("mode {:o} owned by {}", details.mode, details.owner);
//!     systemd::restart(&host, "nginx", true).await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::ConnectionManager`] - Registry of pooled connections and the command entry point
//! - [`session::SshDialer`] - Dials and authenticates targets over russh
//! - [`session::SessionRecorder`] / [`session::SessionReplayer`] - JSONL transcripts
//! - [`host::RemoteHost`] - A target bound to its manager, used by [`linux`] operations
//! - [`error::RemoteError`] - Error types for dialing, sessions and commands
//! - [`config`] - Timing defaults, manager configuration and SSH algorithm tables

pub mod config;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod linux;
pub mod session;

pub use descriptor::ConnectionDescriptor;
pub use error::RemoteError;
pub use host::RemoteHost;
pub use session::{Command, CommandOutput, ConnectionManager, TargetHandle};
