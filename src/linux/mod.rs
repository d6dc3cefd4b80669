//! Host operations for managing Linux machines.
//!
//! Every operation takes a [`RemoteHost`] and a `sudo` flag, runs one or more
//! shell commands through the host's pooled connection, and reports a failed
//! command as [`RemoteError::Operation`] naming that command. The original
//! error, including any captured output, stays available through
//! [`RemoteError::is_exec_error`] and [`RemoteError::captured_output`].
//!
//! Paths, names and versions are interpolated into the command line as
//! given, with no quoting. They must come from trusted input.
//!
//! # Modules
//!
//! - [`command`] - command lookup
//! - [`file`] - files and directories, with create-or-roll-back compositions
//! - [`user`] - users and groups
//! - [`systemd`] - systemd units
//! - [`package`] - yum and apt packages

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::host::RemoteHost;
use crate::session::Dial;

pub mod command;
pub mod file;
pub mod package;
pub mod systemd;
pub mod user;

pub use file::{DirectorySpec, FileDetails, FileSpec};
pub use package::{PackageManager, PackageState};
pub use systemd::{ServiceManager, ServiceState};
pub use user::{Group, User};

/// Treats an empty string like an absent value.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
