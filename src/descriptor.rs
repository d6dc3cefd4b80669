//! Connection descriptors: identity and credentials for one remote target.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Environment variable prefix used by [`ConnectionDescriptor::from_env`].
pub const ENV_PREFIX: &str = "TF_LINUX_";

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(
    || match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)") {
        Ok(re) => re,
        Err(err) => panic!("invalid ENV_REFERENCE regex: {err}"),
    },
);

/// Supported privilege escalation mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMethod {
    Sudo,
}

impl EscalationMethod {
    fn parse(raw: &str) -> Result<Option<Self>, RemoteError> {
        match raw.trim() {
            "" => Ok(None),
            "sudo" => Ok(Some(EscalationMethod::Sudo)),
            other => Err(RemoteError::InvalidDescriptor(format!(
                "unsupported privilege escalation method `{other}`"
            ))),
        }
    }
}

/// Privilege escalation method and optional secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PrivilegeEscalation {
    pub method: EscalationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for PrivilegeEscalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegeEscalation")
            .field("method", &self.method)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Identity and credentials for one remote target.
///
/// Register a descriptor with a
/// [`ConnectionManager`](crate::session::ConnectionManager) to obtain the
/// handle that keys its pooled connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionDescriptor {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path of a private key file, used when the agent is not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub use_ssh_agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege_escalation: Option<PrivilegeEscalation>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field(
                "private_key_passphrase",
                &self.private_key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("use_ssh_agent", &self.use_ssh_agent)
            .field("privilege_escalation", &self.privilege_escalation)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Creates a descriptor for `user@host:22` with no credentials.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            password: None,
            private_key: None,
            private_key_passphrase: None,
            use_ssh_agent: false,
            privilege_escalation: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Uses a private key file, optionally protected by `passphrase`.
    pub fn with_private_key(
        mut self,
        path: impl Into<PathBuf>,
        passphrase: Option<String>,
    ) -> Self {
        self.private_key = Some(path.into());
        self.private_key_passphrase = passphrase;
        self
    }

    pub fn with_agent(mut self, use_agent: bool) -> Self {
        self.use_ssh_agent = use_agent;
        self
    }

    /// Enables sudo escalation, with an optional sudo password.
    pub fn with_sudo(mut self, password: Option<String>) -> Self {
        self.privilege_escalation = Some(PrivilegeEscalation {
            method: EscalationMethod::Sudo,
            password,
        });
        self
    }

    /// `host:port` socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user@host:port`, safe to log.
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// Checks the fields every dial needs.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.host.trim().is_empty() {
            return Err(RemoteError::InvalidDescriptor("host is empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(RemoteError::InvalidDescriptor("user is empty".to_string()));
        }
        if self.port == 0 {
            return Err(RemoteError::InvalidDescriptor(format!(
                "port 0 is not valid for {}",
                self.host
            )));
        }
        Ok(())
    }

    /// Builds a descriptor from `TF_LINUX_*` environment variables.
    ///
    /// `TF_LINUX_SSH_HOST` and `TF_LINUX_SSH_USER` are required. The key path
    /// defaults to `$HOME/.ssh/id_rsa` and environment references in it are
    /// expanded. Agent use defaults to on.
    pub fn from_env() -> Result<Self, RemoteError> {
        let host = env_var("SSH_HOST").unwrap_or_default();
        let user = env_var("SSH_USER").unwrap_or_default();

        let port = match env_var("SSH_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                RemoteError::InvalidDescriptor(format!("{ENV_PREFIX}SSH_PORT={raw} is not a port"))
            })?,
            None => DEFAULT_SSH_PORT,
        };

        let use_ssh_agent = match env_var("USE_SSH_AGENT") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                RemoteError::InvalidDescriptor(format!(
                    "{ENV_PREFIX}USE_SSH_AGENT={raw} is not a boolean"
                ))
            })?,
            None => true,
        };

        let key_path = env_var("SSH_PRIVATE_KEY").unwrap_or_else(|| "$HOME/.ssh/id_rsa".to_string());
        let method = EscalationMethod::parse(&env_var("PRIV_ESC_METHOD").unwrap_or_default())?;

        let descriptor = Self {
            host,
            port,
            user,
            password: env_var("SSH_PASSWORD"),
            private_key: Some(PathBuf::from(expand_env(&key_path))),
            private_key_passphrase: env_var("SSH_PRIVATE_KEY_PASSPHRASE"),
            use_ssh_agent,
            privilege_escalation: method.map(|method| PrivilegeEscalation {
                method,
                password: env_var("PRIV_ESC_PASSWORD"),
            }),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Some(true),
        "0" | "f" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Replaces `$VAR` and `${VAR}` with their values; unset variables expand to "".
fn expand_env(raw: &str) -> String {
    ENV_REFERENCE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}
