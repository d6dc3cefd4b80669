use super::*;

/// Security level used for SSH algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SecurityLevel {
    /// Strict modern algorithms.
    Secure,
    /// Good security with broader compatibility (default).
    Balanced,
    /// Maximum compatibility with old sshd builds.
    LegacyCompatible,
}

/// Connection security options for SSH establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    /// SSH algorithm policy.
    pub level: SecurityLevel,
    /// Server host key verification method.
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    /// Balanced algorithms without host key verification, which is how
    /// freshly provisioned hosts are usually reached.
    fn default() -> Self {
        Self {
            level: SecurityLevel::Balanced,
            server_check: ServerCheckMethod::NoCheck,
        }
    }
}

impl ConnectionSecurityOptions {
    /// Modern algorithms and `~/.ssh/known_hosts` verification.
    pub fn secure_default() -> Self {
        Self {
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::DefaultKnownHostsFile,
        }
    }

    /// Balanced profile for mixed environments.
    pub fn balanced() -> Self {
        Self {
            level: SecurityLevel::Balanced,
            server_check: ServerCheckMethod::DefaultKnownHostsFile,
        }
    }

    /// Legacy compatibility profile for older hosts.
    pub fn legacy_compatible() -> Self {
        Self {
            level: SecurityLevel::LegacyCompatible,
            server_check: ServerCheckMethod::NoCheck,
        }
    }

    /// Replaces the host key policy.
    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = server_check;
        self
    }

    pub(super) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::Balanced => Preferred {
                kex: Cow::Borrowed(config::BALANCED_KEX_ORDER),
                key: Cow::Borrowed(config::BALANCED_KEY_TYPES),
                cipher: Cow::Borrowed(config::BALANCED_CIPHERS),
                mac: Cow::Borrowed(config::BALANCED_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }
}

/// Checks the server's host key against `check`.
///
/// Any mismatch, unknown host or unreadable pin is reported as
/// [`RemoteError::HostKeyRejected`] so the dial loop does not retry it.
pub(super) fn verify_host_key(
    host: &str,
    port: u16,
    server_key: &PublicKey,
    check: &ServerCheckMethod,
) -> Result<(), RemoteError> {
    let addr = format!("{host}:{port}");
    let rejected = |reason: String| RemoteError::HostKeyRejected(format!("{addr}: {reason}"));

    let accepted = match check {
        ServerCheckMethod::NoCheck => true,
        ServerCheckMethod::PublicKey(encoded) => {
            let pinned = russh::keys::parse_public_key_base64(encoded)
                .map_err(|e| rejected(format!("invalid pinned key: {e}")))?;
            pinned.key_data() == server_key.key_data()
        }
        ServerCheckMethod::PublicKeyFile(path) => {
            let pinned = russh::keys::load_public_key(path)
                .map_err(|e| rejected(format!("unreadable pinned key {path}: {e}")))?;
            pinned.key_data() == server_key.key_data()
        }
        ServerCheckMethod::DefaultKnownHostsFile => {
            russh::keys::check_known_hosts(host, port, server_key)
                .map_err(|e| rejected(e.to_string()))?
        }
        ServerCheckMethod::KnownHostsFile(path) => {
            russh::keys::check_known_hosts_path(host, port, server_key, path)
                .map_err(|e| rejected(e.to_string()))?
        }
        #[allow(unreachable_patterns)]
        _ => false,
    };

    if accepted {
        trace!("Host key accepted for {addr}");
        Ok(())
    } else {
        Err(rejected("server key does not match".to_string()))
    }
}
