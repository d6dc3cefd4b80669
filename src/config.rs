//! Connection configuration: SSH algorithm tables and pool defaults.
//!
//! The algorithm tables are grouped by security level. `Secure` keeps only
//! modern algorithms, `Balanced` adds widely deployed older ones, and
//! `LegacyCompatible` accepts everything the transport can speak, which is
//! sometimes needed for old appliances and minimal distributions.
//!
//! The timing constants define the dial contract: a fixed per-attempt
//! timeout, a retry interval, and an overall deadline.

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Default number of sessions allowed open at once on one connection.
pub const DEFAULT_SESSION_LIMIT: usize = 5;

/// Timeout for a single connect + handshake + authentication attempt.
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Overall dial deadline, measured from the first attempt.
pub const DIAL_DEADLINE: Duration = Duration::from_secs(60);

/// Pause between failed dial attempts.
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable overriding the session limit.
pub const SESSION_LIMIT_ENV: &str = "TF_LINUX_SSH_SESSION_LIMIT";

/// Retry and timeout policy used while dialing a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    pub attempt_timeout: Duration,
    pub deadline: Duration,
    pub retry_interval: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: CONNECT_ATTEMPT_TIMEOUT,
            deadline: DIAL_DEADLINE,
            retry_interval: DIAL_RETRY_INTERVAL,
        }
    }
}

/// Tunables for a [`ConnectionManager`](crate::session::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum concurrently open sessions per connection (the provider's `ssh_session_limit`).
    pub session_limit: usize,
    /// Per-attempt connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Overall dial deadline in seconds.
    pub dial_deadline_secs: u64,
    /// Pause between dial attempts in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_limit: DEFAULT_SESSION_LIMIT,
            connect_timeout_secs: CONNECT_ATTEMPT_TIMEOUT.as_secs(),
            dial_deadline_secs: DIAL_DEADLINE.as_secs(),
            retry_interval_ms: DIAL_RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl ManagerConfig {
    /// Defaults, with the session limit taken from `TF_LINUX_SSH_SESSION_LIMIT` when set.
    pub fn from_env() -> Result<Self, RemoteError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(SESSION_LIMIT_ENV)
            && !raw.trim().is_empty()
        {
            config.session_limit = raw.trim().parse().map_err(|_| {
                RemoteError::InvalidArgument(format!("{SESSION_LIMIT_ENV}={raw} is not a number"))
            })?;
        }
        Ok(config)
    }

    /// Dial policy derived from the timing fields.
    pub fn dial_policy(&self) -> DialPolicy {
        DialPolicy {
            attempt_timeout: Duration::from_secs(self.connect_timeout_secs),
            deadline: Duration::from_secs(self.dial_deadline_secs),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    /// Session limit, never below one.
    pub fn effective_session_limit(&self) -> usize {
        self.session_limit.max(1)
    }
}

/// Modern key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
    kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
];

/// Modern key exchange plus group-exchange and SHA-1 group 14.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
    kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
];

/// Every key exchange algorithm the transport supports.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
    kex::NONE,
];

pub static SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

/// Includes unencrypted transports for compatibility with older servers.
pub static LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::CLEAR,
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

/// Command output is small and interactive, so compression stays off.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[compression::NONE];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::SkEd25519,
];
