use super::*;

use russh::keys::PrivateKey;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Signs through the agent without holding a borrowed key across an await,
/// which keeps the authentication future `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Authentication material gathered once per dial.
pub(super) struct Credentials {
    password: Option<String>,
    agent: Option<(DynAgent, Vec<PublicKey>)>,
    key: Option<Arc<PrivateKey>>,
}

impl Credentials {
    /// Collects the candidates offered to the server, in order: the password,
    /// the agent's identities when the agent is requested and reachable, or
    /// else the configured key file.
    ///
    /// An unreachable agent is not an error; it just contributes nothing. A
    /// key file that cannot be read is, but one that reads and fails to
    /// decode (or takes a different passphrase) is skipped with a warning.
    pub(super) async fn assemble(descriptor: &ConnectionDescriptor) -> Result<Self, RemoteError> {
        let password = descriptor.password.clone().filter(|p| !p.is_empty());

        let agent = if descriptor.use_ssh_agent {
            connect_agent().await
        } else {
            None
        };

        let key = match (&descriptor.private_key, descriptor.use_ssh_agent) {
            (Some(path), false) => {
                let passphrase = descriptor
                    .private_key_passphrase
                    .as_deref()
                    .filter(|p| !p.is_empty());
                let secret = std::fs::read_to_string(path).map_err(|e| {
                    RemoteError::PrivateKey {
                        path: path.display().to_string(),
                        source: e.into(),
                    }
                })?;
                match russh::keys::decode_secret_key(&secret, passphrase) {
                    Ok(key) => Some(Arc::new(key)),
                    Err(e) => {
                        warn!(
                            "Ignoring private key {} that could not be decoded: {e}",
                            path.display()
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Self {
            password,
            agent,
            key,
        })
    }

    pub(super) fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub(super) fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub(super) fn agent_identities(&self) -> usize {
        self.agent.as_ref().map_or(0, |(_, keys)| keys.len())
    }

    /// Offers every candidate until the server accepts one.
    pub(super) async fn authenticate<H>(
        &mut self,
        handle: &mut Handle<H>,
        user: &str,
        target: &str,
    ) -> Result<(), RemoteError>
    where
        H: russh_client::Handler,
    {
        let mut offered = false;

        if let Some(password) = &self.password {
            offered = true;
            if handle.authenticate_password(user, password).await?.success() {
                debug!("Password authentication accepted for {target}");
                return Ok(());
            }
        }

        if let Some((agent, keys)) = &mut self.agent {
            for key in keys.iter() {
                offered = true;
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                match handle
                    .authenticate_publickey_with(
                        user,
                        key.clone(),
                        hash_alg,
                        &mut AgentSigner { agent: &mut *agent },
                    )
                    .await
                {
                    Ok(result) if result.success() => {
                        debug!("Agent key {} accepted for {target}", key.algorithm());
                        return Ok(());
                    }
                    Ok(_) => trace!("Agent key {} rejected for {target}", key.algorithm()),
                    Err(e) => return Err(RemoteError::AgentError(e.to_string())),
                }
            }
        }

        if let Some(key) = &self.key {
            offered = true;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);
            if handle
                .authenticate_publickey(user, key_with_hash)
                .await?
                .success()
            {
                debug!("Key file authentication accepted for {target}");
                return Ok(());
            }
        }

        if !offered && handle.authenticate_none(user).await?.success() {
            return Ok(());
        }

        Err(RemoteError::AuthenticationFailed(target.to_string()))
    }
}

#[cfg(unix)]
async fn connect_agent() -> Option<(DynAgent, Vec<PublicKey>)> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none_or(|sock| sock.is_empty()) {
        return None;
    }
    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent.dynamic(),
        Err(e) => {
            warn!("Unable to reach ssh agent, continuing without it: {e}");
            return None;
        }
    };
    match agent.request_identities().await {
        Ok(keys) => {
            debug!("Ssh agent offers {} identities", keys.len());
            Some((agent, keys))
        }
        Err(e) => {
            warn!("Unable to list ssh agent identities, continuing without them: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
async fn connect_agent() -> Option<(DynAgent, Vec<PublicKey>)> {
    None
}
