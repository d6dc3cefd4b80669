use super::*;

use tokio::time::{Instant, sleep, timeout};

use super::auth::Credentials;
use super::security::verify_host_key;
use crate::error::is_connect_timeout;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Dials targets over SSH with a bounded retry loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshDialer {
    policy: DialPolicy,
}

impl SshDialer {
    pub fn new(policy: DialPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DialPolicy {
        self.policy
    }
}

impl Dial for SshDialer {
    type Connection = SshConnection;

    async fn dial(&self, target: &TargetHandle) -> Result<SshConnection, RemoteError> {
        let descriptor = target.descriptor();
        descriptor.validate()?;

        let credentials = Credentials::assemble(descriptor).await?;
        debug!(
            "Dialing {} (password: {}, agent identities: {}, key file: {})",
            descriptor.display_name(),
            credentials.has_password(),
            credentials.agent_identities(),
            credentials.has_key()
        );
        let credentials = Arc::new(tokio::sync::Mutex::new(credentials));

        let config = Arc::new(russh_client::Config {
            preferred: target.security().preferred(),
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        });

        let name = descriptor.display_name();
        retry_dial(self.policy, &name, || {
            connect_once(config.clone(), target.clone(), credentials.clone())
        })
        .await
    }
}

/// Runs `attempt` until it succeeds or the policy gives up.
///
/// Each attempt is bounded by `policy.attempt_timeout`; an attempt that runs
/// past it fails with an I/O timeout and is retried like any other network
/// failure. Only an error carrying the connect-timeout signature ends the
/// loop with [`RemoteError::ConnectTimeout`]. Errors that are not retryable
/// are returned as they are. Anything else is retried after
/// `policy.retry_interval` until `policy.deadline` has passed since the first
/// attempt; the last error is then returned.
pub async fn retry_dial<T, F, Fut>(
    policy: DialPolicy,
    target: &str,
    mut attempt: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let deadline = Instant::now() + policy.deadline;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match timeout(policy.attempt_timeout, attempt()).await {
            Ok(Ok(connection)) => {
                debug!("Connected to {target} on attempt {attempts}");
                return Ok(connection);
            }
            Ok(Err(e)) => e,
            Err(_) => RemoteError::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("i/o timeout after {:?}", policy.attempt_timeout),
            )),
        };

        if is_connect_timeout(&err) {
            debug!("Timed out connecting to {target}: {err}");
            return Err(RemoteError::ConnectTimeout);
        }
        if !err.is_retryable() {
            debug!("Giving up on {target}: {err}");
            return Err(err);
        }
        if Instant::now() < deadline {
            debug!("Dial attempt {attempts} to {target} failed, retrying: {err}");
            sleep(policy.retry_interval).await;
            continue;
        }

        debug!("Dial deadline for {target} passed after {attempts} attempts: {err}");
        return Err(err);
    }
}

async fn connect_once(
    config: Arc<russh_client::Config>,
    target: TargetHandle,
    credentials: Arc<tokio::sync::Mutex<Credentials>>,
) -> Result<SshConnection, RemoteError> {
    let descriptor = target.descriptor();
    let handler = ClientHandler {
        host: descriptor.host.clone(),
        port: descriptor.port,
        server_check: target.security().server_check.clone(),
    };

    let mut handle =
        russh_client::connect(config, (descriptor.host.as_str(), descriptor.port), handler).await?;

    let name = descriptor.display_name();
    credentials
        .lock()
        .await
        .authenticate(&mut handle, &descriptor.user, &name)
        .await?;

    Ok(SshConnection { handle, name })
}

/// russh event handler; only host key verification is customised.
pub struct ClientHandler {
    host: String,
    port: u16,
    server_check: ServerCheckMethod,
}

impl russh_client::Handler for ClientHandler {
    type Error = RemoteError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        verify_host_key(&self.host, self.port, server_public_key, &self.server_check)?;
        Ok(true)
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    handle: Handle<ClientHandler>,
    name: String,
}

impl RemoteConnection for SshConnection {
    type Channel = SshChannel;

    async fn open_channel(&self) -> Result<SshChannel, RemoteError> {
        let channel = self.handle.channel_open_session().await?;
        trace!("Opened session channel on {}", self.name);
        Ok(SshChannel { channel })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        debug!("Disconnecting {}", self.name);
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

/// One exec channel on an [`SshConnection`].
pub struct SshChannel {
    channel: russh::Channel<russh_client::Msg>,
}

impl ExecChannel for SshChannel {
    async fn exec(&mut self, command: &str) -> Result<(), RemoteError> {
        self.channel.exec(true, command).await?;
        Ok(())
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        if !data.is_empty() {
            self.channel.data(data).await?;
        }
        self.channel.eof().await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Stderr(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::ExitSignal(format!("{signal_name:?}"))
                }
                ChannelMsg::Eof => ChannelEvent::Eof,
                other => {
                    trace!("Ignoring channel message {other:?}");
                    continue;
                }
            };
            return Some(event);
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            trace!("Channel close failed: {e}");
        }
    }
}
