use super::*;

/// A live connection shared by every caller of one target.
///
/// Commands run through the connection's [`SessionLimiter`], so at most
/// `bound` of them execute at the same time.
pub struct PooledConnection<C: RemoteConnection> {
    connection: C,
    limiter: SessionLimiter,
}

impl<C: RemoteConnection> PooledConnection<C> {
    pub fn new(connection: C, session_limit: usize) -> Self {
        Self {
            connection,
            limiter: SessionLimiter::new(session_limit),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn limiter(&self) -> &SessionLimiter {
        &self.limiter
    }

    pub fn open_sessions(&self) -> usize {
        self.limiter.open_sessions()
    }

    /// Whether the transport under this pooled connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Runs `rendered` in a fresh session and waits for it to finish.
    ///
    /// `label` is the command as the caller wrote it, before any privilege
    /// escalation rewrite; it is what errors report. A zero exit returns the
    /// captured output. Any other outcome is a [`RemoteError::CommandFailed`]
    /// that carries the captured output. The session's slot is released on
    /// every path.
    pub async fn run(
        &self,
        rendered: &str,
        label: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, RemoteError> {
        let mut session = self.limiter.acquire(&self.connection).await?;
        let result = execute(session.channel(), rendered, label, stdin).await;
        self.limiter.release(session);
        result
    }

    /// Stops handing out sessions and disconnects the transport.
    pub async fn close(&self) -> Result<(), RemoteError> {
        self.limiter.close();
        if self.connection.is_closed() {
            return Ok(());
        }
        self.connection.disconnect().await
    }
}

async fn execute<T: ExecChannel>(
    channel: &mut T,
    rendered: &str,
    label: &str,
    stdin: Option<&str>,
) -> Result<CommandOutput, RemoteError> {
    if let Err(e) = channel.exec(rendered).await {
        channel.close().await;
        return Err(e);
    }

    // Stdin is always closed so commands that read it cannot hang.
    let input = stdin.unwrap_or_default();
    if let Err(e) = channel.send_stdin(input.as_bytes()).await {
        channel.close().await;
        return Err(e);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut outcome = ExitOutcome::Missing;

    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Stdout(data) => stdout.extend_from_slice(&data),
            ChannelEvent::Stderr(data) => stderr.extend_from_slice(&data),
            ChannelEvent::ExitStatus(code) => outcome = ExitOutcome::Code(code),
            ChannelEvent::ExitSignal(signal) => outcome = ExitOutcome::Signal(signal),
            ChannelEvent::Eof => trace!("Remote closed output for `{label}`"),
        }
    }

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    match outcome {
        ExitOutcome::Code(0) => Ok(CommandOutput { stdout, stderr }),
        outcome => Err(RemoteError::CommandFailed {
            command: label.to_string(),
            outcome,
            stdout,
            stderr,
        }),
    }
}
