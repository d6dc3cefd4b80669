//! In-memory transport used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use super::*;
use crate::host::RemoteHost;

type Responder = dyn Fn(&str, &str) -> Vec<ChannelEvent> + Send + Sync;

struct FakeState {
    executed: Mutex<Vec<String>>,
    stdin: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    failing_opens: AtomicUsize,
    closed: AtomicBool,
    disconnects: AtomicUsize,
    exec_delay: Mutex<Duration>,
    responder: Box<Responder>,
}

/// Strips the sudo rewrite, leaving the command the shell finally runs.
fn escalated_command(command: &str) -> &str {
    if let Some((_, wrapped)) = command.split_once("sudo --prompt='' --stdin sh -c \"") {
        return wrapped.strip_suffix('"').unwrap_or(wrapped);
    }
    command.strip_prefix("sudo ").unwrap_or(command)
}

/// Default behaviour: `false` exits 1, `echo X` prints `X\n`, `cat` echoes
/// stdin, `kill` dies on a signal, `vanish` closes without a status, and
/// everything else exits 0. Escalated commands behave like their plain form.
fn default_responder(command: &str, stdin: &str) -> Vec<ChannelEvent> {
    let command = escalated_command(command);
    if command == "false" {
        return vec![ChannelEvent::Eof, ChannelEvent::ExitStatus(1)];
    }
    if let Some(text) = command.strip_prefix("echo ") {
        return vec![
            ChannelEvent::Stdout(format!("{text}\n").into_bytes()),
            ChannelEvent::Eof,
            ChannelEvent::ExitStatus(0),
        ];
    }
    match command {
        "cat" => vec![
            ChannelEvent::Stdout(stdin.as_bytes().to_vec()),
            ChannelEvent::ExitStatus(0),
            ChannelEvent::Eof,
        ],
        "kill" => vec![ChannelEvent::ExitSignal("KILL".to_string())],
        "vanish" => Vec::new(),
        _ => vec![ChannelEvent::ExitStatus(0)],
    }
}

#[derive(Clone)]
pub(crate) struct FakeConnection {
    state: Arc<FakeState>,
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self::with_responder(default_responder)
    }
}

impl FakeConnection {
    pub(crate) fn with_responder(
        responder: impl Fn(&str, &str) -> Vec<ChannelEvent> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(FakeState {
                executed: Mutex::new(Vec::new()),
                stdin: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                disconnects: AtomicUsize::new(0),
                exec_delay: Mutex::new(Duration::ZERO),
                responder: Box::new(responder),
            }),
        }
    }

    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Keeps every command running for `delay` before its first event.
    pub(crate) fn set_exec_delay(&self, delay: Duration) {
        *self.state.exec_delay.lock().expect("delay lock") = delay;
    }

    pub(crate) fn mark_closed(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.executed.lock().expect("executed lock").clone()
    }

    pub(crate) fn stdin_seen(&self) -> Vec<String> {
        self.state.stdin.lock().expect("stdin lock").clone()
    }

    /// Highest number of commands observed running at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }
}

impl RemoteConnection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> Result<FakeChannel, RemoteError> {
        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(RemoteError::InternalServerError(
                "channel open refused".to_string(),
            ));
        }
        Ok(FakeChannel {
            state: self.state.clone(),
            command: None,
            stdin: String::new(),
            events: None,
            running: false,
        })
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), RemoteError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    state: Arc<FakeState>,
    command: Option<String>,
    stdin: String,
    events: Option<VecDeque<ChannelEvent>>,
    running: bool,
}

impl FakeChannel {
    fn finish(&mut self) {
        if self.running {
            self.running = false;
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.finish();
    }
}

impl ExecChannel for FakeChannel {
    async fn exec(&mut self, command: &str) -> Result<(), RemoteError> {
        self.state
            .executed
            .lock()
            .expect("executed lock")
            .push(command.to_string());
        self.command = Some(command.to_string());
        let active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(active, Ordering::SeqCst);
        self.running = true;
        Ok(())
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<(), RemoteError> {
        self.stdin = String::from_utf8_lossy(data).into_owned();
        self.state
            .stdin
            .lock()
            .expect("stdin lock")
            .push(self.stdin.clone());
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.events.is_none() {
            let delay = *self.state.exec_delay.lock().expect("delay lock");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let command = self.command.clone().unwrap_or_default();
            self.events = Some((self.state.responder)(&command, &self.stdin).into());
        }
        let next = self.events.as_mut().and_then(VecDeque::pop_front);
        if next.is_none() {
            self.finish();
        }
        next
    }

    async fn close(&mut self) {
        self.finish();
    }
}

/// Dialer handing out clones of one [`FakeConnection`], counting dials.
#[derive(Clone)]
pub(crate) struct FakeDialer {
    pub(crate) connection: FakeConnection,
    dials: Arc<AtomicUsize>,
    delay: Duration,
    failure: Option<Arc<dyn Fn() -> RemoteError + Send + Sync>>,
}

impl FakeDialer {
    pub(crate) fn new(connection: FakeConnection) -> Self {
        Self {
            connection,
            dials: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every dial fails with an authentication error carrying `reason`.
    pub(crate) fn failing(mut self, reason: &str) -> Self {
        let reason = reason.to_string();
        self.failure = Some(Arc::new(move || {
            RemoteError::AuthenticationFailed(reason.clone())
        }));
        self
    }

    /// Every dial fails with the distinguished connect timeout.
    pub(crate) fn timing_out(mut self) -> Self {
        self.failure = Some(Arc::new(|| RemoteError::ConnectTimeout));
        self
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Dial for FakeDialer {
    type Connection = FakeConnection;

    async fn dial(&self, _target: &TargetHandle) -> Result<FakeConnection, RemoteError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(failure) => Err(failure()),
            None => Ok(self.connection.clone()),
        }
    }
}

/// Connection answering from `(command, exit status, stdout)` rows. Commands
/// missing from the table exit 127.
pub(crate) fn scripted(rows: &[(&str, u32, &str)]) -> FakeConnection {
    let rows: Vec<(String, u32, String)> = rows
        .iter()
        .map(|(command, status, stdout)| (command.to_string(), *status, stdout.to_string()))
        .collect();
    FakeConnection::with_responder(move |command, _| {
        match rows.iter().find(|(known, _, _)| known == command) {
            Some((_, status, stdout)) => {
                let mut events = Vec::new();
                if !stdout.is_empty() {
                    events.push(ChannelEvent::Stdout(stdout.clone().into_bytes()));
                }
                events.push(ChannelEvent::Eof);
                events.push(ChannelEvent::ExitStatus(*status));
                events
            }
            None => vec![
                ChannelEvent::Stderr(format!("sh: {command}: not found\n").into_bytes()),
                ChannelEvent::Eof,
                ChannelEvent::ExitStatus(127),
            ],
        }
    })
}

/// A host on a fresh manager whose target has passwordless sudo configured.
pub(crate) fn fake_host(connection: FakeConnection) -> (FakeDialer, RemoteHost<FakeDialer>) {
    let dialer = FakeDialer::new(connection);
    let manager = ConnectionManager::with_dialer(dialer.clone(), 5);
    let target = manager
        .register(ConnectionDescriptor::new("10.3.0.4", "admin").with_sudo(None))
        .expect("register");
    (dialer, manager.host(&target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalated_forms_run_the_wrapped_command() {
        assert_eq!(escalated_command("sudo false"), "false");
        assert_eq!(
            escalated_command("echo 's3cret' | sudo --prompt='' --stdin sh -c \"echo hi\""),
            "echo hi"
        );
        assert_eq!(escalated_command("echo hi"), "echo hi");
    }

    #[test]
    fn secret_is_not_echoed_back() {
        let events = default_responder(
            "echo 's3cret' | sudo --prompt='' --stdin sh -c \"whoami\"",
            "",
        );
        assert!(events.iter().all(|event| !matches!(event, ChannelEvent::Stdout(_))));
    }
}
