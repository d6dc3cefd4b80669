use super::*;

use std::fmt;
use std::sync::atomic::AtomicBool;

use crate::host::RemoteHost;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

struct Target {
    id: u64,
    descriptor: ConnectionDescriptor,
    security: ConnectionSecurityOptions,
}

/// A registered target.
///
/// Clones of a handle refer to the same pooled connection. Registering a
/// structurally equal descriptor again yields a different handle with its own
/// connection.
#[derive(Clone)]
pub struct TargetHandle(Arc<Target>);

impl TargetHandle {
    pub(crate) fn new(descriptor: ConnectionDescriptor, security: ConnectionSecurityOptions) -> Self {
        Self(Arc::new(Target {
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            descriptor,
            security,
        }))
    }

    /// Process-unique id of this registration.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.0.descriptor
    }

    pub fn security(&self) -> &ConnectionSecurityOptions {
        &self.0.security
    }

    /// `user@host:port`.
    pub fn name(&self) -> String {
        self.0.descriptor.display_name()
    }
}

impl PartialEq for TargetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TargetHandle {}

impl fmt::Debug for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetHandle")
            .field("id", &self.0.id)
            .field("target", &self.name())
            .finish()
    }
}

type SlotOutcome<C> = Result<Arc<PooledConnection<C>>, Arc<RemoteError>>;

/// Resolves once to a connection or to the error that prevented it.
struct ConnectionSlot<C: RemoteConnection> {
    cell: OnceCell<SlotOutcome<C>>,
}

/// Registry of pooled connections, one per registered target.
///
/// The first caller for a target dials it; concurrent callers for the same
/// target wait for that single dial and share its outcome, including a
/// failure, until the target is [forgotten](ConnectionManager::forget).
/// Cloning a manager shares its registry.
pub struct ConnectionManager<D: Dial = SshDialer> {
    dialer: Arc<D>,
    cache: Cache<u64, Arc<ConnectionSlot<D::Connection>>>,
    session_limit: usize,
    recorder: Option<SessionRecorder>,
    closed: Arc<AtomicBool>,
}

impl<D: Dial> Clone for ConnectionManager<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            cache: self.cache.clone(),
            session_limit: self.session_limit,
            recorder: self.recorder.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl ConnectionManager<SshDialer> {
    /// Creates a manager with default limits and dial policy.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        Self::with_dialer(
            SshDialer::new(config.dial_policy()),
            config.effective_session_limit(),
        )
    }

    /// Creates a manager configured from `TF_LINUX_*` environment variables.
    pub fn from_env() -> Result<Self, RemoteError> {
        Ok(Self::with_config(ManagerConfig::from_env()?))
    }
}

impl Default for ConnectionManager<SshDialer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dial> ConnectionManager<D> {
    /// Creates a manager that dials through `dialer`.
    pub fn with_dialer(dialer: D, session_limit: usize) -> Self {
        // Entries live until forgotten or shut down.
        let cache = Cache::builder().build();

        Self {
            dialer: Arc::new(dialer),
            cache,
            session_limit: session_limit.max(1),
            recorder: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records connection and command events into `recorder`.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn recorder(&self) -> Option<&SessionRecorder> {
        self.recorder.as_ref()
    }

    pub fn session_limit(&self) -> usize {
        self.session_limit
    }

    /// Registers a target with the default security options.
    pub fn register(&self, descriptor: ConnectionDescriptor) -> Result<TargetHandle, RemoteError> {
        self.register_with_security(descriptor, ConnectionSecurityOptions::default())
    }

    pub fn register_with_security(
        &self,
        descriptor: ConnectionDescriptor,
        security: ConnectionSecurityOptions,
    ) -> Result<TargetHandle, RemoteError> {
        descriptor.validate()?;
        let target = TargetHandle::new(descriptor, security);
        debug!("Registered {} as target {}", target.name(), target.id());
        Ok(target)
    }

    /// A [`RemoteHost`] bound to `target`, for the `linux` operations.
    pub fn host(&self, target: &TargetHandle) -> RemoteHost<D> {
        RemoteHost::new(self.clone(), target.clone())
    }

    /// Returns the target's pooled connection, dialing it on first use.
    pub async fn resolve(
        &self,
        target: &TargetHandle,
    ) -> Result<Arc<PooledConnection<D::Connection>>, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectClosedError);
        }

        let entry = self
            .cache
            .entry(target.id())
            .or_insert_with(async {
                Arc::new(ConnectionSlot {
                    cell: OnceCell::new(),
                })
            })
            .await;
        if entry.is_fresh() {
            debug!("Cache miss, creating connection slot for {}", target.name());
        } else {
            trace!("Cache hit: {}", target.name());
        }
        let slot = entry.into_value();

        let outcome = slot.cell.get_or_init(|| self.connect(target)).await;
        match outcome {
            Ok(pooled) => {
                if pooled.is_closed() {
                    warn!(
                        "Connection to {} is closed; it is not re-dialed until the target is forgotten",
                        target.name()
                    );
                }
                Ok(pooled.clone())
            }
            Err(source) => Err(RemoteError::Unavailable {
                target: target.name(),
                source: source.clone(),
            }),
        }
    }

    async fn connect(&self, target: &TargetHandle) -> SlotOutcome<D::Connection> {
        debug!("Dialing {}...", target.name());
        match self.dialer.dial(target).await {
            Ok(connection) => {
                debug!("Connection to {} established", target.name());
                if let Some(recorder) = self.recorder.as_ref() {
                    let _ = recorder.record_event(SessionEvent::ConnectionEstablished {
                        target: target.name(),
                    });
                }
                Ok(Arc::new(PooledConnection::new(connection, self.session_limit)))
            }
            Err(e) => {
                debug!("Connection to {} failed: {}", target.name(), e);
                if let Some(recorder) = self.recorder.as_ref() {
                    let _ = recorder.record_event(SessionEvent::ConnectionFailed {
                        target: target.name(),
                        reason: e.to_string(),
                    });
                }
                Err(Arc::new(e))
            }
        }
    }

    /// Resolves the target without running anything.
    pub async fn check(&self, target: &TargetHandle) -> Result<(), RemoteError> {
        self.resolve(target).await.map(|_| ())
    }

    /// Sessions open on the target's connection, if it has been established.
    pub async fn open_sessions(&self, target: &TargetHandle) -> Option<usize> {
        let slot = self.cache.get(&target.id()).await?;
        match slot.cell.get() {
            Some(Ok(pooled)) => Some(pooled.open_sessions()),
            _ => None,
        }
    }

    /// Runs `command` on `target` and returns its captured output.
    pub async fn execute(
        &self,
        target: &TargetHandle,
        command: &Command,
    ) -> Result<CommandOutput, RemoteError> {
        let pooled = self.resolve(target).await?;
        let rendered = command.render(target.descriptor());

        debug!(
            "Run command: {}{}",
            command.command,
            if command.sudo { " (sudo)" } else { "" }
        );
        let result = pooled
            .run(&rendered, &command.command, command.stdin.as_deref())
            .await;
        self.record_command(target, command, &result);
        result
    }

    /// Runs `command`, optionally escalated, with optional standard input.
    pub async fn run(
        &self,
        target: &TargetHandle,
        escalate: bool,
        command: &str,
        stdin: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let mut command = Command::new(command).sudo(escalate);
        if !stdin.is_empty() {
            command = command.stdin(stdin);
        }
        self.execute(target, &command).await
    }

    fn record_command(
        &self,
        target: &TargetHandle,
        command: &Command,
        result: &Result<CommandOutput, RemoteError>,
    ) {
        let Some(recorder) = self.recorder.as_ref() else {
            return;
        };
        let (outcome, stdout, stderr) = match result {
            Ok(output) => (
                ExitOutcome::Code(0),
                output.stdout.clone(),
                output.stderr.clone(),
            ),
            Err(RemoteError::CommandFailed {
                outcome,
                stdout,
                stderr,
                ..
            }) => (outcome.clone(), stdout.clone(), stderr.clone()),
            Err(_) => return,
        };
        let _ = recorder.record_command(target.name(), command, outcome, stdout, stderr);
    }

    /// Evicts the target's entry and disconnects its connection, if any.
    ///
    /// The next use of the target dials again.
    pub async fn forget(&self, target: &TargetHandle) {
        if let Some(slot) = self.cache.remove(&target.id()).await {
            debug!("Forgetting {}", target.name());
            self.safely_disconnect(&target.name(), &slot).await;
        }
    }

    /// Closes every pooled connection and refuses further use.
    ///
    /// Commands waiting for a session fail with
    /// [`RemoteError::ConnectClosedError`]; commands already running finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<_> = self.cache.iter().collect();
        debug!("Shutting down {} pooled connection(s)", slots.len());

        for (id, slot) in slots {
            self.safely_disconnect(&format!("target {id}"), &slot).await;
        }
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    async fn safely_disconnect(&self, name: &str, slot: &ConnectionSlot<D::Connection>) {
        let Some(Ok(pooled)) = slot.cell.get() else {
            return;
        };
        match pooled.close().await {
            Ok(()) => debug!("Connection {} safely closed", name),
            // The connection is dropped either way.
            Err(e) => debug!("Error closing connection {}: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FakeConnection, FakeDialer};
    use tokio::time::sleep;

    fn manager(dialer: &FakeDialer) -> ConnectionManager<FakeDialer> {
        ConnectionManager::with_dialer(dialer.clone(), 5)
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new("10.1.0.7", "deploy").with_password("pw")
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_dial() {
        let dialer = FakeDialer::new(FakeConnection::default()).with_delay(Duration::from_secs(3));
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move { manager.resolve(&target).await }));
        }

        let mut pooled = Vec::new();
        for task in tasks {
            pooled.push(task.await.expect("join").expect("resolve"));
        }

        assert_eq!(dialer.dials(), 1);
        assert!(pooled.iter().all(|p| Arc::ptr_eq(p, &pooled[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_failure_is_shared_and_cached() {
        let dialer = FakeDialer::new(FakeConnection::default())
            .with_delay(Duration::from_secs(1))
            .failing("deploy@10.1.0.7:22");
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                manager.check(&target).await.expect_err("dial fails")
            }));
        }
        let mut errors = Vec::new();
        for task in tasks {
            errors.push(task.await.expect("join"));
        }

        let first = errors[0].dial_failure().expect("cached failure");
        assert!(matches!(first, RemoteError::AuthenticationFailed(_)));
        assert!(
            errors
                .iter()
                .all(|e| std::ptr::eq(e.dial_failure().expect("cached failure"), first))
        );

        let later = manager.run(&target, false, "true", "").await;
        assert!(matches!(later, Err(RemoteError::Unavailable { .. })));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn equal_descriptors_registered_twice_get_separate_connections() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let first = manager.register(descriptor()).expect("register first");
        let second = manager.register(descriptor()).expect("register second");
        assert_ne!(first, second);

        manager.check(&first).await.expect("first");
        manager.check(&first.clone()).await.expect("first clone");
        manager.check(&second).await.expect("second");

        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn register_rejects_invalid_descriptor() {
        let manager = manager(&FakeDialer::new(FakeConnection::default()));
        assert!(matches!(
            manager.register(ConnectionDescriptor::new("", "root")),
            Err(RemoteError::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn sudo_commands_are_rewritten_before_execution() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let plain = manager
            .register(descriptor().with_sudo(None))
            .expect("register plain");
        let secret = manager
            .register(descriptor().with_sudo(Some("s3cret".to_string())))
            .expect("register secret");

        manager.run(&plain, true, "whoami", "").await.expect("plain sudo");
        manager.run(&secret, true, "whoami", "").await.expect("secret sudo");
        manager.run(&plain, false, "whoami", "").await.expect("no sudo");

        assert_eq!(
            dialer.connection.executed(),
            vec![
                "sudo whoami".to_string(),
                "echo 's3cret' | sudo --prompt='' --stdin sh -c \"whoami\"".to_string(),
                "whoami".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failing_commands_do_not_poison_the_connection() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        let err = manager
            .run(&target, false, "false", "")
            .await
            .expect_err("false fails");
        assert!(err.is_exec_error());
        assert_eq!(err.captured_output(), Some(("", "")));

        let output = manager.run(&target, false, "true", "").await.expect("true");
        assert_eq!(output, CommandOutput::default());
        assert_eq!(dialer.dials(), 1);
        assert_eq!(manager.open_sessions(&target).await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_released_after_mixed_outcomes() {
        let connection = FakeConnection::default();
        connection.set_exec_delay(Duration::from_millis(50));
        let dialer = FakeDialer::new(connection.clone());
        let manager = ConnectionManager::with_dialer(dialer, 2);
        let target = manager.register(descriptor()).expect("register");

        let mut tasks = Vec::new();
        for command in ["true", "false", "kill", "echo hi", "vanish", "false", "true"] {
            let manager = manager.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                manager.run(&target, false, command, "").await
            }));
        }
        for task in tasks {
            let _ = task.await.expect("join");
        }

        assert_eq!(connection.peak_concurrency(), 2);
        assert_eq!(manager.open_sessions(&target).await, Some(0));
    }

    #[tokio::test]
    async fn closed_transport_is_not_redialed() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        manager.check(&target).await.expect("first resolve");
        dialer.connection.mark_closed();
        let pooled = manager.resolve(&target).await.expect("cached resolve");

        assert!(pooled.is_closed());
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn forget_disconnects_and_allows_a_fresh_dial() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        manager.check(&target).await.expect("resolve");
        manager.forget(&target).await;
        assert_eq!(dialer.connection.disconnects(), 1);
        assert_eq!(manager.open_sessions(&target).await, None);

        manager.check(&target).await.expect("re-resolve");
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn forget_clears_a_cached_failure() {
        let dialer = FakeDialer::new(FakeConnection::default()).failing("nope");
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        assert!(manager.check(&target).await.is_err());
        manager.forget(&target).await;
        assert!(manager.check(&target).await.is_err());
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_waiters_and_closes_connections() {
        let connection = FakeConnection::default();
        connection.set_exec_delay(Duration::from_secs(5));
        let dialer = FakeDialer::new(connection.clone());
        let manager = ConnectionManager::with_dialer(dialer, 1);
        let target = manager.register(descriptor()).expect("register");
        manager.check(&target).await.expect("resolve");

        let running = {
            let manager = manager.clone();
            let target = target.clone();
            tokio::spawn(async move { manager.run(&target, false, "true", "").await })
        };
        let waiting = {
            let manager = manager.clone();
            let target = target.clone();
            tokio::spawn(async move { manager.run(&target, false, "true", "").await })
        };
        sleep(Duration::from_millis(100)).await;

        manager.shutdown().await;

        assert!(running.await.expect("join").is_ok());
        assert!(matches!(
            waiting.await.expect("join"),
            Err(RemoteError::ConnectClosedError)
        ));
        assert_eq!(connection.disconnects(), 1);
        assert!(matches!(
            manager.check(&target).await,
            Err(RemoteError::ConnectClosedError)
        ));
    }

    #[tokio::test]
    async fn cached_connect_timeout_is_recognisable_by_callers() {
        let dialer = FakeDialer::new(FakeConnection::default()).timing_out();
        let manager = manager(&dialer);
        let target = manager.register(descriptor()).expect("register");

        let first = manager.run(&target, false, "uptime", "").await.expect_err("timed out");
        let second = manager.run(&target, false, "uptime", "").await.expect_err("cached");

        assert!(matches!(first, RemoteError::Unavailable { .. }));
        assert!(first.is_connect_timeout());
        assert!(second.is_connect_timeout());
        assert!(!first.is_retryable());
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn escalated_failures_surface_their_exit_status() {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer);
        let target = manager
            .register(descriptor().with_sudo(Some("s3cret".to_string())))
            .expect("register");

        let err = manager.run(&target, true, "false", "").await.expect_err("false fails");
        assert_eq!(err.exit_status(), Some(1));
        assert!(!err.to_string().contains("s3cret"));
    }

    #[tokio::test]
    async fn recorder_captures_connection_and_commands() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = manager(&dialer).with_recorder(recorder.clone());
        let target = manager
            .register(descriptor().with_sudo(Some("s3cret".to_string())))
            .expect("register");

        manager.run(&target, true, "whoami", "").await.ok();
        manager.run(&target, false, "false", "").await.ok();

        let jsonl = recorder.to_jsonl().expect("jsonl");
        assert!(!jsonl.contains("s3cret"));

        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 3);
        assert!(matches!(
            entries[0].event,
            SessionEvent::ConnectionEstablished { .. }
        ));
        assert!(matches!(
            &entries[2].event,
            SessionEvent::CommandOutput { command, success: false, .. } if command == "false"
        ));
    }
}
