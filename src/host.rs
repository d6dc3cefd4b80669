//! A registered target bound to the manager that pools its connection.

use std::fmt;

use crate::error::RemoteError;
use crate::session::{Command, CommandOutput, ConnectionManager, Dial, SshDialer, TargetHandle};

/// Runs commands on one target through a shared [`ConnectionManager`].
///
/// The `linux` operations take a `&RemoteHost`; cloning one is cheap and
/// every clone shares the target's pooled connection.
pub struct RemoteHost<D: Dial = SshDialer> {
    manager: ConnectionManager<D>,
    target: TargetHandle,
}

impl<D: Dial> Clone for RemoteHost<D> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            target: self.target.clone(),
        }
    }
}

impl<D: Dial> fmt::Debug for RemoteHost<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("target", &self.target)
            .finish()
    }
}

impl<D: Dial> RemoteHost<D> {
    pub fn new(manager: ConnectionManager<D>, target: TargetHandle) -> Self {
        Self { manager, target }
    }

    pub fn target(&self) -> &TargetHandle {
        &self.target
    }

    pub fn manager(&self) -> &ConnectionManager<D> {
        &self.manager
    }

    /// Dials the target if needed without running anything.
    pub async fn check(&self) -> Result<(), RemoteError> {
        self.manager.check(&self.target).await
    }

    pub async fn run(&self, command: &str, sudo: bool) -> Result<CommandOutput, RemoteError> {
        self.manager
            .execute(&self.target, &Command::new(command).sudo(sudo))
            .await
    }

    pub async fn run_with_stdin(
        &self,
        command: &str,
        stdin: &str,
        sudo: bool,
    ) -> Result<CommandOutput, RemoteError> {
        self.manager
            .execute(&self.target, &Command::new(command).sudo(sudo).stdin(stdin))
            .await
    }

    /// Runs `command` and returns its stdout; any failure is reported as a
    /// [`RemoteError::Operation`] naming the command.
    pub async fn run_checked(&self, command: &str, sudo: bool) -> Result<String, RemoteError> {
        self.run(command, sudo)
            .await
            .map(|output| output.stdout)
            .map_err(|e| e.while_running(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ConnectionDescriptor;
    use crate::session::testing::{FakeConnection, FakeDialer};

    fn host() -> (FakeDialer, RemoteHost<FakeDialer>) {
        let dialer = FakeDialer::new(FakeConnection::default());
        let manager = ConnectionManager::with_dialer(dialer.clone(), 5);
        let target = manager
            .register(ConnectionDescriptor::new("10.2.0.9", "ops").with_sudo(None))
            .expect("register");
        (dialer, manager.host(&target))
    }

    #[tokio::test]
    async fn run_checked_returns_stdout() {
        let (_, host) = host();
        assert_eq!(host.run_checked("echo up", false).await.expect("echo"), "up\n");
    }

    #[tokio::test]
    async fn run_checked_names_the_failed_command() {
        let (dialer, host) = host();
        let err = host.run_checked("false", true).await.expect_err("fails");

        assert_eq!(err.to_string(), "Command failed: false");
        assert!(err.is_exec_error());
        assert_eq!(dialer.connection.executed(), vec!["sudo false".to_string()]);
    }

    #[tokio::test]
    async fn clones_share_one_connection() {
        let (dialer, host) = host();
        let other = host.clone();

        host.check().await.expect("check");
        other
            .run_with_stdin("cat", "payload", false)
            .await
            .expect("cat");

        assert_eq!(dialer.dials(), 1);
        assert_eq!(dialer.connection.stdin_seen(), vec!["payload".to_string()]);
    }
}
