use super::*;

use std::fmt;
use std::str::FromStr;

use super::command::command_exists;

/// Service managers the crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceManager {
    Systemd,
}

/// Transition applied to a service by [`apply_service`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Started => "started",
            ServiceState::Stopped => "stopped",
            ServiceState::Restarted => "restarted",
            ServiceState::Reloaded => "reloaded",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ServiceState::Started),
            "stopped" => Ok(ServiceState::Stopped),
            "restarted" => Ok(ServiceState::Restarted),
            "reloaded" => Ok(ServiceState::Reloaded),
            other => Err(RemoteError::InvalidArgument(format!(
                "Service state {other} not supported"
            ))),
        }
    }
}

/// Finds the host's service manager. Only systemd is recognised.
pub async fn detect_service_manager<D: Dial>(
    host: &RemoteHost<D>,
) -> Result<ServiceManager, RemoteError> {
    if command_exists(host, "systemctl", false).await? {
        return Ok(ServiceManager::Systemd);
    }
    Err(RemoteError::NoServiceManager)
}

async fn systemctl<D: Dial>(
    host: &RemoteHost<D>,
    verb: &str,
    name: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("systemctl {verb} {name}"), sudo)
        .await?;
    Ok(())
}

pub async fn start<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "start", name, sudo).await
}

pub async fn stop<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "stop", name, sudo).await
}

pub async fn restart<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "restart", name, sudo).await
}

pub async fn reload<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "reload", name, sudo).await
}

pub async fn enable<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "enable", name, sudo).await
}

pub async fn disable<D: Dial>(host: &RemoteHost<D>, name: &str, sudo: bool) -> Result<(), RemoteError> {
    systemctl(host, "disable", name, sudo).await
}

pub async fn daemon_reload<D: Dial>(host: &RemoteHost<D>, sudo: bool) -> Result<(), RemoteError> {
    host.run_checked("systemctl daemon-reload", sudo).await?;
    Ok(())
}

/// Output of `systemctl status`.
///
/// Inactive units make systemctl exit 3; their status text is still returned.
pub async fn status<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<String, RemoteError> {
    let command = format!("systemctl status {name}");
    match host.run(&command, sudo).await {
        Ok(output) => Ok(output.stdout),
        Err(e) if e.exit_status() == Some(3) => Ok(e
            .captured_output()
            .map(|(stdout, _)| stdout.to_string())
            .unwrap_or_default()),
        Err(e) => Err(e.while_running(command)),
    }
}

pub async fn is_enabled<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<bool, RemoteError> {
    query(host, "is-enabled", name, "enabled", sudo).await
}

pub async fn is_running<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<bool, RemoteError> {
    query(host, "is-active", name, "active", sudo).await
}

/// Runs a systemctl query; a non-zero exit is a negative answer.
async fn query<D: Dial>(
    host: &RemoteHost<D>,
    verb: &str,
    name: &str,
    expected: &str,
    sudo: bool,
) -> Result<bool, RemoteError> {
    let command = format!("systemctl {verb} {name}");
    match host.run(&command, sudo).await {
        Ok(output) => Ok(output.stdout.trim() == expected),
        Err(e) if e.is_exec_error() => Ok(false),
        Err(e) => Err(e.while_running(command)),
    }
}

/// Enables or disables `name`, then applies `state`.
pub async fn apply_service<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    enabled: bool,
    state: ServiceState,
    sudo: bool,
) -> Result<(), RemoteError> {
    let manager = detect_service_manager(host).await?;
    debug!(
        "Applying {name} via {manager:?}: enabled={enabled}, state={state} on {}",
        host.target().name()
    );

    if enabled {
        enable(host, name, sudo).await?;
    } else {
        disable(host, name, sudo).await?;
    }

    match state {
        ServiceState::Started => start(host, name, sudo).await,
        ServiceState::Stopped => stop(host, name, sudo).await,
        ServiceState::Restarted => restart(host, name, sudo).await,
        ServiceState::Reloaded => reload(host, name, sudo).await,
    }
}
