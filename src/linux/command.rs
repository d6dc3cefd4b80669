use super::*;

/// Whether `name` resolves to a command on the host.
///
/// Runs `command -v <name>`: a zero exit with output means present, a
/// non-zero exit means absent. Failures to reach the host are returned.
pub async fn command_exists<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<bool, RemoteError> {
    let command = format!("command -v {name}");
    match host.run(&command, sudo).await {
        Ok(output) => Ok(!output.stdout.trim().is_empty()),
        Err(e) if e.is_exec_error() => {
            debug!("{name} not found on {}", host.target().name());
            Ok(false)
        }
        Err(e) => Err(e.while_running(command)),
    }
}
