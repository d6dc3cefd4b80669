use super::*;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Owner, group and permission bits of a remote path, as reported by `ls -ld`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileDetails {
    pub owner: String,
    pub group: String,
    /// Permission bits, including setuid, setgid and sticky (e.g. `0o644`).
    pub mode: u32,
}

/// Desired state of a regular file, applied by [`ensure_file`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileSpec {
    pub path: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub content: Option<String>,
}

impl FileSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Desired state of a directory, applied by [`ensure_directory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DirectorySpec {
    pub path: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
}

impl DirectorySpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

pub fn validate_absolute_path(path: &str) -> Result<(), RemoteError> {
    if !path.starts_with('/') {
        return Err(RemoteError::InvalidArgument(format!(
            "path should be an absolute path: {path}"
        )));
    }
    Ok(())
}

pub async fn create_file<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("touch {path}"), sudo).await?;
    Ok(())
}

pub async fn create_directory<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("mkdir -p {path}"), sudo).await?;
    Ok(())
}

/// Changes owner, group, or both. Does nothing when neither is given.
pub async fn change_owner<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    owner: Option<&str>,
    group: Option<&str>,
    sudo: bool,
) -> Result<(), RemoteError> {
    let command = match (non_empty(owner), non_empty(group)) {
        (None, None) => return Ok(()),
        (Some(owner), None) => format!("chown {owner} {path}"),
        (None, Some(group)) => format!("chgrp {group} {path}"),
        (Some(owner), Some(group)) => format!("chown {owner}:{group} {path}"),
    };
    host.run_checked(&command, sudo).await?;
    Ok(())
}

pub async fn change_group<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    group: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    if group.is_empty() {
        return Err(RemoteError::InvalidArgument("Group not specified".to_string()));
    }
    host.run_checked(&format!("chgrp {group} {path}"), sudo).await?;
    Ok(())
}

/// Sets the permission bits of `path`; `mode` is numeric, e.g. `0o640`.
pub async fn change_mode<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    mode: u32,
    sudo: bool,
) -> Result<(), RemoteError> {
    if mode > 0o7777 {
        return Err(RemoteError::InvalidArgument(format!(
            "mode {mode:o} is not a valid permission mode"
        )));
    }
    host.run_checked(&format!("chmod {mode:o} {path}"), sudo).await?;
    Ok(())
}

/// Replaces the file's content. The content travels base64 encoded so any
/// bytes survive the shell.
pub async fn write_content<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    content: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    let encoded = STANDARD.encode(content.as_bytes());
    host.run_checked(&format!("echo '{encoded}' | base64 -d > {path}"), sudo)
        .await?;
    Ok(())
}

pub async fn read_file<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    sudo: bool,
) -> Result<String, RemoteError> {
    host.run_checked(&format!("cat {path}"), sudo).await
}

/// Owner, group and mode of `path`.
///
/// A path that does not exist is [`RemoteError::NotFound`].
pub async fn get_details<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    sudo: bool,
) -> Result<FileDetails, RemoteError> {
    let command = format!("ls -ld {path}");
    let stdout = match host.run(&command, sudo).await {
        Ok(output) => output.stdout,
        Err(e) if is_missing_path(&e) => {
            return Err(RemoteError::NotFound(format!("File not found with path {path}")));
        }
        Err(e) => return Err(e.while_running(command)),
    };
    if stdout.trim().is_empty() {
        return Err(RemoteError::NotFound(format!("File not found with path {path}")));
    }

    let fields: Vec<&str> = stdout.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(RemoteError::UnexpectedOutput {
            command,
            reason: format!("expected at least 4 fields, got {}", fields.len()),
        });
    }
    let mode = parse_mode(fields[0]).ok_or_else(|| RemoteError::UnexpectedOutput {
        command: command.clone(),
        reason: format!("unable to parse permission string {}", fields[0]),
    })?;

    Ok(FileDetails {
        owner: fields[2].to_string(),
        group: fields[3].to_string(),
        mode,
    })
}

fn is_missing_path(err: &RemoteError) -> bool {
    err.captured_output()
        .is_some_and(|(_, stderr)| stderr.contains("No such file or directory"))
}

/// Parses an `ls -l` permission string such as `-rwxr-x---` or `drwsr-sr-t`.
fn parse_mode(perms: &str) -> Option<u32> {
    let bits = perms.as_bytes().get(1..10)?;
    let mut mode = 0;
    let mut special = 0;

    for (idx, triplet) in bits.chunks(3).enumerate() {
        let special_bit = 0o4000 >> idx;
        let mut value = 0;
        match triplet[0] {
            b'r' => value |= 4,
            b'-' => {}
            _ => return None,
        }
        match triplet[1] {
            b'w' => value |= 2,
            b'-' => {}
            _ => return None,
        }
        match triplet[2] {
            b'x' => value |= 1,
            b's' | b't' => {
                value |= 1;
                special |= special_bit;
            }
            b'S' | b'T' => special |= special_bit,
            b'-' => {}
            _ => return None,
        }
        mode = (mode << 3) | value;
    }

    Some(special | mode)
}

/// Moves a file or directory.
pub async fn move_path<D: Dial>(
    host: &RemoteHost<D>,
    from: &str,
    to: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("mv {from} {to}"), sudo).await?;
    Ok(())
}

/// Removes a file or directory recursively.
pub async fn remove<D: Dial>(
    host: &RemoteHost<D>,
    path: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("rm -rf {path}"), sudo).await?;
    Ok(())
}

/// Creates the file and applies `spec`, removing it again if any step fails.
///
/// Returns the resulting details. On failure the error of the failed step is
/// returned, whether or not the removal succeeded.
pub async fn ensure_file<D: Dial>(
    host: &RemoteHost<D>,
    spec: &FileSpec,
    sudo: bool,
) -> Result<FileDetails, RemoteError> {
    validate_absolute_path(&spec.path)?;
    create_file(host, &spec.path, sudo).await?;

    let applied = async {
        change_owner(
            host,
            &spec.path,
            spec.owner.as_deref(),
            spec.group.as_deref(),
            sudo,
        )
        .await?;
        if let Some(mode) = spec.mode.filter(|m| *m != 0) {
            change_mode(host, &spec.path, mode, sudo).await?;
        }
        if let Some(content) = non_empty(spec.content.as_deref()) {
            write_content(host, &spec.path, content, sudo).await?;
        }
        Ok::<(), RemoteError>(())
    }
    .await;

    if let Err(e) = applied {
        roll_back(host, &spec.path, sudo, &e).await;
        return Err(e);
    }
    get_details(host, &spec.path, sudo).await
}

/// Creates the directory and applies `spec`, removing it again if any step
/// fails.
pub async fn ensure_directory<D: Dial>(
    host: &RemoteHost<D>,
    spec: &DirectorySpec,
    sudo: bool,
) -> Result<FileDetails, RemoteError> {
    validate_absolute_path(&spec.path)?;
    create_directory(host, &spec.path, sudo).await?;

    let applied = async {
        change_owner(
            host,
            &spec.path,
            spec.owner.as_deref(),
            spec.group.as_deref(),
            sudo,
        )
        .await?;
        if let Some(mode) = spec.mode.filter(|m| *m != 0) {
            change_mode(host, &spec.path, mode, sudo).await?;
        }
        Ok::<(), RemoteError>(())
    }
    .await;

    if let Err(e) = applied {
        roll_back(host, &spec.path, sudo, &e).await;
        return Err(e);
    }
    get_details(host, &spec.path, sudo).await
}

async fn roll_back<D: Dial>(host: &RemoteHost<D>, path: &str, sudo: bool, cause: &RemoteError) {
    debug!("Rolling back creation of {path}: {cause}");
    if let Err(e) = remove(host, path, sudo).await {
        warn!("Unable to roll back creation of {path}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{fake_host, scripted};

    #[test]
    fn permission_strings_parse_to_octal() {
        assert_eq!(parse_mode("-rw-r--r--"), Some(0o644));
        assert_eq!(parse_mode("drwxr-x---"), Some(0o750));
        assert_eq!(parse_mode("-rwsr-xr-x"), Some(0o4755));
        assert_eq!(parse_mode("drwxrwxrwt"), Some(0o1777));
        assert_eq!(parse_mode("-rw-r-Sr--"), Some(0o2644));
        assert_eq!(parse_mode("-rw-r--r--."), Some(0o644));
        assert_eq!(parse_mode("total"), None);
        assert_eq!(parse_mode("-rwzr--r--"), None);
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(validate_absolute_path("/etc/motd").is_ok());
        assert!(matches!(
            validate_absolute_path("etc/motd"),
            Err(RemoteError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn change_owner_picks_the_right_command() {
        let (dialer, host) = fake_host(scripted(&[
            ("chown app /srv/a", 0, ""),
            ("chgrp web /srv/a", 0, ""),
            ("chown app:web /srv/a", 0, ""),
        ]));

        change_owner(&host, "/srv/a", None, None, false).await.expect("noop");
        change_owner(&host, "/srv/a", Some("app"), Some(""), false).await.expect("owner");
        change_owner(&host, "/srv/a", None, Some("web"), false).await.expect("group");
        change_owner(&host, "/srv/a", Some("app"), Some("web"), false).await.expect("both");

        assert_eq!(
            dialer.connection.executed(),
            vec![
                "chown app /srv/a".to_string(),
                "chgrp web /srv/a".to_string(),
                "chown app:web /srv/a".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn change_group_requires_a_group() {
        let (dialer, host) = fake_host(scripted(&[]));
        let err = change_group(&host, "/srv/a", "", false).await.expect_err("empty group");

        assert_eq!(err.to_string(), "invalid argument: Group not specified");
        assert!(dialer.connection.executed().is_empty());
    }

    #[tokio::test]
    async fn mode_is_sent_in_octal() {
        let (dialer, host) = fake_host(scripted(&[("sudo chmod 640 /etc/app.conf", 0, "")]));
        change_mode(&host, "/etc/app.conf", 0o640, true).await.expect("chmod");
        assert_eq!(
            dialer.connection.executed(),
            vec!["sudo chmod 640 /etc/app.conf".to_string()]
        );

        assert!(matches!(
            change_mode(&host, "/etc/app.conf", 0o17777, true).await,
            Err(RemoteError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn content_is_written_base64_encoded() {
        let (dialer, host) = fake_host(scripted(&[(
            "echo 'aGVsbG8nIHdvcmxkCg==' | base64 -d > /tmp/greeting",
            0,
            "",
        )]));

        write_content(&host, "/tmp/greeting", "hello' world\n", false)
            .await
            .expect("write");
        assert_eq!(dialer.connection.executed().len(), 1);
    }

    #[tokio::test]
    async fn details_are_parsed_from_ls() {
        let (_, host) = fake_host(scripted(&[(
            "ls -ld /var/www",
            0,
            "drwxr-x--- 2 www-data adm 4096 Jan  2 10:00 /var/www\n",
        )]));

        let details = get_details(&host, "/var/www", false).await.expect("details");
        assert_eq!(
            details,
            FileDetails {
                owner: "www-data".to_string(),
                group: "adm".to_string(),
                mode: 0o750,
            }
        );
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let connection = crate::session::testing::FakeConnection::with_responder(|_, _| {
            vec![
                crate::session::ChannelEvent::Stderr(
                    b"ls: cannot access '/nope': No such file or directory\n".to_vec(),
                ),
                crate::session::ChannelEvent::ExitStatus(2),
            ]
        });
        let (_, host) = fake_host(connection);

        let err = get_details(&host, "/nope", false).await.expect_err("missing");
        assert!(matches!(err, RemoteError::NotFound(ref msg) if msg.contains("/nope")));
    }

    #[tokio::test]
    async fn garbled_listing_is_unexpected_output() {
        let (_, host) = fake_host(scripted(&[("ls -ld /x", 0, "garbage\n")]));
        assert!(matches!(
            get_details(&host, "/x", false).await,
            Err(RemoteError::UnexpectedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn ensure_file_applies_every_attribute() {
        let (dialer, host) = fake_host(scripted(&[
            ("touch /etc/motd", 0, ""),
            ("chown root:root /etc/motd", 0, ""),
            ("chmod 644 /etc/motd", 0, ""),
            ("echo 'aGk=' | base64 -d > /etc/motd", 0, ""),
            (
                "ls -ld /etc/motd",
                0,
                "-rw-r--r-- 1 root root 2 Jan  2 10:00 /etc/motd\n",
            ),
        ]));

        let spec = FileSpec::new("/etc/motd")
            .owner("root")
            .group("root")
            .mode(0o644)
            .content("hi");
        let details = ensure_file(&host, &spec, false).await.expect("ensure");

        assert_eq!(details.mode, 0o644);
        assert_eq!(dialer.connection.executed().len(), 5);
    }

    #[tokio::test]
    async fn failed_step_rolls_back_the_file() {
        let (dialer, host) = fake_host(scripted(&[
            ("touch /srv/app.env", 0, ""),
            ("chown nobody-here /srv/app.env", 1, ""),
            ("rm -rf /srv/app.env", 0, ""),
        ]));

        let spec = FileSpec::new("/srv/app.env").owner("nobody-here").mode(0o600);
        let err = ensure_file(&host, &spec, false).await.expect_err("chown fails");

        assert_eq!(err.to_string(), "Command failed: chown nobody-here /srv/app.env");
        assert_eq!(
            dialer.connection.executed(),
            vec![
                "touch /srv/app.env".to_string(),
                "chown nobody-here /srv/app.env".to_string(),
                "rm -rf /srv/app.env".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_rollback_keeps_the_original_error() {
        let (_, host) = fake_host(scripted(&[
            ("mkdir -p /data", 0, ""),
            ("chmod 755 /data", 1, ""),
            ("rm -rf /data", 1, ""),
        ]));

        let err = ensure_directory(&host, &DirectorySpec::new("/data").mode(0o755), false)
            .await
            .expect_err("chmod fails");
        assert_eq!(err.to_string(), "Command failed: chmod 755 /data");
    }

    #[tokio::test]
    async fn relative_spec_path_runs_nothing() {
        let (dialer, host) = fake_host(scripted(&[]));
        assert!(ensure_directory(&host, &DirectorySpec::new("data"), false).await.is_err());
        assert!(dialer.connection.executed().is_empty());
    }
}
