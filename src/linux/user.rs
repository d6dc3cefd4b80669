use super::*;

/// A local user account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    /// Primary group id. When set on creation, a group of the same name is
    /// created with this id first.
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// A local group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub system: bool,
}

pub async fn create_group<D: Dial>(
    host: &RemoteHost<D>,
    group: &Group,
    sudo: bool,
) -> Result<(), RemoteError> {
    let mut command = String::from("/usr/sbin/groupadd");
    if let Some(gid) = group.gid.filter(|g| *g > 0) {
        command.push_str(&format!(" --gid {gid}"));
    }
    if group.system {
        command.push_str(" --system");
    }
    command.push_str(&format!(" {}", group.name));

    host.run_checked(&command, sudo).await?;
    Ok(())
}

pub async fn create_user<D: Dial>(
    host: &RemoteHost<D>,
    user: &User,
    sudo: bool,
) -> Result<(), RemoteError> {
    let mut command = String::from("/usr/sbin/useradd");
    if let Some(uid) = user.uid.filter(|u| *u > 0) {
        command.push_str(&format!(" --uid {uid}"));
    }
    if let Some(gid) = user.gid.filter(|g| *g > 0) {
        // useradd refuses a gid that does not exist yet.
        let group = Group {
            name: user.name.clone(),
            gid: Some(gid),
            system: user.system,
        };
        create_group(host, &group, sudo).await?;
        command.push_str(&format!(" --gid {gid}"));
    }
    if user.system {
        command.push_str(" --system");
    }
    if let Some(home) = non_empty(user.home.as_deref()) {
        command.push_str(&format!(" --home {home}"));
    }
    if let Some(shell) = non_empty(user.shell.as_deref()) {
        command.push_str(&format!(" --shell {shell}"));
    }
    command.push_str(&format!(" {}", user.name));

    host.run_checked(&command, sudo).await?;
    Ok(())
}

/// Deletes `name`, and its home directory and mail spool with `remove_home`.
pub async fn delete_user<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    remove_home: bool,
    sudo: bool,
) -> Result<(), RemoteError> {
    let mut command = format!("userdel {name}");
    if remove_home {
        command.push_str(" --remove");
    }
    host.run_checked(&command, sudo).await?;
    Ok(())
}

pub async fn rename_user<D: Dial>(
    host: &RemoteHost<D>,
    old_name: &str,
    new_name: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("usermod --login {new_name} {old_name}"), sudo)
        .await?;
    Ok(())
}

pub async fn change_group_id<D: Dial>(
    host: &RemoteHost<D>,
    group: &str,
    gid: u32,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("groupmod --gid {gid} {group}"), sudo)
        .await?;
    Ok(())
}

pub async fn change_home<D: Dial>(
    host: &RemoteHost<D>,
    user: &str,
    home: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("usermod --home {home} {user}"), sudo)
        .await?;
    Ok(())
}

pub async fn change_shell<D: Dial>(
    host: &RemoteHost<D>,
    user: &str,
    shell: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("usermod --shell {shell} {user}"), sudo)
        .await?;
    Ok(())
}

/// Looks `name` up in the passwd database.
///
/// `system` is not derivable from the entry and is always `false`.
pub async fn read_user<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<User, RemoteError> {
    let command = format!("getent passwd {name}");
    let line = getent(host, &command, sudo)
        .await?
        .ok_or_else(|| RemoteError::NotFound(format!("user not found with id {name}")))?;

    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return Err(RemoteError::UnexpectedOutput {
            command,
            reason: format!("expected 7 passwd fields, got {}", fields.len()),
        });
    }

    Ok(User {
        name: fields[0].to_string(),
        uid: Some(parse_id(&command, "uid", fields[2])?),
        gid: Some(parse_id(&command, "gid", fields[3])?),
        system: false,
        home: Some(fields[5].to_string()),
        shell: Some(fields[6].to_string()),
    })
}

/// Looks `name` up in the group database.
pub async fn read_group<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<Group, RemoteError> {
    let command = format!("getent group {name}");
    let line = getent(host, &command, sudo)
        .await?
        .ok_or_else(|| RemoteError::NotFound(format!("group not found with id {name}")))?;

    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 3 {
        return Err(RemoteError::UnexpectedOutput {
            command,
            reason: format!("expected at least 3 group fields, got {}", fields.len()),
        });
    }

    Ok(Group {
        name: fields[0].to_string(),
        gid: Some(parse_id(&command, "gid", fields[2])?),
        system: false,
    })
}

/// First line of a getent lookup, or `None` when the key is unknown.
async fn getent<D: Dial>(
    host: &RemoteHost<D>,
    command: &str,
    sudo: bool,
) -> Result<Option<String>, RemoteError> {
    // getent exits 2 when the key is not in the database.
    let stdout = match host.run(command, sudo).await {
        Ok(output) => output.stdout,
        Err(e) if e.exit_status() == Some(2) => return Ok(None),
        Err(e) => return Err(e.while_running(command)),
    };
    Ok(stdout
        .lines()
        .next()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string))
}

fn parse_id(command: &str, field: &str, value: &str) -> Result<u32, RemoteError> {
    value.parse().map_err(|_| RemoteError::UnexpectedOutput {
        command: command.to_string(),
        reason: format!("{field} {value:?} is not a number"),
    })
}
