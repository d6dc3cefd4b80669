use super::*;

use once_cell::sync::Lazy;
use regex::Regex;

/// The `Version : x.y.z` line of `yum info` output.
static VERSION_LINE: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"(?m)^Version[ \t]*:[ \t]*(\S+)[ \t]*\r?$") {
        Ok(re) => re,
        Err(err) => panic!("invalid VERSION_LINE regex: {err}"),
    });

fn pinned(name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{name}-{version}"),
        None => name.to_string(),
    }
}

pub(super) async fn install<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    version: Option<&str>,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(
        &format!("yum install --quiet --assumeyes {}", pinned(name, version)),
        sudo,
    )
    .await?;
    Ok(())
}

pub(super) async fn install_list<D: Dial>(
    host: &RemoteHost<D>,
    names: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("yum install --quiet --assumeyes {names}"), sudo)
        .await?;
    Ok(())
}

pub(super) async fn remove<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("yum remove -y {name}"), sudo).await?;
    Ok(())
}

pub(super) async fn remove_list<D: Dial>(
    host: &RemoteHost<D>,
    names: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("yum remove --quiet --assumeyes {names}"), sudo)
        .await?;
    Ok(())
}

pub(super) async fn update<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    version: Option<&str>,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(
        &format!("yum update --quiet --assumeyes {}", pinned(name, version)),
        sudo,
    )
    .await?;
    Ok(())
}

/// `yum list installed` exits 1 when the package is not installed.
pub(super) async fn is_installed<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<bool, RemoteError> {
    let command = format!("yum list installed {name}");
    match host.run(&command, sudo).await {
        Ok(output) => Ok(!output.stdout.trim().is_empty()),
        Err(e) if e.exit_status() == Some(1) => Ok(false),
        Err(e) => Err(e.while_running(command)),
    }
}

pub(super) async fn installed_version<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<Option<String>, RemoteError> {
    let command = format!("yum info installed {name}");
    match host.run(&command, sudo).await {
        Ok(output) => Ok(parse_version(&output.stdout)),
        Err(e) if e.exit_status() == Some(1) => Ok(None),
        Err(e) => Err(e.while_running(command)),
    }
}

fn parse_version(info: &str) -> Option<String> {
    VERSION_LINE
        .captures(info)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
