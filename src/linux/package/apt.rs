use super::*;

fn pinned(name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{name}={version}"),
        None => name.to_string(),
    }
}

async fn update_index<D: Dial>(host: &RemoteHost<D>, sudo: bool) -> Result<(), RemoteError> {
    host.run_checked("apt update -y", sudo).await?;
    Ok(())
}

pub(super) async fn install<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    version: Option<&str>,
    sudo: bool,
) -> Result<(), RemoteError> {
    update_index(host, sudo).await?;
    host.run_checked(&format!("apt install -y {}", pinned(name, version)), sudo)
        .await?;
    Ok(())
}

pub(super) async fn install_list<D: Dial>(
    host: &RemoteHost<D>,
    names: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("apt install -y {names}"), sudo).await?;
    Ok(())
}

pub(super) async fn remove<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("apt remove -y {name}"), sudo).await?;
    Ok(())
}

pub(super) async fn remove_list<D: Dial>(
    host: &RemoteHost<D>,
    names: &str,
    sudo: bool,
) -> Result<(), RemoteError> {
    host.run_checked(&format!("apt remove -y {names}"), sudo).await?;
    Ok(())
}

pub(super) async fn upgrade<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    version: Option<&str>,
    sudo: bool,
) -> Result<(), RemoteError> {
    update_index(host, sudo).await?;
    host.run_checked(&format!("apt upgrade -y {}", pinned(name, version)), sudo)
        .await?;
    Ok(())
}

/// Version column of `apt list --installed`, whose entries look like
/// `bind9/now 1:9.11.5.P4+dfsg-5.1ubuntu2.1 amd64 [installed]`.
pub(super) async fn installed_version<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    sudo: bool,
) -> Result<Option<String>, RemoteError> {
    let stdout = host
        .run_checked(&format!("apt list --installed {name}"), sudo)
        .await?;
    Ok(parse_installed_version(&stdout, name))
}

fn parse_installed_version(listing: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}/");
    listing
        .lines()
        .find(|line| line.starts_with(&prefix))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
}
