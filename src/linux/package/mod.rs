use super::*;

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use super::command::command_exists;

mod apt;
mod yum;

/// Package managers the crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Yum,
    Apt,
}

impl PackageManager {
    /// Finds the host's package manager, preferring yum over apt.
    pub async fn detect<D: Dial>(host: &RemoteHost<D>) -> Result<Self, RemoteError> {
        if command_exists(host, "yum", false).await? {
            return Ok(PackageManager::Yum);
        }
        if command_exists(host, "apt", false).await? {
            return Ok(PackageManager::Apt);
        }
        Err(RemoteError::NoPackageManager)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PackageManager::Yum => "yum",
            PackageManager::Apt => "apt",
        }
    }

    /// Installs `name`, pinned to `version` when one is given.
    pub async fn install<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        name: &str,
        version: Option<&str>,
        sudo: bool,
    ) -> Result<(), RemoteError> {
        match self {
            PackageManager::Yum => yum::install(host, name, non_empty(version), sudo).await,
            PackageManager::Apt => apt::install(host, name, non_empty(version), sudo).await,
        }
    }

    pub async fn install_list<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        names: &[&str],
        sudo: bool,
    ) -> Result<(), RemoteError> {
        let names = joined(names)?;
        match self {
            PackageManager::Yum => yum::install_list(host, &names, sudo).await,
            PackageManager::Apt => apt::install_list(host, &names, sudo).await,
        }
    }

    pub async fn remove<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        name: &str,
        sudo: bool,
    ) -> Result<(), RemoteError> {
        match self {
            PackageManager::Yum => yum::remove(host, name, sudo).await,
            PackageManager::Apt => apt::remove(host, name, sudo).await,
        }
    }

    pub async fn remove_list<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        names: &[&str],
        sudo: bool,
    ) -> Result<(), RemoteError> {
        let names = joined(names)?;
        match self {
            PackageManager::Yum => yum::remove_list(host, &names, sudo).await,
            PackageManager::Apt => apt::remove_list(host, &names, sudo).await,
        }
    }

    /// Upgrades `name`, to `version` when one is given.
    pub async fn update<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        name: &str,
        version: Option<&str>,
        sudo: bool,
    ) -> Result<(), RemoteError> {
        match self {
            PackageManager::Yum => yum::update(host, name, non_empty(version), sudo).await,
            PackageManager::Apt => apt::upgrade(host, name, non_empty(version), sudo).await,
        }
    }

    pub async fn is_installed<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        name: &str,
        sudo: bool,
    ) -> Result<bool, RemoteError> {
        match self {
            PackageManager::Yum => yum::is_installed(host, name, sudo).await,
            PackageManager::Apt => Ok(apt::installed_version(host, name, sudo).await?.is_some()),
        }
    }

    /// Installed version of `name`, or `None` when it is not installed.
    pub async fn installed_version<D: Dial>(
        &self,
        host: &RemoteHost<D>,
        name: &str,
        sudo: bool,
    ) -> Result<Option<String>, RemoteError> {
        match self {
            PackageManager::Yum => yum::installed_version(host, name, sudo).await,
            PackageManager::Apt => apt::installed_version(host, name, sudo).await,
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn joined(names: &[&str]) -> Result<String, RemoteError> {
    if names.is_empty() {
        return Err(RemoteError::InvalidArgument("no packages given".to_string()));
    }
    Ok(names.join(" "))
}

/// Whether a package should be installed or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Present,
    Absent,
}

impl FromStr for PackageState {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(PackageState::Present),
            "absent" => Ok(PackageState::Absent),
            _ => Err(RemoteError::InvalidArgument(
                "state should be one of: present, absent".to_string(),
            )),
        }
    }
}

/// Brings one package to `state` and returns its installed version.
///
/// An absent package reports `None`.
pub async fn ensure_package<D: Dial>(
    host: &RemoteHost<D>,
    name: &str,
    version: Option<&str>,
    state: PackageState,
    sudo: bool,
) -> Result<Option<String>, RemoteError> {
    let manager = PackageManager::detect(host).await?;
    debug!(
        "Ensuring package {name} is {state:?} with {manager} on {}",
        host.target().name()
    );

    match state {
        PackageState::Present => {
            manager.install(host, name, version, sudo).await?;
            manager.installed_version(host, name, sudo).await
        }
        PackageState::Absent => {
            manager.remove(host, name, sudo).await?;
            Ok(None)
        }
    }
}

/// Brings a list of packages to `state` and returns the list's id.
pub async fn ensure_package_set<D: Dial>(
    host: &RemoteHost<D>,
    names: &[&str],
    state: PackageState,
    sudo: bool,
) -> Result<String, RemoteError> {
    let manager = PackageManager::detect(host).await?;
    match state {
        PackageState::Present => manager.install_list(host, names, sudo).await?,
        PackageState::Absent => manager.remove_list(host, names, sudo).await?,
    }
    Ok(package_set_id(names))
}

/// Stable id of a package list: `list_` followed by the SHA-256 of the
/// names concatenated in order.
pub fn package_set_id(names: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_bytes());
    }
    format!("list_{:x}", hasher.finalize())
}
