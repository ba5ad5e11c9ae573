pub mod consts;

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use directories::ProjectDirs;

pub const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub static PROJECT_SEMVER: LazyLock<semver::Version> = LazyLock::new(|| {
    semver::Version::parse(PROJECT_VERSION).unwrap_or(semver::Version {
        major: 0,
        minor: 0,
        patch: 0,
        pre: semver::Prerelease::EMPTY,
        build: semver::BuildMetadata::EMPTY,
    })
});

pub const PROJECT_NAME: &str = "dynakube-operator";
pub const PROJECT_NAME_WITH_INITIAL_CAPITAL: &str = "Dynakube Operator";

pub const CLI_PROGRAM_NAME: &str = "dynakube-operator";
pub const CLI_CONFIG_NAME: &str = "config.yaml";

/// System-wide configuration directory, used when the operator runs in a
/// container with its configuration mounted from a `ConfigMap`.
pub const SYSTEM_CONFIG_DIR: &str = "/etc/dynakube-operator";

pub static PROJECT_CONFIG_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    ProjectDirs::from("", PROJECT_NAME, PROJECT_NAME)
        .map_or_else(|| PathBuf::from(SYSTEM_CONFIG_DIR), |dirs| dirs.config_dir().to_path_buf())
});

#[must_use]
pub fn fallback_project_config_directories() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(SYSTEM_CONFIG_DIR)];
    if let Some(user_dirs) = directories::UserDirs::new() {
        dirs.push(
            [user_dirs.home_dir(), Path::new(".config"), Path::new(PROJECT_NAME)].iter().collect(),
        );
    }
    dirs
}

/// Semantic version rendered without build metadata, suitable for use as a
/// Kubernetes label value.
#[must_use]
pub fn version_label_value() -> String {
    let semver::Version { major, minor, patch, .. } = &*PROJECT_SEMVER;
    format!("{major}.{minor}.{patch}")
}
