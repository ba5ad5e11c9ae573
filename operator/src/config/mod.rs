mod error;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use dynakube_base::consts::DEFAULT_OPERATOR_NAMESPACE;
use dynakube_cli::config::LogConfig;
use resolve_path::PathResolveExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

pub use self::error::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_operator_namespace")]
    pub operator_namespace: String,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default = "LogConfig::default")]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator_namespace: default_operator_namespace(),
            webhook: WebhookConfig::default(),
            controller: ControllerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn search_config_file_path() -> PathBuf {
        let paths = vec![Self::default_path()]
            .into_iter()
            .chain(dynakube_base::fallback_project_config_directories().into_iter().map(
                |mut path| {
                    path.push(dynakube_base::CLI_CONFIG_NAME);
                    path
                },
            ))
            .collect::<Vec<_>>();
        for path in paths {
            let Ok(exists) = path.try_exists() else {
                continue;
            };
            if exists {
                return path;
            }
        }
        Self::default_path()
    }

    #[inline]
    pub fn default_path() -> PathBuf {
        [
            dynakube_base::PROJECT_CONFIG_DIR.to_path_buf(),
            PathBuf::from(dynakube_base::CLI_CONFIG_NAME),
        ]
        .into_iter()
        .collect()
    }

    /// Loads the configuration at `path`, or the defaults if no file exists
    /// there.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        match path.as_ref().try_exists() {
            Ok(true) => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut config: Self = {
            let path =
                path.as_ref().try_resolve().map(|path| path.to_path_buf()).with_context(|_| {
                    error::ResolveFilePathSnafu { file_path: path.as_ref().to_path_buf() }
                })?;
            let data =
                std::fs::read(&path).context(error::OpenConfigSnafu { filename: path.clone() })?;
            serde_yaml::from_slice(&data).context(error::ParseConfigSnafu { filename: path })?
        };

        config.log.file_path = match config.log.file_path.map(|path| {
            path.try_resolve()
                .map(|path| path.to_path_buf())
                .with_context(|_| error::ResolveFilePathSnafu { file_path: path.clone() })
        }) {
            Some(Ok(path)) => Some(path),
            Some(Err(err)) => return Err(err),
            None => None,
        };
        config.webhook.certificate_directory = config
            .webhook
            .certificate_directory
            .try_resolve()
            .map(|path| path.to_path_buf())
            .with_context(|_| error::ResolveFilePathSnafu {
                file_path: config.webhook.certificate_directory.clone(),
            })?;

        Ok(config)
    }
}

/// Admission server settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default = "WebhookConfig::default_listen_address")]
    pub listen_address: SocketAddr,

    #[serde(default = "WebhookConfig::default_certificate_directory")]
    pub certificate_directory: PathBuf,

    #[serde(default = "WebhookConfig::default_certificate_file_name")]
    pub certificate_file_name: String,

    #[serde(default = "WebhookConfig::default_key_file_name")]
    pub key_file_name: String,

    #[serde(default = "WebhookConfig::default_certificate_reload_interval_secs")]
    pub certificate_reload_interval_secs: u64,

    /// Deadline of one admission request, also registered as the webhook
    /// timeout.
    #[serde(default = "WebhookConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "WebhookConfig::default_name")]
    pub service_name: String,

    #[serde(default = "WebhookConfig::default_name")]
    pub configuration_name: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_address: Self::default_listen_address(),
            certificate_directory: Self::default_certificate_directory(),
            certificate_file_name: Self::default_certificate_file_name(),
            key_file_name: Self::default_key_file_name(),
            certificate_reload_interval_secs: Self::default_certificate_reload_interval_secs(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            service_name: Self::default_name(),
            configuration_name: Self::default_name(),
        }
    }
}

impl WebhookConfig {
    #[inline]
    pub const fn default_listen_address() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8443)
    }

    #[inline]
    pub fn default_certificate_directory() -> PathBuf { PathBuf::from("/tmp/webhook/certs") }

    #[inline]
    pub fn default_certificate_file_name() -> String { "tls.crt".to_string() }

    #[inline]
    pub fn default_key_file_name() -> String { "tls.key".to_string() }

    #[inline]
    pub const fn default_certificate_reload_interval_secs() -> u64 { 60 }

    #[inline]
    pub const fn default_request_timeout_secs() -> u64 { 10 }

    #[inline]
    pub fn default_name() -> String { "dynatrace-webhook".to_string() }

    #[must_use]
    pub fn certificate_path(&self) -> PathBuf {
        self.certificate_directory.join(&self.certificate_file_name)
    }

    #[must_use]
    pub fn key_path(&self) -> PathBuf { self.certificate_directory.join(&self.key_file_name) }

    #[must_use]
    pub const fn certificate_reload_interval(&self) -> Duration {
        Duration::from_secs(self.certificate_reload_interval_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Reconciler settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Server-side timeout of watch requests.
    #[serde(default = "ControllerConfig::default_watcher_timeout_secs")]
    pub watcher_timeout_secs: u32,

    #[serde(default = "ControllerConfig::default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "ControllerConfig::default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Requeue interval after a successful reconcile.
    #[serde(default = "ControllerConfig::default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watcher_timeout_secs: Self::default_watcher_timeout_secs(),
            backoff_base_secs: Self::default_backoff_base_secs(),
            backoff_max_secs: Self::default_backoff_max_secs(),
            resync_interval_secs: Self::default_resync_interval_secs(),
        }
    }
}

impl ControllerConfig {
    #[inline]
    pub const fn default_watcher_timeout_secs() -> u32 { 25 }

    #[inline]
    pub const fn default_backoff_base_secs() -> u64 { 1 }

    #[inline]
    pub const fn default_backoff_max_secs() -> u64 { 300 }

    #[inline]
    pub const fn default_resync_interval_secs() -> u64 { 600 }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration { Duration::from_secs(self.backoff_base_secs) }

    #[must_use]
    pub const fn backoff_max(&self) -> Duration { Duration::from_secs(self.backoff_max_secs) }

    #[must_use]
    pub const fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

fn default_operator_namespace() -> String { DEFAULT_OPERATOR_NAMESPACE.to_string() }
