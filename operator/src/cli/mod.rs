//! Command line interface of the operator binary.
//!
//! # Examples
//!
//! ```bash
//! # Run the admission webhook and the reconcilers
//! dynakube-operator run --namespace dynatrace
//!
//! # Print the manifests to install alongside the operator
//! dynakube-operator crd > dynakube-crd.yaml
//! dynakube-operator webhook-configuration > webhook.yaml
//! ```

pub mod error;
mod run;

use std::{io::Write, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use dynakube_base::CLI_PROGRAM_NAME;
use kube::CustomResourceExt;
use snafu::ResultExt;
use tokio::runtime::Runtime;

pub use self::error::Error;
use crate::{config::Config, crd::DynaKube, shadow, webhook};

#[derive(Parser)]
#[command(
    name = CLI_PROGRAM_NAME,
    author,
    version,
    long_version = shadow::CLAP_LONG_VERSION,
    about = "Injects observability code modules and workload metadata into Kubernetes pods.",
    color = clap::ColorChoice::Always
)]
pub struct Cli {
    #[clap(subcommand)]
    commands: Option<Commands>,

    /// Path to the configuration file.
    #[clap(
        long = "config",
        short = 'c',
        env = "DYNAKUBE_OPERATOR_CONFIG_FILE_PATH",
        help = "Specify a configuration file. Defaults to the project configuration directory \
                or DYNAKUBE_OPERATOR_CONFIG_FILE_PATH env var."
    )]
    config_file: Option<PathBuf>,

    #[clap(
        long = "log-level",
        env = "DYNAKUBE_OPERATOR_LOG_LEVEL",
        help = "Set the logging level (e.g., info, debug, trace)."
    )]
    log_level: Option<tracing::Level>,

    /// Namespace the operator and its `DynaKube`s live in.
    #[clap(
        long = "namespace",
        short = 'n',
        env = "POD_NAMESPACE",
        global = true,
        help = "Namespace of the operator and its DynaKubes. Overrides the configuration file."
    )]
    namespace: Option<String>,
}

#[derive(Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Run the admission webhook and the DynaKube and Namespace controllers")]
    Run,

    #[command(about = "Display client and server version information")]
    Version {
        #[clap(long = "client", help = "If true, shows client version only (no server required).")]
        client: bool,
    },

    #[command(about = "Generate shell completion script for the specified shell (bash, zsh, fish)")]
    Completions { shell: clap_complete::Shell },

    #[command(about = "Output the default configuration in YAML format")]
    DefaultConfig,

    #[command(about = "Output the DynaKube CustomResourceDefinition in YAML format")]
    Crd,

    #[command(about = "Output the MutatingWebhookConfiguration in YAML format")]
    WebhookConfiguration,
}

impl Default for Cli {
    fn default() -> Self { Self::parse() }
}

impl Cli {
    /// Loads the configuration file, or the defaults if there is none, and
    /// applies the command line overrides.
    fn load_config(&self) -> Result<Config, Error> {
        let mut config = Config::load_or_default(
            self.config_file.clone().unwrap_or_else(Config::search_config_file_path),
        )?;

        if let Some(log_level) = self.log_level {
            config.log.level = log_level;
        }
        if let Some(namespace) = self.namespace.clone().filter(|namespace| !namespace.is_empty()) {
            config.operator_namespace = namespace;
        }

        Ok(config)
    }

    /// Executes the selected subcommand, `run` if none is given.
    ///
    /// # Errors
    ///
    /// Fails when the configuration cannot be loaded, the Kubernetes client
    /// cannot be created, or a worker of the operator fails.
    pub fn run(self) -> Result<i32, Error> {
        let client_version = Self::command().get_version().unwrap_or_default().to_string();
        match self.commands {
            Some(Commands::Version { client }) if client => {
                let long_version = Self::command().render_long_version();
                write_stdout(&format!("{long_version}Client Version: {client_version}\n"))?;
                return Ok(0);
            }
            Some(Commands::Completions { shell }) => {
                let mut app = Self::command();
                let bin_name = app.get_name().to_string();
                clap_complete::generate(shell, &mut app, bin_name, &mut std::io::stdout());
                return Ok(0);
            }
            Some(Commands::DefaultConfig) => {
                write_stdout(&to_yaml(&Config::default())?)?;
                return Ok(0);
            }
            Some(Commands::Crd) => {
                write_stdout(&to_yaml(&DynaKube::crd())?)?;
                return Ok(0);
            }
            _ => {}
        }

        let config = self.load_config()?;
        if matches!(self.commands, Some(Commands::WebhookConfiguration)) {
            let manifest =
                webhook::webhook_configuration(&config.webhook, &config.operator_namespace);
            write_stdout(&to_yaml(&manifest)?)?;
            return Ok(0);
        }

        config.log.registry();

        let fut = async move {
            let kube_client = kube::Client::try_default().await.context(error::KubeConfigSnafu)?;
            match self.commands {
                Some(Commands::Version { .. }) => {
                    let server_version = kube_client.apiserver_version().await.map_or_else(
                        |_| "unknown".to_string(),
                        |info| format!("{}.{}", info.major, info.minor),
                    );
                    let long_version = Self::command().render_long_version();
                    write_stdout(&format!(
                        "{long_version}Client Version: {client_version}\nServer Version: \
                         {server_version}\n",
                    ))?;
                }
                _ => run::run_operator(kube_client, config).await?,
            }

            Ok(0)
        };

        Runtime::new().context(error::InitializeTokioRuntimeSnafu)?.block_on(fut)
    }
}

fn to_yaml<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    serde_yaml::to_string(value).context(error::SerializeManifestSnafu)
}

fn write_stdout(text: &str) -> Result<(), Error> {
    std::io::stdout().write_all(text.as_bytes()).context(error::WriteStdoutSnafu)
}
