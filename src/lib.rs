use self::cli::{Cli, SubCommands};
use self::error::{SpannedErr, SpannedExt};
use self::jobframework::{IntegrationRegistry, RegistryError};
use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_error::ExtractSpanTrace;
use tracing_error::SpanTrace;

pub mod api;
pub(crate) mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod inspect;
pub mod jobframework;
pub mod manager;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to load config.\n{0}")]
    ConfigError(#[from] config::ConfigLoadError),

    #[error("Failed to register integrations.\n{0}")]
    RegistryError(#[from] RegistryError),

    #[error("Failed to initialize kubernetes client.\n{0}")]
    KubeClientError(#[from] SpannedErr<kube::Error>),

    #[error("Manager stopped due to following error:\n{0}")]
    ManagerError(#[from] manager::ManagerError),

    #[error("Failed to read manifest '{path}'.\n{source}")]
    ManifestReadError {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to inspect manifest.\n{0}")]
    InspectError(#[from] inspect::InspectError),

    #[error("Failed to print output.\n{0}")]
    OutputError(#[from] serde_yaml::Error),
}

impl ExtractSpanTrace for AppError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            AppError::KubeClientError(e) => e.span_trace(),
            _ => None,
        }
    }
}

#[tracing::instrument("app", skip_all)]
pub async fn app() -> Result<(), AppError> {
    let cli = Cli::parse();

    let mut registry = IntegrationRegistry::default();
    controller::register_integrations(&mut registry)?;
    let integrations = registry.freeze();

    match cli.subcommand {
        SubCommands::Integrations {} => {
            for (name, callbacks) in integrations.iter() {
                let gvk = callbacks.gvk();
                println!("{name}\t{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind);
            }
        }
        SubCommands::Inspect { manifest } => {
            let config = config::Config::new_from_file(&cli.config).await?;
            let components = manager::setup_components(&integrations, &config)?;
            let content = tokio::fs::read_to_string(&manifest).await.map_err(|source| {
                AppError::ManifestReadError {
                    path: manifest.display().to_string(),
                    source,
                }
            })?;
            let summary = inspect::inspect_manifest(&content, &components.scheme, &integrations)?;
            print!("{}", serde_yaml::to_string(&summary)?);
        }
        SubCommands::Run {} => {
            let config = config::Config::new_from_file(&cli.config).await?;
            info!("Config Loaded.");

            let client = kube::Client::try_default().await.with_span_trace()?;
            info!("Kubernetes Client Initialized.");

            let shutdown = manager::Shutdown::new();
            manager::run(client, config, integrations, shutdown).await?;
        }
    }

    Ok(())
}
