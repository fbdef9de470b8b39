use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};

use tsbridge::app::{App, Options};
use tsbridge::provider::{default_registry, ProviderOptions};
use tsbridge::tsnet::loopback_factory;

#[derive(Parser, Debug)]
#[command(
    name = "tsbridge",
    version,
    about = "Expose backend HTTP services on the mesh, one node per service"
)]
struct Cli {
    /// Configuration provider
    #[arg(long, value_enum, default_value = "file")]
    provider: ProviderKind,

    /// Path to TOML configuration file (required for the file provider)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Container runtime endpoint (default: platform socket)
    #[arg(long)]
    container_endpoint: Option<String>,

    /// Label prefix for container-derived configuration
    #[arg(long, default_value = "tsbridge")]
    label_prefix: String,

    /// Re-emit the file provider's configuration when the file changes
    #[arg(long)]
    watch_config: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    validate: bool,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderKind {
    File,
    /// Build the configuration from labels on running containers
    #[value(name = "container-labels")]
    ContainerLabels,
}

impl ProviderKind {
    /// Name the provider is registered under
    fn registry_name(&self) -> &'static str {
        match self {
            ProviderKind::File => "file",
            ProviderKind::ContainerLabels => "docker",
        }
    }
}

fn setup_logging(verbose: bool) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::level_filters::LevelFilter::INFO.into());
    if verbose {
        filter = filter.add_directive("tsbridge=debug".parse().expect("valid log directive"));
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let registry = default_registry();
    let opts = ProviderOptions {
        config_path: cli.config.clone(),
        docker_endpoint: cli.container_endpoint.clone(),
        label_prefix: cli.label_prefix.clone(),
        watch_file: cli.watch_config,
    };

    let provider = match registry.create(cli.provider.registry_name(), &opts).await {
        Ok(provider) => provider,
        Err(e) => {
            error!(error = %e, "failed to create configuration provider");
            return if cli.validate { 2 } else { 1 };
        }
    };

    if cli.validate {
        return match provider.load().await {
            Ok(_) => {
                info!("configuration is valid");
                0
            }
            Err(e) => {
                error!(error = %e, "configuration is invalid");
                2
            }
        };
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = provider.name(),
        "starting tsbridge"
    );

    let app = App::new(Options {
        provider,
        mesh_factory: loopback_factory(),
    });
    if let Err(e) = app.start().await {
        error!(error = %e, "failed to start");
        return 1;
    }

    wait_for_signal().await;
    info!("shutting down");

    match app.shutdown().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "shutdown error");
            1
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
