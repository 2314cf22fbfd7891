//! Hostlink agent entry point

use clap::{Parser, Subcommand};
use hostlink::config::AgentConfig;
use hostlink::credentials::{derive_key, CredentialStatus, CredentialStore};
use hostlink::jobs::CommandRouter;
use hostlink::observability::{init_default_logging, metrics};
use hostlink::AgentRuntime;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "hostlink.toml",
    "config/hostlink.toml",
    "/etc/hostlink/agent.toml",
];

/// Host-resident deployment agent
#[derive(Parser)]
#[command(name = "hostlink-agent")]
#[command(about = "Receives jobs from the control plane and reports results")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HOSTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Inspect or remove the stored transport credential
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Report whether a readable credential is stored
    Status,
    /// Delete the stored credential
    Forget,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose > 0);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Credentials { action } => handle_credentials_command(&config, action),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: Option<&Path>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "no configuration file found (tried {}); pass one with -c/--config",
        DEFAULT_CONFIG_PATHS.join(", ")
    )
    .into())
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(agent_id = %config.agent.id, "Application starting");
    metrics().set_agent_state("initializing");

    let runtime = AgentRuntime::build(config, CommandRouter::new())?;
    runtime.run_until_signal().await?;

    info!("Application shutdown complete");
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}

fn credential_store(config: &AgentConfig) -> CredentialStore {
    let derived = derive_key(Some(&config.agent.id), config.agent.environment);
    CredentialStore::new(config.credentials.path.clone(), derived.key)
}

fn handle_credentials_command(
    config: &AgentConfig,
    action: CredentialAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = credential_store(config);
    match action {
        CredentialAction::Status => match store.status()? {
            CredentialStatus::Missing => {
                println!("No credential stored at {}", store.path().display());
            }
            CredentialStatus::Readable { bytes } => {
                println!(
                    "Credential readable at {} ({bytes} bytes)",
                    store.path().display()
                );
            }
            CredentialStatus::Corrupt(reason) => {
                println!(
                    "Credential at {} is unreadable: {reason}",
                    store.path().display()
                );
            }
        },
        CredentialAction::Forget => {
            if store.clear()? {
                println!("Removed credential at {}", store.path().display());
            } else {
                println!("No credential stored at {}", store.path().display());
            }
        }
    }
    Ok(())
}
