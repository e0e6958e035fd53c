//! modelgate - request-forwarding gateway for model provider APIs

use clap::{Parser, Subcommand};
use modelgate::config::{self, ConfigStore};
use modelgate::observability::{init_logging, LogFormat};
use modelgate::{Server, NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// modelgate - request-forwarding gateway for model provider APIs
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Routes, rewrites and rate-limits requests to model provider APIs")]
struct Cli {
    /// Directory containing config.json and config.{Environment}.json
    #[arg(short, long, default_value = ".")]
    config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Do not watch the configuration files for changes
    #[arg(long)]
    no_watch: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run,

    /// Validate the merged configuration
    Validate,

    /// Print the merged configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> modelgate::Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    init_logging(&cli.log_level, format)?;

    match cli.command {
        Some(Commands::Validate) => validate_config(&cli.config_dir),
        Some(Commands::Config) => show_config(&cli.config_dir),
        Some(Commands::Run) | None => run_server(&cli.config_dir, !cli.no_watch).await,
    }
}

/// Run the server
async fn run_server(config_dir: &Path, watch: bool) -> modelgate::Result<()> {
    info!("Starting {} v{}", NAME, VERSION);

    let store = Arc::new(ConfigStore::open(config_dir)?);
    if watch {
        info!("Hot reload enabled - watching {:?}", config_dir);
    }

    let server = Server::new(store)?.watch_config(watch);
    server.run().await
}

/// Validate configuration
fn validate_config(config_dir: &Path) -> modelgate::Result<()> {
    println!("Validating configuration in {:?}", config_dir);

    match config::load_config(config_dir) {
        Ok(config) => {
            println!("\n\u{2713} Configuration is valid!");
            println!("\nSummary:");
            println!("  Environment: {}", config.environment_name);
            println!("  Listen: {}", config.bind_address());
            println!("  Token conversion: {}", config.convert_token);
            println!("  Providers: {}", config.providers.len());

            for (name, provider) in &config.providers {
                println!("\n  Provider '{}':", name);
                println!("    Prefix: {}", provider.route_prefix);
                println!("    Upstream: {}", provider.upstream_template);
                println!("    Models: {}", provider.model_ids.len());
                if provider.is_rate_limited() {
                    println!("    Token limit/min: {}", provider.token_limit_per_minute);
                }
            }

            Ok(())
        }
        Err(e) => {
            println!("\n\u{2717} Configuration is invalid!");
            println!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Show merged configuration
fn show_config(config_dir: &Path) -> modelgate::Result<()> {
    let config = config::load_config(config_dir)?;
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| modelgate::GatewayError::Internal(e.to_string()))?;

    println!("{}", json);
    Ok(())
}
