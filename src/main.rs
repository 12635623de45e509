//! MCP Proxy
//!
//! Aggregates stdio and streamable-HTTP MCP servers behind a single
//! streamable-HTTP endpoint.
//!
//! # Architecture Overview
//!
//! ```text
//!     .env + process environment
//!         → config (Settings, exactly one config source)
//!         → config::source (ResolvedConfig JSON)
//!         → lifecycle::startup (ProxyFactory → ProxyHandle::run)
//!
//!     MCP client ──POST /mcp──▶ http::server ──▶ proxy::Aggregator
//!                                                 ├─▶ upstream (stdio child)
//!                                                 └─▶ upstream (streamable HTTP)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use mcp_proxy::config::env::load_env_file;
use mcp_proxy::config::settings::{DEFAULT_LOG_LEVEL, LOG_LEVEL_VAR};
use mcp_proxy::config::Environment;
use mcp_proxy::lifecycle::{self, signals, Shutdown};
use mcp_proxy::observability::logging;
use mcp_proxy::{Error, McpProxyFactory, ProxyFactory, PROXY_NAME};

const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Parser)]
#[command(name = "mcp-proxy", version)]
#[command(about = "Serve configured MCP servers over one streamable HTTP endpoint", long_about = None)]
struct Cli {
    /// Env file loaded before reading settings; real variables take precedence
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Run the proxy (default)
    Serve,
    /// Resolve and validate the configuration, print the servers, and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let (env_file, required) = match cli.env_file {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_ENV_FILE), false),
    };
    let loaded = load_env_file(&env_file, required)?;

    let env = Environment::from_process();
    logging::init(env.get(LOG_LEVEL_VAR).unwrap_or(DEFAULT_LOG_LEVEL));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        env_file = %env_file.display(),
        env_file_loaded = loaded,
        "mcp-proxy starting"
    );

    let (settings, config) = lifecycle::prepare(&env)?;
    let factory = McpProxyFactory::from_settings(&settings);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => {
            let proxy = factory.construct(&config, PROXY_NAME)?;
            println!("configuration source: {}", settings.source.kind());
            println!("listen address: {}", settings.bind_address());
            println!("servers: {}", proxy.servers().len());
            for (name, server) in proxy.servers() {
                println!("  {name} ({}): {}", server.transport_label(), server.target());
            }
            Ok(())
        }
        Commands::Serve => {
            let shutdown = Shutdown::new();
            signals::spawn_signal_listener(shutdown.clone());
            lifecycle::launch(&factory, &settings, &config, shutdown).await?;
            tracing::info!("Shutdown complete");
            Ok(())
        }
    }
}
