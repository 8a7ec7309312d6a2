//! Burrow CLI - expose local services to the internet
//!
//! Usage:
//!   burrow http <PORT>          Tunnel one local port
//!   burrow start                Start every tunnel from config
//!   burrow auth login           Store an API key
//!   burrow auth logout          Remove the stored key
//!   burrow auth status          Show login state

mod commands;
mod config;
mod inspector;
mod tunnel;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Expose local services to the internet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Tunnel one local port
    Http {
        /// Local port to expose
        port: u16,

        /// Request a specific subdomain
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Require basic authentication from callers (format: user:pass)
        #[arg(long)]
        auth: Option<String>,

        /// Local host to forward to
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Tunnel server URL
        #[arg(long, env = "BURROW_SERVER")]
        server: Option<String>,

        /// API key for the control plane
        #[arg(long, env = "BURROW_API_KEY")]
        api_key: Option<String>,

        /// Port for the local request inspector
        #[arg(long)]
        inspector_port: Option<u16>,

        /// Disable the local request inspector
        #[arg(long)]
        no_inspector: bool,

        /// Open the public URL in a browser once connected
        #[arg(long)]
        open: bool,
    },

    /// Start every tunnel declared in config
    Start {
        /// Config file to use instead of the layered defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Manage stored credentials
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Store an API key
    Login {
        /// API key (prompted when omitted)
        api_key: Option<String>,
    },
    /// Remove the stored API key
    Logout,
    /// Show login state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},burrow_cli=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    match cli.command {
        Commands::Http {
            port,
            subdomain,
            auth,
            host,
            server,
            api_key,
            inspector_port,
            no_inspector,
            open,
        } => {
            commands::http::run(commands::http::HttpOptions {
                port,
                subdomain,
                auth,
                host,
                server,
                api_key,
                inspector_port,
                no_inspector,
                open,
            })
            .await?;
        }

        Commands::Start { config } => {
            commands::start::run(config).await?;
        }

        Commands::Auth { command } => match command {
            AuthCommands::Login { api_key } => commands::auth::login(api_key).await?,
            AuthCommands::Logout => commands::auth::logout().await?,
            AuthCommands::Status => commands::auth::status().await?,
        },
    }

    Ok(())
}
