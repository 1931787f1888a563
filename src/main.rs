use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use traceline::api::server::start_server;
use traceline::config::TracelineConfig;

#[derive(Parser)]
#[command(name = "traceline")]
#[command(version, about = "Mission trace & governance core")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (default: ./traceline.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the trace & governance HTTP service
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "TRACELINE_PORT")]
        port: Option<u16>,

        /// Database path
        #[arg(long, env = "TRACELINE_DB_PATH")]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind on all interfaces)
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("traceline=debug,tower_http=debug")
        } else {
            EnvFilter::new("traceline=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = TracelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db_path) = db_path {
                config.storage.db_path = db_path;
            }
            if dev {
                config.server.dev_mode = true;
            }
            start_server(config).await
        }
    }
}
