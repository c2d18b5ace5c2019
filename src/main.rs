use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use docdbx::{
    config::{self, ConfigUpdate},
    logging, server,
};

#[derive(Parser)]
#[command(author, version, about = "DocDBX server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.docdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the DocDBX server
    Start(StartArgs),
    /// Update system configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured server port
    #[arg(short, long)]
    port: Option<u16>,

    /// JSON schema file that every stored document must conform to
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// JSON file mapping usernames to preissued tokens
    #[arg(short, long)]
    tokens: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long)]
    tokens: Option<PathBuf>,

    #[arg(long)]
    query_deadline_ms: Option<u64>,

    #[arg(long)]
    subscriber_buffer: Option<usize>,

    #[arg(long)]
    keep_alive_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();
    let (mut config, config_path) = config::load_or_default(cli.config)?;

    match cli.command {
        Commands::Start(args) => {
            config.apply_update(ConfigUpdate {
                port: args.port,
                schema_path: args.schema,
                tokens_path: args.tokens,
                ..ConfigUpdate::default()
            });
            info!("Listening on port {}", config.port);
            server::run(config).await?;
        }
        Commands::Config(args) => {
            config.apply_update(ConfigUpdate {
                port: args.port,
                schema_path: args.schema,
                tokens_path: args.tokens,
                query_deadline_ms: args.query_deadline_ms,
                subscriber_buffer: args.subscriber_buffer,
                keep_alive_secs: args.keep_alive_secs,
            });
            config.save(&config_path)?;
            println!("configuration written to {}", config_path.display());
        }
    }

    Ok(())
}
