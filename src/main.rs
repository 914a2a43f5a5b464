use anyhow::Result;
use clap::{Parser, Subcommand};
use lily::config::LilyConfig;
use lily::db::Store;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lily", version, about = "Persistent memory and workflow companion for conversational agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport)
    Serve,
    /// Run one scheduler tick (intended to be invoked by cron once a minute)
    Tick,
    /// Run a consolidation pass and exit
    Consolidate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LilyConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            lily::server::serve_stdio(config).await?;
        }
        Command::Tick => {
            let store = Store::open(&config.db_path)?;
            let summary = lily::scheduler::run_tick(&store, &config).await?;
            println!(
                "fired={} dispatched={} completed={} stuck={}",
                summary.fired, summary.dispatched, summary.completed, summary.stuck_failed
            );
            lily::db::close_all();
        }
        Command::Consolidate => {
            let store = Store::open(&config.db_path)?;
            let report = {
                let mut conn = store.lock()?;
                lily::memory::consolidate::consolidate(&mut conn)?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            lily::db::close_all();
        }
    }

    Ok(())
}
