use airdex_sync::RunMode;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "airdex")]
#[command(about = "Sync the airport dataset with Steam Workshop and Discord")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape both sources, enrich new airports and write the dataset (default)
    Run,
    /// Only scrape the Steam Workshop
    Steam,
    /// Only scrape Discord
    Discord,
    /// Print newly discovered ICAOs per source without enriching or writing
    Detect,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mode = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => RunMode::Full,
        Commands::Steam => RunMode::SteamOnly,
        Commands::Discord => RunMode::DiscordOnly,
        Commands::Detect => {
            let report = airdex_sync::detect_from_env().await?;
            print!("{report}");
            return Ok(());
        }
    };

    let summary = airdex_sync::run_sync_from_env(mode).await?;
    println!("{}", summary.summary_line());
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
