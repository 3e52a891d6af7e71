use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swillbot")]
#[command(about = "Swillbot Slack commands and Untappd review cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the slash command endpoints.
    Serve,
    /// Create the review and user tables.
    Migrate,
    /// Bulk-sync the review cache of one registered Slack user.
    Sync { slack_user_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => swill_web::serve_from_env().await?,
        Commands::Migrate => {
            swill_sync::migrate_from_env().await?;
            println!("migrate complete");
        }
        Commands::Sync { slack_user_id } => {
            let outcome = swill_sync::sync_user_from_env(&slack_user_id).await?;
            println!(
                "sync complete: slack_user_id={} upserted={} high_water_mark={}",
                slack_user_id,
                outcome.upserted,
                outcome
                    .high_water_mark
                    .map(|mark| mark.to_rfc3339())
                    .unwrap_or_else(|| "unchanged".to_string())
            );
        }
    }

    Ok(())
}
