//! GM Leaderboard - prints a ranked leaderboard as JSON
//!
//! Usage:
//!   cargo run --bin gm_leaderboard -- --timeframe weekly --limit 20
//!
//! `--timeframe` accepts daily, weekly or allTime (default daily). `--limit`
//! defaults to `GMFLOW_DEFAULT_LIMIT`. Profiles are fetched from
//! `GMFLOW_PROFILE_API_URL` when set. Only the database and read-side
//! settings are needed; no chain endpoint.

use dotenv::dotenv;
use gmflow::aggregator::Aggregator;
use gmflow::config::LeaderboardConfig;
use gmflow::leaderboard::LeaderboardService;
use gmflow::profile::{HttpProfileLookup, NoopProfileLookup, ProfileLookup};
use gmflow::store::SqliteEventStore;
use std::sync::Arc;
use std::time::Duration;

struct Args {
    timeframe: String,
    limit: Option<usize>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        timeframe: "daily".to_string(),
        limit: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--timeframe" | "-t" => {
                args.timeframe = iter.next().ok_or("--timeframe needs a value")?;
            }
            "--limit" | "-n" => {
                let raw = iter.next().ok_or("--limit needs a value")?;
                let limit = raw.parse().map_err(|_| format!("invalid --limit '{}'", raw))?;
                args.limit = Some(limit);
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = parse_args()?;
    let config = LeaderboardConfig::from_env()?;

    let store = Arc::new(SqliteEventStore::open(&config.db_path)?);
    let aggregator = Aggregator::new(store, config.scoring);

    let profiles: Arc<dyn ProfileLookup> = match &config.profile_api_url {
        Some(url) => Arc::new(HttpProfileLookup::new(
            url,
            Duration::from_millis(config.profile_timeout_ms),
        )?),
        None => Arc::new(NoopProfileLookup),
    };

    let service = LeaderboardService::new(aggregator, profiles, config.default_limit);
    let response = service.leaderboard(&args.timeframe, args.limit).await?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
