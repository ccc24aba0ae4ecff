//! Lists connections whose credentials have not been read for a while.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use credential_hub::{config::ConfigLoader, db, server::AppState};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "stale-connections", about = "List connections not fetched recently")]
struct Args {
    /// Age threshold in days; defaults to CREDHUB_STALE_CONNECTION_DAYS
    #[arg(long)]
    days: Option<u32>,

    /// Maximum number of connections to list
    #[arg(long, default_value_t = 100)]
    limit: u64,

    /// Print one JSON document instead of a table
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;

    let days = args.days.unwrap_or(config.stale_connection_days);

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    let state = AppState::from_parts(config, db).context("building application state")?;

    let cutoff = Utc::now() - Duration::days(i64::from(days));
    let stale = state
        .connections
        .find_stale(cutoff, args.limit)
        .await
        .context("querying stale connections")?;

    if args.json {
        let rows: Vec<_> = stale
            .iter()
            .map(|connection| {
                json!({
                    "id": connection.id,
                    "connectionId": connection.connection_id,
                    "providerConfigKey": connection.provider_config_key,
                    "environmentId": connection.environment_id,
                    "lastFetchedAt": connection.last_fetched_at,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "days": days, "connections": rows }))?
        );
        return Ok(());
    }

    println!("{} connection(s) not fetched in {} day(s)", stale.len(), days);
    for connection in &stale {
        let last_fetched = connection
            .last_fetched_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}\t{}\tenv={}\tlast_fetched={}",
            connection.connection_id,
            connection.provider_config_key,
            connection.environment_id,
            last_fetched
        );
    }

    Ok(())
}
