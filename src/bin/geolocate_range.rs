//! Geolocates every IPv4 address in an inclusive range and stores the results.
//!
//! Usage: `geolocate_range <START_IP> <END_IP>`

use prospector::config::Config;
use prospector::db::Database;
use prospector::db_storage::PgRecordStore;
use prospector::enrichment::{EnrichmentPipeline, PipelineSettings};
use prospector::rate_limiter::RateLimiter;
use prospector::services::{build_reverse_geocoder, MaxMindGeoLookup};
use std::net::Ipv4Addr;
use std::sync::Arc;

fn parse_args() -> anyhow::Result<(Ipv4Addr, Ipv4Addr)> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [start, end] = args.as_slice() else {
        anyhow::bail!("usage: geolocate_range <START_IP> <END_IP>");
    };

    let start: Ipv4Addr = start
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not an IPv4 address", start))?;
    let end: Ipv4Addr = end
        .parse()
        .map_err(|_| anyhow::anyhow!("'{}' is not an IPv4 address", end))?;
    Ok((start, end))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prospector=info".into()),
        )
        .init();

    let (start, end) = parse_args()?;
    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    db.migrate().await?;

    let pipeline = EnrichmentPipeline::new(
        Arc::new(PgRecordStore::new(db.pool.clone())),
        Arc::new(MaxMindGeoLookup::open(&config.geoip_city_db).await?),
        build_reverse_geocoder(&config)?,
        PipelineSettings::from_config(&config),
    );
    let limiter = RateLimiter::new(config.geolocate_throttle());

    let summary = pipeline.geolocate_range(start, end, &limiter).await?;

    println!(
        "{} attempted, {} enriched, {} unresolved, {} skipped, {} failed",
        summary.attempted, summary.enriched, summary.unresolved, summary.skipped, summary.failed
    );
    Ok(())
}
