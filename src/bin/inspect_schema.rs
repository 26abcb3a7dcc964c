//! Utility to print the columns of the tables the enrichment pipeline uses.

use prospector::config::Config;
use prospector::db::Database;

const PIPELINE_TABLES: [&str; 3] = ["addresses", "ipaddress", "zipcodes"];

/// Main entry point for the schema inspection utility.
///
/// Connects to the database and lists the columns of each pipeline table,
/// with row counts so an empty reference table stands out.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prospector=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;

    for table in PIPELINE_TABLES {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&db.pool)
        .await?;

        if columns.is_empty() {
            println!("- {} (missing; run the service once to apply migrations)", table);
            println!();
            continue;
        }

        let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&db.pool)
            .await?;

        println!("- {} ({} rows)", table, rows);
        for (col, type_, nullable) in columns {
            let null_marker = if nullable == "YES" { " NULL" } else { "" };
            println!("  - {}: {}{}", col, type_, null_marker);
        }
        println!();
    }

    Ok(())
}
