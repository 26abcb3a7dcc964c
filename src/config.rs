use std::time::Duration;

/// Largest page a single scan may request from the store.
const MAX_SCAN_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub geoip_city_db: String,
    /// Local place table for reverse geocoding. When unset the Nominatim client is used.
    pub places_csv: Option<String>,
    pub nominatim_base_url: String,
    pub scan_interval_secs: u64,
    pub scan_batch_size: usize,
    pub worker_count: usize,
    pub task_timeout_secs: u64,
    pub geolocate_throttle_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            geoip_city_db: std::env::var("GEOIP_CITY_DB")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "/var/lib/geoip/GeoLite2-City.mmdb".to_string()),
            places_csv: std::env::var("PLACES_CSV")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            nominatim_base_url: std::env::var("NOMINATIM_BASE_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string())
                .trim_end_matches('/')
                .to_string(),
            scan_interval_secs: positive_number("SCAN_INTERVAL_SECS", 300)?,
            scan_batch_size: positive_number("SCAN_BATCH_SIZE", 1000)?,
            worker_count: positive_number("WORKER_COUNT", 4)?,
            task_timeout_secs: positive_number("TASK_TIMEOUT_SECS", 10)?,
            geolocate_throttle_ms: std::env::var("GEOLOCATE_THROTTLE_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("GEOLOCATE_THROTTLE_MS must be a number"))?,
        };

        if !config.nominatim_base_url.starts_with("http://")
            && !config.nominatim_base_url.starts_with("https://")
        {
            anyhow::bail!("NOMINATIM_BASE_URL must start with http:// or https://");
        }
        if config.scan_batch_size > MAX_SCAN_BATCH_SIZE {
            anyhow::bail!("SCAN_BATCH_SIZE must be at most {}", MAX_SCAN_BATCH_SIZE);
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Database URL: {}...", url_preview(&config.database_url));
        tracing::debug!("GeoIP database: {}", config.geoip_city_db);
        match config.places_csv {
            Some(ref path) => tracing::debug!("Reverse geocoding from place table: {}", path),
            None => tracing::debug!("Reverse geocoding via Nominatim: {}", config.nominatim_base_url),
        }
        tracing::debug!(
            "Scan every {}s (batch {}), {} workers, {}s call timeout",
            config.scan_interval_secs,
            config.scan_batch_size,
            config.worker_count,
            config.task_timeout_secs
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn geolocate_throttle(&self) -> Duration {
        Duration::from_millis(self.geolocate_throttle_ms)
    }
}

/// First characters of a connection URL, short of any credentials.
fn url_preview(url: &str) -> String {
    url.chars().take(20).collect()
}

/// Reads a strictly positive number, falling back to `default` when the variable is unset.
fn positive_number<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
{
    let value = match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number", name))?,
        Err(_) => default,
    };
    if value <= T::default() {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(value)
}
