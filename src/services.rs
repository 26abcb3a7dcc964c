//! Lookup services the enrichment pipeline depends on.
//!
//! Both seams are traits so the pipeline can run against the real adapters
//! (MaxMind GeoLite2, a local place table, Nominatim) or test doubles.

use crate::circuit_breaker::{create_lookup_circuit_breaker, LookupCircuitBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{LocationRecord, PlaceMatch};
use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as _;
use maxminddb::Reader;
use reqwest::Client;
use serde::Deserialize;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Result of a GeoIP lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoLookupOutcome {
    Found(LocationRecord),
    NotFound,
    /// The lookup itself failed (unparseable input, corrupt database entry).
    Failed(String),
}

#[async_trait]
pub trait GeoLookupService: Send + Sync {
    async fn lookup(&self, ip: &str) -> GeoLookupOutcome;
}

#[async_trait]
pub trait ReverseGeocodeService: Send + Sync {
    /// Places nearest to the coordinate, best match first. Empty when nothing is known.
    async fn search(&self, lat: f64, lon: f64) -> Result<Vec<PlaceMatch>, AppError>;
}

// ============ GeoIP ============

/// GeoLite2-City database loaded into memory once at startup.
pub struct MaxMindGeoLookup {
    reader: Reader<Vec<u8>>,
}

impl MaxMindGeoLookup {
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        tracing::info!("Loading GeoIP database from: {}", path);

        let db_bytes = tokio::fs::read(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read GeoIP database from {}: {}", path, e))?;
        let reader = Reader::from_source(db_bytes)
            .map_err(|e| anyhow::anyhow!("Failed to parse GeoIP database from {}: {}", path, e))?;

        tracing::info!(
            "GeoIP database loaded ({}, build epoch {})",
            reader.metadata.database_type,
            reader.metadata.build_epoch
        );
        Ok(Self { reader })
    }

    fn lookup_city(&self, ip_addr: IpAddr) -> GeoLookupOutcome {
        let city_lookup = match self.reader.lookup(ip_addr) {
            Ok(result) => result,
            Err(e) => return GeoLookupOutcome::Failed(e.to_string()),
        };

        if !city_lookup.has_data() {
            return GeoLookupOutcome::NotFound;
        }

        let city: maxminddb::geoip2::City = match city_lookup.decode() {
            Ok(Some(city)) => city,
            Ok(None) => return GeoLookupOutcome::NotFound,
            Err(e) => return GeoLookupOutcome::Failed(e.to_string()),
        };

        let subdivision = city.subdivisions.first();
        // GeoLite2 carries a single metro code; the legacy DMA code is the same number.
        let metro_code = city.location.metro_code.map(|m| m.to_string());

        GeoLookupOutcome::Found(LocationRecord {
            city: city.city.names.english.unwrap_or_default().to_string(),
            time_zone: city.location.time_zone.unwrap_or_default().to_string(),
            longitude: city.location.longitude.unwrap_or(0.0),
            latitude: city.location.latitude.unwrap_or(0.0),
            dma_code: metro_code.clone(),
            metro_code,
            area_code: None,
            postal_code: city.postal.code.map(|s| s.to_string()),
            region: subdivision
                .and_then(|s| s.iso_code)
                .unwrap_or_default()
                .to_string(),
            region_name: subdivision
                .and_then(|s| s.names.english)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[async_trait]
impl GeoLookupService for MaxMindGeoLookup {
    async fn lookup(&self, ip: &str) -> GeoLookupOutcome {
        match ip.trim().parse::<IpAddr>() {
            Ok(ip_addr) => self.lookup_city(ip_addr),
            Err(_) => GeoLookupOutcome::Failed(format!("'{}' is not an IP address", ip)),
        }
    }
}

// ============ Reverse geocoding ============

/// One row of a GeoNames-style place table (`lat,lon,name,admin1,admin2,cc`).
#[derive(Debug, Clone, Deserialize)]
struct PlaceRow {
    lat: f64,
    lon: f64,
    name: String,
    #[serde(default)]
    admin1: String,
    #[serde(default)]
    admin2: String,
    #[serde(default)]
    cc: String,
}

/// Offline reverse geocoder: nearest places from an in-memory table.
pub struct PlaceTableGeocoder {
    places: Vec<PlaceRow>,
    max_results: usize,
}

impl PlaceTableGeocoder {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open place table {:?}: {}", path, e))?;
        let geocoder = Self::from_reader(file)?;
        tracing::info!(
            "Loaded {} places for reverse geocoding from {:?}",
            geocoder.places.len(),
            path
        );
        Ok(geocoder)
    }

    pub fn from_reader<R: Read>(source: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(source);
        let mut places = Vec::new();
        for (line, record) in reader.deserialize::<PlaceRow>().enumerate() {
            match record {
                Ok(row) => places.push(row),
                Err(e) => tracing::warn!("Skipping place table row {}: {}", line + 2, e),
            }
        }

        Ok(Self {
            places,
            max_results: 3,
        })
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[async_trait]
impl ReverseGeocodeService for PlaceTableGeocoder {
    async fn search(&self, lat: f64, lon: f64) -> Result<Vec<PlaceMatch>, AppError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(AppError::BadRequest(format!(
                "invalid coordinates ({}, {})",
                lat, lon
            )));
        }

        let mut ranked: Vec<(f64, &PlaceRow)> = self
            .places
            .iter()
            .map(|p| (haversine_km(lat, lon, p.lat, p.lon), p))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(ranked
            .into_iter()
            .take(self.max_results)
            .map(|(_, p)| PlaceMatch {
                name: p.name.clone(),
                admin1: p.admin1.clone(),
                admin2: p.admin2.clone(),
                cc: p.cc.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    error: Option<String>,
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    county: Option<String>,
    state: Option<String>,
    country_code: Option<String>,
}

/// Reverse geocoder backed by a Nominatim `/reverse` endpoint.
pub struct NominatimReverseGeocoder {
    client: Client,
    base_url: String,
    breaker: LookupCircuitBreaker,
}

impl NominatimReverseGeocoder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("prospector/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Nominatim client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            breaker: create_lookup_circuit_breaker(),
        })
    }

    async fn fetch(&self, lat: f64, lon: f64) -> Result<Vec<PlaceMatch>, AppError> {
        let url = format!("{}/reverse", self.base_url);
        tracing::debug!("Nominatim reverse lookup ({}, {})", lat, lon);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Nominatim returned status {}: {}",
                status, error_text
            )));
        }

        let body: NominatimResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Nominatim response: {}", e))
        })?;

        if let Some(reason) = body.error {
            tracing::debug!("Nominatim has no place at ({}, {}): {}", lat, lon, reason);
            return Ok(Vec::new());
        }

        let Some(address) = body.address else {
            return Ok(Vec::new());
        };

        let name = address
            .city
            .or(address.town)
            .or(address.village)
            .or(address.hamlet)
            .unwrap_or_default();

        Ok(vec![PlaceMatch {
            name,
            admin1: address.state.unwrap_or_default(),
            admin2: address.county.unwrap_or_default(),
            cc: address.country_code.unwrap_or_default().to_uppercase(),
        }])
    }
}

#[async_trait]
impl ReverseGeocodeService for NominatimReverseGeocoder {
    async fn search(&self, lat: f64, lon: f64) -> Result<Vec<PlaceMatch>, AppError> {
        match self.breaker.call(self.fetch(lat, lon)).await {
            Ok(places) => Ok(places),
            Err(failsafe::Error::Inner(e)) => Err(e),
            Err(failsafe::Error::Rejected) => Err(AppError::ExternalApiError(
                "Nominatim circuit open; lookup rejected".to_string(),
            )),
        }
    }
}

/// Picks the reverse geocoder the configuration asks for.
pub fn build_reverse_geocoder(config: &Config) -> anyhow::Result<Arc<dyn ReverseGeocodeService>> {
    match config.places_csv {
        Some(ref path) => Ok(Arc::new(PlaceTableGeocoder::load(path)?)),
        None => {
            let client =
                NominatimReverseGeocoder::new(&config.nominatim_base_url, config.task_timeout())?;
            tracing::info!("✓ Nominatim client initialized: {}", config.nominatim_base_url);
            Ok(Arc::new(client))
        }
    }
}
