//! Enrichment tasks.
//!
//! Each operation resolves one record and persists what it found:
//! 1. GeolocateIp: IP -> city/region row via the GeoIP database
//! 2. ReverseGeocodeAddress: coordinates -> city, county and state
//! 3. BackfillZipCode: (city, region) -> postcode from the reference table
//! 4. ScanIncompleteAddresses: finds addresses still missing a postcode
//!
//! No operation returns an error to its caller. Failures are logged and
//! reported as a `TaskOutcome`; the record stays eligible for the next scan.

use crate::config::Config;
use crate::db_storage::RecordStore;
use crate::errors::AppError;
use crate::models::{Address, NewIpAddress, ZipCode};
use crate::rate_limiter::RateLimiter;
use crate::services::{GeoLookupOutcome, GeoLookupService, ReverseGeocodeService};
use crate::task_queue::{Task, TaskQueue};
use chrono::Utc;
use moka::future::Cache;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// How a single task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// New data was resolved and persisted.
    Enriched,
    /// Nothing was found; a terminal marker was persisted (sentinel row, `processed`).
    Unresolved,
    /// The record was already complete; no lookup was made.
    Skipped,
    /// The lookup ran but produced nothing usable; the record is unchanged.
    NoMatch,
    /// The record does not exist.
    Missing,
    /// A lookup or store call failed; the record is unchanged.
    Failed(String),
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Enriched => write!(f, "enriched"),
            TaskOutcome::Unresolved => write!(f, "unresolved"),
            TaskOutcome::Skipped => write!(f, "skipped"),
            TaskOutcome::NoMatch => write!(f, "no match"),
            TaskOutcome::Missing => write!(f, "missing"),
            TaskOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of a task together with the key it ran for.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport<K> {
    pub key: K,
    pub outcome: TaskOutcome,
}

impl<K> TaskReport<K> {
    fn new(key: K, outcome: TaskOutcome) -> Self {
        Self { key, outcome }
    }
}

/// Result of running any queued task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Ip(TaskReport<String>),
    Address(TaskReport<i32>),
    Scan { enqueued: usize },
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResult::Ip(report) => write!(f, "ip {}: {}", report.key, report.outcome),
            TaskResult::Address(report) => {
                write!(f, "address {}: {}", report.key, report.outcome)
            }
            TaskResult::Scan { enqueued } => write!(f, "scan enqueued {} backfills", enqueued),
        }
    }
}

/// Totals for a bulk range geolocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSummary {
    pub attempted: u64,
    pub enriched: u64,
    pub unresolved: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RangeSummary {
    fn record(&mut self, outcome: &TaskOutcome) {
        self.attempted += 1;
        match outcome {
            TaskOutcome::Enriched => self.enriched += 1,
            TaskOutcome::Unresolved => self.unresolved += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            _ => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Budget for each external call (lookup or store).
    pub call_timeout: Duration,
    /// Most addresses one scan may enqueue.
    pub scan_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            scan_batch_size: 1000,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            call_timeout: config.task_timeout(),
            scan_batch_size: config.scan_batch_size,
        }
    }
}

type ZipCacheKey = (String, String);

pub struct EnrichmentPipeline {
    store: Arc<dyn RecordStore>,
    geo: Arc<dyn GeoLookupService>,
    places: Arc<dyn ReverseGeocodeService>,
    // (city, region) -> reference row. Misses are not cached so rows loaded later are found.
    zip_cache: Cache<ZipCacheKey, ZipCode>,
    settings: PipelineSettings,
}

impl EnrichmentPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        geo: Arc<dyn GeoLookupService>,
        places: Arc<dyn ReverseGeocodeService>,
        settings: PipelineSettings,
    ) -> Self {
        let zip_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            store,
            geo,
            places,
            zip_cache,
            settings,
        }
    }

    /// Runs `call` under the per-call timeout.
    async fn timed<T, F>(&self, what: &str, call: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "{} exceeded {:?}",
                what, self.settings.call_timeout
            ))),
        }
    }

    /// Loads an address, logging read failures.
    async fn load_address(&self, address_id: i32) -> Result<Address, TaskOutcome> {
        match self
            .timed("loading address", self.store.get_address(address_id))
            .await
        {
            Ok(Some(address)) => Ok(address),
            Ok(None) => {
                tracing::warn!(address_id, outcome = "missing", "Address not found");
                Err(TaskOutcome::Missing)
            }
            Err(e) => {
                log_store_call_failure(address_id, "Failed to load address", &e);
                Err(TaskOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Resolves an IP to a location and stores it.
    ///
    /// An IP that already has a row is skipped without a lookup. When the
    /// lookup finds nothing, fails or times out, a sentinel row is stored so
    /// the attempt is recorded.
    pub async fn geolocate_ip(&self, ip: &str) -> TaskReport<String> {
        let ip = ip.trim();
        if ip.is_empty() {
            tracing::warn!(outcome = "failed", "Refusing to geolocate an empty IP");
            return TaskReport::new(
                String::new(),
                TaskOutcome::Failed("empty IP address".to_string()),
            );
        }
        let report = |outcome| TaskReport::new(ip.to_string(), outcome);

        match self
            .timed("checking ip address", self.store.find_ip_address(ip))
            .await
        {
            Ok(Some(_)) => {
                tracing::info!(ip, outcome = "skipped", "IP address already geolocated");
                return report(TaskOutcome::Skipped);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(severity = "critical", ip, "Failed to check IP address: {}", e);
                return report(TaskOutcome::Failed(e.to_string()));
            }
        }

        let lookup = tokio::time::timeout(self.settings.call_timeout, self.geo.lookup(ip)).await;
        let now = Utc::now();
        let (row, outcome) = match lookup {
            Ok(GeoLookupOutcome::Found(location)) => (
                NewIpAddress::from_location(ip, &location, now),
                TaskOutcome::Enriched,
            ),
            Ok(GeoLookupOutcome::NotFound) => {
                tracing::info!(ip, "IP address not in GeoIP database");
                (NewIpAddress::unknown(ip, now), TaskOutcome::Unresolved)
            }
            Ok(GeoLookupOutcome::Failed(reason)) => {
                tracing::warn!(ip, "GeoIP lookup failed: {}", reason);
                (NewIpAddress::unknown(ip, now), TaskOutcome::Unresolved)
            }
            Err(_) => {
                tracing::warn!(
                    ip,
                    "GeoIP lookup exceeded {:?}",
                    self.settings.call_timeout
                );
                (NewIpAddress::unknown(ip, now), TaskOutcome::Unresolved)
            }
        };

        match self
            .timed("saving ip address", self.store.save_ip_address(&row))
            .await
        {
            Ok(id) => {
                tracing::info!(ip, id, outcome = %outcome, city = %row.city, "IP address stored");
                report(outcome)
            }
            Err(AppError::Conflict(_)) => {
                tracing::info!(ip, outcome = "skipped", "IP address stored concurrently");
                report(TaskOutcome::Skipped)
            }
            Err(e) => {
                tracing::error!(severity = "critical", ip, "Failed to store IP address: {}", e);
                report(TaskOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Fills an address's blank city, county and state from its coordinates.
    ///
    /// Complete addresses are skipped before the geocoder is called. Only the
    /// best match is used and populated fields are never overwritten.
    pub async fn reverse_geocode_address(&self, address_id: i32) -> TaskReport<i32> {
        let report = |outcome| TaskReport::new(address_id, outcome);

        let address = match self.load_address(address_id).await {
            Ok(address) => address,
            Err(outcome) => return report(outcome),
        };

        if address.has_locality() {
            tracing::info!(address_id, outcome = "skipped", "Address locality already complete");
            return report(TaskOutcome::Skipped);
        }

        let Some((lat, lon)) = address.coordinates() else {
            tracing::warn!(address_id, outcome = "skipped", "Address has no coordinates");
            return report(TaskOutcome::Skipped);
        };

        let places = match self
            .timed("reverse geocoding", self.places.search(lat, lon))
            .await
        {
            Ok(places) => places,
            Err(e) => {
                tracing::warn!(address_id, lat, lon, "Reverse geocoding failed: {}", e);
                return report(TaskOutcome::Failed(e.to_string()));
            }
        };

        let Some(place) = places.first() else {
            tracing::info!(address_id, lat, lon, outcome = "no match", "No place near coordinates");
            return report(TaskOutcome::NoMatch);
        };

        let mut updated = address;
        if !updated.fill_locality(place) {
            tracing::info!(address_id, outcome = "no match", "Best match adds nothing new");
            return report(TaskOutcome::NoMatch);
        }

        match self
            .timed("saving address", self.store.save_address(&updated))
            .await
        {
            Ok(()) => {
                tracing::info!(
                    address_id,
                    outcome = "enriched",
                    city = %updated.city,
                    county = updated.district.as_deref().unwrap_or_default(),
                    state = updated.region.as_deref().unwrap_or_default(),
                    country = %place.cc,
                    "✓ Address reverse geocoded"
                );
                report(TaskOutcome::Enriched)
            }
            Err(e) => {
                log_store_call_failure(address_id, "Failed to save reverse geocoded address", &e);
                report(TaskOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn lookup_zip_code(&self, city: &str, region: &str) -> Result<Option<ZipCode>, AppError> {
        let key = (city.to_string(), region.to_string());
        if let Some(cached) = self.zip_cache.get(&key).await {
            return Ok(Some(cached));
        }

        let found = self
            .timed("looking up zip code", self.store.find_zip_code(city, region))
            .await?;
        if let Some(ref zip) = found {
            self.zip_cache.insert(key, zip.clone()).await;
        }
        Ok(found)
    }

    /// Sets an address's postcode from the zip-code reference table.
    ///
    /// The address is marked processed whether or not a postcode was found,
    /// so unresolvable rows drop out of later scans. A failed write leaves it
    /// unprocessed for the next scan to retry.
    pub async fn backfill_zip_code(&self, address_id: i32) -> TaskReport<i32> {
        let report = |outcome| TaskReport::new(address_id, outcome);

        let address = match self.load_address(address_id).await {
            Ok(address) => address,
            Err(outcome) => return report(outcome),
        };

        if !address.needs_postcode() {
            tracing::info!(address_id, outcome = "skipped", "Address postcode already resolved");
            return report(TaskOutcome::Skipped);
        }

        let region = address.region.clone().unwrap_or_default();
        let zip = match self.lookup_zip_code(&address.city, &region).await {
            Ok(zip) => zip,
            Err(e) => {
                log_store_call_failure(address_id, "Zip code lookup failed", &e);
                return report(TaskOutcome::Failed(e.to_string()));
            }
        };

        let mut updated = address;
        updated.processed = true;
        let outcome = match zip {
            Some(ref zip) => {
                updated.postcode = zip.postal_code.clone();
                TaskOutcome::Enriched
            }
            None => TaskOutcome::Unresolved,
        };

        match self
            .timed("saving address", self.store.save_address(&updated))
            .await
        {
            Ok(()) => {
                match outcome {
                    TaskOutcome::Enriched => tracing::info!(
                        address_id,
                        outcome = "enriched",
                        postcode = %updated.postcode,
                        "✓ Zip code backfilled"
                    ),
                    _ => tracing::info!(
                        address_id,
                        outcome = "unresolved",
                        city = %updated.city,
                        region = %region,
                        "No zip code for city and region"
                    ),
                }
                report(outcome)
            }
            Err(e) => {
                log_store_call_failure(address_id, "Failed to save backfilled address", &e);
                report(TaskOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Enqueues a postcode backfill for each incomplete address, up to the batch size.
    ///
    /// # Returns
    ///
    /// The number of tasks enqueued; 0 when the store could not be read.
    pub async fn scan_incomplete_addresses(&self, queue: &dyn TaskQueue) -> usize {
        let limit = self.settings.scan_batch_size;
        let addresses = match self
            .timed(
                "listing incomplete addresses",
                self.store.list_incomplete_addresses(limit),
            )
            .await
        {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::error!(severity = "critical", "Scan failed to list addresses: {}", e);
                return 0;
            }
        };

        let mut enqueued = 0;
        for address in addresses.iter().take(limit) {
            match queue.enqueue(Task::BackfillZipCode {
                address_id: address.id,
            }) {
                Ok(_) => enqueued += 1,
                Err(e) => tracing::warn!(
                    address_id = address.id,
                    "Failed to enqueue zip code backfill: {}",
                    e
                ),
            }
        }

        tracing::info!(
            found = addresses.len(),
            enqueued,
            "Scan enqueued zip code backfills"
        );
        enqueued
    }

    /// Geolocates every IPv4 address from `start` to `end` inclusive.
    ///
    /// Lookups are spaced by `limiter`. Individual failures are counted and
    /// the run continues.
    pub async fn geolocate_range(
        &self,
        start: Ipv4Addr,
        end: Ipv4Addr,
        limiter: &RateLimiter,
    ) -> Result<RangeSummary, AppError> {
        let (first, last) = (u32::from(start), u32::from(end));
        if first > last {
            return Err(AppError::BadRequest(format!(
                "range start {} is after end {}",
                start, end
            )));
        }

        tracing::info!(
            "Geolocating {} addresses from {} to {} ({:?} apart)",
            u64::from(last - first) + 1,
            start,
            end,
            limiter.min_interval()
        );

        let mut summary = RangeSummary::default();
        for raw in first..=last {
            limiter.wait().await;
            let ip = Ipv4Addr::from(raw).to_string();
            let report = self.geolocate_ip(&ip).await;
            summary.record(&report.outcome);
        }

        tracing::info!(
            attempted = summary.attempted,
            enriched = summary.enriched,
            unresolved = summary.unresolved,
            skipped = summary.skipped,
            failed = summary.failed,
            "Range geolocation finished"
        );
        Ok(summary)
    }

    /// Runs one queued task. Scans enqueue their follow-up work on `queue`.
    pub async fn execute(&self, task: Task, queue: &dyn TaskQueue) -> TaskResult {
        match task {
            Task::GeolocateIp { ip } => TaskResult::Ip(self.geolocate_ip(&ip).await),
            Task::ReverseGeocodeAddress { address_id } => {
                TaskResult::Address(self.reverse_geocode_address(address_id).await)
            }
            Task::BackfillZipCode { address_id } => {
                TaskResult::Address(self.backfill_zip_code(address_id).await)
            }
            Task::ScanIncompleteAddresses => TaskResult::Scan {
                enqueued: self.scan_incomplete_addresses(queue).await,
            },
        }
    }
}

/// Database errors are critical; a store call that only ran out of time is a warning.
fn log_store_call_failure(address_id: i32, what: &str, error: &AppError) {
    if error.is_store_failure() {
        tracing::error!(severity = "critical", address_id, "{}: {}", what, error);
    } else {
        tracing::warn!(address_id, "{}: {}", what, error);
    }
}
