//! Stub lookup services and fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use prospector::enrichment::{EnrichmentPipeline, PipelineSettings};
use prospector::errors::AppError;
use prospector::memory_storage::InMemoryRecordStore;
use prospector::models::{Address, LocationRecord, PlaceMatch, ZipCode};
use prospector::services::{GeoLookupOutcome, GeoLookupService, ReverseGeocodeService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// GeoIP stub answering from a fixed table; unknown IPs are `NotFound`.
#[derive(Default)]
pub struct StubGeo {
    pub answers: HashMap<String, GeoLookupOutcome>,
    pub delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StubGeo {
    pub fn with(ip: &str, outcome: GeoLookupOutcome) -> Self {
        let mut stub = Self::default();
        stub.answers.insert(ip.to_string(), outcome);
        stub
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoLookupService for StubGeo {
    async fn lookup(&self, ip: &str) -> GeoLookupOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answers
            .get(ip)
            .cloned()
            .unwrap_or(GeoLookupOutcome::NotFound)
    }
}

/// Reverse geocoder stub returning the same answer for every coordinate.
pub struct StubPlaces {
    pub answer: Result<Vec<PlaceMatch>, String>,
    pub delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StubPlaces {
    pub fn matching(places: Vec<PlaceMatch>) -> Self {
        Self {
            answer: Ok(places),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseGeocodeService for StubPlaces {
    async fn search(&self, _lat: f64, _lon: f64) -> Result<Vec<PlaceMatch>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer
            .clone()
            .map_err(AppError::ExternalApiError)
    }
}

pub fn new_york_match() -> PlaceMatch {
    PlaceMatch {
        name: "New York".to_string(),
        admin1: "New York".to_string(),
        admin2: "New York County".to_string(),
        cc: "US".to_string(),
    }
}

pub fn miami_location() -> LocationRecord {
    LocationRecord {
        city: "Miami".to_string(),
        time_zone: "America/New_York".to_string(),
        longitude: -80.1918,
        latitude: 25.7617,
        metro_code: Some("528".to_string()),
        dma_code: Some("528".to_string()),
        area_code: None,
        postal_code: Some("33101".to_string()),
        region: "FL".to_string(),
        region_name: "Florida".to_string(),
    }
}

/// Address with coordinates and no enrichment data.
pub fn blank_address(id: i32) -> Address {
    Address {
        id,
        lat: Some(40.7128),
        lon: Some(-74.0060),
        number: 350,
        street: "5th Ave".to_string(),
        unit: None,
        city: String::new(),
        district: None,
        region: None,
        postcode: String::new(),
        unique_id: None,
        processed: false,
    }
}

/// Address whose locality is known but whose postcode is missing.
pub fn located_address(id: i32, city: &str, region: &str) -> Address {
    Address {
        city: city.to_string(),
        district: Some("New York County".to_string()),
        region: Some(region.to_string()),
        ..blank_address(id)
    }
}

pub fn zip(postal_code: &str, city: &str, state: &str) -> ZipCode {
    ZipCode {
        id: 1,
        country_code: "US".to_string(),
        postal_code: postal_code.to_string(),
        city_name: city.to_string(),
        state: state.to_string(),
        state_abbr: "NY".to_string(),
        county: "New York County".to_string(),
        latitude: 40.75,
        longitude: -73.99,
        accuracy: Some(4),
    }
}

pub fn pipeline(
    store: &Arc<InMemoryRecordStore>,
    geo: &Arc<StubGeo>,
    places: &Arc<StubPlaces>,
    settings: PipelineSettings,
) -> EnrichmentPipeline {
    EnrichmentPipeline::new(store.clone(), geo.clone(), places.clone(), settings)
}

/// Pipeline over an empty store with stubs that find nothing.
pub fn default_pipeline(store: &Arc<InMemoryRecordStore>) -> EnrichmentPipeline {
    pipeline(
        store,
        &Arc::new(StubGeo::default()),
        &Arc::new(StubPlaces::matching(Vec::new())),
        PipelineSettings::default(),
    )
}
