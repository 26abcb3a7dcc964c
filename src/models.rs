use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Placeholder written into text columns when a lookup produced nothing.
pub const UNKNOWN: &str = "Unknown";

/// True when an optional text column holds no usable value.
pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

// ============ Database Models ============

/// A postal address waiting on, or carrying, enrichment data.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Address {
    /// Primary key.
    pub id: i32,
    /// Latitude in decimal degrees.
    pub lat: Option<f64>,
    /// Longitude in decimal degrees.
    pub lon: Option<f64>,
    /// Street number.
    pub number: i32,
    pub street: String,
    pub unit: Option<String>,
    /// Locality name; empty until geocoded.
    pub city: String,
    /// County or equivalent second-level division.
    pub district: Option<String>,
    /// State or equivalent first-level division.
    pub region: Option<String>,
    /// Postal code; empty until backfilled.
    pub postcode: String,
    pub unique_id: Option<String>,
    /// Set once a postcode backfill has run to a terminal state.
    pub processed: bool,
}

impl Address {
    /// Coordinates as a `(lat, lon)` pair, when both are present.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// City, district and region are all filled in.
    pub fn has_locality(&self) -> bool {
        !is_blank(Some(self.city.as_str()))
            && !is_blank(self.district.as_deref())
            && !is_blank(self.region.as_deref())
    }

    /// Still eligible for the postcode backfill.
    pub fn needs_postcode(&self) -> bool {
        self.postcode.trim().is_empty() && !self.processed
    }

    /// Copies the match's names into whichever locality fields are blank.
    ///
    /// Returns true when at least one field changed. Populated fields are
    /// never overwritten and blank values from the match are ignored.
    pub fn fill_locality(&mut self, place: &PlaceMatch) -> bool {
        let mut changed = false;

        if is_blank(Some(self.city.as_str())) && !is_blank(Some(place.name.as_str())) {
            self.city = place.name.clone();
            changed = true;
        }
        if is_blank(self.district.as_deref()) && !is_blank(Some(place.admin2.as_str())) {
            self.district = Some(place.admin2.clone());
            changed = true;
        }
        if is_blank(self.region.as_deref()) && !is_blank(Some(place.admin1.as_str())) {
            self.region = Some(place.admin1.clone());
            changed = true;
        }

        changed
    }
}

/// A geolocated IP address.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: i32,
    pub created_date: DateTime<Utc>,
    pub ip: String,
    pub city: String,
    pub time_zone: String,
    pub longitude: f64,
    pub latitude: f64,
    pub metro_code: Option<String>,
    pub dma_code: Option<String>,
    pub area_code: Option<String>,
    pub postal_code: Option<String>,
    /// Region code, e.g. "FL".
    pub region: String,
    /// Region display name, e.g. "Florida".
    pub region_name: String,
}

/// An IP address row that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIpAddress {
    pub created_date: DateTime<Utc>,
    pub ip: String,
    pub city: String,
    pub time_zone: String,
    pub longitude: f64,
    pub latitude: f64,
    pub metro_code: Option<String>,
    pub dma_code: Option<String>,
    pub area_code: Option<String>,
    pub postal_code: Option<String>,
    pub region: String,
    pub region_name: String,
}

impl NewIpAddress {
    /// Row built from a successful GeoIP lookup.
    pub fn from_location(ip: &str, location: &LocationRecord, now: DateTime<Utc>) -> Self {
        Self {
            created_date: now,
            ip: ip.to_string(),
            city: location.city.clone(),
            time_zone: location.time_zone.clone(),
            longitude: location.longitude,
            latitude: location.latitude,
            metro_code: location.metro_code.clone(),
            dma_code: location.dma_code.clone(),
            area_code: location.area_code.clone(),
            postal_code: location.postal_code.clone(),
            region: location.region.clone(),
            region_name: location.region_name.clone(),
        }
    }

    /// Sentinel row recording a lookup attempt that found nothing.
    pub fn unknown(ip: &str, now: DateTime<Utc>) -> Self {
        Self {
            created_date: now,
            ip: ip.to_string(),
            city: UNKNOWN.to_string(),
            time_zone: UNKNOWN.to_string(),
            longitude: 0.0,
            latitude: 0.0,
            metro_code: None,
            dma_code: None,
            area_code: None,
            postal_code: None,
            region: UNKNOWN.to_string(),
            region_name: UNKNOWN.to_string(),
        }
    }

    pub fn into_ip_address(self, id: i32) -> IpAddress {
        IpAddress {
            id,
            created_date: self.created_date,
            ip: self.ip,
            city: self.city,
            time_zone: self.time_zone,
            longitude: self.longitude,
            latitude: self.latitude,
            metro_code: self.metro_code,
            dma_code: self.dma_code,
            area_code: self.area_code,
            postal_code: self.postal_code,
            region: self.region,
            region_name: self.region_name,
        }
    }
}

/// Reference row mapping a city and state to a postal code. Never written by the pipeline.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ZipCode {
    pub id: i32,
    pub country_code: String,
    pub postal_code: String,
    pub city_name: String,
    pub state: String,
    pub state_abbr: String,
    pub county: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<i32>,
}

// ============ Lookup Service Models ============

/// Location data returned by the GeoIP database for one address.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocationRecord {
    pub city: String,
    pub time_zone: String,
    pub longitude: f64,
    pub latitude: f64,
    pub metro_code: Option<String>,
    pub dma_code: Option<String>,
    pub area_code: Option<String>,
    pub postal_code: Option<String>,
    pub region: String,
    pub region_name: String,
}

/// One candidate place from a reverse geocoding search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceMatch {
    /// Place (city) name.
    pub name: String,
    /// First-level administrative division (state).
    pub admin1: String,
    /// Second-level administrative division (county).
    pub admin2: String,
    /// ISO country code.
    pub cc: String,
}

// ============ API Models ============

/// POST /api/v1/ipaddresses body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateIpAddressRequest {
    pub ipaddress: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub latitude: f64,
    pub metro_code: Option<String>,
    pub dma_code: Option<String>,
    #[serde(alias = "area-code")]
    pub area_code: Option<String>,
    pub postal_code: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub region_name: String,
}

impl CreateIpAddressRequest {
    pub fn into_new_ip_address(self, now: DateTime<Utc>) -> NewIpAddress {
        NewIpAddress {
            created_date: now,
            ip: self.ipaddress,
            city: self.city,
            time_zone: self.time_zone,
            longitude: self.longitude,
            latitude: self.latitude,
            metro_code: self.metro_code,
            dma_code: self.dma_code,
            area_code: self.area_code,
            postal_code: self.postal_code,
            region: self.region,
            region_name: self.region_name,
        }
    }
}

/// Response for endpoints that enqueue a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAccepted {
    pub task_id: uuid::Uuid,
    pub task: &'static str,
}
