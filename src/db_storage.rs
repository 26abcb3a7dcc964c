use crate::errors::{AppError, ResultExt};
use crate::models::{Address, IpAddress, NewIpAddress, ZipCode};
use async_trait::async_trait;
use sqlx::PgPool;

/// Persistence operations the enrichment pipeline and the HTTP surface need.
///
/// Every call is a single read or a single write; implementations must not
/// hold locks across calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_address(&self, id: i32) -> Result<Option<Address>, AppError>;

    /// Persists the enrichment columns of `address`.
    ///
    /// Text columns are only filled where the stored value is blank and
    /// `processed` can only go from false to true, so two racing writers
    /// cannot clobber each other's results.
    async fn save_address(&self, address: &Address) -> Result<(), AppError>;

    /// Addresses with an empty postcode that have not been processed, oldest first.
    async fn list_incomplete_addresses(&self, limit: usize) -> Result<Vec<Address>, AppError>;

    async fn find_zip_code(&self, city: &str, region: &str) -> Result<Option<ZipCode>, AppError>;

    async fn find_ip_address(&self, ip: &str) -> Result<Option<IpAddress>, AppError>;

    /// Inserts a new row and returns its id. A duplicate ip yields `AppError::Conflict`.
    async fn save_ip_address(&self, row: &NewIpAddress) -> Result<i32, AppError>;

    /// Most recently created rows first.
    async fn list_ip_addresses(&self, limit: usize) -> Result<Vec<IpAddress>, AppError>;
}

const ADDRESS_COLUMNS: &str =
    "id, lat, lon, number, street, unit, city, district, region, postcode, unique_id, processed";

const IP_COLUMNS: &str = "id, created_date, ip, city, time_zone, longitude, latitude, \
     metro_code, dma_code, area_code, postal_code, region, region_name";

/// Postgres-backed record store.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_address(&self, id: i32) -> Result<Option<Address>, AppError> {
        sqlx::query_as::<_, Address>(&format!(
            "SELECT {} FROM addresses WHERE id = $1",
            ADDRESS_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading address {}", id))
    }

    async fn save_address(&self, address: &Address) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE addresses
            SET city = COALESCE(NULLIF(TRIM(city), ''), $2),
                district = COALESCE(NULLIF(TRIM(district), ''), $3),
                region = COALESCE(NULLIF(TRIM(region), ''), $4),
                postcode = COALESCE(NULLIF(TRIM(postcode), ''), $5),
                processed = processed OR $6
            WHERE id = $1
            "#,
        )
        .bind(address.id)
        .bind(&address.city)
        .bind(&address.district)
        .bind(&address.region)
        .bind(&address.postcode)
        .bind(address.processed)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving address {}", address.id))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("address {}", address.id)));
        }
        Ok(())
    }

    async fn list_incomplete_addresses(&self, limit: usize) -> Result<Vec<Address>, AppError> {
        sqlx::query_as::<_, Address>(&format!(
            "SELECT {} FROM addresses WHERE TRIM(postcode) = '' AND processed = FALSE ORDER BY id LIMIT $1",
            ADDRESS_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing incomplete addresses")
    }

    async fn find_zip_code(&self, city: &str, region: &str) -> Result<Option<ZipCode>, AppError> {
        sqlx::query_as::<_, ZipCode>(
            r#"
            SELECT id, country_code, postal_code, city_name, state, state_abbr, county,
                   latitude, longitude, accuracy
            FROM zipcodes
            WHERE city_name = $1 AND state = $2
            ORDER BY postal_code
            LIMIT 1
            "#,
        )
        .bind(city)
        .bind(region)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("looking up zip code for {}, {}", city, region))
    }

    async fn find_ip_address(&self, ip: &str) -> Result<Option<IpAddress>, AppError> {
        sqlx::query_as::<_, IpAddress>(&format!(
            "SELECT {} FROM ipaddress WHERE ip = $1",
            IP_COLUMNS
        ))
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading ip address {}", ip))
    }

    async fn save_ip_address(&self, row: &NewIpAddress) -> Result<i32, AppError> {
        let inserted: (i32,) = sqlx::query_as(
            r#"
            INSERT INTO ipaddress (
                created_date, ip, city, time_zone, longitude, latitude,
                metro_code, dma_code, area_code, postal_code, region, region_name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(row.created_date)
        .bind(&row.ip)
        .bind(&row.city)
        .bind(&row.time_zone)
        .bind(row.longitude)
        .bind(row.latitude)
        .bind(&row.metro_code)
        .bind(&row.dma_code)
        .bind(&row.area_code)
        .bind(&row.postal_code)
        .bind(&row.region)
        .bind(&row.region_name)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;

        Ok(inserted.0)
    }

    async fn list_ip_addresses(&self, limit: usize) -> Result<Vec<IpAddress>, AppError> {
        sqlx::query_as::<_, IpAddress>(&format!(
            "SELECT {} FROM ipaddress ORDER BY id DESC LIMIT $1",
            IP_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing ip addresses")
    }
}
