//! In-process record store.
//!
//! Mirrors the write semantics of `PgRecordStore` (fill blanks only, `processed`
//! never reset) so pipeline behaviour can be exercised without Postgres.
//! Failure switches let tests simulate an unavailable store.

use crate::db_storage::RecordStore;
use crate::errors::AppError;
use crate::models::{is_blank, Address, IpAddress, NewIpAddress, ZipCode};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    addresses: BTreeMap<i32, Address>,
    zip_codes: Vec<ZipCode>,
    ip_addresses: BTreeMap<i32, IpAddress>,
    next_ip_id: i32,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
    fail_reads: AtomicBool,
    fail_address_writes: AtomicBool,
    fail_zip_lookups: AtomicBool,
    address_writes: AtomicUsize,
    zip_lookups: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_address(&self, address: Address) {
        self.tables
            .lock()
            .await
            .addresses
            .insert(address.id, address);
    }

    pub async fn insert_zip_code(&self, zip: ZipCode) {
        self.tables.lock().await.zip_codes.push(zip);
    }

    /// Current stored copy of an address, bypassing failure switches.
    pub async fn address(&self, id: i32) -> Option<Address> {
        self.tables.lock().await.addresses.get(&id).cloned()
    }

    pub async fn ip_address_count(&self) -> usize {
        self.tables.lock().await.ip_addresses.len()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_address_writes(&self, fail: bool) {
        self.fail_address_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_zip_lookups(&self, fail: bool) {
        self.fail_zip_lookups.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save_address` calls.
    pub fn address_writes(&self) -> usize {
        self.address_writes.load(Ordering::SeqCst)
    }

    /// Number of `find_zip_code` calls that reached the table.
    pub fn zip_lookups(&self) -> usize {
        self.zip_lookups.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), AppError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn fill(stored: &mut String, incoming: &str) {
    if is_blank(Some(stored.as_str())) && !is_blank(Some(incoming)) {
        *stored = incoming.to_string();
    }
}

fn fill_optional(stored: &mut Option<String>, incoming: &Option<String>) {
    if is_blank(stored.as_deref()) && !is_blank(incoming.as_deref()) {
        stored.clone_from(incoming);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_address(&self, id: i32) -> Result<Option<Address>, AppError> {
        self.check_reads()?;
        Ok(self.tables.lock().await.addresses.get(&id).cloned())
    }

    async fn save_address(&self, address: &Address) -> Result<(), AppError> {
        if self.fail_address_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolClosed));
        }

        let mut tables = self.tables.lock().await;
        let stored = tables
            .addresses
            .get_mut(&address.id)
            .ok_or_else(|| AppError::NotFound(format!("address {}", address.id)))?;

        fill(&mut stored.city, &address.city);
        fill_optional(&mut stored.district, &address.district);
        fill_optional(&mut stored.region, &address.region);
        fill(&mut stored.postcode, &address.postcode);
        stored.processed |= address.processed;

        self.address_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_incomplete_addresses(&self, limit: usize) -> Result<Vec<Address>, AppError> {
        self.check_reads()?;
        Ok(self
            .tables
            .lock()
            .await
            .addresses
            .values()
            .filter(|a| a.needs_postcode())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_zip_code(&self, city: &str, region: &str) -> Result<Option<ZipCode>, AppError> {
        self.check_reads()?;
        if self.fail_zip_lookups.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        self.zip_lookups.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.lock().await;
        let mut matches: Vec<&ZipCode> = tables
            .zip_codes
            .iter()
            .filter(|z| z.city_name == city && z.state == region)
            .collect();
        matches.sort_by(|a, b| a.postal_code.cmp(&b.postal_code));
        Ok(matches.first().map(|z| (*z).clone()))
    }

    async fn find_ip_address(&self, ip: &str) -> Result<Option<IpAddress>, AppError> {
        self.check_reads()?;
        Ok(self
            .tables
            .lock()
            .await
            .ip_addresses
            .values()
            .find(|row| row.ip == ip)
            .cloned())
    }

    async fn save_ip_address(&self, row: &NewIpAddress) -> Result<i32, AppError> {
        let mut tables = self.tables.lock().await;
        if tables.ip_addresses.values().any(|r| r.ip == row.ip) {
            return Err(AppError::Conflict(format!(
                "duplicate key value violates unique constraint \"ipaddress_ip_idx\" ({})",
                row.ip
            )));
        }

        tables.next_ip_id += 1;
        let id = tables.next_ip_id;
        tables
            .ip_addresses
            .insert(id, row.clone().into_ip_address(id));
        Ok(id)
    }

    async fn list_ip_addresses(&self, limit: usize) -> Result<Vec<IpAddress>, AppError> {
        self.check_reads()?;
        Ok(self
            .tables
            .lock()
            .await
            .ip_addresses
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
