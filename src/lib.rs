//! Prospector Enrichment Service Library
//!
//! Stores companies, users, persons, IP addresses and postal addresses, and
//! runs a background pipeline that enriches IP addresses and addresses with
//! geolocation data.
//!
//! # Modules
//!
//! - `api`: HTTP-facing components.
//! - `core`: Enrichment pipeline, models and errors.
//! - `integrations`: Lookup service adapters.
//! - `circuit_breaker`: Circuit breaker for HTTP lookups.
//! - `config`: Configuration management.
//! - `db`: Database connection, pool and migrations.
//! - `db_storage`: `RecordStore` trait and the Postgres implementation.
//! - `memory_storage`: In-process `RecordStore`.
//! - `enrichment`: Enrichment tasks.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `rate_limiter`: Fixed-interval throttle for bulk lookups.
//! - `router`: Route table and middleware stack.
//! - `scheduler`: Periodic scan timer.
//! - `services`: GeoIP and reverse geocoding services.
//! - `task_queue`: Task dispatch and the worker pool.

pub mod api;
pub mod core;
pub mod integrations;

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod enrichment;
pub mod errors;
pub mod handlers;
pub mod memory_storage;
pub mod models;
pub mod rate_limiter;
pub mod router;
pub mod scheduler;
pub mod services;
pub mod task_queue;
