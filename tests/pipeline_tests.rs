/// Scenario tests for the enrichment tasks over the in-memory store
mod common;

use common::*;
use prospector::db_storage::RecordStore;
use prospector::enrichment::{PipelineSettings, RangeSummary, TaskOutcome};
use prospector::memory_storage::InMemoryRecordStore;
use prospector::models::UNKNOWN;
use prospector::rate_limiter::RateLimiter;
use prospector::services::GeoLookupOutcome;
use prospector::task_queue::{LocalTaskQueue, RecordingQueue, Task, TaskQueue};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

// ============ ReverseGeocodeAddress ============

#[tokio::test]
async fn reverse_geocode_fills_new_york_locality() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = blank_address(42);
    address.lat = Some(40.7);
    address.lon = Some(-74.0);
    address.region = Some(String::new());
    store.insert_address(address).await;
    let places = Arc::new(StubPlaces::matching(vec![new_york_match()]));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    let report = pipeline.reverse_geocode_address(42).await;

    assert_eq!(report.key, 42);
    assert_eq!(report.outcome, TaskOutcome::Enriched);
    let stored = store.address(42).await.unwrap();
    assert_eq!(stored.city, "New York");
    assert_eq!(stored.district.as_deref(), Some("New York County"));
    assert_eq!(stored.region.as_deref(), Some("New York"));
    assert!(stored.postcode.is_empty());
    assert!(!stored.processed);
}

#[tokio::test]
async fn reverse_geocode_skips_complete_address_without_lookup() {
    let store = Arc::new(InMemoryRecordStore::new());
    let complete = located_address(42, "New York", "New York");
    store.insert_address(complete.clone()).await;
    let places = Arc::new(StubPlaces::matching(vec![new_york_match()]));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    let report = pipeline.reverse_geocode_address(42).await;

    assert_eq!(report.outcome, TaskOutcome::Skipped);
    assert_eq!(places.calls(), 0);
    assert_eq!(store.address_writes(), 0);
    assert_eq!(store.address(42).await.unwrap(), complete);
}

#[tokio::test]
async fn reverse_geocode_keeps_populated_fields() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = blank_address(7);
    address.city = "Manhattan".to_string();
    store.insert_address(address).await;
    let places = Arc::new(StubPlaces::matching(vec![new_york_match()]));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    assert_eq!(
        pipeline.reverse_geocode_address(7).await.outcome,
        TaskOutcome::Enriched
    );

    let stored = store.address(7).await.unwrap();
    assert_eq!(stored.city, "Manhattan");
    assert_eq!(stored.region.as_deref(), Some("New York"));
}

#[tokio::test]
async fn reverse_geocode_uses_best_match_only() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.insert_address(blank_address(1)).await;
    let newark = prospector::models::PlaceMatch {
        name: "Newark".to_string(),
        admin1: "New Jersey".to_string(),
        admin2: "Essex County".to_string(),
        cc: "US".to_string(),
    };
    let places = Arc::new(StubPlaces::matching(vec![new_york_match(), newark]));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    pipeline.reverse_geocode_address(1).await;

    assert_eq!(store.address(1).await.unwrap().city, "New York");
}

#[tokio::test]
async fn reverse_geocode_without_match_changes_nothing() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.insert_address(blank_address(3)).await;
    let pipeline = default_pipeline(&store);

    let report = pipeline.reverse_geocode_address(3).await;

    assert_eq!(report.outcome, TaskOutcome::NoMatch);
    assert_eq!(store.address_writes(), 0);
    assert_eq!(store.address(3).await.unwrap(), blank_address(3));
}

#[tokio::test]
async fn reverse_geocode_failure_leaves_address_untouched() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.insert_address(blank_address(4)).await;
    let places = Arc::new(StubPlaces::failing("geocoder unavailable"));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    let report = pipeline.reverse_geocode_address(4).await;

    assert!(matches!(report.outcome, TaskOutcome::Failed(ref msg) if msg.contains("geocoder unavailable")));
    assert_eq!(store.address(4).await.unwrap(), blank_address(4));
}

#[tokio::test(start_paused = true)]
async fn reverse_geocode_times_out_slow_geocoder() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.insert_address(blank_address(5)).await;
    let mut slow = StubPlaces::matching(vec![new_york_match()]);
    slow.delay = Some(Duration::from_secs(3600));
    let settings = PipelineSettings {
        call_timeout: Duration::from_secs(2),
        ..PipelineSettings::default()
    };
    let pipeline = pipeline(&store, &Arc::new(StubGeo::default()), &Arc::new(slow), settings);

    let report = pipeline.reverse_geocode_address(5).await;

    assert!(matches!(report.outcome, TaskOutcome::Failed(ref msg) if msg.contains("Timed out")));
    assert_eq!(store.address(5).await.unwrap(), blank_address(5));
}

#[tokio::test]
async fn reverse_geocode_without_coordinates_is_skipped() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = blank_address(6);
    address.lat = None;
    store.insert_address(address).await;
    let places = Arc::new(StubPlaces::matching(vec![new_york_match()]));
    let pipeline = pipeline(
        &store,
        &Arc::new(StubGeo::default()),
        &places,
        PipelineSettings::default(),
    );

    assert_eq!(
        pipeline.reverse_geocode_address(6).await.outcome,
        TaskOutcome::Skipped
    );
    assert_eq!(places.calls(), 0);
}

#[tokio::test]
async fn reverse_geocode_unknown_address_is_missing() {
    let store = Arc::new(InMemoryRecordStore::new());
    let pipeline = default_pipeline(&store);

    assert_eq!(
        pipeline.reverse_geocode_address(999).await.outcome,
        TaskOutcome::Missing
    );
}

// ============ BackfillZipCode ============

#[tokio::test]
async fn backfill_sets_new_york_postcode() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(42, "New York", "New York"))
        .await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);

    let report = pipeline.backfill_zip_code(42).await;

    assert_eq!(report.key, 42);
    assert_eq!(report.outcome, TaskOutcome::Enriched);
    let stored = store.address(42).await.unwrap();
    assert_eq!(stored.postcode, "10001");
    assert!(stored.processed);
}

#[tokio::test]
async fn unresolvable_backfill_is_processed_and_not_rescanned() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(42, "Atlantis", "Nowhere"))
        .await;
    let pipeline = default_pipeline(&store);

    let report = pipeline.backfill_zip_code(42).await;

    assert_eq!(report.outcome, TaskOutcome::Unresolved);
    let stored = store.address(42).await.unwrap();
    assert!(stored.processed);
    assert!(stored.postcode.is_empty());

    let queue = RecordingQueue::new();
    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn backfill_skips_address_with_postcode() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = located_address(8, "New York", "New York");
    address.postcode = "10002".to_string();
    store.insert_address(address).await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);

    assert_eq!(pipeline.backfill_zip_code(8).await.outcome, TaskOutcome::Skipped);
    assert_eq!(store.zip_lookups(), 0);
    assert_eq!(store.address(8).await.unwrap().postcode, "10002");
}

#[tokio::test]
async fn backfill_skips_processed_address() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = located_address(9, "New York", "New York");
    address.processed = true;
    store.insert_address(address).await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);

    assert_eq!(pipeline.backfill_zip_code(9).await.outcome, TaskOutcome::Skipped);
    assert_eq!(store.zip_lookups(), 0);
    assert!(store.address(9).await.unwrap().postcode.is_empty());
}

#[tokio::test]
async fn failed_backfill_write_leaves_address_for_next_scan() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(10, "New York", "New York"))
        .await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    store.set_fail_address_writes(true);
    let pipeline = default_pipeline(&store);

    let report = pipeline.backfill_zip_code(10).await;

    assert_eq!(report.key, 10);
    assert!(matches!(report.outcome, TaskOutcome::Failed(_)));
    assert!(!store.address(10).await.unwrap().processed);

    store.set_fail_address_writes(false);
    let queue = RecordingQueue::new();
    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 1);
    assert_eq!(queue.tasks(), vec![Task::BackfillZipCode { address_id: 10 }]);
}

#[tokio::test]
async fn backfill_read_failure_is_reported() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(11, "New York", "New York"))
        .await;
    store.set_fail_reads(true);
    let pipeline = default_pipeline(&store);

    let report = pipeline.backfill_zip_code(11).await;

    assert_eq!(report.key, 11);
    assert!(matches!(report.outcome, TaskOutcome::Failed(_)));
    assert_eq!(store.address_writes(), 0);
}

#[tokio::test]
async fn backfill_reference_failure_leaves_address_unprocessed() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(12, "New York", "New York"))
        .await;
    store.set_fail_zip_lookups(true);
    let pipeline = default_pipeline(&store);

    assert!(matches!(
        pipeline.backfill_zip_code(12).await.outcome,
        TaskOutcome::Failed(_)
    ));
    assert!(!store.address(12).await.unwrap().processed);
}

#[tokio::test]
async fn zip_lookups_are_cached_per_city_and_region() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=3 {
        store
            .insert_address(located_address(id, "New York", "New York"))
            .await;
    }
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);

    for id in 1..=3 {
        assert_eq!(pipeline.backfill_zip_code(id).await.outcome, TaskOutcome::Enriched);
    }

    assert_eq!(store.zip_lookups(), 1);
}

#[tokio::test]
async fn zip_code_misses_are_retried_against_the_reference_table() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=2 {
        store
            .insert_address(located_address(id, "Hoboken", "New Jersey"))
            .await;
    }
    let pipeline = default_pipeline(&store);

    assert_eq!(pipeline.backfill_zip_code(1).await.outcome, TaskOutcome::Unresolved);

    store.insert_zip_code(zip("07030", "Hoboken", "New Jersey")).await;

    assert_eq!(pipeline.backfill_zip_code(2).await.outcome, TaskOutcome::Enriched);
    assert_eq!(store.address(2).await.unwrap().postcode, "07030");
    assert_eq!(store.zip_lookups(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_backfills_of_one_address_agree() {
    let store = Arc::new(InMemoryRecordStore::new());
    store
        .insert_address(located_address(42, "New York", "New York"))
        .await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);

    let (first, second) = tokio::join!(
        pipeline.backfill_zip_code(42),
        pipeline.backfill_zip_code(42)
    );

    for report in [first, second] {
        assert_eq!(report.key, 42);
        assert!(
            matches!(report.outcome, TaskOutcome::Enriched | TaskOutcome::Skipped),
            "unexpected outcome {}",
            report.outcome
        );
    }
    let stored = store.address(42).await.unwrap();
    assert_eq!(stored.postcode, "10001");
    assert!(stored.processed);
}

// ============ ScanIncompleteAddresses ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_scans_leave_every_address_resolved() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=50 {
        store
            .insert_address(located_address(id, "New York", "New York"))
            .await;
    }
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = Arc::new(default_pipeline(&store));
    let queue = Arc::new(RecordingQueue::new());

    let (a, b) = tokio::join!(
        pipeline.scan_incomplete_addresses(queue.as_ref()),
        pipeline.scan_incomplete_addresses(queue.as_ref())
    );
    assert_eq!(a + b, queue.len());
    assert!(a + b >= 50);

    let mut running = tokio::task::JoinSet::new();
    for task in queue.tasks() {
        let pipeline = Arc::clone(&pipeline);
        let queue = Arc::clone(&queue);
        running.spawn(async move { pipeline.execute(task, queue.as_ref()).await });
    }
    while let Some(result) = running.join_next().await {
        match result.unwrap() {
            prospector::enrichment::TaskResult::Address(report) => assert!(
                matches!(report.outcome, TaskOutcome::Enriched | TaskOutcome::Skipped),
                "address {} ended {}",
                report.key,
                report.outcome
            ),
            other => panic!("unexpected task result {}", other),
        }
    }

    for id in 1..=50 {
        let stored = store.address(id).await.unwrap();
        assert_eq!(stored.postcode, "10001");
        assert!(stored.processed);
    }
    queue.clear();
    assert_eq!(pipeline.scan_incomplete_addresses(queue.as_ref()).await, 0);
}

#[tokio::test]
async fn scan_treats_whitespace_postcode_as_missing() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut address = located_address(21, "New York", "New York");
    address.postcode = "   ".to_string();
    store.insert_address(address).await;
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = default_pipeline(&store);
    let queue = RecordingQueue::new();

    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 1);
    assert_eq!(queue.tasks(), vec![Task::BackfillZipCode { address_id: 21 }]);

    assert_eq!(pipeline.backfill_zip_code(21).await.outcome, TaskOutcome::Enriched);
    assert_eq!(store.address(21).await.unwrap().postcode, "10001");
}

#[tokio::test]
async fn scan_is_bounded_by_batch_size() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=1500 {
        store.insert_address(blank_address(id)).await;
    }
    let pipeline = default_pipeline(&store);
    let queue = RecordingQueue::new();

    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 1000);
    assert_eq!(queue.len(), 1000);

    // Work the first batch off; no zip codes exist so each one ends processed.
    for task in queue.tasks() {
        pipeline.execute(task, &queue).await;
    }
    queue.clear();

    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 500);
    assert_eq!(queue.len(), 500);
}

#[tokio::test]
async fn scan_with_store_failure_enqueues_nothing() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.insert_address(blank_address(1)).await;
    store.set_fail_reads(true);
    let pipeline = default_pipeline(&store);
    let queue = RecordingQueue::new();

    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn scan_continues_past_enqueue_failures() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=3 {
        store.insert_address(blank_address(id)).await;
    }
    let pipeline = default_pipeline(&store);
    let queue = RecordingQueue::new();
    queue.reject_address(2);

    assert_eq!(pipeline.scan_incomplete_addresses(&queue).await, 2);
    assert_eq!(
        queue.tasks(),
        vec![
            Task::BackfillZipCode { address_id: 1 },
            Task::BackfillZipCode { address_id: 3 },
        ]
    );
}

// ============ GeolocateIp ============

#[tokio::test]
async fn geolocate_stores_found_location_once() {
    let store = Arc::new(InMemoryRecordStore::new());
    let geo = Arc::new(StubGeo::with(
        "8.8.8.8",
        GeoLookupOutcome::Found(miami_location()),
    ));
    let pipeline = pipeline(
        &store,
        &geo,
        &Arc::new(StubPlaces::matching(Vec::new())),
        PipelineSettings::default(),
    );

    assert_eq!(pipeline.geolocate_ip("8.8.8.8").await.outcome, TaskOutcome::Enriched);
    assert_eq!(pipeline.geolocate_ip("8.8.8.8").await.outcome, TaskOutcome::Skipped);

    assert_eq!(geo.calls(), 1);
    assert_eq!(store.ip_address_count().await, 1);
    let row = store.find_ip_address("8.8.8.8").await.unwrap().unwrap();
    assert_eq!(row.city, "Miami");
    assert_eq!(row.region, "FL");
    assert_eq!(row.region_name, "Florida");
    assert_eq!(row.postal_code.as_deref(), Some("33101"));
}

#[tokio::test]
async fn geolocate_without_match_stores_one_sentinel_row() {
    let store = Arc::new(InMemoryRecordStore::new());
    let pipeline = default_pipeline(&store);

    let report = pipeline.geolocate_ip("192.0.2.1").await;

    assert_eq!(report.key, "192.0.2.1");
    assert_eq!(report.outcome, TaskOutcome::Unresolved);
    assert_eq!(store.ip_address_count().await, 1);
    let row = store.find_ip_address("192.0.2.1").await.unwrap().unwrap();
    assert_eq!(row.city, UNKNOWN);
    assert_eq!(row.time_zone, UNKNOWN);
    assert_eq!(row.region, UNKNOWN);
    assert_eq!(row.latitude, 0.0);
    assert_eq!(row.longitude, 0.0);
    assert!(row.metro_code.is_none());
    assert!(row.dma_code.is_none());
    assert!(row.postal_code.is_none());
}

#[tokio::test]
async fn geolocate_failure_stores_sentinel_row() {
    let store = Arc::new(InMemoryRecordStore::new());
    let geo = Arc::new(StubGeo::with(
        "203.0.113.9",
        GeoLookupOutcome::Failed("corrupt record".to_string()),
    ));
    let pipeline = pipeline(
        &store,
        &geo,
        &Arc::new(StubPlaces::matching(Vec::new())),
        PipelineSettings::default(),
    );

    assert_eq!(
        pipeline.geolocate_ip("203.0.113.9").await.outcome,
        TaskOutcome::Unresolved
    );
    let row = store.find_ip_address("203.0.113.9").await.unwrap().unwrap();
    assert_eq!(row.city, UNKNOWN);
}

#[tokio::test(start_paused = true)]
async fn geolocate_timeout_stores_sentinel_row() {
    let store = Arc::new(InMemoryRecordStore::new());
    let mut slow = StubGeo::with("8.8.4.4", GeoLookupOutcome::Found(miami_location()));
    slow.delay = Some(Duration::from_secs(3600));
    let settings = PipelineSettings {
        call_timeout: Duration::from_secs(1),
        ..PipelineSettings::default()
    };
    let pipeline = pipeline(
        &store,
        &Arc::new(slow),
        &Arc::new(StubPlaces::matching(Vec::new())),
        settings,
    );

    assert_eq!(
        pipeline.geolocate_ip("8.8.4.4").await.outcome,
        TaskOutcome::Unresolved
    );
    assert_eq!(
        store.find_ip_address("8.8.4.4").await.unwrap().unwrap().city,
        UNKNOWN
    );
}

#[tokio::test]
async fn geolocate_store_failure_is_reported() {
    let store = Arc::new(InMemoryRecordStore::new());
    store.set_fail_reads(true);
    let pipeline = default_pipeline(&store);

    let report = pipeline.geolocate_ip("10.1.1.1").await;

    assert!(matches!(report.outcome, TaskOutcome::Failed(_)));
    assert_eq!(store.ip_address_count().await, 0);
}

// ============ GeolocateRange ============

#[tokio::test(start_paused = true)]
async fn geolocate_range_covers_every_address() {
    let store = Arc::new(InMemoryRecordStore::new());
    let geo = Arc::new(StubGeo::with(
        "10.0.0.2",
        GeoLookupOutcome::Found(miami_location()),
    ));
    let pipeline = pipeline(
        &store,
        &geo,
        &Arc::new(StubPlaces::matching(Vec::new())),
        PipelineSettings::default(),
    );
    let limiter = RateLimiter::new(Duration::from_millis(250));
    let started = tokio::time::Instant::now();

    let summary = pipeline
        .geolocate_range(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 4),
            &limiter,
        )
        .await
        .unwrap();

    assert_eq!(
        summary,
        RangeSummary {
            attempted: 4,
            enriched: 1,
            unresolved: 3,
            skipped: 0,
            failed: 0,
        }
    );
    assert_eq!(store.ip_address_count().await, 4);
    assert!(started.elapsed() >= Duration::from_millis(750));
}

#[tokio::test]
async fn geolocate_range_rejects_reversed_bounds() {
    let store = Arc::new(InMemoryRecordStore::new());
    let pipeline = default_pipeline(&store);
    let limiter = RateLimiter::new(Duration::ZERO);

    let result = pipeline
        .geolocate_range(Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 1), &limiter)
        .await;

    assert!(result.is_err());
    assert_eq!(store.ip_address_count().await, 0);
}

// ============ Worker pool ============

#[tokio::test]
async fn queued_scan_runs_backfills_on_workers() {
    let store = Arc::new(InMemoryRecordStore::new());
    for id in 1..=20 {
        store
            .insert_address(located_address(id, "New York", "New York"))
            .await;
    }
    store.insert_zip_code(zip("10001", "New York", "New York")).await;
    let pipeline = Arc::new(default_pipeline(&store));

    let (queue, workers) = LocalTaskQueue::start(pipeline, 4);
    queue.enqueue(Task::ScanIncompleteAddresses).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = store.list_incomplete_addresses(100).await.unwrap();
        if pending.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} addresses still pending",
            pending.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    workers.shutdown().await;
    for id in 1..=20 {
        assert_eq!(store.address(id).await.unwrap().postcode, "10001");
    }
}
