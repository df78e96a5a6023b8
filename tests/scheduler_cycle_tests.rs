//! Full-cycle tests: drain, stream, reconcile, watermark arithmetic, and
//! the retry queue's role in keeping failures durable.

mod test_utils;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinic_bridge::clock::{Clock, ManualClock};
use clinic_bridge::config::AppConfig;
use clinic_bridge::crm::CrmClient;
use clinic_bridge::plans::{PlanCache, PlanProjector};
use clinic_bridge::queue::{RetryQueue, WatermarkStore};
use clinic_bridge::reconcile::Reconciler;
use clinic_bridge::scheduler::Scheduler;
use clinic_bridge::source::AppointmentStatus;
use test_utils::{
    appointment, contact_json, deal_json, mount_batch, record, test_config, ts, ScriptedReader,
    CONTACTS_BATCH, DEALS_BATCH, LEADS_BATCH,
};

const NOW: i64 = 1_700_100_000;

struct Harness {
    scheduler: Scheduler<ScriptedReader>,
    clock: Arc<ManualClock>,
    watermark_path: std::path::PathBuf,
    _state_dir: tempfile::TempDir,
}

async fn harness(server: &MockServer, reader: ScriptedReader) -> Harness {
    harness_with(server, reader, |_| {}).await
}

async fn harness_with(
    server: &MockServer,
    reader: ScriptedReader,
    tweak: impl FnOnce(&mut AppConfig),
) -> Harness {
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), state_dir.path());
    tweak(&mut config);
    let config = Arc::new(config);

    let reader = Arc::new(reader);
    let crm = Arc::new(CrmClient::new(&config.crm).unwrap());
    let clock = Arc::new(ManualClock::new(ts(NOW)));
    let clock_dyn: Arc<dyn Clock> = clock.clone();

    let queue = RetryQueue::open(
        &config.queue.store_path,
        config.queue.max_retry_attempts,
        config.queue.max_queue_size,
        config.crm.retry_delays(),
    )
    .await
    .unwrap();

    let watermark_path = state_dir.path().join("watermark");
    let watermark = WatermarkStore::new(watermark_path.clone());

    let projector = PlanProjector::new(
        reader.clone(),
        crm.clone(),
        clock_dyn.clone(),
        PlanCache::load(config.plans.cache_path.clone(), config.plans.max_cache_entries),
        config.plans.throttle_minutes,
    );
    let reconciler = Reconciler::new(
        crm.clone(),
        config.stages.clone(),
        config.crm.lead_final_statuses.clone(),
    );

    let scheduler = Scheduler::new(
        config.clone(),
        reader,
        crm,
        reconciler,
        queue,
        watermark,
        projector,
        clock_dyn,
    );

    Harness {
        scheduler,
        clock,
        watermark_path,
        _state_dir: state_dir,
    }
}

fn watermark_of(harness: &Harness) -> Option<chrono::DateTime<chrono::Utc>> {
    WatermarkStore::new(harness.watermark_path.clone())
        .load()
        .unwrap()
}

/// Ten records, the CRM rejects the fourth with a 5xx across every retry:
/// nine succeed, the fourth lands in the queue with one attempt consumed,
/// and the watermark advances over the failure because it is durably
/// remembered.
#[tokio::test]
async fn transient_failure_is_enqueued_and_does_not_block_the_watermark() {
    let server = MockServer::start().await;
    mount_batch(&server, DEALS_BATCH, json!({})).await;
    mount_batch(&server, CONTACTS_BATCH, json!({})).await;

    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .and(body_string_contains("+79990000004"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 101 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 555 })))
        .mount(&server)
        .await;

    let rows = (1..=10)
        .map(|i| appointment(i, &format!("+7999000000{i}"), 1_700_000_000 + i))
        .collect();
    let harness = harness(&server, ScriptedReader::new(rows)).await;

    let stats = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 10);
    assert_eq!(stats.succeeded, 9);
    assert_eq!(stats.enqueued, 1);

    let due = harness.scheduler.queue().due(ts(NOW + 3_600)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].external_id, "F1_4");
    assert_eq!(due[0].attempt_count, 1);
    assert!(due[0].next_attempt_at >= ts(NOW));

    // Watermark = newest marker across the cycle; the enqueued record is
    // durable so it does not hold the watermark back.
    assert_eq!(watermark_of(&harness), Some(ts(1_700_000_010)));
}

/// Replaying the same source row twice (the watermark comparison is
/// inclusive, so an unchanged row reappears next cycle) converges to the
/// same CRM state: one deal created, then updated in place.
#[tokio::test]
async fn replaying_the_same_row_is_idempotent() {
    let server = MockServer::start().await;

    // Cycle 1: nothing exists yet.
    mount_batch(&server, DEALS_BATCH, json!({})).await;
    mount_batch(&server, CONTACTS_BATCH, json!({})).await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 101 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 555 })))
        .expect(1)
        .mount(&server)
        .await;

    let harness = harness(
        &server,
        ScriptedReader::new(vec![appointment(42, "+79991234567", 1_700_000_000)]),
    )
    .await;
    let first = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(watermark_of(&harness), Some(ts(1_700_000_000)));

    // Cycle 2: the CRM now knows the deal; the row re-reads because its
    // marker equals the watermark. The only write is an in-place update.
    server.reset().await;
    mount_batch(
        &server,
        DEALS_BATCH,
        json!({ "F1_42": [deal_json(555, "NEW", Some("F1_42"))] }),
    )
    .await;
    mount_batch(
        &server,
        CONTACTS_BATCH,
        json!({ "+79991234567": [contact_json(101)] }),
    )
    .await;
    mount_batch(&server, LEADS_BATCH, json!({})).await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 1 })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.update"))
        .and(body_string_contains("\"STAGE_ID\":\"NEW\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
        .expect(1)
        .mount(&server)
        .await;

    let second = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.succeeded, 1);
    assert_eq!(watermark_of(&harness), Some(ts(1_700_000_000)));
}

/// Due queue items are reprocessed ahead of fresh rows and leave the queue
/// on success.
#[tokio::test]
async fn due_queue_items_drain_through_the_reconciler() {
    let server = MockServer::start().await;
    mount_batch(&server, DEALS_BATCH, json!({})).await;
    mount_batch(&server, CONTACTS_BATCH, json!({})).await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 101 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 556 })))
        .mount(&server)
        .await;

    let harness = harness(&server, ScriptedReader::new(vec![])).await;
    harness
        .scheduler
        .queue()
        .enqueue(
            &record("F1_9", "+79991234568", AppointmentStatus::Planned),
            &clinic_bridge::error::BridgeError::CrmTransient("seeded".to_string()),
            ts(NOW - 600),
        )
        .await
        .unwrap();

    let stats = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.retried_ok, 1);
    assert_eq!(harness.scheduler.queue().depth().await.unwrap(), 0);
}

/// A failure that cannot be parked durably (the queue is full) freezes the
/// watermark at the last safe marker, even though later records succeed.
#[tokio::test]
async fn non_durable_failure_blocks_watermark_advance() {
    let server = MockServer::start().await;
    mount_batch(&server, DEALS_BATCH, json!({})).await;
    mount_batch(&server, CONTACTS_BATCH, json!({})).await;

    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .and(body_string_contains("+79990000002"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 101 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 555 })))
        .mount(&server)
        .await;

    let rows = (1..=3)
        .map(|i| appointment(i, &format!("+7999000000{i}"), 1_700_000_000 + i))
        .collect();
    let harness = harness_with(&server, ScriptedReader::new(rows), |config| {
        config.queue.max_queue_size = 0;
    })
    .await;

    let stats = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.enqueued, 0);

    // Row 1 was safe; rows 2 (lost failure) and 3 (after the block) are not
    // covered, so the next cycle re-reads them.
    assert_eq!(watermark_of(&harness), Some(ts(1_700_000_001)));
}

/// A source outage abandons the cycle without touching the watermark.
#[tokio::test]
async fn source_outage_leaves_watermark_untouched() {
    let server = MockServer::start().await;
    let reader = ScriptedReader::new(vec![appointment(1, "+79991234567", 1_700_000_000)]);
    reader.set_healthy(false);
    let harness = harness(&server, reader).await;

    WatermarkStore::new(harness.watermark_path.clone())
        .save(ts(1_699_999_999))
        .unwrap();

    let stats = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.attempted, 0);
    assert_eq!(watermark_of(&harness), Some(ts(1_699_999_999)));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

/// Rows the transformer rejects are counted and dropped, never enqueued,
/// and do not hold the watermark back.
#[tokio::test]
async fn data_quality_rejections_are_counted_and_dropped() {
    let server = MockServer::start().await;
    mount_batch(&server, DEALS_BATCH, json!({})).await;
    mount_batch(&server, CONTACTS_BATCH, json!({})).await;
    Mock::given(method("POST"))
        .and(path("/crm.contact.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 101 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/crm.deal.add"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": 555 })))
        .mount(&server)
        .await;

    let mut bad = appointment(1, "+79991234561", 1_700_000_001);
    bad.patient_full_name = String::new();
    let good = appointment(2, "+79991234562", 1_700_000_002);

    let harness = harness(&server, ScriptedReader::new(vec![bad, good])).await;
    let stats = harness
        .scheduler
        .cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.data_quality, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(harness.scheduler.queue().depth().await.unwrap(), 0);
    assert_eq!(watermark_of(&harness), Some(ts(1_700_000_002)));

    // Use the clock so the borrow is exercised; keeps the harness honest
    // about which time source the scheduler saw.
    assert_eq!(harness.clock.now(), ts(NOW));
}
