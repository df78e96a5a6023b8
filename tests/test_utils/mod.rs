//! Shared helpers for the integration tests: a scripted source reader, a
//! CRM double built on wiremock, and canonical-record builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinic_bridge::config::AppConfig;
use clinic_bridge::error::BridgeError;
use clinic_bridge::source::{
    Appointment, AppointmentStatus, PageCursor, SourceReader, TreatmentPlanLine,
};
use clinic_bridge::transform::CanonicalRecord;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Test configuration pointed at a wiremock server, with instant retries and
/// a rate limit high enough to stay out of the way.
pub fn test_config(server_uri: &str, state_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.crm.webhook_url = server_uri.trim_end_matches('/').to_string();
    config.crm.max_retries = 2;
    config.crm.retry_delays_secs = vec![0];
    config.crm.rate_limit = 10_000.0;
    config.sync.batch_size = 50;
    config.sync.api_batch_size = 20;
    config.queue.store_path = state_dir.join("queue.store");
    config.plans.cache_path = state_dir.join("plan_cache.store");
    config
}

/// In-memory source reader scripted by the test.
#[derive(Default)]
pub struct ScriptedReader {
    appointments: Mutex<Vec<Appointment>>,
    plans: Mutex<HashMap<i64, Vec<TreatmentPlanLine>>>,
    healthy: AtomicBool,
}

impl ScriptedReader {
    pub fn new(appointments: Vec<Appointment>) -> Self {
        Self {
            appointments: Mutex::new(appointments),
            plans: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn set_plan_lines(&self, row_id: i64, lines: Vec<TreatmentPlanLine>) {
        self.plans.lock().unwrap().insert(row_id, lines);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceReader for ScriptedReader {
    async fn read_since(
        &self,
        watermark: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u64,
    ) -> Result<Vec<Appointment>, BridgeError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BridgeError::SourceUnavailable("scripted outage".to_string()));
        }
        let mut rows: Vec<Appointment> = self
            .appointments
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.change_marker_max().is_some_and(|m| m >= watermark))
            .filter(|a| match after {
                None => true,
                Some(cursor) => {
                    let marker = a.change_marker_max().unwrap();
                    marker > cursor.change_marker
                        || (marker == cursor.change_marker && a.row_id > cursor.row_id)
                }
            })
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.change_marker_max().unwrap(), a.row_id));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn read_plan_lines(&self, row_id: i64) -> Result<Vec<TreatmentPlanLine>, BridgeError> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .get(&row_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ping(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// A planned appointment with one change marker.
pub fn appointment(row_id: i64, phone: &str, marker_secs: i64) -> Appointment {
    Appointment {
        row_id,
        patient_full_name: "Иванов Иван Иванович".to_string(),
        patient_phone: Some(phone.to_string()),
        doctor_name: Some("Петров Пётр Петрович".to_string()),
        planned_start: Some(ts(marker_secs + 3_600)),
        services_summary: Some("Консультация".to_string()),
        total_amount: Some(3500.0),
        added_at: Some(ts(marker_secs)),
        ..Appointment::default()
    }
}

pub fn record(external_id: &str, phone: &str, status: AppointmentStatus) -> CanonicalRecord {
    CanonicalRecord {
        external_id: external_id.to_string(),
        patient_full_name: "Иванов Иван Иванович".to_string(),
        patient_phone: phone.to_string(),
        doctor_name: "Петров Пётр Петрович".to_string(),
        planned_start: Some(ts(1_700_003_600)),
        services_summary: "Консультация".to_string(),
        total_amount: Some(3500.0),
        target_status: status,
        source_timestamps_max: ts(1_700_000_000),
    }
}

/// Entity payloads in the CRM's wire shape.
pub fn deal_json(id: i64, stage: &str, external_id: Option<&str>) -> Value {
    json!({
        "ID": id.to_string(),
        "STAGE_ID": stage,
        "CONTACT_ID": "0",
        "UF_CRM_EXTERNAL_ID": external_id.unwrap_or(""),
    })
}

pub fn contact_json(id: i64) -> Value {
    json!({ "ID": id.to_string(), "NAME": "Иван", "LAST_NAME": "Иванов" })
}

pub fn lead_json(id: i64, status: &str) -> Value {
    json!({ "ID": id.to_string(), "STATUS_ID": status })
}

/// Markers distinguishing the three coalesced finders inside a `/batch` body.
pub const DEALS_BATCH: &str = "crm.deal.list?filter[UF_CRM_EXTERNAL_ID]";
pub const CONTACTS_BATCH: &str = "crm.contact.list?filter[PHONE]";
pub const LEADS_BATCH: &str = "crm.lead.list?filter[CONTACT_ID]";

/// Mount a `/batch` responder for one finder kind. `results` maps each
/// sub-command label to its entity list.
pub async fn mount_batch(server: &MockServer, marker: &str, results: Value) {
    Mock::given(method("POST"))
        .and(path("/batch"))
        .and(body_string_contains(marker))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "result": results, "result_error": {} }
        })))
        .mount(server)
        .await;
}

/// Mount a point-operation responder returning `{"result": result}`.
pub async fn mount_result(server: &MockServer, endpoint: &str, result: Value) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": result })))
        .mount(server)
        .await;
}
