//! Transformation of source appointments into CRM-bound records.
//!
//! Everything here is pure: phone normalization, external id composition,
//! name splitting, and the [`Transformer`] that validates a row and produces
//! a [`CanonicalRecord`]. Rejections are data-quality errors; retrying them
//! cannot change the input, so they are counted and dropped upstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::source::{Appointment, AppointmentStatus};

/// CRM text-field limit for the aggregated services summary.
pub const SERVICES_MAX_LEN: usize = 3000;

/// Shortest digit count (with country code) still treated as dialable.
const MIN_PHONE_DIGITS: usize = 11;

/// Normalize a phone to `+` followed by digits only.
///
/// Russian conventions apply first: a leading `8` on an 11-digit number
/// becomes `7`, and a bare 10-digit number gets the `7` country code. Any
/// result shorter than the sane minimum is rejected so contact matching
/// skips phone-based paths entirely.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 11 && digits.starts_with('8') {
        digits.replace_range(0..1, "7");
    }
    if digits.len() == 10 {
        digits.insert(0, '7');
    }
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }

    Some(format!("+{digits}"))
}

/// Compose the external identifier joining a source row to a CRM deal.
pub fn external_id(filial_id: u8, row_id: i64) -> String {
    format!("F{filial_id}_{row_id}")
}

/// Parse an external identifier back into `(filial_id, row_id)`.
pub fn parse_external_id(value: &str) -> Option<(u8, i64)> {
    let rest = value.strip_prefix('F')?;
    let (filial, row) = rest.split_once('_')?;
    Some((filial.parse().ok()?, row.parse().ok()?))
}

/// Split a `"Last First [Second]"` full name into its parts. Missing parts
/// come back empty.
pub fn split_full_name(full: &str) -> (String, String, String) {
    let mut parts = full.split_whitespace();
    let last = parts.next().unwrap_or_default().to_string();
    let first = parts.next().unwrap_or_default().to_string();
    let second = parts.collect::<Vec<_>>().join(" ");
    (last, first, second)
}

/// Clamp the services summary to the CRM field limit, cutting at the last
/// comma so no service name is torn in half.
pub fn clamp_services(text: &str) -> String {
    if text.chars().count() <= SERVICES_MAX_LEN {
        return text.to_string();
    }
    let truncated: String = text.chars().take(SERVICES_MAX_LEN - 3).collect();
    let cut = truncated.rfind(',').unwrap_or(truncated.len());
    format!("{}...", &truncated[..cut])
}

/// The transformer's output: one appointment as the CRM should see it.
///
/// Invariants: `external_id` is never empty; `patient_phone` is either empty
/// or starts with `+`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub external_id: String,
    pub patient_full_name: String,
    pub patient_phone: String,
    pub doctor_name: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub services_summary: String,
    pub total_amount: Option<f64>,
    pub target_status: AppointmentStatus,
    /// Newest change marker of the source row; the cycle's watermark
    /// candidate once this record is safely reflected or parked.
    pub source_timestamps_max: DateTime<Utc>,
}

/// Pure appointment-to-record conversion for one branch.
#[derive(Debug, Clone)]
pub struct Transformer {
    filial_id: u8,
}

impl Transformer {
    pub fn new(filial_id: u8) -> Self {
        Self { filial_id }
    }

    pub fn transform(&self, appointment: &Appointment) -> Result<CanonicalRecord, BridgeError> {
        if appointment.patient_full_name.trim().is_empty() {
            return Err(BridgeError::DataQuality(format!(
                "row {} has no patient name",
                appointment.row_id
            )));
        }
        if appointment.planned_start.is_none() {
            return Err(BridgeError::DataQuality(format!(
                "row {} has no planned start",
                appointment.row_id
            )));
        }
        let doctor_name = appointment
            .doctor_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                BridgeError::DataQuality(format!(
                    "row {} has no doctor name",
                    appointment.row_id
                ))
            })?;
        let source_timestamps_max = appointment.change_marker_max().ok_or_else(|| {
            BridgeError::DataQuality(format!("row {} has no change markers", appointment.row_id))
        })?;

        let patient_phone = appointment
            .patient_phone
            .as_deref()
            .and_then(normalize_phone)
            .unwrap_or_default();

        Ok(CanonicalRecord {
            external_id: external_id(self.filial_id, appointment.row_id),
            patient_full_name: appointment.patient_full_name.trim().to_string(),
            patient_phone,
            doctor_name: doctor_name.to_string(),
            planned_start: appointment.planned_start,
            services_summary: clamp_services(
                appointment.services_summary.as_deref().unwrap_or_default(),
            ),
            total_amount: appointment.total_amount,
            target_status: appointment.status(),
            source_timestamps_max,
        })
    }
}
