//! CRM entity views and outgoing field sets.
//!
//! The bridge only reads the handful of fields reconciliation needs; the
//! rest of the CRM's wire vocabulary stays opaque. Identifiers arrive from
//! the API as either numbers or strings, so parsing tolerates both.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::config::CrmFieldNames;
use crate::transform::{split_full_name, CanonicalRecord};

/// Parse a CRM id that may be serialized as a number or a string.
pub(crate) fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A contact as returned by the list/search endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub last_name: String,
}

impl Contact {
    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(value.get("ID")?)?,
            name: non_empty_str(value.get("NAME")).unwrap_or_default(),
            last_name: non_empty_str(value.get("LAST_NAME")).unwrap_or_default(),
        })
    }
}

/// A deal with the fields reconciliation reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub id: i64,
    pub stage_id: String,
    pub contact_id: Option<i64>,
    pub external_id: Option<String>,
}

impl Deal {
    pub(crate) fn from_json(value: &Value, fields: &CrmFieldNames) -> Option<Self> {
        Some(Self {
            id: parse_id(value.get("ID")?)?,
            stage_id: non_empty_str(value.get("STAGE_ID")).unwrap_or_default(),
            contact_id: value.get("CONTACT_ID").and_then(parse_id),
            external_id: non_empty_str(value.get(fields.external_id.as_str())),
        })
    }
}

/// Slim deal view used when scanning a contact's unbound deals.
#[derive(Debug, Clone, PartialEq)]
pub struct DealBrief {
    pub id: i64,
    pub stage_id: String,
}

impl DealBrief {
    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(value.get("ID")?)?,
            stage_id: non_empty_str(value.get("STAGE_ID")).unwrap_or_default(),
        })
    }
}

/// A lead as returned by the list endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Lead {
    pub id: i64,
    pub status_id: String,
}

impl Lead {
    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(value.get("ID")?)?,
            status_id: non_empty_str(value.get("STATUS_ID")).unwrap_or_default(),
        })
    }
}

/// Result of converting a lead: the new deal and, when the CRM minted one,
/// the new contact.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadConversion {
    pub deal_id: i64,
    pub contact_id: Option<i64>,
}

/// Outgoing contact fields.
#[derive(Debug, Clone)]
pub struct ContactFields {
    pub name: String,
    pub last_name: String,
    pub second_name: String,
    /// `None` when the record carries no usable phone; the phone entry is
    /// omitted entirely in that case.
    pub phone: Option<String>,
}

impl ContactFields {
    pub fn from_record(record: &CanonicalRecord) -> Self {
        let (last_name, name, second_name) = split_full_name(&record.patient_full_name);
        Self {
            name,
            last_name,
            second_name,
            phone: (!record.patient_phone.is_empty()).then(|| record.patient_phone.clone()),
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("NAME".to_string(), json!(self.name));
        fields.insert("LAST_NAME".to_string(), json!(self.last_name));
        fields.insert("SECOND_NAME".to_string(), json!(self.second_name));
        fields.insert("TYPE_ID".to_string(), json!("CLIENT"));
        if let Some(phone) = &self.phone {
            fields.insert(
                "PHONE".to_string(),
                json!([{ "VALUE": phone, "VALUE_TYPE": "MOBILE" }]),
            );
        }
        Value::Object(fields)
    }
}

/// Outgoing deal fields. `stage_id: None` leaves the deal's stage untouched;
/// `contact_id` is only set on creation.
#[derive(Debug, Clone)]
pub struct DealFields {
    pub title: String,
    pub stage_id: Option<String>,
    pub opportunity: Option<f64>,
    pub contact_id: Option<i64>,
    pub external_id: Option<String>,
    pub doctor: String,
    pub reception_start: Option<DateTime<Utc>>,
    pub services: String,
    pub status_label: String,
}

impl DealFields {
    pub fn from_record(
        record: &CanonicalRecord,
        stage_id: Option<String>,
        contact_id: Option<i64>,
    ) -> Self {
        Self {
            title: format!("Запись на прием - {}", record.patient_full_name),
            stage_id,
            opportunity: record.total_amount,
            contact_id,
            external_id: Some(record.external_id.clone()),
            doctor: record.doctor_name.clone(),
            reception_start: record.planned_start,
            services: record.services_summary.clone(),
            status_label: record.target_status.label().to_string(),
        }
    }

    pub(crate) fn to_json(&self, names: &CrmFieldNames) -> Value {
        let mut fields = Map::new();
        fields.insert("TITLE".to_string(), json!(self.title));
        if let Some(stage_id) = &self.stage_id {
            fields.insert("STAGE_ID".to_string(), json!(stage_id));
        }
        if let Some(opportunity) = self.opportunity {
            fields.insert("OPPORTUNITY".to_string(), json!(opportunity));
            fields.insert("CURRENCY_ID".to_string(), json!("RUB"));
        }
        if let Some(contact_id) = self.contact_id {
            fields.insert("CONTACT_ID".to_string(), json!(contact_id));
        }
        if let Some(external_id) = &self.external_id {
            fields.insert(names.external_id.clone(), json!(external_id));
        }
        fields.insert(names.doctor.clone(), json!(self.doctor));
        if let Some(start) = self.reception_start {
            fields.insert(
                names.reception_start.clone(),
                json!(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        fields.insert(names.services.clone(), json!(self.services));
        fields.insert(names.status.clone(), json!(self.status_label));
        Value::Object(fields)
    }
}
