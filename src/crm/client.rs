//! CRM HTTP client.
//!
//! Thin façade over the CRM's webhook REST API. Three behaviors live here
//! and nowhere else:
//!
//! * **Retry**: [`CrmClient::request`] applies the configured delay ladder
//!   to transient failures. It is the only retry layer; finders and point
//!   operations compose on top of it and must not wrap it again.
//! * **Rate limiting**: every outgoing call waits on the shared
//!   [`RateLimiter`] first.
//! * **Batch coalescing**: up to [`BATCH_LIMIT`] sub-commands per HTTP
//!   call; the coalesced finders chunk their inputs accordingly and always
//!   return exactly the requested keys. An empty input returns an empty map
//!   without touching the network.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{CrmConfig, CrmFieldNames};
use crate::crm::rate_limit::RateLimiter;
use crate::crm::types::{
    parse_id, Contact, ContactFields, Deal, DealBrief, DealFields, Lead, LeadConversion,
};
use crate::error::BridgeError;

/// Maximum sub-commands the CRM accepts in one batch call.
pub const BATCH_LIMIT: usize = 50;

pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    fields: CrmFieldNames,
    limiter: RateLimiter,
    max_attempts: u32,
    retry_delays: Vec<Duration>,
}

impl CrmClient {
    pub fn new(config: &CrmConfig) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| BridgeError::ConfigInvalid(format!("HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.webhook_url.trim_end_matches('/').to_string(),
            fields: config.fields.clone(),
            limiter: RateLimiter::new(config.rate_limit),
            max_attempts: config.max_retries,
            retry_delays: config.retry_delays(),
        })
    }

    pub fn field_names(&self) -> &CrmFieldNames {
        &self.fields
    }

    /// One HTTP attempt: rate-limit wait, POST, status and body mapping.
    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, BridgeError> {
        self.limiter.acquire().await;

        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|err| BridgeError::CrmTransient(format!("{method}: {err}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::CrmValidation(format!(
                "{method}: authentication rejected ({status}); check the webhook token"
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BridgeError::CrmTransient(format!(
                "{method}: rate limit exceeded"
            )));
        }
        if status.is_server_error() {
            return Err(BridgeError::CrmTransient(format!(
                "{method}: server error {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(BridgeError::CrmValidation(format!(
                "{method}: {status}: {snippet}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| BridgeError::CrmTransient(format!("{method}: invalid JSON: {err}")))?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            if error == "QUERY_LIMIT_EXCEEDED" {
                return Err(BridgeError::CrmTransient(format!(
                    "{method}: query limit exceeded: {description}"
                )));
            }
            return Err(BridgeError::CrmValidation(format!(
                "{method}: {error}: {description}"
            )));
        }

        Ok(body)
    }

    /// The retrying entry point every public operation goes through.
    /// Transient failures are re-attempted up to `max_retries` times with
    /// the configured delays, the last delay reused past the ladder's end.
    async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let idx = (attempt as usize).min(self.retry_delays.len() - 1);
                    let delay = self.retry_delays[idx];
                    attempt += 1;
                    warn!(
                        method,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "CRM call failed, retrying in {:?}",
                        delay
                    );
                    metrics::counter!("crm_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute up to [`BATCH_LIMIT`] labeled sub-commands in one HTTP call.
    /// Per-command errors are logged, not raised; the affected labels are
    /// simply absent from the returned map.
    pub async fn batch(
        &self,
        commands: &[(String, String)],
    ) -> Result<HashMap<String, Value>, BridgeError> {
        if commands.is_empty() {
            return Ok(HashMap::new());
        }
        if commands.len() > BATCH_LIMIT {
            return Err(BridgeError::CrmValidation(format!(
                "batch supports at most {BATCH_LIMIT} commands, got {}",
                commands.len()
            )));
        }

        let mut cmd = Map::new();
        for (label, command) in commands {
            cmd.insert(label.clone(), json!(command));
        }

        let body = self
            .request("batch", json!({ "halt": 0, "cmd": cmd }))
            .await?;

        let batch_result = body.get("result").cloned().unwrap_or(Value::Null);
        if let Some(errors) = batch_result.get("result_error").and_then(Value::as_object) {
            for (label, error) in errors {
                warn!(label = %label, error = %error, "batch sub-command failed");
            }
        }

        let mut results = HashMap::new();
        if let Some(map) = batch_result.get("result").and_then(Value::as_object) {
            for (label, value) in map {
                results.insert(label.clone(), value.clone());
            }
        }
        debug!(
            requested = commands.len(),
            returned = results.len(),
            "batch executed"
        );
        Ok(results)
    }

    /// Find contacts by exact normalized phone, coalesced. The returned map
    /// has exactly the requested phones as keys.
    pub async fn batch_find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Option<Contact>>, BridgeError> {
        let mut found = HashMap::new();
        for chunk in phones.chunks(BATCH_LIMIT) {
            let commands: Vec<(String, String)> = chunk
                .iter()
                .map(|phone| {
                    (
                        phone.clone(),
                        format!(
                            "crm.contact.list?filter[PHONE]={}&select[]=ID&select[]=NAME\
                             &select[]=LAST_NAME&order[DATE_CREATE]=ASC",
                            encode_query(phone)
                        ),
                    )
                })
                .collect();
            let results = self.batch(&commands).await?;
            for phone in chunk {
                let contact = results
                    .get(phone)
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(Contact::from_json);
                found.insert(phone.clone(), contact);
            }
        }
        Ok(found)
    }

    /// Find deals carrying the given external ids, coalesced. Each deal
    /// comes back with its current stage.
    pub async fn batch_find_deals_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Option<Deal>>, BridgeError> {
        let mut found = HashMap::new();
        for chunk in external_ids.chunks(BATCH_LIMIT) {
            let commands: Vec<(String, String)> = chunk
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        format!(
                            "crm.deal.list?filter[{field}]={id}&select[]=ID&select[]=STAGE_ID\
                             &select[]=CONTACT_ID&select[]={field}",
                            field = self.fields.external_id,
                            id = encode_query(id),
                        ),
                    )
                })
                .collect();
            let results = self.batch(&commands).await?;
            for id in chunk {
                let deal = results
                    .get(id)
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(|value| Deal::from_json(value, &self.fields));
                found.insert(id.clone(), deal);
            }
        }
        Ok(found)
    }

    /// Find leads linked to the given contacts, coalesced.
    pub async fn batch_find_leads_by_contact_ids(
        &self,
        contact_ids: &[i64],
    ) -> Result<HashMap<i64, Option<Lead>>, BridgeError> {
        let mut found = HashMap::new();
        for chunk in contact_ids.chunks(BATCH_LIMIT) {
            let commands: Vec<(String, String)> = chunk
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        format!(
                            "crm.lead.list?filter[CONTACT_ID]={id}&select[]=ID&select[]=STATUS_ID"
                        ),
                    )
                })
                .collect();
            let results = self.batch(&commands).await?;
            for id in chunk {
                let lead = results
                    .get(&id.to_string())
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(Lead::from_json);
                found.insert(*id, lead);
            }
        }
        Ok(found)
    }

    /// Find leads by phone. The CRM cannot filter leads by a phone that
    /// lives on a contact, so this is a two-step lookup: phone → contact →
    /// lead. Pass the already-fetched contacts map to avoid refetching.
    pub async fn batch_find_leads_by_phones(
        &self,
        phones: &[String],
        contacts: &HashMap<String, Option<Contact>>,
    ) -> Result<HashMap<String, Option<Lead>>, BridgeError> {
        if phones.is_empty() {
            return Ok(HashMap::new());
        }

        let mut contact_ids = Vec::new();
        let mut phone_to_contact: HashMap<&str, i64> = HashMap::new();
        for phone in phones {
            if let Some(Some(contact)) = contacts.get(phone) {
                phone_to_contact.insert(phone.as_str(), contact.id);
                contact_ids.push(contact.id);
            }
        }

        let leads_by_contact = self.batch_find_leads_by_contact_ids(&contact_ids).await?;

        let mut found = HashMap::new();
        for phone in phones {
            let lead = phone_to_contact
                .get(phone.as_str())
                .and_then(|contact_id| leads_by_contact.get(contact_id).cloned().flatten());
            found.insert(phone.clone(), lead);
        }
        Ok(found)
    }

    /// Read one deal. `Ok(None)` when the CRM reports it missing.
    pub async fn get_deal(&self, deal_id: i64) -> Result<Option<Deal>, BridgeError> {
        match self.request("crm.deal.get", json!({ "id": deal_id })).await {
            Ok(body) => Ok(body
                .get("result")
                .filter(|v| !v.is_null())
                .and_then(|value| Deal::from_json(value, &self.fields))),
            Err(BridgeError::CrmValidation(message))
                if message.to_ascii_lowercase().contains("not found") =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Open deals on a contact that carry no external id yet, oldest first.
    pub async fn find_unbound_deals(
        &self,
        contact_id: i64,
    ) -> Result<Vec<DealBrief>, BridgeError> {
        let body = self
            .request(
                "crm.deal.list",
                json!({
                    "filter": {
                        "CONTACT_ID": contact_id,
                        format!("={}", self.fields.external_id): false,
                    },
                    "select": ["ID", "STAGE_ID", "DATE_CREATE"],
                    "order": { "DATE_CREATE": "ASC" },
                }),
            )
            .await?;

        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(DealBrief::from_json).collect())
            .unwrap_or_default())
    }

    pub async fn create_contact(&self, fields: &ContactFields) -> Result<i64, BridgeError> {
        let body = self
            .request("crm.contact.add", json!({ "fields": fields.to_json() }))
            .await?;
        let contact_id = body.get("result").and_then(parse_id).ok_or_else(|| {
            BridgeError::CrmValidation("crm.contact.add returned no contact id".to_string())
        })?;
        debug!(contact_id, "contact created");
        Ok(contact_id)
    }

    pub async fn create_deal(&self, fields: &DealFields) -> Result<i64, BridgeError> {
        let body = self
            .request(
                "crm.deal.add",
                json!({ "fields": fields.to_json(&self.fields) }),
            )
            .await?;
        let deal_id = body.get("result").and_then(parse_id).ok_or_else(|| {
            BridgeError::CrmValidation("crm.deal.add returned no deal id".to_string())
        })?;
        debug!(deal_id, "deal created");
        Ok(deal_id)
    }

    pub async fn update_deal(&self, deal_id: i64, fields: &DealFields) -> Result<(), BridgeError> {
        self.update_deal_fields(deal_id, fields.to_json(&self.fields))
            .await
    }

    /// Update a deal with a raw field map (external-id backfill, plan note).
    pub async fn update_deal_fields(
        &self,
        deal_id: i64,
        fields: Value,
    ) -> Result<(), BridgeError> {
        self.request(
            "crm.deal.update",
            json!({ "id": deal_id, "fields": fields }),
        )
        .await?;
        Ok(())
    }

    /// Convert a lead into a deal (and, when no contact is supplied, a new
    /// contact) in a single CRM call.
    pub async fn convert_lead(
        &self,
        lead_id: i64,
        contact_id: Option<i64>,
    ) -> Result<LeadConversion, BridgeError> {
        let mut params = Map::new();
        params.insert("LEAD_ID".to_string(), json!(lead_id));
        params.insert(
            "CREATE_CONTACT".to_string(),
            json!(if contact_id.is_some() { "N" } else { "Y" }),
        );
        params.insert("CREATE_COMPANY".to_string(), json!("N"));
        params.insert("CREATE_DEAL".to_string(), json!("Y"));
        if let Some(contact_id) = contact_id {
            params.insert("CONTACT_ID".to_string(), json!(contact_id));
        }

        let body = self
            .request("crm.lead.convert", Value::Object(params))
            .await?;
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        let deal_id = result.get("DEAL_ID").and_then(parse_id).ok_or_else(|| {
            BridgeError::CrmValidation(format!(
                "converting lead {lead_id} returned no deal id"
            ))
        })?;
        Ok(LeadConversion {
            deal_id,
            contact_id: result.get("CONTACT_ID").and_then(parse_id),
        })
    }

    /// Write the note-like plan field on a deal. One field update, not a
    /// timeline entry, so it costs exactly one round-trip.
    pub async fn append_note(&self, deal_id: i64, text: &str) -> Result<(), BridgeError> {
        self.update_deal_fields(deal_id, json!({ self.fields.plan.clone(): text }))
            .await
    }

    /// Harmless authenticated call used as a liveness probe.
    pub async fn ping(&self) -> bool {
        self.request(
            "crm.contact.list",
            json!({ "filter": {}, "select": ["ID"] }),
        )
        .await
        .is_ok()
    }
}

/// Escape a value for use inside a batch command query string. Normalized
/// phones only need the leading `+` escaped.
fn encode_query(value: &str) -> String {
    value.replace('+', "%2B")
}
