//! Per-record reconciliation against the CRM.
//!
//! For each canonical record the reconciler locates the matching CRM
//! entities, creates what is missing, and updates what the stage rules
//! permit. Lookup order:
//!
//! 1. deal by external id;
//! 2. contact by phone, then the contact's single open deal without an
//!    external id (auto-binding);
//! 3. lead by phone, converted into a deal;
//! 4. create contact (if needed) and deal.
//!
//! Records without a phone skip 2 and 3 entirely. Auto-binding re-reads the
//! deal's stage immediately before updating; if that read fails the update
//! is aborted rather than risk overwriting a manually chosen stage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::crm::{Contact, ContactFields, CrmClient, Deal, DealFields, Lead};
use crate::error::BridgeError;
use crate::stages::{StageConfig, StageDecision, StagePolicy};
use crate::transform::CanonicalRecord;

/// Coalesced lookup results shared by every record in one batch.
pub struct BatchLookups {
    deals: HashMap<String, Option<Deal>>,
    contacts: HashMap<String, Option<Contact>>,
    leads: HashMap<String, Option<Lead>>,
}

impl BatchLookups {
    fn deal_for(&self, external_id: &str) -> Option<&Deal> {
        self.deals.get(external_id).and_then(Option::as_ref)
    }

    fn contact_for(&self, phone: &str) -> Option<&Contact> {
        self.contacts.get(phone).and_then(Option::as_ref)
    }

    fn lead_for(&self, phone: &str) -> Option<&Lead> {
        self.leads.get(phone).and_then(Option::as_ref)
    }
}

pub struct Reconciler {
    crm: Arc<CrmClient>,
    stages: StageConfig,
    policy: StagePolicy,
    lead_final_statuses: Vec<String>,
}

impl Reconciler {
    pub fn new(crm: Arc<CrmClient>, stages: StageConfig, lead_final_statuses: Vec<String>) -> Self {
        let policy = StagePolicy::new(stages.clone());
        Self {
            crm,
            stages,
            policy,
            lead_final_statuses,
        }
    }

    /// Run the coalesced finders once for a whole batch: deals by external
    /// id, contacts by phone, leads by phone (reusing the contacts).
    pub async fn prefetch(&self, records: &[CanonicalRecord]) -> Result<BatchLookups, BridgeError> {
        let mut external_ids: Vec<String> = Vec::new();
        let mut phones: Vec<String> = Vec::new();
        for record in records {
            if !external_ids.contains(&record.external_id) {
                external_ids.push(record.external_id.clone());
            }
            if !record.patient_phone.is_empty() && !phones.contains(&record.patient_phone) {
                phones.push(record.patient_phone.clone());
            }
        }

        let deals = self.crm.batch_find_deals_by_external_ids(&external_ids).await?;
        let contacts = self.crm.batch_find_contacts_by_phones(&phones).await?;
        let leads = self.crm.batch_find_leads_by_phones(&phones, &contacts).await?;

        Ok(BatchLookups {
            deals,
            contacts,
            leads,
        })
    }

    /// Reconcile a batch of records, one result per record in order. The
    /// prefetch failing fails every record in the batch (they would all
    /// repeat the same doomed lookups otherwise).
    pub async fn reconcile_batch(
        &self,
        records: &[CanonicalRecord],
    ) -> Vec<(CanonicalRecord, Result<i64, BridgeError>)> {
        let lookups = match self.prefetch(records).await {
            Ok(lookups) => lookups,
            Err(err) => {
                return records
                    .iter()
                    .map(|record| (record.clone(), Err(err.clone())))
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let started = Instant::now();
            let outcome = self.reconcile_one(record, &lookups).await;
            metrics::histogram!("sync_reconcile_duration_ms")
                .record(started.elapsed().as_secs_f64() * 1_000.0);
            outcomes.push((record.clone(), outcome));
        }
        outcomes
    }

    /// Reconcile one record. On success returns the deal id now reflecting
    /// the record.
    pub async fn reconcile_one(
        &self,
        record: &CanonicalRecord,
        lookups: &BatchLookups,
    ) -> Result<i64, BridgeError> {
        // Path 1: the external id already points at a deal.
        if let Some(deal) = lookups.deal_for(&record.external_id) {
            debug!(
                external_id = %record.external_id,
                deal_id = deal.id,
                "deal matched by external id"
            );
            self.update_known_deal(deal.id, &deal.stage_id, deal.external_id.as_deref(), record)
                .await?;
            return Ok(deal.id);
        }

        let contact = if record.patient_phone.is_empty() {
            None
        } else {
            lookups.contact_for(&record.patient_phone)
        };

        // Path 2: adopt the contact's single open deal without an external id.
        if let Some(contact) = contact {
            let candidates: Vec<_> = self
                .crm
                .find_unbound_deals(contact.id)
                .await?
                .into_iter()
                .filter(|deal| !self.stages.is_final(&deal.stage_id))
                .collect();

            match candidates.len() {
                0 => {}
                1 => {
                    let deal_id = candidates[0].id;
                    // Safety read: never stamp and update a deal whose
                    // current stage could not be confirmed.
                    let fresh = self
                        .crm
                        .get_deal(deal_id)
                        .await
                        .map_err(|err| BridgeError::StageReadFailed {
                            deal_id,
                            reason: err.to_string(),
                        })?
                        .ok_or_else(|| BridgeError::StageReadFailed {
                            deal_id,
                            reason: "deal vanished between lookup and stage read".to_string(),
                        })?;
                    info!(
                        external_id = %record.external_id,
                        deal_id,
                        contact_id = contact.id,
                        stage = %fresh.stage_id,
                        "auto-binding unbound deal"
                    );
                    metrics::counter!("sync_auto_bind_total").increment(1);
                    self.update_known_deal(
                        deal_id,
                        &fresh.stage_id,
                        fresh.external_id.as_deref(),
                        record,
                    )
                    .await?;
                    return Ok(deal_id);
                }
                n => {
                    return Err(BridgeError::AutoBindAmbiguous {
                        contact_id: contact.id,
                        candidates: n,
                    });
                }
            }
        }

        // Path 3: convert a live lead reachable through the phone.
        if !record.patient_phone.is_empty() {
            if let Some(lead) = lookups.lead_for(&record.patient_phone) {
                if !self.lead_final_statuses.iter().any(|s| s == &lead.status_id) {
                    return self.convert_lead(lead, contact, record).await;
                }
                debug!(
                    lead_id = lead.id,
                    status = %lead.status_id,
                    "lead is in a final status, not converting"
                );
            }
        }

        // Path 4: nothing matched, create from scratch.
        let contact_id = match contact {
            Some(contact) => contact.id,
            None => {
                self.crm
                    .create_contact(&ContactFields::from_record(record))
                    .await?
            }
        };
        let stage = self.stage_for_new_deal(record);
        let fields = DealFields::from_record(record, Some(stage), Some(contact_id));
        let deal_id = self.crm.create_deal(&fields).await?;
        info!(
            external_id = %record.external_id,
            deal_id,
            contact_id,
            "deal created"
        );
        Ok(deal_id)
    }

    async fn convert_lead(
        &self,
        lead: &Lead,
        contact: Option<&Contact>,
        record: &CanonicalRecord,
    ) -> Result<i64, BridgeError> {
        let conversion = self
            .crm
            .convert_lead(lead.id, contact.map(|c| c.id))
            .await?;
        info!(
            lead_id = lead.id,
            deal_id = conversion.deal_id,
            external_id = %record.external_id,
            "lead converted into deal; updating without stage protection"
        );
        metrics::counter!("sync_lead_conversions_total").increment(1);

        // The freshly converted deal may lag the CRM's indexing; a failed
        // read here is only a warning because this cycle created the deal
        // and there is no manual stage to protect yet.
        match self.crm.get_deal(conversion.deal_id).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(
                deal_id = conversion.deal_id,
                "converted deal not readable yet, proceeding with full update"
            ),
            Err(err) => warn!(
                deal_id = conversion.deal_id,
                error = %err,
                "post-conversion read failed, proceeding with full update"
            ),
        }

        let stage = self.stage_for_new_deal(record);
        let fields = DealFields::from_record(record, Some(stage), None);
        self.crm.update_deal(conversion.deal_id, &fields).await?;
        Ok(conversion.deal_id)
    }

    /// Update rules for a deal whose current stage is known:
    /// final stages only ever receive the external-id backfill, protected
    /// stages keep their stage but take fresh data, everything else follows
    /// the stage policy.
    async fn update_known_deal(
        &self,
        deal_id: i64,
        current_stage: &str,
        existing_external_id: Option<&str>,
        record: &CanonicalRecord,
    ) -> Result<(), BridgeError> {
        if self.stages.is_final(current_stage) {
            if existing_external_id.is_none() {
                info!(
                    deal_id,
                    stage = current_stage,
                    external_id = %record.external_id,
                    "backfilling external id on closed deal"
                );
                let names = self.crm.field_names();
                self.crm
                    .update_deal_fields(
                        deal_id,
                        json!({ names.external_id.clone(): record.external_id }),
                    )
                    .await?;
            } else {
                debug!(deal_id, stage = current_stage, "deal is closed, nothing to do");
            }
            return Ok(());
        }

        if self.stages.is_protected(current_stage) {
            info!(
                deal_id,
                stage = current_stage,
                "stage is protected, updating fields only"
            );
            metrics::counter!("sync_stage_protected_total").increment(1);
            let fields = DealFields::from_record(record, None, None);
            return self.crm.update_deal(deal_id, &fields).await;
        }

        let stage = match self.policy.decide(Some(current_stage), record.target_status) {
            StageDecision::Advance(stage) => Some(stage),
            StageDecision::Preserve => None,
        };
        debug!(
            deal_id,
            current_stage,
            new_stage = stage.as_deref().unwrap_or(current_stage),
            "updating deal"
        );
        let fields = DealFields::from_record(record, stage, None);
        self.crm.update_deal(deal_id, &fields).await
    }

    fn stage_for_new_deal(&self, record: &CanonicalRecord) -> String {
        match self.policy.decide(None, record.target_status) {
            StageDecision::Advance(stage) => stage,
            // decide() never preserves without a current stage.
            StageDecision::Preserve => self.stages.new.clone(),
        }
    }
}
