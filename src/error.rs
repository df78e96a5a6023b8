//! # Error Handling
//!
//! Unified error taxonomy for the bridge. Every failure the core can
//! encounter maps onto one of these kinds, which drive the recovery policy:
//! transient kinds are retried or enqueued, validation and ambiguity are
//! surfaced without crashing, and corrupt persistent state is fatal.

use thiserror::Error;

/// All failure kinds the synchronization core distinguishes.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Missing or ill-formed configuration option. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Source database unreachable or a query timed out. The cycle is
    /// abandoned and the watermark is not advanced.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Network error, 5xx, or a rate-limit response from the CRM. Retried by
    /// the client; enqueued if it keeps failing.
    #[error("transient CRM error: {0}")]
    CrmTransient(String),

    /// The CRM rejected the request semantically (4xx, field errors). Never
    /// retried in place; enqueued so a human can inspect without data loss.
    #[error("CRM rejected the request: {0}")]
    CrmValidation(String),

    /// The transformer rejected the source row. Counted and dropped;
    /// retrying would not change the input.
    #[error("record rejected: {0}")]
    DataQuality(String),

    /// A contact matched by phone has more than one open deal without an
    /// external id. The record is skipped with a warning, never enqueued.
    #[error("contact {contact_id} has {candidates} open deals without an external id")]
    AutoBindAmbiguous { contact_id: i64, candidates: usize },

    /// The pre-update stage read on the auto-binding path failed. Updating
    /// anyway could overwrite a protected stage, so the record is enqueued.
    #[error("stage read failed for deal {deal_id}: {reason}")]
    StageReadFailed { deal_id: i64, reason: String },

    /// Watermark, queue store, or plan cache is unreadable. Fatal for the
    /// first two; the plan cache is rebuildable and only warns.
    #[error("persistent state corrupt: {0}")]
    StorageCorrupt(String),
}

impl BridgeError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::SourceUnavailable(_)
                | BridgeError::CrmTransient(_)
                | BridgeError::StageReadFailed { .. }
        )
    }

    /// Whether a failed record should be parked in the retry queue.
    pub fn should_enqueue(&self) -> bool {
        matches!(
            self,
            BridgeError::CrmTransient(_)
                | BridgeError::CrmValidation(_)
                | BridgeError::StageReadFailed { .. }
        )
    }

    /// Stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::SourceUnavailable(_) => "source_unavailable",
            BridgeError::CrmTransient(_) => "crm_transient",
            BridgeError::CrmValidation(_) => "crm_validation",
            BridgeError::DataQuality(_) => "data_quality",
            BridgeError::AutoBindAmbiguous { .. } => "auto_bind_ambiguous",
            BridgeError::StageReadFailed { .. } => "stage_read_failed",
            BridgeError::StorageCorrupt(_) => "storage_corrupt",
        }
    }

    /// Process exit code for fatal errors: 1 for configuration problems,
    /// 2 for corrupt persistent state, 1 for anything else that escapes.
    pub fn exit_code(&self) -> u8 {
        match self {
            BridgeError::StorageCorrupt(_) => 2,
            _ => 1,
        }
    }
}
