//! Pipeline stage vocabulary and the stage decision function.
//!
//! Stage identifiers are opaque strings supplied by configuration; the code
//! never assumes their spelling. Two subsets matter to the reconciler:
//! *final* stages (`won`, `lose`) are immutable, and *protected* stages
//! (final plus the configured manual stages) keep their stage across any
//! automated update.

use crate::source::AppointmentStatus;

/// Stage identifiers as configured in the CRM pipeline.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub new: String,
    pub contact_made: String,
    pub treatment: String,
    pub completed_unpaid: String,
    pub won: String,
    pub lose: String,
    /// Manually managed stages that automation must never overwrite.
    pub protected: Vec<String>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            new: "NEW".to_string(),
            contact_made: "CONTACT_MADE".to_string(),
            treatment: "TREATMENT".to_string(),
            completed_unpaid: "COMPLETED_UNPAID".to_string(),
            won: "WON".to_string(),
            lose: "LOSE".to_string(),
            protected: vec![
                "PREPAYMENT_INVOICE".to_string(),
                "FINAL_INVOICE".to_string(),
                "EXECUTING".to_string(),
                "APOLOGY".to_string(),
            ],
        }
    }
}

impl StageConfig {
    /// Final stages are terminal: nothing but the external-id backfill may
    /// touch a deal that reached one.
    pub fn is_final(&self, stage: &str) -> bool {
        stage == self.won || stage == self.lose
    }

    /// Protected = final plus the manually managed stages.
    pub fn is_protected(&self, stage: &str) -> bool {
        self.is_final(stage) || self.protected.iter().any(|s| s == stage)
    }
}

/// Outcome of the stage decision for one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDecision {
    /// Move the deal to this stage.
    Advance(String),
    /// Leave whatever stage the deal currently has untouched.
    Preserve,
}

/// Pure mapping from an appointment status (and the deal's current stage)
/// to the stage the deal should carry afterwards.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    stages: StageConfig,
}

impl StagePolicy {
    pub fn new(stages: StageConfig) -> Self {
        Self { stages }
    }

    /// Decide the stage for a deal given the incoming appointment status.
    ///
    /// `Completed` deliberately preserves a known current stage: a visit that
    /// ended without payment often sits in a manually chosen invoicing stage
    /// (prepayment issued, final invoice, ...), and pulling it back to the
    /// treatment stage would destroy that manual placement. Only when no
    /// current stage is known (the deal is being created) does `Completed`
    /// land on the treatment stage.
    pub fn decide(&self, current: Option<&str>, incoming: AppointmentStatus) -> StageDecision {
        match incoming {
            AppointmentStatus::Planned => StageDecision::Advance(self.stages.new.clone()),
            AppointmentStatus::PatientArrived => {
                StageDecision::Advance(self.stages.contact_made.clone())
            }
            AppointmentStatus::InProgress => {
                StageDecision::Advance(self.stages.treatment.clone())
            }
            AppointmentStatus::Completed => match current {
                Some(_) => StageDecision::Preserve,
                None => StageDecision::Advance(self.stages.treatment.clone()),
            },
            AppointmentStatus::CompletedWithInvoice => {
                StageDecision::Advance(self.stages.won.clone())
            }
            AppointmentStatus::Cancelled => StageDecision::Advance(self.stages.lose.clone()),
        }
    }
}
