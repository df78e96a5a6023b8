//! Source-side data model and the reader seam.
//!
//! The reader yields appointments whose change envelope intersects
//! `[watermark, now]`, in ascending order of their newest change marker, so
//! a partially processed cycle can still advance the watermark safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub mod sql;

pub use sql::SqlSourceReader;

/// Lifecycle of an appointment as the clinic software records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Planned,
    PatientArrived,
    InProgress,
    Completed,
    CompletedWithInvoice,
    Cancelled,
}

impl AppointmentStatus {
    /// Human-readable label written into the CRM status field.
    pub fn label(&self) -> &'static str {
        match self {
            AppointmentStatus::Planned => "Planned",
            AppointmentStatus::PatientArrived => "Patient arrived",
            AppointmentStatus::InProgress => "In progress",
            AppointmentStatus::Completed => "Completed",
            AppointmentStatus::CompletedWithInvoice => "Completed, invoice issued",
            AppointmentStatus::Cancelled => "Cancelled",
        }
    }
}

/// One appointment row with its change markers and the pre-aggregated
/// service summary.
#[derive(Debug, Clone, Default)]
pub struct Appointment {
    pub row_id: i64,
    pub patient_full_name: String,
    pub patient_phone: Option<String>,
    pub doctor_name: Option<String>,
    pub planned_start: Option<DateTime<Utc>>,
    pub services_summary: Option<String>,
    pub total_amount: Option<f64>,
    /// The six change markers. Their maximum is the row's position in the
    /// incremental stream.
    pub added_at: Option<DateTime<Utc>>,
    pub changed_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Invoice timestamp; feeds status derivation only, not the change
    /// signal.
    pub invoiced_at: Option<DateTime<Utc>>,
}

impl Appointment {
    /// Newest of the six change markers, nulls ignored.
    pub fn change_marker_max(&self) -> Option<DateTime<Utc>> {
        [
            self.added_at,
            self.changed_at,
            self.arrived_at,
            self.started_at,
            self.ended_at,
            self.cancelled_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Status derived from the markers. A cancellation wins over everything;
    /// otherwise the furthest-progressed marker decides.
    pub fn status(&self) -> AppointmentStatus {
        if self.cancelled_at.is_some() {
            AppointmentStatus::Cancelled
        } else if self.invoiced_at.is_some() {
            AppointmentStatus::CompletedWithInvoice
        } else if self.ended_at.is_some() {
            AppointmentStatus::Completed
        } else if self.started_at.is_some() {
            AppointmentStatus::InProgress
        } else if self.arrived_at.is_some() {
            AppointmentStatus::PatientArrived
        } else {
            AppointmentStatus::Planned
        }
    }
}

/// One service or good on a treatment plan.
#[derive(Debug, Clone, PartialEq)]
pub struct TreatmentPlanLine {
    pub line_id: i64,
    pub name: String,
    pub count: i64,
    pub unit_price: f64,
    pub discount: f64,
}

impl TreatmentPlanLine {
    /// Discounted line total.
    pub fn amount(&self) -> f64 {
        self.unit_price * self.count as f64 - self.discount
    }
}

/// Keyset cursor into the incremental stream: position of the last row the
/// caller consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub change_marker: DateTime<Utc>,
    pub row_id: i64,
}

/// Read access to the clinic database. Implementations must stream: one
/// page per call, never the whole result set.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Rows whose newest change marker is `>= watermark`, strictly after
    /// `after` when given, ordered by (marker, row id) ascending, at most
    /// `limit` rows. The `>=` comparison is deliberate: a row arriving at
    /// exactly the stored watermark instant must not be skipped.
    async fn read_since(
        &self,
        watermark: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u64,
    ) -> Result<Vec<Appointment>, BridgeError>;

    /// Treatment plan lines for one appointment, in line order.
    async fn read_plan_lines(&self, row_id: i64) -> Result<Vec<TreatmentPlanLine>, BridgeError>;

    /// Liveness probe used at scheduler startup.
    async fn ping(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn change_marker_max_ignores_nulls() {
        let appt = Appointment {
            added_at: Some(ts(100)),
            changed_at: Some(ts(300)),
            started_at: Some(ts(200)),
            ..Appointment::default()
        };
        assert_eq!(appt.change_marker_max(), Some(ts(300)));

        assert_eq!(Appointment::default().change_marker_max(), None);
    }

    #[test]
    fn status_derivation_order() {
        let mut appt = Appointment {
            added_at: Some(ts(1)),
            ..Appointment::default()
        };
        assert_eq!(appt.status(), AppointmentStatus::Planned);

        appt.arrived_at = Some(ts(2));
        assert_eq!(appt.status(), AppointmentStatus::PatientArrived);

        appt.started_at = Some(ts(3));
        assert_eq!(appt.status(), AppointmentStatus::InProgress);

        appt.ended_at = Some(ts(4));
        assert_eq!(appt.status(), AppointmentStatus::Completed);

        appt.invoiced_at = Some(ts(5));
        assert_eq!(appt.status(), AppointmentStatus::CompletedWithInvoice);

        // Cancellation wins over every other marker.
        appt.cancelled_at = Some(ts(6));
        assert_eq!(appt.status(), AppointmentStatus::Cancelled);
    }

    #[test]
    fn plan_line_amount_applies_discount() {
        let line = TreatmentPlanLine {
            line_id: 1,
            name: "Filling".to_string(),
            count: 2,
            unit_price: 1500.0,
            discount: 500.0,
        };
        assert_eq!(line.amount(), 2500.0);
    }
}
