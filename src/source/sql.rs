//! SQL-backed source reader.
//!
//! Streams appointments with keyset pagination ordered by the newest change
//! marker, computing the joined services summary and discounted total in
//! the same projection so no per-row round-trips are needed. Change marker
//! columns are ISO-8601 text with a fixed fractional width, which makes
//! lexicographic comparison match chronological order. The physical schema
//! here matches the bridge's staging views; placeholders use the `?` style
//! (SQLite/MySQL).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, QueryResult, Statement, Value};
use tokio::sync::OnceCell;

use crate::db::{self, PoolSettings};
use crate::error::BridgeError;
use crate::source::{Appointment, PageCursor, SourceReader, TreatmentPlanLine};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Newest change marker as a sortable text expression; empty string stands
/// in for NULL and sorts before every real timestamp.
const MARKER_EXPR: &str = "max(coalesce(a.added_at,''), coalesce(a.changed_at,''), \
     coalesce(a.arrived_at,''), coalesce(a.started_at,''), \
     coalesce(a.ended_at,''), coalesce(a.cancelled_at,''))";

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, BridgeError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| BridgeError::SourceUnavailable(format!("bad timestamp '{raw}': {err}")))
}

/// Lazily connected reader over the clinic database. The first query opens
/// the pool; a failed open is retried on the next call, so a source outage
/// at startup does not wedge the process.
pub struct SqlSourceReader {
    url: String,
    settings: PoolSettings,
    pool: OnceCell<DatabaseConnection>,
}

impl SqlSourceReader {
    pub fn new(url: String, settings: PoolSettings) -> Self {
        Self {
            url,
            settings,
            pool: OnceCell::new(),
        }
    }

    /// Wrap an already opened connection (tests).
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self {
            url: String::new(),
            settings: PoolSettings::default(),
            pool: OnceCell::new_with(Some(db)),
        }
    }

    async fn conn(&self) -> Result<&DatabaseConnection, BridgeError> {
        self.pool
            .get_or_try_init(|| async { db::init_pool(&self.url, &self.settings).await })
            .await
            .map_err(|err: DbErr| BridgeError::SourceUnavailable(err.to_string()))
    }

    fn row_to_appointment(row: &QueryResult) -> Result<Appointment, BridgeError> {
        let opt_ts = |col: &str| -> Result<Option<DateTime<Utc>>, BridgeError> {
            let raw: Option<String> = row
                .try_get("", col)
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?;
            raw.as_deref().map(parse_ts).transpose()
        };

        Ok(Appointment {
            row_id: row
                .try_get("", "id")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
            patient_full_name: row
                .try_get::<Option<String>>("", "patient_full_name")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?
                .unwrap_or_default(),
            patient_phone: row
                .try_get("", "patient_phone")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
            doctor_name: row
                .try_get("", "doctor_name")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
            planned_start: opt_ts("planned_start")?,
            services_summary: row
                .try_get("", "services_summary")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
            total_amount: row
                .try_get("", "total_amount")
                .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
            added_at: opt_ts("added_at")?,
            changed_at: opt_ts("changed_at")?,
            arrived_at: opt_ts("arrived_at")?,
            started_at: opt_ts("started_at")?,
            ended_at: opt_ts("ended_at")?,
            cancelled_at: opt_ts("cancelled_at")?,
            invoiced_at: opt_ts("invoiced_at")?,
        })
    }
}

#[async_trait]
impl SourceReader for SqlSourceReader {
    async fn read_since(
        &self,
        watermark: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: u64,
    ) -> Result<Vec<Appointment>, BridgeError> {
        let db = self.conn().await?;

        let cursor_clause = if after.is_some() {
            format!(" AND ({m} > ? OR ({m} = ? AND a.id > ?))", m = MARKER_EXPR)
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT a.id, a.patient_full_name, a.patient_phone, a.doctor_name, a.planned_start, \
                    a.added_at, a.changed_at, a.arrived_at, a.started_at, a.ended_at, \
                    a.cancelled_at, a.invoiced_at, \
                    s.services_summary AS services_summary, s.total_amount AS total_amount, \
                    {m} AS change_marker \
             FROM appointments a \
             LEFT JOIN (SELECT appointment_id, \
                               group_concat(name, ', ') AS services_summary, \
                               sum(item_count * unit_price - coalesce(discount, 0)) AS total_amount \
                        FROM order_lines GROUP BY appointment_id) s \
                    ON s.appointment_id = a.id \
             WHERE (a.added_at >= ? OR a.changed_at >= ? OR a.arrived_at >= ? \
                    OR a.started_at >= ? OR a.ended_at >= ? OR a.cancelled_at >= ?){cursor} \
             ORDER BY change_marker ASC, a.id ASC \
             LIMIT ?",
            m = MARKER_EXPR,
            cursor = cursor_clause,
        );

        let wm = fmt_ts(watermark);
        let mut values: Vec<Value> = vec![
            wm.clone().into(),
            wm.clone().into(),
            wm.clone().into(),
            wm.clone().into(),
            wm.clone().into(),
            wm.into(),
        ];
        if let Some(cursor) = after {
            let marker = fmt_ts(cursor.change_marker);
            values.push(marker.clone().into());
            values.push(marker.into());
            values.push(cursor.row_id.into());
        }
        values.push((limit as i64).into());

        let rows = db
            .query_all(Statement::from_sql_and_values(
                db.get_database_backend(),
                sql,
                values,
            ))
            .await
            .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?;

        rows.iter().map(Self::row_to_appointment).collect()
    }

    async fn read_plan_lines(&self, row_id: i64) -> Result<Vec<TreatmentPlanLine>, BridgeError> {
        let db = self.conn().await?;

        let rows = db
            .query_all(Statement::from_sql_and_values(
                db.get_database_backend(),
                "SELECT id, name, item_count, unit_price, discount \
                 FROM treatment_plan_lines WHERE appointment_id = ? ORDER BY id ASC",
                [Value::from(row_id)],
            ))
            .await
            .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(TreatmentPlanLine {
                    line_id: row
                        .try_get("", "id")
                        .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
                    name: row
                        .try_get("", "name")
                        .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
                    count: row
                        .try_get("", "item_count")
                        .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
                    unit_price: row
                        .try_get("", "unit_price")
                        .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?,
                    discount: row
                        .try_get::<Option<f64>>("", "discount")
                        .map_err(|err| BridgeError::SourceUnavailable(err.to_string()))?
                        .unwrap_or(0.0),
                })
            })
            .collect()
    }

    async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(db) => db::health_check(db).await.is_ok(),
            Err(_) => false,
        }
    }
}
