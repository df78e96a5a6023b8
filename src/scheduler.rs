//! # Sync Scheduler
//!
//! Top-level loop of the bridge. Each cycle drains the retry queue first,
//! then streams changed appointments from the source, reconciles them into
//! the CRM, and finally advances the watermark to the newest change marker
//! that is safely accounted for: reflected in the CRM, durably enqueued,
//! or rejected as a data-quality drop. A failure that could not be parked
//! durably blocks any further watermark advance for the cycle, so no row is
//! ever silently skipped.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::time::{sleep, Duration as TokioDuration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::crm::CrmClient;
use crate::error::BridgeError;
use crate::plans::PlanProjector;
use crate::queue::{RetryQueue, WatermarkStore};
use crate::reconcile::Reconciler;
use crate::source::{PageCursor, SourceReader};
use crate::transform::{CanonicalRecord, Transformer};

/// Outcome counters for one cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub enqueued: u64,
    pub skipped: u64,
    pub data_quality: u64,
    pub retried: u64,
    pub retried_ok: u64,
}

pub struct Scheduler<R: SourceReader> {
    config: Arc<AppConfig>,
    reader: Arc<R>,
    crm: Arc<CrmClient>,
    transformer: Transformer,
    reconciler: Reconciler,
    queue: RetryQueue,
    watermark: WatermarkStore,
    projector: PlanProjector<R>,
    clock: Arc<dyn Clock>,
}

impl<R: SourceReader> Scheduler<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        reader: Arc<R>,
        crm: Arc<CrmClient>,
        reconciler: Reconciler,
        queue: RetryQueue,
        watermark: WatermarkStore,
        projector: PlanProjector<R>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let transformer = Transformer::new(config.sync.filial_id);
        Self {
            config,
            reader,
            crm,
            transformer,
            reconciler,
            queue,
            watermark,
            projector,
            clock,
        }
    }

    /// Diagnostic access to the retry queue (tests and tooling only read
    /// through this; the scheduler stays the single writer).
    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Run cycles until the shutdown token fires. Liveness problems at
    /// startup are logged, not fatal: a transient source or CRM outage must
    /// not keep the process from entering its loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        info!("starting sync scheduler");
        if !self.reader.ping().await {
            warn!("source liveness probe failed at startup, continuing anyway");
        }
        if !self.crm.ping().await {
            warn!("CRM liveness probe failed at startup, continuing anyway");
        }

        let interval = TokioDuration::from_secs(self.config.sync.interval_minutes * 60);
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let cycle_started = Instant::now();
            match self.cycle(&shutdown).await {
                Ok(stats) => {
                    histogram!("sync_cycle_duration_ms")
                        .record(cycle_started.elapsed().as_secs_f64() * 1_000.0);
                    info!(
                        attempted = stats.attempted,
                        succeeded = stats.succeeded,
                        enqueued = stats.enqueued,
                        skipped = stats.skipped,
                        data_quality = stats.data_quality,
                        retried = stats.retried,
                        retried_ok = stats.retried_ok,
                        duration_ms = cycle_started.elapsed().as_millis() as u64,
                        "cycle completed"
                    );
                }
                // Unreadable queue or watermark state cannot be worked
                // around; surface it to the binary for exit code 2.
                Err(err @ BridgeError::StorageCorrupt(_)) => return Err(err),
                Err(err) => error!(error = %err, "cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }

        info!("sync scheduler stopped");
        Ok(())
    }

    /// One full pass: drain the retry queue, stream the source, reconcile,
    /// advance the watermark.
    pub async fn cycle(&self, shutdown: &CancellationToken) -> Result<CycleStats, BridgeError> {
        let mut stats = CycleStats::default();

        let watermark = match self.watermark.load()? {
            Some(watermark) => watermark,
            None => {
                let initial = self.clock.now()
                    - ChronoDuration::days(self.config.sync.initial_sync_days);
                info!(
                    watermark = %initial,
                    "no persisted watermark, starting {} days back",
                    self.config.sync.initial_sync_days
                );
                initial
            }
        };

        self.drain_queue(&mut stats).await;

        // Stream the source in pages ordered by change marker. Watermark
        // candidate tracking: only records that are reflected, enqueued, or
        // deliberately skipped move it; the first non-durable failure
        // freezes it for the rest of the cycle.
        let mut candidate: Option<DateTime<Utc>> = None;
        let mut advance_blocked = false;
        let mut cursor: Option<PageCursor> = None;

        'pages: loop {
            let page = match self
                .reader
                .read_since(watermark, cursor, self.config.sync.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "source read failed, cycle abandoned");
                    counter!("sync_source_errors_total").increment(1);
                    advance_blocked = true;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            cursor = page.last().and_then(|appointment| {
                appointment.change_marker_max().map(|marker| PageCursor {
                    change_marker: marker,
                    row_id: appointment.row_id,
                })
            });

            // Transform the page, keeping the row order: rejected rows are
            // remembered by their marker so the watermark can still move
            // over them in sequence.
            enum RowWork {
                Rejected(Option<DateTime<Utc>>),
                Record(CanonicalRecord),
            }
            let mut works: Vec<RowWork> = Vec::with_capacity(page.len());
            let mut records: Vec<CanonicalRecord> = Vec::new();
            for appointment in &page {
                stats.attempted += 1;
                match self.transformer.transform(appointment) {
                    Ok(record) => {
                        records.push(record.clone());
                        works.push(RowWork::Record(record));
                    }
                    Err(err) => {
                        stats.data_quality += 1;
                        counter!("sync_data_quality_total").increment(1);
                        warn!(row_id = appointment.row_id, error = %err, "row dropped");
                        works.push(RowWork::Rejected(appointment.change_marker_max()));
                    }
                }
            }

            let mut interrupted = false;
            let mut outcomes: Vec<Result<i64, BridgeError>> = Vec::new();
            for chunk in records.chunks(self.config.sync.api_batch_size) {
                outcomes.extend(
                    self.reconciler
                        .reconcile_batch(chunk)
                        .await
                        .into_iter()
                        .map(|(_, outcome)| outcome),
                );
                if shutdown.is_cancelled() {
                    info!("shutdown requested, finishing cycle early");
                    interrupted = true;
                    break;
                }
            }

            // Fold outcomes back in row order; rows past an interrupted
            // chunk stay unaccounted and are re-read next cycle.
            let mut outcome_iter = outcomes.into_iter();
            for work in works {
                match work {
                    RowWork::Rejected(marker) => {
                        if let (Some(marker), false) = (marker, advance_blocked) {
                            candidate = Some(candidate.map_or(marker, |c| c.max(marker)));
                        }
                    }
                    RowWork::Record(record) => {
                        let Some(outcome) = outcome_iter.next() else {
                            break;
                        };
                        self.settle_outcome(
                            record,
                            outcome,
                            &mut stats,
                            &mut candidate,
                            &mut advance_blocked,
                        )
                        .await;
                    }
                }
            }
            if interrupted {
                break 'pages;
            }

            let full_page = page.len() as u64 >= self.config.sync.batch_size;
            if !full_page || cursor.is_none() {
                break;
            }
        }

        if let Some(candidate) = candidate {
            // Monotonic by construction: every contributing marker is >= the
            // watermark the page query used.
            self.watermark.save(candidate)?;
            debug!(watermark = %candidate, "watermark advanced");
        }

        match self.queue.prune(self.clock.now()).await {
            Ok(0) => {}
            Ok(dead) => warn!(dead, "records moved to dead letters"),
            Err(err) => error!(error = %err, "queue prune failed"),
        }
        if let Ok(depth) = self.queue.depth().await {
            gauge!("sync_queue_depth").set(depth as f64);
        }
        counter!("sync_records_attempted_total").increment(stats.attempted);
        counter!("sync_records_succeeded_total").increment(stats.succeeded);
        counter!("sync_records_enqueued_total").increment(stats.enqueued);

        Ok(stats)
    }

    /// Fold one reconciliation outcome into the cycle state.
    async fn settle_outcome(
        &self,
        record: CanonicalRecord,
        outcome: Result<i64, BridgeError>,
        stats: &mut CycleStats,
        candidate: &mut Option<DateTime<Utc>>,
        advance_blocked: &mut bool,
    ) {
        let marker = record.source_timestamps_max;
        fn account(candidate: &mut Option<DateTime<Utc>>, blocked: bool, marker: DateTime<Utc>) {
            if !blocked {
                *candidate = Some(candidate.map_or(marker, |c| c.max(marker)));
            }
        }

        match outcome {
            Ok(deal_id) => {
                stats.succeeded += 1;
                account(candidate, *advance_blocked, marker);
                // A stale queue entry for this id is settled now.
                if let Err(err) = self.queue.mark_success(&record.external_id).await {
                    error!(error = %err, "failed to clear queue entry");
                }
                self.projector.project(&record, deal_id).await;
            }
            Err(err) if !err.should_enqueue() => {
                stats.skipped += 1;
                if matches!(err, BridgeError::AutoBindAmbiguous { .. }) {
                    counter!("sync_auto_bind_ambiguous_total").increment(1);
                }
                warn!(
                    external_id = %record.external_id,
                    error = %err,
                    kind = err.kind(),
                    "record skipped, not eligible for retry"
                );
                account(candidate, *advance_blocked, marker);
            }
            Err(err) => {
                match self.queue.enqueue(&record, &err, self.clock.now()).await {
                    Ok(true) => {
                        stats.enqueued += 1;
                        warn!(external_id = %record.external_id, error = %err, "record enqueued");
                        account(candidate, *advance_blocked, marker);
                    }
                    Ok(false) => {
                        // Queue full: the record is not durably remembered,
                        // so the watermark must not move past it.
                        *advance_blocked = true;
                        error!(
                            external_id = %record.external_id,
                            error = %err,
                            "queue full, watermark advance blocked"
                        );
                    }
                    Err(store_err) => {
                        *advance_blocked = true;
                        error!(
                            external_id = %record.external_id,
                            error = %store_err,
                            "queue write failed, watermark advance blocked"
                        );
                    }
                }
            }
        }
    }

    /// Reprocess queued records whose next attempt is due.
    async fn drain_queue(&self, stats: &mut CycleStats) {
        let now = self.clock.now();
        let due = match self.queue.due(now).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to read due queue items");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "retrying queued records");

        let records: Vec<CanonicalRecord> = due.iter().map(|item| item.record.clone()).collect();
        for (record, outcome) in self.reconciler.reconcile_batch(&records).await {
            stats.retried += 1;
            match outcome {
                Ok(deal_id) => {
                    stats.retried_ok += 1;
                    if let Err(err) = self.queue.mark_success(&record.external_id).await {
                        error!(error = %err, "failed to dequeue record");
                    }
                    info!(external_id = %record.external_id, "queued record synced");
                    self.projector.project(&record, deal_id).await;
                }
                Err(err) if !err.should_enqueue() => {
                    // Ambiguity and its kin do not resolve by retrying;
                    // drop the item with a warning.
                    warn!(
                        external_id = %record.external_id,
                        error = %err,
                        kind = err.kind(),
                        "queued record dropped, retrying cannot fix it"
                    );
                    if let Err(store_err) = self.queue.mark_success(&record.external_id).await {
                        error!(error = %store_err, "failed to dequeue record");
                    }
                }
                Err(err) => {
                    if let Err(store_err) = self
                        .queue
                        .mark_failure(&record.external_id, &err, self.clock.now())
                        .await
                    {
                        error!(error = %store_err, "failed to record queue failure");
                    }
                }
            }
        }
    }
}
