//! Treatment plan projection.
//!
//! Renders an appointment's plan lines into a deterministic multi-line
//! string and reflects it into the deal's plan field, but only when the
//! rendering actually changed and not more often than the throttle window.
//! The hash cache persists across restarts via an atomically replaced JSON
//! file; losing it is harmless (the next cycle repopulates it), so cache
//! problems never escalate beyond warnings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::crm::CrmClient;
use crate::error::BridgeError;
use crate::source::{SourceReader, TreatmentPlanLine};
use crate::transform::{parse_external_id, CanonicalRecord};

const CACHE_FILE_VERSION: u32 = 1;

/// Fraction of entries dropped when the cache outgrows its bound.
const EVICTION_FRACTION: f64 = 0.1;

/// Render plan lines into the stable text written to the CRM. Lines are
/// sorted by line id so the output never depends on query order.
pub fn render_plan(lines: &[TreatmentPlanLine]) -> String {
    let mut sorted: Vec<&TreatmentPlanLine> = lines.iter().collect();
    sorted.sort_by_key(|line| line.line_id);

    let mut out = String::new();
    let mut total = 0.0;
    for line in sorted {
        let amount = line.amount();
        total += amount;
        out.push_str(&format!("{}× {} — {:.2}\n", line.count, line.name, amount));
    }
    out.push_str(&format!("Итого: {total:.2}"));
    out
}

/// Stable fingerprint of a rendered plan.
pub fn plan_hash(rendered: &str) -> String {
    let digest = Sha256::digest(rendered.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanCacheEntry {
    pub deal_id: i64,
    pub last_hash: String,
    pub last_applied_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, PlanCacheEntry>,
}

/// On-disk hash cache keyed by external id.
pub struct PlanCache {
    path: PathBuf,
    max_entries: usize,
    entries: HashMap<String, PlanCacheEntry>,
}

impl PlanCache {
    /// Load the cache, tolerating a missing or unreadable file: the cache is
    /// rebuildable state, so corruption only warns and starts empty.
    pub fn load(path: PathBuf, max_entries: usize) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CacheFile>(&raw) {
                Ok(file) if file.version == CACHE_FILE_VERSION => file.entries,
                Ok(file) => {
                    warn!(
                        version = file.version,
                        "plan cache has unknown version, starting empty"
                    );
                    HashMap::new()
                }
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "plan cache unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "plan cache unreadable, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            max_entries,
            entries,
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&PlanCacheEntry> {
        self.entries.get(external_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an applied projection and persist the cache atomically.
    pub fn record(
        &mut self,
        external_id: &str,
        deal_id: i64,
        hash: String,
        applied_at: DateTime<Utc>,
    ) -> std::io::Result<()> {
        self.entries.insert(
            external_id.to_string(),
            PlanCacheEntry {
                deal_id,
                last_hash: hash,
                last_applied_at: applied_at,
            },
        );
        self.evict_if_needed();
        self.save()
    }

    /// Drop the ~10% oldest entries by last application time once the bound
    /// is exceeded.
    fn evict_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let to_remove = ((self.max_entries as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_applied_at))
            .collect();
        by_age.sort_by_key(|(_, applied_at)| *applied_at);
        for (key, _) in by_age.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        debug!(removed = to_remove, "plan cache evicted oldest entries");
    }

    /// Write to a temp file in the same directory, then rename over the live
    /// file. An interrupted write leaves the previous cache intact.
    fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            version: CACHE_FILE_VERSION,
            entries: self.entries.clone(),
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Reflects treatment plans into the CRM, out-of-band from reconciliation.
pub struct PlanProjector<R> {
    reader: Arc<R>,
    crm: Arc<CrmClient>,
    clock: Arc<dyn Clock>,
    throttle: Duration,
    cache: Mutex<PlanCache>,
}

impl<R: SourceReader> PlanProjector<R> {
    pub fn new(
        reader: Arc<R>,
        crm: Arc<CrmClient>,
        clock: Arc<dyn Clock>,
        cache: PlanCache,
        throttle_minutes: i64,
    ) -> Self {
        Self {
            reader,
            crm,
            clock,
            throttle: Duration::minutes(throttle_minutes),
            cache: Mutex::new(cache),
        }
    }

    /// Project the plan for one reconciled record. Never propagates errors
    /// into the reconciliation path.
    pub async fn project(&self, record: &CanonicalRecord, deal_id: i64) {
        match self.try_project(record, deal_id).await {
            Ok(true) => {
                metrics::counter!("plan_updates_total").increment(1);
            }
            Ok(false) => {}
            Err(err) => {
                metrics::counter!("plan_errors_total").increment(1);
                warn!(
                    external_id = %record.external_id,
                    deal_id,
                    error = %err,
                    "plan projection skipped"
                );
            }
        }
    }

    /// Returns whether the CRM was updated.
    async fn try_project(
        &self,
        record: &CanonicalRecord,
        deal_id: i64,
    ) -> Result<bool, BridgeError> {
        let Some((_, row_id)) = parse_external_id(&record.external_id) else {
            return Err(BridgeError::DataQuality(format!(
                "unparseable external id '{}'",
                record.external_id
            )));
        };

        let now = self.clock.now();
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&record.external_id) {
                if now - entry.last_applied_at < self.throttle {
                    debug!(
                        external_id = %record.external_id,
                        "plan update throttled"
                    );
                    return Ok(false);
                }
            }
        }

        let lines = self.reader.read_plan_lines(row_id).await?;
        if lines.is_empty() {
            return Ok(false);
        }

        let rendered = render_plan(&lines);
        let hash = plan_hash(&rendered);
        {
            let cache = self.cache.lock().await;
            if cache
                .get(&record.external_id)
                .is_some_and(|entry| entry.last_hash == hash)
            {
                debug!(external_id = %record.external_id, "plan unchanged");
                return Ok(false);
            }
        }

        self.crm.append_note(deal_id, &rendered).await?;

        let mut cache = self.cache.lock().await;
        if let Err(err) = cache.record(&record.external_id, deal_id, hash, now) {
            // Rebuildable state: losing it costs one redundant update later.
            warn!(error = %err, "plan cache write failed");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lines() -> Vec<TreatmentPlanLine> {
        vec![
            TreatmentPlanLine {
                line_id: 2,
                name: "Коронка".to_string(),
                count: 1,
                unit_price: 12000.0,
                discount: 0.0,
            },
            TreatmentPlanLine {
                line_id: 1,
                name: "Слепок".to_string(),
                count: 2,
                unit_price: 1500.0,
                discount: 500.0,
            },
        ]
    }

    #[test]
    fn rendering_is_sorted_and_deterministic() {
        let rendered = render_plan(&lines());
        assert_eq!(
            rendered,
            "2× Слепок — 2500.00\n1× Коронка — 12000.00\nИтого: 14500.00"
        );

        let mut reversed = lines();
        reversed.reverse();
        assert_eq!(render_plan(&reversed), rendered);
    }

    #[test]
    fn hash_tracks_content() {
        let a = plan_hash(&render_plan(&lines()));
        assert_eq!(a.len(), 16);

        let mut changed = lines();
        changed[0].unit_price += 1.0;
        let b = plan_hash(&render_plan(&changed));
        assert_ne!(a, b);

        assert_eq!(a, plan_hash(&render_plan(&lines())));
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan_cache.store");
        let applied = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut cache = PlanCache::load(path.clone(), 100);
        cache.record("F1_42", 7, "abc".to_string(), applied).unwrap();

        let reloaded = PlanCache::load(path.clone(), 100);
        assert_eq!(
            reloaded.get("F1_42"),
            Some(&PlanCacheEntry {
                deal_id: 7,
                last_hash: "abc".to_string(),
                last_applied_at: applied,
            })
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan_cache.store");
        std::fs::write(&path, "{ not json").unwrap();
        let cache = PlanCache::load(path, 100);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_drops_oldest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = PlanCache::load(dir.path().join("cache"), 10);
        for i in 0..11 {
            let applied = Utc.timestamp_opt(1_000 + i, 0).unwrap();
            cache
                .record(&format!("F1_{i}"), i, format!("h{i}"), applied)
                .unwrap();
        }
        assert_eq!(cache.len(), 10);
        // The oldest entry went first.
        assert!(cache.get("F1_0").is_none());
        assert!(cache.get("F1_10").is_some());
    }
}
