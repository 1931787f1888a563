//! Telemetry aggregator: counters, gauges and histograms derived from
//! lifecycle and execution activity.
//!
//! Series are kept in process and updated synchronously by
//! `record_execution`; gauges over entity populations are computed at
//! snapshot time from a handful of batched store reads rather than one
//! query per metric.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use traceline_common::{
    AttemptState, CoreError, EntityKind, ErrorCategory, JobState, MissionState, now_rfc3339,
};

use crate::store::DbHandle;

/// Upper bounds (milliseconds) of the execution-duration histogram.
const DURATION_BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[derive(Default)]
struct DurationHistogram {
    /// One count per bucket bound plus the overflow bucket.
    bucket_counts: [u64; DURATION_BUCKETS_MS.len() + 1],
    sum_ms: u64,
    count: u64,
}

impl DurationHistogram {
    fn observe(&mut self, duration_ms: u64) {
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|&le| duration_ms <= le)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.bucket_counts[idx] += 1;
        self.sum_ms += duration_ms;
        self.count += 1;
    }

    /// Cumulative buckets in the shape pull-based collectors expect.
    fn view(&self) -> HistogramView {
        let mut cumulative = 0;
        let mut buckets = Vec::with_capacity(self.bucket_counts.len());
        for (i, count) in self.bucket_counts.iter().enumerate() {
            cumulative += count;
            let le = DURATION_BUCKETS_MS
                .get(i)
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            buckets.push(HistogramBucket { le, count: cumulative });
        }
        HistogramView {
            buckets,
            sum_ms: self.sum_ms,
            count: self.count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramView {
    pub buckets: Vec<HistogramBucket>,
    pub sum_ms: u64,
    pub count: u64,
}

/// Raw metric values for external scraping.
#[derive(Debug, Clone, Serialize)]
pub struct RawMetrics {
    pub attempts_total: BTreeMap<String, u64>,
    pub errors_by_category: BTreeMap<String, u64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub execution_duration_ms: HistogramView,
}

/// Gauges over currently active work.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecutions {
    pub running_attempts: i64,
    pub queued_jobs: i64,
    pub active_missions: i64,
}

/// Failure counts split by error category.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBreakdown {
    pub mechanical: u64,
    pub ethical: u64,
    pub system: u64,
}

/// One consistent point-in-time read of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub captured_at: String,
    pub entity_counts: BTreeMap<String, i64>,
    pub active: ActiveExecutions,
    pub errors: ErrorBreakdown,
    pub metrics: RawMetrics,
}

pub struct Telemetry {
    db: DbHandle,
    attempts_total: DashMap<String, u64>,
    errors_by_category: DashMap<String, u64>,
    errors_by_type: DashMap<String, u64>,
    durations: Mutex<DurationHistogram>,
}

impl Telemetry {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            attempts_total: DashMap::new(),
            errors_by_category: DashMap::new(),
            errors_by_type: DashMap::new(),
            durations: Mutex::new(DurationHistogram::default()),
        }
    }

    /// Record the outcome of one wrapped execution. The attempts-total
    /// series is labeled `{entity_type}:{terminal_status}`, with the
    /// entity type read off the id's discriminating prefix.
    pub fn record_execution(
        &self,
        entity_id: &str,
        success: bool,
        duration_ms: u64,
        error_type: Option<&str>,
        error_category: Option<ErrorCategory>,
    ) {
        let status = if success { "succeeded" } else { "failed" };
        let label = format!("{}:{}", kind_label(entity_id), status);
        *self.attempts_total.entry(label).or_insert(0) += 1;

        if let Ok(mut histogram) = self.durations.lock() {
            histogram.observe(duration_ms);
        }

        if !success {
            let category = error_category.unwrap_or(ErrorCategory::Mechanical);
            *self
                .errors_by_category
                .entry(category.as_str().to_string())
                .or_insert(0) += 1;
            *self
                .errors_by_type
                .entry(error_type.unwrap_or("unknown").to_string())
                .or_insert(0) += 1;
        }

        debug!(
            entity_id = %entity_id,
            success,
            duration_ms,
            error_type = error_type.unwrap_or(""),
            "execution recorded"
        );
    }

    /// Raw series values without touching the store.
    pub fn raw_metrics(&self) -> RawMetrics {
        let histogram = self
            .durations
            .lock()
            .map(|h| h.view())
            .unwrap_or_else(|_| DurationHistogram::default().view());
        RawMetrics {
            attempts_total: collect_map(&self.attempts_total),
            errors_by_category: collect_map(&self.errors_by_category),
            errors_by_type: collect_map(&self.errors_by_type),
            execution_duration_ms: histogram,
        }
    }

    /// One consistent snapshot: two batched store reads (entity counts and
    /// grouped state counts) merged with the in-process series.
    pub async fn snapshot(&self) -> Result<SystemSnapshot, CoreError> {
        let (entity_counts, state_counts) = self
            .db
            .call(|db| Ok((db.entity_counts()?, db.state_counts()?)))
            .await
            .map_err(CoreError::storage)?;

        let mut running_attempts = 0;
        let mut queued_jobs = 0;
        let mut active_missions = 0;
        for row in &state_counts {
            match row.entity_type.as_str() {
                "attempt" => {
                    if row.state == AttemptState::Running.as_str() {
                        running_attempts += row.count;
                    }
                }
                "job" => {
                    if row.state == JobState::Pending.as_str() {
                        queued_jobs += row.count;
                    }
                }
                "mission" => {
                    let non_terminal = MissionState::from_str(&row.state)
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false);
                    if non_terminal {
                        active_missions += row.count;
                    }
                }
                _ => {}
            }
        }

        let by_category = collect_map(&self.errors_by_category);
        let errors = ErrorBreakdown {
            mechanical: by_category
                .get(ErrorCategory::Mechanical.as_str())
                .copied()
                .unwrap_or(0),
            ethical: by_category
                .get(ErrorCategory::Ethical.as_str())
                .copied()
                .unwrap_or(0),
            system: by_category
                .get(ErrorCategory::System.as_str())
                .copied()
                .unwrap_or(0),
        };

        Ok(SystemSnapshot {
            captured_at: now_rfc3339(),
            entity_counts,
            active: ActiveExecutions {
                running_attempts,
                queued_jobs,
                active_missions,
            },
            errors,
            metrics: self.raw_metrics(),
        })
    }
}

fn kind_label(entity_id: &str) -> &'static str {
    [
        EntityKind::Mission,
        EntityKind::Plan,
        EntityKind::Job,
        EntityKind::Attempt,
        EntityKind::Resource,
    ]
    .into_iter()
    .find(|kind| kind.owns_id(entity_id))
    .map(|kind| kind.as_str())
    .unwrap_or("unknown")
}

fn collect_map(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}
