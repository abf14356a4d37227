// SPDX-License-Identifier: Apache-2.0

//! Lightweight in-memory engine counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct EngineMetrics {
    rows_scanned: AtomicU64,
    commits: AtomicU64,
    failed_applies: AtomicU64,
    rollbacks: AtomicU64,
    stale_rejections: AtomicU64,
    pushed_scans: AtomicU64,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

fn metrics() -> &'static EngineMetrics {
    ENGINE_METRICS.get_or_init(EngineMetrics::default)
}

pub fn record_row_scanned() {
    metrics().rows_scanned.fetch_add(1, Ordering::Relaxed);
}

pub fn record_commit(success: bool) {
    let metrics = metrics();
    metrics.commits.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed_applies.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_rollback() {
    metrics().rollbacks.fetch_add(1, Ordering::Relaxed);
}

pub fn record_stale() {
    metrics().stale_rejections.fetch_add(1, Ordering::Relaxed);
}

/// A scan was answered from rows a factory filtered.
pub fn record_pushdown() {
    metrics().pushed_scans.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSnapshot {
    pub rows_scanned: u64,
    pub commits: u64,
    pub failed_applies: u64,
    pub rollbacks: u64,
    pub stale_rejections: u64,
    pub pushed_scans: u64,
}

pub fn snapshot() -> EngineMetricsSnapshot {
    let metrics = metrics();
    EngineMetricsSnapshot {
        rows_scanned: metrics.rows_scanned.load(Ordering::Relaxed),
        commits: metrics.commits.load(Ordering::Relaxed),
        failed_applies: metrics.failed_applies.load(Ordering::Relaxed),
        rollbacks: metrics.rollbacks.load(Ordering::Relaxed),
        stale_rejections: metrics.stale_rejections.load(Ordering::Relaxed),
        pushed_scans: metrics.pushed_scans.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_commit_counts_as_commit_and_failure() {
        let before = snapshot();
        record_commit(false);
        record_stale();
        let after = snapshot();
        // Other tests record concurrently; counters only grow.
        assert!(after.commits > before.commits);
        assert!(after.failed_applies > before.failed_applies);
        assert!(after.stale_rejections > before.stale_rejections);
    }
}
