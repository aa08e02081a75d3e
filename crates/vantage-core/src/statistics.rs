use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-query counters, safe for concurrent writers.
#[derive(Debug, Default)]
pub struct QueryStatistics {
    remote_calls: AtomicU64,
    failed_calls: AtomicU64,
    cache_hits: AtomicU64,
    batch_calls: AtomicU64,
    batch_fallbacks: AtomicU64,
    failed_searches: AtomicU64,
    cost: AtomicU64,
    strategy_wins: DashMap<&'static str, u64>,
    call_timings: DashMap<String, Vec<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStatisticsSnapshot {
    pub remote_calls: u64,
    pub failed_calls: u64,
    pub cache_hits: u64,
    pub batch_calls: u64,
    pub batch_fallbacks: u64,
    pub failed_searches: u64,
    pub cost: u64,
    pub strategy_wins: HashMap<String, u64>,
    /// Milliseconds per call, keyed by operation.
    pub call_timings: HashMap<String, Vec<u64>>,
}

impl QueryStatistics {
    pub fn record_call(&self, operation: &str, duration_ms: u64, success: bool, cost: u32) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.cost.fetch_add(cost as u64, Ordering::Relaxed);
        self.call_timings.entry(operation.to_string()).or_default().push(duration_ms);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_call(&self) {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_fallback(&self) {
        self.batch_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_search(&self) {
        self.failed_searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_strategy_win(&self, strategy: &'static str) {
        *self.strategy_wins.entry(strategy).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> QueryStatisticsSnapshot {
        QueryStatisticsSnapshot {
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            batch_calls: self.batch_calls.load(Ordering::Relaxed),
            batch_fallbacks: self.batch_fallbacks.load(Ordering::Relaxed),
            failed_searches: self.failed_searches.load(Ordering::Relaxed),
            cost: self.cost.load(Ordering::Relaxed),
            strategy_wins: self.strategy_wins.iter().map(|e| (e.key().to_string(), *e.value())).collect(),
            call_timings: self.call_timings.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
        }
    }
}

impl QueryStatisticsSnapshot {
    /// No discovery failed and no remote call failed.
    pub fn is_fully_resolved(&self) -> bool {
        self.failed_searches == 0 && self.failed_calls == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = QueryStatistics::default();
        stats.record_call("FilmService::getFilm", 12, true, 10);
        stats.record_call("FilmService::getFilm", 8, false, 10);
        stats.record_strategy_win("direct");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.remote_calls, 2);
        assert_eq!(snapshot.cost, 20);
        assert_eq!(snapshot.call_timings["FilmService::getFilm"], vec![12, 8]);
        assert_eq!(snapshot.strategy_wins["direct"], 1);
        assert!(!snapshot.is_fully_resolved());
    }
}
