// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters and gauges exposed by each pipeline component.
//!
//! Components own their metric structs and bump them with relaxed atomics. A
//! serializable [`MetricsSnapshot`] is assembled on demand for an external sink.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Largest value observed so far
#[derive(Debug, Default)]
pub struct MaxGauge(AtomicU64);

impl MaxGauge {
    pub fn observe(&self, n: u64) {
        self.0.fetch_max(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct JournalMetrics {
    pub written: Counter,
    pub read: Counter,
    pub discarded: Counter,
    pub corrupt: Counter,
}

#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub batches: Counter,
    /// Entries handed to the journal, including any it discarded as oversized
    pub submitted: Counter,
    pub write_failures: Counter,
}

#[derive(Debug, Default)]
pub struct ReaderMetrics {
    pub read: Counter,
    /// Largest batch read in one go, bounded by the process stage's free capacity
    pub max_batch: MaxGauge,
    pub delivered: Counter,
    pub corrupt_entries: Counter,
    pub incomplete: Counter,
}

#[derive(Debug, Default)]
pub struct StageMetrics {
    pub inserted: Counter,
    pub cached: Counter,
    pub rejected: Counter,
    pub processed: Counter,
    pub filtered: Counter,
    pub failed: Counter,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub added: Counter,
    pub drained: Counter,
}

#[derive(Debug, Default)]
pub struct AckMetrics {
    pub acknowledged: Counter,
    pub commits: Counter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalSnapshot {
    pub written: u64,
    pub read: u64,
    pub discarded: u64,
    pub corrupt: u64,
    pub log_start_offset: u64,
    pub log_end_offset: u64,
    /// `None` until something has been committed
    pub committed_offset: Option<u64>,
    pub next_read_offset: u64,
    pub uncommitted_entries: u64,
    pub size_bytes: u64,
    pub segment_count: usize,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterSnapshot {
    pub batches: u64,
    pub submitted: u64,
    pub write_failures: u64,
}

impl From<&WriterMetrics> for WriterSnapshot {
    fn from(m: &WriterMetrics) -> Self {
        Self {
            batches: m.batches.get(),
            submitted: m.submitted.get(),
            write_failures: m.write_failures.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderSnapshot {
    pub read: u64,
    pub max_batch: u64,
    pub delivered: u64,
    pub corrupt_entries: u64,
    pub incomplete: u64,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub name: &'static str,
    pub inserted: u64,
    pub cached: u64,
    pub rejected: u64,
    pub processed: u64,
    pub filtered: u64,
    pub failed: u64,
    pub used: usize,
    pub capacity: usize,
    pub cache_len: usize,
    pub cache_added: u64,
    pub cache_drained: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckSnapshot {
    pub acknowledged: u64,
    pub commits: u64,
}

impl From<&AckMetrics> for AckSnapshot {
    fn from(m: &AckMetrics) -> Self {
        Self {
            acknowledged: m.acknowledged.get(),
            commits: m.commits.get(),
        }
    }
}

/// Point-in-time view of every pipeline component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub journal: JournalSnapshot,
    pub writer: WriterSnapshot,
    pub reader: ReaderSnapshot,
    pub process_stage: StageSnapshot,
    pub output_stage: StageSnapshot,
    pub acknowledger: AckSnapshot,
}
