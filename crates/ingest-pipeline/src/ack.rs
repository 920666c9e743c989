// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::trace;

use crate::journal::Journal;
use crate::metrics::{AckMetrics, AckSnapshot};

/// Commits journal offsets of messages that have left the pipeline.
///
/// Only the highest offset of a call is committed: journal order makes every
/// lower offset safe as well. Acknowledging an offset at or below the committed
/// one does nothing.
#[derive(Debug)]
pub struct Acknowledger {
    journal: Arc<Journal>,
    metrics: AckMetrics,
}

impl Acknowledger {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            metrics: AckMetrics::default(),
        }
    }

    /// Returns `true` if the committed offset advanced.
    pub fn acknowledge(&self, offset: u64) -> bool {
        self.metrics.acknowledged.incr();
        self.commit(offset)
    }

    pub fn acknowledge_all(&self, offsets: impl IntoIterator<Item = u64>) -> bool {
        let mut count = 0u64;
        let mut highest = None;
        for offset in offsets {
            count += 1;
            highest = highest.max(Some(offset));
        }
        self.metrics.acknowledged.add(count);
        match highest {
            Some(offset) => self.commit(offset),
            None => false,
        }
    }

    fn commit(&self, offset: u64) -> bool {
        let advanced = self.journal.mark_committed(offset);
        if advanced {
            self.metrics.commits.incr();
            trace!(offset, "Committed journal offset");
        }
        advanced
    }

    pub fn snapshot(&self) -> AckSnapshot {
        AckSnapshot::from(&self.metrics)
    }
}
