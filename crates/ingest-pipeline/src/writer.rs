// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::journal::Journal;
use crate::message::RawEntry;
use crate::metrics::{WriterMetrics, WriterSnapshot};
use crate::retry::{retry, RetryError, RetryPolicy};

/// Entry point for inputs: durably journals raw entries.
///
/// Storage failures are retried until they succeed, so a struggling disk slows
/// ingestion down instead of losing data. The only error a caller sees is a shut
/// down journal (or writer), which it should treat as a signal to stop accepting
/// traffic at the network edge.
#[derive(Debug, Clone)]
pub struct JournalWriter {
    journal: Arc<Journal>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    metrics: Arc<WriterMetrics>,
}

impl JournalWriter {
    pub fn new(journal: Arc<Journal>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            journal,
            policy,
            cancel,
            metrics: Arc::new(WriterMetrics::default()),
        }
    }

    /// Journals `entries` and returns the highest assigned offset, if any entry was kept.
    pub async fn write(&self, entries: &[RawEntry]) -> Result<Option<u64>, PipelineError> {
        if entries.is_empty() {
            return Ok(None);
        }

        let journal = &self.journal;
        let metrics = &self.metrics;
        let policy = &self.policy;

        let result = retry(
            policy,
            &self.cancel,
            |attempt| async move {
                match journal.append(entries).await {
                    Err(e) if e.is_retryable() => {
                        metrics.write_failures.incr();
                        warn!(
                            attempt,
                            delay_ms = policy.backoff.delay(attempt).as_millis() as u64,
                            error = %e,
                            "Journal write failed, retrying"
                        );
                        Err(e)
                    }
                    other => other,
                }
            },
            PipelineError::is_retryable,
        )
        .await;

        match result {
            Ok(highest) => {
                self.metrics.batches.incr();
                self.metrics.submitted.add(entries.len() as u64);
                debug!(count = entries.len(), highest = ?highest, "Wrote batch to journal");
                Ok(highest)
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                warn!(attempts, "Journal write abandoned, writer is shutting down");
                Err(PipelineError::Shutdown {
                    component: "journal writer",
                })
            }
            Err(e) => Err(e.into_inner()),
        }
    }

    pub async fn write_one(&self, entry: RawEntry) -> Result<Option<u64>, PipelineError> {
        self.write(std::slice::from_ref(&entry)).await
    }

    pub fn snapshot(&self) -> WriterSnapshot {
        WriterSnapshot::from(self.metrics.as_ref())
    }
}
