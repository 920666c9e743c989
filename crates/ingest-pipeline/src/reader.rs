// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::ack::Acknowledger;
use crate::journal::Journal;
use crate::message::{Decoded, DecodedMessage, JournalEntry, MessageDecoder};
use crate::metrics::{ReaderMetrics, ReaderSnapshot};
use crate::stage::Stage;
use crate::wake::WakeSignal;

const PAUSE_RECHECK: Duration = Duration::from_millis(100);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Administrative pause/resume flag gating the reader and the drain workers
#[derive(Debug, Default)]
pub struct ProcessingControl {
    paused: AtomicBool,
}

impl ProcessingControl {
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("Message processing paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("Message processing resumed");
        }
    }

    pub fn is_processing(&self) -> bool {
        !self.paused.load(Ordering::Acquire)
    }
}

/// Single loop moving journaled entries into the process stage.
///
/// The reader only asks the journal for as many entries as the stage can take,
/// then hands each one over with a blocking insert. An entry counts as delivered
/// once it sits in the stage; anything read but not yet inserted when the reader
/// stops stays uncommitted and is replayed after a restart.
pub struct JournalReader {
    journal: Arc<Journal>,
    stage: Arc<Stage<DecodedMessage>>,
    decoder: Arc<dyn MessageDecoder>,
    acknowledger: Arc<Acknowledger>,
    control: Arc<ProcessingControl>,
    wake: Arc<WakeSignal>,
    metrics: Arc<ReaderMetrics>,
}

impl JournalReader {
    pub fn new(
        journal: Arc<Journal>,
        stage: Arc<Stage<DecodedMessage>>,
        decoder: Arc<dyn MessageDecoder>,
        acknowledger: Arc<Acknowledger>,
        control: Arc<ProcessingControl>,
    ) -> Self {
        let wake = journal.wake_signal();
        Self {
            journal,
            stage,
            decoder,
            acknowledger,
            control,
            wake,
            metrics: Arc::new(ReaderMetrics::default()),
        }
    }

    /// Shared handle to the reader counters, still readable after the reader stops
    pub fn metrics(&self) -> Arc<ReaderMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(info_span!("journal_reader")))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Journal reader started");

        while !cancel.is_cancelled() {
            if !self.control.is_processing() {
                tokio::select! {
                    () = tokio::time::sleep(PAUSE_RECHECK) => continue,
                    () = cancel.cancelled() => break,
                }
            }

            let remaining = self.stage.remaining_capacity().max(1);
            let batch = tokio::select! {
                batch = self.journal.read(remaining) => batch,
                () = cancel.cancelled() => break,
            };

            let entries = match batch {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "Failed to read from journal, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                        () = cancel.cancelled() => break,
                    }
                }
            };

            if entries.is_empty() {
                if !self.wake.wait(&cancel).await {
                    break;
                }
                continue;
            }

            self.metrics.read.add(entries.len() as u64);
            self.metrics.max_batch.observe(entries.len() as u64);
            debug!(count = entries.len(), remaining, "Read journal batch");

            for entry in entries {
                if !self.deliver(entry, &cancel).await {
                    break;
                }
            }
        }

        info!("Journal reader stopped");
    }

    /// Returns `false` once the reader was cancelled while inserting.
    async fn deliver(&self, entry: JournalEntry, cancel: &CancellationToken) -> bool {
        match self.decoder.decode(&entry) {
            Ok(Decoded::Message(message)) => {
                match self.stage.insert_blocking(message, cancel).await {
                    Ok(()) => {
                        self.metrics.delivered.incr();
                        true
                    }
                    Err(rejected) => {
                        debug!(
                            offset = rejected.message.offset,
                            "Reader stopped before the entry reached the process stage"
                        );
                        false
                    }
                }
            }
            Ok(Decoded::Incomplete { reason }) => {
                self.metrics.incomplete.incr();
                debug!(
                    offset = entry.offset,
                    message_id = %entry.message_id_lossy(),
                    reason = %reason,
                    "Dropping incomplete message"
                );
                self.acknowledger.acknowledge(entry.offset);
                true
            }
            Err(e) => {
                self.metrics.corrupt_entries.incr();
                warn!(
                    offset = entry.offset,
                    message_id = %entry.message_id_lossy(),
                    error = %e,
                    "Skipping unreadable journal entry"
                );
                true
            }
        }
    }
}

pub(crate) fn reader_snapshot(metrics: &ReaderMetrics, control: &ProcessingControl) -> ReaderSnapshot {
    ReaderSnapshot {
        read: metrics.read.get(),
        max_batch: metrics.max_batch.get(),
        delivered: metrics.delivered.get(),
        corrupt_entries: metrics.corrupt_entries.get(),
        incomplete: metrics.incomplete.get(),
        paused: !control.is_processing(),
    }
}
