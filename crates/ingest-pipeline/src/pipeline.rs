// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the whole pipeline and its controlled shutdown.
//!
//! ```text
//! inputs -> JournalWriter -> Journal -> JournalReader -> process stage -> output stage
//!                                 ^                         (cache)         (cache)
//!                                 +------------ Acknowledger <---------------+
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::Acknowledger;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::journal::Journal;
use crate::message::{DecodedMessage, JsonDecoder, MessageDecoder};
use crate::metrics::{MetricsSnapshot, ReaderMetrics};
use crate::overflow::DrainWorker;
use crate::reader::{reader_snapshot, JournalReader, ProcessingControl};
use crate::shutdown::ShutdownCoordinator;
use crate::stage::output::{MessageOutput, OutputHandler};
use crate::stage::process::{MessageProcessor, ProcessHandler};
use crate::stage::{Stage, StageProbe};
use crate::writer::JournalWriter;

const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Journal is being opened and tasks spawned.
    Starting,
    /// Accepting writes and moving messages through the stages.
    Running,
    /// Draining buffers and stopping tasks.
    Stopping,
    /// Every task stopped and the journal is closed.
    Stopped,
}

pub struct Pipeline;

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            decoder: Arc::new(JsonDecoder),
            processors: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Collects the pluggable parts of a pipeline before it is started.
pub struct PipelineBuilder {
    config: PipelineConfig,
    decoder: Arc<dyn MessageDecoder>,
    processors: Vec<Arc<dyn MessageProcessor>>,
    outputs: Vec<Arc<dyn MessageOutput>>,
}

impl PipelineBuilder {
    /// Replaces the default [`JsonDecoder`].
    pub fn decoder(mut self, decoder: Arc<dyn MessageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Appends a processor; processors run in registration order.
    pub fn processor(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn output(mut self, output: Arc<dyn MessageOutput>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Opens the journal and spawns every pipeline task.
    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        let config = self.config;
        config.validate()?;

        let status = RwLock::new(PipelineStatus::Starting);
        let (status_tx, _status_rx) = broadcast::channel(16);

        let journal = Arc::new(Journal::open(config.journal.clone()).await?);
        let acknowledger = Arc::new(Acknowledger::new(Arc::clone(&journal)));
        let control = Arc::new(ProcessingControl::default());
        let process_stage = Arc::new(Stage::new("process", &config.process_stage));
        let output_stage = Arc::new(Stage::new("output", &config.output_stage));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let output_handler = Arc::new(OutputHandler::new(
            self.outputs,
            Arc::clone(&acknowledger),
        ));
        tasks.extend(output_stage.spawn_workers(output_handler, &cancel));

        let process_handler = Arc::new(ProcessHandler::new(
            self.processors,
            Arc::clone(&output_stage),
            Arc::clone(&acknowledger),
        ));
        tasks.extend(process_stage.spawn_workers(process_handler, &cancel));

        tasks.push(
            DrainWorker::new(
                Arc::clone(&process_stage),
                Arc::clone(&control),
                config.drain_interval,
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(
            DrainWorker::new(
                Arc::clone(&output_stage),
                Arc::clone(&control),
                config.drain_interval,
                cancel.child_token(),
            )
            .spawn(),
        );
        tasks.push(journal.spawn_maintenance(cancel.child_token()));

        let reader_cancel = cancel.child_token();
        let reader = JournalReader::new(
            Arc::clone(&journal),
            Arc::clone(&process_stage),
            self.decoder,
            Arc::clone(&acknowledger),
            Arc::clone(&control),
        );
        let reader_metrics = reader.metrics();
        let reader_task = reader.spawn(reader_cancel.clone());

        let writer = JournalWriter::new(
            Arc::clone(&journal),
            config.write_retry.clone(),
            cancel.child_token(),
        );

        let coordinator = ShutdownCoordinator::new(
            vec![
                Arc::clone(&process_stage) as Arc<dyn StageProbe>,
                Arc::clone(&output_stage) as Arc<dyn StageProbe>,
            ],
            config.shutdown_poll_interval,
        );

        info!(
            journal = %journal.directory().display(),
            process_capacity = process_stage.capacity(),
            process_workers = process_stage.workers(),
            output_capacity = output_stage.capacity(),
            output_workers = output_stage.workers(),
            "Ingestion pipeline started"
        );

        let handle = PipelineHandle {
            inner: Arc::new(Inner {
                journal,
                writer,
                acknowledger,
                control,
                process_stage,
                output_stage,
                reader_metrics,
                coordinator,
                shutdown_max_wait: config.shutdown_max_wait,
                cancel,
                reader_cancel,
                tasks: TokioMutex::new(Some(Tasks {
                    reader: reader_task,
                    workers: tasks,
                })),
                drained: AtomicBool::new(false),
                status,
                status_tx,
            }),
        };
        handle.set_status(PipelineStatus::Running).await;
        Ok(handle)
    }
}

struct Tasks {
    reader: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct Inner {
    journal: Arc<Journal>,
    writer: JournalWriter,
    acknowledger: Arc<Acknowledger>,
    control: Arc<ProcessingControl>,
    process_stage: Arc<Stage<DecodedMessage>>,
    output_stage: Arc<Stage<DecodedMessage>>,
    reader_metrics: Arc<ReaderMetrics>,
    coordinator: ShutdownCoordinator,
    shutdown_max_wait: Duration,
    cancel: CancellationToken,
    reader_cancel: CancellationToken,
    /// `None` once shutdown has run
    tasks: TokioMutex<Option<Tasks>>,
    drained: AtomicBool,
    status: RwLock<PipelineStatus>,
    status_tx: broadcast::Sender<PipelineStatus>,
}

/// Handle to a running pipeline.
///
/// Cloning is cheap and every clone controls the same pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl PipelineHandle {
    /// Writer for inputs to journal raw entries through.
    pub fn writer(&self) -> JournalWriter {
        self.inner.writer.clone()
    }

    /// Stops the reader and the drain workers from moving messages. Writes still succeed.
    pub fn pause(&self) {
        self.inner.control.pause();
    }

    pub fn resume(&self) {
        self.inner.control.resume();
    }

    pub fn is_processing(&self) -> bool {
        self.inner.control.is_processing()
    }

    pub async fn status(&self) -> PipelineStatus {
        *self.inner.status.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.status.read().await, PipelineStatus::Running)
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<PipelineStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    pub fn process_stage(&self) -> &Arc<Stage<DecodedMessage>> {
        &self.inner.process_stage
    }

    pub fn output_stage(&self) -> &Arc<Stage<DecodedMessage>> {
        &self.inner.output_stage
    }

    pub fn acknowledger(&self) -> &Arc<Acknowledger> {
        &self.inner.acknowledger
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            journal: inner.journal.snapshot(),
            writer: inner.writer.snapshot(),
            reader: reader_snapshot(&inner.reader_metrics, &inner.control),
            process_stage: inner.process_stage.snapshot(),
            output_stage: inner.output_stage.snapshot(),
            acknowledger: inner.acknowledger.snapshot(),
        }
    }

    async fn set_status(&self, status: PipelineStatus) {
        *self.inner.status.write().await = status;
        let _ = self.inner.status_tx.send(status);
    }

    /// Stops the pipeline.
    ///
    /// The reader stops first, then the stages get up to `shutdown_max_wait` to
    /// drain before every remaining task is cancelled and the journal is closed.
    /// Returns whether the stages drained in time. Anything left behind is still
    /// uncommitted in the journal and gets replayed on the next start.
    ///
    /// Calling this again after it completed returns the first result.
    pub async fn shutdown(&self) -> Result<bool, PipelineError> {
        let mut tasks = self.inner.tasks.lock().await;
        let Some(Tasks { reader, workers }) = tasks.take() else {
            return Ok(self.inner.drained.load(Ordering::Acquire));
        };

        self.set_status(PipelineStatus::Stopping).await;
        info!("Shutting down ingestion pipeline");

        self.inner.reader_cancel.cancel();
        if let Err(e) = reader.await {
            error!(error = %e, "Journal reader task failed");
        }

        let drained = self
            .inner
            .coordinator
            .wait_for_empty_buffers(self.inner.shutdown_max_wait)
            .await;
        self.inner.drained.store(drained, Ordering::Release);

        self.inner.cancel.cancel();
        stop_tasks(workers).await;

        let closed = self.inner.journal.close().await;
        self.set_status(PipelineStatus::Stopped).await;

        let snapshot = self.inner.journal.snapshot();
        info!(
            drained,
            committed = ?snapshot.committed_offset,
            uncommitted = snapshot.uncommitted_entries,
            "Ingestion pipeline stopped"
        );
        closed.map(|()| drained)
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("journal", &self.inner.journal)
            .field("process_stage", &self.inner.process_stage)
            .field("output_stage", &self.inner.output_stage)
            .finish()
    }
}

async fn stop_tasks(mut tasks: Vec<JoinHandle<()>>) {
    let count = tasks.len();
    match tokio::time::timeout(
        TASK_STOP_TIMEOUT,
        futures::future::join_all(tasks.iter_mut()),
    )
    .await
    {
        Ok(results) => {
            for e in results.into_iter().filter_map(Result::err) {
                error!(error = %e, "Pipeline task failed");
            }
            debug!(count, "Pipeline tasks stopped");
        }
        Err(_) => {
            warn!(
                count,
                timeout_ms = TASK_STOP_TIMEOUT.as_millis() as u64,
                "Pipeline tasks did not stop in time, aborting"
            );
            for task in &tasks {
                task.abort();
            }
        }
    }
}
