// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::ack::Acknowledger;
use crate::error::PipelineError;
use crate::message::DecodedMessage;
use crate::stage::{panic_message, Handled, Stage, StageHandler};

/// Decision of a processor about the message it just saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

/// One step of the enrichment/filter chain.
///
/// Processors run on a stage worker and may mutate the message in place. Blocking
/// work belongs in `spawn_blocking`, not here.
pub trait MessageProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, message: &mut DecodedMessage) -> Result<Verdict, PipelineError>;
}

/// Process stage handler: runs the processor chain and forwards survivors to the output stage
pub struct ProcessHandler {
    processors: Vec<Arc<dyn MessageProcessor>>,
    output: Arc<Stage<DecodedMessage>>,
    acknowledger: Arc<Acknowledger>,
}

impl ProcessHandler {
    pub fn new(
        processors: Vec<Arc<dyn MessageProcessor>>,
        output: Arc<Stage<DecodedMessage>>,
        acknowledger: Arc<Acknowledger>,
    ) -> Self {
        Self {
            processors,
            output,
            acknowledger,
        }
    }
}

#[async_trait]
impl StageHandler<DecodedMessage> for ProcessHandler {
    async fn handle(&self, mut message: DecodedMessage) -> Result<Handled, PipelineError> {
        for processor in &self.processors {
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&mut message)))
                .unwrap_or_else(|panic| {
                    Err(PipelineError::WorkerProcessing {
                        message_id: message.id.clone(),
                        reason: format!("processor panicked: {}", panic_message(panic.as_ref())),
                    })
                });

            match verdict {
                Ok(Verdict::Keep) => {}
                Ok(Verdict::Drop) => {
                    trace!(
                        processor = processor.name(),
                        message_id = %message.id,
                        "Message filtered out"
                    );
                    self.acknowledger.acknowledge(message.offset);
                    return Ok(Handled::Filtered);
                }
                Err(e) => {
                    self.acknowledger.acknowledge(message.offset);
                    return Err(PipelineError::WorkerProcessing {
                        message_id: message.id,
                        reason: format!("{} failed: {e}", processor.name()),
                    });
                }
            }
        }

        self.output.insert_cached(message);
        Ok(Handled::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JournalConfig, StageConfig, SyncPolicy};
    use crate::journal::Journal;
    use crate::message::RawEntry;
    use chrono::Utc;
    use serde_json::Map;
    use tempfile::TempDir;

    struct AddField;

    impl MessageProcessor for AddField {
        fn name(&self) -> &str {
            "add_field"
        }

        fn process(&self, message: &mut DecodedMessage) -> Result<Verdict, PipelineError> {
            message.set_field("processed", true);
            Ok(Verdict::Keep)
        }
    }

    /// Drops debug messages, fails on messages marked bad, panics on "boom"
    struct Picky;

    impl MessageProcessor for Picky {
        fn name(&self) -> &str {
            "picky"
        }

        fn process(&self, message: &mut DecodedMessage) -> Result<Verdict, PipelineError> {
            match message.message() {
                Some("debug") => Ok(Verdict::Drop),
                Some("bad") => Err(PipelineError::WorkerProcessing {
                    message_id: message.id.clone(),
                    reason: "unparseable".to_string(),
                }),
                Some("boom") => panic!("processor bug"),
                _ => Ok(Verdict::Keep),
            }
        }
    }

    fn message(offset: u64, text: &str) -> DecodedMessage {
        let mut fields = Map::new();
        fields.insert("message".to_string(), text.into());
        DecodedMessage {
            id: format!("m{offset}"),
            timestamp: Utc::now(),
            fields,
            source_input_id: None,
            offset,
        }
    }

    async fn handler(dir: &TempDir) -> (Arc<Journal>, Arc<Stage<DecodedMessage>>, ProcessHandler) {
        let config = JournalConfig {
            directory: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Never,
            ..JournalConfig::default()
        };
        let journal = Arc::new(Journal::open(config).await.unwrap());
        let batch: Vec<RawEntry> = (0..8).map(|i| RawEntry::new(format!("{i}"))).collect();
        journal.append(&batch).await.unwrap();

        let output = Arc::new(Stage::new("output", &StageConfig::new(8, 1)));
        let handler = ProcessHandler::new(
            vec![Arc::new(AddField) as Arc<dyn MessageProcessor>, Arc::new(Picky)],
            output.clone(),
            Arc::new(Acknowledger::new(journal.clone())),
        );
        (journal, output, handler)
    }

    #[tokio::test]
    async fn test_survivors_are_forwarded_with_mutations() {
        let dir = TempDir::new().unwrap();
        let (journal, output, handler) = handler(&dir).await;

        let handled = handler.handle(message(0, "hello")).await.unwrap();
        assert_eq!(handled, Handled::Completed);
        assert_eq!(output.occupancy().used, 1);
        assert_eq!(journal.committed_offset(), None);
    }

    #[tokio::test]
    async fn test_filtered_message_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        let (journal, output, handler) = handler(&dir).await;

        let handled = handler.handle(message(3, "debug")).await.unwrap();
        assert_eq!(handled, Handled::Filtered);
        assert_eq!(output.occupancy().used, 0);
        assert_eq!(journal.committed_offset(), Some(3));
    }

    #[tokio::test]
    async fn test_processor_failure_is_acknowledged_and_reported() {
        let dir = TempDir::new().unwrap();
        let (journal, output, handler) = handler(&dir).await;

        let err = handler.handle(message(4, "bad")).await.unwrap_err();
        assert!(err.to_string().contains("picky failed"));
        assert_eq!(journal.committed_offset(), Some(4));

        let err = handler.handle(message(5, "boom")).await.unwrap_err();
        assert!(err.to_string().contains("processor panicked: processor bug"));
        assert_eq!(journal.committed_offset(), Some(5));
        assert_eq!(output.occupancy().used, 0);
    }
}
