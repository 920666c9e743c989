// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use crate::ack::Acknowledger;
use crate::error::PipelineError;
use crate::message::DecodedMessage;
use crate::stage::{panic_message, Handled, StageHandler};

/// Destination for fully processed messages (search backend, forwarder, ...)
#[async_trait]
pub trait MessageOutput: Send + Sync {
    fn name(&self) -> &str;
    async fn write(&self, message: &DecodedMessage) -> Result<(), PipelineError>;
}

/// Output stage handler: writes to every output, then acknowledges the offset
pub struct OutputHandler {
    outputs: Vec<Arc<dyn MessageOutput>>,
    acknowledger: Arc<Acknowledger>,
}

impl OutputHandler {
    pub fn new(outputs: Vec<Arc<dyn MessageOutput>>, acknowledger: Arc<Acknowledger>) -> Self {
        Self {
            outputs,
            acknowledger,
        }
    }
}

#[async_trait]
impl StageHandler<DecodedMessage> for OutputHandler {
    async fn handle(&self, message: DecodedMessage) -> Result<Handled, PipelineError> {
        let mut failures = Vec::new();

        for output in &self.outputs {
            let result = AssertUnwindSafe(output.write(&message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(PipelineError::WorkerProcessing {
                        message_id: message.id.clone(),
                        reason: format!("output panicked: {}", panic_message(panic.as_ref())),
                    })
                });

            if let Err(e) = result {
                warn!(
                    output = output.name(),
                    message_id = %message.id,
                    offset = message.offset,
                    error = %e,
                    "Output failed to write message"
                );
                failures.push(format!("{}: {e}", output.name()));
            }
        }

        self.acknowledger.acknowledge(message.offset);

        if failures.is_empty() {
            Ok(Handled::Completed)
        } else {
            Err(PipelineError::WorkerProcessing {
                message_id: message.id,
                reason: failures.join("; "),
            })
        }
    }
}
