// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors that can occur anywhere in the ingestion pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Journal write failed: {0}")]
    Durability(#[source] std::io::Error),

    #[error("Corrupt journal entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("Stage {stage} has no free capacity")]
    CapacityExceeded { stage: &'static str },

    #[error("{component} is shut down")]
    Shutdown { component: &'static str },

    #[error("Failed to process message {message_id}: {reason}")]
    WorkerProcessing { message_id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Durability failures are assumed transient; everything else is final for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Durability(_))
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, PipelineError::CapacityExceeded { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, PipelineError::Shutdown { .. })
    }
}

/// A message a stage could not accept, handed back to the caller together with the reason.
#[derive(Debug)]
pub struct Rejected<T> {
    pub message: T,
    pub error: PipelineError,
}

impl<T> Rejected<T> {
    pub(crate) fn capacity(stage: &'static str, message: T) -> Self {
        Self {
            message,
            error: PipelineError::CapacityExceeded { stage },
        }
    }

    pub(crate) fn shutdown(component: &'static str, message: T) -> Self {
        Self {
            message,
            error: PipelineError::Shutdown { component },
        }
    }

    pub fn into_error(self) -> PipelineError {
        self.error
    }
}
