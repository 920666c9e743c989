// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Ingest Pipeline
//!
//! Durable, backpressure-aware message ingestion.
//!
//! Raw entries from inputs are appended to an on-disk [`Journal`] first. A single
//! [`reader::JournalReader`] moves them into the process stage at the rate the stage
//! can absorb, processors enrich or filter them, and the output stage hands them to
//! every registered output. Offsets are committed once a message has left the
//! pipeline, so anything still in flight at a crash is replayed on restart.
//!
//! ## Modules
//! - [`journal`]: segmented append-only log with checksums and committed offsets
//! - [`writer`] / [`reader`]: the journal's ingress and egress
//! - [`stage`]: bounded ring stages with partitioned workers
//! - [`overflow`]: spill cache for saturated stages and its drain worker
//! - [`shutdown`]: graceful drain before the pipeline stops
//! - [`pipeline`]: wiring, lifecycle and metrics of the whole thing

#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_comparisons)]

pub mod ack;
pub mod config;
pub mod error;
pub mod journal;
pub mod logger;
pub mod message;
pub mod metrics;
pub mod overflow;
pub mod pipeline;
pub mod reader;
pub mod retry;
pub mod shutdown;
pub mod stage;
pub mod wake;
pub mod writer;

pub use ack::Acknowledger;
pub use config::{JournalConfig, PipelineConfig, StageConfig, SyncPolicy};
pub use error::{PipelineError, Rejected};
pub use journal::Journal;
pub use message::{Decoded, DecodedMessage, JournalEntry, JsonDecoder, MessageDecoder, RawEntry};
pub use metrics::MetricsSnapshot;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, PipelineStatus};
pub use stage::output::MessageOutput;
pub use stage::process::{MessageProcessor, Verdict};
pub use stage::{Stage, StageHandler, StageProbe};
pub use writer::JournalWriter;
