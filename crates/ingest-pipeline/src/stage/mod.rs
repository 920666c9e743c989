// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded processing stages.
//!
//! A [`Stage`] pairs a fixed-capacity ring with a pool of workers and an overflow
//! cache. Worker `w` of `W` handles sequences `w, w + W, w + 2W, ...` in order, so
//! workers never contend with each other for messages. Occupancy counts a message
//! from publish until its handler returns.

pub mod output;
pub mod process;
pub(crate) mod ring;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, Instrument};

use crate::config::StageConfig;
use crate::error::{PipelineError, Rejected};
use crate::message::Tracked;
use crate::metrics::{StageMetrics, StageSnapshot};
use crate::overflow::OverflowCache;
use ring::BoundedRing;

/// What a handler did with a message it finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Completed,
    /// Intentionally dropped, e.g. by a filter
    Filtered,
}

/// The per-message function run by every worker of a stage
#[async_trait]
pub trait StageHandler<T>: Send + Sync {
    async fn handle(&self, message: T) -> Result<Handled, PipelineError>;
}

/// Read-only view of a stage's sequence counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOccupancy {
    pub used: usize,
    pub capacity: usize,
}

impl StageOccupancy {
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity
    }
}

/// Type-erased view used by the shutdown coordinator
pub trait StageProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn occupancy(&self) -> StageOccupancy;
    fn cache_len(&self) -> usize;

    /// Nothing in the ring and nothing waiting in the overflow cache
    fn is_empty(&self) -> bool {
        self.occupancy().used == 0 && self.cache_len() == 0
    }
}

pub struct Stage<T> {
    name: &'static str,
    ring: BoundedRing<T>,
    cache: Arc<OverflowCache<T>>,
    metrics: StageMetrics,
}

impl<T> Stage<T>
where
    T: Tracked + Send + 'static,
{
    pub fn new(name: &'static str, config: &StageConfig) -> Self {
        Self {
            name,
            ring: BoundedRing::new(config.capacity, config.workers),
            cache: Arc::new(OverflowCache::new(name, config.overflow_warn_threshold)),
            metrics: StageMetrics::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn workers(&self) -> usize {
        self.ring.partitions()
    }

    pub fn occupancy(&self) -> StageOccupancy {
        StageOccupancy {
            used: self.ring.used(),
            capacity: self.ring.capacity(),
        }
    }

    pub fn has_capacity(&self, n: usize) -> bool {
        self.ring.remaining_capacity() >= n
    }

    pub fn remaining_capacity(&self) -> usize {
        self.ring.remaining_capacity()
    }

    pub fn cache(&self) -> &Arc<OverflowCache<T>> {
        &self.cache
    }

    /// Publishes `message`, waiting as long as it takes for a free slot.
    pub async fn insert_blocking(
        &self,
        message: T,
        cancel: &CancellationToken,
    ) -> Result<(), Rejected<T>> {
        match self.ring.publish(message, cancel).await {
            Ok(_) => {
                self.metrics.inserted.incr();
                Ok(())
            }
            Err(message) => Err(Rejected::shutdown(self.name, message)),
        }
    }

    /// Like [`Stage::insert_blocking`], but refuses up front when the stage is full.
    pub async fn insert_fail_fast(
        &self,
        message: T,
        cancel: &CancellationToken,
    ) -> Result<(), Rejected<T>> {
        if !self.has_capacity(1) {
            self.metrics.rejected.incr();
            return Err(Rejected::capacity(self.name, message));
        }
        self.insert_blocking(message, cancel).await
    }

    /// Publishes `message` if a slot is free right now and nothing is cached,
    /// otherwise queues it in the overflow cache behind the older entries. Never
    /// waits and never fails.
    pub fn insert_cached(&self, message: T) {
        let cached = self
            .cache
            .publish_or_add(message, |message| self.ring.try_publish(message).map(|_| ()));
        if cached {
            self.metrics.cached.incr();
        } else {
            self.metrics.inserted.incr();
        }
    }

    /// Moves cached messages into free slots, oldest first. Returns how many moved.
    pub fn reinject_cached(&self) -> usize {
        let moved = self
            .cache
            .reinject(|message| self.ring.try_publish(message).map(|_| ()));
        self.metrics.inserted.add(moved as u64);
        moved
    }

    /// Starts one worker per partition.
    pub fn spawn_workers(
        self: &Arc<Self>,
        handler: Arc<dyn StageHandler<T>>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.workers())
            .map(|partition| {
                let stage = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                let span = debug_span!("stage_worker", stage = self.name, worker = partition);
                tokio::spawn(
                    async move { stage.run_worker(partition, handler, cancel).await }.instrument(span),
                )
            })
            .collect()
    }

    async fn run_worker(
        &self,
        partition: usize,
        handler: Arc<dyn StageHandler<T>>,
        cancel: CancellationToken,
    ) {
        let stride = self.workers() as u64;
        let mut seq = partition as u64;
        debug!(stage = self.name, worker = partition, "Stage worker started");

        while let Some(message) = self.ring.claim_next(seq, &cancel).await {
            let message_id = message.message_id().to_owned();
            let offset = message.journal_offset();

            let outcome = tokio::select! {
                result = AssertUnwindSafe(handler.handle(message)).catch_unwind() => Some(result),
                () = cancel.cancelled() => None,
            };

            match outcome {
                Some(Ok(Ok(Handled::Completed))) => self.metrics.processed.incr(),
                Some(Ok(Ok(Handled::Filtered))) => self.metrics.filtered.incr(),
                Some(Ok(Err(e))) => {
                    self.metrics.failed.incr();
                    error!(
                        stage = self.name,
                        message_id = %message_id,
                        offset,
                        error = %e,
                        "Failed to process message"
                    );
                }
                Some(Err(panic)) => {
                    self.metrics.failed.incr();
                    error!(
                        stage = self.name,
                        message_id = %message_id,
                        offset,
                        panic = panic_message(panic.as_ref()),
                        "Stage handler panicked while processing message"
                    );
                }
                None => {
                    debug!(
                        stage = self.name,
                        message_id = %message_id,
                        offset,
                        "Abandoned in-flight message on shutdown"
                    );
                }
            }

            self.ring.release(seq);
            seq += stride;
        }

        debug!(stage = self.name, worker = partition, "Stage worker stopped");
    }

    pub fn snapshot(&self) -> StageSnapshot {
        let cache = self.cache.metrics();
        StageSnapshot {
            name: self.name,
            inserted: self.metrics.inserted.get(),
            cached: self.metrics.cached.get(),
            rejected: self.metrics.rejected.get(),
            processed: self.metrics.processed.get(),
            filtered: self.metrics.filtered.get(),
            failed: self.metrics.failed.get(),
            used: self.ring.used(),
            capacity: self.ring.capacity(),
            cache_len: self.cache.len(),
            cache_added: cache.added.get(),
            cache_drained: cache.drained.get(),
        }
    }
}

impl<T> StageProbe for Stage<T>
where
    T: Tracked + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn occupancy(&self) -> StageOccupancy {
        Stage::occupancy(self)
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("used", &self.ring.used())
            .field("capacity", &self.ring.capacity())
            .field("workers", &self.ring.partitions())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
