// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Overflow cache and the drain worker that empties it.
//!
//! When a stage is saturated and the producer must not block, messages spill into
//! the stage's [`OverflowCache`]. One [`DrainWorker`] per stage periodically moves
//! them back in FIFO order once capacity frees up.
//!
//! While the cache holds anything, new messages queue behind it instead of taking a
//! free ring slot, so a stage fed by a single producer sees its messages in journal
//! order. Commits are by maximum offset: a cached message with a lower offset than an
//! acknowledged one is only safe if its producer keeps journal order, which parallel
//! workers upstream do not guarantee.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::message::Tracked;
use crate::metrics::CacheMetrics;
use crate::reader::ProcessingControl;
use crate::stage::Stage;

#[derive(Debug)]
pub struct CacheEntry<T> {
    pub message: T,
    pub enqueued_at: Instant,
}

struct CacheState<T> {
    entries: VecDeque<CacheEntry<T>>,
    next_warning: usize,
}

/// Unbounded FIFO spill area for one stage
pub struct OverflowCache<T> {
    stage: &'static str,
    state: Mutex<CacheState<T>>,
    warn_threshold: usize,
    metrics: CacheMetrics,
}

impl<T> OverflowCache<T> {
    /// `warn_threshold` of 0 disables growth warnings
    pub fn new(stage: &'static str, warn_threshold: usize) -> Self {
        Self {
            stage,
            state: Mutex::new(CacheState {
                entries: VecDeque::new(),
                next_warning: warn_threshold,
            }),
            warn_threshold,
            metrics: CacheMetrics::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, message: T) {
        self.add_all(std::iter::once(message));
    }

    pub fn add_all(&self, messages: impl IntoIterator<Item = T>) {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.extend(messages.into_iter().map(|message| CacheEntry {
            message,
            enqueued_at: now,
        }));
        self.metrics.added.add((state.entries.len() - before) as u64);
        self.warn_on_growth(state);
    }

    /// Hands `message` to `publish` unless older entries are still waiting, in which
    /// case it queues behind them. Returns `true` if the message ended up cached.
    ///
    /// The decision and the publish happen under the cache lock, the same lock
    /// [`OverflowCache::reinject`] holds, so a new message cannot overtake a cached one.
    pub(crate) fn publish_or_add(
        &self,
        message: T,
        publish: impl FnOnce(T) -> Result<(), T>,
    ) -> bool {
        let mut state = self.lock();
        let message = if state.entries.is_empty() {
            match publish(message) {
                Ok(()) => return false,
                Err(message) => message,
            }
        } else {
            message
        };
        state.entries.push_back(CacheEntry {
            message,
            enqueued_at: Instant::now(),
        });
        self.metrics.added.incr();
        self.warn_on_growth(state);
        true
    }

    /// Hands entries to `publish` oldest first until it refuses one or the cache is
    /// empty. The refused entry stays at the head. Returns how many were published.
    pub(crate) fn reinject(&self, mut publish: impl FnMut(T) -> Result<(), T>) -> usize {
        let mut state = self.lock();
        let mut published = 0;
        while let Some(CacheEntry {
            message,
            enqueued_at,
        }) = state.entries.pop_front()
        {
            match publish(message) {
                Ok(()) => published += 1,
                Err(message) => {
                    state.entries.push_front(CacheEntry {
                        message,
                        enqueued_at,
                    });
                    break;
                }
            }
        }
        if state.entries.is_empty() {
            state.next_warning = self.warn_threshold;
        }
        self.metrics.drained.add(published as u64);
        published
    }

    fn warn_on_growth(&self, mut state: MutexGuard<'_, CacheState<T>>) {
        let len = state.entries.len();
        if self.warn_threshold > 0 && len >= state.next_warning {
            while state.next_warning <= len {
                state.next_warning = state.next_warning.saturating_mul(2);
            }
            drop(state);
            warn!(
                stage = self.stage,
                cache_len = len,
                "Overflow cache keeps growing, the stage cannot keep up"
            );
        }
    }

    /// Oldest entry, if any
    pub fn pop(&self) -> Option<CacheEntry<T>> {
        let mut state = self.lock();
        let entry = state.entries.pop_front();
        if state.entries.is_empty() {
            state.next_warning = self.warn_threshold;
        }
        entry
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

impl<T> std::fmt::Debug for OverflowCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowCache")
            .field("stage", &self.stage)
            .field("len", &self.len())
            .finish()
    }
}

/// Reinjects cached messages into their stage while it has capacity
pub struct DrainWorker<T> {
    stage: Arc<Stage<T>>,
    control: Arc<ProcessingControl>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<T> DrainWorker<T>
where
    T: Tracked + Send + 'static,
{
    pub fn new(
        stage: Arc<Stage<T>>,
        control: Arc<ProcessingControl>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stage,
            control,
            interval,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = debug_span!("drain_worker", stage = self.stage.name());
        tokio::spawn(self.run().instrument(span))
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(stage = self.stage.name(), "Drain worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.cancel.cancelled() => break,
            }
            if !self.control.is_processing() {
                continue;
            }

            self.drain_once();
        }

        debug!(
            stage = self.stage.name(),
            cache_len = self.stage.cache().len(),
            "Drain worker stopped"
        );
    }

    /// Moves cached messages into the stage until it is full or the cache is empty.
    pub fn drain_once(&self) -> usize {
        let drained = self.stage.reinject_cached();
        if drained > 0 {
            let cache_len = self.stage.cache().len();
            debug!(
                stage = self.stage.name(),
                drained,
                cache_len,
                "Reinjected cached messages"
            );
            if cache_len == 0 {
                info!(stage = self.stage.name(), "Overflow cache drained");
            }
        }
        drained
    }
}
