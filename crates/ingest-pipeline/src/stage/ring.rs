// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size multi-producer ring with statically partitioned consumers.
//!
//! Producers claim monotonically increasing sequence numbers; sequence `s` lives in
//! slot `s % capacity` and is consumed by partition `s % partitions`. Every slot carries
//! a state word that encodes which sequence it is waiting for:
//!
//! - `free(s) = s << 1`: the slot may be claimed for sequence `s`
//! - `ready(s) = (s << 1) | 1`: sequence `s` was published and awaits its consumer
//!
//! A consumer releases sequence `s` by storing `free(s + capacity)`. A producer never
//! claims a sequence whose slot is not free, so a claim can be abandoned at any point
//! without leaving a hole in the ring.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const fn free(seq: u64) -> u64 {
    seq << 1
}

const fn ready(seq: u64) -> u64 {
    (seq << 1) | 1
}

struct Slot<T> {
    state: AtomicU64,
    cell: Mutex<Option<T>>,
}

pub(crate) struct BoundedRing<T> {
    slots: Box<[Slot<T>]>,
    claimed: AtomicU64,
    released: AtomicU64,
    partitions: Box<[Notify]>,
    space: Notify,
}

impl<T> BoundedRing<T> {
    pub fn new(capacity: usize, partitions: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity as u64)
            .map(|seq| Slot {
                state: AtomicU64::new(free(seq)),
                cell: Mutex::new(None),
            })
            .collect();
        let partitions = (0..partitions.max(1)).map(|_| Notify::new()).collect();
        Self {
            slots,
            claimed: AtomicU64::new(0),
            released: AtomicU64::new(0),
            partitions,
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Messages published and not yet released, in-flight ones included
    pub fn used(&self) -> usize {
        let released = self.released.load(Ordering::Acquire);
        let claimed = self.claimed.load(Ordering::Acquire);
        claimed.saturating_sub(released) as usize
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    fn slot(&self, seq: u64) -> &Slot<T> {
        &self.slots[(seq % self.slots.len() as u64) as usize]
    }

    fn partition(&self, seq: u64) -> &Notify {
        &self.partitions[(seq % self.partitions.len() as u64) as usize]
    }

    /// Publishes `value` if the next slot is free, handing it back otherwise.
    pub fn try_publish(&self, value: T) -> Result<u64, T> {
        loop {
            let seq = self.claimed.load(Ordering::Acquire);
            let slot = self.slot(seq);
            let state = slot.state.load(Ordering::Acquire);

            if state == free(seq) {
                if self
                    .claimed
                    .compare_exchange_weak(seq, seq + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    *slot.cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                    slot.state.store(ready(seq), Ordering::Release);
                    self.partition(seq).notify_one();
                    return Ok(seq);
                }
            } else if state < free(seq) {
                // still holds `seq - capacity`
                return Err(value);
            }
            // another producer won `seq`, load again
            std::hint::spin_loop();
        }
    }

    /// Publishes `value`, waiting for a free slot. Hands the value back if cancelled.
    pub async fn publish(&self, value: T, cancel: &CancellationToken) -> Result<u64, T> {
        let mut value = value;
        loop {
            let mut space = pin!(self.space.notified());
            space.as_mut().enable();

            match self.try_publish(value) {
                Ok(seq) => return Ok(seq),
                Err(v) => value = v,
            }

            tokio::select! {
                () = space => {}
                () = cancel.cancelled() => return Err(value),
            }
        }
    }

    /// Waits until `seq` is published and takes its value. `None` if cancelled.
    pub async fn claim_next(&self, seq: u64, cancel: &CancellationToken) -> Option<T> {
        let slot = self.slot(seq);
        let notify = self.partition(seq);
        loop {
            let mut published = pin!(notify.notified());
            published.as_mut().enable();

            if slot.state.load(Ordering::Acquire) == ready(seq) {
                let value = slot.cell.lock().unwrap_or_else(PoisonError::into_inner).take();
                if value.is_some() {
                    return value;
                }
            }

            tokio::select! {
                () = published => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Frees the slot of a consumed sequence for `seq + capacity`.
    pub fn release(&self, seq: u64) {
        let slot = self.slot(seq);
        debug_assert_eq!(slot.state.load(Ordering::Acquire), ready(seq));
        slot.state
            .store(free(seq + self.slots.len() as u64), Ordering::Release);
        self.released.fetch_add(1, Ordering::AcqRel);
        self.space.notify_waiters();
    }
}
