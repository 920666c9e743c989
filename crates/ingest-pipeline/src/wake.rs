// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Coalescing wake-up between journal appends and the reader.
///
/// Any number of releases before the reader waits collapse into a single wake-up.
/// The pending count is only informational; a positive count just means "retry".
#[derive(Debug, Default)]
pub struct WakeSignal {
    notify: Notify,
    pending: AtomicU64,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        // notify_one stores a permit when nobody is waiting
        self.notify.notify_one();
    }

    /// Waits for at least one release and drains every pending one.
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if self.pending.swap(0, Ordering::AcqRel) > 0 {
            // consume the stored permit so the next wait blocks
            tokio::select! {
                biased;
                () = self.notify.notified() => {}
                () = std::future::ready(()) => {}
            }
            return true;
        }

        tokio::select! {
            () = self.notify.notified() => {
                self.pending.swap(0, Ordering::AcqRel);
                true
            }
            () = cancel.cancelled() => false,
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}
