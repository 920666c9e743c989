// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::{retry, RetryPolicy};
use crate::stage::StageProbe;

/// Best-effort graceful drain of the stages during a controlled shutdown
pub struct ShutdownCoordinator {
    stages: Vec<Arc<dyn StageProbe>>,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(stages: Vec<Arc<dyn StageProbe>>, poll_interval: Duration) -> Self {
        Self {
            stages,
            poll_interval,
        }
    }

    fn all_empty(&self) -> bool {
        self.stages.iter().all(|stage| stage.is_empty())
    }

    /// Polls until every stage and its overflow cache is empty, or `max_wait` passes.
    ///
    /// Returns `false` (after logging what is left) if the stages did not drain in
    /// time. Never waits longer than `max_wait`.
    pub async fn wait_for_empty_buffers(&self, max_wait: Duration) -> bool {
        let started = Instant::now();
        let policy = RetryPolicy::poll_until(self.poll_interval, max_wait);
        // only the deadline ends this wait
        let never = CancellationToken::new();

        let drained = retry(
            &policy,
            &never,
            |_| async {
                if self.all_empty() {
                    Ok(())
                } else {
                    Err(())
                }
            },
            |_| true,
        )
        .await
        .is_ok();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if drained {
            info!(elapsed_ms, "All stage buffers are empty");
        } else {
            for stage in &self.stages {
                let occupancy = stage.occupancy();
                warn!(
                    stage = stage.name(),
                    used = occupancy.used,
                    capacity = occupancy.capacity,
                    cache_len = stage.cache_len(),
                    elapsed_ms,
                    "Stage buffers were not fully drained before the shutdown deadline"
                );
            }
        }
        drained
    }
}
