// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ingest_pipeline::{
    DecodedMessage, MessageOutput, MessageProcessor, Pipeline, PipelineConfig, PipelineError,
    PipelineHandle, RawEntry, StageProbe, SyncPolicy, Verdict,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing_test::traced_test;

#[derive(Default)]
struct Collector {
    ids: Mutex<Vec<String>>,
}

impl Collector {
    /// Sorted, since output workers run in parallel
    fn ids(&self) -> Vec<String> {
        let mut ids = self.ids.lock().unwrap().clone();
        ids.sort();
        ids
    }

    fn count(&self) -> usize {
        self.ids.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageOutput for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    async fn write(&self, message: &DecodedMessage) -> Result<(), PipelineError> {
        self.ids.lock().unwrap().push(message.id.clone());
        Ok(())
    }
}

/// Blocks every write until a permit is added
struct GatedOutput {
    gate: Semaphore,
    written: AtomicU64,
}

#[async_trait]
impl MessageOutput for GatedOutput {
    fn name(&self) -> &str {
        "gated"
    }

    async fn write(&self, _message: &DecodedMessage) -> Result<(), PipelineError> {
        self.gate
            .acquire()
            .await
            .map_err(|_| PipelineError::Shutdown { component: "gate" })?
            .forget();
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct SlowOutput(Duration);

#[async_trait]
impl MessageOutput for SlowOutput {
    fn name(&self) -> &str {
        "slow"
    }

    async fn write(&self, _message: &DecodedMessage) -> Result<(), PipelineError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Holds its worker thread for a while on every message
struct SlowProcessor(Duration);

impl MessageProcessor for SlowProcessor {
    fn name(&self) -> &str {
        "slow"
    }

    fn process(&self, _message: &mut DecodedMessage) -> Result<Verdict, PipelineError> {
        std::thread::sleep(self.0);
        Ok(Verdict::Keep)
    }
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.journal.directory = dir.to_path_buf();
    config.journal.sync_policy = SyncPolicy::Never;
    config.process_stage.capacity = 64;
    config.output_stage.capacity = 64;
    config.drain_interval = Duration::from_millis(20);
    config.shutdown_poll_interval = Duration::from_millis(50);
    config.shutdown_max_wait = Duration::from_secs(5);
    config
}

fn entries(range: std::ops::Range<u32>) -> Vec<RawEntry> {
    range
        .map(|i| RawEntry::with_id(format!("m{i}"), format!(r#"{{"message":"needle-{i}"}}"#)))
        .collect()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn wait_committed(handle: &PipelineHandle, offset: u64) {
    wait_until("offset to be committed", || {
        handle.journal().committed_offset() == Some(offset)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_is_absorbed_by_reader_backpressure() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.process_stage.capacity = 10;
    let collector = Arc::new(Collector::default());

    let handle = Pipeline::builder(config)
        .output(collector.clone())
        .start()
        .await
        .unwrap();

    assert_eq!(handle.writer().write(&entries(0..100)).await.unwrap(), Some(99));
    wait_until("all messages written", || collector.count() == 100).await;
    wait_committed(&handle, 99).await;

    let metrics = handle.metrics();
    // the reader never outruns the process stage, so nothing spills
    assert!(metrics.reader.max_batch >= 1);
    assert!(
        metrics.reader.max_batch <= 10,
        "read a batch of {}",
        metrics.reader.max_batch
    );
    assert_eq!(metrics.process_stage.cached, 0);
    assert_eq!(metrics.process_stage.cache_added, 0);
    assert_eq!(metrics.reader.delivered, 100);
    assert_eq!(metrics.journal.uncommitted_entries, 0);

    assert!(handle.shutdown().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_output_spills_into_cache_then_drains() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.output_stage.capacity = 5;
    let output = Arc::new(GatedOutput {
        gate: Semaphore::new(0),
        written: AtomicU64::new(0),
    });

    let handle = Pipeline::builder(config)
        .output(output.clone())
        .start()
        .await
        .unwrap();
    handle.writer().write(&entries(0..20)).await.unwrap();

    let stage = handle.output_stage().clone();
    wait_until("output stage to saturate", || {
        stage.occupancy().used == 5 && stage.cache().len() == 15
    })
    .await;
    assert_eq!(handle.journal().committed_offset(), None);

    output.gate.add_permits(20);
    wait_until("cache to drain", || {
        output.written.load(Ordering::SeqCst) == 20
    })
    .await;
    wait_committed(&handle, 19).await;

    let metrics = handle.metrics();
    assert_eq!(metrics.output_stage.cache_len, 0);
    assert_eq!(metrics.output_stage.cache_drained, 15);
    assert_eq!(metrics.output_stage.processed, 20);

    assert!(handle.shutdown().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_entries_do_not_block_their_neighbours() {
    let dir = TempDir::new().unwrap();

    // journal entries without processing them
    let handle = Pipeline::builder(config(dir.path())).start().await.unwrap();
    handle.pause();
    let mut batch = entries(0..5);
    batch.insert(2, RawEntry::with_id("garbage", "not json at all"));
    handle.writer().write(&batch).await.unwrap();
    assert!(handle.shutdown().await.unwrap());

    // flip one payload byte of "needle-3" on disk
    let segment = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.extension().is_some_and(|ext| ext == "journal"))
        .unwrap();
    let mut data = std::fs::read(&segment).unwrap();
    let needle = b"needle-3";
    let pos = data
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap();
    data[pos] = b'N';
    std::fs::write(&segment, data).unwrap();

    let collector = Arc::new(Collector::default());
    let handle = Pipeline::builder(config(dir.path()))
        .output(collector.clone())
        .start()
        .await
        .unwrap();

    // offsets: 0 m0, 1 m1, 2 garbage, 3 m2, 4 m3 (bad checksum), 5 m4
    wait_until("valid entries delivered", || collector.count() == 4).await;
    wait_committed(&handle, 5).await;
    assert_eq!(collector.ids(), vec!["m0", "m1", "m2", "m4"]);
    assert_eq!(handle.metrics().reader.corrupt_entries, 1);

    assert!(handle.shutdown().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cached_messages_are_not_overtaken_by_new_ones() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.process_stage.workers = 1;
    config.output_stage.capacity = 1;
    config.output_stage.workers = 1;
    // only the immediate first tick runs during the test
    config.drain_interval = Duration::from_secs(30);
    config.shutdown_max_wait = Duration::from_millis(200);
    let output = Arc::new(GatedOutput {
        gate: Semaphore::new(0),
        written: AtomicU64::new(0),
    });

    let handle = Pipeline::builder(config)
        .output(output.clone())
        .start()
        .await
        .unwrap();
    handle.writer().write(&entries(0..3)).await.unwrap();

    let stage = handle.output_stage().clone();
    wait_until("offsets 1 and 2 to be cached", || {
        stage.occupancy().used == 1 && stage.cache().len() == 2
    })
    .await;

    output.gate.add_permits(1);
    wait_committed(&handle, 0).await;
    wait_until("the slot to free up", || stage.occupancy().used == 0).await;

    handle.writer().write(&entries(3..4)).await.unwrap();
    wait_until("offset 3 to queue behind the cache", || {
        stage.cache().len() == 3
    })
    .await;
    assert_eq!(stage.occupancy().used, 0);
    assert_eq!(output.written.load(Ordering::SeqCst), 1);
    assert_eq!(handle.journal().committed_offset(), Some(0));

    assert!(!handle.shutdown().await.unwrap());
    assert_eq!(handle.journal().committed_offset(), Some(0));
}

#[traced_test]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_gives_up_after_max_wait_and_replays_on_restart() {
    let dir = TempDir::new().unwrap();
    let mut slow_config = config(dir.path());
    slow_config.process_stage.capacity = 4;
    slow_config.process_stage.workers = 1;
    slow_config.output_stage.capacity = 4;
    slow_config.shutdown_max_wait = Duration::from_secs(2);

    let handle = Pipeline::builder(slow_config)
        .processor(Arc::new(SlowProcessor(Duration::from_secs(1))))
        .output(Arc::new(SlowOutput(Duration::from_secs(30))))
        .start()
        .await
        .unwrap();
    // well beyond what both stages hold together
    handle.writer().write(&entries(0..20)).await.unwrap();
    let process = handle.process_stage().clone();
    let output = handle.output_stage().clone();
    wait_until("both stages to hold messages", || {
        process.occupancy().is_full() && output.occupancy().used > 0
    })
    .await;

    let started = Instant::now();
    assert!(!handle.shutdown().await.unwrap());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");

    // neither stage can refill once the reader has stopped, so they were not empty at the deadline
    assert!(!StageProbe::is_empty(process.as_ref()));
    assert!(output.occupancy().used > 0);
    assert!(logs_contain("not fully drained"));
    assert_eq!(handle.journal().committed_offset(), None);

    // nothing was committed, so the restart sees every message again
    let collector = Arc::new(Collector::default());
    let handle = Pipeline::builder(config(dir.path()))
        .output(collector.clone())
        .start()
        .await
        .unwrap();
    wait_until("replayed messages", || collector.count() == 20).await;
    wait_committed(&handle, 19).await;
    assert!(handle.shutdown().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_after_committed_offset() {
    let dir = TempDir::new().unwrap();
    let first = Arc::new(Collector::default());

    let handle = Pipeline::builder(config(dir.path()))
        .output(first.clone())
        .start()
        .await
        .unwrap();
    handle.writer().write(&entries(0..5)).await.unwrap();
    wait_committed(&handle, 4).await;

    handle.pause();
    handle.writer().write(&entries(5..10)).await.unwrap();
    assert!(handle.shutdown().await.unwrap());
    assert_eq!(first.count(), 5);

    let second = Arc::new(Collector::default());
    let handle = Pipeline::builder(config(dir.path()))
        .output(second.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(handle.journal().committed_offset(), Some(4));
    assert_eq!(handle.journal().log_end_offset(), 10);

    wait_until("remaining messages", || second.count() == 5).await;
    wait_committed(&handle, 9).await;
    assert_eq!(second.ids(), vec!["m5", "m6", "m7", "m8", "m9"]);

    assert!(handle.shutdown().await.unwrap());
}
