// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, offset-addressed append log.
//!
//! The journal is the source of truth for "received but not yet processed". Entries
//! get consecutive offsets starting at 0 and are never dropped from disk until their
//! offset is committed. A directory holds:
//!
//! - segment files `{base_offset:020}.journal` (see [`segment`] for the framing)
//! - `committed-offset`, the last committed offset as decimal text
//!
//! Offset assignment, appends and reads are serialized behind one async mutex. The
//! committed offset lives in an atomic so acknowledgements never wait on disk IO;
//! a maintenance task persists it periodically and removes fully committed segments.

mod segment;

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{JournalConfig, SyncPolicy};
use crate::error::PipelineError;
use crate::message::{JournalEntry, RawEntry};
use crate::metrics::{JournalMetrics, JournalSnapshot};
use crate::wake::WakeSignal;
use segment::{encode_frame, framed_len, parse_frame, parse_segment_name, Frame, IndexEntry, Segment};

const COMMITTED_FILE: &str = "committed-offset";
const COMMITTED_TMP_FILE: &str = "committed-offset.tmp";
const UTILIZATION_WARN_RATIO: f64 = 0.95;

struct JournalState {
    /// Ordered by base offset; the last one is the active segment
    segments: Vec<Segment>,
    writer: Option<File>,
    /// Set when a failed write could not be rolled back yet
    pending_truncate: bool,
    next_offset: u64,
    next_read: u64,
    dirty: bool,
    last_sync: Instant,
    persisted_committed: Option<u64>,
    utilization_warned: bool,
}

impl JournalState {
    fn active(&self) -> &Segment {
        // open() always leaves at least one segment behind
        &self.segments[self.segments.len() - 1]
    }

    fn active_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn log_start(&self) -> u64 {
        self.segments.first().map_or(self.next_offset, |s| s.base_offset)
    }
}

pub struct Journal {
    config: JournalConfig,
    state: Mutex<JournalState>,
    /// Last committed offset plus one; zero means nothing committed
    committed_end: AtomicU64,
    log_end: AtomicU64,
    log_start: AtomicU64,
    next_read: AtomicU64,
    size_bytes: AtomicU64,
    segment_count: AtomicUsize,
    closed: AtomicBool,
    wake: Arc<WakeSignal>,
    metrics: JournalMetrics,
    #[cfg(test)]
    injected_failures: std::sync::atomic::AtomicU32,
}

impl Journal {
    /// Opens (or creates) the journal in `config.directory` and recovers its state.
    pub async fn open(config: JournalConfig) -> Result<Self, PipelineError> {
        let directory = config.directory.clone();
        fs::create_dir_all(&directory).await?;

        let mut bases = Vec::new();
        let mut dir = fs::read_dir(&directory).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(base) = parse_segment_name(&entry.path()) {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let metrics = JournalMetrics::default();
        let max_body = max_body_len(&config);
        let mut segments = Vec::with_capacity(bases.len().max(1));
        let last_index = bases.len().saturating_sub(1);

        for (i, base) in bases.into_iter().enumerate() {
            let mut segment = Segment::new(&directory, base);
            let data = fs::read(&segment.path).await?;
            let scan = segment::scan(&data, base, max_body);
            metrics.corrupt.add(scan.corrupt);
            if scan.corrupt > 0 {
                warn!(
                    segment = %segment.path.display(),
                    corrupt = scan.corrupt,
                    "Skipped corrupt journal records during recovery"
                );
            }

            segment.size = data.len() as u64;
            if scan.torn {
                if i == last_index {
                    warn!(
                        segment = %segment.path.display(),
                        valid_len = scan.valid_len,
                        file_len = data.len(),
                        "Truncating torn tail of the active journal segment"
                    );
                    let file = OpenOptions::new().write(true).open(&segment.path).await?;
                    file.set_len(scan.valid_len).await?;
                    file.sync_all().await?;
                    segment.size = scan.valid_len;
                } else {
                    warn!(
                        segment = %segment.path.display(),
                        valid_len = scan.valid_len,
                        "Ignoring unreadable tail of an old journal segment"
                    );
                }
            }
            segment.index = scan.index;
            segments.push(segment);
        }

        let mut next_offset = segments
            .iter()
            .map(|s| s.last_offset().map_or(s.base_offset, |last| last + 1))
            .max()
            .unwrap_or(0);

        let mut committed = read_committed(&directory).await?;
        if segments.is_empty() {
            next_offset = committed.map_or(0, |c| c + 1);
        }
        if let Some(c) = committed {
            if c >= next_offset {
                warn!(
                    committed = c,
                    log_end = next_offset,
                    "Committed offset is past the end of the journal, replaying from the log end"
                );
                committed = next_offset.checked_sub(1);
            }
        }

        if segments.is_empty() {
            let segment = Segment::new(&directory, next_offset);
            File::create(&segment.path).await?;
            segments.push(segment);
        }

        let active_path = segments[segments.len() - 1].path.clone();
        let writer = OpenOptions::new().write(true).open(&active_path).await?;

        let committed_end = committed.map_or(0, |c| c + 1);
        let log_start = segments[0].base_offset;
        let next_read = committed_end.max(log_start);
        let size_bytes = segments.iter().map(|s| s.size).sum();
        let segment_count = segments.len();

        info!(
            directory = %directory.display(),
            segments = segment_count,
            log_start,
            log_end = next_offset,
            committed = ?committed,
            "Opened journal"
        );

        Ok(Self {
            state: Mutex::new(JournalState {
                segments,
                writer: Some(writer),
                pending_truncate: false,
                next_offset,
                next_read,
                dirty: false,
                last_sync: Instant::now(),
                persisted_committed: committed,
                utilization_warned: false,
            }),
            config,
            committed_end: AtomicU64::new(committed_end),
            log_end: AtomicU64::new(next_offset),
            log_start: AtomicU64::new(log_start),
            next_read: AtomicU64::new(next_read),
            size_bytes: AtomicU64::new(size_bytes),
            segment_count: AtomicUsize::new(segment_count),
            closed: AtomicBool::new(false),
            wake: Arc::new(WakeSignal::new()),
            metrics,
            #[cfg(test)]
            injected_failures: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Signal released once per successful append batch
    pub fn wake_signal(&self) -> Arc<WakeSignal> {
        Arc::clone(&self.wake)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Appends a batch and returns the highest assigned offset.
    ///
    /// Oversized entries are discarded and get no offset; `None` means the whole batch
    /// was discarded. A storage failure leaves no trace: the batch can be retried and
    /// will receive the same offsets.
    pub async fn append(&self, entries: &[RawEntry]) -> Result<Option<u64>, PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::Shutdown { component: "journal" });
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.is_closed() {
            return Err(PipelineError::Shutdown { component: "journal" });
        }

        let first = state.next_offset;
        let mut next = first;
        let mut buf = BytesMut::new();
        let mut frames = Vec::with_capacity(entries.len());

        for entry in entries {
            let len = framed_len(entry.message_id.len(), entry.payload.len());
            if len > self.config.max_entry_size {
                self.metrics.discarded.incr();
                warn!(
                    message_id = %String::from_utf8_lossy(&entry.message_id),
                    size = len,
                    max_entry_size = self.config.max_entry_size,
                    "Discarding journal entry larger than the maximum entry size"
                );
                continue;
            }
            let position = buf.len() as u64;
            let frame_len = encode_frame(&mut buf, next, &entry.message_id, &entry.payload);
            frames.push(IndexEntry {
                offset: next,
                position,
                frame_len,
            });
            next += 1;
        }

        if frames.is_empty() {
            return Ok(None);
        }

        let active_size = state.active().size;
        if active_size > 0 && active_size + buf.len() as u64 > self.config.segment_size {
            self.roll(state).await.map_err(PipelineError::Durability)?;
        }

        self.write_batch(state, &buf)
            .await
            .map_err(PipelineError::Durability)?;

        let count = frames.len() as u64;
        let active = state.active_mut();
        let base = active.size;
        active
            .index
            .extend(frames.into_iter().map(|mut e| {
                e.position += base;
                e
            }));
        active.size += buf.len() as u64;
        state.next_offset = next;
        state.dirty = true;
        self.log_end.store(next, Ordering::Release);
        self.size_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.metrics.written.add(count);

        if let SyncPolicy::Interval { interval } = self.config.sync_policy {
            if state.last_sync.elapsed() >= interval {
                if let Err(e) = Self::sync(state).await {
                    // the data is written; maintenance will sync again
                    warn!(error = %e, "Failed to sync journal segment");
                }
            }
        }
        drop(guard);

        self.wake.release();
        debug!(first, last = next - 1, count, "Appended journal batch");
        Ok(Some(next - 1))
    }

    async fn write_batch(&self, state: &mut JournalState, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        {
            if self.take_injected_failure() {
                return Err(io::Error::other("injected journal write failure"));
            }
        }

        let size = state.active().size;
        Self::reopen_active(state).await?;
        let Some(file) = state.writer.as_mut() else {
            return Err(io::Error::other("active journal segment is not open"));
        };

        let result = async {
            file.seek(SeekFrom::Start(size)).await?;
            file.write_all(buf).await?;
            file.flush().await?;
            if self.config.sync_policy == SyncPolicy::Always {
                file.sync_data().await?;
            }
            Ok(())
        }
        .await;

        if result.is_err() && file.set_len(size).await.is_err() {
            state.pending_truncate = true;
            state.writer = None;
        }
        result
    }

    /// Opens the active segment if needed and cuts off a batch whose rollback failed.
    async fn reopen_active(state: &mut JournalState) -> io::Result<()> {
        if state.writer.is_none() {
            let file = OpenOptions::new().write(true).open(&state.active().path).await?;
            state.writer = Some(file);
        }
        if state.pending_truncate {
            let size = state.active().size;
            if let Some(file) = state.writer.as_mut() {
                file.set_len(size).await?;
            }
            state.pending_truncate = false;
        }
        Ok(())
    }

    async fn roll(&self, state: &mut JournalState) -> io::Result<()> {
        // the old segment must not keep frames whose offsets the new one reuses
        if state.pending_truncate {
            Self::reopen_active(state).await?;
        }
        if self.config.sync_policy != SyncPolicy::Never {
            Self::sync(state).await?;
        }
        let segment = Segment::new(&self.config.directory, state.next_offset);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment.path)
            .await?;
        debug!(
            segment = %segment.path.display(),
            base_offset = segment.base_offset,
            "Rolled journal segment"
        );
        state.segments.push(segment);
        state.writer = Some(file);
        self.segment_count
            .store(state.segments.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn sync(state: &mut JournalState) -> io::Result<()> {
        if let Some(file) = state.writer.as_mut() {
            file.sync_data().await?;
        }
        state.dirty = false;
        state.last_sync = Instant::now();
        Ok(())
    }

    /// Reads up to `max_entries` unread entries in offset order.
    ///
    /// Returns an empty batch when nothing unread remains. Records failing their
    /// checksum are skipped, so a damaged record never wedges the reader.
    pub async fn read(&self, max_entries: usize) -> Result<Vec<JournalEntry>, PipelineError> {
        if max_entries == 0 || self.is_closed() {
            return Ok(Vec::new());
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let end = state.next_offset;
        let mut next = state.next_read.max(state.log_start());
        let max_body = max_body_len(&self.config);
        let mut out = Vec::new();

        for segment in &state.segments {
            if out.len() >= max_entries || next >= end {
                break;
            }
            loop {
                let wanted = segment.entries_from(next);
                let take = wanted.len().min(max_entries - out.len());
                if take == 0 {
                    break;
                }
                let run = &wanted[..take];
                let start = run[0].position;
                let last = run[take - 1];
                let len = last.position + u64::from(last.frame_len) - start;
                let data = Bytes::from(read_range(&segment.path, start, len).await?);

                for entry in run {
                    let relative = (entry.position - start) as usize;
                    match parse_frame(&data, relative, max_body) {
                        Frame::Record {
                            offset, id, payload, ..
                        } if offset == entry.offset => {
                            let (message_id, payload) = segment::slice_record(&data, id, payload);
                            out.push(JournalEntry {
                                offset,
                                message_id,
                                payload,
                            });
                        }
                        _ => {
                            self.metrics.corrupt.incr();
                            warn!(
                                offset = entry.offset,
                                segment = %segment.path.display(),
                                "Skipping journal entry that failed its checksum"
                            );
                        }
                    }
                    next = entry.offset + 1;
                }

                if out.len() >= max_entries {
                    break;
                }
            }
        }

        // every indexed record up to the log end was consumed, skip gaps left by recovery
        if out.len() < max_entries {
            next = end;
        }

        state.next_read = next;
        self.next_read.store(next, Ordering::Release);
        self.metrics.read.add(out.len() as u64);
        Ok(out)
    }

    /// Records `offset` as committed. Monotonic and idempotent.
    ///
    /// Returns `true` if the committed offset advanced. Offsets that were never
    /// written are refused.
    pub fn mark_committed(&self, offset: u64) -> bool {
        let log_end = self.log_end.load(Ordering::Acquire);
        if offset >= log_end {
            warn!(
                offset,
                log_end, "Refusing to commit an offset past the end of the journal"
            );
            return false;
        }
        let previous = self.committed_end.fetch_max(offset + 1, Ordering::AcqRel);
        previous < offset + 1
    }

    pub fn committed_offset(&self) -> Option<u64> {
        self.committed_end.load(Ordering::Acquire).checked_sub(1)
    }

    pub fn log_end_offset(&self) -> u64 {
        self.log_end.load(Ordering::Acquire)
    }

    /// Syncs pending data and persists the committed offset.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        let mut guard = self.state.lock().await;
        self.flush_locked(&mut guard).await
    }

    async fn flush_locked(&self, state: &mut JournalState) -> Result<(), PipelineError> {
        if state.dirty {
            if self.config.sync_policy == SyncPolicy::Never {
                state.dirty = false;
            } else {
                Self::sync(state).await?;
            }
        }
        self.persist_committed(state).await
    }

    async fn persist_committed(&self, state: &mut JournalState) -> Result<(), PipelineError> {
        let Some(committed) = self.committed_offset() else {
            return Ok(());
        };
        if state.persisted_committed == Some(committed) {
            return Ok(());
        }

        let tmp = self.config.directory.join(COMMITTED_TMP_FILE);
        let mut file = File::create(&tmp).await?;
        file.write_all(committed.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.config.directory.join(COMMITTED_FILE)).await?;

        state.persisted_committed = Some(committed);
        debug!(committed, "Persisted committed journal offset");
        Ok(())
    }

    /// One maintenance pass: flush, delete committed segments, check utilization.
    pub async fn maintain(&self) -> Result<(), PipelineError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.is_closed() {
            return Ok(());
        }
        self.flush_locked(state).await?;

        let committed_end = self.committed_end.load(Ordering::Acquire);
        while state.segments.len() > 1 && state.segments[1].base_offset <= committed_end {
            let segment = state.segments.remove(0);
            if let Err(e) = fs::remove_file(&segment.path).await {
                warn!(
                    segment = %segment.path.display(),
                    error = %e,
                    "Failed to delete committed journal segment"
                );
                state.segments.insert(0, segment);
                break;
            }
            debug!(
                segment = %segment.path.display(),
                "Deleted fully committed journal segment"
            );
            self.size_bytes.fetch_sub(segment.size, Ordering::Relaxed);
        }
        let log_start = state.log_start();
        self.log_start.store(log_start, Ordering::Release);
        self.segment_count
            .store(state.segments.len(), Ordering::Relaxed);
        if state.next_read < log_start {
            state.next_read = log_start;
            self.next_read.store(log_start, Ordering::Release);
        }

        let utilization = self.utilization();
        if utilization > UTILIZATION_WARN_RATIO {
            if !state.utilization_warned {
                warn!(
                    utilization_pct = utilization * 100.0,
                    size_bytes = self.size_bytes.load(Ordering::Relaxed),
                    max_size = self.config.max_size,
                    "Journal utilization is too high, processing may be falling behind"
                );
                state.utilization_warned = true;
            }
        } else {
            state.utilization_warned = false;
        }
        Ok(())
    }

    /// Periodically runs [`Journal::maintain`] until `cancel` fires
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let journal = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(journal.config.maintenance_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = journal.maintain().await {
                            warn!(error = %e, "Journal maintenance failed");
                        }
                    }
                    () = cancel.cancelled() => {
                        debug!("Journal maintenance stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Final sync and committed offset persist. Appends fail afterwards.
    pub async fn close(&self) -> Result<(), PipelineError> {
        let mut guard = self.state.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.flush_locked(&mut guard).await;
        guard.writer = None;
        info!(
            log_end = guard.next_offset,
            committed = ?self.committed_offset(),
            "Closed journal"
        );
        result
    }

    fn utilization(&self) -> f64 {
        if self.config.max_size == 0 {
            return 0.0;
        }
        self.size_bytes.load(Ordering::Relaxed) as f64 / self.config.max_size as f64
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        let log_end = self.log_end.load(Ordering::Acquire);
        let log_start = self.log_start.load(Ordering::Acquire);
        let committed_end = self.committed_end.load(Ordering::Acquire);
        JournalSnapshot {
            written: self.metrics.written.get(),
            read: self.metrics.read.get(),
            discarded: self.metrics.discarded.get(),
            corrupt: self.metrics.corrupt.get(),
            log_start_offset: log_start,
            log_end_offset: log_end,
            committed_offset: committed_end.checked_sub(1),
            next_read_offset: self.next_read.load(Ordering::Acquire),
            uncommitted_entries: log_end.saturating_sub(committed_end.max(log_start)),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            segment_count: self.segment_count.load(Ordering::Relaxed),
            utilization: self.utilization(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    #[cfg(test)]
    pub(crate) fn fail_next_appends(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("directory", &self.config.directory)
            .field("log_end", &self.log_end_offset())
            .field("committed", &self.committed_offset())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn max_body_len(config: &JournalConfig) -> usize {
    let segment = usize::try_from(config.segment_size).unwrap_or(usize::MAX);
    segment.max(config.max_entry_size)
}

async fn read_range(path: &Path, start: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_committed(directory: &Path) -> Result<Option<u64>, PipelineError> {
    match fs::read_to_string(directory.join(COMMITTED_FILE)).await {
        Ok(text) => match text.trim().parse::<u64>() {
            Ok(offset) => Ok(Some(offset)),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable committed offset file");
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
