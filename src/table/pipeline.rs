//! Block pipeline
//!
//! Overlaps three stages of table building:
//! - the single ingest thread loading keys into the current block,
//! - worker threads compressing and checksumming filled blocks,
//! - strictly ordered writes of finished blocks into the file.
//!
//! Blocks live in a fixed ring of slots. Each slot walks a state machine;
//! every transition happens under one mutex and is announced on one
//! condition variable:
//!
//! ```text
//! Empty → Loading → Full → Compressing → Ready ──────┐
//!   ▲                           │          ▲         ▼
//!   │                           └──→ KeyWait      Writing → Copying ──┐
//!   └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `KeyWait` holds a compressed block whose last key cannot become an index
//! separator yet: the shortening needs the first key of the following block
//! (or end of stream). Only the slot at the write cursor may enter
//! `Writing`, which keeps index entries, filter boundaries, and file offsets
//! in block order. The transition to `Copying` advances the write cursor
//! before the payload bytes are copied, so the next block's bookkeeping can
//! start while this block's memcpy is still running in a disjoint file
//! region.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};

use crate::block::BlockBuilder;
use crate::comparator::InternalKeyComparator;
use crate::config::{CompressionType, TableOptions};
use crate::counters::{SstCounter, TableCounters};
use crate::error::Result;
use crate::filter::FilterBlockBuilder;
use crate::table::file::TableFile;
use crate::table::format::{block_crc, mask_crc, BlockHandle, BLOCK_TRAILER_SIZE};
use crate::StrataError;

/// Number of ring slots. Must exceed the worker count by at least two so the
/// ingester and the in-order writer always find a slot while every worker
/// holds one mid-compression.
pub(crate) const RING_SLOTS: usize = 5;

/// Background compression/write threads per builder
pub(crate) const WORKER_THREADS: usize = 2;

/// Lifecycle of one ring slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Unused, available to the ingester
    Empty,
    /// The ingester is appending keys
    Loading,
    /// Filled; awaiting a compression worker
    Full,
    /// A worker is compressing outside the lock
    Compressing,
    /// Compressed, but the separator key is not final yet
    KeyWait,
    /// Compressed and separator-final; waiting for the write cursor
    Ready,
    /// The block's file-order bookkeeping is in progress
    Writing,
    /// Offsets are claimed; payload bytes are being copied
    Copying,
}

/// One cell of the ring
struct BlockSlot {
    state: SlotState,
    encoder: BlockBuilder,
    /// Most recently added internal key; rewritten in place when shortened
    last_key: Vec<u8>,
    /// Set exactly once per non-empty slot, always before `Writing`
    key_shortened: bool,
    /// Keys captured for the filter block, flattened
    filter_keys: Vec<u8>,
    filter_lengths: Vec<usize>,
    compression: CompressionType,
    /// Unmasked CRC over `payload || type_byte`
    crc: u32,
    /// Finished (possibly compressed) block bytes
    payload: Vec<u8>,
}

impl BlockSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Empty,
            encoder: BlockBuilder::new(),
            last_key: Vec::new(),
            key_shortened: false,
            filter_keys: Vec::new(),
            filter_lengths: Vec::new(),
            compression: CompressionType::None,
            crc: 0,
            payload: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.state = SlotState::Empty;
        self.encoder.reset();
        self.last_key.clear();
        self.key_shortened = false;
        self.filter_keys.clear();
        self.filter_lengths.clear();
        self.compression = CompressionType::None;
        self.crc = 0;
        self.payload.clear();
    }
}

/// Ring cursors, flags, and the sticky status; everything here is guarded
/// by the pipeline mutex
struct RingState {
    slots: Vec<BlockSlot>,
    /// Slot the ingester loads into
    next_add: usize,
    /// Slot whose write must happen next
    next_write: usize,
    abort: bool,
    finish: bool,
    /// First error observed anywhere in the pipeline
    status: Option<StrataError>,
}

impl RingState {
    fn all_empty(&self) -> bool {
        self.slots.iter().all(|s| s.state == SlotState::Empty)
    }
}

/// State touched only in file order: the writer holding `Writing` (one at a
/// time) during the data phase, the finishing thread afterwards
pub(crate) struct WriteState {
    /// Bytes written or reserved so far
    pub(crate) offset: u64,
    pub(crate) index_block: BlockBuilder,
    pub(crate) filter_block: Option<FilterBlockBuilder>,
}

/// Everything a block write needs, detached from its slot so the copy can
/// run while the slot is already visible to other parties
struct WriteJob {
    index: usize,
    payload: Vec<u8>,
    compression: CompressionType,
    crc: u32,
    last_key: Vec<u8>,
    filter_keys: Vec<u8>,
    filter_lengths: Vec<usize>,
}

enum WorkItem {
    Compress { index: usize, encoder: BlockBuilder },
    Write(WriteJob),
}

/// Shared half of the parallel builder
pub(crate) struct BlockPipeline {
    ring: Mutex<RingState>,
    work_available: Condvar,
    pub(crate) write: Mutex<WriteState>,
    pub(crate) file: Arc<dyn TableFile>,
    options: TableOptions,
    icmp: InternalKeyComparator,
    counters: Arc<TableCounters>,
    /// Microseconds the ingest thread spent blocked on a full ring
    ingest_wait_micros: AtomicU64,
}

impl BlockPipeline {
    pub(crate) fn new(
        options: TableOptions,
        file: Arc<dyn TableFile>,
        filter_block: Option<FilterBlockBuilder>,
        counters: Arc<TableCounters>,
    ) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        Self {
            ring: Mutex::new(RingState {
                slots: (0..RING_SLOTS).map(|_| BlockSlot::new()).collect(),
                next_add: 0,
                next_write: 0,
                abort: false,
                finish: false,
                status: None,
            }),
            work_available: Condvar::new(),
            write: Mutex::new(WriteState {
                offset: 0,
                index_block: BlockBuilder::with_restart_interval(1),
                filter_block,
            }),
            file,
            options,
            icmp,
            counters,
            ingest_wait_micros: AtomicU64::new(0),
        }
    }

    pub(crate) fn ok(&self) -> bool {
        self.ring.lock().status.is_none()
    }

    pub(crate) fn status(&self) -> Result<()> {
        match &self.ring.lock().status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn ingest_wait_micros(&self) -> u64 {
        self.ingest_wait_micros.load(Ordering::Relaxed)
    }

    /// Latch a caller-detected fatal error
    pub(crate) fn fail(&self, err: StrataError) {
        self.latch_error(err);
    }

    /// Record the first error and unwind: wake every party and make the
    /// workers drain out
    fn latch_error(&self, err: StrataError) {
        let mut ring = self.ring.lock();
        if ring.status.is_none() {
            ring.status = Some(err);
        }
        ring.abort = true;
        self.work_available.notify_all();
    }

    // =========================================================================
    // Ingest side (single thread)
    // =========================================================================

    /// Append one key/value to the current block, blocking while the ring
    /// is saturated. Claiming a fresh slot finalizes the previous block's
    /// separator key.
    pub(crate) fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.ring.lock();

        loop {
            if let Some(err) = &guard.status {
                return Err(err.clone());
            }
            if guard.abort {
                return Err(StrataError::InvariantViolation(
                    "add on an abandoned builder".to_string(),
                ));
            }
            let state = guard.slots[guard.next_add].state;
            if state == SlotState::Empty || state == SlotState::Loading {
                break;
            }
            let blocked = Instant::now();
            self.work_available.wait(&mut guard);
            self.ingest_wait_micros
                .fetch_add(blocked.elapsed().as_micros() as u64, Ordering::Relaxed);
        }

        let ring = &mut *guard;
        let idx = ring.next_add;

        if ring.slots[idx].state == SlotState::Empty {
            debug_assert!(ring.slots[idx].encoder.is_empty());
            ring.slots[idx].state = SlotState::Loading;

            // This key is the first of a new block: it supplies the
            // shortening input for the predecessor's separator
            let prev = (idx + RING_SLOTS - 1) % RING_SLOTS;
            if ring.slots[prev].state != SlotState::Empty {
                debug_assert!(!ring.slots[prev].key_shortened);
                self.icmp
                    .find_shortest_separator(&mut ring.slots[prev].last_key, key);
                ring.slots[prev].key_shortened = true;
                if ring.slots[prev].state == SlotState::KeyWait {
                    ring.slots[prev].state = SlotState::Ready;
                    self.work_available.notify_all();
                }
            }
        }

        let slot = &mut ring.slots[idx];
        if self.options.filter_policy.is_some() {
            slot.filter_lengths.push(key.len());
            slot.filter_keys.extend_from_slice(key);
        }
        slot.last_key.clear();
        slot.last_key.extend_from_slice(key);
        slot.encoder.add(key, value);

        self.counters.inc(SstCounter::Keys);
        self.counters.add(SstCounter::KeyBytes, key.len() as u64);
        self.counters.add(SstCounter::ValueBytes, value.len() as u64);
        self.counters.observe_max(SstCounter::KeyLargest, key.len() as u64);
        self.counters.observe_min(SstCounter::KeySmallest, key.len() as u64);
        self.counters
            .observe_max(SstCounter::ValueLargest, value.len() as u64);
        self.counters
            .observe_min(SstCounter::ValueSmallest, value.len() as u64);

        let should_flush = slot.encoder.size_estimate() >= self.options.block_size;
        drop(guard);

        if should_flush {
            self.flush();
        }
        Ok(())
    }

    /// Hand the current block to the workers, even if under the size
    /// threshold
    pub(crate) fn flush(&self) {
        let mut ring = self.ring.lock();
        let idx = ring.next_add;
        if ring.slots[idx].state == SlotState::Loading {
            ring.slots[idx].state = SlotState::Full;
            ring.next_add = (idx + 1) % RING_SLOTS;
            self.work_available.notify_all();
        }
    }

    /// No more keys will arrive; workers drain the ring and exit
    pub(crate) fn begin_finish(&self) {
        let mut ring = self.ring.lock();
        ring.finish = true;
        self.work_available.notify_all();
    }

    /// Stop immediately; in-flight blocks are discarded
    pub(crate) fn begin_abort(&self) {
        let mut ring = self.ring.lock();
        ring.abort = true;
        ring.finish = true;
        self.work_available.notify_all();
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    fn worker_loop(&self) {
        loop {
            let item = {
                let mut guard = self.ring.lock();
                loop {
                    if guard.abort || (guard.finish && guard.all_empty()) {
                        return;
                    }
                    if let Some(item) = Self::claim_work(&mut guard, &self.icmp) {
                        break item;
                    }
                    self.work_available.wait(&mut guard);
                }
            };

            match item {
                WorkItem::Compress { index, encoder } => self.compress_block(index, encoder),
                WorkItem::Write(job) => self.write_block(job),
            }
        }
    }

    /// Scan the ring from the write cursor and claim one piece of work.
    /// Transitions happen here, under the lock, so a claimed slot is never
    /// visible to another worker.
    fn claim_work(ring: &mut RingState, icmp: &InternalKeyComparator) -> Option<WorkItem> {
        for i in 0..RING_SLOTS {
            let idx = (ring.next_write + i) % RING_SLOTS;
            match ring.slots[idx].state {
                SlotState::Ready if idx == ring.next_write => {
                    ring.slots[idx].state = SlotState::Writing;
                    return Some(WorkItem::Write(Self::take_write_job(ring, idx)));
                }
                SlotState::Full => {
                    ring.slots[idx].state = SlotState::Compressing;
                    let encoder = std::mem::take(&mut ring.slots[idx].encoder);
                    return Some(WorkItem::Compress { index: idx, encoder });
                }
                SlotState::KeyWait
                    if ring.finish
                        && idx == ring.next_write
                        && ring.slots[(idx + 1) % RING_SLOTS].state == SlotState::Empty =>
                {
                    // Terminal block: end of stream supplies the shortening
                    debug_assert!(!ring.slots[idx].key_shortened);
                    icmp.find_short_successor(&mut ring.slots[idx].last_key);
                    ring.slots[idx].key_shortened = true;
                    ring.slots[idx].state = SlotState::Writing;
                    return Some(WorkItem::Write(Self::take_write_job(ring, idx)));
                }
                _ => {}
            }
        }
        None
    }

    /// Detach everything the write step needs from a slot entering `Writing`
    fn take_write_job(ring: &mut RingState, idx: usize) -> WriteJob {
        let slot = &mut ring.slots[idx];
        debug_assert_eq!(slot.state, SlotState::Writing);
        debug_assert!(slot.key_shortened);
        WriteJob {
            index: idx,
            payload: std::mem::take(&mut slot.payload),
            compression: slot.compression,
            crc: slot.crc,
            last_key: std::mem::take(&mut slot.last_key),
            filter_keys: std::mem::take(&mut slot.filter_keys),
            filter_lengths: std::mem::take(&mut slot.filter_lengths),
        }
    }

    /// Encode and compress a filled block outside the lock, then route the
    /// slot onward. When the slot is already at the write cursor with a
    /// final separator, this worker writes it immediately instead of
    /// handing it off.
    fn compress_block(&self, index: usize, mut encoder: BlockBuilder) {
        let raw = encoder.finish();
        self.counters.inc(SstCounter::Blocks);
        self.counters.add(SstCounter::BlockBytes, raw.len() as u64);

        let (compression, payload) = self.compress_payload(raw);
        self.counters
            .add(SstCounter::BlockWrittenBytes, payload.len() as u64);
        let crc = block_crc(&payload, compression as u8);

        let mut inline_job = None;
        {
            let mut guard = self.ring.lock();
            let ring = &mut *guard;
            let at_cursor = index == ring.next_write;
            {
                let slot = &mut ring.slots[index];
                debug_assert_eq!(slot.state, SlotState::Compressing);
                slot.encoder = encoder;
                slot.compression = compression;
                slot.crc = crc;
                slot.payload = payload;
                slot.state = if slot.key_shortened {
                    if at_cursor {
                        SlotState::Writing
                    } else {
                        SlotState::Ready
                    }
                } else {
                    SlotState::KeyWait
                };
            }
            if ring.slots[index].state == SlotState::Writing {
                inline_job = Some(Self::take_write_job(ring, index));
            }
            self.work_available.notify_all();
        }

        if let Some(job) = inline_job {
            self.write_block(job);
        }
    }

    /// Apply the configured codec; fall back to raw storage when the codec
    /// saves less than 1/8 of the block
    fn compress_payload(&self, raw: Vec<u8>) -> (CompressionType, Vec<u8>) {
        match self.options.compression {
            CompressionType::None => (CompressionType::None, raw),
            CompressionType::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                match encoder.compress_vec(&raw) {
                    Ok(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                        (CompressionType::Snappy, compressed)
                    }
                    _ => {
                        self.counters.inc(SstCounter::CompressAborted);
                        (CompressionType::None, raw)
                    }
                }
            }
        }
    }

    /// The write half, run by whichever worker moved the slot to `Writing`:
    /// reserve the file region, record the filter boundary and index entry,
    /// open the cursor for the next writer, then copy the bytes.
    fn write_block(&self, job: WriteJob) {
        if !self.ok() {
            // A prior failure is unwinding the build; just recycle the slot
            let mut ring = self.ring.lock();
            ring.slots[job.index].reset();
            ring.next_write = (ring.next_write + 1) % RING_SLOTS;
            self.work_available.notify_all();
            return;
        }

        // File-order bookkeeping
        let reserved = {
            let mut write = self.write.lock();
            let total = (job.payload.len() + BLOCK_TRAILER_SIZE) as u64;
            match self.file.reserve(total) {
                Ok(region) => {
                    let handle = BlockHandle::new(region.offset(), job.payload.len() as u64);
                    write.offset = region.offset() + total;
                    let boundary = write.offset;
                    if let Some(filter) = write.filter_block.as_mut() {
                        filter.add_keys(&job.filter_lengths, &job.filter_keys);
                        filter.start_block(boundary);
                    }
                    write.index_block.add(&job.last_key, &handle.encoded());
                    self.counters.inc(SstCounter::IndexKeys);
                    Ok(region)
                }
                Err(err) => Err(err),
            }
        };

        let mut region = match reserved {
            Ok(region) => region,
            Err(err) => {
                self.latch_error(err);
                let mut ring = self.ring.lock();
                ring.slots[job.index].reset();
                self.work_available.notify_all();
                return;
            }
        };

        // The handle and index entry are fixed; the next writer may proceed
        // while this block's bytes are still being copied
        {
            let mut ring = self.ring.lock();
            ring.slots[job.index].state = SlotState::Copying;
            ring.next_write = (ring.next_write + 1) % RING_SLOTS;
            self.work_available.notify_all();
        }

        let copied = (|| -> Result<()> {
            region.assign(&job.payload)?;
            let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
            trailer[0] = job.compression as u8;
            LittleEndian::write_u32(&mut trailer[1..], mask_crc(job.crc));
            region.append(&trailer)
        })();
        if let Err(err) = copied {
            self.latch_error(err);
        }

        let mut ring = self.ring.lock();
        ring.slots[job.index].reset();
        self.work_available.notify_all();
    }

    // =========================================================================
    // Finish-side helpers (single-threaded, after the workers have drained)
    // =========================================================================

    /// Append a block with a trailer, bypassing the ring. Used for the
    /// filter, meta-index, index, and counters blocks.
    pub(crate) fn append_raw_block(
        &self,
        payload: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let mut write = self.write.lock();
        let total = (payload.len() + BLOCK_TRAILER_SIZE) as u64;
        let mut region = self.file.reserve(total)?;
        let handle = BlockHandle::new(region.offset(), payload.len() as u64);
        write.offset = region.offset() + total;

        region.assign(payload)?;
        let crc = block_crc(payload, compression as u8);
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = compression as u8;
        LittleEndian::write_u32(&mut trailer[1..], mask_crc(crc));
        region.append(&trailer)?;
        Ok(handle)
    }

    /// Append raw bytes with no trailer (the footer)
    pub(crate) fn append_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut write = self.write.lock();
        let mut region = self.file.reserve(bytes.len() as u64)?;
        write.offset = region.offset() + bytes.len() as u64;
        region.assign(bytes)?;
        Ok(())
    }
}

/// Start the worker pool for a pipeline
pub(crate) fn spawn_workers(pipeline: &Arc<BlockPipeline>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(WORKER_THREADS);
    for worker_id in 0..WORKER_THREADS {
        let pipeline = Arc::clone(pipeline);
        let handle = thread::Builder::new()
            .name(format!("strata-block-worker-{}", worker_id))
            .spawn(move || {
                tracing::debug!("block worker {} started", worker_id);
                pipeline.worker_loop();
                tracing::debug!("block worker {} stopped", worker_id);
            })
            .map_err(|e| StrataError::Io(format!("failed to spawn block worker: {}", e)))?;
        handles.push(handle);
    }
    Ok(handles)
}
