//! Parallel table builder
//!
//! Streams sorted internal keys into an immutable table file, compressing
//! and writing blocks on background workers while the caller keeps adding
//! keys. See [`crate::table::pipeline`] for the block state machine.
//!
//! The caller contract follows the classic builder shape: feed `add` with
//! strictly increasing keys from one thread, then either `finish` or
//! `abandon` exactly once.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::block::BlockBuilder;
use crate::comparator::InternalKeyComparator;
use crate::config::{CompressionType, TableOptions};
use crate::counters::TableCounters;
use crate::error::Result;
use crate::filter::{FilterBlockBuilder, InternalFilterPolicy};
use crate::table::file::TableFile;
use crate::table::format::Footer;
use crate::table::pipeline::{spawn_workers, BlockPipeline};
use crate::StrataError;

/// Builds one table file from a sorted key/value stream
pub struct TableBuilder {
    pipeline: Arc<BlockPipeline>,
    workers: Vec<std::thread::JoinHandle<()>>,
    options: TableOptions,
    icmp: InternalKeyComparator,
    counters: Arc<TableCounters>,
    /// Last key accepted, for cross-block order enforcement
    last_added_key: Option<Vec<u8>>,
    num_entries: u64,
    closed: bool,
    file_size: u64,
    /// LSM level this table is being built for; informational
    level: u32,
}

impl TableBuilder {
    /// Create a builder writing into `file` and start its worker pool
    pub fn new(options: TableOptions, file: Arc<dyn TableFile>, level: u32) -> Result<Self> {
        let counters = Arc::new(TableCounters::new());
        let filter_block = options.filter_policy.as_ref().map(|policy| {
            FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(policy.clone())))
        });
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let pipeline = Arc::new(BlockPipeline::new(
            options.clone(),
            file,
            filter_block,
            Arc::clone(&counters),
        ));
        let workers = spawn_workers(&pipeline)?;

        Ok(Self {
            pipeline,
            workers,
            options,
            icmp,
            counters,
            last_added_key: None,
            num_entries: 0,
            closed: false,
            file_size: 0,
            level,
        })
    }

    /// Append a key/value pair. Keys must arrive in strictly increasing
    /// internal-key order; a violation latches a fatal error.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StrataError::InvariantViolation(
                "add after finish or abandon".to_string(),
            ));
        }
        self.pipeline.status()?;

        if key.len() < 8 {
            return Err(StrataError::Corruption(format!(
                "internal key too short ({} bytes)",
                key.len()
            )));
        }

        if let Some(last) = &self.last_added_key {
            if self.icmp.compare(key, last) != Ordering::Greater {
                let err =
                    StrataError::InvariantViolation("keys added out of order".to_string());
                self.pipeline.fail(err.clone());
                return Err(err);
            }
        }

        self.pipeline.add(key, value)?;

        match &mut self.last_added_key {
            Some(last) => {
                last.clear();
                last.extend_from_slice(key);
            }
            None => self.last_added_key = Some(key.to_vec()),
        }
        self.num_entries += 1;
        Ok(())
    }

    /// Force the current block into the pipeline even if it is below the
    /// size threshold
    pub fn flush(&mut self) {
        if !self.closed {
            self.pipeline.flush();
        }
    }

    /// Seal the table: drain the pipeline, then emit the filter block, the
    /// meta-index block, the index block, the counters block, and the
    /// footer
    pub fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Err(StrataError::InvariantViolation(
                "finish after finish or abandon".to_string(),
            ));
        }
        self.pipeline.flush();
        self.pipeline.begin_finish();
        self.join_workers();
        self.closed = true;

        tracing::debug!(
            table_level = self.level,
            ingest_wait_micros = self.pipeline.ingest_wait_micros(),
            "table build pipeline drained"
        );

        // A background failure wins over anything finish could report
        self.pipeline.status()?;

        let filter_block = self.pipeline.write.lock().filter_block.take();
        let filter_handle = match filter_block {
            Some(filter_builder) => {
                let payload = filter_builder.finish();
                Some(
                    self.pipeline
                        .append_raw_block(&payload, CompressionType::None)?,
                )
            }
            None => None,
        };

        let metaindex_handle = {
            let mut metaindex = BlockBuilder::with_restart_interval(1);
            if let (Some(handle), Some(policy)) =
                (filter_handle, self.options.filter_policy.as_ref())
            {
                let name = format!("filter.{}", policy.name());
                metaindex.add(name.as_bytes(), &handle.encoded());
            }
            let payload = metaindex.finish();
            self.pipeline
                .append_raw_block(&payload, CompressionType::None)?
        };

        let index_handle = {
            let mut index_block = {
                let mut write = self.pipeline.write.lock();
                std::mem::replace(&mut write.index_block, BlockBuilder::with_restart_interval(1))
            };
            let payload = index_block.finish();
            self.pipeline
                .append_raw_block(&payload, CompressionType::None)?
        };

        let mut counters_payload = Vec::new();
        self.counters.encode_to(&mut counters_payload);
        self.pipeline
            .append_raw_block(&counters_payload, CompressionType::None)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.pipeline.append_raw(&footer.encode())?;

        self.file_size = self.pipeline.write.lock().offset;
        Ok(())
    }

    /// Discard the build. The file is left in an undefined state for the
    /// caller to delete. Safe to call more than once.
    pub fn abandon(&mut self) {
        self.pipeline.begin_abort();
        self.join_workers();
        self.closed = true;
    }

    pub fn ok(&self) -> bool {
        self.pipeline.ok()
    }

    pub fn status(&self) -> Result<()> {
        self.pipeline.status()
    }

    /// Keys accepted so far
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Final file length; zero until `finish` succeeds
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Build counters for this table
    pub fn counters(&self) -> &Arc<TableCounters> {
        &self.counters
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("block worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        if !self.closed {
            self.abandon();
        }
    }
}
