//! # stratadb
//!
//! The SSTable build path of the Strata LSM storage engine: a parallel
//! table builder that overlaps key ingestion, block compression, and
//! ordered file writes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     build_table driver                      │
//! │        iterator → KeyRetirementFilter → TableBuilder        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ add(key, value)          (ingest thread)
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     block slot ring                         │
//! │   Empty → Loading → Full → Compressing → Ready → Writing    │
//! └───────┬──────────────────────────────┬──────────────────────┘
//!         │ compress + crc               │ in-order writes
//!   ┌─────▼─────┐                 ┌──────▼──────┐
//!   │  workers  │                 │  table file │
//!   │ (2 threads)│                │ (regions)   │
//!   └───────────┘                 └─────────────┘
//! ```
//!
//! Finished files are verified through [`TableCache`] and read back with
//! [`TableReader`].

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod block;
pub mod coding;
pub mod comparator;
pub mod counters;
pub mod driver;
pub mod filter;
pub mod keys;
pub mod retirement;
pub mod table;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{CompressionType, TableOptions};
pub use driver::{build_table, TableFileMeta};
pub use error::{Result, StrataError};
pub use retirement::KeyRetirementFilter;
pub use table::{TableBuilder, TableCache, TableReader};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of stratadb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
