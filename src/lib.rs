// Clippy allows for the whole crate
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

//! covkit: parallel BAM coverage statistics.
//!
//! This library computes per-region coverage metrics from an indexed BAM
//! file over BED-defined region sets, and persists them to a queryable
//! SQLite store.
//!
//! # Features
//!
//! - **Parallel windows**: the genome is cut into fixed-size windows that
//!   are scanned by a bounded worker pool and folded back in genome order
//! - **Non-redundant depth**: CIGAR-aware pileup with mate-overlap
//!   suppression, duplicate and mapping-quality filtering
//! - **Level breadth**: fraction of each region at or above the configured
//!   coverage levels, with the backing intervals preserved
//!
//! # Example
//!
//! ```rust,no_run
//! use covkit::commands::BamCommand;
//!
//! let cmd = BamCommand {
//!     bam: "sample.bam".into(),
//!     regions: vec![("genes".to_string(), "genes.bed".into())],
//!     databases: vec![("genes".to_string(), "genes.db".into())],
//!     window_size: 1_000_000,
//!     threads: 4,
//!     levels: vec![5, 10, 20, 50, 100],
//!     mapq_cutoff: 1,
//!     genome: false,
//!     allow_dups: false,
//! };
//! let summary = cmd.run().unwrap();
//! println!("{} reads counted", summary.reads_counted);
//! ```

pub mod aggregate;
pub mod bed;
pub mod commands;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod levels;
pub mod region;
pub mod regionset;
pub mod windows;
pub mod worker;

// Re-export commonly used types
pub use error::{CovError, Result};
pub use region::Region;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::{Aggregator, BamSummary};
    pub use crate::bed::{read_regions, RegionReader};
    pub use crate::commands::{BamCommand, DbCommand};
    pub use crate::db::{CoverageDb, DbMeta, QueryFilter};
    pub use crate::error::{CovError, Result};
    pub use crate::levels::{LevelMachine, LevelReport};
    pub use crate::region::Region;
    pub use crate::regionset::RegionSetAccumulator;
    pub use crate::windows::{ReferenceSequences, WindowPlanner};
    pub use crate::worker::{scan_window, ScanOptions};
}
