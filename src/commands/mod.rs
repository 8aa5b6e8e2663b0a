//! Command implementations for covkit.

pub mod bam;
pub mod db;

pub use bam::BamCommand;
pub use db::DbCommand;
