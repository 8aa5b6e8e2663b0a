//! Core region type for coverage accounting.
//!
//! Uses 0-based, half-open coordinates (BED format). Chromosome names are
//! stored without a leading "chr" so that user regions match BAM references
//! regardless of which naming convention either side uses.

use std::fmt;

/// Strip a leading "chr" from a chromosome name.
#[inline]
pub fn normalize_chrom(chrom: &str) -> &str {
    chrom.strip_prefix("chr").unwrap_or(chrom)
}

/// A genomic interval with identity: where it came from (descriptor of the
/// region file) and its ingestion ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    pub name: String,
    /// Descriptor of the region set this region belongs to.
    pub descriptor: String,
    /// Monotonic ingestion ordinal.
    pub index: u64,
}

impl Region {
    pub fn new(
        chrom: impl Into<String>,
        start: u64,
        stop: u64,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        index: u64,
    ) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            stop,
            name: name.into(),
            descriptor: descriptor.into(),
            index,
        }
    }

    /// Length in bases.
    #[inline]
    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }

    /// Check overlap with a coordinate range on the same chromosome.
    #[inline]
    pub fn overlaps_range(&self, start: u64, stop: u64) -> bool {
        self.start < stop && start < self.stop
    }

    /// Clip this region to `[start, stop)`, keeping name, descriptor and
    /// index so slices of the same user region can be rejoined later.
    pub fn clipped(&self, start: u64, stop: u64) -> Region {
        Region {
            chrom: self.chrom.clone(),
            start: self.start.max(start),
            stop: self.stop.min(stop),
            name: self.name.clone(),
            descriptor: self.descriptor.clone(),
            index: self.index,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.chrom, self.start, self.stop, self.name, self.descriptor, self.index
        )
    }
}
