//! Processing-window planning.
//!
//! The genome is cut into fixed-size windows (the unit of parallel work) and
//! each user region is clipped into the windows it overlaps. A region that
//! spans a window boundary is emitted as a slice in every touched window and
//! rejoined by name after the pass.

use crate::error::{CovError, Result};
use crate::region::{normalize_chrom, Region};
use rayon::prelude::*;
use rust_htslib::bam::HeaderView;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Reference sequences from a BAM header, in header order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSequences {
    refs: Vec<(String, u64)>,
}

impl ReferenceSequences {
    /// Extract (name, length) pairs from a BAM header view.
    pub fn from_header(header: &HeaderView) -> Result<Self> {
        let mut refs = Vec::with_capacity(header.target_count() as usize);
        for tid in 0..header.target_count() {
            let name = std::str::from_utf8(header.tid2name(tid))
                .map_err(|_| CovError::InvalidInput("Non-UTF8 reference name in BAM header".into()))?
                .to_string();
            let len = header.target_len(tid).ok_or_else(|| {
                CovError::InvalidInput(format!("Missing length for reference {}", name))
            })?;
            refs.push((name, len));
        }
        Ok(Self { refs })
    }

    /// Build from explicit (name, length) pairs.
    pub fn from_pairs(refs: Vec<(String, u64)>) -> Self {
        Self { refs }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, u64)> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// A contiguous reference span used as the unit of parallel work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingWindow {
    /// Canonical reference name as spelled in the BAM header (used for
    /// fetching); slices carry the "chr"-stripped form.
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    pub ordinal: u64,
}

impl ProcessingWindow {
    #[inline]
    pub fn len(&self) -> u64 {
        self.stop - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

/// One unit of work: a window plus the user-region slices clipped to it.
#[derive(Debug, Clone)]
pub struct WindowJob {
    pub window: ProcessingWindow,
    pub slices: Vec<Region>,
}

/// Plans the window sequence for one BAM pass.
///
/// Regions are grouped by (normalized) chromosome and sorted by start, then
/// ingestion index, before planning.
#[derive(Debug)]
pub struct WindowPlanner {
    references: ReferenceSequences,
    window_size: u64,
    by_chrom: FxHashMap<String, Vec<Region>>,
    region_count: u64,
}

impl WindowPlanner {
    pub fn new(references: ReferenceSequences, window_size: u64) -> Self {
        assert!(window_size > 0, "window size must be positive");
        Self {
            references,
            window_size,
            by_chrom: FxHashMap::default(),
            region_count: 0,
        }
    }

    /// Ingest a user region, assigning the global ingestion ordinal.
    pub fn add_region(&mut self, mut region: Region) {
        region.index = self.region_count;
        self.region_count += 1;
        self.by_chrom
            .entry(region.chrom.clone())
            .or_default()
            .push(region);
    }

    /// Number of regions ingested so far.
    pub fn region_count(&self) -> u64 {
        self.region_count
    }

    /// Consume the planner and yield genome-ordered window jobs.
    pub fn plan(mut self) -> WindowIter {
        // Sort each chromosome's regions by start, then ingestion order, in
        // parallel across chromosomes.
        self.by_chrom
            .values_mut()
            .collect::<Vec<_>>()
            .par_iter_mut()
            .for_each(|regions| {
                regions.sort_by(|a, b| a.start.cmp(&b.start).then(a.index.cmp(&b.index)));
            });
        let by_chrom = self
            .by_chrom
            .into_iter()
            .map(|(chrom, regions)| (chrom, VecDeque::from(regions)))
            .collect();
        WindowIter {
            references: self.references,
            window_size: self.window_size,
            by_chrom,
            ref_idx: 0,
            offset: 0,
            ordinal: 0,
            pending: None,
        }
    }
}

/// Iterator over the (window, slices) jobs of one pass.
pub struct WindowIter {
    references: ReferenceSequences,
    window_size: u64,
    by_chrom: FxHashMap<String, VecDeque<Region>>,
    ref_idx: usize,
    offset: u64,
    ordinal: u64,
    /// Region queue for the reference currently being windowed.
    pending: Option<VecDeque<Region>>,
}

impl Iterator for WindowIter {
    type Item = WindowJob;

    fn next(&mut self) -> Option<WindowJob> {
        loop {
            let (chrom, chrom_len) = self.references.iter().nth(self.ref_idx)?.clone();

            if self.offset >= chrom_len {
                self.ref_idx += 1;
                self.offset = 0;
                self.pending = None;
                continue;
            }

            if self.pending.is_none() {
                self.pending = Some(
                    self.by_chrom
                        .remove(normalize_chrom(&chrom))
                        .unwrap_or_default(),
                );
            }

            let win_start = self.offset;
            let win_stop = (win_start + self.window_size).min(chrom_len);
            self.offset = win_stop;

            let window = ProcessingWindow {
                chrom,
                start: win_start,
                stop: win_stop,
                ordinal: self.ordinal,
            };
            self.ordinal += 1;

            let queue = self.pending.as_mut().expect("pending queue initialized");
            let mut slices = Vec::new();
            let mut carry = Vec::new();
            while let Some(region) = queue.pop_front() {
                if region.stop <= win_start {
                    // Entirely before this window; discard.
                    continue;
                }
                if region.start >= win_stop {
                    queue.push_front(region);
                    break;
                }
                slices.push(region.clipped(win_start, win_stop));
                if region.stop > win_stop {
                    // Spans the seam; stays eligible for the next window.
                    carry.push(region);
                }
            }
            for region in carry.into_iter().rev() {
                queue.push_front(region);
            }

            return Some(WindowJob { window, slices });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(pairs: &[(&str, u64)]) -> ReferenceSequences {
        ReferenceSequences::from_pairs(
            pairs.iter().map(|(n, l)| (n.to_string(), *l)).collect(),
        )
    }

    fn region(chrom: &str, start: u64, stop: u64, name: &str) -> Region {
        Region::new(chrom, start, stop, name, "ref", 0)
    }

    #[test]
    fn test_windows_tile_references() {
        let planner = WindowPlanner::new(refs(&[("1", 250), ("2", 100)]), 100);
        let jobs: Vec<WindowJob> = planner.plan().collect();
        let spans: Vec<(String, u64, u64, u64)> = jobs
            .iter()
            .map(|j| {
                (
                    j.window.chrom.clone(),
                    j.window.start,
                    j.window.stop,
                    j.window.ordinal,
                )
            })
            .collect();
        assert_eq!(
            spans,
            vec![
                ("1".to_string(), 0, 100, 0),
                ("1".to_string(), 100, 200, 1),
                ("1".to_string(), 200, 250, 2),
                ("2".to_string(), 0, 100, 3),
            ]
        );
    }

    #[test]
    fn test_spanning_region_sliced_into_both_windows() {
        let mut planner = WindowPlanner::new(refs(&[("1", 300)]), 100);
        planner.add_region(region("1", 50, 250, "g1"));
        let jobs: Vec<WindowJob> = planner.plan().collect();

        assert_eq!(jobs[0].slices.len(), 1);
        assert_eq!((jobs[0].slices[0].start, jobs[0].slices[0].stop), (50, 100));
        assert_eq!(jobs[1].slices.len(), 1);
        assert_eq!(
            (jobs[1].slices[0].start, jobs[1].slices[0].stop),
            (100, 200)
        );
        assert_eq!(jobs[2].slices.len(), 1);
        assert_eq!(
            (jobs[2].slices[0].start, jobs[2].slices[0].stop),
            (200, 250)
        );
        for job in &jobs {
            for slice in &job.slices {
                assert_eq!(slice.name, "g1");
                assert_eq!(slice.descriptor, "ref");
            }
        }
    }

    #[test]
    fn test_chr_prefix_matching_is_symmetric() {
        // BAM header says "chr1", BED said "chr1" (normalized to "1" at
        // ingest). The slice must land in the chr1 windows.
        let mut planner = WindowPlanner::new(refs(&[("chr1", 200)]), 200);
        planner.add_region(region("1", 10, 20, "g1"));
        let jobs: Vec<WindowJob> = planner.plan().collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].window.chrom, "chr1");
        assert_eq!(jobs[0].slices.len(), 1);
        assert_eq!(jobs[0].slices[0].chrom, "1");
    }

    #[test]
    fn test_region_touching_boundary_is_not_sliced_into_next_window() {
        let mut planner = WindowPlanner::new(refs(&[("1", 200)]), 100);
        planner.add_region(region("1", 40, 100, "g1"));
        planner.add_region(region("1", 100, 160, "g2"));
        let jobs: Vec<WindowJob> = planner.plan().collect();

        assert_eq!(jobs[0].slices.len(), 1);
        assert_eq!(jobs[0].slices[0].name, "g1");
        assert_eq!(jobs[1].slices.len(), 1);
        assert_eq!(jobs[1].slices[0].name, "g2");
    }

    #[test]
    fn test_stable_order_for_same_start() {
        let mut planner = WindowPlanner::new(refs(&[("1", 100)]), 100);
        planner.add_region(region("1", 10, 30, "a"));
        planner.add_region(region("1", 10, 20, "b"));
        let jobs: Vec<WindowJob> = planner.plan().collect();
        let names: Vec<&str> = jobs[0].slices.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_chromosome_regions_are_ignored() {
        let mut planner = WindowPlanner::new(refs(&[("1", 100)]), 100);
        planner.add_region(region("17", 10, 30, "elsewhere"));
        let jobs: Vec<WindowJob> = planner.plan().collect();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].slices.is_empty());
    }
}
