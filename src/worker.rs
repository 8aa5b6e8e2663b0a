//! Window worker: streams alignments over one processing window and builds
//! the per-window coverage report.
//!
//! Each worker owns its BAM reader, depth vector and level machines; the only
//! thing that leaves is the [`WindowReport`]. Three phases: alignment ingest
//! (filtering, CIGAR walk with mate-overlap suppression, boundary columns,
//! insert sizes, on-target dispatch), depth sweep (level machines via the
//! dispatcher, fast-forwarding dead space), report assembly.

use crate::dispatch::{ActiveRegionDispatcher, RegionSchedule};
use crate::error::Result;
use crate::levels::{LevelMachine, LevelReport};
use crate::region::{normalize_chrom, Region};
use crate::windows::{ProcessingWindow, WindowJob};
use log::debug;
use rust_htslib::bam::ext::BamRecordExtensions;
use rust_htslib::bam::record::Cigar;
use rust_htslib::bam::{self, Read};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::path::Path;

/// Scan parameters shared by every window of a pass.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Coverage level thresholds, strictly increasing.
    pub levels: Vec<u32>,
    /// Minimum mapping quality for a read to be counted.
    pub mapq_cutoff: u8,
    /// Count duplicate-flagged reads.
    pub allow_dups: bool,
    /// Tally genome-wide coverage (window-level level machines participate
    /// in the sweep).
    pub genome: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            levels: vec![5, 10, 20, 50, 100],
            mapq_cutoff: 1,
            allow_dups: false,
            genome: false,
        }
    }
}

/// Reads dropped during ingest, by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Uncounted {
    pub unmapped: u64,
    pub duplicate: u64,
    pub mapquality: u64,
}

impl Uncounted {
    pub fn total(&self) -> u64 {
        self.unmapped + self.duplicate + self.mapquality
    }
}

/// A region being tallied: its level machine plus the identities of reads
/// ending inside it.
struct RegionTally {
    region: Region,
    on_target: FxHashSet<String>,
    machine: LevelMachine,
}

impl RegionTally {
    fn new(region: Region, levels: &[u32]) -> Self {
        let machine = LevelMachine::new(region.start, region.stop, levels);
        Self {
            region,
            on_target: FxHashSet::default(),
            machine,
        }
    }

    #[inline]
    fn add(&mut self, pos: u64, depth: u32) {
        self.machine.add(pos, depth);
    }

    /// Record an on-target read. The guard rejects clip-created zero-width
    /// overlaps where the alignment end sits exactly on the region start.
    #[inline]
    fn add_overlap(&mut self, pos: u64, read: &str) {
        if pos >= self.region.start {
            self.on_target.insert(read.to_string());
        }
    }
}

/// Everything one window hands back to the aggregator.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window: ProcessingWindow,
    pub reads_counted: u64,
    /// Distinct on-target reads per region-set descriptor.
    pub on_target: FxHashMap<String, u64>,
    /// Window-level coverage aggregate.
    pub window_levels: LevelReport,
    /// Reads hanging in from before the window, mapped to the descriptors
    /// that claimed them on-target.
    pub first_column: FxHashMap<String, Vec<String>>,
    /// Reads hanging out past the window, mapped likewise.
    pub last_column: FxHashMap<String, Vec<String>>,
    pub uncounted: Uncounted,
    pub insert_sizes: Vec<i64>,
    pub subregions: Vec<(Region, LevelReport)>,
}

/// Scan one window of the BAM and report coverage over its slices.
pub fn scan_window<P: AsRef<Path>>(
    bam_path: P,
    job: &WindowJob,
    opts: &ScanOptions,
) -> Result<WindowReport> {
    let window = &job.window;
    let win_start = window.start as i64;
    let win_stop = window.stop as i64;

    let mut reader = bam::IndexedReader::from_path(bam_path)?;
    reader.fetch((window.chrom.as_str(), win_start, win_stop))?;

    let window_region = Region::new(
        normalize_chrom(&window.chrom),
        window.start,
        window.stop,
        window.ordinal.to_string(),
        "_processing",
        window.ordinal,
    );
    let mut tallies = Vec::with_capacity(job.slices.len() + 1);
    tallies.push(RegionTally::new(window_region, &opts.levels));
    for slice in &job.slices {
        tallies.push(RegionTally::new(slice.clone(), &opts.levels));
    }

    let mut schedule = RegionSchedule::new(&job.slices);
    let mut dispatcher = ActiveRegionDispatcher::new();

    let mut depth = vec![0u32; window.len() as usize];
    let mut uncounted = Uncounted::default();
    let mut first_column_raw: Vec<String> = Vec::new();
    let mut last_column_raw: Vec<String> = Vec::new();
    let mut insert_sizes: Vec<i64> = Vec::new();
    // Insert-length bookkeeping keyed by template name, resolved when the
    // mate arrives.
    let mut mate_tracker: FxHashMap<String, i64> = FxHashMap::default();

    let mut window_reads = 0u64;
    for record in reader.records() {
        let record = record?;

        let counted = (!record.is_duplicate() || opts.allow_dups)
            && record.mapq() >= opts.mapq_cutoff
            && !record.is_unmapped();
        if !counted {
            if record.is_unmapped() {
                uncounted.unmapped += 1;
            } else if record.is_duplicate() && !opts.allow_dups {
                uncounted.duplicate += 1;
            } else if record.mapq() < opts.mapq_cutoff {
                uncounted.mapquality += 1;
            }
            continue;
        }
        window_reads += 1;

        // BAM query names do not distinguish mates of a template, so make
        // the identity explicit.
        let qname = String::from_utf8_lossy(record.qname()).into_owned();
        let read_name = if record.is_first_in_template() {
            format!("{}.1", qname)
        } else {
            format!("{}.2", qname)
        };

        let ref_start = record.reference_start();
        let ref_end = record.reference_end();

        // Clip the coverage span to the window, remembering reads that hang
        // off either edge so the aggregator can undo double counting.
        let read_start = if ref_start < win_start {
            first_column_raw.push(read_name.clone());
            win_start
        } else {
            ref_start
        };
        let read_stop = if ref_end > win_stop {
            last_column_raw.push(read_name.clone());
            win_stop
        } else {
            ref_end
        };

        // Walk the CIGAR, accumulating depth and template insert length.
        let mate_start = record.mpos();
        let suppress = record.is_proper_pair() && record.insert_size() >= 0;
        let mut cursor = read_start;
        let mut insert_len: i64 = 0;
        for op in record.cigar().iter() {
            match op {
                Cigar::Match(l)
                | Cigar::Equal(l)
                | Cigar::Diff(l)
                | Cigar::Del(l)
                | Cigar::RefSkip(l) => {
                    let mut end_point = *l as i64;
                    // Mate-overlap suppression: once the cursor reaches the
                    // mate's start, the mate covers the remainder.
                    let mut truncated = false;
                    if suppress && cursor + end_point >= mate_start {
                        end_point = mate_start - cursor;
                        truncated = true;
                    }
                    if cursor + end_point > win_stop {
                        end_point = win_stop - cursor;
                    }
                    if end_point > 0 {
                        let lo = (cursor - win_start) as usize;
                        let hi = lo + end_point as usize;
                        for d in &mut depth[lo..hi] {
                            *d = d.saturating_add(1);
                        }
                    }
                    cursor += end_point;
                    if !matches!(op, Cigar::Del(_) | Cigar::RefSkip(_)) {
                        insert_len += end_point;
                    }
                    if truncated {
                        break;
                    }
                }
                Cigar::Ins(l) => insert_len += *l as i64,
                // Clips and pads advance neither the reference nor the
                // insert length.
                _ => {}
            }
        }

        // On-target dispatch at the read's final covered base.
        schedule.activate_through(read_stop as u64, &mut dispatcher);
        schedule.retire_through(read_start as u64, &mut dispatcher);
        let overlap_pos = (read_stop - 1) as u64;
        for &slot in dispatcher.slots() {
            tallies[slot].add_overlap(overlap_pos, &read_name);
        }

        // Insert size: first mate parks its contribution, second mate
        // completes the sample.
        if record.is_proper_pair() {
            if let Some(stored) = mate_tracker.remove(&qname) {
                insert_sizes.push(insert_len + stored);
            } else {
                mate_tracker.insert(qname, insert_len + (mate_start - cursor));
            }
        }
    }
    debug!(
        "window {} {}:{}-{}: {} reads counted",
        window.ordinal, window.chrom, window.start, window.stop, window_reads
    );

    // Depth sweep. Skipped entirely when the window has no sub-regions and
    // genome coverage is off.
    if tallies.len() > 1 || opts.genome {
        schedule.reset();
        let mut dispatcher = ActiveRegionDispatcher::new();
        let mut pos = window.start;
        while pos < window.stop {
            schedule.activate_through(pos, &mut dispatcher);
            schedule.retire_through(pos, &mut dispatcher);
            if dispatcher.len() > 1 || opts.genome {
                let d = depth[(pos - window.start) as usize];
                for &slot in dispatcher.slots() {
                    tallies[slot].add(pos, d);
                }
                pos += 1;
            } else if let Some(next) = schedule.next_start() {
                // Nothing active but more sub-regions ahead: fast-forward.
                pos = next;
            } else {
                break;
            }
        }
    }

    Ok(assemble_report(
        window.clone(),
        tallies,
        first_column_raw,
        last_column_raw,
        uncounted,
        insert_sizes,
    ))
}

fn assemble_report(
    window: ProcessingWindow,
    tallies: Vec<RegionTally>,
    first_column_raw: Vec<String>,
    last_column_raw: Vec<String>,
    uncounted: Uncounted,
    insert_sizes: Vec<i64>,
) -> WindowReport {
    let mut tally_iter = tallies.into_iter();
    let window_tally = tally_iter.next().expect("window tally present");
    let reads_counted = window_tally.on_target.len() as u64;
    let window_levels = window_tally.machine.report();

    let mut on_target_sets: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
    let mut subregions = Vec::new();
    for tally in tally_iter {
        let level_report = tally.machine.report();
        on_target_sets
            .entry(tally.region.descriptor.clone())
            .or_default()
            .extend(tally.on_target);
        subregions.push((tally.region, level_report));
    }

    let mut first_column: FxHashMap<String, Vec<String>> = first_column_raw
        .into_iter()
        .map(|name| (name, Vec::new()))
        .collect();
    let mut last_column: FxHashMap<String, Vec<String>> = last_column_raw
        .into_iter()
        .map(|name| (name, Vec::new()))
        .collect();

    let mut on_target = FxHashMap::default();
    for (descriptor, reads) in &on_target_sets {
        on_target.insert(descriptor.clone(), reads.len() as u64);
        for (name, claims) in first_column.iter_mut() {
            if reads.contains(name) {
                claims.push(descriptor.clone());
            }
        }
        for (name, claims) in last_column.iter_mut() {
            if reads.contains(name) {
                claims.push(descriptor.clone());
            }
        }
    }

    WindowReport {
        window,
        reads_counted,
        on_target,
        window_levels,
        first_column,
        last_column,
        uncounted,
        insert_sizes,
        subregions,
    }
}
