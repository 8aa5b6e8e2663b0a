//! Cross-window aggregation.
//!
//! Window reports arrive in genome order and are folded into pass-level
//! totals. Reads that straddle a window seam were counted by both sides;
//! the first/last boundary columns let the fold subtract them back out.

use crate::regionset::RegionSetSummary;
use crate::worker::{Uncounted, WindowReport};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// Insert-size samples kept in memory, at most.
const INSERT_SIZE_CAP: usize = 10_000_000;

/// Pass-level fold over genome-ordered window reports.
#[derive(Debug)]
pub struct Aggregator {
    on_target: FxHashMap<String, i64>,
    total_reads: i64,
    total_coverage: u64,
    total_length: u64,
    last_column: FxHashMap<String, Vec<String>>,
    uncounted: Uncounted,
    insert_sizes: Vec<i64>,
}

impl Aggregator {
    /// Create a fold with an on-target counter per region-set descriptor.
    pub fn new<S: AsRef<str>>(descriptors: &[S]) -> Self {
        let mut on_target = FxHashMap::default();
        for descriptor in descriptors {
            on_target.insert(descriptor.as_ref().to_string(), 0);
        }
        Self {
            on_target,
            total_reads: 0,
            total_coverage: 0,
            total_length: 0,
            last_column: FxHashMap::default(),
            uncounted: Uncounted::default(),
            insert_sizes: Vec::new(),
        }
    }

    /// Fold in the next window report. Reports must arrive in genome order
    /// for the seam correction to line up.
    pub fn add(&mut self, report: &WindowReport) {
        self.uncounted.unmapped += report.uncounted.unmapped;
        self.uncounted.duplicate += report.uncounted.duplicate;
        self.uncounted.mapquality += report.uncounted.mapquality;

        if self.insert_sizes.len() < INSERT_SIZE_CAP {
            self.insert_sizes.extend_from_slice(&report.insert_sizes);
        }

        // A read in both the previous window's last column and this window's
        // first column was counted twice; take one count back, and likewise
        // for any region set that claimed it on both sides of the seam.
        let mut reads = report.reads_counted as i64;
        let mut on_target: FxHashMap<&str, i64> = report
            .on_target
            .iter()
            .map(|(descriptor, &count)| (descriptor.as_str(), count as i64))
            .collect();
        for (read, claims) in &report.first_column {
            if let Some(previous_claims) = self.last_column.get(read) {
                reads -= 1;
                for descriptor in claims {
                    if previous_claims.contains(descriptor) {
                        if let Some(count) = on_target.get_mut(descriptor.as_str()) {
                            *count -= 1;
                        }
                    }
                }
            }
        }
        self.last_column = report.last_column.clone();

        self.total_reads += reads;
        for (descriptor, count) in on_target {
            if let Some(total) = self.on_target.get_mut(descriptor) {
                *total += count;
            }
        }
        self.total_coverage += report.window_levels.coverage_sum;
        self.total_length += report.window.len();
    }

    pub fn total_coverage(&self) -> u64 {
        self.total_coverage
    }

    pub fn reads_counted(&self) -> i64 {
        self.total_reads
    }

    /// Build the pass summary. `region_stats` is filled in by the caller.
    pub fn summary(&self, bam_path: &str, genome: bool) -> BamSummary {
        let (insert_mean, insert_sd) = insert_stats(&self.insert_sizes);

        let all_reads = self.total_reads + self.uncounted.total() as i64;

        BamSummary {
            version: crate::VERSION.to_string(),
            input_bam: bam_path.to_string(),
            all_reads,
            reads_counted: self.total_reads,
            reads_not_counted: self.uncounted.clone(),
            insert_mean,
            insert_sd,
            on_target: self
                .on_target
                .iter()
                .map(|(descriptor, &count)| (descriptor.clone(), count))
                .collect(),
            genome: genome.then(|| GenomeStats {
                avg_coverage: self.total_coverage as f64 / self.total_length as f64,
            }),
            region_stats: BTreeMap::new(),
        }
    }
}

/// Mean and Bessel-corrected sample standard deviation. NaN with fewer than
/// two samples rather than an error.
fn insert_stats(samples: &[i64]) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, f64::NAN);
    }
    let variance = samples
        .iter()
        .map(|&x| (x as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    (mean, variance.sqrt())
}

/// Genome-wide roll-up, present only when genome mode is on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenomeStats {
    pub avg_coverage: f64,
}

/// The pass-level report document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BamSummary {
    pub version: String,
    pub input_bam: String,
    pub all_reads: i64,
    pub reads_counted: i64,
    pub reads_not_counted: Uncounted,
    pub insert_mean: f64,
    #[serde(rename = "insertSD")]
    pub insert_sd: f64,
    pub on_target: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genome: Option<GenomeStats>,
    pub region_stats: BTreeMap<String, RegionSetSummary>,
}
