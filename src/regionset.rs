//! Per-region-set roll-up.
//!
//! Window workers emit one level report per sub-region slice; slices of the
//! same user region (same name) are rejoined here, then finalized into
//! average coverage and breadth at each configured level.

use crate::error::Result;
use crate::levels::LevelReport;
use crate::region::Region;
use log::warn;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// One named region after rejoining its slices.
#[derive(Debug, Clone)]
pub struct RegionRecord {
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    pub length: u64,
    pub coverage: u64,
    /// (start, stop, coverage) per contributing slice.
    pub subregions: Vec<(u64, u64, u64)>,
    /// Run intervals keyed by level.
    pub by_level: BTreeMap<u32, Vec<(u64, u64)>>,
    /// Set by `calc`.
    pub average_coverage: f64,
    /// Breadth at or above each level; set by `calc`.
    pub level_coverage: BTreeMap<u32, f64>,
}

/// Set-level summary for the pass report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSetSummary {
    pub file: String,
    pub num_regions: u64,
    pub length: u64,
    pub avg_coverage: f64,
    pub coverage_levels: BTreeMap<u32, f64>,
}

/// One row destined for the store's `regions` table.
#[derive(Debug, Clone)]
pub struct DbRow {
    pub id: String,
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    pub subregions_json: String,
    pub length: u64,
    pub average_coverage: f64,
    pub levels_json: String,
    /// Breadth per level, in ascending level order (0 first).
    pub breadths: Vec<f64>,
}

/// Accumulates one region set's slices across the whole pass.
#[derive(Debug)]
pub struct RegionSetAccumulator {
    set_name: String,
    levels: Vec<u32>,
    records: FxHashMap<String, RegionRecord>,
    num_regions: u64,
    length: u64,
    coverage: u64,
    level_totals: BTreeMap<u32, u64>,
    calc_done: bool,
}

impl RegionSetAccumulator {
    /// Create an accumulator for the given set. A leading level 0 is added
    /// exactly once.
    pub fn new(set_name: &str, thresholds: &[u32]) -> Self {
        let mut levels = Vec::with_capacity(thresholds.len() + 1);
        if thresholds.first() != Some(&0) {
            levels.push(0);
        }
        levels.extend_from_slice(thresholds);

        let level_totals = levels.iter().map(|&l| (l, 0)).collect();
        Self {
            set_name: set_name.to_string(),
            levels,
            records: FxHashMap::default(),
            num_regions: 0,
            length: 0,
            coverage: 0,
            level_totals,
            calc_done: false,
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Levels in ascending order, 0 included.
    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    /// Fold in one slice's level report, joining by region name.
    pub fn add(&mut self, region: &Region, report: &LevelReport) {
        debug_assert_eq!(region.descriptor, self.set_name);
        self.calc_done = false;

        if let Some(record) = self.records.get_mut(&region.name) {
            if record.chrom != region.chrom {
                // Pseudoautosomal names collide across chromosomes; keep the
                // first-seen chromosome and fold the data in regardless.
                warn!(
                    "Potential ambiguity in region name for {}. Chromosome {} versus {}.",
                    region.name, region.chrom, record.chrom
                );
            }
            record.start = record.start.min(region.start);
            record.stop = record.stop.max(region.stop);
            record.length += region.len();
            record.coverage += report.coverage_sum;
            for &(a, b, level) in &report.intervals {
                record.by_level.entry(level).or_default().push((a, b));
            }
            record
                .subregions
                .push((region.start, region.stop, report.coverage_sum));
        } else {
            let mut by_level: BTreeMap<u32, Vec<(u64, u64)>> =
                self.levels.iter().map(|&l| (l, Vec::new())).collect();
            for &(a, b, level) in &report.intervals {
                by_level.entry(level).or_default().push((a, b));
            }
            self.records.insert(
                region.name.clone(),
                RegionRecord {
                    chrom: region.chrom.clone(),
                    start: region.start,
                    stop: region.stop,
                    length: region.len(),
                    coverage: report.coverage_sum,
                    subregions: vec![(region.start, region.stop, report.coverage_sum)],
                    by_level,
                    average_coverage: 0.0,
                    level_coverage: BTreeMap::new(),
                },
            );
            self.num_regions += 1;
        }

        self.coverage += report.coverage_sum;
        self.length += region.len();
    }

    /// Finalize averages and breadths. Breadth at level T counts every base
    /// at or above T, so levels are walked in descending order with a
    /// running total.
    pub fn calc(&mut self) {
        for total in self.level_totals.values_mut() {
            *total = 0;
        }
        for record in self.records.values_mut() {
            record.average_coverage = record.coverage as f64 / record.length as f64;
            record.level_coverage.clear();
            let mut aggregate: u64 = 0;
            for &level in self.levels.iter().rev() {
                if let Some(intervals) = record.by_level.get(&level) {
                    aggregate += intervals.iter().map(|&(a, b)| b - a).sum::<u64>();
                }
                record
                    .level_coverage
                    .insert(level, aggregate as f64 / record.length as f64);
                *self.level_totals.get_mut(&level).expect("known level") += aggregate;
            }
        }
        self.calc_done = true;
    }

    /// Set-level summary for the pass report.
    pub fn summary(&mut self, file: &str) -> RegionSetSummary {
        if !self.calc_done {
            self.calc();
        }
        let coverage_levels = self
            .level_totals
            .iter()
            .map(|(&level, &covered)| (level, covered as f64 / self.length as f64))
            .collect();
        RegionSetSummary {
            file: file.to_string(),
            num_regions: self.num_regions,
            length: self.length,
            avg_coverage: self.coverage as f64 / self.length as f64,
            coverage_levels,
        }
    }

    /// Look up a finalized record.
    pub fn record(&mut self, name: &str) -> Option<&RegionRecord> {
        if !self.calc_done {
            self.calc();
        }
        self.records.get(name)
    }

    /// Rows for the store, sorted by region name.
    pub fn rows(&mut self) -> Result<Vec<DbRow>> {
        if !self.calc_done {
            self.calc();
        }
        let mut names: Vec<&String> = self.records.keys().collect();
        names.sort();

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let record = &self.records[name];
            let breadths = self
                .levels
                .iter()
                .map(|level| record.level_coverage[level])
                .collect();
            rows.push(DbRow {
                id: name.clone(),
                chrom: record.chrom.clone(),
                start: record.start,
                stop: record.stop,
                subregions_json: serde_json::to_string(&record.subregions)?,
                length: record.length,
                average_coverage: record.average_coverage,
                levels_json: serde_json::to_string(&record.by_level)?,
                breadths,
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(start: u64, stop: u64, name: &str) -> Region {
        Region::new("1", start, stop, name, "ref", 0)
    }

    fn report(coverage_sum: u64, intervals: Vec<(u64, u64, u32)>) -> LevelReport {
        LevelReport {
            coverage_sum,
            intervals,
        }
    }

    #[test]
    fn test_breadth_thresholds() {
        // Depth profile [25,25,10,10,0] with thresholds [5,10,20]:
        // level 20 owns [0,2), level 10 owns [2,4), level 0 owns [4,5).
        let mut set = RegionSetAccumulator::new("ref", &[5, 10, 20]);
        set.add(
            &slice(0, 5, "g1"),
            &report(70, vec![(0, 2, 20), (2, 4, 10), (4, 5, 0)]),
        );
        set.calc();

        let record = set.record("g1").unwrap().clone();
        assert!((record.average_coverage - 14.0).abs() < 1e-12);
        assert!((record.level_coverage[&5] - 0.8).abs() < 1e-12);
        assert!((record.level_coverage[&10] - 0.8).abs() < 1e-12);
        assert!((record.level_coverage[&20] - 0.4).abs() < 1e-12);
        assert!((record.level_coverage[&0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_breadth_is_monotonic_and_bounded() {
        let mut set = RegionSetAccumulator::new("ref", &[5, 10, 20, 50]);
        set.add(
            &slice(100, 200, "g1"),
            &report(900, vec![(100, 130, 50), (130, 150, 10), (150, 200, 0)]),
        );
        set.calc();

        let record = set.record("g1").unwrap();
        let mut previous = f64::INFINITY;
        for level in [0u32, 5, 10, 20, 50] {
            let breadth = record.level_coverage[&level];
            assert!((0.0..=1.0).contains(&breadth));
            assert!(breadth <= previous);
            previous = breadth;
        }
    }

    #[test]
    fn test_join_slices_by_name() {
        // One region split across a window seam at 100.
        let mut set = RegionSetAccumulator::new("ref", &[5]);
        set.add(&slice(50, 100, "g1"), &report(250, vec![(50, 100, 5)]));
        set.add(&slice(100, 250, "g1"), &report(0, vec![(100, 250, 0)]));
        set.calc();

        let record = set.record("g1").unwrap().clone();
        assert_eq!((record.start, record.stop), (50, 250));
        assert_eq!(record.length, 200);
        assert_eq!(record.coverage, 250);
        assert_eq!(record.subregions.len(), 2);
        assert!((record.average_coverage - 1.25).abs() < 1e-12);
        assert!((record.level_coverage[&5] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_average_times_length_equals_coverage() {
        let mut set = RegionSetAccumulator::new("ref", &[5]);
        set.add(&slice(0, 77, "g1"), &report(1234, vec![(0, 77, 5)]));
        set.calc();
        let record = set.record("g1").unwrap();
        assert!((record.average_coverage * record.length as f64 - 1234.0).abs() < 1e-9);
    }

    #[test]
    fn test_ambiguous_name_keeps_first_chromosome() {
        let mut set = RegionSetAccumulator::new("ref", &[5]);
        set.add(&slice(0, 10, "SHOX"), &report(10, vec![(0, 10, 0)]));

        let mut y_slice = slice(0, 10, "SHOX");
        y_slice.chrom = "Y".to_string();
        set.add(&y_slice, &report(10, vec![(0, 10, 0)]));
        set.calc();

        let record = set.record("SHOX").unwrap();
        assert_eq!(record.chrom, "1");
        assert_eq!(record.length, 20);
    }

    #[test]
    fn test_set_summary_weighted_by_length() {
        let mut set = RegionSetAccumulator::new("ref", &[10]);
        // g1: 100bp fully at >= 10; g2: 300bp none at >= 10.
        set.add(&slice(0, 100, "g1"), &report(1500, vec![(0, 100, 10)]));
        set.add(&slice(200, 500, "g2"), &report(300, vec![(200, 500, 0)]));

        let summary = set.summary("regions.bed");
        assert_eq!(summary.num_regions, 2);
        assert_eq!(summary.length, 400);
        assert!((summary.avg_coverage - 4.5).abs() < 1e-12);
        assert!((summary.coverage_levels[&10] - 0.25).abs() < 1e-12);
        assert!((summary.coverage_levels[&0] - 1.0).abs() < 1e-12);
        assert_eq!(summary.file, "regions.bed");
    }

    #[test]
    fn test_rows_sorted_by_name() {
        let mut set = RegionSetAccumulator::new("ref", &[5]);
        set.add(&slice(100, 200, "zeta"), &report(0, vec![(100, 200, 0)]));
        set.add(&slice(0, 50, "alpha"), &report(0, vec![(0, 50, 0)]));

        let rows = set.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "alpha");
        assert_eq!(rows[1].id, "zeta");
        // Breadth columns follow the ascending level order, 0 included.
        assert_eq!(rows[0].breadths.len(), 2);
        let levels: serde_json::Value = serde_json::from_str(&rows[0].levels_json).unwrap();
        assert!(levels.get("0").is_some());
        assert!(levels.get("5").is_some());
    }

    #[test]
    fn test_zero_threshold_not_double_prepended() {
        let set = RegionSetAccumulator::new("ref", &[0, 5]);
        assert_eq!(set.levels(), &[0, 5]);
        let set = RegionSetAccumulator::new("ref", &[5]);
        assert_eq!(set.levels(), &[0, 5]);
    }
}
