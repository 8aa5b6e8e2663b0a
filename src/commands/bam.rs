//! The `bam` subcommand: one parallel coverage pass over an alignment file.
//!
//! Window jobs flow through a bounded channel to a fixed pool of worker
//! threads; results come back tagged with the window ordinal and are folded
//! in genome order through a reorder buffer, which the seam correction in the
//! aggregator depends on.

use crate::aggregate::{Aggregator, BamSummary};
use crate::bed;
use crate::db::{CoverageDb, DbMeta};
use crate::error::{CovError, Result};
use crate::regionset::RegionSetAccumulator;
use crate::windows::{ReferenceSequences, WindowJob, WindowPlanner};
use crate::worker::{scan_window, ScanOptions, WindowReport};
use crossbeam_channel::bounded;
use log::info;
use rust_htslib::bam::{self, Read};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

/// Configuration for one coverage pass.
#[derive(Debug, Clone)]
pub struct BamCommand {
    pub bam: PathBuf,
    /// (descriptor, BED path) pairs.
    pub regions: Vec<(String, PathBuf)>,
    /// (descriptor, database path) pairs. Every descriptor must also name a
    /// region file.
    pub databases: Vec<(String, PathBuf)>,
    pub window_size: u64,
    pub threads: usize,
    pub levels: Vec<u32>,
    pub mapq_cutoff: u8,
    pub genome: bool,
    pub allow_dups: bool,
}

impl BamCommand {
    /// Run the pass and return the summary document.
    pub fn run(&self) -> Result<BamSummary> {
        for (descriptor, _) in &self.databases {
            if !self.regions.iter().any(|(d, _)| d == descriptor) {
                return Err(CovError::InvalidInput(format!(
                    "Database descriptor '{}' has no matching region descriptor",
                    descriptor
                )));
            }
        }

        let mut levels = self.levels.clone();
        levels.sort_unstable();
        levels.dedup();

        let references = {
            let reader = bam::Reader::from_path(&self.bam)?;
            ReferenceSequences::from_header(reader.header())?
        };

        info!(
            "Preparing to read from {} input region files",
            self.regions.len()
        );
        let mut planner = WindowPlanner::new(references, self.window_size);
        let mut sets: BTreeMap<String, RegionSetAccumulator> = BTreeMap::new();
        for (descriptor, path) in &self.regions {
            sets.insert(
                descriptor.clone(),
                RegionSetAccumulator::new(descriptor, &levels),
            );
            for region in bed::read_regions(path, descriptor)? {
                planner.add_region(region);
            }
        }

        info!("Creating processing windows using specified window size and input regions");
        let jobs: Vec<WindowJob> = planner.plan().collect();
        info!("Total windows to process: {}", jobs.len());

        let opts = ScanOptions {
            levels: levels.clone(),
            mapq_cutoff: self.mapq_cutoff,
            allow_dups: self.allow_dups,
            genome: self.genome,
        };

        let descriptors: Vec<String> = self.regions.iter().map(|(d, _)| d.clone()).collect();
        let mut aggregator = Aggregator::new(&descriptors);

        let threads = self.threads.max(1);
        if threads == 1 {
            for job in &jobs {
                let report = scan_window(&self.bam, job, &opts)?;
                fold(&mut aggregator, &mut sets, &report);
            }
        } else {
            self.run_pool(jobs, &opts, threads, &mut aggregator, &mut sets)?;
        }

        let bam_display = self.bam.display().to_string();
        let mut summary = aggregator.summary(&bam_display, self.genome);
        for (descriptor, path) in &self.regions {
            let set = sets.get_mut(descriptor).expect("set exists per descriptor");
            summary.region_stats.insert(
                descriptor.clone(),
                set.summary(&path.display().to_string()),
            );
        }

        for (descriptor, db_path) in &self.databases {
            let region_path = self
                .regions
                .iter()
                .find(|(d, _)| d == descriptor)
                .map(|(_, p)| p.display().to_string())
                .expect("validated above");
            let set = sets.get_mut(descriptor).expect("set exists per descriptor");
            let meta = DbMeta {
                region_source: region_path,
                coverage_source: bam_display.clone(),
                levels: set.levels().to_vec(),
                mapq_cutoff: self.mapq_cutoff,
                dups_allowed: self.allow_dups,
                total_coverage: aggregator.total_coverage(),
            };
            let mut db = CoverageDb::create(db_path, &meta)?;
            db.insert_region_set(set)?;
        }

        info!("Finished.");
        Ok(summary)
    }

    /// Fan jobs out to a bounded worker pool and fold results in ordinal
    /// order through a reorder buffer.
    fn run_pool(
        &self,
        jobs: Vec<WindowJob>,
        opts: &ScanOptions,
        threads: usize,
        aggregator: &mut Aggregator,
        sets: &mut BTreeMap<String, RegionSetAccumulator>,
    ) -> Result<()> {
        let bam_path = self.bam.as_path();
        thread::scope(|scope| -> Result<()> {
            let (job_tx, job_rx) = bounded::<WindowJob>(threads * 2);
            let (result_tx, result_rx) = bounded::<(u64, Result<WindowReport>)>(threads * 2);

            for _ in 0..threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let ordinal = job.window.ordinal;
                        let report = scan_window(bam_path, &job, opts);
                        if result_tx.send((ordinal, report)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            scope.spawn(move || {
                for job in jobs {
                    if job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            // Windows complete out of order; the fold must not.
            let mut pending: BTreeMap<u64, WindowReport> = BTreeMap::new();
            let mut next_ordinal: u64 = 0;
            for (ordinal, report) in result_rx {
                pending.insert(ordinal, report?);
                while let Some(ready) = pending.remove(&next_ordinal) {
                    fold(aggregator, sets, &ready);
                    next_ordinal += 1;
                }
            }
            Ok(())
        })
    }
}

fn fold(
    aggregator: &mut Aggregator,
    sets: &mut BTreeMap<String, RegionSetAccumulator>,
    report: &WindowReport,
) {
    aggregator.add(report);
    for (region, level_report) in &report.subregions {
        if let Some(set) = sets.get_mut(&region.descriptor) {
            set.add(region, level_report);
        }
    }
}

/// Write the pass summary as JSON and/or a human-readable text report.
pub fn write_reports(
    summary: &BamSummary,
    json_out: Option<&Path>,
    txt_out: Option<&Path>,
) -> Result<()> {
    if let Some(path) = txt_out {
        let file = File::create(path).map_err(|e| CovError::path_io(path.to_path_buf(), e))?;
        let mut out = BufWriter::new(file);
        render_text_report(summary, &mut out, txt_out, json_out)?;
        out.flush()?;
    }
    if let Some(path) = json_out {
        let file = File::create(path).map_err(|e| CovError::path_io(path.to_path_buf(), e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), summary)?;
    }
    Ok(())
}

fn render_text_report<W: Write>(
    summary: &BamSummary,
    out: &mut W,
    txt_out: Option<&Path>,
    json_out: Option<&Path>,
) -> Result<()> {
    writeln!(
        out,
        "covkit bam (v{}) -- text report",
        summary.version
    )?;
    writeln!(out)?;
    writeln!(out, "Input BAM file:\t{}", summary.input_bam)?;
    if let Some(path) = txt_out {
        writeln!(out, "Text report file:\t{}", path.display())?;
    }
    if let Some(path) = json_out {
        writeln!(out, "JSON report file:\t{}", path.display())?;
    }
    writeln!(out)?;
    writeln!(out, "Total reads:\t{}", summary.all_reads)?;
    writeln!(out, "Number of reads counted:\t{}", summary.reads_counted)?;
    writeln!(out, "Number of reads not counted:")?;
    let all_reads = summary.all_reads as f64;
    for (category, count) in [
        ("unmapped", summary.reads_not_counted.unmapped),
        ("duplicate", summary.reads_not_counted.duplicate),
        ("mapquality", summary.reads_not_counted.mapquality),
    ] {
        let percent = if summary.all_reads > 0 {
            count as f64 / all_reads * 100.0
        } else {
            0.0
        };
        writeln!(out, "\t{}:\t{:3.2}%\t({})", category, percent, count)?;
    }
    writeln!(out, "Average insert size estimate:\t{}", summary.insert_mean)?;
    writeln!(
        out,
        "Insert size standard deviation estimate:\t{}",
        summary.insert_sd
    )?;
    if let Some(genome) = &summary.genome {
        writeln!(
            out,
            "Average genome-wide coverage:\t{}",
            genome.avg_coverage
        )?;
    }
    writeln!(out, "On target percentages:")?;
    for (descriptor, count) in &summary.on_target {
        let percent = if summary.reads_counted > 0 {
            *count as f64 / summary.reads_counted as f64 * 100.0
        } else {
            0.0
        };
        writeln!(out, "\t{}:\t{:3.2}%", descriptor, percent)?;
    }
    writeln!(out, "Region stats:")?;
    for (name, stats) in &summary.region_stats {
        writeln!(out, "\t{}:", name)?;
        writeln!(out, "\t\tRegion file:\t{}", stats.file)?;
        writeln!(out, "\t\tNumber of regions:\t{}", stats.num_regions)?;
        writeln!(out, "\t\tLength:\t{}", stats.length)?;
        writeln!(out, "\t\tAverage Coverage:\t{}", stats.avg_coverage)?;
        writeln!(out, "\t\tPercent at X coverage or greater:")?;
        for (level, breadth) in &stats.coverage_levels {
            writeln!(out, "\t\t\t{}X:\t{:3.2}", level, breadth * 100.0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueryFilter;
    use crate::worker::test_support::build_bam;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_bed(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    fn command(bam: PathBuf, regions: Vec<(String, PathBuf)>) -> BamCommand {
        BamCommand {
            bam,
            regions,
            databases: Vec::new(),
            window_size: 1_000_000,
            threads: 1,
            levels: vec![5, 10, 20, 50, 100],
            mapq_cutoff: 1,
            genome: false,
            allow_dups: false,
        }
    }

    #[test]
    fn test_empty_bam_pass() {
        let dir = tempdir().unwrap();
        let bam = build_bam(dir.path(), &[("1", 1000)], &[]);
        let bed = write_bed(dir.path(), "regions.bed", &["1\t100\t200\tg1"]);

        let cmd = command(bam, vec![("ref".to_string(), bed)]);
        let summary = cmd.run().unwrap();

        assert_eq!(summary.reads_counted, 0);
        assert!(summary.insert_mean.is_nan());
        let stats = &summary.region_stats["ref"];
        assert_eq!(stats.num_regions, 1);
        assert_eq!(stats.avg_coverage, 0.0);
        assert_eq!(stats.coverage_levels[&5], 0.0);
    }

    #[test]
    fn test_seam_read_counted_once_end_to_end() {
        let dir = tempdir().unwrap();
        // One read spanning the 100 boundary with windowSize 100.
        let bam = build_bam(
            dir.path(),
            &[("1", 300)],
            &["r1\t0\t1\t91\t60\t120M\t*\t0\t0\t*\t*"],
        );
        let bed = write_bed(dir.path(), "regions.bed", &["1\t0\t300\tg1"]);

        let mut cmd = command(bam, vec![("ref".to_string(), bed)]);
        cmd.window_size = 100;
        let summary = cmd.run().unwrap();

        assert_eq!(summary.reads_counted, 1);
        assert_eq!(summary.all_reads, 1);
        assert_eq!(summary.on_target["ref"], 1);

        // The region was sliced into three windows and rejoined. The CIGAR
        // walk restarts at each window's clipped read start, so the windows
        // contribute 10, 100 and 100 covered bases.
        let stats = &summary.region_stats["ref"];
        assert_eq!(stats.num_regions, 1);
        assert_eq!(stats.length, 300);
        assert!((stats.avg_coverage - 210.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let dir = tempdir().unwrap();
        let mut sam_lines = Vec::new();
        let lines: Vec<String> = (0..40)
            .map(|i| {
                format!(
                    "r{}\t0\t1\t{}\t60\t50M\t*\t0\t0\t*\t*",
                    i,
                    1 + i * 37 % 900
                )
            })
            .collect();
        // BAI indexing requires coordinate order.
        let mut sorted: Vec<(u64, &String)> = lines
            .iter()
            .map(|l| (l.split('\t').nth(3).unwrap().parse::<u64>().unwrap(), l))
            .collect();
        sorted.sort();
        for (_, line) in sorted {
            sam_lines.push(line.as_str());
        }
        let bam = build_bam(dir.path(), &[("1", 1000)], &sam_lines);
        let bed = write_bed(
            dir.path(),
            "regions.bed",
            &["1\t0\t400\tga", "1\t400\t1000\tgb"],
        );

        let mut sequential = command(bam.clone(), vec![("ref".to_string(), bed.clone())]);
        sequential.window_size = 100;
        let expected = sequential.run().unwrap();

        let mut parallel = command(bam, vec![("ref".to_string(), bed)]);
        parallel.window_size = 100;
        parallel.threads = 4;
        let actual = parallel.run().unwrap();

        assert_eq!(actual.reads_counted, expected.reads_counted);
        assert_eq!(actual.on_target, expected.on_target);
        let e = &expected.region_stats["ref"];
        let a = &actual.region_stats["ref"];
        assert_eq!(a.length, e.length);
        assert!((a.avg_coverage - e.avg_coverage).abs() < 1e-12);
        assert_eq!(a.coverage_levels, e.coverage_levels);
    }

    #[test]
    fn test_database_written_and_queryable() {
        let dir = tempdir().unwrap();
        let bam = build_bam(
            dir.path(),
            &[("1", 10_000)],
            &["r1\t0\t1\t151\t60\t100M\t*\t0\t0\t*\t*"],
        );
        let bed = write_bed(dir.path(), "regions.bed", &["1\t100\t300\tg1"]);
        let db_path = dir.path().join("coverage.db");

        let mut cmd = command(bam, vec![("ref".to_string(), bed)]);
        cmd.databases = vec![("ref".to_string(), db_path.clone())];
        cmd.run().unwrap();

        let mut db = CoverageDb::open(&db_path).unwrap();
        assert_eq!(db.levels(), &[0, 5, 10, 20, 50, 100]);
        let rows = db.query(&QueryFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "g1");
        assert!((rows[0].coverage - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_database_descriptor_must_match_region() {
        let dir = tempdir().unwrap();
        let bam = build_bam(dir.path(), &[("1", 1000)], &[]);
        let bed = write_bed(dir.path(), "regions.bed", &["1\t100\t200\tg1"]);

        let mut cmd = command(bam, vec![("ref".to_string(), bed)]);
        cmd.databases = vec![("other".to_string(), dir.path().join("x.db"))];
        assert!(matches!(cmd.run(), Err(CovError::InvalidInput(_))));
    }

    #[test]
    fn test_reports_written() {
        let dir = tempdir().unwrap();
        let bam = build_bam(
            dir.path(),
            &[("1", 10_000)],
            &["r1\t0\t1\t151\t60\t100M\t*\t0\t0\t*\t*"],
        );
        let bed = write_bed(dir.path(), "regions.bed", &["1\t100\t300\tg1"]);
        let cmd = command(bam, vec![("ref".to_string(), bed)]);
        let summary = cmd.run().unwrap();

        let json_path = dir.path().join("report.json");
        let txt_path = dir.path().join("report.txt");
        write_reports(&summary, Some(&json_path), Some(&txt_path)).unwrap();

        let json: serde_json::Value =
            serde_json::from_reader(File::open(&json_path).unwrap()).unwrap();
        assert_eq!(json["readsCounted"], 1);
        assert!(json["regionStats"]["ref"]["coverageLevels"].is_object());

        let text = std::fs::read_to_string(&txt_path).unwrap();
        assert!(text.contains("covkit bam"));
        assert!(text.contains("Number of reads counted:\t1"));
        assert!(text.contains("Region stats:"));
    }
}
