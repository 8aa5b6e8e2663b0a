//! The `db` subcommand: filter queries over a previously built coverage
//! store, with optional stitched interval reporting.

use crate::bed::stitch_regions;
use crate::db::{CoverageDb, QueryFilter, StoredRegion};
use crate::error::{CovError, Result};
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Configuration for one store query.
#[derive(Debug, Clone, Default)]
pub struct DbCommand {
    pub db: PathBuf,
    pub genes: Option<Vec<String>>,
    /// (level, minimum percent) pairs; `None` percent skips the level.
    pub levels_min: Vec<(u32, Option<f64>)>,
    pub levels_max: Vec<(u32, Option<f64>)>,
    pub coverage_min: Option<f64>,
    pub coverage_max: Option<f64>,
    pub report_regions: bool,
}

/// Query provenance echoed into the result document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    pub version: String,
    pub db_source: String,
    pub coverage_source: String,
    pub region_source: String,
    pub db_levels: Vec<u32>,
    pub query_string: String,
    pub query_result_num: usize,
}

/// Stitched spans below / at-or-above the requested levels.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRegions {
    pub less_than: BTreeMap<u32, Vec<String>>,
    pub greater_or_equal: BTreeMap<u32, Vec<String>>,
}

/// One query hit, prettified for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrettyRegion {
    pub id: String,
    pub position: String,
    pub coverage: f64,
    pub percent_greater_or_equal: BTreeMap<u32, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_regions: Option<CoverageRegions>,
}

/// The full `db` result document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDocument {
    pub meta: QueryMeta,
    pub query_results: Vec<PrettyRegion>,
}

/// "chrom:start-stop" with itoa-formatted coordinates.
fn format_span(chrom: &str, start: u64, stop: u64, buf: &mut itoa::Buffer) -> String {
    let mut s = String::with_capacity(chrom.len() + 24);
    s.push_str(chrom);
    s.push(':');
    s.push_str(buf.format(start));
    s.push('-');
    s.push_str(buf.format(stop));
    s
}

impl DbCommand {
    /// Run the query and build the result document.
    pub fn run(&self) -> Result<QueryDocument> {
        let mut db = CoverageDb::open(&self.db)?;

        let filter = QueryFilter {
            genes: self.genes.clone(),
            coverage_min: self.coverage_min,
            coverage_max: self.coverage_max,
            levels_min: self.levels_min.clone(),
            levels_max: self.levels_max.clone(),
        };
        db.check_levels(&filter.requested_levels())?;

        let rows = db.query(&filter)?;
        let mut query_results = Vec::with_capacity(rows.len());
        for row in &rows {
            query_results.push(self.prettify(row, db.levels())?);
        }
        query_results.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(genes) = &self.genes {
            let returned: Vec<&str> = query_results.iter().map(|r| r.id.as_str()).collect();
            let missing: Vec<&str> = genes
                .iter()
                .map(String::as_str)
                .filter(|g| !returned.contains(g))
                .collect();
            if !missing.is_empty() {
                warn!(
                    "The following regions were not found in the coverage database: [{}]",
                    missing.join(",")
                );
            }
        }

        let meta = QueryMeta {
            version: crate::VERSION.to_string(),
            db_source: self.db.display().to_string(),
            coverage_source: db.coverage_source().to_string(),
            region_source: db.region_source().to_string(),
            db_levels: db.levels().to_vec(),
            query_string: db.last_query().to_string(),
            query_result_num: query_results.len(),
        };

        Ok(QueryDocument {
            meta,
            query_results,
        })
    }

    fn prettify(&self, row: &StoredRegion, db_levels: &[u32]) -> Result<PrettyRegion> {
        let mut itoa_buf = itoa::Buffer::new();
        let position = format_span(&row.chrom, row.start, row.stop, &mut itoa_buf);

        let percent_greater_or_equal = db_levels
            .iter()
            .zip(row.breadths.iter())
            .map(|(&level, &breadth)| (level, breadth))
            .collect();

        let coverage_regions = if self.report_regions {
            let stored: BTreeMap<u32, Vec<(u64, u64)>> = serde_json::from_str(&row.levels_json)?;

            let mut less_than = BTreeMap::new();
            for &(level, _) in &self.levels_max {
                let spans = stitch_regions(
                    stored
                        .iter()
                        .filter(|(&stored_level, _)| stored_level < level)
                        .flat_map(|(_, intervals)| intervals.iter().copied())
                        .collect(),
                );
                less_than.insert(
                    level,
                    spans
                        .iter()
                        .map(|&(a, b)| format_span(&row.chrom, a, b, &mut itoa_buf))
                        .collect(),
                );
            }

            let mut greater_or_equal = BTreeMap::new();
            for &(level, _) in &self.levels_min {
                let spans = stitch_regions(
                    stored
                        .iter()
                        .filter(|(&stored_level, _)| stored_level >= level)
                        .flat_map(|(_, intervals)| intervals.iter().copied())
                        .collect(),
                );
                greater_or_equal.insert(
                    level,
                    spans
                        .iter()
                        .map(|&(a, b)| format_span(&row.chrom, a, b, &mut itoa_buf))
                        .collect(),
                );
            }

            Some(CoverageRegions {
                less_than,
                greater_or_equal,
            })
        } else {
            None
        };

        Ok(PrettyRegion {
            id: row.id.clone(),
            position,
            coverage: row.coverage,
            percent_greater_or_equal,
            coverage_regions,
        })
    }
}

/// Write the result document as JSON and/or TSV, plus the console summary.
pub fn write_reports(
    document: &QueryDocument,
    report_regions: bool,
    json_out: Option<&Path>,
    tsv_out: Option<&Path>,
) -> Result<()> {
    if let Some(path) = json_out {
        let file = File::create(path).map_err(|e| CovError::path_io(path.to_path_buf(), e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), document)?;
    }

    if let Some(path) = tsv_out {
        let file = File::create(path).map_err(|e| CovError::path_io(path.to_path_buf(), e))?;
        let mut out = BufWriter::new(file);
        let mut ryu_buf = ryu::Buffer::new();

        let header_levels: Vec<String> = document
            .meta
            .db_levels
            .iter()
            .map(|l| format!("PercentAtOrAbove{}X", l))
            .collect();
        write!(
            out,
            "RegionID\tPosition\tAverageCoverage\t{}",
            header_levels.join("\t")
        )?;
        if report_regions {
            writeln!(out, "\tRegionsLessThan\tRegionsGreaterThanOrEqual")?;
        } else {
            writeln!(out)?;
        }

        for result in &document.query_results {
            write!(
                out,
                "{}\t{}\t{}",
                result.id,
                result.position,
                ryu_buf.format(result.coverage)
            )?;
            for level in &document.meta.db_levels {
                let breadth = result
                    .percent_greater_or_equal
                    .get(level)
                    .copied()
                    .unwrap_or(0.0);
                write!(out, "\t{}", ryu_buf.format(breadth))?;
            }
            if report_regions {
                let regions = result
                    .coverage_regions
                    .as_ref()
                    .expect("coverage regions requested");
                writeln!(
                    out,
                    "\t{}\t{}",
                    serde_json::to_string(&regions.less_than)?,
                    serde_json::to_string(&regions.greater_or_equal)?
                )?;
            } else {
                writeln!(out)?;
            }
        }
        out.flush()?;
    }

    println!("\n\ncovkit db results:");
    println!("--------------");
    println!("DB coverage source:\t{}", document.meta.coverage_source);
    println!("DB region source:\t{}", document.meta.region_source);
    println!("DB query string:\t{}", document.meta.query_string);
    println!("Records retrieved:\t{}", document.meta.query_result_num);
    if let Some(path) = json_out {
        println!("JSON output:\t{}", path.display());
    }
    if let Some(path) = tsv_out {
        println!("tsv output:\t{}", path.display());
    }
    println!("\n");

    Ok(())
}
