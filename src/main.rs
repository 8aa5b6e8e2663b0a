// Clippy allows
#![allow(clippy::too_many_arguments)]

//! covkit: BAM coverage statistics with a queryable store.
//!
//! Usage: covkit <COMMAND> [OPTIONS]

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process;

use covkit::commands::{bam, db, BamCommand, DbCommand};
use covkit::error::{CovError, Result};

#[derive(Parser)]
#[command(name = "covkit")]
#[command(version)]
#[command(about = "Coverage statistics from BAM alignments over BED region sets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute coverage statistics from a BAM file
    Bam {
        /// Input BAM file (must be indexed)
        #[arg(short, long)]
        bam: PathBuf,

        /// Region file in BED format prefixed with a colon-delimited
        /// descriptor (eg 'reference:file.bed'); repeatable
        #[arg(short, long)]
        regions: Vec<String>,

        /// Database file to build prefixed with a colon-delimited descriptor
        /// matching a region file (eg 'reference:file.db'); repeatable
        #[arg(short, long)]
        databases: Vec<String>,

        /// Processing window size
        #[arg(short = 'w', long = "windowSize", default_value_t = 1_000_000)]
        window_size: u64,

        /// Number of processing threads
        #[arg(short, long, default_value_t = 1)]
        threads: usize,

        /// Comma-separated coverage levels for reporting
        #[arg(short, long, default_value = "5,10,20,50,100")]
        levels: String,

        /// Mapping quality cutoff
        #[arg(long, default_value_t = 1)]
        mq: u8,

        /// Calculate genome-wide coverage
        #[arg(long)]
        genome: bool,

        /// Count duplicate reads
        #[arg(long)]
        allowdups: bool,

        /// Output file for the JSON report
        #[arg(long)]
        json: Option<PathBuf>,

        /// Output file for the text report
        #[arg(long)]
        txt: Option<PathBuf>,
    },

    /// Query a coverage database
    Db {
        /// Input coverage database
        #[arg(short, long)]
        db: PathBuf,

        /// Comma-separated gene list
        #[arg(long = "geneList")]
        gene_list: Option<String>,

        /// File with a newline-separated gene list
        #[arg(long = "geneListFile")]
        gene_list_file: Option<PathBuf>,

        /// Comma-separated minimum percents at X coverage, colon-prefixed
        /// with the level (eg '5:99,10:95'); '.' skips a level
        #[arg(long = "levelsMin")]
        levels_min: Option<String>,

        /// Comma-separated maximum percents at X coverage, colon-prefixed
        /// with the level (eg '5:99,10:95'); '.' skips a level
        #[arg(long = "levelsMax")]
        levels_max: Option<String>,

        /// Minimum average coverage
        #[arg(long = "coverageMin")]
        coverage_min: Option<f64>,

        /// Maximum average coverage
        #[arg(long = "coverageMax")]
        coverage_max: Option<f64>,

        /// Report stitched coverage regions for the requested levels
        #[arg(long = "reportRegions")]
        report_regions: bool,

        /// Output JSON file
        #[arg(long)]
        json: Option<PathBuf>,

        /// Output TSV file
        #[arg(long, alias = "txt")]
        tsv: Option<PathBuf>,
    },
}

/// Split repeatable 'DESCRIPTOR:PATH' arguments.
fn parse_descriptor_pairs(values: &[String], what: &str) -> Result<Vec<(String, PathBuf)>> {
    let mut pairs = Vec::with_capacity(values.len());
    for value in values {
        let (descriptor, path) = value.split_once(':').ok_or_else(|| {
            CovError::InvalidInput(format!(
                "{} arguments must have a colon-delimited descriptor prepended (got '{}')",
                what, value
            ))
        })?;
        pairs.push((descriptor.to_string(), PathBuf::from(path)));
    }
    Ok(pairs)
}

/// Parse a comma-separated level list into sorted thresholds.
fn parse_levels(levels: &str) -> Result<Vec<u32>> {
    let mut parsed = Vec::new();
    for field in levels.split(',') {
        let level = field.trim().parse::<u32>().map_err(|_| {
            CovError::InvalidInput(format!("Invalid coverage level '{}'", field))
        })?;
        parsed.push(level);
    }
    parsed.sort_unstable();
    Ok(parsed)
}

/// Parse 'LEVEL:PCT' filter pairs; a '.' percent skips the level.
fn parse_level_filters(filters: &str) -> Result<Vec<(u32, Option<f64>)>> {
    let mut parsed = Vec::new();
    for field in filters.split(',') {
        let (level, percent) = field.split_once(':').ok_or_else(|| {
            CovError::InvalidInput(format!(
                "Level filters must be colon-delimited LEVEL:PCT pairs (got '{}')",
                field
            ))
        })?;
        let level = level.trim().parse::<u32>().map_err(|_| {
            CovError::InvalidInput(format!("Invalid coverage level '{}'", level))
        })?;
        let percent = match percent.trim() {
            "." => None,
            value => Some(value.parse::<f64>().map_err(|_| {
                CovError::InvalidInput(format!("Invalid percent '{}'", value))
            })?),
        };
        parsed.push((level, percent));
    }
    Ok(parsed)
}

fn read_gene_list_file(path: &PathBuf) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| CovError::path_io(path.clone(), e))?;
    let mut genes = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let gene = line.trim_end();
        if !gene.is_empty() {
            genes.push(gene.to_string());
        }
    }
    Ok(genes)
}

fn run_bam(
    bam_path: PathBuf,
    regions: Vec<String>,
    databases: Vec<String>,
    window_size: u64,
    threads: usize,
    levels: String,
    mq: u8,
    genome: bool,
    allowdups: bool,
    json: Option<PathBuf>,
    txt: Option<PathBuf>,
) -> Result<()> {
    if json.is_none() && txt.is_none() {
        return Err(CovError::InvalidInput(
            "Must specify an output with --json or --txt".to_string(),
        ));
    }

    let command = BamCommand {
        bam: bam_path,
        regions: parse_descriptor_pairs(&regions, "Region")?,
        databases: parse_descriptor_pairs(&databases, "Database")?,
        window_size,
        threads,
        levels: parse_levels(&levels)?,
        mapq_cutoff: mq,
        genome,
        allow_dups: allowdups,
    };
    let summary = command.run()?;
    bam::write_reports(&summary, json.as_deref(), txt.as_deref())
}

fn run_db(
    db_path: PathBuf,
    gene_list: Option<String>,
    gene_list_file: Option<PathBuf>,
    levels_min: Option<String>,
    levels_max: Option<String>,
    coverage_min: Option<f64>,
    coverage_max: Option<f64>,
    report_regions: bool,
    json: Option<PathBuf>,
    tsv: Option<PathBuf>,
) -> Result<()> {
    if json.is_none() && tsv.is_none() {
        return Err(CovError::InvalidInput(
            "Must specify an output with --json or --tsv".to_string(),
        ));
    }
    if gene_list.is_some() && gene_list_file.is_some() {
        return Err(CovError::InvalidInput(
            "Cannot specify both --geneList and --geneListFile".to_string(),
        ));
    }

    let genes = if let Some(list) = gene_list {
        Some(
            list.split(',')
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else if let Some(path) = gene_list_file {
        Some(read_gene_list_file(&path)?)
    } else {
        None
    };

    let command = DbCommand {
        db: db_path,
        genes,
        levels_min: levels_min.as_deref().map(parse_level_filters).transpose()?.unwrap_or_default(),
        levels_max: levels_max.as_deref().map(parse_level_filters).transpose()?.unwrap_or_default(),
        coverage_min,
        coverage_max,
        report_regions,
    };
    let document = command.run()?;
    db::write_reports(&document, report_regions, json.as_deref(), tsv.as_deref())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Bam {
            bam,
            regions,
            databases,
            window_size,
            threads,
            levels,
            mq,
            genome,
            allowdups,
            json,
            txt,
        } => run_bam(
            bam,
            regions,
            databases,
            window_size,
            threads,
            levels,
            mq,
            genome,
            allowdups,
            json,
            txt,
        ),

        Commands::Db {
            db,
            gene_list,
            gene_list_file,
            levels_min,
            levels_max,
            coverage_min,
            coverage_max,
            report_regions,
            json,
            tsv,
        } => run_db(
            db,
            gene_list,
            gene_list_file,
            levels_min,
            levels_max,
            coverage_min,
            coverage_max,
            report_regions,
            json,
            tsv,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor_pairs() {
        let pairs =
            parse_descriptor_pairs(&["ref:genes.bed".to_string()], "Region").unwrap();
        assert_eq!(pairs[0].0, "ref");
        assert_eq!(pairs[0].1, PathBuf::from("genes.bed"));

        // Only the first colon delimits the descriptor.
        let pairs =
            parse_descriptor_pairs(&["ref:dir:with:colons.bed".to_string()], "Region").unwrap();
        assert_eq!(pairs[0].1, PathBuf::from("dir:with:colons.bed"));

        assert!(parse_descriptor_pairs(&["nodescriptor.bed".to_string()], "Region").is_err());
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(parse_levels("5,10,20,50,100").unwrap(), vec![5, 10, 20, 50, 100]);
        assert_eq!(parse_levels("100,5").unwrap(), vec![5, 100]);
        assert!(parse_levels("5,ten").is_err());
    }

    #[test]
    fn test_parse_level_filters() {
        let filters = parse_level_filters("5:99,10:.,20:90.5").unwrap();
        assert_eq!(
            filters,
            vec![(5, Some(99.0)), (10, None), (20, Some(90.5))]
        );
        assert!(parse_level_filters("5").is_err());
        assert!(parse_level_filters("5:high").is_err());
    }
}
