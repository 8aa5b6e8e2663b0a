//! SQLite coverage store.
//!
//! One `regions` table keyed by region name, with a `percent{T}X` column per
//! configured level, plus a `metadata` table describing the pass and a
//! `covkit` table recording the tool version and creation time.

use crate::error::{CovError, Result};
use crate::regionset::RegionSetAccumulator;
use log::debug;
use rusqlite::{params_from_iter, Connection};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Pass metadata stored alongside the rows.
#[derive(Debug, Clone)]
pub struct DbMeta {
    pub region_source: String,
    pub coverage_source: String,
    pub levels: Vec<u32>,
    pub mapq_cutoff: u8,
    pub dups_allowed: bool,
    pub total_coverage: u64,
}

/// Value filters for the `db` subcommand. A `None` percent skips that level
/// (the `.` placeholder on the CLI).
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub genes: Option<Vec<String>>,
    pub coverage_min: Option<f64>,
    pub coverage_max: Option<f64>,
    pub levels_min: Vec<(u32, Option<f64>)>,
    pub levels_max: Vec<(u32, Option<f64>)>,
}

impl QueryFilter {
    /// Levels named by the min/max filters, skipped entries included.
    pub fn requested_levels(&self) -> Vec<u32> {
        self.levels_min
            .iter()
            .chain(self.levels_max.iter())
            .map(|&(level, _)| level)
            .collect()
    }
}

/// A row read back from the store.
#[derive(Debug, Clone)]
pub struct StoredRegion {
    pub id: String,
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    pub subregions_json: String,
    pub length: u64,
    pub coverage: f64,
    pub levels_json: String,
    /// Breadths in the store's level order.
    pub breadths: Vec<f64>,
}

/// Single-writer handle over one coverage database.
pub struct CoverageDb {
    conn: Connection,
    levels: Vec<u32>,
    region_source: String,
    coverage_source: String,
    last_query: String,
}

impl CoverageDb {
    /// Create a fresh store, deleting any existing file at the path.
    pub fn create<P: AsRef<Path>>(path: P, meta: &DbMeta) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            fs::remove_file(path).map_err(|e| CovError::path_io(path.to_path_buf(), e))?;
        }
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE regions(id text, chrom text, start integer, stop integer, \
             subregions text, length integer, coverage real, levels text)",
            [],
        )?;
        for level in &meta.levels {
            conn.execute(
                &format!("ALTER TABLE regions ADD COLUMN 'percent{}X' real", level),
                [],
            )?;
        }
        conn.execute("CREATE UNIQUE INDEX ididx ON regions(id)", [])?;
        conn.execute("CREATE INDEX coverageidx ON regions(coverage)", [])?;

        conn.execute(
            "CREATE TABLE metadata(regionsource text, coveragesource text, levels text, \
             mapqualityCutoff int, duplicatesAllowed int, totalCoverage int)",
            [],
        )?;
        let level_string = meta
            .levels
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(",");
        conn.execute(
            "INSERT INTO metadata VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                meta.region_source,
                meta.coverage_source,
                level_string,
                meta.mapq_cutoff,
                meta.dups_allowed as i64,
                meta.total_coverage as i64,
            ],
        )?;

        conn.execute("CREATE TABLE covkit(version text, dateCreated text)", [])?;
        conn.execute(
            "INSERT INTO covkit VALUES (?1,?2)",
            rusqlite::params![crate::VERSION, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(Self {
            conn,
            levels: meta.levels.clone(),
            region_source: meta.region_source.clone(),
            coverage_source: meta.coverage_source.clone(),
            last_query: String::new(),
        })
    }

    /// Open an existing store and load its metadata.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CovError::path_io(
                path.to_path_buf(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "No such coverage database"),
            ));
        }
        let conn = Connection::open(path)?;
        let (region_source, coverage_source, level_string): (String, String, String) = conn
            .query_row("SELECT * FROM metadata LIMIT 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        let levels = level_string
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| CovError::InvalidInput(format!("Corrupt level metadata: {}", s)))
            })
            .collect::<Result<Vec<u32>>>()?;

        Ok(Self {
            conn,
            levels,
            region_source,
            coverage_source,
            last_query: String::new(),
        })
    }

    /// Levels recorded in the store's metadata, ascending.
    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn region_source(&self) -> &str {
        &self.region_source
    }

    pub fn coverage_source(&self) -> &str {
        &self.coverage_source
    }

    /// The most recent SELECT issued by [`query`].
    ///
    /// [`query`]: CoverageDb::query
    pub fn last_query(&self) -> &str {
        &self.last_query
    }

    /// Insert every record of a finalized region set in one transaction.
    pub fn insert_region_set(&mut self, set: &mut RegionSetAccumulator) -> Result<()> {
        let rows = set.rows()?;
        let placeholders = (1..=8 + self.levels.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("INSERT INTO regions VALUES ({})", placeholders);

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in &rows {
                let mut values: Vec<rusqlite::types::Value> = vec![
                    row.id.clone().into(),
                    row.chrom.clone().into(),
                    (row.start as i64).into(),
                    (row.stop as i64).into(),
                    row.subregions_json.clone().into(),
                    (row.length as i64).into(),
                    row.average_coverage.into(),
                    row.levels_json.clone().into(),
                ];
                for &breadth in &row.breadths {
                    values.push(breadth.into());
                }
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Validate that every requested level exists in the store.
    pub fn check_levels(&self, requested: &[u32]) -> Result<()> {
        for level in requested {
            if !self.levels.contains(level) {
                let available = self
                    .levels
                    .iter()
                    .map(|l| l.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                return Err(CovError::Schema(available));
            }
        }
        Ok(())
    }

    /// Run a filtered query over the regions table.
    pub fn query(&mut self, filter: &QueryFilter) -> Result<Vec<StoredRegion>> {
        let mut clauses: Vec<String> = Vec::new();

        if let Some(genes) = &filter.genes {
            let quoted = genes
                .iter()
                .map(|g| format!("\"{}\"", g.replace('"', "\"\"")))
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("id IN ({})", quoted));
        }
        if let Some(low) = filter.coverage_min {
            clauses.push(format!("coverage >= {}", low));
        }
        if let Some(high) = filter.coverage_max {
            clauses.push(format!("coverage < {}", high));
        }
        for &(level, percent) in &filter.levels_min {
            if let Some(percent) = percent {
                clauses.push(format!("percent{}X >= {}", level, percent / 100.0));
            }
        }
        for &(level, percent) in &filter.levels_max {
            if let Some(percent) = percent {
                clauses.push(format!("percent{}X < {}", level, percent / 100.0));
            }
        }

        let mut sql = String::from("SELECT * FROM regions");
        if !clauses.is_empty() {
            write!(sql, " WHERE {}", clauses.join(" AND ")).expect("write to string");
        }
        debug!("{}", sql);
        self.last_query = sql.clone();

        let level_count = self.levels.len();
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let mut breadths = Vec::with_capacity(level_count);
            for i in 0..level_count {
                breadths.push(row.get::<_, f64>(8 + i)?);
            }
            Ok(StoredRegion {
                id: row.get(0)?,
                chrom: row.get(1)?,
                start: row.get::<_, i64>(2)? as u64,
                stop: row.get::<_, i64>(3)? as u64,
                subregions_json: row.get(4)?,
                length: row.get::<_, i64>(5)? as u64,
                coverage: row.get(6)?,
                levels_json: row.get(7)?,
                breadths,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::LevelReport;
    use crate::region::Region;
    use tempfile::tempdir;

    fn meta(levels: &[u32]) -> DbMeta {
        DbMeta {
            region_source: "regions.bed".to_string(),
            coverage_source: "sample.bam".to_string(),
            levels: levels.to_vec(),
            mapq_cutoff: 1,
            dups_allowed: false,
            total_coverage: 12345,
        }
    }

    fn populated_set() -> RegionSetAccumulator {
        let mut set = RegionSetAccumulator::new("ref", &[5, 10]);
        set.add(
            &Region::new("1", 100, 200, "g1", "ref", 0),
            &LevelReport {
                coverage_sum: 800,
                intervals: vec![(100, 150, 10), (150, 200, 0)],
            },
        );
        set.add(
            &Region::new("2", 300, 400, "g2", "ref", 1),
            &LevelReport {
                coverage_sum: 0,
                intervals: vec![(300, 400, 0)],
            },
        );
        set
    }

    #[test]
    fn test_create_insert_and_full_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage.db");

        let mut set = populated_set();
        let mut db = CoverageDb::create(&path, &meta(set.levels())).unwrap();
        db.insert_region_set(&mut set).unwrap();
        drop(db);

        let mut db = CoverageDb::open(&path).unwrap();
        assert_eq!(db.levels(), &[0, 5, 10]);
        assert_eq!(db.region_source(), "regions.bed");
        assert_eq!(db.coverage_source(), "sample.bam");

        // A levelsMin of {0: 0} filters nothing out: full round-trip.
        let filter = QueryFilter {
            levels_min: vec![(0, Some(0.0))],
            ..Default::default()
        };
        let rows = db.query(&filter).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "g1");
        assert!((rows[0].coverage - 8.0).abs() < 1e-12);
        assert_eq!(rows[0].breadths.len(), 3);
        assert!(db.last_query().contains("percent0X >= 0"));
    }

    #[test]
    fn test_query_filters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage.db");
        let mut set = populated_set();
        let mut db = CoverageDb::create(&path, &meta(set.levels())).unwrap();
        db.insert_region_set(&mut set).unwrap();

        // g1 averages 8x, g2 averages 0x.
        let rows = db
            .query(&QueryFilter {
                coverage_min: Some(1.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "g1");

        // Breadth at 10x >= 40%: only g1 (50%).
        let rows = db
            .query(&QueryFilter {
                levels_min: vec![(10, Some(40.0))],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "g1");

        // Skipped level filters ('.') add no clause.
        let rows = db
            .query(&QueryFilter {
                levels_min: vec![(10, None)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = db
            .query(&QueryFilter {
                genes: Some(vec!["g2".to_string()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "g2");
    }

    #[test]
    fn test_check_levels_rejects_unknown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage.db");
        let set = populated_set();
        let db = CoverageDb::create(&path, &meta(set.levels())).unwrap();

        assert!(db.check_levels(&[5, 10]).is_ok());
        let err = db.check_levels(&[42]).unwrap_err();
        assert!(matches!(err, CovError::Schema(_)));
    }

    #[test]
    fn test_create_overwrites_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage.db");

        let mut set = populated_set();
        let mut db = CoverageDb::create(&path, &meta(set.levels())).unwrap();
        db.insert_region_set(&mut set).unwrap();
        drop(db);

        // Recreate with different levels; the old rows must be gone.
        let db = CoverageDb::create(&path, &meta(&[0, 7])).unwrap();
        drop(db);
        let mut db = CoverageDb::open(&path).unwrap();
        assert_eq!(db.levels(), &[0, 7]);
        let rows = db.query(&QueryFilter::default()).unwrap();
        assert!(rows.is_empty());
    }
}
