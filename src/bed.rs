//! BED file ingestion.
//!
//! Parses tab-separated `chrom start stop [name]` lines into [`Region`]s.
//! A missing name column defaults to the record ordinal within the file,
//! and a leading "chr" on the chromosome is stripped.

use crate::error::{CovError, Result};
use crate::region::{normalize_chrom, Region};
use memchr::memchr;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Fast u64 parsing - no allocation, no error formatting.
///
/// Returns None if the input is empty or contains non-digit characters.
#[inline(always)]
pub fn parse_u64_fast(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut n: u64 = 0;
    for &b in bytes {
        let d = b.wrapping_sub(b'0');
        if d > 9 {
            return None;
        }
        n = n.wrapping_mul(10).wrapping_add(d as u64);
    }
    Some(n)
}

/// Check if a line should be skipped (empty, comment, or header).
#[inline(always)]
fn should_skip_line(line: &[u8]) -> bool {
    line.is_empty() || line[0] == b'#' || line.starts_with(b"track") || line.starts_with(b"browser")
}

/// Split the next tab-separated field off `rest`, using memchr for the scan.
#[inline(always)]
fn next_field(rest: &[u8]) -> (&[u8], &[u8]) {
    match memchr(b'\t', rest) {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, &[]),
    }
}

/// A streaming BED region reader bound to one region-set descriptor.
pub struct RegionReader<R: Read> {
    reader: BufReader<R>,
    descriptor: String,
    line_number: usize,
    record_count: u64,
    buffer: String,
}

impl RegionReader<File> {
    /// Open a BED file from a path.
    pub fn from_path<P: AsRef<Path>>(path: P, descriptor: &str) -> Result<Self> {
        let file =
            File::open(&path).map_err(|e| CovError::path_io(path.as_ref().to_path_buf(), e))?;
        Ok(Self::new(file, descriptor))
    }
}

impl<R: Read> RegionReader<R> {
    pub fn new(reader: R, descriptor: &str) -> Self {
        Self {
            reader: BufReader::new(reader),
            descriptor: descriptor.to_string(),
            line_number: 0,
            record_count: 0,
            buffer: String::with_capacity(1024),
        }
    }

    /// Read the next region, or None at end of file.
    pub fn read_region(&mut self) -> Result<Option<Region>> {
        loop {
            self.buffer.clear();
            let bytes_read = self.reader.read_line(&mut self.buffer)?;
            if bytes_read == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let line = self.buffer.trim_end().as_bytes().to_vec();
            if should_skip_line(&line) {
                continue;
            }

            return self.parse_line(&line).map(Some);
        }
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Region> {
        let (chrom, rest) = next_field(line);
        let (start_field, rest) = next_field(rest);
        let (stop_field, rest) = next_field(rest);

        if stop_field.is_empty() {
            return Err(CovError::Parse {
                line: self.line_number,
                message: "Expected at least 3 tab-separated fields".to_string(),
            });
        }

        let start = parse_u64_fast(start_field).ok_or_else(|| CovError::Parse {
            line: self.line_number,
            message: format!("Invalid start: {}", String::from_utf8_lossy(start_field)),
        })?;
        let stop = parse_u64_fast(stop_field).ok_or_else(|| CovError::Parse {
            line: self.line_number,
            message: format!("Invalid stop: {}", String::from_utf8_lossy(stop_field)),
        })?;

        if start >= stop {
            return Err(CovError::Parse {
                line: self.line_number,
                message: format!("Start ({}) >= stop ({})", start, stop),
            });
        }

        let chrom = String::from_utf8_lossy(chrom);
        let chrom = normalize_chrom(&chrom).to_string();

        let (name_field, _) = next_field(rest);
        let name = if name_field.is_empty() {
            self.record_count.to_string()
        } else {
            String::from_utf8_lossy(name_field).into_owned()
        };

        let region = Region::new(chrom, start, stop, name, &self.descriptor, self.record_count);
        self.record_count += 1;
        Ok(region)
    }
}

/// Read all regions from a BED file under the given descriptor.
pub fn read_regions<P: AsRef<Path>>(path: P, descriptor: &str) -> Result<Vec<Region>> {
    let mut reader = RegionReader::from_path(path, descriptor)?;
    let mut regions = Vec::new();
    while let Some(region) = reader.read_region()? {
        regions.push(region);
    }
    Ok(regions)
}

/// Merge abutting intervals: sorted by start, runs where one interval's stop
/// equals the next interval's start collapse into a single interval.
///
/// Idempotent: stitching stitched output yields the same intervals.
pub fn stitch_regions(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable_by_key(|iv| iv.0);
    let mut stitched = Vec::new();
    let mut iter = intervals.into_iter();
    if let Some((mut last_start, mut last_stop)) = iter.next() {
        for (start, stop) in iter {
            if start == last_stop {
                last_stop = stop;
            } else {
                stitched.push((last_start, last_stop));
                last_start = start;
                last_stop = stop;
            }
        }
        stitched.push((last_start, last_stop));
    }
    stitched
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_u64_fast() {
        assert_eq!(parse_u64_fast(b"12345"), Some(12345));
        assert_eq!(parse_u64_fast(b"0"), Some(0));
        assert_eq!(parse_u64_fast(b""), None);
        assert_eq!(parse_u64_fast(b"12a"), None);
    }

    #[test]
    fn test_read_regions_basic() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chr1\t100\t200\tBRCA1").unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "2\t300\t400").unwrap();
        writeln!(file, "track name=ignored").unwrap();
        writeln!(file, "chrX\t10\t20\tSHOX").unwrap();

        let regions = read_regions(file.path(), "ref").unwrap();
        assert_eq!(regions.len(), 3);

        assert_eq!(regions[0].chrom, "1");
        assert_eq!(regions[0].name, "BRCA1");
        assert_eq!(regions[0].descriptor, "ref");
        assert_eq!(regions[0].index, 0);

        // Name defaults to the record ordinal within the file
        assert_eq!(regions[1].name, "1");
        assert_eq!(regions[1].chrom, "2");

        assert_eq!(regions[2].chrom, "X");
        assert_eq!(regions[2].index, 2);
    }

    #[test]
    fn test_read_regions_rejects_bad_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chr1\t100").unwrap();
        assert!(read_regions(file.path(), "ref").is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chr1\t200\t100").unwrap();
        assert!(read_regions(file.path(), "ref").is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chr1\tabc\t100").unwrap();
        assert!(read_regions(file.path(), "ref").is_err());
    }

    #[test]
    fn test_stitch_regions() {
        let stitched = stitch_regions(vec![(30, 40), (10, 20), (20, 30), (50, 60)]);
        assert_eq!(stitched, vec![(10, 40), (50, 60)]);

        // Idempotent on its own output
        assert_eq!(stitch_regions(stitched.clone()), stitched);
    }

    #[test]
    fn test_stitch_regions_empty() {
        assert!(stitch_regions(vec![]).is_empty());
    }
}
