//! Placement of a source dataset within an archive.
//!
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::Serialize;

use crate::archive::ArchiveMetadata;
use crate::dataset::Dataset;
use crate::errors::{Error, Result};
use crate::geom::Bounds;
use crate::time::format_instant;

/// A half-open index range per dimension of an archive.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ArchiveRegion {
    ranges: BTreeMap<String, Range<usize>>,
}

impl ArchiveRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Range<usize>> {
        self.ranges.get(name).cloned()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, range: Range<usize>) {
        self.ranges.insert(name.into(), range);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Range<usize>)> {
        self.ranges.iter().map(|(name, range)| (name.as_str(), range))
    }

    /// True if the region holds no cells
    pub fn is_empty(&self) -> bool {
        self.ranges.values().any(|range| range.is_empty())
    }

    /// The region restricted to `dims`, in that order
    pub(crate) fn bounds_for(&self, dims: &[String]) -> Result<Bounds> {
        let ranges = dims
            .iter()
            .map(|dim| {
                self.get(dim)
                    .ok_or_else(|| Error::region(format!("region {self} has no range for {dim}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Bounds::new(ranges))
    }
}

impl<S: Into<String>> FromIterator<(S, Range<usize>)> for ArchiveRegion {
    fn from_iter<T: IntoIterator<Item = (S, Range<usize>)>>(iter: T) -> Self {
        Self {
            ranges: iter
                .into_iter()
                .map(|(name, range)| (name.into(), range))
                .collect(),
        }
    }
}

impl fmt::Display for ArchiveRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|(name, range)| format!("{name}={}:{}", range.start, range.end))
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for ArchiveRegion {
    type Err = Error;

    /// Parse a region written as `time=0:100,lat=0:50`
    fn from_str(s: &str) -> Result<Self> {
        let mut region = ArchiveRegion::new();
        for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let bad = || {
                Error::configuration(format!("region {part} is not of the form dim=start:stop"))
            };
            let (name, range) = part.split_once('=').ok_or_else(bad)?;
            let (start, stop) = range.split_once(':').ok_or_else(bad)?;
            let start = start.trim().parse::<usize>().map_err(|_| bad())?;
            let stop = stop.trim().parse::<usize>().map_err(|_| bad())?;
            if stop < start {
                return Err(Error::configuration(format!(
                    "region {part} ends before it starts"
                )));
            }
            region.insert(name.trim(), start..stop);
        }

        Ok(region)
    }
}

/// Find the index range of `archive_times` holding exactly the instants in `source_times`.
///
/// `archive_times` must be strictly increasing. `source_times` is treated as a set: order and
/// repeats don't matter. Every source instant must be on the archive's time grid, and together
/// they must form a contiguous run of it.
///
pub fn locate(archive_times: &[i64], source_times: &[i64]) -> Result<Range<usize>> {
    let instants: BTreeSet<i64> = source_times.iter().copied().collect();
    let (first, last) = match (instants.first(), instants.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Ok(0..0),
    };

    let position = |instant: i64| {
        archive_times.binary_search(&instant).map_err(|_| {
            Error::region(format!(
                "source timestamp {} is not in the archive's time coordinate",
                format_instant(instant)
            ))
        })
    };

    // Check every instant, so the first absent one is the one reported
    for instant in &instants {
        position(*instant)?;
    }

    let start = position(first)?;
    let stop = position(last)? + 1;
    if stop - start != instants.len() {
        return Err(Error::region(format!(
            "source timestamps from {} to {} are not contiguous in the archive: {} instants \
             cover {} archive positions",
            format_instant(first),
            format_instant(last),
            instants.len(),
            stop - start
        )));
    }

    Ok(start..stop)
}

/// Region of the archive that a source dataset covers: located along the append dimension, full
/// span along every other dimension.
///
/// A region that isn't aligned to chunk boundaries is allowed with a warning, since concurrent
/// writers sharing a chunk may then overwrite each other's data.
///
pub fn plan(metadata: &ArchiveMetadata, source_times: &[i64]) -> Result<ArchiveRegion> {
    let located = locate(&metadata.time, source_times)?;
    let mut region = metadata.full_region();
    region.insert(metadata.append_dim.clone(), located);

    for issue in alignment_issues(metadata, &region) {
        log::warn!("region {region} is not chunk aligned: {issue}");
    }

    Ok(region)
}

/// Validate a manually given region against the archive and the source dataset.
///
/// Dimensions the region doesn't name take their full span. Returns the completed region.
///
pub fn check_manual(
    metadata: &ArchiveMetadata,
    region: &ArchiveRegion,
    source: &Dataset,
) -> Result<ArchiveRegion> {
    let mut complete = metadata.full_region();
    for (name, range) in region.iter() {
        let size = metadata
            .dim_size(name)
            .ok_or_else(|| Error::region(format!("region names unknown dimension {name}")))?;
        if range.start > range.end || range.end > size {
            return Err(Error::region(format!(
                "range {}:{} for {name} is out of bounds for length {size}",
                range.start, range.end
            )));
        }
        if name != metadata.append_dim && (range.start != 0 || range.end != size) {
            return Err(Error::region(format!(
                "range {}:{} for {name} must span the whole dimension (0:{size}), only \
                 {} may be a sub-range",
                range.start, range.end, metadata.append_dim
            )));
        }
        complete.insert(name, range.clone());
    }

    for (name, range) in complete.iter() {
        if let Some(size) = source.dim_size(name) {
            if size != range.len() {
                return Err(Error::region(format!(
                    "range {}:{} for {name} has length {}, source has {size}",
                    range.start,
                    range.end,
                    range.len()
                )));
            }
        }
    }

    if let Some(issue) = alignment_issues(metadata, &complete).into_iter().next() {
        return Err(Error::region(format!(
            "region {complete} is not chunk aligned: {issue}"
        )));
    }

    Ok(complete)
}

/// Describe every place where `region` cuts through a chunk of some variable.
///
/// A range is aligned when its start is a multiple of the chunk length and its stop is either a
/// multiple of the chunk length or the end of the dimension.
///
pub fn alignment_issues(metadata: &ArchiveMetadata, region: &ArchiveRegion) -> Vec<String> {
    let mut issues = vec![];
    for (name, variable) in &metadata.variables {
        for dim in &variable.dims {
            let (range, chunk, size) = match (
                region.get(dim),
                variable.chunks.get(dim),
                metadata.dim_size(dim),
            ) {
                (Some(range), Some(chunk), Some(size)) => (range, chunk, size),
                _ => continue,
            };
            if range.is_empty() {
                continue;
            }
            if range.start % chunk != 0 || (range.end % chunk != 0 && range.end != size) {
                issues.push(format!(
                    "{dim} range {}:{} of {name} crosses chunks of length {chunk}",
                    range.start, range.end
                ));
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Compression;
    use crate::testing;
    use crate::time::{parse_instant, Frequency};

    fn days(start: &str, end: &str) -> Vec<i64> {
        let start = parse_instant(start).expect("valid date");
        let end = parse_instant(end).expect("valid date");
        Frequency::DAILY.instants(start, end).expect("valid span")
    }

    #[test]
    fn test_locate_year() -> Result<()> {
        let archive = days("2020-01-01", "2023-12-31");
        let source = days("2021-01-01", "2021-12-31");
        assert_eq!(locate(&archive, &source)?, 366..731);

        Ok(())
    }

    #[test]
    fn test_locate_as_set() -> Result<()> {
        let archive = days("2020-01-01", "2020-01-31");
        let mut source = days("2020-01-05", "2020-01-09");
        source.reverse();
        source.push(source[0]);
        assert_eq!(locate(&archive, &source)?, 4..9);

        Ok(())
    }

    #[test]
    fn test_locate_empty() -> Result<()> {
        let archive = days("2020-01-01", "2020-01-31");
        assert_eq!(locate(&archive, &[])?, 0..0);

        Ok(())
    }

    #[test]
    fn test_locate_absent() {
        let archive = days("2020-01-01", "2020-01-31");
        let source = days("2020-01-30", "2020-02-02");
        assert!(matches!(locate(&archive, &source), Err(Error::Region(_))));

        // Off the grid
        let source = vec![archive[3] + 3600];
        assert!(matches!(locate(&archive, &source), Err(Error::Region(_))));
    }

    #[test]
    fn test_locate_not_contiguous() {
        let archive = days("2020-01-01", "2020-01-31");
        let source = vec![archive[2], archive[3], archive[5]];
        assert!(matches!(locate(&archive, &source), Err(Error::Region(_))));
    }

    #[test]
    fn test_parse_region() -> Result<()> {
        let region: ArchiveRegion = "time=0:100, lat=0:50".parse()?;
        assert_eq!(region.get("time"), Some(0..100));
        assert_eq!(region.get("lat"), Some(0..50));
        assert_eq!(region.to_string(), "lat=0:50,time=0:100");
        assert!(!region.is_empty());

        assert!("time=5:1".parse::<ArchiveRegion>().is_err());
        assert!("time:0:5".parse::<ArchiveRegion>().is_err());
        assert!("time=a:5".parse::<ArchiveRegion>().is_err());

        let empty: ArchiveRegion = "time=3:3".parse()?;
        assert!(empty.is_empty());

        Ok(())
    }

    #[test]
    fn test_plan() -> Result<()> {
        // time 10 in chunks of 4
        let metadata = testing::metadata(10, 4, 6, Compression::None);
        let region = plan(&metadata, &metadata.time[4..8])?;
        assert_eq!(region.get("time"), Some(4..8));
        assert_eq!(region.get("lat"), Some(0..4));
        assert_eq!(region.get("lon"), Some(0..6));
        assert!(alignment_issues(&metadata, &region).is_empty());

        // Allowed, with a warning
        let region = plan(&metadata, &metadata.time[3..5])?;
        assert_eq!(region.get("time"), Some(3..5));
        assert_eq!(alignment_issues(&metadata, &region).len(), 1);

        // Ends at the end of the dimension
        let region = plan(&metadata, &metadata.time[8..])?;
        assert!(alignment_issues(&metadata, &region).is_empty());

        Ok(())
    }

    #[test]
    fn test_check_manual() -> Result<()> {
        let metadata = testing::metadata(10, 4, 6, Compression::None);
        let source = testing::dataset(&metadata.time[4..8], 4, 6);

        let region: ArchiveRegion = "time=4:8".parse()?;
        let complete = check_manual(&metadata, &region, &source)?;
        assert_eq!(complete.to_string(), "lat=0:4,lon=0:6,time=4:8");

        let region: ArchiveRegion = "time=4:8,lat=0:4".parse()?;
        check_manual(&metadata, &region, &source)?;

        // Misaligned
        let source = testing::dataset(&metadata.time[3..7], 4, 6);
        let region: ArchiveRegion = "time=3:7".parse()?;
        assert!(matches!(
            check_manual(&metadata, &region, &source),
            Err(Error::Region(_))
        ));

        Ok(())
    }

    #[test]
    fn test_check_manual_bad_regions() -> Result<()> {
        let metadata = testing::metadata(10, 4, 6, Compression::None);
        let source = testing::dataset(&metadata.time[4..8], 4, 6);
        for region in ["time=8:12", "depth=0:1", "time=4:8,lat=0:2", "time=0:8"] {
            let region: ArchiveRegion = region.parse()?;
            assert!(
                matches!(
                    check_manual(&metadata, &region, &source),
                    Err(Error::Region(_))
                ),
                "{region}"
            );
        }

        Ok(())
    }
}
