//! Chunk geometry recommendation and validation.
//!
//! The recommendation divides a target chunk byte budget between the axes of a variable. A time
//! axis, when present, gets a length picked from a fraction of its extent, bounded by constants
//! that depend on the declared access pattern. The rest of the budget is spread evenly over the
//! remaining axes with an n-th root, so chunks approximate a hypercube in element count.
//!
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dims::{Dimensions, Extent, Role};
use crate::errors::{Error, Result};
use crate::helpers::{clamp, nth_root};

pub const MIB: usize = 1024 * 1024;

/// Chunks estimated below this size are flagged as small
pub const SMALL_CHUNK_BYTES: usize = MIB;

/// Chunks estimated above this size are flagged as large
pub const LARGE_CHUNK_BYTES: usize = 100 * MIB;

pub const DEFAULT_TARGET_CHUNK_BYTES: usize = 50 * MIB;

/// The read workload chunk geometry should favour.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    /// Long time series at few locations
    Temporal,

    /// Large maps at few instants
    Spatial,

    #[default]
    Balanced,
}

/// Tuning constants attached to an `AccessPattern`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tuning {
    /// Lower bound for the time chunk length
    pub time_min: usize,

    /// Upper bound for the time chunk length
    pub time_max: usize,

    /// The time chunk length starts out as the time extent divided by this
    pub time_divisor: usize,

    /// Minimum chunk length along each non-time axis when a time axis is present
    pub spatial_floor: usize,

    /// Bounds for every axis when there is no time axis
    pub flat_floor: usize,
    pub flat_ceiling: usize,
}

impl AccessPattern {
    pub const ALL: [AccessPattern; 3] = [
        AccessPattern::Temporal,
        AccessPattern::Spatial,
        AccessPattern::Balanced,
    ];

    pub fn tuning(&self) -> Tuning {
        match self {
            AccessPattern::Temporal => Tuning {
                time_min: 10,
                time_max: 100,
                time_divisor: 10,
                spatial_floor: 10,
                flat_floor: 10,
                flat_ceiling: 50,
            },
            AccessPattern::Spatial => Tuning {
                time_min: 5,
                time_max: 20,
                time_divisor: 50,
                spatial_floor: 50,
                flat_floor: 30,
                flat_ceiling: 100,
            },
            AccessPattern::Balanced => Tuning {
                time_min: 10,
                time_max: 50,
                time_divisor: 20,
                spatial_floor: 30,
                flat_floor: 10,
                flat_ceiling: 50,
            },
        }
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessPattern::Temporal => "temporal",
            AccessPattern::Spatial => "spatial",
            AccessPattern::Balanced => "balanced",
        };
        f.write_str(name)
    }
}

impl FromStr for AccessPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "temporal" => Ok(AccessPattern::Temporal),
            "spatial" => Ok(AccessPattern::Spatial),
            "balanced" => Ok(AccessPattern::Balanced),
            _ => Err(Error::configuration(format!(
                "unknown access pattern {s}, expected temporal, spatial or balanced"
            ))),
        }
    }
}

/// Chunk length per dimension name.
///
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkPlan {
    lengths: BTreeMap<String, usize>,
}

impl ChunkPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.lengths.get(name).copied()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, length: usize) {
        self.lengths.insert(name.into(), length);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.lengths.iter().map(|(name, length)| (name.as_str(), *length))
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Estimated size of one chunk, in bytes
    pub fn estimated_bytes(&self, element_bytes: usize) -> usize {
        self.lengths
            .values()
            .fold(element_bytes, |bytes, length| bytes.saturating_mul(*length))
    }

    /// Chunk lengths for the named dimensions, in that order
    pub fn lengths_for(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    Error::configuration(format!("chunk plan has no length for dimension {name}"))
                })
            })
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for ChunkPlan {
    fn from_iter<T: IntoIterator<Item = (S, usize)>>(iter: T) -> Self {
        Self {
            lengths: iter
                .into_iter()
                .map(|(name, length)| (name.into(), length))
                .collect(),
        }
    }
}

impl fmt::Display for ChunkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .lengths
            .iter()
            .map(|(name, length)| format!("{name}:{length}"))
            .collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for ChunkPlan {
    type Err = Error;

    /// Parse a plan written as `time:100,lat:50,lon:100`
    fn from_str(s: &str) -> Result<Self> {
        let mut plan = ChunkPlan::new();
        for part in s.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (name, length) = part.split_once(':').ok_or_else(|| {
                Error::configuration(format!("chunk spec {part} is not of the form dim:length"))
            })?;
            let length = length.trim().parse::<usize>().map_err(|_| {
                Error::configuration(format!("chunk length in {part} is not a positive integer"))
            })?;
            plan.insert(name.trim(), length);
        }

        Ok(plan)
    }
}

/// Problems detected in a chunk plan. Advisory only.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChunkWarning {
    SmallChunk { bytes: usize },
    LargeChunk { bytes: usize },
}

impl fmt::Display for ChunkWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkWarning::SmallChunk { bytes } => write!(
                f,
                "small-chunk: estimated {bytes} bytes per chunk is below {SMALL_CHUNK_BYTES}, \
                 reads will be dominated by per-chunk overhead"
            ),
            ChunkWarning::LargeChunk { bytes } => write!(
                f,
                "large-chunk: estimated {bytes} bytes per chunk is above {LARGE_CHUNK_BYTES}, \
                 partial reads will fetch far more data than needed"
            ),
        }
    }
}

/// Recommend chunk lengths for `dims`.
///
/// # Arguments
///
/// * `dims` - The dimensions of the variable to be chunked.
/// * `element_bytes` - Bytes per stored element.
/// * `pattern` - The access pattern to favour.
/// * `target_chunk_bytes` - The desired size of one chunk.
///
pub fn recommend(
    dims: &Dimensions,
    element_bytes: usize,
    pattern: AccessPattern,
    target_chunk_bytes: usize,
) -> ChunkPlan {
    let tuning = pattern.tuning();
    let target_elements = (target_chunk_bytes / element_bytes.max(1)).max(1);
    let mut plan = ChunkPlan::new();

    if dims.len() == 1 {
        for dim in dims.iter() {
            let length = match dim.extent {
                Extent::Fixed(size) => target_elements.min(size),
                Extent::Unbounded => tuning.time_max,
            };
            plan.insert(dim.name.clone(), length);
        }
    } else if let Some(time) = dims.time() {
        let time_chunk = match time.extent {
            Extent::Fixed(size) => clamp(
                size / tuning.time_divisor,
                tuning.time_min,
                tuning.time_max,
            ),
            Extent::Unbounded => tuning.time_max,
        };
        let per_axis_budget = target_elements as f64 / time_chunk as f64;
        let others = dims.iter().filter(|dim| dim.role != Role::Time).count();
        let spatial_chunk = nth_root(per_axis_budget, others);

        for dim in dims.iter() {
            let length = match (dim.role, dim.extent) {
                (Role::Time, _) => time_chunk,
                (_, Extent::Fixed(size)) => clamp(spatial_chunk, tuning.spatial_floor, size),
                (_, Extent::Unbounded) => spatial_chunk,
            };
            plan.insert(dim.name.clone(), length);
        }
    } else {
        let per_axis = nth_root(target_elements as f64, dims.len());
        let per_axis = clamp(per_axis, tuning.flat_floor, tuning.flat_ceiling);
        for dim in dims.iter() {
            plan.insert(dim.name.clone(), per_axis);
        }
    }

    // Final guarantee: every length lies in [1, size]
    for dim in dims.iter() {
        if let (Some(length), Some(size)) = (plan.get(&dim.name), dim.size()) {
            plan.insert(dim.name.clone(), clamp(length, 1, size));
        }
    }

    plan
}

/// Check a chunk plan, whether recommended or supplied by a user.
///
/// Fails only when the plan is malformed: it names a dimension not in `dims`, or has a zero
/// length. Size problems are returned (and logged) as warnings.
///
pub fn validate(
    plan: &ChunkPlan,
    dims: &Dimensions,
    element_bytes: usize,
) -> Result<Vec<ChunkWarning>> {
    for (name, length) in plan.iter() {
        if dims.get(name).is_none() {
            return Err(Error::configuration(format!(
                "chunk plan references unknown dimension {name}"
            )));
        }
        if length == 0 {
            return Err(Error::configuration(format!(
                "chunk length for {name} must be positive"
            )));
        }
    }

    let bytes = plan.estimated_bytes(element_bytes);
    let mut warnings = vec![];
    if bytes < SMALL_CHUNK_BYTES {
        warnings.push(ChunkWarning::SmallChunk { bytes });
    } else if bytes > LARGE_CHUNK_BYTES {
        warnings.push(ChunkWarning::LargeChunk { bytes });
    }

    for warning in &warnings {
        log::warn!("chunk plan {plan}: {warning}");
    }

    Ok(warnings)
}

/// Chunk recommendation with an explicit configuration.
///
/// Environment lookups and other defaults are resolved by the caller, so an advisor always
/// behaves the same for the same inputs.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkAdvisor {
    pub pattern: AccessPattern,
    pub target_chunk_bytes: usize,
}

impl Default for ChunkAdvisor {
    fn default() -> Self {
        Self {
            pattern: AccessPattern::default(),
            target_chunk_bytes: DEFAULT_TARGET_CHUNK_BYTES,
        }
    }
}

impl ChunkAdvisor {
    pub fn new(pattern: AccessPattern, target_chunk_bytes: usize) -> Self {
        Self {
            pattern,
            target_chunk_bytes,
        }
    }

    pub fn recommend(&self, dims: &Dimensions, element_bytes: usize) -> ChunkPlan {
        recommend(dims, element_bytes, self.pattern, self.target_chunk_bytes)
    }

    /// Recommend a plan, then replace lengths for dimensions named in `overrides`.
    ///
    /// Overrides for dimensions that `dims` lacks are skipped, since a dataset's variables need
    /// not share every dimension; callers check overrides against the whole dataset first. An
    /// override longer than its axis is capped. The merged plan is validated.
    ///
    pub fn plan(
        &self,
        dims: &Dimensions,
        element_bytes: usize,
        overrides: &ChunkPlan,
    ) -> Result<ChunkPlan> {
        self.plan_with_warnings(dims, element_bytes, overrides)
            .map(|(plan, _)| plan)
    }

    /// Same as `plan`, also returning the warnings found when validating the merged plan
    pub fn plan_with_warnings(
        &self,
        dims: &Dimensions,
        element_bytes: usize,
        overrides: &ChunkPlan,
    ) -> Result<(ChunkPlan, Vec<ChunkWarning>)> {
        let mut plan = self.recommend(dims, element_bytes);
        for (name, length) in overrides.iter() {
            if let Some(dim) = dims.get(name) {
                if length == 0 {
                    return Err(Error::configuration(format!(
                        "chunk length for {name} must be positive"
                    )));
                }
                let length = match dim.size() {
                    Some(size) => length.min(size),
                    None => length,
                };
                plan.insert(name, length);
            }
        }

        let warnings = validate(&plan, dims, element_bytes)?;
        log::debug!("chunk plan for {:?}: {plan}", dims.names());

        Ok((plan, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::DimensionSpec;

    fn dims(time: usize, lat: usize, lon: usize) -> Dimensions {
        Dimensions::new(vec![
            DimensionSpec::new("time", time, Role::Time),
            DimensionSpec::new("lat", lat, Role::Spatial),
            DimensionSpec::new("lon", lon, Role::Spatial),
        ])
        .expect("valid dimensions")
    }

    #[test]
    fn test_recommend_temporal() {
        let plan = recommend(
            &dims(1000, 180, 360),
            4,
            AccessPattern::Temporal,
            50 * MIB,
        );
        assert_eq!(plan.get("time"), Some(100));
        assert_eq!(plan.get("lat"), Some(180));
        assert_eq!(plan.get("lon"), Some(360));
    }

    #[test]
    fn test_recommend_spatial() {
        let plan = recommend(&dims(1000, 721, 1440), 4, AccessPattern::Spatial, 50 * MIB);
        // 1000 / 50 = 20, inside (5, 20)
        assert_eq!(plan.get("time"), Some(20));
        // (13107200 / 20) ^ 1/2 = 809
        assert_eq!(plan.get("lat"), Some(721));
        assert_eq!(plan.get("lon"), Some(809));
    }

    #[test]
    fn test_recommend_balanced() {
        let plan = recommend(&dims(8760, 721, 1440), 4, AccessPattern::Balanced, 50 * MIB);
        // 8760 / 20 = 438, capped at 50
        assert_eq!(plan.get("time"), Some(50));
        // (13107200 / 50) ^ 1/2 = 512
        assert_eq!(plan.get("lat"), Some(512));
        assert_eq!(plan.get("lon"), Some(512));
    }

    #[test]
    fn test_recommend_short_time_axis() {
        // 30 / 10 = 3, raised to the floor of 10
        let plan = recommend(&dims(30, 100, 100), 4, AccessPattern::Temporal, 50 * MIB);
        assert_eq!(plan.get("time"), Some(10));

        // Floor above the axis length: capped to the axis
        let plan = recommend(&dims(4, 100, 100), 4, AccessPattern::Temporal, 50 * MIB);
        assert_eq!(plan.get("time"), Some(4));
    }

    #[test]
    fn test_recommend_spatial_floor() {
        // Tiny budget: spatial axes raised to the pattern floor
        let plan = recommend(&dims(1000, 500, 500), 4, AccessPattern::Spatial, 4096);
        assert_eq!(plan.get("lat"), Some(50));
        assert_eq!(plan.get("lon"), Some(50));
    }

    #[test]
    fn test_recommend_no_time() {
        let dims = Dimensions::new(vec![
            DimensionSpec::new("lat", 1000, Role::Spatial),
            DimensionSpec::new("lon", 1000, Role::Spatial),
            DimensionSpec::new("depth", 20, Role::Other),
        ])
        .expect("valid dimensions");

        // cube root of 13107200 is 235, capped at 50 for balanced, then at the axis length
        let plan = recommend(&dims, 4, AccessPattern::Balanced, 50 * MIB);
        assert_eq!(plan.get("lat"), Some(50));
        assert_eq!(plan.get("lon"), Some(50));
        assert_eq!(plan.get("depth"), Some(20));

        let plan = recommend(&dims, 4, AccessPattern::Spatial, 50 * MIB);
        assert_eq!(plan.get("lat"), Some(100));
        assert_eq!(plan.get("lon"), Some(100));
        assert_eq!(plan.get("depth"), Some(20));
    }

    #[test]
    fn test_recommend_single_dimension() {
        let dims = Dimensions::new(vec![DimensionSpec::new("station", 5000, Role::Other)])
            .expect("valid dimensions");
        let plan = recommend(&dims, 8, AccessPattern::Temporal, 1024);
        assert_eq!(plan.get("station"), Some(128));

        let plan = recommend(&dims, 8, AccessPattern::Temporal, 50 * MIB);
        assert_eq!(plan.get("station"), Some(5000));
    }

    #[test]
    fn test_recommend_unbounded_time() {
        let dims = Dimensions::new(vec![
            DimensionSpec::unbounded("time"),
            DimensionSpec::new("lat", 180, Role::Spatial),
        ])
        .expect("valid dimensions");
        let plan = recommend(&dims, 4, AccessPattern::Temporal, 50 * MIB);
        assert_eq!(plan.get("time"), Some(100));
        assert_eq!(plan.get("lat"), Some(180));
    }

    #[test]
    fn test_recommend_always_in_bounds() {
        let shapes = [
            (1, 1, 1),
            (2, 3, 5),
            (10, 1, 1000),
            (1000, 180, 360),
            (100_000, 7, 3),
            (365, 2000, 2000),
        ];
        let targets = [1, 1024, MIB, 50 * MIB, 1024 * MIB];
        for (time, lat, lon) in shapes {
            let dims = dims(time, lat, lon);
            for pattern in AccessPattern::ALL {
                for target in targets {
                    for element_bytes in [1, 2, 4, 8] {
                        let plan = recommend(&dims, element_bytes, pattern, target);
                        for dim in dims.iter() {
                            let length = plan.get(&dim.name).expect("length for every axis");
                            let size = dim.size().expect("fixed size");
                            assert!(1 <= length && length <= size, "{plan} for {dims:?}");
                        }

                        // Deterministic
                        assert_eq!(plan, recommend(&dims, element_bytes, pattern, target));
                    }
                }
            }
        }
    }

    #[test]
    fn test_estimated_bytes() {
        let plan: ChunkPlan = [("time", 100), ("lat", 180), ("lon", 360)]
            .into_iter()
            .collect();
        assert_eq!(plan.estimated_bytes(4), 4 * 100 * 180 * 360);
        assert_eq!(ChunkPlan::new().estimated_bytes(8), 8);
    }

    #[test]
    fn test_validate_large_chunk() -> Result<()> {
        let dims = dims(1000, 180, 360);
        let plan: ChunkPlan = [("time", 1000), ("lat", 180), ("lon", 360)]
            .into_iter()
            .collect();
        let warnings = validate(&plan, &dims, 4)?;
        assert_eq!(
            warnings,
            vec![ChunkWarning::LargeChunk {
                bytes: 4 * 1000 * 180 * 360
            }]
        );

        Ok(())
    }

    #[test]
    fn test_validate_small_chunk() -> Result<()> {
        let dims = dims(1000, 180, 360);
        let plan: ChunkPlan = [("lat", 1), ("lon", 1)].into_iter().collect();
        let warnings = validate(&plan, &dims, 4)?;
        assert_eq!(warnings, vec![ChunkWarning::SmallChunk { bytes: 4 }]);

        Ok(())
    }

    #[test]
    fn test_validate_just_right() -> Result<()> {
        let dims = dims(1000, 180, 360);
        let plan = recommend(&dims, 4, AccessPattern::Temporal, 50 * MIB);
        assert!(validate(&plan, &dims, 4)?.is_empty());

        Ok(())
    }

    #[test]
    fn test_validate_unknown_dimension() {
        let dims = dims(1000, 180, 360);
        let plan: ChunkPlan = [("depth", 10)].into_iter().collect();
        assert!(matches!(
            validate(&plan, &dims, 4),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_advisor_overrides() -> Result<()> {
        let dims = dims(1000, 180, 360);
        let advisor = ChunkAdvisor::new(AccessPattern::Temporal, 50 * MIB);
        let overrides: ChunkPlan = [("lat", 90), ("lon", 5000), ("depth", 3)]
            .into_iter()
            .collect();
        let plan = advisor.plan(&dims, 4, &overrides)?;
        assert_eq!(plan.get("time"), Some(100));
        assert_eq!(plan.get("lat"), Some(90));
        assert_eq!(plan.get("lon"), Some(360));
        assert_eq!(plan.get("depth"), None);

        let (_, warnings) = advisor.plan_with_warnings(&dims, 4, &"time:1000".parse()?)?;
        assert_eq!(
            warnings,
            vec![ChunkWarning::LargeChunk {
                bytes: 4 * 1000 * 180 * 360
            }]
        );

        Ok(())
    }

    #[test]
    fn test_parse_plan() -> Result<()> {
        let plan: ChunkPlan = "time:100, lat:50,lon:100".parse()?;
        assert_eq!(plan.get("time"), Some(100));
        assert_eq!(plan.get("lat"), Some(50));
        assert_eq!(plan.get("lon"), Some(100));
        assert_eq!(plan.to_string(), "lat:50,lon:100,time:100");

        assert!("time=100".parse::<ChunkPlan>().is_err());
        assert!("time:-1".parse::<ChunkPlan>().is_err());

        Ok(())
    }

    #[test]
    fn test_parse_pattern() -> Result<()> {
        assert_eq!("Temporal".parse::<AccessPattern>()?, AccessPattern::Temporal);
        assert_eq!(AccessPattern::Spatial.to_string(), "spatial");
        assert!("sideways".parse::<AccessPattern>().is_err());

        Ok(())
    }
}
