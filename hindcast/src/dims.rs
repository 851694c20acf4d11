//! The dimension model: named axes, their extents and roles, and element widths.
//!
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Axis names recognised as spatial when classifying a dataset's dimensions.
const SPATIAL_NAMES: [&str; 8] = [
    "lat",
    "lon",
    "latitude",
    "longitude",
    "x",
    "y",
    "rlat",
    "rlon",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Time,
    Spatial,
    Other,
}

impl Role {
    /// Classify an axis by name, given the name of the dataset's time axis.
    ///
    pub fn classify(name: &str, time_dim: &str) -> Self {
        if name == time_dim {
            Role::Time
        } else if SPATIAL_NAMES.contains(&name.to_lowercase().as_str()) {
            Role::Spatial
        } else {
            Role::Other
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extent {
    Fixed(usize),

    /// Length not yet known. Only allowed for the time axis of a template.
    Unbounded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    pub extent: Extent,
    pub role: Role,
}

impl DimensionSpec {
    pub fn new<S: Into<String>>(name: S, size: usize, role: Role) -> Self {
        Self {
            name: name.into(),
            extent: Extent::Fixed(size),
            role,
        }
    }

    pub fn unbounded<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            extent: Extent::Unbounded,
            role: Role::Time,
        }
    }

    /// The axis length, or `None` for an unbounded axis
    pub fn size(&self) -> Option<usize> {
        match self.extent {
            Extent::Fixed(size) => Some(size),
            Extent::Unbounded => None,
        }
    }
}

/// An ordered, validated set of dimensions.
///
/// Names are unique, fixed sizes are positive, there is at most one time axis, and only the time
/// axis may be unbounded.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimensions {
    dims: Vec<DimensionSpec>,
}

impl Dimensions {
    pub fn new(dims: Vec<DimensionSpec>) -> Result<Self> {
        let mut time_axes = 0;
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].iter().any(|other| other.name == dim.name) {
                return Err(Error::configuration(format!(
                    "dimension {} is listed more than once",
                    dim.name
                )));
            }
            if dim.role == Role::Time {
                time_axes += 1;
            }
            match dim.extent {
                Extent::Fixed(0) => {
                    return Err(Error::configuration(format!(
                        "dimension {} has zero length",
                        dim.name
                    )));
                }
                Extent::Unbounded if dim.role != Role::Time => {
                    return Err(Error::configuration(format!(
                        "only the time dimension may be unbounded, not {}",
                        dim.name
                    )));
                }
                _ => {}
            }
        }

        if time_axes > 1 {
            return Err(Error::configuration(
                "a dataset may have at most one time dimension",
            ));
        }

        Ok(Self { dims })
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DimensionSpec> {
        self.dims.iter()
    }

    pub fn get(&self, name: &str) -> Option<&DimensionSpec> {
        self.dims.iter().find(|dim| dim.name == name)
    }

    pub fn time(&self) -> Option<&DimensionSpec> {
        self.dims.iter().find(|dim| dim.role == Role::Time)
    }

    pub fn names(&self) -> Vec<String> {
        self.dims.iter().map(|dim| dim.name.clone()).collect()
    }

    /// The dimensions named by `names`, in that order
    pub fn subset(&self, names: &[String]) -> Result<Self> {
        let dims = names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| Error::configuration(format!("unknown dimension {name}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(dims)
    }

    pub fn into_vec(self) -> Vec<DimensionSpec> {
        self.dims
    }
}

/// Numeric type of stored elements.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    Float32,
    Float64,
}

impl DataType {
    /// Bytes per element
    pub fn element_bytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Smallest and largest value an integer type can hold exactly, as `f64`
    fn integer_limits(&self) -> Option<(f64, f64)> {
        let limits = match self {
            DataType::Int8 => (i8::MIN as f64, i8::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            // Beyond 2^53 an f64 no longer holds every integer
            DataType::Int64 => (-9_007_199_254_740_992.0, 9_007_199_254_740_992.0),
            DataType::UInt8 => (0.0, u8::MAX as f64),
            DataType::UInt16 => (0.0, u16::MAX as f64),
            DataType::UInt32 => (0.0, u32::MAX as f64),
            DataType::Float32 | DataType::Float64 => return None,
        };

        Some(limits)
    }

    /// Whether `value` can be stored in this type without being changed. NaN marks a missing
    /// value and is always accepted.
    pub fn can_hold(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }

        match self.integer_limits() {
            Some((min, max)) => value.fract() == 0.0 && min <= value && value <= max,
            None => match self {
                DataType::Float32 => !value.is_finite() || value.abs() <= f32::MAX as f64,
                _ => true,
            },
        }
    }

    /// Fail on the first of `values` that this type can't hold
    pub fn check_values<I>(&self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = f64>,
    {
        match values.into_iter().find(|value| !self.can_hold(*value)) {
            Some(value) => Err(Error::dataset(format!(
                "value {value} of {name} cannot be stored as {self}"
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Int64 => 4,
            DataType::UInt8 => 5,
            DataType::UInt16 => 6,
            DataType::UInt32 => 7,
            DataType::Float32 => 8,
            DataType::Float64 => 9,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        let dtype = match code {
            1 => DataType::Int8,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::UInt8,
            6 => DataType::UInt16,
            7 => DataType::UInt32,
            8 => DataType::Float32,
            9 => DataType::Float64,
            _ => return None,
        };

        Some(dtype)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::configuration(format!("unknown data type {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Vec<DimensionSpec> {
        vec![
            DimensionSpec::new("time", 1000, Role::Time),
            DimensionSpec::new("lat", 180, Role::Spatial),
            DimensionSpec::new("lon", 360, Role::Spatial),
        ]
    }

    #[test]
    fn test_classify() {
        assert_eq!(Role::classify("time", "time"), Role::Time);
        assert_eq!(Role::classify("valid_time", "valid_time"), Role::Time);
        assert_eq!(Role::classify("Latitude", "time"), Role::Spatial);
        assert_eq!(Role::classify("x", "time"), Role::Spatial);
        assert_eq!(Role::classify("depth", "time"), Role::Other);
    }

    #[test]
    fn test_new() -> Result<()> {
        let dims = Dimensions::new(dims())?;
        assert_eq!(dims.len(), 3);
        assert_eq!(dims.time().map(|d| d.name.as_str()), Some("time"));
        assert_eq!(dims.get("lon").and_then(|d| d.size()), Some(360));
        assert_eq!(dims.names(), vec!["time", "lat", "lon"]);

        Ok(())
    }

    #[test]
    fn test_two_time_axes() {
        let mut dims = dims();
        dims.push(DimensionSpec::new("step", 10, Role::Time));
        assert!(matches!(
            Dimensions::new(dims),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_name() {
        let mut dims = dims();
        dims.push(DimensionSpec::new("lat", 10, Role::Spatial));
        assert!(Dimensions::new(dims).is_err());
    }

    #[test]
    fn test_unbounded_only_for_time() -> Result<()> {
        let dims = vec![
            DimensionSpec::unbounded("time"),
            DimensionSpec::new("lat", 10, Role::Spatial),
        ];
        let dims = Dimensions::new(dims)?;
        assert_eq!(dims.time().and_then(|d| d.size()), None);

        let dims = vec![DimensionSpec {
            name: "lat".to_string(),
            extent: Extent::Unbounded,
            role: Role::Spatial,
        }];
        assert!(Dimensions::new(dims).is_err());

        Ok(())
    }

    #[test]
    fn test_subset() -> Result<()> {
        let dims = Dimensions::new(dims())?;
        let subset = dims.subset(&["lon".to_string(), "time".to_string()])?;
        assert_eq!(subset.names(), vec!["lon", "time"]);
        assert!(dims.subset(&["depth".to_string()]).is_err());

        Ok(())
    }

    #[test]
    fn test_data_type() -> Result<()> {
        assert_eq!(DataType::Int8.element_bytes(), 1);
        assert_eq!(DataType::UInt16.element_bytes(), 2);
        assert_eq!(DataType::Float32.element_bytes(), 4);
        assert_eq!(DataType::Float64.element_bytes(), 8);
        assert_eq!("float32".parse::<DataType>()?, DataType::Float32);
        assert_eq!(DataType::UInt32.to_string(), "uint32");
        assert!("complex64".parse::<DataType>().is_err());
        for code in 1..=9 {
            let dtype = DataType::from_code(code).expect("valid code");
            assert_eq!(dtype.code(), code);
        }

        Ok(())
    }

    #[test]
    fn test_can_hold() {
        assert!(DataType::Int8.can_hold(-128.0));
        assert!(DataType::Int8.can_hold(127.0));
        assert!(DataType::Int8.can_hold(f64::NAN));
        assert!(!DataType::Int8.can_hold(128.0));
        assert!(!DataType::Int8.can_hold(1.5));
        assert!(!DataType::UInt16.can_hold(-1.0));
        assert!(DataType::UInt32.can_hold(4_294_967_295.0));
        assert!(!DataType::Int32.can_hold(f64::INFINITY));
        assert!(!DataType::Int64.can_hold(1e19));
        assert!(!DataType::Float32.can_hold(1e300));
        assert!(DataType::Float32.can_hold(f64::INFINITY));
        assert!(DataType::Float64.can_hold(1e300));

        let result = DataType::Int16.check_values("orog", [1.0, 2.0, 40_000.0]);
        assert!(matches!(result, Err(Error::Dataset(_))));
        assert!(DataType::Int16.check_values("orog", [1.0, f64::NAN]).is_ok());
    }
}
