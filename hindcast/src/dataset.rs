//! In-memory labeled datasets, as read from a JSON dataset document.
//!
//! A document looks like:
//!
//! ```json
//! {
//!     "coords": {
//!         "time": ["2021-01-01", "2021-01-02"],
//!         "lat": [10.0, 20.0, 30.0]
//!     },
//!     "data_vars": {
//!         "t2m": {
//!             "dims": ["time", "lat"],
//!             "dtype": "float32",
//!             "attrs": {"units": "K"},
//!             "data": [[271.5, 272.0, null], [270.1, 269.9, 268.4]]
//!         }
//!     },
//!     "attrs": {"title": "example"}
//! }
//! ```
//!
//! Time coordinates are given as timestamp strings, other coordinates as numbers. Variable data
//! may be nested or flat (row major); `null` marks a missing value. In memory every variable is
//! held as `f64` with missing values as NaN, whatever its stored type.
//!
use std::collections::{BTreeMap, HashSet};
use std::io::Read;

use ndarray::{ArrayD, Axis, IxDyn};
use serde::Deserialize;
use serde_json::Value;

use crate::dims::{DataType, DimensionSpec, Dimensions, Role};
use crate::errors::{Error, Result};
use crate::time::parse_instant;

pub type Attributes = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum CoordinateValues {
    /// Seconds since the Unix epoch
    Time(Vec<i64>),

    Numeric(Vec<f64>),
}

impl CoordinateValues {
    pub fn len(&self) -> usize {
        match self {
            CoordinateValues::Time(values) => values.len(),
            CoordinateValues::Numeric(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A one dimensional coordinate labeling the axis of the same name.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Coordinate {
    pub name: String,
    pub values: CoordinateValues,
}

impl Coordinate {
    pub fn time<S: Into<String>>(name: S, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            values: CoordinateValues::Time(values),
        }
    }

    pub fn numeric<S: Into<String>>(name: S, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values: CoordinateValues::Numeric(values),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub dtype: DataType,
    pub attrs: Attributes,
    pub data: ArrayD<f64>,
}

impl Variable {
    pub fn new<S: Into<String>>(
        name: S,
        dims: &[&str],
        dtype: DataType,
        data: ArrayD<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            dims: dims.iter().map(|dim| dim.to_string()).collect(),
            dtype,
            attrs: Attributes::new(),
            data,
        }
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Position of the named axis in this variable's dimensions
    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|name| name == dim)
    }

    /// Number of values that aren't missing
    pub fn count_present(&self) -> usize {
        self.data.iter().filter(|value| !value.is_nan()).count()
    }

    /// Smallest and largest values present, if any
    pub fn observed_range(&self) -> Option<(f64, f64)> {
        self.data
            .iter()
            .filter(|value| !value.is_nan())
            .fold(None, |bounds, &value| match bounds {
                None => Some((value, value)),
                Some((lo, hi)) => Some((f64::min(lo, value), f64::max(hi, value))),
            })
    }
}

/// A collection of variables sharing named dimensions.
///
/// Dimension sizes are consistent across every variable and coordinate that uses them.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    sizes: Vec<(String, usize)>,
    coordinates: Vec<Coordinate>,
    variables: Vec<Variable>,
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new(
        coordinates: Vec<Coordinate>,
        variables: Vec<Variable>,
        attrs: Attributes,
    ) -> Result<Self> {
        let mut sizes: Vec<(String, usize)> = vec![];
        let mut observe = |name: &str, size: usize, owner: &str| -> Result<()> {
            match sizes.iter().find(|(dim, _)| dim == name) {
                Some((_, known)) if *known != size => Err(Error::dataset(format!(
                    "{owner} gives dimension {name} length {size}, expected {known}"
                ))),
                Some(_) => Ok(()),
                None => {
                    sizes.push((name.to_string(), size));
                    Ok(())
                }
            }
        };

        for variable in &variables {
            if variable.dims.len() != variable.data.ndim() {
                return Err(Error::dataset(format!(
                    "variable {} names {} dimensions but has {} axes",
                    variable.name,
                    variable.dims.len(),
                    variable.data.ndim()
                )));
            }
            for (dim, size) in variable.dims.iter().zip(variable.data.shape()) {
                observe(dim, *size, &variable.name)?;
            }
        }
        for coordinate in &coordinates {
            observe(&coordinate.name, coordinate.values.len(), &coordinate.name)?;
        }

        Ok(Self {
            sizes,
            coordinates,
            variables,
            attrs,
        })
    }

    /// Read a dataset from a JSON dataset document
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let document: DatasetDocument = serde_json::from_reader(reader)?;
        document.into_dataset()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: DatasetDocument = serde_json::from_str(json)?;
        document.into_dataset()
    }

    /// Dimension names and lengths, in order of first use
    pub fn dim_sizes(&self) -> &[(String, usize)] {
        &self.sizes
    }

    pub fn dim_size(&self, name: &str) -> Option<usize> {
        self.sizes
            .iter()
            .find(|(dim, _)| dim == name)
            .map(|(_, size)| *size)
    }

    /// The dataset's dimensions, with roles classified by name
    pub fn dimensions(&self, time_dim: &str) -> Result<Dimensions> {
        Dimensions::new(
            self.sizes
                .iter()
                .map(|(name, size)| DimensionSpec::new(name, *size, Role::classify(name, time_dim)))
                .collect(),
        )
    }

    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coordinates
    }

    pub fn coordinate(&self, name: &str) -> Option<&Coordinate> {
        self.coordinates.iter().find(|coord| coord.name == name)
    }

    /// Instants of the time coordinate
    pub fn times(&self, time_dim: &str) -> Result<&[i64]> {
        match self.coordinate(time_dim).map(|coord| &coord.values) {
            Some(CoordinateValues::Time(times)) => Ok(times),
            Some(CoordinateValues::Numeric(_)) => Err(Error::dataset(format!(
                "coordinate {time_dim} does not hold timestamps"
            ))),
            None => Err(Error::dataset(format!(
                "dataset has no time coordinate {time_dim}"
            ))),
        }
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.variables
            .iter()
            .find(|variable| variable.name == name)
            .ok_or_else(|| Error::BadName(name.to_string()))
    }

    /// Keep only the variables named in `include` (all of them if it's empty), then drop the ones
    /// named in `exclude`.
    ///
    pub fn select(&mut self, include: &[String], exclude: &[String]) -> Result<()> {
        for name in include.iter().chain(exclude) {
            self.variable(name)?;
        }

        self.variables.retain(|variable| {
            (include.is_empty() || include.contains(&variable.name))
                && !exclude.contains(&variable.name)
        });
        if self.variables.is_empty() {
            return Err(Error::dataset("no variables left after selection"));
        }

        Ok(())
    }

    /// Drop repeated instants from the time axis, keeping the first occurrence of each.
    ///
    /// Returns the number of instants removed.
    ///
    pub fn dedup_times(&mut self, time_dim: &str) -> Result<usize> {
        let times = self.times(time_dim)?;
        let mut seen = HashSet::new();
        let keep: Vec<usize> = times
            .iter()
            .enumerate()
            .filter(|(_, time)| seen.insert(**time))
            .map(|(i, _)| i)
            .collect();
        let removed = times.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let kept_times: Vec<i64> = keep.iter().map(|&i| times[i]).collect();
        for coordinate in self.coordinates.iter_mut() {
            if coordinate.name == time_dim {
                coordinate.values = CoordinateValues::Time(kept_times.clone());
            }
        }
        for variable in self.variables.iter_mut() {
            if let Some(axis) = variable.axis_of(time_dim) {
                variable.data = variable.data.select(Axis(axis), &keep);
            }
        }
        for (name, size) in self.sizes.iter_mut() {
            if name.as_str() == time_dim {
                *size = kept_times.len();
            }
        }

        log::warn!("dropped {removed} duplicate instants from {time_dim}");

        Ok(removed)
    }

    /// Reorder the time axis so instants are increasing
    pub fn sort_times(&mut self, time_dim: &str) -> Result<()> {
        let times = self.times(time_dim)?;
        if times.windows(2).all(|pair| pair[0] <= pair[1]) {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..times.len()).collect();
        order.sort_by_key(|&i| times[i]);
        let sorted: Vec<i64> = order.iter().map(|&i| times[i]).collect();
        for coordinate in self.coordinates.iter_mut() {
            if coordinate.name == time_dim {
                coordinate.values = CoordinateValues::Time(sorted.clone());
            }
        }
        for variable in self.variables.iter_mut() {
            if let Some(axis) = variable.axis_of(time_dim) {
                variable.data = variable.data.select(Axis(axis), &order);
            }
        }

        Ok(())
    }

    /// Add `attrs` to the global attributes, replacing existing values
    pub fn merge_attrs(&mut self, attrs: &Attributes) {
        for (key, value) in attrs {
            self.attrs.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Deserialize)]
struct DatasetDocument {
    #[serde(default)]
    coords: BTreeMap<String, Vec<Value>>,

    data_vars: BTreeMap<String, VariableDocument>,

    #[serde(default)]
    attrs: Attributes,
}

#[derive(Deserialize)]
struct VariableDocument {
    dims: Vec<String>,

    #[serde(default = "default_dtype")]
    dtype: DataType,

    #[serde(default)]
    attrs: Attributes,

    data: Value,
}

fn default_dtype() -> DataType {
    DataType::Float64
}

impl DatasetDocument {
    fn into_dataset(self) -> Result<Dataset> {
        let coordinates = self
            .coords
            .into_iter()
            .map(|(name, values)| parse_coordinate(name, values))
            .collect::<Result<Vec<_>>>()?;

        let mut variables = vec![];
        for (name, document) in self.data_vars {
            let mut shape = vec![];
            for dim in &document.dims {
                let size = coordinates
                    .iter()
                    .find(|coord| &coord.name == dim)
                    .map(|coord| coord.values.len());
                shape.push(size);
            }

            let mut values = vec![];
            flatten(&name, &document.data, &mut values)?;
            let shape = resolve_shape(&name, shape, values.len())?;
            let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
                .map_err(|err| Error::dataset(format!("variable {name}: {err}")))?;

            variables.push(Variable {
                name,
                dims: document.dims,
                dtype: document.dtype,
                attrs: document.attrs,
                data,
            });
        }

        Dataset::new(coordinates, variables, self.attrs)
    }
}

fn parse_coordinate(name: String, values: Vec<Value>) -> Result<Coordinate> {
    if values.iter().all(Value::is_number) {
        let values = values.iter().filter_map(Value::as_f64).collect();
        return Ok(Coordinate::numeric(name, values));
    }

    let times = values
        .iter()
        .map(|value| match value.as_str() {
            Some(s) => parse_instant(s),
            None => Err(Error::dataset(format!(
                "coordinate {name} mixes timestamps with {value}"
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Coordinate::time(name, times))
}

fn flatten(name: &str, value: &Value, values: &mut Vec<f64>) -> Result<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(name, item, values)?;
            }
        }
        Value::Null => values.push(f64::NAN),
        Value::Number(number) => values.push(number.as_f64().unwrap_or(f64::NAN)),
        _ => {
            return Err(Error::dataset(format!(
                "variable {name} holds non-numeric value {value}"
            )))
        }
    }

    Ok(())
}

/// Fill in at most one axis without a coordinate from the number of values
fn resolve_shape(name: &str, shape: Vec<Option<usize>>, count: usize) -> Result<Vec<usize>> {
    let known: usize = shape.iter().flatten().product();
    let unknown = shape.iter().filter(|size| size.is_none()).count();
    match unknown {
        0 => Ok(shape.into_iter().flatten().collect()),
        1 if known > 0 && count % known == 0 => Ok(shape
            .into_iter()
            .map(|size| size.unwrap_or(count / known))
            .collect()),
        _ => Err(Error::dataset(format!(
            "cannot infer the shape of variable {name}: dimensions need coordinates"
        ))),
    }
}
