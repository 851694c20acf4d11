//! Fixed-point packing of floating point variables into unsigned integers.
//!
//! A value `v` inside the packing range `[min, max]` is stored as the integer code
//! `round((v - min) / scale)` where `scale = (max - min) / (2^bits - 1)`, so that the whole code
//! space is spread over the range. Decoding is `code * scale + min`, which recovers the encoded
//! value to within `scale / 2`.
//!
//! NaN has no code of its own. Missing values are tracked separately by the chunk codec.
//!
use std::fmt;
use std::str::FromStr;

use ndarray::ArrayViewD;
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::dataset::Attributes;
use crate::dims::DataType;
use crate::errors::{Error, Result};

/// Fraction of the observed span added to each side of an automatically derived range
pub const DEFAULT_BUFFER_FACTOR: f64 = 0.01;

/// Supported code widths.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Bits {
    Eight,

    #[default]
    Sixteen,

    ThirtyTwo,
}

impl Bits {
    /// Largest integer code
    pub fn max_code(&self) -> u32 {
        match self {
            Bits::Eight => u8::MAX as u32,
            Bits::Sixteen => u16::MAX as u32,
            Bits::ThirtyTwo => u32::MAX,
        }
    }

    /// Type of the stored codes
    pub fn dtype(&self) -> DataType {
        match self {
            Bits::Eight => DataType::UInt8,
            Bits::Sixteen => DataType::UInt16,
            Bits::ThirtyTwo => DataType::UInt32,
        }
    }
}

impl TryFrom<u8> for Bits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            8 => Ok(Bits::Eight),
            16 => Ok(Bits::Sixteen),
            32 => Ok(Bits::ThirtyTwo),
            _ => Err(Error::configuration(format!(
                "packing bits must be 8, 16 or 32, got {bits}"
            ))),
        }
    }
}

impl From<Bits> for u8 {
    fn from(bits: Bits) -> Self {
        match bits {
            Bits::Eight => 8,
            Bits::Sixteen => 16,
            Bits::ThirtyTwo => 32,
        }
    }
}

/// Where a packing range came from.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Given explicitly in configuration
    Manual,

    /// Read from the variable's `valid_min`/`valid_max` or `valid_range` attributes
    Attribute,

    /// Computed from the data being written. Only valid for that data.
    Auto,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackingRange {
    pub min: f64,
    pub max: f64,
    pub provenance: Provenance,
}

impl PackingRange {
    pub fn new(min: f64, max: f64, provenance: Provenance) -> Result<Self> {
        if !(min.is_finite() && max.is_finite()) {
            return Err(Error::configuration(format!(
                "packing range ({min}, {max}) must be finite"
            )));
        }
        if min >= max {
            return Err(Error::configuration(format!(
                "packing range min ({min}) must be less than max ({max})"
            )));
        }

        Ok(Self {
            min,
            max,
            provenance,
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// The candidate sources for a variable's packing range, in order of precedence.
///
#[derive(Clone, Debug)]
pub struct RangeSource<'a> {
    manual: Option<(f64, f64)>,
    attrs: Option<&'a Attributes>,
    data: Option<ArrayViewD<'a, f64>>,
    buffer: f64,
}

impl<'a> Default for RangeSource<'a> {
    fn default() -> Self {
        Self {
            manual: None,
            attrs: None,
            data: None,
            buffer: DEFAULT_BUFFER_FACTOR,
        }
    }
}

impl<'a> RangeSource<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual(mut self, range: Option<(f64, f64)>) -> Self {
        self.manual = range;
        self
    }

    pub fn attributes(mut self, attrs: &'a Attributes) -> Self {
        self.attrs = Some(attrs);
        self
    }

    pub fn data(mut self, data: ArrayViewD<'a, f64>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn buffer(mut self, buffer: f64) -> Self {
        self.buffer = buffer;
        self
    }

    /// Pick the packing range for variable `name`.
    ///
    /// A manual range wins, then one declared in the variable's attributes, and finally a range
    /// computed from the data, widened on both sides by the buffer fraction.
    ///
    pub fn resolve(&self, name: &str) -> Result<PackingRange> {
        if let Some((min, max)) = self.manual {
            return PackingRange::new(min, max, Provenance::Manual);
        }

        if let Some((min, max)) = self.attrs.and_then(attribute_range) {
            return PackingRange::new(min, max, Provenance::Attribute);
        }

        let data = self.data.as_ref().ok_or_else(|| {
            Error::configuration(format!(
                "no packing range for {name}: no manual range, no valid_min/valid_max \
                 attributes and no data"
            ))
        })?;

        let (lo, hi) = data
            .iter()
            .filter(|value| !value.is_nan())
            .fold(None, |bounds, &value| match bounds {
                None => Some((value, value)),
                Some((lo, hi)) => Some((f64::min(lo, value), f64::max(hi, value))),
            })
            .ok_or_else(|| {
                Error::configuration(format!(
                    "cannot derive a packing range for {name}: every value is missing"
                ))
            })?;

        let (min, max) = if lo == hi {
            let pad = if lo == 0.0 {
                0.01
            } else {
                lo.abs() * self.buffer
            };
            (lo - pad, hi + pad)
        } else {
            let pad = (hi - lo) * self.buffer;
            (lo - pad, hi + pad)
        };

        log::warn!(
            "packing range for {name} computed from data as ({min}, {max}); values written later \
             outside this range will be clamped, set valid_min/valid_max or a manual range instead"
        );

        PackingRange::new(min, max, Provenance::Auto)
    }
}

fn attribute_range(attrs: &Attributes) -> Option<(f64, f64)> {
    let min = attrs.get("valid_min").and_then(|value| value.as_f64());
    let max = attrs.get("valid_max").and_then(|value| value.as_f64());
    if let (Some(min), Some(max)) = (min, max) {
        return Some((min, max));
    }

    match attrs.get("valid_range")?.as_array()?.as_slice() {
        [min, max] => Some((min.as_f64()?, max.as_f64()?)),
        _ => None,
    }
}

/// Derive a packing plan for variable `name` from the first range `source` can provide.
///
pub fn derive_plan(source: &RangeSource, name: &str, bits: Bits) -> Result<PackingPlan> {
    let range = source.resolve(name)?;
    let plan = PackingPlan::new(bits, range)?;
    log::debug!(
        "packing plan for {name}: {} bits, scale {}, offset {} ({:?})",
        u8::from(bits),
        plan.scale,
        plan.offset,
        range.provenance
    );

    Ok(plan)
}

/// A value found outside the packing range
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeViolation {
    pub index: usize,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackingPlan {
    pub bits: Bits,
    pub range: PackingRange,
    pub scale: f64,
    pub offset: f64,
}

impl PackingPlan {
    pub fn new(bits: Bits, range: PackingRange) -> Result<Self> {
        let scale = (range.max - range.min) / bits.max_code() as f64;
        if scale.is_nan() || scale <= 0.0 {
            return Err(Error::configuration(format!(
                "packing range ({}, {}) is too narrow for {} bits",
                range.min,
                range.max,
                u8::from(bits)
            )));
        }

        Ok(Self {
            bits,
            range,
            scale,
            offset: range.min,
        })
    }

    /// Encode one value. Values outside the range are clamped to the nearest code.
    ///
    /// Returns `None` for NaN, which has no code. Callers record missing values separately.
    ///
    pub fn encode_value(&self, value: f64) -> Option<u32> {
        if value.is_nan() {
            return None;
        }

        let code = ((value - self.offset) / self.scale).round();
        Some(code.max(0.0).min(self.bits.max_code() as f64) as u32)
    }

    pub fn decode_value(&self, code: u32) -> f64 {
        code as f64 * self.scale + self.offset
    }

    /// Encode a slice of values. Missing values are encoded as 0.
    pub fn encode<F: Float>(&self, values: &[F]) -> Vec<u32> {
        values
            .iter()
            .map(|value| {
                value
                    .to_f64()
                    .and_then(|value| self.encode_value(value))
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn decode<F: Float>(&self, codes: &[u32]) -> Vec<F> {
        codes
            .iter()
            .map(|&code| F::from(self.decode_value(code)).unwrap_or_else(F::nan))
            .collect()
    }

    /// Find values that fall outside the packing range. Missing values are skipped.
    ///
    pub fn validate<F: Float>(&self, values: &[F]) -> Vec<RangeViolation> {
        values
            .iter()
            .enumerate()
            .filter_map(|(index, value)| {
                let value = value.to_f64()?;
                if value.is_nan() || self.range.contains(value) {
                    None
                } else {
                    Some(RangeViolation { index, value })
                }
            })
            .collect()
    }
}

/// What to do when data falls outside a variable's packing range.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    /// Log a warning and clamp
    #[default]
    Warn,

    /// Abort the write
    Error,

    /// Don't check
    Ignore,
}

impl RangePolicy {
    /// Apply this policy to `values` about to be packed with `plan`.
    ///
    pub fn check<F: Float>(&self, plan: &PackingPlan, name: &str, values: &[F]) -> Result<()> {
        if *self == RangePolicy::Ignore {
            return Ok(());
        }

        let violations = plan.validate(values);
        let first = match violations.first() {
            Some(first) => first,
            None => return Ok(()),
        };
        let message = format!(
            "{} values of {name} fall outside the packing range ({}, {}), first {} at index {}",
            violations.len(),
            plan.range.min,
            plan.range.max,
            first.value,
            first.index
        );

        match self {
            RangePolicy::Error => Err(Error::packing(message)),
            _ => {
                log::warn!("{message}; they will be clamped");
                Ok(())
            }
        }
    }
}

impl fmt::Display for RangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RangePolicy::Warn => "warn",
            RangePolicy::Error => "error",
            RangePolicy::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

impl FromStr for RangePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warn" => Ok(RangePolicy::Warn),
            "error" => Ok(RangePolicy::Error),
            "ignore" => Ok(RangePolicy::Ignore),
            _ => Err(Error::configuration(format!(
                "unknown range policy {s}, expected warn, error or ignore"
            ))),
        }
    }
}
