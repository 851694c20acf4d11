//! Serialization of a single chunk of a variable.
//!
//! A chunk object is laid out as:
//!
//! * magic number (u16) and format version (u32)
//! * compression code (u8): 0 for none, 1 for zstd
//! * body, compressed as indicated
//!
//! The body holds an encoding tag (u8: 1 for raw, 2 for packed) and a type code (u8: data type
//! for raw, bit width for packed), the validity bitmap, then one big endian value per cell.
//! Missing cells are written as zero and masked by the bitmap. All integers are big endian.
//!
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::dims::DataType;
use crate::errors::{Error, Result};
use crate::extio::{ExtendedRead, ExtendedWrite};
use crate::packing::{Bits, PackingPlan};

const MAGIC_NUMBER: u16 = 0x4843;
const FORMAT_VERSION: u32 = 0;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZSTD: u8 = 1;

const ENCODING_RAW: u8 = 1;
const ENCODING_PACKED: u8 = 2;

pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

/// Compression applied to every chunk of an archive.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    /// Parse `none`, `zstd` or `zstd:<level>`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let (name, level) = match s.split_once(':') {
            Some((name, level)) => (name, Some(level)),
            None => (s.as_str(), None),
        };

        match (name, level) {
            ("none", None) => Ok(Compression::None),
            ("zstd", None) => Ok(Compression::default()),
            ("zstd", Some(level)) => {
                let level = level.parse::<i32>().map_err(|_| {
                    Error::configuration(format!("zstd level in {s} is not an integer"))
                })?;
                if !zstd::compression_level_range().contains(&level) {
                    return Err(Error::configuration(format!(
                        "zstd level {level} is out of range"
                    )));
                }
                Ok(Compression::Zstd { level })
            }
            _ => Err(Error::configuration(format!(
                "unknown compression {s}, expected none or zstd[:level]"
            ))),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Compression> for String {
    fn from(compression: Compression) -> Self {
        compression.to_string()
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

/// How the values of a variable are stored.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Encoding {
    /// Values stored in the variable's own data type
    Raw(DataType),

    /// Values stored as fixed point codes
    Packed(PackingPlan),
}

impl Encoding {
    fn tag(&self) -> (u8, u8) {
        match self {
            Encoding::Raw(dtype) => (ENCODING_RAW, dtype.code()),
            Encoding::Packed(plan) => (ENCODING_PACKED, u8::from(plan.bits)),
        }
    }

    fn write_value(&self, stream: &mut impl Write, value: f64) -> io::Result<()> {
        match self {
            Encoding::Raw(dtype) => match dtype {
                DataType::Int8 => stream.write_i8(value as i8),
                DataType::Int16 => stream.write_i16(value as i16),
                DataType::Int32 => stream.write_i32(value as i32),
                DataType::Int64 => stream.write_i64(value as i64),
                DataType::UInt8 => stream.write_byte(value as u8),
                DataType::UInt16 => stream.write_u16(value as u16),
                DataType::UInt32 => stream.write_u32(value as u32),
                DataType::Float32 => stream.write_f32(value as f32),
                DataType::Float64 => stream.write_f64(value),
            },
            Encoding::Packed(plan) => {
                // Missing cells arrive as zero, so there is always a code
                let code = plan.encode_value(value).unwrap_or(0);
                match plan.bits {
                    Bits::Eight => stream.write_byte(code as u8),
                    Bits::Sixteen => stream.write_u16(code as u16),
                    Bits::ThirtyTwo => stream.write_u32(code),
                }
            }
        }
    }

    fn read_value(&self, stream: &mut impl Read) -> io::Result<f64> {
        let value = match self {
            Encoding::Raw(dtype) => match dtype {
                DataType::Int8 => stream.read_i8()? as f64,
                DataType::Int16 => stream.read_i16()? as f64,
                DataType::Int32 => stream.read_i32()? as f64,
                DataType::Int64 => stream.read_i64()? as f64,
                DataType::UInt8 => stream.read_byte()? as f64,
                DataType::UInt16 => stream.read_u16()? as f64,
                DataType::UInt32 => stream.read_u32()? as f64,
                DataType::Float32 => stream.read_f32()? as f64,
                DataType::Float64 => stream.read_f64()?,
            },
            Encoding::Packed(plan) => {
                let code = match plan.bits {
                    Bits::Eight => stream.read_byte()? as u32,
                    Bits::Sixteen => stream.read_u16()? as u32,
                    Bits::ThirtyTwo => stream.read_u32()?,
                };
                plan.decode_value(code)
            }
        };

        Ok(value)
    }
}

/// Serialize the cells of one chunk, in row major order. NaN marks a missing cell.
///
pub(crate) fn write_chunk(
    stream: &mut impl Write,
    values: &[f64],
    encoding: &Encoding,
    compression: Compression,
) -> io::Result<()> {
    let mut body = vec![];
    let (tag, type_code) = encoding.tag();
    body.write_byte(tag)?;
    body.write_byte(type_code)?;
    Bitmap::from_bits(values.iter().map(|value| !value.is_nan())).write_to(&mut body)?;
    for value in values {
        let value = if value.is_nan() { 0.0 } else { *value };
        encoding.write_value(&mut body, value)?;
    }

    stream.write_u16(MAGIC_NUMBER)?;
    stream.write_u32(FORMAT_VERSION)?;
    match compression {
        Compression::None => {
            stream.write_byte(COMPRESSION_NONE)?;
            stream.write_all(&body)?;
        }
        Compression::Zstd { level } => {
            stream.write_byte(COMPRESSION_ZSTD)?;
            stream.write_all(&zstd::encode_all(body.as_slice(), level)?)?;
        }
    }

    Ok(())
}

/// Deserialize a chunk written by `write_chunk`.
///
/// `key` is only used in error messages. The chunk must hold `expected` cells, encoded with
/// `encoding`.
///
pub(crate) fn read_chunk(
    stream: &mut impl Read,
    key: &str,
    encoding: &Encoding,
    expected: usize,
) -> Result<Vec<f64>> {
    let magic_number = stream.read_u16()?;
    if magic_number != MAGIC_NUMBER {
        return Err(Error::corrupt(key, "not a hindcast chunk"));
    }
    let version = stream.read_u32()?;
    if version != FORMAT_VERSION {
        return Err(Error::corrupt(
            key,
            format!("unrecognized chunk format version {version}"),
        ));
    }

    let mut body = vec![];
    match stream.read_byte()? {
        COMPRESSION_NONE => {
            stream.read_to_end(&mut body)?;
        }
        COMPRESSION_ZSTD => {
            body = zstd::decode_all(stream)?;
        }
        code => {
            return Err(Error::corrupt(
                key,
                format!("unknown compression code {code}"),
            ))
        }
    }

    let mut body = Cursor::new(body);
    let tag = (body.read_byte()?, body.read_byte()?);
    if tag != encoding.tag() {
        return Err(Error::corrupt(
            key,
            format!("chunk encoding {tag:?} does not match archive metadata"),
        ));
    }

    let bitmap = Bitmap::read_from(&mut body)?;
    if bitmap.len() != expected {
        return Err(Error::corrupt(
            key,
            format!("expected {expected} cells, found {}", bitmap.len()),
        ));
    }

    let mut values = Vec::with_capacity(expected);
    for index in 0..expected {
        let value = encoding.read_value(&mut body)?;
        values.push(if bitmap.get(index) { value } else { f64::NAN });
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::{PackingRange, Provenance};

    fn round_trip(values: &[f64], encoding: Encoding, compression: Compression) -> Vec<f64> {
        let mut buffer = vec![];
        write_chunk(&mut buffer, values, &encoding, compression).expect("write chunk");
        read_chunk(&mut Cursor::new(buffer), "t2m/0.0", &encoding, values.len())
            .expect("read chunk")
    }

    fn same(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len()
            && a
                .iter()
                .zip(b)
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }

    #[test]
    fn test_raw_float() {
        let values = [1.5, f64::NAN, -3.25, 0.0, 1e30];
        for compression in [Compression::None, Compression::default()] {
            let loaded = round_trip(&values, Encoding::Raw(DataType::Float64), compression);
            assert!(same(&loaded, &values));
        }

        let loaded = round_trip(&values[..4], Encoding::Raw(DataType::Float32), Compression::None);
        assert!(same(&loaded, &values[..4]));
    }

    #[test]
    fn test_raw_integer_with_missing() {
        let values = [-7.0, f64::NAN, 120.0, 0.0];
        let loaded = round_trip(&values, Encoding::Raw(DataType::Int8), Compression::default());
        assert!(same(&loaded, &values));

        let values = [65535.0, f64::NAN, 0.0];
        let loaded = round_trip(&values, Encoding::Raw(DataType::UInt16), Compression::None);
        assert!(same(&loaded, &values));
    }

    #[test]
    fn test_packed() -> Result<()> {
        let range = PackingRange::new(-50.0, 50.0, Provenance::Manual)?;
        let plan = PackingPlan::new(Bits::Sixteen, range)?;
        let values = [-50.0, 0.0, f64::NAN, 49.9, 50.0];
        let loaded = round_trip(&values, Encoding::Packed(plan), Compression::default());
        assert!(loaded[2].is_nan());
        for (value, loaded) in values.iter().zip(&loaded) {
            if !value.is_nan() {
                assert!((value - loaded).abs() <= plan.scale / 2.0 + 1e-12);
            }
        }

        Ok(())
    }

    #[test]
    fn test_compression_shrinks_repetitive_chunks() -> io::Result<()> {
        let values = vec![273.15; 10_000];
        let encoding = Encoding::Raw(DataType::Float32);
        let mut plain = vec![];
        write_chunk(&mut plain, &values, &encoding, Compression::None)?;
        let mut packed = vec![];
        write_chunk(&mut packed, &values, &encoding, Compression::default())?;
        assert!(packed.len() < plain.len() / 10);

        Ok(())
    }

    #[test]
    fn test_corrupt() -> io::Result<()> {
        let encoding = Encoding::Raw(DataType::Float32);
        let mut buffer = vec![];
        write_chunk(&mut buffer, &[1.0, 2.0], &encoding, Compression::None)?;

        let wrong_count = read_chunk(&mut Cursor::new(&buffer), "a", &encoding, 3);
        assert!(matches!(wrong_count, Err(Error::Corrupt { .. })));

        let wrong_type = read_chunk(
            &mut Cursor::new(&buffer),
            "a",
            &Encoding::Raw(DataType::Float64),
            2,
        );
        assert!(matches!(wrong_type, Err(Error::Corrupt { .. })));

        let garbage = read_chunk(&mut Cursor::new(b"garbage"), "a", &encoding, 2);
        assert!(matches!(garbage, Err(Error::Corrupt { .. })));

        Ok(())
    }

    #[test]
    fn test_parse_compression() -> Result<()> {
        assert_eq!("none".parse::<Compression>()?, Compression::None);
        assert_eq!("zstd".parse::<Compression>()?, Compression::Zstd { level: 1 });
        assert_eq!("ZSTD:9".parse::<Compression>()?, Compression::Zstd { level: 9 });
        assert_eq!(Compression::Zstd { level: 3 }.to_string(), "zstd:3");
        assert!("gzip".parse::<Compression>().is_err());
        assert!("zstd:fast".parse::<Compression>().is_err());
        assert!("none:3".parse::<Compression>().is_err());

        let compression: Compression = serde_json::from_str("\"zstd:5\"")?;
        assert_eq!(compression, Compression::Zstd { level: 5 });

        Ok(())
    }
}
