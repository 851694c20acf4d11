use std::collections::HashMap;
use std::io::{self, Read, Write};

use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;

use crate::archive::{ArchiveMetadata, VariableMeta, FORMAT_VERSION};
use crate::chunk::Compression;
use crate::dataset::{Attributes, Coordinate, Dataset, Variable};
use crate::dims::{DataType, DimensionSpec, Role};
use crate::mapper::{Mapper, MemoryMapper, StoreWrite};
use crate::time::{parse_instant, Frequency};

/// Daily instants from `start` to `end`, inclusive
pub(crate) fn daily(start: &str, end: &str) -> Vec<i64> {
    let start = parse_instant(start).expect("valid date");
    let end = parse_instant(end).expect("valid date");
    Frequency::DAILY.instants(start, end).expect("valid span")
}

/// Test data: a quarter of the flat index, with every seventh cell missing
pub(crate) fn array(shape: &[usize]) -> ArrayD<f64> {
    let cells = shape.iter().product();
    let values = (0..cells)
        .map(|i| if i % 7 == 3 { f64::NAN } else { i as f64 * 0.25 })
        .collect();

    ArrayD::from_shape_vec(IxDyn(shape), values).expect("valid shape")
}

/// Equal, treating NaNs as equal to each other
pub(crate) fn same(a: &ArrayD<f64>, b: &ArrayD<f64>) -> bool {
    a.shape() == b.shape()
        && a
            .iter()
            .zip(b.iter())
            .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
}

/// A dataset with variable `t2m(time, lat, lon)`
pub(crate) fn dataset(times: &[i64], lat: usize, lon: usize) -> Dataset {
    let coordinates = vec![
        Coordinate::time("time", times.to_vec()),
        Coordinate::numeric("lat", (0..lat).map(|i| i as f64).collect()),
        Coordinate::numeric("lon", (0..lon).map(|i| i as f64).collect()),
    ];
    let t2m = Variable::new(
        "t2m",
        &["time", "lat", "lon"],
        DataType::Float32,
        array(&[times.len(), lat, lon]),
    );

    Dataset::new(coordinates, vec![t2m], Attributes::new()).expect("valid dataset")
}

/// Metadata for an archive holding `t2m(time, lat, lon)` in chunks of 4 x 2 x 3, over daily
/// instants starting 2020-01-01
pub(crate) fn metadata(
    time: usize,
    lat: usize,
    lon: usize,
    compression: Compression,
) -> ArchiveMetadata {
    let start = parse_instant("2020-01-01").expect("valid date");
    let times = (0..time).map(|i| Frequency::DAILY.advance(start, i)).collect();
    let variable = VariableMeta {
        dims: vec!["time".to_string(), "lat".to_string(), "lon".to_string()],
        dtype: DataType::Float32,
        chunks: [("time", 4), ("lat", 2), ("lon", 3)].into_iter().collect(),
        packing: None,
        attrs: Attributes::new(),
    };

    ArchiveMetadata {
        format_version: FORMAT_VERSION,
        dimensions: vec![
            DimensionSpec::new("time", time, Role::Time),
            DimensionSpec::new("lat", lat, Role::Spatial),
            DimensionSpec::new("lon", lon, Role::Spatial),
        ],
        append_dim: "time".to_string(),
        time: times,
        coordinates: [
            ("lat".to_string(), (0..lat).map(|i| i as f64).collect()),
            ("lon".to_string(), (0..lon).map(|i| i as f64).collect()),
        ]
        .into_iter()
        .collect(),
        variables: [("t2m".to_string(), variable)].into_iter().collect(),
        compression,
        attrs: Attributes::new(),
    }
}

/// A mapper that silently loses the first `drop_first` writes to each chunk key.
///
/// Metadata commits always go through.
///
pub(crate) struct FlakyMapper {
    inner: MemoryMapper,
    drop_first: usize,
    writes: Mutex<HashMap<String, usize>>,
}

impl FlakyMapper {
    pub(crate) fn new(drop_first: usize) -> Self {
        Self {
            inner: MemoryMapper::new(),
            drop_first,
            writes: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }
}

impl Mapper for FlakyMapper {
    fn store(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        let mut writes = self.writes.lock();
        let count = writes.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count <= self.drop_first {
            Ok(Box::new(LostWrite))
        } else {
            self.inner.store(key)
        }
    }

    fn commit(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        self.inner.commit(key)
    }

    fn load(&self, key: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        self.inner.load(key)
    }

    fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        self.inner.size_of(key)
    }
}

struct LostWrite;

impl Write for LostWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StoreWrite for LostWrite {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}
