//! A persisted archive: JSON metadata plus one object per chunk of each variable.
//!
//! Metadata lives under [`METADATA_KEY`] and is always replaced atomically with
//! [`Mapper::commit`]. Chunk objects live under `<variable>/<i>.<j>...`, where `i`, `j`, ... are
//! the chunk's position in the chunk grid. A chunk that has never been written reads back as all
//! missing values. Chunks at the edge of the array are stored at full size with the cells past the
//! edge missing, so the time axis can grow without rewriting them.
//!
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::chunk::{read_chunk, write_chunk, Compression, Encoding};
use crate::chunking::ChunkPlan;
use crate::dataset::Attributes;
use crate::dims::{DataType, DimensionSpec, Dimensions, Extent};
use crate::errors::{Error, Result};
use crate::geom::ChunkGrid;
use crate::mapper::Mapper;
use crate::packing::PackingPlan;
use crate::region::ArchiveRegion;
use crate::time::format_instant;

pub const METADATA_KEY: &str = ".hindcast";
pub const FORMAT_VERSION: u32 = 1;

/// How one variable is laid out in the archive. Fixed when the archive is created.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableMeta {
    pub dims: Vec<String>,
    pub dtype: DataType,
    pub chunks: ChunkPlan,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packing: Option<PackingPlan>,

    #[serde(default)]
    pub attrs: Attributes,
}

impl VariableMeta {
    /// Chunk lengths in the order of `dims`
    pub fn chunk_shape(&self) -> Result<Vec<usize>> {
        self.chunks.lengths_for(&self.dims)
    }

    pub(crate) fn encoding(&self) -> Encoding {
        match self.packing {
            Some(plan) => Encoding::Packed(plan),
            None => Encoding::Raw(self.dtype),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub format_version: u32,
    pub dimensions: Vec<DimensionSpec>,
    pub append_dim: String,

    /// Instants of the append dimension, seconds since the Unix epoch
    pub time: Vec<i64>,

    /// Other coordinates, by dimension name
    #[serde(default)]
    pub coordinates: BTreeMap<String, Vec<f64>>,

    pub variables: BTreeMap<String, VariableMeta>,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub attrs: Attributes,
}

impl ArchiveMetadata {
    pub fn dim_size(&self, name: &str) -> Option<usize> {
        self.dimensions
            .iter()
            .find(|dim| dim.name == name)
            .and_then(|dim| dim.size())
    }

    pub fn dimensions(&self) -> Result<Dimensions> {
        Dimensions::new(self.dimensions.clone())
    }

    pub fn variable(&self, name: &str) -> Result<&VariableMeta> {
        self.variables
            .get(name)
            .ok_or_else(|| Error::BadName(name.to_string()))
    }

    /// Region spanning every dimension in full
    pub fn full_region(&self) -> ArchiveRegion {
        self.dimensions
            .iter()
            .map(|dim| (dim.name.clone(), 0..dim.size().unwrap_or(0)))
            .collect()
    }

    /// Check internal consistency after loading or before committing
    pub(crate) fn check(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::corrupt(
                METADATA_KEY,
                format!("unsupported format version {}", self.format_version),
            ));
        }

        let dims = self.dimensions()?;
        if self.dim_size(&self.append_dim) != Some(self.time.len()) {
            return Err(Error::corrupt(
                METADATA_KEY,
                format!(
                    "append dimension {} does not match its {} instants",
                    self.append_dim,
                    self.time.len()
                ),
            ));
        }
        if self.time.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::corrupt(
                METADATA_KEY,
                "time coordinate is not strictly increasing",
            ));
        }
        for (name, variable) in &self.variables {
            for dim in &variable.dims {
                if dims.get(dim).is_none() {
                    return Err(Error::corrupt(
                        METADATA_KEY,
                        format!("variable {name} uses unknown dimension {dim}"),
                    ));
                }
            }
            variable.chunk_shape()?;
        }

        Ok(())
    }
}

/// A handle on an archive stored in a `Mapper`.
///
/// Many handles, in many processes, may refer to the same archive. Each writes only the chunks
/// covering its own region, and only the process extending the time axis rewrites metadata.
///
pub struct ArchiveHandle {
    mapper: Arc<dyn Mapper>,
    metadata: ArchiveMetadata,
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl ArchiveHandle {
    /// Create a new archive by committing its metadata. No chunks are written.
    ///
    /// Fails if `mapper` already holds an archive.
    ///
    pub fn create(mapper: Arc<dyn Mapper>, metadata: ArchiveMetadata) -> Result<Self> {
        if mapper.size_of(METADATA_KEY)?.is_some() {
            return Err(Error::configuration(
                "an archive already exists at this location",
            ));
        }

        let handle = Self { mapper, metadata };
        handle.commit()?;
        log::info!(
            "created archive with {} variables over {} instants",
            handle.metadata.variables.len(),
            handle.metadata.time.len()
        );

        Ok(handle)
    }

    /// Open an existing archive
    pub fn open(mapper: Arc<dyn Mapper>) -> Result<Self> {
        let metadata: ArchiveMetadata = match mapper.load(METADATA_KEY)? {
            Some(stream) => serde_json::from_reader(stream)?,
            None => {
                return Err(Error::NotFound(format!(
                    "no archive metadata at {METADATA_KEY}"
                )))
            }
        };
        metadata.check()?;

        Ok(Self { mapper, metadata })
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    pub fn mapper(&self) -> &Arc<dyn Mapper> {
        &self.mapper
    }

    fn commit(&self) -> Result<()> {
        self.metadata.check()?;
        let mut stream = self.mapper.commit(METADATA_KEY)?;
        serde_json::to_writer_pretty(&mut stream, &self.metadata)?;
        stream.finish()?;

        Ok(())
    }

    /// Extend the append dimension with `times` and commit the new metadata.
    ///
    /// Every new instant must come after the last one already in the archive. Returns the index
    /// range of the new instants.
    ///
    pub fn extend_time(&mut self, times: &[i64]) -> Result<Range<usize>> {
        let start = self.metadata.time.len();
        if let (Some(last), Some(first)) = (self.metadata.time.last(), times.first()) {
            if first <= last {
                return Err(Error::region(format!(
                    "cannot append {}: archive already ends at {}",
                    format_instant(*first),
                    format_instant(*last)
                )));
            }
        }

        // Chunks the new instants will share with old ones must be readable before the longer
        // time axis is published
        self.check_tail()?;

        let mut metadata = self.metadata.clone();
        metadata.time.extend_from_slice(times);
        let size = metadata.time.len();
        for dim in metadata.dimensions.iter_mut() {
            if dim.name == metadata.append_dim {
                dim.extent = Extent::Fixed(size);
            }
        }

        let previous = std::mem::replace(&mut self.metadata, metadata);
        if let Err(err) = self.commit() {
            self.metadata = previous;
            return Err(err);
        }
        log::info!(
            "extended {} from {start} to {size} instants",
            self.metadata.append_dim
        );

        Ok(start..size)
    }

    /// Read the last, partly filled, chunk row of every variable along the append dimension
    fn check_tail(&self) -> Result<()> {
        let size = self.metadata.time.len();
        let append_dim = &self.metadata.append_dim;
        for (name, variable) in &self.metadata.variables {
            let axis = match variable.dims.iter().position(|dim| dim == append_dim) {
                Some(axis) => axis,
                None => continue,
            };
            let length = variable.chunk_shape()?[axis];
            if size % length == 0 {
                continue;
            }

            let mut region = self.metadata.full_region();
            region.insert(append_dim.as_str(), size - size % length..size);
            self.read_variable(name, &region)?;
        }

        Ok(())
    }

    fn grid(&self, variable: &VariableMeta) -> Result<ChunkGrid> {
        let shape = variable
            .dims
            .iter()
            .map(|dim| {
                self.metadata.dim_size(dim).ok_or_else(|| {
                    Error::corrupt(METADATA_KEY, format!("dimension {dim} has no size"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChunkGrid::new(shape, variable.chunk_shape()?))
    }

    fn chunk_key(name: &str, index: &[usize]) -> String {
        if index.is_empty() {
            return format!("{name}/0");
        }

        let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
        format!("{name}/{}", index.join("."))
    }

    fn load_chunk(
        &self,
        name: &str,
        variable: &VariableMeta,
        grid: &ChunkGrid,
        index: &[usize],
    ) -> Result<Option<ArrayD<f64>>> {
        let key = Self::chunk_key(name, index);
        let mut stream = match self.mapper.load(&key)? {
            Some(stream) => stream,
            None => return Ok(None),
        };

        let shape = grid.chunk_shape();
        let cells = shape.iter().product();
        let values = read_chunk(&mut stream, &key, &variable.encoding(), cells)?;
        let chunk = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|err| Error::corrupt(&key, err.to_string()))?;

        Ok(Some(chunk))
    }

    fn store_chunk(
        &self,
        name: &str,
        variable: &VariableMeta,
        index: &[usize],
        chunk: &ArrayD<f64>,
    ) -> Result<()> {
        let key = Self::chunk_key(name, index);
        let values: Vec<f64> = chunk.iter().copied().collect();
        let mut stream = self.mapper.store(&key)?;
        write_chunk(
            &mut stream,
            &values,
            &variable.encoding(),
            self.metadata.compression,
        )?;
        stream.finish()?;
        log::debug!("stored chunk {key}");

        Ok(())
    }

    /// Write `data` into `region` of variable `name`.
    ///
    /// Chunks only partly covered by the region are read, updated and written back, so
    /// concurrent writers must keep to chunk aligned regions. Returns the number of chunks
    /// written.
    ///
    pub fn write_variable(
        &self,
        name: &str,
        region: &ArchiveRegion,
        data: ArrayViewD<f64>,
    ) -> Result<usize> {
        let variable = self.metadata.variable(name)?;
        let grid = self.grid(variable)?;
        let bounds = region.bounds_for(&variable.dims)?;
        if data.shape() != bounds.shape().as_slice() {
            return Err(Error::region(format!(
                "data for {name} has shape {:?}, region {region} has shape {:?}",
                data.shape(),
                bounds.shape()
            )));
        }
        if bounds.cells() == 0 {
            return Ok(0);
        }
        if variable.packing.is_none() {
            variable.dtype.check_values(name, data.iter().copied())?;
        }

        let mut written = 0;
        for index in grid.chunks_in(&bounds) {
            let chunk_bounds = grid.chunk_bounds(&index);
            let extent = grid.chunk_extent(&index);
            let overlap = match chunk_bounds.intersect(&bounds) {
                Some(overlap) => overlap,
                None => continue,
            };
            let source = overlap.relative_to(&bounds).view(data.clone());

            let chunk = if overlap == extent {
                source.to_owned()
            } else {
                // Cells past the edge of the array stay missing
                let mut chunk = if overlap == chunk_bounds {
                    grid.empty_chunk()
                } else {
                    match self.load_chunk(name, variable, &grid, &index)? {
                        Some(chunk) => chunk,
                        None => grid.empty_chunk(),
                    }
                };
                overlap
                    .relative_to(&extent)
                    .view_mut(&mut chunk)
                    .assign(&source);
                chunk
            };

            self.store_chunk(name, variable, &index, &chunk)?;
            written += 1;
        }

        Ok(written)
    }

    /// Read `region` of variable `name`. Cells never written are NaN.
    ///
    pub fn read_variable(&self, name: &str, region: &ArchiveRegion) -> Result<ArrayD<f64>> {
        let variable = self.metadata.variable(name)?;
        let grid = self.grid(variable)?;
        let bounds = region.bounds_for(&variable.dims)?;
        let mut result = ArrayD::from_elem(IxDyn(&bounds.shape()), f64::NAN);

        for index in grid.chunks_in(&bounds) {
            let chunk = match self.load_chunk(name, variable, &grid, &index)? {
                Some(chunk) => chunk,
                None => continue,
            };
            let extent = grid.chunk_extent(&index);
            if let Some(overlap) = grid.chunk_bounds(&index).intersect(&bounds) {
                overlap
                    .relative_to(&bounds)
                    .view_mut(&mut result)
                    .assign(&overlap.relative_to(&extent).view(chunk.view()));
            }
        }

        Ok(result)
    }

    /// Number of chunk objects present for variable `name`, and their total size in bytes
    pub fn stored_chunks(&self, name: &str) -> Result<(usize, u64)> {
        let variable = self.metadata.variable(name)?;
        let grid = self.grid(variable)?;
        let bounds = self.metadata.full_region().bounds_for(&variable.dims)?;

        let mut count = 0;
        let mut bytes = 0;
        for index in grid.chunks_in(&bounds) {
            if let Some(size) = self.mapper.size_of(&Self::chunk_key(name, &index))? {
                count += 1;
                bytes += size;
            }
        }

        Ok((count, bytes))
    }
}
