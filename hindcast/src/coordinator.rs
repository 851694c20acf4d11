//! Archive lifecycle: template creation, region writes, conversion, appends and analysis.
//!
//! An archive is first created, either as a template covering the whole time span it will ever
//! hold, or directly from a dataset. Region writes then fill in slices of the time axis. Region
//! writes to disjoint, chunk aligned regions may run at the same time in independent processes,
//! since each one writes only the chunks its own region covers and reads nothing but metadata.
//!
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::archive::{ArchiveHandle, ArchiveMetadata, VariableMeta, FORMAT_VERSION};
use crate::audit::{audit, with_retry, Attempt, AuditOutcome};
use crate::chunking::{AccessPattern, ChunkAdvisor, ChunkPlan, ChunkWarning};
use crate::config::Config;
use crate::dataset::{CoordinateValues, Dataset, Variable};
use crate::dims::{DataType, DimensionSpec, Dimensions, Role};
use crate::errors::{Error, Result};
use crate::mapper::Mapper;
use crate::packing::{derive_plan, PackingPlan, RangeSource};
use crate::region::{self, ArchiveRegion};
use crate::time::{format_instant, infer_step, Frequency};

/// What a region write did.
///
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub region: ArchiveRegion,

    /// Attempts made, including the successful one
    pub attempts: u32,

    pub retries: u32,

    /// Time spent waiting between attempts
    pub waited: Duration,

    /// Chunks written by the successful attempt
    pub chunks_written: usize,
}

/// Chunking advice for one access pattern
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatternAnalysis {
    pub pattern: AccessPattern,
    pub chunks: ChunkPlan,
    pub estimated_bytes: usize,
    pub warnings: Vec<ChunkWarning>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VariableAnalysis {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub cells: usize,
    pub present: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_range: Option<(f64, f64)>,

    pub recommendations: Vec<PatternAnalysis>,

    /// Packing that would be used for a float variable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packing: Option<PackingPlan>,

    /// Why no packing plan could be derived for a float variable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packing_error: Option<String>,
}

/// A read-only report on a dataset, as it would be archived.
///
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Analysis {
    pub dims: Vec<(String, usize)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<Frequency>,

    pub packing_enabled: bool,
    pub variables: Vec<VariableAnalysis>,
}

/// Runs archive operations with one validated configuration.
///
pub struct Converter {
    config: Config,
}

impl Converter {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn time_dim(&self) -> &str {
        &self.config.time.dim
    }

    /// Variable selection, duplicate instant removal, time ordering and extra attributes
    fn prepare(&self, dataset: &mut Dataset, require_time: bool) -> Result<()> {
        let variables = &self.config.variables;
        dataset.select(&variables.include, &variables.exclude)?;

        if dataset.times(self.time_dim()).is_ok() {
            dataset.dedup_times(self.time_dim())?;
            dataset.sort_times(self.time_dim())?;
        } else if require_time {
            dataset.times(self.time_dim())?;
        }
        dataset.merge_attrs(&self.config.attrs);

        Ok(())
    }

    fn packing_plan(&self, variable: &Variable) -> Result<Option<PackingPlan>> {
        let packing = &self.config.packing;
        if !packing.enabled || !variable.dtype.is_float() {
            return Ok(None);
        }

        let source = RangeSource::new()
            .manual(self.config.manual_range(&variable.name))
            .attributes(&variable.attrs)
            .data(variable.data.view())
            .buffer(packing.buffer_factor);

        derive_plan(&source, &variable.name, packing.bits).map(Some)
    }

    /// Archive metadata for `dataset`, with the time axis replaced by `times`
    fn build_metadata(&self, dataset: &Dataset, times: Vec<i64>) -> Result<ArchiveMetadata> {
        let time_dim = self.time_dim();
        let overrides = &self.config.chunking.dims;
        for (name, _) in overrides.iter() {
            if dataset.dim_size(name).is_none() {
                return Err(Error::configuration(format!(
                    "chunk override names unknown dimension {name}"
                )));
            }
        }

        let dimensions: Vec<DimensionSpec> = dataset
            .dimensions(time_dim)?
            .into_vec()
            .into_iter()
            .map(|dim| match dim.role {
                Role::Time => DimensionSpec::new(dim.name, times.len(), Role::Time),
                _ => dim,
            })
            .collect();
        let all_dims = Dimensions::new(dimensions.clone())?;

        let advisor = self.config.advisor();
        let mut variables = BTreeMap::new();
        for variable in dataset.variables() {
            let packing = self.packing_plan(variable)?;
            let element_bytes = match packing {
                Some(plan) => plan.bits.dtype().element_bytes(),
                None => variable.dtype.element_bytes(),
            };
            let dims = all_dims.subset(&variable.dims)?;
            let chunks = advisor.plan(&dims, element_bytes, overrides)?;
            log::info!("{}: chunks {chunks}", variable.name);

            variables.insert(
                variable.name.clone(),
                VariableMeta {
                    dims: variable.dims.clone(),
                    dtype: variable.dtype,
                    chunks,
                    packing,
                    attrs: variable.attrs.clone(),
                },
            );
        }

        let coordinates = dataset
            .coordinates()
            .iter()
            .filter_map(|coord| match &coord.values {
                CoordinateValues::Numeric(values) => Some((coord.name.clone(), values.clone())),
                CoordinateValues::Time(_) => None,
            })
            .collect();

        Ok(ArchiveMetadata {
            format_version: FORMAT_VERSION,
            dimensions,
            append_dim: self.config.append_dim().to_string(),
            time: times,
            coordinates,
            variables,
            compression: self.config.compression,
            attrs: dataset.attrs.clone(),
        })
    }

    /// Create an empty archive spanning `global_start` to `global_end`.
    ///
    /// Chunk geometry and packing are derived from `template`, with the time axis at its full
    /// global extent. Only metadata is written. When `freq` isn't given it is inferred from the
    /// template's first time step, or taken to be daily for a single instant template.
    ///
    pub fn create_template(
        &self,
        mut template: Dataset,
        mapper: Arc<dyn Mapper>,
        global_start: i64,
        global_end: i64,
        freq: Option<Frequency>,
    ) -> Result<ArchiveHandle> {
        self.prepare(&mut template, true)?;
        let freq = match freq {
            Some(freq) => freq,
            None => match infer_step(template.times(self.time_dim())?) {
                Some(step) => Frequency::from_seconds(step)?,
                None => {
                    log::info!("template has a single instant, assuming daily frequency");
                    Frequency::DAILY
                }
            },
        };

        let times = freq.instants(global_start, global_end)?;
        log::info!(
            "creating template from {} to {} every {freq}: {} instants",
            format_instant(global_start),
            format_instant(global_end),
            times.len()
        );

        let metadata = self.build_metadata(&template, times)?;
        ArchiveHandle::create(mapper, metadata)
    }

    /// Write `source` into an existing archive.
    ///
    /// The region is located from the source's time coordinate unless given. The write is
    /// audited, and rerun while data is missing, up to the configured number of retries.
    ///
    pub fn write_region(
        &self,
        mut source: Dataset,
        handle: &ArchiveHandle,
        region: Option<&ArchiveRegion>,
    ) -> Result<WriteOutcome> {
        self.prepare(&mut source, true)?;
        self.write_prepared(&source, handle, region)
    }

    fn check_compatible(&self, source: &Dataset, metadata: &ArchiveMetadata) -> Result<()> {
        if metadata.append_dim != self.config.append_dim() {
            return Err(Error::configuration(format!(
                "archive appends along {}, configuration says {}",
                metadata.append_dim,
                self.config.append_dim()
            )));
        }

        for variable in source.variables() {
            let archived = metadata.variable(&variable.name)?;
            if archived.dims != variable.dims {
                return Err(Error::dataset(format!(
                    "variable {} has dimensions {:?}, archive has {:?}",
                    variable.name, variable.dims, archived.dims
                )));
            }
        }
        for (name, size) in source.dim_sizes() {
            if *name == metadata.append_dim {
                continue;
            }
            match metadata.dim_size(name) {
                Some(archived) if archived == *size => {}
                archived => {
                    return Err(Error::dataset(format!(
                        "dimension {name} has length {size}, archive has {archived:?}"
                    )))
                }
            }
        }

        Ok(())
    }

    fn write_prepared(
        &self,
        source: &Dataset,
        handle: &ArchiveHandle,
        region: Option<&ArchiveRegion>,
    ) -> Result<WriteOutcome> {
        let metadata = handle.metadata();
        self.check_compatible(source, metadata)?;

        let region = match region {
            Some(region) => region::check_manual(metadata, region, source)?,
            None => region::plan(metadata, source.times(self.time_dim())?)?,
        };
        if region.is_empty() {
            log::info!("source is empty, nothing to write");
            return Ok(WriteOutcome {
                region,
                attempts: 0,
                retries: 0,
                waited: Duration::ZERO,
                chunks_written: 0,
            });
        }

        for variable in source.variables() {
            let stored = metadata.variable(&variable.name)?;
            match &stored.packing {
                Some(plan) => {
                    let values: Vec<f64> = variable.data.iter().copied().collect();
                    self.config
                        .packing
                        .on_range_exceeded
                        .check(plan, &variable.name, &values)?;
                }
                None => stored
                    .dtype
                    .check_values(&variable.name, variable.data.iter().copied())?,
            }
        }

        let check = &self.config.missing_data.check_vars;
        let retried = with_retry(&self.config.retry_policy(), |retries| {
            log::info!("writing region {region} (attempt {})", retries + 1);
            let mut chunks = 0;
            for variable in source.variables() {
                match handle.write_variable(&variable.name, &region, variable.data.view()) {
                    Ok(written) => chunks += written,
                    Err(err) => return Attempt::Fatal(err),
                }
            }

            match audit(handle, &region, source, check) {
                Ok(AuditOutcome::Complete) => Attempt::Success(chunks),
                Ok(outcome) => Attempt::Retryable(outcome.describe()),
                Err(err) => Attempt::Fatal(err),
            }
        })?;

        log::info!(
            "wrote region {region}: {} chunks after {} retries",
            retried.value,
            retried.retries
        );

        Ok(WriteOutcome {
            region,
            attempts: retried.retries + 1,
            retries: retried.retries,
            waited: retried.waited,
            chunks_written: retried.value,
        })
    }

    /// Convert `source` into a new archive covering exactly its own time span.
    ///
    pub fn convert(
        &self,
        mut source: Dataset,
        mapper: Arc<dyn Mapper>,
    ) -> Result<(ArchiveHandle, WriteOutcome)> {
        self.prepare(&mut source, true)?;
        let times = source.times(self.time_dim())?.to_vec();
        if times.is_empty() {
            return Err(Error::dataset("source has no time instants"));
        }

        let metadata = self.build_metadata(&source, times)?;
        let handle = ArchiveHandle::create(mapper, metadata)?;
        let outcome = self.write_prepared(&source, &handle, None)?;

        Ok((handle, outcome))
    }

    /// Extend an existing archive with the instants of `source`, then write them.
    ///
    /// Every instant of `source` must come after the archive's last instant.
    ///
    pub fn append(&self, mut source: Dataset, mapper: Arc<dyn Mapper>) -> Result<WriteOutcome> {
        self.prepare(&mut source, true)?;
        let mut handle = ArchiveHandle::open(mapper)?;
        self.check_compatible(&source, handle.metadata())?;

        let times = source.times(self.time_dim())?.to_vec();
        if times.is_empty() {
            return Err(Error::dataset("source has no time instants"));
        }
        handle.extend_time(&times)?;

        self.write_prepared(&source, &handle, None)
    }

    /// Report on `dataset` without writing anything.
    ///
    pub fn analyze(&self, mut dataset: Dataset) -> Result<Analysis> {
        self.prepare(&mut dataset, false)?;
        let all_dims = dataset.dimensions(self.time_dim())?;
        let overrides = &self.config.chunking.dims;
        let target = self.config.target_chunk_bytes();

        let mut variables = vec![];
        for variable in dataset.variables() {
            let (packing, packing_error) = match self.analysis_packing(variable) {
                Ok(plan) => (plan, None),
                Err(Error::Configuration(reason)) => (None, Some(reason)),
                Err(err) => return Err(err),
            };
            let element_bytes = match packing {
                Some(plan) if self.config.packing.enabled => plan.bits.dtype().element_bytes(),
                _ => variable.dtype.element_bytes(),
            };

            let dims = all_dims.subset(&variable.dims)?;
            let mut recommendations = vec![];
            for pattern in AccessPattern::ALL {
                let advisor = ChunkAdvisor::new(pattern, target);
                let (chunks, warnings) =
                    advisor.plan_with_warnings(&dims, element_bytes, overrides)?;
                recommendations.push(PatternAnalysis {
                    pattern,
                    estimated_bytes: chunks.estimated_bytes(element_bytes),
                    chunks,
                    warnings,
                });
            }

            variables.push(VariableAnalysis {
                name: variable.name.clone(),
                dims: variable.dims.clone(),
                shape: variable.data.shape().to_vec(),
                dtype: variable.dtype,
                cells: variable.data.len(),
                present: variable.count_present(),
                observed_range: variable.observed_range(),
                recommendations,
                packing,
                packing_error,
            });
        }

        let times = dataset.times(self.time_dim()).ok();
        let freq = times
            .and_then(infer_step)
            .and_then(|step| Frequency::from_seconds(step).ok());

        Ok(Analysis {
            dims: dataset.dim_sizes().to_vec(),
            time_start: times.and_then(|t| t.first()).map(|t| format_instant(*t)),
            time_end: times.and_then(|t| t.last()).map(|t| format_instant(*t)),
            freq,
            packing_enabled: self.config.packing.enabled,
            variables,
        })
    }

    /// Packing plan for analysis: derived for every float variable, enabled or not
    fn analysis_packing(&self, variable: &Variable) -> Result<Option<PackingPlan>> {
        if !variable.dtype.is_float() {
            return Ok(None);
        }

        let packing = &self.config.packing;
        let source = RangeSource::new()
            .manual(self.config.manual_range(&variable.name))
            .attributes(&variable.attrs)
            .data(variable.data.view())
            .buffer(packing.buffer_factor);

        derive_plan(&source, &variable.name, packing.bits).map(Some)
    }
}
