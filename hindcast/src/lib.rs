mod archive;
mod audit;
mod bitmap;
mod chunk;
mod chunking;
mod config;
mod coordinator;
mod dataset;
mod dims;
mod errors;
mod extio;
mod geom;
mod helpers;
mod mapper;
mod packing;
mod region;
mod time;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveHandle, ArchiveMetadata, VariableMeta, FORMAT_VERSION, METADATA_KEY};
pub use audit::{
    audit, with_retry, Attempt, AuditOutcome, MissingCheck, MissingReport, Retried, RetryPolicy,
    DEFAULT_RETRY_DELAY,
};
pub use chunk::Compression;
pub use chunking::{
    recommend, validate, AccessPattern, ChunkAdvisor, ChunkPlan, ChunkWarning, Tuning,
    DEFAULT_TARGET_CHUNK_BYTES, LARGE_CHUNK_BYTES, MIB, SMALL_CHUNK_BYTES,
};
pub use config::{
    ChunkingConfig, Config, MissingDataConfig, PackingConfig, TimeConfig, VariablesConfig,
};
pub use coordinator::{Analysis, Converter, PatternAnalysis, VariableAnalysis, WriteOutcome};
pub use dataset::{Attributes, Coordinate, CoordinateValues, Dataset, Variable};
pub use dims::{DataType, DimensionSpec, Dimensions, Extent, Role};
pub use errors::{Error, Result};
pub use mapper::{Mapper, MemoryMapper, StoreWrite};
pub use packing::{
    derive_plan, Bits, PackingPlan, PackingRange, Provenance, RangePolicy, RangeSource,
    RangeViolation, DEFAULT_BUFFER_FACTOR,
};
pub use region::{alignment_issues, check_manual, locate, ArchiveRegion};
pub use time::{format_instant, infer_step, parse_instant, Frequency, Timestamp};
