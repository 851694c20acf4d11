//! Typed configuration, loaded once from a JSON file and validated before any work starts.
//!
//! Every field is optional in the file. A complete example:
//!
//! ```json
//! {
//!     "chunking": {"access_pattern": "temporal", "target_chunk_size_mb": 50, "dims": {"lat": 90}},
//!     "packing": {
//!         "enabled": true,
//!         "bits": 16,
//!         "ranges": {"t2m": [180.0, 340.0]},
//!         "buffer_factor": 0.01,
//!         "on_range_exceeded": "warn"
//!     },
//!     "compression": "zstd:3",
//!     "time": {
//!         "dim": "time",
//!         "global_start": "2020-01-01",
//!         "global_end": "2023-12-31",
//!         "freq": "1D"
//!     },
//!     "variables": {"include": [], "exclude": ["orog"]},
//!     "missing_data": {"check_vars": "all", "retries_on_missing": 2, "retry_delay_ms": 100},
//!     "attrs": {"institution": "somewhere"}
//! }
//! ```
//!
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::{MissingCheck, RetryPolicy};
use crate::chunk::Compression;
use crate::chunking::{AccessPattern, ChunkAdvisor, ChunkPlan, DEFAULT_TARGET_CHUNK_BYTES, MIB};
use crate::dataset::Attributes;
use crate::errors::{Error, Result};
use crate::packing::{Bits, PackingRange, Provenance, RangePolicy, DEFAULT_BUFFER_FACTOR};
use crate::time::{Frequency, Timestamp};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chunking: ChunkingConfig,
    pub packing: PackingConfig,
    pub compression: Compression,
    pub time: TimeConfig,
    pub variables: VariablesConfig,
    pub missing_data: MissingDataConfig,

    /// Added to the archive's global attributes
    pub attrs: Attributes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkingConfig {
    pub access_pattern: AccessPattern,

    /// Falls back to the default when unset
    pub target_chunk_size_mb: Option<usize>,

    /// Chunk lengths replacing the recommended ones
    pub dims: ChunkPlan,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackingConfig {
    pub enabled: bool,
    pub bits: Bits,

    /// Manual `[min, max]` per variable
    pub ranges: BTreeMap<String, (f64, f64)>,

    pub buffer_factor: f64,
    pub on_range_exceeded: RangePolicy,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bits: Bits::default(),
            ranges: BTreeMap::new(),
            buffer_factor: DEFAULT_BUFFER_FACTOR,
            on_range_exceeded: RangePolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeConfig {
    /// Name of the time dimension and coordinate
    pub dim: String,

    /// Dimension new data is appended along. Must be the time dimension.
    pub append_dim: Option<String>,

    /// Extent of a template
    pub global_start: Option<Timestamp>,
    pub global_end: Option<Timestamp>,

    /// Inferred from the template when unset
    pub freq: Option<Frequency>,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            dim: "time".to_string(),
            append_dim: None,
            global_start: None,
            global_end: None,
            freq: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VariablesConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MissingDataConfig {
    pub check_vars: MissingCheck,
    pub retries_on_missing: u32,
    pub retry_delay_ms: u64,
}

impl Default for MissingDataConfig {
    fn default() -> Self {
        Self {
            check_vars: MissingCheck::default(),
            retries_on_missing: 0,
            retry_delay_ms: 100,
        }
    }
}

impl Config {
    /// Load and validate configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        log::debug!("loaded configuration from {}", path.display());

        Ok(config)
    }

    /// Check settings that can't be expressed in the types alone
    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_chunk_size_mb == Some(0) {
            return Err(Error::configuration("target chunk size must be positive"));
        }
        for (name, length) in self.chunking.dims.iter() {
            if length == 0 {
                return Err(Error::configuration(format!(
                    "chunk length for {name} must be positive"
                )));
            }
        }

        let buffer = self.packing.buffer_factor;
        if !buffer.is_finite() || buffer < 0.0 {
            return Err(Error::configuration(format!(
                "packing buffer factor must be a non-negative number, got {buffer}"
            )));
        }
        for (min, max) in self.packing.ranges.values() {
            PackingRange::new(*min, *max, Provenance::Manual)?;
        }

        if self.time.dim.is_empty() {
            return Err(Error::configuration("time dimension name is empty"));
        }
        if self.append_dim() != self.time.dim {
            return Err(Error::configuration(format!(
                "append dimension {} must be the time dimension {}",
                self.append_dim(),
                self.time.dim
            )));
        }
        if let (Some(start), Some(end)) = (self.time.global_start, self.time.global_end) {
            if end < start {
                return Err(Error::configuration(
                    "global_end comes before global_start",
                ));
            }
        }

        for name in &self.variables.include {
            if self.variables.exclude.contains(name) {
                return Err(Error::configuration(format!(
                    "variable {name} is both included and excluded"
                )));
            }
        }

        Ok(())
    }

    pub fn append_dim(&self) -> &str {
        self.time.append_dim.as_deref().unwrap_or(&self.time.dim)
    }

    pub fn target_chunk_bytes(&self) -> usize {
        match self.chunking.target_chunk_size_mb {
            Some(megabytes) => megabytes.saturating_mul(MIB),
            None => DEFAULT_TARGET_CHUNK_BYTES,
        }
    }

    pub fn advisor(&self) -> ChunkAdvisor {
        ChunkAdvisor::new(self.chunking.access_pattern, self.target_chunk_bytes())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.missing_data.retries_on_missing,
            Duration::from_millis(self.missing_data.retry_delay_ms),
        )
    }

    pub fn manual_range(&self, name: &str) -> Option<(f64, f64)> {
        self.packing.ranges.get(name).copied()
    }
}
