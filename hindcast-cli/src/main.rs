//! Command line front end: convert, append, create-template, write-region and analyze.
//!
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use hindcast::{
    AccessPattern, ArchiveHandle, ArchiveRegion, Attributes, Bits, ChunkPlan, Compression, Config,
    Converter, Frequency, MissingCheck, RangePolicy, Timestamp,
};

mod helpers;

use helpers::{load_dataset, open_mapper, print_json};

#[derive(Parser, Debug)]
#[command(name = "hindcast")]
#[command(about = "Build chunked, optionally packed, archives of gridded time series")]
struct Cli {
    /// Log more: -v for progress, -vv for chunk level detail. RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a dataset into a new archive
    Convert {
        input: PathBuf,
        output: PathBuf,

        #[command(flatten)]
        options: Options,
    },

    /// Add later instants of a dataset to an existing archive
    Append {
        input: PathBuf,
        archive: PathBuf,

        #[command(flatten)]
        options: Options,
    },

    /// Create an empty archive spanning a global time range
    CreateTemplate {
        template: PathBuf,
        output: PathBuf,

        #[arg(long)]
        global_start: Option<Timestamp>,

        #[arg(long)]
        global_end: Option<Timestamp>,

        /// Time step such as 1D or 6H. Inferred from the template when omitted.
        #[arg(long)]
        freq: Option<Frequency>,

        #[command(flatten)]
        options: Options,
    },

    /// Write a dataset into its region of an existing archive
    WriteRegion {
        input: PathBuf,
        archive: PathBuf,

        /// Region such as time=0:100. Located from the time coordinate when omitted.
        #[arg(long)]
        region: Option<ArchiveRegion>,

        #[command(flatten)]
        options: Options,
    },

    /// Report chunking and packing recommendations for a dataset, without writing anything
    Analyze {
        input: PathBuf,

        #[command(flatten)]
        options: Options,
    },
}

/// Settings shared by every command. Flags override the configuration file.
#[derive(Args, Debug)]
struct Options {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chunk lengths such as time:100,lat:50
    #[arg(long)]
    chunking: Option<ChunkPlan>,

    #[arg(long)]
    access_pattern: Option<AccessPattern>,

    #[arg(long, env = "HINDCAST_TARGET_CHUNK_MB")]
    target_chunk_size_mb: Option<usize>,

    /// none, zstd or zstd:<level>
    #[arg(long)]
    compression: Option<Compression>,

    /// Pack floating point variables into integers
    #[arg(long)]
    packing: bool,

    #[arg(long)]
    packing_bits: Option<u8>,

    /// warn, error or ignore
    #[arg(long)]
    on_range_exceeded: Option<RangePolicy>,

    /// Only convert these variables
    #[arg(long, value_delimiter = ',')]
    variables: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    drop_variables: Vec<String>,

    /// Extra global attributes, as a JSON object
    #[arg(long)]
    attrs: Option<String>,

    #[arg(long)]
    time_dim: Option<String>,

    /// all, none or a comma separated list of variables
    #[arg(long)]
    check_vars: Option<MissingCheck>,

    #[arg(long)]
    retries_on_missing: Option<u32>,

    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

impl Options {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(plan) = &self.chunking {
            for (name, length) in plan.iter() {
                config.chunking.dims.insert(name, length);
            }
        }
        if let Some(pattern) = self.access_pattern {
            config.chunking.access_pattern = pattern;
        }
        if let Some(megabytes) = self.target_chunk_size_mb {
            config.chunking.target_chunk_size_mb = Some(megabytes);
        }
        if let Some(compression) = self.compression {
            config.compression = compression;
        }
        if self.packing {
            config.packing.enabled = true;
        }
        if let Some(bits) = self.packing_bits {
            config.packing.bits = Bits::try_from(bits)?;
        }
        if let Some(policy) = self.on_range_exceeded {
            config.packing.on_range_exceeded = policy;
        }
        if !self.variables.is_empty() {
            config.variables.include = self.variables.clone();
        }
        if !self.drop_variables.is_empty() {
            config.variables.exclude = self.drop_variables.clone();
        }
        if let Some(attrs) = &self.attrs {
            let attrs: Attributes =
                serde_json::from_str(attrs).context("--attrs must be a JSON object")?;
            config.attrs.extend(attrs);
        }
        if let Some(dim) = &self.time_dim {
            config.time.dim = dim.clone();
        }
        if let Some(check) = &self.check_vars {
            config.missing_data.check_vars = check.clone();
        }
        if let Some(retries) = self.retries_on_missing {
            config.missing_data.retries_on_missing = retries;
        }
        if let Some(delay) = self.retry_delay_ms {
            config.missing_data.retry_delay_ms = delay;
        }

        config.validate()?;

        Ok(config)
    }

    fn converter(&self) -> Result<Converter> {
        Ok(Converter::new(self.config()?)?)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Convert {
            input,
            output,
            options,
        } => {
            let converter = options.converter()?;
            let source = load_dataset(&input)?;
            let (_, outcome) = converter
                .convert(source, open_mapper(&output)?)
                .with_context(|| {
                    format!("converting {} to {}", input.display(), output.display())
                })?;
            print_json(&outcome)
        }
        Command::Append {
            input,
            archive,
            options,
        } => {
            let converter = options.converter()?;
            let source = load_dataset(&input)?;
            let outcome = converter
                .append(source, open_mapper(&archive)?)
                .with_context(|| {
                    format!("appending {} to {}", input.display(), archive.display())
                })?;
            print_json(&outcome)
        }
        Command::CreateTemplate {
            template,
            output,
            global_start,
            global_end,
            freq,
            options,
        } => {
            let converter = options.converter()?;
            let time = &converter.config().time;
            let global_start = global_start
                .or(time.global_start)
                .context("--global-start is required")?;
            let global_end = global_end
                .or(time.global_end)
                .context("--global-end is required")?;
            let freq = freq.or(time.freq);

            let source = load_dataset(&template)?;
            let handle = converter
                .create_template(source, open_mapper(&output)?, global_start.0, global_end.0, freq)
                .with_context(|| format!("creating template at {}", output.display()))?;
            print_json(handle.metadata())
        }
        Command::WriteRegion {
            input,
            archive,
            region,
            options,
        } => {
            let converter = options.converter()?;
            let source = load_dataset(&input)?;
            let handle = ArchiveHandle::open(open_mapper(&archive)?)
                .with_context(|| format!("opening archive {}", archive.display()))?;
            let outcome = converter
                .write_region(source, &handle, region.as_ref())
                .with_context(|| format!("writing {} to {}", input.display(), archive.display()))?;
            print_json(&outcome)
        }
        Command::Analyze { input, options } => {
            let converter = options.converter()?;
            let analysis = converter.analyze(load_dataset(&input)?)?;
            print_json(&analysis)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    run(cli.command)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use hindcast::MIB;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["hindcast", "analyze", "input.json"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Command::Analyze { options, .. } => options,
            command => panic!("unexpected command {command:?}"),
        }
    }

    const DATASET: &str = r#"{
        "coords": {
            "time": ["2020-01-01", "2020-01-02", "2020-01-03", "2020-01-04"],
            "lat": [0.0, 1.0]
        },
        "data_vars": {
            "tp": {"dims": ["time", "lat"], "data": [[1, 2], [3, null], [5, 6], [7, 8]]},
            "orog": {"dims": ["lat"], "data": [100, 200]}
        }
    }"#;

    #[test]
    fn flags_override_config() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(
            &mut file,
            br#"{"packing": {"bits": 8}, "chunking": {"dims": {"time": 10}}}"#,
        )?;
        let path = file.path().to_string_lossy().into_owned();

        let config = options(&[
            "--config",
            &path,
            "--chunking",
            "lat:5",
            "--packing",
            "--compression",
            "zstd:4",
            "--access-pattern",
            "spatial",
            "--target-chunk-size-mb",
            "8",
            "--drop-variables",
            "orog,lsm",
            "--attrs",
            r#"{"source": "test"}"#,
            "--check-vars",
            "tp",
            "--retries-on-missing",
            "2",
        ])
        .config()?;

        assert!(config.packing.enabled);
        assert_eq!(config.packing.bits, Bits::Eight);
        assert_eq!(config.chunking.dims.get("time"), Some(10));
        assert_eq!(config.chunking.dims.get("lat"), Some(5));
        assert_eq!(config.compression, Compression::Zstd { level: 4 });
        assert_eq!(config.chunking.access_pattern, AccessPattern::Spatial);
        assert_eq!(config.target_chunk_bytes(), 8 * MIB);
        assert_eq!(config.variables.exclude, vec!["orog", "lsm"]);
        assert_eq!(config.attrs["source"], "test");
        assert_eq!(
            config.missing_data.check_vars,
            MissingCheck::Only(vec!["tp".to_string()])
        );
        assert_eq!(config.missing_data.retries_on_missing, 2);

        Ok(())
    }

    #[test]
    fn bad_flags() {
        assert!(options(&["--packing-bits", "12"]).config().is_err());
        assert!(options(&["--attrs", "[1, 2]"]).config().is_err());
        assert!(Cli::try_parse_from(["hindcast", "analyze", "x", "--compression", "lz4"]).is_err());
        assert!(Cli::try_parse_from(["hindcast", "analyze", "x", "--chunking", "lat"]).is_err());
    }

    #[test]
    fn template_then_write_region() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.json");
        fs::write(&input, DATASET)?;
        let input = input.to_str().expect("utf-8 path");
        let archive = dir.path().join("archive");
        let archive = archive.to_str().expect("utf-8 path");

        let cli = Cli::try_parse_from([
            "hindcast",
            "create-template",
            input,
            archive,
            "--global-start",
            "2020-01-01",
            "--global-end",
            "2020-01-08",
            "--chunking",
            "time:4",
        ])?;
        run(cli.command)?;

        let cli = Cli::try_parse_from([
            "hindcast",
            "write-region",
            input,
            archive,
            "--chunking",
            "time:4",
        ])?;
        run(cli.command)?;

        let handle = ArchiveHandle::open(open_mapper(Path::new(archive))?)?;
        assert_eq!(handle.metadata().time.len(), 8);
        let mut region = handle.metadata().full_region();
        region.insert("time", 0..4);
        let tp: Vec<f64> = handle.read_variable("tp", &region)?.iter().copied().collect();
        assert_eq!(tp[..3], [1.0, 2.0, 3.0]);
        assert!(tp[3].is_nan());

        Ok(())
    }

    #[test]
    fn create_template_needs_extent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.json");
        fs::write(&input, DATASET)?;
        let archive = dir.path().join("archive");

        let cli = Cli::try_parse_from([
            "hindcast",
            "create-template",
            input.to_str().expect("utf-8 path"),
            archive.to_str().expect("utf-8 path"),
        ])?;
        assert!(run(cli.command).is_err());

        Ok(())
    }
}
