use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use hindcast::{Dataset, Mapper};
use hindcast_fs::FsMapper;

pub(crate) fn load_dataset(path: &Path) -> Result<Dataset> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let dataset = Dataset::from_reader(BufReader::new(file))
        .with_context(|| format!("reading dataset {}", path.display()))?;
    log::info!(
        "loaded {} with {} variables",
        path.display(),
        dataset.variables().len()
    );

    Ok(dataset)
}

pub(crate) fn open_mapper(path: &Path) -> Result<Arc<dyn Mapper>> {
    let mapper = FsMapper::new(path).with_context(|| format!("opening {}", path.display()))?;

    Ok(Arc::new(mapper))
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;

    Ok(())
}
