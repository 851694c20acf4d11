//! A concrete implementation of the `hindcast::Mapper` interface for a local filesystem.
//!
//! Each object is a file under a root directory, at the path given by its key. Chunk writes go
//! straight to their final path. Metadata commits are written to a temporary file in the same
//! directory and renamed into place, so concurrent readers never see a partial document.
//!
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct FsMapper {
    root: PathBuf,
    temp_counter: AtomicUsize,
}

impl FsMapper {
    /// Use `root` as the archive directory, creating it if needed
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            temp_counter: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object key {key:?}"),
            ));
        }

        Ok(self.root.join(relative))
    }

    fn create(&self, path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        File::create(path)
    }
}

impl hindcast::Mapper for FsMapper {
    /// Obtain an output stream for writing an object to the store.
    ///
    /// This implementation writes directly to the object's file, so readers may observe a
    /// partially written chunk until `finish` is called.
    ///
    fn store(&self, key: &str) -> io::Result<Box<dyn hindcast::StoreWrite + '_>> {
        let path = self.path_of(key)?;
        let file = self.create(&path)?;

        Ok(Box::new(FsStoreWrite {
            stream: BufWriter::new(file),
            rename: None,
        }))
    }

    /// Same as `store` but writes to a temporary file which replaces the object on `finish`.
    ///
    fn commit(&self, key: &str) -> io::Result<Box<dyn hindcast::StoreWrite + '_>> {
        let path = self.path_of(key)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let counter = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_file_name(format!(".{name}.{}.{counter}.tmp", process::id()));
        let file = self.create(&temp)?;

        Ok(Box::new(FsStoreWrite {
            stream: BufWriter::new(file),
            rename: Some((temp, path)),
        }))
    }

    /// Obtain an input stream for reading an object from the store.
    ///
    /// Returns `Option::None` if the object's file doesn't exist.
    ///
    fn load(&self, key: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        let path = self.path_of(key)?;
        match File::open(path) {
            Ok(file) => Ok(Some(Box::new(io::BufReader::new(file)))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        let path = self.path_of(key)?;
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A writer for one object file
///
/// When `rename` is set, data goes to a temporary file which is moved to its final path when
/// `FsStoreWrite::finish` is called.
///
struct FsStoreWrite {
    stream: BufWriter<File>,
    rename: Option<(PathBuf, PathBuf)>,
}

impl Write for FsStoreWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl hindcast::StoreWrite for FsStoreWrite {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let FsStoreWrite { stream, rename } = *self;
        let file = stream.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        if let Some((temp, path)) = rename {
            fs::rename(&temp, &path)?;
            log::debug!("committed {}", path.display());
        }

        Ok(())
    }
}
