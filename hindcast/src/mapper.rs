use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::mem;

use parking_lot::Mutex;

/// A trait for storing and loading objects in an arbitrary key/value store.
///
/// Keys are `/` separated paths such as `temperature/0.3.1`. Chunk objects are written with
/// `store`; archive metadata is written with `commit`, which must publish the object atomically
/// since many independent processes read it while one of them may be replacing it.
///
pub trait Mapper: Send + Sync {
    /// Obtain an output stream for writing an object to the store.
    ///
    /// The object is not guaranteed to be visible to readers until `finish` is called on the
    /// returned `StoreWrite` object.
    ///
    fn store(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>>;

    /// Same as `store`, but readers must observe either the previous object or the complete new
    /// one, never a partial write.
    ///
    fn commit(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>>;

    /// Obtain an input stream for reading an object from the store.
    ///
    /// Should return `Option::None` if given `key` isn't in the store.
    ///
    fn load(&self, key: &str) -> io::Result<Option<Box<dyn Read + '_>>>;

    /// Get the size, in bytes, of object identified by `key`
    ///
    fn size_of(&self, key: &str) -> io::Result<Option<u64>>;
}

/// An output stream for a single object.
///
pub trait StoreWrite: Write {
    /// Close the output stream and publish the newly written object.
    ///
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// An implementation of `Mapper` that keeps objects in RAM.
///
/// Objects become visible when their `StoreWrite` is finished, so `store` and `commit` behave the
/// same.
///
#[derive(Default)]
pub struct MemoryMapper {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all stored objects, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();

        keys
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().remove(key)
    }
}

impl Mapper for MemoryMapper {
    fn store(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        Ok(Box::new(MemoryStoreWrite {
            mapper: self,
            key: key.to_string(),
            buffer: vec![],
        }))
    }

    fn commit(&self, key: &str) -> io::Result<Box<dyn StoreWrite + '_>> {
        self.store(key)
    }

    fn load(&self, key: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        let objects = self.objects.lock();
        Ok(objects
            .get(key)
            .map(|object| Box::new(Cursor::new(object.clone())) as Box<dyn Read>))
    }

    fn size_of(&self, key: &str) -> io::Result<Option<u64>> {
        let objects = self.objects.lock();
        Ok(objects.get(key).map(|object| object.len() as u64))
    }
}

struct MemoryStoreWrite<'a> {
    mapper: &'a MemoryMapper,
    key: String,
    buffer: Vec<u8>,
}

impl<'a> Write for MemoryStoreWrite<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> StoreWrite for MemoryStoreWrite<'a> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let object = mem::take(&mut self.buffer);
        self.mapper.objects.lock().insert(self.key.clone(), object);

        Ok(())
    }
}
