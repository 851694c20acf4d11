use std::io;

use crate::extio::{ExtendedRead, ExtendedWrite};

/// A fixed length sequence of bits, most significant bit first within each byte.
///
/// Used by the chunk codec to record which cells hold a value, for encodings that have no room
/// for a missing value marker of their own.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Bitmap {
    length: usize,
    bytes: Vec<u8>,
}

impl Bitmap {
    pub(crate) fn new(length: usize) -> Self {
        Self {
            length,
            bytes: vec![0; (length + 7) / 8],
        }
    }

    pub(crate) fn from_bits(bits: impl IntoIterator<Item = bool>) -> Self {
        let mut bytes = vec![];
        let mut length = 0;
        for bit in bits {
            if length % 8 == 0 {
                bytes.push(0);
            }
            if bit {
                bytes[length / 8] |= 0x80 >> (length % 8);
            }
            length += 1;
        }

        Self { length, bytes }
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        if index >= self.length {
            panic!(
                "Out of bounds: index {index} is out of bounds for bitmap with length {}",
                self.length
            );
        }

        self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub(crate) fn write_to(&self, stream: &mut impl io::Write) -> io::Result<()> {
        stream.write_u32(self.length as u32)?;
        stream.write_all(&self.bytes)
    }

    pub(crate) fn read_from(stream: &mut impl io::Read) -> io::Result<Self> {
        let length = stream.read_u32()? as usize;
        let mut bitmap = Self::new(length);
        stream.read_exact(&mut bitmap.bytes)?;

        Ok(bitmap)
    }
}
