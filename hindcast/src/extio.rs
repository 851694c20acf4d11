//! Extend Read and Write with some convenience methods for binary i/o
//!
use std::io;

use paste::paste;

macro_rules! extended_io {
    ($($type:ident),*) => {
        paste! {
            pub(crate) trait ExtendedRead: io::Read {
                /// Read a byte from a stream
                fn read_byte(&mut self) -> io::Result<u8> {
                    let mut buffer = [0; 1];
                    self.read_exact(&mut buffer)?;

                    Ok(buffer[0])
                }

                $(
                    #[doc = "Read a Big Endian encoded `" $type "` from a stream"]
                    fn [<read_ $type>](&mut self) -> io::Result<$type> {
                        let mut buffer = [0; std::mem::size_of::<$type>()];
                        self.read_exact(&mut buffer)?;

                        Ok($type::from_be_bytes(buffer))
                    }
                )*
            }

            impl<R: io::Read + ?Sized> ExtendedRead for R {}

            pub(crate) trait ExtendedWrite: io::Write {
                /// Write a byte to a stream
                fn write_byte(&mut self, byte: u8) -> io::Result<()> {
                    self.write_all(&[byte])
                }

                $(
                    #[doc = "Write a Big Endian encoded `" $type "` to a stream"]
                    fn [<write_ $type>](&mut self, word: $type) -> io::Result<()> {
                        self.write_all(&word.to_be_bytes())
                    }
                )*
            }

            impl<W: io::Write + ?Sized> ExtendedWrite for W {}
        }
    };
}

extended_io!(i8, i16, i32, i64, u16, u32, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_all_of_it() -> io::Result<()> {
        let mut buffer: Vec<u8> = Vec::new();
        buffer.write_byte(42)?;
        buffer.write_u16(41968)?;
        buffer.write_u32(31441968)?;
        buffer.write_i32(-31441968)?;
        buffer.write_i8(-7)?;
        buffer.write_i64(-1 << 40)?;
        buffer.write_f32(3.141592)?;
        buffer.write_f64(6.283184)?;

        let mut buffer = Cursor::new(buffer);
        assert_eq!(buffer.read_byte()?, 42);
        assert_eq!(buffer.read_u16()?, 41968);
        assert_eq!(buffer.read_u32()?, 31441968);
        assert_eq!(buffer.read_i32()?, -31441968);
        assert_eq!(buffer.read_i8()?, -7);
        assert_eq!(buffer.read_i64()?, -1 << 40);
        assert_eq!(buffer.read_f32()?, 3.141592);
        assert_eq!(buffer.read_f64()?, 6.283184);

        Ok(())
    }
}
