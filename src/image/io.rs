//! Byte order aware writing for ELF structures.
//!
//! Core objects are written for the target architecture, not the host, so every field goes
//! through [`write_at`] with an explicit [`Endian`]. Native words are 4 or 8 bytes depending on
//! the ELF class; [`write_word_at`] picks the width.
//!
//! All functions advance `offset` past the written value and return
//! [`crate::Error::OutOfBounds`] instead of writing past the end of the buffer.

use crate::{Error::OutOfBounds, Result};

/// Byte order of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

/// Integer types that can be written in either byte order.
pub trait ElfIO: Sized + Copy {
    /// The fixed-size byte array of this type.
    type Bytes: AsRef<[u8]>;

    /// Little-endian bytes of the value
    fn to_le_bytes(self) -> Self::Bytes;
    /// Big-endian bytes of the value
    fn to_be_bytes(self) -> Self::Bytes;
}

macro_rules! impl_elf_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl ElfIO for $ty {
                type Bytes = [u8; $len];

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }

                fn to_be_bytes(self) -> Self::Bytes {
                    <$ty>::to_be_bytes(self)
                }
            }
        )*
    };
}

impl_elf_io!(u8 => 1, u16 => 2, u32 => 4, u64 => 8);

fn put(data: &mut [u8], offset: &mut usize, bytes: &[u8]) -> Result<()> {
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    let target = data.get_mut(*offset..end).ok_or(OutOfBounds)?;

    target.copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

/// Writes `value` little-endian at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: ElfIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    put(data, offset, value.to_le_bytes().as_ref())
}

/// Writes `value` big-endian at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_be_at<T: ElfIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    put(data, offset, value.to_be_bytes().as_ref())
}

/// Writes `value` at `offset` in the given byte order.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_at<T: ElfIO>(data: &mut [u8], offset: &mut usize, value: T, endian: Endian) -> Result<()> {
    match endian {
        Endian::Little => write_le_at(data, offset, value),
        Endian::Big => write_be_at(data, offset, value),
    }
}

/// Writes a native word: 8 bytes if `is_64bit`, otherwise 4 bytes.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the word does not fit, or if `value` does not fit
/// into 32 bits on a 32-bit target.
pub fn write_word_at(
    data: &mut [u8],
    offset: &mut usize,
    value: u64,
    is_64bit: bool,
    endian: Endian,
) -> Result<()> {
    if is_64bit {
        write_at(data, offset, value, endian)
    } else {
        let value = u32::try_from(value).map_err(|_| OutOfBounds)?;
        write_at(data, offset, value, endian)
    }
}
