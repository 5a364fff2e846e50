//! Loads program images into memory.
//!
//! An image is a stream of little-endian 16-bit words; each byte pair becomes
//! one word, copied verbatim into the low addresses. Addresses beyond the
//! image are filled according to a [`FillPolicy`].

use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use super::{Memory, Word};

/// How addresses beyond the loaded image are initialized.
///
/// The reference implementation filled them with an incrementing sequence
/// rather than zero; [`FillPolicy::Ascending`] reproduces that, but the
/// default is zero-fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Every address beyond the image holds 0.
    Zero,
    /// Addresses beyond the image hold 0, 1, 2, … counted from the first
    /// unfilled address.
    Ascending,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self::Zero
    }
}

/// Error loading a program image.
#[derive(Debug)]
pub enum ImageError {
    /// The byte stream does not split into whole little-endian words.
    OddLength { len: usize },
    /// The image holds more words than the memory has addresses.
    TooLarge { words: usize, capacity: usize },
    /// Reading the image from disk failed.
    Io(io::Error),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::OddLength { len } => {
                write!(f, "image has odd byte length `{}`", len)
            }
            ImageError::TooLarge { words, capacity } => {
                write!(
                    f,
                    "image holds {} words but memory has only {} addresses",
                    words, capacity
                )
            }
            ImageError::Io(err) => write!(f, "failed to read image: {}", err),
        }
    }
}

impl error::Error for ImageError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ImageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        ImageError::Io(err)
    }
}

impl<const S: usize> Memory<S> {
    /// Decodes a little-endian program image into a fresh memory.
    pub fn from_image(bytes: &[u8], fill: FillPolicy) -> Result<Self, ImageError> {
        if bytes.len() % 2 != 0 {
            return Err(ImageError::OddLength { len: bytes.len() });
        }
        let words = bytes.len() / 2;
        if words > S {
            return Err(ImageError::TooLarge { words, capacity: S });
        }

        let mut memory = Self::default();
        for (address, pair) in bytes.chunks_exact(2).enumerate() {
            memory.data[address] = Word::from_le_bytes([pair[0], pair[1]]);
        }
        if let FillPolicy::Ascending = fill {
            for address in words..S {
                memory.data[address] = (address - words) as Word;
            }
        }

        log::debug!("loaded image of {} words", words);
        Ok(memory)
    }

    /// Reads a program image from `path` and decodes it.
    pub fn from_file<P: AsRef<Path>>(path: P, fill: FillPolicy) -> Result<Self, ImageError> {
        let bytes = fs::read(path)?;
        Self::from_image(&bytes, fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::Result;

    #[test]
    fn test_little_endian_decode() -> Result<()> {
        let mem: Memory<4> = Memory::from_image(&[0x34, 0x12, 0x01, 0x80], FillPolicy::Zero)?;

        assert_eq!(mem.data, [0x1234, 0x8001, 0, 0]);

        Ok(())
    }

    #[test]
    fn test_odd_length_rejected() -> Result<()> {
        let res: Result<Memory<4>, _> = Memory::from_image(&[0x01, 0x02, 0x03], FillPolicy::Zero);

        assert!(matches!(res, Err(ImageError::OddLength { len: 3 })));

        Ok(())
    }

    #[test]
    fn test_oversized_image_rejected() -> Result<()> {
        let res: Result<Memory<2>, _> =
            Memory::from_image(&[0; 6], FillPolicy::Zero);

        assert!(matches!(
            res,
            Err(ImageError::TooLarge {
                words: 3,
                capacity: 2
            })
        ));

        Ok(())
    }

    #[test]
    fn test_ascending_fill() -> Result<()> {
        let mem: Memory<6> = Memory::from_image(&[0x07, 0x00, 0x09, 0x00], FillPolicy::Ascending)?;

        assert_eq!(mem.data, [7, 9, 0, 1, 2, 3]);

        Ok(())
    }

    #[test]
    fn test_zero_fill_is_default() -> Result<()> {
        assert_eq!(FillPolicy::default(), FillPolicy::Zero);

        let mem: Memory<4> = Memory::from_image(&[0x07, 0x00], FillPolicy::default())?;
        assert_eq!(mem.data, [7, 0, 0, 0]);

        Ok(())
    }
}
