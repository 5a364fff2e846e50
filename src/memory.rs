pub mod image;

pub use image::{FillPolicy, ImageError};

/// A 16-bit storage cell. Only `[0, 32775]` is meaningful as an operand:
/// `[0, 32767]` is a literal value, `[32768, 32775]` names a register.
pub type Word = u16;

/// Modulus for all 15-bit arithmetic.
pub const MODULUS: Word = 32768;
/// First word value that names a register instead of a literal.
pub const REG_BASE: Word = 32768;
/// Number of general purpose registers.
pub const NUM_REGS: usize = 8;
/// Highest word that is a valid operand (register 7).
pub const MAX_OPERAND: Word = REG_BASE + NUM_REGS as Word - 1;
/// Number of addressable words.
pub const MEM_WORDS: usize = MODULUS as usize;

/// Default memory
pub type StdMem = Memory<MEM_WORDS>;

/// Builds the operand word naming register `index`.
pub const fn reg(index: Word) -> Word {
    REG_BASE + index
}

/// Emulates the word-addressed memory of the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Memory<const S: usize> {
    /// The actual data of the memory
    pub data: [Word; S],
}

impl<const S: usize> Default for Memory<S> {
    /// Initializes the memory
    fn default() -> Self {
        Memory { data: [0; S] }
    }
}

impl<const S: usize> Memory<S> {
    /// Reads a word from the memory
    pub fn read(&self, address: Word) -> Word {
        self.data[address as usize]
    }

    /// Writes a word to the memory
    pub fn write(&mut self, address: Word, value: Word) {
        self.data[address as usize] = value;
    }

    /// Writes an array of words to the memory
    pub fn write_array(&mut self, address: Word, data: &[Word]) {
        self.data[address as usize..address as usize + data.len()].copy_from_slice(data);
    }
}

/// Writes a block of instruction and operand words directly into the memory
#[macro_export]
macro_rules! write_words {
    ( $mem:ident : $pos:expr => $( $word:expr ),+ $(,)? ) => {
        $mem.write_array($pos, &[
            $(
                $word as $crate::memory::Word,
            )+
        ]);
    };
}

#[cfg(test)]
mod tests {
    use crate::processor::Instruction;

    use super::*;
    use color_eyre::eyre::Result;

    #[test]
    fn test_read_write() -> Result<()> {
        let mut mem = StdMem::default();
        mem.write(0x44, 12345);
        assert_eq!(mem.data[0x44], 12345);
        assert_eq!(mem.read(0x44), 12345);

        Ok(())
    }

    #[test]
    fn test_write_array() -> Result<()> {
        let mut mem = StdMem::default();
        mem.write_array(0x44, &[0x12, 0x34, 0x56]);
        assert_eq!(mem.data[0x44], 0x12);
        assert_eq!(mem.data[0x45], 0x34);
        assert_eq!(mem.data[0x46], 0x56);

        Ok(())
    }

    #[test]
    fn test_reg_helper() -> Result<()> {
        assert_eq!(reg(0), 32768);
        assert_eq!(reg(7), MAX_OPERAND);

        Ok(())
    }

    #[test]
    fn test_image_types_reexported() -> Result<()> {
        let mem = StdMem::from_image(&[6, 0], FillPolicy::default())?;
        assert_eq!(mem.read(0), 6);

        Ok(())
    }

    #[test]
    fn test_write_words() -> Result<()> {
        let mut mem = StdMem::default();

        mem.write_array(
            0,
            &[
                Instruction::SET as Word,
                reg(0),
                5,
                Instruction::HALT as Word,
            ],
        );

        let mut mem2 = StdMem::default();
        use crate::processor::Instruction::*;
        write_words!(mem2 : 0 => SET, reg(0), 5, HALT);

        assert_eq!(mem, mem2);

        Ok(())
    }
}
