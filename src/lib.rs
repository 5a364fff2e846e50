//! A little virtual machine for a 16-bit word, 15-bit address architecture
//! with eight registers and a single operand stack.

pub mod memory;
pub mod processor;
pub mod watchdog;
