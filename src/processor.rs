use std::char;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::error;
use std::fmt;

use crate::memory::{Memory, Word, MAX_OPERAND, MODULUS, NUM_REGS, REG_BASE};
use crate::watchdog::{Observation, StateSetWatchdog, Trip, Watchdog};
use log::*;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// The eight general purpose registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Registers(pub [Word; NUM_REGS]);

impl Registers {
    pub fn get(&self, index: usize) -> Word {
        self.0[index]
    }

    pub fn set(&mut self, index: usize, value: Word) {
        self.0[index] = value;
    }
}

/// The operand stack, also used for call/return addresses
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stack(Vec<Word>);

impl Stack {
    pub fn push(&mut self, value: Word) {
        self.0.push(value);
    }

    /// Removes and returns the most recently pushed word. `None` on an
    /// empty stack; the caller decides whether that halts or faults.
    pub fn pop(&mut self) -> Option<Word> {
        self.0.pop()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Word] {
        &self.0
    }
}

/// An unrecoverable error condition of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The fetched opcode has no dispatch entry and the engine is configured
    /// to fault on undefined opcodes.
    UndefinedOpcode { opcode: Word, pc: Word },
    /// `POP` on an empty stack.
    StackUnderflow { pc: Word },
    /// `MOD` with a zero divisor.
    DivisionByZero { pc: Word },
    /// A fetched operand word lies outside `[0, 32775]`.
    InvalidOperand { word: Word, pc: Word },
    /// The non-termination watchdog decided the machine is stuck.
    WatchdogTripped(Trip),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::UndefinedOpcode { opcode, pc } => {
                write!(f, "undefined opcode `{}` at address {}", opcode, pc)
            }
            Fault::StackUnderflow { pc } => {
                write!(f, "pop from an empty stack at address {}", pc)
            }
            Fault::DivisionByZero { pc } => {
                write!(f, "modulo by zero at address {}", pc)
            }
            Fault::InvalidOperand { word, pc } => {
                write!(f, "invalid operand word `{}` at address {}", word, pc)
            }
            Fault::WatchdogTripped(trip) => {
                write!(
                    f,
                    "watchdog tripped: state signature {} unchanged for {} steps",
                    trip.signature, trip.steps
                )
            }
        }
    }
}

impl error::Error for Fault {}

/// Why a call to [`Processor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The program executed `HALT` or returned on an empty stack.
    Halted,
    /// An unrecoverable fault; the machine will not run further.
    Faulted(Fault),
    /// The program executed `IN` with no buffered input. Not terminal:
    /// feed input with [`Processor::feed_input`] and call `run` again to
    /// resume at the same program counter.
    AwaitingInput,
}

/// Run state of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Running,
    Halted,
    Faulted(Fault),
}

/// What to do when the fetched opcode has no dispatch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedOpcodePolicy {
    /// Log the opcode and step over it. This can mask a corrupted image;
    /// it is the default because some reference programs carry words the
    /// instruction set never defined.
    Skip,
    /// Fault the run with [`Fault::UndefinedOpcode`].
    Fault,
}

impl Default for UndefinedOpcodePolicy {
    fn default() -> Self {
        Self::Skip
    }
}

/// Outcome of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted,
    AwaitingInput,
}

macro_rules! instructions {
    ( $( $( #[doc = $doc:expr] )+ $name:ident = $opcode:literal / $arity:literal , )+ ) => {
        /// Defines the instruction set: opcode ids 0 through 21.
        /// Each entry carries the number of operand words following the
        /// opcode word.
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        #[derive(TryFromPrimitive, IntoPrimitive)]
        pub enum Instruction {
            $(
                $( #[doc = $doc] )+
                $name = $opcode,
            )+
        }

        impl Instruction {
            pub const ALL: &'static [Self] = &[
                $( Self::$name , )+
            ];

            /// Number of operand words following the opcode word
            pub fn arity(&self) -> Word {
                match self {
                    $( Self::$name => $arity , )+
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name) , )+
                }
            }
        }

        impl ::std::fmt::Display for Instruction {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    $( Self::$name => f.write_str(stringify!($name)) , )+
                }
            }
        }
    }
}

instructions! {
    /// Stop execution
    HALT = 0 / 0,
    /// dest(a) = value(b)
    SET = 1 / 2,
    /// Push value(a) onto the stack
    PUSH = 2 / 1,
    /// dest(a) = stack.pop(); faults on an empty stack
    POP = 3 / 1,
    /// dest(a) = 1 if value(b) == value(c), else 0
    EQ = 4 / 3,
    /// dest(a) = 1 if value(b) > value(c), else 0
    GT = 5 / 3,
    /// pc = value(a)
    JMP = 6 / 1,
    /// If value(a) != 0, pc = value(b)
    JT = 7 / 2,
    /// If value(a) == 0, pc = value(b)
    JF = 8 / 2,
    /// dest(a) = (value(b) + value(c)) mod 32768
    ADD = 9 / 3,
    /// dest(a) = (value(b) * value(c)) mod 32768
    MULT = 10 / 3,
    /// dest(a) = value(b) mod value(c); faults if value(c) == 0
    MOD = 11 / 3,
    /// dest(a) = value(b) & value(c)
    AND = 12 / 3,
    /// dest(a) = value(b) | value(c)
    OR = 13 / 3,
    /// dest(a) = 15-bit complement of value(b)
    NOT = 14 / 2,
    /// dest(a) = memory[value(b)]
    RMEM = 15 / 2,
    /// memory[value(a)] = value(b)
    WMEM = 16 / 2,
    /// Push the address of the next instruction, pc = value(a)
    CALL = 17 / 1,
    /// Pop an address and jump to it; halts on an empty stack
    RET = 18 / 0,
    /// Write the character with code point value(a) to the output stream
    OUT = 19 / 1,
    /// Read one character of input into dest(a); suspends until input
    /// is available
    IN = 20 / 1,
    /// No effect
    NOOP = 21 / 0,
}

/// Emulates the CPU: program counter, registers, stack and run state.
///
/// The processor owns everything except memory, which is passed to
/// [`Processor::execute`] and [`Processor::run`] the way the program
/// image loader produced it.
#[derive(Debug)]
pub struct Processor {
    /// Program counter
    pub pc: Word,
    pub registers: Registers,
    pub stack: Stack,
    pub state: State,
    undefined_policy: UndefinedOpcodePolicy,
    watchdog: Box<dyn Watchdog>,
    input: VecDeque<char>,
    output: String,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    /// Initializes a new CPU with the program counter at 0, the default
    /// watchdog and the default undefined-opcode policy.
    pub fn new() -> Self {
        Self {
            pc: 0,
            registers: Registers::default(),
            stack: Stack::default(),
            state: State::Running,
            undefined_policy: UndefinedOpcodePolicy::default(),
            watchdog: Box::new(StateSetWatchdog::default()),
            input: VecDeque::new(),
            output: String::new(),
        }
    }

    /// Replaces the non-termination watchdog.
    pub fn with_watchdog(mut self, watchdog: Box<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Replaces the undefined-opcode policy.
    pub fn with_undefined_policy(mut self, policy: UndefinedOpcodePolicy) -> Self {
        self.undefined_policy = policy;
        self
    }

    /// Buffers characters for the `IN` instruction to consume.
    pub fn feed_input(&mut self, text: &str) {
        self.input.extend(text.chars());
    }

    /// Drains everything `OUT` has written since the last call.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Address of operand `index` of the instruction at the program counter.
    fn operand(&self, index: Word) -> Word {
        (self.pc + 1 + index) % MODULUS
    }

    /// Reads the word at `address` without resolving register references.
    /// Used for operands that name a destination.
    fn fetch_raw<const S: usize>(&self, memory: &Memory<S>, address: Word) -> Word {
        memory.read(address)
    }

    /// Reads the word at `address` and substitutes the register value if it
    /// is a register reference. Used for operands that name a value.
    fn fetch_value<const S: usize>(
        &self,
        memory: &Memory<S>,
        address: Word,
    ) -> Result<Word, Fault> {
        self.resolve(memory.read(address))
    }

    fn resolve(&self, raw: Word) -> Result<Word, Fault> {
        if raw < REG_BASE {
            Ok(raw)
        } else if raw <= MAX_OPERAND {
            Ok(self.registers.get((raw - REG_BASE) as usize))
        } else {
            Err(Fault::InvalidOperand {
                word: raw,
                pc: self.pc,
            })
        }
    }

    /// Checks that a resolved value is usable as a memory address. Registers
    /// can carry raw words beyond the address space (`RMEM` copies memory
    /// verbatim), and indexing with one must fault rather than panic.
    fn checked_address(&self, value: Word, size: usize) -> Result<Word, Fault> {
        if (value as usize) < size {
            Ok(value)
        } else {
            Err(Fault::InvalidOperand {
                word: value,
                pc: self.pc,
            })
        }
    }

    /// Stores `value` where the unresolved destination word `dest_raw`
    /// points: a register slot for register references, memory otherwise.
    fn write<const S: usize>(
        &mut self,
        memory: &mut Memory<S>,
        dest_raw: Word,
        value: Word,
    ) -> Result<(), Fault> {
        if (REG_BASE..=MAX_OPERAND).contains(&dest_raw) {
            self.registers.set((dest_raw - REG_BASE) as usize, value);
            Ok(())
        } else if (dest_raw as usize) < S {
            memory.write(dest_raw, value);
            Ok(())
        } else {
            Err(Fault::InvalidOperand {
                word: dest_raw,
                pc: self.pc,
            })
        }
    }

    /// Executes a single already-decoded instruction
    pub fn execute_instruction<const S: usize>(
        &mut self,
        instruction: Instruction,
        memory: &mut Memory<S>,
    ) -> Result<Step, Fault> {
        use Instruction::*;

        let a = self.operand(0);
        let b = self.operand(1);
        let c = self.operand(2);
        // Jump instructions set the program counter themselves and must
        // not also receive this default advance.
        let next = (self.pc + 1 + instruction.arity()) % MODULUS;

        match instruction {
            HALT => {
                debug!("HALT");

                return Ok(Step::Halted);
            }
            SET => {
                let dest = self.fetch_raw(memory, a);
                let value = self.fetch_value(memory, b)?;
                self.write(memory, dest, value)?;
                self.pc = next;

                debug!("SET {} {}", dest, value);
            }
            PUSH => {
                let value = self.fetch_value(memory, a)?;
                self.stack.push(value);
                self.pc = next;

                debug!("PUSH {}", value);
            }
            POP => {
                let value = self
                    .stack
                    .pop()
                    .ok_or(Fault::StackUnderflow { pc: self.pc })?;
                let dest = self.fetch_raw(memory, a);
                self.write(memory, dest, value)?;
                self.pc = next;

                debug!("POP {}", value);
            }
            EQ => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                self.write(memory, dest, (lhs == rhs) as Word)?;
                self.pc = next;

                debug!("EQ {} {}", lhs, rhs);
            }
            GT => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                self.write(memory, dest, (lhs > rhs) as Word)?;
                self.pc = next;

                debug!("GT {} {}", lhs, rhs);
            }
            JMP => {
                // Jump targets are reduced mod 32768 so the program counter
                // stays addressable even when a register carries a raw word.
                let target = self.fetch_value(memory, a)?;
                self.pc = target % MODULUS;

                debug!("JMP {}", target);
            }
            JT => {
                let value = self.fetch_value(memory, a)?;
                let target = self.fetch_value(memory, b)?;
                self.pc = if value != 0 { target % MODULUS } else { next };

                debug!("JT {} {}", value, target);
            }
            JF => {
                let value = self.fetch_value(memory, a)?;
                let target = self.fetch_value(memory, b)?;
                self.pc = if value == 0 { target % MODULUS } else { next };

                debug!("JF {} {}", value, target);
            }
            ADD => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                let sum = (u32::from(lhs) + u32::from(rhs)) % u32::from(MODULUS);
                self.write(memory, dest, sum as Word)?;
                self.pc = next;

                debug!("ADD {} {}", lhs, rhs);
            }
            MULT => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                let product = (u32::from(lhs) * u32::from(rhs)) % u32::from(MODULUS);
                self.write(memory, dest, product as Word)?;
                self.pc = next;

                debug!("MULT {} {}", lhs, rhs);
            }
            MOD => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                if rhs == 0 {
                    return Err(Fault::DivisionByZero { pc: self.pc });
                }
                self.write(memory, dest, lhs % rhs)?;
                self.pc = next;

                debug!("MOD {} {}", lhs, rhs);
            }
            AND => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                self.write(memory, dest, lhs & rhs)?;
                self.pc = next;

                debug!("AND {} {}", lhs, rhs);
            }
            OR => {
                let dest = self.fetch_raw(memory, a);
                let lhs = self.fetch_value(memory, b)?;
                let rhs = self.fetch_value(memory, c)?;
                self.write(memory, dest, lhs | rhs)?;
                self.pc = next;

                debug!("OR {} {}", lhs, rhs);
            }
            NOT => {
                let dest = self.fetch_raw(memory, a);
                let value = self.fetch_value(memory, b)?;
                self.write(memory, dest, !value & (MODULUS - 1))?;
                self.pc = next;

                debug!("NOT {}", value);
            }
            RMEM => {
                let dest = self.fetch_raw(memory, a);
                let address = self.checked_address(self.fetch_value(memory, b)?, S)?;
                let value = memory.read(address);
                self.write(memory, dest, value)?;
                self.pc = next;

                debug!("RMEM {} {}", address, value);
            }
            WMEM => {
                let address = self.checked_address(self.fetch_value(memory, a)?, S)?;
                let value = self.fetch_value(memory, b)?;
                memory.write(address, value);
                self.pc = next;

                debug!("WMEM {} {}", address, value);
            }
            CALL => {
                let target = self.fetch_value(memory, a)?;
                self.stack.push(next);
                self.pc = target % MODULUS;

                debug!("CALL {}", target);
            }
            RET => {
                // Returning on an empty stack halts the machine; only POP
                // treats an empty stack as a fault.
                match self.stack.pop() {
                    Some(address) => {
                        self.pc = address % MODULUS;

                        debug!("RET {}", address);
                    }
                    None => {
                        debug!("RET (empty stack)");

                        return Ok(Step::Halted);
                    }
                }
            }
            OUT => {
                let value = self.fetch_value(memory, a)?;
                let ch = char::from_u32(u32::from(value)).unwrap_or(char::REPLACEMENT_CHARACTER);
                self.output.push(ch);
                self.pc = next;

                debug!("OUT {:?}", ch);
            }
            IN => {
                let ch = match self.input.pop_front() {
                    Some(ch) => ch,
                    None => {
                        debug!("IN (awaiting input)");

                        return Ok(Step::AwaitingInput);
                    }
                };
                let dest = self.fetch_raw(memory, a);
                self.write(memory, dest, (ch as u32 % u32::from(MODULUS)) as Word)?;
                self.pc = next;

                debug!("IN {:?}", ch);
            }
            NOOP => {
                self.pc = next;

                debug!("NOOP");
            }
        }

        Ok(Step::Continue)
    }

    /// Runs one fetch-decode-execute step and updates the run state.
    pub fn execute<const S: usize>(&mut self, memory: &mut Memory<S>) -> Result<Step, Fault> {
        let result = self.step(memory);
        match &result {
            Ok(Step::Halted) => self.state = State::Halted,
            Err(fault) => self.state = State::Faulted(fault.clone()),
            _ => {}
        }
        result
    }

    fn step<const S: usize>(&mut self, memory: &mut Memory<S>) -> Result<Step, Fault> {
        let opcode = self.fetch_raw(memory, self.pc % MODULUS);
        let step = match Instruction::try_from(opcode) {
            Ok(instruction) => self.execute_instruction(instruction, memory)?,
            Err(_) => self.undefined(opcode)?,
        };

        if let Step::Continue = step {
            let observation = Observation {
                memory: &memory.data,
                registers: &self.registers.0,
                stack: self.stack.as_slice(),
                pc: self.pc,
            };
            if let Some(trip) = self.watchdog.observe(&observation) {
                return Err(Fault::WatchdogTripped(trip));
            }
        }

        Ok(step)
    }

    fn undefined(&mut self, opcode: Word) -> Result<Step, Fault> {
        match self.undefined_policy {
            UndefinedOpcodePolicy::Skip => {
                warn!("skipping undefined opcode `{}` at address {}", opcode, self.pc);
                self.pc = (self.pc + 1) % MODULUS;
                Ok(Step::Continue)
            }
            UndefinedOpcodePolicy::Fault => Err(Fault::UndefinedOpcode {
                opcode,
                pc: self.pc,
            }),
        }
    }

    /// Runs until the program halts, faults, or suspends waiting for input.
    pub fn run<const S: usize>(&mut self, memory: &mut Memory<S>) -> TerminationReason {
        loop {
            match &self.state {
                State::Halted => return TerminationReason::Halted,
                State::Faulted(fault) => return TerminationReason::Faulted(fault.clone()),
                State::Running => {}
            }

            match self.execute(memory) {
                Ok(Step::Continue) | Ok(Step::Halted) => {}
                Ok(Step::AwaitingInput) => return TerminationReason::AwaitingInput,
                Err(fault) => error!("{}", fault),
            }
        }
    }
}
