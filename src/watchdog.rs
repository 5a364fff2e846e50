//! Non-termination watchdogs.
//!
//! A watchdog observes a derived signature of the machine after every
//! executed instruction and decides whether the run looks stuck. It is a
//! best-effort safety net: no opcode depends on it, and the engine accepts
//! any implementation of [`Watchdog`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::memory::Word;
use log::*;

/// One post-instruction snapshot of machine state, borrowed from the engine.
/// Never part of the program-visible state.
pub struct Observation<'a> {
    pub memory: &'a [Word],
    pub registers: &'a [Word],
    pub stack: &'a [Word],
    pub pc: Word,
}

/// Diagnostic carried by a watchdog trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trip {
    /// Aggregate state signature at the time of the trip.
    pub signature: u64,
    /// Number of consecutive steps the signature had been stuck.
    pub steps: u64,
}

pub trait Watchdog: fmt::Debug {
    /// Called after every executed instruction. Returns a trip diagnostic
    /// once the machine looks stuck.
    fn observe(&mut self, observation: &Observation) -> Option<Trip>;
}

/// Watchdog that never trips; opts a run out of non-termination detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopWatchdog;

impl Watchdog for NopWatchdog {
    fn observe(&mut self, _observation: &Observation) -> Option<Trip> {
        None
    }
}

const DEFAULT_TOLERANCE: u64 = 100;

/// The default heuristic: cumulative sets of distinct memory, register and
/// stack snapshots (hashed) plus distinct program counter values. The
/// signature is the sum of the set sizes; a machine that makes any progress
/// keeps growing at least one set. A signature unchanged for more than
/// `tolerance` consecutive steps trips the watchdog.
///
/// A long-running loop that only revisits earlier states is reported as
/// stuck even if it would eventually diverge; that trade-off is accepted.
#[derive(Debug)]
pub struct StateSetWatchdog {
    memories: HashSet<u64>,
    registers: HashSet<u64>,
    stacks: HashSet<u64>,
    pcs: HashSet<Word>,
    last_signature: Option<u64>,
    stuck_steps: u64,
    tolerance: u64,
}

impl Default for StateSetWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl StateSetWatchdog {
    pub fn new(tolerance: u64) -> Self {
        Self {
            memories: HashSet::new(),
            registers: HashSet::new(),
            stacks: HashSet::new(),
            pcs: HashSet::new(),
            last_signature: None,
            stuck_steps: 0,
            tolerance,
        }
    }

    fn hash_words(words: &[Word]) -> u64 {
        let mut hasher = DefaultHasher::new();
        words.hash(&mut hasher);
        hasher.finish()
    }
}

impl Watchdog for StateSetWatchdog {
    fn observe(&mut self, observation: &Observation) -> Option<Trip> {
        self.memories.insert(Self::hash_words(observation.memory));
        self.registers
            .insert(Self::hash_words(observation.registers));
        self.stacks.insert(Self::hash_words(observation.stack));
        self.pcs.insert(observation.pc);

        let signature = (self.memories.len()
            + self.registers.len()
            + self.stacks.len()
            + self.pcs.len()) as u64;

        if self.last_signature == Some(signature) {
            self.stuck_steps += 1;
            if self.stuck_steps > self.tolerance {
                warn!(
                    "machine state stopped changing: signature {} for {} steps",
                    signature, self.stuck_steps
                );
                return Some(Trip {
                    signature,
                    steps: self.stuck_steps,
                });
            }
        } else {
            self.stuck_steps = 0;
        }
        self.last_signature = Some(signature);

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::Result;

    fn observation(pc: Word) -> Observation<'static> {
        Observation {
            memory: &[6, 0],
            registers: &[0; 8],
            stack: &[],
            pc,
        }
    }

    #[test]
    fn test_trips_on_repeated_state() -> Result<()> {
        let mut watchdog = StateSetWatchdog::new(3);

        for _ in 0..4 {
            assert_eq!(watchdog.observe(&observation(0)), None);
        }
        let trip = watchdog.observe(&observation(0)).unwrap();
        assert_eq!(trip.steps, 4);

        Ok(())
    }

    #[test]
    fn test_progress_resets_the_counter() -> Result<()> {
        let mut watchdog = StateSetWatchdog::new(3);

        // A fresh program counter every step keeps the signature growing.
        for pc in 0..100 {
            assert_eq!(watchdog.observe(&observation(pc)), None);
        }

        Ok(())
    }

    #[test]
    fn test_nop_watchdog_never_trips() -> Result<()> {
        let mut watchdog = NopWatchdog;

        for _ in 0..1000 {
            assert_eq!(watchdog.observe(&observation(0)), None);
        }

        Ok(())
    }
}
