use std::env;
use std::io::{self, BufRead, Write};

use color_eyre::eyre::{eyre, Result};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use synvm::memory::{FillPolicy, StdMem};
use synvm::processor::{Processor, TerminationReason};

fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap(); // logging

    let path = env::args()
        .nth(1)
        .ok_or_else(|| eyre!("usage: synvm <program-image>"))?;

    let mut memory = StdMem::from_file(&path, FillPolicy::Zero)?;
    let mut cpu = Processor::new();

    let stdin = io::stdin();
    loop {
        let reason = cpu.run(&mut memory);

        print!("{}", cpu.take_output());
        io::stdout().flush()?;

        match reason {
            TerminationReason::Halted => return Ok(()),
            TerminationReason::Faulted(fault) => return Err(eyre!(fault)),
            TerminationReason::AwaitingInput => {
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    return Err(eyre!("input stream closed while the program was reading"));
                }
                cpu.feed_input(&line);
            }
        }
    }
}
