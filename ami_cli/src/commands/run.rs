//! `ami run`: execute a program with the reference interpreter
//!
//! `read` is serviced from `--input` values first, then interactively from
//! standard input; `write` prints the value; `brkpt` reports the
//! breakpoint name and continues.

use crate::{exit, read_source};
use ami_interpreter::{Interpreter, Step};
use ami_ir::{CfgBuilder, ReaderOptions};
use anyhow::{Context, Result};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

pub fn execute(
    file: Option<PathBuf>,
    input: Vec<i128>,
    bits: u32,
    entrypoint: Option<String>,
    ban_anonymous_blocks: bool,
) -> Result<ExitCode> {
    let source = read_source(&file)?;
    let builder = CfgBuilder::new(ReaderOptions {
        allow_anonymous_blocks: !ban_anonymous_blocks,
        entrypoint,
    });
    let cfg = match builder.build(&source) {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("error: {}", error);
            return Ok(ExitCode::from(exit::code_for(&error)));
        }
    };

    let mut interpreter = Interpreter::with_bits(&cfg, bits);
    let mut inputs = input.into_iter();
    loop {
        match interpreter.run() {
            Ok(Step::Exited) => return Ok(ExitCode::SUCCESS),
            Ok(Step::Read(register)) => {
                let value = match inputs.next() {
                    Some(value) => value,
                    None => prompt(&register)?,
                };
                interpreter.set_register(&register, value);
            }
            Ok(Step::Write(register)) => {
                match interpreter.register(&register) {
                    Ok(value) => println!("{} = {}", register, value),
                    Err(error) => {
                        eprintln!("error: {}", error);
                        return Ok(ExitCode::from(exit::code_for(&error)));
                    }
                }
            }
            Ok(Step::Breakpoint(name)) => {
                eprintln!("breakpoint !{}", name);
            }
            Ok(Step::Continue) => unreachable!("run returns only suspensions"),
            Err(error) => {
                eprintln!("error: {}", error);
                return Ok(ExitCode::from(exit::code_for(&error)));
            }
        }
    }
}

fn prompt(register: &str) -> Result<i128> {
    loop {
        eprint!("{} = ", register);
        std::io::stderr().flush().ok();
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("cannot read standard input")?;
        if line.is_empty() {
            anyhow::bail!("input ended while waiting for {}", register);
        }
        match line.trim().parse::<i128>() {
            Ok(value) => return Ok(value),
            Err(_) => eprintln!("please enter an integer"),
        }
    }
}
