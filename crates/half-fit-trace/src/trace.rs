//! Trace file parser.
//!
//! A trace is line oriented. Blank lines and text after `#` are ignored;
//! every other line is one command:
//!
//! ```text
//! alloc <name> <bytes>
//! free <name>
//! dump
//! check
//! init
//! ```

use std::num::ParseIntError;

use snafu::{ResultExt as _, Snafu, ensure};

/// A single trace command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Allocate `size` bytes and remember the result as `name`.
    Alloc { name: String, size: usize },
    /// Release the allocation remembered as `name`.
    Free { name: String },
    /// Print the bucket table.
    Dump,
    /// Verify the allocator invariants.
    Check,
    /// Reset the allocator, forgetting every allocation.
    Init,
}

/// A command and the line it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// One-based line number.
    pub line: usize,
    pub command: Command,
}

#[derive(Debug, Snafu)]
pub enum ParseError {
    #[snafu(display("line {line}: unknown command `{command}`"))]
    UnknownCommand { line: usize, command: String },
    #[snafu(display("line {line}: `{command}` takes {expected} argument(s), found {found}"))]
    ArgumentCount {
        line: usize,
        command: &'static str,
        expected: usize,
        found: usize,
    },
    #[snafu(display("line {line}: invalid size `{value}`"))]
    InvalidSize {
        line: usize,
        value: String,
        source: ParseIntError,
    },
}

/// Parses a whole trace.
pub fn parse(input: &str) -> Result<Vec<Step>, ParseError> {
    let mut steps = Vec::new();
    for (index, text) in input.lines().enumerate() {
        let line = index + 1;
        if let Some(command) = parse_line(line, text)? {
            steps.push(Step { line, command });
        }
    }
    Ok(steps)
}

fn parse_line(line: usize, text: &str) -> Result<Option<Command>, ParseError> {
    let text = text.split_once('#').map_or(text, |(code, _comment)| code);
    let mut words = text.split_whitespace();
    let Some(keyword) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match keyword {
        "alloc" => {
            check_arity(line, "alloc", &args, 2)?;
            let size = args[1].parse().context(InvalidSizeSnafu {
                line,
                value: args[1],
            })?;
            Command::Alloc {
                name: args[0].to_owned(),
                size,
            }
        }
        "free" => {
            check_arity(line, "free", &args, 1)?;
            Command::Free {
                name: args[0].to_owned(),
            }
        }
        "dump" => {
            check_arity(line, "dump", &args, 0)?;
            Command::Dump
        }
        "check" => {
            check_arity(line, "check", &args, 0)?;
            Command::Check
        }
        "init" => {
            check_arity(line, "init", &args, 0)?;
            Command::Init
        }
        _ => {
            return UnknownCommandSnafu {
                line,
                command: keyword,
            }
            .fail();
        }
    };
    Ok(Some(command))
}

fn check_arity(
    line: usize,
    command: &'static str,
    args: &[&str],
    expected: usize,
) -> Result<(), ParseError> {
    ensure!(
        args.len() == expected,
        ArgumentCountSnafu {
            line,
            command,
            expected,
            found: args.len(),
        }
    );
    Ok(())
}
