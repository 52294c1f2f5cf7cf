//! Command console.
//!
//! Text commands accepted while the engine runs, from a terminal or any
//! other line-oriented control channel.
//!
//! | Command | Effect |
//! |---|---|
//! | `help` | list the commands |
//! | `info` | print the active format tree |
//! | `freq <hz>` | change the tick frequency |
//! | `quit` / `exit` | stop the merge loop |
//!
//! Malformed input is answered with an `Error: ...` line and the engine
//! keeps running.  Any other failure while handling a command shuts the
//! engine down.

use std::str::FromStr;

use portmerge_types::MergeError;
use tracing::error;

use crate::engine::MergeEngine;

pub const HELP: &[&str] = &[
    "Commands:",
    "  help        - this list",
    "  info        - show the active format",
    "  freq <hz>   - set the merge frequency",
    "  quit        - stop merging and exit",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Info,
    Freq(f64),
    Quit,
}

impl FromStr for Command {
    type Err = MergeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| MergeError::Validation("empty command".to_string()))?;

        let command = match verb.trim_start_matches('/').to_ascii_lowercase().as_str() {
            "help" => Command::Help,
            "info" => Command::Info,
            "quit" | "exit" => Command::Quit,
            "freq" => {
                let value = words.next().ok_or_else(|| {
                    MergeError::Validation("usage: freq <hz>".to_string())
                })?;
                let hz = value.parse::<f64>().map_err(|_| {
                    MergeError::Validation(format!("'{value}' is not a frequency"))
                })?;
                Command::Freq(hz)
            }
            other => {
                return Err(MergeError::Validation(format!(
                    "unknown command '{other}', try 'help'"
                )));
            }
        };

        if let Some(extra) = words.next() {
            return Err(MergeError::Validation(format!(
                "unexpected argument '{extra}'"
            )));
        }
        Ok(command)
    }
}

/// Text to show the operator, plus whether the console should stop reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Reply {
    fn text(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            quit: false,
        }
    }

    fn error(e: &MergeError) -> Self {
        Self::text([format!("Error: {e}")])
    }
}

/// Handle one command line.
pub async fn respond(engine: &MergeEngine, line: &str) -> Reply {
    let result = match line.parse::<Command>() {
        Ok(command) => execute(engine, command).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(reply) => reply,
        Err(e) if e.is_recoverable() => Reply::error(&e),
        Err(e) => {
            error!(error = %e, command = line, "command failed; shutting down");
            engine.shutdown().await;
            Reply {
                quit: true,
                ..Reply::error(&e)
            }
        }
    }
}

async fn execute(engine: &MergeEngine, command: Command) -> Result<Reply, MergeError> {
    match command {
        Command::Help => Ok(Reply::text(HELP.iter().copied())),
        Command::Info => match engine.describe().await {
            Some(tree) => Ok(Reply::text(tree.lines())),
            None => Ok(Reply::text(["no format installed"])),
        },
        Command::Freq(hz) => {
            let period = engine.set_frequency(hz)?;
            Ok(Reply::text([format!(
                "merging at {hz} Hz (every {period:?})"
            )]))
        }
        Command::Quit => {
            engine.request_shutdown();
            Ok(Reply {
                lines: vec!["stopping".to_string()],
                quit: true,
            })
        }
    }
}
