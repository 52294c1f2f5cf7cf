//! REPL – the interactive command console on stdin/stdout.
//!
//! Runs on a blocking thread; each line is handed to
//! [`portmerge_runtime::respond`] on the Tokio runtime.  End of input closes
//! the console but leaves the merge loop running.

use colored::Colorize;
use std::io::{self, BufRead, Write};

use portmerge_runtime::{MergeEngine, respond};
use tokio::runtime::Handle;

pub fn run(engine: &MergeEngine, runtime: &Handle) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", "merge>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }

        let reply = runtime.block_on(respond(engine, cmd));
        for text in &reply.lines {
            if text.starts_with("Error:") {
                println!("{}", text.red());
            } else {
                println!("{text}");
            }
        }
        if reply.quit {
            println!("{}", "Goodbye.".green());
            break;
        }
    }
}
