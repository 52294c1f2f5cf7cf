//! `portmerge` – command-line merger.
//!
//! 1. Reads `portmerge.toml`, `PORTMERGE_*` variables and flags.
//! 2. Connects to every producer named in the format and opens
//!    `<port>/output:o`.
//! 3. Merges at the configured frequency until `quit` or Ctrl-C, with an
//!    interactive console (`help`, `info`, `freq <hz>`) on stdin.

mod args;
mod config;
mod repl;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use portmerge_middleware::TransportRegistry;
use portmerge_runtime::engine::period_from_hz;
use portmerge_runtime::{EngineConfig, MergeEngine, init_tracing, read_format};

use crate::args::Args;
use crate::config::Config;

fn main() -> ExitCode {
    // Before the runtime exists; see `init_tracing`.
    let _tracing = init_tracing("portmerge");
    let args = Args::parse();

    let mut cfg = match config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut cfg);

    if cfg.format.is_none() {
        eprintln!(
            "{} no format given.\n  Pass {} or set {} in {}.",
            "Error:".red().bold(),
            "--format \"(/producer:o[1-3])\"".bold(),
            "format".bold(),
            config::DEFAULT_CONFIG_FILE
        );
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start Tokio runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let status = match runtime.block_on(serve(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "portmerge stopped");
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    };

    // The console thread may still be parked on stdin.
    runtime.shutdown_timeout(Duration::from_millis(100));
    status
}

async fn serve(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let format = read_format(cfg.format.as_deref().unwrap_or_default())?;
    let period = period_from_hz(cfg.frequency)?;

    let transports = TransportRegistry::with_defaults();
    let transport = transports.create(&cfg.transport, &cfg.udp)?;

    let engine = Arc::new(MergeEngine::new(
        transport,
        EngineConfig {
            port_prefix: cfg.port.clone(),
            period,
            connect_timeout: cfg.connect_timeout(),
        },
    )?);
    engine.configure(&format).await?;
    info!(
        transport = %cfg.transport,
        output = %engine.output_name(),
        hz = cfg.frequency,
        "merger ready"
    );

    print_banner(&engine, &cfg);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let for_signal = Arc::clone(&engine);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "Ctrl-C received, stopping …".yellow().bold());
        for_signal.request_shutdown();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use 'quit' to stop");
    }

    // ── Merge loop + console ──────────────────────────────────────────────
    let merge_loop = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    let handle = tokio::runtime::Handle::current();
    let console_engine = Arc::clone(&engine);
    // Not joined: a console parked on stdin must not hold up exit.
    let _console = tokio::task::spawn_blocking(move || repl::run(&console_engine, &handle));

    merge_loop.await??;
    Ok(())
}

fn print_banner(engine: &MergeEngine, cfg: &Config) {
    println!();
    println!(
        "  {} {}",
        "portmerge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!(
        "  Merging into {} at {} Hz over {}",
        engine.output_name().bold(),
        cfg.frequency,
        cfg.transport.bold()
    );
    println!("  Type {} for a list of commands.\n", "help".bold().cyan());
}
