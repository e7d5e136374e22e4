//! `mtwlink` – wireless motion-tracker streaming bridge
//!
//! This binary:
//!
//! 1. Loads `~/.mtwlink/config.toml`, writing the defaults on first run.
//! 2. Brings up the wireless network, reporting connected trackers until the
//!    operator types `y` / `start` (or `q` / `quit` to leave).
//! 3. Streams orientation rows in fixed batches to the configured sink until
//!    `q`, end of input or **Ctrl-C**.
//!
//! The backend is the simulated network; `sim_sensors` sets its size.

mod config;

use std::io::{self, BufRead};
use std::path::Path;
use std::process::ExitCode;
use std::thread;

use colored::Colorize;
use tracing::{info, warn};

use mtwlink_hal::sim::SimDriver;
use mtwlink_middleware::outlet::DEFAULT_CAPACITY;
use mtwlink_middleware::{JsonLinesSink, PublishSink, StreamInfo, StreamInlet, StreamOutlet};
use mtwlink_runtime::{
    ControlCommand, ControlSender, Session, SessionOutcome, control_channel, init_tracing,
};
use mtwlink_types::BridgeError;

fn main() -> ExitCode {
    let _telemetry = init_tracing("mtwlink");

    print_banner();

    let cfg = load_config();

    // ── Operator input ────────────────────────────────────────────────────
    let (control, commands) = control_channel();

    let ctrlc_control = control.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping …".yellow().bold());
        ctrlc_control.request_quit();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use 'q' to stop");
    }

    spawn_stdin_reader(control);

    // ── Session ───────────────────────────────────────────────────────────
    let driver = SimDriver::builder().with_sensors(cfg.sim_sensors);
    let mut session = Session::new(driver, cfg.session_config());
    let output = cfg.output_path.clone();

    let outcome = session.run(&commands, move |info| open_sink(info, output.as_deref()));

    print_outcome(&outcome);
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            validated_or_default(cfg)
        }
        Err(e) => {
            report_config_error(&e);
            config::Config::default()
        }
    }
}

/// `cfg` if it passes validation, the defaults otherwise.
fn validated_or_default(cfg: config::Config) -> config::Config {
    match cfg.validate() {
        Ok(()) => cfg,
        Err(e) => {
            report_config_error(&e);
            config::Config::default()
        }
    }
}

fn report_config_error(e: &BridgeError) {
    println!("{}: {}", "Config error".red(), e);
    println!("  Using default configuration.");
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

fn open_sink(info: StreamInfo, output: Option<&Path>) -> Result<Box<dyn PublishSink>, BridgeError> {
    if let Some(path) = output {
        info!(path = %path.display(), "Writing chunks as JSON lines");
        return Ok(Box::new(JsonLinesSink::create(path, info)?));
    }
    let outlet = StreamOutlet::new(info, DEFAULT_CAPACITY);
    spawn_monitor(outlet.subscribe());
    Ok(Box::new(outlet))
}

/// Log every chunk the outlet publishes, from a local Tokio runtime.
fn spawn_monitor(mut inlet: StreamInlet) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!(error = %e, "Failed to start stream monitor");
            return;
        }
    };
    thread::spawn(move || {
        runtime.block_on(async move {
            while let Some(chunk) = inlet.recv().await {
                info!(
                    stream = %inlet.info().name,
                    seq = chunk.seq,
                    rows = chunk.rows.len(),
                    "chunk published"
                );
            }
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator input
// ─────────────────────────────────────────────────────────────────────────────

/// Map one input line to a command.
fn parse_command(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "start" => Some(ControlCommand::Start),
        "q" | "quit" | "exit" => Some(ControlCommand::Quit),
        _ => None,
    }
}

/// Forward stdin lines as commands.  End of input counts as quit.
fn spawn_stdin_reader(control: ControlSender) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(command) => {
                    if control.send(command).is_err() || command == ControlCommand::Quit {
                        return;
                    }
                }
                None if line.trim().is_empty() => {}
                None => println!(
                    "  Unknown input {:?}. Type {} to start or {} to quit.",
                    line.trim(),
                    "y".bold().cyan(),
                    "q".bold().cyan()
                ),
            }
        }
        let _ = control.send(ControlCommand::Quit);
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner / report
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"            _           _ _       _    "#.bold().cyan());
    println!("{}", r#"  _ __ ___ | |___      _| (_)_ __ | | __"#.bold().cyan());
    println!("{}", r#" | '_ ` _ \| __\ \ /\ / / | | '_ \| |/ /"#.bold().cyan());
    println!("{}", r#" | | | | | | |_ \ V  V /| | | | | |   < "#.bold().cyan());
    println!("{}", r#" |_| |_| |_|\__| \_/\_/ |_|_|_| |_|_|\_\"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "mtwlink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Wireless motion-tracker streaming bridge");
    println!();
}

fn print_outcome(outcome: &SessionOutcome) {
    println!();
    match outcome {
        SessionOutcome::Streamed(report) => {
            println!(
                "  {} Streamed {} records in {} chunks from {} sensors @ {} Hz",
                "✓".green().bold(),
                report.stats.records,
                report.stats.chunks,
                report.sensors.len(),
                report.update_rate
            );
            if report.dropped > 0 {
                println!(
                    "  {} {} samples dropped by queue overflow",
                    "!".yellow().bold(),
                    report.dropped
                );
            }
            if let Some(fault) = &report.fault {
                println!("  {} Streaming ended early: {fault}", "!".yellow().bold());
            }
        }
        SessionOutcome::Cancelled => {
            println!("  {} Quit before measurement started", "✓".green().bold());
        }
        SessionOutcome::Aborted(e) => {
            println!("  {} {}", "✗ Aborted:".red().bold(), e);
        }
    }
}
