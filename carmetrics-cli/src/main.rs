//! carmetrics terminal front end
//!
//! Connects to an ELM327 adapter (or falls back to simulated data), prints
//! a dashboard line and engine notifications, and reads commands from
//! stdin.
//!
//! Usage: cargo run -p carmetrics-cli -- --port 127.0.0.1:35000

mod console;

use anyhow::Context;
use carmetrics_engine::{Config, Elm327Transport, Engine, TelemetryEvent};
use clap::Parser;
use console::{dashboard_line, ConsoleCommand, EventPrinter, LogAction, HELP};
use log::{info, LevelFilter};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "carmetrics")]
#[command(about = "Live vehicle telemetry from an ELM327 adapter")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Adapter address (host:port), overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    /// Serial line rate, overrides the config file
    #[arg(short, long)]
    baud: Option<u32>,

    /// Per-query timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Directory for CSV logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Skip the startup gauge sweep
    #[arg(long)]
    no_animation: bool,

    /// Seconds between dashboard lines (0 = never)
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = Config::load_or_default(self.config.as_deref()).context("failed to load config")?;
        if let Some(port) = &self.port {
            config.transport.port.clone_from(port);
        }
        if let Some(baud) = self.baud {
            config.transport.baudrate = baud;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.transport.timeout_ms = timeout_ms;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.directory.clone_from(dir);
        }
        if self.no_animation {
            config.startup_animation = false;
        }
        Ok(config)
    }

    fn level(&self, config: &Config) -> LevelFilter {
        match self.verbose {
            0 => config.log_level.as_level_filter(),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;
    env_logger::Builder::new()
        .filter_level(args.level(&config))
        .parse_default_env()
        .init();

    info!("Connecting to {}", config.transport.port);
    let engine = Engine::start(config, Elm327Transport::new()).context("failed to start engine")?;
    println!("{HELP}");

    let done = AtomicBool::new(false);
    let interval = Duration::try_from_secs_f64(args.interval).unwrap_or(Duration::ZERO);
    let events = engine.subscribe();
    thread::scope(|scope| {
        let (engine, done) = (&engine, &done);
        scope.spawn(move || print_events(engine, &events, interval, done));
        let result = run_console(engine);
        done.store(true, Ordering::Relaxed);
        result
    })?;

    engine.stop();
    Ok(())
}

fn print_events(engine: &Engine, events: &Receiver<TelemetryEvent>, interval: Duration, done: &AtomicBool) {
    let mut printer = EventPrinter::default();
    let mut last_dashboard = Instant::now();
    while !done.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                for line in printer.render(&event) {
                    println!("{line}");
                }
                if matches!(event, TelemetryEvent::Series(_))
                    && !interval.is_zero()
                    && last_dashboard.elapsed() >= interval
                {
                    println!("{}", dashboard_line(engine.cache()));
                    last_dashboard = Instant::now();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Read commands until `quit` or end of input
fn run_console(engine: &Engine) -> anyhow::Result<()> {
    for line in std::io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        // Engine errors are reported and the console keeps going
        if let Err(e) = execute(engine, command) {
            println!("error: {e:#}");
        }
    }
    Ok(())
}

fn execute(engine: &Engine, command: ConsoleCommand) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Log(LogAction::Start) => {
            let path = engine.start_logging()?;
            println!("logging to {}", path.display());
        }
        ConsoleCommand::Log(LogAction::Stop) => {
            let path = engine.stop_logging()?;
            println!("log closed: {}", path.display());
        }
        ConsoleCommand::Log(LogAction::Toggle) => {
            let on = engine.toggle_logging()?;
            match engine.log_path() {
                Some(path) if on => println!("logging to {}", path.display()),
                _ => println!("logging off"),
            }
        }
        ConsoleCommand::Dtc => {
            let snapshot = engine.fetch_dtc()?;
            if snapshot.is_empty() {
                println!("no trouble codes");
            }
            for entry in snapshot.all_entries() {
                println!("  {entry}");
            }
        }
        ConsoleCommand::Clear => {
            if engine.clear_dtc()? {
                println!("stored and pending trouble codes cleared");
            } else {
                println!("trouble codes not cleared (vehicle not connected?)");
            }
        }
        ConsoleCommand::Snapshot => {
            let snapshot = engine.full_snapshot()?;
            if snapshot.is_empty() {
                println!("snapshot empty (vehicle not connected?)");
            }
            for (name, value) in &snapshot {
                println!("  {name:<24} {value}");
            }
        }
        ConsoleCommand::Status => {
            let flags = engine.status_flags();
            println!(
                "status: {} | ignition {} | engine running {} | logging {}",
                engine.status(),
                flags.ignition_on,
                flags.engine_running,
                engine.is_logging()
            );
            println!("{}", dashboard_line(engine.cache()));
        }
        ConsoleCommand::Reconnect => {
            let status = engine.reconnect()?;
            println!("connection: {status}");
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
