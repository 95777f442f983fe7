//! Mock ELM327 OBD2 adapter for exercising carmetrics without a car
//!
//! Usage: cargo run -p carmetrics-mock-elm327-server -- --stored P0171
//! Then point carmetrics at 127.0.0.1:35000

use anyhow::Context;
use carmetrics_elm327_lib::{encode_dtc, encode_supported_pids, ClientState, DtcKind, Pid};
use clap::Parser;
use log::{debug, error, info, warn};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "carmetrics-mock-elm327")]
#[command(about = "Mock ELM327 adapter serving a simulated vehicle")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    bind: String,

    /// Stored trouble codes (Mode 03)
    #[arg(long, value_delimiter = ',')]
    stored: Vec<String>,

    /// Pending trouble codes (Mode 07)
    #[arg(long, value_delimiter = ',')]
    pending: Vec<String>,

    /// Permanent trouble codes (Mode 0A), never cleared by Mode 04
    #[arg(long, value_delimiter = ',')]
    permanent: Vec<String>,

    /// Answer AT commands but report NO DATA for every vehicle request
    #[arg(long)]
    ignition_off: bool,
}

/// Trouble codes shared by all clients, so a clear is seen by everyone
#[derive(Debug, Default)]
struct TroubleCodes {
    stored: Vec<[u8; 2]>,
    pending: Vec<[u8; 2]>,
    permanent: Vec<[u8; 2]>,
}

impl TroubleCodes {
    fn from_args(args: &Args) -> anyhow::Result<Self> {
        let parse = |codes: &[String]| -> anyhow::Result<Vec<[u8; 2]>> {
            codes
                .iter()
                .map(|code| encode_dtc(code).with_context(|| format!("invalid trouble code {code:?}")))
                .collect()
        };
        Ok(Self {
            stored: parse(&args.stored)?,
            pending: parse(&args.pending)?,
            permanent: parse(&args.permanent)?,
        })
    }

    fn codes(&self, kind: DtcKind) -> &[[u8; 2]] {
        match kind {
            DtcKind::Stored => &self.stored,
            DtcKind::Pending => &self.pending,
            DtcKind::Permanent => &self.permanent,
        }
    }
}

struct Vehicle {
    start_time: Instant,
    ignition_off: bool,
    codes: Arc<Mutex<TroubleCodes>>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let codes = Arc::new(Mutex::new(TroubleCodes::from_args(&args)?));

    info!("Mock ELM327 starting on {}...", args.bind);
    let listener = TcpListener::bind(&args.bind).with_context(|| format!("failed to bind {}", args.bind))?;
    info!("Mock ELM327 ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let vehicle = Vehicle {
                    start_time: Instant::now(),
                    ignition_off: args.ignition_off,
                    codes: Arc::clone(&codes),
                };
                std::thread::spawn(move || handle_client(stream, &vehicle));
            }
            Err(e) => error!("Connection error: {e}"),
        }
    }
    Ok(())
}

fn handle_client(mut stream: TcpStream, vehicle: &Vehicle) {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    let mut state = ClientState::new();

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let ch = byte[0];

                if state.echo_enabled && stream.write_all(&byte).is_err() {
                    break;
                }

                if ch == b'\r' {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();

                    if !command.is_empty() {
                        debug!("RX: {command}");
                        let response = process_command(&command, vehicle, &mut state);
                        debug!("TX: {}", response.escape_debug());

                        let formatted = state.format_response(response.as_bytes());
                        if let Err(e) = stream.write_all(&formatted) {
                            warn!("Write error: {e}");
                            break;
                        }
                    }

                    buffer.clear();
                } else if ch != b'\n' {
                    buffer.push(ch);
                }
            }
            Err(e) => {
                warn!("Read error: {e}");
                break;
            }
        }
    }
}

/// Position in a repeating drive cycle: 0.0 idle, 1.0 full load
fn drive_phase(start_time: &Instant) -> f64 {
    const RAMP_TIME: f64 = 4.0;
    const HOLD_TIME: f64 = 3.0;
    const CYCLE_TIME: f64 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let phase = start_time.elapsed().as_secs_f64() % CYCLE_TIME;
    if phase < RAMP_TIME {
        phase / RAMP_TIME
    } else if phase < RAMP_TIME + HOLD_TIME {
        1.0
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        1.0 - (phase - RAMP_TIME - HOLD_TIME) / RAMP_TIME
    } else {
        0.0
    }
}

fn pid_value(pid: Pid, start_time: &Instant) -> f64 {
    let load = drive_phase(start_time);
    let lerp = |idle: f64, full: f64| idle + (full - idle) * load;
    match pid {
        Pid::EngineLoad => lerp(18.0, 72.0),
        Pid::CoolantTemp => 88.0,
        Pid::Rpm => lerp(800.0, 3500.0),
        Pid::Speed => lerp(0.0, 110.0),
        Pid::IntakeAirTemp => 24.0,
        Pid::Maf => lerp(2.5, 38.0),
        Pid::ThrottlePos => lerp(12.0, 64.0),
        Pid::FuelLevel => 58.0,
        Pid::ControlModuleVoltage => 14.1,
    }
}

/// Data bytes for a Mode 01 PID, including the "PIDs supported" ranges
fn pid_data(code: u8, start_time: &Instant) -> Option<Vec<u8>> {
    let supported: Vec<u8> = Pid::ALL.iter().map(|pid| pid.code()).chain([0x20, 0x40]).collect();
    match code {
        0x00 | 0x20 | 0x40 => Some(encode_supported_pids(code, &supported).to_vec()),
        _ => Pid::from_code(code).map(|pid| pid.encode(pid_value(pid, start_time))),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn process_command(cmd: &str, vehicle: &Vehicle, state: &mut ClientState) -> String {
    let le = state.line_ending();

    if cmd.starts_with("AT") {
        return state.handle_at_command(cmd);
    }

    if vehicle.ignition_off {
        return format!("NO DATA{le}{le}>");
    }

    let mut codes = vehicle.codes.lock().unwrap_or_else(PoisonError::into_inner);
    match cmd {
        // Mode 04 - Clear stored and pending DTCs
        "04" => {
            codes.stored.clear();
            codes.pending.clear();
            format!("44{le}{le}>")
        }

        // Mode 03/07/0A - DTCs, CAN style with a count byte
        "03" | "07" | "0A" => {
            let kind = match cmd {
                "03" => DtcKind::Stored,
                "07" => DtcKind::Pending,
                _ => DtcKind::Permanent,
            };
            let list = codes.codes(kind);
            #[allow(clippy::cast_possible_truncation)]
            let mut message = vec![kind.response_mode(), list.len() as u8];
            message.extend(list.iter().flatten());
            format!("{}{le}{le}>", hex(&message))
        }

        // Mode 01 - Current data (single or multi-PID)
        c if c.starts_with("01") && c.len() >= 4 => {
            let mut response = vec![0x41];
            for pair in c.as_bytes()[2..].chunks(2) {
                let Some(code) = std::str::from_utf8(pair)
                    .ok()
                    .filter(|p| p.len() == 2)
                    .and_then(|p| u8::from_str_radix(p, 16).ok())
                else {
                    return format!("?{le}{le}>");
                };
                match pid_data(code, &vehicle.start_time) {
                    Some(data) => {
                        response.push(code);
                        response.extend(data);
                    }
                    None => return format!("NO DATA{le}{le}>"),
                }
            }
            format!("{}{le}{le}>", hex(&response))
        }

        _ => format!("?{le}{le}>"),
    }
}
