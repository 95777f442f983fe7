#![allow(dead_code)]

use carmetrics_elm327_lib::{DtcKind, Pid};
use carmetrics_engine::{Command, Config, ConnectionStatus, Response, TelemetryEvent, Transport, TransportError};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct Script {
    /// Status the next `connect` ends up in
    pub reachable: ConnectionStatus,
    pub status: ConnectionStatus,
    pub values: HashMap<Pid, f64>,
    pub codes: HashMap<DtcKind, Vec<String>>,
    /// Every query times out
    pub failing: bool,
    pub closed: bool,
    pub connects: usize,
}

/// Adapter double driven by a shared [`Script`]
#[derive(Clone)]
pub struct ScriptedTransport(Arc<Mutex<Script>>);

impl ScriptedTransport {
    pub fn unreachable() -> Self {
        Self::with_status(ConnectionStatus::NotConnected)
    }

    pub fn vehicle() -> Self {
        let transport = Self::with_status(ConnectionStatus::Connected);
        transport.script().values.extend([
            (Pid::Rpm, 1800.0),
            (Pid::Speed, 72.0),
            (Pid::ThrottlePos, 18.5),
            (Pid::EngineLoad, 41.176),
            (Pid::Maf, 9.0),
            (Pid::CoolantTemp, 88.0),
            (Pid::ControlModuleVoltage, 14.12),
            (Pid::FuelLevel, 63.0),
        ]);
        transport
    }

    fn with_status(reachable: ConnectionStatus) -> Self {
        Self(Arc::new(Mutex::new(Script {
            reachable,
            status: ConnectionStatus::NotConnected,
            values: HashMap::new(),
            codes: HashMap::new(),
            failing: false,
            closed: false,
            connects: 0,
        })))
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, _port: &str, _baudrate: u32, _timeout: Duration) -> ConnectionStatus {
        let mut script = self.script();
        script.connects += 1;
        script.closed = false;
        script.status = script.reachable;
        script.status
    }

    fn status(&self) -> ConnectionStatus {
        self.script().status
    }

    fn query(&mut self, command: Command, _force: bool) -> Result<Option<Response>, TransportError> {
        let mut script = self.script();
        if script.status != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        if script.failing {
            return Err(TransportError::Timeout);
        }
        Ok(match command {
            Command::Pid(pid) => script.values.get(&pid).copied().map(Response::Number),
            Command::Dtc(kind) => Some(Response::Codes(script.codes.get(&kind).cloned().unwrap_or_default())),
            Command::ClearDtc => {
                script.codes.remove(&DtcKind::Stored);
                script.codes.remove(&DtcKind::Pending);
                Some(Response::Ack)
            }
        })
    }

    fn supported_commands(&self) -> BTreeSet<Command> {
        let script = self.script();
        let mut commands: BTreeSet<Command> = script.values.keys().map(|pid| Command::Pid(*pid)).collect();
        commands.extend(DtcKind::ALL.map(Command::Dtc));
        commands.insert(Command::ClearDtc);
        commands
    }

    fn close(&mut self) {
        let mut script = self.script();
        script.closed = true;
        script.status = ConnectionStatus::NotConnected;
    }
}

/// Short cadences so tests finish quickly
pub fn fast_config(log_dir: &Path) -> Config {
    let mut config = Config::default();
    config.transport.port = "scripted".into();
    config.startup_animation = false;
    config.polling.fast_ms = 10;
    config.polling.slow_ms = 20;
    config.polling.diagnostic_ms = 50;
    config.polling.activity_ms = 30;
    config.logging.directory = log_dir.to_path_buf();
    config.logging.row_threshold = 5;
    config.logging.table_threshold = 10;
    config
}

/// Receive events until `pred` matches or the deadline passes
pub fn wait_for(
    events: &Receiver<TelemetryEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&TelemetryEvent) -> bool,
) -> Option<TelemetryEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}
