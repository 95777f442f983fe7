//! The diagnostic adapter seam.
//!
//! The engine only talks to the vehicle through [`Transport`]. The
//! production implementation, [`Elm327Transport`], owns a single TCP
//! connection to an ELM327 compatible adapter (WiFi dongles and the mock
//! server both speak plain text over TCP).

use atomic_enum::atomic_enum;
use carmetrics_elm327_lib::{self as elm327, DtcKind, Pid, ResponseError};
use derive_more::{Display, Error, From};
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Adapter link state
#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No adapter
    NotConnected,
    /// Adapter answers but the vehicle does not
    ConnectedNoCar,
    /// Adapter and vehicle both answer
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotConnected => "Not Connected",
            Self::ConnectedNoCar => "ELM Connected",
            Self::Connected => "Car Connected",
        })
    }
}

/// The fixed command catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    Pid(Pid),
    Dtc(DtcKind),
    ClearDtc,
}

impl Command {
    pub const fn name(self) -> &'static str {
        match self {
            Command::Pid(pid) => pid.name(),
            Command::Dtc(DtcKind::Stored) => "GET_DTC",
            Command::Dtc(DtcKind::Pending) => "PENDING_DTC",
            Command::Dtc(DtcKind::Permanent) => "PERMANENT_DTC",
            Command::ClearDtc => "CLEAR_DTC",
        }
    }

    /// Text sent to the adapter, without the trailing carriage return
    pub fn request(self) -> String {
        match self {
            Command::Pid(pid) => pid.request(),
            Command::Dtc(kind) => kind.request(),
            Command::ClearDtc => elm327::CLEAR_DTC_REQUEST.to_string(),
        }
    }

    pub const fn unit(self) -> &'static str {
        match self {
            Command::Pid(pid) => pid.unit(),
            _ => "",
        }
    }

    /// Commands that change vehicle state
    pub const fn is_destructive(self) -> bool {
        matches!(self, Command::ClearDtc)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded answer
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Number(f64),
    /// DTC strings such as `P0133`
    Codes(Vec<String>),
    /// The adapter acknowledged a command without data (Mode 04)
    Ack,
}

/// Malformed payloads
#[derive(Debug, Clone, Display, Error)]
pub enum ParseError {
    #[display("malformed response to {command}: {detail}")]
    Malformed { command: &'static str, detail: String },
    #[display("unexpected response to {command}: {text}")]
    UnexpectedResponse { command: &'static str, text: String },
}

/// Errors from connecting to or querying the adapter
#[derive(Debug, Clone, Display, Error, From)]
pub enum TransportError {
    #[display("not connected to adapter")]
    NotConnected,
    #[display("adapter timeout")]
    Timeout,
    #[display("adapter disconnected")]
    Disconnected,
    #[display("I/O error: {_0}")]
    Io(#[error(not(source))] String),
    #[display("adapter error: {_0}")]
    Adapter(#[error(not(source))] String),
    #[display("{_0}")]
    #[from]
    Parse(ParseError),
}

impl TransportError {
    /// Whether the error means the link itself is unhealthy, as opposed to
    /// one bad answer
    pub const fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout | Self::Disconnected | Self::Io(_)
        )
    }
}

/// Connection to a diagnostic adapter.
///
/// Every call may fail; callers treat failures as "no data" for the
/// affected value.
pub trait Transport: Send {
    fn connect(&mut self, port: &str, baudrate: u32, timeout: Duration) -> ConnectionStatus;

    fn status(&self) -> ConnectionStatus;

    /// Run one command. `Ok(None)` means the vehicle had no data. Without
    /// `force`, commands the adapter did not advertise are skipped.
    fn query(&mut self, command: Command, force: bool) -> Result<Option<Response>, TransportError>;

    fn supported_commands(&self) -> BTreeSet<Command>;

    fn close(&mut self);
}

/// Buffer for adapter responses; typical answers fit inline
pub type ResponseBuffer = SmallVec<[u8; 64]>;

const INIT_COMMANDS: [&str; 6] = [
    "ATZ",   // Reset
    "ATE0",  // Echo off
    "ATL0",  // Linefeeds off
    "ATS0",  // Spaces off (compact responses)
    "ATH0",  // Headers off
    "ATSP0", // Protocol auto
];

/// Range probes for the "PIDs supported" bitmaps
const SUPPORT_PROBES: [u8; 3] = [0x00, 0x20, 0x40];

/// ELM327 adapter reached over TCP
pub struct Elm327Transport {
    stream: Option<TcpStream>,
    status: ConnectionStatus,
    timeout: Duration,
    supported: BTreeSet<Command>,
}

impl Default for Elm327Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Elm327Transport {
    pub fn new() -> Self {
        Self {
            stream: None,
            status: ConnectionStatus::NotConnected,
            timeout: Duration::from_millis(1000),
            supported: BTreeSet::new(),
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.status = ConnectionStatus::NotConnected;
        self.supported.clear();
    }

    fn execute(&mut self, request: &str) -> Result<ResponseBuffer, TransportError> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = execute_command(stream, request.as_bytes(), timeout);
        if matches!(result, Err(TransportError::Disconnected | TransportError::Io(_))) {
            warn!("Adapter connection lost");
            self.drop_connection();
        }
        result
    }

    /// Walk the "PIDs supported" bitmaps, 0100 then 0120 and 0140 while the
    /// previous range advertises the next one
    fn probe_supported(&mut self) -> Result<BTreeSet<Command>, TransportError> {
        let mut supported = BTreeSet::new();
        for base in SUPPORT_PROBES {
            let response = self.execute(&format!("01{base:02X}"))?;
            elm327::check_response(&response).map_err(adapter_error)?;
            let bitmap = elm327::extract_pid_data(&response, base).ok_or_else(|| ParseError::Malformed {
                command: "PIDS_SUPPORTED",
                detail: String::from_utf8_lossy(&response).trim().to_string(),
            })?;
            let pids = elm327::decode_supported_pids(base, &bitmap);
            supported.extend(pids.iter().filter_map(|&code| Pid::from_code(code)).map(Command::Pid));
            if !pids.contains(&(base + 0x20)) {
                break;
            }
        }
        supported.extend(DtcKind::ALL.into_iter().map(Command::Dtc));
        supported.insert(Command::ClearDtc);
        Ok(supported)
    }
}

fn adapter_error(e: ResponseError) -> TransportError {
    match e {
        ResponseError::Malformed(detail) => ParseError::Malformed {
            command: "response",
            detail,
        }
        .into(),
        other => TransportError::Adapter(other.to_string()),
    }
}

impl Transport for Elm327Transport {
    fn connect(&mut self, port: &str, baudrate: u32, timeout: Duration) -> ConnectionStatus {
        self.close();
        self.timeout = timeout;
        info!(
            "Connecting to adapter at {port} (baud {baudrate}, timeout: {}ms)",
            timeout.as_millis()
        );

        let addr = match port.to_socket_addrs().map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                warn!("Adapter address {port} did not resolve");
                return self.status;
            }
            Err(e) => {
                warn!("Invalid adapter address {port}: {e}");
                return self.status;
            }
        };
        let stream = match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to connect to adapter: {e}");
                return self.status;
            }
        };
        if let Err(e) = stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
        {
            error!("Failed to set socket timeouts: {e}");
            return self.status;
        }
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);

        for cmd in INIT_COMMANDS {
            debug!("Sending init command: {cmd}");
            if let Err(e) = self.execute(cmd) {
                warn!("Adapter init command {cmd} failed: {e}");
                self.drop_connection();
                return self.status;
            }
        }
        self.status = ConnectionStatus::ConnectedNoCar;

        match self.probe_supported() {
            Ok(supported) => {
                info!("Vehicle connected, {} commands supported", supported.len());
                self.supported = supported;
                self.status = ConnectionStatus::Connected;
            }
            Err(e) if self.stream.is_some() => {
                warn!("Adapter connected but the vehicle did not answer: {e}");
            }
            Err(e) => {
                warn!("Adapter dropped during vehicle probe: {e}");
            }
        }
        self.status
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn query(&mut self, command: Command, force: bool) -> Result<Option<Response>, TransportError> {
        if self.status != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        if !force && !self.supported.contains(&command) {
            debug!("Skipping unsupported command {command}");
            return Ok(None);
        }

        let response = self.execute(&command.request())?;
        debug!("{command} -> {:?}", String::from_utf8_lossy(&response));

        match command {
            Command::Pid(pid) => match elm327::decode_pid_response(&response, pid) {
                Ok(value) => Ok(Some(Response::Number(value))),
                Err(ResponseError::NoData) => Ok(None),
                Err(e) => Err(adapter_error(e)),
            },
            Command::Dtc(kind) => elm327::parse_dtc_response(&response, kind)
                .map(|codes| Some(Response::Codes(codes)))
                .map_err(adapter_error),
            Command::ClearDtc => {
                if elm327::is_clear_ack(&response) {
                    Ok(Some(Response::Ack))
                } else {
                    match elm327::check_response(&response) {
                        Err(ResponseError::NoData) => Ok(None),
                        Err(e) => Err(adapter_error(e)),
                        Ok(()) => Err(ParseError::UnexpectedResponse {
                            command: command.name(),
                            text: String::from_utf8_lossy(&response).trim().to_string(),
                        }
                        .into()),
                    }
                }
            }
        }
    }

    fn supported_commands(&self) -> BTreeSet<Command> {
        self.supported.clone()
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            info!("Closing adapter connection");
        }
        self.drop_connection();
    }
}

/// Drop whatever the adapter sent after the last prompt, such as a late
/// answer to a command that timed out
fn discard_pending(stream: &mut TcpStream) -> Result<(), TransportError> {
    let io_error = |e: std::io::Error| TransportError::Io(e.to_string());
    stream.set_nonblocking(true).map_err(io_error)?;
    let mut buffer = [0u8; 64];
    let result = loop {
        match stream.read(&mut buffer) {
            Ok(0) => break Err(TransportError::Disconnected),
            Ok(n) => debug!("Discarding {n} stale bytes from adapter"),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => break Err(io_error(e)),
        }
    };
    stream.set_nonblocking(false).map_err(io_error)?;
    result
}

/// Send one command and read until the `>` prompt
fn execute_command(
    stream: &mut TcpStream,
    command: &[u8],
    timeout: Duration,
) -> Result<ResponseBuffer, TransportError> {
    let mut cmd_with_cr: ResponseBuffer = command.into();
    if !cmd_with_cr.ends_with(b"\r") {
        cmd_with_cr.push(b'\r');
    }

    discard_pending(stream)?;
    debug!("Sending to adapter: {:?}", String::from_utf8_lossy(&cmd_with_cr));

    stream
        .write_all(&cmd_with_cr)
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let mut buffer = [0u8; 64];
    let mut response = ResponseBuffer::new();
    let start = Instant::now();

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                if response.contains(&b'>') {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() > timeout {
                    return Err(TransportError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(TransportError::Timeout);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
    }

    // Strip the echo if the adapter still has it on (before ATE0 lands)
    let text_start = if response.starts_with(command) {
        command.len()
    } else {
        0
    };
    Ok(response[text_start..].into())
}
