//! ELM327 protocol implementation for OBD2 communication
//!
//! This library provides the pieces shared by the carmetrics engine and the
//! mock adapter: per-connection AT command state, the Mode 01 PID catalog
//! with its scaling formulas, response parsing, and diagnostic trouble code
//! (DTC) decoding.

use std::fmt;

/// Per-connection client state (ELM327 settings)
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct ClientState {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show header bytes in responses (ATH0/ATH1)
    pub headers_enabled: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
        }
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a line ending based on current settings
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Format a compact hex response according to client settings, adding
    /// spaces between byte pairs if enabled
    pub fn format_response(&self, response: &[u8]) -> Vec<u8> {
        if !self.spaces_enabled {
            return response.to_vec();
        }

        let mut result = Vec::with_capacity(response.len() * 3 / 2);
        let mut hex_count = 0;

        for &byte in response {
            if byte.is_ascii_hexdigit() {
                if hex_count > 0 && hex_count % 2 == 0 {
                    result.push(b' ');
                }
                hex_count += 1;
            } else {
                // Line endings and the prompt restart the pairing
                hex_count = 0;
            }

            result.push(byte);
        }

        result
    }

    /// Handle an AT command and return the response.
    /// Mutates the state if the command changes settings.
    pub fn handle_at_command(&mut self, command: &str) -> String {
        let cmd = command.trim().to_uppercase();
        let le = self.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" | "ATWS" => {
                *self = ClientState::default();
                let le = self.line_ending();
                return format!("{le}ELM327 v1.5{le}>");
            }
            "ATD" => {
                let echo = self.echo_enabled;
                *self = ClientState::default();
                self.echo_enabled = echo;
                "OK"
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK"
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK"
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK"
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK"
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK"
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK"
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK"
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK"
            }
            "ATDPN" => "A6",
            "ATDP" => "AUTO, ISO 15765-4 (CAN 11/500)",
            _ if cmd.starts_with("ATSP") => "OK",
            _ if cmd.starts_with("ATST") => "OK",
            _ if cmd.starts_with("ATAT") => "OK",
            "ATI" => "ELM327 v1.5",
            "AT@1" => return self.device_description(),
            _ => "?",
        };

        // le was captured before the match, so commands that change the
        // linefeed setting answer with the old one
        format!("{le}{response_text}{le}>")
    }

    pub fn device_description(&self) -> String {
        let le = self.line_ending();
        format!("{le}carmetrics mock ELM327{le}>")
    }
}

/// Mode 01 parameters the engine knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pid {
    EngineLoad,
    CoolantTemp,
    Rpm,
    Speed,
    IntakeAirTemp,
    Maf,
    ThrottlePos,
    FuelLevel,
    ControlModuleVoltage,
}

impl Pid {
    pub const ALL: [Pid; 9] = [
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::Rpm,
        Pid::Speed,
        Pid::IntakeAirTemp,
        Pid::Maf,
        Pid::ThrottlePos,
        Pid::FuelLevel,
        Pid::ControlModuleVoltage,
    ];

    pub const fn code(self) -> u8 {
        match self {
            Pid::EngineLoad => 0x04,
            Pid::CoolantTemp => 0x05,
            Pid::Rpm => 0x0C,
            Pid::Speed => 0x0D,
            Pid::IntakeAirTemp => 0x0F,
            Pid::Maf => 0x10,
            Pid::ThrottlePos => 0x11,
            Pid::FuelLevel => 0x2F,
            Pid::ControlModuleVoltage => 0x42,
        }
    }

    pub fn from_code(code: u8) -> Option<Pid> {
        Self::ALL.into_iter().find(|pid| pid.code() == code)
    }

    /// Canonical upper-case parameter name
    pub const fn name(self) -> &'static str {
        match self {
            Pid::EngineLoad => "ENGINE_LOAD",
            Pid::CoolantTemp => "COOLANT_TEMP",
            Pid::Rpm => "RPM",
            Pid::Speed => "SPEED",
            Pid::IntakeAirTemp => "INTAKE_TEMP",
            Pid::Maf => "MAF",
            Pid::ThrottlePos => "THROTTLE_POS",
            Pid::FuelLevel => "FUEL_LEVEL",
            Pid::ControlModuleVoltage => "CONTROL_MODULE_VOLTAGE",
        }
    }

    pub fn from_name(name: &str) -> Option<Pid> {
        Self::ALL.into_iter().find(|pid| pid.name() == name)
    }

    pub const fn unit(self) -> &'static str {
        match self {
            Pid::EngineLoad | Pid::ThrottlePos | Pid::FuelLevel => "%",
            Pid::CoolantTemp | Pid::IntakeAirTemp => "°C",
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
            Pid::Maf => "g/s",
            Pid::ControlModuleVoltage => "V",
        }
    }

    /// Number of data bytes following the `41 XX` header
    pub const fn data_len(self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf | Pid::ControlModuleVoltage => 2,
            _ => 1,
        }
    }

    /// The request string sent to the adapter, e.g. `010C`
    pub fn request(self) -> String {
        format!("01{:02X}", self.code())
    }

    /// Convert raw data bytes into the physical value
    pub fn decode(self, data: &[u8]) -> Option<f64> {
        if data.len() < self.data_len() {
            return None;
        }
        let a = f64::from(data[0]);
        let ab = || f64::from(u16::from_be_bytes([data[0], data[1]]));
        Some(match self {
            Pid::EngineLoad | Pid::ThrottlePos | Pid::FuelLevel => a * 100.0 / 255.0,
            Pid::CoolantTemp | Pid::IntakeAirTemp => a - 40.0,
            Pid::Rpm => ab() / 4.0,
            Pid::Speed => a,
            Pid::Maf => ab() / 100.0,
            Pid::ControlModuleVoltage => ab() / 1000.0,
        })
    }

    /// Convert a physical value back into data bytes. Out of range values
    /// saturate.
    pub fn encode(self, value: f64) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let byte = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let word = |v: f64| (v.round().clamp(0.0, 65535.0) as u16).to_be_bytes().to_vec();
        match self {
            Pid::EngineLoad | Pid::ThrottlePos | Pid::FuelLevel => vec![byte(value * 255.0 / 100.0)],
            Pid::CoolantTemp | Pid::IntakeAirTemp => vec![byte(value + 40.0)],
            Pid::Rpm => word(value * 4.0),
            Pid::Speed => vec![byte(value)],
            Pid::Maf => word(value * 100.0),
            Pid::ControlModuleVoltage => word(value * 1000.0),
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors reported by the adapter in place of data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// The vehicle did not answer the request
    NoData,
    /// The adapter could not reach the vehicle bus
    UnableToConnect,
    /// The adapter did not understand the request
    Unknown,
    /// Any other adapter error text (`CAN ERROR`, `BUS INIT: ...ERROR`, ...)
    Adapter(String),
    /// The response did not have the expected shape
    Malformed(String),
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => write!(f, "NO DATA"),
            Self::UnableToConnect => write!(f, "UNABLE TO CONNECT"),
            Self::Unknown => write!(f, "unknown command"),
            Self::Adapter(msg) => write!(f, "adapter error: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for ResponseError {}

/// Check the text of a response for adapter error messages
pub fn check_response(data: &[u8]) -> Result<(), ResponseError> {
    let text = String::from_utf8_lossy(data).to_uppercase();
    for line in text.split(['\r', '\n', '>']).map(str::trim) {
        if line.is_empty() || line.starts_with("SEARCHING") {
            continue;
        }
        if line == "?" {
            return Err(ResponseError::Unknown);
        }
        if line.contains("NO DATA") {
            return Err(ResponseError::NoData);
        }
        if line.contains("UNABLE TO CONNECT") {
            return Err(ResponseError::UnableToConnect);
        }
        if line.contains("ERROR") || line == "STOPPED" || line.starts_with("BUFFER FULL") {
            return Err(ResponseError::Adapter(line.to_string()));
        }
    }
    Ok(())
}

/// One line of hex data from a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexLine {
    /// ISO-TP frame index when the adapter prefixed the line with `N:`
    pub frame: Option<u8>,
    pub bytes: Vec<u8>,
}

/// Split a response into its hex data lines, accepting both spaced and
/// compact formatting. Non-hex lines (`SEARCHING...`, `OK`) are skipped.
pub fn parse_hex_lines(data: &[u8]) -> Vec<HexLine> {
    let text = String::from_utf8_lossy(data);
    let mut lines = Vec::new();
    for raw in text.split(['\r', '\n', '>']) {
        let mut line = raw.trim();
        let mut frame = None;
        if let Some((prefix, rest)) = line.split_once(':') {
            let prefix = prefix.trim();
            if prefix.len() == 1 {
                if let Some(index) = prefix.chars().next().and_then(|c| c.to_digit(16)) {
                    frame = u8::try_from(index).ok();
                    line = rest.trim();
                }
            }
        }
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() || compact.len() % 2 != 0 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let bytes = (0..compact.len())
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&compact[i..i + 2], 16).ok())
            .collect();
        lines.push(HexLine { frame, bytes });
    }
    lines
}

/// Extract the data bytes for a Mode 01 PID from a response.
///
/// Looks for a line starting with `41 <pid>` and returns the bytes after it.
pub fn extract_pid_data(data: &[u8], pid: u8) -> Option<Vec<u8>> {
    parse_hex_lines(data)
        .into_iter()
        .find(|line| line.bytes.len() > 2 && line.bytes[0] == 0x41 && line.bytes[1] == pid)
        .map(|line| line.bytes[2..].to_vec())
}

/// Decode a Mode 01 response into the physical value for `pid`
pub fn decode_pid_response(data: &[u8], pid: Pid) -> Result<f64, ResponseError> {
    check_response(data)?;
    let bytes = extract_pid_data(data, pid.code())
        .ok_or_else(|| ResponseError::Malformed(format!("no 41 {:02X} line", pid.code())))?;
    pid.decode(&bytes)
        .ok_or_else(|| ResponseError::Malformed(format!("short data for {pid}")))
}

/// Decode a "PIDs supported" bitmap (PID 00, 20, 40, ...) into PID codes.
///
/// Bit 7 of the first byte is `base + 1`.
pub fn decode_supported_pids(base: u8, bitmap: &[u8]) -> Vec<u8> {
    let mut pids = Vec::new();
    for (byte_index, byte) in bitmap.iter().take(4).enumerate() {
        for bit in 0..8u8 {
            if byte & (0x80 >> bit) != 0 {
                #[allow(clippy::cast_possible_truncation)]
                let offset = (byte_index as u8) * 8 + bit + 1;
                pids.push(base.wrapping_add(offset));
            }
        }
    }
    pids
}

/// Build a "PIDs supported" bitmap for the range starting at `base`
pub fn encode_supported_pids(base: u8, pids: &[u8]) -> [u8; 4] {
    let mut bitmap = [0u8; 4];
    for &pid in pids {
        if pid <= base || u16::from(pid) > u16::from(base) + 32 {
            continue;
        }
        let offset = pid - base - 1;
        bitmap[usize::from(offset / 8)] |= 0x80 >> (offset % 8);
    }
    bitmap
}

/// The three DTC families an OBD-II vehicle reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DtcKind {
    /// Mode 03: confirmed codes
    Stored,
    /// Mode 07: codes detected during the current or last drive cycle
    Pending,
    /// Mode 0A: codes that a clear request cannot erase
    Permanent,
}

impl DtcKind {
    pub const ALL: [DtcKind; 3] = [DtcKind::Stored, DtcKind::Pending, DtcKind::Permanent];

    pub const fn mode(self) -> u8 {
        match self {
            DtcKind::Stored => 0x03,
            DtcKind::Pending => 0x07,
            DtcKind::Permanent => 0x0A,
        }
    }

    pub const fn response_mode(self) -> u8 {
        self.mode() + 0x40
    }

    pub fn request(self) -> String {
        format!("{:02X}", self.mode())
    }
}

/// Mode 04: clear stored and pending codes
pub const CLEAR_DTC_REQUEST: &str = "04";

/// Whether the response acknowledges a Mode 04 clear
pub fn is_clear_ack(data: &[u8]) -> bool {
    parse_hex_lines(data)
        .iter()
        .any(|line| line.bytes.first() == Some(&0x44))
}

/// Decode one DTC from its two raw bytes.
///
/// Bits 7-6 of the first byte select the system letter (P, C, B, U), bits
/// 5-4 the first digit, and the remaining 12 bits the last three hex digits.
/// Returns `None` for `00 00`, which pads a response.
pub fn decode_dtc_bytes(a: u8, b: u8) -> Option<String> {
    if a == 0 && b == 0 {
        return None;
    }
    let system = match a >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    let first = (a >> 4) & 0x03;
    let second = a & 0x0F;
    Some(format!("{system}{first}{second:X}{b:02X}"))
}

/// Encode a DTC string such as `P0133` into its two raw bytes
pub fn encode_dtc(code: &str) -> Option<[u8; 2]> {
    let mut chars = code.chars();
    let system: u8 = match chars.next()?.to_ascii_uppercase() {
        'P' => 0,
        'C' => 1,
        'B' => 2,
        'U' => 3,
        _ => return None,
    };
    let rest = chars.as_str();
    if !rest.is_ascii() || rest.len() != 4 {
        return None;
    }
    let first = rest[0..1].parse::<u8>().ok().filter(|d| *d <= 3)?;
    let second = u8::from_str_radix(&rest[1..2], 16).ok()?;
    let b = u8::from_str_radix(&rest[2..4], 16).ok()?;
    Some([(system << 6) | (first << 4) | second, b])
}

/// Parse a Mode 03/07/0A response into DTC strings.
///
/// Handles both single-line answers (one per ECU) and multi-frame ISO-TP
/// answers where the adapter prints a byte count followed by `0:`, `1:`, ...
/// lines. CAN answers carry a code count after the mode byte, detected by
/// the odd number of bytes that remain.
pub fn parse_dtc_response(data: &[u8], kind: DtcKind) -> Result<Vec<String>, ResponseError> {
    match check_response(data) {
        // No codes is reported as NO DATA by some vehicles
        Err(ResponseError::NoData) => return Ok(Vec::new()),
        Err(e) => return Err(e),
        Ok(()) => {}
    }

    let lines = parse_hex_lines(data);
    let mut messages: Vec<Vec<u8>> = Vec::new();
    if lines.iter().any(|line| line.frame.is_some()) {
        let joined = lines
            .into_iter()
            .filter(|line| line.frame.is_some())
            .flat_map(|line| line.bytes)
            .collect();
        messages.push(joined);
    } else {
        messages.extend(lines.into_iter().map(|line| line.bytes));
    }

    let mut codes = Vec::new();
    let mut matched = false;
    for message in messages {
        let Some((&mode, rest)) = message.split_first() else {
            continue;
        };
        if mode != kind.response_mode() {
            continue;
        }
        matched = true;
        let payload = if rest.len() % 2 == 1 { &rest[1..] } else { rest };
        for pair in payload.chunks_exact(2) {
            if let Some(code) = decode_dtc_bytes(pair[0], pair[1]) {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
    }

    if matched {
        Ok(codes)
    } else {
        Err(ResponseError::Malformed(format!(
            "no {:02X} line in DTC response",
            kind.response_mode()
        )))
    }
}

const DTC_DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance Problem"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0117", "Engine Coolant Temperature Circuit Low Input"),
    ("P0118", "Engine Coolant Temperature Circuit High Input"),
    ("P0120", "Throttle Position Sensor/Switch A Circuit Malfunction"),
    ("P0128", "Coolant Thermostat (Coolant Temperature Below Thermostat Regulating Temperature)"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1 Sensor 1)"),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1 Sensor 1)"),
    ("P0138", "O2 Sensor Circuit High Voltage (Bank 1 Sensor 2)"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0335", "Crankshaft Position Sensor A Circuit Malfunction"),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0442", "Evaporative Emission Control System Leak Detected (small leak)"),
    ("P0455", "Evaporative Emission Control System Leak Detected (no purge flow or large leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0562", "System Voltage Low"),
    ("P0563", "System Voltage High"),
    ("P0700", "Transmission Control System Malfunction"),
    ("U0100", "Lost Communication With ECM/PCM A"),
];

/// Fallback text for codes without a known description
pub const UNKNOWN_DTC_DESCRIPTION: &str = "Unknown error code";

/// Human-readable description of a DTC
pub fn dtc_description(code: &str) -> &'static str {
    DTC_DESCRIPTIONS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map_or(UNKNOWN_DTC_DESCRIPTION, |(_, text)| text)
}
