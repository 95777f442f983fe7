//! Interactive commands and event rendering for the terminal.

use carmetrics_engine::{LiveValueCache, Parameter, TelemetryEvent};
use std::fmt::Write as _;
use std::str::FromStr;

pub const HELP: &str = "\
commands:
  log start|stop|toggle   durable CSV logging
  dtc                     read trouble codes now
  clear                   clear stored and pending trouble codes
  snapshot                query every supported command
  status                  connection and ignition flags
  reconnect               reconnect to the adapter
  help                    this text
  quit                    stop and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Start,
    Stop,
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Log(LogAction),
    Dtc,
    Clear,
    Snapshot,
    Status,
    Reconnect,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<String> = line.split_whitespace().map(str::to_lowercase).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        Ok(match words.as_slice() {
            ["log"] | ["log", "toggle"] => Self::Log(LogAction::Toggle),
            ["log", "start"] => Self::Log(LogAction::Start),
            ["log", "stop"] => Self::Log(LogAction::Stop),
            ["dtc"] => Self::Dtc,
            ["clear"] => Self::Clear,
            ["snapshot"] => Self::Snapshot,
            ["status"] => Self::Status,
            ["reconnect"] => Self::Reconnect,
            ["help" | "?"] => Self::Help,
            ["quit" | "exit" | "q"] => Self::Quit,
            _ => return Err(format!("unknown command {:?}, try \"help\"", line.trim())),
        })
    }
}

/// Gauges shown on the dashboard line, with their units
const DASHBOARD: [(Parameter, &str); 6] = [
    (Parameter::Speed, "km/h"),
    (Parameter::Rpm, "rpm"),
    (Parameter::FuelConsumption, "L/100km"),
    (Parameter::CoolantTemp, "°C"),
    (Parameter::Battery, "V"),
    (Parameter::FuelLevel, "%"),
];

/// One line summarizing the current gauges
pub fn dashboard_line(cache: &LiveValueCache) -> String {
    let mut line = String::new();
    for (parameter, unit) in DASHBOARD {
        if !line.is_empty() {
            line.push_str(" | ");
        }
        match cache.number(parameter) {
            Some(value) => {
                let _ = write!(line, "{parameter} {value:.1} {unit}");
            }
            None => {
                let _ = write!(line, "{parameter} -");
            }
        }
    }
    line
}

/// Renders events, remembering what was already shown
#[derive(Debug, Default)]
pub struct EventPrinter {
    warnings: Option<(bool, bool)>,
    last_activity: Option<String>,
}

impl EventPrinter {
    /// Lines to print for `event`. Value and series events are covered by
    /// the dashboard line and give nothing here.
    pub fn render(&mut self, event: &TelemetryEvent) -> Vec<String> {
        match event {
            TelemetryEvent::Value { .. } | TelemetryEvent::Series(_) => Vec::new(),
            TelemetryEvent::Connection(status) => vec![format!("connection: {status}")],
            TelemetryEvent::Logging(on) => vec![format!("logging: {}", if *on { "on" } else { "off" })],
            TelemetryEvent::DtcCodes(codes) if codes.is_empty() => vec!["trouble codes: none".to_string()],
            TelemetryEvent::DtcCodes(codes) => {
                let mut lines = vec![format!("trouble codes ({}):", codes.len())];
                lines.extend(codes.iter().map(|code| format!("  {code}")));
                lines
            }
            TelemetryEvent::Warnings { engine, general } => {
                if self.warnings.replace((*engine, *general)) == Some((*engine, *general)) {
                    return Vec::new();
                }
                vec![format!(
                    "warnings: engine {} | general {}",
                    if *engine { "ON" } else { "off" },
                    if *general { "ON" } else { "off" }
                )]
            }
            TelemetryEvent::Activity(lines) => {
                let start = self
                    .last_activity
                    .as_ref()
                    .and_then(|last| lines.iter().rposition(|line| line == last))
                    .map_or(0, |i| i + 1);
                if let Some(last) = lines.last() {
                    self.last_activity = Some(last.clone());
                }
                lines[start..].to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carmetrics_engine::{ConnectionStatus, Value};

    #[test]
    fn test_parses_commands() {
        assert_eq!("log start".parse(), Ok(ConsoleCommand::Log(LogAction::Start)));
        assert_eq!("  LOG  ".parse(), Ok(ConsoleCommand::Log(LogAction::Toggle)));
        assert_eq!("dtc".parse(), Ok(ConsoleCommand::Dtc));
        assert_eq!("exit".parse(), Ok(ConsoleCommand::Quit));
        assert!("log sideways".parse::<ConsoleCommand>().is_err());
        assert!("".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_dashboard_marks_missing_values() {
        let cache = LiveValueCache::new();
        cache.set(Parameter::Speed, Value::Number(72.0));
        let line = dashboard_line(&cache);
        assert!(line.starts_with("SPEED 72.0 km/h | RPM -"));
    }

    #[test]
    fn test_warnings_print_only_on_change() {
        let mut printer = EventPrinter::default();
        let event = TelemetryEvent::Warnings { engine: false, general: true };
        assert_eq!(printer.render(&event).len(), 1);
        assert!(printer.render(&event).is_empty());
        let cleared = TelemetryEvent::Warnings { engine: false, general: false };
        assert_eq!(printer.render(&cleared), vec!["warnings: engine off | general off"]);
    }

    #[test]
    fn test_activity_prints_new_lines_once() {
        let mut printer = EventPrinter::default();
        let first = TelemetryEvent::Activity(vec!["a".into(), "b".into()]);
        assert_eq!(printer.render(&first), vec!["a", "b"]);
        let second = TelemetryEvent::Activity(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(printer.render(&second), vec!["c"]);
        assert!(printer.render(&second).is_empty());
    }

    #[test]
    fn test_connection_and_codes_render() {
        let mut printer = EventPrinter::default();
        assert_eq!(
            printer.render(&TelemetryEvent::Connection(ConnectionStatus::Connected)),
            vec!["connection: Car Connected"]
        );
        assert_eq!(
            printer.render(&TelemetryEvent::DtcCodes(vec!["P0171 - System Too Lean (Bank 1)".into()])),
            vec!["trouble codes (1):", "  P0171 - System Too Lean (Bank 1)"]
        );
    }
}
