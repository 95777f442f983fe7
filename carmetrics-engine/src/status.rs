//! Ignition / engine-running detection.

use crate::logger::LogRow;
use serde::Serialize;

/// Voltage above which the ignition counts as on
pub const IGNITION_VOLTAGE: f64 = 9.0;
pub const RUNNING_RPM: f64 = 200.0;
pub const RUNNING_MAF: f64 = 0.5;
pub const RUNNING_SPEED: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StatusFlags {
    pub connected: bool,
    pub ignition_on: bool,
    pub engine_running: bool,
    pub voltage: Option<f64>,
    pub rpm: Option<f64>,
}

impl StatusFlags {
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Flags for a connected vehicle from its latest readings
    pub fn from_readings(voltage: Option<f64>, rpm: Option<f64>, maf: Option<f64>, speed: Option<f64>) -> Self {
        let above = |value: Option<f64>, threshold: f64| value.is_some_and(|v| v > threshold);
        Self {
            connected: true,
            ignition_on: above(voltage, IGNITION_VOLTAGE),
            engine_running: above(rpm, RUNNING_RPM) || above(maf, RUNNING_MAF) || above(speed, RUNNING_SPEED),
            voltage,
            rpm,
        }
    }

    pub fn to_log_row(&self) -> LogRow {
        let mut row = LogRow::new()
            .with("connected", self.connected)
            .with("ignition_on", self.ignition_on)
            .with("engine_running", self.engine_running);
        if let Some(voltage) = self.voltage {
            row = row.with("VOLTAGE", voltage);
        }
        if let Some(rpm) = self.rpm {
            row = row.with("RPM", rpm);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Value;

    #[test]
    fn test_parked_with_ignition_on() {
        let flags = StatusFlags::from_readings(Some(12.4), Some(0.0), Some(0.0), Some(0.0));
        assert!(flags.connected);
        assert!(flags.ignition_on);
        assert!(!flags.engine_running);
    }

    #[test]
    fn test_any_running_signal_counts() {
        assert!(StatusFlags::from_readings(None, Some(750.0), None, None).engine_running);
        assert!(StatusFlags::from_readings(None, None, Some(2.1), None).engine_running);
        assert!(StatusFlags::from_readings(None, None, None, Some(12.0)).engine_running);
        assert!(!StatusFlags::from_readings(Some(8.5), None, None, None).ignition_on);
    }

    #[test]
    fn test_disconnected_has_no_numbers() {
        let flags = StatusFlags::disconnected();
        assert!(!flags.connected && !flags.ignition_on && !flags.engine_running);
        assert_eq!(flags.voltage, None);
        assert_eq!(flags.rpm, None);
    }

    #[test]
    fn test_log_row_fills_voltage_and_rpm_columns() {
        let row = StatusFlags::from_readings(Some(13.8), Some(900.0), None, None).to_log_row();
        assert_eq!(row.fields.get("VOLTAGE"), Some(&Value::Number(13.8)));
        assert_eq!(row.fields.get("RPM"), Some(&Value::Number(900.0)));
        assert_eq!(row.fields.get("engine_running"), Some(&Value::Flag(true)));
    }
}
