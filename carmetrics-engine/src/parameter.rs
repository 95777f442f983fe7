//! Parameter names and the values published for them.

use carmetrics_elm327_lib::Pid;
use serde::{Serialize, Serializer};
use std::fmt;

/// Every value the engine publishes. Names match the log column names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parameter {
    Speed,
    Rpm,
    ThrottlePos,
    EngineLoad,
    Maf,
    CoolantTemp,
    Voltage,
    /// Fuel gauge shown next to the speedometer
    Fuel,
    FuelLevel,
    FuelConsumption,
    OilTemp,
    Battery,
    Brakes,
    SteeringAngle,
    Gear,
    BrakePressure,
    AcceleratorPedal,
    WheelFl,
    WheelFr,
    WheelRl,
    WheelRr,
    EngineWarning,
    GeneralWarning,
}

impl Parameter {
    pub const ALL: [Parameter; 23] = [
        Parameter::Speed,
        Parameter::Rpm,
        Parameter::ThrottlePos,
        Parameter::EngineLoad,
        Parameter::Maf,
        Parameter::CoolantTemp,
        Parameter::Voltage,
        Parameter::Fuel,
        Parameter::FuelLevel,
        Parameter::FuelConsumption,
        Parameter::OilTemp,
        Parameter::Battery,
        Parameter::Brakes,
        Parameter::SteeringAngle,
        Parameter::Gear,
        Parameter::BrakePressure,
        Parameter::AcceleratorPedal,
        Parameter::WheelFl,
        Parameter::WheelFr,
        Parameter::WheelRl,
        Parameter::WheelRr,
        Parameter::EngineWarning,
        Parameter::GeneralWarning,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Parameter::Speed => "SPEED",
            Parameter::Rpm => "RPM",
            Parameter::ThrottlePos => "THROTTLE_POS",
            Parameter::EngineLoad => "ENGINE_LOAD",
            Parameter::Maf => "MAF",
            Parameter::CoolantTemp => "COOLANT_TEMP",
            Parameter::Voltage => "VOLTAGE",
            Parameter::Fuel => "FUEL",
            Parameter::FuelLevel => "FUEL_LEVEL",
            Parameter::FuelConsumption => "FUEL_CONSUMPTION",
            Parameter::OilTemp => "OIL_TEMP",
            Parameter::Battery => "BATTERY",
            Parameter::Brakes => "BRAKES",
            Parameter::SteeringAngle => "STEERING_ANGLE",
            Parameter::Gear => "GEAR",
            Parameter::BrakePressure => "BRAKE_PRESSURE",
            Parameter::AcceleratorPedal => "ACCELERATOR_PEDAL",
            Parameter::WheelFl => "WHEEL_FL",
            Parameter::WheelFr => "WHEEL_FR",
            Parameter::WheelRl => "WHEEL_RL",
            Parameter::WheelRr => "WHEEL_RR",
            Parameter::EngineWarning => "ENGINE_WARNING",
            Parameter::GeneralWarning => "GENERAL_WARNING",
        }
    }

    pub fn from_name(name: &str) -> Option<Parameter> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// The Mode 01 PID that measures this parameter, if the adapter can
    pub const fn pid(self) -> Option<Pid> {
        match self {
            Parameter::Speed => Some(Pid::Speed),
            Parameter::Rpm => Some(Pid::Rpm),
            Parameter::ThrottlePos => Some(Pid::ThrottlePos),
            Parameter::EngineLoad => Some(Pid::EngineLoad),
            Parameter::Maf => Some(Pid::Maf),
            Parameter::CoolantTemp => Some(Pid::CoolantTemp),
            Parameter::Voltage => Some(Pid::ControlModuleVoltage),
            Parameter::FuelLevel => Some(Pid::FuelLevel),
            _ => None,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Parameter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// A numeric or categorical reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Flag(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// Round to a number of decimal places
pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
