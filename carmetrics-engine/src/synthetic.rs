//! Plausible random readings used while no vehicle is connected.

use crate::parameter::round_to;
use rand::Rng;
use std::ops::RangeInclusive;

pub const SPEED_RANGE: RangeInclusive<f64> = 0.0..=180.0;
pub const RPM_RANGE: RangeInclusive<f64> = 700.0..=5000.0;
pub const THROTTLE_RANGE: RangeInclusive<f64> = 0.0..=100.0;
pub const LOAD_RANGE: RangeInclusive<f64> = 0.0..=100.0;
pub const FUEL_RANGE: RangeInclusive<f64> = 20.0..=90.0;
pub const CONSUMPTION_RANGE: RangeInclusive<f64> = 3.0..=12.0;
pub const BRAKES_RANGE: RangeInclusive<f64> = 0.0..=100.0;

pub const BATTERY_RANGE: RangeInclusive<f64> = 12.0..=14.5;
pub const COOLANT_RANGE: RangeInclusive<i32> = 70..=110;
pub const OIL_RANGE: RangeInclusive<i32> = 80..=120;
pub const FUEL_LEVEL_RANGE: RangeInclusive<i32> = 0..=100;
/// Fuel level when the adapter cannot measure it
pub const CONNECTED_FUEL_LEVEL_RANGE: RangeInclusive<i32> = 20..=90;
/// Oil temperature offset from coolant temperature
pub const OIL_JITTER: RangeInclusive<i32> = -5..=5;

/// One fast tick of simulated instruments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastSample {
    pub speed: f64,
    pub rpm: f64,
    pub throttle: f64,
    pub engine_load: f64,
    pub fuel: f64,
    pub fuel_consumption: f64,
}

/// One slow tick of simulated housekeeping values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowSample {
    pub battery: f64,
    pub coolant: f64,
    pub oil_temp: f64,
    pub fuel_level: f64,
}

/// Random source for every simulated value
#[derive(Debug, Clone)]
pub struct SyntheticSource<R> {
    rng: R,
}

impl<R: Rng> SyntheticSource<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    pub fn fast_sample(&mut self) -> FastSample {
        FastSample {
            speed: self.rng.gen_range(SPEED_RANGE),
            rpm: self.rng.gen_range(RPM_RANGE),
            throttle: self.rng.gen_range(THROTTLE_RANGE),
            engine_load: round_to(self.rng.gen_range(LOAD_RANGE), 2),
            fuel: self.fuel_gauge(),
            fuel_consumption: self.rng.gen_range(CONSUMPTION_RANGE),
        }
    }

    pub fn slow_sample(&mut self) -> SlowSample {
        SlowSample {
            battery: round_to(self.rng.gen_range(BATTERY_RANGE), 1),
            coolant: f64::from(self.rng.gen_range(COOLANT_RANGE)),
            oil_temp: f64::from(self.rng.gen_range(OIL_RANGE)),
            fuel_level: f64::from(self.rng.gen_range(FUEL_LEVEL_RANGE)),
        }
    }

    pub fn fuel_gauge(&mut self) -> f64 {
        self.rng.gen_range(FUEL_RANGE)
    }

    pub fn brakes(&mut self) -> f64 {
        self.rng.gen_range(BRAKES_RANGE)
    }

    /// Oil temperature derived from a live coolant reading
    pub fn oil_from_coolant(&mut self, coolant: f64) -> f64 {
        coolant + f64::from(self.rng.gen_range(OIL_JITTER))
    }

    pub fn connected_fuel_level(&mut self) -> f64 {
        f64::from(self.rng.gen_range(CONNECTED_FUEL_LEVEL_RANGE))
    }
}
