//! Instantaneous fuel consumption from MAF and vehicle speed.

use crate::parameter::round_to;

/// Stoichiometric air-fuel ratio for petrol
pub const DEFAULT_AFR: f64 = 14.7;
/// Petrol density in grams per litre
pub const DEFAULT_FUEL_DENSITY_G_PER_L: f64 = 720.0;

/// Litres per 100 km, rounded to two decimals.
///
/// Fuel flow in L/h is `maf * 3600 / (afr * density)`; normalising by speed
/// gives `flow * 100 / speed`. Returns exactly `0.0` when either input is
/// not positive.
pub fn estimate(maf_grams_per_sec: f64, speed_kph: f64, afr: f64, fuel_density_g_per_l: f64) -> f64 {
    if maf_grams_per_sec <= 0.0 || speed_kph <= 0.0 {
        return 0.0;
    }
    let fuel_flow_lph = (maf_grams_per_sec * 3600.0) / (afr * fuel_density_g_per_l);
    let l_per_100km = (fuel_flow_lph * 100.0) / speed_kph;
    round_to(l_per_100km, 2)
}

/// [`estimate`] with fixed fuel properties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuelConsumptionEstimator {
    pub afr: f64,
    pub fuel_density_g_per_l: f64,
}

impl Default for FuelConsumptionEstimator {
    fn default() -> Self {
        Self {
            afr: DEFAULT_AFR,
            fuel_density_g_per_l: DEFAULT_FUEL_DENSITY_G_PER_L,
        }
    }
}

impl FuelConsumptionEstimator {
    pub const fn new(afr: f64, fuel_density_g_per_l: f64) -> Self {
        Self {
            afr,
            fuel_density_g_per_l,
        }
    }

    pub fn estimate(&self, maf_grams_per_sec: f64, speed_kph: f64) -> f64 {
        estimate(maf_grams_per_sec, speed_kph, self.afr, self.fuel_density_g_per_l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_two_step_formula() {
        let estimator = FuelConsumptionEstimator::default();
        for (maf, speed) in [(5.0_f64, 50.0_f64), (12.3, 88.0), (0.8, 3.0), (40.0, 130.0)] {
            let flow = maf * 3600.0 / (14.7 * 720.0);
            let expected = (flow * 100.0 / speed * 100.0).round() / 100.0;
            assert_eq!(estimator.estimate(maf, speed), expected);
        }
    }

    #[test]
    fn test_known_value() {
        // 5 g/s at 50 km/h: 1.7007 L/h, 3.4014 L/100km
        assert_eq!(estimate(5.0, 50.0, DEFAULT_AFR, DEFAULT_FUEL_DENSITY_G_PER_L), 3.4);
    }

    #[test]
    fn test_non_positive_inputs_give_zero() {
        let estimator = FuelConsumptionEstimator::default();
        assert_eq!(estimator.estimate(0.0, 50.0), 0.0);
        assert_eq!(estimator.estimate(5.0, 0.0), 0.0);
        assert_eq!(estimator.estimate(-1.0, 50.0), 0.0);
        assert_eq!(estimator.estimate(5.0, -3.0), 0.0);
    }

    #[test]
    fn test_custom_fuel_properties() {
        // Diesel: AFR 14.5, 832 g/L
        let diesel = FuelConsumptionEstimator::new(14.5, 832.0);
        assert!(diesel.estimate(10.0, 100.0) < FuelConsumptionEstimator::default().estimate(10.0, 100.0));
    }
}
