//! Gauge sweep shown while the engine warms up.

/// Ramp length in fast ticks
pub const RAMP_STEPS: u32 = 10;
pub const SPEED_MAX: f64 = 200.0;
pub const RPM_MAX: f64 = 8000.0;
pub const FUEL_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationPhase {
    RampingUp,
    RampingDown,
    Finished,
}

/// Values to show for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationFrame {
    pub speed: f64,
    pub rpm: f64,
    /// Drives the fuel level gauge
    pub fuel_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    current: f64,
    max: f64,
    step: f64,
}

impl Ramp {
    fn new(max: f64) -> Self {
        Self {
            current: 0.0,
            max,
            step: max / f64::from(RAMP_STEPS),
        }
    }

    fn up(&mut self) {
        self.current = (self.current + self.step).min(self.max);
    }

    fn down(&mut self) {
        self.current = (self.current - self.step).max(0.0);
    }
}

/// Sweeps speed, RPM and fuel from zero to full scale and back once
#[derive(Debug, Clone)]
pub struct StartupAnimator {
    phase: AnimationPhase,
    speed: Ramp,
    rpm: Ramp,
    fuel: Ramp,
}

impl Default for StartupAnimator {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupAnimator {
    pub fn new() -> Self {
        Self {
            phase: AnimationPhase::RampingUp,
            speed: Ramp::new(SPEED_MAX),
            rpm: Ramp::new(RPM_MAX),
            fuel: Ramp::new(FUEL_MAX),
        }
    }

    /// An animator that has already finished, for when the sweep is off
    pub fn disabled() -> Self {
        Self {
            phase: AnimationPhase::Finished,
            ..Self::new()
        }
    }

    pub fn phase(&self) -> AnimationPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == AnimationPhase::Finished
    }

    fn frame(&self) -> AnimationFrame {
        AnimationFrame {
            speed: self.speed.current,
            rpm: self.rpm.current,
            fuel_level: self.fuel.current,
        }
    }

    fn ramps(&mut self) -> [&mut Ramp; 3] {
        [&mut self.speed, &mut self.rpm, &mut self.fuel]
    }

    /// Advance one fast tick. Returns the values to show before stepping,
    /// or `None` once finished.
    pub fn tick(&mut self) -> Option<AnimationFrame> {
        let frame = self.frame();
        match self.phase {
            AnimationPhase::RampingUp => {
                self.ramps().into_iter().for_each(Ramp::up);
                if self.ramps().iter().all(|r| r.current >= r.max) {
                    self.phase = AnimationPhase::RampingDown;
                }
            }
            AnimationPhase::RampingDown => {
                self.ramps().into_iter().for_each(Ramp::down);
                if self.ramps().iter().all(|r| r.current <= 0.0) {
                    self.phase = AnimationPhase::Finished;
                }
            }
            AnimationPhase::Finished => return None,
        }
        Some(frame)
    }
}
