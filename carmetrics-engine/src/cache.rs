//! Latest reading per parameter.

use crate::parameter::{Parameter, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// One observed value
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub captured_at: Instant,
}

/// Thread-safe map from parameter to its latest [`Reading`].
///
/// The poller is the only writer. A whole tick is published under one lock
/// acquisition, so readers copying a [`snapshot`](Self::snapshot) never see
/// values from two different ticks.
#[derive(Debug, Default)]
pub struct LiveValueCache {
    readings: Mutex<HashMap<Parameter, Reading>>,
}

impl LiveValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Parameter, Reading>> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, parameter: Parameter) -> Option<Reading> {
        self.lock().get(&parameter).cloned()
    }

    pub fn value(&self, parameter: Parameter) -> Option<Value> {
        self.lock().get(&parameter).map(|r| r.value.clone())
    }

    pub fn number(&self, parameter: Parameter) -> Option<f64> {
        self.lock().get(&parameter).and_then(|r| r.value.as_f64())
    }

    pub fn set(&self, parameter: Parameter, value: Value) {
        self.publish(&[(parameter, value)]);
    }

    /// Replace several readings at once, stamped with the same capture time
    pub fn publish(&self, values: &[(Parameter, Value)]) {
        let captured_at = Instant::now();
        let mut readings = self.lock();
        for (parameter, value) in values {
            readings.insert(
                *parameter,
                Reading {
                    value: value.clone(),
                    captured_at,
                },
            );
        }
    }

    /// Copy of every reading
    pub fn snapshot(&self) -> HashMap<Parameter, Reading> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_last_write_wins() {
        let cache = LiveValueCache::new();
        assert!(cache.is_empty());
        cache.set(Parameter::Speed, Value::Number(10.0));
        cache.set(Parameter::Speed, Value::Number(20.0));
        assert_eq!(cache.number(Parameter::Speed), Some(20.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.value(Parameter::Rpm), None);
    }

    #[test]
    fn test_batch_shares_capture_time() {
        let cache = LiveValueCache::new();
        cache.publish(&[
            (Parameter::Speed, Value::Number(1.0)),
            (Parameter::Gear, Value::from("N")),
        ]);
        let speed = cache.get(Parameter::Speed).unwrap();
        let gear = cache.get(Parameter::Gear).unwrap();
        assert_eq!(speed.captured_at, gear.captured_at);
        assert_eq!(gear.value, Value::Text("N".into()));
    }

    #[test]
    fn test_readers_never_see_mixed_ticks() {
        let cache = Arc::new(LiveValueCache::new());
        let done = Arc::new(AtomicBool::new(false));
        let parameters = [
            Parameter::Speed,
            Parameter::Rpm,
            Parameter::ThrottlePos,
            Parameter::EngineLoad,
            Parameter::Maf,
        ];
        cache.publish(&parameters.map(|p| (p, Value::Number(0.0))));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut checked = 0u32;
                    while !done.load(Ordering::Relaxed) || checked == 0 {
                        let snapshot = cache.snapshot();
                        let first = snapshot[&Parameter::Speed].value.clone();
                        for p in parameters {
                            assert_eq!(snapshot[&p].value, first, "mixed tick values");
                        }
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        for tick in 1..=2000u32 {
            let value = Value::Number(f64::from(tick));
            let batch: Vec<_> = parameters.iter().map(|&p| (p, value.clone())).collect();
            cache.publish(&batch);
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        assert_eq!(cache.number(Parameter::Maf), Some(2000.0));
    }
}
