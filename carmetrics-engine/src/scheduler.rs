//! The poller thread.
//!
//! One thread owns the transport and runs four independent cadences on a
//! single clock: fast (instruments), slow (housekeeping), diagnostic
//! (trouble codes) and activity (publishing the activity log). Commands
//! from [`Engine`](crate::Engine) handles arrive over a channel and run
//! between ticks, so the transport is never used from two threads.

use crate::animator::{AnimationFrame, StartupAnimator};
use crate::config::Config;
use crate::dtc::{DtcManager, DtcSnapshot};
use crate::engine::Shared;
use crate::events::TelemetryEvent;
use crate::fuel::FuelConsumptionEstimator;
use crate::logger::{LogRow, LoggingError};
use crate::parameter::{round_to, Parameter, Value};
use crate::series::SeriesAggregator;
use crate::status::StatusFlags;
use crate::synthetic::SyntheticSource;
use crate::transport::{Command, ConnectionStatus, ParseError, Response, Transport, TransportError};
use carmetrics_elm327_lib::{dtc_description, Pid};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

/// Parameters queried on every fast tick while connected
pub const FAST_PARAMETERS: [Parameter; 7] = [
    Parameter::Rpm,
    Parameter::Speed,
    Parameter::ThrottlePos,
    Parameter::EngineLoad,
    Parameter::Maf,
    Parameter::CoolantTemp,
    Parameter::Voltage,
];

/// Requests handled on the poller thread
pub(crate) enum EngineCommand {
    StartLogging(oneshot::Sender<Result<PathBuf, LoggingError>>),
    StopLogging(oneshot::Sender<Result<PathBuf, LoggingError>>),
    ToggleLogging(oneshot::Sender<Result<bool, LoggingError>>),
    FetchDtc(oneshot::Sender<DtcSnapshot>),
    ClearDtc(oneshot::Sender<bool>),
    FullSnapshot(oneshot::Sender<IndexMap<String, String>>),
    Reconnect(oneshot::Sender<ConnectionStatus>),
    Stop,
}

/// Chassis values the adapter cannot read, published as fixed placeholders
fn chassis_placeholders() -> [(Parameter, Value); 8] {
    [
        (Parameter::SteeringAngle, Value::Number(0.0)),
        (Parameter::Gear, Value::from("N")),
        (Parameter::BrakePressure, Value::Number(0.0)),
        (Parameter::AcceleratorPedal, Value::Number(0.0)),
        (Parameter::WheelFl, Value::Number(0.0)),
        (Parameter::WheelFr, Value::Number(0.0)),
        (Parameter::WheelRl, Value::Number(0.0)),
        (Parameter::WheelRr, Value::Number(0.0)),
    ]
}

fn number_of(values: &[(Parameter, Value)], parameter: Parameter) -> Option<f64> {
    values
        .iter()
        .find(|(p, _)| *p == parameter)
        .and_then(|(_, v)| v.as_f64())
}

fn describe_response(command: Command, response: &Response) -> String {
    match response {
        Response::Number(value) => format!("{value} {}", command.unit()).trim_end().to_string(),
        Response::Codes(codes) => codes
            .iter()
            .map(|code| format!("{code} - {}", dtc_description(code)))
            .collect::<Vec<_>>()
            .join(", "),
        Response::Ack => "OK".to_string(),
    }
}

/// A periodic deadline
#[derive(Debug, Clone, Copy)]
struct Cadence {
    period: Duration,
    next_due: Instant,
}

impl Cadence {
    fn new(period_ms: u64, now: Instant) -> Self {
        let period = Duration::from_millis(period_ms);
        Self {
            period,
            next_due: now + period,
        }
    }

    /// Whether the cadence is due; advances the deadline if so. A late
    /// tick does not cause a burst of catch-up ticks.
    fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due += self.period;
        if self.next_due <= now {
            self.next_due = now + self.period;
        }
        true
    }
}

pub(crate) struct PollingScheduler {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    config: Config,
    animator: StartupAnimator,
    series: SeriesAggregator,
    dtc: DtcManager,
    synthetic: SyntheticSource<StdRng>,
    estimator: FuelConsumptionEstimator,
    slow_failures: u32,
}

impl PollingScheduler {
    pub(crate) fn new(shared: Arc<Shared>, transport: Box<dyn Transport>, config: Config, rng: StdRng) -> Self {
        let animator = if config.startup_animation {
            StartupAnimator::new()
        } else {
            StartupAnimator::disabled()
        };
        let estimator = FuelConsumptionEstimator::new(config.fuel.afr, config.fuel.density_g_per_l);
        Self {
            shared,
            transport,
            config,
            animator,
            series: SeriesAggregator::new(),
            dtc: DtcManager::new(),
            synthetic: SyntheticSource::new(rng),
            estimator,
            slow_failures: 0,
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.status.load(Ordering::Acquire) == ConnectionStatus::Connected
    }

    /// Mirror the transport's status into the shared state, announcing
    /// changes
    fn sync_status(&mut self) {
        let status = self.transport.status();
        let previous = self.shared.status.swap(status, Ordering::AcqRel);
        if previous != status {
            info!("Connection status: {previous} -> {status}");
            self.shared.activity.record(format!("[OBD] Status: {status}"));
            self.shared.events.publish(&TelemetryEvent::Connection(status));
            self.slow_failures = 0;
        }
    }

    fn publish(&self, values: &[(Parameter, Value)]) {
        self.shared.cache.publish(values);
        self.shared.events.publish_values(values);
    }

    fn append_log(&self, row: LogRow) {
        if let Err(e) = self.shared.logger.append(row) {
            error!("Logging disabled: {e}");
            self.shared.activity.record(format!("[OBD-LOG] Logging stopped: {e}"));
            self.shared.events.publish(&TelemetryEvent::Logging(false));
        }
    }

    fn query_number(&mut self, parameter: Parameter) -> Result<Option<f64>, TransportError> {
        let Some(pid) = parameter.pid() else {
            return Ok(None);
        };
        match self.transport.query(Command::Pid(pid), true)? {
            Some(Response::Number(value)) => Ok(Some(value)),
            Some(other) => Err(ParseError::UnexpectedResponse {
                command: pid.name(),
                text: format!("{other:?}"),
            }
            .into()),
            None => Ok(None),
        }
    }

    /// Initial connection or a requested reconnect
    pub(crate) fn connect(&mut self) -> ConnectionStatus {
        let port = self.config.transport.port.clone();
        self.shared.activity.record(format!("[OBD] Connecting to {port} ..."));
        self.transport.close();
        let status = self.transport.connect(
            &port,
            self.config.transport.baudrate,
            self.config.transport.timeout(),
        );
        self.slow_failures = 0;
        if status == ConnectionStatus::Connected {
            self.shared.activity.record("[OBD] Connected to OBD-II adapter.");
        } else {
            warn!("Vehicle not connected ({status}), using simulated data");
            self.shared
                .activity
                .record(format!("[OBD] OBD-II adapter not connected ({status}).\nSwitching to simulated data..."));
        }
        self.sync_status();
        status
    }

    fn animation_tick(&self, frame: AnimationFrame) {
        self.publish(&[
            (Parameter::Speed, Value::Number(frame.speed)),
            (Parameter::Rpm, Value::Number(frame.rpm)),
            (Parameter::FuelLevel, Value::Number(frame.fuel_level)),
        ]);
    }

    pub(crate) fn fast_tick(&mut self) {
        if let Some(frame) = self.animator.tick() {
            self.animation_tick(frame);
            return;
        }

        let mut values: Vec<(Parameter, Value)> = Vec::with_capacity(20);
        let speed;
        let consumption;
        if self.is_connected() {
            for parameter in FAST_PARAMETERS {
                match self.query_number(parameter) {
                    Ok(Some(value)) => {
                        let value = if parameter == Parameter::EngineLoad {
                            round_to(value, 2)
                        } else {
                            value
                        };
                        values.push((parameter, Value::Number(value)));
                    }
                    Ok(None) => debug!("No data for {parameter}"),
                    Err(e) => {
                        warn!("Query {parameter} failed: {e}");
                        if e.is_link_failure() && self.transport.status() != ConnectionStatus::Connected {
                            break;
                        }
                    }
                }
            }
            speed = number_of(&values, Parameter::Speed);
            let maf = number_of(&values, Parameter::Maf);
            consumption = self.estimator.estimate(maf.unwrap_or(0.0), speed.unwrap_or(0.0));
            values.push((Parameter::FuelConsumption, Value::Number(consumption)));
            values.push((Parameter::Fuel, Value::Number(self.synthetic.fuel_gauge())));
            values.extend(chassis_placeholders());
        } else {
            let sample = self.synthetic.fast_sample();
            speed = Some(sample.speed);
            consumption = sample.fuel_consumption;
            values.extend([
                (Parameter::Speed, Value::Number(sample.speed)),
                (Parameter::Rpm, Value::Number(sample.rpm)),
                (Parameter::ThrottlePos, Value::Number(sample.throttle)),
                (Parameter::EngineLoad, Value::Number(sample.engine_load)),
                (Parameter::Fuel, Value::Number(sample.fuel)),
                (Parameter::FuelConsumption, Value::Number(consumption)),
            ]);
        }
        values.push((Parameter::Brakes, Value::Number(self.synthetic.brakes())));

        self.series.push(speed, Some(consumption));
        let series = self.series.snapshot();

        self.append_log(LogRow::from_values(&values));
        self.publish(&values);
        *self.shared.series.lock().unwrap_or_else(PoisonError::into_inner) = series.clone();
        self.shared.events.publish(&TelemetryEvent::Series(series));
        self.sync_status();
    }

    /// Query for the slow tick, remembering the first link failure
    fn slow_query(&mut self, parameter: Parameter, failure: &mut Option<TransportError>) -> Option<f64> {
        match self.query_number(parameter) {
            Ok(value) => value,
            Err(e) => {
                warn!("Slow query {parameter} failed: {e}");
                if e.is_link_failure() && failure.is_none() {
                    *failure = Some(e);
                }
                None
            }
        }
    }

    pub(crate) fn slow_tick(&mut self) {
        if !self.animator.is_finished() {
            return;
        }

        let mut values: Vec<(Parameter, Value)> = Vec::with_capacity(8);
        let flags = if self.is_connected() {
            let mut failure = None;
            let voltage = self.slow_query(Parameter::Voltage, &mut failure);
            let coolant = self.slow_query(Parameter::CoolantTemp, &mut failure);
            let fuel_level = if self
                .transport
                .supported_commands()
                .contains(&Command::Pid(Pid::FuelLevel))
            {
                self.slow_query(Parameter::FuelLevel, &mut failure)
            } else {
                Some(self.synthetic.connected_fuel_level())
            };

            if let Some(voltage) = voltage {
                values.push((Parameter::Battery, Value::Number(round_to(voltage, 1))));
            }
            if let Some(coolant) = coolant {
                values.push((Parameter::CoolantTemp, Value::Number(coolant)));
                let oil = self.synthetic.oil_from_coolant(coolant);
                values.push((Parameter::OilTemp, Value::Number(oil)));
            }
            if let Some(fuel_level) = fuel_level {
                values.push((Parameter::FuelLevel, Value::Number(fuel_level)));
            }

            let cache = &self.shared.cache;
            let flags = StatusFlags::from_readings(
                voltage,
                cache.number(Parameter::Rpm),
                cache.number(Parameter::Maf),
                cache.number(Parameter::Speed),
            );
            self.append_log(flags.to_log_row());

            if let Some(e) = failure {
                self.slow_failures += 1;
                self.shared.activity.record(format!("[OBD] Slow update error: {e}"));
                if self.slow_failures >= self.config.max_slow_failures {
                    warn!(
                        "{} consecutive slow updates failed, treating adapter as disconnected",
                        self.slow_failures
                    );
                    self.transport.close();
                }
            } else {
                self.slow_failures = 0;
            }
            flags
        } else {
            let sample = self.synthetic.slow_sample();
            values.extend([
                (Parameter::Battery, Value::Number(sample.battery)),
                (Parameter::CoolantTemp, Value::Number(sample.coolant)),
                (Parameter::OilTemp, Value::Number(sample.oil_temp)),
                (Parameter::FuelLevel, Value::Number(sample.fuel_level)),
            ]);
            StatusFlags::disconnected()
        };
        self.sync_status();

        *self
            .shared
            .status_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = if self.is_connected() {
            flags
        } else {
            StatusFlags::disconnected()
        };

        let engine = self.dtc.last().has_active_codes();
        let general = !self.is_connected();
        values.push((Parameter::EngineWarning, Value::Flag(engine)));
        values.push((Parameter::GeneralWarning, Value::Flag(general)));
        self.publish(&values);
        self.shared
            .events
            .publish(&TelemetryEvent::Warnings { engine, general });
    }

    /// Fetch trouble codes. Skipped while disconnected.
    pub(crate) fn diagnostic_tick(&mut self) -> DtcSnapshot {
        if !self.is_connected() {
            return DtcSnapshot::default();
        }
        match self.dtc.fetch_all(self.transport.as_mut()) {
            Ok(snapshot) => {
                let dtc = serde_json::to_string(&snapshot).unwrap_or_default();
                self.append_log(LogRow::new().with("DTC", dtc));
                self.shared
                    .events
                    .publish(&TelemetryEvent::DtcCodes(snapshot.all_entries()));
                snapshot
            }
            Err(e) => {
                warn!("Trouble code fetch failed: {e}");
                self.shared.activity.record(format!("[OBD] DTC fetch error: {e}"));
                self.sync_status();
                DtcSnapshot::default()
            }
        }
    }

    fn activity_tick(&self) {
        let lines = self.shared.activity.recent(crate::activity::ACTIVITY_PUBLISHED);
        self.shared.events.publish(&TelemetryEvent::Activity(lines));
    }

    pub(crate) fn clear_dtc(&mut self) -> bool {
        let connected = self.is_connected();
        match self.dtc.clear(self.transport.as_mut()) {
            Ok(cleared) => {
                if connected {
                    self.append_log(LogRow::new().with("CLEAR_DTC", true));
                }
                if cleared {
                    self.shared.activity.record("[OBD] Stored and pending trouble codes cleared");
                    self.diagnostic_tick();
                } else {
                    self.shared.activity.record("[OBD] Trouble codes were not cleared");
                }
                cleared
            }
            Err(e) => {
                warn!("Clearing trouble codes failed: {e}");
                self.shared.activity.record(format!("[OBD] DTC clear error: {e}"));
                self.sync_status();
                false
            }
        }
    }

    /// Every supported command, as text. Failures are recorded in place.
    pub(crate) fn full_snapshot(&mut self) -> IndexMap<String, String> {
        let mut snapshot = IndexMap::new();
        if !self.is_connected() {
            return snapshot;
        }
        for command in self.transport.supported_commands() {
            if command.is_destructive() {
                continue;
            }
            match self.transport.query(command, true) {
                Ok(Some(response)) => {
                    snapshot.insert(command.name().to_string(), describe_response(command, &response));
                }
                Ok(None) => {}
                Err(e) => {
                    snapshot.insert(command.name().to_string(), format!("ERR: {e}"));
                }
            }
        }
        let row = snapshot
            .iter()
            .fold(LogRow::new(), |row, (name, text)| row.with(name.clone(), text.clone()));
        self.append_log(row);
        self.sync_status();
        snapshot
    }

    pub(crate) fn start_logging(&mut self) -> Result<PathBuf, LoggingError> {
        if !self.is_connected() {
            warn!("Logging started without a vehicle connection");
            self.shared
                .activity
                .record("[OBD-LOG] Vehicle not connected, logged rows contain simulated data");
        }
        match self.shared.logger.start_logging() {
            Ok(path) => {
                self.shared
                    .activity
                    .record(format!("[OBD-LOG] Started logging -> {}", path.display()));
                self.shared.events.publish(&TelemetryEvent::Logging(true));
                Ok(path)
            }
            Err(e) => {
                error!("Could not start logging: {e}");
                self.shared.activity.record(format!("[OBD-LOG] Could not start logging: {e}"));
                Err(e)
            }
        }
    }

    pub(crate) fn stop_logging(&mut self) -> Result<PathBuf, LoggingError> {
        let result = self.shared.logger.stop_logging();
        match &result {
            Ok(path) => {
                self.shared
                    .activity
                    .record(format!("[OBD-LOG] Stopped logging -> {}", path.display()));
            }
            Err(LoggingError::NotStarted) => {
                debug!("Stop requested while not logging");
                return result;
            }
            Err(e) => {
                error!("Final log flush failed: {e}");
                self.shared.activity.record(format!("[OBD-LOG] Final flush failed: {e}"));
            }
        }
        self.shared.events.publish(&TelemetryEvent::Logging(false));
        result
    }

    pub(crate) fn toggle_logging(&mut self) -> Result<bool, LoggingError> {
        if self.shared.logger.is_enabled() {
            self.stop_logging().map(|_| false)
        } else {
            self.start_logging().map(|_| true)
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        // A dropped reply receiver just means the caller gave up waiting
        match command {
            EngineCommand::StartLogging(reply) => {
                let _ = reply.send(self.start_logging());
            }
            EngineCommand::StopLogging(reply) => {
                let _ = reply.send(self.stop_logging());
            }
            EngineCommand::ToggleLogging(reply) => {
                let _ = reply.send(self.toggle_logging());
            }
            EngineCommand::FetchDtc(reply) => {
                let _ = reply.send(self.diagnostic_tick());
            }
            EngineCommand::ClearDtc(reply) => {
                let _ = reply.send(self.clear_dtc());
            }
            EngineCommand::FullSnapshot(reply) => {
                let _ = reply.send(self.full_snapshot());
            }
            EngineCommand::Reconnect(reply) => {
                let _ = reply.send(self.connect());
            }
            EngineCommand::Stop => {}
        }
    }

    /// Flush the log, then close the transport
    pub(crate) fn shutdown(&mut self) {
        if self.shared.logger.is_enabled() {
            let _ = self.stop_logging();
        }
        self.transport.close();
        self.sync_status();
        info!("Poller stopped");
    }

    /// Run until a stop command arrives or every handle is gone
    pub(crate) fn run(mut self, commands: &Receiver<EngineCommand>) {
        info!("Poller starting");
        let polling = &self.config.polling;
        let now = Instant::now();
        let mut fast = Cadence::new(polling.fast_ms, now);
        let mut slow = Cadence::new(polling.slow_ms, now);
        let mut diagnostic = Cadence::new(polling.diagnostic_ms, now);
        let mut activity = Cadence::new(polling.activity_ms, now);

        loop {
            let now = Instant::now();
            let next_due = fast
                .next_due
                .min(slow.next_due)
                .min(diagnostic.next_due)
                .min(activity.next_due);

            match commands.recv_timeout(next_due.saturating_duration_since(now)) {
                Ok(EngineCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if fast.poll(now) {
                self.fast_tick();
            }
            if slow.poll(now) {
                self.slow_tick();
            }
            if diagnostic.poll(now) {
                self.diagnostic_tick();
            }
            if activity.poll(now) {
                self.activity_tick();
            }
        }

        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ACTIVITY_PUBLISHED;
    use crate::animator::RAMP_STEPS;
    use crate::synthetic::{RPM_RANGE, SPEED_RANGE};
    use carmetrics_elm327_lib::DtcKind;
    use rand::SeedableRng;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct FakeState {
        reachable: ConnectionStatus,
        status: ConnectionStatus,
        values: HashMap<Pid, f64>,
        codes: HashMap<DtcKind, Vec<String>>,
        failing: bool,
        closed: bool,
        queries: Vec<Command>,
    }

    /// In-memory adapter whose state the test keeps a handle to
    #[derive(Clone)]
    struct FakeTransport(Arc<Mutex<FakeState>>);

    impl FakeTransport {
        fn new(status: ConnectionStatus) -> Self {
            let values = HashMap::from([
                (Pid::Rpm, 2000.0),
                (Pid::Speed, 50.0),
                (Pid::ThrottlePos, 20.0),
                (Pid::EngineLoad, 33.333),
                (Pid::Maf, 5.0),
                (Pid::CoolantTemp, 90.0),
                (Pid::ControlModuleVoltage, 13.87),
            ]);
            Self(Arc::new(Mutex::new(FakeState {
                reachable: status,
                status,
                values,
                codes: HashMap::new(),
                failing: false,
                closed: false,
                queries: Vec::new(),
            })))
        }

        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.0.lock().unwrap()
        }
    }

    impl Transport for FakeTransport {
        fn connect(&mut self, _: &str, _: u32, _: Duration) -> ConnectionStatus {
            let mut state = self.state();
            state.closed = false;
            state.status = state.reachable;
            state.status
        }

        fn status(&self) -> ConnectionStatus {
            self.state().status
        }

        fn query(&mut self, command: Command, _force: bool) -> Result<Option<Response>, TransportError> {
            let mut state = self.state();
            state.queries.push(command);
            if state.status != ConnectionStatus::Connected {
                return Err(TransportError::NotConnected);
            }
            if state.failing {
                return Err(TransportError::Timeout);
            }
            Ok(match command {
                Command::Pid(pid) => state.values.get(&pid).copied().map(Response::Number),
                Command::Dtc(kind) => Some(Response::Codes(state.codes.get(&kind).cloned().unwrap_or_default())),
                Command::ClearDtc => {
                    state.codes.remove(&DtcKind::Stored);
                    state.codes.remove(&DtcKind::Pending);
                    Some(Response::Ack)
                }
            })
        }

        fn supported_commands(&self) -> BTreeSet<Command> {
            let state = self.state();
            state.values.keys().map(|pid| Command::Pid(*pid)).collect()
        }

        fn close(&mut self) {
            let mut state = self.state();
            state.closed = true;
            state.status = ConnectionStatus::NotConnected;
        }
    }

    fn scheduler(transport: &FakeTransport, animation: bool, dir: &std::path::Path) -> PollingScheduler {
        let mut config = Config::default();
        config.transport.port = "fake".into();
        config.startup_animation = animation;
        config.logging.directory = dir.to_path_buf();
        let shared = Arc::new(Shared::new(&config));
        let mut scheduler =
            PollingScheduler::new(shared, Box::new(transport.clone()), config, StdRng::seed_from_u64(3));
        scheduler.connect();
        scheduler
    }

    #[test]
    fn test_animation_runs_before_polling() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, true, dir.path());
        transport.state().queries.clear();

        for _ in 0..(2 * RAMP_STEPS) {
            s.slow_tick();
            s.fast_tick();
        }
        assert!(s.animator.is_finished());
        assert!(transport.state().queries.is_empty());
        assert!(s.shared.series.lock().unwrap().speed.is_empty());
        assert!(s.shared.cache.value(Parameter::Battery).is_none());

        s.fast_tick();
        assert!(!transport.state().queries.is_empty());
        assert_eq!(s.shared.cache.number(Parameter::Rpm), Some(2000.0));
    }

    #[test]
    fn test_connected_fast_tick_publishes_queried_values() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        let events = s.shared.events.subscribe();

        s.fast_tick();
        let cache = &s.shared.cache;
        assert_eq!(cache.number(Parameter::Speed), Some(50.0));
        assert_eq!(cache.number(Parameter::EngineLoad), Some(33.33));
        assert_eq!(cache.number(Parameter::FuelConsumption), Some(3.4));
        assert_eq!(cache.value(Parameter::Gear), Some(Value::from("N")));
        assert_eq!(cache.number(Parameter::WheelRr), Some(0.0));
        assert!((20.0..=90.0).contains(&cache.number(Parameter::Fuel).unwrap()));
        assert!((0.0..=100.0).contains(&cache.number(Parameter::Brakes).unwrap()));

        let received: Vec<_> = events.try_iter().collect();
        assert!(received.contains(&TelemetryEvent::Value {
            parameter: Parameter::Voltage,
            value: Value::Number(13.87)
        }));
        assert!(matches!(received.last(), Some(TelemetryEvent::Series(_))));
    }

    #[test]
    fn test_missing_parameter_is_omitted_not_zero() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        transport.state().values.remove(&Pid::Maf);
        let mut s = scheduler(&transport, false, dir.path());

        s.fast_tick();
        assert_eq!(s.shared.cache.value(Parameter::Maf), None);
        assert_eq!(s.shared.cache.number(Parameter::FuelConsumption), Some(0.0));
        assert_eq!(s.shared.cache.number(Parameter::Rpm), Some(2000.0));
    }

    #[test]
    fn test_disconnected_fast_tick_synthesizes() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::NotConnected);
        let mut s = scheduler(&transport, false, dir.path());
        for _ in 0..10 {
            s.fast_tick();
            let speed = s.shared.cache.number(Parameter::Speed).unwrap();
            let rpm = s.shared.cache.number(Parameter::Rpm).unwrap();
            assert!(SPEED_RANGE.contains(&speed));
            assert!(RPM_RANGE.contains(&rpm));
        }
        assert_eq!(s.shared.cache.value(Parameter::Gear), None);
        let series = s.shared.series.lock().unwrap().clone();
        assert_eq!(series.speed.len(), 1);
        assert_eq!(series.fuel.len(), 1);
    }

    #[test]
    fn test_slow_tick_derives_oil_from_coolant() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        s.fast_tick();
        s.slow_tick();

        let cache = &s.shared.cache;
        assert_eq!(cache.number(Parameter::Battery), Some(13.9));
        let oil = cache.number(Parameter::OilTemp).unwrap();
        assert!((85.0..=95.0).contains(&oil));
        // Fuel level is not advertised by this adapter
        assert!((20.0..=90.0).contains(&cache.number(Parameter::FuelLevel).unwrap()));
        assert_eq!(cache.value(Parameter::GeneralWarning), Some(Value::Flag(false)));

        let flags = *s.shared.status_flags.lock().unwrap();
        assert!(flags.connected && flags.ignition_on && flags.engine_running);
    }

    #[test]
    fn test_three_slow_failures_fall_back_to_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        let events = s.shared.events.subscribe();
        transport.state().failing = true;

        s.slow_tick();
        s.slow_tick();
        assert!(s.is_connected());
        s.slow_tick();
        assert!(!s.is_connected());
        assert!(transport.state().closed);
        assert!(events
            .try_iter()
            .any(|e| e == TelemetryEvent::Connection(ConnectionStatus::NotConnected)));
        assert_eq!(s.shared.cache.value(Parameter::GeneralWarning), Some(Value::Flag(true)));

        transport.state().queries.clear();
        s.fast_tick();
        assert!(transport.state().queries.is_empty());
        assert!(s.shared.cache.number(Parameter::Speed).is_some());
    }

    #[test]
    fn test_successful_slow_tick_resets_failure_count() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        transport.state().failing = true;
        s.slow_tick();
        s.slow_tick();
        transport.state().failing = false;
        s.slow_tick();
        transport.state().failing = true;
        s.slow_tick();
        s.slow_tick();
        assert!(s.is_connected());
    }

    #[test]
    fn test_diagnostic_tick_skipped_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::NotConnected);
        let mut s = scheduler(&transport, false, dir.path());
        let events = s.shared.events.subscribe();
        transport.state().queries.clear();

        let snapshot = s.diagnostic_tick();
        assert!(snapshot.is_empty());
        assert!(transport.state().queries.is_empty());
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn test_trouble_codes_raise_engine_warning_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        transport
            .state()
            .codes
            .insert(DtcKind::Stored, vec!["P0300".to_string()]);
        transport
            .state()
            .codes
            .insert(DtcKind::Permanent, vec!["P0420".to_string()]);
        let mut s = scheduler(&transport, false, dir.path());
        let events = s.shared.events.subscribe();

        s.diagnostic_tick();
        assert!(events.try_iter().any(|e| e
            == TelemetryEvent::DtcCodes(vec![
                "P0300 - Random/Multiple Cylinder Misfire Detected".to_string(),
                "P0420 - Catalyst System Efficiency Below Threshold (Bank 1)".to_string(),
            ])));
        s.slow_tick();
        assert_eq!(s.shared.cache.value(Parameter::EngineWarning), Some(Value::Flag(true)));

        assert!(s.clear_dtc());
        s.slow_tick();
        assert_eq!(s.shared.cache.value(Parameter::EngineWarning), Some(Value::Flag(false)));
        assert_eq!(s.dtc.last().permanent.len(), 1);
    }

    #[test]
    fn test_full_snapshot_lists_supported_commands() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        let snapshot = s.full_snapshot();
        assert_eq!(snapshot.get("SPEED").map(String::as_str), Some("50 km/h"));
        assert_eq!(snapshot.get("RPM").map(String::as_str), Some("2000 rpm"));
        assert!(!snapshot.contains_key("CLEAR_DTC"));

        transport.state().failing = true;
        let failed = s.full_snapshot();
        assert_eq!(failed.get("SPEED").map(String::as_str), Some("ERR: adapter timeout"));
    }

    #[test]
    fn test_logging_toggle_and_shutdown_flush() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut s = scheduler(&transport, false, dir.path());
        let events = s.shared.events.subscribe();

        assert!(s.toggle_logging().unwrap());
        for _ in 0..30 {
            s.fast_tick();
        }
        let path = s.shared.logger.path().unwrap();
        assert_eq!(s.shared.logger.pending_rows(), 30);

        s.shutdown();
        assert!(transport.state().closed);
        assert!(!s.shared.logger.is_enabled());
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 31);

        let logging: Vec<_> = events
            .try_iter()
            .filter(|e| matches!(e, TelemetryEvent::Logging(_)))
            .collect();
        assert_eq!(logging, vec![TelemetryEvent::Logging(true), TelemetryEvent::Logging(false)]);
    }

    #[test]
    fn test_log_write_failure_disables_logging_but_polling_continues() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let mut config = Config::default();
        config.transport.port = "fake".into();
        config.startup_animation = false;
        config.logging.directory = logs.clone();
        config.logging.row_threshold = 1;
        config.logging.table_threshold = 1;
        let shared = Arc::new(Shared::new(&config));
        let mut s = PollingScheduler::new(shared, Box::new(transport.clone()), config, StdRng::seed_from_u64(3));
        s.connect();
        let events = s.shared.events.subscribe();

        s.start_logging().unwrap();
        std::fs::remove_dir_all(&logs).unwrap();
        s.fast_tick();
        assert!(!s.shared.logger.is_enabled());
        assert!(events.try_iter().any(|e| e == TelemetryEvent::Logging(false)));
        assert!(s
            .shared
            .activity
            .recent(ACTIVITY_PUBLISHED)
            .iter()
            .any(|line| line.contains("Logging stopped")));

        transport.state().values.insert(Pid::Speed, 60.0);
        s.fast_tick();
        assert_eq!(s.shared.cache.number(Parameter::Speed), Some(60.0));
        assert!(!logs.exists());
    }

    #[test]
    fn test_stop_command_ends_run_loop() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(ConnectionStatus::Connected);
        let s = scheduler(&transport, false, dir.path());
        let (tx, rx) = mpsc::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(EngineCommand::Reconnect(reply_tx)).unwrap();
        tx.send(EngineCommand::Stop).unwrap();
        s.run(&rx);
        assert_eq!(reply_rx.recv().unwrap(), ConnectionStatus::Connected);
        assert!(transport.state().closed);
    }

    #[test]
    fn test_cadence_skips_missed_ticks() {
        let start = Instant::now();
        let mut cadence = Cadence::new(100, start);
        assert!(!cadence.poll(start));
        assert!(cadence.poll(start + Duration::from_millis(100)));
        assert_eq!(cadence.next_due, start + Duration::from_millis(200));
        assert!(cadence.poll(start + Duration::from_millis(550)));
        assert_eq!(cadence.next_due, start + Duration::from_millis(650));
    }
}
