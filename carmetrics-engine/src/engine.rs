use crate::activity::{ActivityLog, ACTIVITY_PUBLISHED};
use crate::cache::LiveValueCache;
use crate::config::{Config, ConfigError};
use crate::dtc::DtcSnapshot;
use crate::events::{EventBus, TelemetryEvent};
use crate::logger::{BufferedLogger, LoggingError};
use crate::scheduler::{EngineCommand, PollingScheduler};
use crate::series::SeriesSnapshot;
use crate::status::StatusFlags;
use crate::transport::{AtomicConnectionStatus, ConnectionStatus, Transport};
use derive_more::{Display, Error, From};
use indexmap::IndexMap;
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a handle waits for the poller to answer a request
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Display, Error, From)]
pub enum EngineError {
    #[display("{_0}")]
    #[from]
    Config(ConfigError),
    #[display("{_0}")]
    #[from]
    Logging(LoggingError),
    #[display("failed to spawn poller thread: {_0}")]
    Spawn(std::io::Error),
    #[display("engine is not running")]
    Stopped,
    #[display("engine did not answer within {}s", REPLY_TIMEOUT.as_secs())]
    Timeout,
}

/// State shared between handles and the poller thread
pub(crate) struct Shared {
    pub(crate) cache: LiveValueCache,
    pub(crate) series: Mutex<SeriesSnapshot>,
    pub(crate) status: AtomicConnectionStatus,
    pub(crate) status_flags: Mutex<StatusFlags>,
    pub(crate) logger: BufferedLogger,
    pub(crate) events: EventBus,
    pub(crate) activity: ActivityLog,
}

impl Shared {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            cache: LiveValueCache::new(),
            series: Mutex::new(SeriesSnapshot::default()),
            status: AtomicConnectionStatus::new(ConnectionStatus::NotConnected),
            status_flags: Mutex::new(StatusFlags::disconnected()),
            logger: BufferedLogger::new(
                config.logging.directory.clone(),
                config.logging.row_threshold,
                config.logging.table_threshold,
            ),
            events: EventBus::new(),
            activity: ActivityLog::default(),
        }
    }
}

/// Handle to a running telemetry engine.
///
/// Dropping the handle stops the poller, flushes any open log and closes
/// the transport.
pub struct Engine {
    shared: Arc<Shared>,
    commands: Sender<EngineCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Validate `config`, connect and start polling
    pub fn start<T: Transport + 'static>(config: Config, transport: T) -> Result<Self, EngineError> {
        Self::start_with_rng(config, transport, StdRng::from_entropy())
    }

    /// [`Engine::start`] with a caller-supplied random source for the
    /// simulated values
    pub fn start_with_rng<T: Transport + 'static>(
        mut config: Config,
        transport: T,
        rng: StdRng,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let shared = Arc::new(Shared::new(&config));
        let mut scheduler = PollingScheduler::new(Arc::clone(&shared), Box::new(transport), config, rng);
        let status = scheduler.connect();
        info!("Engine starting, adapter status: {status}");

        let (commands, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("carmetrics-poller".into())
            .spawn(move || scheduler.run(&rx))
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            shared,
            commands,
            thread: Some(thread),
        })
    }

    pub fn cache(&self) -> &LiveValueCache {
        &self.shared.cache
    }

    /// Current speed and fuel-consumption history
    pub fn series(&self) -> SeriesSnapshot {
        self.shared
            .series
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.load(Ordering::Acquire)
    }

    pub fn status_flags(&self) -> StatusFlags {
        *self
            .shared
            .status_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_logging(&self) -> bool {
        self.shared.logger.is_enabled()
    }

    /// Path of the open log file, if logging
    pub fn log_path(&self) -> Option<PathBuf> {
        self.shared.logger.path()
    }

    pub fn subscribe(&self) -> Receiver<TelemetryEvent> {
        self.shared.events.subscribe()
    }

    /// The most recent activity log lines
    pub fn activity(&self) -> Vec<String> {
        self.shared.activity.recent(ACTIVITY_PUBLISHED)
    }

    fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| EngineError::Stopped)?;
        rx.recv_timeout(REPLY_TIMEOUT).map_err(|e| match e {
            oneshot::RecvTimeoutError::Timeout => EngineError::Timeout,
            oneshot::RecvTimeoutError::Disconnected => EngineError::Stopped,
        })
    }

    /// Start logging to a new timestamped CSV file
    pub fn start_logging(&self) -> Result<PathBuf, EngineError> {
        Ok(self.request(EngineCommand::StartLogging)??)
    }

    /// Flush buffered rows and close the log file
    pub fn stop_logging(&self) -> Result<PathBuf, EngineError> {
        Ok(self.request(EngineCommand::StopLogging)??)
    }

    /// Returns whether logging is on afterwards
    pub fn toggle_logging(&self) -> Result<bool, EngineError> {
        Ok(self.request(EngineCommand::ToggleLogging)??)
    }

    /// Read stored, pending and permanent codes now
    pub fn fetch_dtc(&self) -> Result<DtcSnapshot, EngineError> {
        self.request(EngineCommand::FetchDtc)
    }

    /// Clear stored and pending codes. Returns whether the adapter
    /// acknowledged.
    pub fn clear_dtc(&self) -> Result<bool, EngineError> {
        self.request(EngineCommand::ClearDtc)
    }

    /// Every supported command, formatted as text
    pub fn full_snapshot(&self) -> Result<IndexMap<String, String>, EngineError> {
        self.request(EngineCommand::FullSnapshot)
    }

    pub fn reconnect(&self) -> Result<ConnectionStatus, EngineError> {
        self.request(EngineCommand::Reconnect)
    }

    /// Stop polling and wait for the poller to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            // The poller may already be gone
            let _ = self.commands.send(EngineCommand::Stop);
            if thread.join().is_err() {
                error!("Poller thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
