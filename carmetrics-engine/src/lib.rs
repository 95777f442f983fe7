//! Live vehicle telemetry over an ELM327 diagnostic adapter.
//!
//! [`Engine::start`] connects through a [`Transport`] and spawns a poller
//! thread that refreshes the [`LiveValueCache`] on three cadences. While
//! the vehicle is unreachable, plausible simulated values are published
//! instead so consumers always have something to show.

pub mod activity;
pub mod animator;
pub mod cache;
pub mod config;
pub mod dtc;
mod engine;
pub mod events;
pub mod fuel;
pub mod logger;
pub mod parameter;
mod scheduler;
pub mod series;
pub mod status;
pub mod synthetic;
pub mod transport;

pub use cache::{LiveValueCache, Reading};
pub use config::{Config, ConfigError, LogLevel};
pub use dtc::{DtcManager, DtcRecord, DtcSnapshot};
pub use engine::{Engine, EngineError, REPLY_TIMEOUT};
pub use events::TelemetryEvent;
pub use fuel::FuelConsumptionEstimator;
pub use logger::{BufferedLogger, LogRow, LoggingError};
pub use parameter::{Parameter, Value};
pub use scheduler::FAST_PARAMETERS;
pub use series::{SeriesAggregator, SeriesSnapshot};
pub use status::StatusFlags;
pub use transport::{Command, ConnectionStatus, Elm327Transport, Response, Transport, TransportError};
