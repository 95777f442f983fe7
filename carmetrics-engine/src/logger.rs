//! Two-stage buffered CSV logger.
//!
//! Rows collect in a row buffer. Every `row_threshold` rows the buffer moves
//! into an in-memory table, and every `table_threshold` table rows the table
//! is appended to the log file. The file header is written only when the
//! file is new.

use crate::parameter::{Parameter, Value};
use derive_more::{Display, Error};
use indexmap::IndexMap;
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed column list of the log file
pub const LOG_COLUMNS: [&str; 16] = [
    "timestamp",
    "SPEED",
    "RPM",
    "THROTTLE_POS",
    "ENGINE_LOAD",
    "COOLANT_TEMP",
    "VOLTAGE",
    "MAF",
    "STEERING_ANGLE",
    "GEAR",
    "BRAKE_PRESSURE",
    "ACCELERATOR_PEDAL",
    "WHEEL_FL",
    "WHEEL_FR",
    "WHEEL_RL",
    "WHEEL_RR",
];

pub const DEFAULT_ROW_THRESHOLD: usize = 100;
pub const DEFAULT_TABLE_THRESHOLD: usize = 500;

#[derive(Debug, Display, Error)]
pub enum LoggingError {
    #[display("log file I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[display("logging has not been started")]
    NotStarted,
}

/// One sample. Fields outside [`LOG_COLUMNS`] are kept in memory but not
/// written.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    /// Seconds since the Unix epoch, set when the row is appended
    pub timestamp: f64,
    pub fields: IndexMap<String, Value>,
}

impl Default for LogRow {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRow {
    pub fn new() -> Self {
        Self {
            timestamp: 0.0,
            fields: IndexMap::new(),
        }
    }

    pub fn from_values(values: &[(Parameter, Value)]) -> Self {
        let mut row = Self::new();
        for (parameter, value) in values {
            row.fields.insert(parameter.name().to_string(), value.clone());
        }
        row
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    fn write_csv(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{}", self.timestamp)?;
        for column in &LOG_COLUMNS[1..] {
            out.write_all(b",")?;
            match self.fields.get(*column) {
                Some(Value::Number(n)) => write!(out, "{n}")?,
                Some(Value::Flag(b)) => write!(out, "{b}")?,
                Some(Value::Text(s)) => write!(out, "\"{}\"", s.replace('"', "\"\""))?,
                None => {}
            }
        }
        out.write_all(b"\n")
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[derive(Debug, Default)]
struct LoggerState {
    enabled: bool,
    path: Option<PathBuf>,
    rows: Vec<LogRow>,
    table: Vec<LogRow>,
}

/// Batching writer for [`LogRow`]s
#[derive(Debug)]
pub struct BufferedLogger {
    directory: PathBuf,
    row_threshold: usize,
    table_threshold: usize,
    state: Mutex<LoggerState>,
}

impl BufferedLogger {
    pub fn new(directory: impl Into<PathBuf>, row_threshold: usize, table_threshold: usize) -> Self {
        Self {
            directory: directory.into(),
            row_threshold: row_threshold.max(1),
            table_threshold: table_threshold.max(1),
            state: Mutex::new(LoggerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Current log file, if logging was started
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    pub fn pending_rows(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn table_rows(&self) -> usize {
        self.lock().table.len()
    }

    /// Start a new timestamped log file and reset both buffers
    pub fn start_logging(&self) -> Result<PathBuf, LoggingError> {
        let name = chrono::Local::now().format("obd_log_%Y%m%d_%H%M%S.csv").to_string();
        let path = self.directory.join(name);
        self.start_logging_at(path)
    }

    /// Start logging into a specific file
    pub fn start_logging_at(&self, path: impl Into<PathBuf>) -> Result<PathBuf, LoggingError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LoggingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        open_log_file(&path)
            .and_then(|file| file.sync_all())
            .map_err(|source| LoggingError::Io {
                path: path.clone(),
                source,
            })?;

        let mut state = self.lock();
        *state = LoggerState {
            enabled: true,
            path: Some(path.clone()),
            rows: Vec::with_capacity(self.row_threshold),
            table: Vec::new(),
        };
        info!("Started logging to {}", path.display());
        Ok(path)
    }

    /// Flush everything pending, then disable logging
    pub fn stop_logging(&self) -> Result<PathBuf, LoggingError> {
        let mut state = self.lock();
        if !state.enabled {
            return Err(LoggingError::NotStarted);
        }
        let rows = std::mem::take(&mut state.rows);
        state.table.extend(rows);
        let result = flush_table(&mut state);
        state.enabled = false;
        let path = state.path.clone().ok_or(LoggingError::NotStarted)?;
        result?;
        info!("Stopped logging to {}", path.display());
        Ok(path)
    }

    /// Append a row. A no-op while logging is disabled.
    ///
    /// A failed file write disables logging and returns the error.
    pub fn append(&self, mut row: LogRow) -> Result<(), LoggingError> {
        let mut state = self.lock();
        if !state.enabled {
            return Ok(());
        }
        row.timestamp = unix_seconds();
        state.rows.push(row);

        if state.rows.len() >= self.row_threshold {
            let rows = std::mem::take(&mut state.rows);
            state.table.extend(rows);
            debug!("Moved {} rows into the log table", self.row_threshold);
        }
        if state.table.len() >= self.table_threshold {
            if let Err(e) = flush_table(&mut state) {
                state.enabled = false;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Open for appending, writing the header if the file is new or empty
fn open_log_file(path: &Path) -> io::Result<File> {
    let is_new = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if is_new {
        let mut writer = BufWriter::new(&file);
        writeln!(writer, "{}", LOG_COLUMNS.join(","))?;
        writer.flush()?;
    }
    Ok(file)
}

fn flush_table(state: &mut LoggerState) -> Result<(), LoggingError> {
    let Some(path) = state.path.clone() else {
        return Err(LoggingError::NotStarted);
    };
    let write = |table: &[LogRow]| -> io::Result<()> {
        let file = open_log_file(&path)?;
        let mut writer = BufWriter::new(file);
        for row in table {
            row.write_csv(&mut writer)?;
        }
        writer.flush()
    };
    let count = state.table.len();
    let result = write(&state.table);
    state.table.clear();
    result.map_err(|source| LoggingError::Io {
        path: path.clone(),
        source,
    })?;
    info!("Flushed {count} rows to {}", path.display());
    Ok(())
}
