//! Diagnostic trouble code fetching and clearing.

use crate::transport::{Command, ConnectionStatus, Response, Transport, TransportError};
use carmetrics_elm327_lib::{dtc_description, DtcKind};
use log::{info, warn};
use serde::Serialize;
use std::fmt;

/// One trouble code with its description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcRecord {
    pub code: String,
    pub description: String,
    #[serde(serialize_with = "serialize_kind")]
    pub category: DtcKind,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_kind<S: serde::Serializer>(kind: &DtcKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(match kind {
        DtcKind::Stored => "stored",
        DtcKind::Pending => "pending",
        DtcKind::Permanent => "permanent",
    })
}

impl DtcRecord {
    pub fn new(code: impl Into<String>, category: DtcKind) -> Self {
        let code = code.into();
        Self {
            description: dtc_description(&code).to_string(),
            code,
            category,
        }
    }
}

impl fmt::Display for DtcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.description)
    }
}

/// Codes of all three categories from one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DtcSnapshot {
    pub stored: Vec<DtcRecord>,
    pub pending: Vec<DtcRecord>,
    pub permanent: Vec<DtcRecord>,
}

impl DtcSnapshot {
    pub fn category(&self, kind: DtcKind) -> &[DtcRecord] {
        match kind {
            DtcKind::Stored => &self.stored,
            DtcKind::Pending => &self.pending,
            DtcKind::Permanent => &self.permanent,
        }
    }

    fn category_mut(&mut self, kind: DtcKind) -> &mut Vec<DtcRecord> {
        match kind {
            DtcKind::Stored => &mut self.stored,
            DtcKind::Pending => &mut self.pending,
            DtcKind::Permanent => &mut self.permanent,
        }
    }

    /// `"<code> - <description>"` entries for one category
    pub fn entries(&self, kind: DtcKind) -> Vec<String> {
        self.category(kind).iter().map(ToString::to_string).collect()
    }

    /// Stored, then pending, then permanent entries
    pub fn all_entries(&self) -> Vec<String> {
        DtcKind::ALL.into_iter().flat_map(|kind| self.entries(kind)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty() && self.pending.is_empty() && self.permanent.is_empty()
    }

    /// Whether a stored or pending code is present
    pub fn has_active_codes(&self) -> bool {
        !self.stored.is_empty() || !self.pending.is_empty()
    }
}

/// Fetches and clears trouble codes, remembering the last snapshot
#[derive(Debug, Default)]
pub struct DtcManager {
    last: DtcSnapshot,
}

impl DtcManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> &DtcSnapshot {
        &self.last
    }

    /// Fetch all three categories. Disconnected adapters give an empty
    /// snapshot. A malformed answer empties only its own category; a
    /// link failure aborts the fetch.
    pub fn fetch_all(&mut self, transport: &mut dyn Transport) -> Result<DtcSnapshot, TransportError> {
        if transport.status() != ConnectionStatus::Connected {
            return Ok(DtcSnapshot::default());
        }

        let mut snapshot = DtcSnapshot::default();
        for kind in DtcKind::ALL {
            let command = Command::Dtc(kind);
            match transport.query(command, true) {
                Ok(Some(Response::Codes(codes))) => {
                    *snapshot.category_mut(kind) =
                        codes.into_iter().map(|code| DtcRecord::new(code, kind)).collect();
                }
                Ok(Some(other)) => warn!("Unexpected answer to {command}: {other:?}"),
                Ok(None) => {}
                Err(e) if e.is_link_failure() => return Err(e),
                Err(e) => warn!("Failed to read {command}: {e}"),
            }
        }
        self.last = snapshot.clone();
        Ok(snapshot)
    }

    /// Clear stored and pending codes (Mode 04). Permanent codes cannot be
    /// cleared by a tester and are left alone.
    pub fn clear(&mut self, transport: &mut dyn Transport) -> Result<bool, TransportError> {
        if transport.status() != ConnectionStatus::Connected {
            return Ok(false);
        }
        let cleared = matches!(transport.query(Command::ClearDtc, true)?, Some(_));
        if cleared {
            info!("Cleared stored and pending trouble codes");
            self.last.stored.clear();
            self.last.pending.clear();
        }
        Ok(cleared)
    }
}
