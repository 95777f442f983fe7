//! Short user-facing log of engine activity.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// Lines kept in memory
pub const ACTIVITY_CAPACITY: usize = 100;
/// Lines published on each activity tick
pub const ACTIVITY_PUBLISHED: usize = 50;

/// Bounded list of `[HH:MM:SS] message` lines
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, message: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        for line in message.as_ref().lines() {
            lines.push_back(format!("[{stamp}] {line}"));
        }
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    /// The last `n` lines, oldest first
    pub fn recent(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().skip(lines.len().saturating_sub(n)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_timestamped() {
        let log = ActivityLog::default();
        log.record("[OBD] Connected");
        let line = &log.recent(1)[0];
        assert!(line.starts_with('['));
        assert_eq!(&line[9..], "] [OBD] Connected");
    }

    #[test]
    fn test_keeps_last_hundred() {
        let log = ActivityLog::default();
        for i in 0..150 {
            log.record(format!("line {i}"));
        }
        assert_eq!(log.len(), ACTIVITY_CAPACITY);
        let recent = log.recent(ACTIVITY_PUBLISHED);
        assert_eq!(recent.len(), ACTIVITY_PUBLISHED);
        assert!(recent[0].ends_with("line 100"));
        assert!(recent[49].ends_with("line 149"));
    }

    #[test]
    fn test_multi_line_messages_split() {
        let log = ActivityLog::default();
        log.record("Connection failed\nSwitching to simulated data");
        assert_eq!(log.len(), 2);
        assert!(log.recent(10)[1].ends_with("Switching to simulated data"));
    }
}
