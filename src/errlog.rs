//! Rolling table of recent errors, optionally mirrored to a text file.

use crate::error::{ErrorKind, OpError};
use chrono::{DateTime, Local};
use log::{error, warn};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub time: DateTime<Local>,
    pub code: i32,
    pub kind: ErrorKind,
    pub head: Option<u8>,
    /// False for benign device codes recorded without aborting.
    pub fatal: bool,
    pub message: String,
}

/// Bounded error table; the oldest entry is recycled when full.
#[derive(Debug)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
    capacity: usize,
    path: Option<PathBuf>,
    total: u64,
}

impl ErrorLog {
    pub fn new(capacity: usize, path: Option<PathBuf>) -> Self {
        ErrorLog {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            path,
            total: 0,
        }
    }

    pub fn record_op(&mut self, err: &OpError) {
        let fatal = !err.source.is_benign();
        self.record(err.code(), err.kind(), err.head, fatal, err.to_string());
    }

    pub fn record(
        &mut self,
        code: i32,
        kind: ErrorKind,
        head: Option<u8>,
        fatal: bool,
        message: String,
    ) {
        if fatal {
            error!("{}", message);
        } else {
            warn!("{}", message);
        }
        let entry = ErrorEntry {
            time: Local::now(),
            code,
            kind,
            head,
            fatal,
            message,
        };
        self.append_to_file(&entry);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total += 1;
    }

    fn append_to_file(&self, entry: &ErrorEntry) {
        let Some(path) = &self.path else {
            return;
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                writeln!(
                    file,
                    "{} {:>5} {:<9} {}",
                    entry.time.format("%Y-%m-%d %H:%M:%S%.3f"),
                    entry.code,
                    if entry.fatal { "ERROR" } else { "WARNING" },
                    entry.message
                )
            });
        if let Err(e) = result {
            // The rolling table still holds the entry.
            warn!("Failed to append to error log {}: {}", path.display(), e);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ErrorEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of errors recorded since start, including recycled ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
