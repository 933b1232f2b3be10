//! Keeping player-supplied text (entity names, event names, account names)
//! on a single log line, and the optional log file behind `env_logger`.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Longest preview written to the log before truncation.
const MAX_PREVIEW: usize = 120;

/// Escape control characters and truncate to [`MAX_PREVIEW`] characters.
pub fn escape_log(s: &str) -> String {
    escape_with_limit(s, MAX_PREVIEW)
}

/// As [`escape_log`] with an explicit character limit.
pub fn escape_with_limit(s: &str, limit: usize) -> String {
    let mut out = String::with_capacity(s.len().min(limit) + 4);
    for (count, ch) in s.chars().enumerate() {
        if count >= limit {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Append-only log file shared by every logging thread. The first failed
/// write is reported on stderr; later failures go back to the caller only.
#[derive(Debug)]
pub struct LogFile {
    file: Mutex<File>,
    failed: AtomicBool,
}

impl LogFile {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            failed: AtomicBool::new(false),
        }
    }

    /// Write one line. Returns whether this was the first failure.
    pub fn write_line(&self, line: &str) -> io::Result<bool> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match writeln!(file, "{}", line) {
            Ok(()) => Ok(false),
            Err(e) if !self.failed.swap(true, Ordering::Relaxed) => {
                eprintln!("log file write failed: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}
