//! Protocol traffic log.
//!
//! A [`TrafficLog`] is an explicit sink created at connection setup and handed
//! to the process host and the RPC connection. Every frame written to the
//! agent's stdin, every line read from its stdout and stderr, and the process
//! start/exit are appended as one JSON object per line:
//!
//! ```json
//! {"time":"2026-01-02T10:11:12.345+01:00","fd":"STDOUT","type":"json","json":{…}}
//! ```
//!
//! Lines that parse as JSON are embedded structurally; anything else is
//! recorded as `"type":"text"`. A disabled log only mirrors to `tracing`.
//! [`TrafficLog::close`] flushes and closes the file at teardown; records
//! arriving afterwards are dropped.

use std::path::Path;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use serde_json::{json, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::{AppError, Result};

/// Stream a traffic record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → agent (agent's stdin).
    Stdin,
    /// Agent → client (agent's stdout).
    Stdout,
    /// Agent diagnostics.
    Stderr,
    /// Process launch.
    Startup,
    /// Process exit.
    Exit,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::Startup => "STARTUP",
            Self::Exit => "EXIT",
        }
    }
}

/// Cloneable handle to a (possibly disabled) traffic log file.
#[derive(Debug, Clone)]
pub struct TrafficLog {
    label: Arc<str>,
    file: Option<Arc<Mutex<Option<BufWriter<File>>>>>,
}

impl TrafficLog {
    /// A log that writes nothing to disk.
    #[must_use]
    pub fn disabled(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            file: None,
        }
    }

    /// Open (append) a traffic log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be opened.
    pub async fn open(label: &str, path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await
            .map_err(|e| {
                AppError::Io(format!(
                    "cannot open traffic log {}: {e}",
                    path.as_ref().display()
                ))
            })?;
        Ok(Self {
            label: Arc::from(label),
            file: Some(Arc::new(Mutex::new(Some(BufWriter::new(file))))),
        })
    }

    /// Label identifying the connection in `tracing` output.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append one record.
    pub async fn record(&self, direction: Direction, line: &str) {
        trace!(
            connection = %self.label,
            fd = direction.label(),
            line,
            "traffic"
        );

        let Some(file) = &self.file else {
            return;
        };

        let entry = entry_for(direction, line);
        let mut bytes = entry.to_string().into_bytes();
        bytes.push(b'\n');

        let mut guard = file.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(err) = writer.write_all(&bytes).await {
                warn!(connection = %self.label, %err, "traffic log write failed");
            }
        }
    }

    /// Flush buffered records without closing.
    pub async fn flush(&self) {
        let Some(file) = &self.file else {
            return;
        };
        if let Some(writer) = file.lock().await.as_mut() {
            if let Err(err) = writer.flush().await {
                warn!(connection = %self.label, %err, "traffic log flush failed");
            }
        }
    }

    /// Flush and close the file. Safe to call more than once.
    pub async fn close(&self) {
        let Some(file) = &self.file else {
            return;
        };
        let writer = file.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                warn!(connection = %self.label, %err, "traffic log close failed");
            }
        }
    }
}

/// Build the JSON record for one line.
#[must_use]
pub fn entry_for(direction: Direction, line: &str) -> Value {
    let time = Local::now().to_rfc3339_opts(SecondsFormat::Millis, false);
    match serde_json::from_str::<Value>(line) {
        Ok(parsed) => json!({
            "time": time,
            "fd": direction.label(),
            "type": "json",
            "json": parsed,
        }),
        Err(_) => json!({
            "time": time,
            "fd": direction.label(),
            "type": "text",
            "text": line,
        }),
    }
}
