//! Exchange log: the out-of-band record of how each request ended.
//!
//! Once a stream has started the HTTP status line is committed, so
//! mid-stream failures and client cancellations can only be reported here.
//! Records are kept in a bounded ring buffer and, when a file is configured,
//! appended to it as JSON lines. Every record is also emitted as a
//! `tracing` event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;

const MAX_RECORDS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Full response or terminated stream written.
    Completed,
    /// Inbound request rejected before reaching the native handler.
    Rejected,
    /// Native handler failed before any output; its status was forwarded.
    NativeError,
    /// Native handler failed after the stream began.
    Failed,
    /// Caller went away mid-stream.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

impl ExchangeRecord {
    pub fn new(endpoint: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            model: None,
            outcome,
            detail: None,
            chunks: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn chunks(mut self, chunks: usize) -> Self {
        self.chunks = Some(chunks);
        self
    }
}

struct Inner {
    records: VecDeque<ExchangeRecord>,
    writer: Option<BufWriter<File>>,
}

#[derive(Clone)]
pub struct ExchangeLog(Arc<Mutex<Inner>>);

impl ExchangeLog {
    /// Log kept in memory only.
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            records: VecDeque::with_capacity(MAX_RECORDS),
            writer: None,
        })))
    }

    /// Log that also appends JSON lines to `path`.
    pub fn with_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self(Arc::new(Mutex::new(Inner {
            records: VecDeque::with_capacity(MAX_RECORDS),
            writer: Some(BufWriter::new(file)),
        }))))
    }

    pub fn record(&self, record: ExchangeRecord) {
        emit_trace(&record);

        let Ok(mut inner) = self.0.lock() else {
            return;
        };
        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = append_line(writer, &record) {
                tracing::warn!(error = %e, endpoint = %record.endpoint, "failed to persist exchange record");
            }
        }
        if inner.records.len() >= MAX_RECORDS {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ExchangeRecord> {
        self.0
            .lock()
            .map(|inner| inner.records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for ExchangeLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn append_line<W: Write>(writer: &mut W, record: &ExchangeRecord) -> std::io::Result<()> {
    let json = serde_json::to_string(record)?;
    writeln!(writer, "{json}")?;
    writer.flush()
}

fn emit_trace(record: &ExchangeRecord) {
    let model = record.model.as_deref().unwrap_or("-");
    let detail = record.detail.as_deref().unwrap_or("");
    match record.outcome {
        Outcome::Completed => tracing::info!(
            endpoint = %record.endpoint, model, chunks = ?record.chunks, "exchange completed"
        ),
        Outcome::Rejected => tracing::info!(
            endpoint = %record.endpoint, model, detail, "request rejected"
        ),
        Outcome::NativeError => tracing::warn!(
            endpoint = %record.endpoint, model, detail, "native handler returned an error"
        ),
        Outcome::Failed => tracing::error!(
            endpoint = %record.endpoint, model, detail, chunks = ?record.chunks, "stream failed"
        ),
        Outcome::Cancelled => tracing::info!(
            endpoint = %record.endpoint, model, chunks = ?record.chunks, "stream cancelled by caller"
        ),
    }
}
