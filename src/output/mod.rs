use std::sync::{Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use colored::Colorize;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "text" | "txt" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

pub fn infer_format_from_path(path: &str) -> Option<OutputFormat> {
    let lower = path.trim().to_lowercase();
    if lower.ends_with(".json") {
        return Some(OutputFormat::Json);
    }
    if lower.ends_with(".txt") {
        return Some(OutputFormat::Text);
    }
    None
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// One completed task, immutable once handed to a sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: u64,
    /// `Scan`, `Proxy`, `Redirect (12)`, `Scan [rule]` ...
    pub origin: String,
    pub method: String,
    /// `scheme://host[:port]`
    pub host: String,
    pub url: String,
    pub title: String,
    pub ip: String,
    /// absent when nothing came back
    pub status: Option<u16>,
    pub length: usize,
    pub tags: Vec<String>,
    #[serde(serialize_with = "as_base64")]
    pub request: Vec<u8>,
    #[serde(serialize_with = "as_base64")]
    pub response: Vec<u8>,
}

impl TaskRecord {
    pub fn full_url(&self) -> String {
        if crate::http::is_http(&self.url) {
            self.url.clone()
        } else {
            format!("{}{}", self.host, self.url)
        }
    }
}

/// Observer for completed task records.
pub trait ResultSink: Send + Sync {
    fn record(&self, record: TaskRecord);
}

/// Forwards records to an unbounded channel; a dropped receiver discards them.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TaskRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl ResultSink for ChannelSink {
    fn record(&self, record: TaskRecord) {
        let _ = self.tx.send(record);
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TaskRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for MemorySink {
    fn record(&self, record: TaskRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Colored single-line summary for the terminal.
pub fn format_line(r: &TaskRecord) -> String {
    let status = match r.status {
        Some(code @ 200..=299) => code.to_string().green(),
        Some(code @ 300..=399) => code.to_string().cyan(),
        Some(code @ 400..=499) => code.to_string().yellow(),
        Some(code) => code.to_string().red(),
        None => "---".dimmed(),
    };
    let mut line = format!(
        "[{}] {} {} {} [{}]",
        status,
        r.method.bold(),
        r.full_url(),
        r.origin.purple(),
        r.length
    );
    if !r.title.is_empty() {
        line.push_str(&format!(" [{}]", r.title.blue()));
    }
    if !r.tags.is_empty() {
        line.push_str(&format!(" [{}]", r.tags.join(", ").magenta()));
    }
    line
}

pub fn render_text(records: &[TaskRecord]) -> Vec<u8> {
    let mut out = String::new();
    for r in records {
        let status = r
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            status,
            r.method,
            r.full_url(),
            r.length,
            r.origin,
            r.title
        ));
    }
    out.into_bytes()
}

pub fn render_json(records: &[TaskRecord]) -> Vec<u8> {
    serde_json::to_vec_pretty(records).unwrap_or_else(|_| b"[]\n".to_vec())
}
