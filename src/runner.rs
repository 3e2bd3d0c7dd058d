use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collect::{CollectedData, DataCollector};
use crate::config::{ScanSettings, WordlistError, Wordlists};
use crate::engine::{Collaborators, Engine, EngineError, Origin, Progress, StopReport};
use crate::fingerprint::SignatureFingerprinter;
use crate::http::{
    body_offset, Exchange, HttpService, HttpTransport, ReqwestTransport, TransportError,
};
use crate::output::{MemorySink, ResultSink, TaskRecord};

/// How long a stopped scan waits for in-flight tasks to record.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub urls: Vec<String>,
    pub input_file: Option<String>,
    /// raw request file, sent to `target` with the send origin
    pub raw_request: Option<String>,
    pub target: Option<String>,
    pub wordlists_dir: Option<String>,
    pub settings: ScanSettings,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no targets provided (urls, input_file and raw_request are all empty)")]
    NoTargets,

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("raw_request needs a target URL")]
    MissingRawTarget,

    #[error("failed to open file for {kind}: {path}: {source}")]
    FileOpen {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read lines for {kind}: {path}: {source}")]
    FileRead {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read raw request file: {path}: {source}")]
    RawRequestRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid raw request: {message}")]
    InvalidRawRequest { message: String },

    #[error(transparent)]
    Wordlists(#[from] WordlistError),

    #[error("failed to build HTTP transport: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Clone, Debug)]
pub struct ScanResult {
    pub started_at: Instant,
    pub elapsed: Duration,
    pub progress: Progress,
    /// set when the scan was interrupted before going idle
    pub stopped: Option<StopReport>,
    pub records: Vec<TaskRecord>,
    pub collected: CollectedData,
    /// fingerprint tag -> distinct responses carrying it
    pub fingerprints: BTreeMap<String, usize>,
}

/// Keeps every record for the final result and forwards it to the caller's sink.
struct TeeSink {
    memory: Arc<MemorySink>,
    forward: Option<Arc<dyn ResultSink>>,
}

impl ResultSink for TeeSink {
    fn record(&self, record: TaskRecord) {
        if let Some(forward) = self.forward.as_ref() {
            forward.record(record.clone());
        }
        self.memory.record(record);
    }
}

#[derive(Clone, Debug)]
pub struct Runner {
    options: Options,
}

impl Runner {
    pub fn new(options: Options) -> Result<Self, RunnerError> {
        let has_input = options
            .input_file
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        if options.urls.is_empty() && !has_input && options.raw_request.is_none() {
            return Err(RunnerError::NoTargets);
        }
        if options.raw_request.is_some() && options.target.is_none() {
            return Err(RunnerError::MissingRawTarget);
        }
        for url in options.urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
            if reqwest::Url::parse(url).is_err() {
                return Err(RunnerError::InvalidUrl {
                    url: url.to_string(),
                });
            }
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Scans every target with the reqwest transport and waits until idle.
    pub async fn run(&self) -> Result<ScanResult, RunnerError> {
        let transport = ReqwestTransport::new(
            self.options.settings.timeout(),
            self.options.settings.proxy.as_deref(),
        )?;
        let scan = self.start(Arc::new(transport), None).await?;
        Ok(scan.finish(CancellationToken::new()).await)
    }

    /// Builds the engine and submits every target. The scan keeps running in the
    /// background until [`Scan::finish`].
    pub async fn start(
        &self,
        transport: Arc<dyn HttpTransport>,
        results: Option<Arc<dyn ResultSink>>,
    ) -> Result<Scan, RunnerError> {
        let started_at = Instant::now();
        let wordlists = match self.options.wordlists_dir.as_deref() {
            Some(dir) => {
                Wordlists::load_dir(Path::new(&crate::config::expand_tilde_string(dir))).await?
            }
            None => Wordlists::default(),
        };
        let urls = load_targets(&self.options.urls, self.options.input_file.as_deref()).await?;
        let raw = match self.options.raw_request.as_deref() {
            Some(path) => Some(load_raw_request(path, self.options.target.as_deref()).await?),
            None => None,
        };

        let memory = Arc::new(MemorySink::new());
        let collector = Arc::new(DataCollector::new());
        let fingerprinter = Arc::new(SignatureFingerprinter::new());
        let collab = Collaborators::new(
            transport,
            Arc::new(TeeSink {
                memory: memory.clone(),
                forward: results,
            }),
        )
        .with_fingerprint(fingerprinter.clone())
        .with_collector(collector.clone());
        let engine = Engine::new(self.options.settings.clone(), wordlists, collab)?;

        if let Some(exchange) = raw {
            engine.submit(exchange, Origin::Send);
        }
        let imported = engine.import_urls(&urls)?;
        info!(targets = imported, "targets submitted");

        Ok(Scan {
            started_at,
            engine,
            memory,
            collector,
            fingerprinter,
        })
    }
}

/// A running scan.
pub struct Scan {
    started_at: Instant,
    engine: Engine,
    memory: Arc<MemorySink>,
    collector: Arc<DataCollector>,
    fingerprinter: Arc<SignatureFingerprinter>,
}

impl Scan {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Waits until the engine is idle or `stop` fires, then shuts the engine down.
    pub async fn finish(self, stop: CancellationToken) -> ScanResult {
        let stopped = tokio::select! {
            _ = self.engine.wait_idle() => None,
            _ = stop.cancelled() => Some(self.engine.stop_all().await),
        };
        if stopped.is_some() {
            // interrupted in-flight tasks still record their empty result
            let _ = tokio::time::timeout(SETTLE_TIMEOUT, self.engine.wait_idle()).await;
        }
        let collected = self.collector.snapshot();
        let fingerprints = self.fingerprinter.history();
        self.engine.shutdown().await;

        ScanResult {
            started_at: self.started_at,
            elapsed: self.started_at.elapsed(),
            progress: self.engine.progress(),
            stopped,
            records: self.memory.records(),
            collected,
            fingerprints,
        }
    }
}

async fn load_targets(urls: &[String], input_file: Option<&str>) -> Result<Vec<String>, RunnerError> {
    let mut out: Vec<String> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .map(|u| u.to_string())
        .collect();

    if let Some(path) = input_file.filter(|p| !p.trim().is_empty()) {
        let path = crate::config::expand_tilde_string(path);
        let handle = File::open(&path).await.map_err(|e| RunnerError::FileOpen {
            kind: "input_file",
            path: path.clone(),
            source: e,
        })?;
        let mut lines = BufReader::new(handle).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    out.push(line.to_string());
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(RunnerError::FileRead {
                        kind: "input_file",
                        path,
                        source: e,
                    })
                }
            }
        }
    }
    Ok(out)
}

/// Reads a raw request file, normalizing bare `\n` line endings in the head.
async fn load_raw_request(path: &str, target: Option<&str>) -> Result<Exchange, RunnerError> {
    let target = target.ok_or(RunnerError::MissingRawTarget)?;
    let url = reqwest::Url::parse(target).map_err(|_| RunnerError::InvalidUrl {
        url: target.to_string(),
    })?;
    let service = HttpService::from_url(&url).ok_or_else(|| RunnerError::InvalidUrl {
        url: target.to_string(),
    })?;

    let path = crate::config::expand_tilde_string(path);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| RunnerError::RawRequestRead {
            path: path.clone(),
            source: e,
        })?;
    let raw = normalize_line_endings(&bytes);
    if crate::http::RawRequest::parse(&raw).is_none() {
        return Err(RunnerError::InvalidRawRequest {
            message: format!("{path} does not start with a request line"),
        });
    }
    Ok(Exchange::new(service, raw))
}

fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    if body_offset(bytes).is_some() {
        return bytes.to_vec();
    }
    let text = String::from_utf8_lossy(bytes);
    let (head, body) = match text.split_once("\n\n") {
        Some((head, body)) => (head.to_string(), body.to_string()),
        None => (text.trim_end().to_string(), String::new()),
    };
    let head = head
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\r\n");
    format!("{head}\r\n\r\n{body}").into_bytes()
}
