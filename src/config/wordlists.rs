use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use crate::transform::{default_bypass_prefixes, default_bypass_suffixes};

#[derive(Debug, Error)]
pub enum WordlistError {
    #[error("wordlist directory not found: {path}")]
    MissingDirectory { path: String },

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
}

pub fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Every list the engine reads, loaded once and swapped as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wordlists {
    pub payload_sets: BTreeMap<String, Vec<String>>,
    pub bypass_prefixes: Vec<String>,
    pub bypass_suffixes: Vec<String>,
    /// `Name: value` lines
    pub header_replace: Vec<String>,
    pub header_remove: Vec<String>,
    pub host_allow: Vec<String>,
    pub host_deny: Vec<String>,
    pub user_agents: Vec<String>,
}

impl Default for Wordlists {
    fn default() -> Self {
        Wordlists {
            payload_sets: BTreeMap::new(),
            bypass_prefixes: default_bypass_prefixes(),
            bypass_suffixes: default_bypass_suffixes(),
            header_replace: Vec::new(),
            header_remove: Vec::new(),
            host_allow: Vec::new(),
            host_deny: Vec::new(),
            user_agents: default_user_agents(),
        }
    }
}

impl Wordlists {
    /// Payloads of `set`; an unknown set is empty.
    pub fn payloads(&self, set: &str) -> &[String] {
        self.payload_sets
            .get(set)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn with_payloads(mut self, set: &str, payloads: Vec<String>) -> Self {
        self.payload_sets.insert(set.to_string(), payloads);
        self
    }

    /// Loads a wordlist directory. Missing files leave the defaults in place.
    pub async fn load_dir(dir: &Path) -> Result<Self, WordlistError> {
        if !dir.is_dir() {
            return Err(WordlistError::MissingDirectory {
                path: dir.display().to_string(),
            });
        }
        let mut out = Wordlists::default();

        let payload_dir = dir.join("payloads");
        if payload_dir.is_dir() {
            let mut entries = tokio::fs::read_dir(&payload_dir).await.map_err(|e| {
                WordlistError::FileOpen {
                    kind: "payloads",
                    path: payload_dir.display().to_string(),
                    source: e,
                }
            })?;
            loop {
                let entry = entries
                    .next_entry()
                    .await
                    .map_err(|e| WordlistError::FileRead {
                        kind: "payloads",
                        path: payload_dir.display().to_string(),
                        source: e,
                    })?;
                let Some(entry) = entry else { break };
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let lines = load_lines("payloads", &path).await?;
                out.payload_sets.insert(name.to_string(), lines);
            }
        }

        if let Some(v) = load_optional("bypass_prefix", &dir.join("bypass_prefix.txt")).await? {
            out.bypass_prefixes = v;
        }
        if let Some(v) = load_optional("bypass_suffix", &dir.join("bypass_suffix.txt")).await? {
            out.bypass_suffixes = v;
        }
        if let Some(v) = load_optional("headers", &dir.join("headers.txt")).await? {
            out.header_replace = v;
        }
        if let Some(v) = load_optional("remove_headers", &dir.join("remove_headers.txt")).await? {
            out.header_remove = v;
        }
        if let Some(v) = load_optional("host_allow", &dir.join("host_allow.txt")).await? {
            out.host_allow = v;
        }
        if let Some(v) = load_optional("host_deny", &dir.join("host_deny.txt")).await? {
            out.host_deny = v;
        }
        if let Some(v) = load_optional("user_agents", &dir.join("user_agents.txt")).await? {
            out.user_agents = v;
        }
        Ok(out)
    }
}

async fn load_optional(
    kind: &'static str,
    path: &PathBuf,
) -> Result<Option<Vec<String>>, WordlistError> {
    if !path.is_file() {
        return Ok(None);
    }
    load_lines(kind, path).await.map(Some)
}

/// Non-empty lines, `#` comments skipped. Payload whitespace inside a line is kept.
pub async fn load_lines(kind: &'static str, path: &Path) -> Result<Vec<String>, WordlistError> {
    let handle = File::open(path).await.map_err(|e| WordlistError::FileOpen {
        kind,
        path: path.display().to_string(),
        source: e,
    })?;
    let mut out = Vec::new();
    let mut lines = BufReader::new(handle).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches(&['\r', '\n'][..]);
                if line.trim().is_empty() || line.trim_start().starts_with('#') {
                    continue;
                }
                out.push(line.to_string());
            }
            Ok(None) => break,
            Err(e) => {
                return Err(WordlistError::FileRead {
                    kind,
                    path: path.display().to_string(),
                    source: e,
                })
            }
        }
    }
    Ok(out)
}
