//! User-configured rewrite rules applied to outgoing requests.
//!
//! Merge rules are chained into one request. Every other enabled rule yields its own
//! request, and only when it actually changed something.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::template::TemplateError;
use crate::transform::{percent_decode, percent_encode_upper};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// the request-line target
    Url,
    /// request line and headers
    Header,
    Body,
    #[default]
    Request,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    AddPrefix { value: String },
    AddSuffix { value: String },
    Replace { from: String, to: String },
    RegexReplace { pattern: String, replacement: String },
    UrlEncode,
    UrlDecode,
    Base64Encode,
    Base64Decode,
    Lowercase,
    Uppercase,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub merge: bool,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("rule '{rule}' failed: {reason}")]
    Rule { rule: String, reason: String },
    #[error("request has no header/body boundary")]
    Malformed,
    #[error(transparent)]
    Template(#[from] TemplateError),
}

enum Step {
    Plain(Transform),
    Regex {
        regex: Result<Regex, String>,
        replacement: String,
    },
}

impl Step {
    fn compile(transform: &Transform) -> Step {
        match transform {
            Transform::RegexReplace {
                pattern,
                replacement,
            } => Step::Regex {
                regex: Regex::new(pattern).map_err(|e| e.to_string()),
                replacement: replacement.clone(),
            },
            other => Step::Plain(other.clone()),
        }
    }

    fn run(&self, input: &str) -> Result<String, String> {
        let t = match self {
            Step::Regex { regex, replacement } => {
                let re = regex.as_ref().map_err(|e| e.clone())?;
                return Ok(re.replace_all(input, replacement.as_str()).into_owned());
            }
            Step::Plain(t) => t,
        };
        match t {
            Transform::AddPrefix { value } => Ok(format!("{value}{input}")),
            Transform::AddSuffix { value } => Ok(format!("{input}{value}")),
            Transform::Replace { from, to } => Ok(input.replace(from.as_str(), to)),
            Transform::UrlEncode => Ok(percent_encode_upper(input)),
            Transform::UrlDecode => percent_decode(input),
            Transform::Base64Encode => Ok(STANDARD.encode(input.as_bytes())),
            Transform::Base64Decode => {
                let bytes = STANDARD.decode(input.trim()).map_err(|e| e.to_string())?;
                String::from_utf8(bytes).map_err(|e| e.to_string())
            }
            Transform::Lowercase => Ok(input.to_lowercase()),
            Transform::Uppercase => Ok(input.to_uppercase()),
            Transform::RegexReplace { .. } => Err("regex step was not compiled".to_string()),
        }
    }
}

struct CompiledRule {
    name: String,
    scope: RuleScope,
    steps: Vec<Step>,
}

fn request_line_target_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[A-Z]+\s+(.*?)\s+HTTP/").expect("static regex"))
}

impl CompiledRule {
    fn run_steps(&self, input: &str) -> Result<String, ProcessingError> {
        self.steps
            .iter()
            .try_fold(input.to_string(), |acc, step| step.run(&acc))
            .map_err(|reason| ProcessingError::Rule {
                rule: self.name.clone(),
                reason,
            })
    }

    fn apply(&self, request: &str) -> Result<String, ProcessingError> {
        let (head, body) = request
            .split_once("\r\n\r\n")
            .ok_or(ProcessingError::Malformed)?;
        match self.scope {
            RuleScope::Url => {
                let caps = request_line_target_regex()
                    .captures(head)
                    .ok_or_else(|| ProcessingError::Rule {
                        rule: self.name.clone(),
                        reason: "no request-line target".to_string(),
                    })?;
                let target = caps.get(1).ok_or(ProcessingError::Malformed)?;
                let rewritten = self.run_steps(target.as_str())?;
                Ok(format!(
                    "{}{}{}\r\n\r\n{}",
                    &head[..target.start()],
                    rewritten,
                    &head[target.end()..],
                    body
                ))
            }
            RuleScope::Header => Ok(format!("{}\r\n\r\n{}", self.run_steps(head)?, body)),
            RuleScope::Body => Ok(format!("{}\r\n\r\n{}", head, self.run_steps(body)?)),
            RuleScope::Request => {
                let out = self.run_steps(request)?;
                if out.contains("\r\n\r\n") {
                    Ok(out)
                } else {
                    Err(ProcessingError::Malformed)
                }
            }
        }
    }
}

/// Where a processed request came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// untouched, or the merge chain was a no-op / abandoned
    Original,
    /// merge chain output; names of the rules that changed the request
    Merged(Vec<String>),
    /// output of one non-merge rule
    Rule(String),
}

#[derive(Clone, Debug)]
pub struct ProcessedRequest {
    pub request: Vec<u8>,
    pub provenance: Provenance,
}

#[derive(Default)]
pub struct PayloadPipeline {
    merge: Vec<CompiledRule>,
    single: Vec<CompiledRule>,
}

impl PayloadPipeline {
    pub fn new(rules: &[ProcessingRule]) -> Self {
        let mut pipeline = PayloadPipeline::default();
        for rule in rules.iter().filter(|r| r.enabled) {
            let compiled = CompiledRule {
                name: rule.name.clone(),
                scope: rule.scope,
                steps: rule.transforms.iter().map(Step::compile).collect(),
            };
            if rule.merge {
                pipeline.merge.push(compiled);
            } else {
                pipeline.single.push(compiled);
            }
        }
        pipeline
    }

    pub fn is_empty(&self) -> bool {
        self.merge.is_empty() && self.single.is_empty()
    }

    /// Runs the merge chain, then every non-merge rule, on `request`.
    ///
    /// `finish` re-renders variables and Content-Length on each output. The first
    /// element is always present: the merged request, or `request` itself when the
    /// chain failed or changed nothing.
    pub fn process<F>(&self, request: &[u8], finish: F) -> Vec<ProcessedRequest>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, TemplateError>,
    {
        let text = String::from_utf8_lossy(request).into_owned();
        let mut out = Vec::with_capacity(1 + self.single.len());

        let merged = self.run_merge(&text, &finish);
        out.push(match merged {
            Ok((bytes, names)) if bytes != request && !names.is_empty() => ProcessedRequest {
                request: bytes,
                provenance: Provenance::Merged(names),
            },
            Ok(_) => ProcessedRequest {
                request: request.to_vec(),
                provenance: Provenance::Original,
            },
            Err(e) => {
                debug!("merge chain abandoned, sending original request: {e}");
                ProcessedRequest {
                    request: request.to_vec(),
                    provenance: Provenance::Original,
                }
            }
        });

        for rule in &self.single {
            let result = rule
                .apply(&text)
                .and_then(|s| finish(s.as_bytes()).map_err(ProcessingError::from));
            match result {
                Ok(bytes) if bytes != request => out.push(ProcessedRequest {
                    request: bytes,
                    provenance: Provenance::Rule(rule.name.clone()),
                }),
                Ok(_) => debug!("rule '{}' left the request unchanged", rule.name),
                Err(e) => debug!("rule '{}' skipped: {e}", rule.name),
            }
        }
        out
    }

    fn run_merge<F>(&self, text: &str, finish: &F) -> Result<(Vec<u8>, Vec<String>), ProcessingError>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, TemplateError>,
    {
        if self.merge.is_empty() {
            return Ok((text.as_bytes().to_vec(), Vec::new()));
        }
        let mut current = text.to_string();
        let mut changed_by = Vec::new();
        for rule in &self.merge {
            let next = rule.apply(&current)?;
            if next != current {
                changed_by.push(rule.name.clone());
            }
            current = next;
        }
        Ok((finish(current.as_bytes())?, changed_by))
    }
}
