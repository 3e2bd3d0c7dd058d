//! Passive corpus building from every exchange the engine sees.
//!
//! Collectors run on raw request and response bytes, independent of the scan
//! pipeline's dedup and result path. Results are grouped per collector, then per host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::http::{body_offset, is_http};

/// Receives raw request/response bytes tagged by host.
pub trait CollectSink: Send + Sync {
    fn collect(&self, is_request: bool, host: &str, raw: &[u8]);

    fn clear(&self) {}
}

/// A sink that keeps nothing.
#[derive(Debug, Default)]
pub struct NoCollect;

impl CollectSink for NoCollect {
    fn collect(&self, _is_request: bool, _host: &str, _raw: &[u8]) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collector {
    FileName,
    FullPath,
    WebName,
    UrlParam,
    PostParam,
    JsonField,
    ParamValue,
}

impl Collector {
    pub const ALL: [Collector; 7] = [
        Collector::FileName,
        Collector::FullPath,
        Collector::WebName,
        Collector::UrlParam,
        Collector::PostParam,
        Collector::JsonField,
        Collector::ParamValue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collector::FileName => "file_name",
            Collector::FullPath => "full_path",
            Collector::WebName => "web_name",
            Collector::UrlParam => "url_param",
            Collector::PostParam => "post_param",
            Collector::JsonField => "json_field",
            Collector::ParamValue => "param_value",
        }
    }

    fn run(self, msg: &Message) -> Vec<String> {
        match self {
            Collector::FileName => msg.path().and_then(file_name).into_iter().collect(),
            Collector::FullPath => msg.path().and_then(full_path).into_iter().collect(),
            Collector::WebName => msg.path().map(web_names).unwrap_or_default(),
            Collector::UrlParam => msg
                .query()
                .map(|q| param_names(q))
                .unwrap_or_default(),
            Collector::PostParam => msg
                .form_body()
                .map(|b| param_names(b))
                .unwrap_or_default(),
            Collector::JsonField => msg.json().map(|v| json_keys(&v)).unwrap_or_default(),
            Collector::ParamValue => param_values(msg),
        }
    }
}

struct Message<'a> {
    is_request: bool,
    head: String,
    body: &'a [u8],
}

impl<'a> Message<'a> {
    fn parse(is_request: bool, raw: &'a [u8]) -> Self {
        match body_offset(raw) {
            Some(offset) => Message {
                is_request,
                head: String::from_utf8_lossy(&raw[..offset - 4]).into_owned(),
                body: &raw[offset..],
            },
            None => Message {
                is_request,
                head: String::from_utf8_lossy(raw).into_owned(),
                body: &[],
            },
        }
    }

    /// Request target with query, origin-form only.
    fn target(&self) -> Option<&str> {
        if !self.is_request {
            return None;
        }
        let line = self.head.lines().next()?;
        let mut parts = line.split_whitespace();
        parts.next()?;
        let target = parts.next()?;
        if is_http(target) {
            let after_scheme = target.split_once("://")?.1;
            return Some(&after_scheme[after_scheme.find('/')?..]);
        }
        Some(target)
    }

    fn path(&self) -> Option<&str> {
        let target = self.target()?;
        let end = target.find(&['?', '#'][..]).unwrap_or(target.len());
        let path = &target[..end];
        (!path.is_empty()).then_some(path)
    }

    fn query(&self) -> Option<&str> {
        let target = self.target()?;
        let (_, query) = target.split_once('?')?;
        let query = query.split('#').next().unwrap_or(query);
        (!query.is_empty()).then_some(query)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    fn body_text(&self) -> Option<&str> {
        let text = std::str::from_utf8(self.body).ok()?;
        (!text.trim().is_empty()).then_some(text)
    }

    fn form_body(&self) -> Option<&str> {
        if !self.is_request {
            return None;
        }
        let content_type = self.header("content-type")?.to_ascii_lowercase();
        if !content_type.contains("application/x-www-form-urlencoded") {
            return None;
        }
        self.body_text()
    }

    fn json(&self) -> Option<Value> {
        let text = self.body_text()?.trim();
        let looks_json = (text.starts_with('{') && text.ends_with('}'))
            || (text.starts_with('[') && text.ends_with(']'));
        if !looks_json {
            return None;
        }
        serde_json::from_str(text).ok()
    }
}

fn file_name(path: &str) -> Option<String> {
    if path.ends_with('/') {
        return None;
    }
    let last = path.rsplit('/').next().unwrap_or(path);
    (last.contains('.') && last != ".").then(|| last.to_string())
}

fn full_path(path: &str) -> Option<String> {
    let dir = if path.ends_with('/') {
        path.to_string()
    } else {
        let idx = path.rfind('/')?;
        let last = &path[idx + 1..];
        if last.contains('.') && !last.ends_with('.') {
            path[..=idx].to_string()
        } else {
            format!("{path}/")
        }
    };
    (!dir.is_empty() && dir != "/").then_some(dir)
}

fn web_names(path: &str) -> Vec<String> {
    if !path.starts_with('/') {
        return Vec::new();
    }
    let mut dir = path;
    if let Some(idx) = path.rfind('/').filter(|i| *i > 0) {
        let last = &path[idx + 1..];
        if last.contains('.') && !last.ends_with('.') {
            dir = &path[..=idx];
        }
    }
    dir.split('/')
        .filter(|s| !s.is_empty() && !s.contains('.'))
        .map(|s| s.to_string())
        .collect()
}

fn param_names(params: &str) -> Vec<String> {
    params
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.find('=') {
            Some(eq) if eq > 0 => &p[..eq],
            _ => p,
        })
        .filter(|name| !name.is_empty() && !name.starts_with('='))
        .map(|name| name.to_string())
        .collect()
}

fn param_pairs(params: &str, out: &mut Vec<String>) {
    for p in params.split('&') {
        if let Some((name, value)) = p.split_once('=') {
            if !name.is_empty() && !value.is_empty() {
                out.push(format!("{name}={value}"));
            }
        }
    }
}

fn json_keys(value: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    if !k.is_empty() && !out.contains(k) {
                        out.push(k.clone());
                    }
                    walk(v, out);
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out
}

fn json_pairs(value: &Value, key: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let next = if key.is_empty() {
                    k.clone()
                } else {
                    format!("{key}.{k}")
                };
                json_pairs(v, &next, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                json_pairs(v, &format!("{key}[{i}]"), out);
            }
        }
        Value::Null => {}
        Value::String(s) => {
            if !key.is_empty() && !s.is_empty() {
                out.push(format!("{key}={s}"));
            }
        }
        other => {
            if !key.is_empty() {
                out.push(format!("{key}={other}"));
            }
        }
    }
}

fn param_values(msg: &Message) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(json) = msg.json() {
        json_pairs(&json, "", &mut out);
    }
    if msg.is_request {
        if let Some(query) = msg.query() {
            param_pairs(query, &mut out);
        }
        if let Some(body) = msg.form_body() {
            param_pairs(body, &mut out);
        }
    }
    out
}

/// collector name -> host -> sorted values
pub type CollectedData = BTreeMap<&'static str, BTreeMap<String, BTreeSet<String>>>;

/// Thread-safe store behind every collector.
#[derive(Debug, Default)]
pub struct DataCollector {
    data: Mutex<BTreeMap<Collector, BTreeMap<String, BTreeSet<String>>>>,
}

impl DataCollector {
    pub fn new() -> Self {
        DataCollector::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Collector, BTreeMap<String, BTreeSet<String>>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CollectedData {
        self.lock()
            .iter()
            .map(|(collector, hosts)| (collector.name(), hosts.clone()))
            .collect()
    }

    pub fn values(&self, collector: Collector, host: &str) -> Vec<String> {
        self.lock()
            .get(&collector)
            .and_then(|hosts| hosts.get(host))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of stored values across collectors and hosts.
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|hosts| hosts.values())
            .map(|set| set.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollectSink for DataCollector {
    fn collect(&self, is_request: bool, host: &str, raw: &[u8]) {
        if host.is_empty() || raw.is_empty() {
            return;
        }
        let msg = Message::parse(is_request, raw);
        let mut found: Vec<(Collector, Vec<String>)> = Vec::new();
        for collector in Collector::ALL {
            let values = collector.run(&msg);
            if !values.is_empty() {
                found.push((collector, values));
            }
        }
        if found.is_empty() {
            return;
        }
        let mut data = self.lock();
        for (collector, values) in found {
            data.entry(collector)
                .or_default()
                .entry(host.to_string())
                .or_default()
                .extend(values);
        }
    }

    fn clear(&self) {
        self.lock().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "example.com";

    fn collected(is_request: bool, raw: &[u8], collector: Collector) -> Vec<String> {
        let c = DataCollector::new();
        c.collect(is_request, HOST, raw);
        c.values(collector, HOST)
    }

    #[test]
    fn path_collectors() {
        let raw = b"GET /static/js/app.min.js?v=3 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(collected(true, raw, Collector::FileName), vec!["app.min.js"]);
        assert_eq!(collected(true, raw, Collector::FullPath), vec!["/static/js/"]);
        assert_eq!(collected(true, raw, Collector::WebName), vec!["js", "static"]);
        assert_eq!(collected(true, raw, Collector::UrlParam), vec!["v"]);
    }

    #[test]
    fn directory_path_without_file() {
        let raw = b"GET /api/v1/users HTTP/1.1\r\n\r\n";
        assert!(collected(true, raw, Collector::FileName).is_empty());
        assert_eq!(collected(true, raw, Collector::FullPath), vec!["/api/v1/users/"]);
        assert!(collected(true, b"GET / HTTP/1.1\r\n\r\n", Collector::FullPath).is_empty());
    }

    #[test]
    fn form_body_params() {
        let raw = b"POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nuser=admin&pass=&remember";
        assert_eq!(
            collected(true, raw, Collector::PostParam),
            vec!["pass", "remember", "user"]
        );
        assert_eq!(collected(true, raw, Collector::ParamValue), vec!["user=admin"]);
    }

    #[test]
    fn json_fields_and_values_from_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"user\":{\"id\":7,\"roles\":[\"admin\"]},\"ok\":true}";
        assert_eq!(
            collected(false, raw, Collector::JsonField),
            vec!["id", "ok", "roles", "user"]
        );
        assert_eq!(
            collected(false, raw, Collector::ParamValue),
            vec!["ok=true", "user.id=7", "user.roles[0]=admin"]
        );
        assert!(collected(false, raw, Collector::FileName).is_empty());
    }

    #[test]
    fn snapshot_len_and_clear() {
        let c = DataCollector::new();
        c.collect(true, HOST, b"GET /a/b.php?x=1 HTTP/1.1\r\n\r\n");
        c.collect(true, "other.test", b"GET /a/b.php HTTP/1.1\r\n\r\n");
        let snap = c.snapshot();
        assert_eq!(snap["file_name"].len(), 2);
        assert!(c.len() >= 5);
        c.clear();
        assert!(c.is_empty());
    }
}
