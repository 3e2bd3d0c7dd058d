use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use reqwest::{redirect, Proxy, Url};
use thiserror::Error;

const HEAD_BODY_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Connection coordinates of a target: scheme, host and port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HttpService {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HttpService {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        HttpService {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into(),
            port,
        }
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(HttpService::new(url.scheme(), host, port))
    }

    /// 80 and 443 are left out of host strings regardless of scheme.
    pub fn is_default_port(&self) -> bool {
        matches!(self.port, 80 | 443)
    }

    pub fn host_port(&self) -> String {
        if self.is_default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://host[:port]`
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host_port())
    }

    /// Resolves a request-line target (origin-form or absolute-form) to a full URL.
    pub fn url_for(&self, target: &str) -> Option<Url> {
        if is_http(target) {
            return Url::parse(target).ok();
        }
        let base = format!("{}://{}:{}", self.scheme, self.host, self.port);
        let mut url = Url::parse(&base).ok()?;
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        if path.starts_with('/') {
            url.set_path(path);
        } else {
            url.set_path(&format!("/{path}"));
        }
        url.set_query(query);
        Some(url)
    }
}

impl fmt::Display for HttpService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin())
    }
}

pub fn is_http(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Offset of the first body byte, if the head is terminated.
pub fn body_offset(raw: &[u8]) -> Option<usize> {
    raw.windows(HEAD_BODY_SEPARATOR.len())
        .position(|w| w == HEAD_BODY_SEPARATOR)
        .map(|pos| pos + HEAD_BODY_SEPARATOR.len())
}

fn split_head(raw: &[u8]) -> (String, Vec<u8>) {
    match body_offset(raw) {
        Some(offset) => (
            String::from_utf8_lossy(&raw[..offset - HEAD_BODY_SEPARATOR.len()]).into_owned(),
            raw[offset..].to_vec(),
        ),
        None => (
            String::from_utf8_lossy(raw).trim_end().to_string(),
            Vec::new(),
        ),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();
        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?.to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();
        Some(RawRequest {
            method,
            target,
            version,
            headers: parse_header_lines(lines),
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Request path without query or fragment.
    pub fn path(&self) -> String {
        if is_http(&self.target) {
            return Url::parse(&self.target)
                .map(|u| u.path().to_string())
                .unwrap_or_default();
        }
        let end = self
            .target
            .find(&['?', '#'][..])
            .unwrap_or(self.target.len());
        self.target[..end].to_string()
    }

    pub fn query(&self) -> Option<&str> {
        let (_, rest) = self.target.split_once('?')?;
        Some(rest.split('#').next().unwrap_or(rest))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let (head, body) = split_head(raw);
        let mut lines = head.lines();
        let status_line = lines.next()?;
        let status = status_line.split_whitespace().nth(1)?.parse::<u16>().ok()?;
        Some(RawResponse {
            status,
            headers: parse_header_lines(lines),
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location").filter(|v| !v.is_empty())
    }

    /// `name=value` pairs of every `Set-Cookie` header.
    pub fn cookies(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| {
                let pair = v.split(';').next()?.trim();
                pair.contains('=').then(|| pair.to_string())
            })
            .collect()
    }

    pub fn title(&self) -> String {
        extract_title(&self.body)
    }
}

fn title_regex() -> &'static Regex {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    TITLE_RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"))
}

pub fn extract_title(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    title_regex()
        .captures(&text)
        .map(|cap| cap[1].split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// `path[?query]` of a URL, as it appears in an origin-form request line.
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// One observed (or synthesized) request/response pair and the service it belongs to.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub service: HttpService,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

impl Exchange {
    pub fn new(service: HttpService, request: impl Into<Vec<u8>>) -> Self {
        Exchange {
            service,
            request: request.into(),
            response: Vec::new(),
        }
    }

    pub fn with_response(mut self, response: impl Into<Vec<u8>>) -> Self {
        self.response = response.into();
        self
    }

    /// Synthesizes a plain `GET` exchange for a URL.
    pub fn from_url(url: &Url, user_agent: &str) -> Option<Self> {
        let service = HttpService::from_url(url)?;
        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\n",
            path_and_query(url),
            service.host_port()
        );
        if !user_agent.is_empty() {
            request.push_str(&format!("User-Agent: {user_agent}\r\n"));
        }
        request.push_str("Accept: */*\r\nConnection: close\r\n\r\n");
        Some(Exchange::new(service, request))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed raw request")]
    MalformedRequest,
    #[error("invalid method '{0}'")]
    InvalidMethod(String),
    #[error("cannot build url for target '{0}'")]
    InvalidUrl(String),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("invalid proxy '{0}'")]
    InvalidProxy(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Sends one raw request and returns the raw response bytes.
///
/// An empty response is a valid outcome and is treated like a failure by the dispatcher.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        service: &'a HttpService,
        request: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, http_proxy: Option<&str>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .danger_accept_invalid_hostnames(true)
            .danger_accept_invalid_certs(true);
        if let Some(http_proxy) = http_proxy.filter(|p| !p.is_empty()) {
            let proxy = Proxy::all(http_proxy)
                .map_err(|_| TransportError::InvalidProxy(http_proxy.to_string()))?;
            builder = builder.proxy(proxy);
        }
        Ok(ReqwestTransport {
            client: builder.build()?,
        })
    }

    async fn execute(
        &self,
        service: &HttpService,
        request: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let parsed = RawRequest::parse(request).ok_or(TransportError::MalformedRequest)?;
        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|_| TransportError::InvalidMethod(parsed.method.clone()))?;
        let url = service
            .url_for(&parsed.target)
            .ok_or_else(|| TransportError::InvalidUrl(parsed.target.clone()))?;

        let mut builder = self.client.request(method, url);
        for (k, v) in &parsed.headers {
            if k.eq_ignore_ascii_case("content-length") || k.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            let key = reqwest::header::HeaderName::from_str(k)
                .map_err(|_| TransportError::InvalidHeader(k.clone()))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|_| TransportError::InvalidHeader(k.clone()))?;
            builder = builder.header(key, value);
        }
        if !parsed.body.is_empty() {
            builder = builder.body(parsed.body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (k, v) in resp.headers() {
            out.extend_from_slice(k.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&resp.bytes().await?);
        Ok(out)
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        service: &'a HttpService,
        request: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
        Box::pin(self.execute(service, request))
    }
}
