//! Dynamic `{{variable}}` substitution for outgoing requests.
//!
//! Filling is fail-closed: a referenced variable that resolves to nothing aborts the
//! whole render, and the caller drops the payload.

use std::net::Ipv4Addr;

use chrono::{DateTime, Local};
use rand::seq::IndexedRandom;
use rand::Rng;
use thiserror::Error;

use crate::domain::{self, DomainHelper};
use crate::http::{body_offset, HttpService};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("{{{{{0}}}}} fill failed, value is empty")]
    EmptyValue(String),
    #[error("unresolved placeholder {{{{{0}}}}}")]
    Unresolved(String),
    #[error("request has no header/body boundary")]
    MissingBoundary,
}

pub struct TemplateContext<'a> {
    pub service: &'a HttpService,
    /// path of the request being rendered, used for `webroot`
    pub url_path: &'a str,
    pub user_agents: &'a [String],
    pub domains: &'a dyn DomainHelper,
    pub now: DateTime<Local>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        service: &'a HttpService,
        url_path: &'a str,
        user_agents: &'a [String],
        domains: &'a dyn DomainHelper,
    ) -> Self {
        TemplateContext {
            service,
            url_path,
            user_agents,
            domains,
            now: Local::now(),
        }
    }
}

struct Filler {
    text: String,
}

impl Filler {
    // value is only computed when the placeholder occurs
    fn fill<F>(&mut self, name: &str, value: F) -> Result<(), TemplateError>
    where
        F: FnOnce() -> Option<String>,
    {
        let key = placeholder(name);
        if !self.text.contains(&key) {
            return Ok(());
        }
        match value().filter(|v| !v.is_empty()) {
            Some(v) => {
                self.text = self.text.replace(&key, &v);
                Ok(())
            }
            None => Err(TemplateError::EmptyValue(name.to_string())),
        }
    }
}

fn placeholder(name: &str) -> String {
    format!("{{{{{name}}}}}")
}

/// First path segment, only when it is a directory (`/abc/a.php` gives `abc`).
pub fn webroot(url_path: &str) -> Option<String> {
    let rest = url_path.strip_prefix('/')?;
    let end = rest.find('/')?;
    Some(rest[..end].to_string()).filter(|s| !s.is_empty())
}

pub fn random_ipv4() -> String {
    let mut rng = rand::rng();
    loop {
        let ip = Ipv4Addr::new(
            rng.random_range(1..=223),
            rng.random(),
            rng.random(),
            rng.random_range(1..=254),
        );
        if !ip.is_private() && !ip.is_loopback() && !ip.is_link_local() {
            return ip.to_string();
        }
    }
}

pub fn random_local_ipv4() -> String {
    let mut rng = rand::rng();
    let ip = match rng.random_range(0..3) {
        0 => Ipv4Addr::new(10, rng.random(), rng.random(), rng.random_range(1..=254)),
        1 => Ipv4Addr::new(
            172,
            rng.random_range(16..=31),
            rng.random(),
            rng.random_range(1..=254),
        ),
        _ => Ipv4Addr::new(192, 168, rng.random(), rng.random_range(1..=254)),
    };
    ip.to_string()
}

pub fn random_item(items: &[String]) -> Option<String> {
    items.choose(&mut rand::rng()).cloned()
}

/// Substitutes every recognized variable in `text`.
pub fn fill_variables(text: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let mut f = Filler {
        text: text.to_string(),
    };
    let host = ctx.service.host.as_str();

    f.fill("protocol", || Some(ctx.service.scheme.clone()))?;
    f.fill("host", || Some(ctx.service.host_port()))?;
    f.fill("webroot", || webroot(ctx.url_path))?;
    f.fill("ip", || ctx.domains.lookup_ip(host))?;

    f.fill("domain", || Some(host.to_string()))?;
    f.fill("domain.main", || ctx.domains.main_domain(host))?;
    f.fill("domain.name", || ctx.domains.domain_name(host))?;

    f.fill("subdomain", || domain::subdomain(ctx.domains, host))?;
    let subdomains = domain::subdomains(ctx.domains, host);
    f.fill("subdomains", || subdomains.clone())?;
    if f.text.contains("{{subdomains.") {
        let all = subdomains.ok_or_else(|| TemplateError::EmptyValue("subdomains".into()))?;
        for (i, part) in all.split('.').enumerate() {
            f.fill(&format!("subdomains.{i}"), || Some(part.to_string()))?;
        }
        if let Some(start) = f.text.find("{{subdomains.") {
            let rest = &f.text[start + 2..];
            let name = rest.split("}}").next().unwrap_or(rest).to_string();
            return Err(TemplateError::Unresolved(name));
        }
    }

    f.fill("random.ip", || Some(random_ipv4()))?;
    f.fill("random.local-ip", || Some(random_local_ipv4()))?;
    f.fill("random.ua", || random_item(ctx.user_agents))?;

    f.fill("timestamp", || Some(ctx.now.timestamp().to_string()))?;
    if f.text.contains("{{date.") || f.text.contains("{{time.") {
        let parts = [
            ("date.yyyy", "%Y"),
            ("date.MM", "%m"),
            ("date.dd", "%d"),
            ("time.HH", "%H"),
            ("time.mm", "%M"),
            ("time.ss", "%S"),
            ("date.yy", "%y"),
            ("date.M", "%-m"),
            ("date.d", "%-d"),
            ("time.H", "%-H"),
            ("time.m", "%-M"),
            ("time.s", "%-S"),
        ];
        for (name, fmt) in parts {
            f.fill(name, || Some(ctx.now.format(fmt).to_string()))?;
        }
    }
    Ok(f.text)
}

/// Renders a raw request: variables in the head and in a textual body.
///
/// Binary bodies pass through untouched.
pub fn render_request(raw: &[u8], ctx: &TemplateContext<'_>) -> Result<Vec<u8>, TemplateError> {
    let offset = body_offset(raw).ok_or(TemplateError::MissingBoundary)?;
    let head = String::from_utf8_lossy(&raw[..offset]);
    let mut out = fill_variables(&head, ctx)?.into_bytes();
    match std::str::from_utf8(&raw[offset..]) {
        Ok(body) => out.extend_from_slice(fill_variables(body, ctx)?.as_bytes()),
        Err(_) => out.extend_from_slice(&raw[offset..]),
    }
    Ok(out)
}

/// Inserts or replaces `Content-Length` to match the body.
///
/// Requests without a body are returned unchanged.
pub fn update_content_length(raw: &[u8]) -> Result<Vec<u8>, TemplateError> {
    let offset = body_offset(raw).ok_or(TemplateError::MissingBoundary)?;
    let body_len = raw.len() - offset;
    if body_len == 0 {
        return Ok(raw.to_vec());
    }
    let head = String::from_utf8_lossy(&raw[..offset - 4]);
    let mut lines: Vec<String> = head.split("\r\n").map(|l| l.to_string()).collect();
    let header = format!("Content-Length: {body_len}");
    let mut replaced = false;
    for line in lines.iter_mut().skip(1) {
        let is_length = line
            .split_once(':')
            .is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"));
        if is_length {
            *line = header.clone();
            replaced = true;
        }
    }
    if !replaced {
        lines.push(header);
    }
    let mut out = lines.join("\r\n").into_bytes();
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(&raw[offset..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedDomains;

    impl DomainHelper for FixedDomains {
        fn main_domain(&self, host: &str) -> Option<String> {
            let labels: Vec<&str> = host.split('.').collect();
            (labels.len() >= 2).then(|| labels[labels.len() - 2..].join("."))
        }

        fn lookup_ip(&self, _host: &str) -> Option<String> {
            None
        }
    }

    fn ctx<'a>(service: &'a HttpService, path: &'a str, uas: &'a [String]) -> TemplateContext<'a> {
        let mut c = TemplateContext::new(service, path, uas, &FixedDomains);
        c.now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        c
    }

    #[test]
    fn fills_host_and_domain_variables() {
        let svc = HttpService::new("https", "api.admin.example.com", 8443);
        let uas = vec!["ua-1".to_string()];
        let out = fill_variables(
            "{{protocol}}://{{host}}/{{webroot}} {{domain.main}} {{domain.name}} {{subdomain}} {{subdomains}} {{subdomains.1}} {{random.ua}}",
            &ctx(&svc, "/app/index.php", &uas),
        )
        .unwrap();
        assert_eq!(
            out,
            "https://api.admin.example.com:8443/app example.com example api api.admin admin ua-1"
        );
    }

    #[test]
    fn missing_subdomain_index_fails_closed() {
        let svc = HttpService::new("http", "example.com", 80);
        let err = fill_variables("X-Sub: {{subdomains.1}}", &ctx(&svc, "/", &[])).unwrap_err();
        assert_eq!(err, TemplateError::EmptyValue("subdomains".into()));

        let svc = HttpService::new("http", "a.example.com", 80);
        let err = fill_variables("{{subdomains.3}}", &ctx(&svc, "/", &[])).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved("subdomains.3".into()));
    }

    #[test]
    fn empty_value_is_hard_failure_only_when_referenced() {
        let svc = HttpService::new("http", "example.com", 80);
        assert!(fill_variables("GET / HTTP/1.1", &ctx(&svc, "/", &[])).is_ok());
        assert_eq!(
            fill_variables("{{ip}}", &ctx(&svc, "/", &[])).unwrap_err(),
            TemplateError::EmptyValue("ip".into())
        );
        assert_eq!(
            fill_variables("{{webroot}}", &ctx(&svc, "/file", &[])).unwrap_err(),
            TemplateError::EmptyValue("webroot".into())
        );
    }

    #[test]
    fn date_and_time_parts() {
        let svc = HttpService::new("http", "example.com", 80);
        let out = fill_variables(
            "{{date.yyyy}}-{{date.MM}}-{{date.dd}} {{time.HH}}:{{time.mm}}:{{time.ss}} {{date.yy}}/{{date.M}}/{{date.d}} {{time.H}}.{{time.m}}.{{time.s}}",
            &ctx(&svc, "/", &[]),
        )
        .unwrap();
        assert_eq!(out, "2024-03-07 09:05:02 24/3/7 9.5.2");
    }

    #[test]
    fn random_values_are_well_formed() {
        let svc = HttpService::new("http", "example.com", 80);
        let out = fill_variables("{{random.ip}}|{{random.local-ip}}", &ctx(&svc, "/", &[])).unwrap();
        let (public, local) = out.split_once('|').unwrap();
        let public: Ipv4Addr = public.parse().unwrap();
        let local: Ipv4Addr = local.parse().unwrap();
        assert!(!public.is_private());
        assert!(local.is_private());
    }

    #[test]
    fn content_length_is_inserted_or_replaced() {
        let raw = b"POST /a HTTP/1.1\r\nHost: x\r\ncontent-length: 99\r\n\r\nabc";
        let out = update_content_length(raw).unwrap();
        assert_eq!(out, b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc");

        let raw = b"POST /a HTTP/1.1\r\nHost: x\r\n\r\nabcd";
        let out = update_content_length(raw).unwrap();
        assert_eq!(out, b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcd");

        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(update_content_length(raw).unwrap(), raw.to_vec());

        assert_eq!(
            update_content_length(b"GET /a HTTP/1.1\r\nHost: x"),
            Err(TemplateError::MissingBoundary)
        );
    }
}
