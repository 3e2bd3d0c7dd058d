use std::fmt;

use crate::engine::counters::Tier;
use crate::http::RawRequest;

/// Why a task exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Proxy,
    Send,
    Scan,
    Import,
    Redirect { parent: u64 },
}

impl Origin {
    /// Human-paced origins skip the QPS gate and use the interactive pool.
    pub fn is_low_frequency(&self) -> bool {
        matches!(
            self,
            Origin::Proxy | Origin::Send | Origin::Redirect { .. }
        )
    }

    pub fn tier(&self) -> Tier {
        if self.is_low_frequency() {
            Tier::Interactive
        } else {
            Tier::Bulk
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Origin::Redirect { .. })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Proxy => f.write_str("Proxy"),
            Origin::Send => f.write_str("Send"),
            Origin::Scan => f.write_str("Scan"),
            Origin::Import => f.write_str("Import"),
            Origin::Redirect { parent } => write!(f, "Redirect ({parent})"),
        }
    }
}

/// Origin plus the processing rules that rewrote the request, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginTag {
    pub origin: Origin,
    pub rules: Vec<String>,
}

impl OriginTag {
    pub fn new(origin: Origin) -> Self {
        OriginTag {
            origin,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.rules = rules;
        self
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rules.is_empty() {
            write!(f, "{}", self.origin)
        } else {
            write!(f, "{} [{}]", self.origin, self.rules.join(", "))
        }
    }
}

/// Header edits applied to every outgoing request.
pub struct HeaderPolicy<'a> {
    /// header names, case-insensitive
    pub remove: &'a [String],
    /// `Name: value` lines
    pub replace: &'a [String],
}

impl HeaderPolicy<'_> {
    fn is_removed(&self, name: &str) -> bool {
        self.remove
            .iter()
            .any(|r| r.trim().eq_ignore_ascii_case(name.trim()))
    }
}

/// Builds the raw request for one task.
///
/// A `candidate` turns the request into `GET <candidate>` without a body; otherwise
/// the method, target and body are kept. The version is always `HTTP/1.1`.
pub fn build_request(base: &RawRequest, candidate: Option<&str>, policy: &HeaderPolicy) -> Vec<u8> {
    let (method, target) = match candidate {
        Some(candidate) => ("GET", candidate),
        None => (base.method.as_str(), base.target.as_str()),
    };
    let mut headers: Vec<(String, String)> = base
        .headers
        .iter()
        .filter(|(k, _)| !policy.is_removed(k))
        .filter(|(k, _)| candidate.is_none() || !k.eq_ignore_ascii_case("content-length"))
        .cloned()
        .collect();

    for line in policy.replace {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() || policy.is_removed(name) {
            continue;
        }
        let mut replaced = false;
        for (k, v) in headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                replaced = true;
            }
        }
        if !replaced {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut out = format!("{method} {target} HTTP/1.1\r\n");
    for (k, v) in headers.iter() {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    let mut out = out.into_bytes();
    if candidate.is_none() {
        out.extend_from_slice(&base.body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &[u8] = b"POST /api/login HTTP/2\r\nHost: example.com\r\nCookie: a=1\r\nContent-Length: 7\r\nX-Trace: old\r\n\r\n{\"a\":1}";

    #[test]
    fn candidate_becomes_bodyless_get() {
        let base = RawRequest::parse(BASE).unwrap();
        let policy = HeaderPolicy {
            remove: &[],
            replace: &[],
        };
        let out = String::from_utf8(build_request(&base, Some("/.git/config"), &policy)).unwrap();
        assert!(out.starts_with("GET /.git/config HTTP/1.1\r\n"));
        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("X-Trace: old\r\n\r\n"));
    }

    #[test]
    fn original_keeps_method_and_body_but_normalizes_version() {
        let base = RawRequest::parse(BASE).unwrap();
        let policy = HeaderPolicy {
            remove: &[],
            replace: &[],
        };
        let out = String::from_utf8(build_request(&base, None, &policy)).unwrap();
        assert!(out.starts_with("POST /api/login HTTP/1.1\r\n"));
        assert!(out.ends_with("\r\n\r\n{\"a\":1}"));
    }

    #[test]
    fn remove_beats_replace_and_unmatched_replacements_append() {
        let base = RawRequest::parse(BASE).unwrap();
        let remove = vec!["cookie".to_string(), "X-Auth".to_string()];
        let replace = vec![
            "X-Trace: new".to_string(),
            "X-Auth: token".to_string(),
            "X-Forwarded-For: 127.0.0.1".to_string(),
        ];
        let policy = HeaderPolicy {
            remove: &remove,
            replace: &replace,
        };
        let out = String::from_utf8(build_request(&base, Some("/x"), &policy)).unwrap();
        assert!(!out.contains("Cookie"));
        assert!(!out.contains("X-Auth"));
        assert!(out.contains("X-Trace: new\r\n"));
        assert!(!out.contains("old"));
        assert!(out.contains("X-Forwarded-For: 127.0.0.1\r\n\r\n"));
    }

    #[test]
    fn origin_labels_and_tiers() {
        assert_eq!(Origin::Redirect { parent: 12 }.to_string(), "Redirect (12)");
        assert_eq!(Origin::Proxy.tier(), Tier::Interactive);
        assert_eq!(Origin::Import.tier(), Tier::Bulk);
        let tag = OriginTag::new(Origin::Scan).with_rules(vec!["upper".into(), "api".into()]);
        assert_eq!(tag.to_string(), "Scan [upper, api]");
    }
}
