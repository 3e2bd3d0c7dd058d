use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use crate::http::RawResponse;

/// Passive fingerprinting of an observed exchange.
///
/// Implementations must be safe to call from many workers at once and should be
/// idempotent for the same exchange.
pub trait FingerprintCheck: Send + Sync {
    fn check(&self, request: &[u8], response: &[u8]) -> Vec<String>;

    fn clear_history(&self);
}

/// A checker that never reports anything.
#[derive(Debug, Default)]
pub struct NoFingerprint;

impl FingerprintCheck for NoFingerprint {
    fn check(&self, _request: &[u8], _response: &[u8]) -> Vec<String> {
        Vec::new()
    }

    fn clear_history(&self) {}
}

#[derive(Clone, Debug)]
struct ResponseView {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

impl ResponseView {
    fn from_raw(raw: &RawResponse) -> Self {
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in raw.headers.iter() {
            headers
                .entry(name.to_lowercase())
                .and_modify(|v| {
                    v.push_str("; ");
                    v.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        let body = String::from_utf8_lossy(&raw.body)
            .chars()
            .take(32768)
            .collect::<String>()
            .to_lowercase();
        ResponseView {
            status: raw.status,
            headers,
            body,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SignatureKind {
    Waf,
    Tech,
}

#[derive(Clone, Debug)]
struct Signature {
    name: &'static str,
    kind: SignatureKind,
    checks: Vec<Check>,
}

#[derive(Clone, Debug)]
enum Check {
    HeaderContains {
        header: &'static str,
        needle: &'static str,
        weight: u8,
    },
    CookieContains {
        needle: &'static str,
        weight: u8,
    },
    BodyContains {
        needle: &'static str,
        weight: u8,
    },
    StatusIs {
        status: u16,
        weight: u8,
    },
}

impl Check {
    fn weight(&self) -> u8 {
        match self {
            Check::HeaderContains { weight, .. } => *weight,
            Check::CookieContains { weight, .. } => *weight,
            Check::BodyContains { weight, .. } => *weight,
            Check::StatusIs { weight, .. } => *weight,
        }
    }

    fn matches(&self, view: &ResponseView) -> bool {
        match self {
            Check::HeaderContains { header, needle, .. } => match view.header(header) {
                Some(value) => needle.is_empty() || value.to_lowercase().contains(needle),
                None => false,
            },
            Check::CookieContains { needle, .. } => view
                .header("set-cookie")
                .is_some_and(|c| c.to_lowercase().contains(needle)),
            Check::BodyContains { needle, .. } => view.body.contains(needle),
            Check::StatusIs { status, .. } => view.status == *status,
        }
    }
}

fn header(header: &'static str, needle: &'static str, weight: u8) -> Check {
    Check::HeaderContains {
        header,
        needle,
        weight,
    }
}

fn cookie(needle: &'static str, weight: u8) -> Check {
    Check::CookieContains { needle, weight }
}

fn body(needle: &'static str, weight: u8) -> Check {
    Check::BodyContains { needle, weight }
}

fn waf(name: &'static str, checks: Vec<Check>) -> Signature {
    Signature {
        name,
        kind: SignatureKind::Waf,
        checks,
    }
}

fn tech(name: &'static str, checks: Vec<Check>) -> Signature {
    Signature {
        name,
        kind: SignatureKind::Tech,
        checks,
    }
}

// needles are lowercase
fn builtin_signatures() -> Vec<Signature> {
    vec![
        waf(
            "Cloudflare",
            vec![
                header("server", "cloudflare", 5),
                header("cf-ray", "", 6),
                cookie("cf_clearance=", 6),
                body("attention required! | cloudflare", 6),
            ],
        ),
        waf(
            "AWS WAF",
            vec![
                body("the request could not be satisfied", 6),
                body("generated by cloudfront", 5),
                header("via", "cloudfront", 4),
            ],
        ),
        waf(
            "Akamai",
            vec![
                header("server", "akamai", 4),
                header("x-akamai-transformed", "", 6),
            ],
        ),
        waf(
            "F5 BIG-IP ASM",
            vec![
                cookie("bigipserver", 5),
                body("the requested url was rejected", 6),
            ],
        ),
        waf(
            "Imperva",
            vec![
                header("x-cdn", "imperva", 6),
                body("incapsula", 5),
                cookie("incap_ses_", 5),
            ],
        ),
        waf(
            "Sucuri",
            vec![
                header("server", "sucuri", 6),
                body("access denied - sucuri website firewall", 6),
            ],
        ),
        waf(
            "ModSecurity",
            vec![
                body("mod_security", 6),
                Check::StatusIs {
                    status: 406,
                    weight: 2,
                },
            ],
        ),
        waf("Azure Front Door", vec![header("x-azure-ref", "", 6)]),
        tech("Nginx", vec![header("server", "nginx", 5)]),
        tech("Apache", vec![header("server", "apache", 5)]),
        tech("IIS", vec![header("server", "microsoft-iis", 5)]),
        tech(
            "PHP",
            vec![header("x-powered-by", "php", 5), cookie("phpsessid=", 5)],
        ),
        tech(
            "ASP.NET",
            vec![
                header("x-powered-by", "asp.net", 5),
                header("x-aspnet-version", "", 5),
            ],
        ),
        tech("Express", vec![header("x-powered-by", "express", 5)]),
        tech("Java", vec![cookie("jsessionid=", 5)]),
        tech(
            "Spring Boot",
            vec![body("whitelabel error page", 6)],
        ),
        tech(
            "WordPress",
            vec![body("wp-content/", 5), body("wp-includes/", 5)],
        ),
        tech("Drupal", vec![body("drupal-settings-json", 6)]),
        tech("Joomla", vec![body("joomla!", 5)]),
    ]
}

fn evaluate(signatures: &[Signature], view: &ResponseView) -> Vec<String> {
    let mut matches: Vec<(String, f32)> = Vec::new();
    for sig in signatures {
        let total: u32 = sig.checks.iter().map(|c| c.weight() as u32).sum();
        let hit: u32 = sig
            .checks
            .iter()
            .filter(|c| c.matches(view))
            .map(|c| c.weight() as u32)
            .sum();
        if hit == 0 || total == 0 {
            continue;
        }
        let tag = match sig.kind {
            SignatureKind::Waf => format!("WAF:{}", sig.name),
            SignatureKind::Tech => sig.name.to_string(),
        };
        matches.push((tag, hit as f32 / total as f32));
    }
    matches.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    matches.into_iter().map(|(tag, _)| tag).collect()
}

fn digest(response: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    response.hash(&mut hasher);
    hasher.finish()
}

/// Header, cookie and body signature checks with a per-response cache.
pub struct SignatureFingerprinter {
    signatures: Vec<Signature>,
    cache: Mutex<HashMap<u64, Vec<String>>>,
    history: Mutex<BTreeMap<String, usize>>,
}

impl Default for SignatureFingerprinter {
    fn default() -> Self {
        SignatureFingerprinter::new()
    }
}

impl SignatureFingerprinter {
    pub fn new() -> Self {
        SignatureFingerprinter {
            signatures: builtin_signatures(),
            cache: Mutex::new(HashMap::new()),
            history: Mutex::new(BTreeMap::new()),
        }
    }

    /// Tags seen so far and how many distinct responses carried them.
    pub fn history(&self) -> BTreeMap<String, usize> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl FingerprintCheck for SignatureFingerprinter {
    fn check(&self, _request: &[u8], response: &[u8]) -> Vec<String> {
        let Some(raw) = RawResponse::parse(response) else {
            return Vec::new();
        };
        let key = digest(response);
        if let Some(tags) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return tags.clone();
        }

        let tags = evaluate(&self.signatures, &ResponseView::from_raw(&raw));
        let inserted = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, tags.clone())
            .is_none();
        if inserted && !tags.is_empty() {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            for tag in tags.iter() {
                *history.entry(tag.clone()).or_default() += 1;
            }
        }
        tags
    }

    fn clear_history(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOUDFLARE: &[u8] = b"HTTP/1.1 403 Forbidden\r\nServer: cloudflare\r\nCF-RAY: 8a1b2c3d4e\r\nContent-Type: text/html\r\n\r\n<title>Attention Required! | Cloudflare</title>";

    #[test]
    fn detects_waf_by_headers_and_body() {
        let fp = SignatureFingerprinter::new();
        let tags = fp.check(b"", CLOUDFLARE);
        assert_eq!(tags.first().map(|s| s.as_str()), Some("WAF:Cloudflare"));
    }

    #[test]
    fn detects_technology_from_multiple_set_cookie_headers() {
        let fp = SignatureFingerprinter::new();
        let resp = b"HTTP/1.1 200 OK\r\nServer: nginx/1.25\r\nSet-Cookie: a=1\r\nSet-Cookie: JSESSIONID=abc\r\n\r\nok";
        let tags = fp.check(b"", resp);
        assert!(tags.contains(&"Nginx".to_string()));
        assert!(tags.contains(&"Java".to_string()));
    }

    #[test]
    fn repeated_checks_hit_cache_and_history_counts_once() {
        let fp = SignatureFingerprinter::new();
        let first = fp.check(b"", CLOUDFLARE);
        let second = fp.check(b"", CLOUDFLARE);
        assert_eq!(first, second);
        assert_eq!(fp.cached(), 1);
        assert_eq!(fp.history().get("WAF:Cloudflare"), Some(&1));

        fp.clear_history();
        assert_eq!(fp.cached(), 0);
        assert!(fp.history().is_empty());
    }

    #[test]
    fn empty_response_has_no_tags() {
        let fp = SignatureFingerprinter::new();
        assert!(fp.check(b"GET / HTTP/1.1\r\n\r\n", b"").is_empty());
        assert_eq!(fp.cached(), 0);
    }
}
