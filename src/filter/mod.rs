use std::net::Ipv4Addr;

/// A host allow/deny rule with `*` wildcards, compiled once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostPattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    /// `a*b`: starts with `a` and ends with `b`
    Surround(String, String),
}

impl HostPattern {
    pub fn compile(rule: &str) -> HostPattern {
        let rule = rule.trim();
        if rule == "*" {
            return HostPattern::Any;
        }
        if !rule.contains('*') {
            return HostPattern::Exact(rule.to_string());
        }
        let starts = rule.starts_with('*');
        let ends = rule.ends_with('*');
        match (starts, ends) {
            (true, true) => HostPattern::Contains(rule.trim_matches('*').to_string()),
            (true, false) => HostPattern::Suffix(rule.trim_start_matches('*').to_string()),
            (false, true) => HostPattern::Prefix(rule.trim_end_matches('*').to_string()),
            (false, false) => {
                let (head, _) = rule.split_once('*').unwrap_or((rule, ""));
                let (_, tail) = rule.rsplit_once('*').unwrap_or(("", rule));
                HostPattern::Surround(head.to_string(), tail.to_string())
            }
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(s) => host == s,
            HostPattern::Prefix(s) => host.starts_with(s.as_str()),
            HostPattern::Suffix(s) => host.ends_with(s.as_str()),
            HostPattern::Contains(s) => host.contains(s.as_str()),
            HostPattern::Surround(head, tail) => {
                host.len() >= head.len() + tail.len()
                    && host.starts_with(head.as_str())
                    && host.ends_with(tail.as_str())
            }
        }
    }
}

/// Allow and deny lists over host names (no scheme, no port).
#[derive(Clone, Debug, Default)]
pub struct HostFilter {
    allow: Vec<HostPattern>,
    deny: Vec<HostPattern>,
}

impl HostFilter {
    pub fn new<S: AsRef<str>>(allow: &[S], deny: &[S]) -> Self {
        let compile = |rules: &[S]| {
            rules
                .iter()
                .map(|r| r.as_ref())
                .filter(|r| !r.trim().is_empty())
                .map(HostPattern::compile)
                .collect()
        };
        HostFilter {
            allow: compile(allow),
            deny: compile(deny),
        }
    }

    /// An empty allow list allows everything; deny always wins.
    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return true;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.matches(host)) {
            return true;
        }
        self.deny.iter().any(|p| p.matches(host))
    }
}

fn split_pipe(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// `|`-delimited list of methods to scan; empty scans every method.
#[derive(Clone, Debug, Default)]
pub struct MethodFilter {
    methods: Vec<String>,
}

impl MethodFilter {
    pub fn parse(raw: &str) -> Self {
        MethodFilter {
            methods: split_pipe(raw),
        }
    }

    pub fn is_blocked(&self, method: &str) -> bool {
        !self.methods.is_empty() && !self.methods.iter().any(|m| m == method)
    }
}

/// `|`-delimited file extensions whose requests are not re-sent as-is.
#[derive(Clone, Debug, Default)]
pub struct SuffixFilter {
    suffixes: Vec<String>,
}

impl SuffixFilter {
    pub fn parse(raw: &str) -> Self {
        SuffixFilter {
            suffixes: split_pipe(&raw.to_ascii_lowercase())
                .into_iter()
                .map(|s| format!(".{}", s.trim_start_matches('.')))
                .collect(),
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        if path.is_empty() || path == "/" {
            return false;
        }
        let path = path.to_ascii_lowercase();
        self.suffixes.iter().any(|s| path.ends_with(s.as_str()))
    }
}

/// Dotted-quad IPv4, `localhost`, or a plausible DNS name with at least one dot.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let all_numeric = host.chars().all(|c| c.is_ascii_digit() || c == '.');
    if all_numeric {
        return host.parse::<Ipv4Addr>().is_ok();
    }
    host.contains('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !host.starts_with(&['-', '.'][..])
        && !host.ends_with(&['-', '.'][..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_wildcard_shapes() {
        assert_eq!(HostPattern::compile("*"), HostPattern::Any);
        assert_eq!(
            HostPattern::compile("*.example.com"),
            HostPattern::Suffix(".example.com".into())
        );
        assert_eq!(HostPattern::compile("api.*"), HostPattern::Prefix("api.".into()));
        assert_eq!(HostPattern::compile("*corp*"), HostPattern::Contains("corp".into()));
        assert_eq!(
            HostPattern::compile("api*.com"),
            HostPattern::Surround("api".into(), ".com".into())
        );
    }

    #[test]
    fn pattern_matching() {
        assert!(HostPattern::compile("*.example.com").matches("a.example.com"));
        assert!(!HostPattern::compile("*.example.com").matches("example.com"));
        assert!(HostPattern::compile("api*.com").matches("api-v2.example.com"));
        assert!(!HostPattern::compile("api*.com").matches("api.example.org"));
        assert!(HostPattern::compile("example.com").matches("example.com"));
        assert!(!HostPattern::compile("example.com").matches("www.example.com"));
    }

    #[test]
    fn allow_and_deny_lists() {
        let filter = HostFilter::new(&["*.example.com"], &["admin.example.com"]);
        assert!(!filter.is_blocked("www.example.com"));
        assert!(filter.is_blocked("admin.example.com"));
        assert!(filter.is_blocked("other.test"));

        let open: HostFilter = HostFilter::new::<&str>(&[], &[]);
        assert!(!open.is_blocked("anything.test"));
    }

    #[test]
    fn method_filter() {
        assert!(!MethodFilter::parse("").is_blocked("DELETE"));
        let f = MethodFilter::parse("GET|POST");
        assert!(!f.is_blocked("GET"));
        assert!(f.is_blocked("PUT"));
    }

    #[test]
    fn suffix_filter() {
        let f = SuffixFilter::parse("js|CSS|png");
        assert!(f.is_excluded("/static/app.JS"));
        assert!(f.is_excluded("/a/b.css"));
        assert!(!f.is_excluded("/"));
        assert!(!f.is_excluded("/api/js"));
        assert!(!SuffixFilter::parse("").is_excluded("/a.js"));
    }

    #[test]
    fn host_validity() {
        assert!(is_valid_host("192.168.40.1"));
        assert!(!is_valid_host("192.168.40"));
        assert!(!is_valid_host("300.1.1.1"));
        assert!(is_valid_host("api.example.com"));
        assert!(is_valid_host("localhost"));
        assert!(!is_valid_host("intranet"));
        assert!(!is_valid_host("-bad.example.com"));
        assert!(!is_valid_host("a/b.com"));
    }
}
