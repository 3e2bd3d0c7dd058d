use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Domain facts the engine needs about a host.
///
/// Every lookup may fail; callers treat `None` as "cannot fill".
pub trait DomainHelper: Send + Sync {
    /// Registrable domain, e.g. `example.co.uk` for `api.example.co.uk`.
    fn main_domain(&self, host: &str) -> Option<String>;

    /// Registrable label without its suffix, e.g. `example`.
    fn domain_name(&self, host: &str) -> Option<String> {
        let main = self.main_domain(host)?;
        main.split('.').next().map(|s| s.to_string())
    }

    /// Address the host resolves to.
    fn lookup_ip(&self, host: &str) -> Option<String>;
}

pub fn is_ipv4(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

/// Everything left of the main domain, e.g. `api.admin` for `api.admin.example.com`.
pub fn subdomains(helper: &dyn DomainHelper, host: &str) -> Option<String> {
    if is_ipv4(host) || !host.contains('.') {
        return None;
    }
    let main = helper.main_domain(host)?;
    let end = host.rfind(&main)?.checked_sub(1)?;
    let out = &host[..end];
    (!out.is_empty()).then(|| out.to_string())
}

/// First label of [`subdomains`].
pub fn subdomain(helper: &dyn DomainHelper, host: &str) -> Option<String> {
    let all = subdomains(helper, host)?;
    all.split('.').next().map(|s| s.to_string())
}

// multi-label public suffixes that need three labels for a registrable domain
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "com.cn", "net.cn", "org.cn", "gov.cn",
    "edu.cn", "com.hk", "com.tw", "com.au", "net.au", "org.au", "co.jp", "ne.jp", "or.jp",
    "co.kr", "co.nz", "co.in", "com.br", "com.mx", "com.sg", "com.tr", "co.za", "com.ar",
];

/// Public-suffix lookup over a fixed table plus system DNS for IP lookups.
#[derive(Debug, Clone)]
pub struct SuffixTableResolver {
    multi_label: HashSet<String>,
}

impl Default for SuffixTableResolver {
    fn default() -> Self {
        SuffixTableResolver {
            multi_label: MULTI_LABEL_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SuffixTableResolver {
    pub fn with_suffixes<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut resolver = SuffixTableResolver::default();
        resolver
            .multi_label
            .extend(extra.into_iter().map(|s| s.into().to_ascii_lowercase()));
        resolver
    }
}

impl DomainHelper for SuffixTableResolver {
    fn main_domain(&self, host: &str) -> Option<String> {
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return None;
        }
        let last_two = labels[labels.len() - 2..].join(".");
        if self.multi_label.contains(&last_two) {
            if labels.len() < 3 {
                return None;
            }
            return Some(labels[labels.len() - 3..].join("."));
        }
        Some(last_two)
    }

    fn lookup_ip(&self, host: &str) -> Option<String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip.to_string());
        }
        let addrs: Vec<_> = (host, 0u16).to_socket_addrs().ok()?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip().to_string())
    }
}
