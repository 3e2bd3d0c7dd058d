use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::http::{is_http, HttpService};

#[derive(Debug, Default)]
struct ConcurrentSet {
    inner: Mutex<HashSet<String>>,
}

impl ConcurrentSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn remove(&self, key: &str) -> bool {
        self.lock().remove(key)
    }

    fn clear(&self) {
        self.lock().clear()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// At-most-once admission of request identities.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: ConcurrentSet,
}

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator::default()
    }

    /// True when `identity` was not admitted before; the caller owns it from now on.
    pub fn admit(&self, identity: &str) -> bool {
        self.seen.insert(identity)
    }

    /// Makes `identity` admittable again.
    pub fn release(&self, identity: &str) {
        self.seen.remove(identity);
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    pub fn clear(&self) {
        self.seen.clear()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hosts whose requests ran out of retries without any response.
#[derive(Debug, Default)]
pub struct HostTimeoutSet {
    hosts: ConcurrentSet,
}

impl HostTimeoutSet {
    pub fn new() -> Self {
        HostTimeoutSet::default()
    }

    /// Returns true if the host was not marked before.
    pub fn mark(&self, host: &str) -> bool {
        self.hosts.insert(host)
    }

    pub fn is_marked(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    pub fn clear(&self) {
        self.hosts.clear()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical dedup key for a request target on a service.
///
/// Absolute-URL targets key on the full URL; redirect hops keep their query;
/// everything else keys on the path alone.
pub fn request_identity(service: &HttpService, target: &str, redirect: bool) -> String {
    let origin = service.origin();
    if is_http(target) {
        return format!("{origin}->{target}");
    }
    if redirect {
        return format!("{origin}{target}");
    }
    let end = target.find(&['?', '#'][..]).unwrap_or(target.len());
    let path = &target[..end];
    if path.starts_with('/') {
        format!("{origin}{path}")
    } else {
        format!("{origin}/{path}")
    }
}
