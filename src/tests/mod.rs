use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::{ScanSettings, Wordlists};
use crate::domain::DomainHelper;
use crate::engine::{Collaborators, Engine, Origin};
use crate::fingerprint::FingerprintCheck;
use crate::http::{Exchange, HttpService, HttpTransport, RawRequest, TransportError};
use crate::output::{MemorySink, TaskRecord};
use crate::processing::{ProcessingRule, RuleScope, Transform};

/// In-memory transport: counts attempts, answers from a route table.
#[derive(Default)]
struct ScriptedTransport {
    attempts: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<u8>)>>,
    routes: HashMap<String, Vec<u8>>,
    fallback: Vec<u8>,
    block: bool,
    started: Notify,
}

impl ScriptedTransport {
    fn answering(fallback: &str) -> Self {
        ScriptedTransport {
            fallback: fallback.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn route(mut self, target: &str, response: &str) -> Self {
        self.routes
            .insert(target.to_string(), response.as_bytes().to_vec());
        self
    }

    fn blocking() -> Self {
        ScriptedTransport {
            block: true,
            ..Default::default()
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn targets(&self) -> Vec<(String, String)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(origin, raw)| {
                let target = RawRequest::parse(raw).map(|r| r.target).unwrap_or_default();
                (origin.clone(), target)
            })
            .collect()
    }

    fn requests(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, raw)| String::from_utf8_lossy(raw).into_owned())
            .collect()
    }
}

impl HttpTransport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        service: &'a HttpService,
        request: &'a [u8],
    ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((service.origin(), request.to_vec()));
            if self.block {
                self.started.notify_one();
                std::future::pending::<()>().await;
            }
            let target = RawRequest::parse(request)
                .map(|r| r.target)
                .unwrap_or_default();
            Ok(self
                .routes
                .get(&target)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone()))
        })
    }
}

/// Last two labels are the main domain; every host resolves to 10.0.0.1.
struct StubDomains;

impl DomainHelper for StubDomains {
    fn main_domain(&self, host: &str) -> Option<String> {
        let labels: Vec<&str> = host.split('.').collect();
        (labels.len() >= 2).then(|| labels[labels.len() - 2..].join("."))
    }

    fn lookup_ip(&self, _host: &str) -> Option<String> {
        Some("10.0.0.1".to_string())
    }
}

/// Like [`StubDomains`], but IP lookups take a while.
struct SlowDomains(Duration);

impl DomainHelper for SlowDomains {
    fn main_domain(&self, host: &str) -> Option<String> {
        StubDomains.main_domain(host)
    }

    fn lookup_ip(&self, host: &str) -> Option<String> {
        std::thread::sleep(self.0);
        StubDomains.lookup_ip(host)
    }
}

/// Remembers the response length of every check.
#[derive(Default)]
struct RecordingFingerprint {
    seen: Mutex<Vec<usize>>,
}

impl RecordingFingerprint {
    fn lengths(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

impl FingerprintCheck for RecordingFingerprint {
    fn check(&self, _request: &[u8], response: &[u8]) -> Vec<String> {
        self.seen.lock().unwrap().push(response.len());
        Vec::new()
    }

    fn clear_history(&self) {}
}

const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

fn settings() -> ScanSettings {
    ScanSettings {
        retry_interval_ms: 10,
        ..Default::default()
    }
}

fn engine(
    settings: ScanSettings,
    wordlists: Wordlists,
    transport: Arc<ScriptedTransport>,
) -> (Engine, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let collab =
        Collaborators::new(transport, sink.clone()).with_domains(Arc::new(StubDomains));
    let engine = Engine::new(settings, wordlists, collab).unwrap();
    (engine, sink)
}

fn get(host: &str, target: &str) -> Exchange {
    Exchange::new(
        HttpService::new("http", host, 80),
        format!("GET {target} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: test\r\n\r\n"),
    )
}

async fn idle(engine: &Engine) {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_idle())
        .await
        .expect("engine did not go idle");
}

async fn until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn record_for<'a>(records: &'a [TaskRecord], url: &str) -> &'a TaskRecord {
    records
        .iter()
        .find(|r| r.url == url)
        .unwrap_or_else(|| panic!("no record for {url}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_are_bounded_by_retry_count() {
    let transport = Arc::new(ScriptedTransport::default());
    let (engine, sink) = engine(
        ScanSettings {
            retry_count: 2,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    engine.submit(get("a.test", "/x"), Origin::Send);
    idle(&engine).await;

    assert_eq!(transport.attempts(), 3);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, None);
    assert_eq!(records[0].length, 0);
    assert_eq!(records[0].origin, "Send");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_interrupts_retry_sleep_and_records_the_task() {
    let transport = Arc::new(ScriptedTransport::default());
    let (engine, sink) = engine(
        ScanSettings {
            retry_count: 5,
            retry_interval_ms: 60_000,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    engine.submit(get("a.test", "/x"), Origin::Send);
    until(|| transport.attempts() == 1).await;
    let report = engine.stop_all().await;
    idle(&engine).await;

    assert_eq!(report.total(), 0);
    assert_eq!(transport.attempts(), 1);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "/x");
    assert_eq!(records[0].status, None);
    assert_eq!(records[0].length, 0);
    assert!(engine.is_admitted("http://a.test/x"));
    assert_eq!(engine.progress().interactive_completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_reclaims_queued_tasks_and_releases_identities() {
    let transport = Arc::new(ScriptedTransport::blocking());
    let payloads: Vec<String> = (0..100).map(|i| format!("/p{i}")).collect();
    let (engine, sink) = engine(
        ScanSettings {
            task_threads: 1,
            scan_level: 1,
            ..settings()
        },
        Wordlists::default().with_payloads("default", payloads),
        transport.clone(),
    );

    assert_eq!(engine.import_urls(["http://a.test/"]).unwrap(), 1);
    transport.started.notified().await;
    let progress = engine.progress();
    assert_eq!(progress.bulk_submitted, 101);

    let report = engine.stop_all().await;
    assert_eq!(report.bulk, 100);
    assert_eq!(report.interactive, 0);
    idle(&engine).await;

    let progress = engine.progress();
    assert_eq!(progress.bulk_completed, 101);
    assert!(progress.is_idle());
    assert_eq!(transport.attempts(), 1);
    // the in-flight send is recorded empty and keeps its identity
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "/");
    assert_eq!(records[0].status, None);
    assert!(engine.is_admitted("http://a.test/"));
    for i in 0..100 {
        assert!(!engine.is_admitted(&format!("http://a.test/p{i}")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_reclaims_queued_tasks_in_both_tiers() {
    let transport = Arc::new(ScriptedTransport::blocking());
    let (engine, sink) = engine(
        ScanSettings {
            task_threads: 1,
            lf_task_threads: 1,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    for i in 0..6 {
        engine.submit(get("a.test", &format!("/s{i}")), Origin::Send);
    }
    let urls: Vec<String> = (0..4).map(|i| format!("http://b.test/i{i}")).collect();
    assert_eq!(engine.import_urls(&urls).unwrap(), 4);
    until(|| transport.attempts() == 2).await;

    let report = engine.stop_all().await;
    assert_eq!(report.bulk, 3);
    assert_eq!(report.interactive, 5);
    idle(&engine).await;

    let progress = engine.progress();
    assert_eq!(progress.bulk_submitted, 4);
    assert_eq!(progress.bulk_completed, 4);
    assert_eq!(progress.interactive_submitted, 6);
    assert_eq!(progress.interactive_completed, 6);
    assert_eq!(transport.attempts(), 2);
    assert_eq!(sink.len(), 2);

    let sent: BTreeSet<String> = transport
        .targets()
        .into_iter()
        .map(|(origin, target)| format!("{origin}{target}"))
        .collect();
    for i in 0..6 {
        let identity = format!("http://a.test/s{i}");
        assert_eq!(engine.is_admitted(&identity), sent.contains(&identity));
    }
    for url in urls.iter() {
        assert_eq!(engine.is_admitted(url), sent.contains(url));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_delay_gates_bulk_tasks_only() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(
        ScanSettings {
            request_delay_ms: 500,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    let start = Instant::now();
    for i in 0..4 {
        engine.submit(get("a.test", &format!("/s{i}")), Origin::Send);
    }
    idle(&engine).await;
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(sink.len(), 4);

    let start = Instant::now();
    engine
        .import_urls(["http://a.test/i0", "http://a.test/i1", "http://a.test/i2"])
        .unwrap();
    idle(&engine).await;
    assert!(start.elapsed() >= Duration::from_millis(800));
    assert_eq!(sink.len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_is_followed_and_tagged_with_parent() {
    let transport = Arc::new(
        ScriptedTransport::answering(NOT_FOUND)
            .route(
                "/old",
                "HTTP/1.1 302 Found\r\nLocation: /new?x=1\r\nContent-Length: 0\r\n\r\n",
            )
            .route(
                "/new?x=1",
                "HTTP/1.1 200 OK\r\nContent-Length: 25\r\n\r\n<title>New Page</title>\r\n",
            ),
    );
    let (engine, sink) = engine(settings(), Wordlists::default(), transport.clone());

    engine.submit(get("a.test", "/old"), Origin::Send);
    idle(&engine).await;

    let records = sink.records();
    assert_eq!(records.len(), 2);
    let first = record_for(&records, "/old");
    let second = record_for(&records, "/new?x=1");
    assert_eq!(first.status, Some(302));
    assert_eq!(second.origin, format!("Redirect ({})", first.id));
    assert_eq!(second.status, Some(200));
    assert_eq!(second.title, "New Page");
    assert_eq!(second.ip, "10.0.0.1");
    assert!(engine.is_admitted("http://a.test/new?x=1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_is_not_followed_after_stop_all() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND).route(
        "/old",
        "HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n",
    ));
    let sink = Arc::new(MemorySink::new());
    let collab = Collaborators::new(transport.clone(), sink.clone())
        .with_domains(Arc::new(SlowDomains(Duration::from_millis(400))));
    let engine = Engine::new(settings(), Wordlists::default(), collab).unwrap();

    engine.submit(get("a.test", "/old"), Origin::Send);
    until(|| transport.attempts() == 1).await;
    let report = engine.stop_all().await;
    assert_eq!(report.total(), 0);
    idle(&engine).await;

    assert_eq!(transport.attempts(), 1);
    assert_eq!(
        transport.targets(),
        vec![("http://a.test".to_string(), "/old".to_string())]
    );
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Some(302));
    assert!(!engine.is_admitted("http://a.test/new"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_to_denied_host_is_dropped() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND).route(
        "/go",
        "HTTP/1.1 301 Moved Permanently\r\nLocation: http://evil.test/x\r\n\r\n",
    ));
    let wordlists = Wordlists {
        host_deny: vec!["evil.test".to_string()],
        ..Default::default()
    };
    let (engine, sink) = engine(settings(), wordlists, transport.clone());

    engine.submit(get("a.test", "/go"), Origin::Send);
    idle(&engine).await;

    assert_eq!(sink.len(), 1);
    assert!(transport
        .targets()
        .iter()
        .all(|(origin, _)| origin == "http://a.test"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn import_scans_directory_prefixes_with_payloads() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(
        ScanSettings {
            scan_level: 2,
            ..settings()
        },
        Wordlists::default().with_payloads("default", vec!["/.git/config".to_string()]),
        transport.clone(),
    );

    engine
        .import_urls(["http://a.test/admin/api/test", "not a url", ""])
        .unwrap();
    idle(&engine).await;

    let records = sink.records();
    let scanned: BTreeSet<&str> = records
        .iter()
        .filter(|r| r.origin == "Scan")
        .map(|r| r.url.as_str())
        .collect();
    assert_eq!(
        scanned,
        BTreeSet::from(["/.git/config", "/admin/.git/config"])
    );
    assert_eq!(record_for(&records, "/admin/api/test").origin, "Import");
    assert!(transport
        .requests()
        .iter()
        .any(|r| r.starts_with("GET /admin/.git/config HTTP/1.1\r\n")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_submissions_are_sent_once_until_history_is_cleared() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(settings(), Wordlists::default(), transport.clone());

    engine.submit(get("a.test", "/x?a=1"), Origin::Send);
    engine.submit(get("a.test", "/x?a=2"), Origin::Send);
    idle(&engine).await;
    assert_eq!(transport.attempts(), 1);

    engine.clear_history();
    engine.submit(get("a.test", "/x"), Origin::Send);
    idle(&engine).await;
    assert_eq!(transport.attempts(), 2);
    assert_eq!(sink.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolved_template_variable_fails_closed() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(settings(), Wordlists::default(), transport.clone());

    let request = |host: &str| {
        Exchange::new(
            HttpService::new("http", host, 80),
            format!("GET / HTTP/1.1\r\nHost: {host}\r\nX-Sub: {{{{subdomains.1}}}}\r\n\r\n"),
        )
    };
    engine.submit(request("example.com"), Origin::Send);
    idle(&engine).await;
    assert_eq!(transport.attempts(), 0);
    assert_eq!(engine.progress().submitted(), 0);
    assert!(!engine.is_admitted("http://example.com/"));

    engine.submit(request("api.v2.example.com"), Origin::Send);
    idle(&engine).await;
    assert_eq!(sink.len(), 1);
    assert!(transport.requests()[0].contains("X-Sub: v2\r\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_traffic_respects_method_and_host_filters() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let wordlists = Wordlists {
        host_allow: vec!["*.a.test".to_string()],
        ..Default::default()
    };
    let (engine, sink) = engine(
        ScanSettings {
            include_method: "GET".to_string(),
            ..settings()
        },
        wordlists,
        transport.clone(),
    );

    let post = Exchange::new(
        HttpService::new("http", "www.a.test", 80),
        "POST /form HTTP/1.1\r\nHost: www.a.test\r\nContent-Length: 3\r\n\r\na=1",
    );
    engine.submit(post, Origin::Proxy);
    engine.submit(get("other.test", "/"), Origin::Proxy);
    engine.submit(get("bad_host", "/"), Origin::Proxy);
    engine.submit(get("www.a.test", "/ok"), Origin::Proxy);
    idle(&engine).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "/ok");
    assert_eq!(records[0].origin, "Proxy");
    assert_eq!(engine.progress().interactive_submitted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merge_rules_rewrite_the_request_and_tag_the_record() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(
        ScanSettings {
            payload_processing: true,
            processing_rules: vec![ProcessingRule {
                name: "api".to_string(),
                enabled: true,
                merge: true,
                scope: RuleScope::Url,
                transforms: vec![Transform::AddPrefix {
                    value: "/api".to_string(),
                }],
            }],
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    engine.submit(get("a.test", "/users"), Origin::Send);
    idle(&engine).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].url, "/api/users");
    assert_eq!(records[0].origin, "Send [api]");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_host_is_short_circuited() {
    let transport = Arc::new(ScriptedTransport::default());
    let (engine, sink) = engine(
        ScanSettings {
            intercept_timeout_host: true,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    engine.submit(get("a.test", "/one"), Origin::Send);
    idle(&engine).await;
    assert!(engine.is_host_timed_out(&HttpService::new("http", "a.test", 80)));

    engine.submit(get("a.test", "/two"), Origin::Send);
    idle(&engine).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(sink.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_host_is_retried_once_interception_is_off() {
    let transport = Arc::new(ScriptedTransport::default());
    let (engine, sink) = engine(
        ScanSettings {
            intercept_timeout_host: true,
            ..settings()
        },
        Wordlists::default(),
        transport.clone(),
    );

    engine.submit(get("a.test", "/one"), Origin::Send);
    idle(&engine).await;
    assert!(engine.is_host_timed_out(&HttpService::new("http", "a.test", 80)));

    engine.update_settings(settings());
    engine.submit(get("a.test", "/two"), Origin::Send);
    idle(&engine).await;
    assert_eq!(transport.attempts(), 2);
    assert_eq!(sink.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_exchange_without_response_is_fingerprinted() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let checker = Arc::new(RecordingFingerprint::default());
    let collab = Collaborators::new(transport, Arc::new(MemorySink::new()))
        .with_domains(Arc::new(StubDomains))
        .with_fingerprint(checker.clone());
    let engine = Engine::new(settings(), Wordlists::default(), collab).unwrap();

    engine.submit(get("a.test", "/x"), Origin::Send);
    idle(&engine).await;
    until(|| checker.lengths().contains(&0)).await;
    assert!(checker.lengths().contains(&NOT_FOUND.len()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drops_later_submissions() {
    let transport = Arc::new(ScriptedTransport::answering(NOT_FOUND));
    let (engine, sink) = engine(settings(), Wordlists::default(), transport.clone());

    engine.shutdown().await;
    assert!(engine.is_shutdown());
    engine.submit(get("a.test", "/x"), Origin::Send);
    assert!(engine.import_urls(["http://a.test/y"]).is_err());
    assert_eq!(engine.progress().submitted(), 0);
    assert!(sink.is_empty());
}

#[test]
fn engine_requires_a_runtime() {
    let transport = Arc::new(ScriptedTransport::default());
    let collab = Collaborators::new(transport, Arc::new(MemorySink::new()));
    assert!(Engine::new(ScanSettings::default(), Wordlists::default(), collab).is_err());
}
