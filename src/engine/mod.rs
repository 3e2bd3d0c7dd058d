//! The scan engine: inbound filtering, candidate generation, admission, and the
//! two-tier dispatch pools.
//!
//! An [`Engine`] owns every piece of shared state (dedup set, host-timeout set,
//! counters, pools, limiter). Tests build isolated instances.

mod counters;
mod dispatch;
mod limiter;
mod pool;
mod redirect;
mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::FutureExt;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use thiserror::Error;
use tracing::{debug, info};

use crate::bruteforcer::CandidatePlan;
use crate::collect::{CollectSink, NoCollect};
use crate::config::{ScanSettings, Wordlists};
use crate::dedup::{request_identity, Deduplicator, HostTimeoutSet};
use crate::domain::{DomainHelper, SuffixTableResolver};
use crate::filter::{is_valid_host, HostFilter, MethodFilter, SuffixFilter};
use crate::fingerprint::{FingerprintCheck, NoFingerprint};
use crate::http::{is_http, Exchange, HttpService, HttpTransport, RawRequest};
use crate::output::ResultSink;
use crate::processing::{PayloadPipeline, ProcessedRequest, Provenance};
use crate::template::{random_item, render_request, update_content_length, TemplateContext};

pub use counters::{Progress, Tier};
pub use limiter::{Interrupted, QpsLimiter, MAX_QPS};
pub use pool::{Handler, PoolError, WorkerPool};
pub use redirect::follow_up;
pub use request::{build_request, HeaderPolicy, Origin, OriginTag};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the engine must be created inside a tokio runtime")]
    NoRuntime,

    #[error("the engine is shut down")]
    ShutDown,
}

/// Everything the engine talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn HttpTransport>,
    pub results: Arc<dyn ResultSink>,
    pub fingerprint: Arc<dyn FingerprintCheck>,
    pub collector: Arc<dyn CollectSink>,
    pub domains: Arc<dyn DomainHelper>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn HttpTransport>, results: Arc<dyn ResultSink>) -> Self {
        Collaborators {
            transport,
            results,
            fingerprint: Arc::new(NoFingerprint),
            collector: Arc::new(NoCollect),
            domains: Arc::new(SuffixTableResolver::default()),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Arc<dyn FingerprintCheck>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn CollectSink>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_domains(mut self, domains: Arc<dyn DomainHelper>) -> Self {
        self.domains = domains;
        self
    }
}

/// Settings and wordlists with their compiled filters, swapped as one value.
struct ScanState {
    settings: ScanSettings,
    wordlists: Wordlists,
    methods: MethodFilter,
    suffixes: SuffixFilter,
    hosts: HostFilter,
    pipeline: PayloadPipeline,
}

impl ScanState {
    fn new(settings: ScanSettings, wordlists: Wordlists) -> Self {
        ScanState {
            methods: MethodFilter::parse(&settings.include_method),
            suffixes: SuffixFilter::parse(&settings.exclude_suffix),
            hosts: HostFilter::new(&wordlists.host_allow, &wordlists.host_deny),
            pipeline: PayloadPipeline::new(&settings.processing_rules),
            settings,
            wordlists,
        }
    }

    fn header_policy(&self) -> HeaderPolicy<'_> {
        HeaderPolicy {
            remove: if self.settings.remove_header {
                &self.wordlists.header_remove
            } else {
                &[]
            },
            replace: if self.settings.replace_header {
                &self.wordlists.header_replace
            } else {
                &[]
            },
        }
    }
}

/// One unit of dispatch work, owned by the worker running it.
pub(crate) struct Task {
    id: u64,
    /// reserved identity; only the primary request of a submission owns it
    identity: Option<String>,
    tag: OriginTag,
    service: HttpService,
    request: Vec<u8>,
}

impl Task {
    fn tier(&self) -> Tier {
        self.tag.origin.tier()
    }
}

pub(crate) struct FingerprintJob {
    request: Vec<u8>,
    response: Vec<u8>,
}

struct Lanes {
    bulk: WorkerPool<Task>,
    interactive: WorkerPool<Task>,
}

impl Lanes {
    fn new(engine: &Weak<EngineInner>, settings: &ScanSettings) -> Self {
        Lanes {
            bulk: WorkerPool::new("bulk", settings.task_threads, task_handler(engine.clone())),
            interactive: WorkerPool::new(
                "interactive",
                settings.lf_task_threads,
                task_handler(engine.clone()),
            ),
        }
    }

    fn pool(&self, tier: Tier) -> &WorkerPool<Task> {
        match tier {
            Tier::Bulk => &self.bulk,
            Tier::Interactive => &self.interactive,
        }
    }
}

fn task_handler(engine: Weak<EngineInner>) -> Handler<Task> {
    Arc::new(move |task: Task, token: CancellationToken| {
        let engine = engine.clone();
        async move {
            if let Some(inner) = engine.upgrade() {
                dispatch::run_task(inner, task, token).await;
            }
        }
        .boxed()
    })
}

fn fingerprint_handler(engine: Weak<EngineInner>) -> Handler<FingerprintJob> {
    Arc::new(move |job: FingerprintJob, _token: CancellationToken| {
        let engine = engine.clone();
        async move {
            let Some(checker) = engine.upgrade().map(|e| e.collab.fingerprint.clone()) else {
                return;
            };
            let _ = tokio::task::spawn_blocking(move || checker.check(&job.request, &job.response))
                .await;
        }
        .boxed()
    })
}

fn build_limiter(settings: &ScanSettings) -> Option<Arc<QpsLimiter>> {
    QpsLimiter::new(settings.qps_limit, settings.request_delay()).map(Arc::new)
}

/// Queued tasks reclaimed per tier by a stop or shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    pub bulk: usize,
    pub interactive: usize,
}

impl StopReport {
    pub fn total(&self) -> usize {
        self.bulk + self.interactive
    }
}

pub(crate) struct EngineInner {
    state: RwLock<Arc<ScanState>>,
    lanes: RwLock<Arc<Lanes>>,
    limiter: RwLock<Option<Arc<QpsLimiter>>>,
    fingerprint_pool: WorkerPool<FingerprintJob>,
    dedup: Deduplicator,
    timeouts: HostTimeoutSet,
    counters: counters::Counters,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    ip_cache: Mutex<HashMap<String, String>>,
    collab: Collaborators,
}

impl EngineInner {
    fn state(&self) -> Arc<ScanState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lanes(&self) -> Arc<Lanes> {
        self.lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn limiter(&self) -> Option<Arc<QpsLimiter>> {
        self.limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Inbound entry point for every exchange, including redirect follow-ups.
    fn submit(&self, exchange: Exchange, origin: Origin) {
        if self.is_shutdown() {
            debug!("engine is shut down, dropping exchange");
            return;
        }
        let Some(request) = RawRequest::parse(&exchange.request) else {
            debug!(service = %exchange.service, "dropping unparsable request");
            return;
        };
        let host = exchange.service.host.as_str();
        if !is_valid_host(host) {
            debug!(host, "dropping request for invalid host");
            return;
        }

        let state = self.state();
        match origin {
            Origin::Proxy => {
                if state.methods.is_blocked(&request.method) {
                    debug!(method = %request.method, "method not included");
                    return;
                }
                if state.hosts.is_blocked(host) {
                    debug!(host, "host filtered");
                    return;
                }
                self.collab.collector.collect(true, host, &exchange.request);
                if !exchange.response.is_empty() {
                    self.collab.collector.collect(false, host, &exchange.response);
                }
            }
            Origin::Redirect { .. } if state.settings.redirect_target_host_limit => {
                if state.hosts.is_blocked(host) {
                    debug!(host, "redirect target host filtered");
                    return;
                }
            }
            _ => {}
        }

        let job = FingerprintJob {
            request: exchange.request.clone(),
            response: exchange.response.clone(),
        };
        if let Err(e) = self.fingerprint_pool.execute(job) {
            debug!("fingerprint check skipped: {e}");
        }

        let path = request.path();
        if state.suffixes.is_excluded(&path) {
            debug!(path = %path, "suffix excluded, original request not re-sent");
        } else {
            self.admit_and_enqueue(
                &state,
                &exchange.service,
                &request,
                None,
                OriginTag::new(origin),
            );
        }

        let absolute_origin = is_http(&request.target)
            .then(|| Url::parse(&request.target).ok())
            .flatten()
            .and_then(|url| HttpService::from_url(&url))
            .map(|svc| svc.origin());
        let plan = CandidatePlan {
            path: &path,
            level: state.settings.scan_level,
            direction: state.settings.scan_direction,
            dir_scan: state.settings.dir_scan,
            bypass: state.settings.bypass_mode,
            payloads: state.wordlists.payloads(&state.settings.payload_set),
            bypass_prefixes: &state.wordlists.bypass_prefixes,
            bypass_suffixes: &state.wordlists.bypass_suffixes,
            absolute_origin: absolute_origin.as_deref(),
        };
        for candidate in plan.candidates() {
            self.admit_and_enqueue(
                &state,
                &exchange.service,
                &request,
                Some(&candidate),
                OriginTag::new(Origin::Scan),
            );
        }
    }

    /// Identity admission, request building, templating and processing for one target.
    fn admit_and_enqueue(
        &self,
        state: &ScanState,
        service: &HttpService,
        base: &RawRequest,
        candidate: Option<&str>,
        tag: OriginTag,
    ) {
        let target = candidate.unwrap_or(&base.target);
        let identity = request_identity(service, target, tag.origin.is_redirect());
        if !self.dedup.admit(&identity) {
            debug!(identity = %identity, "duplicate request identity");
            return;
        }

        let built = build_request(base, candidate, &state.header_policy());
        let url_path = RawRequest::parse(&built)
            .map(|r| r.path())
            .unwrap_or_default();
        let ctx = TemplateContext::new(
            service,
            &url_path,
            &state.wordlists.user_agents,
            self.collab.domains.as_ref(),
        );
        let finish = |raw: &[u8]| render_request(raw, &ctx).and_then(|r| update_content_length(&r));
        let rendered = match finish(&built) {
            Ok(rendered) => rendered,
            Err(e) => {
                debug!(identity = %identity, "payload dropped: {e}");
                self.dedup.release(&identity);
                return;
            }
        };

        let variants = if state.settings.payload_processing && !state.pipeline.is_empty() {
            state.pipeline.process(&rendered, &finish)
        } else {
            vec![ProcessedRequest {
                request: rendered,
                provenance: Provenance::Original,
            }]
        };

        let mut identity = Some(identity);
        for variant in variants {
            let tag = match variant.provenance {
                Provenance::Original => tag.clone(),
                Provenance::Merged(names) => tag.clone().with_rules(names),
                Provenance::Rule(name) => tag.clone().with_rules(vec![name]),
            };
            self.enqueue(Task {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                identity: identity.take(),
                tag,
                service: service.clone(),
                request: variant.request,
            });
        }
    }

    fn enqueue(&self, task: Task) {
        let tier = task.tier();
        let identity = task.identity.clone();
        self.counters.submit(tier);
        if let Err(e) = self.lanes().pool(tier).execute(task) {
            debug!("task rejected: {e}");
            if let Some(identity) = identity {
                self.dedup.release(&identity);
            }
            self.counters.complete(tier);
        }
    }

    /// Completes a task that will never send: its identity becomes admittable again.
    fn abandon(&self, task: &Task) {
        if let Some(identity) = task.identity.as_deref() {
            self.dedup.release(identity);
        }
        self.counters.complete(task.tier());
    }

    async fn drain(&self, lanes: &Lanes) -> StopReport {
        let bulk = lanes.bulk.shutdown_now().await;
        let interactive = lanes.interactive.shutdown_now().await;
        for task in bulk.iter().chain(interactive.iter()) {
            if let Some(identity) = task.identity.as_deref() {
                self.dedup.release(identity);
            }
        }
        self.counters.complete_many(Tier::Bulk, bulk.len() as u64);
        self.counters
            .complete_many(Tier::Interactive, interactive.len() as u64);
        StopReport {
            bulk: bulk.len(),
            interactive: interactive.len(),
        }
    }

    async fn resolve_ip(&self, host: &str) -> String {
        if let Some(ip) = self
            .ip_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
        {
            return ip.clone();
        }
        let domains = self.collab.domains.clone();
        let owned = host.to_string();
        let ip = tokio::task::spawn_blocking(move || domains.lookup_ip(&owned))
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        self.ip_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), ip.clone());
        ip
    }
}

/// Cheap-to-clone handle on one scan engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds the engine and spawns its pools on the current tokio runtime.
    pub fn new(
        settings: ScanSettings,
        wordlists: Wordlists,
        collab: Collaborators,
    ) -> Result<Self, EngineError> {
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            lanes: RwLock::new(Arc::new(Lanes::new(weak, &settings))),
            limiter: RwLock::new(build_limiter(&settings)),
            fingerprint_pool: WorkerPool::new(
                "fingerprint",
                settings.fp_threads,
                fingerprint_handler(weak.clone()),
            ),
            state: RwLock::new(Arc::new(ScanState::new(settings, wordlists))),
            dedup: Deduplicator::new(),
            timeouts: HostTimeoutSet::new(),
            counters: counters::Counters::default(),
            next_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            ip_cache: Mutex::new(HashMap::new()),
            collab,
        });
        Ok(Engine { inner })
    }

    /// Feeds one exchange through filtering, candidate generation and dispatch.
    ///
    /// Never fails: anything that cannot be scanned is dropped with a debug line.
    pub fn submit(&self, exchange: Exchange, origin: Origin) {
        self.inner.submit(exchange, origin);
    }

    /// Submits a synthetic `GET` per URL with the import origin. Returns how many
    /// lines were accepted.
    pub fn import_urls<I, S>(&self, urls: I) -> Result<usize, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.inner.is_shutdown() {
            return Err(EngineError::ShutDown);
        }
        let state = self.inner.state();
        let mut accepted = 0;
        for line in urls {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let exchange = Url::parse(line).ok().and_then(|url| {
                let ua = random_item(&state.wordlists.user_agents).unwrap_or_default();
                Exchange::from_url(&url, &ua)
            });
            match exchange {
                Some(exchange) => {
                    self.inner.submit(exchange, Origin::Import);
                    accepted += 1;
                }
                None => debug!(line, "skipping unparsable import line"),
            }
        }
        Ok(accepted)
    }

    /// Discards all queued work, interrupts running tasks and starts over with
    /// fresh pools and a fresh limiter.
    pub async fn stop_all(&self) -> StopReport {
        if self.inner.is_shutdown() {
            return StopReport::default();
        }
        let settings = self.inner.state().settings.clone();
        let fresh = Arc::new(Lanes::new(&Arc::downgrade(&self.inner), &settings));
        let old = std::mem::replace(
            &mut *self
                .inner
                .lanes
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        *self
            .inner
            .limiter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = build_limiter(&settings);
        let report = self.inner.drain(&old).await;
        info!(
            bulk = report.bulk,
            interactive = report.interactive,
            "stopped all tasks"
        );
        report
    }

    /// Forgets every admitted identity, timed-out host and fingerprint result.
    pub fn clear_history(&self) {
        self.inner.dedup.clear();
        self.inner.timeouts.clear();
        self.inner.collab.fingerprint.clear_history();
        self.inner
            .ip_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("scan history cleared");
    }

    /// Final teardown. Further submissions are dropped.
    pub async fn shutdown(&self) -> StopReport {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return StopReport::default();
        }
        let lanes = self.inner.lanes();
        let report = self.inner.drain(&lanes).await;
        let fingerprint_dropped = self.inner.fingerprint_pool.shutdown_now().await.len();
        self.clear_history();
        self.inner.collab.collector.clear();
        let progress = self.progress();
        info!(
            reclaimed = report.total(),
            fingerprint_dropped,
            submitted = progress.submitted(),
            completed = progress.completed(),
            "engine shut down"
        );
        report
    }

    pub async fn wait_idle(&self) {
        self.inner.counters.wait_idle().await;
    }

    /// Replaces the settings for every task created from now on. Pool sizes apply
    /// from the next [`Engine::stop_all`].
    pub fn update_settings(&self, settings: ScanSettings) {
        let rebuild_limiter = {
            let mut state = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = state.settings.qps_limit != settings.qps_limit
                || state.settings.request_delay_ms != settings.request_delay_ms;
            let limiter = changed.then(|| build_limiter(&settings));
            *state = Arc::new(ScanState::new(settings, state.wordlists.clone()));
            limiter
        };
        if let Some(limiter) = rebuild_limiter {
            *self
                .inner
                .limiter
                .write()
                .unwrap_or_else(PoisonError::into_inner) = limiter;
        }
    }

    pub fn update_wordlists(&self, wordlists: Wordlists) {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *state = Arc::new(ScanState::new(state.settings.clone(), wordlists));
    }

    pub fn settings(&self) -> ScanSettings {
        self.inner.state().settings.clone()
    }

    pub fn progress(&self) -> Progress {
        self.inner.counters.snapshot()
    }

    pub fn is_admitted(&self, identity: &str) -> bool {
        self.inner.dedup.contains(identity)
    }

    pub fn is_host_timed_out(&self, service: &HttpService) -> bool {
        self.inner.timeouts.is_marked(&service.origin())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}
