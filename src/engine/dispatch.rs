use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ScanSettings;
use crate::engine::redirect::follow_up;
use crate::engine::request::Origin;
use crate::engine::{EngineInner, Task};
use crate::http::{RawRequest, RawResponse};
use crate::output::TaskRecord;

/// Runs one task to completion: rate limit, send with retries, record, follow.
///
/// Every path out of here completes the task exactly once.
pub(crate) async fn run_task(inner: Arc<EngineInner>, task: Task, token: CancellationToken) {
    if token.is_cancelled() {
        inner.abandon(&task);
        return;
    }
    if !task.tag.origin.is_low_frequency() {
        if let Some(limiter) = inner.limiter() {
            if limiter.acquire(&token).await.is_err() {
                trace!(id = task.id, "interrupted while waiting for a send slot");
                inner.abandon(&task);
                return;
            }
        }
    }

    let state = inner.state();
    let response = send_with_retry(&inner, &task, &token, &state.settings).await;

    let record = build_record(&inner, &task, &response).await;
    inner.collab.results.record(record);

    if state.settings.follow_redirect && !response.is_empty() && !token.is_cancelled() {
        if let Some(parsed) = RawResponse::parse(&response) {
            let next = follow_up(
                &task.service,
                &task.request,
                &parsed,
                state.settings.redirect_cookies_follow,
            );
            if let Some(next) = next {
                inner.submit(next, Origin::Redirect { parent: task.id });
            }
        }
    }
    inner.counters.complete(task.tier());
}

/// An empty response means every attempt failed or the chain was interrupted.
async fn send_with_retry(
    inner: &EngineInner,
    task: &Task,
    token: &CancellationToken,
    settings: &ScanSettings,
) -> Vec<u8> {
    let host_key = task.service.origin();
    let attempts = settings.retry_count.saturating_add(1);
    for attempt in 0..attempts {
        if settings.intercept_timeout_host && inner.timeouts.is_marked(&host_key) {
            debug!(host = %host_key, "host timed out earlier, skipping send");
            return Vec::new();
        }
        if attempt > 0 {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(id = task.id, attempt, "retry chain interrupted");
                    return Vec::new();
                }
                _ = tokio::time::sleep(settings.retry_interval()) => {}
            }
        }

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => {
                trace!(id = task.id, attempt, "send interrupted");
                return Vec::new();
            }
            sent = inner.collab.transport.send(&task.service, &task.request) => sent,
        };
        match sent {
            Ok(response) if !response.is_empty() => return response,
            Ok(_) => debug!(id = task.id, attempt, "empty response"),
            Err(e) => debug!(id = task.id, attempt, "send failed: {e}"),
        }
    }

    if settings.intercept_timeout_host && inner.timeouts.mark(&host_key) {
        warn!(host = %host_key, "host marked as timed out");
    }
    Vec::new()
}

async fn build_record(inner: &EngineInner, task: &Task, response: &[u8]) -> TaskRecord {
    let request = RawRequest::parse(&task.request);
    let parsed = RawResponse::parse(response);
    let ip = inner.resolve_ip(&task.service.host).await;

    let tags = if response.is_empty() {
        Vec::new()
    } else {
        let checker = inner.collab.fingerprint.clone();
        let (req, resp) = (task.request.clone(), response.to_vec());
        tokio::task::spawn_blocking(move || checker.check(&req, &resp))
            .await
            .unwrap_or_default()
    };

    TaskRecord {
        id: task.id,
        origin: task.tag.to_string(),
        method: request
            .as_ref()
            .map(|r| r.method.clone())
            .unwrap_or_default(),
        host: task.service.origin(),
        url: request.map(|r| r.target).unwrap_or_default(),
        title: parsed.as_ref().map(|r| r.title()).unwrap_or_default(),
        ip,
        status: parsed.as_ref().map(|r| r.status),
        length: response.len(),
        tags,
        request: task.request.clone(),
        response: response.to_vec(),
    }
}
