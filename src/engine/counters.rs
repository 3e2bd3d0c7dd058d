use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// directory scan and import traffic, QPS-gated
    Bulk,
    /// proxy, send and redirect traffic
    Interactive,
}

#[derive(Debug, Default)]
struct TierCounter {
    submitted: AtomicU64,
    completed: AtomicU64,
}

/// Progress counters per tier; nothing depends on them for correctness.
#[derive(Debug, Default)]
pub struct Counters {
    bulk: TierCounter,
    interactive: TierCounter,
    idle: Notify,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub bulk_submitted: u64,
    pub bulk_completed: u64,
    pub interactive_submitted: u64,
    pub interactive_completed: u64,
}

impl Progress {
    pub fn submitted(&self) -> u64 {
        self.bulk_submitted + self.interactive_submitted
    }

    pub fn completed(&self) -> u64 {
        self.bulk_completed + self.interactive_completed
    }

    pub fn is_idle(&self) -> bool {
        self.completed() >= self.submitted()
    }
}

impl Counters {
    fn tier(&self, tier: Tier) -> &TierCounter {
        match tier {
            Tier::Bulk => &self.bulk,
            Tier::Interactive => &self.interactive,
        }
    }

    pub fn submit(&self, tier: Tier) {
        self.tier(tier).submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn complete(&self, tier: Tier) {
        self.complete_many(tier, 1);
    }

    pub fn complete_many(&self, tier: Tier, n: u64) {
        if n == 0 {
            return;
        }
        self.tier(tier).completed.fetch_add(n, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            bulk_submitted: self.bulk.submitted.load(Ordering::SeqCst),
            bulk_completed: self.bulk.completed.load(Ordering::SeqCst),
            interactive_submitted: self.interactive.submitted.load(Ordering::SeqCst),
            interactive_completed: self.interactive.completed.load(Ordering::SeqCst),
        }
    }

    /// Resolves once every submitted task of both tiers has completed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.snapshot().is_idle() {
                return;
            }
            notified.await;
        }
    }
}
