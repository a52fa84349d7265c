//! Per-account rate limiting.
//!
//! Limits are windowed counters (minute/hour/day) over the persisted send
//! log plus in-memory reservations for sends currently in flight. The
//! planner answers one question per message: send now, defer until the
//! earliest window reset, or reject.
//!
//! Reservations exist so concurrent dispatches of the same account cannot
//! all pass the check before any of them logs a send; a reservation is
//! resolved either by `log_send` (success) or `release_slot` (failure).

use std::collections::HashMap;

use postino_store::Store;
use postino_types::{Account, LimitBehavior};
use tokio::sync::Mutex;

const WINDOWS: &[(i64, fn(&Account) -> Option<i64>)] = &[
    (60, |a| a.limit_per_minute),
    (3600, |a| a.limit_per_hour),
    (86_400, |a| a.limit_per_day),
];

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Under every configured limit; one slot has been reserved.
    Send,
    /// Over a limit with `defer` behaviour; retry at the given timestamp.
    Defer { until: i64 },
    /// Over a limit with `reject` behaviour; the message is terminal.
    Reject,
}

/// Per-account send-window planner.
pub struct RateLimiter {
    store: Store,
    reserved: Mutex<HashMap<String, i64>>,
}

impl RateLimiter {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Check every configured window; reserve a slot when clear.
    ///
    /// When more than one window is exhausted the deferral target is the
    /// latest reset, so the message is not bounced window to window.
    pub async fn check_and_plan(
        &self,
        account: &Account,
        now_ts: i64,
    ) -> postino_store::Result<Plan> {
        let mut reserved = self.reserved.lock().await;
        let pending = reserved.get(&account.pk).copied().unwrap_or(0);

        let mut defer_until: Option<i64> = None;
        for (window, limit_of) in WINDOWS {
            let Some(limit) = limit_of(account) else {
                continue;
            };
            if limit <= 0 {
                defer_until = Some(defer_until.unwrap_or(0).max(now_ts + window));
                continue;
            }
            let since = now_ts - window + 1;
            let sent = self.store.send_log().count_since(&account.pk, since).await?;
            if sent + pending + 1 > limit {
                let oldest = self
                    .store
                    .send_log()
                    .oldest_since(&account.pk, since)
                    .await?
                    .unwrap_or(now_ts);
                let reset = oldest + window;
                defer_until = Some(defer_until.unwrap_or(0).max(reset));
            }
        }

        match defer_until {
            Some(until) => match account.limit_behavior {
                LimitBehavior::Defer => Ok(Plan::Defer { until }),
                LimitBehavior::Reject => Ok(Plan::Reject),
            },
            None => {
                *reserved.entry(account.pk.clone()).or_insert(0) += 1;
                Ok(Plan::Send)
            }
        }
    }

    /// Record an actual successful send and resolve its reservation.
    pub async fn log_send(&self, account_pk: &str, now_ts: i64) -> postino_store::Result<()> {
        self.store.send_log().log_send(account_pk, now_ts).await?;
        self.release_slot(account_pk).await;
        Ok(())
    }

    /// Return an unused reservation (the send failed or was skipped).
    pub async fn release_slot(&self, account_pk: &str) {
        let mut reserved = self.reserved.lock().await;
        if let Some(count) = reserved.get_mut(account_pk) {
            *count -= 1;
            if *count <= 0 {
                reserved.remove(account_pk);
            }
        }
    }

    /// Drop send-log rows older than the longest window.
    pub async fn prune(&self, now_ts: i64) -> postino_store::Result<u64> {
        let horizon = WINDOWS.iter().map(|(w, _)| *w).max().unwrap_or(86_400);
        self.store.send_log().prune_before(now_ts - horizon).await
    }
}
