//! Dispatch scheduler: the main send loop.
//!
//! One cooperative task per instance. Each cycle runs two back-to-back
//! fetches so immediate-priority traffic gets a head start, groups ready
//! messages by account, caps each group, and dispatches the capped groups
//! concurrently under the global and per-account semaphores. Every
//! scheduled message ends the cycle with exactly one SMTP-terminal event
//! (`sent` or `error`) or a `deferred` event; all state changes flow
//! through the event writer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use postino_retry::{FailureClass, classify_smtp_code};
use postino_store::PriorityFilter;
use postino_types::{
    Account, EventType, Message, ReportedEvent, iso_utc, now_ts,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::builder::build_email;
use crate::error::DispatchError;
use crate::proxy::ProxyInner;
use crate::ratelimit::Plan;
use crate::smtp::failure_of;

/// Long-running dispatch loop: wake-event ∨ timer ∨ stop.
pub(crate) async fn run_dispatch_loop(inner: Arc<ProxyInner>) {
    info!("dispatch loop started");
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.wake_dispatch.notified() => {}
            _ = tokio::time::sleep(inner.config.send_loop_interval) => {}
        }
        if inner.cancel.is_cancelled() {
            break;
        }
        match process_cycle(&inner).await {
            Ok(true) => inner.wake_reporter.notify_one(),
            Ok(false) => {}
            Err(e) => error!("dispatch cycle failed: {e:#}"),
        }
    }
    info!("dispatch loop stopped");
}

/// One dispatch cycle: immediate-priority batch first, then the rest.
/// Returns true when anything was dispatched.
pub(crate) async fn process_cycle(inner: &Arc<ProxyInner>) -> anyhow::Result<bool> {
    if !inner.active.load(Ordering::Relaxed) {
        return Ok(false);
    }
    let now = now_ts();
    let limit = inner.config.fetch_limit;

    let immediate = inner
        .store
        .messages()
        .fetch_ready(limit, now, PriorityFilter::Exact(0))
        .await?;
    let mut processed = !immediate.is_empty();
    if !immediate.is_empty() {
        dispatch_batch(inner, immediate).await;
    }

    let rest = inner
        .store
        .messages()
        .fetch_ready(limit, now, PriorityFilter::AtLeast(1))
        .await?;
    processed |= !rest.is_empty();
    if !rest.is_empty() {
        dispatch_batch(inner, rest).await;
    }

    Ok(processed)
}

/// Group by account, cap per account, dispatch concurrently.
pub(crate) async fn dispatch_batch(inner: &Arc<ProxyInner>, batch: Vec<Message>) {
    let mut groups: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for message in batch {
        let key = message
            .account_id
            .clone()
            .unwrap_or_else(|| "default".to_string());
        groups.entry(key).or_default().push(message);
    }

    let mut join_set = tokio::task::JoinSet::new();
    for (account_key, mut group) in groups {
        let cap = account_cap(inner, &group).await;
        group.truncate(cap);

        let account_sem = inner.account_semaphore(&account_key).await;
        for message in group {
            let inner = inner.clone();
            let account_sem = account_sem.clone();
            join_set.spawn(async move {
                let Ok(_global) = inner.global_sem.acquire().await else {
                    return;
                };
                let Ok(_account) = account_sem.acquire().await else {
                    return;
                };
                dispatch_message(&inner, message).await;
            });
        }
    }
    // In-flight sends complete even when the stop signal arrives mid-cycle.
    while join_set.join_next().await.is_some() {}
}

async fn account_cap(inner: &Arc<ProxyInner>, group: &[Message]) -> usize {
    let global_cap = inner.config.batch_size_per_account.max(1) as usize;
    let account_cap = match group.first() {
        Some(message) => resolve_account(inner, message)
            .await
            .ok()
            .flatten()
            .and_then(|account| account.batch_size)
            .map(|cap| cap.max(1) as usize),
        None => None,
    };
    match account_cap {
        Some(cap) => cap.min(global_cap),
        None => global_cap,
    }
}

async fn resolve_account(
    inner: &Arc<ProxyInner>,
    message: &Message,
) -> postino_store::Result<Option<Account>> {
    if let Some(account_pk) = &message.account_pk {
        if let Some(account) = inner.store.accounts().get_by_pk(account_pk).await? {
            return Ok(Some(account));
        }
    }
    if let Some(account_id) = &message.account_id {
        match inner.store.accounts().get(&message.tenant_id, account_id).await {
            Ok(account) => return Ok(Some(account)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Deliver one message end to end: build, rate-limit, send, record.
///
/// Never propagates an error; every failure path becomes an event.
pub(crate) async fn dispatch_message(inner: &Arc<ProxyInner>, message: Message) {
    let now = now_ts();

    let tenant = match inner.store.tenants().get(&message.tenant_id).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => {
            record_error(inner, &message, now, "tenant not found").await;
            return;
        }
        Err(e) => {
            error!(message_id = %message.id, "tenant lookup failed: {e}");
            return;
        }
    };
    if !tenant.active {
        debug!(message_id = %message.id, tenant_id = %message.tenant_id, "tenant inactive, skipping");
        return;
    }

    let email = match build_email(&message, &tenant, &inner.fetcher, &inner.attachment_sem).await
    {
        Ok(email) => email,
        Err(e) => {
            record_error(inner, &message, now, &e.reason()).await;
            return;
        }
    };

    let account = match resolve_account(inner, &message).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            record_error(
                inner,
                &message,
                now,
                &format!(
                    "missing SMTP account configuration: {}",
                    message.account_id.as_deref().unwrap_or("-")
                ),
            )
            .await;
            return;
        }
        Err(e) => {
            error!(message_id = %message.id, "account lookup failed: {e}");
            return;
        }
    };

    match inner.limiter.check_and_plan(&account, now).await {
        Ok(Plan::Send) => {}
        Ok(Plan::Defer { until }) => {
            record_deferred(inner, &message, now, until, None, "rate limited").await;
            return;
        }
        Ok(Plan::Reject) => {
            record_error(inner, &message, now, &DispatchError::RateLimitExceeded.reason()).await;
            return;
        }
        Err(e) => {
            error!(message_id = %message.id, "rate limit check failed: {e}");
            return;
        }
    }

    match inner.pool.send(&account, email).await {
        Ok(_) => {
            if let Err(e) = inner.limiter.log_send(&account.pk, now).await {
                warn!(message_id = %message.id, "failed to log send: {e}");
            }
            record_sent(inner, &message, now).await;
        }
        Err(e) => {
            inner.limiter.release_slot(&account.pk).await;
            let failure = failure_of(&e);
            let retry_count = message.payload.retry_count;
            let transient = classify_smtp_code(failure.code) == FailureClass::Transient;

            if transient && inner.retry.should_retry(retry_count) {
                let next_ts = inner.retry.next_attempt_ts(now, retry_count);
                let mut payload = message.payload.clone();
                payload.retry_count = retry_count + 1;
                if let Err(e) = inner.store.messages().update_payload(&message.pk, &payload).await
                {
                    warn!(message_id = %message.id, "failed to persist retry count: {e}");
                }
                record_deferred(
                    inner,
                    &message,
                    now,
                    next_ts,
                    Some(retry_count + 1),
                    &failure.detail,
                )
                .await;
            } else {
                let description = match failure.code {
                    Some(code) => format!("{code} {}", failure.detail),
                    None => failure.detail,
                };
                record_error(inner, &message, now, &description).await;
            }
        }
    }
}

async fn record_sent(inner: &Arc<ProxyInner>, message: &Message, now: i64) {
    if let Err(e) = inner
        .store
        .events()
        .add_event(&message.pk, EventType::Sent, now, None, None)
        .await
    {
        error!(message_id = %message.id, "failed to record sent event: {e}");
        return;
    }
    if inner.config.log_delivery_activity {
        info!(message_id = %message.id, account = message.account_id.as_deref().unwrap_or("-"), "delivery succeeded");
    }
    inner
        .publish_result(ReportedEvent {
            id: message.id.clone(),
            status: EventType::Sent,
            timestamp: iso_utc(now),
            account: message.account_id.clone(),
            error: None,
            bounce_type: None,
            bounce_code: None,
            deferred_until: None,
        })
        .await;
}

async fn record_error(inner: &Arc<ProxyInner>, message: &Message, now: i64, reason: &str) {
    if let Err(e) = inner
        .store
        .events()
        .add_event(&message.pk, EventType::Error, now, Some(reason), None)
        .await
    {
        error!(message_id = %message.id, "failed to record error event: {e}");
        return;
    }
    if inner.config.log_delivery_activity {
        warn!(message_id = %message.id, reason, "delivery failed");
    }
    inner
        .publish_result(ReportedEvent {
            id: message.id.clone(),
            status: EventType::Error,
            timestamp: iso_utc(now),
            account: message.account_id.clone(),
            error: Some(reason.to_string()),
            bounce_type: None,
            bounce_code: None,
            deferred_until: None,
        })
        .await;
}

async fn record_deferred(
    inner: &Arc<ProxyInner>,
    message: &Message,
    now: i64,
    until: i64,
    retry_count: Option<u32>,
    reason: &str,
) {
    let mut metadata = json!({ "deferred_ts": until });
    if let Some(count) = retry_count {
        metadata["retry_count"] = json!(count);
    }
    if let Err(e) = inner
        .store
        .events()
        .add_event(
            &message.pk,
            EventType::Deferred,
            now,
            Some(reason),
            Some(&metadata),
        )
        .await
    {
        error!(message_id = %message.id, "failed to record deferred event: {e}");
        return;
    }
    if inner.config.log_delivery_activity {
        info!(message_id = %message.id, until = %iso_utc(until), "delivery deferred");
    }
    inner
        .publish_result(ReportedEvent {
            id: message.id.clone(),
            status: EventType::Deferred,
            timestamp: iso_utc(now),
            account: message.account_id.clone(),
            error: Some(reason.to_string()),
            bounce_type: None,
            bounce_code: None,
            deferred_until: Some(iso_utc(until)),
        })
        .await;
}
