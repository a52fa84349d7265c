//! Delivery reporter: per-tenant webhook push of unreported events.
//!
//! Each cycle fetches the unreported slice of the event log in stable
//! `(event_ts, id)` order, groups it by tenant, and POSTs one batch per
//! eligible tenant to its sync URL under its own authentication. Events are
//! acknowledged (`reported_ts`) only after a 2xx; a failed POST puts the
//! tenant in a Do-Not-Disturb cooloff by future-dating its `last_sync`
//! entry. Delivery to tenants is therefore at-least-once; tenants dedupe
//! by event id.

use std::collections::BTreeMap;
use std::sync::Arc;

use postino_types::{
    ClientAuth, DeliveryReport, EventType, ReportedEvent, Tenant, UnreportedEvent, iso_utc,
    now_ts,
};
use tracing::{debug, info, warn};

use crate::attachments::apply_auth;
use crate::proxy::ProxyInner;

/// Long-running reporter loop: wake-event ∨ timer ∨ stop.
pub(crate) async fn run_report_loop(inner: Arc<ProxyInner>) {
    info!("report loop started");
    let client = match reqwest::Client::builder()
        .timeout(inner.config.report_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("failed to build reporter HTTP client: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.wake_reporter.notified() => {}
            _ = tokio::time::sleep(inner.config.report_interval) => {}
        }
        if inner.cancel.is_cancelled() {
            break;
        }
        if let Err(e) = report_cycle(&inner, &client).await {
            warn!("report cycle failed: {e:#}");
        }
    }
    info!("report loop stopped");
}

/// One reporter pass. Returns the number of events acknowledged.
pub(crate) async fn report_cycle(
    inner: &Arc<ProxyInner>,
    client: &reqwest::Client,
) -> anyhow::Result<usize> {
    let events = inner
        .store
        .events()
        .fetch_unreported(inner.config.report_fetch_limit)
        .await?;
    if events.is_empty() {
        return Ok(0);
    }

    let mut by_tenant: BTreeMap<String, Vec<UnreportedEvent>> = BTreeMap::new();
    for event in events {
        by_tenant.entry(event.tenant_id.clone()).or_default().push(event);
    }

    let mut acknowledged = 0;
    for (tenant_id, batch) in by_tenant {
        if inner.cancel.is_cancelled() {
            break;
        }
        let now = now_ts();
        if !tenant_due(inner, &tenant_id, now).await {
            continue;
        }

        let tenant = inner.store.tenants().get(&tenant_id).await?;
        let (url, auth) = match sync_target(inner, tenant.as_ref()) {
            Some(target) => target,
            None => {
                // No destination at all: events stay unreported, but the
                // cadence entry still advances so the loop does not spin.
                debug!(tenant_id = %tenant_id, "no sync URL configured, keeping events unreported");
                inner.last_sync.lock().await.insert(tenant_id, now);
                continue;
            }
        };

        let event_ids: Vec<i64> = batch.iter().map(|e| e.event_id).collect();
        let payload = DeliveryReport {
            delivery_report: batch.iter().map(to_reported).collect(),
        };

        let request = apply_auth(client.post(&url), auth.as_ref()).json(&payload);
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                inner.store.events().mark_reported(&event_ids, now).await?;
                acknowledged += event_ids.len();
                inner.last_sync.lock().await.insert(tenant_id.clone(), now);
                debug!(tenant_id = %tenant_id, events = event_ids.len(), "delivery report acknowledged");
            }
            Ok(response) => {
                let cooloff = now + inner.config.report_backoff.as_secs() as i64;
                inner.last_sync.lock().await.insert(tenant_id.clone(), cooloff);
                warn!(
                    tenant_id = %tenant_id,
                    status = %response.status(),
                    "delivery report rejected, backing off"
                );
            }
            Err(e) => {
                let cooloff = now + inner.config.report_backoff.as_secs() as i64;
                inner.last_sync.lock().await.insert(tenant_id.clone(), cooloff);
                warn!(tenant_id = %tenant_id, "delivery report failed: {e}, backing off");
            }
        }
    }

    Ok(acknowledged)
}

/// Cadence test: eligible when never synced, explicitly reset to 0, or the
/// sync interval has elapsed. A future-dated entry is a DND cooloff.
async fn tenant_due(inner: &Arc<ProxyInner>, tenant_id: &str, now: i64) -> bool {
    let last_sync = inner.last_sync.lock().await;
    match last_sync.get(tenant_id).copied() {
        None | Some(0) => true,
        Some(ts) if ts > now => false,
        Some(ts) => now - ts >= inner.config.sync_interval.as_secs() as i64,
    }
}

/// Resolve the destination URL and auth for a tenant, falling back to the
/// process-wide sync URL when the tenant has no base URL.
fn sync_target(
    inner: &Arc<ProxyInner>,
    tenant: Option<&Tenant>,
) -> Option<(String, Option<ClientAuth>)> {
    if let Some(tenant) = tenant {
        if let Some(url) = tenant.sync_url() {
            return Some((url, tenant.client_auth.clone()));
        }
    }
    inner
        .config
        .client_sync_url
        .clone()
        .map(|url| (url, inner.config.client_sync_auth.clone()))
}

/// Shape one event log row for the webhook payload.
pub(crate) fn to_reported(event: &UnreportedEvent) -> ReportedEvent {
    let metadata = event.metadata.as_ref();
    let meta_str = |key: &str| {
        metadata
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let deferred_until = metadata
        .and_then(|m| m.get("deferred_ts"))
        .and_then(|v| v.as_i64())
        .map(iso_utc);

    ReportedEvent {
        id: event.message_id.clone(),
        status: event.event_type,
        timestamp: iso_utc(event.event_ts),
        account: event.account_id.clone(),
        error: match event.event_type {
            EventType::Sent => None,
            _ => event.description.clone(),
        },
        bounce_type: meta_str("bounce_type"),
        bounce_code: meta_str("bounce_code"),
        deferred_until,
    }
}

/// Snapshot of a tenant's reporter cadence for `listTenantsSyncStatus`.
pub(crate) struct SyncStatus {
    pub last_sync_ts: Option<i64>,
    pub next_sync_due: bool,
    pub in_dnd: bool,
}

pub(crate) async fn sync_status(inner: &Arc<ProxyInner>, tenant_id: &str) -> SyncStatus {
    let now = now_ts();
    let last_sync = inner.last_sync.lock().await;
    match last_sync.get(tenant_id).copied() {
        None | Some(0) => SyncStatus {
            last_sync_ts: last_sync.get(tenant_id).copied(),
            next_sync_due: true,
            in_dnd: false,
        },
        Some(ts) if ts > now => SyncStatus {
            last_sync_ts: Some(ts),
            next_sync_due: false,
            in_dnd: true,
        },
        Some(ts) => SyncStatus {
            last_sync_ts: Some(ts),
            next_sync_due: now - ts >= inner.config.sync_interval.as_secs() as i64,
            in_dnd: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::mpsc as std_mpsc;

    use postino_types::{
        ClientAuth, EventType, MessagePayload, NewMessage, Tenant, now_ts,
    };

    use crate::config::ProxyConfig;
    use crate::proxy::MailProxy;

    struct FakeTenantServer {
        url: String,
        requests: std_mpsc::Receiver<(Option<String>, String)>,
        _handle: std::thread::JoinHandle<()>,
    }

    /// Serve canned status codes, capturing auth header and body.
    fn spawn_tenant_server(statuses: Vec<u16>) -> FakeTenantServer {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let url = format!("http://{}", server.server_addr());
        let (tx, rx) = std_mpsc::channel();
        let handle = std::thread::spawn(move || {
            for status in statuses {
                let Ok(mut request) = server.recv() else {
                    return;
                };
                let auth = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let _ = tx.send((auth, body));
                let _ = request.respond(tiny_http::Response::empty(status));
            }
        });
        FakeTenantServer {
            url,
            requests: rx,
            _handle: handle,
        }
    }

    async fn proxy_with_tenant(base_url: &str, auth: Option<ClientAuth>) -> MailProxy {
        let config = ProxyConfig {
            db_path: ":memory:".into(),
            cache: crate::config::CacheSettings {
                enabled: false,
                ..Default::default()
            },
            ..ProxyConfig::default()
        };
        let proxy = MailProxy::open(config).await.unwrap();

        let mut tenant = Tenant::new("t1");
        tenant.client_base_url = Some(base_url.to_string());
        tenant.client_auth = auth;
        proxy.store().tenants().insert(&tenant).await.unwrap();

        // One account + one sent message with an unreported event.
        let spec = postino_types::AccountSpec {
            id: "acc".into(),
            tenant_id: "t1".into(),
            host: "127.0.0.1".into(),
            port: 1,
            user: None,
            password: None,
            use_tls: Some(false),
            ttl: 300,
            batch_size: None,
            limit_per_minute: None,
            limit_per_hour: None,
            limit_per_day: None,
            limit_behavior: Default::default(),
            is_pec_account: false,
            imap_host: None,
            imap_port: 993,
            imap_user: None,
            imap_password: None,
            imap_folder: "INBOX".into(),
        };
        proxy.store().accounts().upsert(&spec).await.unwrap();

        let mut payload = MessagePayload::default();
        payload.from = Some("sender@example.com".into());
        payload.to = vec!["dest@example.com"].into();
        payload.subject = Some("s".into());
        let inserted = proxy
            .store()
            .messages()
            .insert_batch(
                &[NewMessage {
                    id: "m-1".into(),
                    tenant_id: "t1".into(),
                    account_id: Some("acc".into()),
                    priority: 2,
                    payload,
                    batch_code: None,
                    deferred_ts: None,
                }],
                &HashSet::new(),
            )
            .await
            .unwrap();
        proxy
            .store()
            .events()
            .add_event(&inserted[0].pk, EventType::Sent, now_ts(), None, None)
            .await
            .unwrap();

        proxy
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_post_marks_events_reported() {
        let server = spawn_tenant_server(vec![200]);
        let proxy = proxy_with_tenant(&server.url, Some(ClientAuth::Bearer { token: "tok".into() })).await;

        let acknowledged = super::report_cycle(proxy.inner(), &client()).await.unwrap();
        assert_eq!(acknowledged, 1);

        let (auth, body) = server.requests.recv().unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer tok"));
        assert!(body.contains("delivery_report"));
        assert!(body.contains("\"id\":\"m-1\""));
        assert!(body.contains("\"status\":\"sent\""));

        // Nothing left to report.
        assert!(proxy.store().events().fetch_unreported(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_post_keeps_events_and_backs_off() {
        let server = spawn_tenant_server(vec![500, 200]);
        let proxy = proxy_with_tenant(&server.url, None).await;

        let acknowledged = super::report_cycle(proxy.inner(), &client()).await.unwrap();
        assert_eq!(acknowledged, 0);
        assert_eq!(proxy.store().events().fetch_unreported(10).await.unwrap().len(), 1);

        // Tenant is in DND: an immediate second cycle skips it.
        let acknowledged = super::report_cycle(proxy.inner(), &client()).await.unwrap();
        assert_eq!(acknowledged, 0);

        // A run-now reset re-enables the tenant; the same event is re-sent
        // and acknowledged exactly once.
        proxy.inner().last_sync.lock().await.insert("t1".into(), 0);
        let acknowledged = super::report_cycle(proxy.inner(), &client()).await.unwrap();
        assert_eq!(acknowledged, 1);
        assert!(proxy.store().events().fetch_unreported(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_without_url_keeps_events_unreported() {
        let proxy = {
            let config = ProxyConfig {
                db_path: ":memory:".into(),
                cache: crate::config::CacheSettings {
                    enabled: false,
                    ..Default::default()
                },
                ..ProxyConfig::default()
            };
            MailProxy::open(config).await.unwrap()
        };
        proxy.store().tenants().insert(&Tenant::new("t1")).await.unwrap();
        let spec = postino_types::AccountSpec {
            id: "acc".into(),
            tenant_id: "t1".into(),
            host: "127.0.0.1".into(),
            port: 1,
            user: None,
            password: None,
            use_tls: Some(false),
            ttl: 300,
            batch_size: None,
            limit_per_minute: None,
            limit_per_hour: None,
            limit_per_day: None,
            limit_behavior: Default::default(),
            is_pec_account: false,
            imap_host: None,
            imap_port: 993,
            imap_user: None,
            imap_password: None,
            imap_folder: "INBOX".into(),
        };
        proxy.store().accounts().upsert(&spec).await.unwrap();
        let mut payload = MessagePayload::default();
        payload.from = Some("sender@example.com".into());
        payload.to = vec!["dest@example.com"].into();
        payload.subject = Some("s".into());
        let inserted = proxy
            .store()
            .messages()
            .insert_batch(
                &[NewMessage {
                    id: "m-1".into(),
                    tenant_id: "t1".into(),
                    account_id: Some("acc".into()),
                    priority: 2,
                    payload,
                    batch_code: None,
                    deferred_ts: None,
                }],
                &HashSet::new(),
            )
            .await
            .unwrap();
        proxy
            .store()
            .events()
            .add_event(&inserted[0].pk, EventType::Sent, now_ts(), None, None)
            .await
            .unwrap();

        let acknowledged = super::report_cycle(proxy.inner(), &client()).await.unwrap();
        assert_eq!(acknowledged, 0);
        assert_eq!(proxy.store().events().fetch_unreported(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deferred_metadata_reaches_the_payload() {
        let server = spawn_tenant_server(vec![200]);
        let proxy = proxy_with_tenant(&server.url, None).await;

        // Add a deferred event for a second message.
        let mut payload = MessagePayload::default();
        payload.from = Some("sender@example.com".into());
        payload.to = vec!["dest@example.com"].into();
        payload.subject = Some("s2".into());
        let inserted = proxy
            .store()
            .messages()
            .insert_batch(
                &[NewMessage {
                    id: "m-2".into(),
                    tenant_id: "t1".into(),
                    account_id: Some("acc".into()),
                    priority: 2,
                    payload,
                    batch_code: None,
                    deferred_ts: None,
                }],
                &HashSet::new(),
            )
            .await
            .unwrap();
        proxy
            .store()
            .events()
            .add_event(
                &inserted[0].pk,
                EventType::Deferred,
                now_ts(),
                Some("rate limited"),
                Some(&serde_json::json!({"deferred_ts": now_ts() + 60})),
            )
            .await
            .unwrap();

        super::report_cycle(proxy.inner(), &client()).await.unwrap();
        let (_, body) = server.requests.recv().unwrap();
        assert!(body.contains("\"deferred_until\""));
        assert!(body.contains("\"status\":\"deferred\""));
    }
}
