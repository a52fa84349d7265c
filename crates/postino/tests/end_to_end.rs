//! End-to-end flow through the real background loops: submit over the
//! command API, let the dispatch loop attempt delivery, and watch the
//! reporter push the outcome to a fake tenant webhook.

use std::io::Read;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use postino::{MailProxy, ProxyConfig};
use serde_json::{Value, json};

/// Fake tenant webhook: always 200, forwards each request body.
fn spawn_webhook() -> (String, mpsc::Receiver<String>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
    let url = format!("http://{}", server.server_addr());
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        while let Ok(mut request) = server.recv() {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let _ = tx.send(body);
            let _ = request.respond(tiny_http::Response::from_string("{}"));
        }
    });
    (url, rx)
}

fn fast_config() -> ProxyConfig {
    let mut config = ProxyConfig {
        db_path: ":memory:".into(),
        ..ProxyConfig::default()
    };
    config.cache.enabled = false;
    config.send_loop_interval = Duration::from_millis(50);
    config.report_interval = Duration::from_millis(100);
    config
}

async fn wait_for<F>(mut probe: F, what: &str)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_dispatch_report_round_trip() {
    let (webhook_url, webhook_rx) = spawn_webhook();
    let proxy = MailProxy::start(fast_config()).await.expect("start proxy");

    let result = proxy
        .handle_command(
            "addTenant",
            json!({"id": "acme", "name": "Acme", "client_base_url": webhook_url}),
        )
        .await;
    assert_eq!(result["ok"], true);

    // SMTP target is a closed local port: the first attempt fails fast and
    // the message is deferred with backoff.
    let result = proxy
        .handle_command(
            "addAccount",
            json!({
                "id": "main",
                "tenant_id": "acme",
                "host": "127.0.0.1",
                "port": 1,
                "use_tls": false
            }),
        )
        .await;
    assert_eq!(result["ok"], true);

    let result = proxy
        .handle_command(
            "addMessages",
            json!({"messages": [{
                "id": "m-e2e-1",
                "tenant_id": "acme",
                "account_id": "main",
                "from": "noreply@acme.example",
                "to": ["user@example.com"],
                "subject": "greetings",
                "body": "hello"
            }]}),
        )
        .await;
    assert_eq!(result["ok"], true);
    assert_eq!(result["queued"], 1);

    // The dispatch loop picks the message up and records the deferral.
    let store = proxy.store().clone();
    wait_for(
        async || {
            store
                .messages()
                .get("m-e2e-1", "acme")
                .await
                .unwrap()
                .is_some_and(|m| m.deferred_ts.is_some())
        },
        "deferred message state",
    )
    .await;

    let message = store.messages().get("m-e2e-1", "acme").await.unwrap().unwrap();
    assert!(message.smtp_ts.is_none(), "deferred, not terminal");
    assert_eq!(message.payload.retry_count, 1);

    // The reporter ships the deferred event to the webhook and marks it.
    let body = webhook_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("webhook delivery");
    let report: Value = serde_json::from_str(&body).unwrap();
    let events = report["delivery_report"].as_array().unwrap();
    assert_eq!(events[0]["id"], "m-e2e-1");
    assert_eq!(events[0]["status"], "deferred");
    assert_eq!(events[0]["account"], "main");

    wait_for(
        async || store.events().fetch_unreported(10).await.unwrap().is_empty(),
        "events acknowledged",
    )
    .await;

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_and_suspension_over_the_command_api() {
    let proxy = MailProxy::start(fast_config()).await.expect("start proxy");

    proxy.handle_command("addTenant", json!({"id": "t1"})).await;
    proxy
        .handle_command(
            "addAccount",
            json!({"id": "a", "tenant_id": "t1", "host": "127.0.0.1", "port": 1}),
        )
        .await;

    // Suspend everything before submitting so the dispatcher never touches
    // the message.
    let result = proxy.handle_command("suspend", json!({"tenant_id": "t1"})).await;
    assert_eq!(result["suspended_batches"], json!(["*"]));

    proxy
        .handle_command(
            "addMessages",
            json!({"messages": [{
                "id": "m-1",
                "tenant_id": "t1",
                "account_id": "a",
                "from": "s@example.com",
                "to": "d@example.com",
                "subject": "s",
                "body": "b"
            }]}),
        )
        .await;

    // Give the dispatch loop a few cycles: the suspended message stays put.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let listed = proxy
        .handle_command("listMessages", json!({"tenant_id": "t1", "active_only": true}))
        .await;
    assert_eq!(listed["messages"].as_array().unwrap().len(), 1);
    let events = proxy
        .store()
        .events()
        .events_for_message(listed["messages"][0]["pk"].as_str().unwrap())
        .await
        .unwrap();
    assert!(events.is_empty(), "suspended tenants get no dispatch events");

    proxy.stop().await;
}
