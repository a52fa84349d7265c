//! HTTP control surface.
//!
//! A thin dispatcher over [`crate::commands`]: the router is built by
//! walking the static command registry, so every command is reachable as
//! `POST /commands/<route>`, and the inspection commands get GET aliases
//! (`/messages`, `/accounts`, `/tenants`, `/instance`, `/command_log`)
//! that accept query parameters.
//!
//! Authentication is the `X-API-Token` header. The global token (config
//! override or the instance row) permits everything; a per-tenant API key
//! is accepted only for commands whose `tenant_id` matches its tenant.
//! With no global token configured the surface is open, which is the
//! development default.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::{self, HttpShape};
use crate::proxy::{MailProxy, ProxyInner};

const TOKEN_HEADER: &str = "x-api-token";

#[derive(Clone)]
struct AppState {
    inner: Arc<ProxyInner>,
}

/// Build the router for a running proxy.
pub fn router(proxy: &MailProxy) -> Router {
    let state = AppState {
        inner: proxy.inner().clone(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/messages", get(alias_messages))
        .route("/accounts", get(alias_accounts))
        .route("/tenants", get(alias_tenants))
        .route("/instance", get(alias_instance))
        .route("/command_log", get(alias_command_log))
        // Every registry entry is reachable by POST; GET-shaped commands
        // additionally accept query parameters.
        .route("/commands/:route", post(command).get(command_get))
        .with_state(state)
}

/// Serve the control surface until the token is cancelled.
pub async fn serve(
    proxy: &MailProxy,
    bind: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("control surface listening on {}", listener.local_addr()?);
    axum::serve(listener, router(proxy))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers, None).await {
        return denied;
    }
    Json(json!({"ok": true, "active": true})).into_response()
}

async fn command(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let payload = body.map(|Json(value)| value).unwrap_or_else(|| json!({}));
    execute(&state, &headers, &route, payload).await
}

async fn command_get(
    State(state): State<AppState>,
    Path(route): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let get_shaped = commands::COMMANDS
        .iter()
        .any(|d| d.route == route && d.shape == HttpShape::Get);
    if !get_shaped {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    execute(&state, &headers, &route, query_to_payload(params)).await
}

macro_rules! alias_route {
    ($name:ident, $command:literal) => {
        async fn $name(
            State(state): State<AppState>,
            headers: HeaderMap,
            Query(params): Query<HashMap<String, String>>,
        ) -> Response {
            run_command(&state, &headers, $command, query_to_payload(params)).await
        }
    };
}

alias_route!(alias_messages, "listMessages");
alias_route!(alias_accounts, "listAccounts");
alias_route!(alias_tenants, "listTenants");
alias_route!(alias_instance, "getInstance");
alias_route!(alias_command_log, "listCommands");

async fn execute(state: &AppState, headers: &HeaderMap, route: &str, payload: Value) -> Response {
    let Some(descriptor) = commands::COMMANDS.iter().find(|d| d.route == route) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    run_command(state, headers, descriptor.name, payload).await
}

async fn run_command(
    state: &AppState,
    headers: &HeaderMap,
    command_name: &str,
    mut payload: Value,
) -> Response {
    let tenant_scope = payload
        .get("tenant_id")
        .or_else(|| payload.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    match authorize(state, headers, tenant_scope.as_deref()).await {
        Ok(AuthScope::Global) => {}
        Ok(AuthScope::Tenant(tenant_id)) => {
            // A tenant token implies its own tenant when none is given.
            if tenant_scope.is_none() {
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("tenant_id".into(), json!(tenant_id));
                }
            }
        }
        Err(denied) => return denied,
    }

    let result = commands::handle_command(&state.inner, command_name, payload).await;
    let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let code = if ok { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (code, Json(result)).into_response()
}

enum AuthScope {
    Global,
    Tenant(String),
}

/// Resolve the request token against the global token and tenant API keys.
///
/// `requested_tenant` is the tenant the command wants to act on; a tenant
/// token targeting a foreign tenant is a 403.
async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    requested_tenant: Option<&str>,
) -> Result<AuthScope, Response> {
    let global_token = match &state.inner.config.api_token {
        Some(token) => Some(token.clone()),
        None => state
            .inner
            .store
            .instance()
            .api_token()
            .await
            .unwrap_or(None),
    };

    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    let Some(global_token) = global_token else {
        return Ok(AuthScope::Global);
    };

    let Some(presented) = presented else {
        return Err(denied(StatusCode::UNAUTHORIZED, "missing API token"));
    };

    if presented == global_token {
        return Ok(AuthScope::Global);
    }

    match state.inner.store.tenants().tenant_by_token(presented).await {
        Ok(Some(tenant)) => match requested_tenant {
            Some(requested) if requested != tenant.id => Err(denied(
                StatusCode::FORBIDDEN,
                "token not valid for this tenant",
            )),
            _ => Ok(AuthScope::Tenant(tenant.id)),
        },
        Ok(None) => Err(denied(StatusCode::UNAUTHORIZED, "invalid API token")),
        Err(_) => Err(denied(StatusCode::UNAUTHORIZED, "invalid API token")),
    }
}

fn denied(code: StatusCode, error: &str) -> Response {
    (code, Json(json!({"ok": false, "error": error}))).into_response()
}

/// Query parameters arrive as strings; recover booleans and integers so
/// GET aliases behave like their JSON-body counterparts.
fn query_to_payload(params: HashMap<String, String>) -> Value {
    let mut payload = serde_json::Map::new();
    for (key, value) in params {
        let typed = match value.as_str() {
            "true" => json!(true),
            "false" => json!(false),
            other => match other.parse::<i64>() {
                Ok(number) => json!(number),
                Err(_) => json!(other),
            },
        };
        payload.insert(key, typed);
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;

    use crate::config::ProxyConfig;
    use crate::proxy::MailProxy;

    async fn serve_proxy(api_token: Option<&str>) -> (MailProxy, String, CancellationToken) {
        let config = ProxyConfig {
            db_path: ":memory:".into(),
            api_token: api_token.map(str::to_string),
            cache: crate::config::CacheSettings {
                enabled: false,
                ..Default::default()
            },
            ..ProxyConfig::default()
        };
        let proxy = MailProxy::open(config).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = super::router(&proxy);
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });

        (proxy, format!("http://{addr}"), cancel)
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let (_proxy, base, cancel) = serve_proxy(Some("secret")).await;
        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        cancel.cancel();
    }

    #[tokio::test]
    async fn status_requires_the_token() {
        let (_proxy, base, cancel) = serve_proxy(Some("secret")).await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{base}/status")).send().await.unwrap();
        assert_eq!(response.status(), 401);

        let response = client
            .get(format!("{base}/status"))
            .header("X-API-Token", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        cancel.cancel();
    }

    #[tokio::test]
    async fn commands_flow_through_the_registry() {
        let (_proxy, base, cancel) = serve_proxy(Some("secret")).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/commands/add-tenant"))
            .header("X-API-Token", "secret")
            .json(&json!({"id": "t1", "name": "One"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let response = client
            .get(format!("{base}/tenants"))
            .header("X-API-Token", "secret")
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        let ids: Vec<&str> = body["tenants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tenant| tenant["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"t1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn tenant_token_cannot_cross_tenants() {
        let (proxy, base, cancel) = serve_proxy(Some("secret")).await;
        proxy.handle_command("addTenant", json!({"id": "t1"})).await;
        proxy.handle_command("addTenant", json!({"id": "t2"})).await;
        let key = proxy
            .store()
            .tenants()
            .create_api_key("t1", None)
            .await
            .unwrap();

        let client = reqwest::Client::new();

        // Own tenant: accepted.
        let response = client
            .get(format!("{base}/messages?tenant_id=t1"))
            .header("X-API-Token", &key)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        // Foreign tenant: refused without touching state.
        let response = client
            .get(format!("{base}/messages?tenant_id=t2"))
            .header("X-API-Token", &key)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403);

        // Garbage token: unauthorized.
        let response = client
            .get(format!("{base}/messages?tenant_id=t1"))
            .header("X-API-Token", "pst_bogus")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        cancel.cancel();
    }

    #[tokio::test]
    async fn bad_commands_return_400_with_envelope() {
        let (_proxy, base, cancel) = serve_proxy(None).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/commands/suspend"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["ok"], false);
        cancel.cancel();
    }
}
