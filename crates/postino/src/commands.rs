//! Command dispatcher: the single entry point for control operations.
//!
//! A static registry maps command names to handlers; results are wrapped
//! in a uniform `{ok, ...}` envelope (lists under a per-command key,
//! booleans as `{ok}` / `{ok: false, error}`). Legacy payload keys (`id`
//! for `tenant_id`) are rewritten at this boundary so the internal API
//! stays clean. Mutating commands are appended to the command log after
//! execution with their response status.

use std::collections::HashSet;
use std::sync::Arc;

use postino_types::{
    AccountSpec, EventType, InsertedMessage, MessagePayload, NewMessage, ReportedEvent, Tenant,
    iso_utc, normalise_priority, now_ts,
};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::proxy::ProxyInner;
use crate::reporter;

/// How a command maps onto the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpShape {
    /// Query-parameter GET (inspection commands).
    Get,
    /// JSON-body POST (everything that mutates or takes structure).
    Post,
}

/// One entry of the static command registry.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub name: &'static str,
    /// Route under `/commands/`, kebab-case.
    pub route: &'static str,
    pub shape: HttpShape,
    /// Mutating commands are recorded in the command log.
    pub mutating: bool,
    /// Envelope key used when the result is a list.
    pub list_key: Option<&'static str>,
}

/// The registry walked by the HTTP layer at startup.
pub const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor { name: "run now", route: "run-now", shape: HttpShape::Post, mutating: false, list_key: None },
    CommandDescriptor { name: "suspend", route: "suspend", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "activate", route: "activate", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "addMessages", route: "add-messages", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "deleteMessages", route: "delete-messages", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "listMessages", route: "list-messages", shape: HttpShape::Get, mutating: false, list_key: Some("messages") },
    CommandDescriptor { name: "cleanupMessages", route: "cleanup-messages", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "addAccount", route: "add-account", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "listAccounts", route: "list-accounts", shape: HttpShape::Get, mutating: false, list_key: Some("accounts") },
    CommandDescriptor { name: "deleteAccount", route: "delete-account", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "addTenant", route: "add-tenant", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "getTenant", route: "get-tenant", shape: HttpShape::Get, mutating: false, list_key: None },
    CommandDescriptor { name: "listTenants", route: "list-tenants", shape: HttpShape::Get, mutating: false, list_key: Some("tenants") },
    CommandDescriptor { name: "listTenantsSyncStatus", route: "list-tenants-sync-status", shape: HttpShape::Get, mutating: false, list_key: Some("tenants") },
    CommandDescriptor { name: "updateTenant", route: "update-tenant", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "deleteTenant", route: "delete-tenant", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "createApiKey", route: "create-api-key", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "revokeApiKey", route: "revoke-api-key", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "getInstance", route: "get-instance", shape: HttpShape::Get, mutating: false, list_key: None },
    CommandDescriptor { name: "updateInstance", route: "update-instance", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "upgradeInstance", route: "upgrade-instance", shape: HttpShape::Post, mutating: true, list_key: None },
    CommandDescriptor { name: "listCommands", route: "list-commands", shape: HttpShape::Get, mutating: false, list_key: Some("commands") },
    CommandDescriptor { name: "purgeCommands", route: "purge-commands", shape: HttpShape::Post, mutating: true, list_key: None },
];

pub fn descriptor(name: &str) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|descriptor| descriptor.name == name)
}

/// Execute a command and, for mutating commands, append it to the audit
/// log with the response status.
pub(crate) async fn handle_command(
    inner: &Arc<ProxyInner>,
    cmd: &str,
    payload: Value,
) -> Value {
    let tenant_id = payload
        .get("tenant_id")
        .or_else(|| payload.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let result = dispatch(inner, cmd, payload.clone()).await;

    if descriptor(cmd).is_some_and(|d| d.mutating) {
        let ok = result.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let status = if ok { 200 } else { 400 };
        if let Err(e) = inner
            .store
            .command_log()
            .append(cmd, &payload, tenant_id.as_deref(), status, &result)
            .await
        {
            warn!("failed to log command {cmd}: {e}");
        }
    }

    result
}

/// Route a command to its handler. Unknown names get `{ok: false}`.
pub(crate) async fn dispatch(inner: &Arc<ProxyInner>, cmd: &str, payload: Value) -> Value {
    match cmd {
        "run now" => run_now(inner, &payload).await,
        "suspend" => suspend_or_activate(inner, &payload, true).await,
        "activate" => suspend_or_activate(inner, &payload, false).await,
        "addMessages" => add_messages(inner, payload).await,
        "deleteMessages" => delete_messages(inner, &payload).await,
        "listMessages" => list_messages(inner, &payload).await,
        "cleanupMessages" => cleanup_messages(inner, &payload).await,
        "addAccount" => add_account(inner, payload).await,
        "listAccounts" => list_accounts(inner, &payload).await,
        "deleteAccount" => delete_account(inner, &payload).await,
        "addTenant" => add_tenant(inner, payload).await,
        "getTenant" => get_tenant(inner, &payload).await,
        "listTenants" => list_tenants(inner, &payload).await,
        "listTenantsSyncStatus" => list_tenants_sync_status(inner).await,
        "updateTenant" => update_tenant(inner, payload).await,
        "deleteTenant" => delete_tenant(inner, &payload).await,
        "createApiKey" => create_api_key(inner, &payload).await,
        "revokeApiKey" => revoke_api_key(inner, &payload).await,
        "getInstance" => get_instance(inner).await,
        "updateInstance" => update_instance(inner, payload).await,
        "upgradeInstance" => upgrade_instance(inner).await,
        "listCommands" => list_commands(inner, &payload).await,
        "purgeCommands" => purge_commands(inner, &payload).await,
        _ => json!({"ok": false, "error": "unknown command"}),
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Legacy payloads carry the tenant id under `id`.
fn tenant_id_of(payload: &Value) -> Option<&str> {
    str_field(payload, "tenant_id").or_else(|| str_field(payload, "id"))
}

fn require_tenant_id(payload: &Value) -> Result<&str, Value> {
    str_field(payload, "tenant_id").ok_or_else(|| json!({"ok": false, "error": "tenant_id is required"}))
}

fn db_error(e: impl std::fmt::Display) -> Value {
    json!({"ok": false, "error": e.to_string()})
}

// --------------------------------------------------------------------- run now

async fn run_now(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    if let Some(tenant_id) = tenant_id_of(payload) {
        // Reset the cadence so the reporter calls this tenant immediately.
        inner.last_sync.lock().await.insert(tenant_id.to_string(), 0);
    }
    inner.wake_dispatch.notify_one();
    inner.wake_reporter.notify_one();
    json!({"ok": true})
}

// ------------------------------------------------------------------ suspension

async fn suspend_or_activate(inner: &Arc<ProxyInner>, payload: &Value, suspend: bool) -> Value {
    let Some(tenant_id) = tenant_id_of(payload) else {
        return json!({"ok": false, "error": "tenant_id is required"});
    };
    let batch_code = str_field(payload, "batch_code");

    let result = if suspend {
        inner.store.tenants().suspend_batch(tenant_id, batch_code).await
    } else {
        inner.store.tenants().activate_batch(tenant_id, batch_code).await
    };
    if let Err(e) = result {
        let error = if e.is_not_found() {
            "tenant not found".to_string()
        } else {
            e.to_string()
        };
        return json!({"ok": false, "error": error});
    }

    let suspended = inner
        .store
        .tenants()
        .suspended_batches(tenant_id)
        .await
        .unwrap_or_default();
    let pending = inner
        .store
        .messages()
        .count_pending_for_tenant(tenant_id, batch_code)
        .await
        .unwrap_or(0);
    json!({
        "ok": true,
        "tenant_id": tenant_id,
        "batch_code": batch_code,
        "suspended_batches": suspended,
        "pending_messages": pending,
    })
}

// -------------------------------------------------------------------- messages

async fn add_messages(inner: &Arc<ProxyInner>, payload: Value) -> Value {
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return json!({"ok": false, "error": "messages must be a list"});
    };
    if messages.len() > inner.config.max_enqueue_batch {
        return json!({
            "ok": false,
            "error": format!(
                "Cannot enqueue more than {} messages at once",
                inner.config.max_enqueue_batch
            )
        });
    }

    let default_priority =
        normalise_priority(payload.get("default_priority"), inner.config.default_priority);

    let pec_ids = inner
        .store
        .accounts()
        .pec_account_ids()
        .await
        .unwrap_or_default();

    let now = now_ts();
    let mut validated: Vec<NewMessage> = Vec::new();
    let mut rejected: Vec<Value> = Vec::new();
    let mut validation_failures = 0usize;

    for item in messages {
        let Some(obj) = item.as_object() else {
            rejected.push(json!({"id": null, "reason": "invalid payload"}));
            validation_failures += 1;
            continue;
        };

        match validate_submission(inner, item).await {
            Ok(()) => {}
            Err(reason) => {
                validation_failures += 1;
                let msg_id = obj.get("id").and_then(Value::as_str);
                rejected.push(json!({"id": msg_id, "reason": reason}));
                if let (Some(msg_id), Some(tenant_id)) =
                    (msg_id, obj.get("tenant_id").and_then(Value::as_str))
                {
                    // Persist the rejected message with an error event so
                    // the rejection reaches the tenant as a delivery report.
                    persist_rejected(inner, obj, msg_id, tenant_id, default_priority, now, &reason)
                        .await;
                }
                continue;
            }
        }

        let priority = normalise_priority(obj.get("priority"), default_priority);
        let message_payload: MessagePayload = match serde_json::from_value(item.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                validation_failures += 1;
                rejected.push(json!({
                    "id": obj.get("id"),
                    "reason": format!("invalid payload: {e}")
                }));
                continue;
            }
        };

        validated.push(NewMessage {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tenant_id: obj
                .get("tenant_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            account_id: obj.get("account_id").and_then(Value::as_str).map(str::to_string),
            priority,
            payload: message_payload,
            batch_code: obj.get("batch_code").and_then(Value::as_str).map(str::to_string),
            deferred_ts: obj.get("deferred_ts").and_then(Value::as_i64),
        });
    }

    let inserted: Vec<InsertedMessage> = if validated.is_empty() {
        Vec::new()
    } else {
        match inner.store.messages().insert_batch(&validated, &pec_ids).await {
            Ok(inserted) => inserted,
            Err(e) => return db_error(e),
        }
    };

    let inserted_ids: HashSet<&str> = inserted.iter().map(|item| item.id.as_str()).collect();
    for entry in &validated {
        if !inserted_ids.contains(entry.id.as_str()) {
            rejected.push(json!({"id": entry.id, "reason": "already sent"}));
        }
    }

    inner.wake_dispatch.notify_one();

    // ok is false only when every message failed validation; "already
    // sent" rejections are a normal outcome.
    let ok = !inserted.is_empty() || validation_failures == 0;
    json!({"ok": ok, "queued": inserted.len(), "rejected": rejected})
}

async fn validate_submission(inner: &Arc<ProxyInner>, item: &Value) -> Result<(), String> {
    str_field(item, "id").ok_or("missing id")?;
    let tenant_id = str_field(item, "tenant_id").ok_or("missing tenant_id")?;
    let account_id = str_field(item, "account_id").ok_or("missing account_id")?;
    str_field(item, "from").ok_or("missing from")?;

    let has_recipient = match item.get("to") {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => items
            .iter()
            .any(|v| v.as_str().is_some_and(|s| !s.trim().is_empty())),
        _ => false,
    };
    if !has_recipient {
        return Err("missing to".into());
    }
    str_field(item, "subject").ok_or("missing subject")?;

    match inner.store.accounts().get(tenant_id, account_id).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err("account not found for tenant".into()),
        Err(e) => Err(e.to_string()),
    }
}

async fn persist_rejected(
    inner: &Arc<ProxyInner>,
    obj: &Map<String, Value>,
    msg_id: &str,
    tenant_id: &str,
    default_priority: i64,
    now: i64,
    reason: &str,
) {
    let payload: MessagePayload =
        serde_json::from_value(Value::Object(obj.clone())).unwrap_or_default();
    let entry = NewMessage {
        id: msg_id.to_string(),
        tenant_id: tenant_id.to_string(),
        account_id: obj.get("account_id").and_then(Value::as_str).map(str::to_string),
        priority: normalise_priority(obj.get("priority"), default_priority),
        payload,
        batch_code: obj.get("batch_code").and_then(Value::as_str).map(str::to_string),
        deferred_ts: None,
    };
    match inner.store.messages().insert_batch(&[entry], &HashSet::new()).await {
        Ok(inserted) if !inserted.is_empty() => {
            if let Err(e) = inner
                .store
                .events()
                .add_event(&inserted[0].pk, EventType::Error, now, Some(reason), None)
                .await
            {
                warn!(message_id = %msg_id, "failed to record rejection event: {e}");
                return;
            }
            inner
                .publish_result(ReportedEvent {
                    id: msg_id.to_string(),
                    status: EventType::Error,
                    timestamp: iso_utc(now),
                    account: obj.get("account_id").and_then(Value::as_str).map(str::to_string),
                    error: Some(reason.to_string()),
                    bounce_type: None,
                    bounce_code: None,
                    deferred_until: None,
                })
                .await;
        }
        Ok(_) => {}
        Err(e) => warn!(message_id = %msg_id, "failed to persist rejected message: {e}"),
    }
}

async fn delete_messages(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let tenant_id = match require_tenant_id(payload) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return error,
    };
    let ids: Vec<String> = payload
        .get("ids")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return json!({"ok": true, "removed": 0, "not_found": [], "unauthorized": []});
    }

    let authorized = match inner.store.messages().get_ids_for_tenant(&ids, tenant_id).await {
        Ok(authorized) => authorized,
        Err(e) => return db_error(e),
    };

    let mut sorted: Vec<String> = ids.into_iter().collect::<HashSet<_>>().into_iter().collect();
    sorted.sort();

    let mut removed = 0;
    let mut not_found: Vec<String> = Vec::new();
    let mut unauthorized: Vec<String> = Vec::new();
    for id in sorted {
        if !authorized.contains(&id) {
            unauthorized.push(id);
            continue;
        }
        match inner.store.messages().delete(&id, tenant_id).await {
            Ok(true) => removed += 1,
            Ok(false) => not_found.push(id),
            Err(e) => return db_error(e),
        }
    }
    json!({"ok": true, "removed": removed, "not_found": not_found, "unauthorized": unauthorized})
}

async fn list_messages(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let tenant_id = match require_tenant_id(payload) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return error,
    };
    let active_only = payload.get("active_only").and_then(Value::as_bool).unwrap_or(false);
    let include_history = payload
        .get("include_history")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let listed = match inner
        .store
        .messages()
        .list_all(Some(tenant_id), active_only, include_history)
        .await
    {
        Ok(listed) => listed,
        Err(e) => return db_error(e),
    };

    let messages: Vec<Value> = listed
        .iter()
        .map(|item| {
            let m = &item.message;
            let mut value = json!({
                "pk": m.pk,
                "id": m.id,
                "tenant_id": m.tenant_id,
                "account_id": m.account_id,
                "priority": m.priority,
                "message": m.payload,
                "batch_code": m.batch_code,
                "created_at": m.created_at,
                "updated_at": m.updated_at,
                "deferred_ts": m.deferred_ts,
                "smtp_ts": m.smtp_ts,
                "is_pec": m.is_pec,
                "tenant_name": item.tenant_name,
                "error": item.error,
                "error_ts": item.error_ts,
            });
            if include_history {
                value["history"] = serde_json::to_value(&item.history).unwrap_or(Value::Null);
            }
            value
        })
        .collect();
    json!({"ok": true, "messages": messages})
}

async fn cleanup_messages(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let tenant_id = match require_tenant_id(payload) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return error,
    };
    let retention = payload
        .get("older_than_seconds")
        .and_then(Value::as_i64)
        .map(|s| s.max(0))
        .unwrap_or(inner.config.report_retention.as_secs() as i64);
    let threshold = now_ts() - retention;

    match inner
        .store
        .messages()
        .remove_fully_reported_before(threshold, Some(tenant_id))
        .await
    {
        Ok(removed) => json!({"ok": true, "removed": removed}),
        Err(e) => db_error(e),
    }
}

// -------------------------------------------------------------------- accounts

async fn add_account(inner: &Arc<ProxyInner>, payload: Value) -> Value {
    let spec: AccountSpec = match serde_json::from_value(payload) {
        Ok(spec) => spec,
        Err(e) => return json!({"ok": false, "error": format!("invalid account: {e}")}),
    };
    match inner.store.accounts().upsert(&spec).await {
        Ok(pk) => json!({"ok": true, "pk": pk}),
        Err(e) => db_error(e),
    }
}

async fn list_accounts(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let tenant_id = match require_tenant_id(payload) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return error,
    };
    match inner.store.accounts().list_all(Some(tenant_id)).await {
        Ok(accounts) => {
            let accounts: Vec<Value> = accounts
                .iter()
                .map(|account| {
                    let mut value = serde_json::to_value(account).unwrap_or(Value::Null);
                    if let Some(obj) = value.as_object_mut() {
                        obj.remove("password");
                        obj.remove("imap_password");
                    }
                    value
                })
                .collect();
            json!({"ok": true, "accounts": accounts})
        }
        Err(e) => db_error(e),
    }
}

async fn delete_account(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let tenant_id = match require_tenant_id(payload) {
        Ok(tenant_id) => tenant_id,
        Err(error) => return error,
    };
    let Some(account_id) = str_field(payload, "id") else {
        return json!({"ok": false, "error": "id is required"});
    };
    if let Err(e) = inner.store.accounts().get(tenant_id, account_id).await {
        if e.is_not_found() {
            return json!({"ok": false, "error": "account not found or not owned by tenant"});
        }
        return db_error(e);
    }
    match inner.store.accounts().remove(tenant_id, account_id).await {
        Ok(_) => json!({"ok": true}),
        Err(e) => db_error(e),
    }
}

// --------------------------------------------------------------------- tenants

async fn add_tenant(inner: &Arc<ProxyInner>, payload: Value) -> Value {
    let generate_api_key = payload
        .get("generate_api_key")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let expires_at = payload.get("api_key_expires_at").and_then(Value::as_i64);

    let mut tenant_value = payload;
    if let Some(obj) = tenant_value.as_object_mut() {
        obj.remove("generate_api_key");
        obj.remove("api_key_expires_at");
    }
    let tenant: Tenant = match serde_json::from_value(tenant_value) {
        Ok(tenant) => tenant,
        Err(e) => return json!({"ok": false, "error": format!("invalid tenant: {e}")}),
    };

    if let Err(e) = inner.store.tenants().insert(&tenant).await {
        return db_error(e);
    }

    if generate_api_key {
        match inner.store.tenants().create_api_key(&tenant.id, expires_at).await {
            Ok(api_key) => json!({"ok": true, "api_key": api_key}),
            Err(e) => db_error(e),
        }
    } else {
        json!({"ok": true})
    }
}

fn tenant_to_value(tenant: &Tenant) -> Value {
    let mut value = serde_json::to_value(tenant).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("api_key_hash");
    }
    value
}

async fn get_tenant(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let Some(tenant_id) = tenant_id_of(payload) else {
        return json!({"ok": false, "error": "tenant id required"});
    };
    match inner.store.tenants().get(tenant_id).await {
        Ok(Some(tenant)) => {
            let mut value = tenant_to_value(&tenant);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("ok".into(), json!(true));
            }
            value
        }
        Ok(None) => json!({"ok": false, "error": "tenant not found"}),
        Err(e) => db_error(e),
    }
}

async fn list_tenants(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let active_only = payload.get("active_only").and_then(Value::as_bool).unwrap_or(false);
    match inner.store.tenants().list_all(active_only).await {
        Ok(tenants) => {
            let tenants: Vec<Value> = tenants.iter().map(tenant_to_value).collect();
            json!({"ok": true, "tenants": tenants})
        }
        Err(e) => db_error(e),
    }
}

async fn list_tenants_sync_status(inner: &Arc<ProxyInner>) -> Value {
    let tenants = match inner.store.tenants().list_all(false).await {
        Ok(tenants) => tenants,
        Err(e) => return db_error(e),
    };
    let mut entries = Vec::with_capacity(tenants.len());
    for tenant in &tenants {
        let status = reporter::sync_status(inner, &tenant.id).await;
        entries.push(json!({
            "id": tenant.id,
            "name": tenant.name,
            "active": tenant.active,
            "client_base_url": tenant.client_base_url,
            "last_sync_ts": status.last_sync_ts,
            "next_sync_due": status.next_sync_due,
            "in_dnd": status.in_dnd,
        }));
    }
    json!({
        "ok": true,
        "tenants": entries,
        "sync_interval_seconds": inner.config.sync_interval.as_secs(),
    })
}

async fn update_tenant(inner: &Arc<ProxyInner>, payload: Value) -> Value {
    let Some(tenant_id) = tenant_id_of(&payload).map(str::to_string) else {
        return json!({"ok": false, "error": "tenant id required"});
    };
    let mut fields = match payload {
        Value::Object(map) => map,
        _ => return json!({"ok": false, "error": "invalid payload"}),
    };
    fields.remove("id");
    fields.remove("tenant_id");

    match inner.store.tenants().update_fields(&tenant_id, &fields).await {
        Ok(true) => json!({"ok": true}),
        Ok(false) => json!({"ok": false, "error": "tenant not found"}),
        Err(e) => db_error(e),
    }
}

async fn delete_tenant(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let Some(tenant_id) = tenant_id_of(payload) else {
        return json!({"ok": false, "error": "tenant id required"});
    };
    match inner.store.tenants().remove(tenant_id).await {
        Ok(true) => json!({"ok": true}),
        Ok(false) => json!({"ok": false, "error": "tenant not found"}),
        Err(e) => db_error(e),
    }
}

async fn create_api_key(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let Some(tenant_id) = tenant_id_of(payload) else {
        return json!({"ok": false, "error": "tenant id required"});
    };
    let expires_at = payload.get("expires_at").and_then(Value::as_i64);
    match inner.store.tenants().create_api_key(tenant_id, expires_at).await {
        Ok(api_key) => json!({"ok": true, "api_key": api_key}),
        Err(e) if e.is_not_found() => json!({"ok": false, "error": "tenant not found"}),
        Err(e) => db_error(e),
    }
}

async fn revoke_api_key(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let Some(tenant_id) = tenant_id_of(payload) else {
        return json!({"ok": false, "error": "tenant id required"});
    };
    match inner.store.tenants().revoke_api_key(tenant_id).await {
        Ok(true) => json!({"ok": true}),
        Ok(false) => json!({"ok": false, "error": "tenant not found"}),
        Err(e) => db_error(e),
    }
}

// -------------------------------------------------------------------- instance

async fn get_instance(inner: &Arc<ProxyInner>) -> Value {
    match inner.store.instance().get().await {
        Ok(Some(row)) => json!({
            "ok": true,
            "name": row.name,
            "edition": row.edition,
            "config": row.config,
            "created_at": row.created_at,
            "updated_at": row.updated_at,
        }),
        Ok(None) => json!({"ok": false, "error": "instance not configured"}),
        Err(e) => db_error(e),
    }
}

async fn update_instance(inner: &Arc<ProxyInner>, payload: Value) -> Value {
    let fields = match payload {
        Value::Object(map) => map,
        _ => return json!({"ok": false, "error": "invalid payload"}),
    };
    match inner.store.instance().update(&fields).await {
        Ok(()) => json!({"ok": true}),
        Err(e) => db_error(e),
    }
}

async fn upgrade_instance(inner: &Arc<ProxyInner>) -> Value {
    match inner.store.instance().upgrade_to_enterprise().await {
        Ok(()) => json!({"ok": true, "edition": "ee"}),
        Err(e) => db_error(e),
    }
}

// ----------------------------------------------------------------- command log

async fn list_commands(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let limit = payload.get("limit").and_then(Value::as_i64).unwrap_or(100);
    let tenant_id = str_field(payload, "tenant_id");

    let entries = if let (Some(from_ts), Some(to_ts)) = (
        payload.get("from_ts").and_then(Value::as_i64),
        payload.get("to_ts").and_then(Value::as_i64),
    ) {
        inner.store.command_log().export_range(from_ts, to_ts).await
    } else {
        inner.store.command_log().list(limit, tenant_id).await
    };

    match entries {
        Ok(entries) => {
            let commands: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    json!({
                        "id": entry.id,
                        "endpoint": entry.endpoint,
                        "payload": entry.payload,
                        "tenant_id": entry.tenant_id,
                        "response_status": entry.response_status,
                        "response_body": entry.response_body,
                        "command_ts": entry.command_ts,
                    })
                })
                .collect();
            json!({"ok": true, "commands": commands})
        }
        Err(e) => db_error(e),
    }
}

async fn purge_commands(inner: &Arc<ProxyInner>, payload: &Value) -> Value {
    let Some(threshold_ts) = payload.get("threshold_ts").and_then(Value::as_i64) else {
        return json!({"ok": false, "error": "threshold_ts is required"});
    };
    match inner.store.command_log().purge_before(threshold_ts).await {
        Ok(purged) => json!({"ok": true, "purged": purged}),
        Err(e) => db_error(e),
    }
}

#[cfg(test)]
mod tests {
    use postino_types::EventType;
    use serde_json::{Value, json};

    use crate::config::ProxyConfig;
    use crate::proxy::MailProxy;

    async fn proxy() -> MailProxy {
        let config = ProxyConfig {
            db_path: ":memory:".into(),
            cache: crate::config::CacheSettings {
                enabled: false,
                ..Default::default()
            },
            ..ProxyConfig::default()
        };
        MailProxy::open(config).await.unwrap()
    }

    async fn seed(proxy: &MailProxy) {
        proxy
            .handle_command("addTenant", json!({"id": "t1", "name": "Tenant One"}))
            .await;
        proxy
            .handle_command(
                "addAccount",
                json!({
                    "id": "acc",
                    "tenant_id": "t1",
                    "host": "127.0.0.1",
                    "port": 1,
                    "use_tls": false
                }),
            )
            .await;
    }

    fn message(id: &str) -> Value {
        json!({
            "id": id,
            "tenant_id": "t1",
            "account_id": "acc",
            "from": "sender@example.com",
            "to": ["dest@example.com"],
            "subject": "hello",
            "body": "text"
        })
    }

    #[tokio::test]
    async fn add_messages_queues_valid_entries() {
        let proxy = proxy().await;
        seed(&proxy).await;

        let result = proxy
            .handle_command("addMessages", json!({"messages": [message("m-1"), message("m-2")]}))
            .await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["queued"], 2);
        assert_eq!(result["rejected"].as_array().unwrap().len(), 0);

        let stored = proxy.store().messages().get("m-1", "t1").await.unwrap().unwrap();
        assert_eq!(stored.payload.subject.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn add_messages_rejects_and_reports_invalid_entries() {
        let proxy = proxy().await;
        seed(&proxy).await;

        let mut invalid = message("m-bad");
        invalid.as_object_mut().unwrap().remove("subject");

        let result = proxy
            .handle_command("addMessages", json!({"messages": [invalid]}))
            .await;
        assert_eq!(result["ok"], false, "all entries failed validation");
        assert_eq!(result["queued"], 0);
        assert_eq!(result["rejected"][0]["reason"], "missing subject");

        // The rejected message is persisted as terminal with an error
        // event so the tenant hears about it through the webhook.
        let stored = proxy.store().messages().get("m-bad", "t1").await.unwrap().unwrap();
        assert!(stored.smtp_ts.is_some());
        let events = proxy.store().events().events_for_message(&stored.pk).await.unwrap();
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].description.as_deref(), Some("missing subject"));
    }

    #[tokio::test]
    async fn resubmitting_a_sent_message_is_already_sent() {
        let proxy = proxy().await;
        seed(&proxy).await;

        proxy
            .handle_command("addMessages", json!({"messages": [message("m-1")]}))
            .await;
        let stored = proxy.store().messages().get("m-1", "t1").await.unwrap().unwrap();
        proxy
            .store()
            .events()
            .add_event(&stored.pk, EventType::Sent, postino_types::now_ts(), None, None)
            .await
            .unwrap();

        let result = proxy
            .handle_command("addMessages", json!({"messages": [message("m-1")]}))
            .await;
        assert_eq!(result["ok"], true, "already-sent is not a validation failure");
        assert_eq!(result["queued"], 0);
        assert_eq!(result["rejected"][0]["reason"], "already sent");
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let proxy = proxy().await;
        seed(&proxy).await;

        let mut wrong = message("m-1");
        wrong["account_id"] = json!("ghost");
        let result = proxy
            .handle_command("addMessages", json!({"messages": [wrong]}))
            .await;
        assert_eq!(result["rejected"][0]["reason"], "account not found for tenant");
    }

    #[tokio::test]
    async fn delete_messages_enforces_ownership() {
        let proxy = proxy().await;
        seed(&proxy).await;
        proxy
            .handle_command("addTenant", json!({"id": "t2"}))
            .await;
        proxy
            .handle_command(
                "addAccount",
                json!({"id": "acc", "tenant_id": "t2", "host": "127.0.0.1", "port": 1}),
            )
            .await;
        proxy
            .handle_command("addMessages", json!({"messages": [message("m-1")]}))
            .await;

        let result = proxy
            .handle_command(
                "deleteMessages",
                json!({"tenant_id": "t2", "ids": ["m-1", "ghost"]}),
            )
            .await;
        assert_eq!(result["removed"], 0);
        let unauthorized = result["unauthorized"].as_array().unwrap();
        assert!(unauthorized.contains(&json!("m-1")));

        let result = proxy
            .handle_command("deleteMessages", json!({"tenant_id": "t1", "ids": ["m-1"]}))
            .await;
        assert_eq!(result["removed"], 1);
    }

    #[tokio::test]
    async fn suspend_activate_round_trip() {
        let proxy = proxy().await;
        seed(&proxy).await;

        let result = proxy
            .handle_command("suspend", json!({"tenant_id": "t1", "batch_code": "camp"}))
            .await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["suspended_batches"], json!(["camp"]));

        let result = proxy.handle_command("suspend", json!({"tenant_id": "t1"})).await;
        assert_eq!(result["suspended_batches"], json!(["*"]));

        // Cannot activate a single code under full suspension.
        let result = proxy
            .handle_command("activate", json!({"tenant_id": "t1", "batch_code": "camp"}))
            .await;
        assert_eq!(result["ok"], false);

        let result = proxy.handle_command("activate", json!({"tenant_id": "t1"})).await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["suspended_batches"], json!([]));
    }

    #[tokio::test]
    async fn tenant_crud_and_api_keys() {
        let proxy = proxy().await;

        let result = proxy
            .handle_command(
                "addTenant",
                json!({"id": "t9", "name": "Nine", "generate_api_key": true}),
            )
            .await;
        assert_eq!(result["ok"], true);
        let api_key = result["api_key"].as_str().unwrap().to_string();

        let tenant = proxy
            .store()
            .tenants()
            .tenant_by_token(&api_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tenant.id, "t9");

        // getTenant must not leak the hash.
        let result = proxy.handle_command("getTenant", json!({"id": "t9"})).await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["name"], "Nine");
        assert!(result.get("api_key_hash").is_none());

        let result = proxy
            .handle_command("updateTenant", json!({"id": "t9", "name": "Nine+"}))
            .await;
        assert_eq!(result["ok"], true);

        let result = proxy.handle_command("revokeApiKey", json!({"tenant_id": "t9"})).await;
        assert_eq!(result["ok"], true);
        assert!(
            proxy
                .store()
                .tenants()
                .tenant_by_token(&api_key)
                .await
                .unwrap()
                .is_none()
        );

        let result = proxy.handle_command("deleteTenant", json!({"id": "t9"})).await;
        assert_eq!(result["ok"], true);
        let result = proxy.handle_command("getTenant", json!({"id": "t9"})).await;
        assert_eq!(result["ok"], false);
    }

    #[tokio::test]
    async fn mutating_commands_reach_the_audit_log() {
        let proxy = proxy().await;
        seed(&proxy).await;
        proxy
            .handle_command("addMessages", json!({"messages": [message("m-1")]}))
            .await;

        let result = proxy.handle_command("listCommands", json!({})).await;
        assert_eq!(result["ok"], true);
        let commands = result["commands"].as_array().unwrap();
        let endpoints: Vec<&str> = commands
            .iter()
            .map(|entry| entry["endpoint"].as_str().unwrap())
            .collect();
        assert!(endpoints.contains(&"addMessages"));
        assert!(endpoints.contains(&"addTenant"));
        assert!(endpoints.contains(&"addAccount"));
        // Inspection commands are not logged.
        assert!(!endpoints.contains(&"listCommands"));
    }

    #[tokio::test]
    async fn run_now_resets_tenant_cadence() {
        let proxy = proxy().await;
        seed(&proxy).await;
        proxy
            .inner()
            .last_sync
            .lock()
            .await
            .insert("t1".into(), postino_types::now_ts() + 600);

        let result = proxy
            .handle_command("run now", json!({"tenant_id": "t1"}))
            .await;
        assert_eq!(result["ok"], true);
        assert_eq!(
            proxy.inner().last_sync.lock().await.get("t1"),
            Some(&0),
            "run now clears the DND cooloff"
        );
    }

    #[tokio::test]
    async fn list_accounts_hides_credentials() {
        let proxy = proxy().await;
        seed(&proxy).await;
        let result = proxy.handle_command("listAccounts", json!({"tenant_id": "t1"})).await;
        assert_eq!(result["ok"], true);
        let account = &result["accounts"][0];
        assert_eq!(account["id"], "acc");
        assert!(account.get("password").is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let proxy = proxy().await;
        let result = proxy.handle_command("frobnicate", json!({})).await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"], "unknown command");
    }

    #[tokio::test]
    async fn instance_lifecycle() {
        let proxy = proxy().await;
        let result = proxy.handle_command("getInstance", json!({})).await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["edition"], "ce");

        proxy
            .handle_command("updateInstance", json!({"name": "edge-1", "http_port": 9000}))
            .await;
        let result = proxy.handle_command("getInstance", json!({})).await;
        assert_eq!(result["name"], "edge-1");
        assert_eq!(result["config"]["http_port"], 9000);

        let result = proxy.handle_command("upgradeInstance", json!({})).await;
        assert_eq!(result["edition"], "ee");
    }
}
