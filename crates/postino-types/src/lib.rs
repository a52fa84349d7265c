//! Core domain types for the postino mail dispatch service.
//!
//! This crate defines the entities shared by every other crate in the
//! workspace: tenants, SMTP accounts, queued messages, message events, the
//! submission payload, attachment specifications, and the wire shape of
//! delivery reports pushed to tenant webhooks.
//!
//! All timestamps that reach persistence are Unix seconds (`i64`); the only
//! place ISO-8601 strings appear is the outbound webhook payload, which uses
//! UTC with a `Z` suffix.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// --------------------------------------------------------------------- priority

/// Highest priority: attempted before anything else in a cycle.
pub const PRIORITY_IMMEDIATE: i64 = 0;
/// Above-normal priority.
pub const PRIORITY_HIGH: i64 = 1;
/// Default priority for submissions that carry none.
pub const PRIORITY_MEDIUM: i64 = 2;
/// Lowest priority.
pub const PRIORITY_LOW: i64 = 3;

/// Default priority applied when a submission omits it.
pub const DEFAULT_PRIORITY: i64 = PRIORITY_MEDIUM;

/// Human-readable label for a priority value.
pub fn priority_label(priority: i64) -> &'static str {
    match priority {
        PRIORITY_IMMEDIATE => "immediate",
        PRIORITY_HIGH => "high",
        PRIORITY_MEDIUM => "medium",
        _ => "low",
    }
}

/// Normalise a JSON priority value (integer or label) to 0..=3.
///
/// Accepts integers, numeric strings, and the labels
/// `immediate`/`high`/`medium`/`low` (case-insensitive). Out-of-range
/// integers are clamped; anything unparseable falls back to `default`.
pub fn normalise_priority(value: Option<&Value>, default: i64) -> i64 {
    let fallback = default.clamp(PRIORITY_IMMEDIATE, PRIORITY_LOW);
    let priority = match value {
        None | Some(Value::Null) => fallback,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(fallback),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "immediate" => PRIORITY_IMMEDIATE,
            "high" => PRIORITY_HIGH,
            "medium" => PRIORITY_MEDIUM,
            "low" => PRIORITY_LOW,
            other => other.parse::<i64>().unwrap_or(fallback),
        },
        Some(_) => fallback,
    };
    priority.clamp(PRIORITY_IMMEDIATE, PRIORITY_LOW)
}

// ------------------------------------------------------------------------- auth

/// Authentication used both for tenant webhooks and attachment HTTP fetches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientAuth {
    /// No authentication header.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// HTTP Basic authentication.
    Basic { user: String, password: String },
}

impl ClientAuth {
    /// True when this variant adds no header to requests.
    pub fn is_none(&self) -> bool {
        matches!(self, ClientAuth::None)
    }
}

// ----------------------------------------------------------------------- tenant

/// What to do when an attachment exceeds the tenant's size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LargeFileAction {
    /// Log a warning and attach anyway.
    #[default]
    Warn,
    /// Fail the message with an `error` event.
    Reject,
    /// Upload to external storage and replace the attachment with a link.
    Rewrite,
}

/// Per-tenant handling of oversized attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LargeFileConfig {
    pub enabled: bool,
    pub max_size_mb: f64,
    pub action: LargeFileAction,
    /// External object-storage base URL used by the `rewrite` action.
    pub storage_url: Option<String>,
    pub file_ttl_days: Option<i64>,
}

/// Default path appended to `client_base_url` for delivery reports.
pub const DEFAULT_SYNC_PATH: &str = "/mail-proxy/sync";
/// Default path appended to `client_base_url` for attachment fetches.
pub const DEFAULT_ATTACHMENT_PATH: &str = "/mail-proxy/attachments";

/// One isolated customer namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant-chosen identifier, used in URLs and payloads.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Inactive tenants are visible but receive no dispatch activity.
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub client_base_url: Option<String>,
    #[serde(default = "default_sync_path")]
    pub client_sync_path: String,
    #[serde(default = "default_attachment_path")]
    pub client_attachment_path: String,
    #[serde(default)]
    pub client_auth: Option<ClientAuth>,
    /// Per-tenant rate-limit overrides; opaque until per-account limits miss.
    #[serde(default)]
    pub rate_limits: Option<Value>,
    #[serde(default)]
    pub large_file_config: Option<LargeFileConfig>,
    /// Comma-separated batch codes currently suspended, or `*` for all.
    #[serde(default)]
    pub suspended_batches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_hash: Option<String>,
    #[serde(default)]
    pub api_key_expires_at: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_sync_path() -> String {
    DEFAULT_SYNC_PATH.to_string()
}

fn default_attachment_path() -> String {
    DEFAULT_ATTACHMENT_PATH.to_string()
}

impl Tenant {
    /// Minimal tenant with defaults, used by `ensure_default` and tests.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            active: true,
            client_base_url: None,
            client_sync_path: default_sync_path(),
            client_attachment_path: default_attachment_path(),
            client_auth: None,
            rate_limits: None,
            large_file_config: None,
            suspended_batches: None,
            api_key_hash: None,
            api_key_expires_at: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Full URL the reporter POSTs delivery reports to, if configured.
    pub fn sync_url(&self) -> Option<String> {
        self.client_base_url
            .as_deref()
            .map(|base| join_url(base, &self.client_sync_path))
    }

    /// Full URL attachments are fetched from in `endpoint` mode.
    pub fn attachment_url(&self) -> Option<String> {
        self.client_base_url
            .as_deref()
            .map(|base| join_url(base, &self.client_attachment_path))
    }

    /// Suspension test per the batch-code rules.
    ///
    /// `None` suspended_batches means nothing is suspended; `*` suspends
    /// everything; otherwise a message is suspended iff its batch code is in
    /// the comma-delimited list. Messages without a batch code are suspended
    /// only by `*`.
    pub fn is_batch_suspended(&self, batch_code: Option<&str>) -> bool {
        is_batch_suspended(self.suspended_batches.as_deref(), batch_code)
    }
}

/// Suspension test on a raw `suspended_batches` column value.
pub fn is_batch_suspended(suspended_batches: Option<&str>, batch_code: Option<&str>) -> bool {
    let Some(suspended) = suspended_batches else {
        return false;
    };
    if suspended.is_empty() {
        return false;
    }
    if suspended == "*" {
        return true;
    }
    let Some(code) = batch_code else {
        return false;
    };
    suspended.split(',').any(|entry| entry == code)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

// ---------------------------------------------------------------------- account

/// What the rate limiter does when a window is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBehavior {
    /// Defer the message until the window frees up.
    #[default]
    Defer,
    /// Fail the message with `rate_limit_exceeded`.
    Reject,
}

/// SMTP credentials (optionally IMAP for inbound) owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Internal primary key (UUID) used by foreign-key references.
    pub pk: String,
    /// Tenant-chosen identifier, unique within the tenant.
    pub id: String,
    pub tenant_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: Option<bool>,
    /// Idle SMTP connection lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    /// Per-cycle send cap overriding the global one.
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub limit_per_minute: Option<i64>,
    #[serde(default)]
    pub limit_per_hour: Option<i64>,
    #[serde(default)]
    pub limit_per_day: Option<i64>,
    #[serde(default)]
    pub limit_behavior: LimitBehavior,
    /// True for certified-mail (PEC) accounts with receipt correlation.
    #[serde(default)]
    pub is_pec_account: bool,
    #[serde(default)]
    pub imap_host: Option<String>,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default)]
    pub imap_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap_password: Option<String>,
    #[serde(default = "default_imap_folder")]
    pub imap_folder: String,
    #[serde(default)]
    pub imap_last_uid: Option<i64>,
    #[serde(default)]
    pub imap_uidvalidity: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

fn default_ttl() -> i64 {
    300
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_folder() -> String {
    "INBOX".to_string()
}

impl Account {
    /// True when this account has an inbound mailbox to poll.
    pub fn has_imap(&self) -> bool {
        self.imap_host.is_some()
    }
}

/// Input shape for account creation/update; the store assigns the pk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    pub id: String,
    pub tenant_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: Option<bool>,
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub limit_per_minute: Option<i64>,
    #[serde(default)]
    pub limit_per_hour: Option<i64>,
    #[serde(default)]
    pub limit_per_day: Option<i64>,
    #[serde(default)]
    pub limit_behavior: LimitBehavior,
    #[serde(default)]
    pub is_pec_account: bool,
    #[serde(default)]
    pub imap_host: Option<String>,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default)]
    pub imap_user: Option<String>,
    #[serde(default)]
    pub imap_password: Option<String>,
    #[serde(default = "default_imap_folder")]
    pub imap_folder: String,
}

// ------------------------------------------------------------------ attachments

/// How attachment content is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// POST to the tenant's attachment endpoint with `storage_path`.
    Endpoint,
    /// GET the URL in `storage_path` directly.
    HttpUrl,
    /// `storage_path` is inline base64 content.
    Base64,
    /// Read from the configured base directory.
    Filesystem,
}

/// One attachment reference inside a submission payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AttachmentSpec {
    /// Original filename, possibly carrying an `{MD5:<hex>}` marker.
    pub filename: Option<String>,
    pub storage_path: Option<String>,
    pub fetch_mode: Option<FetchMode>,
    /// Explicit cache key; takes precedence over the filename marker.
    pub content_md5: Option<String>,
    /// Per-attachment auth override in the tenant `client_auth` format.
    pub auth: Option<ClientAuth>,
    pub mime_type: Option<String>,
}

// ---------------------------------------------------------------------- message

/// Address list that tolerates both a JSON array and a comma-joined string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AddressList(pub Vec<String>);

impl AddressList {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|a| a.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str).filter(|a| !a.is_empty())
    }
}

impl<'de> Deserialize<'de> for AddressList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        let repr = Option::<Repr>::deserialize(deserializer)?;
        Ok(match repr {
            None => AddressList(Vec::new()),
            Some(Repr::One(s)) => AddressList(
                s.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect(),
            ),
            Some(Repr::Many(items)) => AddressList(
                items
                    .into_iter()
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            ),
        })
    }
}

impl From<Vec<&str>> for AddressList {
    fn from(items: Vec<&str>) -> Self {
        AddressList(items.into_iter().map(str::to_string).collect())
    }
}

/// The envelope a tenant submits: everything needed to assemble one email.
///
/// Unknown keys round-trip through `extra` so resubmission updates preserve
/// whatever the tenant sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MessagePayload {
    pub id: Option<String>,
    pub tenant_id: Option<String>,
    pub account_id: Option<String>,
    pub from: Option<String>,
    pub to: AddressList,
    pub cc: AddressList,
    pub bcc: AddressList,
    pub subject: Option<String>,
    pub body: Option<String>,
    /// `text/plain` (default) or `text/html`.
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentSpec>,
    pub batch_code: Option<String>,
    /// SMTP attempts performed so far; bumped on every deferred retry.
    pub retry_count: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Internal primary key (UUID).
    pub pk: String,
    /// Tenant-chosen identifier, unique within the tenant.
    pub id: String,
    pub tenant_id: String,
    pub account_id: Option<String>,
    /// UUID reference to the owning account; preferred over `account_id`.
    pub account_pk: Option<String>,
    pub priority: i64,
    pub payload: MessagePayload,
    pub batch_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Earliest time this message may be attempted.
    pub deferred_ts: Option<i64>,
    /// Set once an SMTP attempt reached a terminal outcome.
    pub smtp_ts: Option<i64>,
    pub is_pec: bool,
}

/// One entry handed to `insert_batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub tenant_id: String,
    pub account_id: Option<String>,
    pub priority: i64,
    pub payload: MessagePayload,
    pub batch_code: Option<String>,
    pub deferred_ts: Option<i64>,
}

/// `{id, pk}` pair returned for each inserted/updated message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertedMessage {
    pub id: String,
    pub pk: String,
}

// ----------------------------------------------------------------------- events

/// Observable state transitions of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Error,
    Deferred,
    Bounce,
    PecAcceptance,
    PecDelivery,
    PecError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Sent => "sent",
            EventType::Error => "error",
            EventType::Deferred => "deferred",
            EventType::Bounce => "bounce",
            EventType::PecAcceptance => "pec_acceptance",
            EventType::PecDelivery => "pec_delivery",
            EventType::PecError => "pec_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "sent" => EventType::Sent,
            "error" => EventType::Error,
            "deferred" => EventType::Deferred,
            "bounce" => EventType::Bounce,
            "pec_acceptance" => EventType::PecAcceptance,
            "pec_delivery" => EventType::PecDelivery,
            "pec_error" => EventType::PecError,
            _ => return None,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable row in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Monotonic integer, the ordering authority.
    pub id: i64,
    pub message_pk: String,
    pub event_type: EventType,
    pub event_ts: i64,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    /// When the tenant's webhook acknowledged this event.
    pub reported_ts: Option<i64>,
}

/// Event row joined to its message, as consumed by the reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreportedEvent {
    pub event_id: i64,
    pub message_pk: String,
    /// Client-facing message id.
    pub message_id: String,
    pub tenant_id: String,
    pub account_id: Option<String>,
    pub event_type: EventType,
    pub event_ts: i64,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

// -------------------------------------------------------------- delivery report

/// One event as serialized into the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedEvent {
    /// Client-facing message id.
    pub id: String,
    pub status: EventType,
    /// ISO-8601 UTC with `Z` suffix.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deferred_until: Option<String>,
}

/// Body of the POST to a tenant's sync URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivery_report: Vec<ReportedEvent>,
}

/// Format a Unix timestamp as ISO-8601 UTC with `Z`, as tenants receive it.
pub fn iso_utc(ts: i64) -> String {
    match Utc.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => DateTime::<Utc>::UNIX_EPOCH.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_accepts_labels_and_integers() {
        assert_eq!(normalise_priority(Some(&Value::from("immediate")), 2), 0);
        assert_eq!(normalise_priority(Some(&Value::from("HIGH")), 2), 1);
        assert_eq!(normalise_priority(Some(&Value::from(3)), 2), 3);
        assert_eq!(normalise_priority(Some(&Value::from("1")), 2), 1);
        assert_eq!(normalise_priority(None, 2), 2);
        assert_eq!(normalise_priority(Some(&Value::from("bogus")), 1), 1);
        // Out-of-range values clamp instead of erroring.
        assert_eq!(normalise_priority(Some(&Value::from(17)), 2), 3);
        assert_eq!(normalise_priority(Some(&Value::from(-4)), 2), 0);
    }

    #[test]
    fn client_auth_serde_is_tagged_by_method() {
        let bearer: ClientAuth = serde_json::from_str(
            r#"{"method": "bearer", "token": "tok-1"}"#,
        )
        .unwrap();
        assert_eq!(bearer, ClientAuth::Bearer { token: "tok-1".into() });

        let basic: ClientAuth = serde_json::from_str(
            r#"{"method": "basic", "user": "u", "password": "p"}"#,
        )
        .unwrap();
        assert!(matches!(basic, ClientAuth::Basic { .. }));

        let none: ClientAuth = serde_json::from_str(r#"{"method": "none"}"#).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn suspension_rules() {
        assert!(!is_batch_suspended(None, Some("c1")));
        assert!(!is_batch_suspended(Some(""), Some("c1")));
        assert!(is_batch_suspended(Some("*"), Some("c1")));
        assert!(is_batch_suspended(Some("*"), None));
        assert!(is_batch_suspended(Some("a,c1,z"), Some("c1")));
        assert!(!is_batch_suspended(Some("a,z"), Some("c1")));
        // No batch code: only `*` suspends.
        assert!(!is_batch_suspended(Some("a,z"), None));
    }

    #[test]
    fn tenant_urls_join_cleanly() {
        let mut tenant = Tenant::new("t1");
        tenant.client_base_url = Some("https://client.example.com/".into());
        assert_eq!(
            tenant.sync_url().unwrap(),
            "https://client.example.com/mail-proxy/sync"
        );
        assert_eq!(
            tenant.attachment_url().unwrap(),
            "https://client.example.com/mail-proxy/attachments"
        );

        tenant.client_base_url = None;
        assert!(tenant.sync_url().is_none());
    }

    #[test]
    fn address_list_accepts_string_and_array() {
        #[derive(Deserialize)]
        struct Probe {
            to: AddressList,
        }

        let from_string: Probe =
            serde_json::from_str(r#"{"to": "a@x.it, b@x.it"}"#).unwrap();
        assert_eq!(from_string.to.0, vec!["a@x.it", "b@x.it"]);

        let from_array: Probe =
            serde_json::from_str(r#"{"to": ["a@x.it", " b@x.it "]}"#).unwrap();
        assert_eq!(from_array.to.0, vec!["a@x.it", "b@x.it"]);

        let empty: Probe = serde_json::from_str(r#"{"to": []}"#).unwrap();
        assert!(empty.to.is_empty());
    }

    #[test]
    fn payload_round_trips_unknown_keys() {
        let json = r#"{
            "id": "m-1",
            "tenant_id": "t1",
            "account_id": "acc",
            "from": "sender@example.com",
            "to": ["dest@example.com"],
            "subject": "hello",
            "body": "text",
            "x_campaign": "spring"
        }"#;
        let payload: MessagePayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.extra.get("x_campaign").unwrap(), "spring");

        let back = serde_json::to_value(&payload).unwrap();
        assert_eq!(back["x_campaign"], "spring");
        assert_eq!(back["retry_count"], 0);
    }

    #[test]
    fn event_type_round_trip() {
        for ty in [
            EventType::Sent,
            EventType::Error,
            EventType::Deferred,
            EventType::Bounce,
            EventType::PecAcceptance,
            EventType::PecDelivery,
            EventType::PecError,
        ] {
            assert_eq!(EventType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn reported_event_skips_empty_fields() {
        let event = ReportedEvent {
            id: "m-1".into(),
            status: EventType::Sent,
            timestamp: iso_utc(1_700_000_000),
            account: Some("acc".into()),
            error: None,
            bounce_type: None,
            bounce_code: None,
            deferred_until: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "sent");
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn iso_utc_formats_with_z_suffix() {
        assert_eq!(iso_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso_utc(1_700_000_000), "2023-11-14T22:13:20Z");
    }
}
