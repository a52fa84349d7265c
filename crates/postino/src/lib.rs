//! # Postino
//!
//! A multi-tenant outbound mail dispatch service.
//!
//! Tenants submit messages through the command API; postino persists each
//! message in SQLite, dispatches it over SMTP using per-tenant account
//! credentials with priority scheduling, rate limiting, and retry with
//! backoff, then asynchronously reports terminal outcomes back to each
//! tenant's webhook. A secondary ingress path polls IMAP mailboxes to
//! correlate bounce notifications and PEC (certified email) receipts back
//! to the original messages.
//!
//! ## Pipeline
//!
//! The core flow is **submit → schedule → send → report**:
//!
//! 1. [`commands::dispatch`] validates submissions and persists them via
//!    the storage engine (`postino-store`).
//! 2. [`scheduler`] runs the send loop: two-phase priority fetch, grouping
//!    by account, concurrency caps, rate-limit planning, SMTP delivery.
//! 3. Every outcome becomes a row in the message event log; the event
//!    writer atomically updates the message state.
//! 4. [`reporter`] batches unreported events per tenant and POSTs them to
//!    the tenant's sync URL with the tenant's own authentication.
//! 5. [`receiver`] polls IMAP mailboxes, parses DSN/PEC receipts, and
//!    emits `bounce`/`pec_*` events correlated by the `X-Genro-Mail-ID`
//!    header.
//!
//! ## Modules
//!
//! - [`proxy`] — orchestrator owning stores, pools, and background tasks
//! - [`scheduler`] — the main send loop
//! - [`reporter`] — per-tenant webhook push of unreported events
//! - [`receiver`] — IMAP polling for bounces and PEC receipts
//! - [`parser`] — DSN and PEC receipt parsing
//! - [`commands`] — the single entry point for state-changing operations
//! - [`http`] — axum control surface derived from the command registry
//! - [`builder`] — outbound message assembly (lettre)
//! - [`attachments`] — pluggable attachment fetching with tiered caching
//! - [`smtp`] — keyed SMTP connection pool
//! - [`ratelimit`] — per-account send-window planning
//! - [`config`] — service configuration

pub mod attachments;
pub mod builder;
pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod parser;
pub mod proxy;
pub mod ratelimit;
pub mod receiver;
pub mod reporter;
pub mod scheduler;
pub mod smtp;

pub use config::ProxyConfig;
pub use error::DispatchError;
pub use proxy::MailProxy;

/// Correlation header injected into every dispatched message; its value is
/// the client-facing message id and it is the sole key used to match
/// bounces and PEC receipts back to their message.
pub const MAIL_ID_HEADER: &str = "X-Genro-Mail-ID";
