//! Dispatch-path error taxonomy.
//!
//! Everything that can terminate a message during build/resolve/send maps
//! to one of these kinds; the scheduler converts them into `error` events
//! rather than letting them escape the loop.

use thiserror::Error;

/// A failure on the path from queue entry to SMTP handoff.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A required payload field is absent.
    #[error("missing {0}")]
    MissingField(&'static str),

    /// The message cannot be routed to an SMTP account.
    #[error("missing SMTP account configuration: {0}")]
    AccountConfiguration(String),

    /// Attachment exceeds the tenant limit and the action is `reject`.
    #[error("attachment '{filename}' ({size_mb:.1} MB) exceeds limit ({max_size_mb:.1} MB)")]
    AttachmentTooLarge {
        filename: String,
        size_mb: f64,
        max_size_mb: f64,
    },

    /// Attachment content could not be retrieved.
    #[error("attachment fetch failed: {0}")]
    AttachmentFetch(String),

    /// Rate limiter rejected the send (`limit_behavior = reject`).
    #[error("rate_limit_exceeded")]
    RateLimitExceeded,

    /// The assembled message was rejected by lettre.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl DispatchError {
    /// Short reason string recorded in the `error` event description.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
