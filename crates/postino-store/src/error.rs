use thiserror::Error;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity lookup failed; not logged as an error by callers.
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    /// Activating a single batch while `suspended_batches = "*"`; the
    /// caller must clear the full suspension first.
    #[error("cannot activate a single batch while all batches are suspended")]
    FullySuspended,

    /// A stored JSON blob failed to decode.
    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// True for plain missing-row outcomes.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
