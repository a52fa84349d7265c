//! SQLite storage engine for postino.
//!
//! This crate owns every persisted row: the message queue, the append-only
//! message event log, tenant and account configuration, the command audit
//! log, the rate-limiter send log, and the singleton instance row. No other
//! crate touches the database; everything else receives values by copy.
//!
//! The one rule that matters most lives in [`events::Events::add_event`]:
//! it is the sole writer of message state transitions, inserting the event
//! row and applying the matching `smtp_ts`/`deferred_ts` update inside a
//! single transaction.
//!
//! Schema changes are online: [`Store::open`] creates missing tables and
//! runs the idempotent legacy migrations (integer primary keys to UUIDs,
//! `account_pk` backfill) before returning.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

mod accounts;
mod command_log;
mod error;
mod events;
mod instance;
mod messages;
mod migrate;
mod schema;
mod send_log;
mod tenants;

pub use accounts::Accounts;
pub use command_log::{CommandLog, CommandLogEntry};
pub use error::{Result, StoreError};
pub use events::Events;
pub use instance::{Instance, InstanceRow};
pub use messages::{ListedMessage, Messages, PriorityFilter};
pub use send_log::SendLog;
pub use tenants::Tenants;

/// Handle to the backing SQLite database.
///
/// Cheap to clone; all handles share one connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    ///
    /// `":memory:"` opens an in-memory database pinned to a single
    /// connection so every handle sees the same data.
    pub async fn open(path: &str) -> Result<Self> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .foreign_keys(true);

        // In-memory databases are per-connection; a >1 pool would hand out
        // empty databases for every connection after the first.
        let max_connections = if path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create missing tables, run legacy migrations, seed the default
    /// tenant and the instance singleton.
    async fn init(&self) -> Result<()> {
        schema::create_tables(&self.pool).await?;
        migrate::run(&self.pool).await?;
        self.tenants().ensure_default().await?;
        self.instance().ensure().await?;
        Ok(())
    }

    /// Close the connection pool. Pending operations are awaited.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn messages(&self) -> Messages<'_> {
        Messages::new(&self.pool)
    }

    pub fn events(&self) -> Events<'_> {
        Events::new(&self.pool)
    }

    pub fn accounts(&self) -> Accounts<'_> {
        Accounts::new(&self.pool)
    }

    pub fn tenants(&self) -> Tenants<'_> {
        Tenants::new(&self.pool)
    }

    pub fn command_log(&self) -> CommandLog<'_> {
        CommandLog::new(&self.pool)
    }

    pub fn instance(&self) -> Instance<'_> {
        Instance::new(&self.pool)
    }

    pub fn send_log(&self) -> SendLog<'_> {
        SendLog::new(&self.pool)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Store;
    use postino_types::{AccountSpec, MessagePayload, NewMessage, Tenant};

    pub async fn open_store() -> Store {
        Store::open(":memory:").await.expect("open in-memory store")
    }

    pub async fn seed_tenant(store: &Store, id: &str) {
        store
            .tenants()
            .insert(&Tenant::new(id))
            .await
            .expect("insert tenant");
    }

    pub async fn seed_account(store: &Store, tenant_id: &str, id: &str) -> String {
        store
            .accounts()
            .upsert(&AccountSpec {
                id: id.to_string(),
                tenant_id: tenant_id.to_string(),
                host: "smtp.example.com".into(),
                port: 587,
                user: Some("mailer".into()),
                password: Some("secret".into()),
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
            })
            .await
            .expect("upsert account")
    }

    pub fn sample_message(tenant_id: &str, account_id: &str, id: &str) -> NewMessage {
        let mut payload = MessagePayload::default();
        payload.id = Some(id.to_string());
        payload.tenant_id = Some(tenant_id.to_string());
        payload.account_id = Some(account_id.to_string());
        payload.from = Some("sender@example.com".into());
        payload.to = vec!["dest@example.com"].into();
        payload.subject = Some("subject".into());
        payload.body = Some("body".into());
        NewMessage {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            account_id: Some(account_id.to_string()),
            priority: 2,
            payload,
            batch_code: None,
            deferred_ts: None,
        }
    }
}
