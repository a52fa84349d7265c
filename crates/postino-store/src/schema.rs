//! Table and index creation. Everything here is `IF NOT EXISTS`; legacy
//! shapes are handled afterwards by the migrations module.

use sqlx::SqlitePool;

use crate::Result;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        client_base_url TEXT,
        client_sync_path TEXT NOT NULL DEFAULT '/mail-proxy/sync',
        client_attachment_path TEXT NOT NULL DEFAULT '/mail-proxy/attachments',
        client_auth TEXT,
        rate_limits TEXT,
        large_file_config TEXT,
        suspended_batches TEXT,
        api_key_hash TEXT,
        api_key_expires_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        pk TEXT PRIMARY KEY,
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        user TEXT,
        password TEXT,
        use_tls INTEGER,
        ttl INTEGER NOT NULL DEFAULT 300,
        batch_size INTEGER,
        limit_per_minute INTEGER,
        limit_per_hour INTEGER,
        limit_per_day INTEGER,
        limit_behavior TEXT NOT NULL DEFAULT 'defer',
        is_pec_account INTEGER NOT NULL DEFAULT 0,
        imap_host TEXT,
        imap_port INTEGER NOT NULL DEFAULT 993,
        imap_user TEXT,
        imap_password TEXT,
        imap_folder TEXT NOT NULL DEFAULT 'INBOX',
        imap_last_uid INTEGER,
        imap_uidvalidity INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (tenant_id, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        pk TEXT PRIMARY KEY,
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
        account_id TEXT,
        account_pk TEXT REFERENCES accounts(pk) ON DELETE CASCADE,
        priority INTEGER NOT NULL DEFAULT 2,
        payload TEXT NOT NULL,
        batch_code TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deferred_ts INTEGER,
        smtp_ts INTEGER,
        is_pec INTEGER NOT NULL DEFAULT 0,
        UNIQUE (tenant_id, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_pk TEXT NOT NULL REFERENCES messages(pk) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        event_ts INTEGER NOT NULL,
        description TEXT,
        metadata TEXT,
        reported_ts INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS command_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        endpoint TEXT NOT NULL,
        payload TEXT,
        tenant_id TEXT,
        response_status INTEGER,
        response_body TEXT,
        command_ts INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS instance (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        name TEXT NOT NULL DEFAULT 'postino',
        api_token TEXT,
        edition TEXT NOT NULL DEFAULT 'ce',
        config TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS send_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_pk TEXT NOT NULL,
        sent_ts INTEGER NOT NULL
    )
    "#,
];

const INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_ready ON messages (smtp_ts, deferred_ts, priority, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_tenant ON messages (tenant_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_unreported ON message_events (reported_ts, event_ts, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_message ON message_events (message_pk)",
    "CREATE INDEX IF NOT EXISTS idx_send_log_window ON send_log (account_pk, sent_ts)",
    "CREATE INDEX IF NOT EXISTS idx_command_log_ts ON command_log (command_ts)",
];

pub(crate) async fn create_tables(pool: &SqlitePool) -> Result<()> {
    for sql in TABLES {
        sqlx::query(sql).execute(pool).await?;
    }
    for sql in INDICES {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}
