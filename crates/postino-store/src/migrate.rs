//! Idempotent migrations from the legacy schema.
//!
//! Databases created before the UUID switch used integer autoincrement
//! primary keys on `messages` and a composite `(tenant_id, id)` key on
//! `accounts`. Detection is done by probing for the `pk` column; when it is
//! missing the table is rebuilt: create a replacement, copy rows generating
//! UUIDs, drop the old table, rename. Re-running any of these on an already
//! migrated database is a no-op.

use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::Result;

pub(crate) async fn run(pool: &SqlitePool) -> Result<()> {
    if migrate_messages_pk(pool).await? {
        info!("migrated messages table to UUID primary keys");
    }
    if migrate_accounts_pk(pool).await? {
        info!("migrated accounts table to UUID primary keys");
    }
    if backfill_account_pk(pool).await? {
        info!("backfilled messages.account_pk from account ids");
    }
    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column))
}

/// Timestamp columns in legacy tables held `CURRENT_TIMESTAMP` text; the
/// new schema stores Unix seconds.
const TS_TO_EPOCH: &str = "CASE WHEN typeof({col}) = 'text' \
     THEN CAST(strftime('%s', {col}) AS INTEGER) \
     ELSE COALESCE({col}, 0) END";

fn epoch_expr(col: &str) -> String {
    TS_TO_EPOCH.replace("{col}", col)
}

async fn migrate_messages_pk(pool: &SqlitePool) -> Result<bool> {
    if has_column(pool, "messages", "pk").await? {
        return Ok(false);
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE messages_new (
            pk TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            account_id TEXT,
            account_pk TEXT,
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
    )
    .execute(&mut *tx)
    .await?;

    let rows = sqlx::query(&format!(
        "SELECT id, tenant_id, account_id, priority, payload, batch_code, \
         {created} AS created_at, {updated} AS updated_at, \
         deferred_ts, smtp_ts, COALESCE(is_pec, 0) AS is_pec FROM messages",
        created = epoch_expr("created_at"),
        updated = epoch_expr("updated_at"),
    ))
    .fetch_all(&mut *tx)
    .await?;

    for row in rows {
        sqlx::query(
            "INSERT INTO messages_new \
             (pk, id, tenant_id, account_id, priority, payload, batch_code, \
              created_at, updated_at, deferred_ts, smtp_ts, is_pec) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(row.get::<String, _>("id"))
        .bind(row.get::<String, _>("tenant_id"))
        .bind(row.get::<Option<String>, _>("account_id"))
        .bind(row.get::<i64, _>("priority"))
        .bind(row.get::<String, _>("payload"))
        .bind(row.get::<Option<String>, _>("batch_code"))
        .bind(row.get::<i64, _>("created_at"))
        .bind(row.get::<i64, _>("updated_at"))
        .bind(row.get::<Option<i64>, _>("deferred_ts"))
        .bind(row.get::<Option<i64>, _>("smtp_ts"))
        .bind(row.get::<i64, _>("is_pec"))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DROP TABLE messages").execute(&mut *tx).await?;
    sqlx::query("ALTER TABLE messages_new RENAME TO messages")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

async fn migrate_accounts_pk(pool: &SqlitePool) -> Result<bool> {
    if has_column(pool, "accounts", "pk").await? {
        return Ok(false);
    }

    let has_imap = has_column(pool, "accounts", "imap_host").await?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE accounts_new (
            pk TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
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
    )
    .execute(&mut *tx)
    .await?;

    let imap_cols = if has_imap {
        "COALESCE(is_pec_account, 0) AS is_pec_account, imap_host, \
         COALESCE(imap_port, 993) AS imap_port, imap_user, imap_password, \
         COALESCE(imap_folder, 'INBOX') AS imap_folder, imap_last_uid, imap_uidvalidity"
    } else {
        "0 AS is_pec_account, NULL AS imap_host, 993 AS imap_port, \
         NULL AS imap_user, NULL AS imap_password, 'INBOX' AS imap_folder, \
         NULL AS imap_last_uid, NULL AS imap_uidvalidity"
    };

    let rows = sqlx::query(&format!(
        "SELECT id, tenant_id, host, port, user, password, use_tls, \
         COALESCE(ttl, 300) AS ttl, batch_size, limit_per_minute, limit_per_hour, \
         limit_per_day, COALESCE(limit_behavior, 'defer') AS limit_behavior, \
         {imap_cols}, {created} AS created_at, {updated} AS updated_at FROM accounts",
        created = epoch_expr("created_at"),
        updated = epoch_expr("updated_at"),
    ))
    .fetch_all(&mut *tx)
    .await?;

    for row in rows {
        sqlx::query(
            "INSERT INTO accounts_new \
             (pk, id, tenant_id, host, port, user, password, use_tls, ttl, batch_size, \
              limit_per_minute, limit_per_hour, limit_per_day, limit_behavior, \
              is_pec_account, imap_host, imap_port, imap_user, imap_password, \
              imap_folder, imap_last_uid, imap_uidvalidity, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(row.get::<String, _>("id"))
        .bind(row.get::<String, _>("tenant_id"))
        .bind(row.get::<String, _>("host"))
        .bind(row.get::<i64, _>("port"))
        .bind(row.get::<Option<String>, _>("user"))
        .bind(row.get::<Option<String>, _>("password"))
        .bind(row.get::<Option<i64>, _>("use_tls"))
        .bind(row.get::<i64, _>("ttl"))
        .bind(row.get::<Option<i64>, _>("batch_size"))
        .bind(row.get::<Option<i64>, _>("limit_per_minute"))
        .bind(row.get::<Option<i64>, _>("limit_per_hour"))
        .bind(row.get::<Option<i64>, _>("limit_per_day"))
        .bind(row.get::<String, _>("limit_behavior"))
        .bind(row.get::<i64, _>("is_pec_account"))
        .bind(row.get::<Option<String>, _>("imap_host"))
        .bind(row.get::<i64, _>("imap_port"))
        .bind(row.get::<Option<String>, _>("imap_user"))
        .bind(row.get::<Option<String>, _>("imap_password"))
        .bind(row.get::<String, _>("imap_folder"))
        .bind(row.get::<Option<i64>, _>("imap_last_uid"))
        .bind(row.get::<Option<i64>, _>("imap_uidvalidity"))
        .bind(row.get::<i64, _>("created_at"))
        .bind(row.get::<i64, _>("updated_at"))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("DROP TABLE accounts").execute(&mut *tx).await?;
    sqlx::query("ALTER TABLE accounts_new RENAME TO accounts")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Link messages to accounts by UUID where only the business key is set.
async fn backfill_account_pk(pool: &SqlitePool) -> Result<bool> {
    if !has_column(pool, "messages", "account_pk").await? {
        return Ok(false);
    }

    let pending: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM messages \
         WHERE account_id IS NOT NULL AND account_pk IS NULL",
    )
    .fetch_one(pool)
    .await?
    .get("cnt");

    if pending == 0 {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE messages SET account_pk = (\
             SELECT a.pk FROM accounts a \
             WHERE a.tenant_id = messages.tenant_id AND a.id = messages.account_id\
         ) WHERE account_id IS NOT NULL AND account_pk IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(true)
}
