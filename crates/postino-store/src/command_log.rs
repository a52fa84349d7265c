//! Append-only audit log of state-modifying commands.

use postino_types::now_ts;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;

/// One audit row.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLogEntry {
    pub id: i64,
    pub endpoint: String,
    pub payload: Option<Value>,
    pub tenant_id: Option<String>,
    pub response_status: Option<i64>,
    pub response_body: Option<Value>,
    pub command_ts: i64,
}

pub struct CommandLog<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CommandLog<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        endpoint: &str,
        payload: &Value,
        tenant_id: Option<&str>,
        response_status: i64,
        response_body: &Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO command_log (endpoint, payload, tenant_id, response_status, \
             response_body, command_ts) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(endpoint)
        .bind(payload.to_string())
        .bind(tenant_id)
        .bind(response_status)
        .bind(response_body.to_string())
        .bind(now_ts())
        .execute(self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent commands first, optionally scoped to one tenant.
    pub async fn list(
        &self,
        limit: i64,
        tenant_id: Option<&str>,
    ) -> Result<Vec<CommandLogEntry>> {
        let rows = match tenant_id {
            Some(tenant) => {
                sqlx::query(
                    "SELECT * FROM command_log WHERE tenant_id = ? \
                     ORDER BY command_ts DESC, id DESC LIMIT ?",
                )
                .bind(tenant)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM command_log ORDER BY command_ts DESC, id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_entry).collect())
    }

    /// Time-windowed export for replay, oldest first.
    pub async fn export_range(&self, from_ts: i64, to_ts: i64) -> Result<Vec<CommandLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM command_log WHERE command_ts >= ? AND command_ts <= ? \
             ORDER BY command_ts ASC, id ASC",
        )
        .bind(from_ts)
        .bind(to_ts)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    pub async fn purge_before(&self, threshold_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM command_log WHERE command_ts < ?")
            .bind(threshold_ts)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_entry(row: &SqliteRow) -> CommandLogEntry {
    CommandLogEntry {
        id: row.get("id"),
        endpoint: row.get("endpoint"),
        payload: row
            .get::<Option<String>, _>("payload")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        tenant_id: row.get("tenant_id"),
        response_status: row.get("response_status"),
        response_body: row
            .get::<Option<String>, _>("response_body")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        command_ts: row.get("command_ts"),
    }
}
