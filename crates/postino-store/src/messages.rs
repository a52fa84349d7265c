//! Message queue table.
//!
//! State transitions (`smtp_ts`, `deferred_ts`) are owned by the event
//! writer in [`crate::Events`]; the `mark_*` methods here are its plumbing
//! and take an executor so they run inside the event transaction.

use std::collections::HashSet;

use postino_types::{
    InsertedMessage, Message, MessageEvent, MessagePayload, NewMessage, now_ts,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Priority selection for [`Messages::fetch_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityFilter {
    /// Any priority.
    Any,
    /// Only the given priority (0 selects immediate traffic).
    Exact(i64),
    /// Only priorities greater than or equal to the given value.
    AtLeast(i64),
}

/// A message row as returned by the inspection listing, carrying the latest
/// error event and (optionally) the full event history.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedMessage {
    pub message: Message,
    pub tenant_name: Option<String>,
    pub error: Option<String>,
    pub error_ts: Option<i64>,
    pub history: Vec<MessageEvent>,
}

pub struct Messages<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Messages<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a batch of messages for delivery.
    ///
    /// Per entry: an existing `(tenant_id, id)` with `smtp_ts` set is
    /// skipped (already sent); an existing pending row is updated in place;
    /// otherwise a new row is inserted. `account_pk` is resolved from the
    /// business key, and `is_pec` derives from the target account. Each
    /// entry commits in its own transaction.
    pub async fn insert_batch(
        &self,
        entries: &[NewMessage],
        pec_account_ids: &HashSet<String>,
    ) -> Result<Vec<InsertedMessage>> {
        let mut inserted = Vec::new();

        for entry in entries {
            let mut tx = self.pool.begin().await?;

            let account_pk: Option<String> = match &entry.account_id {
                Some(account_id) => sqlx::query(
                    "SELECT pk FROM accounts WHERE tenant_id = ? AND id = ?",
                )
                .bind(&entry.tenant_id)
                .bind(account_id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.get("pk")),
                None => None,
            };

            let is_pec = entry
                .account_id
                .as_deref()
                .is_some_and(|id| pec_account_ids.contains(id));

            let payload = serde_json::to_string(&entry.payload)
                .map_err(|e| StoreError::Corrupt {
                    what: "message payload",
                    detail: e.to_string(),
                })?;

            let existing = sqlx::query(
                "SELECT pk, smtp_ts FROM messages WHERE tenant_id = ? AND id = ?",
            )
            .bind(&entry.tenant_id)
            .bind(&entry.id)
            .fetch_optional(&mut *tx)
            .await?;

            let now = now_ts();
            let pk = match existing {
                Some(row) => {
                    if row.get::<Option<i64>, _>("smtp_ts").is_some() {
                        // Terminal for the SMTP layer: reject as already sent.
                        tx.commit().await?;
                        continue;
                    }
                    let pk: String = row.get("pk");
                    sqlx::query(
                        "UPDATE messages SET account_id = ?, account_pk = ?, priority = ?, \
                         payload = ?, batch_code = ?, deferred_ts = ?, is_pec = ?, \
                         updated_at = ? WHERE pk = ?",
                    )
                    .bind(&entry.account_id)
                    .bind(&account_pk)
                    .bind(entry.priority)
                    .bind(&payload)
                    .bind(&entry.batch_code)
                    .bind(entry.deferred_ts)
                    .bind(is_pec as i64)
                    .bind(now)
                    .bind(&pk)
                    .execute(&mut *tx)
                    .await?;
                    pk
                }
                None => {
                    let pk = Uuid::new_v4().to_string();
                    sqlx::query(
                        "INSERT INTO messages (pk, id, tenant_id, account_id, account_pk, \
                         priority, payload, batch_code, created_at, updated_at, deferred_ts, \
                         smtp_ts, is_pec) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
                    )
                    .bind(&pk)
                    .bind(&entry.id)
                    .bind(&entry.tenant_id)
                    .bind(&entry.account_id)
                    .bind(&account_pk)
                    .bind(entry.priority)
                    .bind(&payload)
                    .bind(&entry.batch_code)
                    .bind(now)
                    .bind(now)
                    .bind(entry.deferred_ts)
                    .bind(is_pec as i64)
                    .execute(&mut *tx)
                    .await?;
                    pk
                }
            };

            tx.commit().await?;
            inserted.push(InsertedMessage {
                id: entry.id.clone(),
                pk,
            });
        }

        Ok(inserted)
    }

    /// Fetch messages ready for dispatch, excluding suspended tenants.
    ///
    /// Ready means `smtp_ts IS NULL` and `deferred_ts` is absent or due.
    /// The suspension filter follows the batch-code rules: `*` suspends
    /// everything, otherwise only listed batch codes are skipped. Ordering
    /// is `priority ASC, created_at ASC, pk ASC`.
    pub async fn fetch_ready(
        &self,
        limit: i64,
        now_ts: i64,
        filter: PriorityFilter,
    ) -> Result<Vec<Message>> {
        let priority_clause = match filter {
            PriorityFilter::Any => "",
            PriorityFilter::Exact(_) => "AND m.priority = ? ",
            PriorityFilter::AtLeast(_) => "AND m.priority >= ? ",
        };

        let sql = format!(
            "SELECT m.* FROM messages m \
             LEFT JOIN tenants t ON m.tenant_id = t.id \
             WHERE m.smtp_ts IS NULL \
               AND (m.deferred_ts IS NULL OR m.deferred_ts <= ?) \
               {priority_clause}\
               AND (\
                   t.suspended_batches IS NULL \
                   OR t.suspended_batches = '' \
                   OR (\
                       t.suspended_batches != '*' \
                       AND (\
                           m.batch_code IS NULL \
                           OR (',' || t.suspended_batches || ',') NOT LIKE ('%,' || m.batch_code || ',%')\
                       )\
                   )\
               ) \
             ORDER BY m.priority ASC, m.created_at ASC, m.pk ASC \
             LIMIT ?"
        );

        let mut query = sqlx::query(&sql).bind(now_ts);
        match filter {
            PriorityFilter::Any => {}
            PriorityFilter::Exact(p) | PriorityFilter::AtLeast(p) => {
                query = query.bind(p);
            }
        }
        let rows = query.bind(limit).fetch_all(self.pool).await?;

        rows.iter().map(row_to_message).collect()
    }

    pub async fn get(&self, msg_id: &str, tenant_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(msg_id)
            .fetch_optional(self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    pub async fn get_by_pk(&self, pk: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE pk = ?")
            .bind(pk)
            .fetch_optional(self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Replace the stored payload (used when a retry bumps `retry_count`).
    pub async fn update_payload(&self, pk: &str, payload: &MessagePayload) -> Result<()> {
        let encoded = serde_json::to_string(payload).map_err(|e| StoreError::Corrupt {
            what: "message payload",
            detail: e.to_string(),
        })?;
        sqlx::query("UPDATE messages SET payload = ?, updated_at = ? WHERE pk = ?")
            .bind(encoded)
            .bind(now_ts())
            .bind(pk)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Put a message back in the queue for retry at `deferred_ts`.
    pub(crate) async fn mark_deferred<'e, E>(
        executor: E,
        pk: &str,
        deferred_ts: i64,
    ) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "UPDATE messages SET deferred_ts = ?, smtp_ts = NULL, updated_at = ? WHERE pk = ?",
        )
        .bind(deferred_ts)
        .bind(now_ts())
        .bind(pk)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Mark a message SMTP-terminal (success or permanent error).
    pub(crate) async fn mark_terminal<'e, E>(executor: E, pk: &str, smtp_ts: i64) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "UPDATE messages SET smtp_ts = ?, deferred_ts = NULL, updated_at = ? WHERE pk = ?",
        )
        .bind(smtp_ts)
        .bind(now_ts())
        .bind(pk)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn clear_deferred(&self, pk: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET deferred_ts = NULL, updated_at = ? WHERE pk = ?")
            .bind(now_ts())
            .bind(pk)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Clear the PEC flag when the recipient turns out not to be certified.
    pub async fn clear_pec_flag(&self, pk: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET is_pec = 0, updated_at = ? WHERE pk = ?")
            .bind(now_ts())
            .bind(pk)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// PEC messages sent before `cutoff_ts` with no acceptance receipt yet.
    pub async fn pec_without_acceptance(&self, cutoff_ts: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT m.* FROM messages m \
             WHERE m.is_pec = 1 AND m.smtp_ts IS NOT NULL AND m.smtp_ts < ? \
               AND NOT EXISTS (\
                   SELECT 1 FROM message_events e \
                   WHERE e.message_pk = m.pk AND e.event_type = 'pec_acceptance'\
               )",
        )
        .bind(cutoff_ts)
        .fetch_all(self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Filter `ids` down to those owned by `tenant_id` through an account.
    pub async fn get_ids_for_tenant(
        &self,
        ids: &[String],
        tenant_id: &str,
    ) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT m.id FROM messages m \
             JOIN accounts a ON m.account_id = a.id AND m.tenant_id = a.tenant_id \
             WHERE m.id IN ({placeholders}) AND a.tenant_id = ?"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.bind(tenant_id).fetch_all(self.pool).await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    pub async fn delete(&self, msg_id: &str, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(msg_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of messages still awaiting delivery.
    pub async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE smtp_ts IS NULL")
            .fetch_one(self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    pub async fn count_pending_for_tenant(
        &self,
        tenant_id: &str,
        batch_code: Option<&str>,
    ) -> Result<i64> {
        let row = match batch_code {
            Some(code) => {
                sqlx::query(
                    "SELECT COUNT(*) AS cnt FROM messages m \
                     JOIN accounts a ON m.account_id = a.id AND m.tenant_id = a.tenant_id \
                     WHERE a.tenant_id = ? AND m.batch_code = ? AND m.smtp_ts IS NULL",
                )
                .bind(tenant_id)
                .bind(code)
                .fetch_one(self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) AS cnt FROM messages m \
                     JOIN accounts a ON m.account_id = a.id AND m.tenant_id = a.tenant_id \
                     WHERE a.tenant_id = ? AND m.smtp_ts IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(self.pool)
                .await?
            }
        };
        Ok(row.get("cnt"))
    }

    /// Delete messages all of whose events are reported and whose latest
    /// `reported_ts` is below `threshold_ts`. Returns the deleted count.
    pub async fn remove_fully_reported_before(
        &self,
        threshold_ts: i64,
        tenant_id: Option<&str>,
    ) -> Result<u64> {
        let tenant_clause = if tenant_id.is_some() {
            "AND m.tenant_id = ? "
        } else {
            ""
        };
        let sql = format!(
            "DELETE FROM messages WHERE pk IN (\
                 SELECT m.pk FROM messages m \
                 WHERE m.smtp_ts IS NOT NULL \
                   {tenant_clause}\
                   AND NOT EXISTS (\
                       SELECT 1 FROM message_events e \
                       WHERE e.message_pk = m.pk AND e.reported_ts IS NULL\
                   ) \
                   AND (\
                       SELECT MAX(e.reported_ts) FROM message_events e \
                       WHERE e.message_pk = m.pk\
                   ) < ?\
             )"
        );
        let mut query = sqlx::query(&sql);
        if let Some(tenant) = tenant_id {
            query = query.bind(tenant);
        }
        let result = query.bind(threshold_ts).execute(self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Inspection listing with the latest error and optional event history.
    pub async fn list_all(
        &self,
        tenant_id: Option<&str>,
        active_only: bool,
        include_history: bool,
    ) -> Result<Vec<ListedMessage>> {
        let mut clauses: Vec<&str> = Vec::new();
        if tenant_id.is_some() {
            clauses.push("m.tenant_id = ?");
        }
        if active_only {
            clauses.push("m.smtp_ts IS NULL");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "SELECT m.*, t.name AS tenant_name, err.error_ts, err.error FROM messages m \
             LEFT JOIN tenants t ON m.tenant_id = t.id \
             LEFT JOIN (\
                 SELECT message_pk, event_ts AS error_ts, description AS error \
                 FROM message_events \
                 WHERE event_type = 'error' AND id = (\
                     SELECT MAX(id) FROM message_events e2 \
                     WHERE e2.message_pk = message_events.message_pk \
                       AND e2.event_type = 'error'\
                 )\
             ) err ON m.pk = err.message_pk \
             {where_clause} \
             ORDER BY m.priority ASC, m.created_at ASC, m.id ASC"
        );

        let mut query = sqlx::query(&sql);
        if let Some(tenant) = tenant_id {
            query = query.bind(tenant);
        }
        let rows = query.fetch_all(self.pool).await?;

        let mut listed = Vec::with_capacity(rows.len());
        for row in &rows {
            listed.push(ListedMessage {
                message: row_to_message(row)?,
                tenant_name: row.get("tenant_name"),
                error: row.get("error"),
                error_ts: row.get("error_ts"),
                history: Vec::new(),
            });
        }

        if include_history {
            for item in &mut listed {
                item.history = crate::Events::new(self.pool)
                    .events_for_message(&item.message.pk)
                    .await?;
            }
        }

        Ok(listed)
    }
}

pub(crate) fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let raw_payload: String = row.get("payload");
    let payload: MessagePayload = serde_json::from_str(&raw_payload).unwrap_or_else(|_| {
        let mut fallback = MessagePayload::default();
        fallback
            .extra
            .insert("raw_payload".into(), serde_json::Value::String(raw_payload));
        fallback
    });

    Ok(Message {
        pk: row.get("pk"),
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        account_id: row.get("account_id"),
        account_pk: row.get("account_pk"),
        priority: row.get("priority"),
        payload,
        batch_code: row.get("batch_code"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deferred_ts: row.get("deferred_ts"),
        smtp_ts: row.get("smtp_ts"),
        is_pec: row.get::<i64, _>("is_pec") != 0,
    })
}
