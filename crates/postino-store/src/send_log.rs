//! Persisted send timestamps backing the rate limiter.
//!
//! A narrow append-only table: one row per successful SMTP send, pruned
//! periodically past the longest limit window so restarts keep counting
//! correctly without unbounded growth.

use sqlx::{Row, SqlitePool};

use crate::error::Result;

pub struct SendLog<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SendLog<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn log_send(&self, account_pk: &str, sent_ts: i64) -> Result<()> {
        sqlx::query("INSERT INTO send_log (account_pk, sent_ts) VALUES (?, ?)")
            .bind(account_pk)
            .bind(sent_ts)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Number of sends at or after `since_ts`.
    pub async fn count_since(&self, account_pk: &str, since_ts: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM send_log WHERE account_pk = ? AND sent_ts >= ?",
        )
        .bind(account_pk)
        .bind(since_ts)
        .fetch_one(self.pool)
        .await?;
        Ok(row.get("cnt"))
    }

    /// Oldest send timestamp within the window, used to compute when the
    /// window frees a slot.
    pub async fn oldest_since(&self, account_pk: &str, since_ts: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MIN(sent_ts) AS oldest FROM send_log WHERE account_pk = ? AND sent_ts >= ?",
        )
        .bind(account_pk)
        .bind(since_ts)
        .fetch_one(self.pool)
        .await?;
        Ok(row.get("oldest"))
    }

    pub async fn prune_before(&self, threshold_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM send_log WHERE sent_ts < ?")
            .bind(threshold_ts)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
