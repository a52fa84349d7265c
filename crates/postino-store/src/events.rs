//! Append-only message event log.
//!
//! [`Events::add_event`] is the single writer of message state transitions:
//! the event row insert and the corresponding `smtp_ts`/`deferred_ts`
//! update on the message commit in one transaction. Events are never
//! mutated afterwards except to set `reported_ts`.

use postino_types::{EventType, MessageEvent, UnreportedEvent};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::messages::Messages;

pub struct Events<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Events<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an event and apply its message-state update atomically.
    ///
    /// `sent` and `error` are SMTP-terminal: they stamp `smtp_ts` and clear
    /// `deferred_ts`. `deferred` re-queues the message at the retry target
    /// from `metadata.deferred_ts` (falling back to `event_ts`). All other
    /// event types leave message state alone.
    ///
    /// Returns the new event id.
    pub async fn add_event(
        &self,
        message_pk: &str,
        event_type: EventType,
        event_ts: i64,
        description: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<i64> {
        let encoded = metadata.map(|m| m.to_string());

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO message_events (message_pk, event_type, event_ts, description, metadata) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message_pk)
        .bind(event_type.as_str())
        .bind(event_ts)
        .bind(description)
        .bind(&encoded)
        .execute(&mut *tx)
        .await?;

        match event_type {
            EventType::Sent | EventType::Error => {
                Messages::mark_terminal(&mut *tx, message_pk, event_ts).await?;
            }
            EventType::Deferred => {
                let deferred_ts = metadata
                    .and_then(|m| m.get("deferred_ts"))
                    .and_then(Value::as_i64)
                    .unwrap_or(event_ts);
                Messages::mark_deferred(&mut *tx, message_pk, deferred_ts).await?;
            }
            _ => {}
        }

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Events not yet acknowledged by tenant webhooks, joined to their
    /// message for the client-facing ids, ordered `event_ts ASC, id ASC`.
    pub async fn fetch_unreported(&self, limit: i64) -> Result<Vec<UnreportedEvent>> {
        let rows = sqlx::query(
            "SELECT e.id AS event_id, e.message_pk, m.id AS message_id, m.tenant_id, \
                    m.account_id, e.event_type, e.event_ts, e.description, e.metadata \
             FROM message_events e \
             JOIN messages m ON e.message_pk = m.pk \
             WHERE e.reported_ts IS NULL \
             ORDER BY e.event_ts ASC, e.id ASC \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UnreportedEvent {
                    event_id: row.get("event_id"),
                    message_pk: row.get("message_pk"),
                    message_id: row.get("message_id"),
                    tenant_id: row.get("tenant_id"),
                    account_id: row.get("account_id"),
                    event_type: parse_event_type(row)?,
                    event_ts: row.get("event_ts"),
                    description: row.get("description"),
                    metadata: decode_metadata(row),
                })
            })
            .collect()
    }

    /// Bulk-acknowledge events after a successful webhook POST.
    pub async fn mark_reported(&self, event_ids: &[i64], reported_ts: i64) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "UPDATE message_events SET reported_ts = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(reported_ts);
        for id in event_ids {
            query = query.bind(id);
        }
        query.execute(self.pool).await?;
        Ok(())
    }

    /// All events for one message, ordered chronologically.
    pub async fn events_for_message(&self, message_pk: &str) -> Result<Vec<MessageEvent>> {
        let rows = sqlx::query(
            "SELECT id, message_pk, event_type, event_ts, description, metadata, reported_ts \
             FROM message_events WHERE message_pk = ? \
             ORDER BY event_ts ASC, id ASC",
        )
        .bind(message_pk)
        .fetch_all(self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MessageEvent {
                    id: row.get("id"),
                    message_pk: row.get("message_pk"),
                    event_type: parse_event_type(row)?,
                    event_ts: row.get("event_ts"),
                    description: row.get("description"),
                    metadata: decode_metadata(row),
                    reported_ts: row.get("reported_ts"),
                })
            })
            .collect()
    }

    pub async fn count_unreported_for_message(&self, message_pk: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM message_events \
             WHERE message_pk = ? AND reported_ts IS NULL",
        )
        .bind(message_pk)
        .fetch_one(self.pool)
        .await?;
        Ok(row.get("cnt"))
    }

    pub async fn delete_for_message(&self, message_pk: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM message_events WHERE message_pk = ?")
            .bind(message_pk)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// True when an event of `event_type` tagged with the given IMAP UID
    /// already exists for this message. Used by the receiver to make UID
    /// replays a no-op.
    pub async fn has_event_with_uid(
        &self,
        message_pk: &str,
        event_type: EventType,
        imap_uid: i64,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "SELECT metadata FROM message_events WHERE message_pk = ? AND event_type = ?",
        )
        .bind(message_pk)
        .bind(event_type.as_str())
        .fetch_all(self.pool)
        .await?;

        Ok(rows.iter().any(|row| {
            row.get::<Option<String>, _>("metadata")
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .and_then(|meta| meta.get("imap_uid").and_then(Value::as_i64))
                == Some(imap_uid)
        }))
    }
}

fn parse_event_type(row: &SqliteRow) -> Result<EventType> {
    let raw: String = row.get("event_type");
    EventType::parse(&raw).ok_or_else(|| crate::StoreError::Corrupt {
        what: "event_type",
        detail: raw,
    })
}

fn decode_metadata(row: &SqliteRow) -> Option<Value> {
    row.get::<Option<String>, _>("metadata")
        .and_then(|raw| serde_json::from_str(&raw).ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use postino_types::{EventType, now_ts};
    use serde_json::json;

    use crate::testutil::{open_store, sample_message, seed_account, seed_tenant};

    async fn queue_one(store: &crate::Store) -> String {
        seed_tenant(store, "t1").await;
        seed_account(store, "t1", "acc").await;
        let inserted = store
            .messages()
            .insert_batch(&[sample_message("t1", "acc", "m-1")], &HashSet::new())
            .await
            .unwrap();
        inserted[0].pk.clone()
    }

    #[tokio::test]
    async fn sent_event_terminates_the_message() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Sent, ts, None, None)
            .await
            .unwrap();

        let msg = store.messages().get_by_pk(&pk).await.unwrap().unwrap();
        assert_eq!(msg.smtp_ts, Some(ts));
        assert!(msg.deferred_ts.is_none());

        let ready = store
            .messages()
            .fetch_ready(10, ts + 10, crate::PriorityFilter::Any)
            .await
            .unwrap();
        assert!(ready.is_empty(), "terminal messages never become ready");
    }

    #[tokio::test]
    async fn error_event_terminates_the_message() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Error, ts, Some("550 user unknown"), None)
            .await
            .unwrap();

        let msg = store.messages().get_by_pk(&pk).await.unwrap().unwrap();
        assert_eq!(msg.smtp_ts, Some(ts));
    }

    #[tokio::test]
    async fn deferred_event_requeues_at_metadata_target() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();
        let target = ts + 300;

        store
            .events()
            .add_event(
                &pk,
                EventType::Deferred,
                ts,
                Some("rate limited"),
                Some(&json!({"deferred_ts": target, "retry_count": 1})),
            )
            .await
            .unwrap();

        let msg = store.messages().get_by_pk(&pk).await.unwrap().unwrap();
        assert_eq!(msg.deferred_ts, Some(target));
        assert!(msg.smtp_ts.is_none());
    }

    #[tokio::test]
    async fn deferred_event_falls_back_to_event_ts() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Deferred, ts, None, None)
            .await
            .unwrap();

        let msg = store.messages().get_by_pk(&pk).await.unwrap().unwrap();
        assert_eq!(msg.deferred_ts, Some(ts));
    }

    #[tokio::test]
    async fn bounce_event_leaves_message_state_alone() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Sent, ts, None, None)
            .await
            .unwrap();
        store
            .events()
            .add_event(
                &pk,
                EventType::Bounce,
                ts + 60,
                Some("550 5.1.1 user unknown"),
                Some(&json!({"bounce_type": "hard", "bounce_code": "5.1.1"})),
            )
            .await
            .unwrap();

        let msg = store.messages().get_by_pk(&pk).await.unwrap().unwrap();
        assert_eq!(msg.smtp_ts, Some(ts), "bounce must not move smtp_ts");
    }

    #[tokio::test]
    async fn unreported_ordering_is_stable() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let base = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Deferred, base, None, None)
            .await
            .unwrap();
        store
            .events()
            .add_event(&pk, EventType::Sent, base + 5, None, None)
            .await
            .unwrap();

        let first = store.events().fetch_unreported(10).await.unwrap();
        let second = store.events().fetch_unreported(10).await.unwrap();
        let order: Vec<(i64, i64)> = first.iter().map(|e| (e.event_ts, e.event_id)).collect();
        let order_again: Vec<(i64, i64)> =
            second.iter().map(|e| (e.event_ts, e.event_id)).collect();
        assert_eq!(order, order_again);
        assert!(order.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn mark_reported_hides_events_from_the_feed() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(&pk, EventType::Sent, ts, None, None)
            .await
            .unwrap();

        let unreported = store.events().fetch_unreported(10).await.unwrap();
        assert_eq!(unreported.len(), 1);

        store
            .events()
            .mark_reported(&[unreported[0].event_id], ts + 1)
            .await
            .unwrap();
        assert!(store.events().fetch_unreported(10).await.unwrap().is_empty());
        assert_eq!(
            store.events().count_unreported_for_message(&pk).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn uid_replay_detection() {
        let store = open_store().await;
        let pk = queue_one(&store).await;
        let ts = now_ts();

        store
            .events()
            .add_event(
                &pk,
                EventType::Bounce,
                ts,
                None,
                Some(&json!({"bounce_type": "hard", "imap_uid": 41})),
            )
            .await
            .unwrap();

        let events = store.events();
        assert!(events.has_event_with_uid(&pk, EventType::Bounce, 41).await.unwrap());
        assert!(!events.has_event_with_uid(&pk, EventType::Bounce, 42).await.unwrap());
        assert!(
            !events
                .has_event_with_uid(&pk, EventType::PecDelivery, 41)
                .await
                .unwrap()
        );
    }
}
