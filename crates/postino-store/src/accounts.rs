//! SMTP account table with tenant scoping.

use std::collections::HashSet;

use postino_types::{Account, AccountSpec, LimitBehavior, now_ts};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, StoreError};

pub struct Accounts<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Accounts<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update an account keyed by `(tenant_id, id)`.
    ///
    /// Updates keep the existing pk and the IMAP sync cursor
    /// (`imap_last_uid`, `imap_uidvalidity`). Returns the pk.
    pub async fn upsert(&self, spec: &AccountSpec) -> Result<String> {
        let existing: Option<String> =
            sqlx::query("SELECT pk FROM accounts WHERE tenant_id = ? AND id = ?")
                .bind(&spec.tenant_id)
                .bind(&spec.id)
                .fetch_optional(self.pool)
                .await?
                .map(|row| row.get("pk"));

        let now = now_ts();
        let limit_behavior = limit_behavior_str(spec.limit_behavior);

        match existing {
            Some(pk) => {
                sqlx::query(
                    "UPDATE accounts SET host = ?, port = ?, user = ?, password = ?, \
                     use_tls = ?, ttl = ?, batch_size = ?, limit_per_minute = ?, \
                     limit_per_hour = ?, limit_per_day = ?, limit_behavior = ?, \
                     is_pec_account = ?, imap_host = ?, imap_port = ?, imap_user = ?, \
                     imap_password = ?, imap_folder = ?, updated_at = ? WHERE pk = ?",
                )
                .bind(&spec.host)
                .bind(spec.port as i64)
                .bind(&spec.user)
                .bind(&spec.password)
                .bind(spec.use_tls.map(|v| v as i64))
                .bind(spec.ttl)
                .bind(spec.batch_size)
                .bind(spec.limit_per_minute)
                .bind(spec.limit_per_hour)
                .bind(spec.limit_per_day)
                .bind(limit_behavior)
                .bind(spec.is_pec_account as i64)
                .bind(&spec.imap_host)
                .bind(spec.imap_port as i64)
                .bind(&spec.imap_user)
                .bind(&spec.imap_password)
                .bind(&spec.imap_folder)
                .bind(now)
                .bind(&pk)
                .execute(self.pool)
                .await?;
                Ok(pk)
            }
            None => {
                let pk = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO accounts (pk, id, tenant_id, host, port, user, password, \
                     use_tls, ttl, batch_size, limit_per_minute, limit_per_hour, \
                     limit_per_day, limit_behavior, is_pec_account, imap_host, imap_port, \
                     imap_user, imap_password, imap_folder, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&pk)
                .bind(&spec.id)
                .bind(&spec.tenant_id)
                .bind(&spec.host)
                .bind(spec.port as i64)
                .bind(&spec.user)
                .bind(&spec.password)
                .bind(spec.use_tls.map(|v| v as i64))
                .bind(spec.ttl)
                .bind(spec.batch_size)
                .bind(spec.limit_per_minute)
                .bind(spec.limit_per_hour)
                .bind(spec.limit_per_day)
                .bind(limit_behavior)
                .bind(spec.is_pec_account as i64)
                .bind(&spec.imap_host)
                .bind(spec.imap_port as i64)
                .bind(&spec.imap_user)
                .bind(&spec.imap_password)
                .bind(&spec.imap_folder)
                .bind(now)
                .bind(now)
                .execute(self.pool)
                .await?;
                Ok(pk)
            }
        }
    }

    /// Fetch a single account or fail with `not_found`.
    pub async fn get(&self, tenant_id: &str, account_id: &str) -> Result<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(account_id)
            .fetch_optional(self.pool)
            .await?;
        match row {
            Some(row) => row_to_account(&row),
            None => Err(StoreError::not_found(
                "account",
                format!("{tenant_id}/{account_id}"),
            )),
        }
    }

    pub async fn get_by_pk(&self, pk: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE pk = ?")
            .bind(pk)
            .fetch_optional(self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn list_all(&self, tenant_id: Option<&str>) -> Result<Vec<Account>> {
        let rows = match tenant_id {
            Some(tenant) => {
                sqlx::query("SELECT * FROM accounts WHERE tenant_id = ? ORDER BY id")
                    .bind(tenant)
                    .fetch_all(self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM accounts ORDER BY tenant_id, id")
                    .fetch_all(self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_account).collect()
    }

    pub async fn remove(&self, tenant_id: &str, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE tenant_id = ? AND id = ?")
            .bind(tenant_id)
            .bind(account_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Account ids flagged as PEC; used at insert to derive `is_pec`.
    pub async fn pec_account_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM accounts WHERE is_pec_account = 1")
            .fetch_all(self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Accounts with an inbound mailbox configured (bounce or PEC polling).
    pub async fn imap_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE imap_host IS NOT NULL ORDER BY id")
            .fetch_all(self.pool)
            .await?;
        rows.iter().map(row_to_account).collect()
    }

    /// Persist the IMAP cursor; called only after events are committed.
    pub async fn update_imap_sync_state(
        &self,
        pk: &str,
        last_uid: i64,
        uidvalidity: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET imap_last_uid = ?, imap_uidvalidity = ?, updated_at = ? \
             WHERE pk = ?",
        )
        .bind(last_uid)
        .bind(uidvalidity)
        .bind(now_ts())
        .bind(pk)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

fn limit_behavior_str(behavior: LimitBehavior) -> &'static str {
    match behavior {
        LimitBehavior::Defer => "defer",
        LimitBehavior::Reject => "reject",
    }
}

pub(crate) fn row_to_account(row: &SqliteRow) -> Result<Account> {
    let limit_behavior = match row.get::<String, _>("limit_behavior").as_str() {
        "reject" => LimitBehavior::Reject,
        _ => LimitBehavior::Defer,
    };
    Ok(Account {
        pk: row.get("pk"),
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        host: row.get("host"),
        port: row.get::<i64, _>("port") as u16,
        user: row.get("user"),
        password: row.get("password"),
        use_tls: row.get::<Option<i64>, _>("use_tls").map(|v| v != 0),
        ttl: row.get("ttl"),
        batch_size: row.get("batch_size"),
        limit_per_minute: row.get("limit_per_minute"),
        limit_per_hour: row.get("limit_per_hour"),
        limit_per_day: row.get("limit_per_day"),
        limit_behavior,
        is_pec_account: row.get::<i64, _>("is_pec_account") != 0,
        imap_host: row.get("imap_host"),
        imap_port: row.get::<i64, _>("imap_port") as u16,
        imap_user: row.get("imap_user"),
        imap_password: row.get("imap_password"),
        imap_folder: row.get("imap_folder"),
        imap_last_uid: row.get("imap_last_uid"),
        imap_uidvalidity: row.get("imap_uidvalidity"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use postino_types::AccountSpec;

    use crate::testutil::{open_store, seed_account, seed_tenant};

    fn pec_spec(tenant_id: &str, id: &str) -> AccountSpec {
        AccountSpec {
            id: id.into(),
            tenant_id: tenant_id.into(),
            host: "smtps.pec.example.it".into(),
            port: 465,
            user: Some("certified@pec.example.it".into()),
            password: Some("secret".into()),
            use_tls: Some(true),
            ttl: 300,
            batch_size: Some(10),
            limit_per_minute: None,
            limit_per_hour: None,
            limit_per_day: None,
            limit_behavior: Default::default(),
            is_pec_account: true,
            imap_host: Some("imaps.pec.example.it".into()),
            imap_port: 993,
            imap_user: Some("certified@pec.example.it".into()),
            imap_password: Some("secret".into()),
            imap_folder: "INBOX".into(),
        }
    }

    #[tokio::test]
    async fn get_raises_not_found() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;
        let err = store.accounts().get("t1", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upsert_keeps_pk_and_imap_cursor() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        let pk = store.accounts().upsert(&pec_spec("t1", "pec")).await.unwrap();
        store
            .accounts()
            .update_imap_sync_state(&pk, 41, Some(99))
            .await
            .unwrap();

        let mut updated = pec_spec("t1", "pec");
        updated.host = "smtp2.pec.example.it".into();
        let pk_again = store.accounts().upsert(&updated).await.unwrap();
        assert_eq!(pk, pk_again);

        let account = store.accounts().get("t1", "pec").await.unwrap();
        assert_eq!(account.host, "smtp2.pec.example.it");
        assert_eq!(account.imap_last_uid, Some(41));
        assert_eq!(account.imap_uidvalidity, Some(99));
    }

    #[tokio::test]
    async fn account_ids_are_scoped_per_tenant() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;
        seed_tenant(&store, "t2").await;
        seed_account(&store, "t1", "acc").await;
        seed_account(&store, "t2", "acc").await;

        assert_eq!(store.accounts().list_all(Some("t1")).await.unwrap().len(), 1);
        assert_eq!(store.accounts().list_all(None).await.unwrap().len(), 2);

        assert!(store.accounts().remove("t1", "acc").await.unwrap());
        assert!(store.accounts().get("t2", "acc").await.is_ok());
    }

    #[tokio::test]
    async fn pec_ids_and_imap_accounts() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;
        seed_account(&store, "t1", "plain").await;
        store.accounts().upsert(&pec_spec("t1", "pec")).await.unwrap();

        let pec_ids = store.accounts().pec_account_ids().await.unwrap();
        assert!(pec_ids.contains("pec"));
        assert!(!pec_ids.contains("plain"));

        let pollers = store.accounts().imap_accounts().await.unwrap();
        assert_eq!(pollers.len(), 1);
        assert!(pollers[0].has_imap());
    }
}
