//! Tenant table: namespace configuration, batch suspension, API keys.

use postino_types::{ClientAuth, LargeFileConfig, Tenant, now_ts};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, StoreError};

/// Columns accepted by [`Tenants::update_fields`].
const UPDATABLE: &[&str] = &[
    "name",
    "active",
    "client_base_url",
    "client_sync_path",
    "client_attachment_path",
    "client_auth",
    "rate_limits",
    "large_file_config",
    "suspended_batches",
];

pub struct Tenants<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Tenants<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, tenant: &Tenant) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO tenants (id, name, active, client_base_url, client_sync_path, \
             client_attachment_path, client_auth, rate_limits, large_file_config, \
             suspended_batches, api_key_hash, api_key_expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(tenant.active as i64)
        .bind(&tenant.client_base_url)
        .bind(&tenant.client_sync_path)
        .bind(&tenant.client_attachment_path)
        .bind(encode_json(&tenant.client_auth)?)
        .bind(tenant.rate_limits.as_ref().map(Value::to_string))
        .bind(encode_json(&tenant.large_file_config)?)
        .bind(&tenant.suspended_batches)
        .bind(&tenant.api_key_hash)
        .bind(tenant.api_key_expires_at)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .fetch_optional(self.pool)
            .await?;
        row.as_ref().map(row_to_tenant).transpose()
    }

    pub async fn list_all(&self, active_only: bool) -> Result<Vec<Tenant>> {
        let sql = if active_only {
            "SELECT * FROM tenants WHERE active = 1 ORDER BY id"
        } else {
            "SELECT * FROM tenants ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(self.pool).await?;
        rows.iter().map(row_to_tenant).collect()
    }

    /// Apply a partial update from a JSON object; unknown keys are ignored.
    /// Returns false when the tenant does not exist.
    pub async fn update_fields(
        &self,
        tenant_id: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<bool> {
        if self.get(tenant_id).await?.is_none() {
            return Ok(false);
        }

        let mut builder: sqlx::QueryBuilder<'_, sqlx::Sqlite> =
            sqlx::QueryBuilder::new("UPDATE tenants SET updated_at = ");
        builder.push_bind(now_ts());
        let mut touched = false;
        for column in UPDATABLE {
            let Some(value) = fields.get(*column) else {
                continue;
            };
            touched = true;
            builder.push(format!(", {column} = "));
            match (*column, value) {
                ("active", value) => {
                    builder.push_bind(value.as_bool().unwrap_or(true) as i64);
                }
                ("client_auth" | "rate_limits" | "large_file_config", Value::Null) => {
                    builder.push_bind(Option::<String>::None);
                }
                ("client_auth" | "rate_limits" | "large_file_config", value) => {
                    builder.push_bind(value.to_string());
                }
                (_, Value::Null) => {
                    builder.push_bind(Option::<String>::None);
                }
                (_, Value::String(s)) => {
                    builder.push_bind(s.clone());
                }
                (_, value) => {
                    builder.push_bind(value.to_string());
                }
            }
        }
        if !touched {
            return Ok(true);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(tenant_id);
        builder.build().execute(self.pool).await?;
        Ok(true)
    }

    /// Delete a tenant; accounts and messages cascade.
    pub async fn remove(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Create the implicit `default` tenant for single-tenant deployments.
    pub async fn ensure_default(&self) -> Result<()> {
        if self.get("default").await?.is_none() {
            let mut tenant = Tenant::new("default");
            tenant.name = Some("Default Tenant".into());
            self.insert(&tenant).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------ suspension

    /// Suspend sending for a tenant; `None` suspends everything (`*`),
    /// a specific code is added to the sorted deduplicated list. Suspending
    /// a code while `*` is active succeeds without change.
    pub async fn suspend_batch(&self, tenant_id: &str, batch_code: Option<&str>) -> Result<()> {
        let tenant = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| StoreError::not_found("tenant", tenant_id))?;

        let new_value = match batch_code {
            None => Some("*".to_string()),
            Some(code) => {
                let current = tenant.suspended_batches.as_deref().unwrap_or("");
                if current == "*" {
                    return Ok(());
                }
                let mut batches: Vec<&str> = current
                    .split(',')
                    .filter(|entry| !entry.is_empty())
                    .collect();
                if !batches.contains(&code) {
                    batches.push(code);
                }
                batches.sort_unstable();
                batches.dedup();
                Some(batches.join(","))
            }
        };

        self.set_suspended(tenant_id, new_value).await
    }

    /// Resume sending; `None` clears all suspension, a specific code is
    /// removed from the list. Removing a single code while `*` is set fails
    /// with [`StoreError::FullySuspended`].
    pub async fn activate_batch(&self, tenant_id: &str, batch_code: Option<&str>) -> Result<()> {
        let tenant = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| StoreError::not_found("tenant", tenant_id))?;

        let new_value = match batch_code {
            None => None,
            Some(code) => {
                let current = tenant.suspended_batches.as_deref().unwrap_or("");
                if current == "*" {
                    return Err(StoreError::FullySuspended);
                }
                let batches: Vec<&str> = current
                    .split(',')
                    .filter(|entry| !entry.is_empty() && *entry != code)
                    .collect();
                if batches.is_empty() {
                    None
                } else {
                    let mut batches = batches;
                    batches.sort_unstable();
                    Some(batches.join(","))
                }
            }
        };

        self.set_suspended(tenant_id, new_value).await
    }

    pub async fn suspended_batches(&self, tenant_id: &str) -> Result<Vec<String>> {
        let tenant = self.get(tenant_id).await?;
        let Some(tenant) = tenant else {
            return Ok(Vec::new());
        };
        let Some(suspended) = tenant.suspended_batches else {
            return Ok(Vec::new());
        };
        if suspended.is_empty() {
            return Ok(Vec::new());
        }
        if suspended == "*" {
            return Ok(vec!["*".to_string()]);
        }
        Ok(suspended
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn set_suspended(&self, tenant_id: &str, value: Option<String>) -> Result<()> {
        sqlx::query("UPDATE tenants SET suspended_batches = ?, updated_at = ? WHERE id = ?")
            .bind(value)
            .bind(now_ts())
            .bind(tenant_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------- API keys

    /// Generate a high-entropy API key, store its SHA-256 hash, and return
    /// the raw value. The raw key is not recoverable afterwards.
    pub async fn create_api_key(
        &self,
        tenant_id: &str,
        expires_at: Option<i64>,
    ) -> Result<String> {
        if self.get(tenant_id).await?.is_none() {
            return Err(StoreError::not_found("tenant", tenant_id));
        }

        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);
        let raw = format!("pst_{}", hex::encode(entropy));

        sqlx::query(
            "UPDATE tenants SET api_key_hash = ?, api_key_expires_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(hash_api_key(&raw))
        .bind(expires_at)
        .bind(now_ts())
        .bind(tenant_id)
        .execute(self.pool)
        .await?;

        Ok(raw)
    }

    pub async fn revoke_api_key(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tenants SET api_key_hash = NULL, api_key_expires_at = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(now_ts())
        .bind(tenant_id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Resolve a raw API token to its tenant; expired tokens resolve to
    /// nothing.
    pub async fn tenant_by_token(&self, raw_token: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE api_key_hash = ?")
            .bind(hash_api_key(raw_token))
            .fetch_optional(self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tenant = row_to_tenant(&row)?;
        if let Some(expires_at) = tenant.api_key_expires_at {
            if expires_at <= now_ts() {
                return Ok(None);
            }
        }
        Ok(Some(tenant))
    }
}

fn hash_api_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn encode_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            what: "tenant config",
            detail: e.to_string(),
        })
}

pub(crate) fn row_to_tenant(row: &SqliteRow) -> Result<Tenant> {
    let client_auth: Option<ClientAuth> = row
        .get::<Option<String>, _>("client_auth")
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let large_file_config: Option<LargeFileConfig> = row
        .get::<Option<String>, _>("large_file_config")
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let rate_limits: Option<Value> = row
        .get::<Option<String>, _>("rate_limits")
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(Tenant {
        id: row.get("id"),
        name: row.get("name"),
        active: row.get::<i64, _>("active") != 0,
        client_base_url: row.get("client_base_url"),
        client_sync_path: row.get("client_sync_path"),
        client_attachment_path: row.get("client_attachment_path"),
        client_auth,
        rate_limits,
        large_file_config,
        suspended_batches: row.get("suspended_batches"),
        api_key_hash: row.get("api_key_hash"),
        api_key_expires_at: row.get("api_key_expires_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use postino_types::{ClientAuth, Tenant, now_ts};
    use serde_json::json;

    use crate::StoreError;
    use crate::testutil::{open_store, seed_tenant};

    #[tokio::test]
    async fn default_tenant_exists() {
        let store = open_store().await;
        let tenant = store.tenants().get("default").await.unwrap();
        assert!(tenant.is_some());
        assert!(tenant.unwrap().active);
    }

    #[tokio::test]
    async fn suspend_then_activate_restores_prior_state() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        store.tenants().suspend_batch("t1", Some("b2")).await.unwrap();
        store.tenants().suspend_batch("t1", Some("b1")).await.unwrap();
        // Duplicate suspension is a no-op on the list.
        store.tenants().suspend_batch("t1", Some("b1")).await.unwrap();
        assert_eq!(
            store.tenants().suspended_batches("t1").await.unwrap(),
            vec!["b1", "b2"]
        );

        store.tenants().activate_batch("t1", Some("b1")).await.unwrap();
        store.tenants().activate_batch("t1", Some("b2")).await.unwrap();
        assert!(store.tenants().suspended_batches("t1").await.unwrap().is_empty());
        let tenant = store.tenants().get("t1").await.unwrap().unwrap();
        assert_eq!(tenant.suspended_batches, None);
    }

    #[tokio::test]
    async fn suspend_all_blocks_single_batch_activation() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        store.tenants().suspend_batch("t1", None).await.unwrap();
        assert_eq!(
            store.tenants().suspended_batches("t1").await.unwrap(),
            vec!["*"]
        );
        // Suspending a specific code under `*` succeeds without change.
        store.tenants().suspend_batch("t1", Some("b1")).await.unwrap();
        assert_eq!(
            store.tenants().suspended_batches("t1").await.unwrap(),
            vec!["*"]
        );

        let err = store
            .tenants()
            .activate_batch("t1", Some("b1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FullySuspended));

        store.tenants().activate_batch("t1", None).await.unwrap();
        assert!(store.tenants().suspended_batches("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_key_round_trip_and_revocation() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        let raw = store.tenants().create_api_key("t1", None).await.unwrap();
        assert!(raw.starts_with("pst_"));

        let resolved = store.tenants().tenant_by_token(&raw).await.unwrap();
        assert_eq!(resolved.unwrap().id, "t1");

        assert!(store.tenants().revoke_api_key("t1").await.unwrap());
        assert!(store.tenants().tenant_by_token(&raw).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_api_key_is_rejected() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        let raw = store
            .tenants()
            .create_api_key("t1", Some(now_ts() - 60))
            .await
            .unwrap();
        assert!(store.tenants().tenant_by_token(&raw).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_fields_touches_only_known_columns() {
        let store = open_store().await;
        seed_tenant(&store, "t1").await;

        let fields = json!({
            "name": "Tenant One",
            "active": false,
            "client_base_url": "https://one.example.com",
            "client_auth": {"method": "bearer", "token": "tok"},
            "nonsense": "ignored"
        });
        let updated = store
            .tenants()
            .update_fields("t1", fields.as_object().unwrap())
            .await
            .unwrap();
        assert!(updated);

        let tenant = store.tenants().get("t1").await.unwrap().unwrap();
        assert_eq!(tenant.name.as_deref(), Some("Tenant One"));
        assert!(!tenant.active);
        assert_eq!(
            tenant.client_auth,
            Some(ClientAuth::Bearer { token: "tok".into() })
        );

        let missing = store
            .tenants()
            .update_fields("nope", fields.as_object().unwrap())
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn tenant_json_blobs_round_trip() {
        let store = open_store().await;
        let mut tenant = Tenant::new("t1");
        tenant.client_auth = Some(ClientAuth::Basic {
            user: "u".into(),
            password: "p".into(),
        });
        tenant.large_file_config = Some(postino_types::LargeFileConfig {
            enabled: true,
            max_size_mb: 10.0,
            action: postino_types::LargeFileAction::Rewrite,
            storage_url: Some("https://files.example.com".into()),
            file_ttl_days: Some(7),
        });
        store.tenants().insert(&tenant).await.unwrap();

        let loaded = store.tenants().get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.client_auth, tenant.client_auth);
        assert_eq!(loaded.large_file_config, tenant.large_file_config);
    }
}
