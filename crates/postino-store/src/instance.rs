//! Singleton instance row (id = 1): process-wide configuration.

use postino_types::now_ts;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;

/// The singleton configuration row.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRow {
    pub name: String,
    pub api_token: Option<String>,
    /// `ce` (community) or `ee` (enterprise).
    pub edition: String,
    /// Free-form JSON bag for keys outside the typed columns.
    pub config: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl InstanceRow {
    pub fn is_enterprise(&self) -> bool {
        self.edition == "ee"
    }
}

pub struct Instance<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Instance<'a> {
    pub(crate) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get or create the singleton row.
    pub async fn ensure(&self) -> Result<InstanceRow> {
        if let Some(row) = self.get().await? {
            return Ok(row);
        }
        let now = now_ts();
        sqlx::query(
            "INSERT OR IGNORE INTO instance (id, created_at, updated_at) VALUES (1, ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;
        Ok(self.get().await?.expect("instance row just inserted"))
    }

    pub async fn get(&self) -> Result<Option<InstanceRow>> {
        let row = sqlx::query("SELECT * FROM instance WHERE id = 1")
            .fetch_optional(self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_instance))
    }

    /// Partial update; `name`, `api_token`, `edition` map to typed columns,
    /// everything else is merged into the JSON config bag.
    pub async fn update(&self, fields: &serde_json::Map<String, Value>) -> Result<()> {
        let current = self.ensure().await?;

        let name = fields
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(current.name);
        let api_token = match fields.get("api_token") {
            Some(Value::Null) => None,
            Some(value) => value.as_str().map(str::to_string),
            None => current.api_token,
        };
        let edition = fields
            .get("edition")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(current.edition);

        let mut config = match current.config {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in fields {
            if matches!(key.as_str(), "name" | "api_token" | "edition") {
                continue;
            }
            if value.is_null() {
                config.remove(key);
            } else {
                config.insert(key.clone(), value.clone());
            }
        }
        let config_blob = if config.is_empty() {
            None
        } else {
            Some(Value::Object(config).to_string())
        };

        sqlx::query(
            "UPDATE instance SET name = ?, api_token = ?, edition = ?, config = ?, \
             updated_at = ? WHERE id = 1",
        )
        .bind(name)
        .bind(api_token)
        .bind(edition)
        .bind(config_blob)
        .bind(now_ts())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn api_token(&self) -> Result<Option<String>> {
        Ok(self.ensure().await?.api_token)
    }

    /// Flip the edition flag to enterprise.
    pub async fn upgrade_to_enterprise(&self) -> Result<()> {
        self.ensure().await?;
        sqlx::query("UPDATE instance SET edition = 'ee', updated_at = ? WHERE id = 1")
            .bind(now_ts())
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_instance(row: &SqliteRow) -> InstanceRow {
    InstanceRow {
        name: row.get("name"),
        api_token: row.get("api_token"),
        edition: row.get("edition"),
        config: row
            .get::<Option<String>, _>("config")
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
