//! Database access for system settings.

use crate::db::{
    errors::{DbError, Result},
    models::settings::SystemSettings,
};
use serde_json::{Map, Value};
use sqlx::PgConnection;
use tracing::instrument;

pub struct Settings<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Settings<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Load settings, filling keys that were never written with defaults.
    /// Unknown keys in the table are ignored.
    #[instrument(skip(self), err)]
    pub async fn load(&mut self) -> Result<SystemSettings> {
        let rows: Vec<(String, Value)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(&mut *self.db)
            .await?;

        let mut merged = match serde_json::to_value(SystemSettings::default()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in rows {
            if merged.contains_key(&key) {
                merged.insert(key, value);
            }
        }

        serde_json::from_value(Value::Object(merged))
            .map_err(|e| DbError::Other(anyhow::anyhow!("stored settings are invalid: {e}")))
    }

    /// Upsert every setting.
    #[instrument(skip(self, settings), err)]
    pub async fn save(&mut self, settings: &SystemSettings) -> Result<()> {
        let Value::Object(map) =
            serde_json::to_value(settings).map_err(|e| DbError::Other(anyhow::anyhow!("failed to encode settings: {e}")))?
        else {
            return Err(DbError::Other(anyhow::anyhow!("settings did not encode to an object")));
        };

        for (key, value) in map {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                "#,
            )
            .bind(&key)
            .bind(&value)
            .execute(&mut *self.db)
            .await?;
        }

        Ok(())
    }
}
