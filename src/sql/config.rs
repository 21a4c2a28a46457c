use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::{query_as, SqliteExecutor};

use crate::config::{ConfigKey, QueueConfig};
use crate::errors::Result;
use crate::utils::to_millis;

pub async fn load_config<'e>(executor: impl SqliteExecutor<'e>) -> Result<QueueConfig> {
    let rows: Vec<(String, String)> = query_as("select key, value from _private_config")
        .fetch_all(executor)
        .await?;

    QueueConfig::from_entries(rows)
}

pub async fn store_config_value<'e>(
    executor: impl SqliteExecutor<'e>,
    key: ConfigKey,
    value: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(indoc! {r#"
        insert into _private_config (key, value, updated_at)
            values (?1, ?2, ?3)
            on conflict (key) do update
                set value = excluded.value, updated_at = excluded.updated_at
    "#})
    .bind(key.as_str())
    .bind(value)
    .bind(to_millis(now))
    .execute(executor)
    .await?;

    Ok(())
}
