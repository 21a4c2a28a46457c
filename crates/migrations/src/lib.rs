pub mod sql;

use chrono::Utc;
use indoc::indoc;
use sql::QUEUECTL_MIGRATIONS;
use sqlx::{query, query_as, FromRow, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Database is using queuectl schema revision {} which includes breaking migration {}, but this binary only supports up to revision {}. It would be unsafe to continue; please upgrade queuectl.", .latest_migration, .latest_breaking_migration, .highest_migration)]
    IncompatibleRevision {
        latest_migration: i64,
        latest_breaking_migration: i64,
        highest_migration: u32,
    },
    #[error("Error occured while migrate: {0}")]
    SqlError(#[from] sqlx::Error),
}

#[derive(FromRow, Default, Debug)]
pub struct LastMigration {
    id: Option<i64>,
    biggest_breaking_id: Option<i64>,
}

impl LastMigration {
    fn is_before_number(&self, migration_number: u32) -> bool {
        match self.id {
            Some(id) => i64::from(migration_number) > id,
            None => true,
        }
    }
}

/// Creates the bookkeeping table if needed and returns the last applied migration.
async fn get_last_migration(pool: &SqlitePool) -> Result<LastMigration, MigrateError> {
    query(indoc! {r#"
        create table if not exists migrations (
            id integer primary key,
            ts integer not null,
            breaking integer not null default 0
        );
    "#})
    .execute(pool)
    .await?;

    let last_migration = query_as::<_, LastMigration>(indoc! {r#"
        select
            (select max(id) from migrations) as id,
            (select max(id) from migrations where breaking = 1) as biggest_breaking_id;
    "#})
    .fetch_one(pool)
    .await?;

    Ok(last_migration)
}

/// Runs the pending migrations against the database, each one in its own transaction.
///
/// Every statement is idempotent, so two processes migrating the same file at once
/// both succeed.
#[tracing::instrument(skip_all, err)]
pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    let last_migration = get_last_migration(pool).await?;
    let latest_migration = last_migration.id;
    let latest_breaking_migration = last_migration.biggest_breaking_id;

    let mut highest_migration = 0;
    let mut migrated = false;
    for migration in QUEUECTL_MIGRATIONS.iter() {
        let migration_number = migration.migration_number();
        highest_migration = highest_migration.max(migration_number);

        if !last_migration.is_before_number(migration_number) {
            continue;
        }

        migrated = true;
        info!(
            migration_number,
            migration_name = migration.name(),
            is_breaking_migration = migration.is_breaking(),
            "Running migration {}",
            migration.name(),
        );
        let mut tx = pool.begin().await?;
        migration.execute(&mut tx).await?;
        query("insert or ignore into migrations (id, ts, breaking) values (?1, ?2, ?3)")
            .bind(i64::from(migration_number))
            .bind(Utc::now().timestamp_millis())
            .bind(migration.is_breaking())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    if migrated {
        info!("Migrations complete");
    }

    if let Some(latest_breaking_migration) = latest_breaking_migration {
        if i64::from(highest_migration) < latest_breaking_migration {
            return Err(MigrateError::IncompatibleRevision {
                latest_migration: latest_migration.unwrap_or(0),
                latest_breaking_migration,
                highest_migration,
            });
        }
    }

    if let Some(latest_migration) = latest_migration {
        if i64::from(highest_migration) < latest_migration {
            warn!(
                latest_migration,
                highest_migration,
                "Database is using queuectl schema revision {}, but this binary only supports up to revision {}. Attempting to continue regardless.",
                latest_migration,
                highest_migration,
            );
        }
    }

    Ok(())
}
