use sqlx::{Sqlite, Transaction};

pub mod m000001;
pub mod m000002;
pub mod m000003;

pub struct SqliteMigration {
    name: &'static str,
    is_breaking: bool,
    pub(crate) stmts: &'static [&'static str],
}

impl SqliteMigration {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_breaking(&self) -> bool {
        self.is_breaking
    }

    /// Number encoded in the migration name (`m000002` is 2).
    pub fn migration_number(&self) -> u32 {
        self.name
            .trim_start_matches('m')
            .parse()
            .unwrap_or_default()
    }

    pub async fn execute(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<(), sqlx::Error> {
        for stmt in self.stmts {
            sqlx::query(stmt).execute(&mut **tx).await?;
        }

        Ok(())
    }
}

pub const QUEUECTL_MIGRATIONS: &[SqliteMigration] = &[
    m000001::M000001_MIGRATION,
    m000002::M000002_MIGRATION,
    m000003::M000003_MIGRATION,
];
