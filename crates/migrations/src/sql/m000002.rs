use indoc::indoc;

use super::SqliteMigration;

pub const M000002_MIGRATION: SqliteMigration = SqliteMigration {
    name: "m000002",
    is_breaking: false,
    stmts: &[indoc! {r#"
        create table if not exists _private_config (
            key text primary key,
            value text not null,
            updated_at integer not null
        );
    "#}],
};
