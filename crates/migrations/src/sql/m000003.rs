use indoc::indoc;

use super::SqliteMigration;

pub const M000003_MIGRATION: SqliteMigration = SqliteMigration {
    name: "m000003",
    is_breaking: false,
    stmts: &[
        // Deadline of the current claim, fixed by the claiming worker's timeout
        indoc! {r#"
            alter table _private_jobs add column lock_expires_at integer;
        "#},
        // Claims taken before the column existed fall back to the stock 60s timeout
        indoc! {r#"
            update _private_jobs
                set lock_expires_at = locked_at + coalesce(timeout_secs, 60) * 1000
                where state = 'processing'
                and lock_expires_at is null;
        "#},
    ],
};
