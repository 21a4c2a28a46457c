use indoc::indoc;

use super::SqliteMigration;

pub const M000001_MIGRATION: SqliteMigration = SqliteMigration {
    name: "m000001",
    is_breaking: false,
    stmts: &[
        // Timestamps are unix milliseconds
        indoc! {r#"
            create table if not exists _private_jobs (
                seq integer primary key autoincrement,
                id text not null unique,
                command text not null check (length(command) > 0),
                state text not null default 'pending'
                    check (state in ('pending', 'processing', 'completed', 'failed', 'dead')),
                priority integer not null default 0,
                run_at integer not null,
                attempts integer not null default 0 check (attempts >= 0),
                max_retries integer check (max_retries is null or max_retries >= 0),
                timeout_secs integer check (timeout_secs is null or timeout_secs > 0),
                last_error text,
                created_at integer not null,
                updated_at integer not null,
                claimed_by text,
                locked_at integer,
                check ((state = 'processing') = (claimed_by is not null))
            );
        "#},
        // Serves the claim query: eligible states in dequeue order
        indoc! {r#"
            create index if not exists _private_jobs_dequeue_idx
                on _private_jobs (priority desc, run_at, created_at, seq)
                where state in ('pending', 'failed');
        "#},
        indoc! {r#"
            create index if not exists _private_jobs_state_idx
                on _private_jobs (state, priority desc, created_at, seq);
        "#},
        indoc! {r#"
            create index if not exists _private_jobs_claimed_by_idx
                on _private_jobs (claimed_by)
                where claimed_by is not null;
        "#},
    ],
};
