pub mod add_job;
pub mod config;
pub mod dead_letter;
pub mod get_job;
pub mod list_jobs;
pub mod record_outcome;
pub mod recover;
