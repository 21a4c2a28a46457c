#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use queuectl::{
    connect_sqlite, DbJob, ExecutionEvent, Job, JobSpec, LogSink, MetricsSink, OutputStream,
    WorkerOptions, WorkerUtils,
};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub test_pool: SqlitePool,
    pub path: PathBuf,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            tokio::fs::remove_file(&file).await.ok();
        }
    }

    pub fn create_worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .sqlite_pool(self.test_pool.clone())
            .concurrency(2)
            .poll_interval(Duration::from_millis(50))
            .listen_os_shutdown_signals(false)
    }

    pub fn worker_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.test_pool.clone())
    }

    pub async fn add_job(&self, command: &str, spec: JobSpec) -> Job {
        self.worker_utils()
            .add_job(command, spec)
            .await
            .expect("Failed to add job")
    }

    pub async fn get_jobs(&self) -> Vec<DbJob> {
        sqlx::query_as("select * from _private_jobs order by seq asc")
            .fetch_all(&self.test_pool)
            .await
            .expect("Failed to get jobs")
    }

    pub async fn get_job(&self, id: &str) -> DbJob {
        sqlx::query_as("select * from _private_jobs where id = ?1")
            .bind(id)
            .fetch_one(&self.test_pool)
            .await
            .expect("Failed to get job")
    }

    /// Moves the claim of `id` back in time, as if it had been taken `by` earlier.
    pub async fn age_claim(&self, id: &str, by: Duration) {
        sqlx::query(
            r#"
                update _private_jobs
                    set locked_at = locked_at - ?2,
                        lock_expires_at = lock_expires_at - ?2
                    where id = ?1
            "#,
        )
        .bind(id)
        .bind(by.as_millis() as i64)
        .execute(&self.test_pool)
        .await
        .expect("Failed to age the claim");
    }

    /// Makes every pending or failed job eligible immediately.
    pub async fn make_jobs_run_now(&self) {
        sqlx::query(
            r#"
                update _private_jobs
                    set run_at = ?1
                    where state in ('pending', 'failed')
            "#,
        )
        .bind(chrono::Utc::now().timestamp_millis() - 1)
        .execute(&self.test_pool)
        .await
        .expect("Failed to update jobs");
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_id = uuid::Uuid::now_v7();
    let path = std::env::temp_dir().join(format!("__test_queuectl_{}.db", db_id.simple()));

    let test_pool = connect_sqlite(path.to_str().expect("Temp dir is not UTF-8"), 4)
        .await
        .expect("Failed to open test database");

    let test_db = TestDatabase { test_pool, path };
    test_db
        .worker_utils()
        .migrate()
        .await
        .expect("Failed to migrate test database");
    test_db
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

/// Collects job output in memory.
#[derive(Clone, Default)]
pub struct MemoryLogSink {
    pub chunks: Arc<Mutex<Vec<(String, u32, OutputStream, Vec<u8>)>>>,
}

impl MemoryLogSink {
    /// Everything written to `stream` for `job_id`, all attempts concatenated.
    pub async fn output(&self, job_id: &str, stream: OutputStream) -> String {
        let chunks = self.chunks.lock().await;
        let bytes: Vec<u8> = chunks
            .iter()
            .filter(|(id, _, s, _)| id == job_id && *s == stream)
            .flat_map(|(_, _, _, bytes)| bytes.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(
        &self,
        job_id: &str,
        attempt: u32,
        stream: OutputStream,
        bytes: &[u8],
    ) -> io::Result<()> {
        self.chunks
            .lock()
            .await
            .push((job_id.to_string(), attempt, stream, bytes.to_vec()));
        Ok(())
    }
}

/// Collects execution events in memory.
#[derive(Clone, Default)]
pub struct MemoryMetricsSink {
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl MemoryMetricsSink {
    pub async fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn emit(&self, event: &ExecutionEvent) {
        self.events.lock().await.push(event.clone());
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
