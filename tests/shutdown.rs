use std::time::Duration;

use queuectl::{JobSpec, JobState, RunningWorker};

mod helpers;

async fn wait_until_busy(running: &RunningWorker, busy: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = running.status().await.expect("Failed to get status");
            if status.busy_workers >= busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Workers never picked up the jobs");
}

#[tokio::test]
async fn it_should_report_running_loops() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .concurrency(3)
            .init()
            .await
            .expect("Failed to create worker");

        let status = worker.status().await.expect("Failed to get status");
        assert_eq!(status.active_workers, 0);
        assert_eq!(status.busy_workers, 0);

        let running = worker.start().await.expect("Failed to start worker");
        let status = running.status().await.expect("Failed to get status");
        assert_eq!(status.active_workers, 3);
        assert_eq!(status.counts.total(), 0);

        running.stop().await.expect("Failed to stop worker");

        let status = worker.status().await.expect("Failed to get status");
        assert_eq!(status.active_workers, 0);
        assert_eq!(status.busy_workers, 0);
    })
    .await;
}

#[tokio::test]
async fn it_should_let_in_flight_jobs_finish_on_stop() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .concurrency(2)
            .init()
            .await
            .expect("Failed to create worker");

        test_db
            .add_job("sleep 1", JobSpec::builder().id("slow-1").build())
            .await;
        test_db
            .add_job("sleep 1", JobSpec::builder().id("slow-2").build())
            .await;

        let running = worker.start().await.expect("Failed to start worker");
        wait_until_busy(&running, 2).await;

        let status = running.status().await.expect("Failed to get status");
        assert_eq!(status.counts.processing(), 2);

        // Enqueued after the stop request, must stay pending
        running.request_stop();
        assert!(running.is_stopping());
        test_db
            .add_job("true", JobSpec::builder().id("late").build())
            .await;

        running.wait().await.expect("Failed to stop worker");

        assert_eq!(*test_db.get_job("slow-1").await.state(), JobState::Completed);
        assert_eq!(*test_db.get_job("slow-2").await.state(), JobState::Completed);
        let late = test_db.get_job("late").await;
        assert_eq!(*late.state(), JobState::Pending);
        assert_eq!(*late.attempts(), 0);

        let status = worker.status().await.expect("Failed to get status");
        assert_eq!(status.active_workers, 0);
        assert_eq!(status.counts.processing(), 0);
    })
    .await;
}

#[tokio::test]
async fn it_should_stop_running_worker_on_request_shutdown() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");
        test_db
            .add_job("true", JobSpec::builder().id("a").build())
            .await;

        let (result, _) = tokio::join!(worker.run(), async {
            tokio::time::timeout(Duration::from_secs(10), async {
                while *test_db.get_job("a").await.state() != JobState::Completed {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("Job was never completed");
            worker.request_shutdown();
        });

        result.expect("Worker run failed");
    })
    .await;
}

#[tokio::test]
async fn it_should_recover_jobs_orphaned_by_a_crashed_worker() {
    helpers::with_test_db(|test_db| async move {
        let utils = test_db.worker_utils();
        test_db
            .add_job("true", JobSpec::builder().id("orphan").timeout(5).build())
            .await;
        utils
            .claim_next("crashed-worker")
            .await
            .expect("Failed to claim")
            .expect("Expected a job");

        // Claimed an hour ago, far beyond its 5 seconds timeout
        test_db
            .age_claim("orphan", Duration::from_secs(3600))
            .await;

        let worker = test_db
            .create_worker_options()
            .stale_claim_grace(Duration::from_secs(1))
            .init()
            .await
            .expect("Failed to create worker");
        let running = worker.start().await.expect("Failed to start worker");

        tokio::time::timeout(Duration::from_secs(10), async {
            while *test_db.get_job("orphan").await.state() != JobState::Completed {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("Orphaned job was never recovered");
        running.stop().await.expect("Failed to stop worker");

        let job = test_db.get_job("orphan").await;
        assert_eq!(*job.attempts(), 2);
        assert_eq!(*job.claimed_by(), None);
    })
    .await;
}
