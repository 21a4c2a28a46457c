use std::time::Duration;

use queuectl::{ConfigKey, JobSpec, JobState, QueueError, RetryDecision};

mod helpers;

#[tokio::test]
async fn it_should_unlock_jobs_of_the_given_workers() {
    helpers::with_test_db(|test_db| async move {
        let utils = test_db.worker_utils();
        for id in ["a", "b", "c"] {
            test_db
                .add_job("true", JobSpec::builder().id(id).build())
                .await;
        }
        for worker_id in ["gone-1", "gone-2", "alive"] {
            utils
                .claim_next(worker_id)
                .await
                .expect("Failed to claim")
                .expect("Expected a job");
        }

        let unlocked = utils
            .force_unlock_workers(&["gone-1", "gone-2", "unknown"])
            .await
            .expect("Failed to unlock");
        assert_eq!(unlocked, 2);

        let a = test_db.get_job("a").await;
        assert_eq!(*a.state(), JobState::Pending);
        assert_eq!(*a.claimed_by(), None);
        assert_eq!(*a.locked_at(), None);
        assert_eq!(*a.lock_expires_at(), None);
        // Attempts already made are kept
        assert_eq!(*a.attempts(), 1);
        assert_eq!(*test_db.get_job("b").await.state(), JobState::Pending);

        let c = test_db.get_job("c").await;
        assert_eq!(*c.state(), JobState::Processing);
        assert_eq!(c.claimed_by().as_deref(), Some("alive"));

        // The former owner can no longer record an outcome
        let err = utils
            .record_outcome("a", "gone-1", &RetryDecision::Complete)
            .await
            .expect_err("Stale claim must be rejected");
        assert!(matches!(err, QueueError::StaleClaim { .. }));
    })
    .await;
}

#[tokio::test]
async fn it_should_recover_stale_claims_only() {
    helpers::with_test_db(|test_db| async move {
        let utils = test_db.worker_utils();
        test_db
            .add_job("true", JobSpec::builder().id("stale").timeout(10).build())
            .await;
        test_db
            .add_job("true", JobSpec::builder().id("fresh").build())
            .await;
        utils.claim_next("w1").await.expect("Failed to claim");
        utils.claim_next("w2").await.expect("Failed to claim");

        test_db.age_claim("stale", Duration::from_secs(60)).await;

        let recovered = utils
            .recover_stale_jobs(Duration::from_secs(5))
            .await
            .expect("Failed to recover");
        assert_eq!(recovered, 1);

        assert_eq!(*test_db.get_job("stale").await.state(), JobState::Pending);
        assert_eq!(*test_db.get_job("fresh").await.state(), JobState::Processing);
    })
    .await;
}

#[tokio::test]
async fn it_should_judge_claims_by_the_timeout_in_force_when_claimed() {
    helpers::with_test_db(|test_db| async move {
        let utils = test_db.worker_utils();
        utils
            .set_config(ConfigKey::JobTimeout, "600")
            .await
            .expect("Failed to set job_timeout");
        test_db
            .add_job("sleep 600", JobSpec::builder().id("long").build())
            .await;
        let job = utils
            .claim_next("pool-a")
            .await
            .expect("Failed to claim")
            .expect("Expected a job");
        let locked_at = job.locked_at().expect("Claim must have a lock time");
        let expires_at = job
            .lock_expires_at()
            .expect("Claim must have an expiry");
        assert_eq!(expires_at - locked_at, chrono::Duration::seconds(600));

        // The timeout is lowered while the job still runs under the old one
        utils
            .set_config(ConfigKey::JobTimeout, "10")
            .await
            .expect("Failed to set job_timeout");
        test_db.age_claim("long", Duration::from_secs(80)).await;

        let recovered = utils
            .recover_stale_jobs(Duration::from_secs(60))
            .await
            .expect("Failed to recover");
        assert_eq!(recovered, 0);
        let long = test_db.get_job("long").await;
        assert_eq!(*long.state(), JobState::Processing);
        assert_eq!(long.claimed_by().as_deref(), Some("pool-a"));

        // Claims taken under the new timeout expire with it
        test_db
            .add_job("true", JobSpec::builder().id("short").build())
            .await;
        utils
            .claim_next("pool-b")
            .await
            .expect("Failed to claim")
            .expect("Expected a job");
        test_db.age_claim("short", Duration::from_secs(80)).await;

        let recovered = utils
            .recover_stale_jobs(Duration::from_secs(60))
            .await
            .expect("Failed to recover");
        assert_eq!(recovered, 1);
        assert_eq!(*test_db.get_job("short").await.state(), JobState::Pending);
        assert_eq!(*test_db.get_job("long").await.state(), JobState::Processing);
    })
    .await;
}
