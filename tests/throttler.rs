use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;

use throttler::middleware::BoxError;
use throttler::{
    Batch, FailurePolicy, Job, LimiterIdentity, MemoryStore, Outcome, Quota, QuotaRegistry, RateLimiter,
    Scheduler, Scope, Throttler, ThrottlerError, Verdict,
};

#[derive(Default)]
struct RecordingScheduler {
    scheduled: Mutex<Vec<(Duration, Job)>>,
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn perform_in(&self, delay: Duration, job: Job, _batch: Option<Batch>) -> Result<(), BoxError> {
        self.scheduled.lock().push((delay, job));
        Ok(())
    }
}

fn mailer() -> LimiterIdentity {
    LimiterIdentity::new("MailerWorker", vec![json!("welcome")], "mail")
}

#[tokio::test(start_paused = true)]
async fn test_three_per_minute_scenario() {
    let store = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(store.clone());
    let quota = Quota::new(3, Duration::from_secs(60)).unwrap();

    for expected in 1..=3 {
        assert_eq!(
            limiter.check(&mailer(), &quota).await.unwrap(),
            Verdict::WithinBounds { count: expected }
        );
        tokio::time::advance(Duration::from_secs(5)).await;
    }

    // 15s have passed since call 1
    match limiter.check(&mailer(), &quota).await.unwrap() {
        Verdict::Exceeded { count, delay } => {
            assert_eq!(count, 4);
            assert_eq!(delay, Duration::from_secs(45));
        }
        other => panic!("expected exceeded, got {:?}", other),
    }

    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(
        limiter.check(&mailer(), &quota).await.unwrap(),
        Verdict::WithinBounds { count: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_delay_always_within_period() {
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
    let period = Duration::from_secs(10);
    let quota = Quota::new(2, period).unwrap();

    for _ in 0..40 {
        if let Some(delay) = limiter.check(&mailer(), &quota).await.unwrap().delay() {
            assert!(delay > Duration::ZERO);
            assert!(delay <= period);
        }
        tokio::time::advance(Duration::from_millis(700)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_checks_admit_exactly_limit() {
    const CALLS: u64 = 64;
    const LIMIT: u64 = 10;

    let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
    let quota = Arc::new(Quota::new(LIMIT, Duration::from_secs(60)).unwrap());

    let tasks = (0..CALLS).map(|_| {
        let limiter = limiter.clone();
        let quota = quota.clone();
        tokio::spawn(async move { limiter.check(&mailer(), &quota).await.unwrap() })
    });

    let verdicts: Vec<Verdict> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let within = verdicts.iter().filter(|v| v.is_within_bounds()).count() as u64;
    assert_eq!(within, LIMIT);
    assert_eq!(verdicts.len() as u64 - within, CALLS - LIMIT);

    let mut counts: Vec<u64> = verdicts.iter().map(|v| v.count()).collect();
    counts.sort_unstable();
    assert_eq!(counts, (1..=CALLS).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_worker_scope_shares_counter_across_args() {
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
    let quota = Quota::new(1, Duration::from_secs(60)).unwrap().per(Scope::Worker);

    let a = LimiterIdentity::new("W", vec![json!(1)], "default");
    let b = LimiterIdentity::new("W", vec![json!(2)], "default");

    assert!(limiter.check(&a, &quota).await.unwrap().is_within_bounds());
    assert!(!limiter.check(&b, &quota).await.unwrap().is_within_bounds());
}

#[tokio::test]
async fn test_queue_scope_splits_by_queue_only() {
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
    let quota = Quota::new(1, Duration::from_secs(60)).unwrap().per(Scope::Queue);

    let mail = LimiterIdentity::new("W", vec![json!(1)], "mail");
    let mail_other_args = LimiterIdentity::new("W", vec![json!(2)], "mail");
    let bulk = LimiterIdentity::new("W", vec![json!(1)], "bulk");

    assert!(limiter.check(&mail, &quota).await.unwrap().is_within_bounds());
    assert!(!limiter.check(&mail_other_args, &quota).await.unwrap().is_within_bounds());
    assert!(limiter.check(&bulk, &quota).await.unwrap().is_within_bounds());
}

#[tokio::test]
async fn test_argument_scope_has_independent_counters() {
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
    let quota = Quota::new(1, Duration::from_secs(60)).unwrap().per(Scope::Arguments);

    let a = LimiterIdentity::new("W", vec![json!(1)], "default");
    let b = LimiterIdentity::new("W", vec![json!(2)], "default");

    assert!(limiter.check(&a, &quota).await.unwrap().is_within_bounds());
    assert!(limiter.check(&b, &quota).await.unwrap().is_within_bounds());
}

#[tokio::test(start_paused = true)]
async fn test_deferred_job_is_decided_again_on_retry() {
    let yaml = r#"
workers:
  MailerWorker:
    limit: 1
    period: 30
    per: queue
"#;
    let scheduler = Arc::new(RecordingScheduler::default());
    let throttler = Throttler::new(
        RateLimiter::new(Arc::new(MemoryStore::new())),
        QuotaRegistry::from_yaml(yaml).unwrap(),
        FailurePolicy::Open,
        scheduler.clone(),
    );

    let job = Job::new("MailerWorker", vec![json!(5)]);
    let first = throttler.call(&job, "mail", || async { Ok::<_, ThrottlerError>(()) }).await.unwrap();
    assert!(first.is_performed());

    // Still inside the window: deferred, then deferred again on the retry.
    let second = throttler.call(&job, "mail", || async { Ok::<_, ThrottlerError>(()) }).await.unwrap();
    assert!(matches!(second, Outcome::Deferred { .. }));

    let retry = scheduler.scheduled.lock()[0].1.clone();
    tokio::time::advance(Duration::from_secs(10)).await;
    let third = throttler.call(&retry, "mail", || async { Ok::<_, ThrottlerError>(()) }).await.unwrap();
    match third {
        Outcome::Deferred { delay, .. } => assert_eq!(delay, Duration::from_secs(20)),
        other => panic!("expected deferral, got {:?}", other),
    }

    // Once the window has passed the retry runs.
    let (delay, retry) = scheduler.scheduled.lock()[1].clone();
    tokio::time::advance(delay).await;
    let fourth = throttler.call(&retry, "mail", || async { Ok::<_, ThrottlerError>("done") }).await.unwrap();
    assert_eq!(fourth, Outcome::Performed("done"));

    // A different queue never shared the counter.
    let other_queue = throttler.call(&job, "bulk", || async { Ok::<_, ThrottlerError>("bulk") }).await.unwrap();
    assert_eq!(other_queue, Outcome::Performed("bulk"));
}
