use super::*;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, PartialEq)]
enum TestError {
    Transient,
    Fatal,
}

impl Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1))
}

#[test]
fn delay_doubles_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(350),
    };

    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    assert_eq!(policy.delay_for(30), Duration::from_millis(350));
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let calls = AtomicU32::new(0);

    let result = fast_policy(3)
        .run(
            "flaky",
            |e: &TestError| *e == TestError::Transient,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            },
        )
        .await;

    assert_eq!(result, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn attempts_are_bounded() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = fast_policy(3)
        .run(
            "always failing",
            |e: &TestError| *e == TestError::Transient,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            },
        )
        .await;

    assert_eq!(result, Err(TestError::Transient));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_errors_are_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<(), TestError> = fast_policy(5)
        .run(
            "fatal",
            |e: &TestError| *e == TestError::Transient,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            },
        )
        .await;

    assert_eq!(result, Err(TestError::Fatal));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn call_budget_cancels_slow_calls() {
    let budget = CallBudget::new(Duration::from_millis(20), Duration::from_secs(5));

    let result = budget.run(sleep(Duration::from_secs(5))).await;
    assert!(result.is_err(), "slow call should hit the per-call timeout");

    let result = budget.run(async { 7 }).await;
    assert_eq!(result.ok(), Some(7));
    assert!(!budget.query_expired());
}

#[tokio::test]
async fn query_deadline_caps_call_deadline() {
    let budget = CallBudget::new(Duration::from_secs(60), Duration::from_millis(10));
    sleep(Duration::from_millis(20)).await;

    assert!(budget.query_expired());
    assert!(budget.run(sleep(Duration::from_secs(1))).await.is_err());
}
