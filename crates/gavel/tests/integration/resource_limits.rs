use std::time::Instant;

use gavel::{Submission, TerminationReason, VerdictKind};

use super::{docker_engine, fixture_source};

#[tokio::test]
#[ignore = "requires docker"]
async fn test_infinite_loop_time_limit() {
    let engine = docker_engine().await;

    let submission = Submission::new("cpp", fixture_source("infinite_loop.cpp")).with_time_limit(2.0);
    let start = Instant::now();
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::TimeLimitExceeded);
    assert_eq!(verdict.termination(), TerminationReason::Timeout);
    assert!(verdict.result.wall_time >= 2.0);
    // compile time plus the run deadline, with generous slack for the daemon
    assert!(start.elapsed().as_secs_f64() < 30.0);

    let stats = engine.stats().unwrap();
    assert_eq!(stats.created, stats.destroyed);
    assert_eq!(stats.live, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_memory_limit_exceeded() {
    let engine = docker_engine().await;

    let submission = Submission::new("python", fixture_source("memory_hog.py")).with_memory_limit(64 * 1024);
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::MemoryLimitExceeded);
    assert_eq!(verdict.termination(), TerminationReason::KilledMemory);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_output_limit_exceeded() {
    let engine = docker_engine().await;

    let verdict = engine
        .judge(&Submission::new("python", fixture_source("flood.py")))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::OutputLimitExceeded);
    assert!(verdict.result.truncated);
    assert_eq!(verdict.result.stdout.len(), 64 * 1024);
}
