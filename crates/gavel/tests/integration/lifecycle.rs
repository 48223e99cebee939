use gavel::{BatchSubmission, CancelToken, EngineError, Submission, TestCase, VerdictKind};

use super::{docker_engine, fixture_source};

#[tokio::test]
#[ignore = "requires docker"]
async fn test_every_attempt_is_released() {
    let engine = docker_engine().await;

    engine
        .judge(&Submission::new("python", fixture_source("hello.py")))
        .await
        .unwrap();
    engine
        .judge(&Submission::new("cpp", fixture_source("compile_error.cpp")))
        .await
        .unwrap();

    let stats = engine.stats().unwrap();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.destroyed, 2);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.cleanup_failures, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rejected_submission_allocates_nothing() {
    let engine = docker_engine().await;

    let err = engine
        .judge(&Submission::new("python", "import subprocess"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Rejected(_)));
    assert_eq!(engine.stats().unwrap().created, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_concurrent_submissions() {
    let engine = docker_engine().await;

    let submissions: Vec<_> = (0..4)
        .map(|i| {
            Submission::new("python", fixture_source("sum.py"))
                .with_stdin(format!("{i} {i}\n"))
                .with_expected_output((i * 2).to_string())
        })
        .collect();
    let verdicts = judge_concurrently(&engine, &submissions).await;

    for verdict in verdicts {
        assert_eq!(verdict.kind(), VerdictKind::Accepted);
    }
    assert_eq!(engine.stats().unwrap().live, 0);
}

async fn judge_concurrently(engine: &gavel::Engine, submissions: &[Submission]) -> Vec<gavel::Verdict> {
    let mut handles = Vec::new();
    for submission in submissions {
        let engine = engine.clone();
        let submission = submission.clone();
        handles.push(tokio::spawn(async move { engine.judge(&submission).await }));
    }
    let mut verdicts = Vec::new();
    for handle in handles {
        verdicts.push(handle.await.unwrap().expect("Execution failed"));
    }
    verdicts
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_judge_all() {
    let engine = docker_engine().await;

    let batch = BatchSubmission {
        language: "python".to_owned(),
        source: fixture_source("sum.py"),
        test_cases: vec![
            TestCase::new("1 2\n", "3"),
            TestCase::new("5 5\n", "10"),
            TestCase::new("2 2\n", "5"),
        ],
        limits: Default::default(),
    };
    let report = engine.judge_all(&batch, &CancelToken::new()).await.unwrap();

    assert_eq!(report.passed, 2);
    assert_eq!(report.status, VerdictKind::WrongAnswer);
    assert_eq!(engine.stats().unwrap().created, 3);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_cancellation() {
    let engine = docker_engine().await;
    let cancel = CancelToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };
    let err = engine
        .submit(&Submission::new("python", "while True:\n    pass\n"), &cancel)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(engine.stats().unwrap().live, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_readiness() {
    let engine = docker_engine().await;
    let readiness = engine.check_system_requirements().await;

    assert!(readiness.runtime_available);
    assert!(!readiness.insecure);
    assert_eq!(readiness.images.len(), 5);
}
