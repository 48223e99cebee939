use gavel::{Submission, TerminationReason, VerdictKind};

use super::{docker_engine, fixture_source};

#[tokio::test]
#[ignore = "requires docker"]
async fn test_python_hello_without_expected_output() {
    let engine = docker_engine().await;

    let verdict = engine
        .judge(&Submission::new("python", fixture_source("hello.py")))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::ExecutedSuccessfully);
    assert_eq!(verdict.result.stdout, b"hello\n");
    assert_eq!(verdict.termination(), TerminationReason::Normal);
    assert!(!verdict.is_insecure());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_python_stdin_accepted() {
    let engine = docker_engine().await;

    let submission = Submission::new("py", fixture_source("sum.py"))
        .with_stdin("3 4\n")
        .with_expected_output("7\n\n");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_python_wrong_answer() {
    let engine = docker_engine().await;

    let submission = Submission::new("python", fixture_source("sum.py"))
        .with_stdin("3 4\n")
        .with_expected_output("8");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::WrongAnswer);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_cpp_compile_and_run() {
    let engine = docker_engine().await;

    let submission = Submission::new("cpp", fixture_source("hello.cpp")).with_expected_output("Hello, World!");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
    // g++ sets a peak far above this; it must not be reported as the program's
    assert!(verdict.result.memory.is_none_or(|kb| kb < 16 * 1024));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_cpp_echo_stdin() {
    let engine = docker_engine().await;

    let input = "line one\nline two\n";
    let submission = Submission::new("c++", fixture_source("echo.cpp"))
        .with_stdin(input)
        .with_expected_output(input);
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
    assert_eq!(verdict.result.stdout_lossy(), input);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_cpp_compile_error() {
    let engine = docker_engine().await;

    let verdict = engine
        .judge(&Submission::new("cpp", fixture_source("compile_error.cpp")))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::CompileError);
    assert!(verdict.result.message.unwrap().contains("error"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_c_hello() {
    let engine = docker_engine().await;

    let submission = Submission::new("c", fixture_source("hello.c")).with_expected_output("Hello from C");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_java_file_named_after_public_class() {
    let engine = docker_engine().await;

    let submission = Submission::new("java", fixture_source("Main.java")).with_expected_output("Hello from Java");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_javascript_hello() {
    let engine = docker_engine().await;

    let submission = Submission::new("javascript", fixture_source("hello.js")).with_expected_output("hello");
    let verdict = engine.judge(&submission).await.expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_runtime_error() {
    let engine = docker_engine().await;

    let verdict = engine
        .judge(&Submission::new("python", fixture_source("divide_by_zero.py")))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::RuntimeError);
    assert!(verdict.result.stderr_lossy().contains("ZeroDivisionError"));
}
