use gavel::validator::Denylist;
use gavel::{Config, Engine, EngineError, Rejection, Submission, VerdictKind};

use super::{docker_engine, fixture_source};

#[tokio::test]
#[ignore = "requires docker"]
async fn test_root_filesystem_is_read_only() {
    let engine = docker_engine().await;

    let verdict = engine
        .judge(&Submission::new("python", fixture_source("write_root.py")))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::RuntimeError);
    assert!(!verdict.result.stdout_lossy().contains("wrote"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_runs_as_unprivileged_user() {
    let engine = docker_engine().await;

    let source = "import os\nprint(os.getuid())";
    let verdict = engine
        .judge(&Submission::new("python", source))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::ExecutedSuccessfully);
    assert_ne!(verdict.result.stdout_lossy().trim(), "0");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_no_network() {
    // without the denylist only the container boundary stands in the way
    let mut config = Config::default();
    config.languages.get_mut("javascript").unwrap().denylist = Denylist::default();
    let engine = Engine::connect(&config).await.expect("Failed to build engine");

    let source = r#"
const net = require("net");
const socket = net.connect(53, "8.8.8.8", () => { console.log("connected"); process.exit(0); });
socket.on("error", () => { console.log("offline"); process.exit(0); });
"#;
    let verdict = engine
        .judge(&Submission::new("javascript", source).with_expected_output("offline"))
        .await
        .expect("Execution failed");

    assert_eq!(verdict.kind(), VerdictKind::Accepted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_denylist_applies_before_container() {
    let engine = docker_engine().await;

    let err = engine
        .judge(&Submission::new("javascript", "require('child_process').execSync('id')"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Rejected(Rejection::Denylisted { .. })));
    assert_eq!(engine.stats().unwrap().created, 0);
}
