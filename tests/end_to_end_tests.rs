//! Full-path tests: mock queue over HTTP, policy, shim, and a real node child.
//!
//! Tests that execute JavaScript return early when `node` is not installed.


use std::time::Duration;

use jobgate::policy::RejectReason;
use jobgate::poll::{CycleOutcome, PollLoop, StopReason};
use jobgate::queue::{Job, JobId, QueueClient};
use jobgate::worker::{EnvironmentBuilder, RunOutcome, Supervisor};
use tempfile::TempDir;
use test_harness::{assert_eventually, runtime_available, test_config, MockQueue};
use tokio_util::sync::CancellationToken;

fn node_missing() -> bool {
    if runtime_available("node") {
        return false;
    }
    eprintln!("node not found, skipping");
    true
}

#[tokio::test]
async fn test_admitted_job_output_reaches_observer() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    queue.push_job(Job::new("42", "console.log('hi');"));
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");
    let client = QueueClient::new(&config.queue).unwrap();
    let mut poll_loop = PollLoop::new(&config, client);

    match poll_loop.step().await {
        CycleOutcome::Executed { id, result } => {
            assert_eq!(id, JobId::from("42"));
            assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);
        }
        other => panic!("expected Executed, got {:?}", other),
    }
    assert_eq!(
        poll_loop.state().last_processed_job_id,
        Some(JobId::from("42"))
    );

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages() == vec!["hi".to_string()] },
        Duration::from_secs(2),
        "observer did not receive the job's log line",
    )
    .await;
}

#[tokio::test]
async fn test_objects_are_logged_as_json() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");
    let request = EnvironmentBuilder::new(&config).compose("console.log('pos', {x: 1});");

    let result = Supervisor::new(config.sandbox.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages() == vec![r#"pos {"x":1}"#.to_string()] },
        Duration::from_secs(2),
        "structured log line not delivered",
    )
    .await;
}

#[tokio::test]
async fn test_shim_blocks_modules_the_policy_missed() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");

    // Composed directly, bypassing admission, to exercise the runtime gate.
    let source = "try { require('fs'); console.log('loaded'); } \
                  catch (e) { console.log('blocked'); }\n\
                  console.log(typeof process);\n\
                  console.log(typeof Buffer);";
    let request = EnvironmentBuilder::new(&config).compose(source);
    let result = Supervisor::new(config.sandbox.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages().len() == 3 },
        Duration::from_secs(2),
        "expected three log lines",
    )
    .await;
    let mut messages = queue.messages();
    messages.sort();
    assert_eq!(messages, vec!["blocked", "undefined", "undefined"]);
}

#[tokio::test]
async fn test_global_object_does_not_leak_capabilities() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");

    let source = "var g = (function () { return this; })();\n\
                  console.log(typeof g.process);\n\
                  console.log(typeof g.fetch);";
    let request = EnvironmentBuilder::new(&config).compose(source);
    let result = Supervisor::new(config.sandbox.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages().len() == 2 },
        Duration::from_secs(2),
        "expected two log lines",
    )
    .await;
    let mut messages = queue.messages();
    messages.sort();
    assert_eq!(messages, vec!["undefined", "undefined"]);
}

#[tokio::test]
async fn test_global_object_stays_locked() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");

    let source = "var g = (function () { return this; })();\n\
                  try { Object.defineProperty(g, 'process', { value: 1 }); console.log('redefined'); } \
                  catch (e) { console.log('locked'); }\n\
                  Error.prepareStackTrace = function () { return []; };\n\
                  console.log(typeof g.process);";
    let request = EnvironmentBuilder::new(&config).compose(source);
    let result = Supervisor::new(config.sandbox.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages().len() == 2 },
        Duration::from_secs(2),
        "expected two log lines",
    )
    .await;
    let mut messages = queue.messages();
    messages.sort();
    assert_eq!(messages, vec!["locked", "undefined"]);
}

#[tokio::test]
async fn test_whitelisted_module_keeps_runtime_globals() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    let dir = TempDir::new().unwrap();
    let module_dir = dir.path().join("node_modules").join("fake-board");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(
        module_dir.join("index.js"),
        "module.exports = { runtime: function () { return typeof process + ' ' + typeof Buffer; } };\n",
    )
    .unwrap();
    let mut config = test_config(&queue.base_url(), dir.path(), "node");
    config.policy.allowed_module = "fake-board".to_string();

    let source = "var board = require('fake-board');\n\
                  console.log(board.runtime());\n\
                  console.log(typeof process);";
    let request = EnvironmentBuilder::new(&config).compose(source);
    let result = Supervisor::new(config.sandbox.clone())
        .run(request)
        .await
        .unwrap();
    assert_eq!(result.outcome(), RunOutcome::Completed, "{:?}", result);

    let observer = &queue;
    assert_eventually(
        || async move { observer.messages().len() == 2 },
        Duration::from_secs(2),
        "expected two log lines",
    )
    .await;
    let mut messages = queue.messages();
    messages.sort();
    assert_eq!(messages, vec!["object function", "undefined"]);
}

#[tokio::test]
async fn test_endless_job_is_stopped_at_deadline() {
    if node_missing() {
        return;
    }
    let queue = MockQueue::start().await;
    queue.push_job(Job::new("loop", "setInterval(function () {}, 1000);"));
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&queue.base_url(), dir.path(), "node");
    config.sandbox.execution_timeout_ms = 1_000;
    let client = QueueClient::new(&config.queue).unwrap();
    let mut poll_loop = PollLoop::new(&config, client);

    let start = std::time::Instant::now();
    match poll_loop.step().await {
        CycleOutcome::Executed { result, .. } => {
            assert!(result.timed_out, "{:?}", result);
            assert_eq!(result.outcome(), RunOutcome::TimedOut);
        }
        other => panic!("expected Executed, got {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(!dir.path().join("submitted-job.js").exists());
}

#[tokio::test]
async fn test_rejected_job_never_runs() {
    let queue = MockQueue::start().await;
    queue.push_job(Job::new(
        "7",
        "var five = require('johnny-five');\nEEPROM.write(0, 1);\nconsole.log('wrote');",
    ));
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&queue.base_url(), dir.path(), "node");
    config.poll.max_iterations = 3;
    let client = QueueClient::new(&config.queue).unwrap();
    let mut poll_loop = PollLoop::new(&config, client);

    let summary = poll_loop.run(CancellationToken::new()).await;

    assert_eq!(summary.stopped_by, StopReason::MaxIterations);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.executed, 0);
    assert!(queue.messages().is_empty());
    assert!(!dir.path().join("submitted-job.js").exists());
    assert_eq!(
        queue.requests(),
        vec!["/latest", "/cue?lastid=7", "/cue?lastid=7"]
    );
}

#[tokio::test]
async fn test_job_importing_file_system_is_rejected() {
    let queue = MockQueue::start().await;
    queue.push_job(Job::new(
        "8",
        "var fs = require('fs');\nconsole.log(fs.readdirSync('/'));",
    ));
    let dir = TempDir::new().unwrap();
    let config = test_config(&queue.base_url(), dir.path(), "node");
    let client = QueueClient::new(&config.queue).unwrap();
    let mut poll_loop = PollLoop::new(&config, client);

    match poll_loop.step().await {
        CycleOutcome::Rejected { id, reasons } => {
            assert_eq!(id, JobId::from("8"));
            assert_eq!(reasons, vec![RejectReason::UnapprovedModuleImport]);
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert_eq!(poll_loop.state().last_processed_job_id, Some(JobId::from("8")));
    assert!(!dir.path().join("submitted-job.js").exists());
    assert!(queue.messages().is_empty());
}

#[tokio::test]
async fn test_queue_outage_does_not_stop_loop() {
    let queue = MockQueue::start().await;
    queue.fail_with(Some(axum::http::StatusCode::SERVICE_UNAVAILABLE));
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&queue.base_url(), dir.path(), "node");
    config.poll.max_iterations = 3;
    let client = QueueClient::new(&config.queue).unwrap();
    let mut poll_loop = PollLoop::new(&config, client);

    let summary = poll_loop.run(CancellationToken::new()).await;

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.fetch_failures, 3);
    assert!(!poll_loop.state().primed);
}
