//! Execution lifecycle: synchronous runs, timeouts, cancellation, caller scoping.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::{
    AgentId, ArtifactIntake, ArtifactPackager, BuildOrchestrator, BuildOutcome, CallerId,
    ExcludeRules, ExecutionOrchestrator, ExecutionStatus, FsBlobStore, KilnError, Page,
    VersionId, VersionStatus,
};
use kiln_state::fakes::{MemoryBlobStore, MemoryExecutionStore, MemoryVersionStore};
use kiln_state::{BlobStore, ExecutionStore, NewAgentVersion, VersionStore};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    executions: Arc<MemoryExecutionStore>,
    blobs: Arc<MemoryBlobStore>,
    intake: ArtifactIntake,
    builds: BuildOrchestrator,
    runner: Arc<ExecutionOrchestrator>,
    _scratch: tempfile::TempDir,
}

fn harness(timeout: Duration) -> Harness {
    let versions = Arc::new(MemoryVersionStore::new());
    let executions = Arc::new(MemoryExecutionStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let scratch = tempfile::tempdir().expect("scratch");

    let intake = ArtifactIntake::new(versions.clone(), blobs.clone(), 1024 * 1024);
    let builds = BuildOrchestrator::new(
        versions.clone(),
        blobs.clone(),
        scratch.path(),
        Duration::from_secs(10),
    );
    let runner = Arc::new(ExecutionOrchestrator::new(
        versions,
        executions.clone(),
        blobs.clone(),
        scratch.path(),
        timeout,
    ));
    Harness {
        executions,
        blobs,
        intake,
        builds,
        runner,
        _scratch: scratch,
    }
}

fn archive_with(module: &str) -> Vec<u8> {
    let src = tempfile::tempdir().expect("src");
    fs::write(
        src.path().join("kiln.toml"),
        "name = \"agent\"\nentrypoint = \"main:handler\"\n",
    )
    .expect("descriptor");
    fs::write(src.path().join("main.rhai"), module).expect("module");
    let out = tempfile::tempdir().expect("out");
    let summary = ArtifactPackager::new(ExcludeRules::empty())
        .package_project(src.path(), out.path())
        .expect("package");
    fs::read(summary.archive_path).expect("read")
}

/// Upload and build `module` as a new version of `agent`.
async fn deploy(h: &Harness, agent: AgentId, module: &str) -> VersionId {
    let version = h
        .intake
        .accept_upload(agent, "agent.tar.gz", &archive_with(module))
        .await
        .expect("upload");
    let outcome = h.builds.process_build(version.id).await.expect("build");
    assert!(matches!(outcome, BuildOutcome::Ready { .. }), "{outcome:?}");
    version.id
}

fn alice() -> CallerId {
    CallerId::new("alice")
}

// ---------------------------------------------------------------------------
// Synchronous execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn object_result_is_stored_as_output() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(input) { #{ echoed: input.msg, n: 2 } }").await;

    let exec = h
        .runner
        .execute(AgentId(1), json!({"msg": "hi"}), &alice())
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.output_data, Some(json!({"echoed": "hi", "n": 2})));
    assert_eq!(exec.error_message, None);
    assert_eq!(exec.input_data, json!({"msg": "hi"}));
    assert!(exec
        .logs
        .unwrap()
        .ends_with(&format!("Execution {} completed successfully", exec.id)));
}

#[tokio::test]
async fn scalar_result_is_wrapped() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(input) { return 5; }").await;

    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(exec.output_data, Some(json!({"result": 5})));
}

#[tokio::test]
async fn printed_lines_precede_status_line() {
    let h = harness(Duration::from_secs(10));
    deploy(
        &h,
        AgentId(1),
        "print(\"loading\");\nfn handler(input) { print(\"handling\"); 1 }",
    )
    .await;

    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    let logs = exec.logs.unwrap();
    let lines: Vec<&str> = logs.lines().collect();
    assert_eq!(lines[..2], ["loading", "handling"]);
    assert_eq!(lines.len(), 3);
}

#[tokio::test]
async fn script_error_marks_execution_failed() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(input) { throw \"boom\"; }").await;

    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error_message.as_deref().unwrap().contains("boom"));
    assert!(exec.output_data.is_none());
    assert!(exec.logs.unwrap().contains("Execution error:"));
}

#[tokio::test]
async fn runaway_handler_times_out() {
    let h = harness(Duration::from_millis(200));
    deploy(&h, AgentId(1), "fn handler(input) { let x = 0; loop { x += 1; } }").await;

    let started = Instant::now();
    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.error_message.as_deref(),
        Some("Execution timeout: exceeded 200 ms")
    );
    assert!(exec
        .logs
        .unwrap()
        .contains("Execution exceeded timeout limit of 200 ms"));
}

#[tokio::test]
async fn agent_without_ready_version_is_rejected() {
    let h = harness(Duration::from_secs(10));
    let err = h
        .runner
        .execute(AgentId(9), json!({}), &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::NoReadyVersion(AgentId(9))));
    assert!(h
        .executions
        .list_executions(&alice(), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missing_archive_fails_execution() {
    let h = harness(Duration::from_secs(10));
    let version = h
        .intake
        .accept_upload(AgentId(1), "agent.tar.gz", &archive_with("fn handler(i) { i }"))
        .await
        .unwrap();
    h.builds.process_build(version.id).await.unwrap();
    h.blobs.delete(&version.archive_path).await.unwrap();

    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.error_message,
        Some(format!("Archive not found: {}", version.archive_path))
    );
}

#[tokio::test]
async fn unreadable_archive_path_fails_execution() {
    let versions = Arc::new(MemoryVersionStore::new());
    let executions = Arc::new(MemoryExecutionStore::new());
    let storage = tempfile::tempdir().unwrap();
    let blobs = Arc::new(FsBlobStore::new(storage.path().join("blobs")).unwrap());

    let mut version = versions
        .create_version(NewAgentVersion {
            agent_id: AgentId(1),
            version: "v1".into(),
            archive_path: "../outside.tar.gz".into(),
            archive_digest: None,
        })
        .await
        .unwrap();
    let prior = version.advance(VersionStatus::Building, "building").unwrap();
    versions.update_version(&version, prior).await.unwrap();
    version.entrypoint = Some("main:handler".into());
    let prior = version.advance(VersionStatus::Ready, "ready").unwrap();
    versions.update_version(&version, prior).await.unwrap();

    let runner = ExecutionOrchestrator::new(
        versions,
        executions.clone(),
        blobs,
        storage.path().join("scratch"),
        Duration::from_secs(10),
    );
    let exec = runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.error_message.as_deref(),
        Some("Archive not found: ../outside.tar.gz")
    );

    let stored = executions.list_executions(&alice(), None).await.unwrap();
    let statuses: Vec<_> = stored.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![ExecutionStatus::Failed]);
}

// ---------------------------------------------------------------------------
// Version selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn latest_ready_version_is_selected() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(i) { \"old\" }").await;
    let newest = deploy(&h, AgentId(1), "fn handler(i) { \"new\" }").await;
    // a failed upload after the newest ready one is ignored
    let broken = h
        .intake
        .accept_upload(AgentId(1), "agent.tar.gz", &archive_with("fn other(i) { i }"))
        .await
        .unwrap();
    h.builds.process_build(broken.id).await.unwrap();

    let exec = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(exec.agent_version_id, newest);
    assert_eq!(exec.output_data, Some(json!({"result": "new"})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_are_independent() {
    let h = harness(Duration::from_secs(10));
    let version = deploy(&h, AgentId(1), "fn handler(input) { input.n * 2 }").await;

    let mut handles = Vec::new();
    for n in 0..4 {
        let runner = Arc::clone(&h.runner);
        handles.push(tokio::spawn(async move {
            runner
                .execute(AgentId(1), json!({ "n": n }), &CallerId::new("alice"))
                .await
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        let exec = handle.await.unwrap().unwrap();
        assert_eq!(exec.agent_version_id, version);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        outputs.push(exec.output_data.unwrap()["result"].as_i64().unwrap());
    }
    outputs.sort_unstable();
    assert_eq!(outputs, vec![0, 2, 4, 6]);
}

// ---------------------------------------------------------------------------
// Pending executions and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_execution_runs_once() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(i) { 7 }").await;

    let pending = h.runner.create_pending(AgentId(1), json!({}), &alice()).await.unwrap();
    assert_eq!(pending.status, ExecutionStatus::Pending);

    let done = h.runner.run_pending(pending.id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.output_data, Some(json!({"result": 7})));

    let again = h.runner.run_pending(pending.id).await.unwrap();
    assert_eq!(again, done);
}

#[tokio::test]
async fn cancelled_pending_execution_never_runs() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(i) { 7 }").await;
    let pending = h.runner.create_pending(AgentId(1), json!({}), &alice()).await.unwrap();

    let cancelled = h.runner.cancel(pending.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let after = h.runner.run_pending(pending.id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
    assert!(after.output_data.is_none());
}

#[tokio::test]
async fn cancel_is_idempotent_and_leaves_terminal_records_alone() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(i) { 7 }").await;

    let pending = h.runner.create_pending(AgentId(1), json!({}), &alice()).await.unwrap();
    let first = h.runner.cancel(pending.id).await.unwrap();
    let second = h.runner.cancel(pending.id).await.unwrap();
    assert_eq!(first, second);

    let done = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    let untouched = h.runner.cancel(done.id).await.unwrap();
    assert_eq!(untouched.status, ExecutionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_run_discards_late_result() {
    let h = harness(Duration::from_secs(10));
    deploy(
        &h,
        AgentId(1),
        "fn handler(i) { let x = 0; while x < 2000000 { x += 1; } x }",
    )
    .await;
    let pending = h.runner.create_pending(AgentId(1), json!({}), &alice()).await.unwrap();

    let runner = Arc::clone(&h.runner);
    let id = pending.id;
    let run = tokio::spawn(async move { runner.run_pending(id).await });

    // wait until the worker has claimed the execution
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = h.executions.get_execution(id).await.unwrap();
        if current.status != ExecutionStatus::Pending || Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancelled = h.runner.cancel(id).await.unwrap();
    let finished = run.await.unwrap().unwrap();
    if cancelled.status == ExecutionStatus::Cancelled {
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert!(finished.output_data.is_none());
    } else {
        // the run completed before the cancel landed
        assert_eq!(cancelled.status, ExecutionStatus::Completed);
    }
    assert_eq!(h.executions.get_execution(id).await.unwrap(), finished);
}

// ---------------------------------------------------------------------------
// Caller scoping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn executions_are_scoped_to_their_caller() {
    let h = harness(Duration::from_secs(10));
    let version = deploy(&h, AgentId(1), "fn handler(i) { 1 }").await;
    let mine = h.runner.execute(AgentId(1), json!({}), &alice()).await.unwrap();
    h.runner
        .execute(AgentId(1), json!({}), &CallerId::new("bob"))
        .await
        .unwrap();

    assert_eq!(h.runner.get_execution(mine.id, &alice()).await.unwrap(), mine);
    let err = h
        .runner
        .get_execution(mine.id, &CallerId::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::NotFound { kind: "execution", .. }));

    let listed = h.runner.list_executions(&alice(), Some(version), Page::default()).await.unwrap();
    assert_eq!(listed, vec![mine]);
    assert!(h
        .runner
        .list_executions(&alice(), Some(VersionId(999)), Page::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn listing_is_windowed_in_id_order() {
    let h = harness(Duration::from_secs(10));
    deploy(&h, AgentId(1), "fn handler(i) { 1 }").await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.runner.create_pending(AgentId(1), json!({}), &alice()).await.unwrap().id);
    }

    let page = h
        .runner
        .list_executions(&alice(), None, Page { skip: 1, limit: 2 })
        .await
        .unwrap();
    let got: Vec<_> = page.iter().map(|e| e.id).collect();
    assert_eq!(got, ids[1..3]);

    let tail = h
        .runner
        .list_executions(&alice(), None, Page { skip: 4, limit: 10 })
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(
        h.runner.list_executions(&alice(), None, Page::default()).await.unwrap().len(),
        5
    );
}
