//! Subprocess lifecycle against real `/bin/sh` services: handshake,
//! single-launch guarantee and failure handling.

mod common;

use common::*;

use serial_test::serial;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

async fn drain(stack: &TestStack) {
    let (notify, barrier) = oneshot::channel();
    stack.shutdown.begin(&stack.registry, notify).await;
    let _ = time::timeout(Duration::from_secs(5), barrier).await;
}

#[tokio::test]
#[serial]
async fn successful_handshake_sets_pid_and_confirmed_port() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Echo",
        "echo",
        "app",
        &["echo"],
        &handshake_script(24242),
    );

    let stack = TestStack::new(tree).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(notify)).await;
    time::timeout(Duration::from_secs(5), started)
        .await
        .expect("handshake completes within the deadline")
        .expect("start waiter notified");

    assert!(stack.supervisor.is_running(&installed.id).await);
    let service = stack
        .supervisor
        .meta_info(&installed.id)
        .await
        .expect("meta info available");
    assert!(service.pid.is_some(), "pid set after confirmed handshake");
    assert_eq!(
        service.port,
        Some(24242),
        "the port reported by the service overrides the suggestion"
    );
    assert_eq!(service.uri_local.as_deref(), Some("http://localhost:24242/"));

    drain(&stack).await;
    assert!(!stack.supervisor.is_running(&installed.id).await);
}

#[tokio::test]
#[serial]
async fn double_spawn_launches_exactly_one_subprocess() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Once",
        "once",
        "app",
        &[],
        &counting_handshake_script(24243),
    );

    let stack = TestStack::new(tree).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(tx1)).await;
    stack.supervisor.spawn(&installed.id, Some(tx2)).await;

    time::timeout(Duration::from_secs(5), rx1)
        .await
        .expect("first waiter notified in time")
        .expect("first waiter fires");
    time::timeout(Duration::from_secs(5), rx2)
        .await
        .expect("second waiter notified in time")
        .expect("second waiter fires");

    assert_eq!(launch_count(&src_dir), 1, "exactly one subprocess was created");

    // A spawn on a running instance is a no-op.
    stack.supervisor.spawn(&installed.id, None).await;
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launch_count(&src_dir), 1);

    drain(&stack).await;
}

#[tokio::test]
#[serial]
async fn malformed_handshake_kills_child_and_leaves_instance_starting() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Bad",
        "bad",
        "app",
        &[],
        "echo launched >> launches.log\nread line\necho not-json\nsleep 30\n",
    );

    let stack = TestStack::new(tree).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(notify)).await;

    // The queued waiter is neither fired nor failed.
    let waited = time::timeout(Duration::from_secs(2), started).await;
    assert!(waited.is_err(), "no callback invoked on a malformed handshake");

    assert!(
        !stack.supervisor.is_running(&installed.id).await,
        "pid never set"
    );

    // The instance stays Starting: further spawns only enqueue, no
    // new subprocess is launched.
    stack.supervisor.spawn(&installed.id, None).await;
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launch_count(&src_dir), 1, "no automatic retry");
}

#[tokio::test]
#[serial]
async fn handshake_deadline_fails_waiters_and_allows_a_fresh_spawn() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Mute",
        "mute",
        "app",
        &[],
        "echo launched >> launches.log\nread line\nsleep 30\n",
    );

    let mut config = tree.config();
    config.handshake_timeout_seconds = 1;

    let stack = TestStack::with_config(tree, Some(config)).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(notify)).await;

    let waited = time::timeout(Duration::from_secs(4), started)
        .await
        .expect("waiter resolves once the deadline passes");
    assert!(waited.is_err(), "deadline failure drops the queued waiters");

    // The starting episode ended, so a later spawn launches again.
    stack.supervisor.spawn(&installed.id, None).await;
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launch_count(&src_dir), 2, "fresh attempt after the deadline");

    drain(&stack).await;
}

#[tokio::test]
#[serial]
async fn crash_before_handshake_fails_waiters_and_allows_a_fresh_spawn() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Crash",
        "crash",
        "app",
        &[],
        "echo launched >> launches.log\nexit 1\n",
    );

    let stack = TestStack::new(tree).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(notify)).await;

    // The subprocess dies well before the handshake deadline; the
    // waiter must fail on its exit, not wedge until the deadline.
    let waited = time::timeout(Duration::from_secs(2), started)
        .await
        .expect("waiter resolves as soon as the subprocess dies");
    assert!(waited.is_err(), "a crashed launch drops the queued waiters");
    assert!(!stack.supervisor.is_running(&installed.id).await);

    // The starting episode ended, so a later spawn launches again.
    stack.supervisor.spawn(&installed.id, None).await;
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launch_count(&src_dir), 2, "fresh attempt after the crash");
}

#[tokio::test]
#[serial]
async fn exit_clears_pid() {
    let tree = LockerTree::new();
    let src_dir = tree.write_service_with_script(
        "Apps/Brief",
        "brief",
        "app",
        &[],
        "read line\necho '{\"port\": 24244}'\nsleep 0.2\n",
    );

    let stack = TestStack::new(tree).await;
    let installed = stack.installer.install(&src_dir).await.expect("install succeeds");

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn(&installed.id, Some(notify)).await;
    time::timeout(Duration::from_secs(5), started)
        .await
        .expect("handshake completes")
        .expect("waiter fires");
    assert!(stack.supervisor.is_running(&installed.id).await);

    time::sleep(Duration::from_secs(1)).await;
    assert!(
        !stack.supervisor.is_running(&installed.id).await,
        "exit cleared the pid"
    );
}

#[tokio::test]
#[serial]
async fn spawn_on_unknown_id_is_a_noop() {
    let stack = TestStack::new(LockerTree::new()).await;

    let (notify, started) = oneshot::channel();
    stack.supervisor.spawn("no-such-service", Some(notify)).await;

    let waited = time::timeout(Duration::from_millis(500), started)
        .await
        .expect("waiter dropped immediately");
    assert!(waited.is_err(), "unknown service never notifies");
    assert!(!stack.supervisor.is_installed("no-such-service").await);
}
