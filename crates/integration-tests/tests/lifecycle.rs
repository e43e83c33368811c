// Slot lifecycle scenarios driven through the real supervisor loop

mod common;

use common::*;
use hostbay_core::application::{Command, OutboundKind};
use hostbay_core::domain::RestartPolicy;
use hostbay_core::port::sandbox::{ExitResult, OutputStream};
use std::time::Duration;

#[tokio::test]
async fn submit_reaches_running_and_streams_output() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "print('hi')")).await;
    wait_for_state(&mut sub, "RUNNING").await;
    assert_eq!(harness.sandbox.spawn_count(), 1);

    harness.sandbox.emit_output(1, OutputStream::Stdout, b"line-1\n");
    harness.sandbox.emit_output(1, OutputStream::Stdout, b"line-2\n");
    harness.sandbox.emit_output(1, OutputStream::Stderr, b"oops\n");

    // per-app ordering is preserved through the router
    let mut seen = vec![];
    while seen.len() < 3 {
        let event = next_event(&mut sub).await;
        if let OutboundKind::Output { stream, data } = event.kind {
            seen.push((stream, data));
        }
    }
    assert_eq!(seen[0], ("stdout".to_string(), "line-1\n".to_string()));
    assert_eq!(seen[1], ("stdout".to_string(), "line-2\n".to_string()));
    assert_eq!(seen[2], ("stderr".to_string(), "oops\n".to_string()));

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn clean_stop_never_restarts() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(
        &harness,
        "t1",
        Command::Stop {
            app: "bot".to_string(),
            owner: None,
        },
    )
    .await;

    wait_for_state(&mut sub, "STOPPING").await;
    wait_for_state(&mut sub, "EXITED").await;

    // give any (wrong) restart a chance to happen
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.sandbox.spawn_count(), 1);
    assert_eq!(harness.sandbox.alive_count(), 0);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn crash_restarts_with_growing_backoff() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    // crash three times in a row; each restart delay is announced in the
    // RESTARTING transition detail and must not shrink
    let mut delays = vec![];
    for incarnation in 1..=3u64 {
        harness.sandbox.complete(
            incarnation,
            ExitResult {
                code: Some(1),
                signal: None,
            },
        );
        let event = wait_for_state(&mut sub, "RESTARTING").await;
        if let OutboundKind::StateChanged {
            detail: Some(detail),
            ..
        } = event.kind
        {
            let ms: i64 = detail
                .trim_start_matches("restart in ")
                .trim_end_matches("ms")
                .parse()
                .expect("delay in detail");
            delays.push(ms);
        }
        wait_for_state(&mut sub, "RUNNING").await;
    }

    assert_eq!(delays, vec![40, 80, 160]);
    assert_eq!(harness.sandbox.spawn_count(), 4);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn never_policy_stays_down_after_crash() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(
        &harness,
        "t1",
        Command::Submit {
            app: Some("oneshot".to_string()),
            entry_point: None,
            source: "x".to_string(),
            policy: RestartPolicy::Never,
        },
    )
    .await;
    wait_for_state(&mut sub, "RUNNING").await;

    harness.sandbox.complete(
        1,
        ExitResult {
            code: Some(7),
            signal: None,
        },
    );
    let event = wait_for_state(&mut sub, "EXITED").await;
    if let OutboundKind::StateChanged { detail, .. } = event.kind {
        assert_eq!(detail.as_deref(), Some("code(7)"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.sandbox.spawn_count(), 1);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn spawn_failure_is_reported_and_final() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    harness.sandbox.fail_next_spawn();
    send(&harness, "t1", submit("broken", "x")).await;

    let event = wait_for_state(&mut sub, "EXITED").await;
    if let OutboundKind::StateChanged { detail, .. } = event.kind {
        assert_eq!(detail.as_deref(), Some("spawn-failed"));
    }
    let message = wait_for_error(&mut sub).await;
    assert!(message.contains("failed to start"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.sandbox.spawn_count(), 0);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn stuck_process_is_force_killed_after_grace_period() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("stubborn", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    // the process ignores the graceful terminate
    harness.sandbox.set_ignore_terminate(true);
    send(
        &harness,
        "t1",
        Command::Stop {
            app: "stubborn".to_string(),
            owner: None,
        },
    )
    .await;

    wait_for_state(&mut sub, "STOPPING").await;
    // grace period (150ms) elapses, the hard kill lands
    let event = wait_for_state(&mut sub, "EXITED").await;
    if let OutboundKind::StateChanged { detail, .. } = event.kind {
        assert_eq!(detail.as_deref(), Some("signal(9)"));
    }
    assert_eq!(harness.sandbox.alive_count(), 0);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn restart_command_replaces_the_slot() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(
        &harness,
        "t1",
        Command::Restart {
            app: "bot".to_string(),
            owner: None,
        },
    )
    .await;

    wait_for_state(&mut sub, "STOPPING").await;
    wait_for_state(&mut sub, "EXITED").await;
    wait_for_state(&mut sub, "RUNNING").await;
    assert_eq!(harness.sandbox.spawn_count(), 2);
    assert_eq!(harness.sandbox.alive_count(), 1);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn send_input_only_works_while_running() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(
        &harness,
        "t1",
        Command::SendInput {
            app: "bot".to_string(),
            input: "hello".to_string(),
        },
    )
    .await;

    // stop it, then input must be rejected
    send(
        &harness,
        "t1",
        Command::Stop {
            app: "bot".to_string(),
            owner: None,
        },
    )
    .await;
    wait_for_state(&mut sub, "EXITED").await;

    send(
        &harness,
        "t1",
        Command::SendInput {
            app: "bot".to_string(),
            input: "anyone there?".to_string(),
        },
    )
    .await;
    let message = wait_for_error(&mut sub).await;
    assert!(message.contains("not running"));

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn delete_terminates_and_forgets_the_app() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(
        &harness,
        "t1",
        Command::Delete {
            app: "bot".to_string(),
            owner: None,
        },
    )
    .await;
    wait_for_state(&mut sub, "TERMINATED").await;
    assert_eq!(harness.sandbox.alive_count(), 0);

    // the app is gone: listing is empty and a resubmit under the same
    // name is accepted
    send(&harness, "t1", Command::ListApps).await;
    loop {
        let event = next_event(&mut sub).await;
        if let OutboundKind::AppList { apps } = event.kind {
            assert!(apps.is_empty());
            break;
        }
    }

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn duplicate_app_name_is_rejected() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(&harness, "t1", submit("bot", "y")).await;
    let message = wait_for_error(&mut sub).await;
    assert!(message.contains("already exists"));
    assert_eq!(harness.sandbox.spawn_count(), 1);

    harness.shutdown.shutdown();
}

#[tokio::test]
async fn list_and_inspect_report_slot_state() {
    let harness = start(test_config());
    let mut sub = harness.router.subscribe("t1");

    send(&harness, "t1", submit("bot", "x")).await;
    wait_for_state(&mut sub, "RUNNING").await;

    send(&harness, "t1", Command::ListApps).await;
    loop {
        let event = next_event(&mut sub).await;
        if let OutboundKind::AppList { apps } = event.kind {
            assert_eq!(apps.len(), 1);
            assert_eq!(apps[0].app, "bot");
            assert_eq!(apps[0].state, "RUNNING");
            break;
        }
    }

    send(
        &harness,
        "t1",
        Command::Inspect {
            app: "bot".to_string(),
            owner: None,
        },
    )
    .await;
    loop {
        let event = next_event(&mut sub).await;
        if let OutboundKind::AppStats { memory_bytes, .. } = event.kind {
            assert!(memory_bytes > 0);
            break;
        }
    }

    harness.shutdown.shutdown();
}
