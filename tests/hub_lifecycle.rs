//! Connect, status and teardown against real provider processes.

mod common;

use std::time::Duration;

use common::{mock_provider, quick_timeouts, spawned_pids, wait_for_spawns};
use synapse_mcp::config::{McpServersConfig, TimeoutConfig};
use synapse_mcp::mcp_client::{McpError, McpHub, SessionState};

#[tokio::test]
async fn connect_twice_spawns_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("spawns.log");
    let spec = mock_provider("jira", &["create_ticket"])
        .arg("--spawn-log")
        .arg(log.display().to_string());

    let hub = McpHub::new(quick_timeouts());
    hub.connect("jira", &spec).await.unwrap();
    hub.connect("jira", &spec).await.unwrap();

    assert_eq!(hub.registry().len(), 1);
    assert_eq!(spawned_pids(&log).len(), 1);
    assert!(hub.shutdown().await.is_clean());
}

#[tokio::test]
async fn concurrent_connects_for_one_name_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("spawns.log");
    let spec = mock_provider("jira", &["create_ticket"])
        .arg("--init-delay-ms")
        .arg("300")
        .arg("--spawn-log")
        .arg(log.display().to_string());

    let hub = McpHub::new(quick_timeouts());
    let (first, second) = tokio::join!(hub.connect("jira", &spec), hub.connect("jira", &spec));
    first.unwrap();
    second.unwrap();

    assert_eq!(spawned_pids(&log).len(), 1);
    assert_eq!(hub.registry().provider_names(), vec!["jira"]);
    hub.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn shutdown_closes_in_reverse_order_and_reaps_children() {
    let hub = McpHub::new(quick_timeouts());
    hub.connect("jira", &mock_provider("jira", &["create_ticket"]))
        .await
        .unwrap();
    hub.connect("slack", &mock_provider("slack", &["post_message"]))
        .await
        .unwrap();

    let pids: Vec<u32> = hub
        .status()
        .await
        .iter()
        .map(|s| s.pid.unwrap())
        .collect();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|&pid| common::process_running(pid)));

    let report = hub.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(report.closed, vec!["slack", "jira"]);

    assert!(hub.list_tools().await.is_empty());
    for pid in pids {
        common::assert_exits(pid).await;
    }

    // Second shutdown is a no-op.
    assert!(hub.shutdown().await.closed.is_empty());
}

#[tokio::test]
async fn failed_handshake_carries_provider_stderr() {
    let hub = McpHub::new(quick_timeouts());
    let spec = mock_provider("jira", &["create_ticket"]).arg("--fail-init");

    let err = hub.connect("jira", &spec).await.unwrap_err();
    assert_eq!(err.provider, "jira");
    match err.cause {
        McpError::InitFailed { ref reason, .. } => {
            assert!(reason.contains("refused to initialize"), "reason: {reason}");
        }
        ref other => panic!("expected InitFailed, got {other:?}"),
    }
    assert!(hub.registry().is_empty());
    assert_eq!(hub.registry().state("jira"), SessionState::Disconnected);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn handshake_timeout_kills_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("spawns.log");
    let spec = mock_provider("jira", &["create_ticket"])
        .arg("--init-delay-ms")
        .arg("10000")
        .arg("--spawn-log")
        .arg(log.display().to_string());

    let hub = McpHub::new(TimeoutConfig {
        init_ms: 300,
        ..quick_timeouts()
    });
    let err = hub.connect("jira", &spec).await.unwrap_err();
    assert!(matches!(err.cause, McpError::InitFailed { ref reason, .. } if reason.contains("timed out")));

    for pid in spawned_pids(&log) {
        common::assert_exits(pid).await;
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancelled_connect_leaves_no_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("spawns.log");
    let slow = mock_provider("jira", &["create_ticket"])
        .arg("--init-delay-ms")
        .arg("10000")
        .arg("--spawn-log")
        .arg(log.display().to_string());

    let hub = McpHub::new(quick_timeouts());
    let attempt = tokio::time::timeout(Duration::from_millis(500), hub.connect("jira", &slow)).await;
    assert!(attempt.is_err(), "connect should still be waiting on the handshake");

    assert_eq!(hub.registry().state("jira"), SessionState::Disconnected);
    assert!(hub.registry().get_session("jira").is_err());
    for pid in wait_for_spawns(&log, 1).await {
        common::assert_exits(pid).await;
    }

    // The name is usable again.
    hub.connect("jira", &mock_provider("jira", &["create_ticket"]))
        .await
        .unwrap();
    assert_eq!(hub.registry().state("jira"), SessionState::Ready);
    hub.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn shutdown_during_handshake_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("spawns.log");
    let slow = mock_provider("jira", &["create_ticket"])
        .arg("--init-delay-ms")
        .arg("2000")
        .arg("--spawn-log")
        .arg(log.display().to_string());

    let hub = McpHub::new(quick_timeouts());
    let (connected, (pids, report)) = tokio::join!(hub.connect("jira", &slow), async {
        let pids = wait_for_spawns(&log, 1).await;
        (pids, hub.shutdown().await)
    });

    let err = connected.unwrap_err();
    assert!(matches!(err.cause, McpError::ConnectAborted { .. }));
    assert!(report.is_clean());
    assert!(hub.registry().is_empty());
    assert!(hub.list_tools().await.is_empty());
    assert_eq!(pids.len(), 1);
    for pid in pids {
        common::assert_exits(pid).await;
    }
}

#[tokio::test]
async fn connect_all_tolerates_partial_startup() {
    let mut config = McpServersConfig::default();
    config
        .servers
        .insert("jira".into(), mock_provider("jira", &["create_ticket"]));
    config.servers.insert(
        "slack".into(),
        mock_provider("slack", &["post_message"]).arg("--fail-init"),
    );

    let hub = McpHub::new(quick_timeouts());
    let failures = hub.connect_all(&config).await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "slack");
    assert_eq!(hub.registry().provider_names(), vec!["jira"]);

    let names: Vec<String> = hub.list_tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["jira_create_ticket"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn status_reports_live_providers() {
    let hub = McpHub::new(quick_timeouts());
    hub.connect("jira", &mock_provider("jira-server", &["create_ticket"]))
        .await
        .unwrap();

    let status = hub.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "jira");
    assert_eq!(status[0].state, SessionState::Ready);
    assert!(status[0].alive);
    assert_eq!(status[0].server_name.as_deref(), Some("jira-server"));
    assert_eq!(status[0].server_version.as_deref(), Some("0.0.1"));
    assert!(status[0].connected_at.is_some());

    hub.disconnect("jira").await.unwrap();
    let status = hub.status().await;
    assert_eq!(status[0].state, SessionState::Closed);
    assert!(!status[0].alive);
}
