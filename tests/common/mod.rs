//! Shared helpers for process-level tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use synapse_mcp::config::TimeoutConfig;
use synapse_mcp::mcp_client::LaunchSpec;

pub const MOCK_PROVIDER: &str = env!("CARGO_BIN_EXE_mock-mcp-provider");

pub fn quick_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        init_ms: 5_000,
        call_ms: 5_000,
        shutdown_ms: 2_000,
    }
}

/// Launch spec for the stub provider reporting `name` and advertising `tools`.
pub fn mock_provider(name: &str, tools: &[&str]) -> LaunchSpec {
    LaunchSpec::new(MOCK_PROVIDER)
        .arg("--name")
        .arg(name)
        .arg("--tools")
        .arg(tools.join(","))
}

/// Pids appended to a `--spawn-log` file, one per started process.
pub fn spawned_pids(log: &Path) -> Vec<u32> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// True while `pid` is a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Format: `pid (comm) state ...`; comm may contain spaces.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Poll until `pid` is gone; panics after a few seconds.
#[cfg(target_os = "linux")]
pub async fn assert_exits(pid: u32) {
    for _ in 0..50 {
        if !process_running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("process {pid} is still running");
}

/// Poll until the spawn log holds at least `n` pids.
pub async fn wait_for_spawns(log: &Path, n: usize) -> Vec<u32> {
    for _ in 0..50 {
        let pids = spawned_pids(log);
        if pids.len() >= n {
            return pids;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    spawned_pids(log)
}
