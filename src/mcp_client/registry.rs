//! Connection registry: owns every live provider session.
//!
//! Provides:
//! - Idempotent `connect`, serialized per provider name
//! - Non-blocking lookup of Ready sessions
//! - Per-provider lifecycle state
//! - Teardown in reverse registration order that never stops early

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::aggregator::NAMESPACE_SEPARATOR;
use super::errors::{ConnectError, McpError, NotConnectedError};
use super::session::Session;
use super::types::{InitializeResult, LaunchSpec, RemoteTool, ToolResult};
use crate::config::TimeoutConfig;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle of one provider inside a registry.
///
/// `Disconnected → Connecting → Ready → Closing → Closed`, with
/// `Connecting → Disconnected` when spawn or handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

// ─── SessionHandle ───────────────────────────────────────────────────────────

/// Read-only reference to a Ready session.
///
/// Handles can run requests but cannot close the session; the registry
/// stays responsible for that.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        self.session.name()
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.pid()
    }

    pub fn server_info(&self) -> &InitializeResult {
        self.session.server_info()
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        self.session.list_tools().await
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, McpError> {
        self.session.call_tool(tool, arguments).await
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Outcome of closing every session.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Providers closed cleanly, in the order they were closed.
    pub closed: Vec<String>,
    /// Providers whose release reported an error. They are gone from the
    /// registry all the same.
    pub failures: Vec<(String, McpError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Operator-facing snapshot of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub alive: bool,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_check: String,
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    /// Ready sessions in registration order.
    sessions: Vec<(String, Arc<Session>)>,
    /// Last known state of every name this registry has seen.
    states: HashMap<String, SessionState>,
}

/// Owns the set of active provider sessions.
///
/// The session list is only touched inside short synchronous critical
/// sections, never across an `.await`. Connect attempts for one name are
/// serialized by a per-name async gate so a provider is never spawned twice.
pub struct ConnectionRegistry {
    timeouts: TimeoutConfig,
    inner: RwLock<Inner>,
    gates: GateMap,
    /// Bumped by every `close_all`; connects started before the bump abort.
    shutdown_epoch: watch::Sender<u64>,
}

type GateMap = std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            timeouts,
            inner: RwLock::new(Inner::default()),
            gates: std::sync::Mutex::new(HashMap::new()),
            shutdown_epoch: watch::channel(0).0,
        }
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts
    }

    /// Spawn and initialize a provider, unless it is already Ready.
    ///
    /// A concurrent call for the same name waits for the first to finish and
    /// then observes its result: a no-op if it succeeded, a fresh attempt if
    /// it failed. Calls for different names run in parallel. A `close_all`
    /// that starts while the handshake is running aborts the attempt and
    /// releases the child.
    pub async fn connect(&self, name: &str, spec: &LaunchSpec) -> Result<(), ConnectError> {
        validate_provider_name(name).map_err(|cause| ConnectError {
            provider: name.to_string(),
            cause,
        })?;

        let gate = self.gate(name);
        let _serialized = gate.lock().await;

        if self.get_session(name).is_ok() {
            tracing::info!(provider = %name, "already connected, skipping");
            return Ok(());
        }

        let mut shutdown = self.shutdown_epoch.subscribe();
        let epoch = *shutdown.borrow_and_update();

        tracing::info!(provider = %name, command = %spec.command, "connecting to provider");
        self.set_state(name, SessionState::Connecting);
        let mut pending = PendingConnect {
            registry: self,
            name,
            armed: true,
        };

        // Dropping the spawn future kills the half-started child.
        let result = tokio::select! {
            result = Session::spawn(name, spec, self.timeouts) => result,
            _ = shutdown.changed() => Err(aborted(name)),
        };
        pending.armed = false;

        let session = match result {
            Ok(session) => session,
            Err(cause) => {
                self.set_state(name, SessionState::Disconnected);
                tracing::error!(provider = %name, error = %cause, "failed to connect provider");
                return Err(ConnectError {
                    provider: name.to_string(),
                    cause,
                });
            }
        };

        // `close_all` waits on this gate before draining, so a session
        // registered here is always seen by it.
        if *self.shutdown_epoch.borrow() != epoch {
            tracing::warn!(provider = %name, "registry shut down during handshake, releasing provider");
            if let Err(e) = session.shutdown().await {
                tracing::warn!(provider = %name, error = %e, "error while releasing provider");
            }
            self.set_state(name, SessionState::Disconnected);
            return Err(ConnectError {
                provider: name.to_string(),
                cause: aborted(name),
            });
        }

        let pid = session.pid();
        let mut inner = self.write();
        inner.sessions.push((name.to_string(), Arc::new(session)));
        inner.states.insert(name.to_string(), SessionState::Ready);
        drop(inner);
        tracing::info!(provider = %name, pid = ?pid, "provider connected and initialized");
        Ok(())
    }

    /// Look up a Ready session. Never waits on an in-flight connect.
    pub fn get_session(&self, name: &str) -> Result<SessionHandle, NotConnectedError> {
        self.read()
            .sessions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, session)| SessionHandle {
                session: Arc::clone(session),
            })
            .ok_or_else(|| NotConnectedError {
                provider: name.to_string(),
            })
    }

    /// Every Ready session, in registration order.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.read()
            .sessions
            .iter()
            .map(|(_, session)| SessionHandle {
                session: Arc::clone(session),
            })
            .collect()
    }

    /// Names of Ready providers, in registration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.read()
            .sessions
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Current lifecycle state; names never seen are `Disconnected`.
    pub fn state(&self, name: &str) -> SessionState {
        self.read()
            .states
            .get(name)
            .copied()
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    /// Close one provider. Closing a provider that is not Ready is a no-op.
    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        let gate = self.gate(name);
        let _serialized = gate.lock().await;

        let removed = {
            let mut inner = self.write();
            let position = inner.sessions.iter().position(|(n, _)| n == name);
            let removed = position.map(|i| inner.sessions.remove(i));
            if removed.is_some() {
                inner.states.insert(name.to_string(), SessionState::Closing);
            }
            removed
        };

        let Some((_, session)) = removed else {
            tracing::debug!(provider = %name, "disconnect requested for provider that is not connected");
            return Ok(());
        };

        tracing::info!(provider = %name, "closing connection");
        let result = session.shutdown().await;
        self.set_state(name, SessionState::Closed);
        result
    }

    /// Close every session, most recently registered first.
    ///
    /// Connects still in their handshake are aborted and waited for, so no
    /// provider started before this call survives it. A failure releasing
    /// one session is recorded and the loop moves on. Afterwards the
    /// registry holds no sessions; calling again is a no-op.
    pub async fn close_all(&self) -> ShutdownReport {
        self.shutdown_epoch.send_modify(|epoch| *epoch += 1);

        // Wait out in-flight connects and disconnects. Gates are taken in
        // name order so two concurrent `close_all` calls cannot deadlock.
        let mut names: Vec<String> = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        let leases: Vec<GateLease<'_>> = names.iter().map(|n| self.gate(n)).collect();
        let mut held = Vec::with_capacity(leases.len());
        for lease in &leases {
            held.push(lease.lock().await);
        }

        let drained = {
            let mut inner = self.write();
            let drained = std::mem::take(&mut inner.sessions);
            for (name, _) in &drained {
                inner.states.insert(name.clone(), SessionState::Closing);
            }
            drained
        };

        let mut report = ShutdownReport::default();
        for (name, session) in drained.into_iter().rev() {
            tracing::info!(provider = %name, "closing connection");
            match session.shutdown().await {
                Ok(()) => report.closed.push(name.clone()),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "error while closing provider");
                    report.failures.push((name.clone(), e));
                }
            }
            self.set_state(&name, SessionState::Closed);
        }

        drop(held);
        drop(leases);

        if !report.closed.is_empty() || !report.failures.is_empty() {
            tracing::info!(
                closed = report.closed.len(),
                failed = report.failures.len(),
                "all provider connections closed"
            );
        }
        report
    }

    /// Snapshot of every provider this registry has seen, Ready ones first
    /// in registration order, the rest sorted by name.
    pub async fn status(&self) -> Vec<ProviderStatus> {
        let now = Utc::now().to_rfc3339();
        let (ready, others) = {
            let inner = self.read();
            let ready: Vec<(String, Arc<Session>)> = inner
                .sessions
                .iter()
                .map(|(n, s)| (n.clone(), Arc::clone(s)))
                .collect();
            let mut others: Vec<(String, SessionState)> = inner
                .states
                .iter()
                .filter(|(n, _)| !ready.iter().any(|(r, _)| r == *n))
                .map(|(n, s)| (n.clone(), *s))
                .collect();
            others.sort_by(|a, b| a.0.cmp(&b.0));
            (ready, others)
        };

        let mut statuses = Vec::with_capacity(ready.len() + others.len());
        for (name, session) in ready {
            let info = session.server_info().server_info.as_ref();
            statuses.push(ProviderStatus {
                state: SessionState::Ready,
                pid: session.pid(),
                alive: session.is_alive().await,
                server_name: info.and_then(|i| i.name.clone()),
                server_version: info.and_then(|i| i.version.clone()),
                connected_at: Some(session.connected_at()),
                last_check: now.clone(),
                name,
            });
        }
        for (name, state) in others {
            statuses.push(ProviderStatus {
                name,
                state,
                pid: None,
                alive: false,
                server_name: None,
                server_version: None,
                connected_at: None,
                last_check: now.clone(),
            });
        }
        statuses
    }

    /// Per-name serialization gate. The map entry is dropped again once the
    /// last lease for the name goes away.
    fn gate(&self, name: &str) -> GateLease<'_> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        GateLease {
            gates: &self.gates,
            name: name.to_string(),
            gate: Arc::clone(gates.entry(name.to_string()).or_default()),
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn set_state(&self, name: &str, state: SessionState) {
        self.write().states.insert(name.to_string(), state);
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets `Connecting` to `Disconnected` if a connect future is dropped
/// before the spawn finishes. The child itself dies with its handle.
struct PendingConnect<'a> {
    registry: &'a ConnectionRegistry,
    name: &'a str,
    armed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(provider = %self.name, "connect cancelled, rolled back");
            self.registry
                .set_state(self.name, SessionState::Disconnected);
        }
    }
}

/// A claim on one name's gate. Must outlive any guard taken from it.
struct GateLease<'a> {
    gates: &'a GateMap,
    name: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl GateLease<'_> {
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // Leases are only created under this lock, so a count of two (the
        // map and us) means nobody else is waiting on the gate.
        let unused = gates
            .get(&self.name)
            .is_some_and(|g| Arc::ptr_eq(g, &self.gate) && Arc::strong_count(g) == 2);
        if unused {
            gates.remove(&self.name);
        }
    }
}

fn aborted(name: &str) -> McpError {
    McpError::ConnectAborted {
        name: name.to_string(),
        reason: "registry is shutting down".into(),
    }
}

/// Provider names become namespace prefixes, so they must be non-empty and
/// free of the separator; otherwise splitting a namespaced tool name would be
/// ambiguous.
pub fn validate_provider_name(name: &str) -> Result<(), McpError> {
    let reason = if name.is_empty() {
        "name is empty".to_string()
    } else if name.contains(NAMESPACE_SEPARATOR) {
        format!("name must not contain '{NAMESPACE_SEPARATOR}'")
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "name must not contain whitespace or control characters".to_string()
    } else {
        return Ok(());
    };

    Err(McpError::InvalidProviderName {
        name: name.to_string(),
        reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            init_ms: 2_000,
            call_ms: 2_000,
            shutdown_ms: 2_000,
        }
    }

    /// A shell provider that answers `initialize` and then idles until stdin closes.
    #[cfg(unix)]
    fn idle_provider() -> LaunchSpec {
        let script = r#"read -r line
id=$(printf '%s' "$line" | sed -e 's/^.*"id":\([0-9]*\).*$/\1/')
printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"sh-provider","version":"0.0.1"}}}\n' "$id"
cat >/dev/null"#;
        LaunchSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_validate_provider_name() {
        assert!(validate_provider_name("jira").is_ok());
        assert!(validate_provider_name("google-calendar").is_ok());
        assert!(validate_provider_name("").is_err());
        assert!(validate_provider_name("google_calendar").is_err());
        assert!(validate_provider_name("has space").is_err());
    }

    #[test]
    fn test_empty_registry() {
        let registry = ConnectionRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.state("jira"), SessionState::Disconnected);
        let err = registry.get_session("jira").unwrap_err();
        assert_eq!(err.provider, "jira");
    }

    #[tokio::test]
    async fn test_close_all_on_empty_registry_is_clean() {
        let registry = ConnectionRegistry::default();
        let report = registry.close_all().await;
        assert!(report.is_clean());
        assert!(report.closed.is_empty());
        assert!(registry.close_all().await.is_clean());
    }

    #[tokio::test]
    async fn test_connect_rejects_separator_in_name() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        let err = registry
            .connect("google_calendar", &LaunchSpec::new("true"))
            .await
            .unwrap_err();
        assert_eq!(err.provider, "google_calendar");
        assert!(matches!(err.cause, McpError::InvalidProviderName { .. }));
        assert_eq!(registry.state("google_calendar"), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_registry_empty() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        let err = registry
            .connect("ghost", &LaunchSpec::new("/no/such/provider/binary"))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, McpError::SpawnFailed { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.state("ghost"), SessionState::Disconnected);
        assert!(registry.get_session("ghost").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_is_idempotent_and_close_all_reverses_order() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        registry.connect("jira", &idle_provider()).await.unwrap();
        let first_pid = registry.get_session("jira").unwrap().pid();

        registry.connect("jira", &idle_provider()).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_session("jira").unwrap().pid(), first_pid);

        registry.connect("slack", &idle_provider()).await.unwrap();
        assert_eq!(registry.provider_names(), vec!["jira", "slack"]);
        assert_eq!(registry.state("slack"), SessionState::Ready);

        let statuses = registry.status().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.alive));
        assert_eq!(statuses[0].server_name.as_deref(), Some("sh-provider"));

        let report = registry.close_all().await;
        assert!(report.is_clean());
        assert_eq!(report.closed, vec!["slack", "jira"]);
        assert!(registry.is_empty());
        assert_eq!(registry.state("jira"), SessionState::Closed);
        assert!(registry.close_all().await.closed.is_empty());
        assert_eq!(registry.gate_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_all_aborts_connect_in_handshake() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        let silent = LaunchSpec::new("sleep").arg("30");

        let (connect, report) = tokio::join!(registry.connect("jira", &silent), async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            registry.close_all().await
        });

        let err = connect.unwrap_err();
        assert!(matches!(err.cause, McpError::ConnectAborted { ref name, .. } if name == "jira"));
        assert!(report.is_clean());
        assert!(report.closed.is_empty());
        assert!(registry.is_empty());
        assert_eq!(registry.state("jira"), SessionState::Disconnected);

        // Usable again once shutdown has finished.
        registry.connect("jira", &idle_provider()).await.unwrap();
        assert_eq!(registry.provider_names(), vec!["jira"]);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_gates_are_released_after_use() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        for name in ["alpha", "beta", "gamma"] {
            let _ = registry
                .connect(name, &LaunchSpec::new("/no/such/provider/binary"))
                .await;
            registry.disconnect(name).await.unwrap();
        }
        assert_eq!(registry.gate_count(), 0);

        let lease = registry.gate("alpha");
        let again = registry.gate("alpha");
        drop(lease);
        assert_eq!(registry.gate_count(), 1);
        drop(again);
        assert_eq!(registry.gate_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disconnect_single_provider() {
        let registry = ConnectionRegistry::new(quick_timeouts());
        registry.connect("jira", &idle_provider()).await.unwrap();
        registry.connect("slack", &idle_provider()).await.unwrap();

        registry.disconnect("jira").await.unwrap();
        assert_eq!(registry.provider_names(), vec!["slack"]);
        assert_eq!(registry.state("jira"), SessionState::Closed);

        // Not connected any more: no-op.
        registry.disconnect("jira").await.unwrap();

        let statuses = registry.status().await;
        assert_eq!(statuses[0].name, "slack");
        assert_eq!(statuses[1].name, "jira");
        assert_eq!(statuses[1].state, SessionState::Closed);

        registry.close_all().await;
    }
}
