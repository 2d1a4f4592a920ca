//! Session registry and command dispatch

use crate::pending::PendingCommands;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use wgmesh_proto::{
    Command, CommandKind, CommandResponse, ControlError, ControlMessage, ControlPayload, PeerRole,
};

/// Eviction and dispatch tuning
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Sessions silent for longer than this are evicted
    pub stale_timeout: Duration,
    /// Sweeper cadence
    pub sweep_interval: Duration,
    /// How long `send_command_await` waits for a response
    pub command_timeout: Duration,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetrics {
    pub active_sessions: usize,
    pub sessions_by_role: HashMap<PeerRole, usize>,
    pub auth_failures_total: u64,
    pub commands_dispatched_total: u64,
    pub commands_succeeded_total: u64,
    pub commands_failed_total: u64,
}

/// Owns every authenticated session on this coordinator.
///
/// Invariant: at most one active session per peer id. Registration of a
/// new stream for a known peer atomically replaces the old session and
/// closes its transport — the new stream wins.
pub struct StreamManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pending: PendingCommands,
    config: StreamManagerConfig,

    next_command_id: AtomicU64,
    auth_failures: AtomicU64,
    commands_dispatched: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_failed: AtomicU64,
}

impl StreamManager {
    pub fn new(config: StreamManagerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: PendingCommands::new(),
            config,
            next_command_id: AtomicU64::new(1),
            auth_failures: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            commands_succeeded: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StreamManagerConfig {
        &self.config
    }

    /// Insert a session, atomically replacing (and closing) any prior
    /// active session for the same peer id.
    pub fn register(&self, session: Arc<Session>) {
        let replaced = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.insert(session.peer_id.clone(), session.clone())
        };

        if let Some(old) = replaced {
            warn!(
                peer_id = %session.peer_id,
                old_session = %old.session_id,
                new_session = %session.session_id,
                "Peer already had an active session, replacing"
            );
            old.mark_inactive();
            old.close_transport(b"replaced by newer stream");
        }

        info!(
            peer_id = %session.peer_id,
            role = %session.role,
            region = %session.region,
            session_id = %session.session_id,
            "Registered peer session"
        );
    }

    /// Remove a session, but only if `session_id` still matches: a
    /// reader loop draining after replacement must not evict its
    /// successor.
    pub fn unregister(&self, peer_id: &str, session_id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(peer_id) {
            Some(current) if current.session_id == session_id => {
                let removed = sessions.remove(peer_id);
                if let Some(session) = &removed {
                    session.mark_inactive();
                    info!(
                        peer_id = %peer_id,
                        role = %session.role,
                        "Unregistered peer session"
                    );
                }
                removed
            }
            _ => None,
        }
    }

    /// Active session for a peer
    pub fn get(&self, peer_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap();
        sessions.get(peer_id).filter(|s| s.is_active()).cloned()
    }

    /// All active sessions
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap();
        sessions.values().filter(|s| s.is_active()).cloned().collect()
    }

    /// Active sessions matching a role predicate
    pub fn sessions_where(&self, pred: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .filter(|s| s.is_active() && pred(s))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    /// Mint the next command id (coordinator-unique, monotonic)
    pub fn next_command_id(&self) -> u64 {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Fire-and-forget command dispatch
    pub async fn send_command(
        &self,
        peer_id: &str,
        kind: CommandKind,
        payload: HashMap<String, String>,
    ) -> Result<u64, ControlError> {
        let session = self
            .get(peer_id)
            .ok_or_else(|| ControlError::NotFound(format!("no active session for {}", peer_id)))?;

        let command_id = self.next_command_id();
        let command = Command::new(command_id, kind, payload);

        session
            .send(ControlMessage::new(ControlPayload::Command(command)))
            .await?;

        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        info!(
            peer_id = %peer_id,
            command_id = command_id,
            command_kind = %kind,
            "Sent command to peer"
        );
        Ok(command_id)
    }

    /// Dispatch a command and await its response, bounded by the
    /// configured command timeout.
    pub async fn send_command_await(
        &self,
        peer_id: &str,
        kind: CommandKind,
        payload: HashMap<String, String>,
    ) -> Result<CommandResponse, ControlError> {
        let session = self
            .get(peer_id)
            .ok_or_else(|| ControlError::NotFound(format!("no active session for {}", peer_id)))?;

        let command_id = self.next_command_id();
        let command = Command::new(command_id, kind, payload);

        // Register the waiter before sending so a fast response cannot
        // slip past it.
        let waiter = self.pending.register(peer_id, command_id);

        if let Err(e) = session
            .send(ControlMessage::new(ControlPayload::Command(command)))
            .await
        {
            self.pending.cancel(peer_id, command_id);
            return Err(e);
        }

        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.command_timeout, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ControlError::Unavailable(format!(
                "session for {} went away while awaiting command {}",
                peer_id, command_id
            ))),
            Err(_) => {
                self.pending.cancel(peer_id, command_id);
                self.commands_failed.fetch_add(1, Ordering::Relaxed);
                Err(ControlError::Timeout(format!(
                    "command {} to {} timed out",
                    command_id, peer_id
                )))
            }
        }
    }

    /// Route an inbound CommandResponse to its waiter and update
    /// counters. Responses without a waiter are logged and dropped.
    pub fn handle_command_response(&self, peer_id: &str, response: CommandResponse) {
        if let Some(session) = self.get(peer_id) {
            session.stats.commands_executed.fetch_add(1, Ordering::Relaxed);
            if !response.success {
                session.stats.commands_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if response.success {
            self.commands_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }

        let command_id = response.command_id;
        if !self.pending.complete(peer_id, response) {
            warn!(
                peer_id = %peer_id,
                command_id = command_id,
                "Command response without waiter, dropping"
            );
        }
    }

    /// Stamp a heartbeat and latency estimate for a peer
    pub fn update_heartbeat(&self, peer_id: &str, latency_ms: f64) {
        if let Some(session) = self.get(peer_id) {
            session.touch_heartbeat(latency_ms);
        }
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict sessions whose heartbeat age exceeds the stale timeout.
    /// Eviction closes the underlying transport. Returns the evicted
    /// sessions so the caller can release dependent state.
    pub fn sweep_stale(&self) -> Vec<Arc<Session>> {
        let stale: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|s| s.is_active() && s.heartbeat_age() > self.config.stale_timeout)
                .cloned()
                .collect()
        };

        for session in &stale {
            warn!(
                peer_id = %session.peer_id,
                age_secs = session.heartbeat_age().as_secs(),
                "Removing stale session"
            );
            self.unregister(&session.peer_id, &session.session_id);
            session.close_transport(b"stale session evicted");
        }

        stale
    }

    /// Seconds since the last heartbeat for a peer
    pub fn heartbeat_age_seconds(&self, peer_id: &str) -> Option<u64> {
        self.get(peer_id).map(|s| s.heartbeat_age().as_secs())
    }

    /// Observability snapshot
    pub fn metrics(&self) -> StreamMetrics {
        let sessions = self.sessions.read().unwrap();
        let mut by_role: HashMap<PeerRole, usize> = HashMap::new();
        let mut active = 0;

        for session in sessions.values().filter(|s| s.is_active()) {
            active += 1;
            *by_role.entry(session.role).or_insert(0) += 1;
        }

        StreamMetrics {
            active_sessions: active,
            sessions_by_role: by_role,
            auth_failures_total: self.auth_failures.load(Ordering::Relaxed),
            commands_dispatched_total: self.commands_dispatched.load(Ordering::Relaxed),
            commands_succeeded_total: self.commands_succeeded.load(Ordering::Relaxed),
            commands_failed_total: self.commands_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> StreamManager {
        StreamManager::new(StreamManagerConfig::default())
    }

    fn session(peer_id: &str, role: PeerRole) -> (Arc<Session>, mpsc::Receiver<ControlMessage>) {
        session_with_id(peer_id, role, &format!("{}-session", peer_id))
    }

    fn session_with_id(
        peer_id: &str,
        role: PeerRole,
        session_id: &str,
    ) -> (Arc<Session>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Arc::new(Session::new(
            peer_id.to_string(),
            role,
            "us".to_string(),
            session_id.to_string(),
            "auth-pk".to_string(),
            "127.0.0.1:9999".parse().unwrap(),
            tx,
            None,
        ));
        (session, rx)
    }

    #[test]
    fn test_at_most_one_active_session_per_peer() {
        let manager = manager();
        let (first, _rx1) = session_with_id("p1", PeerRole::Client, "s-old");
        let (second, _rx2) = session_with_id("p1", PeerRole::Hybrid, "s-new");

        manager.register(first.clone());
        manager.register(second.clone());

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.get("p1").unwrap().session_id, "s-new");
    }

    #[test]
    fn test_unregister_requires_matching_session_id() {
        let manager = manager();
        let (old, _rx1) = session_with_id("p1", PeerRole::Client, "s-old");
        let (new, _rx2) = session_with_id("p1", PeerRole::Client, "s-new");

        manager.register(old.clone());
        manager.register(new.clone());

        // The old reader loop drains and unregisters: must be a no-op
        assert!(manager.unregister("p1", "s-old").is_none());
        assert!(manager.get("p1").is_some());

        assert!(manager.unregister("p1", "s-new").is_some());
        assert!(manager.get("p1").is_none());
    }

    #[test]
    fn test_sessions_filtered_by_role() {
        let manager = manager();
        let (a, _rx1) = session("exit-1", PeerRole::Exit);
        let (b, _rx2) = session("hybrid-1", PeerRole::Hybrid);
        let (c, _rx3) = session("client-1", PeerRole::Client);
        manager.register(a);
        manager.register(b);
        manager.register(c);

        let exit_capable = manager.sessions_where(|s| s.role.provides_exit());
        let mut ids: Vec<String> = exit_capable.iter().map(|s| s.peer_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["exit-1", "hybrid-1"]);
    }

    #[tokio::test]
    async fn test_send_command_unknown_peer_is_not_found() {
        let manager = manager();
        let result = manager
            .send_command("ghost", CommandKind::Disconnect, HashMap::new())
            .await;
        assert!(matches!(result, Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_send_command_enqueues_and_counts() {
        let manager = manager();
        let (s, mut rx) = session("p1", PeerRole::Exit);
        manager.register(s);

        let id = manager
            .send_command("p1", CommandKind::SetupExit, HashMap::new())
            .await
            .unwrap();

        match rx.recv().await.unwrap().payload {
            ControlPayload::Command(cmd) => {
                assert_eq!(cmd.command_id, id);
                assert_eq!(cmd.kind, CommandKind::SetupExit);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(manager.metrics().commands_dispatched_total, 1);
    }

    #[tokio::test]
    async fn test_command_ids_are_monotonic() {
        let manager = manager();
        let (s, _rx) = session("p1", PeerRole::Exit);
        manager.register(s);

        let first = manager
            .send_command("p1", CommandKind::RotatePeer, HashMap::new())
            .await
            .unwrap();
        let second = manager
            .send_command("p1", CommandKind::RotatePeer, HashMap::new())
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_send_command_await_completes_on_response() {
        let manager = Arc::new(manager());
        let (s, mut rx) = session("p1", PeerRole::Exit);
        manager.register(s);

        let manager_clone = manager.clone();
        let responder = tokio::spawn(async move {
            // Act as the peer: read the command, answer it
            let msg = rx.recv().await.unwrap();
            let command_id = match msg.payload {
                ControlPayload::Command(cmd) => cmd.command_id,
                other => panic!("unexpected payload: {:?}", other),
            };
            manager_clone.handle_command_response("p1", CommandResponse::ok(command_id, "done"));
        });

        let response = manager
            .send_command_await("p1", CommandKind::SetupExit, HashMap::new())
            .await
            .unwrap();
        assert!(response.success);
        responder.await.unwrap();

        let metrics = manager.metrics();
        assert_eq!(metrics.commands_succeeded_total, 1);
        assert_eq!(metrics.commands_failed_total, 0);
    }

    #[tokio::test]
    async fn test_send_command_await_times_out() {
        let config = StreamManagerConfig {
            command_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let manager = StreamManager::new(config);
        let (s, _rx) = session("p1", PeerRole::Exit);
        manager.register(s);

        let result = manager
            .send_command_await("p1", CommandKind::SetupExit, HashMap::new())
            .await;
        assert!(matches!(result, Err(ControlError::Timeout(_))));
        assert_eq!(manager.metrics().commands_failed_total, 1);
    }

    #[test]
    fn test_sweep_evicts_only_stale_sessions() {
        let config = StreamManagerConfig {
            stale_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let manager = StreamManager::new(config);
        let (stale, _rx1) = session("stale-peer", PeerRole::Client);
        let (fresh, _rx2) = session("fresh-peer", PeerRole::Client);
        manager.register(stale.clone());
        manager.register(fresh.clone());

        std::thread::sleep(Duration::from_millis(50));
        fresh.touch_heartbeat(1.0);

        let evicted = manager.sweep_stale();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].peer_id, "stale-peer");
        assert!(!evicted[0].is_active());
        assert!(manager.get("fresh-peer").is_some());
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_metrics_by_role() {
        let manager = manager();
        let (a, _rx1) = session("e1", PeerRole::Exit);
        let (b, _rx2) = session("c1", PeerRole::Client);
        let (c, _rx3) = session("c2", PeerRole::Client);
        manager.register(a);
        manager.register(b);
        manager.register(c);
        manager.record_auth_failure();

        let metrics = manager.metrics();
        assert_eq!(metrics.active_sessions, 3);
        assert_eq!(metrics.sessions_by_role[&PeerRole::Client], 2);
        assert_eq!(metrics.sessions_by_role[&PeerRole::Exit], 1);
        assert_eq!(metrics.auth_failures_total, 1);
    }
}
