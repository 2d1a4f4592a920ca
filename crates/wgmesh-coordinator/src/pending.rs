//! In-flight command tracking
//!
//! `send_command_await` registers a waiter here before the command is
//! enqueued; the reader loop completes it when the matching
//! CommandResponse arrives on the peer's stream.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use wgmesh_proto::CommandResponse;

/// Waiters keyed by (peer_id, command_id)
#[derive(Default)]
pub struct PendingCommands {
    waiters: Mutex<HashMap<(String, u64), oneshot::Sender<CommandResponse>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter; the previous waiter for the same key, if any,
    /// is dropped (its receiver observes cancellation).
    pub fn register(&self, peer_id: &str, command_id: u64) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert((peer_id.to_string(), command_id), tx);
        rx
    }

    /// Wake the waiter for a response. Returns false when no waiter was
    /// present (late or unsolicited response — logged and dropped by the
    /// caller).
    pub fn complete(&self, peer_id: &str, response: CommandResponse) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap()
            .remove(&(peer_id.to_string(), response.command_id));

        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter after a timeout
    pub fn cancel(&self, peer_id: &str, command_id: u64) {
        self.waiters
            .lock()
            .unwrap()
            .remove(&(peer_id.to_string(), command_id));
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let pending = PendingCommands::new();
        let rx = pending.register("p1", 1);

        assert!(pending.complete("p1", CommandResponse::ok(1, "done")));

        let response = rx.await.unwrap();
        assert!(response.success);
        assert_eq!(response.command_id, 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let pending = PendingCommands::new();
        assert!(!pending.complete("p1", CommandResponse::ok(99, "late")));
    }

    #[tokio::test]
    async fn test_waiters_scoped_by_peer() {
        let pending = PendingCommands::new();
        let rx1 = pending.register("p1", 1);
        let _rx2 = pending.register("p2", 1);

        assert!(pending.complete("p1", CommandResponse::ok(1, "for p1")));
        assert_eq!(rx1.await.unwrap().message, "for p1");
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_waiter() {
        let pending = PendingCommands::new();
        let rx = pending.register("p1", 5);
        pending.cancel("p1", 5);

        assert!(rx.await.is_err());
        assert!(!pending.complete("p1", CommandResponse::ok(5, "too late")));
    }
}
