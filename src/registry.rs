//! Per-user connection registry.
//!
//! Maps a user id to the one live duplex channel for that user. A new
//! registration for the same user replaces the old one (last write wins).
//! Delivery is best-effort: sending to a user with no channel is a silent
//! no-op and nothing is queued.
//!
//! Thread-safe: the map sits behind a `Mutex` that is never held across an
//! await, so registry calls from connection handlers and scheduler
//! completions can interleave freely.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// A duplex channel that can carry text frames to one client.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Complete the handshake. Runs before the channel becomes addressable.
    async fn accept(&self) -> Result<()>;

    /// Send one text frame.
    async fn send_text(&self, text: &str) -> Result<()>;
}

/// Identifies one registration, so a replaced channel cannot evict its successor.
pub type ConnectionId = u64;

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was handed to the user's channel.
    Delivered,
    /// The user has no live channel; the message was dropped.
    NotConnected,
}

struct Registered {
    id: ConnectionId,
    channel: Arc<dyn Channel>,
}

/// Process-wide map from user id to active channel.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Registered>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Registered>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept the channel and make it the user's active connection.
    ///
    /// If the handshake fails nothing is registered and the error is returned.
    pub async fn register(&self, user_id: &str, channel: Arc<dyn Channel>) -> Result<ConnectionId> {
        channel.accept().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .map()
            .insert(user_id.to_string(), Registered { id, channel })
            .is_some();

        if replaced {
            info!(user_id = %user_id, connection_id = id, "Replaced existing connection");
        } else {
            info!(user_id = %user_id, connection_id = id, "Connection registered");
        }
        Ok(id)
    }

    /// Remove the user's channel. Returns `true` if one was present.
    pub fn unregister(&self, user_id: &str) -> bool {
        let removed = self.map().remove(user_id).is_some();
        if removed {
            info!(user_id = %user_id, "Connection unregistered");
        }
        removed
    }

    /// Remove the user's channel only if it is still the given registration.
    pub fn unregister_connection(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut map = self.map();
        match map.get(user_id) {
            Some(current) if current.id == connection_id => {
                map.remove(user_id);
                info!(user_id = %user_id, connection_id, "Connection unregistered");
                true
            }
            _ => {
                debug!(user_id = %user_id, connection_id, "Stale connection closed, newer one kept");
                false
            }
        }
    }

    /// Send a text frame to the user's channel, if any.
    pub async fn send_to(&self, user_id: &str, message: &str) -> Result<Delivery> {
        let channel = self.map().get(user_id).map(|r| Arc::clone(&r.channel));

        match channel {
            Some(channel) => {
                channel.send_text(message).await?;
                Ok(Delivery::Delivered)
            }
            None => {
                debug!(user_id = %user_id, "No active connection, dropping message");
                Ok(Delivery::NotConnected)
            }
        }
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.map().contains_key(user_id)
    }

    /// Number of users with a live channel.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicBool;

    /// Channel that records what was sent to it.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub sent: Mutex<Vec<String>>,
        pub reject_handshake: bool,
        pub fail_sends: AtomicBool,
    }

    impl RecordingChannel {
        pub fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn accept(&self) -> Result<()> {
            if self.reject_handshake {
                Err(anyhow!("handshake refused"))
            } else {
                Ok(())
            }
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(anyhow!("socket closed"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_reaches_registered_channel() {
        let registry = ConnectionRegistry::new();
        let channel = Arc::new(RecordingChannel::default());
        registry.register("u1", channel.clone()).await.unwrap();

        let delivery = registry.send_to("u1", "hello").await.unwrap();

        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(channel.messages(), vec!["hello"]);
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_noop() {
        let registry = ConnectionRegistry::new();
        let delivery = registry.send_to("nobody", "hello").await.unwrap();
        assert_eq!(delivery, Delivery::NotConnected);
    }

    #[tokio::test]
    async fn failed_handshake_does_not_register() {
        let registry = ConnectionRegistry::new();
        let channel = Arc::new(RecordingChannel {
            reject_handshake: true,
            ..Default::default()
        });

        assert!(registry.register("u1", channel).await.is_err());
        assert!(!registry.is_connected("u1"));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = ConnectionRegistry::new();
        let old = Arc::new(RecordingChannel::default());
        let new = Arc::new(RecordingChannel::default());
        registry.register("u1", old.clone()).await.unwrap();
        registry.register("u1", new.clone()).await.unwrap();

        registry.send_to("u1", "hi").await.unwrap();

        assert!(old.messages().is_empty());
        assert_eq!(new.messages(), vec!["hi"]);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stale_connection_cannot_evict_replacement() {
        let registry = ConnectionRegistry::new();
        let old_id = registry
            .register("u1", Arc::new(RecordingChannel::default()))
            .await
            .unwrap();
        let new_id = registry
            .register("u1", Arc::new(RecordingChannel::default()))
            .await
            .unwrap();

        assert!(!registry.unregister_connection("u1", old_id));
        assert!(registry.is_connected("u1"));
        assert!(registry.unregister_connection("u1", new_id));
        assert!(!registry.is_connected("u1"));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry
            .register("u1", Arc::new(RecordingChannel::default()))
            .await
            .unwrap();

        assert!(registry.unregister("u1"));
        assert!(!registry.unregister("u1"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn send_error_propagates() {
        let registry = ConnectionRegistry::new();
        let channel = Arc::new(RecordingChannel::default());
        channel.fail_sends.store(true, Ordering::Relaxed);
        registry.register("u1", channel).await.unwrap();

        assert!(registry.send_to("u1", "hi").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_registrations_are_safe() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let user = format!("u{}", i % 8);
                let id = registry
                    .register(&user, Arc::new(RecordingChannel::default()))
                    .await
                    .unwrap();
                registry.send_to(&user, "ping").await.unwrap();
                registry.unregister_connection(&user, id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(registry.len() <= 8);
    }
}
