/// Pub/sub transport seam
///
/// The bus only needs namespaced channels, fan-out to several subscribers
/// and a wildcard subscription. `MemoryTransport` provides that inside one
/// process with tokio broadcast channels; a networked broker can implement
/// the same trait. `SqliteTransport` shares messages between processes.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 1024;

/// A message as delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Channel the message was published on
    pub channel: String,
    pub payload: String,
}

/// Namespaced publish/subscribe transport
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish to one channel; returns how many subscriptions received it
    /// synchronously (0 for transports that deliver asynchronously)
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to exactly one channel
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<TransportMessage>>;

    /// Subscribe to every channel matching a glob pattern (`*` and `?`)
    async fn psubscribe(&self, pattern: &str) -> Result<broadcast::Receiver<TransportMessage>>;
}

/// In-process transport on tokio broadcast channels
///
/// Each channel and each pattern owns one sender. Senders whose receivers
/// have all been dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    channels: RwLock<HashMap<String, broadcast::Sender<TransportMessage>>>,
    patterns: RwLock<HashMap<String, broadcast::Sender<TransportMessage>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on an exact channel
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Channels plus patterns that still hold a sender
    pub async fn open_subscriptions(&self) -> usize {
        self.channels.read().await.len() + self.patterns.read().await.len()
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let message = TransportMessage {
            channel: channel.to_string(),
            payload,
        };
        let mut delivered = 0;

        {
            let mut channels = self.channels.write().await;
            channels.retain(|_, tx| tx.receiver_count() > 0);
            if let Some(tx) = channels.get(channel) {
                delivered += tx.send(message.clone()).unwrap_or(0);
            }
        }

        {
            let mut patterns = self.patterns.write().await;
            patterns.retain(|_, tx| tx.receiver_count() > 0);
            for (pattern, tx) in patterns.iter() {
                if glob_match(pattern, channel) {
                    delivered += tx.send(message.clone()).unwrap_or(0);
                }
            }
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<TransportMessage>> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<broadcast::Receiver<TransportMessage>> {
        let mut patterns = self.patterns.write().await;
        let tx = patterns
            .entry(pattern.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

/// Glob match supporting `*` (any run) and `?` (one char)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // backtrack: let the last star absorb one more char
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rankflow:tenant:*", "rankflow:tenant:acme"));
        assert!(!glob_match("rankflow:tenant:*", "other:tenant:acme"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b", "axxc"));
    }

    #[tokio::test]
    async fn test_exact_and_pattern_fan_out() {
        let transport = MemoryTransport::new();
        let mut one = transport.subscribe("ns:tenant:a").await.unwrap();
        let mut two = transport.subscribe("ns:tenant:a").await.unwrap();
        let mut all = transport.psubscribe("ns:tenant:*").await.unwrap();

        let delivered = transport.publish("ns:tenant:a", "hello".into()).await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(one.recv().await.unwrap().payload, "hello");
        assert_eq!(two.recv().await.unwrap().payload, "hello");
        assert_eq!(all.recv().await.unwrap().channel, "ns:tenant:a");

        assert_eq!(transport.publish("ns:tenant:b", "x".into()).await.unwrap(), 1);
        assert!(one.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let transport = MemoryTransport::new();
        let rx = transport.subscribe("ns:tenant:a").await.unwrap();
        assert_eq!(transport.subscriber_count("ns:tenant:a").await, 1);
        drop(rx);

        transport.publish("ns:tenant:a", "x".into()).await.unwrap();
        assert_eq!(transport.open_subscriptions().await, 0);
    }
}
