/// Shared event transport over the backend's event log
///
/// Every process pointed at the same database sees every message: publish
/// appends a row, and each subscription tails the log from the position it
/// started at. Delivery is asynchronous, bounded by the poll interval.

use crate::backend::SqliteBackend;
use crate::events::transport::{glob_match, PubSubTransport, TransportMessage};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;
const BATCH: u32 = 256;

#[derive(Debug, Clone)]
pub struct SqliteTransport {
    backend: SqliteBackend,
    poll_interval: Duration,
}

impl SqliteTransport {
    pub fn new(backend: SqliteBackend, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    async fn tail(&self, target: Tail) -> Result<broadcast::Receiver<TransportMessage>> {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let from = self.backend.latest_event_seq().await?;
        tokio::spawn(follow(self.backend.clone(), target, from, self.poll_interval, tx));
        Ok(rx)
    }
}

#[derive(Debug)]
enum Tail {
    Channel(String),
    Pattern(String),
}

#[async_trait]
impl PubSubTransport for SqliteTransport {
    /// Deliveries happen in the tailing tasks, so the count is always 0
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        self.backend.append_event(channel, &payload).await?;
        Ok(0)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<TransportMessage>> {
        self.tail(Tail::Channel(channel.to_string())).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<broadcast::Receiver<TransportMessage>> {
        self.tail(Tail::Pattern(pattern.to_string())).await
    }
}

/// Forward new log rows to one subscription until its receiver is dropped
async fn follow(
    backend: SqliteBackend,
    target: Tail,
    mut last_seq: i64,
    poll: Duration,
    tx: broadcast::Sender<TransportMessage>,
) {
    let channel = match &target {
        Tail::Channel(name) => Some(name.as_str()),
        Tail::Pattern(_) => None,
    };

    loop {
        if tx.receiver_count() == 0 {
            return;
        }

        match backend.events_after(last_seq, channel, BATCH).await {
            Ok(batch) => {
                let full = batch.len() == BATCH as usize;
                for logged in batch {
                    last_seq = logged.seq;
                    if let Tail::Pattern(pattern) = &target {
                        if !glob_match(pattern, &logged.channel) {
                            continue;
                        }
                    }
                    let _ = tx.send(TransportMessage {
                        channel: logged.channel,
                        payload: logged.payload,
                    });
                }
                if full {
                    continue;
                }
            }
            Err(e) => tracing::warn!(?target, "⚠️ Failed to read event log: {}", e),
        }

        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn bus_on(url: &str) -> EventBus {
        let backend = SqliteBackend::connect(url, 2).await.unwrap();
        EventBus::new(
            Arc::new(SqliteTransport::new(backend, Duration::from_millis(10))),
            "itest",
        )
    }

    fn collector() -> (impl Fn(Event) + Send + Sync + 'static, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event: Event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_events_cross_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("events.db").display());
        let publisher = bus_on(&url).await;
        let listener = bus_on(&url).await;

        publisher
            .publish(&Event::task_started("tenant-a", "before", "x", 1))
            .await
            .unwrap();

        let (on_a, mut rx_a) = collector();
        let (on_all, mut rx_all) = collector();
        let sub_a = listener.subscribe("tenant-a", on_a);
        let sub_all = listener.subscribe_all(on_all);
        sub_a.start().await.unwrap();
        sub_all.start().await.unwrap();

        publisher
            .publish(&Event::task_started("tenant-b", "j1", "x", 1))
            .await
            .unwrap();
        publisher
            .publish(&Event::task_started("tenant-a", "j2", "x", 1))
            .await
            .unwrap();

        // only messages published after start are delivered
        assert_eq!(next(&mut rx_a).await.job_id(), Some("j2"));
        assert_eq!(next(&mut rx_all).await.job_id(), Some("j1"));
        assert_eq!(next(&mut rx_all).await.job_id(), Some("j2"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_all.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stopped_subscription_ends_its_tail() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let transport = SqliteTransport::new(backend, Duration::from_millis(5));
        let rx = transport.subscribe("ns:tenant:a").await.unwrap();
        drop(rx);

        // publishing still works with nobody listening
        assert_eq!(transport.publish("ns:tenant:a", "x".into()).await.unwrap(), 0);
    }
}
