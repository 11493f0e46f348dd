/// Tenant-scoped Event Bus
///
/// Every event is routed to `{prefix}:tenant:{tenantId}`. Isolation comes
/// from the channel name alone: a tenant subscription listens on exactly
/// one channel and never sees another tenant's traffic. Tenant ids are
/// escaped so no id can forge a channel name or glob pattern.

use crate::events::transport::{MemoryTransport, PubSubTransport, TransportMessage};
use crate::events::types::Event;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Callback invoked for every delivered event
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Publish/subscribe broker keyed by tenant
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn PubSubTransport>,
    prefix: String,
}

impl EventBus {
    pub fn new(transport: Arc<dyn PubSubTransport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
        }
    }

    /// Bus over a fresh in-process transport
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryTransport::new()), prefix)
    }

    /// Channel carrying one tenant's events
    pub fn channel_for(&self, tenant_id: &str) -> String {
        format!("{}:tenant:{}", self.prefix, escape_segment(tenant_id))
    }

    fn all_tenants_pattern(&self) -> String {
        format!("{}:tenant:*", self.prefix)
    }

    /// Publish on the event's tenant channel; returns how many subscriptions received it
    pub async fn publish(&self, event: &Event) -> Result<usize> {
        let channel = self.channel_for(&event.tenant_id);
        let payload = serde_json::to_string(event)?;
        let delivered = self
            .transport
            .publish(&channel, payload)
            .await
            .with_context(|| format!("Failed to publish {} on {}", event.event_type, channel))?;
        tracing::trace!(event_type = %event.event_type, %channel, delivered, "📣 Event published");
        Ok(delivered)
    }

    /// Subscription to a single tenant's channel; inert until `start()`
    pub fn subscribe<F>(&self, tenant_id: &str, on_event: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription::new(
            Arc::clone(&self.transport),
            Target::Channel(self.channel_for(tenant_id)),
            Arc::new(on_event),
        )
    }

    /// Subscription to every tenant channel under this bus's prefix
    pub fn subscribe_all<F>(&self, on_event: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription::new(
            Arc::clone(&self.transport),
            Target::Pattern(self.all_tenants_pattern()),
            Arc::new(on_event),
        )
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum Target {
    Channel(String),
    Pattern(String),
}

/// Scoped subscription with an explicit start/stop lifecycle
///
/// `start()` attaches to the transport and only returns once the underlying
/// subscription is live, so events published afterwards are delivered.
/// Both `start()` and `stop()` are idempotent; dropping the subscription
/// stops it.
pub struct Subscription {
    transport: Arc<dyn PubSubTransport>,
    target: Target,
    handler: EventHandler,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn new(transport: Arc<dyn PubSubTransport>, target: Target, handler: EventHandler) -> Self {
        Self {
            transport,
            target,
            handler,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        let receiver = match &self.target {
            Target::Channel(channel) => self.transport.subscribe(channel).await?,
            Target::Pattern(pattern) => self.transport.psubscribe(pattern).await?,
        };

        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            // lost a race with a concurrent start(); our receiver is dropped here
            return Ok(());
        }
        let handler = Arc::clone(&self.handler);
        *slot = Some(tokio::spawn(deliver(receiver, handler)));
        tracing::debug!(target_name = %self.target_name(), "👂 Subscription started");
        Ok(())
    }

    /// Detach from the transport; undelivered events are dropped
    pub fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!(target_name = %self.target_name(), "🔇 Subscription stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn target_name(&self) -> &str {
        match &self.target {
            Target::Channel(name) | Target::Pattern(name) => name,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn deliver(mut receiver: broadcast::Receiver<TransportMessage>, handler: EventHandler) {
    loop {
        match receiver.recv().await {
            Ok(message) => match serde_json::from_str::<Event>(&message.payload) {
                Ok(event) => handler(event),
                Err(e) => {
                    tracing::warn!(channel = %message.channel, "⚠️ Dropping undecodable event: {}", e)
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("⚠️ Subscriber lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Escape characters that carry meaning in channel names or glob patterns
fn escape_segment(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' | ':' | '*' | '?' | '[' | ']' => escaped.push_str(&format!("%{:02X}", c as u32)),
            _ => escaped.push(c),
        }
    }
    escaped
}
