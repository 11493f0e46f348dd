/// Event Layer
///
/// Tenant-isolated lifecycle events:
/// - Fixed event vocabulary (`agent.task.*`, `flow.submitted`, ...)
/// - Pub/sub transport trait with an in-process and a shared (SQLite) implementation
/// - Event Bus with start/stop scoped subscriptions

// Event record and type vocabulary
pub mod types;

// Transport seam: namespaced channels, fan-out, wildcard subscriptions
pub mod transport;

// Transport shared across processes through the backend's event log
pub mod sqlite;

// Tenant-scoped bus and subscriptions
pub mod bus;

pub use bus::{EventBus, EventHandler, Subscription};
pub use sqlite::SqliteTransport;
pub use transport::{MemoryTransport, PubSubTransport};
pub use types::{Event, EventType};
