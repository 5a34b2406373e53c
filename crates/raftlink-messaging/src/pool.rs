//! Per-destination connection pool.
//!
//! Entries are keyed by `(address, resolved ip)` so a changed DNS answer
//! gets its own connections. Each entry holds a fixed number of slots; the
//! message type hashes to a slot, which keeps unrelated RPC families off
//! each other's connections.
//!
//! A slot is filled lazily under its own lock, so concurrent callers for a
//! dead slot establish one connection between them. When a connection
//! closes, its slot is cleared only if it still holds that same connection.

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use raftlink_core::Address;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::error::{MessagingError, MessagingResult};
use crate::handshake::deterministic_hash;

/// Attempts per `get_channel` call before giving up on a slot whose fresh
/// connections keep dying.
pub const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Establishes connections for the pool. Injected for testability.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: ClientConnection;

    async fn connect(&self, address: &Address, ip: IpAddr) -> MessagingResult<Arc<Self::Connection>>;
}

/// A destination as resolved at acquire time. A new IP for the same
/// address gets its own pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub address: Address,
    pub ip: IpAddr,
}

struct PoolEntry<C> {
    slots: Vec<Mutex<Option<Arc<C>>>>,
}

impl<C> PoolEntry<C> {
    fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
        }
    }
}

/// Per-destination connection slots, one connection per slot.
pub struct ChannelPool<F: ConnectionFactory> {
    factory: Arc<F>,
    size: usize,
    entries: DashMap<PoolKey, Arc<PoolEntry<F::Connection>>>,
}

impl<F: ConnectionFactory> ChannelPool<F> {
    /// A pool with `size` slots per destination (at least one).
    pub fn new(factory: Arc<F>, size: usize) -> Self {
        Self {
            factory,
            size: size.max(1),
            entries: DashMap::new(),
        }
    }

    /// Slots per destination.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slot used for `message_type`.
    pub fn slot_index(&self, message_type: &str) -> usize {
        (deterministic_hash(message_type) % self.size as u64) as usize
    }

    /// Get a live connection to `address` for `message_type`, connecting if
    /// the slot is empty or its connection has closed.
    pub async fn get_channel(
        &self,
        address: &Address,
        message_type: &str,
    ) -> MessagingResult<Arc<F::Connection>> {
        let ip = resolve(address).await?;
        let key = PoolKey {
            address: address.clone(),
            ip,
        };
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PoolEntry::new(self.size)))
            .value()
            .clone();
        let index = self.slot_index(message_type);

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let mut slot = entry.slots[index].lock().await;
            if let Some(connection) = slot.as_ref() {
                if connection.is_active() {
                    return Ok(connection.clone());
                }
                debug!(address = %address, slot = index, "discarding closed pooled connection");
                *slot = None;
            }

            let connection = self.factory.connect(&key.address, key.ip).await?;
            *slot = Some(connection.clone());
            drop(slot);

            self.clear_on_close(&entry, index, &connection);
            if connection.is_active() {
                debug!(address = %address, ip = %ip, slot = index, "pooled connection established");
                return Ok(connection);
            }
            warn!(address = %address, attempt, "new connection closed before first use");
        }

        Err(MessagingError::Connect {
            address: address.to_string(),
            reason: format!("connection closed immediately {MAX_ACQUIRE_ATTEMPTS} times"),
        })
    }

    fn clear_on_close(
        &self,
        entry: &Arc<PoolEntry<F::Connection>>,
        index: usize,
        connection: &Arc<F::Connection>,
    ) {
        let closed = connection.closed();
        let entry: Weak<PoolEntry<F::Connection>> = Arc::downgrade(entry);
        let connection: Weak<F::Connection> = Arc::downgrade(connection);

        tokio::spawn(async move {
            closed.await;
            let Some(entry) = entry.upgrade() else {
                return;
            };
            let mut slot = entry.slots[index].lock().await;
            let same = slot
                .as_ref()
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), connection.as_ptr()));
            if same {
                *slot = None;
            }
        });
    }

    /// Number of destinations with an entry.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Close every pooled connection and drop all entries.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        self.entries.clear();
        for entry in entries {
            for slot in &entry.slots {
                if let Some(connection) = slot.lock().await.take() {
                    connection.close();
                }
            }
        }
    }
}

/// Resolve without blocking the runtime.
async fn resolve(address: &Address) -> MessagingResult<IpAddr> {
    if let Some(ip) = address.ip() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((address.host(), address.port()))
        .await
        .map_err(|e| MessagingError::Connect {
            address: address.to_string(),
            reason: format!("resolve failed: {e}"),
        })?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| MessagingError::Connect {
            address: address.to_string(),
            reason: "resolve returned no addresses".to_string(),
        })
}
