//! Connection registry.
//!
//! `IcsServer` owns the configuration, the shared store and the open
//! connections. Each connection is locked for the duration of one ROP; calls
//! on different connections run concurrently.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{IcsError, Result};
use crate::rop::{RopReply, RopRequest};
use crate::store::Store;
use dashmap::DashMap;
use ics_types::ErrorCode;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Operational counters.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// GetBuffer chunks delivered.
    pub chunks_delivered: AtomicU64,
    /// FastTransfer bytes delivered.
    pub bytes_exported: AtomicU64,
    /// Objects changed, deleted, moved or marked through collectors.
    pub objects_imported: AtomicU64,
    /// Connections accepted.
    pub connections_total: AtomicU64,
    /// ROPs that returned an error code.
    pub errors_total: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// GetBuffer chunks delivered.
    pub chunks_delivered: u64,
    /// FastTransfer bytes delivered.
    pub bytes_exported: u64,
    /// Objects applied through collectors.
    pub objects_imported: u64,
    /// Connections accepted.
    pub connections_total: u64,
    /// ROPs that returned an error code.
    pub errors_total: u64,
}

impl ServerMetrics {
    pub(crate) fn record_chunk(&self, bytes: usize) {
        self.chunks_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_exported.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_imported(&self, count: usize) {
        self.objects_imported.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
            bytes_exported: self.bytes_exported.load(Ordering::Relaxed),
            objects_imported: self.objects_imported.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// The ICS server: store, configuration and open connections.
pub struct IcsServer {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    metrics: Arc<ServerMetrics>,
    connections: DashMap<u64, Mutex<Connection>>,
    // Slots taken against `max_connections`; reserved before the insert.
    open: AtomicUsize,
    next_id: AtomicU64,
}

impl std::fmt::Debug for IcsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcsServer")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .field("connections_count", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl IcsServer {
    /// Create a server over `store`.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            metrics: Arc::new(ServerMetrics::default()),
            connections: DashMap::new(),
            open: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the shared store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open a connection and return its id.
    pub fn connect(&self) -> Result<u64> {
        let limit = self.config.server.max_connections;
        let reserved = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            });
        let open = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => {
                tracing::warn!("connection refused: limit of {} reached", limit);
                return Err(IcsError::TooManyConnections { limit });
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(
            id,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        );
        self.connections.insert(id, Mutex::new(connection));
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!("connection {} opened ({} open)", id, open);
        Ok(id)
    }

    /// Close a connection, releasing every handle it holds.
    pub fn disconnect(&self, id: u64) -> Result<()> {
        let (_, connection) = self
            .connections
            .remove(&id)
            .ok_or(IcsError::UnknownConnection(id))?;
        self.open.fetch_sub(1, Ordering::AcqRel);
        let connection = connection.into_inner().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            "connection {} closed, {} handles released",
            id,
            connection.handle_count()
        );
        Ok(())
    }

    /// Run `f` against a connection, holding its lock.
    pub fn with_connection<R>(&self, id: u64, f: impl FnOnce(&mut Connection) -> R) -> Result<R> {
        let entry = self
            .connections
            .get(&id)
            .ok_or(IcsError::UnknownConnection(id))?;
        let mut connection = entry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut connection))
    }

    /// Dispatch one ROP on a connection.
    pub fn dispatch(&self, id: u64, handle: u32, request: RopRequest) -> RopReply {
        let opnum = request.opnum();
        match self.with_connection(id, |connection| connection.dispatch(handle, request)) {
            Ok(reply) => reply,
            Err(err) => {
                self.metrics.record_error();
                tracing::debug!("rop 0x{:02x} on connection {}: {}", opnum, id, err);
                RopReply::failure(opnum, ErrorCode::NullObject)
            }
        }
    }
}
