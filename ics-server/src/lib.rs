//! # ics-server
//!
//! Incremental Change Synchronization (ICS) and FastTransfer engine for a
//! MAPI mailbox server.
//!
//! This crate drives the pure building blocks of `ics-core` against a
//! mailbox store:
//! - Download contexts export the delta of a folder's contents or hierarchy
//!   since the client's state, produced lazily as GetBuffer pulls chunks
//! - Collectors import client changes, deletions, moves and read flags
//! - State upload and GetTransferState move the four state sets
//! - CopyTo serves plain FastTransfer copies of folders and messages
//!
//! ## Architecture
//!
//! ```text
//!  RopRequest ──► IcsServer ──► Connection (HandleTable)
//!                                  │
//!                 ┌────────────────┼─────────────────┐
//!                 ▼                ▼                 ▼
//!            SyncSession        Importer          copy_to
//!           (SyncExport +          │                 │
//!            ChunkCursor)          │                 │
//!                 └───────► dyn Store ◄──────────────┘
//! ```
//!
//! The store is a collaborator: [`store::Store`] bundles property access,
//! id allocation and the replica directory. [`store::MemoryStore`] is the
//! bundled in-memory backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod copy;
pub mod error;
pub mod export;
pub mod identity;
pub mod import;
pub mod object;
pub mod rop;
pub mod server;
pub mod session;
pub mod store;

pub use config::Config;
pub use connection::Connection;
pub use error::{IcsError, Result, StoreError};
pub use server::{IcsServer, MetricsSnapshot, ServerMetrics};
pub use session::{ExtraFlags, SyncFlags, SyncSession, SyncState, SyncType};
pub use store::{MemoryStore, Store};
