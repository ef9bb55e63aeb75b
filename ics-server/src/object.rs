//! Objects reachable through ROP handles and the per-connection handle table.

use crate::error::{IcsError, Result};
use crate::session::SyncSession;
use crate::store::{MessagePath, TableType};
use ics_core::{Chunk, ChunkCursor, TransferBuffer};
use ics_types::ObjectId;
use std::collections::BTreeMap;

/// An eagerly built FastTransfer stream served by GetBuffer.
#[derive(Debug)]
pub struct FastTransferContext {
    buffer: TransferBuffer,
    cursor: ChunkCursor,
}

impl FastTransferContext {
    /// Wrap a complete stream.
    pub fn new(buffer: TransferBuffer, progress_margin: u32) -> Self {
        Self {
            buffer,
            cursor: ChunkCursor::new(progress_margin),
        }
    }

    /// The whole stream.
    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    /// Next chunk of at most `requested` bytes (modulo over-delivery).
    pub fn next_chunk(&mut self, requested: usize) -> Chunk {
        match self.cursor.next_chunk(&mut self.buffer, requested) {
            Ok(chunk) => chunk,
            Err(never) => match never {},
        }
    }
}

/// Anything a handle can refer to.
#[derive(Debug)]
pub enum MapiObject {
    /// The logged-on mailbox.
    Mailbox,
    /// An open folder.
    Folder(ObjectId),
    /// An open message.
    Message {
        /// Folder holding the top-level message.
        folder: ObjectId,
        /// Message (possibly embedded).
        path: MessagePath,
    },
    /// A table of a folder.
    Table {
        /// Folder the table belongs to.
        folder: ObjectId,
        /// Which table.
        table: TableType,
    },
    /// A property stream.
    Stream(Vec<u8>),
    /// An open attachment.
    Attachment {
        /// Message owning the attachment.
        message: MessagePath,
        /// Attachment number.
        attach_num: u32,
    },
    /// A notification subscription.
    Subscription,
    /// An ICS download or upload context.
    SyncContext(Box<SyncSession>),
    /// A FastTransfer source context.
    FtContext(FastTransferContext),
}

impl MapiObject {
    /// Short kind name used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MapiObject::Mailbox => "mailbox",
            MapiObject::Folder(_) => "folder",
            MapiObject::Message { .. } => "message",
            MapiObject::Table { .. } => "table",
            MapiObject::Stream(_) => "stream",
            MapiObject::Attachment { .. } => "attachment",
            MapiObject::Subscription => "subscription",
            MapiObject::SyncContext(_) => "sync context",
            MapiObject::FtContext(_) => "fast transfer context",
        }
    }
}

#[derive(Debug)]
struct Entry {
    object: MapiObject,
    parent: Option<u32>,
}

/// Handles owned by one connection.
///
/// Handles are opaque non-zero ids. Releasing a handle releases every
/// handle opened from it.
#[derive(Debug)]
pub struct HandleTable {
    entries: BTreeMap<u32, Entry>,
    next: u32,
    limit: usize,
}

impl HandleTable {
    /// Empty table allowing at most `limit` open handles.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
            limit,
        }
    }

    /// Register an object opened from `parent`.
    pub fn add(&mut self, object: MapiObject, parent: Option<u32>) -> Result<u32> {
        if self.entries.len() >= self.limit {
            return Err(IcsError::TooManyHandles { limit: self.limit });
        }
        if let Some(p) = parent {
            if !self.entries.contains_key(&p) {
                return Err(IcsError::InvalidHandle(p));
            }
        }
        while self.next == 0 || self.entries.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        self.entries.insert(handle, Entry { object, parent });
        Ok(handle)
    }

    /// Object behind a handle.
    pub fn get(&self, handle: u32) -> Result<&MapiObject> {
        self.entries
            .get(&handle)
            .map(|e| &e.object)
            .ok_or(IcsError::InvalidHandle(handle))
    }

    /// Mutable object behind a handle.
    pub fn get_mut(&mut self, handle: u32) -> Result<&mut MapiObject> {
        self.entries
            .get_mut(&handle)
            .map(|e| &mut e.object)
            .ok_or(IcsError::InvalidHandle(handle))
    }

    /// Release a handle and its descendants, returning how many were freed.
    pub fn release(&mut self, handle: u32) -> Result<usize> {
        if !self.entries.contains_key(&handle) {
            return Err(IcsError::InvalidHandle(handle));
        }
        let mut pending = vec![handle];
        let mut freed = 0;
        while let Some(h) = pending.pop() {
            if self.entries.remove(&h).is_some() {
                freed += 1;
            }
            pending.extend(
                self.entries
                    .iter()
                    .filter(|(_, e)| e.parent == Some(h))
                    .map(|(child, _)| *child),
            );
        }
        Ok(freed)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
