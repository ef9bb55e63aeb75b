//! Store collaborators for the sync engine.
//!
//! The engine never owns mailbox data. It reads and mutates folders and
//! messages through three traits:
//! - [`PropertyStore`] - properties, tables, deletion log, mutations
//! - [`IdAllocator`] - change numbers and object ids
//! - [`ReplicaDirectory`] - replica GUID / REPLID mapping
//!
//! [`Store`] bundles the three; [`MemoryStore`] is the in-memory backend
//! used by tests and the CLI demo.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreResult;
use ics_types::{
    ChangeNumber, GlobalCounter, NamedProperty, ObjectId, PropTag, PropValue, ReplicaGuid,
    ReplicaId, TaggedValue,
};

/// A message, possibly embedded in attachments of other messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessagePath {
    /// Top-level message id.
    pub mid: ObjectId,
    /// Attachment numbers leading to the embedded message, outermost first.
    pub embedded: Vec<u32>,
}

impl MessagePath {
    /// Path of a top-level message.
    pub fn top(mid: ObjectId) -> Self {
        Self {
            mid,
            embedded: Vec::new(),
        }
    }

    /// Path of the message embedded in attachment `attach_num` of this one.
    pub fn embedded_in(&self, attach_num: u32) -> Self {
        let mut embedded = self.embedded.clone();
        embedded.push(attach_num);
        Self {
            mid: self.mid,
            embedded,
        }
    }

    /// Whether this is a top-level message.
    pub fn is_top(&self) -> bool {
        self.embedded.is_empty()
    }
}

/// Reference to a store object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    /// A folder.
    Folder(ObjectId),
    /// A message.
    Message(MessagePath),
    /// An attachment of a message.
    Attachment(MessagePath, u32),
}

/// The tables of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableType {
    /// Normal messages.
    Messages,
    /// Folder associated information (FAI) messages.
    Fai,
    /// Subfolders.
    Folders,
}

/// Row order of a table query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending object id.
    IdAscending,
    /// Newest delivery time first.
    DeliveryTimeDescending,
}

/// How a delete is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Keep the object recoverable.
    Soft,
    /// Remove the object.
    Hard,
}

/// Folder or message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A folder.
    Folder,
    /// A message.
    Message,
}

/// Arguments of a move-with-rekey.
#[derive(Debug, Clone)]
pub struct MessageMove {
    /// Folder the message currently lives in.
    pub source_folder: ObjectId,
    /// Current message id.
    pub source_mid: ObjectId,
    /// Folder to move into.
    pub destination_folder: ObjectId,
    /// Id the message takes in the destination.
    pub destination_mid: ObjectId,
    /// New change key.
    pub change_key: Vec<u8>,
    /// New predecessor change list.
    pub predecessor_change_list: Vec<u8>,
    /// Change number stamped on the moved message.
    pub change_number: ChangeNumber,
}

/// Property access, tables, deletion log and mutations.
pub trait PropertyStore: Send + Sync {
    /// Root folder of the mailbox.
    fn root_folder(&self) -> ObjectId;

    /// Values of `tags` on `obj`, `None` where a property is not set.
    ///
    /// Besides stored properties, backends answer the computed tags
    /// `ChangeNumber`, `Mid`, `FolderId`, `ParentFolderId`, `Associated` and
    /// `MessageSize`.
    fn get_properties(&self, obj: &ObjectRef, tags: &[PropTag])
        -> StoreResult<Vec<Option<PropValue>>>;

    /// Tags of the properties stored on `obj`.
    fn available_properties(&self, obj: &ObjectRef) -> StoreResult<Vec<PropTag>>;

    /// Name mapping of a named property id.
    fn named_property(&self, tag: PropTag) -> Option<NamedProperty>;

    /// Ids in a table of `folder`, restricted to objects whose change number
    /// is above `changed_after`.
    fn query_table(
        &self,
        folder: ObjectId,
        table: TableType,
        changed_after: Option<ChangeNumber>,
        order: SortOrder,
    ) -> StoreResult<Vec<ObjectId>>;

    /// Ids deleted from a table of `folder` (for folders: anywhere below it)
    /// by a change numbered above `after`.
    fn deleted_since(
        &self,
        folder: ObjectId,
        table: TableType,
        after: ChangeNumber,
    ) -> StoreResult<Vec<ObjectId>>;

    /// Recipient rows of a message.
    fn recipients(&self, msg: &MessagePath) -> StoreResult<Vec<Vec<TaggedValue>>>;

    /// Attachment numbers of a message, ascending.
    fn attachment_numbers(&self, msg: &MessagePath) -> StoreResult<Vec<u32>>;

    /// Whether an attachment holds an embedded message.
    fn has_embedded(&self, msg: &MessagePath, attach_num: u32) -> StoreResult<bool>;

    /// Whether a live object exists.
    fn exists(&self, obj: &ObjectRef) -> StoreResult<bool>;

    /// Folder holding a message, or parent of a folder.
    fn parent_folder(&self, id: ObjectId, kind: ObjectKind) -> StoreResult<ObjectId>;

    /// Create an empty folder.
    fn create_folder(&self, parent: ObjectId, fid: ObjectId) -> StoreResult<()>;

    /// Create an empty message.
    fn create_message(&self, folder: ObjectId, mid: ObjectId, associated: bool)
        -> StoreResult<()>;

    /// Set (or replace) properties on an object.
    fn set_properties(&self, obj: &ObjectRef, values: &[TaggedValue]) -> StoreResult<()>;

    /// Stamp a new change number on a folder or top-level message.
    fn set_change_number(&self, id: ObjectId, kind: ObjectKind, cn: ChangeNumber)
        -> StoreResult<()>;

    /// Move a folder under a new parent.
    fn move_folder(&self, fid: ObjectId, new_parent: ObjectId) -> StoreResult<()>;

    /// Move a message to another folder under a new id.
    fn move_message(&self, request: &MessageMove) -> StoreResult<()>;

    /// Delete a folder (recursively) or a message, logging it under `cn`.
    fn delete_object(
        &self,
        id: ObjectId,
        kind: ObjectKind,
        mode: DeleteMode,
        cn: ChangeNumber,
    ) -> StoreResult<()>;

    /// Set or clear the read flag of a message.
    fn set_read_flag(&self, mid: ObjectId, read: bool, cn: ChangeNumber) -> StoreResult<()>;

    /// Remove a message id from the indexing layer.
    fn unindex(&self, mid: ObjectId) -> StoreResult<()>;

    /// Read a single property.
    fn get_property(&self, obj: &ObjectRef, tag: PropTag) -> StoreResult<Option<PropValue>> {
        Ok(self.get_properties(obj, &[tag])?.pop().flatten())
    }
}

/// Allocation of change numbers and object ids.
///
/// Counters of the local replica. Object ids and change numbers are minted
/// from separate counters.
pub trait IdAllocator: Send + Sync {
    /// Mint a change number.
    fn next_change_number(&self) -> StoreResult<ChangeNumber>;

    /// Mint an object id.
    fn next_object_id(&self) -> StoreResult<ObjectId>;

    /// Reserve `count` consecutive object id counters, returning the first.
    fn reserve_counters(&self, count: u32) -> StoreResult<GlobalCounter>;

    /// The next change number counter that would be issued.
    fn next_unissued(&self) -> GlobalCounter;

    /// The next object id counter that would be issued.
    fn next_unissued_id(&self) -> GlobalCounter;
}

/// Replica GUID / REPLID mapping of the mailbox.
pub trait ReplicaDirectory: Send + Sync {
    /// REPLID and GUID of the local replica.
    fn local_replica(&self) -> (ReplicaId, ReplicaGuid);

    /// GUID registered for a REPLID.
    fn replica_guid(&self, id: ReplicaId) -> Option<ReplicaGuid>;

    /// REPLID registered for a GUID.
    fn replica_id(&self, guid: &ReplicaGuid) -> Option<ReplicaId>;
}

/// Everything the engine needs from a mailbox backend.
pub trait Store: PropertyStore + IdAllocator + ReplicaDirectory {}

impl<T: PropertyStore + IdAllocator + ReplicaDirectory> Store for T {}
