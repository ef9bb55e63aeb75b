//! Sync import pipeline.
//!
//! Applies client-sent changes through a collector context: message and
//! folder changes, deletions, moves and read-state changes. Identities arrive
//! as source keys and are resolved through the replica directory; an unknown
//! replica fails the whole call for single-object imports and only the item
//! for batches.

use crate::error::{IcsError, Result};
use crate::identity::Identity;
use crate::store::{
    DeleteMode, IdAllocator, MessageMove, MessagePath, ObjectKind, ObjectRef, PropertyStore,
    ReplicaDirectory, Store,
};
use ics_types::{tags, ChangeNumber, ObjectId, PropValue, TaggedValue, WireError, Xid};

/// ImportDeletes flag: the keys name folders.
pub const DELETE_HIERARCHY: u8 = 0x01;
/// ImportDeletes flag: delete permanently.
pub const DELETE_HARD: u8 = 0x02;
/// ImportMessageChange flag: the message is folder associated.
pub const IMPORT_ASSOCIATED: u8 = 0x10;

/// Outcome of a batch import.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Items applied.
    pub applied: usize,
    /// Items that failed, by position in the request.
    pub failed: Vec<(usize, IcsError)>,
}

impl ImportReport {
    fn record(&mut self, index: usize, result: Result<()>, what: &str) {
        match result {
            Ok(()) => self.applied += 1,
            Err(err) => {
                tracing::warn!("{} item {} not applied: {}", what, index, err);
                self.failed.push((index, err));
            }
        }
    }
}

/// One entry of an ImportReadStateChanges blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStateChange {
    /// Message named by its source key XID.
    pub message: Xid,
    /// Whether to mark the message read.
    pub mark_as_read: bool,
}

/// Split a MessageReadState blob: `u16 size`, `size` bytes of XID, `u8` flag.
pub fn parse_read_states(mut blob: &[u8]) -> Result<Vec<ReadStateChange>> {
    let mut changes = Vec::new();
    while !blob.is_empty() {
        if blob.len() < 2 {
            return Err(WireError::Truncated {
                what: "read state size",
                needed: 2,
                available: blob.len(),
            }
            .into());
        }
        let size = usize::from(u16::from_le_bytes([blob[0], blob[1]]));
        let needed = 2 + size + 1;
        if blob.len() < needed {
            return Err(WireError::Truncated {
                what: "read state entry",
                needed,
                available: blob.len(),
            }
            .into());
        }
        changes.push(ReadStateChange {
            message: Xid::from_bytes(&blob[2..2 + size])?,
            mark_as_read: blob[2 + size] != 0,
        });
        blob = &blob[needed..];
    }
    Ok(changes)
}

/// Imports into the folder of a collector.
#[derive(Clone, Copy)]
pub struct Importer<'a> {
    store: &'a dyn Store,
    folder: ObjectId,
}

impl<'a> Importer<'a> {
    /// Importer for a collector on `folder`.
    pub fn new(store: &'a dyn Store, folder: ObjectId) -> Self {
        Self { store, folder }
    }

    fn identity(&self) -> Identity<'a> {
        Identity::new(self.store)
    }

    fn source_key_at(&self, values: &[TaggedValue], index: usize) -> Result<Vec<u8>> {
        match values.get(index) {
            Some(TaggedValue {
                tag,
                value: PropValue::Binary(bytes),
            }) if tag.id() == tags::SOURCE_KEY.id() || tag.id() == tags::PARENT_SOURCE_KEY.id() => {
                Ok(bytes.clone())
            }
            Some(other) => Err(IcsError::InvalidParameter(format!(
                "expected a source key at index {index}, found {}",
                other.tag
            ))),
            None => Err(IcsError::InvalidParameter(format!(
                "missing source key at index {index}"
            ))),
        }
    }

    fn stamp(&self, id: ObjectId, kind: ObjectKind) -> Result<ChangeNumber> {
        let cn = self.store.next_change_number()?;
        self.store.set_change_number(id, kind, cn)?;
        Ok(cn)
    }

    /// Create or update a message from its property row (source key first)
    /// and return its id.
    pub fn import_message_change(&self, values: &[TaggedValue], flags: u8) -> Result<ObjectId> {
        let key = self.source_key_at(values, 0)?;
        let mid = match self.identity().parse_source_key(&key) {
            Ok(mid) => mid,
            Err(IcsError::UnknownReplica(guid)) => {
                return Err(IcsError::NotFound(format!("message of unknown replica {guid}")))
            }
            Err(err) => return Err(err),
        };
        let path = MessagePath::top(mid);

        if self.store.exists(&ObjectRef::Message(path.clone()))? {
            let folder = self.store.parent_folder(mid, ObjectKind::Message)?;
            if folder != self.folder {
                return Err(IcsError::InvalidParameter(format!(
                    "message {mid} lives in folder {folder}, not {}",
                    self.folder
                )));
            }
        } else {
            self.store
                .create_message(self.folder, mid, flags & IMPORT_ASSOCIATED != 0)?;
        }

        self.store
            .set_properties(&ObjectRef::Message(path), &values[1..])?;
        let cn = self.stamp(mid, ObjectKind::Message)?;
        tracing::debug!("imported message change {} as {}", mid, cn);
        Ok(mid)
    }

    /// Create, move or update a folder and return its id.
    ///
    /// `hierarchy` holds the parent source key at index 0 (empty for the
    /// collector's folder) and the folder's source key at index 1.
    pub fn import_hierarchy_change(
        &self,
        hierarchy: &[TaggedValue],
        properties: &[TaggedValue],
    ) -> Result<ObjectId> {
        let ident = self.identity();
        let single = |err: IcsError| match err {
            IcsError::UnknownReplica(guid) => {
                IcsError::NotFound(format!("folder of unknown replica {guid}"))
            }
            other => other,
        };

        let parent_key = self.source_key_at(hierarchy, 0)?;
        let parent = if parent_key.is_empty() {
            self.folder
        } else {
            ident.parse_source_key(&parent_key).map_err(single)?
        };
        let fid = ident
            .parse_source_key(&self.source_key_at(hierarchy, 1)?)
            .map_err(single)?;

        if self.store.exists(&ObjectRef::Folder(fid))? {
            let current = self.store.parent_folder(fid, ObjectKind::Folder)?;
            if current != parent {
                tracing::debug!("moving folder {} from {} to {}", fid, current, parent);
                self.store.move_folder(fid, parent)?;
            }
        } else {
            self.store.create_folder(parent, fid)?;
        }

        let values: Vec<TaggedValue> = hierarchy[2..]
            .iter()
            .chain(properties)
            .filter(|tv| tv.tag.id() != tags::SOURCE_KEY.id() && tv.tag.id() != tags::PARENT_SOURCE_KEY.id())
            .cloned()
            .collect();
        self.store.set_properties(&ObjectRef::Folder(fid), &values)?;
        let cn = self.stamp(fid, ObjectKind::Folder)?;
        tracing::debug!("imported folder change {} under {} as {}", fid, parent, cn);
        Ok(fid)
    }

    /// Delete the objects named by `keys`. Items that fail are reported and
    /// the rest are still deleted.
    pub fn import_deletes(&self, flags: u8, keys: &[Vec<u8>]) -> ImportReport {
        let kind = if flags & DELETE_HIERARCHY != 0 {
            ObjectKind::Folder
        } else {
            ObjectKind::Message
        };
        let mode = if flags & DELETE_HARD != 0 {
            DeleteMode::Hard
        } else {
            DeleteMode::Soft
        };

        let mut report = ImportReport::default();
        for (index, key) in keys.iter().enumerate() {
            let result = self.delete_one(key, kind, mode);
            report.record(index, result, "delete");
        }
        tracing::debug!(
            "imported {:?} deletes: {} applied, {} failed",
            kind,
            report.applied,
            report.failed.len()
        );
        report
    }

    fn delete_one(&self, key: &[u8], kind: ObjectKind, mode: DeleteMode) -> Result<()> {
        let id = self.identity().parse_source_key(key)?;
        let cn = self.store.next_change_number()?;
        self.store.delete_object(id, kind, mode, cn)?;
        if kind == ObjectKind::Message {
            self.store.unindex(id)?;
        }
        Ok(())
    }

    /// Resolve a replica-relative id: the counter of an XID taken under the
    /// local replica, whatever GUID it carries.
    fn local_id(&self, bytes: &[u8]) -> Result<ObjectId> {
        let xid = Xid::from_bytes(bytes)?;
        let counter = xid.counter().ok_or_else(|| {
            IcsError::InvalidParameter(format!("id of {} bytes", bytes.len()))
        })?;
        let (local, _) = self.store.local_replica();
        Ok(ObjectId::new(local, counter))
    }

    /// Move a message into the collector's folder under a new id, rekeyed
    /// with `change_key` and `predecessor_change_list`.
    pub fn import_message_move(
        &self,
        source_folder: &[u8],
        source_message: &[u8],
        predecessor_change_list: &[u8],
        destination_message: &[u8],
        change_key: &[u8],
    ) -> Result<ObjectId> {
        let request = MessageMove {
            source_folder: self.local_id(source_folder)?,
            source_mid: self.local_id(source_message)?,
            destination_folder: self.folder,
            destination_mid: self.local_id(destination_message)?,
            change_key: change_key.to_vec(),
            predecessor_change_list: predecessor_change_list.to_vec(),
            change_number: self.store.next_change_number()?,
        };
        self.store.move_message(&request)?;
        tracing::debug!(
            "moved message {} from {} to {} as {}",
            request.source_mid,
            request.source_folder,
            request.destination_folder,
            request.destination_mid
        );
        Ok(request.destination_mid)
    }

    /// Apply a MessageReadState blob. A malformed blob fails the call; a
    /// message that cannot be resolved or updated fails only its entry.
    pub fn import_read_state_changes(&self, blob: &[u8]) -> Result<ImportReport> {
        let changes = parse_read_states(blob)?;
        let ident = self.identity();
        let mut report = ImportReport::default();
        for (index, change) in changes.iter().enumerate() {
            let result = ident.xid_to_object_id(&change.message).and_then(|mid| {
                let cn = self.store.next_change_number()?;
                self.store.set_read_flag(mid, change.mark_as_read, cn)?;
                Ok(())
            });
            report.record(index, result, "read state");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use ics_types::{GlobalCounter, ReplicaGuid, SourceKey};

    fn setup() -> (MemoryStore, ObjectId) {
        let store = MemoryStore::new();
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        (store, inbox)
    }

    fn key_value(tag: ics_types::PropTag, key: Vec<u8>) -> TaggedValue {
        TaggedValue::new(tag, PropValue::Binary(key))
    }

    fn fresh_key(store: &MemoryStore) -> (ObjectId, Vec<u8>) {
        let id = store.next_object_id().unwrap();
        let key = Identity::new(store).source_key_of(id).unwrap().to_bytes();
        (id, key)
    }

    fn read_state_entry(xid: &Xid, read: bool) -> Vec<u8> {
        let bytes = xid.to_bytes();
        let mut entry = (bytes.len() as u16).to_le_bytes().to_vec();
        entry.extend_from_slice(&bytes);
        entry.push(u8::from(read));
        entry
    }

    #[test]
    fn message_change_creates_then_updates() {
        let (store, inbox) = setup();
        let importer = Importer::new(&store, inbox);
        let (mid, key) = fresh_key(&store);

        let row = vec![
            key_value(tags::SOURCE_KEY, key.clone()),
            TaggedValue::new(tags::SUBJECT, PropValue::Unicode("first".into())),
        ];
        assert_eq!(importer.import_message_change(&row, 0).unwrap(), mid);
        let obj = ObjectRef::Message(MessagePath::top(mid));
        let first_cn = store.get_property(&obj, tags::CHANGE_NUMBER).unwrap();

        let row = vec![
            key_value(tags::SOURCE_KEY, key),
            TaggedValue::new(tags::SUBJECT, PropValue::Unicode("second".into())),
        ];
        importer.import_message_change(&row, 0).unwrap();
        assert_eq!(
            store.get_property(&obj, tags::SUBJECT).unwrap(),
            Some(PropValue::Unicode("second".into()))
        );
        assert_ne!(store.get_property(&obj, tags::CHANGE_NUMBER).unwrap(), first_cn);
    }

    #[test]
    fn associated_flag_creates_fai_message() {
        let (store, inbox) = setup();
        let (mid, key) = fresh_key(&store);
        Importer::new(&store, inbox)
            .import_message_change(&[key_value(tags::SOURCE_KEY, key)], IMPORT_ASSOCIATED)
            .unwrap();
        let obj = ObjectRef::Message(MessagePath::top(mid));
        assert_eq!(
            store.get_property(&obj, tags::ASSOCIATED).unwrap(),
            Some(PropValue::Bool(true))
        );
    }

    #[test]
    fn message_change_from_unknown_replica_is_not_found() {
        let (store, inbox) = setup();
        let key = SourceKey::new(ReplicaGuid::random(), GlobalCounter::new(40)).to_bytes();
        let err = Importer::new(&store, inbox)
            .import_message_change(&[key_value(tags::SOURCE_KEY, key)], 0)
            .unwrap_err();
        assert!(matches!(err, IcsError::NotFound(_)));
    }

    #[test]
    fn message_change_without_source_key_is_invalid() {
        let (store, inbox) = setup();
        let row = vec![TaggedValue::new(tags::SUBJECT, PropValue::Unicode("x".into()))];
        let err = Importer::new(&store, inbox)
            .import_message_change(&row, 0)
            .unwrap_err();
        assert!(matches!(err, IcsError::InvalidParameter(_)));
    }

    #[test]
    fn hierarchy_change_with_empty_parent_creates_under_collector() {
        let (store, inbox) = setup();
        let (fid, key) = fresh_key(&store);
        let hierarchy = vec![
            key_value(tags::PARENT_SOURCE_KEY, Vec::new()),
            key_value(tags::SOURCE_KEY, key),
            TaggedValue::new(tags::DISPLAY_NAME, PropValue::Unicode("Projects".into())),
        ];
        let created = Importer::new(&store, inbox)
            .import_hierarchy_change(&hierarchy, &[])
            .unwrap();
        assert_eq!(created, fid);
        assert_eq!(store.parent_folder(fid, ObjectKind::Folder).unwrap(), inbox);
        assert_eq!(
            store
                .get_property(&ObjectRef::Folder(fid), tags::DISPLAY_NAME)
                .unwrap(),
            Some(PropValue::Unicode("Projects".into()))
        );
    }

    #[test]
    fn hierarchy_change_moves_existing_folder() {
        let (store, inbox) = setup();
        let archive = store.add_folder(inbox, "Archive").unwrap();
        let moving = store.add_folder(inbox, "2023").unwrap();
        let ident = Identity::new(&store);

        let hierarchy = vec![
            key_value(tags::PARENT_SOURCE_KEY, ident.source_key_of(archive).unwrap().to_bytes()),
            key_value(tags::SOURCE_KEY, ident.source_key_of(moving).unwrap().to_bytes()),
        ];
        Importer::new(&store, inbox)
            .import_hierarchy_change(&hierarchy, &[])
            .unwrap();
        assert_eq!(store.parent_folder(moving, ObjectKind::Folder).unwrap(), archive);
    }

    #[test]
    fn deletes_commit_the_items_that_resolve() {
        let (store, inbox) = setup();
        let keep = store.add_message(inbox, "keep", false).unwrap();
        let gone = store.add_message(inbox, "gone", false).unwrap();
        let ident = Identity::new(&store);
        let keys = vec![
            SourceKey::new(ReplicaGuid::random(), GlobalCounter::new(3)).to_bytes(),
            ident.source_key_of(gone).unwrap().to_bytes(),
            vec![0x01, 0x02],
        ];

        let report = Importer::new(&store, inbox).import_deletes(DELETE_HARD, &keys);
        assert_eq!(report.applied, 1);
        assert_eq!(
            report.failed.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(!store.exists(&ObjectRef::Message(MessagePath::top(gone))).unwrap());
        assert!(store.exists(&ObjectRef::Message(MessagePath::top(keep))).unwrap());
    }

    #[test]
    fn hierarchy_deletes_recurse() {
        let (store, inbox) = setup();
        let parent = store.add_folder(inbox, "parent").unwrap();
        let child = store.add_folder(parent, "child").unwrap();
        let key = Identity::new(&store).source_key_of(parent).unwrap().to_bytes();

        let report = Importer::new(&store, inbox).import_deletes(DELETE_HIERARCHY, &[key]);
        assert_eq!(report.applied, 1);
        assert!(!store.exists(&ObjectRef::Folder(child)).unwrap());
    }

    #[test]
    fn message_move_rekeys_into_collector_folder() {
        let (store, inbox) = setup();
        let drafts = store.add_folder(store.root_folder(), "Drafts").unwrap();
        let mid = store.add_message(drafts, "moving", false).unwrap();
        let dest = store.next_object_id().unwrap();
        let guid = store.local_replica().1;
        let xid = |id: ObjectId| Xid::from_counter(guid, id.counter()).to_bytes();
        let change_key = Xid::from_counter(guid, GlobalCounter::new(900)).to_bytes();

        let moved = Importer::new(&store, inbox)
            .import_message_move(&xid(drafts), &xid(mid), &[], &xid(dest), &change_key)
            .unwrap();
        assert_eq!(moved, dest);
        assert_eq!(store.parent_folder(dest, ObjectKind::Message).unwrap(), inbox);
        assert_eq!(
            store
                .get_property(&ObjectRef::Message(MessagePath::top(dest)), tags::CHANGE_KEY)
                .unwrap(),
            Some(PropValue::Binary(change_key))
        );
    }

    #[test]
    fn message_move_from_wrong_folder_fails() {
        let (store, inbox) = setup();
        let drafts = store.add_folder(store.root_folder(), "Drafts").unwrap();
        let mid = store.add_message(inbox, "here", false).unwrap();
        let dest = store.next_object_id().unwrap();
        let guid = store.local_replica().1;
        let xid = |id: ObjectId| Xid::from_counter(guid, id.counter()).to_bytes();

        let err = Importer::new(&store, inbox)
            .import_message_move(&xid(drafts), &xid(mid), &[], &xid(dest), &xid(dest))
            .unwrap_err();
        assert!(matches!(err, IcsError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn read_state_changes_apply_per_entry() {
        let (store, inbox) = setup();
        let mid = store.add_message(inbox, "unread", false).unwrap();
        let guid = store.local_replica().1;

        let mut blob = read_state_entry(&Xid::from_counter(guid, mid.counter()), true);
        blob.extend(read_state_entry(
            &Xid::from_counter(ReplicaGuid::random(), GlobalCounter::new(8)),
            true,
        ));

        let report = Importer::new(&store, inbox)
            .import_read_state_changes(&blob)
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed.len(), 1);
        let flags = store
            .get_property(&ObjectRef::Message(MessagePath::top(mid)), tags::MESSAGE_FLAGS)
            .unwrap();
        assert_eq!(flags, Some(PropValue::I32(tags::MSGFLAG_READ)));
    }

    #[test]
    fn truncated_read_state_blob_is_rejected() {
        let (store, inbox) = setup();
        let err = Importer::new(&store, inbox)
            .import_read_state_changes(&[22, 0, 1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, IcsError::Wire(WireError::Truncated { .. })));
    }

    #[test]
    fn parse_read_states_splits_entries() {
        let guid = ReplicaGuid::random();
        let a = Xid::from_counter(guid, GlobalCounter::new(1));
        let b = Xid::from_counter(guid, GlobalCounter::new(2));
        let mut blob = read_state_entry(&a, true);
        blob.extend(read_state_entry(&b, false));

        let parsed = parse_read_states(&blob).unwrap();
        assert_eq!(
            parsed,
            vec![
                ReadStateChange { message: a, mark_as_read: true },
                ReadStateChange { message: b, mark_as_read: false },
            ]
        );
    }
}
