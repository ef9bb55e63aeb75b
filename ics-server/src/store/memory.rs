//! In-memory store backend.
//!
//! Holds one mailbox: a folder tree, messages with recipients and
//! attachments (attachments may embed messages), a deletion log and the
//! local replica's two counters: one for object ids, one for change numbers.

use super::{
    DeleteMode, IdAllocator, MessageMove, MessagePath, ObjectKind, ObjectRef, PropertyStore,
    ReplicaDirectory, SortOrder, TableType,
};
use crate::error::{StoreError, StoreResult};
use ics_types::{
    tags, ChangeNumber, FileTime, GlobalCounter, NamedProperty, ObjectId, PropTag, PropValue,
    ReplicaGuid, ReplicaId, TaggedValue,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Props = BTreeMap<PropTag, PropValue>;

#[derive(Debug, Clone, Default)]
struct MessageContent {
    props: Props,
    recipients: Vec<Vec<TaggedValue>>,
    attachments: BTreeMap<u32, AttachmentRecord>,
}

#[derive(Debug, Clone, Default)]
struct AttachmentRecord {
    props: Props,
    embedded: Option<Box<MessageContent>>,
}

#[derive(Debug, Clone)]
struct FolderRecord {
    parent: Option<ObjectId>,
    props: Props,
    cn: ChangeNumber,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct MessageRecord {
    folder: ObjectId,
    associated: bool,
    content: MessageContent,
    cn: ChangeNumber,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct DeletionRecord {
    id: ObjectId,
    table: TableType,
    folder: ObjectId,
    ancestors: Vec<ObjectId>,
    cn: ChangeNumber,
}

#[derive(Debug)]
struct Inner {
    local_id: ReplicaId,
    local_guid: ReplicaGuid,
    foreign: BTreeMap<ReplicaId, ReplicaGuid>,
    next_id: u64,
    next_cn: u64,
    root: ObjectId,
    folders: BTreeMap<ObjectId, FolderRecord>,
    messages: BTreeMap<ObjectId, MessageRecord>,
    indexed: BTreeSet<ObjectId>,
    deletions: Vec<DeletionRecord>,
    named: BTreeMap<u16, NamedProperty>,
}

fn allocate(counter: &mut u64, count: u64) -> StoreResult<GlobalCounter> {
    let first = *counter;
    let next = first.checked_add(count).ok_or(StoreError::CountersExhausted)?;
    if next > GlobalCounter::MAX.value() + 1 {
        return Err(StoreError::CountersExhausted);
    }
    *counter = next;
    Ok(GlobalCounter::new(first))
}

impl Inner {
    fn reserve_ids(&mut self, count: u64) -> StoreResult<GlobalCounter> {
        allocate(&mut self.next_id, count)
    }

    fn new_id(&mut self) -> StoreResult<ObjectId> {
        Ok(ObjectId::new(self.local_id, self.reserve_ids(1)?))
    }

    fn new_cn(&mut self) -> StoreResult<ChangeNumber> {
        Ok(ChangeNumber::new(self.local_id, allocate(&mut self.next_cn, 1)?))
    }

    fn folder(&self, fid: ObjectId) -> StoreResult<&FolderRecord> {
        self.folders
            .get(&fid)
            .filter(|f| !f.deleted)
            .ok_or_else(|| StoreError::not_found(format_args!("folder {fid}")))
    }

    fn folder_mut(&mut self, fid: ObjectId) -> StoreResult<&mut FolderRecord> {
        self.folders
            .get_mut(&fid)
            .filter(|f| !f.deleted)
            .ok_or_else(|| StoreError::not_found(format_args!("folder {fid}")))
    }

    fn message(&self, mid: ObjectId) -> StoreResult<&MessageRecord> {
        self.messages
            .get(&mid)
            .filter(|m| !m.deleted && self.indexed.contains(&mid))
            .ok_or_else(|| StoreError::not_found(format_args!("message {mid}")))
    }

    fn message_mut(&mut self, mid: ObjectId) -> StoreResult<&mut MessageRecord> {
        let indexed = self.indexed.contains(&mid);
        self.messages
            .get_mut(&mid)
            .filter(|m| !m.deleted && indexed)
            .ok_or_else(|| StoreError::not_found(format_args!("message {mid}")))
    }

    fn content(&self, path: &MessagePath) -> StoreResult<&MessageContent> {
        let mut content = &self.message(path.mid)?.content;
        for n in &path.embedded {
            content = content
                .attachments
                .get(n)
                .and_then(|a| a.embedded.as_deref())
                .ok_or_else(|| StoreError::not_found(format_args!("embedded message {n}")))?;
        }
        Ok(content)
    }

    fn content_mut(&mut self, path: &MessagePath) -> StoreResult<&mut MessageContent> {
        let mut content = &mut self.message_mut(path.mid)?.content;
        for n in &path.embedded {
            content = content
                .attachments
                .get_mut(n)
                .and_then(|a| a.embedded.as_deref_mut())
                .ok_or_else(|| StoreError::not_found(format_args!("embedded message {n}")))?;
        }
        Ok(content)
    }

    fn attachment(&self, path: &MessagePath, n: u32) -> StoreResult<&AttachmentRecord> {
        self.content(path)?
            .attachments
            .get(&n)
            .ok_or_else(|| StoreError::not_found(format_args!("attachment {n}")))
    }

    fn ancestors(&self, fid: ObjectId) -> Vec<ObjectId> {
        let mut out = Vec::new();
        let mut current = self.folders.get(&fid).and_then(|f| f.parent);
        while let Some(id) = current {
            out.push(id);
            current = self.folders.get(&id).and_then(|f| f.parent);
        }
        out
    }

    fn log_deletion(&mut self, id: ObjectId, table: TableType, folder: ObjectId, cn: ChangeNumber) {
        let mut ancestors = vec![folder];
        ancestors.extend(self.ancestors(folder));
        self.deletions.push(DeletionRecord {
            id,
            table,
            folder,
            ancestors,
            cn,
        });
    }

    fn delete_message(&mut self, mid: ObjectId, mode: DeleteMode, cn: ChangeNumber) -> StoreResult<()> {
        let record = self.message(mid)?;
        let table = if record.associated {
            TableType::Fai
        } else {
            TableType::Messages
        };
        let folder = record.folder;
        self.log_deletion(mid, table, folder, cn);
        match mode {
            DeleteMode::Soft => {
                if let Some(m) = self.messages.get_mut(&mid) {
                    m.deleted = true;
                }
            }
            DeleteMode::Hard => {
                self.messages.remove(&mid);
            }
        }
        Ok(())
    }

    fn delete_folder(&mut self, fid: ObjectId, mode: DeleteMode, cn: ChangeNumber) -> StoreResult<()> {
        let parent = self
            .folder(fid)?
            .parent
            .ok_or(StoreError::NoSupport("deleting the root folder"))?;

        let children: Vec<ObjectId> = self
            .folders
            .iter()
            .filter(|(_, f)| f.parent == Some(fid) && !f.deleted)
            .map(|(id, _)| *id)
            .collect();
        for child in children {
            self.delete_folder(child, mode, cn)?;
        }
        let contained: Vec<ObjectId> = self
            .messages
            .iter()
            .filter(|(_, m)| m.folder == fid && !m.deleted)
            .map(|(id, _)| *id)
            .collect();
        for mid in contained {
            self.delete_message(mid, mode, cn)?;
        }

        self.log_deletion(fid, TableType::Folders, parent, cn);
        match mode {
            DeleteMode::Soft => {
                if let Some(f) = self.folders.get_mut(&fid) {
                    f.deleted = true;
                }
            }
            DeleteMode::Hard => {
                self.folders.remove(&fid);
            }
        }
        Ok(())
    }
}

fn value_size(value: &PropValue) -> usize {
    if let Some(width) = value.prop_type().fixed_width() {
        return width;
    }
    match value {
        PropValue::String8(s) => s.len() + 1,
        PropValue::Unicode(s) => (s.encode_utf16().count() + 1) * 2,
        PropValue::Binary(b) | PropValue::ServerId(b) => b.len(),
        PropValue::MvString8(v) => v.iter().map(|s| s.len() + 1).sum(),
        PropValue::MvUnicode(v) => v.iter().map(|s| (s.encode_utf16().count() + 1) * 2).sum(),
        PropValue::MvBinary(v) => v.iter().map(Vec::len).sum(),
        other => {
            // fixed-width multi-valued
            let width = other.prop_type().element().fixed_width().unwrap_or(0);
            mv_len(other) * width
        }
    }
}

fn mv_len(value: &PropValue) -> usize {
    match value {
        PropValue::MvI16(v) => v.len(),
        PropValue::MvI32(v) => v.len(),
        PropValue::MvF32(v) => v.len(),
        PropValue::MvF64(v) | PropValue::MvFloatingTime(v) => v.len(),
        PropValue::MvCurrency(v) | PropValue::MvI64(v) => v.len(),
        PropValue::MvTime(v) => v.len(),
        PropValue::MvGuid(v) => v.len(),
        _ => 0,
    }
}

fn content_size(content: &MessageContent) -> usize {
    let props: usize = content.props.values().map(value_size).sum();
    let recipients: usize = content
        .recipients
        .iter()
        .flatten()
        .map(|tv| value_size(&tv.value))
        .sum();
    let attachments: usize = content
        .attachments
        .values()
        .map(|a| {
            a.props.values().map(value_size).sum::<usize>()
                + a.embedded.as_deref().map(content_size).unwrap_or(0)
        })
        .sum();
    props + recipients + attachments
}

fn delivery_time(record: &MessageRecord) -> FileTime {
    match record.content.props.get(&tags::MESSAGE_DELIVERY_TIME) {
        Some(PropValue::Time(t)) => *t,
        _ => FileTime(0),
    }
}

fn id_value(id: ObjectId) -> PropValue {
    PropValue::I64(id.value() as i64)
}

/// Single-mailbox in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Local replica id of every new store.
    pub const LOCAL_REPLICA_ID: ReplicaId = ReplicaId::new(1);

    /// Empty mailbox with a random replica GUID.
    pub fn new() -> Self {
        Self::with_replica_guid(ReplicaGuid::random())
    }

    /// Empty mailbox whose local replica has the given GUID.
    pub fn with_replica_guid(guid: ReplicaGuid) -> Self {
        let local_id = Self::LOCAL_REPLICA_ID;
        let root = ObjectId::new(local_id, GlobalCounter::new(1));
        let root_cn = ChangeNumber::new(local_id, GlobalCounter::new(1));
        let mut folders = BTreeMap::new();
        let mut props = Props::new();
        props.insert(tags::DISPLAY_NAME, PropValue::Unicode("Root".into()));
        folders.insert(
            root,
            FolderRecord {
                parent: None,
                props,
                cn: root_cn,
                deleted: false,
            },
        );
        Self {
            inner: RwLock::new(Inner {
                local_id,
                local_guid: guid,
                foreign: BTreeMap::new(),
                next_id: 2,
                next_cn: 2,
                root,
                folders,
                messages: BTreeMap::new(),
                indexed: BTreeSet::new(),
                deletions: Vec::new(),
                named: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a foreign replica.
    pub fn register_replica(&self, id: ReplicaId, guid: ReplicaGuid) {
        self.write().foreign.insert(id, guid);
    }

    /// Register the name behind a named property id.
    pub fn register_named_property(&self, id: u16, named: NamedProperty) {
        self.write().named.insert(id, named);
    }

    /// Create a folder with a display name, minting its id and change number.
    pub fn add_folder(&self, parent: ObjectId, name: &str) -> StoreResult<ObjectId> {
        let mut inner = self.write();
        inner.folder(parent)?;
        let fid = inner.new_id()?;
        let cn = inner.new_cn()?;
        let mut props = Props::new();
        props.insert(tags::DISPLAY_NAME, PropValue::Unicode(name.to_string()));
        inner.folders.insert(
            fid,
            FolderRecord {
                parent: Some(parent),
                props,
                cn,
                deleted: false,
            },
        );
        Ok(fid)
    }

    /// Create a message with a subject, minting its id and change number.
    pub fn add_message(&self, folder: ObjectId, subject: &str, associated: bool) -> StoreResult<ObjectId> {
        let mut inner = self.write();
        inner.folder(folder)?;
        let mid = inner.new_id()?;
        let cn = inner.new_cn()?;
        let mut content = MessageContent::default();
        content
            .props
            .insert(tags::SUBJECT, PropValue::Unicode(subject.to_string()));
        content
            .props
            .insert(tags::MESSAGE_CLASS, PropValue::Unicode("IPM.Note".into()));
        inner.messages.insert(
            mid,
            MessageRecord {
                folder,
                associated,
                content,
                cn,
                deleted: false,
            },
        );
        inner.indexed.insert(mid);
        Ok(mid)
    }

    /// Set properties on a message and mint a new change number for it.
    pub fn modify_message(&self, mid: ObjectId, values: &[TaggedValue]) -> StoreResult<ChangeNumber> {
        let mut inner = self.write();
        let cn = inner.new_cn()?;
        let record = inner.message_mut(mid)?;
        for tv in values {
            record.content.props.insert(tv.tag, tv.value.clone());
        }
        record.cn = cn;
        Ok(cn)
    }

    /// Append a recipient row to a message.
    pub fn add_recipient(&self, msg: &MessagePath, row: Vec<TaggedValue>) -> StoreResult<()> {
        self.write().content_mut(msg)?.recipients.push(row);
        Ok(())
    }

    /// Add an attachment, returning its number.
    pub fn add_attachment(&self, msg: &MessagePath, values: &[TaggedValue]) -> StoreResult<u32> {
        let mut inner = self.write();
        let content = inner.content_mut(msg)?;
        let num = content
            .attachments
            .keys()
            .next_back()
            .map(|n| n + 1)
            .unwrap_or(0);
        let mut record = AttachmentRecord::default();
        for tv in values {
            record.props.insert(tv.tag, tv.value.clone());
        }
        record
            .props
            .insert(tags::ATTACH_NUMBER, PropValue::I32(num as i32));
        content.attachments.insert(num, record);
        Ok(num)
    }

    /// Put an embedded message into an attachment.
    pub fn embed_message(
        &self,
        msg: &MessagePath,
        attach_num: u32,
        values: &[TaggedValue],
    ) -> StoreResult<MessagePath> {
        let mut inner = self.write();
        let attachment = inner
            .content_mut(msg)?
            .attachments
            .get_mut(&attach_num)
            .ok_or_else(|| StoreError::not_found(format_args!("attachment {attach_num}")))?;
        let mut embedded = MessageContent::default();
        for tv in values {
            embedded.props.insert(tv.tag, tv.value.clone());
        }
        attachment.embedded = Some(Box::new(embedded));
        Ok(msg.embedded_in(attach_num))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyStore for MemoryStore {
    fn root_folder(&self) -> ObjectId {
        self.read().root
    }

    fn get_properties(
        &self,
        obj: &ObjectRef,
        tags_wanted: &[PropTag],
    ) -> StoreResult<Vec<Option<PropValue>>> {
        let inner = self.read();
        let lookup: Box<dyn Fn(PropTag) -> Option<PropValue> + '_> = match obj {
            ObjectRef::Folder(fid) => {
                let folder = inner.folder(*fid)?;
                let fid = *fid;
                Box::new(move |tag| match tag {
                    t if t == tags::CHANGE_NUMBER => Some(PropValue::I64(folder.cn.value() as i64)),
                    t if t == tags::FOLDER_ID => Some(id_value(fid)),
                    t if t == tags::PARENT_FOLDER_ID => folder.parent.map(id_value),
                    t => folder.props.get(&t).cloned(),
                })
            }
            ObjectRef::Message(path) if path.is_top() => {
                let record = inner.message(path.mid)?;
                let mid = path.mid;
                Box::new(move |tag| match tag {
                    t if t == tags::CHANGE_NUMBER => Some(PropValue::I64(record.cn.value() as i64)),
                    t if t == tags::MID => Some(id_value(mid)),
                    t if t == tags::PARENT_FOLDER_ID => Some(id_value(record.folder)),
                    t if t == tags::ASSOCIATED => Some(PropValue::Bool(record.associated)),
                    t => match record.content.props.get(&t) {
                        Some(v) => Some(v.clone()),
                        None if t == tags::MESSAGE_SIZE => {
                            Some(PropValue::I32(content_size(&record.content) as i32))
                        }
                        None => None,
                    },
                })
            }
            ObjectRef::Message(path) => {
                let content = inner.content(path)?;
                Box::new(move |tag| content.props.get(&tag).cloned())
            }
            ObjectRef::Attachment(path, n) => {
                let attachment = inner.attachment(path, *n)?;
                Box::new(move |tag| attachment.props.get(&tag).cloned())
            }
        };
        Ok(tags_wanted.iter().map(|t| lookup(*t)).collect())
    }

    fn available_properties(&self, obj: &ObjectRef) -> StoreResult<Vec<PropTag>> {
        let inner = self.read();
        let props = match obj {
            ObjectRef::Folder(fid) => &inner.folder(*fid)?.props,
            ObjectRef::Message(path) => &inner.content(path)?.props,
            ObjectRef::Attachment(path, n) => &inner.attachment(path, *n)?.props,
        };
        Ok(props.keys().copied().collect())
    }

    fn named_property(&self, tag: PropTag) -> Option<NamedProperty> {
        self.read().named.get(&tag.id()).cloned()
    }

    fn query_table(
        &self,
        folder: ObjectId,
        table: TableType,
        changed_after: Option<ChangeNumber>,
        order: SortOrder,
    ) -> StoreResult<Vec<ObjectId>> {
        let inner = self.read();
        inner.folder(folder)?;
        let newer = |cn: ChangeNumber| changed_after.map_or(true, |after| cn > after);

        if table == TableType::Folders {
            return Ok(inner
                .folders
                .iter()
                .filter(|(_, f)| f.parent == Some(folder) && !f.deleted && newer(f.cn))
                .map(|(id, _)| *id)
                .collect());
        }

        let associated = table == TableType::Fai;
        let mut rows: Vec<(&ObjectId, &MessageRecord)> = inner
            .messages
            .iter()
            .filter(|(id, m)| {
                m.folder == folder
                    && m.associated == associated
                    && !m.deleted
                    && inner.indexed.contains(id)
                    && newer(m.cn)
            })
            .collect();
        if order == SortOrder::DeliveryTimeDescending {
            rows.sort_by(|a, b| delivery_time(b.1).cmp(&delivery_time(a.1)).then(a.0.cmp(b.0)));
        }
        Ok(rows.into_iter().map(|(id, _)| *id).collect())
    }

    fn deleted_since(
        &self,
        folder: ObjectId,
        table: TableType,
        after: ChangeNumber,
    ) -> StoreResult<Vec<ObjectId>> {
        let inner = self.read();
        let mut ids: Vec<ObjectId> = inner
            .deletions
            .iter()
            .filter(|d| d.table == table && d.cn > after)
            .filter(|d| match table {
                TableType::Folders => d.ancestors.contains(&folder),
                _ => d.folder == folder,
            })
            .map(|d| d.id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn recipients(&self, msg: &MessagePath) -> StoreResult<Vec<Vec<TaggedValue>>> {
        Ok(self.read().content(msg)?.recipients.clone())
    }

    fn attachment_numbers(&self, msg: &MessagePath) -> StoreResult<Vec<u32>> {
        Ok(self.read().content(msg)?.attachments.keys().copied().collect())
    }

    fn has_embedded(&self, msg: &MessagePath, attach_num: u32) -> StoreResult<bool> {
        Ok(self.read().attachment(msg, attach_num)?.embedded.is_some())
    }

    fn exists(&self, obj: &ObjectRef) -> StoreResult<bool> {
        let inner = self.read();
        let found = match obj {
            ObjectRef::Folder(fid) => inner.folder(*fid).is_ok(),
            ObjectRef::Message(path) => inner.content(path).is_ok(),
            ObjectRef::Attachment(path, n) => inner.attachment(path, *n).is_ok(),
        };
        Ok(found)
    }

    fn parent_folder(&self, id: ObjectId, kind: ObjectKind) -> StoreResult<ObjectId> {
        let inner = self.read();
        match kind {
            ObjectKind::Folder => inner
                .folder(id)?
                .parent
                .ok_or_else(|| StoreError::not_found("parent of the root folder")),
            ObjectKind::Message => Ok(inner.message(id)?.folder),
        }
    }

    fn create_folder(&self, parent: ObjectId, fid: ObjectId) -> StoreResult<()> {
        let mut inner = self.write();
        inner.folder(parent)?;
        if inner.folders.contains_key(&fid) {
            return Err(StoreError::AlreadyExists {
                what: format!("folder {fid}"),
            });
        }
        inner.folders.insert(
            fid,
            FolderRecord {
                parent: Some(parent),
                props: Props::new(),
                cn: ChangeNumber::from_raw(0),
                deleted: false,
            },
        );
        Ok(())
    }

    fn create_message(&self, folder: ObjectId, mid: ObjectId, associated: bool) -> StoreResult<()> {
        let mut inner = self.write();
        inner.folder(folder)?;
        if inner.messages.contains_key(&mid) {
            return Err(StoreError::AlreadyExists {
                what: format!("message {mid}"),
            });
        }
        inner.messages.insert(
            mid,
            MessageRecord {
                folder,
                associated,
                content: MessageContent::default(),
                cn: ChangeNumber::from_raw(0),
                deleted: false,
            },
        );
        inner.indexed.insert(mid);
        Ok(())
    }

    fn set_properties(&self, obj: &ObjectRef, values: &[TaggedValue]) -> StoreResult<()> {
        let mut inner = self.write();
        let props = match obj {
            ObjectRef::Folder(fid) => &mut inner.folder_mut(*fid)?.props,
            ObjectRef::Message(path) => &mut inner.content_mut(path)?.props,
            ObjectRef::Attachment(path, n) => {
                &mut inner
                    .content_mut(path)?
                    .attachments
                    .get_mut(n)
                    .ok_or_else(|| StoreError::not_found(format_args!("attachment {n}")))?
                    .props
            }
        };
        for tv in values {
            props.insert(tv.tag, tv.value.clone());
        }
        Ok(())
    }

    fn set_change_number(&self, id: ObjectId, kind: ObjectKind, cn: ChangeNumber) -> StoreResult<()> {
        let mut inner = self.write();
        match kind {
            ObjectKind::Folder => inner.folder_mut(id)?.cn = cn,
            ObjectKind::Message => inner.message_mut(id)?.cn = cn,
        }
        Ok(())
    }

    fn move_folder(&self, fid: ObjectId, new_parent: ObjectId) -> StoreResult<()> {
        let mut inner = self.write();
        inner.folder(new_parent)?;
        if new_parent == fid || inner.ancestors(new_parent).contains(&fid) {
            return Err(StoreError::Backend(format!(
                "moving folder {fid} under {new_parent} would create a cycle"
            )));
        }
        inner.folder_mut(fid)?.parent = Some(new_parent);
        Ok(())
    }

    fn move_message(&self, request: &MessageMove) -> StoreResult<()> {
        let mut inner = self.write();
        inner.folder(request.destination_folder)?;
        let source = inner.message(request.source_mid)?;
        if source.folder != request.source_folder {
            return Err(StoreError::not_found(format_args!(
                "message {} in folder {}",
                request.source_mid, request.source_folder
            )));
        }
        if inner.messages.contains_key(&request.destination_mid) {
            return Err(StoreError::AlreadyExists {
                what: format!("message {}", request.destination_mid),
            });
        }

        let table = if source.associated {
            TableType::Fai
        } else {
            TableType::Messages
        };
        let mut moved = inner
            .messages
            .remove(&request.source_mid)
            .ok_or_else(|| StoreError::not_found(format_args!("message {}", request.source_mid)))?;
        inner.indexed.remove(&request.source_mid);
        inner.log_deletion(request.source_mid, table, request.source_folder, request.change_number);

        moved.folder = request.destination_folder;
        moved.cn = request.change_number;
        moved
            .content
            .props
            .insert(tags::CHANGE_KEY, PropValue::Binary(request.change_key.clone()));
        moved.content.props.insert(
            tags::PREDECESSOR_CHANGE_LIST,
            PropValue::Binary(request.predecessor_change_list.clone()),
        );
        inner.messages.insert(request.destination_mid, moved);
        inner.indexed.insert(request.destination_mid);
        Ok(())
    }

    fn delete_object(
        &self,
        id: ObjectId,
        kind: ObjectKind,
        mode: DeleteMode,
        cn: ChangeNumber,
    ) -> StoreResult<()> {
        let mut inner = self.write();
        match kind {
            ObjectKind::Folder => inner.delete_folder(id, mode, cn),
            ObjectKind::Message => inner.delete_message(id, mode, cn),
        }
    }

    fn set_read_flag(&self, mid: ObjectId, read: bool, cn: ChangeNumber) -> StoreResult<()> {
        let mut inner = self.write();
        let record = inner.message_mut(mid)?;
        let flags = match record.content.props.get(&tags::MESSAGE_FLAGS) {
            Some(PropValue::I32(f)) => *f,
            _ => 0,
        };
        let flags = if read {
            flags | tags::MSGFLAG_READ
        } else {
            flags & !tags::MSGFLAG_READ
        };
        record
            .content
            .props
            .insert(tags::MESSAGE_FLAGS, PropValue::I32(flags));
        record.cn = cn;
        Ok(())
    }

    fn unindex(&self, mid: ObjectId) -> StoreResult<()> {
        self.write().indexed.remove(&mid);
        Ok(())
    }
}

impl IdAllocator for MemoryStore {
    fn next_change_number(&self) -> StoreResult<ChangeNumber> {
        self.write().new_cn()
    }

    fn next_object_id(&self) -> StoreResult<ObjectId> {
        self.write().new_id()
    }

    fn reserve_counters(&self, count: u32) -> StoreResult<GlobalCounter> {
        self.write().reserve_ids(u64::from(count))
    }

    fn next_unissued(&self) -> GlobalCounter {
        GlobalCounter::new(self.read().next_cn)
    }

    fn next_unissued_id(&self) -> GlobalCounter {
        GlobalCounter::new(self.read().next_id)
    }
}

impl ReplicaDirectory for MemoryStore {
    fn local_replica(&self) -> (ReplicaId, ReplicaGuid) {
        let inner = self.read();
        (inner.local_id, inner.local_guid)
    }

    fn replica_guid(&self, id: ReplicaId) -> Option<ReplicaGuid> {
        let inner = self.read();
        if id == inner.local_id {
            Some(inner.local_guid)
        } else {
            inner.foreign.get(&id).copied()
        }
    }

    fn replica_id(&self, guid: &ReplicaGuid) -> Option<ReplicaId> {
        let inner = self.read();
        if *guid == inner.local_guid {
            Some(inner.local_id)
        } else {
            inner
                .foreign
                .iter()
                .find(|(_, g)| *g == guid)
                .map(|(id, _)| *id)
        }
    }
}
