//! Synchronization contexts.
//!
//! A [`SyncSession`] is created by SynchronizationConfigure (download) or
//! SynchronizationOpenCollector (upload). It owns the request flags, the
//! property selection, the four state change sets, an in-progress state
//! upload and, for downloads, the export generator and its chunk cursor.

use crate::config::TransferConfig;
use crate::error::{IcsError, Result};
use crate::export::{self, ExportOptions, SyncExport};
use crate::identity::Identity;
use crate::store::{IdAllocator, ReplicaDirectory, Store};
use ics_core::{ChangeSet, Chunk, ChunkCursor, Encoder, TransferBuffer, TransferStatus};
use ics_types::{Marker, ObjectId, PropTag, StateProperty};
use std::sync::Arc;

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            /// Flags from their wire value; unknown bits are kept.
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            /// Wire value.
            pub fn bits(self) -> $repr {
                self.0
            }

            /// Whether every bit of `other` is set.
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// SynchronizationFlags of a Configure request.
    SyncFlags(u16) {
        /// Strings are sent as Unicode.
        UNICODE = 0x0001;
        /// Do not report deletions.
        NO_DELETIONS = 0x0002;
        /// Do not report objects that left the scope.
        IGNORE_NO_LONGER_IN_SCOPE = 0x0004;
        /// Track read-state changes.
        READ_STATE = 0x0008;
        /// Synchronize FAI messages.
        FAI = 0x0010;
        /// Synchronize normal messages.
        NORMAL = 0x0020;
        /// The property list is an inclusion list.
        ONLY_SPECIFIED_PROPERTIES = 0x0080;
        /// Do not use foreign identifiers.
        NO_FOREIGN_IDENTIFIERS = 0x0100;
        /// Prefer the best body format.
        BEST_BODY = 0x2000;
        /// FAI messages ignore the property list.
        IGNORE_SPECIFIED_ON_FAI = 0x4000;
        /// Emit progress information.
        PROGRESS = 0x8000;
    }
}

flag_set! {
    /// SynchronizationExtraFlags of a Configure request.
    ExtraFlags(u32) {
        /// Include folder or message ids in change headers.
        EID = 0x0000_0001;
        /// Include the message size in change headers.
        MESSAGE_SIZE = 0x0000_0002;
        /// Include the change number in change headers.
        CN = 0x0000_0004;
        /// Order messages by delivery time, newest first.
        ORDER_BY_DELIVERY_TIME = 0x0000_0008;
    }
}

/// What a synchronization context covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    /// Messages of one folder.
    Contents = 0x01,
    /// The folder tree below one folder.
    Hierarchy = 0x02,
}

impl SyncType {
    /// Decode the SynchronizationType byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(SyncType::Contents),
            0x02 => Ok(SyncType::Hierarchy),
            other => Err(IcsError::InvalidParameter(format!(
                "synchronization type 0x{other:02x}"
            ))),
        }
    }
}

/// Which properties an export writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySelection {
    tags: Vec<PropTag>,
    include: bool,
}

impl PropertySelection {
    /// Everything the object has.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the listed properties.
    pub fn include(tags: Vec<PropTag>) -> Self {
        Self {
            tags,
            include: true,
        }
    }

    /// Everything except the listed properties.
    pub fn exclude(tags: Vec<PropTag>) -> Self {
        Self {
            tags,
            include: false,
        }
    }

    /// Filter the tags an object has. Tags match by property id.
    pub fn select(&self, available: &[PropTag]) -> Vec<PropTag> {
        available
            .iter()
            .copied()
            .filter(|t| self.tags.iter().any(|s| s.id() == t.id()) == self.include)
            .collect()
    }
}

/// The four state change sets of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Ids the client holds.
    pub idset_given: ChangeSet,
    /// CNs of normal messages or folders the client has seen.
    pub cnset_seen: ChangeSet,
    /// CNs of FAI messages the client has seen.
    pub cnset_seen_fai: ChangeSet,
    /// CNs of read-state changes the client has seen.
    pub cnset_read: ChangeSet,
}

impl SyncState {
    /// Set held in a slot.
    pub fn get(&self, property: StateProperty) -> &ChangeSet {
        match property {
            StateProperty::IdsetGiven => &self.idset_given,
            StateProperty::CnsetSeen => &self.cnset_seen,
            StateProperty::CnsetSeenFai => &self.cnset_seen_fai,
            StateProperty::CnsetRead => &self.cnset_read,
        }
    }

    /// Replace the set held in a slot.
    pub fn set(&mut self, property: StateProperty, value: ChangeSet) {
        match property {
            StateProperty::IdsetGiven => self.idset_given = value,
            StateProperty::CnsetSeen => self.cnset_seen = value,
            StateProperty::CnsetSeenFai => self.cnset_seen_fai = value,
            StateProperty::CnsetRead => self.cnset_read = value,
        }
    }
}

#[derive(Debug)]
struct Upload {
    property: StateProperty,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct Transfer {
    export: SyncExport,
    cursor: ChunkCursor,
}

/// An ICS download or upload context.
#[derive(Debug)]
pub struct SyncSession {
    folder: ObjectId,
    sync_type: SyncType,
    flags: SyncFlags,
    extra_flags: ExtraFlags,
    properties: PropertySelection,
    collector: bool,
    state: SyncState,
    upload: Option<Upload>,
    transfer: Option<Transfer>,
}

impl SyncSession {
    /// Download context created by SynchronizationConfigure.
    pub fn configure(
        folder: ObjectId,
        sync_type: SyncType,
        flags: SyncFlags,
        extra_flags: ExtraFlags,
        tags: Vec<PropTag>,
    ) -> Self {
        let properties = if flags.contains(SyncFlags::ONLY_SPECIFIED_PROPERTIES) {
            PropertySelection::include(tags)
        } else {
            PropertySelection::exclude(tags)
        };
        tracing::info!(
            "sync context configured: folder {} type {:?} flags 0x{:04x}",
            folder,
            sync_type,
            flags.bits()
        );
        Self {
            folder,
            sync_type,
            flags,
            extra_flags,
            properties,
            collector: false,
            state: SyncState::default(),
            upload: None,
            transfer: None,
        }
    }

    /// Upload context created by SynchronizationOpenCollector.
    pub fn open_collector(folder: ObjectId, is_content: bool) -> Self {
        let sync_type = if is_content {
            SyncType::Contents
        } else {
            SyncType::Hierarchy
        };
        tracing::info!("collector opened: folder {} type {:?}", folder, sync_type);
        Self {
            folder,
            sync_type,
            flags: SyncFlags::default(),
            extra_flags: ExtraFlags::default(),
            properties: PropertySelection::all(),
            collector: true,
            state: SyncState::default(),
            upload: None,
            transfer: None,
        }
    }

    /// Folder the context synchronizes.
    pub fn folder(&self) -> ObjectId {
        self.folder
    }

    /// Contents or hierarchy.
    pub fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    /// Request flags.
    pub fn flags(&self) -> SyncFlags {
        self.flags
    }

    /// Whether this is an import-only context.
    pub fn is_collector(&self) -> bool {
        self.collector
    }

    /// Current state sets.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Start uploading a state property.
    pub fn begin_upload(&mut self, tag: PropTag) -> Result<()> {
        let property = StateProperty::from_tag(tag)
            .ok_or_else(|| IcsError::InvalidParameter(format!("state property {tag}")))?;
        if self.upload.is_some() {
            tracing::warn!("state upload begin while {:?} is in progress", property);
            return Err(IcsError::UploadInProgress);
        }
        tracing::debug!("state upload begin: {:?}", property);
        self.upload = Some(Upload {
            property,
            bytes: Vec::new(),
        });
        Ok(())
    }

    /// Append bytes to the state property being uploaded.
    pub fn continue_upload(&mut self, data: &[u8]) -> Result<()> {
        let upload = self.upload.as_mut().ok_or(IcsError::NoUploadInProgress)?;
        upload.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Parse and validate the uploaded bytes and, on success, replace the
    /// slot. The upload is over either way.
    pub fn end_upload(&mut self, store: &dyn Store) -> Result<()> {
        let upload = self.upload.take().ok_or(IcsError::NoUploadInProgress)?;
        let ident = Identity::new(store);

        let parsed = match ChangeSet::parse(&upload.bytes) {
            Ok(set) => Ok(set),
            Err(err) if upload.property == StateProperty::IdsetGiven => {
                tracing::debug!("IdsetGiven is not GUID-based ({}), trying REPLID form", err);
                ChangeSet::parse_replid(&upload.bytes, &ident.replica_map())
            }
            Err(err) => Err(err),
        };
        let set = match parsed {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!("rejected {:?} upload: {}", upload.property, err);
                return Err(err.into());
            }
        };

        let (_, local) = store.local_replica();
        let bound = if upload.property.is_cnset() {
            store.next_unissued()
        } else {
            store.next_unissued_id()
        };
        if let Err(err) = set.validate_against_next_unissued(&local, bound) {
            tracing::warn!("rejected {:?} upload: {}", upload.property, err);
            return Err(err.into());
        }

        tracing::debug!("state upload end: {:?} = {}", upload.property, set);
        self.state.set(upload.property, set);
        Ok(())
    }

    /// Deliver the next chunk of the download, starting the export on the
    /// first call. The exported state replaces the context's state once the
    /// last chunk is produced.
    pub fn next_chunk(
        &mut self,
        store: &Arc<dyn Store>,
        config: &TransferConfig,
        requested: usize,
    ) -> Result<Chunk> {
        if self.collector {
            return Err(IcsError::NoSupport("download on a collector"));
        }
        let mut transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => {
                let options = ExportOptions {
                    folder: self.folder,
                    flags: self.flags,
                    extra_flags: self.extra_flags,
                    properties: self.properties.clone(),
                    batch_bytes: config.export_batch_bytes,
                };
                let export =
                    SyncExport::new(Arc::clone(store), self.sync_type, options, self.state.clone())?;
                Transfer {
                    export,
                    cursor: ChunkCursor::new(config.progress_margin_steps),
                }
            }
        };

        let was_finished = transfer.cursor.is_finished();
        let result = transfer.cursor.next_chunk(&mut transfer.export, requested);
        if let Ok(chunk) = &result {
            if chunk.status == TransferStatus::Done && !was_finished {
                self.state = transfer.export.state().clone();
                let stats = transfer.export.stats();
                tracing::info!(
                    "sync download complete: folder {} ({} changes, {} skipped, {} deletions)",
                    self.folder,
                    stats.changes,
                    stats.skipped,
                    stats.deletions
                );
            }
        }
        self.transfer = Some(transfer);
        result
    }

    /// Encode a standalone state block built from a full scan of the folder.
    pub fn transfer_state(&self, store: &dyn Store) -> Result<TransferBuffer> {
        let state = export::scan_state(store, self.folder, self.sync_type, self.flags)?;
        let mut encoder = Encoder::new();
        encoder.push_marker(Marker::IncrSyncStateBegin);
        export::write_state_properties(&mut encoder, &state, self.sync_type, self.flags)?;
        encoder.push_marker(Marker::IncrSyncStateEnd);
        Ok(encoder.into_buffer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PropertyStore};
    use ics_core::CounterRange;
    use ics_types::{meta, tags, GlobalCounter};

    fn contents_session(store: &MemoryStore) -> SyncSession {
        SyncSession::configure(
            store.root_folder(),
            SyncType::Contents,
            SyncFlags::NORMAL | SyncFlags::UNICODE,
            ExtraFlags::default(),
            Vec::new(),
        )
    }

    #[test]
    fn flags_combine_and_test() {
        let flags = SyncFlags::NORMAL | SyncFlags::FAI;
        assert!(flags.contains(SyncFlags::FAI));
        assert!(!flags.contains(SyncFlags::READ_STATE));
        assert_eq!(flags.bits(), 0x0030);
    }

    #[test]
    fn selection_matches_by_property_id() {
        let subject8 = tags::SUBJECT.with_type(ics_types::PropType::String8);
        let available = [tags::SUBJECT, tags::BODY];
        assert_eq!(
            PropertySelection::include(vec![subject8]).select(&available),
            vec![tags::SUBJECT]
        );
        assert_eq!(
            PropertySelection::exclude(vec![subject8]).select(&available),
            vec![tags::BODY]
        );
        assert_eq!(PropertySelection::all().select(&available).len(), 2);
    }

    #[test]
    fn upload_replaces_slot() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        let (_, guid) = store.local_replica();
        let set = ChangeSet::single(guid, GlobalCounter::new(1));

        session.begin_upload(meta::CNSET_SEEN).unwrap();
        let bytes = set.serialize();
        let (head, tail) = bytes.split_at(5);
        session.continue_upload(head).unwrap();
        session.continue_upload(tail).unwrap();
        session.end_upload(&store).unwrap();

        assert_eq!(session.state().cnset_seen, set);
    }

    #[test]
    fn second_begin_is_rejected() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        session.begin_upload(meta::CNSET_SEEN).unwrap();
        assert!(matches!(
            session.begin_upload(meta::IDSET_GIVEN),
            Err(IcsError::UploadInProgress)
        ));
    }

    #[test]
    fn continue_without_begin_is_rejected() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        assert!(matches!(
            session.continue_upload(&[0]),
            Err(IcsError::NoUploadInProgress)
        ));
    }

    #[test]
    fn unknown_state_tag_is_rejected() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        assert!(matches!(
            session.begin_upload(tags::SUBJECT),
            Err(IcsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn idset_given_is_bounded_by_the_id_counter() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        let (_, guid) = store.local_replica();
        let first = store.reserve_counters(50).unwrap();
        let reserved = ChangeSet::from_ranges(
            guid,
            [CounterRange {
                low: first.value(),
                high: first.value() + 49,
            }],
        );
        assert!(first.value() + 49 >= store.next_unissued().value());

        session.begin_upload(meta::IDSET_GIVEN).unwrap();
        session.continue_upload(&reserved.serialize()).unwrap();
        session.end_upload(&store).unwrap();
        assert_eq!(session.state().idset_given, reserved);

        let unissued = ChangeSet::single(guid, store.next_unissued_id());
        session.begin_upload(meta::IDSET_GIVEN).unwrap();
        session.continue_upload(&unissued.serialize()).unwrap();
        assert!(session.end_upload(&store).is_err());
        assert_eq!(session.state().idset_given, reserved);
    }

    #[test]
    fn regression_keeps_old_slot_and_resets_upload() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        let (_, guid) = store.local_replica();
        let future = store.next_unissued().value() + 100;
        let set = ChangeSet::from_ranges(guid, [CounterRange { low: 1, high: future }]);

        session.begin_upload(meta::CNSET_SEEN).unwrap();
        session.continue_upload(&set.serialize()).unwrap();
        let err = session.end_upload(&store).unwrap_err();
        assert_eq!(err.error_code(), ics_types::ErrorCode::InvalidParameter);
        assert!(session.state().cnset_seen.is_empty());

        // upload state was reset
        assert!(session.continue_upload(&[0]).is_err());
    }

    #[test]
    fn idset_given_accepts_replid_form() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        let (replid, guid) = store.local_replica();
        let mut map = std::collections::BTreeMap::new();
        map.insert(replid, guid);
        let set = ChangeSet::single(guid, GlobalCounter::new(1));

        session.begin_upload(meta::IDSET_GIVEN).unwrap();
        session
            .continue_upload(&set.serialize_replid(&map).unwrap())
            .unwrap();
        session.end_upload(&store).unwrap();
        assert_eq!(session.state().idset_given, set);
    }

    #[test]
    fn corrupt_upload_is_corrupt_data() {
        let store = MemoryStore::new();
        let mut session = contents_session(&store);
        session.begin_upload(meta::CNSET_SEEN).unwrap();
        session.continue_upload(&[0u8; 16]).unwrap();
        session.continue_upload(&[0x07]).unwrap();
        let err = session.end_upload(&store).unwrap_err();
        assert_eq!(err.error_code(), ics_types::ErrorCode::CorruptData);
    }

    #[test]
    fn collector_refuses_download() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut session = SyncSession::open_collector(store.root_folder(), true);
        assert!(session
            .next_chunk(&store, &TransferConfig::default(), 100)
            .is_err());
    }
}
