//! ICS download generators.
//!
//! A [`SyncExport`] is a lazy [`Producer`]: the chunk cursor asks it for more
//! output whenever a GetBuffer window runs past what has been encoded, and
//! each call runs export stages until a soft byte budget is spent.
//!
//! - [`content`] - normal messages, FAI messages, deletions, state
//! - [`hierarchy`] - depth-first folder walk, deletions, state
//! - [`writer`] - property, recipient and attachment serialization shared
//!   with CopyTo

pub mod content;
pub mod hierarchy;
pub mod writer;

pub use content::ContentExport;
pub use hierarchy::HierarchyExport;

use crate::error::{IcsError, Result};
use crate::identity::Identity;
use crate::session::{ExtraFlags, PropertySelection, SyncFlags, SyncState, SyncType};
use crate::store::{
    MessagePath, ObjectRef, PropertyStore, ReplicaDirectory, SortOrder, Store, TableType,
};
use ics_core::{ChangeSet, Encoder, Producer, RawChangeSet, TransferBuffer};
use ics_types::{meta, tags, ChangeNumber, Marker, ObjectId, ReplicaGuid, ReplicaId};
use std::sync::Arc;

/// Request parameters an export runs with.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Folder being synchronized.
    pub folder: ObjectId,
    /// SynchronizationFlags.
    pub flags: SyncFlags,
    /// SynchronizationExtraFlags.
    pub extra_flags: ExtraFlags,
    /// Property selection for exported objects.
    pub properties: PropertySelection,
    /// Soft byte budget of one production batch.
    pub batch_bytes: usize,
}

/// Counters of one export run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Changes emitted.
    pub changes: u64,
    /// Rows skipped because the client has already seen them.
    pub skipped: u64,
    /// Ids reported as deleted.
    pub deletions: u64,
}

/// A contents or hierarchy download.
#[derive(Debug)]
pub enum SyncExport {
    /// Messages of a folder.
    Content(ContentExport),
    /// Folder tree below a folder.
    Hierarchy(HierarchyExport),
}

impl SyncExport {
    /// Start an export of `options.folder` against the client's `state`.
    pub fn new(
        store: Arc<dyn Store>,
        sync_type: SyncType,
        options: ExportOptions,
        state: SyncState,
    ) -> Result<Self> {
        if !store.exists(&ObjectRef::Folder(options.folder))? {
            return Err(IcsError::NotFound(format!("folder {}", options.folder)));
        }
        let tracking = Tracking::new(store.as_ref(), state);
        Ok(match sync_type {
            SyncType::Contents => SyncExport::Content(ContentExport::new(store, options, tracking)),
            SyncType::Hierarchy => {
                SyncExport::Hierarchy(HierarchyExport::new(store, options, tracking)?)
            }
        })
    }

    /// State as updated by the stages run so far.
    pub fn state(&self) -> &SyncState {
        match self {
            SyncExport::Content(export) => &export.tracking.state,
            SyncExport::Hierarchy(export) => &export.tracking.state,
        }
    }

    /// Counters of this run.
    pub fn stats(&self) -> ExportStats {
        match self {
            SyncExport::Content(export) => export.stats,
            SyncExport::Hierarchy(export) => export.stats,
        }
    }
}

impl Producer for SyncExport {
    type Error = IcsError;

    fn buffer(&self) -> &TransferBuffer {
        match self {
            SyncExport::Content(export) => export.encoder.buffer(),
            SyncExport::Hierarchy(export) => export.encoder.buffer(),
        }
    }

    fn is_exhausted(&self) -> bool {
        match self {
            SyncExport::Content(export) => export.is_exhausted(),
            SyncExport::Hierarchy(export) => export.is_exhausted(),
        }
    }

    fn produce(&mut self) -> Result<()> {
        match self {
            SyncExport::Content(export) => export.produce(),
            SyncExport::Hierarchy(export) => export.produce(),
        }
    }
}

/// Client state before the run, the running state, and observations of the
/// stage in progress.
#[derive(Debug)]
pub(crate) struct Tracking {
    local_id: ReplicaId,
    local_guid: ReplicaGuid,
    pub(crate) initial: SyncState,
    pub(crate) state: SyncState,
    cns: RawChangeSet,
    ids: RawChangeSet,
}

impl Tracking {
    fn new(store: &dyn Store, state: SyncState) -> Self {
        let (local_id, local_guid) = store.local_replica();
        Self {
            local_id,
            local_guid,
            initial: state.clone(),
            state,
            cns: RawChangeSet::new(),
            ids: RawChangeSet::new(),
        }
    }

    /// Highest local change number in `set`, used to restrict table queries.
    pub(crate) fn watermark(&self, set: &ChangeSet) -> Option<ChangeNumber> {
        set.max_counter(&self.local_guid)
            .map(|counter| ChangeNumber::new(self.local_id, counter))
    }

    /// Highest local change number the client has seen in any slot.
    pub(crate) fn deletion_watermark(&self) -> Option<ChangeNumber> {
        let seen = self.watermark(&self.initial.cnset_seen);
        let fai = self.watermark(&self.initial.cnset_seen_fai);
        seen.max(fai)
    }

    pub(crate) fn observe(&mut self, ident: &Identity<'_>, id: ObjectId, cn: ChangeNumber) -> Result<()> {
        self.ids.push(ident.guid_of(id.replica_id())?, id.counter());
        self.cns.push(ident.guid_of(cn.replica_id())?, cn.counter());
        Ok(())
    }

    /// Fold the stage's observations into the running state, returning the
    /// observed change numbers.
    pub(crate) fn finish_stage(&mut self) -> ChangeSet {
        let cns = std::mem::take(&mut self.cns).into_changeset();
        let ids = std::mem::take(&mut self.ids).into_changeset();
        self.state.idset_given = self.state.idset_given.merge(&ids);
        cns
    }
}

/// Local change number reported by the store for an object.
pub(crate) fn change_number_of(store: &dyn Store, obj: &ObjectRef) -> Result<ChangeNumber> {
    store
        .get_property(obj, tags::CHANGE_NUMBER)?
        .and_then(|v| v.as_i64())
        .map(|v| ChangeNumber::from_raw(v as u64))
        .ok_or_else(|| IcsError::NotFound(format!("change number of {obj:?}")))
}

/// Emit `IncrSyncDel` for the deleted ids the client holds and drop them
/// from the running IdsetGiven. Returns how many ids were reported.
pub(crate) fn write_deletions(
    encoder: &mut Encoder,
    ident: &Identity<'_>,
    tracking: &mut Tracking,
    deleted: &[ObjectId],
) -> Result<u64> {
    let mut raw = RawChangeSet::new();
    for id in deleted {
        raw.push(ident.guid_of(id.replica_id())?, id.counter());
    }
    let deleted = raw.into_changeset();
    let given = &tracking.state.idset_given;
    let known = deleted.subtract(&deleted.subtract(given));
    if known.is_empty() {
        return Ok(0);
    }
    encoder.push_marker(Marker::IncrSyncDel);
    encoder.push_state(meta::IDSET_DELETED, &known.serialize())?;
    tracking.state.idset_given = given.subtract(&known);
    tracing::debug!("reported {} deletions", known.count());
    Ok(known.count())
}

/// The state properties a context of this type and flags reports.
pub(crate) fn write_state_properties(
    encoder: &mut Encoder,
    state: &SyncState,
    sync_type: SyncType,
    flags: SyncFlags,
) -> Result<()> {
    encoder.push_state(meta::CNSET_SEEN, &state.cnset_seen.serialize())?;
    if sync_type == SyncType::Contents && flags.contains(SyncFlags::FAI) {
        encoder.push_state(meta::CNSET_SEEN_FAI, &state.cnset_seen_fai.serialize())?;
    }
    if sync_type == SyncType::Contents && flags.contains(SyncFlags::READ_STATE) {
        encoder.push_state(meta::CNSET_READ, &state.cnset_read.serialize())?;
    }
    encoder.push_state(meta::IDSET_GIVEN, &state.idset_given.serialize())?;
    Ok(())
}

/// `IncrSyncStateBegin` + state properties + `IncrSyncStateEnd` + `IncrSyncEnd`.
pub(crate) fn write_final_state(
    encoder: &mut Encoder,
    state: &SyncState,
    sync_type: SyncType,
    flags: SyncFlags,
) -> Result<()> {
    encoder.push_marker(Marker::IncrSyncStateBegin);
    write_state_properties(encoder, state, sync_type, flags)?;
    encoder.push_marker(Marker::IncrSyncStateEnd);
    encoder.push_marker(Marker::IncrSyncEnd);
    Ok(())
}

/// Derive the state a client holding everything below `folder` would have.
pub fn scan_state(
    store: &dyn Store,
    folder: ObjectId,
    sync_type: SyncType,
    flags: SyncFlags,
) -> Result<SyncState> {
    let ident = Identity::new(store);
    let mut ids = RawChangeSet::new();
    let mut cns = RawChangeSet::new();
    let mut fai_cns = RawChangeSet::new();

    let mut record = |id: ObjectId, obj: ObjectRef, into: &mut RawChangeSet| -> Result<()> {
        let cn = change_number_of(store, &obj)?;
        ids.push(ident.guid_of(id.replica_id())?, id.counter());
        into.push(ident.guid_of(cn.replica_id())?, cn.counter());
        Ok(())
    };

    match sync_type {
        SyncType::Contents => {
            for mid in store.query_table(folder, TableType::Messages, None, SortOrder::IdAscending)? {
                record(mid, ObjectRef::Message(MessagePath::top(mid)), &mut cns)?;
            }
            for mid in store.query_table(folder, TableType::Fai, None, SortOrder::IdAscending)? {
                record(mid, ObjectRef::Message(MessagePath::top(mid)), &mut fai_cns)?;
            }
        }
        SyncType::Hierarchy => {
            let mut stack = vec![folder];
            while let Some(fid) = stack.pop() {
                for child in store.query_table(fid, TableType::Folders, None, SortOrder::IdAscending)? {
                    record(child, ObjectRef::Folder(child), &mut cns)?;
                    stack.push(child);
                }
            }
        }
    }

    let cnset_seen = cns.into_changeset();
    let cnset_read = if sync_type == SyncType::Contents && flags.contains(SyncFlags::READ_STATE) {
        cnset_seen.clone()
    } else {
        ChangeSet::new()
    };
    Ok(SyncState {
        idset_given: ids.into_changeset(),
        cnset_seen,
        cnset_seen_fai: fai_cns.into_changeset(),
        cnset_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn scan_state_covers_every_message() {
        let store = MemoryStore::new();
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        store.add_message(inbox, "a", false).unwrap();
        store.add_message(inbox, "b", false).unwrap();
        store.add_message(inbox, "c", true).unwrap();

        let state = scan_state(&store, inbox, SyncType::Contents, SyncFlags::NORMAL | SyncFlags::FAI)
            .unwrap();
        assert_eq!(state.idset_given.count(), 3);
        assert_eq!(state.cnset_seen.count(), 2);
        assert_eq!(state.cnset_seen_fai.count(), 1);
        assert!(state.cnset_read.is_empty());
    }

    #[test]
    fn scan_state_walks_the_whole_hierarchy() {
        let store = MemoryStore::new();
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        store.add_folder(a, "B").unwrap();
        store.add_folder(root, "C").unwrap();

        let state = scan_state(&store, root, SyncType::Hierarchy, SyncFlags::default()).unwrap();
        assert_eq!(state.idset_given.count(), 3);
        assert_eq!(state.cnset_seen.count(), 3);
    }

    #[test]
    fn deletions_only_report_ids_the_client_holds() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let held = store.add_message(inbox, "held", false).unwrap();
        let unknown = store.add_message(inbox, "unknown", false).unwrap();

        let (_, guid) = store.local_replica();
        let state = SyncState {
            idset_given: ChangeSet::single(guid, held.counter()),
            ..SyncState::default()
        };
        let mut tracking = Tracking::new(&store, state);
        let mut encoder = Encoder::new();

        let n = write_deletions(&mut encoder, &ident, &mut tracking, &[held, unknown]).unwrap();
        assert_eq!(n, 1);
        assert!(tracking.state.idset_given.is_empty());

        let elements = ics_core::decode(encoder.buffer().bytes()).unwrap();
        assert_eq!(elements[0], ics_core::Element::Marker(Marker::IncrSyncDel));
    }

    #[test]
    fn nothing_to_delete_writes_nothing() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let mut tracking = Tracking::new(&store, SyncState::default());
        let mut encoder = Encoder::new();
        assert_eq!(write_deletions(&mut encoder, &ident, &mut tracking, &[]).unwrap(), 0);
        assert!(encoder.is_empty());
    }
}
