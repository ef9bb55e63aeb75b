//! Contents synchronization: message changes, deletions and final state.
//!
//! Stages run in order `normal -> fai -> deletions -> state`. A table stage
//! materializes only the ids of rows changed after the client's watermark,
//! then exports them one by one so production can stop at any row boundary.

use super::writer::Writer;
use super::{change_number_of, write_deletions, write_final_state, ExportOptions, ExportStats, Tracking};
use crate::error::{IcsError, Result, StoreError};
use crate::identity::Identity;
use crate::session::{ExtraFlags, PropertySelection, SyncFlags, SyncType};
use crate::store::{MessagePath, ObjectRef, PropertyStore, SortOrder, Store, TableType};
use ics_core::Encoder;
use ics_types::{tags, FileTime, Marker, ObjectId, PredecessorChangeList, PropTag, PropValue, Xid};
use std::collections::VecDeque;
use std::sync::Arc;

/// Properties written in the change header, never repeated in the body.
const HEADER_TAGS: [PropTag; 8] = [
    tags::SOURCE_KEY,
    tags::LAST_MODIFICATION_TIME,
    tags::CHANGE_KEY,
    tags::PREDECESSOR_CHANGE_LIST,
    tags::ASSOCIATED,
    tags::MID,
    tags::MESSAGE_SIZE,
    tags::CHANGE_NUMBER,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Normal,
    Fai,
    Deletions,
    State,
}

/// Lazy export of one folder's messages.
pub struct ContentExport {
    store: Arc<dyn Store>,
    options: ExportOptions,
    pub(super) tracking: Tracking,
    pub(super) encoder: Encoder,
    pub(super) stats: ExportStats,
    stages: VecDeque<Stage>,
    rows: Option<VecDeque<ObjectId>>,
}

impl std::fmt::Debug for ContentExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentExport")
            .field("folder", &self.options.folder)
            .field("stages", &self.stages)
            .field("encoded", &self.encoder.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ContentExport {
    pub(super) fn new(store: Arc<dyn Store>, options: ExportOptions, tracking: Tracking) -> Self {
        let flags = options.flags;
        let mut stages = VecDeque::new();
        if flags.contains(SyncFlags::NORMAL) {
            stages.push_back(Stage::Normal);
        }
        if flags.contains(SyncFlags::FAI) {
            stages.push_back(Stage::Fai);
        }
        if !flags.contains(SyncFlags::NO_DELETIONS) {
            stages.push_back(Stage::Deletions);
        }
        stages.push_back(Stage::State);
        Self {
            store,
            options,
            tracking,
            encoder: Encoder::new(),
            stats: ExportStats::default(),
            stages,
            rows: None,
        }
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run stages until the batch budget is spent or the export is over.
    pub(super) fn produce(&mut self) -> Result<()> {
        let start = self.encoder.len();
        let budget = self.options.batch_bytes.max(1);
        while !self.is_exhausted() && self.encoder.len() - start < budget {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let Some(stage) = self.stages.front().copied() else {
            return Ok(());
        };
        match stage {
            Stage::Normal | Stage::Fai => {
                let associated = stage == Stage::Fai;
                if self.rows.is_none() {
                    self.rows = Some(self.open_table(associated)?);
                }
                match self.rows.as_mut().and_then(VecDeque::pop_front) {
                    Some(mid) => self.export_row(mid, associated)?,
                    None => {
                        self.finish_table(associated);
                        self.rows = None;
                        self.stages.pop_front();
                    }
                }
            }
            Stage::Deletions => {
                self.export_deletions()?;
                self.stages.pop_front();
            }
            Stage::State => {
                write_final_state(
                    &mut self.encoder,
                    &self.tracking.state,
                    SyncType::Contents,
                    self.options.flags,
                )?;
                self.stages.pop_front();
            }
        }
        Ok(())
    }

    fn open_table(&self, associated: bool) -> Result<VecDeque<ObjectId>> {
        let (table, seen) = if associated {
            (TableType::Fai, &self.tracking.initial.cnset_seen_fai)
        } else {
            (TableType::Messages, &self.tracking.initial.cnset_seen)
        };
        let watermark = self.tracking.watermark(seen);
        let order = if self.options.extra_flags.contains(ExtraFlags::ORDER_BY_DELIVERY_TIME) {
            SortOrder::DeliveryTimeDescending
        } else {
            SortOrder::IdAscending
        };
        let rows = self
            .store
            .query_table(self.options.folder, table, watermark, order)?;
        tracing::debug!(
            "export stage {:?}: {} rows changed after {:?}",
            table,
            rows.len(),
            watermark
        );
        Ok(rows.into())
    }

    fn finish_table(&mut self, associated: bool) {
        let cns = self.tracking.finish_stage();
        let state = &mut self.tracking.state;
        if associated {
            state.cnset_seen_fai = state.cnset_seen_fai.merge(&cns);
        } else {
            state.cnset_seen = state.cnset_seen.merge(&cns);
            if self.options.flags.contains(SyncFlags::READ_STATE) {
                state.cnset_read = state.cnset_read.merge(&cns);
            }
        }
    }

    fn export_row(&mut self, mid: ObjectId, associated: bool) -> Result<()> {
        let store = self.store.as_ref();
        let ident = Identity::new(store);
        let path = MessagePath::top(mid);
        let obj = ObjectRef::Message(path.clone());

        let cn = match change_number_of(store, &obj) {
            Ok(cn) => cn,
            Err(IcsError::Store(StoreError::NotFound { .. })) => {
                tracing::debug!("message {} vanished during export", mid);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut stored = store
            .get_properties(
                &obj,
                &[
                    tags::CHANGE_KEY,
                    tags::PREDECESSOR_CHANGE_LIST,
                    tags::LAST_MODIFICATION_TIME,
                    tags::MESSAGE_SIZE,
                ],
            )?
            .into_iter();
        let stored_change_key = stored.next().flatten();
        let stored_pcl = stored.next().flatten();
        let last_modified = stored.next().flatten();
        let size = stored.next().flatten();

        self.tracking.observe(&ident, mid, cn)?;
        let seen = if associated {
            &self.tracking.initial.cnset_seen_fai
        } else {
            &self.tracking.initial.cnset_seen
        };
        if seen.contains(&ident.guid_of(cn.replica_id())?, cn.counter()) && stored_change_key.is_some() {
            self.stats.skipped += 1;
            return Ok(());
        }

        let change_key = match stored_change_key {
            Some(PropValue::Binary(bytes)) => bytes,
            _ => ident.change_key_of(cn)?.to_bytes(),
        };
        let pcl = match stored_pcl {
            Some(PropValue::Binary(bytes)) => bytes,
            _ => match Xid::from_bytes(&change_key) {
                Ok(xid) => PredecessorChangeList::single(xid).to_bytes(),
                Err(_) => ident.predecessor_change_list_of(cn)?.to_bytes(),
            },
        };
        let last_modified = last_modified.unwrap_or(PropValue::Time(FileTime::UNIX_EPOCH));
        let extra = self.options.extra_flags;

        let encoder = &mut self.encoder;
        encoder.push_marker(Marker::IncrSyncChg);
        encoder.push_property(
            tags::SOURCE_KEY,
            &PropValue::Binary(ident.source_key_of(mid)?.to_bytes()),
        )?;
        encoder.push_property(tags::LAST_MODIFICATION_TIME, &last_modified)?;
        encoder.push_property(tags::CHANGE_KEY, &PropValue::Binary(change_key))?;
        encoder.push_property(tags::PREDECESSOR_CHANGE_LIST, &PropValue::Binary(pcl))?;
        encoder.push_property(tags::ASSOCIATED, &PropValue::Bool(associated))?;
        if extra.contains(ExtraFlags::EID) {
            encoder.push_property(tags::MID, &PropValue::I64(mid.value() as i64))?;
        }
        if extra.contains(ExtraFlags::MESSAGE_SIZE) {
            encoder.push_property(tags::MESSAGE_SIZE, &size.unwrap_or(PropValue::I32(0)))?;
        }
        if extra.contains(ExtraFlags::CN) {
            encoder.push_property(tags::CHANGE_NUMBER, &PropValue::I64(cn.value() as i64))?;
        }
        encoder.push_marker(Marker::IncrSyncMessage);

        let all = PropertySelection::all();
        let selection = if associated && self.options.flags.contains(SyncFlags::IGNORE_SPECIFIED_ON_FAI) {
            &all
        } else {
            &self.options.properties
        };
        Writer::new(store).write_message_content(&mut self.encoder, &path, selection, &HEADER_TAGS, true)?;
        self.stats.changes += 1;
        Ok(())
    }

    fn export_deletions(&mut self) -> Result<()> {
        let Some(watermark) = self.tracking.deletion_watermark() else {
            return Ok(());
        };
        let store = self.store.as_ref();
        let mut deleted = Vec::new();
        if self.options.flags.contains(SyncFlags::NORMAL) {
            deleted.extend(store.deleted_since(self.options.folder, TableType::Messages, watermark)?);
        }
        if self.options.flags.contains(SyncFlags::FAI) {
            deleted.extend(store.deleted_since(self.options.folder, TableType::Fai, watermark)?);
        }
        let ident = Identity::new(store);
        self.stats.deletions += write_deletions(&mut self.encoder, &ident, &mut self.tracking, &deleted)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::SyncExport;
    use crate::session::SyncState;
    use crate::store::{DeleteMode, IdAllocator, MemoryStore, ObjectKind, ReplicaDirectory};
    use ics_core::{decode, ChunkCursor, Element, TransferStatus};
    use ics_types::TaggedValue;

    fn options(folder: ObjectId, flags: SyncFlags) -> ExportOptions {
        ExportOptions {
            folder,
            flags,
            extra_flags: ExtraFlags::default(),
            properties: PropertySelection::exclude(Vec::new()),
            batch_bytes: 64,
        }
    }

    fn run(store: &Arc<dyn Store>, options: ExportOptions, state: SyncState) -> (Vec<Element>, SyncState) {
        let mut export = SyncExport::new(Arc::clone(store), SyncType::Contents, options, state).unwrap();
        let mut cursor = ChunkCursor::new(1);
        let mut bytes = Vec::new();
        loop {
            let chunk = cursor.next_chunk(&mut export, 50).unwrap();
            bytes.extend_from_slice(&chunk.data);
            if chunk.status == TransferStatus::Done {
                break;
            }
        }
        (decode(&bytes).unwrap(), export.state().clone())
    }

    fn count_marker(elements: &[Element], marker: Marker) -> usize {
        elements
            .iter()
            .filter(|e| **e == Element::Marker(marker))
            .count()
    }

    fn setup() -> (Arc<MemoryStore>, ObjectId) {
        let store = Arc::new(MemoryStore::new());
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        (store, inbox)
    }

    #[test]
    fn first_sync_reports_every_message() {
        let (store, inbox) = setup();
        for n in 0..3 {
            store.add_message(inbox, &format!("m{n}"), false).unwrap();
        }
        let store: Arc<dyn Store> = store;

        let (elements, state) = run(&store, options(inbox, SyncFlags::NORMAL), SyncState::default());
        assert_eq!(count_marker(&elements, Marker::IncrSyncChg), 3);
        assert_eq!(count_marker(&elements, Marker::IncrSyncMessage), 3);
        assert_eq!(elements.last(), Some(&Element::Marker(Marker::IncrSyncEnd)));
        assert_eq!(state.idset_given.count(), 3);
        assert_eq!(state.cnset_seen.count(), 3);
        let (_, local) = store.local_replica();
        assert_eq!(state.cnset_seen.ranges(&local).len(), 1);
    }

    #[test]
    fn second_sync_without_changes_is_empty() {
        let (store, inbox) = setup();
        store.add_message(inbox, "a", false).unwrap();
        let store: Arc<dyn Store> = store;

        let (_, state) = run(&store, options(inbox, SyncFlags::NORMAL), SyncState::default());
        let (elements, again) = run(&store, options(inbox, SyncFlags::NORMAL), state.clone());
        assert_eq!(count_marker(&elements, Marker::IncrSyncChg), 0);
        assert_eq!(again.cnset_seen, state.cnset_seen);
    }

    #[test]
    fn modified_message_is_exported_again() {
        let (store, inbox) = setup();
        let a = store.add_message(inbox, "a", false).unwrap();
        store.add_message(inbox, "b", false).unwrap();
        let dyn_store: Arc<dyn Store> = store.clone();

        let (_, state) = run(&dyn_store, options(inbox, SyncFlags::NORMAL), SyncState::default());
        store
            .modify_message(a, &[TaggedValue::new(tags::SUBJECT, PropValue::Unicode("a2".into()))])
            .unwrap();
        let (elements, _) = run(&dyn_store, options(inbox, SyncFlags::NORMAL), state);
        assert_eq!(count_marker(&elements, Marker::IncrSyncChg), 1);
        assert!(elements.contains(&Element::Property {
            tag: tags::SUBJECT,
            named: None,
            value: PropValue::Unicode("a2".into()),
        }));
    }

    #[test]
    fn deletions_follow_changes() {
        let (store, inbox) = setup();
        let a = store.add_message(inbox, "a", false).unwrap();
        store.add_message(inbox, "b", false).unwrap();
        let dyn_store: Arc<dyn Store> = store.clone();

        let (_, state) = run(&dyn_store, options(inbox, SyncFlags::NORMAL), SyncState::default());
        let cn = store.next_change_number().unwrap();
        store
            .delete_object(a, ObjectKind::Message, DeleteMode::Soft, cn)
            .unwrap();

        let (elements, after) = run(&dyn_store, options(inbox, SyncFlags::NORMAL), state);
        assert_eq!(count_marker(&elements, Marker::IncrSyncDel), 1);
        assert_eq!(after.idset_given.count(), 1);

        let (elements, _) = run(
            &dyn_store,
            options(inbox, SyncFlags::NORMAL | SyncFlags::NO_DELETIONS),
            SyncState {
                idset_given: after.idset_given.merge(&ics_core::ChangeSet::single(
                    store.local_replica().1,
                    a.counter(),
                )),
                ..after.clone()
            },
        );
        assert_eq!(count_marker(&elements, Marker::IncrSyncDel), 0);
    }

    #[test]
    fn fai_stage_has_its_own_state() {
        let (store, inbox) = setup();
        store.add_message(inbox, "normal", false).unwrap();
        store.add_message(inbox, "fai", true).unwrap();
        let store: Arc<dyn Store> = store;

        let flags = SyncFlags::NORMAL | SyncFlags::FAI;
        let (elements, state) = run(&store, options(inbox, flags), SyncState::default());
        assert_eq!(count_marker(&elements, Marker::IncrSyncChg), 2);
        assert_eq!(state.cnset_seen.count(), 1);
        assert_eq!(state.cnset_seen_fai.count(), 1);
        assert!(elements.iter().any(|e| matches!(
            e,
            Element::State { tag, .. } if *tag == ics_types::meta::CNSET_SEEN_FAI
        )));
    }

    #[test]
    fn read_state_records_normal_change_numbers() {
        let (store, inbox) = setup();
        store.add_message(inbox, "a", false).unwrap();
        let store: Arc<dyn Store> = store;

        let flags = SyncFlags::NORMAL | SyncFlags::READ_STATE;
        let (_, state) = run(&store, options(inbox, flags), SyncState::default());
        assert_eq!(state.cnset_read, state.cnset_seen);
    }

    #[test]
    fn header_carries_extra_flag_properties() {
        let (store, inbox) = setup();
        let mid = store.add_message(inbox, "a", false).unwrap();
        let store: Arc<dyn Store> = store;

        let mut opts = options(inbox, SyncFlags::NORMAL);
        opts.extra_flags = ExtraFlags::EID | ExtraFlags::CN | ExtraFlags::MESSAGE_SIZE;
        let (elements, _) = run(&store, opts, SyncState::default());
        assert!(elements.contains(&Element::Property {
            tag: tags::MID,
            named: None,
            value: PropValue::I64(mid.value() as i64),
        }));
        let mids = elements
            .iter()
            .filter(|e| matches!(e, Element::Property { tag, .. } if *tag == tags::MID))
            .count();
        assert_eq!(mids, 1);
    }

    #[test]
    fn only_specified_properties_limits_the_body() {
        let (store, inbox) = setup();
        store.add_message(inbox, "a", false).unwrap();
        let store: Arc<dyn Store> = store;

        let mut opts = options(inbox, SyncFlags::NORMAL | SyncFlags::ONLY_SPECIFIED_PROPERTIES);
        opts.properties = PropertySelection::include(vec![tags::SUBJECT]);
        let (elements, _) = run(&store, opts, SyncState::default());
        assert!(!elements
            .iter()
            .any(|e| matches!(e, Element::Property { tag, .. } if *tag == tags::MESSAGE_CLASS)));
        assert!(elements
            .iter()
            .any(|e| matches!(e, Element::Property { tag, .. } if *tag == tags::SUBJECT)));
    }

    #[test]
    fn delivery_time_order_is_honored() {
        let (store, inbox) = setup();
        let old = store.add_message(inbox, "old", false).unwrap();
        let new = store.add_message(inbox, "new", false).unwrap();
        store
            .modify_message(old, &[TaggedValue::new(tags::MESSAGE_DELIVERY_TIME, PropValue::Time(FileTime(1)))])
            .unwrap();
        store
            .modify_message(new, &[TaggedValue::new(tags::MESSAGE_DELIVERY_TIME, PropValue::Time(FileTime(2)))])
            .unwrap();
        let store: Arc<dyn Store> = store;

        let mut opts = options(inbox, SyncFlags::NORMAL);
        opts.extra_flags = ExtraFlags::ORDER_BY_DELIVERY_TIME;
        let (elements, _) = run(&store, opts, SyncState::default());
        let subjects: Vec<&str> = elements
            .iter()
            .filter_map(|e| match e {
                Element::Property { tag, value, .. } if *tag == tags::SUBJECT => value.as_str(),
                _ => None,
            })
            .collect();
        assert_eq!(subjects, vec!["new", "old"]);
    }
}
