//! Hierarchy synchronization: folder changes below the synchronized folder.
//!
//! The walk keeps an explicit stack of `(folder id, parent source key)`.
//! Children are pushed in reverse so the first child is visited next, which
//! makes the output depth-first with children before later siblings.
//! Unchanged folders are not emitted but their subtrees are still walked.

use super::writer::Writer;
use super::{change_number_of, write_deletions, write_final_state, ExportOptions, ExportStats, Tracking};
use crate::error::{IcsError, Result, StoreError};
use crate::identity::Identity;
use crate::session::{ExtraFlags, SyncFlags, SyncType};
use crate::store::{ObjectRef, PropertyStore, SortOrder, Store, TableType};
use ics_core::Encoder;
use ics_types::{tags, FileTime, Marker, ObjectId, PredecessorChangeList, PropTag, PropValue, Xid};
use std::sync::Arc;

const HEADER_TAGS: [PropTag; 8] = [
    tags::PARENT_SOURCE_KEY,
    tags::SOURCE_KEY,
    tags::LAST_MODIFICATION_TIME,
    tags::CHANGE_KEY,
    tags::PREDECESSOR_CHANGE_LIST,
    tags::DISPLAY_NAME,
    tags::FOLDER_ID,
    tags::PARENT_FOLDER_ID,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Walk,
    Deletions,
    State,
    Done,
}

/// Lazy export of a folder tree.
pub struct HierarchyExport {
    store: Arc<dyn Store>,
    options: ExportOptions,
    pub(super) tracking: Tracking,
    pub(super) encoder: Encoder,
    pub(super) stats: ExportStats,
    stack: Vec<(ObjectId, Vec<u8>)>,
    phase: Phase,
}

impl std::fmt::Debug for HierarchyExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyExport")
            .field("folder", &self.options.folder)
            .field("phase", &self.phase)
            .field("pending", &self.stack.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl HierarchyExport {
    pub(super) fn new(store: Arc<dyn Store>, options: ExportOptions, tracking: Tracking) -> Result<Self> {
        let children = store.query_table(options.folder, TableType::Folders, None, SortOrder::IdAscending)?;
        // direct children of the synchronized folder get an empty parent key
        let stack = children.into_iter().rev().map(|fid| (fid, Vec::new())).collect();
        Ok(Self {
            store,
            options,
            tracking,
            encoder: Encoder::new(),
            stats: ExportStats::default(),
            stack,
            phase: Phase::Walk,
        })
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.phase == Phase::Done
    }

    pub(super) fn produce(&mut self) -> Result<()> {
        let start = self.encoder.len();
        let budget = self.options.batch_bytes.max(1);
        while !self.is_exhausted() && self.encoder.len() - start < budget {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        match self.phase {
            Phase::Walk => match self.stack.pop() {
                Some((fid, parent_key)) => self.visit(fid, parent_key)?,
                None => {
                    let cns = self.tracking.finish_stage();
                    let state = &mut self.tracking.state;
                    state.cnset_seen = state.cnset_seen.merge(&cns);
                    self.phase = if self.options.flags.contains(SyncFlags::NO_DELETIONS) {
                        Phase::State
                    } else {
                        Phase::Deletions
                    };
                }
            },
            Phase::Deletions => {
                if let Some(watermark) = self.tracking.deletion_watermark() {
                    let store = self.store.as_ref();
                    let deleted = store.deleted_since(self.options.folder, TableType::Folders, watermark)?;
                    let ident = Identity::new(store);
                    self.stats.deletions +=
                        write_deletions(&mut self.encoder, &ident, &mut self.tracking, &deleted)?;
                }
                self.phase = Phase::State;
            }
            Phase::State => {
                write_final_state(
                    &mut self.encoder,
                    &self.tracking.state,
                    SyncType::Hierarchy,
                    self.options.flags,
                )?;
                self.phase = Phase::Done;
            }
            Phase::Done => {}
        }
        Ok(())
    }

    fn visit(&mut self, fid: ObjectId, parent_key: Vec<u8>) -> Result<()> {
        let store = self.store.as_ref();
        let ident = Identity::new(store);
        let obj = ObjectRef::Folder(fid);

        let cn = match change_number_of(store, &obj) {
            Ok(cn) => cn,
            Err(IcsError::Store(StoreError::NotFound { .. })) => {
                tracing::debug!("folder {} vanished during export", fid);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let source_key = ident.source_key_of(fid)?.to_bytes();
        let children = store.query_table(fid, TableType::Folders, None, SortOrder::IdAscending)?;
        self.stack
            .extend(children.into_iter().rev().map(|child| (child, source_key.clone())));

        let watermark = self.tracking.watermark(&self.tracking.initial.cnset_seen);
        if watermark.is_some_and(|w| cn <= w) {
            return Ok(());
        }

        let mut stored = store
            .get_properties(
                &obj,
                &[
                    tags::CHANGE_KEY,
                    tags::PREDECESSOR_CHANGE_LIST,
                    tags::LAST_MODIFICATION_TIME,
                    tags::DISPLAY_NAME,
                    tags::PARENT_FOLDER_ID,
                ],
            )?
            .into_iter();
        let stored_change_key = stored.next().flatten();
        let stored_pcl = stored.next().flatten();
        let last_modified = stored.next().flatten();
        let display_name = stored.next().flatten();
        let parent_fid = stored.next().flatten();

        self.tracking.observe(&ident, fid, cn)?;
        let seen = &self.tracking.initial.cnset_seen;
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

        let encoder = &mut self.encoder;
        encoder.push_marker(Marker::IncrSyncChg);
        encoder.push_property(tags::PARENT_SOURCE_KEY, &PropValue::Binary(parent_key))?;
        encoder.push_property(tags::SOURCE_KEY, &PropValue::Binary(source_key))?;
        encoder.push_property(
            tags::LAST_MODIFICATION_TIME,
            &last_modified.unwrap_or(PropValue::Time(FileTime::UNIX_EPOCH)),
        )?;
        encoder.push_property(tags::CHANGE_KEY, &PropValue::Binary(change_key))?;
        encoder.push_property(tags::PREDECESSOR_CHANGE_LIST, &PropValue::Binary(pcl))?;
        encoder.push_property(
            tags::DISPLAY_NAME,
            &display_name.unwrap_or_else(|| PropValue::Unicode(String::new())),
        )?;
        if self.options.extra_flags.contains(ExtraFlags::EID) {
            encoder.push_property(tags::FOLDER_ID, &PropValue::I64(fid.value() as i64))?;
            if let Some(parent) = parent_fid {
                encoder.push_property(tags::PARENT_FOLDER_ID, &parent)?;
            }
        }

        Writer::new(store).write_selected(&mut self.encoder, &obj, &self.options.properties, &HEADER_TAGS)?;
        self.stats.changes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::SyncExport;
    use crate::session::{PropertySelection, SyncState};
    use crate::store::{DeleteMode, IdAllocator, MemoryStore, ObjectKind};
    use ics_core::{decode, ChunkCursor, Element, TransferStatus};

    fn run(store: &Arc<dyn Store>, folder: ObjectId, state: SyncState) -> (Vec<Element>, SyncState) {
        let options = ExportOptions {
            folder,
            flags: SyncFlags::UNICODE,
            extra_flags: ExtraFlags::EID,
            properties: PropertySelection::exclude(Vec::new()),
            batch_bytes: 32,
        };
        let mut export = SyncExport::new(Arc::clone(store), SyncType::Hierarchy, options, state).unwrap();
        let mut cursor = ChunkCursor::new(1);
        let mut bytes = Vec::new();
        loop {
            let chunk = cursor.next_chunk(&mut export, 40).unwrap();
            bytes.extend_from_slice(&chunk.data);
            if chunk.status == TransferStatus::Done {
                break;
            }
        }
        (decode(&bytes).unwrap(), export.state().clone())
    }

    fn names(elements: &[Element]) -> Vec<String> {
        elements
            .iter()
            .filter_map(|e| match e {
                Element::Property { tag, value, .. } if *tag == tags::DISPLAY_NAME => {
                    value.as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn walk_is_depth_first() {
        let store = Arc::new(MemoryStore::new());
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        store.add_folder(a, "A1").unwrap();
        store.add_folder(root, "B").unwrap();
        let store: Arc<dyn Store> = store;

        let (elements, state) = run(&store, root, SyncState::default());
        assert_eq!(names(&elements), vec!["A", "A1", "B"]);
        assert_eq!(state.idset_given.count(), 3);
        assert_eq!(state.cnset_seen.count(), 3);
    }

    #[test]
    fn top_level_parent_key_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        store.add_folder(a, "A1").unwrap();
        let ident_key = Identity::new(store.as_ref()).source_key_of(a).unwrap().to_bytes();
        let store: Arc<dyn Store> = store;

        let (elements, _) = run(&store, root, SyncState::default());
        let parents: Vec<Vec<u8>> = elements
            .iter()
            .filter_map(|e| match e {
                Element::Property { tag, value, .. } if *tag == tags::PARENT_SOURCE_KEY => {
                    value.as_binary().map(<[u8]>::to_vec)
                }
                _ => None,
            })
            .collect();
        assert_eq!(parents, vec![Vec::new(), ident_key]);
    }

    #[test]
    fn unchanged_parent_still_reports_changed_child() {
        let store = Arc::new(MemoryStore::new());
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        let dyn_store: Arc<dyn Store> = store.clone();
        let (_, state) = run(&dyn_store, root, SyncState::default());

        store.add_folder(a, "A1").unwrap();
        let (elements, _) = run(&dyn_store, root, state);
        assert_eq!(names(&elements), vec!["A1"]);
    }

    #[test]
    fn deleted_subtree_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        store.add_folder(a, "A1").unwrap();
        let dyn_store: Arc<dyn Store> = store.clone();
        let (_, state) = run(&dyn_store, root, SyncState::default());

        let cn = store.next_change_number().unwrap();
        store
            .delete_object(a, ObjectKind::Folder, DeleteMode::Hard, cn)
            .unwrap();
        let (elements, after) = run(&dyn_store, root, state);
        assert!(elements.contains(&Element::Marker(Marker::IncrSyncDel)));
        assert!(after.idset_given.is_empty());
    }

    #[test]
    fn eid_flag_adds_folder_ids() {
        let store = Arc::new(MemoryStore::new());
        let root = store.root_folder();
        let a = store.add_folder(root, "A").unwrap();
        let store: Arc<dyn Store> = store;

        let (elements, _) = run(&store, root, SyncState::default());
        assert!(elements.contains(&Element::Property {
            tag: tags::FOLDER_ID,
            named: None,
            value: PropValue::I64(a.value() as i64),
        }));
        assert!(elements.contains(&Element::Property {
            tag: tags::PARENT_FOLDER_ID,
            named: None,
            value: PropValue::I64(root.value() as i64),
        }));
    }
}
