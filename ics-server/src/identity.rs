//! Mapping between local object ids and replica-qualified identities.
//!
//! Local ids carry a 16-bit REPLID; everything that leaves the server
//! (source keys, change keys, change sets) carries the replica GUID instead.

use crate::error::{IcsError, Result};
use crate::store::{ObjectKind, PropertyStore, ReplicaDirectory, Store};
use ics_core::ReplicaMap;
use ics_types::{
    ChangeNumber, GlobalCounter, ObjectId, PredecessorChangeList, ReplicaGuid, ReplicaId,
    SourceKey, Xid,
};

/// Identity conversions backed by the store's replica directory.
#[derive(Clone, Copy)]
pub struct Identity<'a> {
    store: &'a dyn Store,
}

impl<'a> Identity<'a> {
    /// Wrap a store.
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// GUID behind a REPLID.
    pub fn guid_of(&self, id: ReplicaId) -> Result<ReplicaGuid> {
        self.store
            .replica_guid(id)
            .ok_or_else(|| IcsError::NotFound(format!("replica id {id}")))
    }

    /// Source key of a local folder or message id.
    pub fn source_key_of(&self, id: ObjectId) -> Result<SourceKey> {
        Ok(SourceKey::new(self.guid_of(id.replica_id())?, id.counter()))
    }

    /// Source key bytes of the parent folder of `id`.
    pub fn parent_source_key(&self, id: ObjectId, kind: ObjectKind) -> Result<Vec<u8>> {
        let parent = self.store.parent_folder(id, kind)?;
        Ok(self.source_key_of(parent)?.to_bytes())
    }

    /// Local id named by a source key.
    ///
    /// Fails with [`IcsError::UnknownReplica`] when the GUID has no local
    /// REPLID; the id itself need not exist yet.
    pub fn object_id_of(&self, key: &SourceKey) -> Result<ObjectId> {
        let replid = self
            .store
            .replica_id(&key.guid)
            .ok_or(IcsError::UnknownReplica(key.guid))?;
        Ok(ObjectId::new(replid, key.counter))
    }

    /// Parse source key bytes and resolve them to a local id.
    pub fn parse_source_key(&self, bytes: &[u8]) -> Result<ObjectId> {
        let key = SourceKey::from_bytes(bytes)?;
        self.object_id_of(&key)
    }

    /// Change key (22-byte XID) of a change number.
    pub fn change_key_of(&self, cn: ChangeNumber) -> Result<Xid> {
        Ok(Xid::from_counter(self.guid_of(cn.replica_id())?, cn.counter()))
    }

    /// Single-entry predecessor change list of a change number.
    pub fn predecessor_change_list_of(&self, cn: ChangeNumber) -> Result<PredecessorChangeList> {
        Ok(PredecessorChangeList::single(self.change_key_of(cn)?))
    }

    /// Local id named by an XID whose local part is a counter.
    pub fn xid_to_object_id(&self, xid: &Xid) -> Result<ObjectId> {
        let counter: GlobalCounter = xid
            .counter()
            .ok_or_else(|| IcsError::InvalidParameter(format!("XID local id of {} bytes", xid.local_id.len())))?;
        self.object_id_of(&SourceKey::new(xid.guid, counter))
    }

    /// Replica map view for REPLID-form change sets.
    pub fn replica_map(&self) -> StoreReplicaMap<'a> {
        StoreReplicaMap { store: self.store }
    }
}

/// [`ReplicaMap`] over a store's replica directory.
pub struct StoreReplicaMap<'a> {
    store: &'a dyn Store,
}

impl ReplicaMap for StoreReplicaMap<'_> {
    fn guid_of(&self, id: ReplicaId) -> Option<ReplicaGuid> {
        self.store.replica_guid(id)
    }

    fn replid_of(&self, guid: &ReplicaGuid) -> Option<ReplicaId> {
        self.store.replica_id(guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdAllocator, MemoryStore};

    #[test]
    fn source_key_round_trips_through_local_id() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();

        let key = ident.source_key_of(inbox).unwrap();
        assert_eq!(key.guid, store.local_replica().1);
        assert_eq!(ident.parse_source_key(&key.to_bytes()).unwrap(), inbox);
    }

    #[test]
    fn unknown_guid_is_unknown_replica() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let key = SourceKey::new(ReplicaGuid::random(), GlobalCounter::new(5));
        assert!(matches!(
            ident.object_id_of(&key),
            Err(IcsError::UnknownReplica(_))
        ));
    }

    #[test]
    fn foreign_replicas_resolve_through_directory() {
        let store = MemoryStore::new();
        let foreign = ReplicaGuid::random();
        store.register_replica(ReplicaId::new(7), foreign);
        let ident = Identity::new(&store);

        let id = ident
            .object_id_of(&SourceKey::new(foreign, GlobalCounter::new(9)))
            .unwrap();
        assert_eq!(id.replica_id(), ReplicaId::new(7));
        assert_eq!(ident.source_key_of(id).unwrap().guid, foreign);
    }

    #[test]
    fn parent_source_key_names_the_containing_folder() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let mid = store.add_message(inbox, "hello", false).unwrap();

        let parent = ident.parent_source_key(mid, ObjectKind::Message).unwrap();
        assert_eq!(parent, ident.source_key_of(inbox).unwrap().to_bytes());
    }

    #[test]
    fn change_key_is_22_bytes_with_single_entry_pcl() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let cn = store.next_change_number().unwrap();

        let xid = ident.change_key_of(cn).unwrap();
        assert_eq!(xid.to_bytes().len(), 22);
        let pcl = ident.predecessor_change_list_of(cn).unwrap();
        assert_eq!(pcl.to_bytes()[0], 22);
        assert_eq!(pcl.entries(), &[xid]);
    }

    #[test]
    fn xid_resolves_to_object_id() {
        let store = MemoryStore::new();
        let ident = Identity::new(&store);
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let mid = store.add_message(inbox, "m", false).unwrap();

        let xid = Xid::from_counter(store.local_replica().1, mid.counter());
        assert_eq!(ident.xid_to_object_id(&xid).unwrap(), mid);
    }
}
