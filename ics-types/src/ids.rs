//! Identity and ordering types for ICS.
//!
//! Objects (folders and messages) and their versions are named by 64-bit
//! ids that pack a 48-bit [`GlobalCounter`] with a 16-bit [`ReplicaId`].
//! The replica id is only meaningful inside one mailbox, so ids travel on
//! the wire as [`SourceKey`]s / [`Xid`]s that carry the replica GUID instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::WireError;

/// A unique identifier for a replica (one id namespace instance).
///
/// 16 bytes, serialized in the Microsoft GUID layout (the first three
/// fields little-endian).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaGuid(Uuid);

impl ReplicaGuid {
    /// Wire size in bytes.
    pub const LEN: usize = 16;

    /// Create a new random ReplicaGuid.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Decode from the 16-byte wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let arr: [u8; 16] = bytes.try_into().map_err(|_| WireError::InvalidLength {
            what: "replica guid",
            len: bytes.len(),
        })?;
        Ok(Self(Uuid::from_bytes_le(arr)))
    }

    /// Encode to the 16-byte wire layout.
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ReplicaGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for ReplicaGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaGuid({})", &self.to_string()[..8])
    }
}

impl FromStr for ReplicaGuid {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| WireError::InvalidData(format!("replica guid: {e}")))
    }
}

/// Short local id of a replica inside one mailbox (REPLID).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// Create a ReplicaId with the given value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

/// A 48-bit replica-scoped counter (GLOBCNT).
///
/// The server never issues the same value twice for one replica. On the
/// wire the counter is six bytes, most significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct GlobalCounter(u64);

impl GlobalCounter {
    /// Largest representable counter.
    pub const MAX: GlobalCounter = GlobalCounter((1 << 48) - 1);

    /// Wire size in bytes.
    pub const LEN: usize = 6;

    /// Create a counter, truncating to 48 bits.
    pub const fn new(value: u64) -> Self {
        Self(value & Self::MAX.0)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The following counter, saturating at [`GlobalCounter::MAX`].
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1).min(Self::MAX.0))
    }

    /// Encode as six big-endian bytes.
    pub fn to_bytes(&self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&be[2..]);
        out
    }

    /// Decode from six big-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::LEN {
            return Err(WireError::InvalidLength {
                what: "global counter",
                len: bytes.len(),
            });
        }
        let mut be = [0u8; 8];
        be[2..].copy_from_slice(bytes);
        Ok(Self(u64::from_be_bytes(be)))
    }
}

impl fmt::Display for GlobalCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl fmt::Debug for GlobalCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalCounter({:#x})", self.0)
    }
}

/// A folder id (FID) or message id (MID).
///
/// Encoded as `(counter << 16) | replica_id`. Folder and message ids are
/// separate namespaces sharing this encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Build an id from its replica and counter parts.
    pub fn new(replica: ReplicaId, counter: GlobalCounter) -> Self {
        Self((counter.value() << 16) | u64::from(replica.value()))
    }

    /// Reinterpret a raw 64-bit value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw 64-bit value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Replica id held in the low 16 bits.
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new((self.0 & 0xffff) as u16)
    }

    /// Counter held in the high 48 bits.
    pub fn counter(&self) -> GlobalCounter {
        GlobalCounter::new(self.0 >> 16)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x}/{})", self.counter().value(), self.replica_id().value())
    }
}

/// A change number: versions an object, minted on every mutating save.
///
/// Same encoding as [`ObjectId`]. Higher counters are strictly newer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeNumber(u64);

impl ChangeNumber {
    /// Build a change number from its replica and counter parts.
    pub fn new(replica: ReplicaId, counter: GlobalCounter) -> Self {
        Self((counter.value() << 16) | u64::from(replica.value()))
    }

    /// Reinterpret a raw 64-bit value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw 64-bit value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Replica id held in the low 16 bits.
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new((self.0 & 0xffff) as u16)
    }

    /// Counter held in the high 48 bits.
    pub fn counter(&self) -> GlobalCounter {
        GlobalCounter::new(self.0 >> 16)
    }
}

impl fmt::Display for ChangeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for ChangeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeNumber({:#x}/{})", self.counter().value(), self.replica_id().value())
    }
}

/// Transport-portable identifier: replica GUID + 6-byte counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    /// Replica the counter belongs to.
    pub guid: ReplicaGuid,
    /// Counter inside that replica.
    pub counter: GlobalCounter,
}

impl SourceKey {
    /// Wire size in bytes.
    pub const LEN: usize = ReplicaGuid::LEN + GlobalCounter::LEN;

    /// Create a source key.
    pub fn new(guid: ReplicaGuid, counter: GlobalCounter) -> Self {
        Self { guid, counter }
    }

    /// Encode to the 22-byte wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.guid.to_bytes());
        out.extend_from_slice(&self.counter.to_bytes());
        out
    }

    /// Decode from the 22-byte wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::LEN {
            return Err(WireError::InvalidLength {
                what: "source key",
                len: bytes.len(),
            });
        }
        Ok(Self {
            guid: ReplicaGuid::from_bytes(&bytes[..ReplicaGuid::LEN])?,
            counter: GlobalCounter::from_bytes(&bytes[ReplicaGuid::LEN..])?,
        })
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceKey({:?}:{})", self.guid, self.counter)
    }
}

/// An external id (XID): replica GUID followed by a 1..=8 byte local id.
///
/// Change keys and predecessor change list entries are XIDs. This server
/// always mints 6-byte local ids (a big-endian [`GlobalCounter`]).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    /// Replica namespace of the local id.
    pub guid: ReplicaGuid,
    /// Variable-length local id.
    pub local_id: Vec<u8>,
}

impl Xid {
    /// Minimum encoded length (GUID + 1 byte).
    pub const MIN_LEN: usize = ReplicaGuid::LEN + 1;
    /// Maximum encoded length (GUID + 8 bytes).
    pub const MAX_LEN: usize = ReplicaGuid::LEN + 8;

    /// XID naming `counter` inside `guid`.
    pub fn from_counter(guid: ReplicaGuid, counter: GlobalCounter) -> Self {
        Self {
            guid,
            local_id: counter.to_bytes().to_vec(),
        }
    }

    /// The local id as a counter, when it is the 6-byte form.
    pub fn counter(&self) -> Option<GlobalCounter> {
        GlobalCounter::from_bytes(&self.local_id).ok()
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        ReplicaGuid::LEN + self.local_id.len()
    }

    /// Always false; an XID carries at least a GUID.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Encode as GUID + local id.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.guid.to_bytes());
        out.extend_from_slice(&self.local_id);
        out
    }

    /// Decode an XID occupying all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&bytes.len()) {
            return Err(WireError::InvalidLength {
                what: "xid",
                len: bytes.len(),
            });
        }
        Ok(Self {
            guid: ReplicaGuid::from_bytes(&bytes[..ReplicaGuid::LEN])?,
            local_id: bytes[ReplicaGuid::LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({:?}:{})", self.guid, hex::encode(&self.local_id))
    }
}

/// A predecessor change list: the set of change keys an object descends from.
///
/// Encoded as back-to-back `u8 size` + XID entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PredecessorChangeList(Vec<Xid>);

impl PredecessorChangeList {
    /// Degraded single-entry list holding only the object's own change key.
    pub fn single(xid: Xid) -> Self {
        Self(vec![xid])
    }

    /// Entries in encoded order.
    pub fn entries(&self) -> &[Xid] {
        &self.0
    }

    /// Encode as SizedXid entries.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for xid in &self.0 {
            out.push(xid.len() as u8);
            out.extend_from_slice(&xid.to_bytes());
        }
        out
    }

    /// Decode a list of SizedXid entries.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let size = bytes[pos] as usize;
            pos += 1;
            let end = pos + size;
            if end > bytes.len() {
                return Err(WireError::Truncated {
                    what: "predecessor change list",
                    needed: end,
                    available: bytes.len(),
                });
            }
            entries.push(Xid::from_bytes(&bytes[pos..end])?);
            pos = end;
        }
        Ok(Self(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_guid_uses_mixed_endian_layout() {
        let guid: ReplicaGuid = "aa9a6453-1839-4a32-bb4e-183952f05cbd".parse().unwrap();
        let bytes = guid.to_bytes();
        assert_eq!(&bytes[..4], &[0x53, 0x64, 0x9a, 0xaa]);
        assert_eq!(ReplicaGuid::from_bytes(&bytes).unwrap(), guid);
    }

    #[test]
    fn replica_guid_from_invalid_length_fails() {
        assert!(ReplicaGuid::from_bytes(&[0u8; 15]).is_err());
        assert!(ReplicaGuid::from_bytes(&[0u8; 17]).is_err());
    }

    #[test]
    fn global_counter_is_big_endian_on_the_wire() {
        let counter = GlobalCounter::new(0x3f6);
        assert_eq!(counter.to_bytes(), [0, 0, 0, 0, 0x03, 0xf6]);
        assert_eq!(GlobalCounter::from_bytes(&counter.to_bytes()).unwrap(), counter);
    }

    #[test]
    fn global_counter_truncates_to_48_bits() {
        assert_eq!(GlobalCounter::new(u64::MAX), GlobalCounter::MAX);
        assert_eq!(GlobalCounter::MAX.next(), GlobalCounter::MAX);
    }

    #[test]
    fn object_id_packs_counter_and_replica() {
        let id = ObjectId::new(ReplicaId::new(1), GlobalCounter::new(0x1234));
        assert_eq!(id.value(), 0x1234_0001);
        assert_eq!(id.counter().value(), 0x1234);
        assert_eq!(id.replica_id(), ReplicaId::new(1));
    }

    #[test]
    fn change_numbers_order_by_counter() {
        let older = ChangeNumber::new(ReplicaId::new(1), GlobalCounter::new(10));
        let newer = ChangeNumber::new(ReplicaId::new(1), GlobalCounter::new(11));
        assert!(older < newer);
    }

    #[test]
    fn source_key_is_22_bytes() {
        let key = SourceKey::new(ReplicaGuid::random(), GlobalCounter::new(42));
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), 22);
        assert_eq!(SourceKey::from_bytes(&bytes).unwrap(), key);
        assert!(SourceKey::from_bytes(&bytes[..21]).is_err());
    }

    #[test]
    fn xid_accepts_short_local_ids() {
        let guid = ReplicaGuid::random();
        let mut bytes = guid.to_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 4, 0x1a]);
        let xid = Xid::from_bytes(&bytes).unwrap();
        assert_eq!(xid.local_id, vec![0, 0, 4, 0x1a]);
        assert!(xid.counter().is_none());
        assert!(Xid::from_bytes(&bytes[..16]).is_err());
    }

    #[test]
    fn predecessor_change_list_parses_sized_entries() {
        let guid = ReplicaGuid::random();
        let first = Xid::from_counter(guid, GlobalCounter::new(7));
        let second = Xid {
            guid,
            local_id: vec![0, 0, 4, 0x1a],
        };
        let mut bytes = PredecessorChangeList::single(first.clone()).to_bytes();
        bytes.push(second.len() as u8);
        bytes.extend_from_slice(&second.to_bytes());

        let pcl = PredecessorChangeList::from_bytes(&bytes).unwrap();
        assert_eq!(pcl.entries(), &[first, second]);
    }

    #[test]
    fn truncated_predecessor_change_list_fails() {
        let xid = Xid::from_counter(ReplicaGuid::random(), GlobalCounter::new(1));
        let bytes = PredecessorChangeList::single(xid).to_bytes();
        assert!(matches!(
            PredecessorChangeList::from_bytes(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated { .. })
        ));
    }
}
