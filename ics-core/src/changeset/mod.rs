//! Change sets: per-replica sets of 48-bit counters.
//!
//! A [`ChangeSet`] records which ids (IDSET) or change numbers (CNSET) a
//! client knows about. For every [`ReplicaGuid`] it keeps a sorted list of
//! disjoint, non-adjacent closed ranges. Values are immutable: every
//! operation returns a new set.
//!
//! A [`RawChangeSet`] is the cheap append-only builder used while scanning
//! tables; it is consumed once into a `ChangeSet`.
//!
//! On the wire a change set is a sequence of blocks, each a replica
//! identifier followed by a GLOBSET (see [`globset`]). The identifier is
//! either the full GUID or a 16-bit REPLID resolved through a
//! [`ReplicaMap`].

pub mod globset;

use ics_types::{GlobalCounter, ReplicaGuid, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from change set parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeSetError {
    /// Input ended in the middle of a block.
    #[error("change set truncated at offset {offset}")]
    Truncated {
        /// Byte offset where more input was expected.
        offset: usize,
    },

    /// A GLOBSET command byte is not defined.
    #[error("unknown globset command 0x{command:02x} at offset {offset}")]
    UnknownCommand {
        /// The command byte.
        command: u8,
        /// Byte offset of the command.
        offset: usize,
    },

    /// A push would exceed six bytes of prefix.
    #[error("globset stack overflow at offset {offset}")]
    StackOverflow {
        /// Byte offset of the command.
        offset: usize,
    },

    /// A pop with nothing pushed.
    #[error("globset stack underflow at offset {offset}")]
    StackUnderflow {
        /// Byte offset of the command.
        offset: usize,
    },

    /// End command reached with prefix bytes still pushed.
    #[error("globset ended with {depth} prefix bytes on the stack")]
    UnterminatedStack {
        /// Stack depth at the end command.
        depth: usize,
    },

    /// A bitmask command without exactly five prefix bytes.
    #[error("globset bitmask needs a 5-byte prefix, have {depth}")]
    BitmaskDepth {
        /// Stack depth at the bitmask command.
        depth: usize,
    },

    /// A range whose high bound is below its low bound.
    #[error("inverted range {low:#x}..={high:#x}")]
    InvertedRange {
        /// Low bound.
        low: u64,
        /// High bound.
        high: u64,
    },

    /// Ranges not in strictly ascending order.
    #[error("range starting at {low:#x} does not follow {previous_high:#x}")]
    NonMonotonic {
        /// Low bound of the offending range.
        low: u64,
        /// High bound of the range before it.
        previous_high: u64,
    },

    /// A REPLID with no known GUID.
    #[error("unknown replica id {0}")]
    UnknownReplicaId(u16),

    /// A GUID with no local REPLID.
    #[error("unknown replica guid {0}")]
    UnknownReplicaGuid(ReplicaGuid),

    /// The set names counters the server has not issued yet.
    #[error("counter {max:#x} not below next unissued {next_unissued:#x}")]
    Regression {
        /// Largest counter in the set for the local replica.
        max: u64,
        /// Next counter the server would issue.
        next_unissued: u64,
    },
}

/// Result type for change set operations.
pub type Result<T> = std::result::Result<T, ChangeSetError>;

/// Resolves REPLIDs to replica GUIDs and back.
pub trait ReplicaMap {
    /// GUID registered for a REPLID.
    fn guid_of(&self, id: ReplicaId) -> Option<ReplicaGuid>;

    /// REPLID registered for a GUID.
    fn replid_of(&self, guid: &ReplicaGuid) -> Option<ReplicaId>;
}

impl ReplicaMap for BTreeMap<ReplicaId, ReplicaGuid> {
    fn guid_of(&self, id: ReplicaId) -> Option<ReplicaGuid> {
        self.get(&id).copied()
    }

    fn replid_of(&self, guid: &ReplicaGuid) -> Option<ReplicaId> {
        self.iter().find(|(_, g)| *g == guid).map(|(id, _)| *id)
    }
}

/// A closed range of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRange {
    /// Smallest counter in the range.
    pub low: u64,
    /// Largest counter in the range.
    pub high: u64,
}

impl CounterRange {
    /// Range holding a single counter.
    pub fn single(value: u64) -> Self {
        Self { low: value, high: value }
    }

    /// Whether `value` falls inside the range.
    pub fn contains(&self, value: u64) -> bool {
        self.low <= value && value <= self.high
    }

    /// Number of counters in the range.
    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    /// Always false; a range holds at least one counter.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Sort, then merge overlapping and adjacent ranges.
fn coalesce(mut ranges: Vec<CounterRange>) -> Vec<CounterRange> {
    ranges.sort_by_key(|r| r.low);
    let mut out: Vec<CounterRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if range.low <= last.high.saturating_add(1) => {
                last.high = last.high.max(range.high);
            }
            _ => out.push(range),
        }
    }
    out
}

/// `a` minus `b`, both coalesced.
fn subtract_ranges(a: &[CounterRange], b: &[CounterRange]) -> Vec<CounterRange> {
    let mut out = Vec::new();
    let mut j = 0;
    for range in a {
        let mut low = range.low;
        let high = range.high;
        while j < b.len() && b[j].high < low {
            j += 1;
        }
        let mut k = j;
        while k < b.len() && b[k].low <= high {
            if b[k].low > low {
                out.push(CounterRange {
                    low,
                    high: b[k].low - 1,
                });
            }
            if b[k].high >= high {
                low = high.saturating_add(1);
                break;
            }
            low = b[k].high + 1;
            k += 1;
        }
        if low <= high {
            out.push(CounterRange { low, high });
        }
    }
    out
}

/// An immutable set of counters keyed by replica.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    replicas: BTreeMap<ReplicaGuid, Vec<CounterRange>>,
}

impl ChangeSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding exactly one counter.
    pub fn single(guid: ReplicaGuid, counter: GlobalCounter) -> Self {
        Self::from_ranges(guid, [CounterRange::single(counter.value())])
    }

    /// Set built from arbitrary ranges of one replica.
    pub fn from_ranges(guid: ReplicaGuid, ranges: impl IntoIterator<Item = CounterRange>) -> Self {
        let ranges = coalesce(ranges.into_iter().collect());
        let mut replicas = BTreeMap::new();
        if !ranges.is_empty() {
            replicas.insert(guid, ranges);
        }
        Self { replicas }
    }

    /// Parse the REPLGUID-based form.
    ///
    /// Blocks for the same GUID are merged. Empty input is the empty set.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut replicas: BTreeMap<ReplicaGuid, Vec<CounterRange>> = BTreeMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let end = pos + ReplicaGuid::LEN;
            if end > bytes.len() {
                return Err(ChangeSetError::Truncated { offset: pos });
            }
            let guid = ReplicaGuid::from_bytes(&bytes[pos..end])
                .map_err(|_| ChangeSetError::Truncated { offset: pos })?;
            let (ranges, next) = globset::decode(bytes, end)?;
            replicas.entry(guid).or_default().extend(ranges);
            pos = next;
        }
        Ok(Self::from_map(replicas))
    }

    /// Parse the REPLID-based form, resolving each REPLID through `map`.
    pub fn parse_replid(bytes: &[u8], map: &dyn ReplicaMap) -> Result<Self> {
        let mut replicas: BTreeMap<ReplicaGuid, Vec<CounterRange>> = BTreeMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if pos + 2 > bytes.len() {
                return Err(ChangeSetError::Truncated { offset: pos });
            }
            let replid = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            let guid = map
                .guid_of(ReplicaId::new(replid))
                .ok_or(ChangeSetError::UnknownReplicaId(replid))?;
            let (ranges, next) = globset::decode(bytes, pos + 2)?;
            replicas.entry(guid).or_default().extend(ranges);
            pos = next;
        }
        Ok(Self::from_map(replicas))
    }

    fn from_map(replicas: BTreeMap<ReplicaGuid, Vec<CounterRange>>) -> Self {
        let replicas = replicas
            .into_iter()
            .map(|(guid, ranges)| (guid, coalesce(ranges)))
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();
        Self { replicas }
    }

    /// Serialize in the REPLGUID-based form. The empty set encodes to no bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (guid, ranges) in &self.replicas {
            out.extend_from_slice(&guid.to_bytes());
            globset::encode(ranges, &mut out);
        }
        out
    }

    /// Serialize in the REPLID-based form.
    pub fn serialize_replid(&self, map: &dyn ReplicaMap) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (guid, ranges) in &self.replicas {
            let replid = map
                .replid_of(guid)
                .ok_or(ChangeSetError::UnknownReplicaGuid(*guid))?;
            out.extend_from_slice(&replid.value().to_le_bytes());
            globset::encode(ranges, &mut out);
        }
        Ok(out)
    }

    /// Union of two sets.
    pub fn merge(&self, other: &ChangeSet) -> ChangeSet {
        let mut replicas = self.replicas.clone();
        for (guid, ranges) in &other.replicas {
            replicas.entry(*guid).or_default().extend_from_slice(ranges);
        }
        Self::from_map(replicas)
    }

    /// This set plus one counter.
    pub fn insert(&self, guid: ReplicaGuid, counter: GlobalCounter) -> ChangeSet {
        self.merge(&ChangeSet::single(guid, counter))
    }

    /// Counters in this set and not in `other`.
    pub fn subtract(&self, other: &ChangeSet) -> ChangeSet {
        let replicas = self
            .replicas
            .iter()
            .map(|(guid, ranges)| match other.replicas.get(guid) {
                Some(removed) => (*guid, subtract_ranges(ranges, removed)),
                None => (*guid, ranges.clone()),
            })
            .filter(|(_, ranges)| !ranges.is_empty())
            .collect();
        Self { replicas }
    }

    /// Membership test.
    pub fn contains(&self, guid: &ReplicaGuid, counter: GlobalCounter) -> bool {
        let value = counter.value();
        let Some(ranges) = self.replicas.get(guid) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.high < value);
        ranges.get(idx).is_some_and(|r| r.contains(value))
    }

    /// Largest counter recorded for a replica.
    pub fn max_counter(&self, guid: &ReplicaGuid) -> Option<GlobalCounter> {
        self.replicas
            .get(guid)
            .and_then(|ranges| ranges.last())
            .map(|r| GlobalCounter::new(r.high))
    }

    /// Reject a set that names counters of the local replica the server has
    /// not issued yet.
    pub fn validate_against_next_unissued(
        &self,
        local: &ReplicaGuid,
        next_unissued: GlobalCounter,
    ) -> Result<()> {
        match self.max_counter(local) {
            Some(max) if max >= next_unissued => Err(ChangeSetError::Regression {
                max: max.value(),
                next_unissued: next_unissued.value(),
            }),
            _ => Ok(()),
        }
    }

    /// Replicas with at least one counter.
    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaGuid> {
        self.replicas.keys()
    }

    /// Ranges recorded for a replica.
    pub fn ranges(&self, guid: &ReplicaGuid) -> &[CounterRange] {
        self.replicas.get(guid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the set holds no counters.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Total number of counters across all replicas.
    pub fn count(&self) -> u64 {
        self.replicas.values().flatten().map(CounterRange::len).sum()
    }

    /// Every (replica, counter) pair in ascending order.
    pub fn counters(&self) -> impl Iterator<Item = (ReplicaGuid, GlobalCounter)> + '_ {
        self.replicas.iter().flat_map(|(guid, ranges)| {
            ranges
                .iter()
                .flat_map(move |r| (r.low..=r.high).map(move |c| (*guid, GlobalCounter::new(c))))
        })
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (ix, (guid, ranges)) in self.replicas.iter().enumerate() {
            if ix > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{guid}:")?;
            for (jx, r) in ranges.iter().enumerate() {
                let delim = if jx == 0 { "" } else { "," };
                if r.low == r.high {
                    write!(f, "{delim}{:#x}", r.low)?;
                } else {
                    write!(f, "{delim}{:#x}-{:#x}", r.low, r.high)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ChangeSet {}]", self)
    }
}

/// Append-only builder for a [`ChangeSet`].
#[derive(Debug, Clone, Default)]
pub struct RawChangeSet {
    entries: Vec<(ReplicaGuid, u64)>,
}

impl RawChangeSet {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    pub fn push(&mut self, guid: ReplicaGuid, counter: GlobalCounter) {
        self.entries.push((guid, counter.value()));
    }

    /// Number of observations recorded (duplicates included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort once, coalesce and produce the immutable set.
    pub fn into_changeset(mut self) -> ChangeSet {
        self.entries.sort_unstable();
        self.entries.dedup();
        let mut replicas: BTreeMap<ReplicaGuid, Vec<CounterRange>> = BTreeMap::new();
        for (guid, value) in self.entries {
            let ranges = replicas.entry(guid).or_default();
            match ranges.last_mut() {
                Some(last) if value == last.high + 1 => last.high = value,
                _ => ranges.push(CounterRange::single(value)),
            }
        }
        ChangeSet { replicas }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn guid(n: u8) -> ReplicaGuid {
        ReplicaGuid::from_uuid(uuid::Uuid::from_bytes([n; 16]))
    }

    fn gc(v: u64) -> GlobalCounter {
        GlobalCounter::new(v)
    }

    fn r(low: u64, high: u64) -> CounterRange {
        CounterRange { low, high }
    }

    #[test]
    fn construction_coalesces_adjacent_and_overlapping_ranges() {
        let set = ChangeSet::from_ranges(guid(1), [r(5, 7), r(1, 2), r(3, 3), r(6, 10), r(20, 20)]);
        assert_eq!(set.ranges(&guid(1)), &[r(1, 10), r(20, 20)]);
    }

    #[test]
    fn empty_set_serializes_to_nothing() {
        assert!(ChangeSet::new().serialize().is_empty());
        assert_eq!(ChangeSet::parse(&[]).unwrap(), ChangeSet::new());
    }

    #[test]
    fn guid_form_round_trips() {
        let set = ChangeSet::from_ranges(guid(1), [r(1, 0x131), r(0x200, 0x200)])
            .merge(&ChangeSet::single(guid(2), gc(0x1234_5678_9abc)));
        let bytes = set.serialize();
        assert_eq!(ChangeSet::parse(&bytes).unwrap(), set);
    }

    #[test]
    fn duplicate_guid_blocks_are_merged() {
        let mut bytes = ChangeSet::single(guid(1), gc(3)).serialize();
        bytes.extend(ChangeSet::single(guid(1), gc(4)).serialize());
        let set = ChangeSet::parse(&bytes).unwrap();
        assert_eq!(set.ranges(&guid(1)), &[r(3, 4)]);
    }

    #[test]
    fn truncated_guid_is_rejected() {
        assert!(matches!(
            ChangeSet::parse(&[0u8; 10]),
            Err(ChangeSetError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn replid_form_resolves_through_map() {
        let mut map = BTreeMap::new();
        map.insert(ReplicaId::new(1), guid(9));
        let set = ChangeSet::from_ranges(guid(9), [r(1, 100)]);

        let bytes = set.serialize_replid(&map).unwrap();
        assert_eq!(&bytes[..2], &[1, 0]);
        assert_eq!(ChangeSet::parse_replid(&bytes, &map).unwrap(), set);

        let unknown = ChangeSet::single(guid(3), gc(1));
        assert_eq!(
            unknown.serialize_replid(&map),
            Err(ChangeSetError::UnknownReplicaGuid(guid(3)))
        );
    }

    #[test]
    fn unknown_replid_is_a_parse_error() {
        let map: BTreeMap<ReplicaId, ReplicaGuid> = BTreeMap::new();
        let bytes = [7, 0, 0x06, 0, 0, 0, 0, 0, 1, 0x00];
        assert_eq!(
            ChangeSet::parse_replid(&bytes, &map),
            Err(ChangeSetError::UnknownReplicaId(7))
        );
    }

    #[test]
    fn contains_uses_range_bounds() {
        let set = ChangeSet::from_ranges(guid(1), [r(10, 20), r(30, 30)]);
        assert!(set.contains(&guid(1), gc(10)));
        assert!(set.contains(&guid(1), gc(20)));
        assert!(set.contains(&guid(1), gc(30)));
        assert!(!set.contains(&guid(1), gc(21)));
        assert!(!set.contains(&guid(1), gc(9)));
        assert!(!set.contains(&guid(2), gc(10)));
    }

    #[test]
    fn subtract_splits_ranges() {
        let set = ChangeSet::from_ranges(guid(1), [r(1, 10), r(20, 25)]);
        let removed = ChangeSet::from_ranges(guid(1), [r(3, 4), r(10, 21), r(25, 25)]);
        let left = set.subtract(&removed);
        assert_eq!(left.ranges(&guid(1)), &[r(1, 2), r(5, 9), r(22, 24)]);
    }

    #[test]
    fn subtract_everything_drops_the_replica() {
        let set = ChangeSet::from_ranges(guid(1), [r(1, 10)]);
        assert!(set.subtract(&set).is_empty());
    }

    #[test]
    fn validation_rejects_unissued_counters() {
        let set = ChangeSet::from_ranges(guid(1), [r(1, 10)]);
        assert!(set.validate_against_next_unissued(&guid(1), gc(11)).is_ok());
        assert_eq!(
            set.validate_against_next_unissued(&guid(1), gc(10)),
            Err(ChangeSetError::Regression {
                max: 10,
                next_unissued: 10
            })
        );
        // foreign replicas are not checked
        assert!(set.validate_against_next_unissued(&guid(2), gc(1)).is_ok());
    }

    #[test]
    fn raw_builder_sorts_and_dedups() {
        let mut raw = RawChangeSet::new();
        for v in [5, 3, 4, 4, 9, 1] {
            raw.push(guid(1), gc(v));
        }
        raw.push(guid(2), gc(7));
        assert_eq!(raw.len(), 7);
        let set = raw.into_changeset();
        assert_eq!(set.ranges(&guid(1)), &[r(1, 1), r(3, 5), r(9, 9)]);
        assert_eq!(set.count(), 6);
        assert_eq!(set.counters().count(), 6);
    }

    #[test]
    fn display_lists_ranges() {
        let set = ChangeSet::from_ranges(guid(1), [r(1, 3), r(7, 7)]);
        assert!(set.to_string().ends_with(":0x1-0x3,0x7"));
    }

    fn arb_ranges() -> impl Strategy<Value = Vec<CounterRange>> {
        prop::collection::vec((0u64..5_000, 0u64..50), 0..20)
            .prop_map(|v| v.into_iter().map(|(low, len)| r(low, low + len)).collect())
    }

    fn arb_set() -> impl Strategy<Value = ChangeSet> {
        (arb_ranges(), arb_ranges()).prop_map(|(a, b)| {
            ChangeSet::from_ranges(guid(1), a).merge(&ChangeSet::from_ranges(guid(2), b))
        })
    }

    proptest! {
        #[test]
        fn serialize_then_parse_is_identity(set in arb_set()) {
            prop_assert_eq!(ChangeSet::parse(&set.serialize()).unwrap(), set);
        }

        #[test]
        fn ranges_stay_disjoint_and_non_adjacent(set in arb_set()) {
            for g in [guid(1), guid(2)] {
                for pair in set.ranges(&g).windows(2) {
                    prop_assert!(pair[0].high + 1 < pair[1].low);
                }
            }
        }

        #[test]
        fn merge_is_a_join(a in arb_set(), b in arb_set(), probe in 0u64..5_100) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
            prop_assert_eq!(a.merge(&a), a.clone());
            let merged = a.merge(&b);
            prop_assert_eq!(
                merged.contains(&guid(1), gc(probe)),
                a.contains(&guid(1), gc(probe)) || b.contains(&guid(1), gc(probe))
            );
        }

        #[test]
        fn subtract_removes_exactly(a in arb_set(), b in arb_set(), probe in 0u64..5_100) {
            let diff = a.subtract(&b);
            prop_assert_eq!(
                diff.contains(&guid(2), gc(probe)),
                a.contains(&guid(2), gc(probe)) && !b.contains(&guid(2), gc(probe))
            );
        }
    }
}
