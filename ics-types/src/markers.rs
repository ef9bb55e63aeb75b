//! FastTransfer markers and meta-properties.
//!
//! Markers are bare property tags with no value that delimit structure in
//! a FastTransfer stream. Meta-properties carry sync state and deletions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::PropTag;

/// FastTransfer stream markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Marker {
    /// StartTopFld
    StartTopFld = 0x4009_0003,
    /// StartSubFld
    StartSubFld = 0x400A_0003,
    /// EndFolder
    EndFolder = 0x400B_0003,
    /// StartMessage
    StartMessage = 0x400C_0003,
    /// EndMessage
    EndMessage = 0x400D_0003,
    /// StartFAIMsg
    StartFaiMsg = 0x4010_0003,
    /// StartEmbed
    StartEmbed = 0x4001_0003,
    /// EndEmbed
    EndEmbed = 0x4002_0003,
    /// StartRecip
    StartRecip = 0x4003_0003,
    /// EndToRecip
    EndToRecip = 0x4004_0003,
    /// NewAttach
    NewAttach = 0x4000_0003,
    /// EndAttach
    EndAttach = 0x400E_0003,
    /// IncrSyncChg
    IncrSyncChg = 0x4012_0003,
    /// IncrSyncChgPartial
    IncrSyncChgPartial = 0x407D_0003,
    /// IncrSyncDel
    IncrSyncDel = 0x4013_0003,
    /// IncrSyncEnd
    IncrSyncEnd = 0x4014_0003,
    /// IncrSyncRead
    IncrSyncRead = 0x402F_0003,
    /// IncrSyncStateBegin
    IncrSyncStateBegin = 0x403A_0003,
    /// IncrSyncStateEnd
    IncrSyncStateEnd = 0x403B_0003,
    /// IncrSyncProgressMode
    IncrSyncProgressMode = 0x4074_000B,
    /// IncrSyncProgressPerMsg
    IncrSyncProgressPerMsg = 0x4075_000B,
    /// IncrSyncMessage
    IncrSyncMessage = 0x4015_0003,
    /// IncrSyncGroupInfo
    IncrSyncGroupInfo = 0x407B_0102,
    /// FXErrorInfo
    FxErrorInfo = 0x4018_0003,
}

impl Marker {
    const ALL: [Marker; 24] = [
        Marker::StartTopFld,
        Marker::StartSubFld,
        Marker::EndFolder,
        Marker::StartMessage,
        Marker::EndMessage,
        Marker::StartFaiMsg,
        Marker::StartEmbed,
        Marker::EndEmbed,
        Marker::StartRecip,
        Marker::EndToRecip,
        Marker::NewAttach,
        Marker::EndAttach,
        Marker::IncrSyncChg,
        Marker::IncrSyncChgPartial,
        Marker::IncrSyncDel,
        Marker::IncrSyncEnd,
        Marker::IncrSyncRead,
        Marker::IncrSyncStateBegin,
        Marker::IncrSyncStateEnd,
        Marker::IncrSyncProgressMode,
        Marker::IncrSyncProgressPerMsg,
        Marker::IncrSyncMessage,
        Marker::IncrSyncGroupInfo,
        Marker::FxErrorInfo,
    ];

    /// The marker as a property tag.
    pub fn tag(self) -> PropTag {
        PropTag::from_raw(self as u32)
    }

    /// Look up the marker with this tag.
    pub fn from_tag(tag: PropTag) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.tag() == tag)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Meta-property tags.
pub mod meta {
    use crate::PropTag;

    /// MetaTagFXDelProp: followed by the tag of a subobject property to clear.
    pub const FX_DEL_PROP: PropTag = PropTag::from_raw(0x4016_0003);
    /// MetaTagIdsetGiven: PtypInteger32 tag, binary payload.
    pub const IDSET_GIVEN: PropTag = PropTag::from_raw(0x4017_0003);
    /// MetaTagIdsetGiven with the binary type some clients upload with.
    pub const IDSET_GIVEN_BINARY: PropTag = PropTag::from_raw(0x4017_0102);
    /// MetaTagCnsetSeen
    pub const CNSET_SEEN: PropTag = PropTag::from_raw(0x6796_0102);
    /// MetaTagCnsetSeenFAI
    pub const CNSET_SEEN_FAI: PropTag = PropTag::from_raw(0x67DA_0102);
    /// MetaTagCnsetRead
    pub const CNSET_READ: PropTag = PropTag::from_raw(0x67D2_0102);
    /// MetaTagIdsetDeleted
    pub const IDSET_DELETED: PropTag = PropTag::from_raw(0x67E5_0102);
    /// MetaTagIdsetNoLongerInScope
    pub const IDSET_NO_LONGER_IN_SCOPE: PropTag = PropTag::from_raw(0x4021_0102);
    /// MetaTagIdsetRead
    pub const IDSET_READ: PropTag = PropTag::from_raw(0x402D_0102);
    /// MetaTagIdsetUnread
    pub const IDSET_UNREAD: PropTag = PropTag::from_raw(0x402E_0102);

    /// Whether a tag carries a length-prefixed binary payload despite its type.
    pub fn is_state_with_binary_payload(tag: PropTag) -> bool {
        tag == IDSET_GIVEN
    }
}

/// The four state slots of a synchronization context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateProperty {
    /// IDs the client has been given.
    IdsetGiven,
    /// CNs of normal messages (or folders) the client has seen.
    CnsetSeen,
    /// CNs of FAI messages the client has seen.
    CnsetSeenFai,
    /// CNs of read-state changes the client has seen.
    CnsetRead,
}

impl StateProperty {
    /// Tag used when emitting this slot.
    pub fn tag(self) -> PropTag {
        match self {
            StateProperty::IdsetGiven => meta::IDSET_GIVEN,
            StateProperty::CnsetSeen => meta::CNSET_SEEN,
            StateProperty::CnsetSeenFai => meta::CNSET_SEEN_FAI,
            StateProperty::CnsetRead => meta::CNSET_READ,
        }
    }

    /// Map an uploaded state tag to its slot.
    pub fn from_tag(tag: PropTag) -> Option<Self> {
        match tag {
            t if t == meta::IDSET_GIVEN || t == meta::IDSET_GIVEN_BINARY => {
                Some(StateProperty::IdsetGiven)
            }
            t if t == meta::CNSET_SEEN => Some(StateProperty::CnsetSeen),
            t if t == meta::CNSET_SEEN_FAI => Some(StateProperty::CnsetSeenFai),
            t if t == meta::CNSET_READ => Some(StateProperty::CnsetRead),
            _ => None,
        }
    }

    /// Whether the slot holds change numbers (as opposed to object ids).
    pub fn is_cnset(self) -> bool {
        !matches!(self, StateProperty::IdsetGiven)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_lookup_by_tag() {
        assert_eq!(
            Marker::from_tag(PropTag::from_raw(0x4012_0003)),
            Some(Marker::IncrSyncChg)
        );
        assert_eq!(Marker::IncrSyncEnd.tag().value(), 0x4014_0003);
        assert_eq!(Marker::from_tag(PropTag::from_raw(0x0037_001F)), None);
    }

    #[test]
    fn every_marker_round_trips_through_its_tag() {
        for marker in Marker::ALL {
            assert_eq!(Marker::from_tag(marker.tag()), Some(marker));
        }
    }

    #[test]
    fn state_tags_map_to_slots() {
        assert_eq!(
            StateProperty::from_tag(meta::IDSET_GIVEN_BINARY),
            Some(StateProperty::IdsetGiven)
        );
        assert_eq!(
            StateProperty::from_tag(meta::CNSET_SEEN_FAI),
            Some(StateProperty::CnsetSeenFai)
        );
        assert_eq!(StateProperty::from_tag(meta::IDSET_DELETED), None);
        assert!(StateProperty::CnsetRead.is_cnset());
        assert!(!StateProperty::IdsetGiven.is_cnset());
    }

    #[test]
    fn state_property_serializes_by_name() {
        let json = serde_json::to_string(&StateProperty::CnsetSeenFai).unwrap();
        assert_eq!(json, "\"CnsetSeenFai\"");
    }
}
