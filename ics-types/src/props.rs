//! Property tags, types and values.
//!
//! A property tag is a 32-bit value: the high 16 bits are the property id,
//! the low 16 bits the property type. Ids at or above `0x8000` are named
//! properties whose meaning comes from a [`NamedProperty`] mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::WireError;

/// Property type codes (PtypXxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PropType {
    /// PtypInteger16
    Integer16 = 0x0002,
    /// PtypInteger32
    Integer32 = 0x0003,
    /// PtypFloating32
    Floating32 = 0x0004,
    /// PtypFloating64
    Floating64 = 0x0005,
    /// PtypCurrency
    Currency = 0x0006,
    /// PtypFloatingTime
    FloatingTime = 0x0007,
    /// PtypErrorCode
    ErrorCode = 0x000A,
    /// PtypBoolean
    Boolean = 0x000B,
    /// PtypObject (recipients, attachments, subtables)
    Object = 0x000D,
    /// PtypInteger64
    Integer64 = 0x0014,
    /// PtypString8
    String8 = 0x001E,
    /// PtypString (UTF-16LE on the wire)
    Unicode = 0x001F,
    /// PtypTime (FILETIME)
    Time = 0x0040,
    /// PtypGuid
    Guid = 0x0048,
    /// PtypServerId
    ServerId = 0x00FB,
    /// PtypBinary
    Binary = 0x0102,
    /// PtypMultipleInteger16
    MultipleInteger16 = 0x1002,
    /// PtypMultipleInteger32
    MultipleInteger32 = 0x1003,
    /// PtypMultipleFloating32
    MultipleFloating32 = 0x1004,
    /// PtypMultipleFloating64
    MultipleFloating64 = 0x1005,
    /// PtypMultipleCurrency
    MultipleCurrency = 0x1006,
    /// PtypMultipleFloatingTime
    MultipleFloatingTime = 0x1007,
    /// PtypMultipleInteger64
    MultipleInteger64 = 0x1014,
    /// PtypMultipleString8
    MultipleString8 = 0x101E,
    /// PtypMultipleString
    MultipleUnicode = 0x101F,
    /// PtypMultipleTime
    MultipleTime = 0x1040,
    /// PtypMultipleGuid
    MultipleGuid = 0x1048,
    /// PtypMultipleBinary
    MultipleBinary = 0x1102,
}

impl PropType {
    /// Multi-valued flag in the type code.
    pub const MV_FLAG: u16 = 0x1000;

    /// Decode a type code.
    pub fn from_u16(code: u16) -> Result<Self, WireError> {
        use PropType::*;
        Ok(match code {
            0x0002 => Integer16,
            0x0003 => Integer32,
            0x0004 => Floating32,
            0x0005 => Floating64,
            0x0006 => Currency,
            0x0007 => FloatingTime,
            0x000A => ErrorCode,
            0x000B => Boolean,
            0x000D => Object,
            0x0014 => Integer64,
            0x001E => String8,
            0x001F => Unicode,
            0x0040 => Time,
            0x0048 => Guid,
            0x00FB => ServerId,
            0x0102 => Binary,
            0x1002 => MultipleInteger16,
            0x1003 => MultipleInteger32,
            0x1004 => MultipleFloating32,
            0x1005 => MultipleFloating64,
            0x1006 => MultipleCurrency,
            0x1007 => MultipleFloatingTime,
            0x1014 => MultipleInteger64,
            0x101E => MultipleString8,
            0x101F => MultipleUnicode,
            0x1040 => MultipleTime,
            0x1048 => MultipleGuid,
            0x1102 => MultipleBinary,
            other => return Err(WireError::UnknownPropType(other)),
        })
    }

    /// Type code as carried in a tag.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this is a multi-valued type.
    pub fn is_multi(self) -> bool {
        self.code() & Self::MV_FLAG != 0
    }

    /// Element type of a multi-valued type (identity for single values).
    pub fn element(self) -> PropType {
        if self.is_multi() {
            // every multi-valued code has a single-valued counterpart
            Self::from_u16(self.code() & !Self::MV_FLAG).unwrap_or(self)
        } else {
            self
        }
    }

    /// On-wire width of a fixed-size value, `None` for length-prefixed types.
    pub fn fixed_width(self) -> Option<usize> {
        use PropType::*;
        match self {
            Integer16 | Boolean => Some(2),
            Integer32 | Floating32 | ErrorCode => Some(4),
            Floating64 | Currency | FloatingTime | Integer64 | Time => Some(8),
            Guid => Some(16),
            _ => None,
        }
    }
}

/// A 32-bit property tag: `(id << 16) | type`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropTag(u32);

impl PropTag {
    /// First id of the named property range.
    pub const NAMED_ID_MIN: u16 = 0x8000;

    /// Reinterpret a raw tag value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build a tag from an id and type.
    pub const fn new(id: u16, ptype: PropType) -> Self {
        Self(((id as u32) << 16) | ptype as u32)
    }

    /// Raw tag value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Property id (high 16 bits).
    pub fn id(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Raw type code (low 16 bits).
    pub fn type_code(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Decoded property type.
    pub fn prop_type(&self) -> Result<PropType, WireError> {
        PropType::from_u16(self.type_code())
    }

    /// Whether the id falls in the named property range.
    pub fn is_named(&self) -> bool {
        self.id() >= Self::NAMED_ID_MIN
    }

    /// Same id with a different type.
    pub fn with_type(&self, ptype: PropType) -> Self {
        Self::new(self.id(), ptype)
    }
}

impl fmt::Display for PropTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match tags::name_of(*self) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl fmt::Debug for PropTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropTag(0x{:08X})", self.0)
    }
}

/// A Windows FILETIME: 100ns intervals since 1601-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileTime(pub u64);

impl FileTime {
    /// The Unix epoch expressed as a FILETIME.
    ///
    /// Used as the last-modification time of objects that never recorded one.
    pub const UNIX_EPOCH: FileTime = FileTime(116_444_736_000_000_000);

    /// Convert a Unix timestamp in seconds.
    pub fn from_unix_secs(secs: u64) -> Self {
        Self(Self::UNIX_EPOCH.0 + secs * 10_000_000)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(Self::UNIX_EPOCH.0 + (since.as_nanos() / 100) as u64)
    }
}

/// How a named property is identified inside its property set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameKind {
    /// Numeric long id (MNID_ID).
    Lid(u32),
    /// String name (MNID_STRING).
    Name(String),
}

impl NameKind {
    /// Kind byte on the wire.
    pub fn code(&self) -> u8 {
        match self {
            NameKind::Lid(_) => 0,
            NameKind::Name(_) => 1,
        }
    }
}

/// The identity behind a named property id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedProperty {
    /// Property set GUID.
    pub guid: Uuid,
    /// Long id or string name.
    pub kind: NameKind,
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    /// PtypInteger16
    I16(i16),
    /// PtypInteger32
    I32(i32),
    /// PtypFloating32
    F32(f32),
    /// PtypFloating64
    F64(f64),
    /// PtypCurrency
    Currency(i64),
    /// PtypFloatingTime
    FloatingTime(f64),
    /// PtypErrorCode
    ErrorCode(u32),
    /// PtypBoolean
    Bool(bool),
    /// PtypInteger64
    I64(i64),
    /// PtypString8
    String8(String),
    /// PtypString
    Unicode(String),
    /// PtypTime
    Time(FileTime),
    /// PtypGuid
    Guid(Uuid),
    /// PtypServerId
    ServerId(Vec<u8>),
    /// PtypBinary
    Binary(Vec<u8>),
    /// PtypMultipleInteger16
    MvI16(Vec<i16>),
    /// PtypMultipleInteger32
    MvI32(Vec<i32>),
    /// PtypMultipleFloating32
    MvF32(Vec<f32>),
    /// PtypMultipleFloating64
    MvF64(Vec<f64>),
    /// PtypMultipleCurrency
    MvCurrency(Vec<i64>),
    /// PtypMultipleFloatingTime
    MvFloatingTime(Vec<f64>),
    /// PtypMultipleInteger64
    MvI64(Vec<i64>),
    /// PtypMultipleString8
    MvString8(Vec<String>),
    /// PtypMultipleString
    MvUnicode(Vec<String>),
    /// PtypMultipleTime
    MvTime(Vec<FileTime>),
    /// PtypMultipleGuid
    MvGuid(Vec<Uuid>),
    /// PtypMultipleBinary
    MvBinary(Vec<Vec<u8>>),
}

impl PropValue {
    /// The property type this value encodes as.
    pub fn prop_type(&self) -> PropType {
        use PropValue::*;
        match self {
            I16(_) => PropType::Integer16,
            I32(_) => PropType::Integer32,
            F32(_) => PropType::Floating32,
            F64(_) => PropType::Floating64,
            Currency(_) => PropType::Currency,
            FloatingTime(_) => PropType::FloatingTime,
            ErrorCode(_) => PropType::ErrorCode,
            Bool(_) => PropType::Boolean,
            I64(_) => PropType::Integer64,
            String8(_) => PropType::String8,
            Unicode(_) => PropType::Unicode,
            Time(_) => PropType::Time,
            Guid(_) => PropType::Guid,
            ServerId(_) => PropType::ServerId,
            Binary(_) => PropType::Binary,
            MvI16(_) => PropType::MultipleInteger16,
            MvI32(_) => PropType::MultipleInteger32,
            MvF32(_) => PropType::MultipleFloating32,
            MvF64(_) => PropType::MultipleFloating64,
            MvCurrency(_) => PropType::MultipleCurrency,
            MvFloatingTime(_) => PropType::MultipleFloatingTime,
            MvI64(_) => PropType::MultipleInteger64,
            MvString8(_) => PropType::MultipleString8,
            MvUnicode(_) => PropType::MultipleUnicode,
            MvTime(_) => PropType::MultipleTime,
            MvGuid(_) => PropType::MultipleGuid,
            MvBinary(_) => PropType::MultipleBinary,
        }
    }

    /// Binary payload, if this is a binary value.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            PropValue::Binary(b) | PropValue::ServerId(b) => Some(b),
            _ => None,
        }
    }

    /// String payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Unicode(s) | PropValue::String8(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload widened to i64, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::I16(v) => Some(i64::from(*v)),
            PropValue::I32(v) => Some(i64::from(*v)),
            PropValue::I64(v) | PropValue::Currency(v) => Some(*v),
            PropValue::ErrorCode(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A tag/value pair as found in property rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    /// Property tag.
    pub tag: PropTag,
    /// Value, whose type matches the tag's type.
    pub value: PropValue,
}

impl TaggedValue {
    /// Pair a tag with a value.
    pub fn new(tag: PropTag, value: PropValue) -> Self {
        Self { tag, value }
    }
}

/// Well-known property tags used by the sync engine.
pub mod tags {
    use super::{PropTag, PropType};

    /// PidTagMessageClass
    pub const MESSAGE_CLASS: PropTag = PropTag::new(0x001A, PropType::Unicode);
    /// PidTagSubject
    pub const SUBJECT: PropTag = PropTag::new(0x0037, PropType::Unicode);
    /// PidTagRecipientType
    pub const RECIPIENT_TYPE: PropTag = PropTag::new(0x0C15, PropType::Integer32);
    /// PidTagMessageDeliveryTime
    pub const MESSAGE_DELIVERY_TIME: PropTag = PropTag::new(0x0E06, PropType::Time);
    /// PidTagMessageFlags
    pub const MESSAGE_FLAGS: PropTag = PropTag::new(0x0E07, PropType::Integer32);
    /// PidTagMessageSize
    pub const MESSAGE_SIZE: PropTag = PropTag::new(0x0E08, PropType::Integer32);
    /// PidTagMessageRecipients
    pub const MESSAGE_RECIPIENTS: PropTag = PropTag::new(0x0E12, PropType::Object);
    /// PidTagMessageAttachments
    pub const MESSAGE_ATTACHMENTS: PropTag = PropTag::new(0x0E13, PropType::Object);
    /// PidTagAttachNumber
    pub const ATTACH_NUMBER: PropTag = PropTag::new(0x0E21, PropType::Integer32);
    /// PidTagBody
    pub const BODY: PropTag = PropTag::new(0x1000, PropType::Unicode);
    /// PidTagRowid
    pub const ROW_ID: PropTag = PropTag::new(0x3000, PropType::Integer32);
    /// PidTagDisplayName
    pub const DISPLAY_NAME: PropTag = PropTag::new(0x3001, PropType::Unicode);
    /// PidTagEmailAddress
    pub const EMAIL_ADDRESS: PropTag = PropTag::new(0x3003, PropType::Unicode);
    /// PidTagCreationTime
    pub const CREATION_TIME: PropTag = PropTag::new(0x3007, PropType::Time);
    /// PidTagLastModificationTime
    pub const LAST_MODIFICATION_TIME: PropTag = PropTag::new(0x3008, PropType::Time);
    /// PidTagSubfolders
    pub const SUBFOLDERS: PropTag = PropTag::new(0x360A, PropType::Boolean);
    /// PidTagContainerHierarchy
    pub const CONTAINER_HIERARCHY: PropTag = PropTag::new(0x360E, PropType::Object);
    /// PidTagContainerContents
    pub const CONTAINER_CONTENTS: PropTag = PropTag::new(0x360F, PropType::Object);
    /// PidTagFolderAssociatedContents
    pub const FOLDER_ASSOCIATED_CONTENTS: PropTag = PropTag::new(0x3610, PropType::Object);
    /// PidTagContainerClass
    pub const CONTAINER_CLASS: PropTag = PropTag::new(0x3613, PropType::Unicode);
    /// PidTagAttachDataBinary
    pub const ATTACH_DATA_BINARY: PropTag = PropTag::new(0x3701, PropType::Binary);
    /// PidTagAttachMethod
    pub const ATTACH_METHOD: PropTag = PropTag::new(0x3705, PropType::Integer32);
    /// PidTagSourceKey
    pub const SOURCE_KEY: PropTag = PropTag::new(0x65E0, PropType::Binary);
    /// PidTagParentSourceKey
    pub const PARENT_SOURCE_KEY: PropTag = PropTag::new(0x65E1, PropType::Binary);
    /// PidTagChangeKey
    pub const CHANGE_KEY: PropTag = PropTag::new(0x65E2, PropType::Binary);
    /// PidTagPredecessorChangeList
    pub const PREDECESSOR_CHANGE_LIST: PropTag = PropTag::new(0x65E3, PropType::Binary);
    /// PidTagFolderId
    pub const FOLDER_ID: PropTag = PropTag::new(0x6748, PropType::Integer64);
    /// PidTagParentFolderId
    pub const PARENT_FOLDER_ID: PropTag = PropTag::new(0x6749, PropType::Integer64);
    /// PidTagMid
    pub const MID: PropTag = PropTag::new(0x674A, PropType::Integer64);
    /// PidTagChangeNumber
    pub const CHANGE_NUMBER: PropTag = PropTag::new(0x67A4, PropType::Integer64);
    /// PidTagAssociated
    pub const ASSOCIATED: PropTag = PropTag::new(0x67AA, PropType::Boolean);

    /// MSGFLAG_READ bit of PidTagMessageFlags.
    pub const MSGFLAG_READ: i32 = 0x0000_0001;

    const NAMES: &[(PropTag, &str)] = &[
        (MESSAGE_CLASS, "PidTagMessageClass"),
        (SUBJECT, "PidTagSubject"),
        (RECIPIENT_TYPE, "PidTagRecipientType"),
        (MESSAGE_DELIVERY_TIME, "PidTagMessageDeliveryTime"),
        (MESSAGE_FLAGS, "PidTagMessageFlags"),
        (MESSAGE_SIZE, "PidTagMessageSize"),
        (MESSAGE_RECIPIENTS, "PidTagMessageRecipients"),
        (MESSAGE_ATTACHMENTS, "PidTagMessageAttachments"),
        (ATTACH_NUMBER, "PidTagAttachNumber"),
        (BODY, "PidTagBody"),
        (ROW_ID, "PidTagRowid"),
        (DISPLAY_NAME, "PidTagDisplayName"),
        (EMAIL_ADDRESS, "PidTagEmailAddress"),
        (CREATION_TIME, "PidTagCreationTime"),
        (LAST_MODIFICATION_TIME, "PidTagLastModificationTime"),
        (SUBFOLDERS, "PidTagSubfolders"),
        (CONTAINER_HIERARCHY, "PidTagContainerHierarchy"),
        (CONTAINER_CONTENTS, "PidTagContainerContents"),
        (FOLDER_ASSOCIATED_CONTENTS, "PidTagFolderAssociatedContents"),
        (CONTAINER_CLASS, "PidTagContainerClass"),
        (ATTACH_DATA_BINARY, "PidTagAttachDataBinary"),
        (ATTACH_METHOD, "PidTagAttachMethod"),
        (SOURCE_KEY, "PidTagSourceKey"),
        (PARENT_SOURCE_KEY, "PidTagParentSourceKey"),
        (CHANGE_KEY, "PidTagChangeKey"),
        (PREDECESSOR_CHANGE_LIST, "PidTagPredecessorChangeList"),
        (FOLDER_ID, "PidTagFolderId"),
        (PARENT_FOLDER_ID, "PidTagParentFolderId"),
        (MID, "PidTagMid"),
        (CHANGE_NUMBER, "PidTagChangeNumber"),
        (ASSOCIATED, "PidTagAssociated"),
    ];

    /// Symbolic name of a well-known tag.
    pub fn name_of(tag: PropTag) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(known, _)| *known == tag)
            .map(|(_, name)| *name)
    }
}
