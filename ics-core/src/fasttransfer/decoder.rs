//! FastTransfer stream decoder.

use ics_types::{
    meta, Marker, NameKind, NamedProperty, PropTag, PropType, PropValue, StateProperty,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while decoding a FastTransfer stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended inside an element.
    #[error("stream truncated at offset {offset}: need {needed} more bytes")]
    Truncated {
        /// Offset of the incomplete read.
        offset: usize,
        /// Bytes that were still required.
        needed: usize,
    },

    /// A property tag with a type code this decoder does not know.
    #[error("unknown property type 0x{code:04x} at offset {offset}")]
    UnknownPropType {
        /// Offset of the tag.
        offset: usize,
        /// Type code found.
        code: u16,
    },

    /// A named property with a kind byte other than LID or string.
    #[error("invalid named property kind {kind} at offset {offset}")]
    InvalidNameKind {
        /// Offset of the kind byte.
        offset: usize,
        /// Kind byte found.
        kind: u8,
    },

    /// A string that is not valid for its encoding.
    #[error("invalid string at offset {offset}")]
    InvalidString {
        /// Offset of the string payload.
        offset: usize,
    },
}

/// Result type for decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// One element of a FastTransfer stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Element {
    /// A structural marker.
    Marker(Marker),
    /// A property value.
    Property {
        /// Property tag.
        tag: PropTag,
        /// Name mapping for named tags.
        named: Option<NamedProperty>,
        /// Decoded value.
        value: PropValue,
    },
    /// A meta-property carrying a 32-bit value (MetaTagFXDelProp).
    Meta {
        /// Meta tag.
        tag: PropTag,
        /// The value, a property tag for FXDelProp.
        value: u32,
    },
    /// A state or idset meta-property with its raw payload.
    State {
        /// Meta tag.
        tag: PropTag,
        /// Length-prefixed payload.
        data: Vec<u8>,
    },
}

fn is_state_tag(tag: PropTag) -> bool {
    StateProperty::from_tag(tag).is_some()
        || tag == meta::IDSET_DELETED
        || tag == meta::IDSET_NO_LONGER_IN_SCOPE
        || tag == meta::IDSET_READ
        || tag == meta::IDSET_UNREAD
}

/// Incremental decoder over a complete stream.
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Decoder positioned at the start of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode the next element, `None` at end of input.
    pub fn next_element(&mut self) -> Result<Option<Element>> {
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let tag_offset = self.pos;
        let tag = PropTag::from_raw(self.u32()?);

        if let Some(marker) = Marker::from_tag(tag) {
            return Ok(Some(Element::Marker(marker)));
        }
        if tag == meta::FX_DEL_PROP {
            let value = self.u32()?;
            return Ok(Some(Element::Meta { tag, value }));
        }
        if is_state_tag(tag) {
            let data = self.sized_bytes()?.to_vec();
            return Ok(Some(Element::State { tag, data }));
        }

        let ptype = tag
            .prop_type()
            .map_err(|_| DecodeError::UnknownPropType {
                offset: tag_offset,
                code: tag.type_code(),
            })?;
        let named = if tag.is_named() {
            Some(self.named()?)
        } else {
            None
        };
        let value = self.value(ptype, tag_offset)?;
        Ok(Some(Element::Property { tag, named, value }))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).unwrap_or(usize::MAX);
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: end - self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn sized_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn guid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes_le(self.array()?))
    }

    fn utf16_until_nul(&mut self) -> Result<String> {
        let start = self.pos;
        let mut units = Vec::new();
        loop {
            let unit = u16::from_le_bytes(self.array()?);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units).map_err(|_| DecodeError::InvalidString { offset: start })
    }

    fn named(&mut self) -> Result<NamedProperty> {
        let guid = self.guid()?;
        let kind_offset = self.pos;
        let kind = match self.array::<1>()?[0] {
            0 => NameKind::Lid(self.u32()?),
            1 => NameKind::Name(self.utf16_until_nul()?),
            other => {
                return Err(DecodeError::InvalidNameKind {
                    offset: kind_offset,
                    kind: other,
                })
            }
        };
        Ok(NamedProperty { guid, kind })
    }

    fn string8(&mut self) -> Result<String> {
        let offset = self.pos;
        let raw = self.sized_bytes()?;
        let trimmed = raw.strip_suffix(&[0]).unwrap_or(raw);
        String::from_utf8(trimmed.to_vec()).map_err(|_| DecodeError::InvalidString { offset })
    }

    fn unicode(&mut self) -> Result<String> {
        let offset = self.pos;
        let raw = self.sized_bytes()?;
        if raw.len() % 2 != 0 {
            return Err(DecodeError::InvalidString { offset });
        }
        let mut units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        if units.last() == Some(&0) {
            units.pop();
        }
        String::from_utf16(&units).map_err(|_| DecodeError::InvalidString { offset })
    }

    fn count(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }

    fn repeat<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.count()?;
        // each element is at least one byte, so a count past the end is truncation
        if count > self.bytes.len() - self.pos {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: count - (self.bytes.len() - self.pos),
            });
        }
        (0..count).map(|_| f(self)).collect()
    }

    fn value(&mut self, ptype: PropType, tag_offset: usize) -> Result<PropValue> {
        use PropType::*;
        Ok(match ptype {
            Integer16 => PropValue::I16(i16::from_le_bytes(self.array()?)),
            Integer32 => PropValue::I32(i32::from_le_bytes(self.array()?)),
            Floating32 => PropValue::F32(f32::from_le_bytes(self.array()?)),
            Floating64 => PropValue::F64(f64::from_le_bytes(self.array()?)),
            Currency => PropValue::Currency(i64::from_le_bytes(self.array()?)),
            FloatingTime => PropValue::FloatingTime(f64::from_le_bytes(self.array()?)),
            ErrorCode => PropValue::ErrorCode(u32::from_le_bytes(self.array()?)),
            Boolean => PropValue::Bool(u16::from_le_bytes(self.array()?) != 0),
            Integer64 => PropValue::I64(i64::from_le_bytes(self.array()?)),
            String8 => PropValue::String8(self.string8()?),
            Unicode => PropValue::Unicode(self.unicode()?),
            Time => PropValue::Time(ics_types::FileTime(u64::from_le_bytes(self.array()?))),
            Guid => PropValue::Guid(self.guid()?),
            ServerId => PropValue::ServerId(self.sized_bytes()?.to_vec()),
            Binary => PropValue::Binary(self.sized_bytes()?.to_vec()),
            MultipleInteger16 => {
                PropValue::MvI16(self.repeat(|d| Ok(i16::from_le_bytes(d.array()?)))?)
            }
            MultipleInteger32 => {
                PropValue::MvI32(self.repeat(|d| Ok(i32::from_le_bytes(d.array()?)))?)
            }
            MultipleFloating32 => {
                PropValue::MvF32(self.repeat(|d| Ok(f32::from_le_bytes(d.array()?)))?)
            }
            MultipleFloating64 => {
                PropValue::MvF64(self.repeat(|d| Ok(f64::from_le_bytes(d.array()?)))?)
            }
            MultipleCurrency => {
                PropValue::MvCurrency(self.repeat(|d| Ok(i64::from_le_bytes(d.array()?)))?)
            }
            MultipleFloatingTime => {
                PropValue::MvFloatingTime(self.repeat(|d| Ok(f64::from_le_bytes(d.array()?)))?)
            }
            MultipleInteger64 => {
                PropValue::MvI64(self.repeat(|d| Ok(i64::from_le_bytes(d.array()?)))?)
            }
            MultipleString8 => PropValue::MvString8(self.repeat(|d| d.string8())?),
            MultipleUnicode => PropValue::MvUnicode(self.repeat(|d| d.unicode())?),
            MultipleTime => PropValue::MvTime(
                self.repeat(|d| Ok(ics_types::FileTime(u64::from_le_bytes(d.array()?))))?,
            ),
            MultipleGuid => PropValue::MvGuid(self.repeat(|d| d.guid())?),
            MultipleBinary => PropValue::MvBinary(self.repeat(|d| Ok(d.sized_bytes()?.to_vec()))?),
            Object => {
                return Err(DecodeError::UnknownPropType {
                    offset: tag_offset,
                    code: ptype.code(),
                })
            }
        })
    }
}

/// Decode a whole stream.
pub fn decode(bytes: &[u8]) -> Result<Vec<Element>> {
    let mut decoder = Decoder::new(bytes);
    let mut out = Vec::new();
    while let Some(element) = decoder.next_element()? {
        out.push(element);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fasttransfer::Encoder;
    use ics_types::{tags, FileTime};

    #[test]
    fn decodes_what_the_encoder_wrote() {
        let named = NamedProperty {
            guid: Uuid::from_bytes([2; 16]),
            kind: NameKind::Lid(0x8501),
        };
        let named_tag = PropTag::new(0x8003, PropType::Unicode);

        let mut enc = Encoder::new();
        enc.push_marker(Marker::IncrSyncChg);
        enc.push_property(tags::SOURCE_KEY, &PropValue::Binary(vec![1; 22]))
            .unwrap();
        enc.push_property(tags::LAST_MODIFICATION_TIME, &PropValue::Time(FileTime(42)))
            .unwrap();
        enc.push_property(tags::ASSOCIATED, &PropValue::Bool(false)).unwrap();
        enc.push_named_property(named_tag, &named, &PropValue::Unicode("Ünï".into()))
            .unwrap();
        enc.push_meta(meta::FX_DEL_PROP, tags::MESSAGE_ATTACHMENTS.value());
        enc.push_state(meta::IDSET_GIVEN, &[9, 9]).unwrap();
        enc.push_marker(Marker::IncrSyncEnd);

        let elements = decode(enc.buffer().bytes()).unwrap();
        assert_eq!(
            elements,
            vec![
                Element::Marker(Marker::IncrSyncChg),
                Element::Property {
                    tag: tags::SOURCE_KEY,
                    named: None,
                    value: PropValue::Binary(vec![1; 22]),
                },
                Element::Property {
                    tag: tags::LAST_MODIFICATION_TIME,
                    named: None,
                    value: PropValue::Time(FileTime(42)),
                },
                Element::Property {
                    tag: tags::ASSOCIATED,
                    named: None,
                    value: PropValue::Bool(false),
                },
                Element::Property {
                    tag: named_tag,
                    named: Some(named),
                    value: PropValue::Unicode("Ünï".into()),
                },
                Element::Meta {
                    tag: meta::FX_DEL_PROP,
                    value: tags::MESSAGE_ATTACHMENTS.value(),
                },
                Element::State {
                    tag: meta::IDSET_GIVEN,
                    data: vec![9, 9],
                },
                Element::Marker(Marker::IncrSyncEnd),
            ]
        );
    }

    #[test]
    fn multi_valued_strings_decode() {
        let tag = PropTag::new(0x6000, PropType::MultipleUnicode);
        let value = PropValue::MvUnicode(vec!["a".into(), "".into(), "bc".into()]);
        let mut enc = Encoder::new();
        enc.push_multivalue(tag, &value).unwrap();
        assert_eq!(
            decode(enc.buffer().bytes()).unwrap(),
            vec![Element::Property {
                tag,
                named: None,
                value
            }]
        );
    }

    #[test]
    fn truncated_value_is_an_error() {
        let mut enc = Encoder::new();
        enc.push_property(tags::CHANGE_NUMBER, &PropValue::I64(7)).unwrap();
        let bytes = enc.buffer().bytes();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated { offset: 4, .. })
        ));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let bytes = 0x1234_0099u32.to_le_bytes();
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::UnknownPropType {
                offset: 0,
                code: 0x0099
            })
        );
    }

    #[test]
    fn huge_multivalue_count_is_truncation() {
        let mut bytes = PropTag::new(0x6000, PropType::MultipleInteger32)
            .value()
            .to_le_bytes()
            .to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
