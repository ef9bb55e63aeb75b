//! FastTransfer stream encoder.
//!
//! Every push appends one atomic unit to the [`TransferBuffer`] and records a
//! cut mark at its end, so the chunker knows where the stream may be split.

use ics_types::{Marker, NameKind, NamedProperty, PropTag, PropType, PropValue};
use thiserror::Error;

use crate::chunk::TransferBuffer;

/// Errors raised while encoding a FastTransfer stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The value's type does not match the tag's type.
    #[error("value of type {actual:?} does not match tag {tag:?}")]
    TypeMismatch {
        /// Tag being written.
        tag: PropTag,
        /// Type of the supplied value.
        actual: PropType,
    },

    /// The tag's type code is not a known property type.
    #[error("tag {0:?} has an unknown property type")]
    UnknownType(PropTag),

    /// A named tag was pushed without its name mapping.
    #[error("named tag {0:?} pushed without a name")]
    MissingName(PropTag),

    /// A single-valued value was pushed as multi-valued.
    #[error("tag {0:?} is not multi-valued")]
    NotMultiValued(PropTag),

    /// A payload too large for a 32-bit length prefix.
    #[error("payload of {0} bytes exceeds the 32-bit length prefix")]
    TooLarge(usize),
}

/// Result type for encoding.
pub type Result<T> = std::result::Result<T, EncodeError>;

/// Bytes of payload that must travel together with a variable-size header.
const PROTECTED_PAYLOAD: usize = 8;

/// Writes FastTransfer elements into a [`TransferBuffer`].
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: TransferBuffer,
}

impl Encoder {
    /// Encoder over an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer written so far.
    pub fn buffer(&self) -> &TransferBuffer {
        &self.buffer
    }

    /// Consume the encoder, returning its buffer.
    pub fn into_buffer(self) -> TransferBuffer {
        self.buffer
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Write a structural marker.
    pub fn push_marker(&mut self, marker: Marker) {
        let unit = marker.tag().value().to_le_bytes();
        self.buffer.append_unit(&unit, 0);
    }

    /// Write a property whose id is not in the named range.
    pub fn push_property(&mut self, tag: PropTag, value: &PropValue) -> Result<()> {
        if tag.is_named() {
            return Err(EncodeError::MissingName(tag));
        }
        self.push_value(tag, None, value)
    }

    /// Write a named property with its name mapping.
    pub fn push_named_property(
        &mut self,
        tag: PropTag,
        named: &NamedProperty,
        value: &PropValue,
    ) -> Result<()> {
        self.push_value(tag, Some(named), value)
    }

    /// Write a multi-valued property.
    pub fn push_multivalue(&mut self, tag: PropTag, values: &PropValue) -> Result<()> {
        if !values.prop_type().is_multi() {
            return Err(EncodeError::NotMultiValued(tag));
        }
        self.push_property(tag, values)
    }

    /// Write a meta-property followed by a 32-bit value (MetaTagFXDelProp).
    pub fn push_meta(&mut self, tag: PropTag, value: u32) {
        let mut unit = Vec::with_capacity(8);
        unit.extend_from_slice(&tag.value().to_le_bytes());
        unit.extend_from_slice(&value.to_le_bytes());
        self.buffer.append_unit(&unit, 0);
    }

    /// Write a state or idset meta-property: tag, then length-prefixed bytes,
    /// whatever type the tag declares.
    pub fn push_state(&mut self, tag: PropTag, data: &[u8]) -> Result<()> {
        let mut unit = Vec::with_capacity(8 + data.len());
        unit.extend_from_slice(&tag.value().to_le_bytes());
        write_len(&mut unit, data.len())?;
        unit.extend_from_slice(data);
        let granularity = (8 + PROTECTED_PAYLOAD).min(unit.len());
        self.buffer.append_unit(&unit, granularity);
        Ok(())
    }

    fn push_value(
        &mut self,
        tag: PropTag,
        named: Option<&NamedProperty>,
        value: &PropValue,
    ) -> Result<()> {
        let declared = tag.prop_type().map_err(|_| EncodeError::UnknownType(tag))?;
        let actual = value.prop_type();
        if declared != actual {
            return Err(EncodeError::TypeMismatch { tag, actual });
        }

        let mut unit = Vec::new();
        unit.extend_from_slice(&tag.value().to_le_bytes());
        if let Some(named) = named {
            write_name(&mut unit, named);
        }
        let header = unit.len();
        write_value(&mut unit, value)?;

        let granularity = if declared.fixed_width().is_some() {
            0
        } else {
            (header + 4 + PROTECTED_PAYLOAD).min(unit.len())
        };
        self.buffer.append_unit(&unit, granularity);
        Ok(())
    }
}

fn write_name(out: &mut Vec<u8>, named: &NamedProperty) {
    out.extend_from_slice(&named.guid.to_bytes_le());
    out.push(named.kind.code());
    match &named.kind {
        NameKind::Lid(lid) => out.extend_from_slice(&lid.to_le_bytes()),
        NameKind::Name(name) => {
            for unit in name.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            out.extend_from_slice(&[0, 0]);
        }
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len32 = u32::try_from(len).map_err(|_| EncodeError::TooLarge(len))?;
    out.extend_from_slice(&len32.to_le_bytes());
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    write_len(out, data.len())?;
    out.extend_from_slice(data);
    Ok(())
}

fn write_string8(out: &mut Vec<u8>, s: &str) -> Result<()> {
    write_len(out, s.len() + 1)?;
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

fn write_unicode(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    write_len(out, (units.len() + 1) * 2)?;
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    Ok(())
}

fn write_count(out: &mut Vec<u8>, count: usize) -> Result<()> {
    write_len(out, count)
}

/// Append the wire form of a value (without its tag).
pub(crate) fn write_value(out: &mut Vec<u8>, value: &PropValue) -> Result<()> {
    match value {
        PropValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::F64(v) | PropValue::FloatingTime(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::Currency(v) | PropValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::ErrorCode(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::Bool(v) => out.extend_from_slice(&u16::from(*v).to_le_bytes()),
        PropValue::Time(t) => out.extend_from_slice(&t.0.to_le_bytes()),
        PropValue::Guid(g) => out.extend_from_slice(&g.to_bytes_le()),
        PropValue::String8(s) => write_string8(out, s)?,
        PropValue::Unicode(s) => write_unicode(out, s)?,
        PropValue::ServerId(b) | PropValue::Binary(b) => write_bytes(out, b)?,
        PropValue::MvI16(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        PropValue::MvI32(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        PropValue::MvF32(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        PropValue::MvF64(vs) | PropValue::MvFloatingTime(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        PropValue::MvCurrency(vs) | PropValue::MvI64(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes()));
        }
        PropValue::MvTime(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|t| out.extend_from_slice(&t.0.to_le_bytes()));
        }
        PropValue::MvGuid(vs) => {
            write_count(out, vs.len())?;
            vs.iter().for_each(|g| out.extend_from_slice(&g.to_bytes_le()));
        }
        PropValue::MvString8(vs) => {
            write_count(out, vs.len())?;
            for s in vs {
                write_string8(out, s)?;
            }
        }
        PropValue::MvUnicode(vs) => {
            write_count(out, vs.len())?;
            for s in vs {
                write_unicode(out, s)?;
            }
        }
        PropValue::MvBinary(vs) => {
            write_count(out, vs.len())?;
            for b in vs {
                write_bytes(out, b)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CutMark;
    use ics_types::{meta, tags, FileTime};
    use uuid::Uuid;

    #[test]
    fn marker_is_four_indivisible_bytes() {
        let mut enc = Encoder::new();
        enc.push_marker(Marker::IncrSyncChg);
        assert_eq!(enc.buffer().bytes(), &[0x03, 0x00, 0x12, 0x40]);
        assert_eq!(
            enc.buffer().last_mark(),
            Some(CutMark {
                offset: 4,
                min_granularity: 0
            })
        );
    }

    #[test]
    fn boolean_takes_two_bytes() {
        let mut enc = Encoder::new();
        enc.push_property(tags::ASSOCIATED, &PropValue::Bool(true)).unwrap();
        assert_eq!(enc.buffer().bytes(), &[0x0B, 0x00, 0xAA, 0x67, 0x01, 0x00]);
    }

    #[test]
    fn unicode_includes_terminator_in_length() {
        let mut enc = Encoder::new();
        enc.push_property(tags::DISPLAY_NAME, &PropValue::Unicode("Hi".into()))
            .unwrap();
        let bytes = enc.buffer().bytes();
        assert_eq!(&bytes[4..8], &6u32.to_le_bytes());
        assert_eq!(&bytes[8..], &[b'H', 0, b'i', 0, 0, 0]);
        // header + length + 8 data bytes, capped at the 14-byte unit
        assert_eq!(enc.buffer().last_mark().unwrap().min_granularity, 14);
    }

    #[test]
    fn long_binary_protects_header_and_eight_bytes() {
        let mut enc = Encoder::new();
        enc.push_property(tags::SOURCE_KEY, &PropValue::Binary(vec![7; 22]))
            .unwrap();
        let mark = enc.buffer().last_mark().unwrap();
        assert_eq!(mark.offset, 4 + 4 + 22);
        assert_eq!(mark.min_granularity, 16);
    }

    #[test]
    fn fixed_values_are_indivisible() {
        let mut enc = Encoder::new();
        enc.push_property(tags::LAST_MODIFICATION_TIME, &PropValue::Time(FileTime::UNIX_EPOCH))
            .unwrap();
        assert_eq!(enc.len(), 12);
        assert_eq!(enc.buffer().last_mark().unwrap().min_granularity, 0);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let mut enc = Encoder::new();
        let err = enc
            .push_property(tags::SOURCE_KEY, &PropValue::I32(1))
            .unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));
        assert!(enc.is_empty());
    }

    #[test]
    fn named_property_carries_name_info() {
        let named = NamedProperty {
            guid: Uuid::from_bytes([1; 16]),
            kind: NameKind::Name("X".into()),
        };
        let tag = PropTag::new(0x8001, PropType::Integer32);
        let mut enc = Encoder::new();
        assert_eq!(
            enc.push_property(tag, &PropValue::I32(5)),
            Err(EncodeError::MissingName(tag))
        );
        enc.push_named_property(tag, &named, &PropValue::I32(5)).unwrap();
        // tag + guid + kind + "X\0" in UTF-16 + value
        assert_eq!(enc.len(), 4 + 16 + 1 + 4 + 4);
        assert_eq!(enc.buffer().bytes()[20], 1);
    }

    #[test]
    fn multivalue_writes_count_then_elements() {
        let tag = PropTag::new(0x1234, PropType::MultipleInteger32);
        let mut enc = Encoder::new();
        enc.push_multivalue(tag, &PropValue::MvI32(vec![1, 2])).unwrap();
        assert_eq!(&enc.buffer().bytes()[4..8], &2u32.to_le_bytes());
        assert_eq!(enc.len(), 4 + 4 + 8);
        assert!(matches!(
            enc.push_multivalue(tags::MESSAGE_SIZE, &PropValue::I32(1)),
            Err(EncodeError::NotMultiValued(_))
        ));
    }

    #[test]
    fn state_payload_is_length_prefixed_despite_long_tag() {
        let mut enc = Encoder::new();
        enc.push_state(meta::IDSET_GIVEN, &[0xAA; 3]).unwrap();
        assert_eq!(
            enc.buffer().bytes(),
            &[0x03, 0x00, 0x17, 0x40, 3, 0, 0, 0, 0xAA, 0xAA, 0xAA]
        );
    }

    #[test]
    fn del_prop_is_tag_plus_tag() {
        let mut enc = Encoder::new();
        enc.push_meta(meta::FX_DEL_PROP, tags::MESSAGE_RECIPIENTS.value());
        assert_eq!(enc.len(), 8);
        assert_eq!(enc.buffer().marks().len(), 1);
    }
}
