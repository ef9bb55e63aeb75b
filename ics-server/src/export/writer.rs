//! Serialization of stored objects into FastTransfer elements.

use crate::error::Result;
use crate::session::PropertySelection;
use crate::store::{MessagePath, ObjectRef, PropertyStore, Store};
use ics_core::Encoder;
use ics_types::{meta, tags, Marker, PropTag, PropType, PropValue, TaggedValue};

/// Writes properties, recipients, attachments and embedded messages.
#[derive(Clone, Copy)]
pub struct Writer<'a> {
    store: &'a dyn Store,
}

impl<'a> Writer<'a> {
    /// Writer reading from `store`.
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Write one property. Named properties the store cannot name and
    /// object-typed properties are skipped; returns whether it was written.
    pub fn push_value(&self, encoder: &mut Encoder, tag: PropTag, value: &PropValue) -> Result<bool> {
        if matches!(tag.prop_type(), Ok(PropType::Object)) {
            return Ok(false);
        }
        if tag.is_named() {
            let Some(named) = self.store.named_property(tag) else {
                tracing::warn!("skipping named property {} without a name mapping", tag);
                return Ok(false);
            };
            encoder.push_named_property(tag, &named, value)?;
        } else {
            encoder.push_property(tag, value)?;
        }
        Ok(true)
    }

    /// Write the values of `tags` present on `obj`.
    pub fn write_properties(&self, encoder: &mut Encoder, obj: &ObjectRef, tags: &[PropTag]) -> Result<()> {
        let values = self.store.get_properties(obj, tags)?;
        for (tag, value) in tags.iter().zip(values) {
            if let Some(value) = value {
                self.push_value(encoder, *tag, &value)?;
            }
        }
        Ok(())
    }

    /// Stored properties of `obj` chosen by `selection`, minus `skip`.
    pub fn selected_tags(
        &self,
        obj: &ObjectRef,
        selection: &PropertySelection,
        skip: &[PropTag],
    ) -> Result<Vec<PropTag>> {
        let available = self.store.available_properties(obj)?;
        Ok(selection
            .select(&available)
            .into_iter()
            .filter(|t| !skip.iter().any(|s| s.id() == t.id()))
            .collect())
    }

    /// Write the selected properties of `obj`.
    pub fn write_selected(
        &self,
        encoder: &mut Encoder,
        obj: &ObjectRef,
        selection: &PropertySelection,
        skip: &[PropTag],
    ) -> Result<()> {
        let tags = self.selected_tags(obj, selection, skip)?;
        self.write_properties(encoder, obj, &tags)
    }

    /// messageContent: properties, then recipients and attachments unless
    /// `children` is false.
    pub fn write_message_content(
        &self,
        encoder: &mut Encoder,
        msg: &MessagePath,
        selection: &PropertySelection,
        skip: &[PropTag],
        children: bool,
    ) -> Result<()> {
        self.write_selected(encoder, &ObjectRef::Message(msg.clone()), selection, skip)?;
        if children {
            self.write_message_children(encoder, msg, selection)?;
        }
        Ok(())
    }

    /// Recipients and attachments of a message.
    pub fn write_message_children(
        &self,
        encoder: &mut Encoder,
        msg: &MessagePath,
        selection: &PropertySelection,
    ) -> Result<()> {
        encoder.push_meta(meta::FX_DEL_PROP, tags::MESSAGE_RECIPIENTS.value());
        for row in self.store.recipients(msg)? {
            encoder.push_marker(Marker::StartRecip);
            self.write_row(encoder, &row)?;
            encoder.push_marker(Marker::EndToRecip);
        }

        encoder.push_meta(meta::FX_DEL_PROP, tags::MESSAGE_ATTACHMENTS.value());
        for attach_num in self.store.attachment_numbers(msg)? {
            encoder.push_marker(Marker::NewAttach);
            encoder.push_property(tags::ATTACH_NUMBER, &PropValue::I32(attach_num as i32))?;
            self.write_attachment_content(encoder, msg, attach_num, selection)?;
            encoder.push_marker(Marker::EndAttach);
        }
        Ok(())
    }

    /// attachmentContent: properties, then the embedded message if any.
    pub fn write_attachment_content(
        &self,
        encoder: &mut Encoder,
        msg: &MessagePath,
        attach_num: u32,
        selection: &PropertySelection,
    ) -> Result<()> {
        let attachment = ObjectRef::Attachment(msg.clone(), attach_num);
        self.write_selected(encoder, &attachment, &PropertySelection::all(), &[tags::ATTACH_NUMBER])?;
        if self.store.has_embedded(msg, attach_num)? {
            let embedded = msg.embedded_in(attach_num);
            encoder.push_marker(Marker::StartEmbed);
            self.write_message_content(encoder, &embedded, selection, &[], true)?;
            encoder.push_marker(Marker::EndEmbed);
        }
        Ok(())
    }

    fn write_row(&self, encoder: &mut Encoder, row: &[TaggedValue]) -> Result<()> {
        for tv in row {
            self.push_value(encoder, tv.tag, &tv.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ics_core::{decode, Element};
    use ics_types::{NameKind, NamedProperty};

    fn markers(encoder: &Encoder) -> Vec<Marker> {
        decode(encoder.buffer().bytes())
            .unwrap()
            .into_iter()
            .filter_map(|e| match e {
                Element::Marker(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn message_children_are_framed() {
        let store = MemoryStore::new();
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let mid = store.add_message(inbox, "outer", false).unwrap();
        let msg = MessagePath::top(mid);
        store
            .add_recipient(
                &msg,
                vec![TaggedValue::new(tags::DISPLAY_NAME, PropValue::Unicode("Ann".into()))],
            )
            .unwrap();
        let n = store.add_attachment(&msg, &[]).unwrap();
        store.embed_message(&msg, n, &[]).unwrap();

        let mut encoder = Encoder::new();
        Writer::new(&store)
            .write_message_content(&mut encoder, &msg, &PropertySelection::all(), &[], true)
            .unwrap();

        assert_eq!(
            markers(&encoder),
            vec![
                Marker::StartRecip,
                Marker::EndToRecip,
                Marker::NewAttach,
                Marker::StartEmbed,
                Marker::EndEmbed,
                Marker::EndAttach,
            ]
        );
    }

    #[test]
    fn children_can_be_omitted() {
        let store = MemoryStore::new();
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let mid = store.add_message(inbox, "m", false).unwrap();
        let msg = MessagePath::top(mid);
        store.add_attachment(&msg, &[]).unwrap();

        let mut encoder = Encoder::new();
        Writer::new(&store)
            .write_message_content(&mut encoder, &msg, &PropertySelection::all(), &[], false)
            .unwrap();
        assert!(markers(&encoder).is_empty());
    }

    #[test]
    fn skip_list_removes_properties() {
        let store = MemoryStore::new();
        let inbox = store.add_folder(store.root_folder(), "Inbox").unwrap();
        let mid = store.add_message(inbox, "secret", false).unwrap();

        let mut encoder = Encoder::new();
        Writer::new(&store)
            .write_selected(
                &mut encoder,
                &ObjectRef::Message(MessagePath::top(mid)),
                &PropertySelection::all(),
                &[tags::SUBJECT],
            )
            .unwrap();
        let elements = decode(encoder.buffer().bytes()).unwrap();
        assert!(elements
            .iter()
            .all(|e| !matches!(e, Element::Property { tag, .. } if *tag == tags::SUBJECT)));
    }

    #[test]
    fn named_properties_need_a_mapping() {
        let store = MemoryStore::new();
        let tag = PropTag::new(0x8001, PropType::Unicode);
        let value = PropValue::Unicode("x".into());
        let writer = Writer::new(&store);
        let mut encoder = Encoder::new();

        assert!(!writer.push_value(&mut encoder, tag, &value).unwrap());
        store.register_named_property(
            0x8001,
            NamedProperty {
                guid: uuid::Uuid::nil(),
                kind: NameKind::Lid(0x8503),
            },
        );
        assert!(writer.push_value(&mut encoder, tag, &value).unwrap());
    }
}
