//! FastTransferSourceCopyTo: eager export of a folder, message or attachment.
//!
//! The whole stream is encoded up front into a [`TransferBuffer`] which the
//! caller serves through GetBuffer.

use crate::error::Result;
use crate::export::writer::Writer;
use crate::session::PropertySelection;
use crate::store::{MessagePath, ObjectRef, PropertyStore, SortOrder, Store, TableType};
use ics_core::{Encoder, TransferBuffer};
use ics_types::{meta, tags, Marker, ObjectId, PropTag};

enum Step {
    Enter { fid: ObjectId, top: bool },
    Leave,
}

/// Encode `source` as messageContent, attachmentContent or folderContent.
///
/// `excluded` applies to the top-level object. With `level > 0` only the
/// object's own properties are copied.
pub fn copy_to(
    store: &dyn Store,
    source: &ObjectRef,
    level: u8,
    excluded: &[PropTag],
) -> Result<TransferBuffer> {
    let writer = Writer::new(store);
    let selection = PropertySelection::exclude(excluded.to_vec());
    let children = level == 0;
    let mut encoder = Encoder::new();

    match source {
        ObjectRef::Message(path) => {
            writer.write_message_content(&mut encoder, path, &selection, &[], children)?;
        }
        ObjectRef::Attachment(path, attach_num) => {
            writer.write_selected(&mut encoder, source, &selection, &[tags::ATTACH_NUMBER])?;
            if children && store.has_embedded(path, *attach_num)? {
                encoder.push_marker(Marker::StartEmbed);
                writer.write_message_content(
                    &mut encoder,
                    &path.embedded_in(*attach_num),
                    &PropertySelection::all(),
                    &[],
                    true,
                )?;
                encoder.push_marker(Marker::EndEmbed);
            }
        }
        ObjectRef::Folder(fid) => {
            write_folder_content(store, &mut encoder, *fid, &selection, children)?;
        }
    }

    tracing::debug!("copy-to encoded {} bytes (level {})", encoder.len(), level);
    Ok(encoder.into_buffer())
}

fn excludes(selection: &PropertySelection, tag: PropTag) -> bool {
    selection.select(&[tag]).is_empty()
}

fn write_folder_content(
    store: &dyn Store,
    encoder: &mut Encoder,
    folder: ObjectId,
    selection: &PropertySelection,
    children: bool,
) -> Result<()> {
    let writer = Writer::new(store);
    let all = PropertySelection::all();
    let mut stack = vec![Step::Enter { fid: folder, top: true }];

    while let Some(step) = stack.pop() {
        let (fid, top) = match step {
            Step::Leave => {
                encoder.push_marker(Marker::EndFolder);
                continue;
            }
            Step::Enter { fid, top } => (fid, top),
        };
        let selection = if top { selection } else { &all };
        if !top {
            encoder.push_marker(Marker::StartSubFld);
            stack.push(Step::Leave);
        }
        writer.write_selected(encoder, &ObjectRef::Folder(fid), selection, &[])?;
        if !children {
            continue;
        }

        for (container, table, start) in [
            (tags::CONTAINER_CONTENTS, TableType::Messages, Marker::StartMessage),
            (tags::FOLDER_ASSOCIATED_CONTENTS, TableType::Fai, Marker::StartFaiMsg),
        ] {
            if excludes(selection, container) {
                continue;
            }
            encoder.push_meta(meta::FX_DEL_PROP, container.value());
            for mid in store.query_table(fid, table, None, SortOrder::IdAscending)? {
                encoder.push_marker(start);
                writer.write_message_content(encoder, &MessagePath::top(mid), &all, &[], true)?;
                encoder.push_marker(Marker::EndMessage);
            }
        }

        if !excludes(selection, tags::CONTAINER_HIERARCHY) {
            encoder.push_meta(meta::FX_DEL_PROP, tags::CONTAINER_HIERARCHY.value());
            let subfolders = store.query_table(fid, TableType::Folders, None, SortOrder::IdAscending)?;
            stack.extend(
                subfolders
                    .into_iter()
                    .rev()
                    .map(|fid| Step::Enter { fid, top: false }),
            );
        }
    }
    Ok(())
}
