//! Synchronize an in-memory mailbox through the ROP surface.
//!
//! The demo runs two contents synchronizations of one folder on a single
//! connection. The first starts from an empty state and reports every
//! message; between passes one message is modified, so the second pass,
//! primed with the state the first one returned, reports exactly that
//! change.

use anyhow::{bail, Result};
use ics_core::{decode, Element};
use ics_server::rop::{
    ConfigureRequest, GetBufferRequest, RopReply, RopRequest, RopResponse,
    UploadStateStreamBeginRequest, UploadStateStreamContinueRequest,
};
use ics_server::store::PropertyStore;
use ics_server::{Config, IcsServer, MemoryStore, Store, SyncFlags, SyncType};
use ics_types::{Marker, ObjectId, PropTag};
use serde_json::json;
use std::sync::Arc;

/// Result of one download pass.
#[derive(Debug, Default)]
pub struct PassSummary {
    /// GetBuffer calls issued.
    pub chunks: usize,
    /// Stream length.
    pub bytes: usize,
    /// Message changes reported.
    pub changes: usize,
    /// State properties returned at the end of the stream.
    pub state: Vec<(PropTag, Vec<u8>)>,
}

impl PassSummary {
    fn to_json(&self) -> serde_json::Value {
        let state: Vec<_> = self
            .state
            .iter()
            .map(|(tag, data)| json!({ "tag": tag.to_string(), "hex": hex::encode(data) }))
            .collect();
        json!({
            "chunks": self.chunks,
            "bytes": self.bytes,
            "changes": self.changes,
            "state": state,
        })
    }
}

/// Run the demo command.
pub fn run(config: Config, messages: usize, buffer_size: u16) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let inbox = store.add_folder(store.root_folder(), "Inbox")?;
    let mut mids = Vec::with_capacity(messages);
    for n in 0..messages {
        mids.push(store.add_message(inbox, &format!("Message {}", n + 1), false)?);
    }

    let shared: Arc<dyn Store> = store.clone();
    let server = IcsServer::new(config, shared);
    let id = server.connect()?;

    let first = sync_pass(&server, id, inbox, buffer_size, &[])?;
    if let Some(mid) = mids.first() {
        store.modify_message(*mid, &[])?;
    }
    let second = sync_pass(&server, id, inbox, buffer_size, &first.state)?;
    server.disconnect(id)?;

    let report = json!({
        "messages": messages,
        "buffer_size": buffer_size,
        "initial": first.to_json(),
        "incremental": second.to_json(),
        "metrics": serde_json::to_value(server.metrics().snapshot())?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Configure a contents download on `folder`, upload `state`, and drain it.
pub fn sync_pass(
    server: &IcsServer,
    connection: u64,
    folder: ObjectId,
    buffer_size: u16,
    state: &[(PropTag, Vec<u8>)],
) -> Result<PassSummary> {
    let folder_handle = server.with_connection(connection, |c| {
        let mailbox = c.open_mailbox()?;
        c.open_folder(mailbox, folder)
    })??;

    let flags = SyncFlags::UNICODE | SyncFlags::NORMAL | SyncFlags::FAI;
    let reply = server.dispatch(
        connection,
        folder_handle,
        RopRequest::Configure(ConfigureRequest {
            synchronization_type: SyncType::Contents as u8,
            send_options: 0,
            synchronization_flags: flags.bits(),
            restriction: Vec::new(),
            synchronization_extra_flags: 0,
            property_tags: Vec::new(),
        }),
    );
    let sync = match expect_response(reply)? {
        RopResponse::Handle(response) => response.handle,
        other => bail!("unexpected Configure response: {:?}", other),
    };

    for (tag, data) in state {
        upload_state(server, connection, sync, *tag, data)?;
    }

    let mut stream = Vec::new();
    let mut chunks = 0;
    loop {
        let reply = server.dispatch(
            connection,
            sync,
            RopRequest::GetBuffer(GetBufferRequest {
                buffer_size,
                maximum_buffer_size: None,
            }),
        );
        let response = match expect_response(reply)? {
            RopResponse::GetBuffer(response) => response,
            other => bail!("unexpected GetBuffer response: {:?}", other),
        };
        chunks += 1;
        stream.extend_from_slice(&response.transfer_buffer);
        if response.is_done() {
            break;
        }
    }
    tracing::debug!("pass finished: {} chunks, {} bytes", chunks, stream.len());

    expect_response(server.dispatch(connection, folder_handle, RopRequest::Release))?;
    summarize(chunks, &stream)
}

fn upload_state(
    server: &IcsServer,
    connection: u64,
    sync: u32,
    tag: PropTag,
    data: &[u8],
) -> Result<()> {
    expect_response(server.dispatch(
        connection,
        sync,
        RopRequest::UploadStateStreamBegin(UploadStateStreamBeginRequest {
            state_property: tag,
            transfer_buffer_size: data.len() as u32,
        }),
    ))?;
    expect_response(server.dispatch(
        connection,
        sync,
        RopRequest::UploadStateStreamContinue(UploadStateStreamContinueRequest {
            stream_data: data.to_vec(),
        }),
    ))?;
    expect_response(server.dispatch(connection, sync, RopRequest::UploadStateStreamEnd))?;
    Ok(())
}

fn expect_response(reply: RopReply) -> Result<RopResponse> {
    match reply.response {
        Some(response) if reply.error_code.is_success() => Ok(response),
        _ => bail!("ROP 0x{:02X} failed: {}", reply.opnum, reply.error_code),
    }
}

fn summarize(chunks: usize, stream: &[u8]) -> Result<PassSummary> {
    let elements = decode(stream)?;
    let changes = elements
        .iter()
        .filter(|e| **e == Element::Marker(Marker::IncrSyncChg))
        .count();
    let state = elements
        .into_iter()
        .filter_map(|e| match e {
            Element::State { tag, data } => Some((tag, data)),
            _ => None,
        })
        .collect();
    Ok(PassSummary {
        chunks,
        bytes: stream.len(),
        changes,
        state,
    })
}
