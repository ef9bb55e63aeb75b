//! Typed requests and responses of the ICS and FastTransfer ROPs.
//!
//! Transport framing is out of scope: a request arrives already split into
//! fields, addressed at one input handle.

use ics_core::{Chunk, TransferStatus};
use ics_types::{ErrorCode, GlobalCounter, PropTag, ReplicaGuid, TaggedValue};
use serde::{Deserialize, Serialize};

/// BufferSize value asking the server to pick the buffer size.
pub const BUFFER_SIZE_SERVER_CHOICE: u16 = 0xBABE;

/// ROP operation numbers.
pub mod opnum {
    /// RopRelease
    pub const RELEASE: u8 = 0x01;
    /// RopFastTransferSourceCopyTo
    pub const FAST_TRANSFER_SOURCE_COPY_TO: u8 = 0x4D;
    /// RopFastTransferSourceGetBuffer
    pub const FAST_TRANSFER_SOURCE_GET_BUFFER: u8 = 0x4E;
    /// RopSynchronizationConfigure
    pub const SYNCHRONIZATION_CONFIGURE: u8 = 0x70;
    /// RopSynchronizationImportMessageChange
    pub const SYNCHRONIZATION_IMPORT_MESSAGE_CHANGE: u8 = 0x72;
    /// RopSynchronizationImportHierarchyChange
    pub const SYNCHRONIZATION_IMPORT_HIERARCHY_CHANGE: u8 = 0x73;
    /// RopSynchronizationImportDeletes
    pub const SYNCHRONIZATION_IMPORT_DELETES: u8 = 0x74;
    /// RopSynchronizationUploadStateStreamBegin
    pub const SYNCHRONIZATION_UPLOAD_STATE_STREAM_BEGIN: u8 = 0x75;
    /// RopSynchronizationUploadStateStreamContinue
    pub const SYNCHRONIZATION_UPLOAD_STATE_STREAM_CONTINUE: u8 = 0x76;
    /// RopSynchronizationUploadStateStreamEnd
    pub const SYNCHRONIZATION_UPLOAD_STATE_STREAM_END: u8 = 0x77;
    /// RopSynchronizationImportMessageMove
    pub const SYNCHRONIZATION_IMPORT_MESSAGE_MOVE: u8 = 0x78;
    /// RopSynchronizationOpenCollector
    pub const SYNCHRONIZATION_OPEN_COLLECTOR: u8 = 0x7E;
    /// RopGetLocalReplicaIds
    pub const GET_LOCAL_REPLICA_IDS: u8 = 0x7F;
    /// RopSynchronizationImportReadStateChanges
    pub const SYNCHRONIZATION_IMPORT_READ_STATE_CHANGES: u8 = 0x80;
    /// RopSynchronizationGetTransferState
    pub const SYNCHRONIZATION_GET_TRANSFER_STATE: u8 = 0x82;
}

/// A ROP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rop")]
pub enum RopRequest {
    /// Release the input handle and everything opened from it.
    Release,
    /// Build a FastTransfer stream of the input object.
    CopyTo(CopyToRequest),
    /// Read the next chunk of a FastTransfer or download context.
    GetBuffer(GetBufferRequest),
    /// Create an ICS download context on the input folder.
    Configure(ConfigureRequest),
    /// Import a message change through a collector.
    ImportMessageChange(ImportMessageChangeRequest),
    /// Import a folder change through a collector.
    ImportHierarchyChange(ImportHierarchyChangeRequest),
    /// Import deletions through a collector.
    ImportDeletes(ImportDeletesRequest),
    /// Start uploading a state property.
    UploadStateStreamBegin(UploadStateStreamBeginRequest),
    /// Append to the state property being uploaded.
    UploadStateStreamContinue(UploadStateStreamContinueRequest),
    /// Finish the state upload.
    UploadStateStreamEnd,
    /// Import a message move through a collector.
    ImportMessageMove(ImportMessageMoveRequest),
    /// Create an ICS upload context on the input folder.
    OpenCollector(OpenCollectorRequest),
    /// Reserve a range of ids.
    GetLocalReplicaIds(GetLocalReplicaIdsRequest),
    /// Import read flag changes through a collector.
    ImportReadStateChanges(ImportReadStateChangesRequest),
    /// Build a FastTransfer stream holding the context's state.
    GetTransferState,
}

impl RopRequest {
    /// Operation number of the request.
    pub fn opnum(&self) -> u8 {
        match self {
            RopRequest::Release => opnum::RELEASE,
            RopRequest::CopyTo(_) => opnum::FAST_TRANSFER_SOURCE_COPY_TO,
            RopRequest::GetBuffer(_) => opnum::FAST_TRANSFER_SOURCE_GET_BUFFER,
            RopRequest::Configure(_) => opnum::SYNCHRONIZATION_CONFIGURE,
            RopRequest::ImportMessageChange(_) => opnum::SYNCHRONIZATION_IMPORT_MESSAGE_CHANGE,
            RopRequest::ImportHierarchyChange(_) => opnum::SYNCHRONIZATION_IMPORT_HIERARCHY_CHANGE,
            RopRequest::ImportDeletes(_) => opnum::SYNCHRONIZATION_IMPORT_DELETES,
            RopRequest::UploadStateStreamBegin(_) => opnum::SYNCHRONIZATION_UPLOAD_STATE_STREAM_BEGIN,
            RopRequest::UploadStateStreamContinue(_) => {
                opnum::SYNCHRONIZATION_UPLOAD_STATE_STREAM_CONTINUE
            }
            RopRequest::UploadStateStreamEnd => opnum::SYNCHRONIZATION_UPLOAD_STATE_STREAM_END,
            RopRequest::ImportMessageMove(_) => opnum::SYNCHRONIZATION_IMPORT_MESSAGE_MOVE,
            RopRequest::OpenCollector(_) => opnum::SYNCHRONIZATION_OPEN_COLLECTOR,
            RopRequest::GetLocalReplicaIds(_) => opnum::GET_LOCAL_REPLICA_IDS,
            RopRequest::ImportReadStateChanges(_) => {
                opnum::SYNCHRONIZATION_IMPORT_READ_STATE_CHANGES
            }
            RopRequest::GetTransferState => opnum::SYNCHRONIZATION_GET_TRANSFER_STATE,
        }
    }
}

/// RopFastTransferSourceCopyTo request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyToRequest {
    /// Non-zero copies only the object's own properties.
    pub level: u8,
    /// CopyFlags (accepted, not interpreted).
    pub copy_flags: u32,
    /// SendOptions (accepted, not interpreted).
    pub send_options: u8,
    /// Properties to leave out.
    pub excluded: Vec<PropTag>,
}

/// RopFastTransferSourceGetBuffer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBufferRequest {
    /// Requested size, or [`BUFFER_SIZE_SERVER_CHOICE`].
    pub buffer_size: u16,
    /// Upper bound sent along with [`BUFFER_SIZE_SERVER_CHOICE`].
    pub maximum_buffer_size: Option<u16>,
}

/// RopSynchronizationConfigure request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// 1 for contents, 2 for hierarchy.
    pub synchronization_type: u8,
    /// SendOptions (accepted, not interpreted).
    pub send_options: u8,
    /// SynchronizationFlags.
    pub synchronization_flags: u16,
    /// Serialized restriction; must be empty.
    pub restriction: Vec<u8>,
    /// SynchronizationExtraFlags.
    pub synchronization_extra_flags: u32,
    /// Properties to include or exclude.
    pub property_tags: Vec<PropTag>,
}

/// RopSynchronizationImportMessageChange request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMessageChangeRequest {
    /// ImportFlag bits.
    pub import_flag: u8,
    /// Source key first, then the properties to apply.
    pub property_values: Vec<TaggedValue>,
}

/// RopSynchronizationImportHierarchyChange request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportHierarchyChangeRequest {
    /// Parent source key, source key, then header properties.
    pub hierarchy_values: Vec<TaggedValue>,
    /// Other folder properties.
    pub property_values: Vec<TaggedValue>,
}

/// RopSynchronizationImportDeletes request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDeletesRequest {
    /// ImportDeleteFlags bits.
    pub import_delete_flags: u8,
    /// Source keys of the deleted objects.
    pub source_keys: Vec<Vec<u8>>,
}

/// RopSynchronizationUploadStateStreamBegin request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStateStreamBeginRequest {
    /// State property being replaced.
    pub state_property: PropTag,
    /// Announced size of the upload.
    pub transfer_buffer_size: u32,
}

/// RopSynchronizationUploadStateStreamContinue request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStateStreamContinueRequest {
    /// Next piece of the state property.
    pub stream_data: Vec<u8>,
}

/// RopSynchronizationImportMessageMove request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMessageMoveRequest {
    /// Source folder id.
    pub source_folder_id: Vec<u8>,
    /// Source message id.
    pub source_message_id: Vec<u8>,
    /// New predecessor change list.
    pub predecessor_change_list: Vec<u8>,
    /// Destination message id.
    pub destination_message_id: Vec<u8>,
    /// Change key of the moved message.
    pub change_number: Vec<u8>,
}

/// RopSynchronizationOpenCollector request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenCollectorRequest {
    /// Contents collector when true, hierarchy collector otherwise.
    pub is_contents_collector: bool,
}

/// RopGetLocalReplicaIds request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLocalReplicaIdsRequest {
    /// Number of ids to reserve.
    pub id_count: u32,
}

/// RopSynchronizationImportReadStateChanges request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReadStateChangesRequest {
    /// Back-to-back MessageReadState entries.
    pub message_read_states: Vec<u8>,
}

/// Body of a successful ROP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rop")]
pub enum RopResponse {
    /// Response without fields.
    Empty,
    /// A new handle was opened.
    Handle(HandleResponse),
    /// The next chunk of a stream.
    GetBuffer(GetBufferResponse),
    /// A message change was imported.
    ImportMessageChange(ImportMessageChangeResponse),
    /// A folder change was imported.
    ImportHierarchyChange(ImportHierarchyChangeResponse),
    /// A message move was imported.
    ImportMessageMove(ImportMessageMoveResponse),
    /// Ids were reserved.
    GetLocalReplicaIds(GetLocalReplicaIdsResponse),
}

/// Response carrying a newly opened handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleResponse {
    /// Output handle.
    pub handle: u32,
}

/// RopFastTransferSourceGetBuffer response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBufferResponse {
    /// TransferStatus value.
    pub transfer_status: u16,
    /// Steps delivered so far.
    pub in_progress_count: u16,
    /// Estimated total steps.
    pub total_step_count: u16,
    /// The chunk.
    pub transfer_buffer: Vec<u8>,
}

impl GetBufferResponse {
    /// Whether this is the last chunk of the stream.
    pub fn is_done(&self) -> bool {
        self.transfer_status == TransferStatus::Done as u16
    }

    /// Fixed layout: status, progress, total, reserved byte, size, data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.transfer_buffer.len());
        out.extend_from_slice(&self.transfer_status.to_le_bytes());
        out.extend_from_slice(&self.in_progress_count.to_le_bytes());
        out.extend_from_slice(&self.total_step_count.to_le_bytes());
        out.push(0);
        out.extend_from_slice(&(self.transfer_buffer.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.transfer_buffer);
        out
    }
}

impl From<Chunk> for GetBufferResponse {
    fn from(chunk: Chunk) -> Self {
        Self {
            transfer_status: chunk.status as u16,
            in_progress_count: saturate(chunk.in_progress_count),
            total_step_count: saturate(chunk.total_step_count),
            transfer_buffer: chunk.data,
        }
    }
}

fn saturate(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// RopSynchronizationImportMessageChange response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMessageChangeResponse {
    /// Handle of the imported message.
    pub handle: u32,
    /// Its MID.
    pub message_id: u64,
}

/// RopSynchronizationImportHierarchyChange response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportHierarchyChangeResponse {
    /// FID of the imported folder.
    pub folder_id: u64,
}

/// RopSynchronizationImportMessageMove response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMessageMoveResponse {
    /// MID of the moved message.
    pub message_id: u64,
}

/// RopGetLocalReplicaIds response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLocalReplicaIdsResponse {
    /// Local replica GUID.
    pub replica_guid: ReplicaGuid,
    /// First reserved counter.
    pub global_count: GlobalCounter,
}

/// Outcome of one dispatched ROP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RopReply {
    /// Operation number.
    pub opnum: u8,
    /// Status code; [`ErrorCode::Success`] when `response` is set.
    pub error_code: ErrorCode,
    /// Response fields of a successful call.
    pub response: Option<RopResponse>,
}

impl RopReply {
    /// Successful reply.
    pub fn success(opnum: u8, response: RopResponse) -> Self {
        Self {
            opnum,
            error_code: ErrorCode::Success,
            response: Some(response),
        }
    }

    /// Failed reply.
    pub fn failure(opnum: u8, error_code: ErrorCode) -> Self {
        Self {
            opnum,
            error_code,
            response: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_buffer_response_layout() {
        let response = GetBufferResponse {
            transfer_status: TransferStatus::Partial as u16,
            in_progress_count: 1,
            total_step_count: 3,
            transfer_buffer: vec![0xAA, 0xBB],
        };
        assert_eq!(
            response.to_bytes(),
            vec![0x01, 0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x02, 0x00, 0xAA, 0xBB]
        );
        assert!(!response.is_done());
    }

    #[test]
    fn chunk_counts_saturate() {
        let response = GetBufferResponse::from(Chunk {
            data: Vec::new(),
            status: TransferStatus::Done,
            in_progress_count: 70_000,
            total_step_count: 70_000,
        });
        assert_eq!(response.in_progress_count, u16::MAX);
        assert!(response.is_done());
    }

    #[test]
    fn opnums_match_the_wire_values() {
        assert_eq!(RopRequest::Release.opnum(), 0x01);
        assert_eq!(RopRequest::GetTransferState.opnum(), 0x82);
        assert_eq!(
            RopRequest::GetLocalReplicaIds(GetLocalReplicaIdsRequest { id_count: 1 }).opnum(),
            0x7F
        );
    }

    #[test]
    fn requests_serialize_with_rop_tag() {
        let json = serde_json::to_value(RopRequest::OpenCollector(OpenCollectorRequest {
            is_contents_collector: true,
        }))
        .unwrap();
        assert_eq!(json["rop"], "OpenCollector");
        assert_eq!(json["is_contents_collector"], true);
    }
}
