//! One client connection: its handle table and the ROPs run against it.

use crate::config::Config;
use crate::copy::copy_to;
use crate::error::{IcsError, Result};
use crate::import::Importer;
use crate::object::{FastTransferContext, HandleTable, MapiObject};
use crate::rop::{
    ConfigureRequest, CopyToRequest, GetBufferRequest, GetBufferResponse,
    GetLocalReplicaIdsRequest, GetLocalReplicaIdsResponse, HandleResponse, ImportDeletesRequest,
    ImportHierarchyChangeRequest, ImportHierarchyChangeResponse, ImportMessageChangeRequest,
    ImportMessageChangeResponse, ImportMessageMoveRequest, ImportMessageMoveResponse,
    ImportReadStateChangesRequest, OpenCollectorRequest, RopReply, RopRequest, RopResponse,
    BUFFER_SIZE_SERVER_CHOICE,
};
use crate::server::ServerMetrics;
use crate::session::{ExtraFlags, SyncFlags, SyncSession, SyncType};
use crate::store::{
    IdAllocator, MessagePath, ObjectKind, ObjectRef, PropertyStore, ReplicaDirectory, Store,
    TableType,
};
use ics_types::{ObjectId, PropTag, PropValue};
use std::sync::Arc;

/// A client connection.
pub struct Connection {
    id: u64,
    store: Arc<dyn Store>,
    config: Arc<Config>,
    metrics: Arc<ServerMetrics>,
    handles: HandleTable,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// New connection with an empty handle table.
    pub fn new(
        id: u64,
        store: Arc<dyn Store>,
        config: Arc<Config>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let handles = HandleTable::new(config.server.max_handles_per_connection);
        Self {
            id,
            store,
            config,
            metrics,
            handles,
        }
    }

    /// Connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of open handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Object behind a handle.
    pub fn object(&self, handle: u32) -> Result<&MapiObject> {
        self.handles.get(handle)
    }

    /// Open the mailbox (logon handle).
    pub fn open_mailbox(&mut self) -> Result<u32> {
        self.handles.add(MapiObject::Mailbox, None)
    }

    /// Open a folder from a mailbox or folder handle.
    pub fn open_folder(&mut self, parent: u32, fid: ObjectId) -> Result<u32> {
        self.handles.get(parent)?;
        if !self.store.exists(&ObjectRef::Folder(fid))? {
            return Err(IcsError::NotFound(format!("folder {fid}")));
        }
        self.handles.add(MapiObject::Folder(fid), Some(parent))
    }

    /// Open a top-level message of `folder`.
    pub fn open_message(&mut self, parent: u32, folder: ObjectId, mid: ObjectId) -> Result<u32> {
        self.handles.get(parent)?;
        let path = MessagePath::top(mid);
        if !self.store.exists(&ObjectRef::Message(path.clone()))?
            || self.store.parent_folder(mid, ObjectKind::Message)? != folder
        {
            return Err(IcsError::NotFound(format!("message {mid} in folder {folder}")));
        }
        self.handles
            .add(MapiObject::Message { folder, path }, Some(parent))
    }

    /// Open an attachment of an open message.
    pub fn open_attachment(&mut self, message: u32, attach_num: u32) -> Result<u32> {
        let path = match self.handles.get(message)? {
            MapiObject::Message { path, .. } => path.clone(),
            _ => return Err(wrong_type(message, "message")),
        };
        if !self
            .store
            .exists(&ObjectRef::Attachment(path.clone(), attach_num))?
        {
            return Err(IcsError::NotFound(format!("attachment {attach_num}")));
        }
        self.handles.add(
            MapiObject::Attachment {
                message: path,
                attach_num,
            },
            Some(message),
        )
    }

    /// Open the embedded message of an open attachment.
    pub fn open_embedded_message(&mut self, attachment: u32) -> Result<u32> {
        let (path, attach_num) = match self.handles.get(attachment)? {
            MapiObject::Attachment { message, attach_num } => (message.clone(), *attach_num),
            _ => return Err(wrong_type(attachment, "attachment")),
        };
        if !self.store.has_embedded(&path, attach_num)? {
            return Err(IcsError::NotFound(format!("embedded message of attachment {attach_num}")));
        }
        let folder = self.store.parent_folder(path.mid, ObjectKind::Message)?;
        self.handles.add(
            MapiObject::Message {
                folder,
                path: path.embedded_in(attach_num),
            },
            Some(attachment),
        )
    }

    /// Open a table of an open folder.
    pub fn open_table(&mut self, folder: u32, table: TableType) -> Result<u32> {
        let fid = self.folder_of(folder)?;
        self.handles
            .add(MapiObject::Table { folder: fid, table }, Some(folder))
    }

    /// Open a read-only stream over a binary or string property.
    pub fn open_stream(&mut self, parent: u32, tag: PropTag) -> Result<u32> {
        let obj = self.object_ref(parent)?;
        let bytes = match self.store.get_property(&obj, tag)? {
            Some(PropValue::Binary(bytes)) => bytes,
            Some(PropValue::String8(text)) => text.into_bytes(),
            Some(PropValue::Unicode(text)) => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Some(_) => return Err(IcsError::InvalidParameter(format!("{tag} is not streamable"))),
            None => return Err(IcsError::NotFound(format!("property {tag}"))),
        };
        self.handles.add(MapiObject::Stream(bytes), Some(parent))
    }

    /// Register a notification subscription.
    pub fn subscribe(&mut self, parent: u32) -> Result<u32> {
        self.handles.get(parent)?;
        self.handles.add(MapiObject::Subscription, Some(parent))
    }

    fn folder_of(&self, handle: u32) -> Result<ObjectId> {
        match self.handles.get(handle)? {
            MapiObject::Folder(fid) => Ok(*fid),
            MapiObject::Mailbox => Ok(self.store.root_folder()),
            _ => Err(wrong_type(handle, "folder")),
        }
    }

    fn object_ref(&self, handle: u32) -> Result<ObjectRef> {
        match self.handles.get(handle)? {
            MapiObject::Mailbox => Ok(ObjectRef::Folder(self.store.root_folder())),
            MapiObject::Folder(fid) => Ok(ObjectRef::Folder(*fid)),
            MapiObject::Message { path, .. } => Ok(ObjectRef::Message(path.clone())),
            MapiObject::Attachment { message, attach_num } => {
                Ok(ObjectRef::Attachment(message.clone(), *attach_num))
            }
            _ => Err(wrong_type(handle, "folder, message or attachment")),
        }
    }

    fn sync_context(&mut self, handle: u32) -> Result<&mut SyncSession> {
        match self.handles.get_mut(handle)? {
            MapiObject::SyncContext(session) => Ok(session),
            _ => Err(wrong_type(handle, "sync context")),
        }
    }

    fn collector(&self, handle: u32, sync_type: SyncType) -> Result<ObjectId> {
        match self.handles.get(handle)? {
            MapiObject::SyncContext(session) if session.is_collector() => {
                if session.sync_type() != sync_type {
                    return Err(IcsError::NoSupport("import of this kind on this collector"));
                }
                Ok(session.folder())
            }
            MapiObject::SyncContext(_) => Err(IcsError::NoSupport("import on a download context")),
            _ => Err(wrong_type(handle, "collector")),
        }
    }

    fn importer(&self, folder: ObjectId) -> Importer<'_> {
        Importer::new(self.store.as_ref(), folder)
    }

    /// Release a handle and everything opened from it.
    pub fn release(&mut self, handle: u32) -> Result<usize> {
        let freed = self.handles.release(handle)?;
        tracing::debug!("released handle {} ({} objects)", handle, freed);
        Ok(freed)
    }

    /// FastTransferSourceCopyTo.
    pub fn copy_to(&mut self, handle: u32, request: &CopyToRequest) -> Result<u32> {
        let source = self.object_ref(handle)?;
        let buffer = copy_to(self.store.as_ref(), &source, request.level, &request.excluded)?;
        let context = FastTransferContext::new(buffer, self.config.transfer.progress_margin_steps);
        self.handles
            .add(MapiObject::FtContext(context), Some(handle))
    }

    /// FastTransferSourceGetBuffer on a FastTransfer or download context.
    pub fn get_buffer(&mut self, handle: u32, request: &GetBufferRequest) -> Result<GetBufferResponse> {
        let transfer = &self.config.transfer;
        let requested = if request.buffer_size == BUFFER_SIZE_SERVER_CHOICE {
            request
                .maximum_buffer_size
                .map_or(transfer.max_buffer_size, usize::from)
                .min(transfer.max_buffer_size)
        } else {
            usize::from(request.buffer_size)
        };

        let chunk = match self.handles.get_mut(handle)? {
            MapiObject::FtContext(context) => context.next_chunk(requested),
            MapiObject::SyncContext(session) => session.next_chunk(&self.store, transfer, requested)?,
            _ => return Err(wrong_type(handle, "fast transfer or sync context")),
        };
        self.metrics.record_chunk(chunk.data.len());
        Ok(chunk.into())
    }

    /// SynchronizationConfigure.
    pub fn configure(&mut self, handle: u32, request: &ConfigureRequest) -> Result<u32> {
        let folder = self.folder_of(handle)?;
        if !request.restriction.is_empty() {
            return Err(IcsError::NoSupport("restricted synchronization"));
        }
        let sync_type = SyncType::from_u8(request.synchronization_type)?;
        let session = SyncSession::configure(
            folder,
            sync_type,
            SyncFlags::from_bits(request.synchronization_flags),
            ExtraFlags::from_bits(request.synchronization_extra_flags),
            request.property_tags.clone(),
        );
        self.handles
            .add(MapiObject::SyncContext(Box::new(session)), Some(handle))
    }

    /// SynchronizationOpenCollector.
    pub fn open_collector(&mut self, handle: u32, request: &OpenCollectorRequest) -> Result<u32> {
        let folder = self.folder_of(handle)?;
        let session = SyncSession::open_collector(folder, request.is_contents_collector);
        self.handles
            .add(MapiObject::SyncContext(Box::new(session)), Some(handle))
    }

    /// SynchronizationImportMessageChange.
    pub fn import_message_change(
        &mut self,
        handle: u32,
        request: &ImportMessageChangeRequest,
    ) -> Result<ImportMessageChangeResponse> {
        let folder = self.collector(handle, SyncType::Contents)?;
        let mid = self
            .importer(folder)
            .import_message_change(&request.property_values, request.import_flag)?;
        self.metrics.record_imported(1);
        let message = self.handles.add(
            MapiObject::Message {
                folder,
                path: MessagePath::top(mid),
            },
            Some(handle),
        )?;
        Ok(ImportMessageChangeResponse {
            handle: message,
            message_id: mid.value(),
        })
    }

    /// SynchronizationImportHierarchyChange.
    pub fn import_hierarchy_change(
        &mut self,
        handle: u32,
        request: &ImportHierarchyChangeRequest,
    ) -> Result<ImportHierarchyChangeResponse> {
        let folder = self.collector(handle, SyncType::Hierarchy)?;
        let fid = self
            .importer(folder)
            .import_hierarchy_change(&request.hierarchy_values, &request.property_values)?;
        self.metrics.record_imported(1);
        Ok(ImportHierarchyChangeResponse {
            folder_id: fid.value(),
        })
    }

    /// SynchronizationImportDeletes. Items that fail are logged and skipped.
    pub fn import_deletes(&mut self, handle: u32, request: &ImportDeletesRequest) -> Result<()> {
        let folder = match self.handles.get(handle)? {
            MapiObject::SyncContext(session) if session.is_collector() => session.folder(),
            _ => return Err(wrong_type(handle, "collector")),
        };
        let report = self
            .importer(folder)
            .import_deletes(request.import_delete_flags, &request.source_keys);
        self.metrics.record_imported(report.applied);
        Ok(())
    }

    /// SynchronizationUploadStateStreamBegin.
    pub fn upload_state_stream_begin(&mut self, handle: u32, tag: PropTag) -> Result<()> {
        self.sync_context(handle)?.begin_upload(tag)
    }

    /// SynchronizationUploadStateStreamContinue.
    pub fn upload_state_stream_continue(&mut self, handle: u32, data: &[u8]) -> Result<()> {
        self.sync_context(handle)?.continue_upload(data)
    }

    /// SynchronizationUploadStateStreamEnd.
    pub fn upload_state_stream_end(&mut self, handle: u32) -> Result<()> {
        let store = Arc::clone(&self.store);
        self.sync_context(handle)?.end_upload(store.as_ref())
    }

    /// SynchronizationImportMessageMove.
    pub fn import_message_move(
        &mut self,
        handle: u32,
        request: &ImportMessageMoveRequest,
    ) -> Result<ImportMessageMoveResponse> {
        let folder = self.collector(handle, SyncType::Contents)?;
        let mid = self.importer(folder).import_message_move(
            &request.source_folder_id,
            &request.source_message_id,
            &request.predecessor_change_list,
            &request.destination_message_id,
            &request.change_number,
        )?;
        self.metrics.record_imported(1);
        Ok(ImportMessageMoveResponse {
            message_id: mid.value(),
        })
    }

    /// GetLocalReplicaIds: reserve a block of counters.
    pub fn get_local_replica_ids(
        &mut self,
        handle: u32,
        request: &GetLocalReplicaIdsRequest,
    ) -> Result<GetLocalReplicaIdsResponse> {
        if !matches!(self.handles.get(handle)?, MapiObject::Mailbox) {
            return Err(wrong_type(handle, "mailbox"));
        }
        if request.id_count == 0 {
            return Err(IcsError::InvalidParameter("id count of zero".into()));
        }
        let first = self.store.reserve_counters(request.id_count)?;
        let (_, guid) = self.store.local_replica();
        tracing::debug!("reserved {} ids starting at {}", request.id_count, first.value());
        Ok(GetLocalReplicaIdsResponse {
            replica_guid: guid,
            global_count: first,
        })
    }

    /// SynchronizationImportReadStateChanges.
    pub fn import_read_state_changes(
        &mut self,
        handle: u32,
        request: &ImportReadStateChangesRequest,
    ) -> Result<()> {
        let folder = self.collector(handle, SyncType::Contents)?;
        let report = self
            .importer(folder)
            .import_read_state_changes(&request.message_read_states)?;
        self.metrics.record_imported(report.applied);
        Ok(())
    }

    /// SynchronizationGetTransferState: a FastTransfer context holding the
    /// context's current state.
    pub fn get_transfer_state(&mut self, handle: u32) -> Result<u32> {
        let buffer = match self.handles.get(handle)? {
            MapiObject::SyncContext(session) => session.transfer_state(self.store.as_ref())?,
            _ => return Err(wrong_type(handle, "sync context")),
        };
        let context = FastTransferContext::new(buffer, self.config.transfer.progress_margin_steps);
        self.handles
            .add(MapiObject::FtContext(context), Some(handle))
    }

    /// Run one ROP against `handle`, mapping failures to status codes.
    pub fn dispatch(&mut self, handle: u32, request: RopRequest) -> RopReply {
        let opnum = request.opnum();
        tracing::debug!("connection {}: rop 0x{:02x} on handle {}", self.id, opnum, handle);
        match self.execute(handle, request) {
            Ok(response) => RopReply::success(opnum, response),
            Err(err) => {
                self.metrics.record_error();
                let code = err.error_code();
                tracing::debug!("rop 0x{:02x} failed with {:?}: {}", opnum, code, err);
                RopReply::failure(opnum, code)
            }
        }
    }

    fn execute(&mut self, handle: u32, request: RopRequest) -> Result<RopResponse> {
        let opened = |handle: u32| RopResponse::Handle(HandleResponse { handle });
        Ok(match request {
            RopRequest::Release => {
                self.release(handle)?;
                RopResponse::Empty
            }
            RopRequest::CopyTo(req) => opened(self.copy_to(handle, &req)?),
            RopRequest::GetBuffer(req) => RopResponse::GetBuffer(self.get_buffer(handle, &req)?),
            RopRequest::Configure(req) => opened(self.configure(handle, &req)?),
            RopRequest::ImportMessageChange(req) => {
                RopResponse::ImportMessageChange(self.import_message_change(handle, &req)?)
            }
            RopRequest::ImportHierarchyChange(req) => {
                RopResponse::ImportHierarchyChange(self.import_hierarchy_change(handle, &req)?)
            }
            RopRequest::ImportDeletes(req) => {
                self.import_deletes(handle, &req)?;
                RopResponse::Empty
            }
            RopRequest::UploadStateStreamBegin(req) => {
                self.upload_state_stream_begin(handle, req.state_property)?;
                RopResponse::Empty
            }
            RopRequest::UploadStateStreamContinue(req) => {
                self.upload_state_stream_continue(handle, &req.stream_data)?;
                RopResponse::Empty
            }
            RopRequest::UploadStateStreamEnd => {
                self.upload_state_stream_end(handle)?;
                RopResponse::Empty
            }
            RopRequest::ImportMessageMove(req) => {
                RopResponse::ImportMessageMove(self.import_message_move(handle, &req)?)
            }
            RopRequest::OpenCollector(req) => opened(self.open_collector(handle, &req)?),
            RopRequest::GetLocalReplicaIds(req) => {
                RopResponse::GetLocalReplicaIds(self.get_local_replica_ids(handle, &req)?)
            }
            RopRequest::ImportReadStateChanges(req) => {
                self.import_read_state_changes(handle, &req)?;
                RopResponse::Empty
            }
            RopRequest::GetTransferState => opened(self.get_transfer_state(handle)?),
        })
    }
}

fn wrong_type(handle: u32, expected: &'static str) -> IcsError {
    IcsError::WrongObjectType { handle, expected }
}
