//! Remote ferrying: the VFS commands carried over remote services.
//!
//! The client records each outbound request in a pending table keyed by
//! `(command, path)` and correlates replies by the path echoed in every
//! response (error responses carry the path as their error text). The server
//! re-enters its own VFS to service requests and ships the results back.

use std::sync::{Arc, Weak};

use crate::blob::{Blob, GrowPolicy};
use crate::remote::protocol::{
    CMD_FILE_INFO, CMD_MONITOR_CHANGES, CMD_READ_FILE, CMD_WRITE_FILE,
};
use crate::remote::{CommandDesc, RemoteError, RemoteServices};
use crate::util::fourcc::FourCc;

use super::{
    FileInfo, InfoCallback, PathKind, ReadCallback, VfsFlags, VfsState, WriteCallback,
};

/// One outbound remote request awaiting its reply.
pub(crate) struct PendingRequest {
    pub cmd: FourCc,
    pub path: String,
    pub alloc: crate::alloc::AllocatorRef,
    pub callback: PendingCallback,
}

pub(crate) enum PendingCallback {
    Read(ReadCallback),
    /// Carries the caller's blob when the write was flagged `NO_COPY`, to be
    /// handed back on completion.
    Write(WriteCallback, Option<Blob>),
    Info(InfoCallback),
}

/// Register the four VFS commands on the remote context.
pub(super) fn register_commands(state: &Arc<VfsState>) -> Result<(), RemoteError> {
    let remote = state.remote().clone();

    {
        let server = Arc::downgrade(state);
        let client = Arc::downgrade(state);
        let responder = remote.clone();
        remote.register(CommandDesc {
            fourcc: CMD_READ_FILE,
            server_fn: Some(Box::new(move |_cmd, incoming, _outgoing| {
                let state = upgrade(&server)?;
                serve_read(&state, &responder, incoming)
            })),
            client_fn: Some(Box::new(move |_cmd, incoming, error| {
                if let Some(state) = client.upgrade() {
                    client_read_reply(&state, incoming, error);
                }
            })),
            deferred: true,
        })?;
    }

    {
        let server = Arc::downgrade(state);
        let client = Arc::downgrade(state);
        let responder = remote.clone();
        remote.register(CommandDesc {
            fourcc: CMD_WRITE_FILE,
            server_fn: Some(Box::new(move |_cmd, incoming, _outgoing| {
                let state = upgrade(&server)?;
                serve_write(&state, &responder, incoming)
            })),
            client_fn: Some(Box::new(move |_cmd, incoming, error| {
                if let Some(state) = client.upgrade() {
                    client_write_reply(&state, incoming, error);
                }
            })),
            deferred: true,
        })?;
    }

    {
        let server = Arc::downgrade(state);
        let client = Arc::downgrade(state);
        remote.register(CommandDesc {
            fourcc: CMD_FILE_INFO,
            server_fn: Some(Box::new(move |_cmd, incoming, outgoing| {
                let state = upgrade(&server)?;
                serve_info(&state, incoming, outgoing)
            })),
            client_fn: Some(Box::new(move |_cmd, incoming, error| {
                if let Some(state) = client.upgrade() {
                    client_info_reply(&state, incoming, error);
                }
            })),
            deferred: false,
        })?;
    }

    {
        let server = Arc::downgrade(state);
        let client = Arc::downgrade(state);
        remote.register(CommandDesc {
            fourcc: CMD_MONITOR_CHANGES,
            server_fn: Some(Box::new(move |_cmd, _incoming, outgoing| {
                let state = upgrade(&server)?;
                serve_monitor_changes(&state, outgoing);
                Ok(())
            })),
            client_fn: Some(Box::new(move |_cmd, incoming, _error| {
                if let Some(state) = client.upgrade() {
                    client_monitor_reply(&state, incoming);
                }
            })),
            deferred: false,
        })?;
    }

    Ok(())
}

fn upgrade(state: &Weak<VfsState>) -> Result<Arc<VfsState>, String> {
    state.upgrade().ok_or_else(|| "vfs is shut down".to_string())
}

/// Server FRD0: re-enter the local VFS asynchronously; the completion packs
/// `[path][bytes]` and sends the deferred reply.
fn serve_read(
    state: &Arc<VfsState>,
    responder: &RemoteServices,
    incoming: &mut Blob,
) -> Result<(), String> {
    let path = incoming
        .read_str_binary()
        .ok_or_else(|| "malformed read request".to_string())?;

    let responder = responder.clone();
    let vfs = super::Vfs {
        state: state.clone(),
    };
    let alloc = state.default_alloc();
    vfs.read_file_async(&path, VfsFlags::NONE, Some(alloc), move |path, blob| {
        if blob.is_valid() {
            let mut response = Blob::new().with_grow_policy(GrowPolicy::Multiply);
            response.write_str_binary(path);
            response.write(blob.data());
            let _ = responder.send_response(CMD_READ_FILE, &response, None);
        } else {
            // The error text doubles as the correlation key on the client.
            let empty = Blob::new();
            let _ = responder.send_response(CMD_READ_FILE, &empty, Some(path));
        }
    });
    Ok(())
}

/// Server FWT0: `[path][flags][size][bytes]`; the completion packs
/// `[path][written]`.
fn serve_write(
    state: &Arc<VfsState>,
    responder: &RemoteServices,
    incoming: &mut Blob,
) -> Result<(), String> {
    let path = incoming
        .read_str_binary()
        .ok_or_else(|| "malformed write request".to_string())?;
    let flags = VfsFlags::from_bits_truncate(
        incoming
            .read_u32()
            .ok_or_else(|| "malformed write request".to_string())?,
    );
    let size = incoming
        .read_u32()
        .ok_or_else(|| "malformed write request".to_string())? as usize;
    if size == 0 || size > incoming.remaining() {
        return Err(path);
    }

    let mut body = Blob::with_allocator(state.default_alloc());
    body.reserve(size);
    let offset = incoming.read_offset();
    body.write(&incoming.data()[offset..offset + size]);

    let responder = responder.clone();
    let vfs = super::Vfs {
        state: state.clone(),
    };
    vfs.write_file_async(&path, body, flags, move |path, written, _returned| {
        if written > 0 {
            let mut response = Blob::new().with_grow_policy(GrowPolicy::Multiply);
            response.write_str_binary(path);
            response.write_u64(written);
            let _ = responder.send_response(CMD_WRITE_FILE, &response, None);
        } else {
            let empty = Blob::new();
            let _ = responder.send_response(CMD_WRITE_FILE, &empty, Some(path));
        }
    });
    Ok(())
}

/// Server FINF: synchronous stat, replying `[path][type][size][mtime]`.
fn serve_info(
    state: &Arc<VfsState>,
    incoming: &mut Blob,
    outgoing: &mut Blob,
) -> Result<(), String> {
    let path = incoming
        .read_str_binary()
        .ok_or_else(|| "malformed info request".to_string())?;

    let resolved = state.resolve_disk_path(&path);
    let info = super::io::disk_info(&resolved);
    if !info.is_valid() {
        return Err(path);
    }

    outgoing.set_grow_policy(GrowPolicy::Multiply);
    outgoing.write_str_binary(&path);
    outgoing.write_u32(info.kind.to_u32());
    outgoing.write_u64(info.size);
    outgoing.write_u64(info.mtime);
    Ok(())
}

/// Server DMON: drain the buffered change events as `[count]{[len][bytes]}*`.
fn serve_monitor_changes(state: &Arc<VfsState>, outgoing: &mut Blob) {
    let changes = state.drain_file_changes();
    outgoing.set_grow_policy(GrowPolicy::Multiply);
    outgoing.write_u32(changes.len() as u32);
    for change in &changes {
        outgoing.write_str_binary(change);
    }
}

fn client_read_reply(state: &Arc<VfsState>, incoming: &mut Blob, error: Option<&str>) {
    match error {
        None => {
            let Some(path) = incoming.read_str_binary() else {
                log::warn!("malformed read reply");
                return;
            };
            let Some(request) = state.pop_pending(CMD_READ_FILE, &path) else {
                return;
            };
            let mut blob = Blob::with_allocator(request.alloc).with_grow_policy(GrowPolicy::Multiply);
            let offset = incoming.read_offset();
            blob.reserve(incoming.remaining());
            blob.write(&incoming.data()[offset..]);
            if let PendingCallback::Read(callback) = request.callback {
                callback(&path, blob);
            }
        }
        Some(path) => {
            let Some(request) = state.pop_pending(CMD_READ_FILE, path) else {
                return;
            };
            if let PendingCallback::Read(callback) = request.callback {
                callback(path, Blob::with_allocator(request.alloc));
            }
        }
    }
}

fn client_write_reply(state: &Arc<VfsState>, incoming: &mut Blob, error: Option<&str>) {
    match error {
        None => {
            let Some(path) = incoming.read_str_binary() else {
                log::warn!("malformed write reply");
                return;
            };
            let Some(written) = incoming.read_u64() else {
                log::warn!("malformed write reply");
                return;
            };
            let Some(request) = state.pop_pending(CMD_WRITE_FILE, &path) else {
                return;
            };
            if let PendingCallback::Write(callback, returned) = request.callback {
                callback(&path, written, returned);
            }
        }
        Some(path) => {
            let Some(request) = state.pop_pending(CMD_WRITE_FILE, path) else {
                return;
            };
            if let PendingCallback::Write(callback, returned) = request.callback {
                callback(path, 0, returned);
            }
        }
    }
}

fn client_info_reply(state: &Arc<VfsState>, incoming: &mut Blob, error: Option<&str>) {
    match error {
        None => {
            let Some(path) = incoming.read_str_binary() else {
                log::warn!("malformed info reply");
                return;
            };
            let info = match (incoming.read_u32(), incoming.read_u64(), incoming.read_u64()) {
                (Some(kind), Some(size), Some(mtime)) => FileInfo {
                    kind: PathKind::from_u32(kind),
                    size,
                    mtime,
                },
                _ => FileInfo::invalid(),
            };
            let Some(request) = state.pop_pending(CMD_FILE_INFO, &path) else {
                return;
            };
            if let PendingCallback::Info(callback) = request.callback {
                callback(&path, info);
            }
        }
        Some(path) => {
            let Some(request) = state.pop_pending(CMD_FILE_INFO, path) else {
                return;
            };
            if let PendingCallback::Info(callback) = request.callback {
                callback(path, FileInfo::invalid());
            }
        }
    }
}

/// Client DMON reply: dispatch each announced path to callbacks of watched
/// remote mounts.
fn client_monitor_reply(state: &Arc<VfsState>, incoming: &mut Blob) {
    let Some(count) = incoming.read_u32() else { return };
    for _ in 0..count {
        let Some(path) = incoming.read_str_binary() else {
            log::warn!("malformed change event list");
            return;
        };
        state.on_remote_file_changed(&path);
    }
}
