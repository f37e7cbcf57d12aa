//! The async I/O worker.
//!
//! One thread drains a FIFO of requests; completion callbacks run on this
//! thread, so requests against the same mount complete in submission order.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::alloc::AllocatorRef;
use crate::blob::Blob;

use super::{io, InfoCallback, ReadCallback, VfsFlags, VfsState, WriteCallback};

pub(super) enum Request {
    Read {
        path: String,
        flags: VfsFlags,
        alloc: AllocatorRef,
        callback: ReadCallback,
    },
    Write {
        path: String,
        flags: VfsFlags,
        blob: Blob,
        callback: WriteCallback,
    },
    Info {
        path: String,
        callback: InfoCallback,
    },
}

pub(super) struct AsyncWorker {
    sender: Mutex<Option<Sender<Request>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWorker {
    /// Spawn the worker thread. It holds only a weak reference to the VFS so
    /// an abandoned VFS can still shut down cleanly.
    pub(super) fn spawn(state: Weak<VfsState>) -> Self {
        let (sender, receiver) = unbounded::<Request>();
        let thread = std::thread::Builder::new()
            .name("vfs-worker".to_string())
            .spawn(move || {
                // The loop ends when every sender is dropped at release time.
                while let Ok(request) = receiver.recv() {
                    let Some(state) = state.upgrade() else { break };
                    if state.quit() {
                        break;
                    }
                    service(&state, request);
                }
            })
            .expect("spawning vfs worker");
        Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Enqueue a request. Dropped with a warning after shutdown.
    pub(super) fn submit(&self, request: Request) {
        match self.sender.lock().as_ref() {
            Some(sender) => {
                let _ = sender.send(request);
            }
            None => log::warn!("async I/O request submitted after shutdown"),
        }
    }

    /// Close the queue and join the worker.
    pub(super) fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn service(state: &Arc<VfsState>, request: Request) {
    match request {
        Request::Read {
            path,
            flags,
            alloc,
            callback,
        } => {
            let resolved = state.resolve_with_flags(&path, flags);
            let blob = io::disk_read(&resolved, flags, alloc);
            callback(&path, blob);
        }
        Request::Write {
            path,
            flags,
            mut blob,
            callback,
        } => {
            let resolved = state.resolve_with_flags(&path, flags);
            let written = io::disk_write(&resolved, flags, blob.data());
            if flags.contains(VfsFlags::NO_COPY) {
                // The caller keeps ownership of the buffer.
                callback(&path, written, Some(blob));
            } else {
                callback(&path, written, None);
                blob.free();
            }
        }
        Request::Info { path, callback } => {
            let resolved = state.resolve_disk_path(&path);
            callback(&path, io::disk_info(&resolved));
        }
    }
}
