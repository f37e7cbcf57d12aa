//! Virtual file system.
//!
//! Mount points bind alias-rooted virtual paths to local directories, a
//! remote tool server, or (on mobile targets) the platform package bundle.
//! Reads and writes come in blocking and asynchronous flavours; async
//! completion callbacks run on the VFS worker thread or a remote read-loop
//! thread, never on the caller's thread.
//!
//! Local mounts can install a recursive directory watch for hot-reload; when
//! the tool server is enabled the buffered change events are drained over the
//! wire by the remote monitor-changes command.

mod io;
mod mount;
mod remote;
mod watch;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::alloc::{heap, AllocatorRef};
use crate::blob::{Blob, GrowPolicy};
use crate::remote::protocol::{CMD_FILE_INFO, CMD_MONITOR_CHANGES, CMD_READ_FILE, CMD_WRITE_FILE};
use crate::remote::{RemoteError, RemoteServices};

use mount::MountPoint;
use remote::{PendingCallback, PendingRequest};
use worker::{AsyncWorker, Request};

/// How often the client polls the server for buffered file changes.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// What backs a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A directory on the host filesystem.
    Local,
    /// The connected tool server.
    Remote,
    /// The application package (mobile targets only).
    PackageBundle,
}

bitflags! {
    /// Request modifiers for VFS operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VfsFlags: u32 {
        /// Bypass the mount table; the path is already a host path.
        const ABSOLUTE_PATH = 1 << 0;
        /// Append a trailing NUL to the returned blob.
        const TEXT_FILE = 1 << 1;
        /// Append to the target instead of replacing it.
        const APPEND = 1 << 2;
        /// Create missing parent directories on the destination.
        const CREATE_DIRS = 1 << 3;
        /// The async write hands the blob back through the completion
        /// callback instead of freeing it, so the caller can reuse the
        /// buffer.
        const NO_COPY = 1 << 4;
    }
}

impl VfsFlags {
    /// No modifiers.
    pub const NONE: VfsFlags = VfsFlags::empty();
}

/// Classification part of a stat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Invalid,
    File,
    Directory,
}

impl PathKind {
    pub(crate) fn to_u32(self) -> u32 {
        match self {
            PathKind::Invalid => 0,
            PathKind::File => 1,
            PathKind::Directory => 2,
        }
    }

    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => PathKind::File,
            2 => PathKind::Directory,
            _ => PathKind::Invalid,
        }
    }
}

/// Stat result in the form carried by the info command.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub kind: PathKind,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: u64,
}

impl FileInfo {
    pub fn invalid() -> Self {
        Self {
            kind: PathKind::Invalid,
            size: 0,
            mtime: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != PathKind::Invalid
    }
}

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
    #[error("mount '{0}' is already added")]
    DuplicateMount(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("remote services are not enabled in settings")]
    RemoteDisabled,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Unsupported(&'static str),
}

/// Completion of an async read: the virtual path and the file contents
/// (an empty blob on failure).
pub type ReadCallback = Box<dyn FnOnce(&str, Blob) + Send>;
/// Completion of an async write: the virtual path, bytes written (zero on
/// failure), and the request's blob when [`VfsFlags::NO_COPY`] was set
/// (`None` otherwise; the VFS frees its blob after the callback returns).
pub type WriteCallback = Box<dyn FnOnce(&str, u64, Option<Blob>) + Send>;
/// Completion of an async stat.
pub type InfoCallback = Box<dyn FnOnce(&str, FileInfo) + Send>;
/// Invoked with the alias-rooted path of a created or modified file.
pub type FileChangeCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Everything the VFS needs at construction time.
pub struct VfsConfig {
    /// The remote-services context the VFS registers its commands on.
    pub remote: RemoteServices,
    /// Allocator backing internal buffers and default read blobs.
    pub alloc: AllocatorRef,
    /// Mirrors `engine.connectToServer`: remote mounts require it.
    pub connect_to_server: bool,
    /// Mirrors `tooling.enableServer`: buffer watch events for draining.
    pub server_enabled: bool,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            remote: RemoteServices::new(),
            alloc: heap(),
            connect_to_server: false,
            server_enabled: false,
        }
    }
}

pub(crate) struct VfsState {
    alloc: AllocatorRef,
    remote: RemoteServices,
    connect_enabled: bool,
    server_enabled: bool,

    mounts: RwLock<Vec<MountPoint>>,
    worker: OnceLock<AsyncWorker>,
    pending: Mutex<Vec<PendingRequest>>,

    file_changes: Mutex<Vec<String>>,
    change_callbacks: Mutex<Vec<FileChangeCallback>>,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    poller_started: AtomicBool,

    quit: AtomicBool,
}

impl VfsState {
    pub(crate) fn quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn worker(&self) -> &AsyncWorker {
        self.worker.get().expect("vfs worker not spawned")
    }

    /// Remap a virtual path to a host path through the mount table.
    pub(crate) fn resolve_disk_path(&self, path: &str) -> String {
        let mounts = self.mounts.read();
        mount::resolve(&mounts, path).1
    }

    pub(crate) fn resolve_with_flags(&self, path: &str, flags: VfsFlags) -> String {
        if flags.contains(VfsFlags::ABSOLUTE_PATH) {
            mount::normalize(path)
        } else {
            self.resolve_disk_path(path)
        }
    }

    fn mount_kind(&self, path: &str) -> Option<MountKind> {
        let normalized = mount::normalize(path);
        let mounts = self.mounts.read();
        mount::find_mount(&mounts, &normalized).map(|i| mounts[i].kind)
    }

    /// Entry point for watcher events: immediate local callbacks, plus the
    /// deduplicated buffer the monitor-changes command drains.
    pub(crate) fn on_file_changed(&self, virtual_path: &str) {
        for callback in self.change_callbacks.lock().iter() {
            callback(virtual_path);
        }
        if self.server_enabled {
            let mut changes = self.file_changes.lock();
            if !changes.iter().any(|c| c == virtual_path) {
                changes.push(virtual_path.to_string());
            }
        }
    }

    pub(crate) fn drain_file_changes(&self) -> Vec<String> {
        std::mem::take(&mut *self.file_changes.lock())
    }

    /// Dispatch a server-announced change to callbacks of watched remote
    /// mounts.
    pub(crate) fn on_remote_file_changed(&self, virtual_path: &str) {
        let matches_watched_remote = {
            let mounts = self.mounts.read();
            mount::find_mount(&mounts, virtual_path)
                .map(|i| mounts[i].kind == MountKind::Remote && mounts[i].watched)
                .unwrap_or(false)
        };
        if matches_watched_remote {
            for callback in self.change_callbacks.lock().iter() {
                callback(virtual_path);
            }
        }
    }

    pub(crate) fn push_pending(&self, request: PendingRequest) {
        self.pending.lock().push(request);
    }

    pub(crate) fn pop_pending(&self, cmd: crate::FourCc, path: &str) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|r| r.cmd == cmd && r.path == path);
        match index {
            Some(index) => Some(pending.remove(index)),
            None => {
                log::warn!("no pending request for {} '{}'", cmd, path);
                None
            }
        }
    }

    fn submit_read(
        &self,
        path: String,
        flags: VfsFlags,
        alloc: AllocatorRef,
        callback: ReadCallback,
    ) {
        match self.mount_kind(&path) {
            Some(MountKind::Remote) => {
                if !self.remote.is_connected() {
                    log::warn!("remote mount connection lost, '{}' cannot be loaded", path);
                    return;
                }
                let mut params = Blob::new().with_grow_policy(GrowPolicy::Multiply);
                params.write_str_binary(&path);
                self.push_pending(PendingRequest {
                    cmd: CMD_READ_FILE,
                    path,
                    alloc,
                    callback: PendingCallback::Read(callback),
                });
                let _ = self.remote.execute(CMD_READ_FILE, &params);
            }
            _ => self.worker().submit(Request::Read {
                path,
                flags,
                alloc,
                callback,
            }),
        }
    }

    fn submit_write(&self, path: String, blob: Blob, flags: VfsFlags, callback: WriteCallback) {
        match self.mount_kind(&path) {
            Some(MountKind::Remote) => {
                if !self.remote.is_connected() {
                    log::warn!("remote mount connection lost, '{}' cannot be written", path);
                    return;
                }
                debug_assert!(blob.size() < u32::MAX as usize);
                let mut params = Blob::new().with_grow_policy(GrowPolicy::Multiply);
                params.write_str_binary(&path);
                params.write_u32(flags.bits());
                params.write_u32(blob.size() as u32);
                params.write(blob.data());
                // The wire always carries a copy; the blob itself is parked
                // in the pending entry when the caller wants it back.
                let returned = flags.contains(VfsFlags::NO_COPY).then_some(blob);
                self.push_pending(PendingRequest {
                    cmd: CMD_WRITE_FILE,
                    path,
                    alloc: self.alloc.clone(),
                    callback: PendingCallback::Write(callback, returned),
                });
                let _ = self.remote.execute(CMD_WRITE_FILE, &params);
            }
            Some(MountKind::PackageBundle) => {
                log::error!("package bundle mounts are read-only: '{}'", path);
                let returned = flags.contains(VfsFlags::NO_COPY).then_some(blob);
                callback(&path, 0, returned);
            }
            _ => self.worker().submit(Request::Write {
                path,
                flags,
                blob,
                callback,
            }),
        }
    }

    fn submit_info(&self, path: String, callback: InfoCallback) {
        match self.mount_kind(&path) {
            Some(MountKind::Remote) => {
                if !self.remote.is_connected() {
                    log::warn!("remote mount connection lost, cannot stat '{}'", path);
                    return;
                }
                let mut params = Blob::new().with_grow_policy(GrowPolicy::Multiply);
                params.write_str_binary(&path);
                self.push_pending(PendingRequest {
                    cmd: CMD_FILE_INFO,
                    path,
                    alloc: self.alloc.clone(),
                    callback: PendingCallback::Info(callback),
                });
                let _ = self.remote.execute(CMD_FILE_INFO, &params);
            }
            _ => self.worker().submit(Request::Info { path, callback }),
        }
    }

    /// Fail every pending remote request with an empty result. Called when
    /// the client session ends while requests are in flight.
    fn drain_pending(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        for request in drained {
            match request.callback {
                PendingCallback::Read(callback) => {
                    callback(&request.path, Blob::with_allocator(request.alloc));
                }
                PendingCallback::Write(callback, returned) => {
                    callback(&request.path, 0, returned);
                }
                PendingCallback::Info(callback) => callback(&request.path, FileInfo::invalid()),
            }
        }
    }

    pub(crate) fn remote(&self) -> &RemoteServices {
        &self.remote
    }

    pub(crate) fn default_alloc(&self) -> AllocatorRef {
        self.alloc.clone()
    }
}

/// Handle to a VFS context. Clones share state, so a clone can be moved into
/// callbacks and worker threads.
#[derive(Clone)]
pub struct Vfs {
    state: Arc<VfsState>,
}

impl Vfs {
    /// Bring up the mount table, the async worker and the remote command
    /// handlers.
    pub fn initialize(config: VfsConfig) -> Result<Self, VfsError> {
        let state = Arc::new(VfsState {
            alloc: config.alloc,
            remote: config.remote,
            connect_enabled: config.connect_to_server,
            server_enabled: config.server_enabled,
            mounts: RwLock::new(Vec::new()),
            worker: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
            file_changes: Mutex::new(Vec::new()),
            change_callbacks: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            poller_started: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });

        let _ = state.worker.set(AsyncWorker::spawn(Arc::downgrade(&state)));
        remote::register_commands(&state)?;
        Ok(Self { state })
    }

    /// Mount a local directory under `alias`, optionally watching it for
    /// changes.
    pub fn mount_local(&self, root_dir: &str, alias: &str, watch: bool) -> Result<(), VfsError> {
        let mount = mount::local_mount(root_dir, alias, watch)?;

        let mut mounts = self.state.mounts.write();
        if mounts
            .iter()
            .any(|m| m.alias == mount.alias || m.root == mount.root)
        {
            log::error!("mount point with root '{}' already added", mount.root);
            return Err(VfsError::DuplicateMount(mount.alias));
        }

        if watch {
            if let Some(watcher) =
                watch::install(Arc::downgrade(&self.state), &mount.root, &mount.alias)
            {
                self.state.watchers.lock().push(watcher);
            }
        }

        log::info!("mounted local path '{}' to alias '{}'", mount.root, mount.alias);
        mounts.push(mount);
        Ok(())
    }

    /// Mount the connected tool server under `alias`. With `watch`, a
    /// background poller drains remote file-change events.
    pub fn mount_remote(&self, alias: &str, watch: bool) -> Result<(), VfsError> {
        if !self.state.connect_enabled {
            debug_assert!(false, "remote services are not enabled in settings");
            return Err(VfsError::RemoteDisabled);
        }

        let alias = alias.trim_matches('/').to_string();
        let mut mounts = self.state.mounts.write();
        if mounts
            .iter()
            .any(|m| m.kind == MountKind::Remote && m.alias == alias)
        {
            log::error!("remote mount point with alias '{}' already added", alias);
            return Err(VfsError::DuplicateMount(alias));
        }

        if watch && !self.state.poller_started.swap(true, Ordering::SeqCst) {
            let state = Arc::downgrade(&self.state);
            let poller = std::thread::Builder::new()
                .name("vfs-remote-changes".to_string())
                .spawn(move || poll_remote_changes(state))
                .map_err(VfsError::Io)?;
            *self.state.poller.lock() = Some(poller);
        }

        log::info!("mounted '{}' on the remote server", alias);
        mounts.push(MountPoint {
            kind: MountKind::Remote,
            root: String::new(),
            alias,
            watched: watch,
        });
        Ok(())
    }

    /// Mobile-only: route reads under `alias` through the platform asset
    /// manager. Desktop builds reject the call.
    pub fn mount_package_bundle(&self, _alias: &str) -> Result<(), VfsError> {
        debug_assert!(false, "package bundle mounts only exist on mobile platforms");
        Err(VfsError::Unsupported(
            "package bundle mounts only exist on mobile platforms",
        ))
    }

    /// The kind of mount `path` resolves to, if any.
    pub fn mount_kind(&self, path: &str) -> Option<MountKind> {
        self.state.mount_kind(path)
    }

    /// The host path `path` resolves to (the path itself when unmounted).
    pub fn resolve_path(&self, path: &str) -> String {
        self.state.resolve_disk_path(path)
    }

    /// The alias-relative remainder of `path`, if it hits a mount.
    pub fn strip_mount(&self, path: &str) -> Option<String> {
        let mounts = self.state.mounts.read();
        mount::strip_mount(&mounts, path)
    }

    /// Blocking read into a blob from the default allocator.
    ///
    /// Permitted on local mounts and unmounted paths; a remote blocking read
    /// is serviced through the async path with a wait and logs a performance
    /// warning.
    pub fn read_file(&self, path: &str, flags: VfsFlags) -> Blob {
        self.read_file_with(path, flags, self.state.alloc.clone())
    }

    /// Blocking read into a blob carved from `alloc`.
    pub fn read_file_with(&self, path: &str, flags: VfsFlags, alloc: AllocatorRef) -> Blob {
        debug_assert!(!flags.contains(VfsFlags::CREATE_DIRS));
        debug_assert!(!flags.contains(VfsFlags::APPEND));

        if self.state.mount_kind(path) == Some(MountKind::Remote) {
            log::warn!(
                "performance warning: blocking read of '{}' on a remote mount",
                path
            );
            if !self.state.remote.is_connected() {
                return Blob::with_allocator(alloc);
            }
            let (tx, rx) = crossbeam_channel::bounded::<Blob>(1);
            self.state.submit_read(
                mount::normalize(path),
                flags,
                alloc.clone(),
                Box::new(move |_path, blob| {
                    let _ = tx.send(blob);
                }),
            );
            return rx.recv().unwrap_or_else(|_| Blob::with_allocator(alloc));
        }

        let resolved = self.state.resolve_with_flags(path, flags);
        io::disk_read(&resolved, flags, alloc)
    }

    /// Blocking write. Returns bytes written, zero on failure. Only valid on
    /// local mounts and unmounted paths.
    pub fn write_file(&self, path: &str, blob: &Blob, flags: VfsFlags) -> u64 {
        match self.state.mount_kind(path) {
            Some(MountKind::Remote) | Some(MountKind::PackageBundle) => {
                debug_assert!(false, "blocking writes require a local mount");
                log::error!("blocking writes require a local mount: '{}'", path);
                0
            }
            _ => {
                let resolved = self.state.resolve_with_flags(path, flags);
                io::disk_write(&resolved, flags, blob.data())
            }
        }
    }

    /// Stat a file. On remote mounts this round-trips the info command
    /// synchronously and logs a performance warning.
    pub fn file_info(&self, path: &str) -> FileInfo {
        if self.state.mount_kind(path) == Some(MountKind::Remote) {
            log::warn!(
                "performance warning: blocking stat of '{}' on a remote mount",
                path
            );
            if !self.state.remote.is_connected() {
                return FileInfo::invalid();
            }
            let (tx, rx) = crossbeam_channel::bounded::<FileInfo>(1);
            self.state.submit_info(
                mount::normalize(path),
                Box::new(move |_path, info| {
                    let _ = tx.send(info);
                }),
            );
            return rx.recv().unwrap_or_else(|_| FileInfo::invalid());
        }

        let resolved = self.state.resolve_disk_path(path);
        io::disk_info(&resolved)
    }

    pub fn last_modified(&self, path: &str) -> u64 {
        self.file_info(path).mtime
    }

    pub fn file_size(&self, path: &str) -> u64 {
        self.file_info(path).size
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.file_info(path).is_valid()
    }

    /// Queue an asynchronous read. The callback runs on the worker thread
    /// (local) or the remote read-loop thread (remote) with the file contents,
    /// or an empty blob on failure.
    pub fn read_file_async(
        &self,
        path: &str,
        flags: VfsFlags,
        alloc: Option<AllocatorRef>,
        callback: impl FnOnce(&str, Blob) + Send + 'static,
    ) {
        let alloc = alloc.unwrap_or_else(|| self.state.alloc.clone());
        self.state
            .submit_read(mount::normalize(path), flags, alloc, Box::new(callback));
    }

    /// Queue an asynchronous write. With [`VfsFlags::NO_COPY`] the blob is
    /// handed back to the callback for reuse; otherwise it is freed after the
    /// callback returns.
    pub fn write_file_async(
        &self,
        path: &str,
        blob: Blob,
        flags: VfsFlags,
        callback: impl FnOnce(&str, u64, Option<Blob>) + Send + 'static,
    ) {
        self.state
            .submit_write(mount::normalize(path), blob, flags, Box::new(callback));
    }

    /// Queue an asynchronous stat.
    pub fn file_info_async(
        &self,
        path: &str,
        callback: impl FnOnce(&str, FileInfo) + Send + 'static,
    ) {
        self.state
            .submit_info(mount::normalize(path), Box::new(callback));
    }

    /// Register a hot-reload callback. It fires on the watcher thread for
    /// local mounts and on the remote read-loop thread for remote mounts.
    pub fn register_file_change_callback(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) {
        self.state.change_callbacks.lock().push(Box::new(callback));
    }

    /// To be called from the remote disconnect callback: drains pending
    /// remote requests, completing each with an empty result.
    pub fn notify_remote_disconnected(&self) {
        self.state.drain_pending();
    }

    /// Shut everything down: the worker queue, the watchers and the poller.
    /// In-flight remote requests are abandoned without callbacks.
    pub fn release(&self) {
        self.state.quit.store(true, Ordering::SeqCst);

        if let Some(worker) = self.state.worker.get() {
            worker.shutdown();
        }
        self.state.watchers.lock().clear();

        let poller = self.state.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.join();
        }

        self.state.pending.lock().clear();
        self.state.file_changes.lock().clear();
        self.state.change_callbacks.lock().clear();
    }
}

/// Low-priority loop pinging the server for buffered file changes.
fn poll_remote_changes(state: Weak<VfsState>) {
    const TICK: Duration = Duration::from_millis(100);
    let ticks_per_poll = (MONITOR_POLL_INTERVAL.as_millis() / TICK.as_millis()).max(1);

    let mut tick = 0u128;
    loop {
        let Some(state) = state.upgrade() else { return };
        if state.quit() {
            return;
        }
        if tick % ticks_per_poll == 0 && state.remote.is_connected() {
            let empty = Blob::new();
            let _ = state.remote.execute(CMD_MONITOR_CHANGES, &empty);
        }
        drop(state);
        tick += 1;
        std::thread::sleep(TICK);
    }
}
