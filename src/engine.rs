//! Engine frame harness.
//!
//! Boots the foundation subsystems in dependency order, owns the init heap
//! and the named proxy allocators, drives the per-frame update, and tears
//! everything down in strict reverse on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;

use crate::alloc::{
    heap, temp, AllocatorRef, BumpAlloc, ProxyAlloc, ThreadSafeAlloc,
};
use crate::blob::{Blob, GrowPolicy};
use crate::remote::protocol::CMD_CONSOLE;
use crate::remote::{ClientHandler, CommandDesc, RemoteError, RemoteServices, ServerHandler};
use crate::settings::Settings;
use crate::util::size::gb;
use crate::vfs::{Vfs, VfsConfig, VfsError};

/// Address space reserved for the init heap.
const INIT_HEAP_RESERVE: usize = gb(2);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("init heap reservation failed")]
    InitHeap,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Vfs(#[from] VfsError),
}

bitflags! {
    /// Modifier keys of a shortcut chord.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyMods: u32 {
        const CTRL = 1 << 0;
        const SHIFT = 1 << 1;
        const ALT = 1 << 2;
    }
}

/// Serves one console command line, returning its textual response.
pub type ConsoleHandler = Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>;
/// Receives console responses (or error texts) on the client side.
pub type ConsoleResponseCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when a registered key chord fires.
pub type ShortcutCallback = Box<dyn FnMut() + Send>;
/// Callback invoked once per frame with the frame delta time.
pub type UpdateCallback = Box<dyn FnMut(f32) + Send>;

struct Shortcut {
    key: String,
    mods: KeyMods,
    callback: ShortcutCallback,
}

/// Parse a chord like `"K+SHIFT+CTRL"` into its key and modifiers.
/// Exactly one non-modifier token is required.
fn parse_shortcut(chord: &str) -> Option<(String, KeyMods)> {
    let mut mods = KeyMods::empty();
    let mut key = None;
    for token in chord.split('+') {
        let token = token.trim().to_ascii_uppercase();
        match token.as_str() {
            "" => return None,
            "CTRL" => mods |= KeyMods::CTRL,
            "SHIFT" => mods |= KeyMods::SHIFT,
            "ALT" => mods |= KeyMods::ALT,
            _ => {
                if key.replace(token).is_some() {
                    return None;
                }
            }
        }
    }
    key.map(|k| (k, mods))
}

/// The engine context: owns the subsystems and the per-frame state.
pub struct Engine {
    settings: Settings,
    init_heap: AllocatorRef,
    proxies: Mutex<Vec<Arc<ProxyAlloc>>>,
    remote: RemoteServices,
    vfs: Vfs,
    server_port: Option<u16>,

    frame_index: u64,
    frame_time: f32,
    started: Instant,
    main_thread: ThreadId,

    shortcuts: Vec<Shortcut>,
    update_callbacks: Vec<UpdateCallback>,

    released: AtomicBool,
}

impl Engine {
    /// Boot order: init heap, proxy allocators, settings-driven remote layer
    /// (server first, then the client connection), then the VFS.
    pub fn initialize(settings: Settings) -> Result<Self, EngineError> {
        log::set_max_level(settings.engine.log_level);
        log::info!("engine boot");

        // The init heap owns one-time boot-phase allocations. With
        // debugAllocations everything routes to the plain heap instead so
        // external tooling can track individual blocks.
        let init_heap: AllocatorRef = if settings.engine.debug_allocations {
            heap()
        } else {
            let bump = BumpAlloc::with_reserve(INIT_HEAP_RESERVE).ok_or(EngineError::InitHeap)?;
            Arc::new(ThreadSafeAlloc::new(bump))
        };

        let proxies = Mutex::new(Vec::new());
        let register =
            |proxies: &Mutex<Vec<Arc<ProxyAlloc>>>, name: &str| -> Arc<ProxyAlloc> {
                let proxy = Arc::new(ProxyAlloc::new(name, heap()));
                proxies.lock().push(proxy.clone());
                proxy
            };
        let _engine_alloc = register(&proxies, "Engine");
        let vfs_alloc = register(&proxies, "VirtualFS");
        let _remote_alloc = register(&proxies, "Remote");
        let _asset_alloc = register(&proxies, "Assets");

        let remote = RemoteServices::new();
        let server_port = if settings.tooling.enable_server {
            Some(remote.start_server(settings.tooling.server_port)?)
        } else {
            None
        };

        let vfs = Vfs::initialize(VfsConfig {
            remote: remote.clone(),
            alloc: vfs_alloc,
            connect_to_server: settings.engine.connect_to_server,
            server_enabled: settings.tooling.enable_server,
        })?;

        if settings.engine.connect_to_server {
            let drain_vfs = vfs.clone();
            let connected = remote.connect(
                &settings.engine.remote_services_url,
                Some(Box::new(move |url, by_us, err| {
                    log::info!(
                        "remote session with '{}' ended (initiated by us: {}, error {})",
                        url,
                        by_us,
                        err
                    );
                    drain_vfs.notify_remote_disconnected();
                })),
            );
            if let Err(err) = connected {
                log::warn!(
                    "connecting to '{}' failed: {}; remote mounts are unavailable",
                    settings.engine.remote_services_url,
                    err
                );
            }
        }

        Ok(Self {
            settings,
            init_heap,
            proxies,
            remote,
            vfs,
            server_port,
            frame_index: 0,
            frame_time: 0.0,
            started: Instant::now(),
            main_thread: std::thread::current().id(),
            shortcuts: Vec::new(),
            update_callbacks: Vec::new(),
            released: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn remote(&self) -> &RemoteServices {
        &self.remote
    }

    /// The boot-phase bump allocator. Collaborators carve their one-time
    /// state from here; it is released wholesale at shutdown.
    pub fn init_heap(&self) -> AllocatorRef {
        self.init_heap.clone()
    }

    /// Port the remote server is listening on, when enabled.
    pub fn server_port(&self) -> Option<u16> {
        self.server_port
    }

    /// Register a named proxy allocator for budget reporting.
    pub fn register_proxy(&self, proxy: Arc<ProxyAlloc>) {
        self.proxies.lock().push(proxy);
    }

    /// Create and register a named proxy over the default heap.
    pub fn create_proxy(&self, name: &str) -> Arc<ProxyAlloc> {
        let proxy = Arc::new(ProxyAlloc::new(name, heap()));
        self.register_proxy(proxy.clone());
        proxy
    }

    /// Accounting snapshot of every registered proxy.
    pub fn proxy_stats(&self) -> Vec<crate::alloc::proxy::ProxyStats> {
        self.proxies.lock().iter().map(|p| p.stats()).collect()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Delta time of the current frame, in seconds.
    pub fn frame_time(&self) -> f32 {
        self.frame_time
    }

    /// Milliseconds since boot.
    pub fn elapsed_ms(&self) -> f32 {
        self.started.elapsed().as_secs_f32() * 1000.0
    }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }

    /// Start a frame: record dt, run the temp-allocator maintenance (which
    /// may decay idle committed memory), then the update callbacks.
    pub fn begin_frame(&mut self, dt: f32) {
        debug_assert!(self.is_main_thread());
        self.frame_time = dt;
        temp::reset(dt);
        for callback in &mut self.update_callbacks {
            callback(dt);
        }
    }

    /// Close the frame and advance the frame index.
    pub fn end_frame(&mut self) {
        debug_assert!(self.is_main_thread());
        self.frame_index += 1;
    }

    /// Register a per-frame update callback.
    pub fn register_update(&mut self, callback: impl FnMut(f32) + Send + 'static) {
        self.update_callbacks.push(Box::new(callback));
    }

    /// Register a key-chord shortcut, e.g. `"K+SHIFT+CTRL"`. Returns false
    /// (and logs) for an unparsable chord.
    pub fn register_shortcut(
        &mut self,
        chord: &str,
        callback: impl FnMut() + Send + 'static,
    ) -> bool {
        match parse_shortcut(chord) {
            Some((key, mods)) => {
                self.shortcuts.push(Shortcut {
                    key,
                    mods,
                    callback: Box::new(callback),
                });
                true
            }
            None => {
                log::error!("invalid shortcut chord '{}'", chord);
                false
            }
        }
    }

    /// Wire up the developer-console command. The console registry itself is
    /// an external collaborator; this only puts its traffic on the wire.
    /// `handler` services command lines on the tool host; `on_response`
    /// receives responses on the client.
    pub fn register_console(
        &self,
        handler: Option<ConsoleHandler>,
        on_response: Option<ConsoleResponseCallback>,
    ) -> Result<(), RemoteError> {
        let server_fn: Option<ServerHandler> = handler.map(|handler| {
            Box::new(move |_cmd, incoming: &mut Blob, outgoing: &mut Blob| {
                let cmdline = incoming
                    .read_str_binary()
                    .ok_or_else(|| "malformed console command".to_string())?;
                let reply = handler(&cmdline)?;
                outgoing.set_grow_policy(GrowPolicy::Multiply);
                outgoing.write_str_binary(&reply);
                Ok(())
            }) as ServerHandler
        });
        let client_fn: Option<ClientHandler> = on_response.map(|on_response| {
            Box::new(move |_cmd, incoming: &mut Blob, error: Option<&str>| match error {
                Some(text) => on_response(text),
                None => {
                    if let Some(reply) = incoming.read_str_binary() {
                        on_response(&reply);
                    }
                }
            }) as ClientHandler
        });
        self.remote.register(CommandDesc {
            fourcc: CMD_CONSOLE,
            server_fn,
            client_fn,
            deferred: false,
        })
    }

    /// Send a console command line to the tool host.
    pub fn execute_console(&self, cmdline: &str) -> Result<(), RemoteError> {
        let mut payload = Blob::new().with_grow_policy(GrowPolicy::Multiply);
        payload.write_str_binary(cmdline);
        self.remote.execute(CMD_CONSOLE, &payload)
    }

    /// Feed a key event from the platform layer; fires matching shortcuts.
    pub fn process_key(&mut self, key: &str, mods: KeyMods) {
        let key = key.to_ascii_uppercase();
        for shortcut in &mut self.shortcuts {
            if shortcut.key == key && shortcut.mods == mods {
                (shortcut.callback)();
            }
        }
    }

    /// Tear down in reverse boot order. Also runs on drop.
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("engine shutdown");
        self.vfs.release();
        self.remote.release();

        for stats in self.proxy_stats() {
            if stats.current_bytes != 0 {
                log::warn!(
                    "proxy '{}' leaked {} bytes at shutdown",
                    stats.name,
                    stats.current_bytes
                );
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shortcut_chords() {
        let (key, mods) = parse_shortcut("K+SHIFT+CTRL").unwrap();
        assert_eq!(key, "K");
        assert_eq!(mods, KeyMods::CTRL | KeyMods::SHIFT);

        let (key, mods) = parse_shortcut("f5").unwrap();
        assert_eq!(key, "F5");
        assert_eq!(mods, KeyMods::empty());

        assert!(parse_shortcut("CTRL+SHIFT").is_none());
        assert!(parse_shortcut("A+B").is_none());
        assert!(parse_shortcut("").is_none());
    }

    #[test]
    fn test_boot_and_shutdown() {
        let mut engine = Engine::initialize(Settings::default()).unwrap();
        assert!(engine.is_main_thread());
        assert_eq!(engine.frame_index(), 0);
        engine.release();
    }

    #[test]
    fn test_frame_loop_advances() {
        let mut engine = Engine::initialize(Settings::default()).unwrap();
        let hits = Arc::new(AtomicBool::new(false));
        let hits2 = hits.clone();
        engine.register_update(move |dt| {
            assert!(dt > 0.0);
            hits2.store(true, Ordering::SeqCst);
        });

        engine.begin_frame(0.016);
        engine.end_frame();
        assert_eq!(engine.frame_index(), 1);
        assert!(hits.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shortcut_dispatch() {
        let mut engine = Engine::initialize(Settings::default()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        assert!(engine.register_shortcut("R+CTRL", move || {
            fired2.store(true, Ordering::SeqCst);
        }));

        engine.process_key("r", KeyMods::SHIFT);
        assert!(!fired.load(Ordering::SeqCst));
        engine.process_key("r", KeyMods::CTRL);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_proxy_accounting_clean_at_shutdown() {
        let engine = Engine::initialize(Settings::default()).unwrap();
        for stats in engine.proxy_stats() {
            assert_eq!(stats.current_bytes, 0, "proxy '{}'", stats.name);
        }
    }
}
