//! Remote services: a framed TCP command channel between a tool host (server)
//! and a running client.
//!
//! Commands are identified by four-CC tags and registered in a per-instance
//! table. The client issues requests with [`RemoteServices::execute`]; the
//! server replies inline, or later via [`RemoteServices::send_response`] for
//! deferred commands. Reply correlation beyond the four-CC is the caller's
//! job (the VFS correlates by path).
//!
//! Client handlers run on the client read-loop thread; server handlers run on
//! the server peer thread. Keep them short and do not hold long locks inside.

pub mod protocol;

mod client;
mod server;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::blob::Blob;
use crate::util::fourcc::FourCc;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake with '{0}' failed")]
    HandshakeFailed(String),
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is not connected")]
    NotConnected,
    #[error("command {0} is not registered")]
    UnknownCommand(FourCc),
    #[error("command {0} is already registered")]
    DuplicateCommand(FourCc),
    #[error("server is already running")]
    ServerAlreadyRunning,
}

/// Server-side handler: consume the request payload, fill the reply payload.
/// Returning `Err` sends an error response carrying the textual cause.
pub type ServerHandler =
    Box<dyn Fn(FourCc, &mut Blob, &mut Blob) -> Result<(), String> + Send + Sync>;

/// Client-side handler: receives the response payload, or the error text of
/// an error response.
pub type ClientHandler = Box<dyn Fn(FourCc, &mut Blob, Option<&str>) + Send + Sync>;

/// Invoked exactly once when a client session ends:
/// `(peer_url, initiated_by_us, last_os_error)`.
pub type DisconnectCallback = Box<dyn Fn(&str, bool, i32) + Send + Sync>;

/// A named operation carried over the channel.
pub struct CommandDesc {
    pub fourcc: FourCc,
    pub server_fn: Option<ServerHandler>,
    pub client_fn: Option<ClientHandler>,
    /// When true, the server defers the reply; the handler (or work it kicked
    /// off) sends it later through [`RemoteServices::send_response`].
    pub deferred: bool,
}

pub(crate) struct RemoteState {
    commands: RwLock<Vec<CommandDesc>>,

    // Server side. The peer socket clone is what send_response writes to.
    server_peer: Mutex<Option<TcpStream>>,
    server_port: Mutex<u16>,
    server_quit: AtomicBool,
    server_thread: Mutex<Option<JoinHandle<()>>>,

    // Client side. The socket clone is what execute writes to.
    client: Mutex<Option<TcpStream>>,
    client_connected: AtomicBool,
    client_quit: AtomicBool,
    client_thread: Mutex<Option<JoinHandle<()>>>,
    peer_url: Mutex<String>,
    disconnect_fn: Mutex<Option<DisconnectCallback>>,
}

impl RemoteState {
    pub(crate) fn with_command<R>(
        &self,
        fourcc: FourCc,
        f: impl FnOnce(&CommandDesc) -> R,
    ) -> Option<R> {
        let commands = self.commands.read();
        commands.iter().find(|c| c.fourcc == fourcc).map(f)
    }
}

/// Handle to one remote-services context. Clones share the same state, so a
/// clone can be captured by command handlers and worker threads.
#[derive(Clone)]
pub struct RemoteServices {
    state: Arc<RemoteState>,
}

impl Default for RemoteServices {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteServices {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RemoteState {
                commands: RwLock::new(Vec::new()),
                server_peer: Mutex::new(None),
                server_port: Mutex::new(0),
                server_quit: AtomicBool::new(false),
                server_thread: Mutex::new(None),
                client: Mutex::new(None),
                client_connected: AtomicBool::new(false),
                client_quit: AtomicBool::new(false),
                client_thread: Mutex::new(None),
                peer_url: Mutex::new(String::new()),
                disconnect_fn: Mutex::new(None),
            }),
        }
    }

    /// Register a command. Registering the same four-CC twice is a programmer
    /// error: logged, asserted in debug, rejected in release.
    pub fn register(&self, desc: CommandDesc) -> Result<(), RemoteError> {
        let mut commands = self.state.commands.write();
        if commands.iter().any(|c| c.fourcc == desc.fourcc) {
            log::error!("remote command {} is already registered", desc.fourcc);
            debug_assert!(false, "duplicate remote command registration");
            return Err(RemoteError::DuplicateCommand(desc.fourcc));
        }
        commands.push(desc);
        Ok(())
    }

    /// Start the server accept thread on `port` (0 picks a free port).
    /// Returns the bound port.
    pub fn start_server(&self, port: u16) -> Result<u16, RemoteError> {
        let mut thread_slot = self.state.server_thread.lock();
        if thread_slot.is_some() {
            return Err(RemoteError::ServerAlreadyRunning);
        }

        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let bound_port = listener.local_addr()?.port();
        *self.state.server_port.lock() = bound_port;
        self.state.server_quit.store(false, Ordering::SeqCst);
        log::info!("remote services listening on port {}", bound_port);

        let state = self.state.clone();
        *thread_slot = Some(
            std::thread::Builder::new()
                .name("remote-server".to_string())
                .spawn(move || server::accept_loop(state, listener))
                .map_err(RemoteError::Io)?,
        );
        Ok(bound_port)
    }

    /// Stop the server: close the peer session, unblock the accept loop and
    /// join the thread. Safe to call when the server never started.
    pub fn stop_server(&self) {
        self.state.server_quit.store(true, Ordering::SeqCst);

        if let Some(peer) = self.state.server_peer.lock().as_ref() {
            let _ = peer.shutdown(std::net::Shutdown::Both);
        }

        // Unblock the accept() call with a throwaway connection.
        let port = *self.state.server_port.lock();
        if port != 0 {
            let _ = TcpStream::connect(("127.0.0.1", port));
        }

        let handle = self.state.server_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Connect to a tool server at `url` (`host:port`), perform the handshake
    /// and start the client read loop.
    pub fn connect(
        &self,
        url: &str,
        disconnect_fn: Option<DisconnectCallback>,
    ) -> Result<(), RemoteError> {
        if self.state.client_connected.load(Ordering::SeqCst) {
            debug_assert!(false, "client is already connected");
            return Err(RemoteError::AlreadyConnected);
        }

        log::info!("connecting to remote server {}", url);
        let stream = client::connect_and_handshake(url)?;

        self.state.client_quit.store(false, Ordering::SeqCst);
        *self.state.client.lock() = Some(stream.try_clone()?);
        *self.state.peer_url.lock() = url.to_string();
        *self.state.disconnect_fn.lock() = disconnect_fn;
        self.state.client_connected.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        let handle = std::thread::Builder::new()
            .name("remote-client".to_string())
            .spawn(move || client::read_loop(state, stream))
            .map_err(RemoteError::Io)?;
        *self.state.client_thread.lock() = Some(handle);

        log::info!("connected to remote server {}", url);
        Ok(())
    }

    /// Tear down the client session. The disconnect callback observes
    /// `initiated_by_us = true`.
    pub fn disconnect(&self) {
        self.state.client_quit.store(true, Ordering::SeqCst);
        if let Some(sock) = self.state.client.lock().as_ref() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        let handle = self.state.client_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.state.client_quit.store(false, Ordering::SeqCst);
        *self.state.disconnect_fn.lock() = None;
        self.state.peer_url.lock().clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state.client_connected.load(Ordering::SeqCst)
    }

    /// Frame a request and write it to the server. Callable from any thread;
    /// concurrent callers serialise on the client socket mutex.
    pub fn execute(&self, fourcc: FourCc, payload: &Blob) -> Result<(), RemoteError> {
        if self.state.with_command(fourcc, |_| ()).is_none() {
            log::error!("executing unregistered remote command {}", fourcc);
            debug_assert!(false, "unregistered remote command");
            return Err(RemoteError::UnknownCommand(fourcc));
        }

        let guard = self.state.client.lock();
        let Some(sock) = guard.as_ref() else {
            return Err(RemoteError::NotConnected);
        };
        let mut sock = sock;
        protocol::write_request(&mut sock, fourcc, payload.data())?;
        Ok(())
    }

    /// Frame a reply and write it to the connected peer. Callable from any
    /// thread; used by deferred server handlers.
    pub fn send_response(
        &self,
        fourcc: FourCc,
        payload: &Blob,
        error: Option<&str>,
    ) -> Result<(), RemoteError> {
        if self.state.with_command(fourcc, |_| ()).is_none() {
            log::error!("responding to unregistered remote command {}", fourcc);
            debug_assert!(false, "unregistered remote command");
            return Err(RemoteError::UnknownCommand(fourcc));
        }

        let guard = self.state.server_peer.lock();
        let Some(sock) = guard.as_ref() else {
            return Err(RemoteError::NotConnected);
        };
        let mut sock = sock;
        protocol::write_response(&mut sock, fourcc, payload.data(), error)?;
        Ok(())
    }

    /// Release everything: client session first, then the server.
    pub fn release(&self) {
        self.disconnect();
        self.stop_server();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::CMD_HELLO;

    #[test]
    fn test_duplicate_registration_rejected() {
        let remote = RemoteServices::new();
        remote
            .register(CommandDesc {
                fourcc: FourCc::from_bytes(b"TST0"),
                server_fn: None,
                client_fn: None,
                deferred: false,
            })
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            remote.register(CommandDesc {
                fourcc: FourCc::from_bytes(b"TST0"),
                server_fn: None,
                client_fn: None,
                deferred: false,
            })
        }));
        // Debug builds assert; release builds report the error.
        match result {
            Ok(r) => assert!(matches!(r, Err(RemoteError::DuplicateCommand(_)))),
            Err(_) => assert!(cfg!(debug_assertions)),
        }
    }

    #[test]
    fn test_execute_requires_connection() {
        let remote = RemoteServices::new();
        remote
            .register(CommandDesc {
                fourcc: CMD_HELLO,
                server_fn: None,
                client_fn: None,
                deferred: false,
            })
            .unwrap();
        let blob = Blob::new();
        assert!(matches!(
            remote.execute(CMD_HELLO, &blob),
            Err(RemoteError::NotConnected)
        ));
    }
}
