//! Server side: accept loop and per-peer read loop.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::blob::{Blob, GrowPolicy};

use super::protocol::{
    self, CMD_BYE, CMD_HELLO, ERROR_DESC_MAX,
};
use super::RemoteState;

/// Loops on accept; one peer session at a time. A dedicated peer thread runs
/// the read loop and is joined before the next accept.
pub(super) fn accept_loop(state: Arc<RemoteState>, listener: TcpListener) {
    while !state.server_quit.load(Ordering::SeqCst) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if state.server_quit.load(Ordering::SeqCst) {
                    break;
                }
                log::debug!("accept failed: {}", err);
                continue;
            }
        };
        if state.server_quit.load(Ordering::SeqCst) {
            break;
        }

        log::info!("incoming connection: {}", addr);
        *state.peer_url.lock() = addr.to_string();
        match stream.try_clone() {
            Ok(write_half) => *state.server_peer.lock() = Some(write_half),
            Err(err) => {
                log::debug!("peer socket clone failed: {}", err);
                continue;
            }
        }

        let peer_state = state.clone();
        let peer = std::thread::Builder::new()
            .name("remote-server-peer".to_string())
            .spawn(move || peer_loop(peer_state, stream));
        if let Ok(handle) = peer {
            // Wait for the session to finish; only one peer is supported.
            let _ = handle.join();
        }
        *state.server_peer.lock() = None;
    }
}

/// Per-peer state machine: handshake, then framed user commands until BYE,
/// a protocol violation or a socket error.
fn peer_loop(state: Arc<RemoteState>, mut stream: TcpStream) {
    let mut said_hello = false;

    while !state.server_quit.load(Ordering::SeqCst) {
        let header = match protocol::read_request_header(&mut stream) {
            Ok(header) => header,
            Err(err) => {
                log_session_end(&state, &err);
                break;
            }
        };

        if !said_hello {
            // Nothing but the handshake is legal before HELO.
            if header.cmd == CMD_HELLO && header.payload_len == 0 {
                if protocol::write_request(&mut stream, CMD_HELLO, &[]).is_err() {
                    break;
                }
                said_hello = true;
                continue;
            }
            log::debug!("peer sent {} before handshake, dropping", header.cmd);
            break;
        }

        if header.cmd == CMD_BYE {
            let _ = protocol::write_request(&mut stream, CMD_BYE, &[]);
            break;
        }

        // User command: drain the payload first so an unknown command does
        // not desynchronise the stream.
        let mut incoming = Blob::new().with_grow_policy(GrowPolicy::Multiply);
        if header.payload_len > 0 {
            if let Err(err) =
                protocol::read_payload(&mut stream, header.payload_len as usize, &mut incoming)
            {
                log_session_end(&state, &err);
                break;
            }
        }

        let handled = state.with_command(header.cmd, |desc| {
            let mut outgoing = Blob::new().with_grow_policy(GrowPolicy::Multiply);
            let result = match desc.server_fn.as_ref() {
                Some(server_fn) => server_fn(header.cmd, &mut incoming, &mut outgoing),
                None => Err(format!("command {} has no server handler", header.cmd)),
            };
            // Deferred commands reply later through send_response, unless the
            // handler already failed.
            match result {
                Ok(()) if desc.deferred => None,
                Ok(()) => Some((outgoing, None)),
                Err(text) => {
                    let mut text = text;
                    let mut cut = text.len().min(ERROR_DESC_MAX);
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    Some((Blob::new(), Some(text)))
                }
            }
        });

        match handled {
            Some(Some((outgoing, error))) => {
                let reply = {
                    let guard = state.server_peer.lock();
                    match guard.as_ref() {
                        Some(sock) => {
                            let mut sock = sock;
                            protocol::write_response(
                                &mut sock,
                                header.cmd,
                                outgoing.data(),
                                error.as_deref(),
                            )
                        }
                        None => Ok(()),
                    }
                };
                if reply.is_err() {
                    break;
                }
            }
            Some(None) => {} // deferred; reply comes later
            None => {
                log::debug!("unknown incoming command {}", header.cmd);
            }
        }
    }

    let _ = stream.shutdown(std::net::Shutdown::Both);
    log::info!("peer session closed");
}

fn log_session_end(state: &RemoteState, err: &std::io::Error) {
    if err.kind() == std::io::ErrorKind::UnexpectedEof
        || err.kind() == std::io::ErrorKind::ConnectionReset
    {
        log::info!("disconnected from client '{}'", state.peer_url.lock());
    } else {
        log::debug!("socket error: {}", err);
    }
}
