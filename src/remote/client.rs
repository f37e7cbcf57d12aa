//! Client side: synchronous handshake and the response read loop.

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::blob::{Blob, GrowPolicy};

use super::protocol::{self, CMD_BYE, CMD_HELLO};
use super::{RemoteError, RemoteState};

/// Open the socket and complete the HELO exchange before any user traffic.
pub(super) fn connect_and_handshake(url: &str) -> Result<TcpStream, RemoteError> {
    let mut stream = TcpStream::connect(url)?;

    protocol::write_request(&mut stream, CMD_HELLO, &[])?;

    let reply = protocol::read_request_header(&mut stream)
        .map_err(|_| RemoteError::HandshakeFailed(url.to_string()))?;
    if reply.cmd != CMD_HELLO || reply.payload_len != 0 {
        return Err(RemoteError::HandshakeFailed(url.to_string()));
    }
    Ok(stream)
}

/// Drain response frames until the session ends, dispatching each to the
/// matching command's client handler. Runs on the `remote-client` thread.
pub(super) fn read_loop(state: Arc<RemoteState>, mut stream: TcpStream) {
    let mut last_error: i32 = 0;

    while !state.client_quit.load(Ordering::SeqCst) {
        let header = match protocol::read_response_header(&mut stream) {
            Ok(header) => header,
            Err(err) => {
                last_error = err.raw_os_error().unwrap_or(0);
                log::debug!("socket error: {}", err);
                break;
            }
        };

        if header.cmd == CMD_BYE {
            let _ = protocol::write_request(&mut stream, CMD_BYE, &[]);
            break;
        }

        let mut incoming = Blob::new().with_grow_policy(GrowPolicy::Multiply);
        if header.payload_len > 0 {
            if let Err(err) =
                protocol::read_payload(&mut stream, header.payload_len as usize, &mut incoming)
            {
                last_error = err.raw_os_error().unwrap_or(0);
                log::debug!("socket error: {}", err);
                break;
            }
        }

        let error_text = if header.is_error {
            match protocol::read_error_text(&mut stream) {
                Ok(text) => Some(text),
                Err(err) => {
                    last_error = err.raw_os_error().unwrap_or(0);
                    break;
                }
            }
        } else {
            None
        };

        let dispatched = state.with_command(header.cmd, |desc| {
            if let Some(client_fn) = desc.client_fn.as_ref() {
                client_fn(header.cmd, &mut incoming, error_text.as_deref());
            }
        });
        if dispatched.is_none() {
            log::debug!("unknown response command {} from server", header.cmd);
        }
    }

    let initiated_by_us = state.client_quit.load(Ordering::SeqCst);
    let _ = stream.shutdown(std::net::Shutdown::Both);

    state.client_connected.store(false, Ordering::SeqCst);
    *state.client.lock() = None;

    let peer_url = state.peer_url.lock().clone();
    if let Some(disconnect_fn) = state.disconnect_fn.lock().as_ref() {
        disconnect_fn(&peer_url, initiated_by_us, last_error);
    }
}
