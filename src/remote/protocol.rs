//! Wire framing for the remote-services protocol.
//!
//! Every frame starts with the `USRC` sentinel. Requests (client to server)
//! carry `[sentinel][cmd][len]`; responses (server to client) carry
//! `[sentinel][cmd][OK00|EROR][len]`, with error responses appending a
//! length-prefixed error text after the payload. All integers are explicitly
//! little-endian, so peers of different endianness interoperate.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::blob::{Blob, GrowPolicy};
use crate::util::fourcc::FourCc;

/// Frame sentinel introducing every packet.
pub const SENTINEL: FourCc = FourCc::from_bytes(b"USRC");

/// Handshake, exchanged in both directions before any user traffic.
pub const CMD_HELLO: FourCc = FourCc::from_bytes(b"HELO");
/// Session teardown, valid from either side.
pub const CMD_BYE: FourCc = FourCc::from_bytes(b"BYE0");

/// Response status markers.
pub const RESULT_OK: FourCc = FourCc::from_bytes(b"OK00");
pub const RESULT_ERROR: FourCc = FourCc::from_bytes(b"EROR");

/// Built-in VFS commands.
pub const CMD_READ_FILE: FourCc = FourCc::from_bytes(b"FRD0");
pub const CMD_WRITE_FILE: FourCc = FourCc::from_bytes(b"FWT0");
pub const CMD_FILE_INFO: FourCc = FourCc::from_bytes(b"FINF");
pub const CMD_MONITOR_CHANGES: FourCc = FourCc::from_bytes(b"DMON");

/// Developer console command; serviced by an external collaborator.
pub const CMD_CONSOLE: FourCc = FourCc::from_bytes(b"CONX");

/// Payload bodies are streamed in chunks of this size.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on error descriptions carried in error responses.
pub const ERROR_DESC_MAX: usize = 512;

/// Header of a client-to-server frame.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub cmd: FourCc,
    pub payload_len: u32,
}

/// Header of a server-to-client frame. For `BYE0` the third word is zero and
/// `payload_len` is absent on the wire; it is normalised to zero here.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub cmd: FourCc,
    pub is_error: bool,
    pub payload_len: u32,
}

/// Raised when a frame does not start with the sentinel; the session must be
/// dropped without a reply.
pub fn sentinel_mismatch() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "frame sentinel mismatch")
}

/// Write a `[sentinel][cmd][len] payload` request frame.
pub fn write_request(w: &mut impl Write, cmd: FourCc, payload: &[u8]) -> io::Result<()> {
    debug_assert!(payload.len() <= u32::MAX as usize);
    let mut header = [0u8; 12];
    {
        let mut cursor = &mut header[..];
        cursor.write_u32::<LittleEndian>(SENTINEL.value())?;
        cursor.write_u32::<LittleEndian>(cmd.value())?;
        cursor.write_u32::<LittleEndian>(payload.len() as u32)?;
    }
    w.write_all(&header)?;
    w.write_all(payload)?;
    w.flush()
}

/// Write a `[sentinel][cmd][status][len] payload [errlen errtext]` response.
pub fn write_response(
    w: &mut impl Write,
    cmd: FourCc,
    payload: &[u8],
    error: Option<&str>,
) -> io::Result<()> {
    let status = if error.is_some() { RESULT_ERROR } else { RESULT_OK };
    let mut header = [0u8; 16];
    {
        let mut cursor = &mut header[..];
        cursor.write_u32::<LittleEndian>(SENTINEL.value())?;
        cursor.write_u32::<LittleEndian>(cmd.value())?;
        cursor.write_u32::<LittleEndian>(status.value())?;
        cursor.write_u32::<LittleEndian>(payload.len() as u32)?;
    }
    w.write_all(&header)?;
    w.write_all(payload)?;
    if let Some(text) = error {
        let text = &text.as_bytes()[..text.len().min(ERROR_DESC_MAX)];
        w.write_u32::<LittleEndian>(text.len() as u32)?;
        w.write_all(text)?;
    }
    w.flush()
}

/// Read a request header. Fails with [`sentinel_mismatch`] on a bad sentinel.
pub fn read_request_header(r: &mut impl Read) -> io::Result<RequestHeader> {
    let sentinel = r.read_u32::<LittleEndian>()?;
    if sentinel != SENTINEL.value() {
        return Err(sentinel_mismatch());
    }
    let cmd = FourCc(r.read_u32::<LittleEndian>()?);
    let payload_len = r.read_u32::<LittleEndian>()?;
    Ok(RequestHeader { cmd, payload_len })
}

/// Read a response header. `BYE0` frames are 12 bytes; everything else reads
/// the fourth length word.
pub fn read_response_header(r: &mut impl Read) -> io::Result<ResponseHeader> {
    let sentinel = r.read_u32::<LittleEndian>()?;
    if sentinel != SENTINEL.value() {
        return Err(sentinel_mismatch());
    }
    let cmd = FourCc(r.read_u32::<LittleEndian>()?);
    let third = r.read_u32::<LittleEndian>()?;
    if cmd == CMD_BYE {
        return Ok(ResponseHeader {
            cmd,
            is_error: false,
            payload_len: 0,
        });
    }
    if third != RESULT_OK.value() && third != RESULT_ERROR.value() {
        return Err(sentinel_mismatch());
    }
    let payload_len = r.read_u32::<LittleEndian>()?;
    Ok(ResponseHeader {
        cmd,
        is_error: third == RESULT_ERROR.value(),
        payload_len,
    })
}

/// Stream `len` payload bytes into a blob in [`CHUNK_SIZE`] pieces.
pub fn read_payload(r: &mut impl Read, len: usize, blob: &mut Blob) -> io::Result<()> {
    blob.set_grow_policy(GrowPolicy::Multiply);
    blob.reserve(len);
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE);
        let got = r.read(&mut chunk[..want])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-payload",
            ));
        }
        blob.write(&chunk[..got]);
        remaining -= got;
    }
    Ok(())
}

/// Read the trailing error description of an error response.
pub fn read_error_text(r: &mut impl Read) -> io::Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > ERROR_DESC_MAX {
        return Err(sentinel_mismatch());
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_roundtrip() {
        let mut wire = Vec::new();
        write_request(&mut wire, CMD_READ_FILE, b"payload").unwrap();
        assert_eq!(wire.len(), 12 + 7);

        let mut cursor = Cursor::new(wire);
        let header = read_request_header(&mut cursor).unwrap();
        assert_eq!(header.cmd, CMD_READ_FILE);
        assert_eq!(header.payload_len, 7);

        let mut blob = Blob::new();
        read_payload(&mut cursor, 7, &mut blob).unwrap();
        assert_eq!(blob.data(), b"payload");
    }

    #[test]
    fn test_ok_response_roundtrip() {
        let mut wire = Vec::new();
        write_response(&mut wire, CMD_FILE_INFO, b"abc", None).unwrap();

        let mut cursor = Cursor::new(wire);
        let header = read_response_header(&mut cursor).unwrap();
        assert_eq!(header.cmd, CMD_FILE_INFO);
        assert!(!header.is_error);
        assert_eq!(header.payload_len, 3);
    }

    #[test]
    fn test_error_response_carries_text() {
        let mut wire = Vec::new();
        write_response(&mut wire, CMD_READ_FILE, b"", Some("file not found")).unwrap();

        let mut cursor = Cursor::new(wire);
        let header = read_response_header(&mut cursor).unwrap();
        assert!(header.is_error);
        assert_eq!(header.payload_len, 0);
        let text = read_error_text(&mut cursor).unwrap();
        assert_eq!(text, "file not found");
    }

    #[test]
    fn test_sentinel_mismatch_rejected() {
        let wire = vec![0u8; 12];
        let mut cursor = Cursor::new(wire);
        assert!(read_request_header(&mut cursor).is_err());
    }

    #[test]
    fn test_bye_frame_is_short() {
        let mut wire = Vec::new();
        write_request(&mut wire, CMD_BYE, &[]).unwrap();
        let mut cursor = Cursor::new(wire);
        let header = read_response_header(&mut cursor).unwrap();
        assert_eq!(header.cmd, CMD_BYE);
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn test_headers_are_little_endian() {
        let mut wire = Vec::new();
        write_request(&mut wire, CMD_HELLO, &[]).unwrap();
        assert_eq!(&wire[0..4], b"USRC");
        assert_eq!(&wire[4..8], b"HELO");
        assert_eq!(&wire[8..12], &[0, 0, 0, 0]);
    }
}
