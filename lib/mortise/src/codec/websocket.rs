//! Server-side websocket channel: an HTTP/1.1 upgrade followed by
//! single-fragment binary data frames.
//!
//! Frame head, from RFC 6455 §5:
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```
//!
//! Client-to-server frames carry a 4-byte mask key after the length field;
//! server-to-client frames are unmasked, which is why the inbound and
//! outbound header sizes differ. The 64-bit extended length form is
//! rejected outright: message sizes are fixed and small.

use crate::buffer::HANDSHAKE_BUFFER_SIZE;
use crate::codec::{HandshakeEvent, Protocol};
use crate::shared::{FrameError, HandshakeError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use sha1::{Digest, Sha1};

pub const KEY_SIZE: usize = 24;
pub const ACCEPT_SIZE: usize = 28;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const RESPONSE_PREFIX: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: ";

// Required pieces of the upgrade request, tracked as a bitmask.
const FOUND_REQUEST_LINE: u8 = 1 << 0;
const FOUND_VERSION: u8 = 1 << 1;
const FOUND_CONNECTION: u8 = 1 << 2;
const FOUND_KEY: u8 = 1 << 3;
const FOUND_UPGRADE: u8 = 1 << 4;
const FOUND_ALL: u8 = 31;

pub struct Websocket {
    headers_found: u8,
    key: [u8; KEY_SIZE],
}

impl Websocket {
    fn new() -> Websocket {
        Websocket {
            headers_found: 0,
            key: [0; KEY_SIZE],
        }
    }

    fn process_request_line(&mut self, line: &[u8]) -> Result<(), HandshakeError> {
        let tail = line.len().checked_sub(8).map(|start| &line[start..]);

        match tail {
            Some(tail) if tail.eq_ignore_ascii_case(b"http/1.1") => {
                self.headers_found |= FOUND_REQUEST_LINE;
                Ok(())
            }
            _ => Err(HandshakeError::InvalidRequest),
        }
    }

    fn process_header_line(&mut self, line: &[u8]) -> Result<(), HandshakeError> {
        let colon = match line.iter().position(|&byte| byte == b':') {
            Some(colon) => colon,
            None => return Err(HandshakeError::InvalidHeader),
        };

        let name = trim(&line[..colon]);
        let value = trim(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"upgrade") {
            if !value.eq_ignore_ascii_case(b"websocket") {
                return Err(HandshakeError::InvalidUpgrade);
            }
            self.headers_found |= FOUND_UPGRADE;
        } else if name.eq_ignore_ascii_case(b"sec-websocket-version") {
            if value != b"13" {
                return Err(HandshakeError::InvalidVersion);
            }
            self.headers_found |= FOUND_VERSION;
        } else if name.eq_ignore_ascii_case(b"connection") {
            if !contains_ignore_ascii_case(value, b"upgrade") {
                return Err(HandshakeError::InvalidConnection);
            }
            self.headers_found |= FOUND_CONNECTION;
        } else if name.eq_ignore_ascii_case(b"sec-websocket-key") {
            if value.len() != KEY_SIZE {
                return Err(HandshakeError::InvalidKey);
            }
            self.key.copy_from_slice(value);
            self.headers_found |= FOUND_KEY;
        }

        Ok(())
    }

    fn write_response(&self, out: &mut [u8]) -> usize {
        let accept = derive_accept_key(&self.key);

        let mut cursor = 0;
        out[..RESPONSE_PREFIX.len()].copy_from_slice(RESPONSE_PREFIX);
        cursor += RESPONSE_PREFIX.len();
        out[cursor..cursor + ACCEPT_SIZE].copy_from_slice(&accept);
        cursor += ACCEPT_SIZE;
        out[cursor..cursor + 4].copy_from_slice(b"\r\n\r\n");
        cursor + 4
    }
}

impl Protocol for Websocket {
    type Args = ();
    type Output = ();

    #[inline]
    fn header_in_len(body_len: usize) -> usize {
        if body_len <= 125 {
            6
        } else {
            8
        }
    }

    #[inline]
    fn header_out_len(body_len: usize) -> usize {
        if body_len <= 125 {
            2
        } else {
            4
        }
    }

    #[inline]
    fn min_handshake_space() -> usize {
        HANDSHAKE_BUFFER_SIZE
    }

    fn accept(_args: &Self::Args) -> (Websocket, usize) {
        (Websocket::new(), Self::min_handshake_space())
    }

    fn connect(_args: &Self::Args, _out: &mut [u8]) -> (Websocket, HandshakeEvent) {
        unimplemented!("client-side websocket upgrade is not supported")
    }

    fn handshake(
        &mut self,
        out: &mut [u8],
        input: &mut [u8],
    ) -> Result<Option<HandshakeEvent>, HandshakeError> {
        let mut start = 0;

        loop {
            let line_end = match find_line_break(&input[start..])? {
                Some(relative) => start + relative,
                None => break,
            };

            let consumed = line_end + 2;

            if line_end == start {
                // Empty line. Leading ones are tolerated; otherwise the
                // header block just ended.
                if self.headers_found == 0 {
                    start = consumed;
                    continue;
                }

                if self.headers_found != FOUND_ALL {
                    return Err(HandshakeError::MissingLine);
                }

                let out_len = self.write_response(out);

                return Ok(Some(HandshakeEvent::new(
                    out_len,
                    0,
                    input.len() - consumed,
                )));
            }

            let line = &input[start..line_end];

            if self.headers_found & FOUND_REQUEST_LINE == 0 {
                self.process_request_line(line)?;
            } else {
                self.process_header_line(line)?;
            }

            start = consumed;
        }

        if start > 0 {
            // Whole lines were consumed; hand the partial tail back so the
            // buffer can make room for the rest of the request.
            return Ok(Some(HandshakeEvent::new(
                0,
                Self::min_handshake_space(),
                input.len() - start,
            )));
        }

        if input.len() >= Self::min_handshake_space() {
            // A header line as large as the whole scratch area. Ask for the
            // same buffer again; the peer either completes a line or times out.
            return Ok(Some(HandshakeEvent::new(
                0,
                Self::min_handshake_space(),
                input.len(),
            )));
        }

        Ok(None)
    }

    #[inline]
    fn output(&self) -> () {}

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        write_frame_header(header, body.len());
    }

    fn decode(&mut self, header: &mut [u8], body: &mut [u8]) -> Result<(), FrameError> {
        let mask = read_frame_header(header, body.len())?;
        unmask(&mask, body, 0);
        Ok(())
    }
}

/// `sec-websocket-accept` for a raw `sec-websocket-key` value.
fn derive_accept_key(key: &[u8; KEY_SIZE]) -> [u8; ACCEPT_SIZE] {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(GUID);
    let digest = sha1.finalize();

    let mut output = [0u8; ACCEPT_SIZE];
    STANDARD
        .encode_slice(digest, &mut output)
        .expect("Error encoding accept key");
    output
}

/// Finds the next `\r\n`. A `\r` followed by anything else is malformed;
/// a trailing `\r` is just an incomplete line.
fn find_line_break(bytes: &[u8]) -> Result<Option<usize>, HandshakeError> {
    match bytes.iter().position(|&byte| byte == b'\r') {
        Some(index) if index + 1 >= bytes.len() => Ok(None),
        Some(index) if bytes[index + 1] == b'\n' => Ok(Some(index)),
        Some(_) => Err(HandshakeError::InvalidLineBreak),
        None => Ok(None),
    }
}

#[inline]
fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&byte| byte != b' ' && byte != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&byte| byte != b' ' && byte != b'\t')
        .map(|index| index + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[inline]
fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Writes an unmasked single-fragment binary frame head for a payload of
/// the given size. The header slice must be `header_out_len` bytes.
pub(crate) fn write_frame_header(header: &mut [u8], payload_len: usize) {
    // FIN plus binary opcode.
    header[0] = 0x82;

    if payload_len <= 125 {
        header[1] = payload_len as u8;
    } else {
        header[1] = 126;
        BigEndian::write_u16(&mut header[2..4], payload_len as u16);
    }
}

/// Validates a masked single-fragment binary frame head against the fixed
/// payload size and returns the mask key.
pub(crate) fn read_frame_header(header: &[u8], payload_len: usize) -> Result<[u8; 4], FrameError> {
    let flags = header[0];
    let length_byte = header[1];

    if flags & 0x80 == 0 {
        return Err(FrameError::MultiFrameMessage);
    }

    if flags & 0x70 != 0 {
        return Err(FrameError::ReservedBitSet);
    }

    if flags & 0x0f != 0x2 {
        return Err(FrameError::OpcodeNotBinary);
    }

    if length_byte & 0x80 == 0 {
        return Err(FrameError::NotMasked);
    }

    let short_len = (length_byte & 0x7f) as usize;
    let mut mask = [0u8; 4];

    if short_len == 127 {
        return Err(FrameError::FrameLengthTooLong);
    }

    if short_len == 126 {
        if header.len() != 8 {
            return Err(FrameError::FrameLengthInvalid);
        }

        if BigEndian::read_u16(&header[2..4]) as usize != payload_len {
            return Err(FrameError::FrameLengthInvalid);
        }

        mask.copy_from_slice(&header[4..8]);
    } else {
        if header.len() != 6 || short_len != payload_len {
            return Err(FrameError::FrameLengthInvalid);
        }

        mask.copy_from_slice(&header[2..6]);
    }

    Ok(mask)
}

/// XORs the mask key over a payload slice. `offset` is the slice's position
/// within the whole frame payload, so masking can span disjoint regions.
pub(crate) fn unmask(mask: &[u8; 4], bytes: &mut [u8], offset: usize) {
    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte ^= mask[(offset + index) % 4];
    }
}
