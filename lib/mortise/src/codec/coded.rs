//! Shared-code channel. Both peers exchange a 16-byte code in the clear;
//! a mismatch severs the connection. Data frames pass through untouched.

use crate::codec::{HandshakeEvent, Protocol};
use crate::shared::{FrameError, HandshakeError};

pub const CODE_SIZE: usize = 16;

pub struct Coded {
    code: [u8; CODE_SIZE],
    sent: bool,
}

impl Protocol for Coded {
    type Args = [u8; CODE_SIZE];
    type Output = ();

    #[inline]
    fn header_in_len(_body_len: usize) -> usize {
        0
    }

    #[inline]
    fn header_out_len(_body_len: usize) -> usize {
        0
    }

    #[inline]
    fn min_handshake_space() -> usize {
        CODE_SIZE
    }

    fn accept(args: &Self::Args) -> (Coded, usize) {
        let codec = Coded {
            code: *args,
            sent: false,
        };

        (codec, CODE_SIZE)
    }

    fn connect(args: &Self::Args, out: &mut [u8]) -> (Coded, HandshakeEvent) {
        let codec = Coded {
            code: *args,
            sent: true,
        };

        out[..CODE_SIZE].copy_from_slice(args);

        (codec, HandshakeEvent::new(CODE_SIZE, CODE_SIZE, 0))
    }

    fn handshake(
        &mut self,
        out: &mut [u8],
        input: &mut [u8],
    ) -> Result<Option<HandshakeEvent>, HandshakeError> {
        if input.len() < CODE_SIZE {
            return Ok(None);
        }

        if input[..CODE_SIZE] != self.code {
            return Err(HandshakeError::WrongCode);
        }

        let out_len = if self.sent {
            0
        } else {
            out[..CODE_SIZE].copy_from_slice(&self.code);
            self.sent = true;
            CODE_SIZE
        };

        Ok(Some(HandshakeEvent::new(out_len, 0, 0)))
    }

    #[inline]
    fn output(&self) -> () {}

    #[inline]
    fn encode(&mut self, _header: &mut [u8], _body: &mut [u8]) {}

    #[inline]
    fn decode(&mut self, _header: &mut [u8], _body: &mut [u8]) -> Result<(), FrameError> {
        Ok(())
    }
}
