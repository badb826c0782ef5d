//! Composition that tunnels an inner codec through websocket frames. The
//! acceptor first performs the HTTP upgrade, then every inner handshake
//! chunk and every inner data frame travels inside exactly one binary
//! websocket frame, with no intermediate copies.

use crate::codec::{websocket, HandshakeEvent, Protocol, Websocket};
use crate::shared::{FrameError, HandshakeError};
use std::cmp;

// Outbound inner chunks get this much room reserved for the frame head;
// the payload shifts when the extended-length form is needed.
const HEAD_RESERVE: usize = 2;

pub enum Websockify<Inner: Protocol> {
    /// HTTP upgrade in progress. The inner arguments are retained so the
    /// inner codec can be brought up once the upgrade response is out.
    Upgrade { ws: Websocket, args: Inner::Args },
    /// Upgrade finished; inner chunks ride in binary frames. `inner_next`
    /// tracks the inner chunk size behind the composite read target.
    Tunnel { inner: Inner, inner_next: usize },
}

impl<Inner: Protocol> Websockify<Inner> {
    fn tunnel_step(
        inner: &mut Inner,
        inner_next: &mut usize,
        out: &mut [u8],
        input: &mut [u8],
    ) -> Result<Option<HandshakeEvent>, HandshakeError> {
        let head_len = Websocket::header_in_len(*inner_next);

        if input.len() < head_len + *inner_next {
            return Ok(None);
        }

        // Bytes past this frame belong to the next one and are carried over.
        let extra = input.len() - (head_len + *inner_next);

        let (head, rest) = input.split_at_mut(head_len);
        let payload = &mut rest[..*inner_next];

        // A malformed frame at this stage sinks the handshake.
        let mask =
            websocket::read_frame_header(head, payload.len()).map_err(|_| HandshakeError::Failed)?;
        websocket::unmask(&mask, payload, 0);

        let event = match inner.handshake(&mut out[HEAD_RESERVE..], payload)? {
            Some(event) => event,
            None => return Ok(None),
        };

        let mut out_len = 0;
        if event.out_len > 0 {
            let head_len = Websocket::header_out_len(event.out_len);

            if head_len != HEAD_RESERVE {
                out.copy_within(HEAD_RESERVE..HEAD_RESERVE + event.out_len, head_len);
            }

            websocket::write_frame_header(&mut out[..head_len], event.out_len);
            out_len = head_len + event.out_len;
        }

        let next_len = if event.next_len > 0 {
            *inner_next = event.next_len;
            event.next_len + Websocket::header_in_len(event.next_len)
        } else {
            0
        };

        Ok(Some(HandshakeEvent::new(out_len, next_len, event.rem_len + extra)))
    }
}

impl<Inner: Protocol> Protocol for Websockify<Inner> {
    type Args = Inner::Args;
    type Output = Inner::Output;

    #[inline]
    fn header_in_len(body_len: usize) -> usize {
        let inner = Inner::header_in_len(body_len);
        Websocket::header_in_len(inner + body_len) + inner
    }

    #[inline]
    fn header_out_len(body_len: usize) -> usize {
        let inner = Inner::header_out_len(body_len);
        Websocket::header_out_len(inner + body_len) + inner
    }

    #[inline]
    fn min_handshake_space() -> usize {
        cmp::max(
            Websocket::min_handshake_space(),
            Inner::min_handshake_space() + 8,
        )
    }

    fn accept(args: &Self::Args) -> (Websockify<Inner>, usize) {
        let (ws, next_len) = Websocket::accept(&());

        let composed = Websockify::Upgrade {
            ws,
            args: args.clone(),
        };

        (composed, next_len)
    }

    fn connect(_args: &Self::Args, _out: &mut [u8]) -> (Websockify<Inner>, HandshakeEvent) {
        unimplemented!("client-side websocket upgrade is not supported")
    }

    fn handshake(
        &mut self,
        out: &mut [u8],
        input: &mut [u8],
    ) -> Result<Option<HandshakeEvent>, HandshakeError> {
        match self {
            Websockify::Upgrade { ws, args } => {
                let event = match ws.handshake(out, input)? {
                    Some(event) => event,
                    None => return Ok(None),
                };

                // The tag only flips once the upgrade response has actually
                // been produced.
                if !event.is_complete() || event.out_len == 0 {
                    return Ok(Some(event));
                }

                let (inner, inner_next) = Inner::accept(args);
                let next_len = inner_next + Websocket::header_in_len(inner_next);

                *self = Websockify::Tunnel { inner, inner_next };

                Ok(Some(HandshakeEvent::new(
                    event.out_len,
                    next_len,
                    event.rem_len,
                )))
            }
            Websockify::Tunnel { inner, inner_next } => {
                Self::tunnel_step(inner, inner_next, out, input)
            }
        }
    }

    fn output(&self) -> Self::Output {
        match self {
            Websockify::Tunnel { inner, .. } => inner.output(),
            Websockify::Upgrade { .. } => panic!("Handshake is not complete"),
        }
    }

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        let inner = match self {
            Websockify::Tunnel { inner, .. } => inner,
            Websockify::Upgrade { .. } => panic!("Channel is not open"),
        };

        let inner_head_len = Inner::header_out_len(body.len());
        let frame_len = inner_head_len + body.len();
        let ws_head_len = Websocket::header_out_len(frame_len);

        let (ws_head, inner_head) = header.split_at_mut(ws_head_len);

        inner.encode(inner_head, body);
        websocket::write_frame_header(ws_head, frame_len);
    }

    fn decode(&mut self, header: &mut [u8], body: &mut [u8]) -> Result<(), FrameError> {
        let inner = match self {
            Websockify::Tunnel { inner, .. } => inner,
            Websockify::Upgrade { .. } => panic!("Channel is not open"),
        };

        let inner_head_len = Inner::header_in_len(body.len());
        let frame_len = inner_head_len + body.len();
        let ws_head_len = Websocket::header_in_len(frame_len);

        let (ws_head, inner_head) = header.split_at_mut(ws_head_len);

        let mask = websocket::read_frame_header(ws_head, frame_len)?;
        websocket::unmask(&mask, inner_head, 0);
        websocket::unmask(&mask, body, inner_head.len());

        inner.decode(inner_head, body)
    }
}
