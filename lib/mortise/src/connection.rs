//! A single socket driven through its codec: handshake accumulation while
//! negotiating, fixed-size framing once open, a closed terminal state. All
//! buffering is bounded and owned by the connection; the readiness loop
//! above only decides when `recv` runs.

use crate::buffer::{HandshakeBuffer, ProtocolBuffer, HANDSHAKE_BUFFER_SIZE};
use crate::codec::Protocol;
use crate::shared::{NetError, NetResult, RecvError};
use mio;
use mio::net::TcpStream;
use std::cmp;
use std::io;
use std::io::{Read, Write};
use std::net::Shutdown;
use tenon::logging;
use tenon::logging::Logger;

// Carried-over bytes can satisfy several chunks back to back (a peer that
// pipelines its whole handshake); bound the chain within one recv call.
const MAX_CHAINED_STEPS: usize = 8;

enum State {
    Init(HandshakeBuffer),
    Open(ProtocolBuffer),
    Closed,
}

/// What a single `recv` produced.
#[derive(Debug, Eq, PartialEq)]
pub enum Incoming<'a, T> {
    /// Nothing actionable yet; wait for more readiness.
    Pending,
    /// The handshake just completed with the codec's finalization value.
    Open(T),
    /// One decoded message body.
    Payload(&'a [u8]),
}

pub struct Connection<P: Protocol> {
    stream: Option<TcpStream>,
    codec: P,
    state: State,
    body_len: usize,
    log: Logger,
}

impl<P: Protocol> Connection<P> {
    /// Wraps a freshly accepted stream. The codec decides the size of the
    /// first inbound chunk; zero opens the channel on the spot.
    pub fn accept<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        args: &P::Args,
        body_len: usize,
        log: L,
    ) -> Connection<P> {
        let log = logging::child(log);

        let (codec, next_len) = P::accept(args);

        let state = if next_len == 0 {
            State::Open(ProtocolBuffer::new(P::header_in_len(body_len), body_len))
        } else {
            let mut buffer = HandshakeBuffer::new();
            buffer.resize(next_len);
            State::Init(buffer)
        };

        logging::debug!(log, "connection accepted"; "context" => "accept", "first_read" => next_len);

        Connection {
            stream: Some(stream),
            codec,
            state,
            body_len,
            log,
        }
    }

    /// Wraps an initiating stream and sends the codec's opening chunk. The
    /// whole chunk must go out in one write or the connection is dead on
    /// arrival.
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        args: &P::Args,
        body_len: usize,
        log: L,
    ) -> Result<Connection<P>, NetError> {
        let log = logging::child(log);

        let mut first_chunk = [0u8; HANDSHAKE_BUFFER_SIZE];
        let (codec, event) = P::connect(args, &mut first_chunk);

        if event.out_len > 0 && !send_all(&stream, &first_chunk[..event.out_len]) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(NetError::Closed);
        }

        let state = if event.next_len == 0 {
            State::Open(ProtocolBuffer::new(P::header_in_len(body_len), body_len))
        } else {
            let mut buffer = HandshakeBuffer::new();
            buffer.resize(event.next_len);
            State::Init(buffer)
        };

        logging::debug!(log, "connection initiated";
                        "context" => "connect",
                        "sent" => event.out_len,
                        "first_read" => event.next_len);

        Ok(Connection {
            stream: Some(stream),
            codec,
            state,
            body_len,
            log,
        })
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        match self.state {
            State::Init(_) => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        match self.state {
            State::Open(_) => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        match self.state {
            State::Closed => true,
            _ => false,
        }
    }

    /// The codec's finalization value. Only meaningful once open.
    #[inline]
    pub fn output(&self) -> P::Output {
        self.codec.output()
    }

    /// Registers the connection's socket for read readiness.
    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        poll.register(
            self.stream.as_ref().expect("Cannot register a closed connection"),
            token,
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )
    }

    /// Frames and transmits one message body. A short write closes the
    /// connection.
    pub fn send(&mut self, body: &[u8]) -> NetResult<()> {
        match self.state {
            State::Closed => return Err(NetError::Closed),
            State::Init(_) => return Err(NetError::NotReady),
            State::Open(_) => {}
        }

        debug_assert_eq!(body.len(), self.body_len);

        let mut frame = ProtocolBuffer::new(P::header_out_len(self.body_len), self.body_len);
        {
            let (header, frame_body) = frame.split_mut();
            frame_body.copy_from_slice(body);
            self.codec.encode(header, frame_body);
        }

        let sent = {
            let stream = self.stream.as_ref().expect("Open connection must have a stream");
            send_all(stream, frame.frame())
        };

        if !sent {
            logging::debug!(self.log, "short write, closing"; "context" => "send");
            self.close();
            return Err(NetError::Closed);
        }

        logging::trace!(self.log, "frame sent"; "context" => "send", "frame_len" => frame.frame().len());

        Ok(())
    }

    /// Reads once from the socket and advances the state machine. Produces
    /// at most one event; the readiness loop calls this again while the
    /// socket stays readable.
    pub fn recv(&mut self) -> Result<Incoming<P::Output>, RecvError> {
        match self.state {
            State::Closed => Err(RecvError::Closed),
            State::Init(_) => self.recv_handshake(),
            State::Open(_) => self.recv_frame(),
        }
    }

    /// Closes the socket and parks the state machine. Subsequent calls are
    /// no-ops; the socket is shut down exactly once.
    pub fn close(&mut self) {
        match self.state {
            State::Closed => return,
            _ => {}
        }

        self.state = State::Closed;

        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        logging::debug!(self.log, "connection closed"; "context" => "close");
    }

    fn recv_handshake(&mut self) -> Result<Incoming<P::Output>, RecvError> {
        match self.fill(false) {
            Fill::Eof => {
                self.close();
                return Err(RecvError::Closed);
            }
            Fill::Blocked => return Ok(Incoming::Pending),
            Fill::Progress(count) => {
                if let State::Init(buffer) = &mut self.state {
                    buffer.advance(count);
                }
            }
        }

        let mut scratch = [0u8; HANDSHAKE_BUFFER_SIZE];

        for _ in 0..MAX_CHAINED_STEPS {
            let step = {
                let buffer = match &mut self.state {
                    State::Init(buffer) => buffer,
                    _ => unreachable!(),
                };
                self.codec.handshake(&mut scratch, buffer.filled_mut())
            };

            let event = match step {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(Incoming::Pending),
                Err(error) => {
                    logging::debug!(self.log, "handshake rejected";
                                    "context" => "handshake",
                                    "error" => ?error);
                    self.close();
                    return Err(RecvError::Handshake(error));
                }
            };

            if event.out_len > 0 {
                let sent = {
                    let stream = self.stream.as_ref().expect("Handshaking connection must have a stream");
                    send_all(stream, &scratch[..event.out_len])
                };

                if !sent {
                    self.close();
                    return Err(RecvError::Closed);
                }
            }

            if event.next_len == 0 {
                self.state = State::Open(ProtocolBuffer::new(
                    P::header_in_len(self.body_len),
                    self.body_len,
                ));

                logging::debug!(self.log, "channel open"; "context" => "handshake");

                return Ok(Incoming::Open(self.codec.output()));
            }

            let satisfied = {
                let buffer = match &mut self.state {
                    State::Init(buffer) => buffer,
                    _ => unreachable!(),
                };

                if event.rem_len > 0 {
                    buffer.carry_over(event.rem_len);
                }
                // A pipelining peer can leave more carried bytes than the
                // next chunk needs; the target must cover them all.
                buffer.resize(cmp::max(event.next_len, event.rem_len));
                buffer.seek(event.rem_len);

                buffer.write_slice().is_empty()
            };

            // Only keep feeding the codec while the carried bytes already
            // cover the next chunk.
            if !satisfied {
                return Ok(Incoming::Pending);
            }
        }

        Ok(Incoming::Pending)
    }

    fn recv_frame(&mut self) -> Result<Incoming<P::Output>, RecvError> {
        match self.fill(true) {
            Fill::Eof => {
                self.close();
                return Err(RecvError::Closed);
            }
            Fill::Blocked => return Ok(Incoming::Pending),
            Fill::Progress(count) => {
                if let State::Open(buffer) = &mut self.state {
                    buffer.advance(count);
                }
            }
        }

        let full = match &self.state {
            State::Open(buffer) => buffer.is_full(),
            _ => unreachable!(),
        };

        if !full {
            return Ok(Incoming::Pending);
        }

        let decoded = {
            let buffer = match &mut self.state {
                State::Open(buffer) => buffer,
                _ => unreachable!(),
            };
            let (header, body) = buffer.split_mut();
            self.codec.decode(header, body)
        };

        if let Err(error) = decoded {
            logging::debug!(self.log, "frame rejected"; "context" => "decode", "error" => ?error);
            self.close();
            return Err(RecvError::Frame(error));
        }

        match &self.state {
            State::Open(buffer) => Ok(Incoming::Payload(buffer.body())),
            _ => unreachable!(),
        }
    }

    /// One read into whichever buffer the state carries. `framing` selects
    /// the open-state buffer and resets it at frame boundaries.
    fn fill(&mut self, framing: bool) -> Fill {
        let stream = self.stream.as_ref().expect("Receiving connection must have a stream");

        let space = match &mut self.state {
            State::Init(buffer) if !framing => buffer.write_slice(),
            State::Open(buffer) if framing => {
                if buffer.is_full() {
                    buffer.clear();
                }
                buffer.write_slice()
            }
            _ => unreachable!(),
        };

        if space.is_empty() {
            // A fully carried-over chunk; nothing to read before feeding.
            return Fill::Progress(0);
        }

        let mut reader = stream;
        match reader.read(space) {
            Ok(0) => Fill::Eof,
            Ok(count) => Fill::Progress(count),
            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => Fill::Blocked,
            Err(_) => Fill::Eof,
        }
    }
}

enum Fill {
    Progress(usize),
    Blocked,
    Eof,
}

/// How a recv outcome routes through a poll loop, with the connection
/// borrow already released.
pub(crate) enum Routed<T, M> {
    /// Nothing to deliver.
    Skip,
    /// Handshake completed with the codec's finalization value.
    Opened(T),
    /// A decoded and parsed application message.
    Message(M),
    /// The body decoded but did not parse; the connection stays open.
    BadMessage(crate::shared::PayloadError),
    /// An open connection ended; the user is told.
    CloseNotify,
    /// A negotiating connection failed; it is reaped silently.
    Discard,
}

/// Transmits the whole slice in a single write. Anything less, including
/// `WouldBlock`, counts as a short write.
fn send_all(stream: &TcpStream, bytes: &[u8]) -> bool {
    let mut writer = stream;
    match writer.write(bytes) {
        Ok(count) => count == bytes.len(),
        Err(_) => false,
    }
}
