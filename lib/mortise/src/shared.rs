use std::io;
use std::net;

/// Errors surfaced while a connection is still negotiating its channel.
/// Any of these is fatal for the connection that produced it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    /// The peer presented a shared code that does not match ours.
    WrongCode,
    /// Key exchange failed: bad chunk length, invalid signature or a
    /// degenerate Diffie-Hellman contribution.
    Failed,
    /// A header line is not `Name: Value`.
    InvalidHeader,
    /// The `Upgrade` header does not request a websocket.
    InvalidUpgrade,
    /// The `Connection` header does not mention an upgrade.
    InvalidConnection,
    /// A carriage return is not followed by a line feed.
    InvalidLineBreak,
    /// The `Sec-WebSocket-Version` header is not `13`.
    InvalidVersion,
    /// The request line is not an HTTP/1.1 request.
    InvalidRequest,
    /// The `Sec-WebSocket-Key` value is not exactly 24 bytes.
    InvalidKey,
    /// The header block ended before every required header was seen.
    MissingLine,
}

/// Errors produced while decoding a single data frame on an open channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    /// The length field contradicts the fixed message size.
    FrameLengthInvalid,
    /// The frame declares a 64-bit extended length.
    FrameLengthTooLong,
    /// A client-to-server frame arrived without a mask.
    NotMasked,
    /// One of the reserved header bits is set.
    ReservedBitSet,
    /// The frame opcode is not binary.
    OpcodeNotBinary,
    /// The frame is a fragment of a larger message.
    MultiFrameMessage,
    /// Authentication of the ciphertext failed.
    MessageCorrupted,
}

/// Error produced when a decoded body does not parse as the application
/// message type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PayloadError {
    UnexpectedData,
}

/// Terminal outcomes of `Connection::recv`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    /// Peer EOF, a failed syscall, a short write on a handshake reply, or
    /// an operation on an already closed connection.
    Closed,
    /// The codec rejected the handshake; the connection has been closed.
    Handshake(HandshakeError),
    /// The codec rejected a data frame; the connection has been closed.
    Frame(FrameError),
}

/// Admission and lifecycle errors reported by `Server` and `Client`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetError {
    AlreadyListening,
    NotListening,
    AlreadyConnected,
    NotConnected,
    InvalidHandle,
    HandshakeQueueFull,
    OutOfSpace,
    /// Send attempted before the handshake completed.
    NotReady,
    /// The connection is gone; a failed send also closes it.
    Closed,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        NetError::Io(io_error.kind())
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::AddrParse
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// An application message with a compile-time-fixed wire size.
///
/// `serialize` and `deserialize` must form a bijection on well-formed
/// values; the transport never interprets the bytes in between.
pub trait Payload: Sized {
    /// Serialized size in bytes. Both slices handed to the trait methods
    /// are exactly this long.
    const SIZE: usize;

    fn serialize(&self, stream: &mut [u8]);

    fn deserialize(stream: &[u8]) -> Result<Self, PayloadError>;
}
