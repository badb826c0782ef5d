//! A small, statically sized connection server for interactive multiplayer
//! sessions. The core principle is to avoid allocations at all costs: every
//! connection lives in a fixed pool, every buffer is bounded, and all framing
//! happens in place.
//!
//! The main components, leaf to root:
//!
//! - `Pool` and `Ring`, fixed-capacity storage with stable handles.
//! - `HandshakeBuffer` and `ProtocolBuffer`, the bounded per-connection
//!   scratch areas.
//! - The codecs (`Coded`, `Ae`, `Websocket`, `Websockify`), which own the
//!   channel upgrade and the per-frame transforms.
//! - `Connection`, the per-socket state machine.
//! - `Server` and `Client`, which drive many (or one) of those state
//!   machines from a single readiness poll.
//!
//! The principles are the following:
//!
//! 1. All communication is over TCP; messages have a fixed serialized size
//!    known at compile time, so framing never needs length negotiation.
//! 2. Clients can authenticate with a signed ephemeral key exchange; after
//!    that every frame is sealed and tampering closes the connection.
//! 3. Browser clients speak the same protocols tunneled through binary
//!    websocket frames, bit-exactly.
//! 4. Extremely strict validation in a fail fast manner: any malformed
//!    frame or handshake chunk results in the connection being severed.
//!
//! The server loop is single threaded and cooperative. One readiness
//! descriptor multiplexes the listener and every connection; the only
//! blocking point is the bounded wait inside `poll`.

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod pool;
pub mod server;
pub mod shared;

pub use crate::client::Client;
pub use crate::codec::{Ae, Coded, HandshakeEvent, Protocol, Websocket, Websockify};
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::connection::{Connection, Incoming};
pub use crate::pool::{Handle, Pool, Ring};
pub use crate::server::Server;
pub use crate::shared::{
    FrameError, HandshakeError, NetError, NetResult, Payload, PayloadError, RecvError,
};
