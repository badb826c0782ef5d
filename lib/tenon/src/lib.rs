//! Shared infrastructure for the mortise connection server: thin safe
//! wrappers over the libsodium primitives and the logging plumbing.
//!
//! Everything in here is deliberately free of protocol knowledge. The
//! wire formats, handshake state machines and framing live in the
//! `mortise` crate; this crate only guarantees that the primitives they
//! rely on have the exact shapes they expect.

pub mod crypto;
pub mod logging;
