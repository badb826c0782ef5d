//! Authenticated encrypted channel. Each side contributes an ephemeral
//! X25519 key and a 32-byte nonce, signs its own contribution with its
//! long-term Ed25519 identity, and derives a session key from the DH shared
//! secret and both contributions. Data frames are XChaCha20-Poly1305 sealed
//! with a fresh random nonce per frame.
//!
//! Wire layout, both directions:
//!
//! - key chunk (64 bytes): the acceptor sends `nonce[32], key[32]`, the
//!   initiator sends `key[32], nonce[32]`. The asymmetry lets each side
//!   sign the exact bytes it put on the wire.
//! - signature chunk (96 bytes): `signature[64], verify_key[32]`.
//! - data frame: `nonce[24], mac[16], ciphertext[body]`.

use crate::codec::{HandshakeEvent, Protocol};
use crate::shared::{FrameError, HandshakeError};
use tenon::crypto;
use tenon::crypto::SignKeyPair;

/// Size of a key-exchange chunk: one DH public key and one nonce.
pub const KEYS_CHUNK_SIZE: usize = crypto::DH_KEY_SIZE + HALF_NONCE_SIZE;
/// Size of a signature chunk: detached signature plus verification key.
pub const SIG_CHUNK_SIZE: usize = crypto::SIGNATURE_SIZE + crypto::SIGN_PUBLIC_KEY_SIZE;
/// Per-frame prefix: random nonce followed by the MAC.
pub const DATA_HEADER_SIZE: usize = crypto::NONCE_SIZE + crypto::MAC_SIZE;

const HALF_NONCE_SIZE: usize = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Stage {
    None,
    Keys,
    Signature,
}

impl Stage {
    #[inline]
    fn chunk_len(self) -> usize {
        match self {
            Stage::None => 0,
            Stage::Keys => KEYS_CHUNK_SIZE,
            Stage::Signature => SIG_CHUNK_SIZE,
        }
    }
}

pub struct Ae {
    local: SignKeyPair,
    scalar: [u8; crypto::DH_SCALAR_SIZE],

    accept_nonce: [u8; HALF_NONCE_SIZE],
    accept_dh: [u8; crypto::DH_KEY_SIZE],
    connect_nonce: [u8; HALF_NONCE_SIZE],
    connect_dh: [u8; crypto::DH_KEY_SIZE],

    foreign_eddsa: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    shared_key: [u8; crypto::KEY_SIZE],

    sending: Stage,
    awaiting: Stage,
    accepting: bool,
}

impl Ae {
    fn new(args: &SignKeyPair, accepting: bool) -> Ae {
        let mut codec = Ae {
            local: args.clone(),
            scalar: [0; crypto::DH_SCALAR_SIZE],
            accept_nonce: [0; HALF_NONCE_SIZE],
            accept_dh: [0; crypto::DH_KEY_SIZE],
            connect_nonce: [0; HALF_NONCE_SIZE],
            connect_dh: [0; crypto::DH_KEY_SIZE],
            foreign_eddsa: [0; crypto::SIGN_PUBLIC_KEY_SIZE],
            shared_key: [0; crypto::KEY_SIZE],
            sending: Stage::Keys,
            awaiting: Stage::Keys,
            accepting,
        };

        let (nonce, dh) = if accepting {
            (&mut codec.accept_nonce, &mut codec.accept_dh)
        } else {
            (&mut codec.connect_nonce, &mut codec.connect_dh)
        };

        crypto::random_bytes(nonce);

        // Retry until the scalar maps to a usable group element.
        loop {
            crypto::random_bytes(&mut codec.scalar);
            if crypto::dh_public_key(dh, &codec.scalar) {
                break;
            }
        }

        codec
    }

    /// The 64-byte key chunk as the given role put it on the wire.
    fn keys_chunk(&self, accepting: bool) -> [u8; KEYS_CHUNK_SIZE] {
        let mut chunk = [0u8; KEYS_CHUNK_SIZE];

        if accepting {
            chunk[..HALF_NONCE_SIZE].copy_from_slice(&self.accept_nonce);
            chunk[HALF_NONCE_SIZE..].copy_from_slice(&self.accept_dh);
        } else {
            chunk[..crypto::DH_KEY_SIZE].copy_from_slice(&self.connect_dh);
            chunk[crypto::DH_KEY_SIZE..].copy_from_slice(&self.connect_nonce);
        }

        chunk
    }

    fn store_peer_keys(&mut self, input: &[u8]) {
        if self.accepting {
            self.connect_dh.copy_from_slice(&input[..crypto::DH_KEY_SIZE]);
            self.connect_nonce.copy_from_slice(&input[crypto::DH_KEY_SIZE..KEYS_CHUNK_SIZE]);
        } else {
            self.accept_nonce.copy_from_slice(&input[..HALF_NONCE_SIZE]);
            self.accept_dh.copy_from_slice(&input[HALF_NONCE_SIZE..KEYS_CHUNK_SIZE]);
        }
    }

    fn verify_peer_signature(&mut self, input: &[u8]) -> Result<(), HandshakeError> {
        let mut signature = [0u8; crypto::SIGNATURE_SIZE];
        signature.copy_from_slice(&input[..crypto::SIGNATURE_SIZE]);

        let mut verify_key = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
        verify_key.copy_from_slice(&input[crypto::SIGNATURE_SIZE..SIG_CHUNK_SIZE]);

        // The peer signed the key chunk it sent, in its own wire layout.
        let signed = self.keys_chunk(!self.accepting);

        if !crypto::verify(&signature, &signed, &verify_key) {
            return Err(HandshakeError::Failed);
        }

        self.foreign_eddsa = verify_key;
        Ok(())
    }

    fn derive_shared_key(&mut self) -> Result<(), HandshakeError> {
        let peer_dh = if self.accepting {
            &self.connect_dh
        } else {
            &self.accept_dh
        };

        let mut shared = [0u8; crypto::DH_KEY_SIZE];
        if !crypto::dh_shared(&mut shared, &self.scalar, peer_dh) {
            return Err(HandshakeError::Failed);
        }

        // All four handshake contributions feed the derivation. The keyed
        // hash caps its key at 64 bytes, so the accept pair keys the hash
        // and the connect pair rides along with the DH secret as input.
        let mut hash_key = [0u8; crypto::HASH_KEY_SIZE];
        hash_key[..crypto::DH_KEY_SIZE].copy_from_slice(&self.accept_dh);
        hash_key[crypto::DH_KEY_SIZE..].copy_from_slice(&self.accept_nonce);

        let mut material = [0u8; crypto::DH_KEY_SIZE * 2 + HALF_NONCE_SIZE];
        material[..crypto::DH_KEY_SIZE].copy_from_slice(&shared);
        material[crypto::DH_KEY_SIZE..crypto::DH_KEY_SIZE * 2].copy_from_slice(&self.connect_dh);
        material[crypto::DH_KEY_SIZE * 2..].copy_from_slice(&self.connect_nonce);

        if !crypto::keyed_hash(&mut self.shared_key, &material, &hash_key) {
            return Err(HandshakeError::Failed);
        }

        Ok(())
    }

    /// Emits whichever chunk is due and advances the sending stage.
    fn emit(&mut self, out: &mut [u8]) -> usize {
        match self.sending {
            Stage::Keys => {
                let chunk = self.keys_chunk(self.accepting);
                out[..KEYS_CHUNK_SIZE].copy_from_slice(&chunk);
                self.sending = Stage::Signature;
                KEYS_CHUNK_SIZE
            }
            Stage::Signature => {
                let signed = self.keys_chunk(self.accepting);
                let mut signature = [0u8; crypto::SIGNATURE_SIZE];
                crypto::sign(&mut signature, &signed, &self.local);

                out[..crypto::SIGNATURE_SIZE].copy_from_slice(&signature);
                out[crypto::SIGNATURE_SIZE..SIG_CHUNK_SIZE].copy_from_slice(&self.local.public);
                self.sending = Stage::None;
                SIG_CHUNK_SIZE
            }
            Stage::None => 0,
        }
    }
}

impl Protocol for Ae {
    type Args = SignKeyPair;
    type Output = [u8; crypto::SIGN_PUBLIC_KEY_SIZE];

    #[inline]
    fn header_in_len(_body_len: usize) -> usize {
        DATA_HEADER_SIZE
    }

    #[inline]
    fn header_out_len(_body_len: usize) -> usize {
        DATA_HEADER_SIZE
    }

    #[inline]
    fn min_handshake_space() -> usize {
        SIG_CHUNK_SIZE
    }

    fn accept(args: &Self::Args) -> (Ae, usize) {
        (Ae::new(args, true), KEYS_CHUNK_SIZE)
    }

    fn connect(args: &Self::Args, out: &mut [u8]) -> (Ae, HandshakeEvent) {
        let mut codec = Ae::new(args, false);

        let out_len = codec.emit(out);

        (codec, HandshakeEvent::new(out_len, KEYS_CHUNK_SIZE, 0))
    }

    fn handshake(
        &mut self,
        out: &mut [u8],
        input: &mut [u8],
    ) -> Result<Option<HandshakeEvent>, HandshakeError> {
        let expected = self.awaiting.chunk_len();

        if input.len() < expected {
            return Ok(None);
        }

        match self.awaiting {
            Stage::Keys => {
                self.store_peer_keys(input);
                self.awaiting = Stage::Signature;
            }
            Stage::Signature => {
                self.verify_peer_signature(input)?;
                self.derive_shared_key()?;
                self.awaiting = Stage::None;
            }
            Stage::None => return Err(HandshakeError::Failed),
        }

        let out_len = self.emit(out);

        Ok(Some(HandshakeEvent::new(
            out_len,
            self.awaiting.chunk_len(),
            0,
        )))
    }

    #[inline]
    fn output(&self) -> Self::Output {
        self.foreign_eddsa
    }

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let mut mac = [0u8; crypto::MAC_SIZE];
        crypto::seal(body, &mut mac, &nonce, &self.shared_key);

        header[..crypto::NONCE_SIZE].copy_from_slice(&nonce);
        header[crypto::NONCE_SIZE..DATA_HEADER_SIZE].copy_from_slice(&mac);
    }

    fn decode(&mut self, header: &mut [u8], body: &mut [u8]) -> Result<(), FrameError> {
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        nonce.copy_from_slice(&header[..crypto::NONCE_SIZE]);

        let mut mac = [0u8; crypto::MAC_SIZE];
        mac.copy_from_slice(&header[crypto::NONCE_SIZE..DATA_HEADER_SIZE]);

        if !crypto::open(body, &mac, &nonce, &self.shared_key) {
            return Err(FrameError::MessageCorrupted);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (Ae, Ae, SignKeyPair, SignKeyPair) {
        let server_identity = SignKeyPair::generate();
        let client_identity = SignKeyPair::generate();

        let (mut acceptor, first_read) = Ae::accept(&server_identity);
        assert_eq!(first_read, KEYS_CHUNK_SIZE);

        let mut client_chunk = [0u8; SIG_CHUNK_SIZE];
        let (mut initiator, event) = Ae::connect(&client_identity, &mut client_chunk);
        assert_eq!(event, HandshakeEvent::new(KEYS_CHUNK_SIZE, KEYS_CHUNK_SIZE, 0));

        // Acceptor consumes the initiator keys and answers with its own.
        let mut server_chunk = [0u8; SIG_CHUNK_SIZE];
        let event = acceptor
            .handshake(&mut server_chunk, &mut client_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();
        assert_eq!(event, HandshakeEvent::new(KEYS_CHUNK_SIZE, SIG_CHUNK_SIZE, 0));

        // Initiator consumes the acceptor keys and sends its signature.
        let mut client_sig = [0u8; SIG_CHUNK_SIZE];
        let event = initiator
            .handshake(&mut client_sig, &mut server_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();
        assert_eq!(event, HandshakeEvent::new(SIG_CHUNK_SIZE, SIG_CHUNK_SIZE, 0));

        // Acceptor verifies the signature and sends its own.
        let mut server_sig = [0u8; SIG_CHUNK_SIZE];
        let event = acceptor
            .handshake(&mut server_sig, &mut client_sig)
            .unwrap()
            .unwrap();
        assert_eq!(event, HandshakeEvent::new(SIG_CHUNK_SIZE, 0, 0));

        // Initiator verifies; both sides are done.
        let mut sink = [0u8; SIG_CHUNK_SIZE];
        let event = initiator.handshake(&mut sink, &mut server_sig).unwrap().unwrap();
        assert_eq!(event, HandshakeEvent::new(0, 0, 0));

        (acceptor, initiator, server_identity, client_identity)
    }

    #[test]
    fn test_mutual_authentication() {
        let (acceptor, initiator, server_identity, client_identity) = run_handshake();

        assert_eq!(acceptor.shared_key, initiator.shared_key);
        assert_eq!(acceptor.output(), client_identity.public);
        assert_eq!(initiator.output(), server_identity.public);
    }

    #[test]
    fn test_partial_chunks_request_more() {
        let server_identity = SignKeyPair::generate();
        let client_identity = SignKeyPair::generate();

        let (mut acceptor, _) = Ae::accept(&server_identity);

        let mut client_chunk = [0u8; SIG_CHUNK_SIZE];
        let _ = Ae::connect(&client_identity, &mut client_chunk);

        // One byte at a time: the acceptor asks for more until the whole
        // chunk has arrived.
        let mut out = [0u8; SIG_CHUNK_SIZE];
        for split in 0..KEYS_CHUNK_SIZE {
            let mut partial = client_chunk[..split].to_vec();
            assert_eq!(acceptor.handshake(&mut out, &mut partial).unwrap(), None);
        }

        let event = acceptor
            .handshake(&mut out, &mut client_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();
        assert_eq!(event.next_len, SIG_CHUNK_SIZE);
    }

    #[test]
    fn test_tampered_signature_fails() {
        let server_identity = SignKeyPair::generate();
        let client_identity = SignKeyPair::generate();

        let (mut acceptor, _) = Ae::accept(&server_identity);

        let mut client_chunk = [0u8; SIG_CHUNK_SIZE];
        let (mut initiator, _) = Ae::connect(&client_identity, &mut client_chunk);

        let mut server_chunk = [0u8; SIG_CHUNK_SIZE];
        acceptor
            .handshake(&mut server_chunk, &mut client_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();

        let mut client_sig = [0u8; SIG_CHUNK_SIZE];
        initiator
            .handshake(&mut client_sig, &mut server_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();

        client_sig[10] ^= 1;

        let mut sink = [0u8; SIG_CHUNK_SIZE];
        assert_eq!(
            acceptor.handshake(&mut sink, &mut client_sig).unwrap_err(),
            HandshakeError::Failed
        );
    }

    #[test]
    fn test_substituted_verify_key_fails() {
        let server_identity = SignKeyPair::generate();
        let client_identity = SignKeyPair::generate();

        let (mut acceptor, _) = Ae::accept(&server_identity);

        let mut client_chunk = [0u8; SIG_CHUNK_SIZE];
        let (mut initiator, _) = Ae::connect(&client_identity, &mut client_chunk);

        let mut server_chunk = [0u8; SIG_CHUNK_SIZE];
        acceptor
            .handshake(&mut server_chunk, &mut client_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();

        let mut client_sig = [0u8; SIG_CHUNK_SIZE];
        initiator
            .handshake(&mut client_sig, &mut server_chunk[..KEYS_CHUNK_SIZE])
            .unwrap()
            .unwrap();

        // A mismatching identity key cannot vouch for the signed chunk.
        let impostor = SignKeyPair::generate();
        client_sig[crypto::SIGNATURE_SIZE..].copy_from_slice(&impostor.public);

        let mut sink = [0u8; SIG_CHUNK_SIZE];
        assert_eq!(
            acceptor.handshake(&mut sink, &mut client_sig).unwrap_err(),
            HandshakeError::Failed
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut acceptor, mut initiator, _, _) = run_handshake();

        let plain = *b"twenty-two byte body!!";
        let mut header = [0u8; DATA_HEADER_SIZE];
        let mut body = plain;

        initiator.encode(&mut header, &mut body);
        assert_ne!(body, plain);

        acceptor.decode(&mut header, &mut body).unwrap();
        assert_eq!(body, plain);
    }

    #[test]
    fn test_frame_bit_flips_are_rejected() {
        let (mut acceptor, mut initiator, _, _) = run_handshake();

        let plain = *b"twenty-two byte body!!";

        for flip_header in &[true, false] {
            let mut header = [0u8; DATA_HEADER_SIZE];
            let mut body = plain;
            initiator.encode(&mut header, &mut body);

            if *flip_header {
                header[30] ^= 1;
            } else {
                body[5] ^= 1;
            }

            assert_eq!(
                acceptor.decode(&mut header, &mut body).unwrap_err(),
                FrameError::MessageCorrupted
            );
        }
    }

    #[test]
    fn test_distinct_sessions_do_not_interoperate() {
        let (mut first_acceptor, _, _, _) = run_handshake();
        let (_, mut second_initiator, _, _) = run_handshake();

        let mut header = [0u8; DATA_HEADER_SIZE];
        let mut body = *b"twenty-two byte body!!";
        second_initiator.encode(&mut header, &mut body);

        assert_eq!(
            first_acceptor.decode(&mut header, &mut body).unwrap_err(),
            FrameError::MessageCorrupted
        );
    }
}
