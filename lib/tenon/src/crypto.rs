use ctor::ctor;
use libsodium_sys;

pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_KEYBYTES as usize;
pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_ABYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_NPUBBYTES as usize;

pub const SIGN_PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;

pub const DH_KEY_SIZE: usize = libsodium_sys::crypto_scalarmult_BYTES as usize;
pub const DH_SCALAR_SIZE: usize = libsodium_sys::crypto_scalarmult_SCALARBYTES as usize;

pub const HASH_SIZE: usize = 32;
pub const HASH_KEY_SIZE: usize = 64;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Long-term Ed25519 identity. The public half doubles as the identity
/// value surfaced to the peer once a handshake completes.
#[derive(Clone)]
pub struct SignKeyPair {
    pub public: [u8; SIGN_PUBLIC_KEY_SIZE],
    secret: [u8; SIGN_SECRET_KEY_SIZE],
}

impl SignKeyPair {
    /// Generates a fresh random key pair.
    #[inline]
    pub fn generate() -> SignKeyPair {
        let mut public = [0u8; SIGN_PUBLIC_KEY_SIZE];
        let mut secret = [0u8; SIGN_SECRET_KEY_SIZE];

        unsafe {
            libsodium_sys::crypto_sign_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
        }

        SignKeyPair { public, secret }
    }
}

/// Encrypts the body in place and writes the detached MAC into `mac`. The nonce and key
/// must match those used for decryption. No additional data is authenticated.
#[inline]
pub fn seal(body: &mut [u8], mac: &mut [u8; MAC_SIZE], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_encrypt_detached(
            body.as_mut_ptr(),
            mac.as_mut_ptr(),
            ::std::ptr::null_mut(),
            body.as_ptr(),
            body.len() as u64,
            ::std::ptr::null(),
            0,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Authenticates the detached MAC and decrypts the body in place. Returns false when the
/// MAC does not match, leaving the body contents unspecified.
#[inline]
pub fn open(body: &mut [u8], mac: &[u8; MAC_SIZE], nonce: &[u8; NONCE_SIZE], key: &[u8; KEY_SIZE]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_decrypt_detached(
            body.as_mut_ptr(),
            ::std::ptr::null_mut(),
            body.as_ptr(),
            body.len() as u64,
            mac.as_ptr(),
            ::std::ptr::null(),
            0,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Produces a detached Ed25519 signature over the message.
#[inline]
pub fn sign(signature: &mut [u8; SIGNATURE_SIZE], message: &[u8], keypair: &SignKeyPair) {
    unsafe {
        libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            keypair.secret.as_ptr(),
        );
    }
}

/// Verifies a detached Ed25519 signature against the supplied verification key.
#[inline]
pub fn verify(signature: &[u8; SIGNATURE_SIZE], message: &[u8], public: &[u8; SIGN_PUBLIC_KEY_SIZE]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public.as_ptr(),
        );

        result >= 0
    }
}

/// Recovers the X25519 public key for a secret scalar. Returns false for scalars that
/// map to a low-order element.
#[inline]
pub fn dh_public_key(public: &mut [u8; DH_KEY_SIZE], scalar: &[u8; DH_SCALAR_SIZE]) -> bool {
    unsafe { libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), scalar.as_ptr()) >= 0 }
}

/// Computes the X25519 shared secret between a local scalar and a peer public key.
/// Returns false when the peer key is a low-order element.
#[inline]
pub fn dh_shared(shared: &mut [u8; DH_KEY_SIZE], scalar: &[u8; DH_SCALAR_SIZE], public: &[u8; DH_KEY_SIZE]) -> bool {
    unsafe {
        libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), scalar.as_ptr(), public.as_ptr()) >= 0
    }
}

/// Keyed Blake2b-256 of the input under a 64-byte key.
#[inline]
pub fn keyed_hash(out: &mut [u8; HASH_SIZE], input: &[u8], key: &[u8; HASH_KEY_SIZE]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_generichash_blake2b(
            out.as_mut_ptr(),
            HASH_SIZE,
            input.as_ptr(),
            input.len() as u64,
            key.as_ptr(),
            HASH_KEY_SIZE,
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}
