//! Symmetric crypto primitives: AES-256-CFB8 stream cipher, the SHA-1
//! running hash used for stream integrity checkpoints, and PBKDF2-HMAC-SHA256
//! password stretching for invitation files.
//!
//! Grounded on `flux::crypto` (buffer-oriented `encrypt`/`decrypt` plus a
//! `random_bytes` helper) and `original_source/sha.h`/`cryptkey.h`, adapted
//! from libsodium's ChaCha20-Poly1305 AEAD to the spec's AES-256-CFB8 stream
//! cipher (spec §4.1) since the replication protocol authenticates via the
//! SHA-1 running hash rather than an AEAD tag.

use crate::ids::Key;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use hmac::Hmac;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;

pub const NONCE_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// Fills the provided buffer with cryptographically secure random bytes.
/// Mirrors `flux::crypto::random_bytes`.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

/// A segment-addressable AES-256-CFB8 keystream register. CFB8 self-syncs
/// one byte at a time: each output byte is the low byte of
/// `AES_k(register)` XORed with the input byte, and the register is then
/// shifted left by one byte with the *ciphertext* byte appended (not the
/// plaintext byte) — this is what makes the encrypting and decrypting sides
/// symmetric registers.
///
/// Implemented directly atop the `aes` block cipher rather than a
/// ready-made CFB8 stream-mode crate because the framed-stream layer needs
/// to keep one register alive across many independent `write`/`read` calls
/// over the lifetime of a session (see spec §4.1), which one-shot stream
/// cipher helpers do not support.
pub struct Cfb8 {
    cipher: aes::Aes256,
    register: [u8; BLOCK_SIZE],
}

impl Cfb8 {
    pub fn new(key: &Key, nonce: &[u8; NONCE_SIZE]) -> Self {
        let cipher = aes::Aes256::new(GenericArray::from_slice(&key.0));
        Cfb8 {
            cipher,
            register: *nonce,
        }
    }

    #[inline]
    fn keystream_byte(&mut self) -> u8 {
        let mut block = GenericArray::clone_from_slice(&self.register);
        self.cipher.encrypt_block(&mut block);
        block[0]
    }

    /// Encrypt `buf` in place, advancing the register by one byte per input byte.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let ks = self.keystream_byte();
            let cipher_byte = *byte ^ ks;
            self.register.copy_within(1.., 0);
            self.register[BLOCK_SIZE - 1] = cipher_byte;
            *byte = cipher_byte;
        }
    }

    /// Decrypt `buf` in place, advancing the register by one byte per input byte.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            let ks = self.keystream_byte();
            let cipher_byte = *byte;
            let plain_byte = cipher_byte ^ ks;
            self.register.copy_within(1.., 0);
            self.register[BLOCK_SIZE - 1] = cipher_byte;
            *byte = plain_byte;
        }
    }
}

/// Running SHA-1 hash with explicit checkpoints. `checkpoint()` returns the
/// current digest and re-seeds the context with it so consecutive
/// checkpoints chain (the digest of one segment feeds into the hash input
/// of the next), matching the `write_hash`/`check_hash` chaining described
/// in spec §4.1.
#[derive(Clone)]
pub struct RunningHash {
    hasher: Sha1,
}

impl Default for RunningHash {
    fn default() -> Self {
        RunningHash { hasher: Sha1::new() }
    }
}

impl RunningHash {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize the current digest, then re-seed a fresh context with that
    /// digest so the next segment's hash chains from this checkpoint.
    pub fn checkpoint(&mut self) -> [u8; 20] {
        let digest: [u8; 20] = self.hasher.finalize_reset().into();
        self.hasher.update(digest);
        digest
    }
}

/// PBKDF2-HMAC-SHA256 with the fixed 200-iteration count used for
/// invitation-file wrapping keys (spec §4.4, Testable Property 8).
pub fn pbkdf2_derive(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)
        .expect("HMAC can be initialized with any key length");
    out
}

/// SHA-256 digest of arbitrary bytes, used to compute the matrix digest
/// (spec §3 `hash` field).
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfb8_roundtrips() {
        let key = Key([7u8; 32]);
        let nonce = [3u8; NONCE_SIZE];
        let plaintext = b"the quick brown fox jumps over the lazy dog, repeatedly, a lot";

        let mut enc = Cfb8::new(&key, &nonce);
        let mut buf = plaintext.to_vec();
        enc.encrypt(&mut buf);
        assert_ne!(&buf[..], &plaintext[..]);

        let mut dec = Cfb8::new(&key, &nonce);
        dec.decrypt(&mut buf);
        assert_eq!(&buf[..], &plaintext[..]);
    }

    #[test]
    fn cfb8_encrypt_across_multiple_calls_matches_single_call() {
        let key = Key([9u8; 32]);
        let nonce = [1u8; NONCE_SIZE];
        let plaintext = b"0123456789abcdef0123456789abcdef";

        let mut whole = plaintext.to_vec();
        Cfb8::new(&key, &nonce).encrypt(&mut whole);

        let mut split = plaintext.to_vec();
        let mut enc = Cfb8::new(&key, &nonce);
        enc.encrypt(&mut split[..10]);
        enc.encrypt(&mut split[10..]);

        assert_eq!(whole, split);
    }

    #[test]
    fn pbkdf2_matches_rfc7914_appendix_a_vector() {
        // RFC 7914 §11, "Test Vectors for PBKDF2 with HMAC-SHA-256":
        // P = "passwd", S = "salt", c = 1, dkLen = 64. PBKDF2 blocks are
        // independent of one another, so the leading 32 bytes of that
        // 64-byte vector are also the correct 32-byte (dkLen) output —
        // used here as a known-answer check for this derivation's width.
        let dk = pbkdf2_derive(b"passwd", b"salt", 1);
        assert_eq!(
            dk,
            [
                0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f, 0xec, 0x16, 0x91, 0xc2, 0x25, 0x44, 0xb6, 0x05, 0xf9,
                0x41, 0x85, 0x21, 0x6d, 0xde, 0x04, 0x65, 0xe6, 0x8b, 0x9d, 0x57, 0xc2, 0x0d, 0xac, 0xbc,
            ]
        );
    }

    #[test]
    fn pbkdf2_is_deterministic_and_salt_sensitive() {
        let a = pbkdf2_derive(b"pw", b"salty-salt", 200);
        let b = pbkdf2_derive(b"pw", b"salty-salt", 200);
        assert_eq!(a, b);
        let c = pbkdf2_derive(b"pw", b"other-salt", 200);
        assert_ne!(a, c);
    }

    #[test]
    fn running_hash_checkpoints_chain() {
        let mut h1 = RunningHash::new();
        h1.update(b"segment one");
        let cp1 = h1.checkpoint();
        h1.update(b"segment two");
        let cp2 = h1.checkpoint();
        assert_ne!(cp1, cp2);

        // Flipping a byte between checkpoints changes the second checkpoint.
        let mut h2 = RunningHash::new();
        h2.update(b"segment one");
        let _ = h2.checkpoint();
        h2.update(b"Segment two");
        let cp2_flipped = h2.checkpoint();
        assert_ne!(cp2, cp2_flipped);
    }
}
