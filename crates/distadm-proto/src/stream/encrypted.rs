use super::buffered::BufferedStream;
use crate::crypto::{random_bytes, Cfb8, RunningHash, NONCE_SIZE};
use crate::error::ProtoResult;
use crate::ids::Key;
use std::io::{Read, Write};

/// AES-256-CFB8 layer over buffered bytes, maintaining a running SHA-1 hash
/// of plaintext with explicit checkpoints (spec §4.1).
///
/// Each direction of a connection owns its own `EncryptedStream` (its own
/// nonce, cipher register and hash context) over a shared `BufferedStream`
/// descriptor — mirroring `ICstream`/`OCstream` in
/// `original_source/ccstream.h`, which are constructed independently over a
/// shared `Fstream`.
pub struct EncryptedStream<S> {
    buf: BufferedStream<S>,
    cipher: Cfb8,
    hash: RunningHash,
}

impl<S: Read + Write> EncryptedStream<S> {
    /// Writer-side construction: emits a fresh random nonce and a random
    /// 128-bit discriminator (the latter encrypted immediately and
    /// discarded by the reader) to frustrate cribs against a fixed header.
    pub fn new_writer(mut buf: BufferedStream<S>, key: &Key) -> ProtoResult<Self> {
        let mut nonce = [0u8; NONCE_SIZE];
        random_bytes(&mut nonce);
        buf.write(&nonce)?;

        let mut cipher = Cfb8::new(key, &nonce);
        let mut discriminator = [0u8; NONCE_SIZE];
        random_bytes(&mut discriminator);
        cipher.encrypt(&mut discriminator);
        buf.write(&discriminator)?;

        Ok(EncryptedStream {
            buf,
            cipher,
            hash: RunningHash::new(),
        })
    }

    /// Reader-side construction: reads the peer's nonce and discards the
    /// random discriminator.
    pub fn new_reader(mut buf: BufferedStream<S>, key: &Key) -> ProtoResult<Self> {
        let mut nonce = [0u8; NONCE_SIZE];
        buf.read(&mut nonce)?;
        let mut cipher = Cfb8::new(key, &nonce);

        let mut discriminator = [0u8; NONCE_SIZE];
        buf.read(&mut discriminator)?;
        cipher.decrypt(&mut discriminator);

        Ok(EncryptedStream {
            buf,
            cipher,
            hash: RunningHash::new(),
        })
    }

    /// Read `buf.len()` decrypted bytes, folding them into the running hash.
    pub fn read(&mut self, buf: &mut [u8]) -> ProtoResult<()> {
        self.buf.read(buf)?;
        self.cipher.decrypt(buf);
        self.hash.update(buf);
        Ok(())
    }

    /// Read without accumulating into the hash (used only for the hash
    /// checkpoint bytes themselves).
    pub fn read_nh(&mut self, buf: &mut [u8]) -> ProtoResult<()> {
        self.buf.read(buf)?;
        self.cipher.decrypt(buf);
        Ok(())
    }

    /// Write encrypted bytes, folding the plaintext into the running hash.
    pub fn write(&mut self, data: &[u8]) -> ProtoResult<()> {
        let mut buf = data.to_vec();
        self.hash.update(&buf);
        self.cipher.encrypt(&mut buf);
        self.buf.write(&buf)
    }

    /// Write without accumulating into the hash (used only for the hash
    /// checkpoint bytes themselves).
    pub fn write_nc(&mut self, data: &[u8]) -> ProtoResult<()> {
        let mut buf = data.to_vec();
        self.cipher.encrypt(&mut buf);
        self.buf.write(&buf)
    }

    /// Emit the current running-hash checkpoint (encrypted, uncounted) and
    /// re-seed the hash context so the next segment chains from it.
    pub fn write_hash(&mut self) -> ProtoResult<()> {
        let digest = self.hash.checkpoint();
        self.write_nc(&digest)
    }

    /// Read and verify a hash checkpoint against the locally accumulated
    /// hash; on mismatch the caller should treat this as `CorruptStream`.
    pub fn check_hash(&mut self) -> ProtoResult<bool> {
        let expected = self.hash.checkpoint();
        let mut got = [0u8; 20];
        self.read_nh(&mut got)?;
        Ok(got == expected)
    }

    pub fn flush_net(&mut self) -> ProtoResult<()> {
        self.buf.flush_net()
    }

    pub fn into_inner(self) -> BufferedStream<S> {
        self.buf
    }

    pub fn inner_mut(&mut self) -> &mut BufferedStream<S> {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pipe(key: &Key, plaintext: &[u8]) -> Vec<u8> {
        let out = BufferedStream::new(Cursor::new(Vec::<u8>::new()), false);
        let mut writer = EncryptedStream::new_writer(out, key).unwrap();
        writer.write(plaintext).unwrap();
        writer.write_hash().unwrap();
        writer.flush_net().unwrap();
        writer.into_inner().get_ref().get_ref().clone()
    }

    #[test]
    fn hash_checkpoint_verifies_when_untampered() {
        let key = Key([5u8; 32]);
        let wire = pipe(&key, b"replicated command payload");

        let input = BufferedStream::new(Cursor::new(wire), false);
        let mut reader = EncryptedStream::new_reader(input, &key).unwrap();
        let mut plain = vec![0u8; b"replicated command payload".len()];
        reader.read(&mut plain).unwrap();
        assert_eq!(&plain, b"replicated command payload");
        assert!(reader.check_hash().unwrap());
    }

    #[test]
    fn flipping_a_byte_between_checkpoints_fails_the_hash() {
        let key = Key([5u8; 32]);
        let mut wire = pipe(&key, b"replicated command payload");

        // Flip a byte strictly between the discriminator/nonce header and
        // the trailing hash checkpoint.
        let flip_at = wire.len() - 21;
        wire[flip_at] ^= 0xff;

        let input = BufferedStream::new(Cursor::new(wire), false);
        let mut reader = EncryptedStream::new_reader(input, &key).unwrap();
        let mut plain = vec![0u8; b"replicated command payload".len()];
        reader.read(&mut plain).unwrap();
        assert!(!reader.check_hash().unwrap());
    }
}
