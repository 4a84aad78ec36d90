use crate::error::{ProtoError, ProtoResult};
use std::io::{Read, Seek, SeekFrom, Write};

/// Size of the in/out caches, matching `Istream`/`Ostream`'s `cache[0x10000]`
/// in `original_source/ccstream.h`.
const CACHE_SIZE: usize = 0x10000;

/// Buffered bytes over a descriptor that may be a regular file or a network
/// socket. When `network` is set, every logical write forces a flush so the
/// peer unblocks promptly (spec §4.1).
pub struct BufferedStream<S> {
    inner: S,
    network: bool,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
}

impl<S: Read + Write> BufferedStream<S> {
    pub fn new(inner: S, network: bool) -> Self {
        BufferedStream {
            inner,
            network,
            read_buf: Vec::with_capacity(CACHE_SIZE),
            read_pos: 0,
            write_buf: Vec::with_capacity(CACHE_SIZE),
        }
    }

    #[inline]
    pub fn is_network(&self) -> bool {
        self.network
    }

    fn fill_cache(&mut self, want: usize) -> ProtoResult<()> {
        while self.read_buf.len() - self.read_pos < want {
            let mut chunk = [0u8; CACHE_SIZE];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                return Err(ProtoError::CorruptStream(
                    "short read: peer closed before required bytes arrived".into(),
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes, blocking/refilling as needed.
    pub fn read(&mut self, buf: &mut [u8]) -> ProtoResult<()> {
        self.fill_cache(buf.len())?;
        buf.copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + buf.len()]);
        self.read_pos += buf.len();
        self.compact_read_buf();
        Ok(())
    }

    /// Read `buf.len()` bytes without advancing the read pointer. The
    /// requested size must not exceed the cache capacity, matching the
    /// contract of `Istream::peek` in the original.
    pub fn peek(&mut self, buf: &mut [u8]) -> ProtoResult<()> {
        assert!(buf.len() <= CACHE_SIZE, "peek size exceeds cache capacity");
        self.fill_cache(buf.len())?;
        buf.copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + buf.len()]);
        Ok(())
    }

    fn compact_read_buf(&mut self) {
        if self.read_pos > CACHE_SIZE {
            self.read_buf.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Offset of the read pointer into bytes actually consumed from `inner`.
    pub fn tell(&self) -> usize {
        self.read_pos
    }

    pub fn write(&mut self, buf: &[u8]) -> ProtoResult<()> {
        self.write_buf.extend_from_slice(buf);
        if self.write_buf.len() >= CACHE_SIZE {
            self.flush_cache()?;
        }
        Ok(())
    }

    pub fn flush_cache(&mut self) -> ProtoResult<()> {
        if !self.write_buf.is_empty() {
            self.inner.write_all(&self.write_buf)?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Drop the write cache and, for network descriptors, force the
    /// underlying transport to flush too — mirrors `Ostream::flush_net`.
    pub fn flush_net(&mut self) -> ProtoResult<()> {
        self.flush_cache()?;
        if self.network {
            self.inner.flush()?;
        }
        Ok(())
    }

    /// Close the stream. Any unconsumed read-side bytes are reported so a
    /// caller that needs to resume reading past this layer (e.g. to recover
    /// a packet trailer after an inflate layer closes) can re-seek the
    /// underlying descriptor, matching the contract described in spec §4.1.
    pub fn close(mut self) -> ProtoResult<usize> {
        self.flush_cache()?;
        Ok(self.read_buf.len() - self.read_pos)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: Read + Write + Seek> BufferedStream<S> {
    /// Explicit seek, repointing the underlying descriptor and discarding
    /// cached reads past the seek point.
    pub fn seek(&mut self, pos: SeekFrom) -> ProtoResult<u64> {
        self.flush_cache()?;
        self.read_buf.clear();
        self.read_pos = 0;
        Ok(self.inner.seek(pos)?)
    }
}
