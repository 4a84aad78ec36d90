//! TCP handshake: a fixed-shape encrypted record padded with random
//! "trash" to frustrate traffic analysis.
//!
//! Grounded on `original_source/network.h`'s `TCPHeloMsg`/`get_tcp_helo`
//! (spec §4.5 "Handshake"). The handshake uses the raw encrypted layer
//! (`distadm_proto::stream::EncryptedStream`) directly rather than the
//! compressed layer the rest of the session uses, matching `ICstream`/
//! `OCstream` being constructed directly over `Fstream` for the helo
//! exchange in the original, with the compressed `ICCstream`/`OCCstream`
//! layer only wrapped on afterward for the session protocol proper.

use crate::error::{NetError, NetResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use distadm_proto::stream::{BufferedStream, EncryptedStream};
use distadm_proto::{crypto::random_bytes, Key, MatrixDigest, NodeId};
use rand::Rng;
use std::io::{Cursor, Read, Write};

pub const MAX_TRASH: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpHeloMsg {
    pub node_id: NodeId,
    pub node_hash: MatrixDigest,
    pub msg_cnt: u64,
    pub version: u16,
    pub initialized: bool,
}

const MSG_LEN: usize = 16 + 32 + 8 + 2 + 1;

fn encode_msg(msg: &TcpHeloMsg) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MSG_LEN);
    buf.extend_from_slice(msg.node_id.0.as_bytes());
    buf.extend_from_slice(&msg.node_hash.0);
    buf.write_u64::<BigEndian>(msg.msg_cnt).unwrap();
    buf.write_u16::<BigEndian>(msg.version).unwrap();
    buf.write_u8(msg.initialized as u8).unwrap();
    buf
}

fn decode_msg(buf: &[u8]) -> NetResult<TcpHeloMsg> {
    if buf.len() != MSG_LEN {
        return Err(NetError::Handshake("malformed TCPhelo message length".into()));
    }
    let mut node_id = [0u8; 16];
    node_id.copy_from_slice(&buf[0..16]);
    let mut node_hash = [0u8; 32];
    node_hash.copy_from_slice(&buf[16..48]);

    let mut cur = Cursor::new(&buf[48..]);
    let msg_cnt = cur.read_u64::<BigEndian>().unwrap();
    let version = cur.read_u16::<BigEndian>().unwrap();
    let initialized = cur.read_u8().unwrap() != 0;

    Ok(TcpHeloMsg {
        node_id: NodeId(distadm_proto::Id128::from_bytes(node_id)),
        node_hash: MatrixDigest(node_hash),
        msg_cnt,
        version,
        initialized,
    })
}

/// Writes the handshake record and returns the consumed `BufferedStream`
/// so the caller can layer the compressed session protocol on top.
pub fn write_helo<S: Read + Write>(
    inner: BufferedStream<S>,
    key: &Key,
    msg: &TcpHeloMsg,
) -> NetResult<BufferedStream<S>> {
    let mut enc = EncryptedStream::new_writer(inner, key)?;
    enc.write(&encode_msg(msg))?;
    enc.write_hash()?;

    let trash_size = rand::thread_rng().gen_range(0..=MAX_TRASH);
    let mut trash = vec![0u8; trash_size];
    random_bytes(&mut trash);
    let mut size_buf = Vec::with_capacity(8);
    size_buf.write_u64::<BigEndian>(trash_size as u64).unwrap();
    enc.write(&size_buf)?;
    enc.write(&trash)?;
    enc.flush_net()?;

    Ok(enc.into_inner())
}

/// Reads the handshake record, returning the peer's announcement and the
/// consumed `BufferedStream` for the caller to layer the session protocol
/// on top of.
pub fn read_helo<S: Read + Write>(inner: BufferedStream<S>, key: &Key) -> NetResult<(TcpHeloMsg, BufferedStream<S>)> {
    let mut enc = EncryptedStream::new_reader(inner, key)?;
    let mut msg_buf = vec![0u8; MSG_LEN];
    enc.read(&mut msg_buf)?;
    if !enc.check_hash()? {
        return Err(NetError::Handshake("TCPhelo hash checkpoint mismatch".into()));
    }
    let msg = decode_msg(&msg_buf)?;

    let mut size_buf = [0u8; 8];
    enc.read(&mut size_buf)?;
    let trash_size = Cursor::new(&size_buf).read_u64::<BigEndian>().unwrap() as usize;
    if trash_size > MAX_TRASH {
        return Err(NetError::Handshake("trash size exceeds maximum".into()));
    }
    let mut trash = vec![0u8; trash_size];
    enc.read(&mut trash)?;

    Ok((msg, enc.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;
    use std::io::Cursor as IoCursor;

    #[derive(Default)]
    struct GrowVec(Vec<u8>, usize);
    impl Read for GrowVec {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            let remaining = &self.0[self.1..];
            let n = remaining.len().min(out.len());
            out[..n].copy_from_slice(&remaining[..n]);
            self.1 += n;
            Ok(n)
        }
    }
    impl Write for GrowVec {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn helo_roundtrips_through_random_trash_padding() {
        let key = Key::random(&mut thread_rng());
        let msg = TcpHeloMsg {
            node_id: NodeId::random(&mut thread_rng()),
            node_hash: MatrixDigest::zero(),
            msg_cnt: 7,
            version: 1,
            initialized: true,
        };

        let transport = GrowVec::default();
        let buf = BufferedStream::new(transport, true);
        let buf = write_helo(buf, &key, &msg).unwrap();
        let wire = buf.get_ref().0.clone();

        let input = BufferedStream::new(IoCursor::new(wire), true);
        let (got, _rest) = read_helo(input, &key).unwrap();
        assert_eq!(got, msg);
    }
}
