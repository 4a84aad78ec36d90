//! Packet codec: offline packet files and online/offline invitation files.
//!
//! Grounded on `original_source/core.h`'s `write_packet`/`read_packet`,
//! `write_online_invite`/`read_invite`, `write_offline_invite`/
//! `finalize_offline_invitation`, and the `GroupIdPacket`/`TrailerUUIDs`
//! wire structs (spec §4.4). Every record in these formats is carried as a
//! framed JSON document (`distadm_proto::stream::framed`), which already
//! brackets each with hash checkpoints exactly as spec §4.1 requires — the
//! `u16 protocol_version` header becomes the first JSON document's
//! `version` field rather than raw bytes, per DESIGN NOTES' allowance to
//! substitute an encoding as long as field semantics and checkpoint
//! positions are preserved.

use crate::command::{Command, CommandLog};
use crate::error::{CoreError, CoreResult};
use crate::files::FileRegistry;
use crate::matrix::{Matrix, MatrixValidator, MatrixWire};
use crate::users::UserTable;
use distadm_proto::stream::{BufferedStream, FramedReader, FramedWriter};
use distadm_proto::{GroupId, Id128, InviteId, Key, NodeId, Nonce, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// A minimum free-space slack kept in reserve while writing a packet, below
/// which writing stops early but still leaves a well-formed, readable
/// prefix (spec §4.4 "the engine may stop early if free disk space would
/// fall below a safety margin").
pub const FREE_SPACE_SLACK_BYTES: u64 = 64 * 1024;

#[derive(Serialize, Deserialize)]
struct PacketHeader {
    version: u16,
}

/// Writes an offline packet file: header, matrix, then each command (with
/// its file payload inline for `addfile`), then an empty terminator
/// (spec §4.4).
pub fn write_packet<S: Read + Write>(
    inner: S,
    key: &Key,
    matrix: &Matrix,
    commands: impl Iterator<Item = Command>,
    free_space_bytes: impl Fn() -> u64,
) -> CoreResult<()> {
    let buf = BufferedStream::new(inner, false);
    let mut w = FramedWriter::new(buf, key)?;

    w.write_json(&serde_json::to_value(PacketHeader { version: PROTOCOL_VERSION })?)?;
    w.write_json(&serde_json::to_value(MatrixWire::from(matrix))?)?;

    for cmd in commands {
        if free_space_bytes() < FREE_SPACE_SLACK_BYTES {
            break;
        }
        w.write_json(&serde_json::to_value(&cmd)?)?;
        if cmd.kind() == Some("addfile") {
            if let Some(payload) = &cmd.payload {
                w.write_file(payload.bytes.as_slice(), payload.bytes.len() as u64)?;
            }
        }
    }

    w.write_terminator()?;
    w.close()?;
    Ok(())
}

/// Result of reading a packet: the peer's matrix plus the command prefix it
/// carried (spec invariant P1: re-reading yields equal logical state).
pub struct PacketContents {
    pub matrix: Matrix,
    pub commands: Vec<Command>,
}

pub fn read_packet<S: Read + Write>(inner: S, key: &Key) -> CoreResult<PacketContents> {
    let buf = BufferedStream::new(inner, false);
    let mut r = FramedReader::new(buf, key)?;

    let header: PacketHeader = serde_json::from_value(r.read_json()?)?;
    if header.version > PROTOCOL_VERSION {
        return Err(CoreError::Semantic(format!(
            "packet protocol version {} newer than supported {}",
            header.version, PROTOCOL_VERSION
        )));
    }

    let wire: MatrixWire = serde_json::from_value(r.read_json()?)?;
    let matrix: Matrix = wire.into();

    let mut commands = Vec::new();
    loop {
        let value = r.read_json()?;
        if value.is_null() {
            break;
        }
        let mut cmd: Command = serde_json::from_value(value)?;
        if cmd.kind() == Some("addfile") {
            let mut bytes = Vec::new();
            r.read_file(&mut bytes)?;
            cmd.payload = Some(crate::command::Payload { bytes });
        }
        commands.push(cmd);
    }

    Ok(PacketContents { matrix, commands })
}

#[derive(Serialize, Deserialize)]
struct GroupIdPacket {
    group_id: GroupId,
    key: Key,
}

/// Writes the small online invitation: a plaintext nonce, then the group
/// identity encrypted under a PBKDF2-stretched password key
/// (spec §4.4, Testable Property 8).
pub fn write_online_invite<S: Read + Write>(
    mut inner: S,
    password: &str,
    group_id: GroupId,
    key: &Key,
) -> CoreResult<()> {
    let mut nonce_bytes = [0u8; 16];
    distadm_proto::crypto::random_bytes(&mut nonce_bytes);
    inner.write_all(&nonce_bytes)?;

    let wrap_key = derive_invite_key(password, &nonce_bytes);
    let buf = BufferedStream::new(inner, false);
    let mut w = FramedWriter::new(buf, &wrap_key)?;
    w.write_json(&serde_json::to_value(PacketHeader { version: PROTOCOL_VERSION })?)?;
    w.write_json(&serde_json::to_value(GroupIdPacket { group_id, key: *key })?)?;
    w.close()?;
    Ok(())
}

/// Reads an online invitation, returning the group identity it carries.
pub fn read_online_invite<S: Read + Write>(mut inner: S, password: &str) -> CoreResult<(GroupId, Key)> {
    let mut nonce_bytes = [0u8; 16];
    inner.read_exact(&mut nonce_bytes)?;
    let wrap_key = derive_invite_key(password, &nonce_bytes);

    let buf = BufferedStream::new(inner, false);
    let mut r = FramedReader::new(buf, &wrap_key)?;
    let header: PacketHeader = serde_json::from_value(r.read_json()?)?;
    if header.version > PROTOCOL_VERSION {
        return Err(CoreError::Semantic("invitation protocol version unsupported".into()));
    }
    let gi: GroupIdPacket = serde_json::from_value(r.read_json()?)?;
    Ok((gi.group_id, gi.key))
}

fn derive_invite_key(password: &str, nonce: &[u8]) -> Key {
    Key(distadm_proto::crypto::pbkdf2_derive(password.as_bytes(), nonce, 200))
}

/// Full state seed carried by an offline invitation, continuing directly
/// after an online invite on the same stream (spec §4.4).
#[derive(Serialize, Deserialize)]
struct OfflineSeed {
    invite_id: InviteId,
    self_id: NodeId,
    matrix: MatrixValidator,
    aux_state: serde_json::Value,
    commands: Vec<Command>,
    users: UserTable,
    files: FileRegistry,
}

/// Trailer the joiner appends before returning the packet to the inviter:
/// a fresh nonce and the candidate `NodeId`s it wants to claim
/// (spec §4.4, invariant P2).
#[derive(Serialize, Deserialize)]
pub struct Trailer {
    pub nonce: Nonce,
    pub candidates: Vec<NodeId>,
}

/// Appends the offline invitation seed after an online invite's framed
/// section, reusing the same wrapping key derivation.
pub fn write_offline_invite<S: Read + Write>(
    inner: S,
    key: &Key,
    invite_id: InviteId,
    self_id: NodeId,
    matrix: &Matrix,
    aux_state: &serde_json::Map<String, serde_json::Value>,
    commands: &CommandLog,
    users: &UserTable,
    files: &FileRegistry,
) -> CoreResult<()> {
    let buf = BufferedStream::new(inner, false);
    let mut w = FramedWriter::new(buf, key)?;
    let seed = OfflineSeed {
        invite_id,
        self_id,
        matrix: MatrixValidator::from(matrix),
        aux_state: serde_json::Value::Object(aux_state.clone()),
        commands: commands.iter().cloned().collect(),
        users: users.clone(),
        files: files.clone(),
    };
    w.write_json(&serde_json::to_value(&seed)?)?;
    w.write_terminator()?;
    w.close()?;
    Ok(())
}

pub struct OfflineInvitation {
    pub invite_id: InviteId,
    pub self_id: NodeId,
    pub matrix: Matrix,
    pub aux_state: serde_json::Map<String, serde_json::Value>,
    pub commands: Vec<Command>,
    pub users: UserTable,
    pub files: FileRegistry,
}

pub fn read_offline_invite<S: Read + Write>(inner: S, key: &Key) -> CoreResult<OfflineInvitation> {
    let buf = BufferedStream::new(inner, false);
    let mut r = FramedReader::new(buf, key)?;
    let value = r.read_json()?;
    let seed: OfflineSeed = serde_json::from_value(value)?;
    let _ = r.read_json()?; // terminator

    let aux_state = match seed.aux_state {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };

    Ok(OfflineInvitation {
        invite_id: seed.invite_id,
        self_id: seed.self_id,
        matrix: seed.matrix.into(),
        aux_state,
        commands: seed.commands,
        users: seed.users,
        files: seed.files,
    })
}

/// Writes a trailer as its own framed document, carried in a file of its
/// own rather than appended in place on the invitation file (spec §4.4
/// invariant P2; `original_source/core.h` declares `TrailerUUIDs` but the
/// retained corpus never implements its wire mechanics, so the sibling-file
/// layout here is this crate's own choice, not a port).
pub fn write_trailer<S: Read + Write>(inner: S, key: &Key, trailer: &Trailer) -> CoreResult<()> {
    let buf = BufferedStream::new(inner, false);
    let mut w = FramedWriter::new(buf, key)?;
    w.write_json(&serde_json::to_value(trailer)?)?;
    w.write_terminator()?;
    w.close()?;
    Ok(())
}

pub fn read_trailer<S: Read + Write>(inner: S, key: &Key) -> CoreResult<Trailer> {
    let buf = BufferedStream::new(inner, false);
    let mut r = FramedReader::new(buf, key)?;
    let value = r.read_json()?;
    let trailer: Trailer = serde_json::from_value(value)?;
    let _ = r.read_json()?; // terminator
    Ok(trailer)
}

/// The joiner selects a `NodeId` that collides with neither the inviter's
/// matrix nor any id already proposed in an earlier trailer round (spec
/// invariant P2).
pub fn propose_candidate(matrix: &Matrix, already_proposed: &[NodeId]) -> NodeId {
    loop {
        let candidate = NodeId::random(&mut rand::thread_rng());
        if !matrix.contains(&candidate) && !already_proposed.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

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

    fn rand_id() -> NodeId {
        NodeId::random(&mut rand::thread_rng())
    }

    #[test]
    fn packet_roundtrip_preserves_matrix_and_commands() {
        let key = Key([3u8; 32]);
        let a = rand_id();
        let matrix = Matrix::create(a);

        let cmd = Command {
            author: a,
            seq: 0,
            depends: Default::default(),
            value: serde_json::json!({"name": "adduser", "username": "alice"}),
            payload: None,
        };

        let mut transport = GrowVec::default();
        write_packet(
            &mut Cursor::new(&mut transport.0),
            &key,
            &matrix,
            std::iter::once(cmd.clone()),
            || u64::MAX,
        )
        .unwrap();

        let contents = read_packet(Cursor::new(transport.0), &key).unwrap();
        assert_eq!(contents.commands.len(), 1);
        assert_eq!(contents.commands[0].author, a);
        assert_eq!(contents.matrix.len(), matrix.len());
    }

    #[test]
    fn online_invite_roundtrips_group_identity() {
        let password = "correct horse battery staple";
        let group_id = GroupId(Id128::random(&mut rand::thread_rng()));
        let key = Key::random(&mut rand::thread_rng());

        let mut transport = GrowVec::default();
        write_online_invite(&mut Cursor::new(&mut transport.0), password, group_id, &key).unwrap();

        let (got_group, got_key) = read_online_invite(Cursor::new(transport.0), password).unwrap();
        assert_eq!(got_group, group_id);
        assert_eq!(got_key.0, key.0);
    }

    #[test]
    fn wrong_password_fails_online_invite() {
        let group_id = GroupId(Id128::random(&mut rand::thread_rng()));
        let key = Key::random(&mut rand::thread_rng());

        let mut transport = GrowVec::default();
        write_online_invite(&mut Cursor::new(&mut transport.0), "right", group_id, &key).unwrap();

        let result = read_online_invite(Cursor::new(transport.0), "wrong");
        assert!(result.is_err());
    }

    /// Scenario: packet-file offline sync. A writes a packet after issuing
    /// `adduser alice`; B reads it cold and ends up with the same command
    /// and an equal-length matrix, with no network involved.
    #[test]
    fn packet_file_offline_sync_carries_adduser_to_a_fresh_node() {
        let key = Key([5u8; 32]);
        let a = rand_id();
        let matrix = Matrix::create(a);

        let cmd = Command {
            author: a,
            seq: 0,
            depends: Default::default(),
            value: serde_json::json!({"name": "adduser", "username": "alice"}),
            payload: None,
        };

        let mut transport = GrowVec::default();
        write_packet(
            &mut Cursor::new(&mut transport.0),
            &key,
            &matrix,
            std::iter::once(cmd),
            || u64::MAX,
        )
        .unwrap();

        let contents = read_packet(Cursor::new(transport.0), &key).unwrap();
        assert_eq!(contents.commands.len(), 1);
        assert_eq!(contents.commands[0].kind(), Some("adduser"));
        assert_eq!(
            contents.commands[0].value.get("username").and_then(|v| v.as_str()),
            Some("alice")
        );
    }

    #[test]
    fn trailer_roundtrips_candidates() {
        let key = Key([9u8; 32]);
        let trailer = Trailer { nonce: Nonce::random(&mut rand::thread_rng()), candidates: vec![rand_id(), rand_id()] };

        let mut transport = GrowVec::default();
        write_trailer(&mut Cursor::new(&mut transport.0), &key, &trailer).unwrap();

        let got = read_trailer(Cursor::new(transport.0), &key).unwrap();
        assert_eq!(got.candidates, trailer.candidates);
    }

    /// Scenario: corrupt packet. Flipping one byte strictly between a
    /// `write_hash`/`check_hash` bracket must surface as a framing error
    /// rather than silently misreading the document.
    #[test]
    fn corrupt_packet_byte_flip_is_rejected() {
        let key = Key([6u8; 32]);
        let a = rand_id();
        let matrix = Matrix::create(a);

        let cmd = Command {
            author: a,
            seq: 0,
            depends: Default::default(),
            value: serde_json::json!({"name": "exec", "val": "echo hi"}),
            payload: None,
        };

        let mut transport = GrowVec::default();
        write_packet(
            &mut Cursor::new(&mut transport.0),
            &key,
            &matrix,
            std::iter::once(cmd),
            || u64::MAX,
        )
        .unwrap();

        // Flip a byte in the middle of the ciphertext, well past the header
        // and before the trailing terminator, so it lands inside a bracketed
        // body rather than on a boundary byte that might decode as valid.
        let mid = transport.0.len() / 2;
        transport.0[mid] ^= 0xff;

        let result = read_packet(Cursor::new(transport.0), &key);
        assert!(result.is_err());
    }
}
