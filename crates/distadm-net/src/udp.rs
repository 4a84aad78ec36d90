//! UDP discovery: IPv6 multicast HELO/BYE/NOT_INITIALIZED announcements.
//!
//! Grounded on `original_source/network.h`'s `UDPmessage_v1` and
//! `corenet.cpp`'s `broadcast_helo_v1`/`ipv6_group` (spec §4.5).

use crate::error::{NetError, NetResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use distadm_proto::crypto::{random_bytes, Cfb8, RunningHash, NONCE_SIZE};
use distadm_proto::{GroupId, Key, MatrixDigest, NodeId};
use std::io::Cursor;
use std::net::Ipv6Addr;

/// `command` discriminant of a UDP announcement (spec §4.5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UdpCommand {
    Helo,
    Bye,
    NotInitialized,
}

impl UdpCommand {
    fn to_byte(self) -> u8 {
        match self {
            UdpCommand::Helo => 0,
            UdpCommand::Bye => 1,
            UdpCommand::NotInitialized => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(UdpCommand::Helo),
            1 => Some(UdpCommand::Bye),
            2 => Some(UdpCommand::NotInitialized),
            _ => None,
        }
    }
}

/// `UDPv1` message body (spec §4.5): version, command, replay counter,
/// group id, node id, cached matrix digest.
#[derive(Clone, Debug)]
pub struct UdpMessage {
    pub version: u16,
    pub command: UdpCommand,
    pub counter: u64,
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub node_hash: MatrixDigest,
}

const PLAIN_LEN: usize = 2 + 1 + 8 + 16 + 16 + 32;

/// Encrypts `msg` under the group key with a fresh nonce, and appends a
/// keyed SHA-1 integrity tag over the plaintext (spec §4.5 "the inner
/// SHA-1 is a keyed integrity check"). Layout on the wire:
/// `nonce(16) | ciphertext(PLAIN_LEN) | hash(20)`.
pub fn encode(msg: &UdpMessage, key: &Key) -> Vec<u8> {
    let mut plain = Vec::with_capacity(PLAIN_LEN);
    plain.write_u16::<BigEndian>(msg.version).unwrap();
    plain.write_u8(msg.command.to_byte()).unwrap();
    plain.write_u64::<BigEndian>(msg.counter).unwrap();
    plain.extend_from_slice(msg.group_id.0.as_bytes());
    plain.extend_from_slice(msg.node_id.0.as_bytes());
    plain.extend_from_slice(&msg.node_hash.0);

    let mut nonce = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce);

    // The integrity tag is keyed by mixing the group key into the hash
    // input ahead of the plaintext, rather than a bare unkeyed SHA-1 of the
    // ciphertext, so a spoofer without the group key cannot forge a
    // message even if they can guess the plaintext shape.
    let mut hasher = RunningHash::new();
    hasher.update(&key.0);
    hasher.update(&plain);
    let tag = hasher.checkpoint();

    let mut cipher = Cfb8::new(key, &nonce);
    let mut ciphertext = plain;
    cipher.encrypt(&mut ciphertext);

    let mut out = Vec::with_capacity(NONCE_SIZE + PLAIN_LEN + 20);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    out
}

/// Decrypts and validates a received datagram. Returns `NetError::IntegrityCheck`
/// when the keyed hash does not match — the caller must silently drop such
/// messages rather than propagate a session-ending error (spec §4.5).
pub fn decode(raw: &[u8], key: &Key) -> NetResult<UdpMessage> {
    if raw.len() != NONCE_SIZE + PLAIN_LEN + 20 {
        return Err(NetError::Handshake("malformed udp datagram length".into()));
    }
    let nonce: [u8; NONCE_SIZE] = raw[..NONCE_SIZE].try_into().unwrap();
    let ciphertext = &raw[NONCE_SIZE..NONCE_SIZE + PLAIN_LEN];
    let tag = &raw[NONCE_SIZE + PLAIN_LEN..];

    let mut cipher = Cfb8::new(key, &nonce);
    let mut plain = ciphertext.to_vec();
    cipher.decrypt(&mut plain);

    let mut hasher = RunningHash::new();
    hasher.update(&key.0);
    hasher.update(&plain);
    let expected = hasher.checkpoint();
    if expected != tag {
        return Err(NetError::IntegrityCheck);
    }

    let mut cur = Cursor::new(&plain);
    let version = cur.read_u16::<BigEndian>().unwrap();
    let command = UdpCommand::from_byte(cur.read_u8().unwrap())
        .ok_or_else(|| NetError::Handshake("unknown udp command byte".into()))?;
    let counter = cur.read_u64::<BigEndian>().unwrap();

    let mut group_id = [0u8; 16];
    std::io::Read::read_exact(&mut cur, &mut group_id).unwrap();
    let mut node_id = [0u8; 16];
    std::io::Read::read_exact(&mut cur, &mut node_id).unwrap();
    let mut node_hash = [0u8; 32];
    std::io::Read::read_exact(&mut cur, &mut node_hash).unwrap();

    Ok(UdpMessage {
        version,
        command,
        counter,
        group_id: GroupId(distadm_proto::Id128::from_bytes(group_id)),
        node_id: NodeId(distadm_proto::Id128::from_bytes(node_id)),
        node_hash: MatrixDigest(node_hash),
    })
}

/// Deterministic multicast group derived from the group id: `ff12::` plus
/// the first 14 bytes of the group id (spec §4.5 `ipv6_group`).
pub fn multicast_group(group_id: &GroupId) -> Ipv6Addr {
    let id = group_id.0.as_bytes();
    let mut segments = [0u16; 8];
    segments[0] = 0xff12;
    for i in 0..7 {
        segments[i + 1] = u16::from_be_bytes([id[2 * i], id[2 * i + 1]]);
    }
    Ipv6Addr::new(
        segments[0], segments[1], segments[2], segments[3],
        segments[4], segments[5], segments[6], segments[7],
    )
}

/// Tracks per-peer UDP replay counters so stale or replayed announcements
/// can be flagged (spec §4.5 "possible-spoofing warning"). The message is
/// still processed, matching the source's best-effort stance: the counter
/// check is an early-warning signal, not an authentication mechanism (the
/// group key is the only peer authenticator).
#[derive(Default)]
pub struct ReplayTracker {
    known_counter: hashbrown::HashMap<NodeId, u64>,
}

impl ReplayTracker {
    pub fn new() -> Self {
        ReplayTracker::default()
    }

    /// Returns `true` if `counter` looks like a possible replay/spoof
    /// (not strictly greater than the last seen counter for this node).
    pub fn observe(&mut self, node_id: NodeId, counter: u64) -> bool {
        let suspicious = self
            .known_counter
            .get(&node_id)
            .map(|known| counter <= *known)
            .unwrap_or(false);
        let entry = self.known_counter.entry(node_id).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
        suspicious
    }
}
