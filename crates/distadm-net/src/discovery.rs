//! Address book maintained from UDP announcements, and the
//! address-to-connect "interesting" policy that picks which peer the
//! client thread should try next.
//!
//! Grounded on `original_source/corenet.cpp`'s `need_communicate` (reads
//! `matrix_row` equality and `hash` difference) and `addr_to_connect`
//! (spec §4.5 "Address-to-connect policy").

use distadm_core::matrix::Matrix;
use distadm_proto::{MatrixDigest, NodeId};
use hashbrown::HashMap;
use rand::seq::IteratorRandom;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub node_id: NodeId,
    pub last_seen: Instant,
    pub initialized: bool,
}

/// Tracks (address, node) bindings learned from UDP HELO/NOT_INITIALIZED
/// announcements, dropped on BYE (spec §4.5 "On receive").
#[derive(Default)]
pub struct AddressBook {
    peers: HashMap<SocketAddr, KnownPeer>,
}

impl AddressBook {
    pub fn new() -> Self {
        AddressBook::default()
    }

    pub fn bind(&mut self, addr: SocketAddr, node_id: NodeId, initialized: bool) {
        self.peers.insert(
            addr,
            KnownPeer { addr, node_id, last_seen: Instant::now(), initialized },
        );
    }

    pub fn forget(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownPeer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// A peer's matrix row is "interesting" to contact if it differs from ours,
/// or its cached digest differs from ours and is non-zero (spec §4.5).
/// Peers we have no matrix knowledge of yet (not present in `local_matrix`)
/// are always interesting.
pub fn is_interesting(local_matrix: &Matrix, self_id: NodeId, peer: &KnownPeer, peer_hash: MatrixDigest) -> bool {
    if !local_matrix.contains(&peer.node_id) {
        return true;
    }
    let Some(self_rec) = local_matrix.get(&self_id) else { return true };
    let Some(peer_rec) = local_matrix.get(&peer.node_id) else { return true };

    if self_rec.matrix_row != peer_rec.matrix_row {
        return true;
    }
    if !peer_hash.is_zero() && peer_hash != self_rec.hash {
        return true;
    }
    false
}

/// Picks one candidate address uniformly at random among interesting
/// peers, excluding `exclude` (the current server-side partner, if any).
/// Returns `None` when no candidate qualifies, at which point the client
/// thread should sleep until the next UDP announcement (spec §4.5).
pub fn pick_candidate(
    book: &AddressBook,
    local_matrix: &Matrix,
    self_id: NodeId,
    peer_hashes: &HashMap<NodeId, MatrixDigest>,
    exclude: Option<SocketAddr>,
) -> Option<SocketAddr> {
    book.iter()
        .filter(|p| Some(p.addr) != exclude)
        .filter(|p| {
            let hash = peer_hashes.get(&p.node_id).copied().unwrap_or_else(MatrixDigest::zero);
            is_interesting(local_matrix, self_id, p, hash)
        })
        .map(|p| p.addr)
        .choose(&mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;
    use std::net::{IpAddr, Ipv6Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)
    }

    #[test]
    fn unknown_peer_is_always_interesting() {
        let self_id = NodeId::random(&mut thread_rng());
        let matrix = Matrix::create(self_id);
        let peer = KnownPeer {
            addr: addr(1),
            node_id: NodeId::random(&mut thread_rng()),
            last_seen: Instant::now(),
            initialized: true,
        };
        assert!(is_interesting(&matrix, self_id, &peer, MatrixDigest::zero()));
    }

    #[test]
    fn matching_row_and_hash_is_not_interesting() {
        let self_id = NodeId::random(&mut thread_rng());
        let peer_id = NodeId::random(&mut thread_rng());
        let mut matrix = Matrix::create(self_id);
        matrix.resize(vec![peer_id], None, 1);

        let self_row = matrix.get(&self_id).unwrap().matrix_row.clone();
        matrix.get_mut(&peer_id).unwrap().matrix_row = self_row;
        let digest = matrix.digest();
        matrix.get_mut(&self_id).unwrap().hash = digest;

        let peer = KnownPeer {
            addr: addr(2),
            node_id: peer_id,
            last_seen: Instant::now(),
            initialized: true,
        };
        assert!(!is_interesting(&matrix, self_id, &peer, digest));
    }

    #[test]
    fn pick_candidate_excludes_current_partner() {
        let self_id = NodeId::random(&mut thread_rng());
        let matrix = Matrix::create(self_id);
        let mut book = AddressBook::new();
        let only_addr = addr(3);
        book.bind(only_addr, NodeId::random(&mut thread_rng()), true);

        let chosen = pick_candidate(&book, &matrix, self_id, &HashMap::new(), Some(only_addr));
        assert!(chosen.is_none());
    }
}
