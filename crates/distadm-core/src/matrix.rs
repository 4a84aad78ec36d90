//! Knowledge matrix: ordered mapping from `NodeId` to membership record.
//!
//! Grounded on `original_source/core.h`'s `Matrix : std::map<UUID, Node>` and
//! `corenet.cpp`'s `need_communicate`/`addr_to_connect`, which read
//! `matrix_row` equality and `hash` difference to decide which peers are
//! worth contacting (spec §4.2, §4.5).

use distadm_proto::{MatrixDigest, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Per-peer membership record (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    /// `matrix_row[K]`: smallest sequence number not yet known to have been
    /// authored by K, indexed by the matrix's own NodeId ordering.
    pub matrix_row: Vec<u64>,
    /// Next command to execute locally, meaningful only for the local row.
    pub command_to_exec: Vec<u64>,
    pub netmsgcnt: u64,
    pub proto_ver: u16,
    pub hash: MatrixDigest,
    pub initialized: bool,
}

impl NodeRecord {
    fn zero(width: usize, proto_ver: u16) -> Self {
        NodeRecord {
            matrix_row: vec![0; width],
            command_to_exec: vec![0; width],
            netmsgcnt: 0,
            proto_ver,
            hash: MatrixDigest::zero(),
            initialized: false,
        }
    }
}

/// Ordered mapping from `NodeId` to `NodeRecord`. Column/row order is fixed
/// by `NodeId` ordering; every operation restores the square-and-consistent
/// invariant before returning (spec §4.2 invariant).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Matrix {
    ids: IndexMap<NodeId, NodeRecord>,
}

impl Matrix {
    /// Initializes a 1x1 matrix for a freshly created group.
    pub fn create(id: NodeId) -> Self {
        let mut ids = IndexMap::new();
        ids.insert(id, NodeRecord::zero(1, 0));
        Matrix { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.ids.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.ids.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeRecord> {
        self.ids.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.ids.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeRecord)> {
        self.ids.iter()
    }

    /// Column index of `id` within the current ordering, or `None` if absent.
    pub fn node_offset(&self, id: &NodeId) -> Option<usize> {
        self.ids.get_index_of(id)
    }

    /// Sorted snapshot of the current ids, the canonical ordering used for
    /// row/column indexing and for serialization.
    fn sorted_ids(&self) -> Vec<NodeId> {
        let mut v: Vec<NodeId> = self.ids.keys().copied().collect();
        v.sort();
        v
    }

    /// Rebuild the map with ids in sorted order and every row re-shaped to
    /// the new width, preserving existing cell values by id lookup.
    fn reindex(&mut self, new_ordering: &[NodeId]) {
        let old = std::mem::take(&mut self.ids);
        let mut rebuilt = IndexMap::with_capacity(new_ordering.len());
        for id in new_ordering {
            let mut rec = old.get(id).cloned().unwrap_or_else(|| {
                NodeRecord::zero(new_ordering.len(), 0)
            });
            rec.matrix_row.resize(new_ordering.len(), 0);
            rec.command_to_exec.resize(new_ordering.len(), 0);
            rebuilt.insert(*id, rec);
        }
        self.ids = rebuilt;
    }

    /// Extends the matrix with `new_ids`, sorted, inserting their columns at
    /// the sort position so global NodeId ordering holds. Each new id's row
    /// is copied from `template_row` when given, else zero. Pre-existing
    /// rows gain zero columns for the new ids.
    pub fn resize(&mut self, mut new_ids: Vec<NodeId>, template_row: Option<&[u64]>, proto_ver: u16) {
        new_ids.sort();
        new_ids.dedup();
        new_ids.retain(|id| !self.ids.contains_key(id));
        if new_ids.is_empty() {
            return;
        }

        let mut ordering = self.sorted_ids();
        ordering.extend(new_ids.iter().copied());
        ordering.sort();

        self.reindex(&ordering);

        let width = ordering.len();
        for id in &new_ids {
            if let Some(rec) = self.ids.get_mut(id) {
                let mut row = template_row.map(|r| r.to_vec()).unwrap_or_default();
                row.resize(width, 0);
                rec.matrix_row = row;
                rec.command_to_exec = vec![0; width];
                rec.proto_ver = proto_ver;
            }
        }
    }

    /// Removes `id`'s row and the corresponding column from every remaining row.
    pub fn delete(&mut self, id: &NodeId) {
        let offset = match self.node_offset(id) {
            Some(o) => o,
            None => return,
        };
        self.ids.shift_remove(id);
        for rec in self.ids.values_mut() {
            if offset < rec.matrix_row.len() {
                rec.matrix_row.remove(offset);
            }
            if offset < rec.command_to_exec.len() {
                rec.command_to_exec.remove(offset);
            }
        }
    }

    /// Elementwise-max merge of rows present in both matrices; `netmsgcnt`
    /// and `proto_ver` are also merged by max. Returns whether any cell
    /// advanced. Commutative and idempotent (Testable Property 1).
    pub fn update(&mut self, other: &Matrix) -> bool {
        let mut advanced = false;
        for (id, other_rec) in other.ids.iter() {
            if let Some(rec) = self.ids.get_mut(id) {
                let width = rec.matrix_row.len().max(other_rec.matrix_row.len());
                rec.matrix_row.resize(width, 0);
                let mut other_row = other_rec.matrix_row.clone();
                other_row.resize(width, 0);
                for (a, b) in rec.matrix_row.iter_mut().zip(other_row.iter()) {
                    if *b > *a {
                        *a = *b;
                        advanced = true;
                    }
                }
                if other_rec.netmsgcnt > rec.netmsgcnt {
                    rec.netmsgcnt = other_rec.netmsgcnt;
                    advanced = true;
                }
                if other_rec.proto_ver > rec.proto_ver {
                    rec.proto_ver = other_rec.proto_ver;
                }
                rec.initialized = rec.initialized || other_rec.initialized;
            }
        }
        advanced
    }

    /// Digest of `(NodeId‖row)` concatenated in NodeId order (spec §3 `hash`).
    pub fn digest(&self) -> MatrixDigest {
        let mut buf = Vec::new();
        for id in self.sorted_ids() {
            if let Some(rec) = self.ids.get(&id) {
                buf.extend_from_slice(id.0.as_bytes());
                for v in &rec.matrix_row {
                    buf.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        MatrixDigest(distadm_proto::crypto::sha256(&buf))
    }

    /// Per-author floor across all non-ignored rows, used by garbage
    /// collection (spec §4.3 `remove_old_commands`).
    pub fn gc_floor(&self, ignored: &[NodeId]) -> Vec<u64> {
        let width = self.ids.values().next().map(|r| r.matrix_row.len()).unwrap_or(0);
        let mut floor = vec![u64::MAX; width];
        for (id, rec) in self.ids.iter() {
            if ignored.contains(id) {
                continue;
            }
            for (i, v) in rec.matrix_row.iter().enumerate() {
                if *v < floor[i] {
                    floor[i] = *v;
                }
            }
        }
        floor
    }
}

/// Wire form used for TCP/packet exchange: ids, flattened rows, netmsgcnt,
/// proto_ver (spec §4.2 "wire form"). Hash checkpoints around this bracket
/// the document at the framed-stream layer, not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatrixWire {
    pub ids: Vec<NodeId>,
    pub rows: Vec<Vec<u64>>,
    pub netmsgcnt: Vec<u64>,
    pub proto_ver: Vec<u16>,
}

impl From<&Matrix> for MatrixWire {
    fn from(m: &Matrix) -> Self {
        let ids = m.sorted_ids();
        let rows = ids.iter().map(|id| m.ids[id].matrix_row.clone()).collect();
        let netmsgcnt = ids.iter().map(|id| m.ids[id].netmsgcnt).collect();
        let proto_ver = ids.iter().map(|id| m.ids[id].proto_ver).collect();
        MatrixWire { ids, rows, netmsgcnt, proto_ver }
    }
}

impl From<MatrixWire> for Matrix {
    fn from(w: MatrixWire) -> Self {
        let mut ids = IndexMap::new();
        for (i, id) in w.ids.iter().enumerate() {
            ids.insert(
                *id,
                NodeRecord {
                    matrix_row: w.rows.get(i).cloned().unwrap_or_default(),
                    command_to_exec: vec![0; w.ids.len()],
                    netmsgcnt: w.netmsgcnt.get(i).copied().unwrap_or(0),
                    proto_ver: w.proto_ver.get(i).copied().unwrap_or(0),
                    hash: MatrixDigest::zero(),
                    initialized: true,
                },
            );
        }
        Matrix { ids }
    }
}

/// Validator form: wire form plus `command_to_exec` per node, used only in
/// invitations (spec §4.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatrixValidator {
    pub wire: MatrixWire,
    pub command_to_exec: Vec<Vec<u64>>,
}

impl From<&Matrix> for MatrixValidator {
    fn from(m: &Matrix) -> Self {
        let wire = MatrixWire::from(m);
        let command_to_exec = wire
            .ids
            .iter()
            .map(|id| m.ids[id].command_to_exec.clone())
            .collect();
        MatrixValidator { wire, command_to_exec }
    }
}

impl From<MatrixValidator> for Matrix {
    fn from(v: MatrixValidator) -> Self {
        let mut m: Matrix = v.wire.into();
        for (i, id) in m.sorted_ids().iter().enumerate() {
            if let Some(rec) = m.ids.get_mut(id) {
                rec.command_to_exec = v.command_to_exec.get(i).cloned().unwrap_or_default();
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn rand_id() -> NodeId {
        NodeId::random(&mut thread_rng())
    }

    #[test]
    fn create_is_one_by_one() {
        let id = rand_id();
        let m = Matrix::create(id);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&id).unwrap().matrix_row, vec![0]);
    }

    #[test]
    fn resize_preserves_existing_knowledge() {
        let a = rand_id();
        let mut m = Matrix::create(a);
        m.get_mut(&a).unwrap().matrix_row = vec![5];

        let b = rand_id();
        m.resize(vec![b], None, 1);

        assert_eq!(m.len(), 2);
        let offset_a = m.node_offset(&a).unwrap();
        assert_eq!(m.get(&a).unwrap().matrix_row[offset_a], 5);
        let offset_b = m.node_offset(&b).unwrap();
        assert_eq!(m.get(&b).unwrap().matrix_row.len(), 2);
        assert_eq!(m.get(&a).unwrap().matrix_row[offset_b], 0);
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let a = rand_id();
        let b = rand_id();
        let mut m1 = Matrix::create(a);
        m1.resize(vec![b], None, 1);
        let mut m2 = m1.clone();

        m1.get_mut(&a).unwrap().matrix_row[0] = 3;
        m2.get_mut(&a).unwrap().matrix_row[0] = 7;

        let mut merged_ab = m1.clone();
        merged_ab.update(&m2);
        let mut merged_again = merged_ab.clone();
        merged_again.update(&m2);
        assert_eq!(merged_ab.get(&a).unwrap().matrix_row, merged_again.get(&a).unwrap().matrix_row);

        let mut merged_ba = m2.clone();
        merged_ba.update(&m1);
        assert_eq!(merged_ab.get(&a).unwrap().matrix_row, merged_ba.get(&a).unwrap().matrix_row);
    }

    #[test]
    fn delete_removes_row_and_column() {
        let a = rand_id();
        let b = rand_id();
        let mut m = Matrix::create(a);
        m.resize(vec![b], None, 1);
        m.delete(&a);
        assert_eq!(m.len(), 1);
        assert!(m.get(&b).unwrap().matrix_row.len() == 1);
    }

    #[test]
    fn wire_roundtrip_preserves_rows() {
        let a = rand_id();
        let b = rand_id();
        let mut m = Matrix::create(a);
        m.resize(vec![b], None, 1);
        m.get_mut(&a).unwrap().matrix_row = vec![2, 9];

        let wire = MatrixWire::from(&m);
        let back: Matrix = wire.into();
        assert_eq!(back.get(&a).unwrap().matrix_row, vec![2, 9]);
    }
}
