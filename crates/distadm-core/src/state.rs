//! Authoritative node state: identity, group key, status, matrix, command
//! log, user table, file registry, auxiliary JSON state; atomic
//! save-with-backup persistence.
//!
//! Grounded on `original_source/core.h`'s `CoreBase`/`Core` (status field,
//! `group_id`/`my_id`/`crypt_key`, `load`/`save`) and its private
//! `save_group_id`/`save_nodes`/`save_commands`/`save_filenames` plus the
//! `load_from_bkup` fallback (spec §4.7), adapted to the teacher's
//! `serde_json::from_reader` config-loading idiom in
//! `authenticator::main`.

use crate::command::{CommandLog, FileAssembly};
use crate::error::{CoreError, CoreResult};
use crate::files::FileRegistry;
use crate::matrix::Matrix;
use crate::users::UserTable;
use distadm_proto::{GroupId, InviteId, Key, NodeId};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Node lifecycle state (spec §3 "Node lifecycle state" table).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Uninitialized,
    PartiallyInitialized,
    Work,
    Inviter,
    Deleting,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Uninitialized => "uninitialized",
            NodeStatus::PartiallyInitialized => "partially-initialized",
            NodeStatus::Work => "work",
            NodeStatus::Inviter => "inviter",
            NodeStatus::Deleting => "deleting",
            NodeStatus::Deleted => "deleted",
        }
    }
}

/// Group identity blob, `workdir/group-id` (spec §3 "group-identity blob").
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupIdentity {
    pub key: Key,
    pub group_id: GroupId,
}

/// Free-form per-reporting-node JSON state (`online`/`antivirus`/`smart`
/// sections), mirroring `original_source/core.h`'s `Json::Value state`
/// (SPEC_FULL §3 addition).
pub type AuxState = serde_json::Map<String, serde_json::Value>;

/// The full authoritative state of one node (spec §3 "node-state JSON").
#[derive(Clone, Serialize, Deserialize)]
pub struct CoreState {
    pub local_id: NodeId,
    pub valid_node: bool,
    pub status: NodeStatus,
    pub matrix: Matrix,
    #[serde(default)]
    pub aux_state: AuxState,
    pub commands: CommandLog,
    #[serde(default)]
    pub users: UserTable,
    #[serde(default)]
    pub files: FileRegistry,
    #[serde(default)]
    pub file_assembly: FileAssembly,
    pub invite_id: Option<InviteId>,
}

impl CoreState {
    /// Fresh state for a brand-new group (`--initialize`, spec §6).
    pub fn new_group(local_id: NodeId) -> Self {
        CoreState {
            local_id,
            valid_node: true,
            status: NodeStatus::Work,
            matrix: Matrix::create(local_id),
            aux_state: AuxState::new(),
            commands: CommandLog::new(),
            users: UserTable::new(),
            files: FileRegistry::new(),
            file_assembly: FileAssembly::new(),
            invite_id: None,
        }
    }

    /// Fresh state for a node that has only a group key and is seeking an
    /// inviter (spec §3 "uninitialized").
    pub fn uninitialized(local_id: NodeId) -> Self {
        CoreState {
            local_id,
            valid_node: false,
            status: NodeStatus::Uninitialized,
            matrix: Matrix::create(local_id),
            aux_state: AuxState::new(),
            commands: CommandLog::new(),
            users: UserTable::new(),
            files: FileRegistry::new(),
            file_assembly: FileAssembly::new(),
            invite_id: None,
        }
    }

    /// Open question resolution (SPEC_FULL §9 / spec.md §9): on a self-id
    /// collision, fully reset to `uninitialized` with `valid_node = false`,
    /// rather than the original's partial reset that left `valid_node`
    /// untouched.
    pub fn reset_on_self_collision(&mut self) {
        self.status = NodeStatus::Uninitialized;
        self.valid_node = false;
    }
}

/// Where persisted state lives on disk: `workdir/group-id`, `workdir/node`
/// (+ `node~` backup), `workdir/files/` (spec §6 "Persisted state layout").
pub struct StateStore {
    workdir: PathBuf,
    log: Logger,
}

impl StateStore {
    pub fn new(workdir: impl Into<PathBuf>, log: Logger) -> Self {
        StateStore { workdir: workdir.into(), log }
    }

    fn group_id_path(&self) -> PathBuf {
        self.workdir.join("group-id")
    }

    fn node_path(&self) -> PathBuf {
        self.workdir.join("node")
    }

    fn node_backup_path(&self) -> PathBuf {
        self.workdir.join("node~")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.workdir.join("files")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.workdir.join("tmp")
    }

    /// `workdir/group-id` is a raw binary blob: 32-byte key + 16-byte id
    /// (spec §6), not JSON — this is the one file in the layout that isn't.
    pub fn load_group_identity(&self) -> CoreResult<GroupIdentity> {
        let raw = fs::read(self.group_id_path())?;
        if raw.len() != Key::SIZE + distadm_proto::Id128::SIZE {
            return Err(CoreError::Persistence("group-id file has unexpected length".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw[..32]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&raw[32..48]);
        Ok(GroupIdentity {
            key: Key(key),
            group_id: GroupId(distadm_proto::Id128::from_bytes(id)),
        })
    }

    pub fn save_group_identity(&self, identity: &GroupIdentity) -> CoreResult<()> {
        let mut raw = Vec::with_capacity(48);
        raw.extend_from_slice(&identity.key.0);
        raw.extend_from_slice(identity.group_id.0.as_bytes());
        atomic_write(&self.group_id_path(), &raw)?;
        Ok(())
    }

    /// Writes `workdir/node`, first rotating the previous copy to `node~`
    /// (spec §4.7 "rename-then-atomic-create-then-write").
    pub fn save(&self, state: &CoreState) -> CoreResult<()> {
        fs::create_dir_all(&self.workdir)?;
        let node_path = self.node_path();
        if node_path.exists() {
            fs::rename(&node_path, self.node_backup_path())?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        atomic_write(&node_path, &json)?;
        Ok(())
    }

    /// Loads `workdir/node`, falling back to `workdir/node~` if the primary
    /// fails to parse (spec §4.7, §7 "Config / persistence errors").
    pub fn load(&self) -> CoreResult<CoreState> {
        match self.load_from(&self.node_path()) {
            Ok(state) => Ok(state),
            Err(primary_err) => {
                slog::warn!(self.log, "primary state file unreadable, trying backup"; "error" => %primary_err);
                self.load_from(&self.node_backup_path())
            }
        }
    }

    fn load_from(&self, path: &Path) -> CoreResult<CoreState> {
        let raw = fs::read(path)?;
        let state: CoreState = serde_json::from_slice(&raw)?;
        if !state.valid_node {
            slog::warn!(self.log, "loaded state has valid_node=false, bootstrap may be incomplete");
        }
        Ok(state)
    }
}

/// Writes `path` via a temp file in the same directory followed by an
/// atomic rename, so a crash mid-write never leaves a torn file (spec §4.7,
/// §5 "all file writes go through atomic create-and-rename").
fn atomic_write(path: &Path, data: &[u8]) -> CoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;
    use sloggers::null::NullLoggerBuilder;
    use sloggers::Build;

    fn logger() -> Logger {
        NullLoggerBuilder.build().unwrap()
    }

    #[test]
    fn save_then_load_roundtrips_state() {
        let dir = tempdir();
        let store = StateStore::new(dir.clone(), logger());
        let id = NodeId::random(&mut thread_rng());
        let state = CoreState::new_group(id);

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.local_id, id);
        assert_eq!(loaded.status, NodeStatus::Work);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn load_falls_back_to_backup_on_corrupt_primary() {
        let dir = tempdir();
        let store = StateStore::new(dir.clone(), logger());
        let id = NodeId::random(&mut thread_rng());
        let state = CoreState::new_group(id);

        store.save(&state).unwrap();
        store.save(&state).unwrap(); // rotates node -> node~, writes fresh node
        std::fs::write(store.node_path(), b"{not json").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.local_id, id);

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("distadm-core-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
