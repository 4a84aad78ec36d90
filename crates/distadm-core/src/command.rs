//! Command log: signed-envelope messages with causal dependencies and a
//! deterministic execution order.
//!
//! Grounded on `original_source/commands.cpp` (`cmd_ints` dispatch table
//! keyed by `value["name"]`, `Core::exec`) and `bdmsg.cpp` (`bdm_list`
//! before-delete dispatch, `bdm_delnode`'s forced `NodeStatus::work` while
//! re-issuing `delnoderecord`). The teacher's function-pointer dispatch
//! tables become a Rust `match` over `CommandKind`, following the pattern
//! matching style of `authenticator::core::Authenticator::authenticate`
//! rather than a vtable (REDESIGN FLAGS).

use crate::error::{CoreError, CoreResult};
use crate::files::{FileRegistry, SegmentAssembler};
use crate::matrix::Matrix;
use crate::users::UserTable;
use distadm_proto::NodeId;
use hashbrown::HashMap;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};

/// In-flight segment reassembly, keyed by filename (spec §4.3 `addfile`
/// granularity). Lives alongside the matrix/aux state a node owns.
pub type FileAssembly = HashMap<String, SegmentAssembler>;

/// A file-segment payload attached to `addfile` commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    pub bytes: Vec<u8>,
}

/// Log entry (spec §3). `seq` is dense from 0 per author.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub author: NodeId,
    pub seq: u64,
    pub depends: HashMap<NodeId, u64>,
    pub value: serde_json::Value,
    pub payload: Option<Payload>,
}

/// `(author, seq)` pair, the log's primary key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MsgId {
    pub author: NodeId,
    pub seq: u64,
}

impl Command {
    pub fn id(&self) -> MsgId {
        MsgId { author: self.author, seq: self.seq }
    }

    pub fn kind(&self) -> Option<&str> {
        self.value.get("name").and_then(|v| v.as_str())
    }
}

/// The sentinel inserted in place of a command this node will never be able
/// to recover, so per-author progress cannot stall indefinitely (spec
/// invariant C1, §7).
pub const BAD_MESSAGE: &str = "BAD MESSAGE";

/// Append-only log keyed by `(author, seq)`, plus the dense per-author
/// highest-seen sequence used to detect gaps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandLog {
    entries: HashMap<MsgId, Command>,
}

impl CommandLog {
    pub fn new() -> Self {
        CommandLog::default()
    }

    pub fn get(&self, id: MsgId) -> Option<&Command> {
        self.entries.get(&id)
    }

    pub fn insert(&mut self, cmd: Command) {
        self.entries.insert(cmd.id(), cmd);
    }

    pub fn remove(&mut self, id: MsgId) -> Option<Command> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: MsgId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Commands this node has created or received but not yet executed, the
/// working set `execute_pending` selects from (spec §4.3).
#[derive(Clone, Debug, Default)]
pub struct PendingSet {
    ids: Vec<MsgId>,
}

impl PendingSet {
    pub fn push(&mut self, id: MsgId) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    pub fn remove(&mut self, id: MsgId) {
        self.ids.retain(|x| *x != id);
    }

    pub fn contains(&self, id: MsgId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Outcome of a host-program invocation, the seam `exec`/`adduser`/`deluser`
/// commands execute through rather than shelling out directly (spec §1,
/// §4.3 addition). Grounded on `original_source/usernames.cpp`'s
/// `exec_prog` and `commands.cpp`'s `exec_exec`.
#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub status: i32,
    pub stdout: Vec<u8>,
}

/// Seam for invoking host-OS programs (`adduser`, `passwd`, `systemctl`).
/// Concrete implementations live outside this crate (spec.md Non-goals);
/// only a test double is provided here.
pub trait HostExecutor: Send + Sync {
    fn run(&self, argv: &[String]) -> CoreResult<ExecOutcome>;
}

#[derive(Clone, Debug)]
pub struct AntivirusStatus {
    pub updated: bool,
    pub scanned: u64,
    pub found: u64,
}

#[derive(Clone, Debug)]
pub struct SmartStatus {
    pub healthy: bool,
}

/// Seam for antivirus/SMART environment probing (spec §1, §4.3 addition).
pub trait EnvironmentProbe: Send + Sync {
    fn antivirus_status(&self) -> Option<AntivirusStatus>;
    fn smart_status(&self) -> Option<SmartStatus>;
}

/// Effect of executing one command against the matrix/auxiliary state the
/// engine owns. `NeedsDelSelf` signals the caller (the daemon's supervision
/// layer) must transition to `deleted`, persist, and exit. `FileReady`
/// signals a complete file (whole-file `addfile`, or the last segment of a
/// split one) whose bytes the caller must write under `workdir/files`
/// (spec §4.3 `exec_addfile`'s temp-file-then-rename, minus the fs access
/// this crate otherwise avoids outside `state.rs`'s `StateStore`).
#[derive(Debug, PartialEq, Eq)]
pub enum ExecEffect {
    None,
    NeedsDelSelf,
    SelfIdCollision,
    FileReady { name: String, bytes: Vec<u8> },
}

/// Dispatches one command's effect against the matrix, auxiliary JSON
/// state, user table and file registry. Host-executor effects (actually
/// running `adduser`/`passwd`/antivirus scans) stay a caller's
/// responsibility (spec.md Non-goals) — this function only maintains the
/// replicated bookkeeping those commands carry.
pub fn apply_command(
    self_id: NodeId,
    matrix: &mut Matrix,
    aux: &mut serde_json::Map<String, serde_json::Value>,
    users: &mut UserTable,
    files: &mut FileRegistry,
    assembly: &mut FileAssembly,
    cmd: &Command,
) -> ExecEffect {
    let kind = cmd.kind().unwrap_or(BAD_MESSAGE);
    match kind {
        "addnode" => {
            let target = cmd
                .value
                .get("node_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<NodeId>().ok());
            if let Some(target) = target {
                if target == self_id && matrix.get(&self_id).map(|r| r.initialized).unwrap_or(false) {
                    return ExecEffect::SelfIdCollision;
                }
                if !matrix.contains(&target) {
                    matrix.resize(vec![target], None, 0);
                }
            }
            ExecEffect::None
        }
        "delnode" => {
            let target = cmd
                .value
                .get("node_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<NodeId>().ok());
            if target == Some(self_id) {
                return ExecEffect::NeedsDelSelf;
            }
            ExecEffect::None
        }
        "delnoderecord" => {
            let target = cmd
                .value
                .get("node_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<NodeId>().ok());
            if let Some(target) = target {
                if target == self_id {
                    return ExecEffect::NeedsDelSelf;
                }
                matrix.delete(&target);
            }
            ExecEffect::None
        }
        "online" | "antivirus" | "smart" => {
            let author_key = cmd.author.to_string();
            let section = aux.entry(kind.to_string()).or_insert_with(|| serde_json::json!({}));
            if let Some(obj) = section.as_object_mut() {
                obj.insert(author_key, cmd.value.clone());
            }
            ExecEffect::None
        }
        "exec" | "executed" | "sethostname" => {
            let section = aux.entry(kind.to_string()).or_insert_with(|| serde_json::json!([]));
            if let Some(arr) = section.as_array_mut() {
                let mut entry = cmd.value.clone();
                if let Some(obj) = entry.as_object_mut() {
                    obj.insert("node_id".to_string(), serde_json::json!(cmd.author.to_string()));
                }
                arr.push(entry);
            }
            ExecEffect::None
        }
        "adduser" => {
            if let Some(name) = cmd.value.get("username").and_then(|v| v.as_str()) {
                users.add(name);
            }
            ExecEffect::None
        }
        "deluser" => {
            if let Some(name) = cmd.value.get("username").and_then(|v| v.as_str()) {
                users.remove(name);
            }
            ExecEffect::None
        }
        // Removal itself happens at the before-delete hook fired when this
        // command is later retired by `remove_old_commands` — execution is
        // a no-op (`original_source/commands.cpp`'s `cmd_ints` maps both to
        // `nullptr`).
        "delfile" | "deldir" => ExecEffect::None,
        // Clears recorded exec history. `filter` (if present) matches
        // against the `val` field an `exec` entry was recorded under; no
        // filter clears the whole bucket (`original_source/incm.cpp`'s
        // `incm_delexec`).
        "delexec" => {
            let filter = cmd.value.get("filter").and_then(|v| v.as_str());
            if let Some(arr) = aux.get_mut("exec").and_then(|v| v.as_array_mut()) {
                match filter {
                    Some(f) => arr.retain(|e| e.get("val").and_then(|v| v.as_str()) != Some(f)),
                    None => arr.clear(),
                }
            }
            ExecEffect::None
        }
        // No per-entry filter (`incm_dellog` takes none); this clears the
        // `executed` bucket, this system's equivalent of the original's
        // execution log (`state["log"]` in `incm_showlog`).
        "dellog" => {
            if let Some(arr) = aux.get_mut("executed").and_then(|v| v.as_array_mut()) {
                arr.clear();
            }
            ExecEffect::None
        }
        "addfile" => {
            let Some(filename) = cmd.value.get("filename").and_then(|v| v.as_str()) else {
                return ExecEffect::None;
            };
            let Some(bytes) = cmd.payload.as_ref().map(|p| p.bytes.clone()) else {
                return ExecEffect::None;
            };
            let from = cmd.value.get("from").and_then(|v| v.as_u64());
            let to = cmd.value.get("to").and_then(|v| v.as_u64());
            match (from, to) {
                (Some(from), Some(_to)) => {
                    let size = cmd.value.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
                    let asm = assembly.entry(filename.to_string()).or_insert_with(SegmentAssembler::new);
                    asm.set_total(size);
                    asm.add_segment(from, bytes);
                    match asm.try_assemble() {
                        Some(full) => {
                            assembly.remove(filename);
                            files.insert(filename, full.len() as u64);
                            ExecEffect::FileReady { name: filename.to_string(), bytes: full }
                        }
                        None => ExecEffect::None,
                    }
                }
                _ => {
                    files.insert(filename, bytes.len() as u64);
                    ExecEffect::FileReady { name: filename.to_string(), bytes }
                }
            }
        }
        _ => ExecEffect::None,
    }
}

/// Appends a new command authored by `self_id`. Only valid in `work` or
/// `inviter` states — callers enforce the state check before calling this
/// (spec §4.3 `create_command`).
pub fn create_command(
    self_id: NodeId,
    matrix: &mut Matrix,
    value: serde_json::Value,
    include_depends: bool,
) -> CoreResult<Command> {
    let offset = matrix.node_offset(&self_id).ok_or(CoreError::NodeNotFound(self_id))?;
    let rec = matrix.get_mut(&self_id).unwrap();
    let seq = rec.matrix_row[offset];
    rec.matrix_row[offset] += 1;

    let depends = if include_depends {
        matrix
            .iter()
            .filter(|(id, _)| **id != self_id)
            .map(|(id, r)| {
                let off = matrix.node_offset(id).unwrap();
                (*id, r.matrix_row[off])
            })
            .collect()
    } else {
        HashMap::new()
    };

    Ok(Command { author: self_id, seq, depends, value, payload: None })
}

/// An executable command satisfies: `seq == command_to_exec[author]`, and
/// for every `depends` entry `command_to_exec[K] >= depends[K]` (spec §4.3).
fn is_executable(matrix: &Matrix, cmd: &Command) -> bool {
    let self_offset = match matrix.node_offset(&cmd.author) {
        Some(o) => o,
        None => return false,
    };
    let author_rec = match matrix.get(&cmd.author) {
        Some(r) => r,
        None => return false,
    };
    if author_rec.command_to_exec[self_offset] != cmd.seq {
        return false;
    }
    for (k, need) in &cmd.depends {
        let Some(off) = matrix.node_offset(k) else { return false };
        let Some(krec) = matrix.get(k) else { return false };
        if krec.command_to_exec[off] < *need {
            return false;
        }
    }
    true
}

/// Runs `execute_pending`: repeatedly picks a uniformly-random executable
/// command among `pending`, applies it, advances `command_to_exec`, and
/// loops until none remain. The random tie-break prevents deterministic
/// starvation when many commands become ready at once (spec §4.3).
pub fn execute_pending(
    self_id: NodeId,
    matrix: &mut Matrix,
    log: &CommandLog,
    pending: &mut PendingSet,
    aux: &mut serde_json::Map<String, serde_json::Value>,
    users: &mut UserTable,
    files: &mut FileRegistry,
    assembly: &mut FileAssembly,
) -> Vec<(MsgId, ExecEffect)> {
    let mut effects = Vec::new();
    loop {
        let candidates: Vec<MsgId> = pending
            .ids
            .iter()
            .filter(|id| log.get(**id).map(|c| is_executable(matrix, c)).unwrap_or(false))
            .copied()
            .collect();

        let Some(chosen) = candidates.choose(&mut thread_rng()).copied() else {
            break;
        };

        let cmd = log.get(chosen).expect("candidate came from the log").clone();
        let effect = apply_command(self_id, matrix, aux, users, files, assembly, &cmd);

        if let Some(off) = matrix.node_offset(&cmd.author) {
            if let Some(rec) = matrix.get_mut(&cmd.author) {
                rec.command_to_exec[off] += 1;
            }
        }
        pending.remove(chosen);
        effects.push((chosen, effect));
    }
    effects
}

/// Before-delete hook hand-off, invoked once per command at the moment it
/// is retired from the log by `remove_old_commands` (spec §4.3, §GLOSSARY).
pub trait BeforeDelete {
    fn delnode(&mut self, target: NodeId);
    fn delfile(&mut self, filename: &str);
    fn deldir(&mut self, dirname: &str);
}

/// Computes the per-author GC floor and deletes every command below it (or
/// whose author has left the matrix), dispatching `hooks` for the kinds
/// that require one before each deletion (spec §4.3 `remove_old_commands`,
/// invariant C3, Testable Property 6).
pub fn remove_old_commands(
    matrix: &Matrix,
    log: &mut CommandLog,
    ignored: &[NodeId],
    hooks: &mut dyn BeforeDelete,
) -> Vec<MsgId> {
    let floor = matrix.gc_floor(ignored);
    let ids: Vec<NodeId> = matrix.ids().copied().collect();

    let mut to_remove = Vec::new();
    for cmd in log.iter() {
        let still_present = matrix.node_offset(&cmd.author);
        let below_floor = still_present
            .map(|off| cmd.seq < floor.get(off).copied().unwrap_or(0))
            .unwrap_or(true);
        if below_floor {
            to_remove.push(cmd.id());
        }
    }
    let _ = ids;

    for id in &to_remove {
        if let Some(cmd) = log.get(*id) {
            match cmd.kind() {
                Some("delnode") => {
                    if let Some(target) = cmd
                        .value
                        .get("node_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<NodeId>().ok())
                    {
                        hooks.delnode(target);
                    }
                }
                Some("delfile") => {
                    if let Some(name) = cmd.value.get("filename").and_then(|v| v.as_str()) {
                        hooks.delfile(name);
                    }
                }
                Some("deldir") => {
                    if let Some(name) = cmd.value.get("dirname").and_then(|v| v.as_str()) {
                        hooks.deldir(name);
                    }
                }
                _ => {}
            }
        }
        log.remove(*id);
    }
    to_remove
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng as trng;

    fn rand_id() -> NodeId {
        NodeId::random(&mut trng())
    }

    #[test]
    fn create_command_advances_own_seq_and_row() {
        let a = rand_id();
        let mut m = Matrix::create(a);
        let c1 = create_command(a, &mut m, serde_json::json!({"name": "exec"}), true).unwrap();
        let c2 = create_command(a, &mut m, serde_json::json!({"name": "exec"}), true).unwrap();
        assert_eq!(c1.seq, 0);
        assert_eq!(c2.seq, 1);
    }

    #[test]
    fn execute_pending_respects_depends() {
        let a = rand_id();
        let b = rand_id();
        let mut m = Matrix::create(a);
        m.resize(vec![b], None, 1);

        let mut log = CommandLog::new();
        let mut pending = PendingSet::default();
        let mut aux = serde_json::Map::new();
        let mut users = UserTable::new();
        let mut files = FileRegistry::new();
        let mut assembly = FileAssembly::new();

        // B's command depends on A having executed seq 0, which hasn't
        // happened yet, so it must not run first.
        let blocked = Command {
            author: b,
            seq: 0,
            depends: [(a, 1)].into_iter().collect(),
            value: serde_json::json!({"name": "exec", "val": "b"}),
            payload: None,
        };
        let runnable = Command {
            author: a,
            seq: 0,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "exec", "val": "a"}),
            payload: None,
        };
        log.insert(blocked.clone());
        log.insert(runnable.clone());
        pending.push(blocked.id());
        pending.push(runnable.id());

        let effects = execute_pending(a, &mut m, &log, &mut pending, &mut aux, &mut users, &mut files, &mut assembly);
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].0, runnable.id());
        assert!(pending.contains(blocked.id()));
    }

    #[test]
    fn gc_removes_only_below_floor() {
        let a = rand_id();
        let b = rand_id();
        let mut m = Matrix::create(a);
        m.resize(vec![b], None, 1);
        // Both rows agree author a's floor is 1 (seq 0 already seen by both).
        for id in [a, b] {
            let off = m.node_offset(&a).unwrap();
            m.get_mut(&id).unwrap().matrix_row[off] = 1;
        }

        let mut log = CommandLog::new();
        log.insert(Command {
            author: a,
            seq: 0,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "exec"}),
            payload: None,
        });

        struct NoopHooks;
        impl BeforeDelete for NoopHooks {
            fn delnode(&mut self, _: NodeId) {}
            fn delfile(&mut self, _: &str) {}
            fn deldir(&mut self, _: &str) {}
        }
        let mut hooks = NoopHooks;
        let removed = remove_old_commands(&m, &mut log, &[], &mut hooks);
        assert_eq!(removed.len(), 1);
        assert!(log.is_empty());
    }

    /// Scenario: node removal. `delnode` against B reports `NeedsDelSelf`
    /// only to B; `delnoderecord` is what actually shrinks the matrix once
    /// every surviving node has executed the before-delete hook.
    #[test]
    fn delnode_flags_self_only_delnoderecord_shrinks_matrix() {
        let a = rand_id();
        let b = rand_id();
        let mut m = Matrix::create(a);
        m.resize(vec![b], None, 1);
        let mut aux = serde_json::Map::new();
        let mut users = UserTable::new();
        let mut files = FileRegistry::new();
        let mut assembly = FileAssembly::new();

        let delnode = Command {
            author: a,
            seq: 0,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "delnode", "node_id": b.to_string()}),
            payload: None,
        };

        assert_eq!(
            apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &delnode),
            ExecEffect::None
        );
        assert_eq!(
            apply_command(b, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &delnode),
            ExecEffect::NeedsDelSelf
        );

        let delnoderecord = Command {
            author: a,
            seq: 1,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "delnoderecord", "node_id": b.to_string()}),
            payload: None,
        };
        apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &delnoderecord);
        assert!(!m.contains(&b));
        assert_eq!(m.len(), 1);
    }

    /// Scenario: addfile with granularity. A 2500-byte file split at 1K
    /// granularity arrives as three segment commands in arbitrary order;
    /// only the one completing full coverage reports `FileReady`, and the
    /// file registry gains the entry exactly once.
    #[test]
    fn addfile_segments_assemble_into_one_file_ready_effect() {
        let a = rand_id();
        let mut m = Matrix::create(a);
        let mut aux = serde_json::Map::new();
        let mut users = UserTable::new();
        let mut files = FileRegistry::new();
        let mut assembly = FileAssembly::new();

        let content = vec![9u8; 2500];
        let segments = crate::files::split_into_segments(&content, 1024);
        assert_eq!(segments.len(), 3);

        let mut last_effect = ExecEffect::None;
        for (seq, (from, to, bytes)) in segments.into_iter().enumerate() {
            let cmd = Command {
                author: a,
                seq: seq as u64,
                depends: HashMap::new(),
                value: serde_json::json!({"name": "addfile", "filename": "big.bin", "from": from, "to": to, "size": content.len() as u64}),
                payload: Some(Payload { bytes }),
            };
            last_effect = apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &cmd);
        }
        match last_effect {
            ExecEffect::FileReady { name, bytes } => {
                assert_eq!(name, "big.bin");
                assert_eq!(bytes, content);
            }
            other => panic!("expected FileReady, got {other:?}"),
        }
        assert_eq!(files.get("big.bin").map(|e| e.size), Some(2500));
        assert!(assembly.is_empty());
    }

    #[test]
    fn adduser_and_deluser_maintain_the_user_table() {
        let a = rand_id();
        let mut m = Matrix::create(a);
        let mut aux = serde_json::Map::new();
        let mut users = UserTable::new();
        let mut files = FileRegistry::new();
        let mut assembly = FileAssembly::new();

        let adduser = Command {
            author: a,
            seq: 0,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "adduser", "username": "alice"}),
            payload: None,
        };
        apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &adduser);
        assert!(users.contains("alice"));

        let deluser = Command {
            author: a,
            seq: 1,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "deluser", "username": "alice"}),
            payload: None,
        };
        apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &deluser);
        assert!(!users.contains("alice"));
    }

    #[test]
    fn delexec_with_filter_removes_only_the_matching_entry() {
        let a = rand_id();
        let mut m = Matrix::create(a);
        let mut aux = serde_json::Map::new();
        let mut users = UserTable::new();
        let mut files = FileRegistry::new();
        let mut assembly = FileAssembly::new();

        for (seq, val) in ["echo a", "echo b"].into_iter().enumerate() {
            let cmd = Command {
                author: a,
                seq: seq as u64,
                depends: HashMap::new(),
                value: serde_json::json!({"name": "exec", "val": val}),
                payload: None,
            };
            apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &cmd);
        }
        assert_eq!(aux.get("exec").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));

        let delexec = Command {
            author: a,
            seq: 2,
            depends: HashMap::new(),
            value: serde_json::json!({"name": "delexec", "filter": "echo a"}),
            payload: None,
        };
        apply_command(a, &mut m, &mut aux, &mut users, &mut files, &mut assembly, &delexec);
        let remaining = aux.get("exec").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get("val").and_then(|v| v.as_str()), Some("echo b"));
    }

    /// Scenario: three-way concurrent authorship. A, B and C each author an
    /// `exec` independently; once every node's log holds all three commands
    /// and runs them to completion, `aux["exec"]` agrees everywhere and each
    /// entry carries the right author.
    #[test]
    fn three_way_concurrent_exec_merges_to_the_same_aux_state_everywhere() {
        let a = rand_id();
        let b = rand_id();
        let c = rand_id();

        let mut seed = Matrix::create(a);
        seed.resize(vec![b, c], None, 1);

        let commands: Vec<Command> = [a, b, c]
            .into_iter()
            .map(|author| Command {
                author,
                seq: 0,
                depends: HashMap::new(),
                value: serde_json::json!({"name": "exec", "val": format!("echo {author}")}),
                payload: None,
            })
            .collect();

        let mut final_aux: Option<serde_json::Value> = None;
        for viewpoint in [a, b, c] {
            let mut m = seed.clone();
            let mut log = CommandLog::new();
            let mut pending = PendingSet::default();
            let mut aux = serde_json::Map::new();
            let mut users = UserTable::new();
            let mut files = FileRegistry::new();
            let mut assembly = FileAssembly::new();
            for cmd in &commands {
                log.insert(cmd.clone());
                pending.push(cmd.id());
            }
            let effects =
                execute_pending(viewpoint, &mut m, &log, &mut pending, &mut aux, &mut users, &mut files, &mut assembly);
            assert_eq!(effects.len(), 3);
            assert!(pending.is_empty());

            let exec_entries = aux.get("exec").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            assert_eq!(exec_entries.len(), 3);
            let authors: std::collections::HashSet<_> =
                exec_entries.iter().filter_map(|e| e.get("node_id").and_then(|v| v.as_str())).collect();
            assert_eq!(authors.len(), 3);

            match &final_aux {
                None => final_aux = Some(serde_json::Value::Object(aux)),
                Some(prev) => assert_eq!(prev.get("exec"), Some(&serde_json::Value::Array(exec_entries))),
            }
        }
    }
}
