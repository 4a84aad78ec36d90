//! Mutex-guarded handle to the authoritative node state, cloned into every
//! thread that needs to touch it.
//!
//! Grounded on the SPEC_FULL §5/§9 "mutex-guarded handle type" design note,
//! which replaces the original's implicit single-threaded access (all state
//! mutation happened on one thread in `original_source/daemon.cpp`) with an
//! explicit `Arc<parking_lot::Mutex<CoreState>>`, following the
//! `authenticator` crate's convention of a small cloneable handle wrapping
//! a lock rather than passing `&mut` state through every call site.

use distadm_core::command::{
    apply_command, create_command, execute_pending, remove_old_commands, BeforeDelete, Command,
    ExecEffect, HostExecutor, PendingSet, Payload,
};
use distadm_core::files::{split_into_segments, FileRegistry};
use distadm_core::matrix::Matrix;
use distadm_core::packet::{self, Trailer};
use distadm_core::users::UserTable;
use distadm_core::{CoreError, CoreResult, CoreState, NodeStatus, StateStore};
use distadm_proto::{InviteId, Key, NodeId};
use parking_lot::Mutex;
use slog::Logger;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

struct Shared {
    state: Mutex<CoreState>,
    store: StateStore,
    pending: Mutex<PendingSet>,
    log: Logger,
    key: Key,
    /// Segment size `author_addfile` splits at; `0` authors one whole-file
    /// command regardless of size (spec §4.3 `addfile` granularity, mirrors
    /// `config.rs`'s `files_granularity`).
    files_granularity: u64,
}

/// Cheaply cloneable, shared ownership of the one `CoreState` this process
/// manages. Every public method takes the lock for the duration of one
/// logical operation and releases it before returning, so no caller holds
/// it across I/O.
#[derive(Clone)]
pub struct Core {
    shared: Arc<Shared>,
}

impl Core {
    pub fn new(state: CoreState, store: StateStore, log: Logger, key: Key, files_granularity: u64) -> Self {
        Core {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                store,
                pending: Mutex::new(PendingSet::default()),
                log,
                key,
                files_granularity,
            }),
        }
    }

    pub fn key(&self) -> Key {
        self.shared.key
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.state.lock().local_id
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.state.lock().status
    }

    pub fn snapshot_matrix(&self) -> Matrix {
        self.shared.state.lock().matrix.clone()
    }

    pub fn persist(&self) -> CoreResult<()> {
        let state = self.shared.state.lock();
        self.shared.store.save(&state)
    }

    /// Authors and applies a new local command in one step: `work`/`inviter`
    /// status is required (spec §4.3 `create_command`'s calling convention).
    pub fn author_command(&self, value: serde_json::Value, include_depends: bool) -> CoreResult<Command> {
        let mut state = self.shared.state.lock();
        match state.status {
            NodeStatus::Work | NodeStatus::Inviter => {}
            other => {
                return Err(CoreError::InvalidTransition { from: other.as_str(), op: "author_command" })
            }
        }
        let self_id = state.local_id;
        let cmd = create_command(self_id, &mut state.matrix, value, include_depends)?;
        state.commands.insert(cmd.clone());
        drop(state);
        self.shared.pending.lock().push(cmd.id());
        Ok(cmd)
    }

    /// Merges a peer's matrix into the local one, returning whether
    /// anything advanced (spec §4.5 point 1).
    pub fn merge_matrix(&self, peer: &Matrix) -> bool {
        self.shared.state.lock().matrix.update(peer)
    }

    /// Accepts a command received from a peer and queues it for execution.
    pub fn ingest_command(&self, cmd: Command) {
        let id = cmd.id();
        self.shared.state.lock().commands.insert(cmd);
        self.shared.pending.lock().push(id);
    }

    /// Runs `execute_pending` to a fixed point, applying every newly
    /// executable command and persisting afterward. `NeedsDelSelf` effects
    /// transition the node's own status (spec §4.3).
    pub fn drain_pending(&self) -> CoreResult<Vec<(distadm_core::command::MsgId, ExecEffect)>> {
        let mut state = self.shared.state.lock();
        let mut pending = self.shared.pending.lock();

        let effects = {
            let state = &mut *state;
            execute_pending(
                state.local_id,
                &mut state.matrix,
                &state.commands,
                &mut pending,
                &mut state.aux_state,
                &mut state.users,
                &mut state.files,
                &mut state.file_assembly,
            )
        };
        for (_, effect) in &effects {
            match effect {
                ExecEffect::NeedsDelSelf => state.status = NodeStatus::Deleting,
                ExecEffect::SelfIdCollision => {
                    drop(pending);
                    drop(state);
                    let mut state = self.shared.state.lock();
                    state.reset_on_self_collision();
                    return Ok(effects);
                }
                ExecEffect::FileReady { name, bytes } => {
                    let path = self.shared.store.files_dir().join(name);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, bytes)?;
                }
                ExecEffect::None => {}
            }
        }
        drop(pending);
        self.shared.store.save(&state)?;
        Ok(effects)
    }

    /// Runs garbage collection, dispatching `hooks` for retired commands
    /// that require one (spec §4.3 `remove_old_commands`). The command log
    /// is taken out of the locked state for the duration of the hook
    /// dispatch, since `DaemonBeforeDelete`'s hooks call back into this
    /// `Core` (e.g. `author_delnoderecord`) and `parking_lot::Mutex` is not
    /// reentrant — holding the lock across the callback would deadlock.
    pub fn collect_garbage(&self, ignored: &[NodeId], hooks: &mut dyn BeforeDelete) -> Vec<distadm_core::command::MsgId> {
        let matrix_snapshot = self.shared.state.lock().matrix.clone();
        let mut log_taken = std::mem::take(&mut self.shared.state.lock().commands);

        let removed = remove_old_commands(&matrix_snapshot, &mut log_taken, ignored, hooks);

        self.shared.state.lock().commands = log_taken;
        removed
    }

    /// Applies one already-validated command directly against matrix and
    /// aux state, bypassing the pending queue — used by packet/invite
    /// ingestion, which replays a whole prefix at once (spec §4.4).
    pub fn apply_directly(&self, cmd: &Command) -> ExecEffect {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        apply_command(
            state.local_id,
            &mut state.matrix,
            &mut state.aux_state,
            &mut state.users,
            &mut state.files,
            &mut state.file_assembly,
            cmd,
        )
    }

    /// Authors a `delnoderecord` for `target`, temporarily forcing `work`
    /// status so authoring succeeds even while `inviter` (mirrors
    /// `bdm_delnode`'s save-then-restore of `status` around `create_command`).
    /// No-op if `target` is absent, or is this node's own id while other
    /// members remain (`bdmsg.cpp`'s `!id || (id == my_id && nodes.size() > 1)`
    /// skip condition).
    pub fn author_delnoderecord(&self, target: NodeId) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        if target.is_none() || (target == state.local_id && state.matrix.len() > 1) {
            return Ok(());
        }
        let prev = state.status;
        state.status = NodeStatus::Work;
        let self_id = state.local_id;
        let cmd = create_command(
            self_id,
            &mut state.matrix,
            serde_json::json!({"name": "delnoderecord", "node_id": target.to_string()}),
            false,
        )?;
        state.commands.insert(cmd.clone());
        state.status = prev;
        drop(state);
        self.shared.pending.lock().push(cmd.id());
        Ok(())
    }

    /// Thin wrapper authoring an `addnode` command, shared by the live
    /// invitation protocol's inviter side and offline `finalize_invite`.
    pub fn author_addnode(&self, target: NodeId) -> CoreResult<Command> {
        self.author_command(serde_json::json!({"name": "addnode", "node_id": target.to_string()}), false)
    }

    /// Splits `workdir/files/<name>` into `files_granularity`-sized segments
    /// and authors one `addfile` command per segment (a single whole-file
    /// command when granularity is `0`), matching `exec_addfile`'s counterpart
    /// authoring path in `incm.cpp`.
    pub fn author_addfile(&self, name: &str) -> CoreResult<Vec<Command>> {
        let content = fs::read(self.shared.store.files_dir().join(name))?;
        let segments = split_into_segments(&content, self.shared.files_granularity);
        let whole = segments.len() == 1 && self.shared.files_granularity == 0;
        let mut out = Vec::with_capacity(segments.len());
        for (from, to, bytes) in segments {
            let mut value = serde_json::json!({"name": "addfile", "filename": name});
            if !whole {
                value["from"] = serde_json::json!(from);
                value["to"] = serde_json::json!(to);
                value["size"] = serde_json::json!(content.len() as u64);
            }
            let mut state = self.shared.state.lock();
            match state.status {
                NodeStatus::Work | NodeStatus::Inviter => {}
                other => {
                    return Err(CoreError::InvalidTransition { from: other.as_str(), op: "author_addfile" })
                }
            }
            let self_id = state.local_id;
            let mut cmd = create_command(self_id, &mut state.matrix, value, false)?;
            cmd.payload = Some(Payload { bytes });
            state.commands.insert(cmd.clone());
            drop(state);
            self.shared.pending.lock().push(cmd.id());
            out.push(cmd);
        }
        Ok(out)
    }

    /// Joiner-side adoption of a fully-initialized seed received live over
    /// the invitation sub-protocol (spec §4.5 point 1): installs the
    /// inviter's matrix/aux/log/users/files as this node's own state under
    /// `candidate`, then marks the node initialized.
    pub fn adopt_seed(
        &self,
        candidate: NodeId,
        matrix: Matrix,
        aux_state: serde_json::Map<String, serde_json::Value>,
        commands: Vec<Command>,
        users: UserTable,
        files: FileRegistry,
    ) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        state.local_id = candidate;
        state.matrix = matrix;
        state.aux_state = aux_state;
        state.users = users;
        state.files = files;
        for cmd in commands {
            let id = cmd.id();
            state.commands.insert(cmd);
            self.shared.pending.lock().push(id);
        }
        state.valid_node = true;
        state.status = NodeStatus::Work;
        self.shared.store.save(&state)?;
        Ok(())
    }

    /// Begins an offline invitation: marks this node `inviter` with a fresh
    /// `invite_id`, deferring GC and new-member admission until the
    /// invitation is finalized or canceled (spec §4.5/§6 "Inviter state").
    pub fn begin_offline_invite(&self) -> InviteId {
        let mut state = self.shared.state.lock();
        let id = InviteId::random(&mut rand::thread_rng());
        state.invite_id = Some(id);
        state.status = NodeStatus::Inviter;
        id
    }

    /// Writes an online-only invitation file (no offline seed section): the
    /// fallback a joiner with no network path home still needs, matching
    /// `write_online_invite`'s standalone use in `original_source/incm.cpp`.
    pub fn write_online_invite_only<S: Read + Write>(&self, inner: S, password: &str) -> CoreResult<()> {
        let (group_id, key) = self.shared.store.load_group_identity().map(|gi| (gi.group_id, gi.key))?;
        distadm_core::packet::write_online_invite(inner, password, group_id, &key)
    }

    /// Reads a joiner's trailer file and, if the invitation is still open,
    /// authors `addnode` for the first candidate not already present in the
    /// current matrix, then clears the invite and returns to `work`
    /// (spec §4.4 invariant P2, §4.5/§6 "Inviter state").
    pub fn finalize_invite(&self, trailer_path: &Path) -> CoreResult<Option<Command>> {
        let key = self.shared.key;
        let trailer: Trailer = packet::read_trailer(fs::File::open(trailer_path)?, &key)?;
        let mut state = self.shared.state.lock();
        if state.invite_id.is_none() {
            return Ok(None);
        }
        let candidate = trailer.candidates.into_iter().find(|c| !state.matrix.contains(c));
        state.invite_id = None;
        state.status = NodeStatus::Work;
        drop(state);
        match candidate {
            Some(candidate) => Ok(Some(self.author_addnode(candidate)?)),
            None => Ok(None),
        }
    }

    /// Cancels an in-flight invitation without admitting anyone.
    pub fn cancel_invite(&self) {
        let mut state = self.shared.state.lock();
        state.invite_id = None;
        state.status = NodeStatus::Work;
    }

    /// Merges an offline packet's matrix and commands into this node's
    /// state, drains and persists (spec §4.4).
    pub fn read_packet_file(&self, path: &Path) -> CoreResult<()> {
        let key = self.shared.key;
        let contents = packet::read_packet(fs::File::open(path)?, &key)?;
        {
            let mut state = self.shared.state.lock();
            state.matrix.update(&contents.matrix);
            let mut pending = self.shared.pending.lock();
            for cmd in contents.commands {
                let id = cmd.id();
                state.commands.insert(cmd);
                pending.push(id);
            }
        }
        self.drain_pending()?;
        self.persist()
    }

    /// Dumps the full command log and matrix to a packet file. Uses
    /// `|| u64::MAX` for the free-space probe: no disk-space-probing
    /// implementation exists anywhere in this daemon (`config.rs`'s
    /// `check_free_space` is read but unconsulted), so writing never stops
    /// early.
    pub fn write_packet_file(&self, path: &Path) -> CoreResult<()> {
        let key = self.shared.key;
        let state = self.shared.state.lock();
        let commands: Vec<Command> = state.commands.iter().cloned().collect();
        let matrix = state.matrix.clone();
        drop(state);
        packet::write_packet(fs::File::create(path)?, &key, &matrix, commands.into_iter(), || u64::MAX)
    }

    pub fn logger(&self) -> &Logger {
        &self.shared.log
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&CoreState) -> R) -> R {
        f(&self.shared.state.lock())
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        f(&mut self.shared.state.lock())
    }
}

/// Production `BeforeDelete`: `delnode` re-issues a `delnoderecord` through
/// the owning `Core` (mirrors `bdm_delnode`); `delfile`/`deldir` remove the
/// actual bytes under `workdir/files` (mirrors `bdm_delfile`/`bdm_deldir`).
/// Errors are logged and swallowed, matching `before_delete_message`'s
/// catch-and-warn around each hook in `bdmsg.cpp`.
pub struct DaemonBeforeDelete {
    core: Core,
}

impl DaemonBeforeDelete {
    pub fn new(core: Core) -> Self {
        DaemonBeforeDelete { core }
    }
}

impl BeforeDelete for DaemonBeforeDelete {
    fn delnode(&mut self, target: NodeId) {
        if let Err(e) = self.core.author_delnoderecord(target) {
            slog::warn!(self.core.logger(), "before-delete delnode failed"; "error" => %e, "target" => %target);
        }
    }

    fn delfile(&mut self, filename: &str) {
        let path = self.core.shared.store.files_dir().join(filename);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                slog::warn!(self.core.logger(), "before-delete delfile failed"; "error" => %e, "filename" => filename);
            }
        }
        self.core.with_state_mut(|state| {
            state.files.remove(filename);
        });
    }

    fn deldir(&mut self, dirname: &str) {
        let path = self.core.shared.store.files_dir().join(dirname);
        if let Err(e) = fs::remove_dir_all(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                slog::warn!(self.core.logger(), "before-delete deldir failed"; "error" => %e, "dirname" => dirname);
            }
        }
    }
}

/// Test double satisfying `HostExecutor` without touching the real OS,
/// grounded on the seam documented in `distadm_core::command`.
pub struct NoopHostExecutor;

impl HostExecutor for NoopHostExecutor {
    fn run(&self, _argv: &[String]) -> CoreResult<distadm_core::command::ExecOutcome> {
        Ok(distadm_core::command::ExecOutcome { status: 0, stdout: Vec::new() })
    }
}
