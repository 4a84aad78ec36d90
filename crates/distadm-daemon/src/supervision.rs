//! Main poll loop, client/server session threads, and the announcement
//! scheduler tying `distadm_net` and `distadm_core` together into a running
//! daemon.
//!
//! Grounded on `original_source/daemon.cpp`'s `Daemon::run` (one poll loop
//! dispatching control socket, query socket, UDP, and TCP-listener
//! readiness, handing off accepted connections to a worker thread) and
//! `corenet.cpp`'s client-side connect/retry loop. Thread split follows
//! `neutronium::net::endpoint::Endpoint`'s separation of the poll-driven
//! accept path from the blocking per-connection work it hands off.

use crate::cancellation::CancellationToken;
use crate::core_handle::Core;
use distadm_net::backoff::{next_backoff, SOCKET_TIMEOUT};
use distadm_net::discovery::{is_interesting, pick_candidate, AddressBook};
use distadm_net::endpoint::HandoffSlot;
use distadm_net::handshake::{read_helo, write_helo, TcpHeloMsg};
use distadm_net::session::{
    find_gap, read_accept, read_liveness, read_matrix, read_propose, read_request, read_response, read_seed,
    record_received, write_accept, write_liveness, write_matrix, write_propose, write_request, write_response,
    write_seed, DownloadTracker, Role, SeedContents, REQUEST_LOOP_ROUNDS,
};
use distadm_net::udp;
use distadm_core::matrix::MatrixWire;
use distadm_core::packet::propose_candidate;
use distadm_proto::stream::{BufferedStream, FramedReader, FramedWriter};
use distadm_proto::{GroupId, Key, NodeId, PROTOCOL_VERSION};
use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Period between unsolicited UDP HELO announcements (spec §4.5). Pure
/// scheduling decision, kept separate from socket I/O so it is testable.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct AnnounceScheduler {
    last: Option<Instant>,
    interval: Duration,
}

impl AnnounceScheduler {
    pub fn new(interval: Duration) -> Self {
        AnnounceScheduler { last: None, interval }
    }

    /// Returns `true` (and records `now`) if an announcement is due.
    pub fn tick(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Runs the control-socket accept loop on its own thread: one connection at
/// a time, each served to completion by `crate::control::serve_connection`
/// (spec §6 control socket is privileged and single-client by convention).
pub fn run_control_socket(listener: UnixListener, core: Core, cancel: CancellationToken) {
    for stream in listener.incoming() {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(stream) = stream else { continue };
        let reader = BufReader::new(stream.try_clone().expect("unix stream clone"));
        let writer = BufWriter::new(stream);
        if let Err(e) = crate::control::serve_connection(&core, reader, writer) {
            slog::warn!(core.logger(), "control connection ended with error"; "error" => %e);
        }
    }
}

/// Runs the query-socket accept loop: every connection gets one batch
/// response then is closed (spec §6 query socket).
pub fn run_query_socket(listener: UnixListener, core: Core, cancel: CancellationToken) {
    for stream in listener.incoming() {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(stream) = stream else { continue };
        if let Err(e) = crate::query::serve_connection(&core, stream) {
            slog::warn!(core.logger(), "query connection ended with error"; "error" => %e);
        }
    }
}

/// Runs the client side of the gossip protocol: repeatedly picks an
/// interesting candidate, connects, performs the handshake and the request
/// loop, then merges whatever the peer taught us. Sleeps via the
/// cancellable `next_backoff` wait after every attempt, successful or not
/// (spec §4.5 "Connection retry").
pub fn run_client_loop(
    core: Core,
    key: Key,
    group_id: GroupId,
    book: Arc<parking_lot::Mutex<AddressBook>>,
    server_busy_with: Arc<parking_lot::Mutex<Option<std::net::SocketAddr>>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let local_matrix = core.snapshot_matrix();
        let self_id = core.local_id();
        let exclude = *server_busy_with.lock();
        let candidate = {
            let book = book.lock();
            pick_candidate(&book, &local_matrix, self_id, &Default::default(), exclude)
        };

        let Some(addr) = candidate else {
            cancel.wait_for(ANNOUNCE_INTERVAL);
            continue;
        };

        match run_one_client_session(&core, &key, group_id, addr) {
            Ok(()) => {}
            Err(e) => {
                slog::debug!(core.logger(), "client session failed"; "peer" => %addr, "error" => %e);
                book.lock().forget(&addr);
            }
        }
        cancel.wait_for(next_backoff());
    }
}

fn run_one_client_session(
    core: &Core,
    key: &Key,
    group_id: GroupId,
    addr: std::net::SocketAddr,
) -> distadm_net::NetResult<()> {
    let stream = TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT)?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    run_session(core, key, group_id, stream, Role::Client)
}

/// Runs the server side of one accepted TCP connection, handed off from
/// the main poll thread via `HandoffSlot` (spec §4.5/§5).
pub fn run_server_thread(core: Core, key: Key, group_id: GroupId, slot: Arc<HandoffSlot<TcpStream>>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(stream) = slot.take() else {
            cancel.wait_for(Duration::from_millis(200));
            continue;
        };
        if let Err(e) = run_session(&core, &key, group_id, stream, Role::Server) {
            slog::debug!(core.logger(), "server session failed"; "error" => %e);
        }
    }
}

/// Shared handshake + request-loop body for both client and server roles
/// (spec §4.5 "Session protocol"). Each direction of the connection gets
/// its own cloned socket handle and its own `BufferedStream`, mirroring
/// `ICstream`/`OCstream` being independent objects over the same
/// descriptor in `original_source/ccstream.h` rather than one shared
/// read/write cache.
fn run_session(core: &Core, key: &Key, group_id: GroupId, stream: TcpStream, role: Role) -> distadm_net::NetResult<()> {
    let self_id = core.local_id();
    let local_matrix = core.snapshot_matrix();

    let helo = TcpHeloMsg {
        node_id: self_id,
        node_hash: local_matrix.digest(),
        msg_cnt: local_matrix.get(&self_id).map(|r| r.netmsgcnt).unwrap_or(0),
        version: PROTOCOL_VERSION,
        initialized: core.with_state(|s| s.valid_node),
    };

    let write_handle = stream.try_clone()?;
    let read_handle = stream;

    let write_buf = BufferedStream::new(write_handle, true);
    let read_buf = BufferedStream::new(read_handle, true);

    let (write_buf, read_buf, peer_helo) = match role {
        Role::Client => {
            let write_buf = write_helo(write_buf, key, &helo)?;
            let (peer, read_buf) = read_helo(read_buf, key)?;
            (write_buf, read_buf, peer)
        }
        Role::Server => {
            let (peer, read_buf) = read_helo(read_buf, key)?;
            let write_buf = write_helo(write_buf, key, &helo)?;
            (write_buf, read_buf, peer)
        }
    };

    let _ = group_id;
    if !is_interesting(&local_matrix, self_id, &peer_to_known(&peer_helo), peer_helo.node_hash) {
        return Ok(());
    }

    let mut writer = FramedWriter::new(write_buf, key)?;
    let mut reader = FramedReader::new(read_buf, key)?;

    // One side uninitialized: run the invitation sub-protocol instead of the
    // ordinary matrix/request exchange, then terminate the session (spec
    // §4.5 point 1: "Once completed, both sides skip to termination").
    if peer_helo.initialized != helo.initialized {
        if helo.initialized {
            run_inviter_side(core, &mut writer, &mut reader)?;
        } else {
            run_joiner_side(core, &mut writer, &mut reader)?;
        }
        writer.close()?;
        core.drain_pending().map_err(distadm_net::NetError::Core)?;
        core.persist().map_err(distadm_net::NetError::Core)?;
        return Ok(());
    }

    write_liveness(&mut writer, true)?;
    let _peer_alive = read_liveness(&mut reader)?;

    write_matrix(&mut writer, &local_matrix)?;
    let peer_matrix = read_matrix(&mut reader)?;
    core.merge_matrix(&peer_matrix);

    let mut tracker = DownloadTracker::new();
    for _round in 0..REQUEST_LOOP_ROUNDS {
        let local_matrix = core.snapshot_matrix();
        let want = find_gap(self_id, &local_matrix, peer_helo.node_id, &peer_matrix, &tracker);
        if let Some(id) = want {
            tracker.mark(id);
        }
        write_request(&mut writer, want)?;

        let their_want = read_request(&mut reader)?;
        let response = their_want.and_then(|id| core.with_state(|s| s.commands.get(id).cloned()));
        write_response(&mut writer, response.as_ref())?;

        let got = read_response(&mut reader)?;
        if let (Some(id), Some(cmd)) = (want, got) {
            tracker.clear(id);
            core.with_state_mut(|s| record_received(&mut s.matrix, &mut s.commands, self_id, cmd));
        }
    }

    writer.close()?;
    core.drain_pending().map_err(distadm_net::NetError::Core)?;
    core.persist().map_err(distadm_net::NetError::Core)?;

    // Right after a round that just advanced the matrix via merge and the
    // request loop is when retired commands are most likely to have just
    // crossed every row's floor (spec §4.3 "once all matrix rows have
    // advanced past a command, garbage collection deletes it").
    let mut hooks = crate::core_handle::DaemonBeforeDelete::new(core.clone());
    core.collect_garbage(&[], &mut hooks);
    Ok(())
}

/// Inviter side of the live invitation sub-protocol: streams the full seed,
/// then loops accepting or rejecting proposed candidate ids until one is
/// accepted and authored as `addnode` (spec §4.5 point 1).
fn run_inviter_side<W: std::io::Read + std::io::Write, R: std::io::Read + std::io::Write>(
    core: &Core,
    writer: &mut FramedWriter<W>,
    reader: &mut FramedReader<R>,
) -> distadm_net::NetResult<()> {
    let seed = core.with_state(|s| SeedContents {
        matrix: MatrixWire::from(&s.matrix),
        aux_state: serde_json::Value::Object(s.aux_state.clone()),
        commands: s.commands.iter().cloned().collect(),
        users: s.users.clone(),
        files: s.files.clone(),
    });
    write_seed(writer, &seed)?;

    loop {
        let candidate = read_propose(reader)?;
        let accepted = core.with_state(|s| !s.matrix.contains(&candidate));
        write_accept(writer, accepted)?;
        if accepted {
            core.author_addnode(candidate).map_err(distadm_net::NetError::Core)?;
            break;
        }
    }
    Ok(())
}

/// Joiner side: reads the seed, then repeatedly proposes a candidate id
/// until the inviter accepts one, installing the seed under that id
/// (spec §4.5 point 1).
fn run_joiner_side<W: std::io::Read + std::io::Write, R: std::io::Read + std::io::Write>(
    core: &Core,
    writer: &mut FramedWriter<W>,
    reader: &mut FramedReader<R>,
) -> distadm_net::NetResult<()> {
    let seed = read_seed(reader)?;
    let matrix: distadm_core::matrix::Matrix = seed.matrix.into();
    let aux_state = match seed.aux_state {
        serde_json::Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };

    let mut proposed: Vec<NodeId> = Vec::new();
    loop {
        let candidate = propose_candidate(&matrix, &proposed);
        proposed.push(candidate);
        write_propose(writer, candidate)?;
        if read_accept(reader)? {
            core.adopt_seed(candidate, matrix, aux_state, seed.commands, seed.users, seed.files)
                .map_err(distadm_net::NetError::Core)?;
            break;
        }
    }
    Ok(())
}

fn peer_to_known(helo: &TcpHeloMsg) -> distadm_net::discovery::KnownPeer {
    distadm_net::discovery::KnownPeer {
        addr: "[::1]:0".parse().unwrap(),
        node_id: helo.node_id,
        last_seen: Instant::now(),
        initialized: helo.initialized,
    }
}

/// Listens for UDP announcements and maintains the shared `AddressBook`,
/// also answering with our own HELO when we see a peer we don't know
/// (spec §4.5 "On receive").
pub fn run_discovery_loop(
    socket: std::net::UdpSocket,
    key: Key,
    group_id: GroupId,
    core: Core,
    book: Arc<parking_lot::Mutex<AddressBook>>,
    replay: Arc<parking_lot::Mutex<udp::ReplayTracker>>,
    cancel: CancellationToken,
) {
    socket.set_read_timeout(Some(Duration::from_millis(500))).ok();
    let mut buf = [0u8; 2048];
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => match udp::decode(&buf[..n], &key) {
                Ok(msg) if msg.group_id == group_id => {
                    let suspicious = replay.lock().observe(msg.node_id, msg.counter);
                    if suspicious {
                        slog::warn!(core.logger(), "possible udp replay/spoof"; "peer" => %from);
                    }
                    match msg.command {
                        udp::UdpCommand::Bye => book.lock().forget(&from),
                        _ => book.lock().bind(from, msg.node_id, msg.command != udp::UdpCommand::NotInitialized),
                    }
                }
                Ok(_) => {}
                Err(_) => {}
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => slog::warn!(core.logger(), "udp recv error"; "error" => %e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_scheduler_fires_first_tick_then_waits_out_interval() {
        let mut sched = AnnounceScheduler::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(sched.tick(t0));
        assert!(!sched.tick(t0 + Duration::from_secs(5)));
        assert!(sched.tick(t0 + Duration::from_secs(11)));
    }
}
