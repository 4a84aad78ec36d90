//! `distadm` binary entry point: CLI dispatch over the five run modes
//! (`--initialize`, `--join`, `--daemon`, `--info`, `--textmode`), grounded
//! on `original_source/daemon.cpp`'s `main` dispatch and `util::main`'s
//! `clap`-driven mode selection.

use anyhow::Context;
use clap::Parser;
use distadm_core::command::CommandLog;
use distadm_core::matrix::Matrix;
use distadm_core::packet;
use distadm_core::{CoreState, GroupIdentity, NodeStatus, StateStore};
use distadm_daemon::cancellation::CancellationToken;
use distadm_daemon::core_handle::Core;
use distadm_daemon::{cli::Cli, config::Config, logging, supervision};
use distadm_net::discovery::AddressBook;
use distadm_net::endpoint::{GossipEndpoint, HandoffSlot, TOKEN_TCP_LISTENER};
use distadm_net::udp;
use distadm_proto::{GroupId, Key, NodeId, PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::io::{BufRead, Cursor, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

const DEFAULT_CONFIG_PATH: &str = "/etc/distadm.conf";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = logging::build_logger(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = load_config(&config_path, &log)?;
    std::fs::create_dir_all(&config.workdir)
        .with_context(|| format!("creating workdir {}", config.workdir.display()))?;

    if cli.initialize {
        return run_initialize(&config, &log);
    }
    if let Some(path) = &cli.join {
        return run_join(path, &config, &log);
    }
    if cli.info {
        return run_info(&config);
    }
    if cli.textmode {
        return run_textmode(&config);
    }
    run_daemon(config, log)
}

fn load_config(path: &Path, log: &slog::Logger) -> anyhow::Result<Config> {
    if !path.exists() {
        slog::warn!(log, "config file not found, using defaults"; "path" => %path.display());
        return Ok(Config::default());
    }
    let (config, warnings) = Config::load(path)?;
    for w in warnings {
        slog::warn!(log, "config warning"; "detail" => %w);
    }
    Ok(config)
}

/// `-I`/`--initialize`: becomes the first (and so far only) node of a brand
/// new group (spec §6).
fn run_initialize(config: &Config, log: &slog::Logger) -> anyhow::Result<()> {
    let store = StateStore::new(config.workdir.clone(), log.clone());
    let local_id = NodeId::random(&mut rand::thread_rng());
    let group_id = GroupId::random(&mut rand::thread_rng());
    let key = Key::random(&mut rand::thread_rng());

    store.save_group_identity(&GroupIdentity { key, group_id })?;
    store.save(&CoreState::new_group(local_id))?;

    println!("initialized new group {group_id}");
    println!("local node id: {local_id}");
    Ok(())
}

/// `-J <file>`/`--join`: reads an invitation file. A file carrying the
/// offline seed (an online invite directly followed by the seed on the same
/// stream, per `distadm_core::packet`) seeds local state from it immediately.
/// A file carrying only the online invite (Testable scenario 1's
/// online-invite bootstrap) has no seed to read locally: this node is left
/// `uninitialized`, and the running daemon completes the join live over TCP
/// once started, via the invitation sub-protocol (spec §4.4, §4.5 point 1,
/// §6).
fn run_join(path: &Path, config: &Config, log: &slog::Logger) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading invitation file {}", path.display()))?;
    let mut cursor = Cursor::new(bytes);

    print!("invitation password: ");
    std::io::stdout().flush().ok();
    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;
    let password = password.trim_end_matches(['\n', '\r']);

    let (group_id, key) = packet::read_online_invite(&mut cursor, password)
        .context("decrypting online invitation (wrong password?)")?;
    let store = StateStore::new(config.workdir.clone(), log.clone());

    match packet::read_offline_invite(&mut cursor, &key) {
        Ok(seed) => {
            // Propose several candidates up front: the joiner uses the first
            // locally, and the rest ride along in the trailer in case the
            // inviter's matrix has grown and the first now collides.
            let mut already_proposed = Vec::new();
            for _ in 0..3 {
                let c = packet::propose_candidate(&seed.matrix, &already_proposed);
                already_proposed.push(c);
            }
            let candidate = already_proposed[0];

            let mut matrix: Matrix = seed.matrix;
            matrix.resize(vec![candidate], None, PROTOCOL_VERSION);

            let mut commands = CommandLog::new();
            for cmd in seed.commands {
                commands.insert(cmd);
            }

            let state = CoreState {
                local_id: candidate,
                valid_node: true,
                status: NodeStatus::Work,
                matrix,
                aux_state: seed.aux_state,
                commands,
                users: seed.users,
                files: seed.files,
                file_assembly: Default::default(),
                invite_id: Some(seed.invite_id),
            };

            store.save_group_identity(&GroupIdentity { key, group_id })?;
            store.save(&state)?;

            let trailer_path = path.with_extension("trailer");
            let trailer = packet::Trailer {
                nonce: distadm_proto::Nonce::random(&mut rand::thread_rng()),
                candidates: already_proposed,
            };
            packet::write_trailer(std::fs::File::create(&trailer_path)?, &key, &trailer)
                .context("writing candidate trailer")?;

            println!("joined group {group_id} as {candidate}");
            println!("wrote candidate trailer to {}", trailer_path.display());
        }
        Err(_) => {
            let local_id = NodeId::random(&mut rand::thread_rng());
            store.save_group_identity(&GroupIdentity { key, group_id })?;
            store.save(&CoreState::uninitialized(local_id))?;
            println!("recorded group {group_id} identity as node {local_id}");
            println!("start the daemon to complete joining live");
        }
    }
    Ok(())
}

/// `-i`/`--info`: connects to the running daemon's query socket and prints
/// whatever it returns (spec §6 "Unix query socket").
fn run_info(config: &Config) -> anyhow::Result<()> {
    let path = config.workdir.join("query.sock");
    let mut stream = std::os::unix::net::UnixStream::connect(&path)
        .with_context(|| format!("connecting to query socket {}", path.display()))?;
    std::io::copy(&mut stream, &mut std::io::stdout())?;
    Ok(())
}

/// `-t`/`--textmode`: an interactive console against the privileged control
/// socket (spec §6 "Unix control socket").
fn run_textmode(config: &Config) -> anyhow::Result<()> {
    let path = config.workdir.join("control.sock");
    let stream = std::os::unix::net::UnixStream::connect(&path)
        .with_context(|| format!("connecting to control socket {}", path.display()))?;
    let mut writer = stream.try_clone()?;
    let mut reader = std::io::BufReader::new(stream);

    let stdin = std::io::stdin();
    loop {
        print!("distadm> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        writer.write_all(line.as_bytes())?;
        if line.trim() == "exit" {
            break;
        }
        let mut response = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            use std::io::Read;
            if reader.read(&mut byte)? == 0 {
                break;
            }
            if byte[0] == distadm_daemon::control::EOT {
                break;
            }
            response.push(byte[0]);
        }
        std::io::stdout().write_all(&response)?;
    }
    Ok(())
}

/// `-d`/`--daemon` (also the default run mode): loads persisted state,
/// starts every supervision thread, and runs the accept loop until
/// cancelled (spec §4.6 "Supervision").
fn run_daemon(config: Config, log: slog::Logger) -> anyhow::Result<()> {
    let identity_store = StateStore::new(config.workdir.clone(), log.clone());
    let identity = identity_store
        .load_group_identity()
        .context("reading group identity; run --initialize or --join first")?;
    let state = identity_store.load().context("reading persisted node state")?;

    let core_store = StateStore::new(config.workdir.clone(), log.clone());
    let core = Core::new(state, core_store, log.clone(), identity.key, config.files_granularity);

    let cancel = CancellationToken::new();
    let book = Arc::new(Mutex::new(AddressBook::new()));
    let server_busy_with = Arc::new(Mutex::new(None));
    let replay = Arc::new(Mutex::new(udp::ReplayTracker::new()));

    let tcp_addr: SocketAddr = format!("[::]:{}", config.port).parse()?;
    let mut endpoint =
        GossipEndpoint::bind(tcp_addr, &[]).with_context(|| format!("binding tcp listener on port {}", config.port))?;

    let udp_bind: SocketAddr = format!("[::]:{}", config.port).parse()?;
    let discovery_socket = std::net::UdpSocket::bind(udp_bind).context("binding udp discovery socket")?;
    let group = udp::multicast_group(&identity.group_id);
    discovery_socket
        .join_multicast_v6(&group, 0)
        .context("joining discovery multicast group")?;

    let control_path = config.workdir.join("control.sock");
    let query_path = config.workdir.join("query.sock");
    std::fs::remove_file(&control_path).ok();
    std::fs::remove_file(&query_path).ok();
    let control_listener = std::os::unix::net::UnixListener::bind(&control_path)?;
    let query_listener = std::os::unix::net::UnixListener::bind(&query_path)?;

    let handoff: Arc<HandoffSlot<TcpStream>> = Arc::new(HandoffSlot::new());

    let mut threads = Vec::new();
    threads.push(thread::spawn({
        let core = core.clone();
        let cancel = cancel.clone();
        move || supervision::run_control_socket(control_listener, core, cancel)
    }));
    threads.push(thread::spawn({
        let core = core.clone();
        let cancel = cancel.clone();
        move || supervision::run_query_socket(query_listener, core, cancel)
    }));
    threads.push(thread::spawn({
        let core = core.clone();
        let cancel = cancel.clone();
        let book = book.clone();
        let replay = replay.clone();
        let key = identity.key;
        let group_id = identity.group_id;
        move || supervision::run_discovery_loop(discovery_socket, key, group_id, core, book, replay, cancel)
    }));
    threads.push(thread::spawn({
        let core = core.clone();
        let cancel = cancel.clone();
        let book = book.clone();
        let server_busy_with = server_busy_with.clone();
        let key = identity.key;
        let group_id = identity.group_id;
        move || supervision::run_client_loop(core, key, group_id, book, server_busy_with, cancel)
    }));
    threads.push(thread::spawn({
        let core = core.clone();
        let cancel = cancel.clone();
        let handoff = handoff.clone();
        let key = identity.key;
        let group_id = identity.group_id;
        move || supervision::run_server_thread(core, key, group_id, handoff, cancel)
    }));

    slog::info!(log, "distadm daemon running"; "node" => %core.local_id(), "port" => config.port);
    run_accept_loop(&mut endpoint, &handoff, &cancel, &log);

    for handle in threads {
        handle.join().ok();
    }
    Ok(())
}

/// Drives the TCP accept side of the main poll loop: every readable event
/// on the listener token is drained, each accepted connection handed to the
/// server thread's slot, or dropped if the slot is already busy (spec §4.5
/// "If the server is already busy it closes the accepted connection").
fn run_accept_loop(
    endpoint: &mut GossipEndpoint,
    handoff: &Arc<HandoffSlot<TcpStream>>,
    cancel: &CancellationToken,
    log: &slog::Logger,
) {
    while !cancel.is_cancelled() {
        let tokens = match endpoint.poll(200) {
            Ok(t) => t,
            Err(e) => {
                slog::warn!(log, "poll error"; "error" => %e);
                continue;
            }
        };
        for token in tokens {
            if token != TOKEN_TCP_LISTENER {
                continue;
            }
            loop {
                match endpoint.tcp_listener().accept() {
                    Ok((mio_stream, addr)) => {
                        let std_stream = unsafe { TcpStream::from_raw_fd(mio_stream.into_raw_fd()) };
                        if let Err(e) = std_stream.set_nonblocking(false) {
                            slog::warn!(log, "failed to make accepted socket blocking"; "error" => %e);
                            continue;
                        }
                        if handoff.try_offer(std_stream).is_err() {
                            slog::debug!(log, "server busy, dropping connection"; "peer" => %addr);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        slog::warn!(log, "accept error"; "error" => %e);
                        break;
                    }
                }
            }
        }
    }
}
