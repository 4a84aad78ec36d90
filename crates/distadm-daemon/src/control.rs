//! Privileged control socket: newline-terminated text commands, each
//! response terminated by an EOT (`0x04`) byte (spec §6 "Control socket
//! protocol").
//!
//! Grounded on `original_source/daemon.cpp`'s control-socket command
//! dispatch (a big string-keyed if/else chain) and `util`'s line-oriented
//! stdin command loop; the dispatch table here is a `match` rather than a
//! chain, matching `authenticator::core`'s style of flattening a dispatch
//! table into pattern matching (REDESIGN FLAGS).

use crate::core_handle::Core;
use distadm_proto::NodeId;
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::Path;

pub const EOT: u8 = 0x04;

/// Every supported control command name (spec §6 command table).
pub const COMMANDS: &[&str] = &[
    "help",
    "status",
    "local-id",
    "delnode",
    "listnodes",
    "addfile",
    "delfile",
    "exec",
    "showexec",
    "showlog",
    "adduser",
    "deluser",
    "write-online-invite",
    "write-offline-invite",
    "finalize-invite",
    "cancel-invite",
    "read-packet",
    "write-packet",
    "queue",
    "nodesinfo",
    "stored-commands",
    "exit",
];

/// Parses and executes one control line against `core`, returning the
/// response body (without the trailing EOT, which the caller appends once
/// writing to the socket).
pub fn dispatch(core: &Core, line: &str) -> String {
    let mut parts = line.trim().split_whitespace();
    let Some(cmd) = parts.next() else {
        return "error: empty command\n".to_string();
    };
    let args: Vec<&str> = parts.collect();

    match cmd {
        "help" => COMMANDS.join("\n") + "\n",
        "status" => format!("{}\n", core.status().as_str()),
        "local-id" => format!("{}\n", core.local_id()),
        "listnodes" => {
            let matrix = core.snapshot_matrix();
            let mut out = String::new();
            for id in matrix.ids() {
                let _ = writeln!(out, "{id}");
            }
            out
        }
        "exec" => {
            if args.is_empty() {
                return "error: exec requires a command string\n".to_string();
            }
            let value = serde_json::json!({"name": "exec", "val": args.join(" ")});
            match core.author_command(value, true) {
                Ok(c) => format!("queued seq {}\n", c.seq),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "adduser" => {
            let Some(name) = args.first() else {
                return "error: adduser requires a username\n".to_string();
            };
            let value = serde_json::json!({"name": "adduser", "username": name});
            match core.author_command(value, true) {
                Ok(c) => format!("queued seq {}\n", c.seq),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "deluser" => {
            let Some(name) = args.first() else {
                return "error: deluser requires a username\n".to_string();
            };
            let value = serde_json::json!({"name": "deluser", "username": name});
            match core.author_command(value, true) {
                Ok(c) => format!("queued seq {}\n", c.seq),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "delnode" => {
            let Some(target) = args.first().and_then(|s| s.parse::<NodeId>().ok()) else {
                return "error: delnode requires a node id\n".to_string();
            };
            let value = serde_json::json!({"name": "delnode", "node_id": target.to_string()});
            match core.author_command(value, true) {
                Ok(c) => format!("queued seq {}\n", c.seq),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "addfile" => {
            let Some(name) = args.first() else {
                return "error: addfile requires a filename under workdir/files\n".to_string();
            };
            match core.author_addfile(name) {
                Ok(cmds) => format!("queued {} segment(s)\n", cmds.len()),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "delfile" => {
            let Some(name) = args.first() else {
                return "error: delfile requires a filename\n".to_string();
            };
            let value = serde_json::json!({"name": "delfile", "filename": name});
            match core.author_command(value, true) {
                Ok(c) => format!("queued seq {}\n", c.seq),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "showexec" => core.with_state(|s| format!("{}\n", s.aux_state.get("exec").cloned().unwrap_or_default())),
        "showlog" => core.with_state(|s| format!("{}\n", s.aux_state.get("executed").cloned().unwrap_or_default())),
        "write-online-invite" => {
            let Some(out_path) = args.first() else {
                return "error: write-online-invite requires an output path\n".to_string();
            };
            let Some(password) = args.get(1) else {
                return "error: write-online-invite requires a password\n".to_string();
            };
            let file = match std::fs::File::create(out_path) {
                Ok(f) => f,
                Err(e) => return format!("error: {e}\n"),
            };
            match core.write_online_invite_only(file, password) {
                Ok(()) => format!("wrote {out_path}\n"),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "write-offline-invite" => {
            let id = core.begin_offline_invite();
            format!("invite {id} open; write the matching online invite, then finalize-invite once a trailer arrives\n")
        }
        "finalize-invite" => {
            let Some(trailer_path) = args.first() else {
                return "error: finalize-invite requires a trailer file path\n".to_string();
            };
            match core.finalize_invite(Path::new(trailer_path)) {
                Ok(Some(cmd)) => format!("admitted node, queued seq {}\n", cmd.seq),
                Ok(None) => "no invitation open or no eligible candidate\n".to_string(),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "cancel-invite" => {
            core.cancel_invite();
            "invitation canceled\n".to_string()
        }
        "read-packet" => {
            let Some(path) = args.first() else {
                return "error: read-packet requires a file path\n".to_string();
            };
            match core.read_packet_file(Path::new(path)) {
                Ok(()) => "packet merged\n".to_string(),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "write-packet" => {
            let Some(path) = args.first() else {
                return "error: write-packet requires a file path\n".to_string();
            };
            match core.write_packet_file(Path::new(path)) {
                Ok(()) => format!("wrote {path}\n"),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "queue" => {
            let effects = core.drain_pending();
            match effects {
                Ok(v) => format!("executed {} commands\n", v.len()),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "stored-commands" => core.with_state(|s| format!("{}\n", s.commands.len())),
        "nodesinfo" => {
            let matrix = core.snapshot_matrix();
            let mut out = String::new();
            for (id, rec) in matrix.iter() {
                let _ = writeln!(out, "{}\t{:?}\t{}", id, rec.matrix_row, rec.initialized);
            }
            out
        }
        "exit" => "bye\n".to_string(),
        unknown => format!("error: unknown command {unknown:?}\n"),
    }
}

/// Runs the full request/response loop for one accepted control connection:
/// reads newline-terminated commands until EOF, writing each response
/// followed by `EOT` (spec §6). `exit` ends this console session only, not
/// the daemon process.
pub fn serve_connection<R: BufRead, W: Write>(core: &Core, mut reader: R, mut writer: W) -> std::io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        let response = dispatch(core, &line);
        writer.write_all(response.as_bytes())?;
        writer.write_all(&[EOT])?;
        writer.flush()?;
        if line.trim() == "exit" {
            break;
        }
    }
    Ok(())
}
