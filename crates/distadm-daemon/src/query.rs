//! Unprivileged, read-only query socket: on connect, writes one
//! tab-separated line per known node then closes (spec §6 "Query socket").
//!
//! Grounded on `original_source/daemon.cpp`'s status-reporting socket and
//! the `online`/`antivirus`/`smart` auxiliary sections `distadm_core::state`
//! already tracks.

use crate::core_handle::Core;
use std::io::Write;

/// One row of the query response: `name\tonline\tupdated\tscanned\tfound\tsmart\n`.
pub fn format_row(core: &Core, id: &distadm_proto::NodeId) -> String {
    core.with_state(|state| {
        let online = state
            .aux_state
            .get("online")
            .and_then(|v| v.get(id.to_string().as_str()))
            .and_then(|v| v.get("online"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let av = state.aux_state.get("antivirus").and_then(|v| v.get(id.to_string().as_str()));
        let updated = av.and_then(|v| v.get("updated")).and_then(|v| v.as_bool()).unwrap_or(false);
        let scanned = av.and_then(|v| v.get("scanned")).and_then(|v| v.as_u64()).unwrap_or(0);
        let found = av.and_then(|v| v.get("found")).and_then(|v| v.as_u64()).unwrap_or(0);

        let smart = state
            .aux_state
            .get("smart")
            .and_then(|v| v.get(id.to_string().as_str()))
            .and_then(|v| v.get("healthy"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        format!("{id}\t{online}\t{updated}\t{scanned}\t{found}\t{smart}\n")
    })
}

/// Writes the full response for one query-socket connection, then the
/// caller closes the stream (spec §6: "then close").
pub fn serve_connection<W: Write>(core: &Core, mut writer: W) -> std::io::Result<()> {
    let matrix = core.snapshot_matrix();
    for id in matrix.ids() {
        let row = format_row(core, id);
        writer.write_all(row.as_bytes())?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use distadm_core::{CoreState, StateStore};
    use distadm_proto::NodeId;
    use sloggers::null::NullLoggerBuilder;
    use sloggers::Build;

    fn core() -> Core {
        let id = NodeId::random(&mut rand::thread_rng());
        let mut p = std::env::temp_dir();
        p.push(format!("distadm-query-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&p).unwrap();
        let store = StateStore::new(p, NullLoggerBuilder.build().unwrap());
        Core::new(CoreState::new_group(id), store, NullLoggerBuilder.build().unwrap())
    }

    #[test]
    fn serve_connection_emits_one_line_per_node() {
        let core = core();
        let mut output = Vec::new();
        serve_connection(&core, &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert_eq!(text.matches('\t').count(), 5);
    }
}
