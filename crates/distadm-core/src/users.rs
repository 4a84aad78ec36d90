//! Local user table replicated by `adduser`/`deluser` commands.
//!
//! Grounded on `original_source/usernames.h`/`usernames.cpp`'s `Usernames`
//! class, which tracks locally-created system accounts so a later
//! `deluser`/rewrite can target only accounts this daemon created. The
//! actual `/etc/shadow`/`useradd` manipulation is out of scope (spec.md
//! Non-goals) — this module keeps the replicated bookkeeping only, and
//! callers drive a `HostExecutor` with the entries it reports.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserTable {
    names: IndexSet<String>,
}

impl UserTable {
    pub fn new() -> Self {
        UserTable::default()
    }

    pub fn add(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.names.shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_roundtrip() {
        let mut t = UserTable::new();
        assert!(t.add("alice"));
        assert!(!t.add("alice"));
        assert!(t.contains("alice"));
        assert!(t.remove("alice"));
        assert!(!t.contains("alice"));
    }
}
