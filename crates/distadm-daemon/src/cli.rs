//! Command line flags (spec §6).
//!
//! Grounded on `util`'s `clap::Parser` derive usage for its own CLI surface.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "distadm", about = "peer-to-peer shared administration daemon")]
pub struct Cli {
    /// Run as a background daemon, forking off any controlling terminal.
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Print a one-shot status summary and exit.
    #[arg(short = 'i', long = "info")]
    pub info: bool,

    /// Run the interactive control console against the control socket.
    #[arg(short = 't', long = "textmode")]
    pub textmode: bool,

    /// Create a brand-new group, becoming its first node.
    #[arg(short = 'I', long = "initialize")]
    pub initialize: bool,

    /// Join an existing group using an invitation file.
    #[arg(short = 'J', long = "join", value_name = "FILE")]
    pub join: Option<PathBuf>,

    /// Path to the config file (spec §6 key set).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity; repeatable.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Stay in the foreground even with --daemon (debugging aid).
    #[arg(short = 'f')]
    pub foreground: bool,
}
