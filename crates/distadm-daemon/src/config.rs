//! Line-oriented config file, matching spec §6's key set.
//!
//! Grounded on `original_source/config.cpp`'s `process_line` key-by-key
//! parser and `util`'s `clap` usage for the surrounding CLI (SPEC_FULL
//! §1.1).

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    pub workdir: PathBuf,
    pub check_free_space: bool,
    pub port: u16,
    pub files_granularity: u64,
    pub listen: Vec<String>,
    pub antivirus: AntivirusConfig,
}

#[derive(Clone, Debug, Default)]
pub struct AntivirusConfig {
    pub enable: bool,
    pub scan_cmd: Option<String>,
    pub update_cmd: Option<String>,
    pub log_path: Option<String>,
    pub report_interval_secs: Option<u64>,
    pub extra: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workdir: PathBuf::from("/var/lib/distadm"),
            check_free_space: true,
            port: 13132,
            files_granularity: 0,
            listen: Vec::new(),
            antivirus: AntivirusConfig::default(),
        }
    }
}

/// Parses a `K<suffix>` byte-count value where suffix is one of
/// `K/M/G/T/P` (spec §6 "files-granularity (with K/M/G/T/P suffix)").
pub fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, mult) = match s.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 1024u64),
        'M' => (&s[..s.len() - 1], 1024u64.pow(2)),
        'G' => (&s[..s.len() - 1], 1024u64.pow(3)),
        'T' => (&s[..s.len() - 1], 1024u64.pow(4)),
        'P' => (&s[..s.len() - 1], 1024u64.pow(5)),
        _ => (s, 1u64),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

/// Result of parsing one config line: either a recognized key assignment
/// or an unrecognized line (spec §6 "Unrecognized lines produce a
/// warning").
pub enum ParsedLine {
    Recognized,
    Blank,
    Unrecognized(String),
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<(Config, Vec<String>)> {
        let text = fs::read_to_string(path)?;
        let mut cfg = Config::default();
        let mut warnings = Vec::new();
        for line in text.lines() {
            match cfg.process_line(line) {
                ParsedLine::Unrecognized(w) => warnings.push(w),
                _ => {}
            }
        }
        Ok((cfg, warnings))
    }

    /// Applies one config line in place, mirroring `config.cpp`'s
    /// `process_line` key/value split on the first whitespace run.
    pub fn process_line(&mut self, line: &str) -> ParsedLine {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return ParsedLine::Blank;
        }
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            return ParsedLine::Unrecognized(format!("malformed config line: {line:?}"));
        };
        let value = value.trim();

        match key {
            "workdir" => self.workdir = PathBuf::from(value),
            "check-free-space" => self.check_free_space = parse_bool(value),
            "port" => {
                if let Ok(p) = value.parse() {
                    self.port = p;
                }
            }
            "files-granularity" => {
                if let Some(bytes) = parse_byte_size(value) {
                    self.files_granularity = bytes;
                }
            }
            "listen" => self.listen = value.split_whitespace().map(String::from).collect(),
            "antivirus-enable" => self.antivirus.enable = parse_bool(value),
            "antivirus-scan-cmd" => self.antivirus.scan_cmd = Some(value.to_string()),
            "antivirus-update-cmd" => self.antivirus.update_cmd = Some(value.to_string()),
            "antivirus-log-path" => self.antivirus.log_path = Some(value.to_string()),
            "antivirus-report-interval" => {
                self.antivirus.report_interval_secs = value.parse().ok();
            }
            "antivirus-extra" => self.antivirus.extra = Some(value.to_string()),
            _ => return ParsedLine::Unrecognized(format!("unrecognized config key: {key}")),
        }
        ParsedLine::Recognized
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_byte_size_handles_suffixes() {
        assert_eq!(parse_byte_size("1K"), Some(1024));
        assert_eq!(parse_byte_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_byte_size("100"), Some(100));
        assert_eq!(parse_byte_size(""), None);
    }

    #[test]
    fn process_line_sets_known_keys() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.process_line("port 9999"), ParsedLine::Recognized));
        assert_eq!(cfg.port, 9999);
        assert!(matches!(cfg.process_line("files-granularity 1K"), ParsedLine::Recognized));
        assert_eq!(cfg.files_granularity, 1024);
    }

    #[test]
    fn process_line_flags_unrecognized_keys() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.process_line("bogus-key value"), ParsedLine::Unrecognized(_)));
    }

    #[test]
    fn process_line_ignores_blank_and_comment_lines() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.process_line(""), ParsedLine::Blank));
        assert!(matches!(cfg.process_line("# a comment"), ParsedLine::Blank));
    }
}
