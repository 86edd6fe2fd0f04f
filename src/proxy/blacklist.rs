//! Substring hostname blocklist, read-only after construction.

use std::fs;
use std::io;
use std::path::Path;

/// Blocked-hostname entries. A hostname is blocked when any entry is a
/// substring of it, so `example.test` blocks `cdn.example.test` too.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: Vec<String>,
}

impl Blacklist {
    pub fn new() -> Blacklist {
        Blacklist::default()
    }

    /// Loads one entry per non-empty line of `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Blacklist> {
        let contents = fs::read_to_string(path)?;
        let entries = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(Blacklist { entries })
    }

    pub fn add_entry(&mut self, entry: String) {
        self.entries.push(entry);
    }

    /// True when any entry is a substring of `hostname`.
    pub fn is_blocked(&self, hostname: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| hostname.contains(entry.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
