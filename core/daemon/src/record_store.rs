//! Deduplicated, most-recent-first command line lists.
//!
//! `CmdList` backs the "recent commands" views. Every command line appears at
//! most once; re-adding a line moves it to the front. The index map is kept in
//! exact agreement with list positions after every mutation.
//!
//! `EnrichedHistory` keeps the full records in log order for search
//! consumers, indexed by command line.

use std::collections::{HashMap, VecDeque};

use histd_protocol::Record;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdList {
    list: VecDeque<String>,
    index: HashMap<String, usize>,
}

impl CmdList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `cmd_line` to the front of the list.
    pub fn add_cmd_line(&mut self, cmd_line: &str) {
        let shifted = match self.position(cmd_line) {
            Some(0) => return,
            Some(old) => {
                if let Some(line) = self.list.remove(old) {
                    self.list.push_front(line);
                }
                old
            }
            None => {
                self.list.push_front(cmd_line.to_string());
                self.list.len() - 1
            }
        };

        // Positions 0..=shifted moved; everything past `shifted` kept its slot.
        for (position, line) in self.list.iter().enumerate().take(shifted + 1) {
            if let Some(slot) = self.index.get_mut(line) {
                *slot = position;
            } else {
                self.index.insert(line.clone(), position);
            }
        }
    }

    pub fn position(&self, cmd_line: &str) -> Option<usize> {
        self.index.get(cmd_line).copied()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Most recent first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &str> + '_ {
        self.list.iter().map(String::as_str)
    }

    pub fn recent(&self, limit: usize) -> Vec<String> {
        self.list.iter().take(limit).cloned().collect()
    }

    /// Independent deep copy used to seed derived histories.
    pub fn copy(&self) -> Self {
        Self {
            list: self.list.iter().cloned().collect(),
            index: self
                .index
                .iter()
                .map(|(line, position)| (line.clone(), *position))
                .collect(),
        }
    }

    /// Replays `other` oldest-first through this list's own dedup logic, so
    /// the most recent line of `other` ends up at the front.
    pub fn add_all(&mut self, other: &CmdList) {
        for line in other.iter().rev() {
            self.add_cmd_line(line);
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.list.len(), self.index.len(), "index size drifted");
        for (position, line) in self.list.iter().enumerate() {
            assert_eq!(
                self.index.get(line),
                Some(&position),
                "index disagrees for {line:?}"
            );
        }
    }
}

impl<'a> FromIterator<&'a str> for CmdList {
    /// Builds a list from lines in chronological order (oldest first).
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut list = CmdList::new();
        for line in iter {
            list.add_cmd_line(line);
        }
        list
    }
}

/// A stored record plus the derived fields search consumers filter on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: Record,
    /// Position of the record in the history log.
    pub log_index: usize,
    pub cmd_name: String,
    pub git_remote: String,
}

impl EnrichedRecord {
    fn new(record: Record, log_index: usize) -> Self {
        let cmd_name = command_name(&record.cmd_line).to_string();
        let git_remote = normalize_git_remote(&record.git_origin_remote);
        Self {
            record,
            log_index,
            cmd_name,
            git_remote,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrichedHistory {
    records: Vec<EnrichedRecord>,
    order: CmdList,
    latest: HashMap<String, usize>,
}

impl EnrichedHistory {
    pub fn push(&mut self, record: Record) {
        let log_index = self.records.len();
        let cmd_line = record.cmd_line.clone();
        self.records.push(EnrichedRecord::new(record, log_index));
        if cmd_line.trim().is_empty() {
            return;
        }
        self.order.add_cmd_line(&cmd_line);
        self.latest.insert(cmd_line, log_index);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn cmd_lines(&self) -> &CmdList {
        &self.order
    }

    pub fn latest(&self, cmd_line: &str) -> Option<&EnrichedRecord> {
        self.latest
            .get(cmd_line)
            .and_then(|index| self.records.get(*index))
    }

    /// Latest record of each distinct command line, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<EnrichedRecord> {
        self.order
            .iter()
            .filter_map(|line| self.latest(line))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every record, newest first.
    pub fn all(&self, limit: usize) -> Vec<EnrichedRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }
}

fn command_name(cmd_line: &str) -> &str {
    cmd_line
        .split_whitespace()
        .find(|word| !is_env_assignment(word))
        .unwrap_or("")
}

fn is_env_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }
        None => false,
    }
}

/// Reduces the many spellings of a remote to `host/path`.
pub fn normalize_git_remote(remote: &str) -> String {
    let mut value = remote.trim();
    value = value.trim_end_matches('/');
    value = value.strip_suffix(".git").unwrap_or(value);

    let had_scheme = match value.split_once("://") {
        Some((_, rest)) => {
            value = rest;
            true
        }
        None => false,
    };

    let host_end = value.find('/').unwrap_or(value.len());
    if let Some(at) = value[..host_end].find('@') {
        value = &value[at + 1..];
    }

    let normalized = if had_scheme {
        value.to_string()
    } else {
        // scp-like syntax: host:path
        match value.split_once(':') {
            Some((host, path)) if !host.contains('/') => format!("{}/{}", host, path),
            _ => value.to_string(),
        }
    };
    normalized.to_lowercase()
}
