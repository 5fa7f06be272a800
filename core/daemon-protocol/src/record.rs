//! History record types and the two-phase merge.
//!
//! A shell hook reports every command twice: once before execution (part one,
//! carrying the command line and working directory) and once after execution
//! (part two, carrying exit code and duration). Both halves travel inside a
//! [`CollectFragment`] and are joined by the daemon under their [`MergeKey`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorInfo;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub cmd_line: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub pwd: String,
    #[serde(default)]
    pub pwd_after: String,
    #[serde(default)]
    pub real_pwd: String,
    #[serde(default)]
    pub real_pwd_after: String,
    #[serde(default)]
    pub device_id: String,
    pub session_id: String,
    pub record_id: String,
    #[serde(default)]
    pub git_origin_remote: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub part_one: bool,
    #[serde(default)]
    pub parts_not_merged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("session id mismatch: {left} != {right}")]
    SessionMismatch { left: String, right: String },

    #[error("record id mismatch: {left} != {right}")]
    RecordMismatch { left: String, right: String },
}

impl Record {
    /// Folds the post-execution half into this pre-execution half.
    ///
    /// Only `exit_code` and `duration_ms` are taken from `part_two`; every other
    /// field keeps the value reported before the command ran. On error neither
    /// record is modified.
    pub fn merge(&mut self, part_two: &Record) -> Result<(), MergeError> {
        if self.session_id != part_two.session_id {
            return Err(MergeError::SessionMismatch {
                left: self.session_id.clone(),
                right: part_two.session_id.clone(),
            });
        }
        if self.record_id != part_two.record_id {
            return Err(MergeError::RecordMismatch {
                left: self.record_id.clone(),
                right: part_two.record_id.clone(),
            });
        }

        self.exit_code = part_two.exit_code;
        self.duration_ms = part_two.duration_ms;
        self.part_one = false;
        self.parts_not_merged = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum ShellKind {
    Bash,
    Zsh,
    #[default]
    Unknown,
}

impl ShellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Unknown => "unknown",
        }
    }
}

impl From<&str> for ShellKind {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "bash" => ShellKind::Bash,
            "zsh" => ShellKind::Zsh,
            _ => ShellKind::Unknown,
        }
    }
}

impl From<String> for ShellKind {
    fn from(value: String) -> Self {
        ShellKind::from(value.as_str())
    }
}

/// Identifies which two fragments belong to the same executed command.
///
/// Nested shells share a session id, so the shell level is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeKey {
    pub session_id: String,
    pub shlvl: u32,
}

impl fmt::Display for MergeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.shlvl)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectFragment {
    pub record: Record,
    pub session_id: String,
    #[serde(default)]
    pub shlvl: u32,
    #[serde(default)]
    pub session_pid: u32,
    #[serde(default)]
    pub shell: ShellKind,
}

impl CollectFragment {
    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            session_id: self.session_id.clone(),
            shlvl: self.shlvl,
        }
    }

    pub fn is_part_one(&self) -> bool {
        self.record.part_one
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        require_id(&self.record.record_id, "record_id")?;
        if self.record.session_id != self.session_id {
            return Err(ErrorInfo::new(
                "session_mismatch",
                "record.session_id must match session_id",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionInit {
    pub session_id: String,
    pub session_pid: u32,
    #[serde(default)]
    pub shlvl: u32,
}

impl SessionInit {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        if self.session_pid == 0 {
            return Err(ErrorInfo::new("invalid_pid", "session_pid is required"));
        }
        Ok(())
    }
}

pub(crate) fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > 128 {
        return Err(ErrorInfo::new(
            "invalid_id",
            format!("{} must be 128 characters or fewer", field),
        ));
    }
    Ok(())
}
