//! Per-session recall buffers for arrow-up navigation.
//!
//! A buffer exists from session init until the session is dropped. Lookups are
//! by `histno`, a 1-based offset counted back from the most recent command.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{Component, EventKind, PipelineEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecallError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),
    #[error("histno 0 does not refer to a command")]
    ZeroHistno,
    #[error("Negative histno {0} refers to a future command, which is not supported")]
    FutureHistno(i64),
    #[error("histno {histno} is out of range; session has {len} commands")]
    OutOfRange { histno: i64, len: usize },
    #[error("No command starts with {0:?}")]
    NoPrefixMatch(String),
}

impl RecallError {
    /// Stable error code for IPC responses.
    pub fn code(&self) -> &'static str {
        match self {
            RecallError::UnknownSession(_) => "unknown_session",
            RecallError::ZeroHistno | RecallError::FutureHistno(_) => "invalid_histno",
            RecallError::OutOfRange { .. } => "out_of_range",
            RecallError::NoPrefixMatch(_) => "no_prefix_match",
        }
    }
}

#[derive(Debug, Default)]
struct SessionBuffer {
    pid: u32,
    cmd_lines: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RecallBuffers {
    sessions: Mutex<HashMap<String, SessionBuffer>>,
}

impl RecallBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the buffer for `session_id`. An existing buffer is kept; only
    /// its pid is refreshed.
    pub fn init_session(&self, session_id: &str, pid: u32) {
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(session_id) {
            Some(buffer) => {
                debug!(session_id, pid, "Recall buffer already exists; keeping it");
                buffer.pid = pid;
            }
            None => {
                sessions.insert(
                    session_id.to_string(),
                    SessionBuffer {
                        pid,
                        cmd_lines: Vec::new(),
                    },
                );
                debug!(session_id, pid, "Recall buffer created");
            }
        }
    }

    pub fn drop_session(&self, session_id: &str) -> bool {
        let removed = self.lock_sessions().remove(session_id);
        if let Some(buffer) = &removed {
            info!(
                session_id,
                pid = buffer.pid,
                commands = buffer.cmd_lines.len(),
                "Recall buffer released"
            );
        }
        removed.is_some()
    }

    pub fn append(&self, session_id: &str, cmd_line: &str) -> Result<(), RecallError> {
        let mut sessions = self.lock_sessions();
        let buffer = sessions
            .get_mut(session_id)
            .ok_or_else(|| RecallError::UnknownSession(session_id.to_string()))?;
        buffer.cmd_lines.push(cmd_line.to_string());
        Ok(())
    }

    /// Returns the command `histno` steps back in the session's history.
    ///
    /// With a prefix, only distinct command lines starting with it are
    /// counted, most recent first.
    pub fn recall(
        &self,
        session_id: &str,
        histno: i64,
        prefix: Option<&str>,
    ) -> Result<String, RecallError> {
        if histno == 0 {
            return Err(RecallError::ZeroHistno);
        }
        if histno < 0 {
            return Err(RecallError::FutureHistno(histno));
        }

        let sessions = self.lock_sessions();
        let buffer = sessions
            .get(session_id)
            .ok_or_else(|| RecallError::UnknownSession(session_id.to_string()))?;

        match prefix.filter(|prefix| !prefix.is_empty()) {
            None => {
                let len = buffer.cmd_lines.len();
                let offset = usize::try_from(histno)
                    .ok()
                    .filter(|offset| *offset <= len)
                    .ok_or(RecallError::OutOfRange { histno, len })?;
                Ok(buffer.cmd_lines[len - offset].clone())
            }
            Some(prefix) => {
                let mut seen = Vec::new();
                for line in buffer.cmd_lines.iter().rev() {
                    if line.starts_with(prefix) && !seen.contains(&line) {
                        seen.push(line);
                    }
                }
                if seen.is_empty() {
                    return Err(RecallError::NoPrefixMatch(prefix.to_string()));
                }
                usize::try_from(histno)
                    .ok()
                    .and_then(|offset| seen.get(offset - 1))
                    .map(|line| (*line).clone())
                    .ok_or(RecallError::OutOfRange {
                        histno,
                        len: seen.len(),
                    })
            }
        }
    }

    /// Last `count` commands of the session, most recent first.
    pub fn inspect(&self, session_id: &str, count: usize) -> Result<Vec<String>, RecallError> {
        let sessions = self.lock_sessions();
        let buffer = sessions
            .get(session_id)
            .ok_or_else(|| RecallError::UnknownSession(session_id.to_string()))?;
        Ok(buffer.cmd_lines.iter().rev().take(count).cloned().collect())
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, SessionBuffer>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("Recall buffer lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl Component for RecallBuffers {
    fn name(&self) -> &'static str {
        "recall"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[
            EventKind::SessionInit,
            EventKind::Record,
            EventKind::SessionDrop,
        ]
    }

    fn handle(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::SessionInit(init) => {
                self.init_session(&init.session_id, init.session_pid);
            }
            PipelineEvent::Record(fragment) if fragment.is_part_one() => {
                if let Err(err) = self.append(&fragment.session_id, &fragment.record.cmd_line) {
                    warn!(
                        session_id = %fragment.session_id,
                        error = %err,
                        "Command not added to recall buffer"
                    );
                }
            }
            PipelineEvent::SessionDrop(session_id) => {
                self.drop_session(&session_id);
            }
            _ => {}
        }
    }
}
