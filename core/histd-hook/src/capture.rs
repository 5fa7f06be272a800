//! Builds record fragments from what the shell hook knows.
//!
//! The pre-exec hook calls `collect`, which prints the generated record id.
//! The shell keeps it and passes it back to `postcollect` once the command
//! finishes, so both halves land under the same merge key with matching ids.

use chrono::Utc;
use histd_protocol::{CollectFragment, Record, ShellKind};
use rand::RngCore;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub shlvl: u32,
    pub session_pid: u32,
    pub shell: ShellKind,
}

#[derive(Debug, Clone, Default)]
pub struct PreExec {
    pub cmd_line: String,
    pub pwd: String,
    pub git_origin_remote: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PostExec {
    pub record_id: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub pwd_after: String,
}

pub fn part_one(session: &SessionContext, pre: PreExec) -> CollectFragment {
    let real_pwd = resolve_real_path(&pre.pwd);
    let record = Record {
        cmd_line: pre.cmd_line,
        pwd: pre.pwd,
        real_pwd,
        device_id: pre.device_id,
        session_id: session.session_id.clone(),
        record_id: make_record_id(session.session_pid),
        git_origin_remote: pre.git_origin_remote,
        timestamp: Utc::now(),
        part_one: true,
        parts_not_merged: true,
        ..Record::default()
    };
    wrap(session, record)
}

pub fn part_two(session: &SessionContext, post: PostExec) -> CollectFragment {
    let real_pwd_after = resolve_real_path(&post.pwd_after);
    let record = Record {
        exit_code: post.exit_code,
        pwd_after: post.pwd_after,
        real_pwd_after,
        session_id: session.session_id.clone(),
        record_id: post.record_id,
        timestamp: Utc::now(),
        duration_ms: post.duration_ms,
        part_one: false,
        parts_not_merged: true,
        ..Record::default()
    };
    wrap(session, record)
}

fn wrap(session: &SessionContext, record: Record) -> CollectFragment {
    CollectFragment {
        record,
        session_id: session.session_id.clone(),
        shlvl: session.shlvl,
        session_pid: session.session_pid,
        shell: session.shell,
    }
}

/// Symlink-free form of `path`, or empty when it cannot be resolved.
fn resolve_real_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    fs_err::canonicalize(Path::new(path))
        .map(|real| real.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn make_record_id(pid: u32) -> String {
    let mut random = rand::thread_rng();
    let rand = random.next_u64();
    format!("rec-{}-{}-{:x}", Utc::now().timestamp_millis(), pid, rand)
}
