//! Append-only, schema-tagged history log.
//!
//! Every line is a schema tag immediately followed by a JSON object:
//! `v1{"cmd_line":...}`. The oldest schema has an empty tag and camelCase
//! fields. Lines are only ever appended; the file is rewritten solely while
//! recovering from corruption, after a `.bak` copy has been taken.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use chrono::{DateTime, TimeZone, Utc};
use fs_err as fs;
use histd_protocol::Record;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::record_store::CmdList;

pub const CURRENT_SCHEMA_TAG: &str = "v1";
const LEGACY_SCHEMA_TAG: &str = "";

#[derive(Debug, Error)]
pub enum HistlogError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode record {record_id}: {source}")]
    Encode {
        record_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Line has no JSON payload")]
    MissingPayload,

    #[error("Unknown schema tag {0:?}")]
    UnknownSchema(String),

    #[error("Failed to decode {schema} record: {source}")]
    Decode {
        schema: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has {errors} undecodable lines (limit {max_errors})")]
    TooManyCorruptLines {
        path: PathBuf,
        errors: usize,
        max_errors: usize,
    },

    #[error("History writer is no longer running")]
    WriterGone,
}

impl HistlogError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        HistlogError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The empty-tag schema written by earlier releases.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    cmd_line: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    pwd: String,
    #[serde(default)]
    pwd_after: String,
    #[serde(default)]
    real_pwd: String,
    #[serde(default)]
    real_pwd_after: String,
    #[serde(default)]
    device_id: String,
    session_id: String,
    record_id: String,
    #[serde(default)]
    git_origin_remote: String,
    realtime_before: f64,
    #[serde(default)]
    realtime_duration: f64,
    #[serde(default)]
    part_one: bool,
    #[serde(default = "default_parts_merged")]
    parts_merged: bool,
}

fn default_parts_merged() -> bool {
    true
}

impl From<LegacyRecord> for Record {
    fn from(legacy: LegacyRecord) -> Self {
        Record {
            cmd_line: legacy.cmd_line,
            exit_code: legacy.exit_code,
            pwd: legacy.pwd,
            pwd_after: legacy.pwd_after,
            real_pwd: legacy.real_pwd,
            real_pwd_after: legacy.real_pwd_after,
            device_id: legacy.device_id,
            session_id: legacy.session_id,
            record_id: legacy.record_id,
            git_origin_remote: legacy.git_origin_remote,
            timestamp: epoch_seconds_to_utc(legacy.realtime_before),
            duration_ms: (legacy.realtime_duration.max(0.0) * 1000.0).round() as u64,
            part_one: legacy.part_one,
            parts_not_merged: !legacy.parts_merged,
        }
    }
}

fn epoch_seconds_to_utc(seconds: f64) -> DateTime<Utc> {
    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

pub fn encode_line(record: &Record) -> Result<String, HistlogError> {
    let payload = serde_json::to_string(record).map_err(|source| HistlogError::Encode {
        record_id: record.record_id.clone(),
        source,
    })?;
    Ok(format!("{}{}", CURRENT_SCHEMA_TAG, payload))
}

/// Decodes one log line, picking the decoder from the schema tag that
/// precedes the first `{`.
pub fn decode_line(line: &str) -> Result<Record, HistlogError> {
    let brace = line.find('{').ok_or(HistlogError::MissingPayload)?;
    let (tag, payload) = line.split_at(brace);

    match tag.trim() {
        CURRENT_SCHEMA_TAG => {
            serde_json::from_str::<Record>(payload).map_err(|source| HistlogError::Decode {
                schema: CURRENT_SCHEMA_TAG,
                source,
            })
        }
        LEGACY_SCHEMA_TAG => serde_json::from_str::<LegacyRecord>(payload)
            .map(Record::from)
            .map_err(|source| HistlogError::Decode {
                schema: "legacy",
                source,
            }),
        other => Err(HistlogError::UnknownSchema(other.to_string())),
    }
}

/// Appends records as one open/write/close unit. No retry on failure.
pub fn append_to_file(path: &Path, records: &[Record]) -> Result<(), HistlogError> {
    if records.is_empty() {
        return Ok(());
    }
    ensure_parent(path)?;

    let mut payload = String::new();
    for record in records {
        payload.push_str(&encode_line(record)?);
        payload.push('\n');
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| HistlogError::io(path, err))?;
    file.write_all(payload.as_bytes())
        .map_err(|err| HistlogError::io(path, err))?;
    file.flush().map_err(|err| HistlogError::io(path, err))
}

/// Truncates `path` and writes `records`. Only used by corruption recovery.
pub fn overwrite_file(path: &Path, records: &[Record]) -> Result<(), HistlogError> {
    ensure_parent(path)?;

    let mut payload = String::new();
    for record in records {
        payload.push_str(&encode_line(record)?);
        payload.push('\n');
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| HistlogError::io(&tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| HistlogError::io(path, err))
}

/// Loads every decodable record from `path`.
///
/// A missing file is an empty history. More than `max_errors` undecodable
/// lines fails the load. Fewer errors trigger recovery: the original file is
/// copied to a fresh `.bak` sibling and rewritten with only the decoded
/// records, in their original order.
pub fn read_and_fix_file(path: &Path, max_errors: usize) -> Result<Vec<Record>, HistlogError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "History log missing; starting empty");
            return Ok(Vec::new());
        }
        Err(err) => return Err(HistlogError::io(path, err)),
    };

    let mut records = Vec::new();
    let mut errors = 0usize;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!(line = line_no + 1, error = %err, "History line is not UTF-8");
                errors += 1;
                continue;
            }
            Err(err) => return Err(HistlogError::io(path, err)),
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "Undecodable history line");
                errors += 1;
            }
        }
    }

    if errors > max_errors {
        error!(
            path = %path.display(),
            errors,
            max_errors,
            "History log corruption exceeds budget"
        );
        return Err(HistlogError::TooManyCorruptLines {
            path: path.to_path_buf(),
            errors,
            max_errors,
        });
    }

    if errors > 0 {
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|err| HistlogError::io(&backup, err))?;
        overwrite_file(path, &records)?;
        warn!(
            path = %path.display(),
            backup = %backup.display(),
            dropped = errors,
            kept = records.len(),
            "History log repaired"
        );
    }

    Ok(records)
}

/// `<path>.bak`, or the first free `<path>.bak.N` so an earlier backup is
/// never overwritten.
pub fn backup_path(path: &Path) -> PathBuf {
    let base = with_suffix(path, ".bak");
    if !base.exists() {
        return base;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = with_suffix(&base, &format!(".{}", suffix));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

/// Appends to the raw file name, so non-UTF-8 paths survive intact.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> Result<(), HistlogError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| HistlogError::io(parent, err))?;
    }
    Ok(())
}

/// Reads a native shell history file (bash or zsh) into a `CmdList`.
///
/// Handles plain one-command-per-line files and the zsh extended format
/// `: <start>:<elapsed>;<command>`. bash `HISTTIMEFORMAT` stamps (`#1700000000`)
/// are skipped. A missing file yields an empty list.
pub fn load_cmd_lines_from_history_file(path: &Path) -> CmdList {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Shell history unavailable");
            return CmdList::new();
        }
    };

    // zsh writes metafied bytes; lossy decoding keeps the readable commands.
    let content = String::from_utf8_lossy(&bytes);
    let list: CmdList = content.lines().filter_map(parse_history_line).collect();
    debug!(path = %path.display(), commands = list.len(), "Loaded shell history");
    list
}

fn parse_history_line(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    if is_bash_timestamp(line) {
        return None;
    }
    if is_extended_history(line) {
        let (_, command) = line.split_once(';')?;
        return Some(command).filter(|command| !command.trim().is_empty());
    }
    Some(line)
}

fn is_extended_history(line: &str) -> bool {
    line.contains(':')
        && line.contains(';')
        && line.split(':').count() >= 3
        && line.split(';').count() >= 2
}

fn is_bash_timestamp(line: &str) -> bool {
    line.strip_prefix('#')
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

enum WriteJob {
    Append(Vec<Record>),
    Flush {
        records: Vec<Record>,
        done: Sender<Result<(), String>>,
    },
}

/// Single writer for the history log.
///
/// All appends go through one thread in submission order, so on-disk order is
/// deterministic. `append` never blocks; `flush` waits until the records (and
/// everything queued before them) have been written.
#[derive(Clone)]
pub struct LogWriter {
    sender: Sender<WriteJob>,
    path: PathBuf,
}

impl LogWriter {
    pub fn spawn(path: PathBuf) -> Self {
        let (sender, receiver) = mpsc::channel();
        let thread_path = path.clone();
        thread::Builder::new()
            .name("histd-log-writer".to_string())
            .spawn(move || run_writer(thread_path, receiver))
            .map(|_| ())
            .unwrap_or_else(|err| error!(error = %err, "Failed to spawn history writer"));
        Self { sender, path }
    }

    pub fn append(&self, records: Vec<Record>) {
        if self.sender.send(WriteJob::Append(records)).is_err() {
            error!(path = %self.path.display(), "History writer gone; record lost");
        }
    }

    pub fn flush(&self, records: Vec<Record>) -> Result<(), HistlogError> {
        let (done, wait) = mpsc::channel();
        self.sender
            .send(WriteJob::Flush { records, done })
            .map_err(|_| HistlogError::WriterGone)?;
        match wait.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(HistlogError::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, message),
            )),
            Err(_) => Err(HistlogError::WriterGone),
        }
    }
}

fn run_writer(path: PathBuf, receiver: Receiver<WriteJob>) {
    for job in receiver {
        match job {
            WriteJob::Append(records) => {
                if let Err(err) = append_to_file(&path, &records) {
                    error!(
                        error = %err,
                        records = records.len(),
                        "Failed to append to history log"
                    );
                }
            }
            WriteJob::Flush { records, done } => {
                let result = append_to_file(&path, &records).map_err(|err| err.to_string());
                if let Err(err) = &result {
                    error!(error = %err, records = records.len(), "Failed to flush history log");
                }
                let _ = done.send(result);
            }
        }
    }
    debug!("History writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, cmd: &str) -> Record {
        Record {
            cmd_line: cmd.to_string(),
            session_id: "session-1".to_string(),
            record_id: id.to_string(),
            timestamp: "2026-02-01T10:00:00Z".parse().expect("timestamp"),
            ..Record::default()
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .expect("read log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn encodes_with_current_tag() {
        let line = encode_line(&record("r1", "ls")).expect("encode");
        assert!(line.starts_with("v1{"));
        assert_eq!(decode_line(&line).expect("decode"), record("r1", "ls"));
    }

    #[test]
    fn decodes_legacy_schema() {
        let line = r#"{"cmdLine":"make","exitCode":2,"sessionId":"s","recordId":"r","realtimeBefore":1700000000.5,"realtimeDuration":1.25,"partsMerged":true}"#;
        let record = decode_line(line).expect("legacy");
        assert_eq!(record.cmd_line, "make");
        assert_eq!(record.exit_code, 2);
        assert_eq!(record.duration_ms, 1250);
        assert_eq!(record.timestamp.timestamp_millis(), 1_700_000_000_500);
        assert!(!record.parts_not_merged);
    }

    #[test]
    fn rejects_unknown_schema_tag() {
        let err = decode_line(r#"v9{"cmd_line":"ls"}"#).expect_err("unknown tag");
        assert!(matches!(err, HistlogError::UnknownSchema(tag) if tag == "v9"));
        assert!(matches!(
            decode_line("no payload here"),
            Err(HistlogError::MissingPayload)
        ));
    }

    #[test]
    fn append_creates_and_extends() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("history.log");

        append_to_file(&path, &[record("r1", "ls")]).expect("first append");
        append_to_file(&path, &[record("r2", "pwd"), record("r3", "id")]).expect("append");

        let records = read_and_fix_file(&path, 0).expect("read");
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().expect("temp dir");
        let records = read_and_fix_file(&dir.path().join("absent.log"), 0).expect("read");
        assert!(records.is_empty());
    }

    fn write_corrupt_log(path: &Path, corrupt: usize) {
        let mut content = String::new();
        content.push_str(&encode_line(&record("r1", "first")).expect("encode"));
        content.push('\n');
        for i in 0..corrupt {
            content.push_str(&format!("v1{{\"broken\":{}\n", i));
        }
        content.push_str(r#"{"cmdLine":"legacy","sessionId":"s","recordId":"r2","realtimeBefore":1700000000.0}"#);
        content.push('\n');
        content.push_str(&encode_line(&record("r3", "last")).expect("encode"));
        content.push('\n');
        std::fs::write(path, content).expect("write log");
    }

    #[test]
    fn fails_when_corruption_exceeds_budget() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.log");
        write_corrupt_log(&path, 3);
        let before = std::fs::read(&path).expect("read");

        let err = read_and_fix_file(&path, 2).expect_err("over budget");
        assert!(matches!(
            err,
            HistlogError::TooManyCorruptLines { errors: 3, max_errors: 2, .. }
        ));
        assert_eq!(std::fs::read(&path).expect("read"), before);
        assert!(!dir.path().join("history.log.bak").exists());
    }

    #[test]
    fn repairs_within_budget_and_keeps_backup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.log");
        write_corrupt_log(&path, 2);
        let original = std::fs::read(&path).expect("read");

        let records = read_and_fix_file(&path, 2).expect("within budget");
        let ids: Vec<_> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);

        let backup = dir.path().join("history.log.bak");
        assert_eq!(std::fs::read(&backup).expect("backup"), original);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.starts_with("v1{")));
        let reread = read_and_fix_file(&path, 0).expect("clean reread");
        assert_eq!(reread, records);
    }

    #[test]
    fn second_repair_does_not_overwrite_backup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.log");
        write_corrupt_log(&path, 1);
        read_and_fix_file(&path, 5).expect("first repair");
        let first_backup = std::fs::read(dir.path().join("history.log.bak")).expect("bak");

        std::fs::write(&path, "garbage\n").expect("corrupt again");
        read_and_fix_file(&path, 5).expect("second repair");

        assert_eq!(
            std::fs::read(dir.path().join("history.log.bak")).expect("bak"),
            first_backup
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("history.log.bak.1")).expect("bak.1"),
            "garbage\n"
        );
    }

    #[test]
    fn backup_path_keeps_non_utf8_file_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(OsStr::from_bytes(b"hist\xffory.log"));
        let backup = backup_path(&path);

        assert_eq!(backup.parent(), Some(dir.path()));
        assert_eq!(
            backup.file_name().map(OsStr::as_bytes),
            Some(&b"hist\xffory.log.bak"[..])
        );

        std::fs::write(&backup, "old").expect("write bak");
        assert_eq!(
            backup_path(&path).file_name().map(OsStr::as_bytes),
            Some(&b"hist\xffory.log.bak.1"[..])
        );
    }

    #[test]
    fn parses_plain_and_extended_history() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(".zsh_history");
        std::fs::write(
            &path,
            ": 1700000000:0;git status\n: 1700000005:3;echo a;echo b\nls -la\n#1700000010\nmake\n\nls -la\n",
        )
        .expect("write history");

        let list = load_cmd_lines_from_history_file(&path);
        let lines: Vec<_> = list.iter().collect();
        assert_eq!(lines, vec!["ls -la", "make", "echo a;echo b", "git status"]);
    }

    #[test]
    fn plain_lines_with_a_single_colon_are_kept_whole() {
        assert_eq!(parse_history_line("echo a:b;c"), Some("echo a:b;c"));
        assert_eq!(parse_history_line(": 1:2;"), None);
    }

    #[test]
    fn writer_preserves_submission_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.log");
        let writer = LogWriter::spawn(path.clone());

        writer.append(vec![record("r1", "a")]);
        writer.append(vec![record("r2", "b")]);
        writer.flush(vec![record("r3", "c")]).expect("flush");

        let ids: Vec<_> = read_and_fix_file(&path, 0)
            .expect("read")
            .into_iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }
}
