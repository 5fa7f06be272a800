//! Record merge engine.
//!
//! Holds part-one fragments until their part-two counterpart arrives, merges
//! the pair and hands the result to the single log writer. It is the only
//! component that writes the history log. In-memory views (per-shell recent
//! lists and the enriched record index) are updated alongside every write and
//! serve all live queries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs_err as fs;
use histd_protocol::{CollectFragment, MergeKey, Record, ShellKind};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{DaemonPaths, HistoryConfig};
use crate::dispatch::{Component, EventKind, PipelineEvent};
use crate::histlog::{self, HistlogError, LogWriter};
use crate::record_store::{CmdList, EnrichedHistory, EnrichedRecord};

#[derive(Debug, Clone, Default)]
pub struct HistoryViews {
    bash: CmdList,
    zsh: CmdList,
    enriched: EnrichedHistory,
}

impl HistoryViews {
    /// Seeds the views from the history log.
    ///
    /// A log that is already large enough is used on its own. Otherwise the
    /// native shell history files are loaded first and the log is replayed on
    /// top, so a fresh install still starts with the user's existing history.
    pub fn bootstrap(
        records: Vec<Record>,
        trust_log: bool,
        bash_history: &Path,
        zsh_history: &Path,
    ) -> Self {
        let mut enriched = EnrichedHistory::default();
        for record in records {
            enriched.push(record);
        }
        let log_lines = enriched.cmd_lines();

        let (bash, zsh) = if trust_log {
            (log_lines.copy(), log_lines.copy())
        } else {
            let mut bash = histlog::load_cmd_lines_from_history_file(bash_history);
            bash.add_all(log_lines);
            let mut zsh = histlog::load_cmd_lines_from_history_file(zsh_history);
            zsh.add_all(log_lines);
            (bash, zsh)
        };

        Self {
            bash,
            zsh,
            enriched,
        }
    }

    fn add(&mut self, record: &Record) {
        if !record.cmd_line.trim().is_empty() {
            self.bash.add_cmd_line(&record.cmd_line);
            self.zsh.add_cmd_line(&record.cmd_line);
        }
        self.enriched.push(record.clone());
    }

    fn cmd_lines(&self, shell: ShellKind) -> &CmdList {
        match shell {
            ShellKind::Bash => &self.bash,
            ShellKind::Zsh => &self.zsh,
            ShellKind::Unknown => self.enriched.cmd_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistfileStats {
    pub pending_fragments: usize,
    pub records: usize,
    pub bash_cmd_lines: usize,
    pub zsh_cmd_lines: usize,
}

pub struct Histfile {
    pending: Mutex<HashMap<MergeKey, CollectFragment>>,
    views: Mutex<HistoryViews>,
    writer: LogWriter,
}

impl Histfile {
    pub fn new(views: HistoryViews, writer: LogWriter) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            views: Mutex::new(views),
            writer,
        }
    }

    /// Loads the history log and builds the views. Corruption beyond the
    /// configured budget is returned to the caller and must stop start-up.
    pub fn load(
        paths: &DaemonPaths,
        config: &HistoryConfig,
        writer: LogWriter,
    ) -> Result<Self, HistlogError> {
        let records = histlog::read_and_fix_file(&paths.history_log, config.max_corrupt_lines)?;
        let log_bytes = fs::metadata(&paths.history_log)
            .map(|meta| meta.len())
            .unwrap_or(0);
        let trust_log = log_bytes >= config.bootstrap_min_bytes;

        info!(
            path = %paths.history_log.display(),
            records = records.len(),
            log_bytes,
            trust_log,
            "History log loaded"
        );

        let views =
            HistoryViews::bootstrap(records, trust_log, &paths.bash_history, &paths.zsh_history);
        Ok(Self::new(views, writer))
    }

    pub fn handle_fragment(&self, fragment: CollectFragment) {
        let key = fragment.merge_key();
        let mut pending = self.lock_pending();

        if fragment.is_part_one() {
            debug!(key = %key, record_id = %fragment.record.record_id, "Part one received");
            if let Some(previous) = pending.insert(key.clone(), fragment) {
                // Expected for some shells (e.g. an interrupted prompt), not for others.
                warn!(
                    key = %key,
                    discarded_record_id = %previous.record.record_id,
                    "Part one already pending; replacing it"
                );
            }
            return;
        }

        let Some(mut part_one) = pending.remove(&key) else {
            warn!(
                key = %key,
                record_id = %fragment.record.record_id,
                "Part two without a pending part one; dropping"
            );
            return;
        };

        if let Err(err) = part_one.record.merge(&fragment.record) {
            warn!(key = %key, error = %err, "Failed to merge record parts; dropping part two");
            pending.insert(key, part_one);
            return;
        }

        debug!(
            key = %key,
            record_id = %part_one.record.record_id,
            exit_code = part_one.record.exit_code,
            "Record merged"
        );
        self.write(vec![part_one.record]);
    }

    /// Flushes every pending part one of `session_id` as an unmerged record.
    /// Returns how many records were written.
    pub fn drop_session(&self, session_id: &str) -> usize {
        let mut pending = self.lock_pending();
        let keys: Vec<MergeKey> = pending
            .keys()
            .filter(|key| key.session_id == session_id)
            .cloned()
            .collect();

        let records: Vec<Record> = keys
            .iter()
            .filter_map(|key| pending.remove(key))
            .map(|fragment| unmerged(fragment.record))
            .collect();

        let count = records.len();
        if count > 0 {
            info!(session_id, records = count, "Flushing unmerged records for dropped session");
            self.write(records);
        } else {
            debug!(session_id, "Dropped session had no pending records");
        }
        count
    }

    /// Writes every remaining pending part one and waits for the log writer.
    /// The state table stays locked until the write has completed.
    pub fn flush_all(&self) -> Result<usize, HistlogError> {
        let mut pending = self.lock_pending();
        let records: Vec<Record> = pending
            .drain()
            .map(|(_, fragment)| unmerged(fragment.record))
            .collect();
        let count = records.len();

        self.lock_views().add_all(&records);
        self.writer.flush(records)?;
        if count > 0 {
            info!(records = count, "Flushed pending records on shutdown");
        }
        Ok(count)
    }

    pub fn recent_cmd_lines(&self, shell: ShellKind, limit: usize) -> Vec<String> {
        self.lock_views().cmd_lines(shell).recent(limit)
    }

    /// Newest first. With `distinct`, only the latest record of each command
    /// line is returned.
    pub fn dump(&self, limit: Option<usize>, distinct: bool) -> Vec<EnrichedRecord> {
        let limit = limit.unwrap_or(usize::MAX);
        let views = self.lock_views();
        if distinct {
            views.enriched.recent(limit)
        } else {
            views.enriched.all(limit)
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn stats(&self) -> HistfileStats {
        let pending_fragments = self.pending_count();
        let views = self.lock_views();
        HistfileStats {
            pending_fragments,
            records: views.enriched.len(),
            bash_cmd_lines: views.bash.len(),
            zsh_cmd_lines: views.zsh.len(),
        }
    }

    fn write(&self, records: Vec<Record>) {
        self.lock_views().add_all(&records);
        self.writer.append(records);
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<MergeKey, CollectFragment>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!("Pending record table lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn lock_views(&self) -> MutexGuard<'_, HistoryViews> {
        self.views.lock().unwrap_or_else(|poisoned| {
            warn!("History views lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl Component for Histfile {
    fn name(&self) -> &'static str {
        "histfile"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[EventKind::Record, EventKind::SessionDrop]
    }

    fn handle(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Record(fragment) => self.handle_fragment(fragment),
            PipelineEvent::SessionDrop(session_id) => {
                self.drop_session(&session_id);
            }
            PipelineEvent::SessionInit(_) | PipelineEvent::Shutdown => {}
        }
    }

    fn shutdown(&self) {
        if let Err(err) = self.flush_all() {
            error!(error = %err, "Failed to flush pending records on shutdown");
        }
    }
}

impl HistoryViews {
    fn add_all(&mut self, records: &[Record]) {
        for record in records {
            self.add(record);
        }
    }
}

fn unmerged(mut record: Record) -> Record {
    record.parts_not_merged = true;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histlog::read_and_fix_file;
    use std::path::PathBuf;

    fn fragment(session: &str, shlvl: u32, record_id: &str, part_one: bool) -> CollectFragment {
        CollectFragment {
            record: Record {
                cmd_line: if part_one {
                    format!("echo {}", record_id)
                } else {
                    String::new()
                },
                exit_code: if part_one { 0 } else { 3 },
                pwd: "/repo".to_string(),
                session_id: session.to_string(),
                record_id: record_id.to_string(),
                timestamp: "2026-02-01T10:00:00Z".parse().expect("timestamp"),
                duration_ms: if part_one { 0 } else { 1_500 },
                part_one,
                parts_not_merged: true,
                ..Record::default()
            },
            session_id: session.to_string(),
            shlvl,
            session_pid: 4242,
            shell: ShellKind::Zsh,
        }
    }

    fn histfile(dir: &Path) -> (Histfile, PathBuf) {
        let path = dir.join("history.log");
        let writer = LogWriter::spawn(path.clone());
        (Histfile::new(HistoryViews::default(), writer), path)
    }

    fn logged(histfile: &Histfile, path: &Path) -> Vec<Record> {
        histfile.writer.flush(Vec::new()).expect("barrier");
        read_and_fix_file(path, 0).expect("read log")
    }

    #[test]
    fn merges_part_one_with_part_two() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", true));
        assert_eq!(histfile.pending_count(), 1);
        histfile.handle_fragment(fragment("s1", 1, "r1", false));
        assert_eq!(histfile.pending_count(), 0);

        let records = logged(&histfile, &path);
        assert_eq!(records.len(), 1);
        let merged = &records[0];
        assert_eq!(merged.cmd_line, "echo r1");
        assert_eq!(merged.exit_code, 3);
        assert_eq!(merged.duration_ms, 1_500);
        assert!(!merged.part_one);
        assert!(!merged.parts_not_merged);

        assert_eq!(
            histfile.recent_cmd_lines(ShellKind::Bash, 10),
            vec!["echo r1".to_string()]
        );
        assert_eq!(histfile.dump(None, false).len(), 1);
    }

    #[test]
    fn nested_shell_levels_merge_independently() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "outer", true));
        histfile.handle_fragment(fragment("s1", 2, "inner", true));
        histfile.handle_fragment(fragment("s1", 2, "inner", false));
        histfile.handle_fragment(fragment("s1", 1, "outer", false));

        let ids: Vec<_> = logged(&histfile, &path)
            .into_iter()
            .map(|record| record.record_id)
            .collect();
        assert_eq!(ids, vec!["inner".to_string(), "outer".to_string()]);
    }

    #[test]
    fn part_two_without_part_one_is_dropped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", false));

        assert_eq!(histfile.pending_count(), 0);
        assert!(logged(&histfile, &path).is_empty());
    }

    #[test]
    fn duplicate_part_one_replaces_pending() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", true));
        histfile.handle_fragment(fragment("s1", 1, "r2", true));
        assert_eq!(histfile.pending_count(), 1);

        histfile.handle_fragment(fragment("s1", 1, "r2", false));
        let records = logged(&histfile, &path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, "r2");
    }

    #[test]
    fn mismatched_record_keeps_part_one_pending() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", true));
        histfile.handle_fragment(fragment("s1", 1, "other", false));

        assert_eq!(histfile.pending_count(), 1);
        assert!(logged(&histfile, &path).is_empty());

        histfile.handle_fragment(fragment("s1", 1, "r1", false));
        assert_eq!(logged(&histfile, &path).len(), 1);
    }

    #[test]
    fn drop_session_flushes_pending_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", true));
        histfile.handle_fragment(fragment("s2", 1, "r2", true));

        assert_eq!(histfile.drop_session("s1"), 1);
        assert_eq!(histfile.drop_session("s1"), 0);

        let records = logged(&histfile, &path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, "r1");
        assert!(records[0].parts_not_merged);
        assert!(records[0].part_one);
        assert_eq!(histfile.pending_count(), 1);
    }

    #[test]
    fn drop_session_without_pending_writes_nothing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        assert_eq!(histfile.drop_session("ghost"), 0);
        assert!(logged(&histfile, &path).is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn flush_all_writes_every_pending_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle_fragment(fragment("s1", 1, "r1", true));
        histfile.handle_fragment(fragment("s1", 2, "r2", true));
        histfile.handle_fragment(fragment("s3", 1, "r3", true));

        assert_eq!(histfile.flush_all().expect("flush"), 3);
        assert_eq!(histfile.pending_count(), 0);

        let mut ids: Vec<_> = read_and_fix_file(&path, 0)
            .expect("read")
            .into_iter()
            .map(|record| record.record_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn component_routes_events() {
        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());

        histfile.handle(PipelineEvent::Record(fragment("s1", 1, "r1", true)));
        histfile.handle(PipelineEvent::Record(fragment("s1", 2, "r2", true)));
        histfile.handle(PipelineEvent::SessionDrop("s1".to_string()));
        assert_eq!(histfile.pending_count(), 0);

        histfile.handle(PipelineEvent::Record(fragment("s2", 1, "r3", true)));
        histfile.shutdown();

        assert_eq!(read_and_fix_file(&path, 0).expect("read").len(), 3);
    }

    #[test]
    fn part_two_accepted_before_shutdown_is_logged_merged() {
        use crate::dispatch::DispatcherBuilder;
        use std::sync::Arc;
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("temp dir");
        let (histfile, path) = histfile(dir.path());
        let mut builder = DispatcherBuilder::new(0);
        builder.register(Arc::new(histfile));
        let (publisher, orchestrator) = builder.start().expect("start");

        for (record_id, part_one) in [("r1", true), ("r1", false), ("r2", true)] {
            publisher
                .publish(PipelineEvent::Record(fragment("s1", 1, record_id, part_one)))
                .expect("publish");
        }
        let report = orchestrator.shutdown(Duration::from_secs(2));
        assert_eq!(report.acknowledged, vec!["histfile"]);

        let records = read_and_fix_file(&path, 0).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, "r1");
        assert!(!records[0].parts_not_merged);
        assert_eq!(records[0].exit_code, 3);
        assert_eq!(records[1].record_id, "r2");
        assert!(records[1].parts_not_merged);
    }

    #[test]
    fn load_bootstraps_small_log_from_shell_history() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths {
            socket: dir.path().join("daemon.sock"),
            history_log: dir.path().join("history.log"),
            bash_history: dir.path().join(".bash_history"),
            zsh_history: dir.path().join(".zsh_history"),
        };
        std::fs::write(&paths.bash_history, "ls\nmake\n").expect("bash history");
        std::fs::write(&paths.zsh_history, ": 1700000000:0;git log\n").expect("zsh history");
        histlog::append_to_file(&paths.history_log, &[fragment("s1", 1, "r1", true).record])
            .expect("seed log");

        let config = HistoryConfig::default();
        let writer = LogWriter::spawn(paths.history_log.clone());
        let histfile = Histfile::load(&paths, &config, writer).expect("load");

        assert_eq!(
            histfile.recent_cmd_lines(ShellKind::Bash, 10),
            vec!["echo r1", "make", "ls"]
        );
        assert_eq!(
            histfile.recent_cmd_lines(ShellKind::Zsh, 10),
            vec!["echo r1", "git log"]
        );
        assert_eq!(histfile.stats().records, 1);
    }

    #[test]
    fn load_trusts_large_log() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths {
            socket: dir.path().join("daemon.sock"),
            history_log: dir.path().join("history.log"),
            bash_history: dir.path().join(".bash_history"),
            zsh_history: dir.path().join(".zsh_history"),
        };
        std::fs::write(&paths.bash_history, "ls\n").expect("bash history");
        histlog::append_to_file(&paths.history_log, &[fragment("s1", 1, "r1", true).record])
            .expect("seed log");

        let config = HistoryConfig {
            bootstrap_min_bytes: 1,
            ..HistoryConfig::default()
        };
        let writer = LogWriter::spawn(paths.history_log.clone());
        let histfile = Histfile::load(&paths, &config, writer).expect("load");

        assert_eq!(
            histfile.recent_cmd_lines(ShellKind::Bash, 10),
            vec!["echo r1"]
        );
    }

    #[test]
    fn load_fails_on_excess_corruption() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = DaemonPaths {
            socket: dir.path().join("daemon.sock"),
            history_log: dir.path().join("history.log"),
            bash_history: dir.path().join(".bash_history"),
            zsh_history: dir.path().join(".zsh_history"),
        };
        std::fs::write(&paths.history_log, "junk\njunk\n").expect("corrupt log");

        let config = HistoryConfig {
            max_corrupt_lines: 1,
            ..HistoryConfig::default()
        };
        let writer = LogWriter::spawn(paths.history_log.clone());
        assert!(matches!(
            Histfile::load(&paths, &config, writer),
            Err(HistlogError::TooManyCorruptLines { .. })
        ));
    }
}
