//! Shell session liveness watcher.
//!
//! Each watched session gets one poller thread that probes the shell's pid
//! every poll interval. When the process is gone the session is marked
//! unwatched and exactly one `SessionDrop` is published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatch::{Component, EventKind, PipelineEvent, Publisher};
use crate::process::{Liveness, ProcessProbe};

/// Start times further apart than this mean the pid was reused.
const START_TIME_TOLERANCE_SECS: u64 = 2;

#[derive(Clone)]
pub struct SessionWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    /// session id -> currently watched
    watched: Mutex<HashMap<String, bool>>,
    interval: Duration,
    probe: Arc<dyn ProcessProbe>,
    drops: Publisher,
}

impl SessionWatcher {
    pub fn new(interval: Duration, probe: Arc<dyn ProcessProbe>, drops: Publisher) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                watched: Mutex::new(HashMap::new()),
                interval,
                probe,
                drops,
            }),
        }
    }

    /// Starts polling `pid` on behalf of `session_id`.
    ///
    /// Returns `false` when the session is already watched; check-and-set
    /// happens under one lock so concurrent callers start at most one poller.
    pub fn watch(&self, session_id: &str, pid: u32) -> bool {
        if pid == 0 {
            debug!(session_id, "Not watching session without a pid");
            return false;
        }

        {
            let mut watched = self.inner.lock_watched();
            if watched.get(session_id).copied().unwrap_or(false) {
                return false;
            }
            watched.insert(session_id.to_string(), true);
        }

        let inner = Arc::clone(&self.inner);
        let id = session_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("histd-watch-{}", pid))
            .spawn(move || inner.poll(id, pid));
        if let Err(err) = spawned {
            warn!(session_id, pid, error = %err, "Failed to spawn session poller");
            self.inner.lock_watched().insert(session_id.to_string(), false);
            return false;
        }

        info!(session_id, pid, "Watching session");
        true
    }

    #[cfg(test)]
    pub fn is_watched(&self, session_id: &str) -> bool {
        self.inner
            .lock_watched()
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn watched_sessions(&self) -> usize {
        self.inner
            .lock_watched()
            .values()
            .filter(|watched| **watched)
            .count()
    }
}

impl WatcherInner {
    fn poll(&self, session_id: String, pid: u32) {
        let started_at = self.probe.start_time(pid);

        loop {
            thread::sleep(self.interval);
            match self.probe.probe(pid) {
                Ok(Liveness::Alive) => {
                    if pid_reused(started_at, self.probe.start_time(pid)) {
                        info!(session_id = %session_id, pid, "Session pid reused by another process");
                        break;
                    }
                }
                Ok(Liveness::Gone) => break,
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        pid,
                        error = %err,
                        "Liveness probe failed; assuming session is alive"
                    );
                }
            }
        }

        self.lock_watched().insert(session_id.clone(), false);
        info!(session_id = %session_id, pid, "Session ended");
        if let Err(err) = self.drops.publish(PipelineEvent::SessionDrop(session_id.clone())) {
            warn!(session_id = %session_id, error = %err, "Session drop not published");
        }
    }

    fn lock_watched(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.watched.lock().unwrap_or_else(|poisoned| {
            warn!("Watched session table lock poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

fn pid_reused(original: Option<u64>, current: Option<u64>) -> bool {
    match (original, current) {
        (Some(original), Some(current)) => original.abs_diff(current) > START_TIME_TOLERANCE_SECS,
        _ => false,
    }
}

impl Component for SessionWatcher {
    fn name(&self) -> &'static str {
        "sesswatch"
    }

    fn interests(&self) -> &'static [EventKind] {
        &[EventKind::SessionInit, EventKind::Record]
    }

    fn handle(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::SessionInit(init) => {
                self.watch(&init.session_id, init.session_pid);
            }
            // Records also carry the pid, which covers sessions whose init was missed.
            PipelineEvent::Record(fragment) if fragment.session_pid != 0 => {
                if self.watch(&fragment.session_id, fragment.session_pid) {
                    debug!(session_id = %fragment.session_id, "Session watched from record");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    /// Reports the pid alive for the first `alive_polls` probes.
    struct FakeProbe {
        alive_polls: usize,
        probes: AtomicUsize,
        fail_first: bool,
        start_times: Mutex<Vec<u64>>,
    }

    impl FakeProbe {
        fn new(alive_polls: usize) -> Self {
            Self {
                alive_polls,
                probes: AtomicUsize::new(0),
                fail_first: false,
                start_times: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProcessProbe for FakeProbe {
        fn probe(&self, _pid: u32) -> Result<Liveness, String> {
            let count = self.probes.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && count == 0 {
                return Err("EINVAL".to_string());
            }
            if count < self.alive_polls {
                Ok(Liveness::Alive)
            } else {
                Ok(Liveness::Gone)
            }
        }

        fn start_time(&self, _pid: u32) -> Option<u64> {
            let mut times = self.start_times.lock().expect("start times");
            if times.is_empty() {
                None
            } else {
                Some(times.remove(0))
            }
        }
    }

    struct DropSink(Mutex<mpsc::Sender<String>>);

    impl Component for DropSink {
        fn name(&self) -> &'static str {
            "sink"
        }

        fn interests(&self) -> &'static [EventKind] {
            &[EventKind::SessionDrop]
        }

        fn handle(&self, event: PipelineEvent) {
            if let PipelineEvent::SessionDrop(id) = event {
                let _ = self.0.lock().expect("sink").send(id);
            }
        }
    }

    fn watcher_with(probe: FakeProbe) -> (SessionWatcher, mpsc::Receiver<String>) {
        let mut builder = DispatcherBuilder::new(8);
        let (tx, rx) = mpsc::channel();
        builder.register(Arc::new(DropSink(Mutex::new(tx))));
        let watcher = SessionWatcher::new(
            Duration::from_millis(10),
            Arc::new(probe),
            builder.publisher(),
        );
        let (_publisher, _orchestrator) = builder.start().expect("start");
        (watcher, rx)
    }

    #[test]
    fn concurrent_watch_starts_one_poller() {
        let (watcher, drops) = watcher_with(FakeProbe::new(2));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let watcher = watcher.clone();
                thread::spawn(move || watcher.watch("s1", 4242))
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|started| *started)
            .count();
        assert_eq!(started, 1);
        assert!(watcher.is_watched("s1"));

        assert_eq!(
            drops.recv_timeout(Duration::from_secs(2)).expect("drop"),
            "s1"
        );
        assert!(drops.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!watcher.is_watched("s1"));
        assert_eq!(watcher.watched_sessions(), 0);
    }

    #[test]
    fn probe_errors_are_treated_as_alive() {
        let probe = FakeProbe {
            fail_first: true,
            ..FakeProbe::new(2)
        };
        let (watcher, drops) = watcher_with(probe);

        let started = Instant::now();
        assert!(watcher.watch("s1", 4242));
        assert_eq!(
            drops.recv_timeout(Duration::from_secs(2)).expect("drop"),
            "s1"
        );
        // One failed probe plus one alive probe before the gone probe.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pid_reuse_ends_session() {
        let probe = FakeProbe::new(usize::MAX);
        *probe.start_times.lock().expect("start times") = vec![1_000, 1_000, 5_000];
        let (watcher, drops) = watcher_with(probe);

        assert!(watcher.watch("s1", 4242));
        assert_eq!(
            drops.recv_timeout(Duration::from_secs(2)).expect("drop"),
            "s1"
        );
    }

    #[test]
    fn session_can_be_watched_again_after_drop() {
        let (watcher, drops) = watcher_with(FakeProbe::new(0));

        assert!(watcher.watch("s1", 4242));
        drops.recv_timeout(Duration::from_secs(2)).expect("first drop");
        assert!(watcher.watch("s1", 4243));
        drops.recv_timeout(Duration::from_secs(2)).expect("second drop");
    }

    #[test]
    fn records_without_pid_are_ignored() {
        let (watcher, _drops) = watcher_with(FakeProbe::new(usize::MAX));
        assert!(!watcher.watch("s1", 0));
        assert!(!watcher.is_watched("s1"));
    }
}
