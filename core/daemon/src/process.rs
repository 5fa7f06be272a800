//! Process inspection helpers for the daemon.

use sysinfo::{Pid, ProcessRefreshKind, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
}

/// Answers "does this pid still exist?".
///
/// `Err` means the probe itself failed and says nothing about the process.
pub trait ProcessProbe: Send + Sync {
    fn probe(&self, pid: u32) -> Result<Liveness, String>;

    /// Start time used to tell a live process from a reused pid.
    fn start_time(&self, _pid: u32) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn probe(&self, pid: u32) -> Result<Liveness, String> {
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(format!("pid {} is not a single process", pid));
        }
        probe_pid(pid)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        get_process_start_time(pid)
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> Result<Liveness, String> {
    // SAFETY: signal 0 performs the existence and permission checks only.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return Ok(Liveness::Alive);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(Liveness::Gone),
        // Exists, owned by someone else.
        Some(libc::EPERM) => Ok(Liveness::Alive),
        _ => Err(format!("kill({}, 0) failed: {}", pid, err)),
    }
}

#[cfg(not(unix))]
fn probe_pid(pid: u32) -> Result<Liveness, String> {
    Ok(match get_process_start_time(pid) {
        Some(_) => Liveness::Alive,
        None => Liveness::Gone,
    })
}

pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}
