//! histd-hook: shell-side client for the histd daemon.
//!
//! Invoked from bash/zsh hooks. Recording subcommands never fail the shell:
//! errors are logged and the exit status stays 0. `recall` is interactive and
//! exits 1 when nothing can be recalled.
//!
//! ## Subcommands
//!
//! - `session-init`: register a new shell session (called once per shell)
//! - `collect`: report a command before it runs; prints the record id
//! - `postcollect`: report exit code and duration after it ran
//! - `recall`: print the command `histno` steps back in this session
//! - `health`: check whether the daemon is up

mod capture;
mod daemon_client;
mod logging;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use histd_protocol::{RecallRequest, SessionInit, ShellKind};
use thiserror::Error;

use capture::{PostExec, PreExec, SessionContext};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Daemon disabled")]
    Disabled,

    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Recall failed: {0}")]
    Recall(String),
}

#[derive(Parser)]
#[command(name = "histd-hook")]
#[command(about = "Shell history recorder and recall client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Unique id of this shell session
    #[arg(long)]
    session_id: String,

    /// Shell nesting depth ($SHLVL)
    #[arg(long, default_value_t = 1)]
    shlvl: u32,

    /// PID of the shell process
    #[arg(long)]
    session_pid: u32,

    /// Shell kind (bash or zsh)
    #[arg(long, default_value = "unknown")]
    shell: String,
}

impl SessionArgs {
    fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            shlvl: self.shlvl,
            session_pid: self.session_pid,
            shell: ShellKind::from(self.shell.as_str()),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a shell session with the daemon
    SessionInit {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Report a command before it runs (prints the record id)
    Collect {
        #[command(flatten)]
        session: SessionArgs,

        /// The command line as typed
        #[arg(long)]
        cmd_line: String,

        /// Working directory before the command
        #[arg(long, default_value = "")]
        pwd: String,

        /// Remote URL of the enclosing git repository
        #[arg(long, default_value = "")]
        git_remote: String,

        #[arg(long, default_value = "")]
        device_id: String,
    },

    /// Report the outcome of a command
    Postcollect {
        #[command(flatten)]
        session: SessionArgs,

        /// Record id printed by `collect`
        #[arg(long)]
        record_id: String,

        #[arg(long, allow_negative_numbers = true)]
        exit_code: i32,

        #[arg(long, default_value_t = 0)]
        duration_ms: u64,

        /// Working directory after the command
        #[arg(long, default_value = "")]
        pwd: String,
    },

    /// Print a past command of this session
    Recall {
        #[arg(long)]
        session_id: String,

        /// 1 is the most recent command
        #[arg(long, allow_negative_numbers = true)]
        histno: i64,

        /// Only consider commands starting with this text
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Check whether the daemon is reachable
    Health,
}

fn main() -> ExitCode {
    // Dropped on return so buffered log lines reach the file.
    let _logging_guard = logging::init();
    let cli = Cli::parse();
    run(cli.command)
}

fn run(command: Commands) -> ExitCode {
    match command {
        Commands::SessionInit { session } => {
            let init = SessionInit {
                session_id: session.session_id,
                session_pid: session.session_pid,
                shlvl: session.shlvl,
            };
            // Non-critical: log errors but exit 0 to not disrupt the shell
            if let Err(e) = ensure_enabled().and_then(|_| {
                daemon_client::send_session_init(&init).map_err(HookError::DaemonUnavailable)
            }) {
                tracing::warn!(
                    error = %e,
                    session_id = %init.session_id,
                    "histd-hook session-init failed"
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Collect {
            session,
            cmd_line,
            pwd,
            git_remote,
            device_id,
        } => {
            let fragment = capture::part_one(
                &session.context(),
                PreExec {
                    cmd_line,
                    pwd,
                    git_origin_remote: git_remote,
                    device_id,
                },
            );
            // The shell needs the id for postcollect even if the daemon is down.
            println!("{}", fragment.record.record_id);
            if let Err(e) = send_fragment(&fragment) {
                tracing::warn!(
                    error = %e,
                    record_id = %fragment.record.record_id,
                    "histd-hook collect failed"
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Postcollect {
            session,
            record_id,
            exit_code,
            duration_ms,
            pwd,
        } => {
            let fragment = capture::part_two(
                &session.context(),
                PostExec {
                    record_id,
                    exit_code,
                    duration_ms,
                    pwd_after: pwd,
                },
            );
            if let Err(e) = send_fragment(&fragment) {
                tracing::warn!(
                    error = %e,
                    record_id = %fragment.record.record_id,
                    "histd-hook postcollect failed"
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Recall {
            session_id,
            histno,
            prefix,
        } => match run_recall(RecallRequest {
            session_id,
            histno,
            prefix,
        }) {
            Ok(cmd_line) => {
                println!("{}", cmd_line);
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::debug!(error = %e, "histd-hook recall failed");
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Health => match daemon_client::daemon_health() {
            Some(true) => {
                println!("ok");
                ExitCode::SUCCESS
            }
            Some(false) => {
                println!("unhealthy");
                ExitCode::FAILURE
            }
            None => {
                println!("disabled");
                ExitCode::FAILURE
            }
        },
    }
}

fn ensure_enabled() -> Result<(), HookError> {
    if daemon_client::daemon_enabled() {
        Ok(())
    } else {
        Err(HookError::Disabled)
    }
}

fn send_fragment(fragment: &histd_protocol::CollectFragment) -> Result<(), HookError> {
    ensure_enabled()?;
    daemon_client::send_fragment(fragment).map_err(HookError::DaemonUnavailable)
}

fn run_recall(request: RecallRequest) -> Result<String, HookError> {
    ensure_enabled()?;
    request
        .validate()
        .map_err(|err| HookError::Recall(err.to_string()))?;
    daemon_client::recall(&request).map_err(HookError::Recall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn invalid_recall_returns_failure_code() {
        let code = run(Commands::Recall {
            session_id: String::new(),
            histno: 1,
            prefix: None,
        });
        assert_eq!(code, ExitCode::FAILURE);
    }

    #[test]
    fn parses_postcollect_with_negative_exit_code() {
        let cli = Cli::try_parse_from([
            "histd-hook",
            "postcollect",
            "--session-id",
            "s1",
            "--session-pid",
            "42",
            "--shell",
            "zsh",
            "--record-id",
            "rec-1",
            "--exit-code",
            "-1",
        ])
        .expect("parse");

        match cli.command {
            Commands::Postcollect {
                session,
                exit_code,
                duration_ms,
                ..
            } => {
                assert_eq!(exit_code, -1);
                assert_eq!(duration_ms, 0);
                assert_eq!(session.context().shell, ShellKind::Zsh);
                assert_eq!(session.shlvl, 1);
            }
            _ => panic!("expected postcollect"),
        }
    }
}
