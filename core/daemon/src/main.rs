//! histd daemon entrypoint.
//!
//! Owns the shell history pipeline: a socket listener decodes record
//! fragments and session events from the shell hooks and hands them to the
//! dispatcher, which fans them out to the merge engine, the session watcher
//! and the recall buffers. Recall and history queries are answered directly
//! from in-memory state.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use histd_protocol::{
    parse_fragment, parse_params, parse_recall, parse_session_init, DumpRequest, ErrorInfo,
    InspectRequest, Method, RecentRequest, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

mod config;
mod dispatch;
mod histfile;
mod histlog;
mod process;
mod recall;
mod record_store;
mod sesswatch;

use config::{DaemonConfig, DaemonPaths};
use dispatch::{DispatcherBuilder, PipelineEvent, PublishError, Publisher, ShutdownOrchestrator};
use histfile::Histfile;
use histlog::LogWriter;
use process::SystemProbe;
use recall::RecallBuffers;
use sesswatch::SessionWatcher;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const MAX_QUERY_LIMIT: usize = 10_000;

/// Handles shared by every connection thread.
struct Daemon {
    publisher: Publisher,
    histfile: Arc<Histfile>,
    recall: Arc<RecallBuffers>,
    watcher: SessionWatcher,
    history_log: PathBuf,
}

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let paths = match DaemonPaths::resolve(&config) {
        Ok(paths) => paths,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon paths");
            std::process::exit(1);
        }
    };

    let writer = LogWriter::spawn(paths.history_log.clone());
    let histfile = match Histfile::load(&paths, &config.history, writer) {
        Ok(histfile) => Arc::new(histfile),
        Err(err) => {
            error!(error = %err, path = %paths.history_log.display(), "Failed to load history log");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&paths.socket) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&paths.socket) {
        error!(error = %err, path = %paths.socket.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&paths.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %paths.socket.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let mut builder = DispatcherBuilder::new(config.dispatch.channel_capacity);
    let recall = Arc::new(RecallBuffers::new());
    let watcher = SessionWatcher::new(
        config.watcher.poll_interval(),
        Arc::new(SystemProbe),
        builder.publisher(),
    );
    builder.register(Arc::clone(&histfile) as Arc<dyn dispatch::Component>);
    builder.register(Arc::new(watcher.clone()));
    builder.register(Arc::clone(&recall) as Arc<dyn dispatch::Component>);

    let (publisher, orchestrator) = match builder.start() {
        Ok(started) => started,
        Err(err) => {
            error!(error = %err, "Failed to start dispatcher");
            std::process::exit(1);
        }
    };

    if let Err(err) = spawn_signal_handler(
        orchestrator,
        config.dispatch.shutdown_timeout(),
        paths.socket.clone(),
    ) {
        error!(error = %err, "Failed to install signal handler");
        std::process::exit(1);
    }

    info!(
        socket = %paths.socket.display(),
        history_log = %paths.history_log.display(),
        channel_capacity = config.dispatch.channel_capacity,
        poll_interval_ms = config.watcher.poll_interval_ms,
        "histd daemon started"
    );

    let daemon = Arc::new(Daemon {
        publisher,
        histfile,
        recall,
        watcher,
        history_log: paths.history_log,
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || handle_connection(stream, daemon));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("HISTD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// On SIGTERM, SIGINT or SIGHUP: flush every component (bounded by
/// `timeout`), remove the socket and exit.
fn spawn_signal_handler(
    orchestrator: ShutdownOrchestrator,
    timeout: Duration,
    socket_path: PathBuf,
) -> Result<(), String> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])
        .map_err(|err| format!("Failed to register signals: {}", err))?;

    thread::Builder::new()
        .name("histd-signals".to_string())
        .spawn(move || {
            let Some(signal) = signals.forever().next() else {
                return;
            };
            info!(signal, "Shutdown signal received");
            let report = orchestrator.shutdown(timeout);
            if let Err(err) = remove_existing_socket(&socket_path) {
                warn!(error = %err, "Failed to remove socket on shutdown");
            }
            info!(
                acknowledged = report.acknowledged.len(),
                outstanding = report.outstanding.len(),
                "histd daemon stopped"
            );
            std::process::exit(0);
        })
        .map(|_| ())
        .map_err(|err| format!("Failed to spawn signal thread: {}", err))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &daemon);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "history_log": daemon.history_log.display().to_string(),
                "watched_sessions": daemon.watcher.watched_sessions(),
                "recall_sessions": daemon.recall.session_count(),
            });
            if let Ok(value) = serde_json::to_value(daemon.histfile.stats()) {
                data["history"] = value;
            }
            Response::ok(request.id, data)
        }
        Method::Collect => {
            let params = match require_params(request.params, "record fragment is required") {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let fragment = match parse_fragment(params) {
                Ok(fragment) => fragment,
                Err(err) => {
                    warn!(code = %err.code, message = %err.message, "Dropping malformed record fragment");
                    return Response::error_with_info(request.id, err);
                }
            };
            debug!(
                session_id = %fragment.session_id,
                shlvl = fragment.shlvl,
                record_id = %fragment.record.record_id,
                part_one = fragment.is_part_one(),
                "Record fragment received"
            );
            publish(request.id, &daemon.publisher, PipelineEvent::Record(fragment))
        }
        Method::SessionInit => {
            let params = match require_params(request.params, "session init is required") {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let init = match parse_session_init(params) {
                Ok(init) => init,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            info!(
                session_id = %init.session_id,
                session_pid = init.session_pid,
                shlvl = init.shlvl,
                "Session init received"
            );
            publish(request.id, &daemon.publisher, PipelineEvent::SessionInit(init))
        }
        Method::Recall => {
            let params = match require_params(request.params, "recall request is required") {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let recall = match parse_recall(params) {
                Ok(recall) => recall,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match daemon
                .recall
                .recall(&recall.session_id, recall.histno, recall.prefix.as_deref())
            {
                Ok(cmd_line) => Response::ok(request.id, serde_json::json!({ "cmd_line": cmd_line })),
                Err(err) => {
                    debug!(session_id = %recall.session_id, histno = recall.histno, error = %err, "Recall failed");
                    Response::error(request.id, err.code(), err.to_string())
                }
            }
        }
        Method::Inspect => {
            let params = match require_params(request.params, "session_id is required") {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let inspect: InspectRequest = match parse_params(params, "inspect request") {
                Ok(inspect) => inspect,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match daemon
                .recall
                .inspect(&inspect.session_id, inspect.count.min(MAX_QUERY_LIMIT))
            {
                Ok(lines) => respond(request.id, &lines, "recall buffer"),
                Err(err) => Response::error(request.id, err.code(), err.to_string()),
            }
        }
        Method::GetRecent => {
            let recent: RecentRequest =
                match parse_params(request.params.unwrap_or_else(empty_object), "recent request") {
                    Ok(recent) => recent,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
            let lines = daemon
                .histfile
                .recent_cmd_lines(recent.shell, recent.limit.min(MAX_QUERY_LIMIT));
            debug!(shell = recent.shell.as_str(), lines = lines.len(), "Recent commands snapshot");
            respond(request.id, &lines, "recent commands")
        }
        Method::Dump => {
            let dump: DumpRequest =
                match parse_params(request.params.unwrap_or_else(empty_object), "dump request") {
                    Ok(dump) => dump,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
            let records = daemon.histfile.dump(dump.limit, dump.distinct);
            debug!(records = records.len(), "History dump");
            respond(request.id, &records, "history records")
        }
    }
}

fn publish(id: Option<String>, publisher: &Publisher, event: PipelineEvent) -> Response {
    match publisher.publish(event) {
        Ok(()) => Response::ok(id, serde_json::json!({ "accepted": true })),
        Err(err @ PublishError::ShuttingDown) => {
            debug!(error = %err, "Event refused during shutdown");
            Response::error(id, err.code(), err.to_string())
        }
        Err(err) => {
            error!(error = %err, "Failed to publish event");
            Response::error(id, err.code(), err.to_string())
        }
    }
}

fn require_params(params: Option<Value>, message: &str) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("invalid_params", message))
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn respond<T: Serialize + ?Sized>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", label, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
