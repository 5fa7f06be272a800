//! Client helper for talking to the histd daemon.
//!
//! The daemon is the only writer of the history log. Failures are surfaced to
//! the caller; there is no local fallback.

use histd_protocol::{
    CollectFragment, Method, RecallRequest, Request, Response, SessionInit, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const ENABLE_ENV: &str = "HISTD_DAEMON_ENABLED";
const SOCKET_ENV: &str = "HISTD_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn send_fragment(fragment: &CollectFragment) -> Result<(), String> {
    let params = serde_json::to_value(fragment)
        .map_err(|err| format!("Failed to serialize record fragment: {}", err))?;
    let id = fragment.record.record_id.clone();
    send_with_retry(Method::Collect, Some(id), params, "record fragment").map(|_| ())
}

pub fn send_session_init(init: &SessionInit) -> Result<(), String> {
    let params = serde_json::to_value(init)
        .map_err(|err| format!("Failed to serialize session init: {}", err))?;
    let id = format!("init-{}", init.session_id);
    send_with_retry(Method::SessionInit, Some(id), params, "session init").map(|_| ())
}

/// Returns the recalled command line. Not retried: recall is interactive and a
/// stale answer is worse than none.
pub fn recall(request: &RecallRequest) -> Result<String, String> {
    let params = serde_json::to_value(request)
        .map_err(|err| format!("Failed to serialize recall request: {}", err))?;
    let data = call(Method::Recall, None, params)?;
    data.get("cmd_line")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "Recall response missing cmd_line".to_string())
}

pub fn daemon_health() -> Option<bool> {
    if !daemon_enabled() {
        return None;
    }

    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::GetHealth,
        id: Some("health-check".to_string()),
        params: None,
    };

    let response = send_request(request).ok()?;
    if !response.ok {
        return Some(false);
    }

    let status = response
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(|value| value.as_str());

    Some(matches!(status, Some("ok")))
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn socket_path() -> Result<PathBuf, String> {
    match env::var(SOCKET_ENV) {
        Ok(path) if !path.trim().is_empty() => return Ok(PathBuf::from(path)),
        _ => {}
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".histd").join(SOCKET_NAME))
}

fn call(method: Method, id: Option<String>, params: Value) -> Result<Value, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id,
        params: Some(params),
    };

    let response = send_request(request)?;
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let message = response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string());
        Err(message)
    }
}

/// One retry after a short pause, reusing the same request id so the daemon
/// logs can correlate both attempts.
fn send_with_retry(
    method: Method,
    id: Option<String>,
    params: Value,
    label: &str,
) -> Result<Value, String> {
    match call(method, id.clone(), params.clone()) {
        Ok(data) => Ok(data),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send {} to daemon", label);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            call(method, id, params).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    "Retry failed sending {} to daemon",
                    label
                );
                retry_err
            })
        }
    }
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}
