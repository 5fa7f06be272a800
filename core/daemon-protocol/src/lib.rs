//! IPC protocol types and validation for histd.
//!
//! This crate is shared by the daemon and the shell hook to prevent schema
//! drift. The daemon remains the authority on validation, but clients reuse the
//! same types to construct valid requests.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod record;

pub use record::{CollectFragment, MergeError, MergeKey, Record, SessionInit, ShellKind};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_PREFIX_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Collect,
    SessionInit,
    Recall,
    Inspect,
    GetRecent,
    Dump,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Arrow-up recall: `histno` 1 is the most recent command of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecallRequest {
    pub session_id: String,
    pub histno: i64,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl RecallRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        record::require_id(&self.session_id, "session_id")?;
        if let Some(prefix) = &self.prefix {
            if prefix.len() > MAX_PREFIX_BYTES {
                return Err(ErrorInfo::new(
                    "invalid_prefix",
                    format!("prefix must be {} bytes or fewer", MAX_PREFIX_BYTES),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InspectRequest {
    pub session_id: String,
    #[serde(default = "default_inspect_count")]
    pub count: usize,
}

fn default_inspect_count() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecentRequest {
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
}

fn default_recent_limit() -> usize {
    100
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    /// Only the latest record of each distinct command line.
    #[serde(default)]
    pub distinct: bool,
}

pub fn parse_fragment(params: Value) -> Result<CollectFragment, ErrorInfo> {
    let fragment: CollectFragment = parse_params(params, "record fragment")?;
    fragment.validate()?;
    Ok(fragment)
}

pub fn parse_session_init(params: Value) -> Result<SessionInit, ErrorInfo> {
    let init: SessionInit = parse_params(params, "session init")?;
    init.validate()?;
    Ok(init)
}

pub fn parse_recall(params: Value) -> Result<RecallRequest, ErrorInfo> {
    let request: RecallRequest = parse_params(params, "recall request")?;
    request.validate()?;
    Ok(request)
}

pub fn parse_params<T: DeserializeOwned>(params: Value, label: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", label, err),
        )
    })
}
