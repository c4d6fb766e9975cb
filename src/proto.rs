//! Shared protocol types for the skiff framed transport
//!
//! Control messages are JSON objects behind a 4-byte big-endian length
//! prefix. File content travels as unframed raw bytes whose length is
//! declared by the preceding metadata response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Default TCP port for the session protocol
pub const DEFAULT_PORT: u16 = 9710;

/// Default UDP port for discovery
pub const DEFAULT_DISCOVERY_PORT: u16 = 9711;

// Maximum frame payload size (8MB) - prevents memory exhaustion from a
// hostile peer; raw file regions are not subject to this limit.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Default chunk size for raw file streaming
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// API names carried in the request envelope.
///
/// A closed enum plus exhaustive match replaces the string->handler map of
/// a dynamic dispatch table; unknown strings fail at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    Connect,
    Disconnect,
    Info,
    List,
    Ping,
    Open,
    Close,
    Rcd,
    Rpwd,
    Rls,
    Rtree,
    Rfind,
    Rdu,
    Rmkdir,
    Rrm,
    Rmv,
    Rcp,
    Rstat,
    Get,
    GetNext,
    Put,
    PutNext,
}

impl Api {
    pub fn as_str(self) -> &'static str {
        match self {
            Api::Connect => "connect",
            Api::Disconnect => "disconnect",
            Api::Info => "info",
            Api::List => "list",
            Api::Ping => "ping",
            Api::Open => "open",
            Api::Close => "close",
            Api::Rcd => "rcd",
            Api::Rpwd => "rpwd",
            Api::Rls => "rls",
            Api::Rtree => "rtree",
            Api::Rfind => "rfind",
            Api::Rdu => "rdu",
            Api::Rmkdir => "rmkdir",
            Api::Rrm => "rrm",
            Api::Rmv => "rmv",
            Api::Rcp => "rcp",
            Api::Rstat => "rstat",
            Api::Get => "get",
            Api::GetNext => "getNext",
            Api::Put => "put",
            Api::PutNext => "putNext",
        }
    }

    pub fn parse(s: &str) -> Option<Api> {
        Some(match s {
            "connect" => Api::Connect,
            "disconnect" => Api::Disconnect,
            "info" => Api::Info,
            "list" => Api::List,
            "ping" => Api::Ping,
            "open" => Api::Open,
            "close" => Api::Close,
            "rcd" => Api::Rcd,
            "rpwd" => Api::Rpwd,
            "rls" => Api::Rls,
            "rtree" => Api::Rtree,
            "rfind" => Api::Rfind,
            "rdu" => Api::Rdu,
            "rmkdir" => Api::Rmkdir,
            "rrm" => Api::Rrm,
            "rmv" => Api::Rmv,
            "rcp" => Api::Rcp,
            "rstat" => Api::Rstat,
            "get" => Api::Get,
            "getNext" => Api::GetNext,
            "put" => Api::Put,
            "putNext" => Api::PutNext,
            _ => return None,
        })
    }
}

/// Protocol-visible error codes, serialized by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    AuthenticationFailed,
    NotConnected,
    SharingNotFound,
    SharingNotOpen,
    InvalidPath,
    NotADirectory,
    NotWritable,
    InvalidDestSemantic,
    NotExists,
    PermissionDenied,
    DirectoryNotEmpty,
    CheckFailed,
    InvalidRequest,
    UnknownApi,
    CommandExecutionFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ErrorCode {
    /// Map a filesystem error to the closest protocol code.
    pub fn from_io(err: &std::io::Error) -> ErrorCode {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ErrorCode::NotExists,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            _ => ErrorCode::CommandExecutionFailed,
        }
    }
}

/// One failed subject inside a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub errno: ErrorCode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
}

impl ErrorDescriptor {
    pub fn new(errno: ErrorCode, subject: impl Into<String>) -> Self {
        Self {
            errno,
            subjects: vec![subject.into()],
        }
    }

    pub fn bare(errno: ErrorCode) -> Self {
        Self {
            errno,
            subjects: Vec::new(),
        }
    }
}

/// Request envelope: `{"api": "...", "params": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub api: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(api: Api) -> Self {
        Self {
            api: api.as_str().to_string(),
            params: Value::Null,
        }
    }

    pub fn with_params<T: Serialize>(api: Api, params: &T) -> serde_json::Result<Self> {
        Ok(Self {
            api: api.as_str().to_string(),
            params: serde_json::to_value(params)?,
        })
    }

    pub fn parse_params<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        T::deserialize(self.params.clone())
    }
}

/// Response envelope: one per request on the control path; a sequence of
/// them inside the GET/PUT sub-protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorDescriptor>>,
}

impl Response {
    /// Empty success acknowledgement.
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            errors: None,
        }
    }

    pub fn with_data<T: Serialize>(data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            success: true,
            data: Some(serde_json::to_value(data)?),
            error: None,
            errors: None,
        })
    }

    pub fn err(code: ErrorCode) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code),
            errors: None,
        }
    }

    pub fn err_subjects(code: ErrorCode, errors: Vec<ErrorDescriptor>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code),
            errors: Some(errors),
        }
    }

    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<Option<T>> {
        match &self.data {
            Some(v) => Ok(Some(T::deserialize(v.clone())?)),
            None => Ok(None),
        }
    }
}

/// Entry kind as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Dir,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FileType::File => "file",
            FileType::Dir => "dir",
        })
    }
}

/// File metadata exchanged during negotiation and listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub ftype: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
}

impl FileInfo {
    /// Build metadata for an on-disk entry, reporting `name` (never the
    /// host path) to the peer.
    pub fn of(path: &Path, name: String) -> std::io::Result<FileInfo> {
        let md = std::fs::metadata(path)?;
        Ok(FileInfo::from_metadata(&md, name))
    }

    pub fn from_metadata(md: &std::fs::Metadata, name: String) -> FileInfo {
        let ftype = if md.is_dir() {
            FileType::Dir
        } else {
            FileType::File
        };
        FileInfo {
            name,
            ftype,
            size: if md.is_file() { Some(md.len()) } else { None },
            mtime: mtime_secs(md),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Dir
    }
}

/// Modification time as unix seconds, if the platform reports one.
pub fn mtime_secs(md: &std::fs::Metadata) -> Option<i64> {
    let t = md.modified().ok()?;
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => Some(d.as_secs() as i64),
        Err(e) => Some(-(e.duration().as_secs() as i64)),
    }
}

/// Client action inside the GET sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetAction {
    Transfer,
    Skip,
    Abort,
}

/// Overwrite policy carried with every PUT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverwritePolicy {
    Prompt,
    Yes,
    No,
    NewerOnly,
    DiffSizeOnly,
    NewerOrDiffSize,
}

/// Server decision for one PUT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutStatus {
    Accepted,
    Refused,
    Uncertain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParams {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub no_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNextParams {
    pub action: GetAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParams {
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub preview: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default)]
    pub is_multiple: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutNextParams {
    /// Absent metadata terminates the PUT loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<FileInfo>,
    #[serde(default = "default_policy")]
    pub policy: OverwritePolicy,
    #[serde(default)]
    pub sync: bool,
}

fn default_policy() -> OverwritePolicy {
    OverwritePolicy::Prompt
}

/// Per-entry reply inside the PUT loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutNextReply {
    pub status: PutStatus,
    #[serde(default)]
    pub already_existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing: Option<FileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub path: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final summary response of a GET/PUT sub-protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSummary {
    pub outcome: bool,
    #[serde(default)]
    pub errors: Vec<ErrorDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_results: Option<Vec<SyncResult>>,
}

/// One node of an `rtree` response, pre-order with its depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub info: FileInfo,
    pub depth: usize,
}

/// Sharing descriptor as advertised by `list` and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingInfo {
    pub name: String,
    pub ftype: FileType,
    pub read_only: bool,
}

/// Full server descriptor returned by `info` and discovery responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub port: u16,
    pub auth: bool,
    pub sharings: Vec<SharingInfo>,
    /// Filled in client-side from the datagram source address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<std::net::IpAddr>,
}
