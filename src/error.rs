//! Error types for runectl

use std::backtrace::Backtrace;
use std::fmt;
use thiserror::Error;

/// Result type for runectl operations
pub type Result<T> = std::result::Result<T, CtlError>;

/// Status codes reported by the runtime daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unavailable,
    Canceled,
    DeadlineExceeded,
    Internal,
}

impl RpcCode {
    /// Map a wire code (`"not_found"`, ...) to a status code
    pub fn from_wire(code: &str) -> Self {
        match code {
            "not_found" => RpcCode::NotFound,
            "already_exists" => RpcCode::AlreadyExists,
            "permission_denied" => RpcCode::PermissionDenied,
            "unavailable" => RpcCode::Unavailable,
            "canceled" => RpcCode::Canceled,
            "deadline_exceeded" => RpcCode::DeadlineExceeded,
            _ => RpcCode::Internal,
        }
    }

    /// Map an HTTP status from the daemon to a status code
    pub fn from_http(status: u16) -> Self {
        match status {
            404 => RpcCode::NotFound,
            409 => RpcCode::AlreadyExists,
            401 | 403 => RpcCode::PermissionDenied,
            503 => RpcCode::Unavailable,
            499 => RpcCode::Canceled,
            504 | 408 => RpcCode::DeadlineExceeded,
            _ => RpcCode::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::NotFound => "not_found",
            RpcCode::AlreadyExists => "already_exists",
            RpcCode::PermissionDenied => "permission_denied",
            RpcCode::Unavailable => "unavailable",
            RpcCode::Canceled => "canceled",
            RpcCode::DeadlineExceeded => "deadline_exceeded",
            RpcCode::Internal => "internal",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification used for exit codes and rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    User,
    Conflict,
    Runtime,
    Container,
    Internal,
    Canceled,
}

/// Object kinds addressed by the resolver and the name store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Container,
    Image,
    Network,
    Volume,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Container => write!(f, "container"),
            ObjectKind::Image => write!(f, "image"),
            ObjectKind::Network => write!(f, "network"),
            ObjectKind::Volume => write!(f, "volume"),
        }
    }
}

/// runectl error types
#[derive(Error, Debug)]
pub enum CtlError {
    #[error("{0}")]
    Usage(String),

    #[error("no such {kind}: {query}")]
    NotFound { kind: ObjectKind, query: String },

    #[error("multiple {kind}s match {query:?}: {}", .candidates.join(", "))]
    AmbiguousReference {
        kind: ObjectKind,
        query: String,
        candidates: Vec<String>,
    },

    #[error("invalid reference format: {0}")]
    InvalidReference(String),

    #[error("unable to find user {0}: no matching entries in passwd file")]
    UserNotFound(String),

    #[error("unable to find group {0}: no matching entries in group file")]
    GroupNotFound(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("the {kind} name {name:?} is already in use by {id}")]
    NameConflict {
        kind: ObjectKind,
        name: String,
        id: String,
    },

    #[error("{message}")]
    Conflict { message: String, hint: String },

    #[error("volume {name} is in use by container(s) {}", .containers.join(", "))]
    VolumeInUse {
        name: String,
        containers: Vec<String>,
    },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("runtime error ({code}): {message}")]
    Runtime { code: RpcCode, message: String },

    #[error("failed to reach runtime daemon at {address}: {message}")]
    Unreachable { address: String, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("CNI plugin {plugin} failed ({code}): {message}")]
    Cni {
        plugin: String,
        code: u32,
        message: String,
    },

    #[error("container {id} is not running")]
    NotRunning { id: String },

    #[error("container {id} is paused, unpause the container before {action}")]
    Paused { id: String, action: String },

    #[error("exec: {0}: permission denied")]
    CommandNotExecutable(String),

    #[error("exec: {0}: executable file not found in $PATH")]
    CommandNotFound(String),

    #[error("container exited with code {0}")]
    ContainerExit(i32),

    #[error("timed out after {seconds}s waiting for {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("operation canceled")]
    Canceled { user: bool },

    #[error("{}", render_failures(.0))]
    Multiple(Vec<(String, CtlError)>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("OCI spec error: {0}")]
    Oci(#[from] oci_spec::OciSpecError),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        trace: String,
    },
}

fn render_failures(failures: &[(String, CtlError)]) -> String {
    let mut out = format!("{} operation(s) failed:", failures.len());
    for (name, err) in failures {
        out.push_str(&format!("\n  {}: {}", name, err));
    }
    out
}

impl CtlError {
    /// Build an internal error carrying a short backtrace fragment
    pub fn internal(message: impl Into<String>) -> Self {
        let backtrace = Backtrace::force_capture().to_string();
        let fragment = backtrace.lines().take(24).collect::<Vec<_>>().join("\n");
        CtlError::Internal {
            message: message.into(),
            trace: fragment,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        CtlError::Usage(message.into())
    }

    pub fn not_found(kind: ObjectKind, query: impl Into<String>) -> Self {
        CtlError::NotFound {
            kind,
            query: query.into(),
        }
    }

    pub fn conflict(message: impl Into<String>, hint: impl Into<String>) -> Self {
        CtlError::Conflict {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn runtime(code: RpcCode, message: impl Into<String>) -> Self {
        CtlError::Runtime {
            code,
            message: message.into(),
        }
    }

    /// The runtime status code, if this error came from the daemon
    pub fn rpc_code(&self) -> Option<RpcCode> {
        match self {
            CtlError::Runtime { code, .. } => Some(*code),
            CtlError::Unreachable { .. } => Some(RpcCode::Unavailable),
            _ => None,
        }
    }

    /// Whether the daemon reported the addressed object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, CtlError::NotFound { .. }) || self.rpc_code() == Some(RpcCode::NotFound)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CtlError::Usage(_)
            | CtlError::NotFound { .. }
            | CtlError::AmbiguousReference { .. }
            | CtlError::InvalidReference(_)
            | CtlError::UserNotFound(_)
            | CtlError::GroupNotFound(_)
            | CtlError::InvalidPath { .. }
            | CtlError::DependencyCycle(_)
            | CtlError::InvalidConfig(_)
            | CtlError::Yaml(_)
            | CtlError::Toml(_) => ErrorClass::User,
            CtlError::NameConflict { .. }
            | CtlError::Conflict { .. }
            | CtlError::VolumeInUse { .. }
            | CtlError::NotRunning { .. }
            | CtlError::Paused { .. } => ErrorClass::Conflict,
            CtlError::Runtime { code, .. } if *code == RpcCode::Canceled => ErrorClass::Canceled,
            CtlError::Runtime { .. }
            | CtlError::Unreachable { .. }
            | CtlError::Network(_)
            | CtlError::Cni { .. }
            | CtlError::Timeout { .. } => ErrorClass::Runtime,
            CtlError::CommandNotExecutable(_)
            | CtlError::CommandNotFound(_)
            | CtlError::ContainerExit(_) => ErrorClass::Container,
            CtlError::Canceled { .. } => ErrorClass::Canceled,
            CtlError::Multiple(failures) => failures
                .first()
                .map(|(_, e)| e.class())
                .unwrap_or(ErrorClass::Internal),
            CtlError::Lock(_)
            | CtlError::Io(_)
            | CtlError::Json(_)
            | CtlError::Oci(_)
            | CtlError::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CtlError::CommandNotExecutable(_) => 126,
            CtlError::CommandNotFound(_) => 127,
            CtlError::ContainerExit(code) => *code,
            CtlError::Canceled { user: true } => 130,
            _ if self.class() == ErrorClass::Canceled => 130,
            _ => 125,
        }
    }

    /// User-initiated cancellation is reported without a message
    pub fn is_quiet(&self) -> bool {
        matches!(self, CtlError::Canceled { user: true } | CtlError::ContainerExit(_))
    }

    /// Actionable follow-up printed after conflict errors
    pub fn hint(&self) -> Option<String> {
        match self {
            CtlError::Conflict { hint, .. } if !hint.is_empty() => Some(hint.clone()),
            CtlError::NameConflict { kind, name, id } => Some(format!(
                "remove or rename {} {} ({}) to reuse the name {:?}",
                kind,
                name,
                short_id(id),
                name
            )),
            CtlError::VolumeInUse { .. } => {
                Some("remove the containers first, or use --force".to_string())
            }
            CtlError::NotRunning { .. } => Some("start the container first".to_string()),
            CtlError::AmbiguousReference { .. } => {
                Some("use a longer ID prefix or the full name".to_string())
            }
            _ => None,
        }
    }

    /// Render the error for stderr
    pub fn render(&self) -> String {
        let mut out = format!("Error: {}", self);
        if let Some(hint) = self.hint() {
            out.push_str(&format!("\nHint: {}", hint));
        }
        if let CtlError::Internal { trace, .. } = self {
            if !trace.is_empty() {
                out.push('\n');
                out.push_str(trace);
            }
        }
        out
    }
}

/// First 12 characters of an object ID
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
