//! Errors surfaced by the protocol engine.
//!
//! Every error that reaches the client goes out as an `E` frame carrying a
//! severity byte, a 32-bit error code and a message. The code space is
//! hierarchical: the high byte is the error class, so clients may match on
//! prefixes.

use std::collections::HashMap;
use std::fmt;

/// Severity byte of an `E` frame.
pub const SEVERITY_ERROR: u8 = 120;
pub const SEVERITY_FATAL: u8 = 200;
pub const SEVERITY_PANIC: u8 = 255;

/// Attribute keys inside an `E` frame.
pub const FIELD_HINT: u16 = 0x0001;
pub const FIELD_DETAILS: u16 = 0x0002;
pub const FIELD_SERVER_TRACEBACK: u16 = 0x0101;

const BUG_REPORT_HINT: &str =
    "This appears to be a bug. Please consider opening an issue ticket at the server's tracker.";

/// Error classification. Each kind maps to a stable wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Anything not in the domain hierarchy ends up here.
    InternalServerError,
    /// Feature exists but is not supported by this server build.
    UnsupportedFeature,
    /// Operation requested in the wrong session state.
    Protocol,
    /// Malformed framing, wrong message type, bad header shape.
    BinaryProtocol,
    /// Offered protocol version cannot be served at all.
    UnsupportedProtocolVersion,
    /// Client-declared input type id disagrees with the compiled one.
    ParameterTypeMismatch,
    /// Client session-state type id does not match the current schema.
    StateMismatch,
    /// Query requires a capability the connection was not granted.
    DisabledCapability,
    /// Interpreted query-compilation error.
    Query,
    /// Interpreted query-execution error from the backend.
    Execution,
    /// Database does not accept connections.
    Access,
    /// Missing credentials, bad token, failed scope check.
    Authentication,
    /// Session closed for idling.
    IdleSessionTimeout,
    /// Tenant readiness gate: administratively blocked.
    ServerBlocked,
    /// Tenant readiness gate: shutting down or failed over.
    ServerOffline,
    /// Backend cannot take queries right now.
    BackendUnavailable,
    /// Raised locally when the connection's cancel flag is set. Never
    /// serialized; the connection is torn down instead.
    ConnectionAborted,
    /// Transport failure. Never serialized.
    Io,
}

impl ErrorKind {
    /// Stable on-wire code. High byte is the class.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::InternalServerError => 0x01_00_00_00,
            ErrorKind::UnsupportedFeature => 0x02_00_01_00,
            ErrorKind::Protocol => 0x03_00_00_00,
            ErrorKind::BinaryProtocol => 0x03_01_00_00,
            ErrorKind::UnsupportedProtocolVersion => 0x03_01_00_01,
            ErrorKind::ParameterTypeMismatch => 0x03_02_00_00,
            ErrorKind::StateMismatch => 0x03_03_00_00,
            ErrorKind::DisabledCapability => 0x03_04_00_00,
            ErrorKind::Query => 0x04_00_00_00,
            ErrorKind::Execution => 0x05_00_00_00,
            ErrorKind::IdleSessionTimeout => 0x06_01_00_00,
            ErrorKind::Access => 0x07_00_00_00,
            ErrorKind::Authentication => 0x07_01_00_00,
            ErrorKind::BackendUnavailable => 0x08_00_00_01,
            ErrorKind::ServerOffline => 0x08_00_00_02,
            ErrorKind::ServerBlocked => 0x08_00_00_03,
            // Internal kinds still need a code if they ever leak into a
            // frame; treat them as internal server errors.
            ErrorKind::ConnectionAborted | ErrorKind::Io => 0x01_00_00_00,
        }
    }

    pub fn severity(&self) -> u8 {
        match self {
            ErrorKind::Authentication
            | ErrorKind::Access
            | ErrorKind::IdleSessionTimeout
            | ErrorKind::ServerBlocked
            | ErrorKind::ServerOffline => SEVERITY_FATAL,
            _ => SEVERITY_ERROR,
        }
    }
}

/// The engine-wide error type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<String>,
    pub details: Option<String>,
    /// Formatted cause of a wrapped foreign error, sent under
    /// `SERVER_TRACEBACK` for internal server errors.
    pub traceback: Option<String>,
    /// Raw backend fields when this error has not been interpreted yet.
    /// The dispatcher routes such errors through `interpret_error`.
    pub backend: Option<BackendErrorFields>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            hint: None,
            details: None,
            traceback: None,
            backend: None,
        }
    }

    /// An uninterpreted backend error. The dispatcher is responsible for
    /// running it through the interpretation pipeline before emission.
    pub fn from_backend(fields: BackendErrorFields) -> Self {
        let mut err = Error::new(ErrorKind::Execution, fields.message.clone());
        err.backend = Some(fields);
        err
    }

    pub fn is_backend_cancellation(&self) -> bool {
        self.backend
            .as_ref()
            .map(|f| f.is_cancellation())
            .unwrap_or(false)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Protocol, message)
    }

    pub fn binary_protocol(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::BinaryProtocol, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Authentication, message)
    }

    pub fn access(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Access, message)
    }

    pub fn state_mismatch() -> Self {
        Error::new(
            ErrorKind::StateMismatch,
            "Cannot decode state: type mismatch",
        )
    }

    pub fn disabled_capability(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::DisabledCapability, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ConnectionAborted, message)
    }

    /// Wrap anything foreign, preserving its rendering for the traceback
    /// field and defaulting the hint to the bug-report pointer.
    pub fn internal(cause: impl fmt::Display) -> Self {
        Error {
            kind: ErrorKind::InternalServerError,
            message: "internal server error".to_string(),
            hint: Some(BUG_REPORT_HINT.to_string()),
            details: None,
            traceback: Some(format!("{cause}")),
            backend: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn severity(&self) -> u8 {
        self.kind.severity()
    }

    /// After emitting this error, should the dispatcher drain to Sync and
    /// keep the connection? Offline/blocked and transport-level failures
    /// close instead.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::ServerOffline
                | ErrorKind::ServerBlocked
                | ErrorKind::ConnectionAborted
                | ErrorKind::Io
        )
    }

    /// Attribute fields for the `E` frame, in emission order.
    pub fn wire_fields(&self) -> Vec<(u16, String)> {
        let mut fields = Vec::new();
        if let Some(hint) = &self.hint {
            fields.push((FIELD_HINT, hint.clone()));
        }
        if let Some(details) = &self.details {
            fields.push((FIELD_DETAILS, details.clone()));
        }
        if let Some(tb) = &self.traceback {
            fields.push((FIELD_SERVER_TRACEBACK, tb.clone()));
        }
        fields
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, format!("socket error: {err}"))
    }
}

/// Error fields as reported by the backend: SQLSTATE code, message and the
/// optional detail/constraint attributes.
#[derive(Debug, Clone, Default)]
pub struct BackendErrorFields {
    pub sqlstate: String,
    pub message: String,
    pub detail: Option<String>,
    pub constraint: Option<String>,
}

impl BackendErrorFields {
    pub fn new(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        BackendErrorFields {
            sqlstate: sqlstate.into(),
            message: message.into(),
            detail: None,
            constraint: None,
        }
    }

    /// The backend reports a cancelled query with SQLSTATE 57014.
    pub fn is_cancellation(&self) -> bool {
        self.sqlstate == "57014"
    }
}

/// Result of the static first pass over a backend error.
#[derive(Debug)]
pub enum Interpreted {
    Error(Error),
    /// The message references schema objects; a schema-aware translation
    /// must be requested from the compiler pool.
    SchemaRequired,
}

/// Static mapping of backend SQLSTATE classes into the domain hierarchy.
///
/// Constraint and dependency violations surface backend object names and
/// need the compiler's schema to produce a user-facing message, so they
/// return [`Interpreted::SchemaRequired`].
pub fn static_interpret_backend_error(fields: &BackendErrorFields) -> Interpreted {
    let state = fields.sqlstate.as_str();
    match state {
        // Integrity violations name constraints; schema required.
        "23502" | "23503" | "23505" | "23514" | "23P01" => Interpreted::SchemaRequired,
        // Undefined objects surfaced mid-DDL also need schema context.
        "42704" | "2BP01" => Interpreted::SchemaRequired,
        // Stack depth exhaustion: deep casts or self-referencing aliases.
        "54001" => Interpreted::Error(Error::new(
            ErrorKind::UnsupportedFeature,
            "query caused the compiler or backend stack to overflow",
        )),
        "57014" => Interpreted::Error(Error::new(
            ErrorKind::Execution,
            "query cancelled by the backend",
        )),
        // The backend is going away or refuses new work.
        "57P01" | "57P02" | "57P03" | "53300" | "08006" | "08001" => Interpreted::Error(
            Error::new(ErrorKind::BackendUnavailable, fields.message.clone()),
        ),
        "3D000" | "42P04" => {
            Interpreted::Error(Error::new(ErrorKind::Execution, fields.message.clone()))
        }
        "40001" | "40P01" => Interpreted::Error(
            Error::new(ErrorKind::Execution, fields.message.clone())
                .with_hint("Retry the transaction"),
        ),
        _ if state.starts_with("42") => {
            Interpreted::Error(Error::new(ErrorKind::Query, fields.message.clone()))
        }
        _ if state.starts_with("53") => Interpreted::Error(Error::new(
            ErrorKind::BackendUnavailable,
            fields.message.clone(),
        )),
        _ => Interpreted::Error(Error::new(ErrorKind::Execution, fields.message.clone())),
    }
}

/// Extra context the interpreter needs from the connection.
pub struct InterpretContext<'a> {
    pub tenant_prefix: &'a str,
}

impl Error {
    /// Backend databases are namespaced by tenant; duplicate/unknown
    /// database messages would otherwise leak the prefixed physical name.
    pub fn strip_tenant_prefix(mut self, ctx: &InterpretContext<'_>) -> Self {
        if !ctx.tenant_prefix.is_empty() {
            self.message = self
                .message
                .replace(&format!("\"{}", ctx.tenant_prefix), "\"");
        }
        self
    }
}

/// Key/value attribute map used by tests to decode emitted `E` frames.
pub type ErrorFieldMap = HashMap<u16, String>;
