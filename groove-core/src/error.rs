use std::fmt;

/// Errors surfaced by the engine/conductor layer.
///
/// Kept as a small enum rather than a string, since the control surface
/// needs to map these onto the closed [`groove_types::protocol::ErrorKind`]
/// set without string matching.
#[derive(Debug, Clone)]
pub enum GrooveError {
    Stale { expected: u64 },
    Validation(String),
    InvalidOps(String),
    PatchApply(String),
    TransportExternalOnly,
    Io(String),
    Exception(String),
}

impl fmt::Display for GrooveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrooveError::Stale { expected } => {
                write!(f, "stale document version, expected {expected}")
            }
            GrooveError::Validation(msg) => write!(f, "validation failed: {msg}"),
            GrooveError::InvalidOps(msg) => write!(f, "invalid patch ops: {msg}"),
            GrooveError::PatchApply(msg) => write!(f, "patch apply failed: {msg}"),
            GrooveError::TransportExternalOnly => {
                write!(f, "transport control rejected: device owns transport")
            }
            GrooveError::Io(msg) => write!(f, "io error: {msg}"),
            GrooveError::Exception(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for GrooveError {}

impl From<std::io::Error> for GrooveError {
    fn from(e: std::io::Error) -> Self {
        GrooveError::Io(e.to_string())
    }
}
