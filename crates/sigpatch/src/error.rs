use std::fmt;

use thiserror::Error;

/// A symbol that could not be finalized during resolution: a reference from
/// `owner` to `target`, or `owner` itself when it has no address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub owner: String,
    pub target: String,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner == self.target {
            write!(f, "'{}' (no address)", self.owner)
        } else {
            write!(f, "'{}' -> '{}'", self.owner, self.target)
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid signature token '{token}' at position {position}")]
    InvalidSignature { token: String, position: usize },

    #[error("Signature pattern is empty")]
    EmptySignature,

    #[error("Invalid hex literal '{literal}': {message}")]
    InvalidHexLiteral { literal: String, message: String },

    #[error("Failed to read process memory at address {address:#x} ({len} bytes)")]
    MemoryReadFailed { address: u64, len: usize },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: u64, message: String },

    #[error("Failed to change protection at address {address:#x}: {message}")]
    ProtectionFailed { address: u64, message: String },

    #[error("Failed to allocate {size} bytes near {preferred:#x}: {message}")]
    AllocationFailed {
        size: usize,
        preferred: u64,
        message: String,
    },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid module image at {base:#x}: {message}")]
    InvalidImage { base: u64, message: String },

    #[error("Symbol '{owner}' references unresolved symbol '{target}'")]
    UnresolvedReference { owner: String, target: String },

    #[error("{} unresolved reference(s): {}", .0.len(), format_unresolved(.0))]
    UnresolvedReferences(Vec<Unresolved>),

    #[error("Relative reference from '{owner}' to '{target}' is out of range ({value:#x})")]
    DisplacementOutOfRange {
        owner: String,
        target: String,
        value: i64,
    },

    #[error("Absolute reference to '{target}' ({value:#x}) does not fit in {width} bytes")]
    AbsoluteOutOfRange {
        target: String,
        value: u64,
        width: usize,
    },

    #[error("Invalid absolute reference width: {0}")]
    InvalidWidth(usize),

    #[error("Symbol '{0}' is not a label")]
    NotALabel(String),

    #[error("Symbol '{0}' cannot hold code")]
    NotWritable(String),

    #[error("An injected jump needs at least 5 stolen bytes, got {0}")]
    StolenBytesTooShort(usize),

    #[error("Unknown symbol id: {0}")]
    UnknownSymbol(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_unresolved(list: &[Unresolved]) -> String {
    list.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Check if this error stems from a reference that could not be resolved
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Error::UnresolvedReference { .. } | Error::UnresolvedReferences(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::Io(io_err);
        assert!(err.is_not_found());

        let other_io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err2 = Error::Io(other_io_err);
        assert!(!err2.is_not_found());
    }

    #[test]
    fn test_unresolved_references_message() {
        let err = Error::UnresolvedReferences(vec![
            Unresolved {
                owner: "jmp".to_string(),
                target: "cave".to_string(),
            },
            Unresolved {
                owner: "cave".to_string(),
                target: "flag".to_string(),
            },
        ]);
        assert!(err.is_unresolved());
        assert_eq!(
            err.to_string(),
            "2 unresolved reference(s): 'jmp' -> 'cave', 'cave' -> 'flag'"
        );

        let missing = Unresolved {
            owner: "cave".to_string(),
            target: "cave".to_string(),
        };
        assert_eq!(missing.to_string(), "'cave' (no address)");
    }
}
