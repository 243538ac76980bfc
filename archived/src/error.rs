use thiserror::Error;

/// Error types for archive transfers and the dispatcher.
#[derive(Error, Debug)]
pub enum ArchiveError {
    // Manifest errors
    #[error("Malformed manifest at line {line}: {reason}")]
    Format { line: usize, reason: String },

    #[error("Manifest has no {kind} section")]
    MissingSection { kind: &'static str },

    // Remote storage errors
    #[error("Backend {op} failed for {path}: {message}")]
    Backend {
        op: &'static str,
        path: String,
        message: String,
    },

    // Transfer-level errors
    #[error("Root directory precondition failed: {reason}")]
    RootPrecondition { reason: String },

    #[error("Stage-in request failed: {reason}")]
    StageIn { reason: String },

    #[error("Copy flush failed after retries")]
    CopyFlush,

    #[error("Verification failed for entry: {path}")]
    VerificationFailed { path: String },

    #[error("Failed updating file access metadata: {reason}")]
    FileAccess { reason: String },

    /// A retry was requested but verification found nothing wrong. Not a
    /// failure: the worker finalizes as success and exits clean.
    #[error("Retry requested but no outstanding error condition found")]
    NothingToDo,

    // Dispatcher errors
    #[error("Transfer with the same signature already exists: {uuid}")]
    Duplicate { uuid: String },

    #[error("Too many concurrent or pending transfers: limit {max} reached")]
    Capacity { max: usize },

    #[error("Permission denied: not the owner of transfer {uuid}")]
    PermissionDenied { uuid: String },

    #[error("Transfer not found: {uuid}")]
    NotFound { uuid: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // Local plumbing
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker process exit codes, so supervising automation can branch on
/// outcome without parsing logs.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL_IO: i32 = 2;
pub const EXIT_UNEXPECTED: i32 = 3;

impl ArchiveError {
    /// Whether the failure left the destination tree unverifiable, i.e. the
    /// kind of error the checkpoint/retry protocol exists for.
    pub fn is_fatal_io(&self) -> bool {
        matches!(
            self,
            ArchiveError::Backend { .. }
                | ArchiveError::RootPrecondition { .. }
                | ArchiveError::StageIn { .. }
                | ArchiveError::CopyFlush
                | ArchiveError::VerificationFailed { .. }
                | ArchiveError::FileAccess { .. }
                | ArchiveError::Io(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ArchiveError::NothingToDo => EXIT_OK,
            e if e.is_fatal_io() => EXIT_FATAL_IO,
            _ => EXIT_UNEXPECTED,
        }
    }
}

/// Result type alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let fatal = ArchiveError::Backend {
            op: "stat",
            path: "/data/x".to_string(),
            message: "no such file".to_string(),
        };
        assert!(fatal.is_fatal_io());
        assert_eq!(fatal.exit_code(), EXIT_FATAL_IO);

        let format = ArchiveError::Format {
            line: 3,
            reason: "not a JSON array".to_string(),
        };
        assert!(!format.is_fatal_io());
        assert_eq!(format.exit_code(), EXIT_UNEXPECTED);

        assert_eq!(ArchiveError::NothingToDo.exit_code(), EXIT_OK);
    }
}
