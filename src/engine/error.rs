use ulid::Ulid;

/// Every failure the booking core reports. All are recoverable by the caller;
/// `WalError` is the storage-level failure a caller may retry from scratch.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("slot unavailable: overlaps booking {0}")]
    SlotUnavailable(Ulid),
    #[error("booking {0} can no longer be cancelled or rescheduled")]
    NotCancellable(Ulid),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Short machine-readable label, used for metrics and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::NotCancellable(_) => "not_cancellable",
            EngineError::Validation(_) => "validation_error",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }
}
