use crate::model::RecordId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Structurally invalid request; nothing was persisted.
    #[error("invalid appointment: {0}")]
    Invalid(&'static str),
    #[error("appointment overlaps existing appointment {0}")]
    Conflict(RecordId),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("room already exists: {0}")]
    AlreadyExists(String),
    #[error("still referenced by an appointment: {0}")]
    Referenced(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn doctor_not_found(id: RecordId) -> Self {
        EngineError::NotFound(format!("doctor {id}"))
    }

    pub(crate) fn patient_not_found(id: RecordId) -> Self {
        EngineError::NotFound(format!("patient {id}"))
    }

    pub(crate) fn room_not_found(name: &str) -> Self {
        EngineError::NotFound(format!("room {name}"))
    }

    pub(crate) fn appointment_not_found(id: RecordId) -> Self {
        EngineError::NotFound(format!("appointment {id}"))
    }

    /// Short label for logs and the rejection counter.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Invalid(_) => "invalid",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Referenced(_) => "referenced",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
