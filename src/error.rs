use mediafetch_core::models::record::DownloadStatus;

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("post-processing failed: {0}")]
    PostProcess(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("download {0} was cancelled by the user")]
    CancelledByUser(String),

    #[error("download {0} not found")]
    NotFound(String),

    #[error("cannot {action} download {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: DownloadStatus,
        action: &'static str,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        QueueError::InvalidInput(msg.into())
    }

    pub fn store(op: &str, err: impl std::fmt::Display) -> Self {
        QueueError::Store(format!("{}: {}", op, err))
    }

    pub fn invalid_transition(id: &str, from: DownloadStatus, action: &'static str) -> Self {
        QueueError::InvalidTransition {
            id: id.to_string(),
            from,
            action,
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Store(err.to_string())
    }
}
