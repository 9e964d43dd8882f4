use thiserror::Error;

/// Client-side error taxonomy. One value at a time occupies the session's
/// latest-error slot; a newer error of any kind overwrites it and the next
/// successful operation of the same kind clears it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("identity storage unavailable: {0}")]
    IdentityUnavailable(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("send rejected: {0}")]
    SendRejected(String),
    #[error("history fetch failed: {0}")]
    HistoryFetchFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Identity,
    Connection,
    Send,
    History,
    Upload,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::IdentityUnavailable(_) => ErrorKind::Identity,
            ChatError::Connection(_) => ErrorKind::Connection,
            ChatError::SendRejected(_) => ErrorKind::Send,
            ChatError::HistoryFetchFailed(_) => ErrorKind::History,
            ChatError::UploadFailed(_) => ErrorKind::Upload,
        }
    }
}
