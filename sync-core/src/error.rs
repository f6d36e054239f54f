use thiserror::Error;

/// Failure reported by a remote store adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Failure of a push-channel subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("channel dropped: {0}")]
    Dropped(String),

    #[error("channel closed")]
    Closed,
}

/// Errors surfaced to callers of the sync services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No identity is bound; the caller should send the user to sign-in.
    #[error("no identity is bound to the session")]
    Auth,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("fetch failed: {0}")]
    Fetch(RemoteError),

    #[error("remote write failed: {0}")]
    Remote(RemoteError),

    #[error("realtime channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Validation(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SyncError::Remote(_) | SyncError::Fetch(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<diesel::result::Error> for RemoteError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => RemoteError::NotFound("row not found".to_string()),
            diesel::result::Error::DeserializationError(inner) => {
                RemoteError::Decode(inner.to_string())
            }
            other => RemoteError::Server(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for ChannelError {
    fn from(e: redis::RedisError) -> Self {
        ChannelError::Dropped(e.to_string())
    }
}
