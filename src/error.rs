use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("parser: {0}")]
    ParserError(String),
    #[error("tracker: {0}")]
    TrackerError(String),
    #[error("protocol: {0}")]
    ProtocolError(String),
    #[error("peer: {0}")]
    PeerError(String),
    #[error("storage: {0}")]
    StorageError(String),
    #[error("config: {0}")]
    ConfigError(String),
    #[error("session: {0}")]
    SessionError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
