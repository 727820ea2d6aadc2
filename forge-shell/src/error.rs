use forge_collab::{DocumentError, RelayError};
use forge_core::PersistenceError;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
