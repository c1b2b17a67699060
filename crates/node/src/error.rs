use powchain_chain::ChainError;
use powchain_network::NetworkError;
use powchain_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bootstrap failed, a regular node cannot start without its bootstrap peer: {0}")]
    BootstrapFailed(#[source] NetworkError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Network(NetworkError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NetworkError> for NodeError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Chain(chain) => NodeError::Chain(chain),
            bootstrap @ NetworkError::BootstrapFailed { .. } => NodeError::BootstrapFailed(bootstrap),
            other => NodeError::Network(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
