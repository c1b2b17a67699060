use powchain_chain::ChainError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("{operation} with {addr} timed out")]
    Timeout { operation: &'static str, addr: String },

    #[error("unexpected HTTP status {status} from {addr}: {body}")]
    UnexpectedStatus { addr: String, status: u16, body: String },

    #[error("incompatible peer: {0}")]
    Incompatible(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bootstrap with {addr} failed: {source}")]
    BootstrapFailed {
        addr: String,
        #[source]
        source: Box<NetworkError>,
    },

    #[error("peer {0} is blacklisted")]
    Blacklisted(String),

    #[error("HTTP client setup failed: {0}")]
    ClientSetup(#[source] reqwest::Error),

    #[error("chain rejected data: {0}")]
    Chain(#[from] ChainError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
