use serde::{Deserialize, Serialize};

pub mod bus;
pub mod crypto;
pub mod message;
pub mod proposal;
pub mod sa;
pub mod session;
pub mod tasks;

/// Nonce length used for IKE_SA_INIT exchanges (IKEv2 allows 16-256 octets).
pub const NONCE_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IKEState {
    Created,
    Connecting,
    Established,
    Rekeying,
    Deleted,
}

/// Peer-announced protocol extensions tracked on an IKE_SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extension {
    /// IKE fragmentation (RFC 7383)
    Fragmentation,
    /// Signature authentication with hash negotiation (RFC 7427)
    SignatureAuth,
    /// Post-quantum pre-shared keys (RFC 8784)
    Ppk,
    /// Client redirection (RFC 5685)
    Redirection,
    /// Childless IKE_SA (RFC 6023)
    Childless,
    /// Peer runs our own implementation and accepts private-use algorithms
    Vendor,
}

#[derive(Debug, thiserror::Error)]
pub enum IKEError {
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Key exchange method {0} not supported")]
    UnsupportedKeyExchange(u16),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}
