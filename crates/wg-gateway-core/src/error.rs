//! Error types for the gateway core
//!
//! Every variant here describes rejected input. Callers treat them per
//! field: a bad value is dropped and the previous good value kept.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway core error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Public or private key that is not 32 bytes of standard base64
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),

    /// Malformed CIDR prefix
    #[error("invalid prefix {value:?}: {reason}")]
    InvalidPrefix { value: String, reason: String },

    /// Endpoint that is not host:port
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    /// Tunnel address that is not a usable IPv6 address
    #[error("invalid tunnel address {0:?}")]
    InvalidTunnelAddress(String),

    /// Empty or unprintable peer identifier
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),

    /// Inconsistent local policy
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}
