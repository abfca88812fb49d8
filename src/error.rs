use std::io;

use crate::config::ParseError;
use crate::registry::StoreError;

/// Reasons a DHCPREQUEST is answered with a DHCPNAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("server identifier does not match this server")]
    WrongServerId,
    #[error("no requested address in message")]
    NoRequestedAddress,
    #[error("requested address has no lease in this network")]
    UnknownAddress,
    #[error("lease is bound to a different hardware address")]
    HardwareMismatch,
    #[error("address belongs to a pool of the other registration class")]
    ClassificationChanged,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::WrongServerId => "WrongServerId",
            Rejection::NoRequestedAddress => "NoRequestedAddress",
            Rejection::UnknownAddress => "UnknownAddress",
            Rejection::HardwareMismatch => "HardwareMismatch",
            Rejection::ClassificationChanged => "ClassificationChanged",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed configuration. Fatal at startup, a reload keeps the previous tree.
    #[error("invalid configuration: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid device list: {0}")]
    Devices(#[from] serde_json::Error),

    /// Every address of every candidate pool is currently bound or held.
    #[error("no available IP addresses in pool")]
    PoolExhausted,

    /// The registry could not be queried. Callers fall back to unregistered.
    #[error("classification lookup failed: {0}")]
    ClassificationLookupFailed(StoreError),

    #[error("request validation failed: {0}")]
    RequestValidationFailed(#[from] Rejection),

    /// The store write failed after the in-memory lease was bound.
    #[error("failed to persist lease: {0}")]
    PersistenceFailed(StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
