//! DHCPv4 server for network access control.
//!
//! Clients are classified as registered or unregistered through an external
//! device registry and served from the pools of their class. Configuration
//! is a Global -> Network -> class -> Subnet -> Pool tree resolved most
//! specific first.

pub mod config;
pub mod error;
pub mod logging;
pub mod mgmt;
pub mod pool;
pub mod registry;
#[cfg(unix)]
pub mod signal;
pub mod v4;

pub use config::{Classification, Config};
pub use error::{Error, Rejection, Result};
pub use pool::{Lease, Pool};
pub use registry::{Device, DeviceStore, LeaseRecord, MemoryRegistry, StoreError};
