use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::tags::structures::{PlcName, TagValue};

/// Errors a driver can raise. A `Read` or `Connect` error marks the
/// connection broken; the poller owns the reconnect/backoff policy.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("read error: {0}")]
    Read(String),

    /// Socket/session-level failure; the connection is broken and the whole
    /// batch faults.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not connected")]
    NotConnected,

    #[error("unsupported address {0:?}")]
    BadAddress(String),

    #[error("unsupported PLC datatype 0x{0:04x}")]
    BadType(u16),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Per-address result of a batched read. A failed address does not fault
/// the connection; the whole batch failing does.
pub type ReadOutcome = HashMap<String, DriverResult<TagValue>>;

/// Capability set every PLC driver implements.
///
/// A driver instance is owned exclusively by its poller; methods take
/// `&mut self` and no cross-task sharing happens.
#[async_trait]
pub trait PlcDriver: Send + Sync {
    fn plc(&self) -> PlcName;

    /// Target endpoint, used for health/metric labels.
    fn ip(&self) -> &str;

    /// Idempotent. Blocks at most the configured socket timeout.
    async fn connect(&mut self) -> DriverResult<()>;

    /// Idempotent; always succeeds.
    async fn disconnect(&mut self);

    /// Batched read of raw values, keyed by address.
    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadOutcome>;

    async fn write(&mut self, address: &str, value: &TagValue) -> DriverResult<()>;

    fn is_connected(&self) -> bool;
}
