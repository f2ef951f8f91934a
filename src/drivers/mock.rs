//! Deterministic in-process driver used when `GATEWAY_MOCK_PLC=1`.
//!
//! Reads echo the value currently held by the tag store for the requested
//! address, so end-to-end flows (REST create -> poll -> REST read) behave
//! exactly as with a real controller that returns what was last written.
//! The shared [`MockControl`] lets tests force reconnect failures and clear
//! them again to drive the backoff and recovery paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::drivers::traits::{DriverError, DriverResult, PlcDriver, ReadOutcome};
use crate::tags::structures::{PlcName, TagValue};
use crate::tags::store::TagStore;

/// Shared switchboard for mock behavior. Cloning shares state.
#[derive(Debug, Default, Clone)]
pub struct MockControl {
    inner: Arc<MockControlState>,
}

#[derive(Debug, Default)]
struct MockControlState {
    fail_reconnect: AtomicBool,
    connect_attempts: AtomicU32,
}

impl MockControl {
    pub fn new(fail_reconnect: bool) -> Self {
        let control = MockControl::default();
        control
            .inner
            .fail_reconnect
            .store(fail_reconnect, Ordering::SeqCst);
        control
    }

    /// While set, every connect attempt fails; clearing it lets the next
    /// attempt succeed (recovery scenario).
    pub fn set_fail_reconnect(&self, fail: bool) {
        self.inner.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reconnect(&self) -> bool {
        self.inner.fail_reconnect.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }
}

pub struct MockDriver {
    plc: PlcName,
    ip: String,
    store: TagStore,
    control: MockControl,
    connected: bool,
}

impl MockDriver {
    pub fn new(plc: PlcName, store: TagStore, control: MockControl) -> Self {
        MockDriver {
            plc,
            ip: format!("mock-{plc}"),
            store,
            control,
            connected: false,
        }
    }
}

#[async_trait]
impl PlcDriver for MockDriver {
    fn plc(&self) -> PlcName {
        self.plc
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    async fn connect(&mut self) -> DriverResult<()> {
        self.control
            .inner
            .connect_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.control.fail_reconnect() {
            self.connected = false;
            return Err(DriverError::Connect("forced reconnect failure".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        debug!(plc = %self.plc, "mock driver disconnected");
    }

    async fn read(&mut self, addresses: &[String]) -> DriverResult<ReadOutcome> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        let mut out: ReadOutcome = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let value = self
                .store
                .find_by_address(self.plc, address)
                .and_then(|id| self.store.get(&id).ok())
                .map(|record| record.value)
                // Unconfigured addresses read as zero, like a fresh register.
                .unwrap_or(TagValue::Real(0.0));
            out.insert(address.clone(), Ok(value));
        }
        Ok(out)
    }

    async fn write(&mut self, address: &str, _value: &TagValue) -> DriverResult<()> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        debug!(plc = %self.plc, address, "mock driver write accepted");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
