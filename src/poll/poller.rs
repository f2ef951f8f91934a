//! Per-PLC poll loop.
//!
//! Each poller exclusively owns one driver and the set of tags whose `plc`
//! matches it. The loop is a three-state machine:
//!
//! ```text
//!   Disconnected ──connect ok──▶ Connected ──read ok──▶ Connected
//!        ▲                           │
//!        │                           ├─read fail──▶ Faulted
//!        └──────────backoff──── Faulted ──connect fail─▶ Faulted
//!                                       ──connect ok───▶ Connected
//! ```
//!
//! Reconnect attempts back off exponentially; every sleep is cancellable by
//! the shutdown token.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drivers::traits::{DriverError, PlcDriver};
use crate::error::{GatewayError, Result};
use crate::poll::observer::PollObserver;
use crate::tags::store::TagStore;
use crate::tags::structures::{now_ns, PlcName, Quality, TagValue};

/// Writes queued for a faulted PLC beyond this depth fail `Unavailable`.
pub const WRITE_QUEUE_DEPTH: usize = 32;

/// Exponential reconnect delay: `min(max, base * 2^(fail_count-1))`,
/// zero while nothing has failed.
pub fn compute_backoff(base: f64, max: f64, fail_count: u32) -> f64 {
    if fail_count == 0 {
        return 0.0;
    }
    let factor = 2f64.powi(fail_count.saturating_sub(1).min(1024) as i32);
    (base * factor).min(max)
}

/// A pending write-through to the PLC.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: String,
    pub address: String,
    pub value: TagValue,
}

/// Cheap clonable handle the REST/OPC UA adapters use to enqueue
/// write-throughs for one poller.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteHandle {
    /// Non-blocking enqueue; a full queue (PLC faulted for too long) or a
    /// stopped poller reports `Unavailable`.
    pub fn submit(&self, request: WriteRequest) -> Result<()> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) => {
                GatewayError::Unavailable(format!("write queue full for tag {}", r.id))
            }
            mpsc::error::TrySendError::Closed(r) => {
                GatewayError::Unavailable(format!("poller stopped, write to {} dropped", r.id))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connected,
    Faulted,
}

pub struct PollerConfig {
    pub plc: PlcName,
    pub poll_period: Duration,
    pub reconnect_base: f64,
    pub reconnect_max: f64,
}

pub struct Poller {
    config: PollerConfig,
    driver: Box<dyn PlcDriver>,
    store: TagStore,
    observers: Vec<Arc<dyn PollObserver>>,
    write_rx: mpsc::Receiver<WriteRequest>,
    state: LinkState,
    fail_count: u32,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        driver: Box<dyn PlcDriver>,
        store: TagStore,
        observers: Vec<Arc<dyn PollObserver>>,
    ) -> (Self, WriteHandle) {
        let (tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        (
            Poller {
                config,
                driver,
                store,
                observers,
                write_rx,
                state: LinkState::Disconnected,
                fail_count: 0,
            },
            WriteHandle { tx },
        )
    }

    /// Run until the token is cancelled, then disconnect the driver.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(plc = %self.config.plc, "poller started");
        while !cancel.is_cancelled() {
            match self.state {
                LinkState::Disconnected | LinkState::Faulted => {
                    self.try_connect(&cancel).await;
                }
                LinkState::Connected => {
                    self.poll_cycle(&cancel).await;
                }
            }
        }
        self.driver.disconnect().await;
        info!(plc = %self.config.plc, "poller stopped");
    }

    async fn try_connect(&mut self, cancel: &CancellationToken) {
        let started = Instant::now();
        let attempt = self.driver.connect().await;
        let plc = self.config.plc;
        match attempt {
            Ok(()) => {
                self.state = LinkState::Connected;
                self.fail_count = 0;
                for obs in &self.observers {
                    obs.on_connected(plc, self.driver.ip());
                }
                self.notify_cycle(started.elapsed());
            }
            Err(e) => {
                self.state = LinkState::Faulted;
                self.fail_count = self.fail_count.saturating_add(1);
                let backoff = compute_backoff(
                    self.config.reconnect_base,
                    self.config.reconnect_max,
                    self.fail_count,
                );
                warn!(
                    %plc,
                    fail_count = self.fail_count,
                    backoff_s = backoff,
                    "connect failed: {e}"
                );
                for obs in &self.observers {
                    obs.on_failure(plc, self.driver.ip(), self.fail_count, &e.to_string());
                    obs.on_backoff(plc, self.driver.ip(), backoff);
                }
                self.notify_cycle(started.elapsed());
                self.sleep(Duration::from_secs_f64(backoff), cancel).await;
            }
        }
    }

    async fn poll_cycle(&mut self, cancel: &CancellationToken) {
        let started = Instant::now();
        let plc = self.config.plc;

        self.drain_writes().await;
        if self.state != LinkState::Connected {
            return;
        }

        let subscribed = self.store.subscribed(plc);
        if subscribed.is_empty() {
            // Nothing to read; an idle cycle still counts for readiness.
            self.notify_cycle(started.elapsed());
            self.sleep(self.config.poll_period, cancel).await;
            return;
        }

        let addresses: Vec<String> = subscribed.iter().map(|(_, a)| a.clone()).collect();
        match self.driver.read(&addresses).await {
            Ok(results) => {
                let ts = now_ns();
                for (id, address) in &subscribed {
                    match results.get(address) {
                        Some(Ok(raw)) => {
                            match self.store.update_value(id, raw, Quality::Good, ts) {
                                Ok(()) => {}
                                Err(GatewayError::NotFound(_)) => {} // deleted mid-cycle
                                Err(e) => {
                                    warn!(%plc, %id, "driver value rejected: {e}");
                                    let _ = self.store.mark_quality(id, Quality::Bad);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%plc, %id, %address, "per-tag read failed: {e}");
                            let _ = self.store.mark_quality(id, Quality::Bad);
                        }
                        None => {
                            let _ = self.store.mark_quality(id, Quality::Bad);
                        }
                    }
                }
                for obs in &self.observers {
                    obs.on_read_ok(plc, self.driver.ip());
                }
            }
            Err(e) => {
                self.fault(&e);
                self.notify_cycle(started.elapsed());
                return;
            }
        }

        let latency = started.elapsed();
        self.notify_cycle(latency);
        let remaining = self.config.poll_period.saturating_sub(latency);
        self.sleep(remaining, cancel).await;
    }

    /// Connected -> Faulted on a batch read failure: every tag of this PLC
    /// keeps its value but degrades to `Stale`.
    fn fault(&mut self, error: &DriverError) {
        let plc = self.config.plc;
        self.state = LinkState::Faulted;
        self.fail_count = self.fail_count.saturating_add(1);
        warn!(%plc, fail_count = self.fail_count, "read failed, link faulted: {error}");
        for record in self.store.snapshot_by_plc(plc) {
            let _ = self.store.mark_quality(&record.id, Quality::Stale);
        }
        for obs in &self.observers {
            obs.on_failure(plc, self.driver.ip(), self.fail_count, &error.to_string());
        }
    }

    async fn drain_writes(&mut self) {
        while let Ok(request) = self.write_rx.try_recv() {
            match self.driver.write(&request.address, &request.value).await {
                Ok(()) => {
                    debug!(plc = %self.config.plc, id = %request.id, "write-through ok");
                }
                Err(
                    e @ (DriverError::Transport(_)
                    | DriverError::Timeout(_)
                    | DriverError::NotConnected),
                ) => {
                    warn!(plc = %self.config.plc, id = %request.id, "write-through failed: {e}");
                    self.fault(&e);
                    return;
                }
                Err(e) => {
                    warn!(plc = %self.config.plc, id = %request.id, "write rejected: {e}");
                }
            }
        }
    }

    fn notify_cycle(&self, latency: Duration) {
        for obs in &self.observers {
            obs.on_cycle(self.config.plc, latency);
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
