//! Poll-loop state machine: backoff progression while a PLC is unreachable,
//! counter reset on recovery, stale marking on read faults, and the bounded
//! write queue.

use async_trait::async_trait;
use plc_gateway::drivers::mock::{MockControl, MockDriver};
use plc_gateway::drivers::traits::{DriverError, DriverResult, PlcDriver, ReadOutcome};
use plc_gateway::error::GatewayError;
use plc_gateway::health::HealthRegistry;
use plc_gateway::poll::observer::PollObserver;
use plc_gateway::poll::poller::{
    Poller, PollerConfig, WriteRequest, WRITE_QUEUE_DEPTH,
};
use plc_gateway::tags::structures::{PlcName, Quality, TagDatatype, TagRecord, TagValue};
use plc_gateway::TagStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recording {
    backoffs: Mutex<Vec<f64>>,
    fail_counts: Mutex<Vec<u32>>,
    connects: AtomicU32,
    cycles: AtomicU32,
}

impl PollObserver for Recording {
    fn on_connected(&self, _plc: PlcName, _ip: &str) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_read_ok(&self, _plc: PlcName, _ip: &str) {}
    fn on_failure(&self, _plc: PlcName, _ip: &str, fail_count: u32, _error: &str) {
        self.fail_counts.lock().unwrap().push(fail_count);
    }
    fn on_backoff(&self, _plc: PlcName, _ip: &str, seconds: f64) {
        self.backoffs.lock().unwrap().push(seconds);
    }
    fn on_cycle(&self, _plc: PlcName, _latency: Duration) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> PollerConfig {
    PollerConfig {
        plc: PlcName::Compactlogix,
        poll_period: Duration::from_millis(100),
        reconnect_base: 1.0,
        reconnect_max: 8.0,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn backoff_progresses_one_two_four_then_saturates() {
    let store = TagStore::new();
    let control = MockControl::new(true);
    let driver = MockDriver::new(PlcName::Compactlogix, store.clone(), control);
    let recording = Arc::new(Recording::default());
    let observers: Vec<Arc<dyn PollObserver>> = vec![recording.clone() as _];

    let (poller, _handle) = Poller::new(config(), Box::new(driver), store, observers);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(|| recording.backoffs.lock().unwrap().len() >= 6).await;
    cancel.cancel();
    let _ = task.await;

    let backoffs = recording.backoffs.lock().unwrap();
    assert_eq!(&backoffs[..6], &[1.0, 2.0, 4.0, 8.0, 8.0, 8.0]);

    // fail_count is monotone non-decreasing across consecutive faulted ticks
    let fail_counts = recording.fail_counts.lock().unwrap();
    assert!(fail_counts.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(fail_counts[0], 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_resets_counters_and_bumps_reconnect_total() {
    let store = TagStore::new();
    let control = MockControl::new(true);
    let driver = MockDriver::new(PlcName::Compactlogix, store.clone(), control.clone());

    let health = Arc::new(HealthRegistry::new(None));
    health.register(PlcName::Compactlogix, "mock-compactlogix");
    let recording = Arc::new(Recording::default());
    let observers: Vec<Arc<dyn PollObserver>> =
        vec![health.clone() as _, recording.clone() as _];

    let (poller, _handle) = Poller::new(config(), Box::new(driver), store, observers);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(|| recording.backoffs.lock().unwrap().len() >= 3).await;
    let before = health.get(PlcName::Compactlogix).unwrap();
    assert!(!before.connected);
    assert!(before.fail_count >= 3);
    assert!(before.last_backoff_s > 0.0);
    assert!(before.last_error.is_some());

    // Clear the fault; within one backoff window the poller reconnects.
    control.set_fail_reconnect(false);
    wait_for(|| recording.connects.load(Ordering::SeqCst) >= 1).await;

    let after = health.get(PlcName::Compactlogix).unwrap();
    assert!(after.connected);
    assert_eq!(after.fail_count, 0);
    assert_eq!(after.last_backoff_s, 0.0);
    assert_eq!(after.reconnect_total, 1);
    assert!(after.last_error.is_none());

    cancel.cancel();
    let _ = task.await;
}

#[tokio::test(start_paused = true)]
async fn poll_updates_values_and_readiness_quality() {
    let store = TagStore::new();
    store
        .insert(TagRecord::new(
            "Count",
            PlcName::Compactlogix,
            "Main.Count",
            TagDatatype::Int,
        ))
        .unwrap();

    let driver = MockDriver::new(PlcName::Compactlogix, store.clone(), MockControl::default());
    let recording = Arc::new(Recording::default());
    let observers: Vec<Arc<dyn PollObserver>> = vec![recording.clone() as _];
    let (poller, _handle) = Poller::new(config(), Box::new(driver), store.clone(), observers);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(|| {
        store
            .get("Count")
            .map(|r| r.quality == Quality::Good)
            .unwrap_or(false)
    })
    .await;

    let record = store.get("Count").unwrap();
    assert_eq!(record.value, TagValue::Int(0));
    assert!(record.last_update_ns > 0);

    cancel.cancel();
    let _ = task.await;
}

/// A driver that connects fine but fails every batched read.
struct ReadFaultDriver {
    connected: bool,
}

#[async_trait]
impl PlcDriver for ReadFaultDriver {
    fn plc(&self) -> PlcName {
        PlcName::Compactlogix
    }
    fn ip(&self) -> &str {
        "10.0.0.99"
    }
    async fn connect(&mut self) -> DriverResult<()> {
        self.connected = true;
        Ok(())
    }
    async fn disconnect(&mut self) {
        self.connected = false;
    }
    async fn read(&mut self, _addresses: &[String]) -> DriverResult<ReadOutcome> {
        self.connected = false;
        Err(DriverError::Read("wire cut".into()))
    }
    async fn write(&mut self, _address: &str, _value: &TagValue) -> DriverResult<()> {
        Err(DriverError::NotConnected)
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[tokio::test(start_paused = true)]
async fn read_fault_marks_tags_stale_and_faults_the_link() {
    let store = TagStore::new();
    store
        .insert(TagRecord::new(
            "T",
            PlcName::Compactlogix,
            "Main.T",
            TagDatatype::Int,
        ))
        .unwrap();
    // Seed a value so staleness is observable.
    store
        .update_value(
            "T",
            &TagValue::Int(5),
            Quality::Good,
            plc_gateway::tags::structures::now_ns(),
        )
        .unwrap();

    let recording = Arc::new(Recording::default());
    let observers: Vec<Arc<dyn PollObserver>> = vec![recording.clone() as _];
    let (poller, _handle) = Poller::new(
        config(),
        Box::new(ReadFaultDriver { connected: false }),
        store.clone(),
        observers,
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(|| !recording.fail_counts.lock().unwrap().is_empty()).await;
    cancel.cancel();
    let _ = task.await;

    let record = store.get("T").unwrap();
    assert_eq!(record.quality, Quality::Stale);
    // The last value is served, not dropped.
    assert_eq!(record.value, TagValue::Int(5));
}

#[tokio::test]
async fn write_queue_overflow_is_unavailable() {
    let store = TagStore::new();
    let driver = MockDriver::new(PlcName::Compactlogix, store.clone(), MockControl::default());
    let observers: Vec<Arc<dyn PollObserver>> = vec![];
    // Poller is never spawned, so nothing drains the queue.
    let (_poller, handle) = Poller::new(config(), Box::new(driver), store, observers);

    for i in 0..WRITE_QUEUE_DEPTH {
        handle
            .submit(WriteRequest {
                id: format!("t{i}"),
                address: format!("Main.T{i}"),
                value: TagValue::Int(i as i64),
            })
            .unwrap();
    }
    let overflow = handle.submit(WriteRequest {
        id: "overflow".into(),
        address: "Main.Overflow".into(),
        value: TagValue::Int(0),
    });
    assert!(matches!(overflow, Err(GatewayError::Unavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff_sleep() {
    let store = TagStore::new();
    let control = MockControl::new(true);
    let driver = MockDriver::new(PlcName::Compactlogix, store.clone(), control);
    let recording = Arc::new(Recording::default());
    let observers: Vec<Arc<dyn PollObserver>> = vec![recording.clone() as _];

    let (poller, _handle) = Poller::new(
        PollerConfig {
            plc: PlcName::Compactlogix,
            poll_period: Duration::from_millis(100),
            reconnect_base: 1.0,
            // A cancel mid-backoff must not wait this out.
            reconnect_max: 3600.0,
        },
        Box::new(driver),
        store,
        observers,
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(poller.run(cancel.clone()));

    wait_for(|| recording.backoffs.lock().unwrap().len() >= 12).await;
    cancel.cancel();
    // With virtual time this only completes if the sleep observes the token.
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("poller did not stop on cancellation")
        .unwrap();

    assert!(recording.backoffs.lock().unwrap().len() >= 12);
}
