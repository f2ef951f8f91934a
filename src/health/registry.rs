use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

use crate::poll::observer::PollObserver;
use crate::tags::structures::PlcName;

const RECENT_ERRORS_CAP: usize = 10;
const LAST_ERROR_MAX_LEN: usize = 240;

/// Process-global readiness. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Initializing,
    Ready,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub ts: f64,
    pub error: String,
}

/// Per-PLC connection health as reported by `GET /hmi/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ip: String,
    pub connected: bool,
    pub fail_count: u32,
    pub last_backoff_s: f64,
    pub reconnect_total: u64,
    pub last_success: f64,
    pub last_error: Option<String>,
    pub recent_errors: Vec<RecentError>,
}

#[derive(Debug)]
struct HealthEntry {
    ip: String,
    connected: bool,
    fail_count: u32,
    last_backoff_s: f64,
    reconnect_total: u64,
    last_success: f64,
    last_error: Option<String>,
    recent_errors: VecDeque<RecentError>,
    cycles: u64,
}

impl HealthEntry {
    fn new(ip: String) -> Self {
        HealthEntry {
            ip,
            connected: false,
            fail_count: 0,
            last_backoff_s: 0.0,
            reconnect_total: 0,
            last_success: 0.0,
            last_error: None,
            recent_errors: VecDeque::with_capacity(RECENT_ERRORS_CAP),
            cycles: 0,
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ip: self.ip.clone(),
            connected: self.connected,
            fail_count: self.fail_count,
            last_backoff_s: self.last_backoff_s,
            reconnect_total: self.reconnect_total,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn truncate(msg: &str) -> String {
    if msg.len() <= LAST_ERROR_MAX_LEN {
        msg.to_string()
    } else {
        let mut cut = LAST_ERROR_MAX_LEN;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg[..cut].to_string()
    }
}

/// Thread-safe per-PLC health map plus the process-wide readiness state.
///
/// Readiness is reached once every registered poller has completed at least
/// one poll cycle; at that moment the ready file (if configured) is written
/// atomically. Once ready, the registry only ever moves to `Stopping`.
#[derive(Debug)]
pub struct HealthRegistry {
    entries: RwLock<HashMap<PlcName, HealthEntry>>,
    readiness: AtomicU8,
    ready_file: Option<PathBuf>,
    last_poll_update: RwLock<f64>,
}

impl HealthRegistry {
    pub fn new(ready_file: Option<PathBuf>) -> Self {
        HealthRegistry {
            entries: RwLock::new(HashMap::new()),
            readiness: AtomicU8::new(0),
            ready_file,
            last_poll_update: RwLock::new(0.0),
        }
    }

    /// Register a PLC before its poller starts. Readiness waits for every
    /// registered PLC.
    pub fn register(&self, plc: PlcName, ip: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.entry(plc).or_insert_with(|| HealthEntry::new(ip.to_string()));
    }

    pub fn mark_connected(&self, plc: PlcName) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(&plc) {
            e.connected = true;
            e.fail_count = 0;
            e.last_backoff_s = 0.0;
            e.reconnect_total += 1;
            e.last_success = unix_now();
            e.last_error = None;
        }
    }

    pub fn mark_read_ok(&self, plc: PlcName) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(&plc) {
            e.connected = true;
            e.fail_count = 0;
            e.last_backoff_s = 0.0;
            e.last_success = unix_now();
            e.last_error = None;
        }
    }

    pub fn mark_failed(&self, plc: PlcName, fail_count: u32, error: &str) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(&plc) {
            e.connected = false;
            e.fail_count = fail_count;
            e.last_error = Some(truncate(error));
            if e.recent_errors.len() == RECENT_ERRORS_CAP {
                e.recent_errors.pop_front();
            }
            e.recent_errors.push_back(RecentError {
                ts: unix_now(),
                error: truncate(error),
            });
        }
    }

    pub fn record_backoff(&self, plc: PlcName, seconds: f64) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(&plc) {
            e.last_backoff_s = seconds;
        }
    }

    pub fn get(&self, plc: PlcName) -> Option<HealthSnapshot> {
        self.entries.read().unwrap().get(&plc).map(|e| e.snapshot())
    }

    pub fn snapshot_all(&self) -> HashMap<String, HealthSnapshot> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(plc, e)| (plc.to_string(), e.snapshot()))
            .collect()
    }

    /// Seconds since any poller last finished a cycle, or `None` before the
    /// first cycle.
    pub fn last_poll_age(&self) -> Option<f64> {
        let last = *self.last_poll_update.read().unwrap();
        if last == 0.0 {
            None
        } else {
            Some(unix_now() - last)
        }
    }

    pub fn readiness(&self) -> ReadinessState {
        match self.readiness.load(Ordering::SeqCst) {
            0 => ReadinessState::Initializing,
            1 => ReadinessState::Ready,
            _ => ReadinessState::Stopping,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == ReadinessState::Ready
    }

    /// Force readiness (used when no pollers are configured).
    pub fn set_ready(&self) {
        if self
            .readiness
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("gateway ready");
            if let Some(path) = &self.ready_file {
                if let Err(e) = write_ready_file(path) {
                    error!("failed to write ready file {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Forward transition to `stopping`; readiness never comes back.
    pub fn set_stopping(&self) {
        self.readiness.store(2, Ordering::SeqCst);
        info!("gateway stopping");
    }

    fn note_cycle(&self, plc: PlcName) {
        {
            let mut last = self.last_poll_update.write().unwrap();
            *last = unix_now();
        }
        let all_polled = {
            let mut entries = self.entries.write().unwrap();
            if let Some(e) = entries.get_mut(&plc) {
                e.cycles += 1;
            }
            !entries.is_empty() && entries.values().all(|e| e.cycles > 0)
        };
        if all_polled {
            self.set_ready();
        }
    }
}

impl PollObserver for HealthRegistry {
    fn on_connected(&self, plc: PlcName, _ip: &str) {
        self.mark_connected(plc);
    }

    fn on_read_ok(&self, plc: PlcName, _ip: &str) {
        self.mark_read_ok(plc);
    }

    fn on_failure(&self, plc: PlcName, _ip: &str, fail_count: u32, error: &str) {
        self.mark_failed(plc, fail_count, error);
    }

    fn on_backoff(&self, plc: PlcName, _ip: &str, seconds: f64) {
        self.record_backoff(plc, seconds);
    }

    fn on_cycle(&self, plc: PlcName, _latency: Duration) {
        self.note_cycle(plc);
    }
}

/// Write-to-temp then rename, so a crash mid-write never leaves a partial
/// ready file for an orchestrator to trip over.
fn write_ready_file(path: &Path) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("gateway.ready")
    ));
    {
        let mut f = std::fs::File::create(&tmp)?;
        writeln!(f, "{}", Utc::now().to_rfc3339())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_waits_for_every_registered_plc() {
        let reg = HealthRegistry::new(None);
        reg.register(PlcName::Compactlogix, "10.0.0.1");
        reg.register(PlcName::Slc500, "10.0.0.2");
        assert!(!reg.is_ready());

        reg.note_cycle(PlcName::Compactlogix);
        assert!(!reg.is_ready());
        reg.note_cycle(PlcName::Slc500);
        assert!(reg.is_ready());

        // Monotone until stopping.
        reg.note_cycle(PlcName::Compactlogix);
        assert!(reg.is_ready());
        reg.set_stopping();
        assert!(!reg.is_ready());
        assert_eq!(reg.readiness(), ReadinessState::Stopping);
    }

    #[test]
    fn connected_resets_fail_state() {
        let reg = HealthRegistry::new(None);
        reg.register(PlcName::Compactlogix, "10.0.0.1");
        reg.mark_failed(PlcName::Compactlogix, 3, "connect refused");
        reg.record_backoff(PlcName::Compactlogix, 4.0);

        let before = reg.get(PlcName::Compactlogix).unwrap();
        assert!(!before.connected);
        assert_eq!(before.fail_count, 3);
        assert_eq!(before.last_backoff_s, 4.0);

        reg.mark_connected(PlcName::Compactlogix);
        let after = reg.get(PlcName::Compactlogix).unwrap();
        assert!(after.connected);
        assert_eq!(after.fail_count, 0);
        assert_eq!(after.last_backoff_s, 0.0);
        assert_eq!(after.reconnect_total, 1);
    }

    #[test]
    fn recent_errors_ring_is_bounded() {
        let reg = HealthRegistry::new(None);
        reg.register(PlcName::Slc500, "10.0.0.2");
        for i in 0..25 {
            reg.mark_failed(PlcName::Slc500, i + 1, &format!("err {i}"));
        }
        let snap = reg.get(PlcName::Slc500).unwrap();
        assert_eq!(snap.recent_errors.len(), RECENT_ERRORS_CAP);
        assert_eq!(snap.recent_errors.last().unwrap().error, "err 24");
    }

    #[test]
    fn ready_file_is_written_once_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.ready");
        let reg = HealthRegistry::new(Some(path.clone()));
        reg.register(PlcName::Compactlogix, "10.0.0.1");
        reg.note_cycle(PlcName::Compactlogix);

        let body = std::fs::read_to_string(&path).unwrap();
        let line = body.trim();
        assert!(chrono::DateTime::parse_from_rfc3339(line).is_ok(), "bad timestamp: {line}");
    }
}
