use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration, sourced from the environment only. Tag metadata
/// never comes from files; it arrives over REST (or prepopulation in tests).
///
/// Flags follow the `"1"` / `"true"` convention, so they are kept as raw
/// strings here and interpreted by the accessors.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub gateway_mock_plc: Option<String>,
    #[serde(default)]
    pub gateway_mock_fail_reconnect: Option<String>,

    #[serde(default)]
    pub compactlogix_ip: Option<String>,
    #[serde(default)]
    pub slc500_ip: Option<String>,

    #[serde(default = "default_poll_period")]
    pub poll_period: f64,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base: f64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: f64,
    #[serde(default = "default_socket_timeout")]
    pub plc_socket_timeout: f64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,

    #[serde(default)]
    pub ready_file: Option<String>,

    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub prometheus_port: Option<u16>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_opcua_port")]
    pub opcua_port: u16,
}

fn default_poll_period() -> f64 {
    1.0
}
fn default_reconnect_base() -> f64 {
    1.0
}
fn default_reconnect_max() -> f64 {
    60.0
}
fn default_socket_timeout() -> f64 {
    2.0
}
fn default_shutdown_timeout() -> f64 {
    5.0
}
fn default_http_port() -> u16 {
    5000
}
fn default_opcua_port() -> u16 {
    4840
}

fn flag(raw: &Option<String>) -> bool {
    matches!(raw.as_deref(), Some("1") | Some("true") | Some("True"))
}

impl Settings {
    /// Load from the process environment. Unknown variables are ignored;
    /// known ones are matched case-insensitively.
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(Environment::default())
            .build()?;
        cfg.try_deserialize()
    }

    pub fn mock_plc(&self) -> bool {
        flag(&self.gateway_mock_plc)
    }

    pub fn mock_fail_reconnect(&self) -> bool {
        flag(&self.gateway_mock_fail_reconnect)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs_f64(self.poll_period.max(0.01))
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.plc_socket_timeout.max(0.05))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout.max(0.1))
    }

    /// `METRICS_PORT` wins over `PROMETHEUS_PORT`; neither means the
    /// exporter stays off.
    pub fn metrics_port(&self) -> Option<u16> {
        self.metrics_port.or(self.prometheus_port)
    }

    /// Startup validation. In real-PLC mode at least one controller IP must
    /// be configured; a contradiction here aborts startup (exit code 1).
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_period <= 0.0 {
            return Err(format!("POLL_PERIOD must be positive, got {}", self.poll_period));
        }
        if self.reconnect_base <= 0.0 || self.reconnect_max < self.reconnect_base {
            return Err(format!(
                "reconnect window invalid: base={} max={}",
                self.reconnect_base, self.reconnect_max
            ));
        }
        if !self.mock_plc() && self.compactlogix_ip.is_none() && self.slc500_ip.is_none() {
            return Err(
                "real PLC mode requires COMPACTLOGIX_IP or SLC500_IP (or set GATEWAY_MOCK_PLC=1)"
                    .to_string(),
            );
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            gateway_mock_plc: None,
            gateway_mock_fail_reconnect: None,
            compactlogix_ip: None,
            slc500_ip: None,
            poll_period: default_poll_period(),
            reconnect_base: default_reconnect_base(),
            reconnect_max: default_reconnect_max(),
            plc_socket_timeout: default_socket_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            ready_file: None,
            metrics_port: None,
            prometheus_port: None,
            http_port: default_http_port(),
            opcua_port: default_opcua_port(),
        }
    }
}
