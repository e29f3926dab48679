#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    pub meter: MeterConfig,

    #[validate(nested)]
    pub inverter: InverterConfig,

    #[validate(nested)]
    pub cloud: CloudConfig,

    #[validate(nested)]
    pub transform: TransformConfig,

    #[validate(nested)]
    pub alerts: AlertsConfig,
}

/// HTTP status server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

/// Worker pool and periodic-job configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,

    #[serde(default = "default_summary_interval_s")]
    #[validate(range(min = 5, max = 3600))]
    pub summary_interval_s: u64,
}

/// Meter bus (RTU master) configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MeterConfig {
    #[validate(length(min = 1))]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_slave_id")]
    #[validate(range(min = 1, max = 247))]
    pub slave_id: u8,

    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 100, max = 60000))]
    pub poll_interval_ms: u64,

    #[serde(default = "default_initial_open_delay_ms")]
    pub initial_open_delay_ms: u64,

    #[serde(default = "default_reopen_backoff_ms")]
    #[validate(range(min = 100, max = 600000))]
    pub reopen_backoff_ms: u64,

    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,

    #[serde(default = "default_timeouts_before_reopen")]
    #[validate(range(min = 1, max = 100))]
    pub timeouts_before_reopen: u32,

    #[serde(default = "default_meter_stale_ms")]
    #[validate(range(min = 1000, max = 3600000))]
    pub meter_stale_ms: i64,

    #[serde(default = "default_stale_alert_min_period_ms")]
    pub stale_alert_min_period_ms: i64,

    #[serde(default = "default_max_window_errors_before_reopen")]
    #[validate(range(min = 1, max = 16))]
    pub max_window_errors_before_reopen: u32,

    #[serde(default = "default_meter_request_timeout_ms")]
    #[validate(range(min = 100, max = 30000))]
    pub request_timeout_ms: u64,
}

/// Inverter bus (RTU slave) configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InverterConfig {
    #[validate(length(min = 1))]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_slave_id")]
    #[validate(range(min = 1, max = 247))]
    pub slave_id: u8,

    #[serde(default = "default_init_registers")]
    #[validate(range(min = 364, max = 10000))]
    pub init_registers: usize,

    #[serde(default = "default_max_sm_age_for_write_ms")]
    #[validate(range(min = 1000, max = 3600000))]
    pub max_sm_age_for_write_ms: i64,

    #[serde(default = "default_out_stale_ms")]
    #[validate(range(min = 1000, max = 3600000))]
    pub out_stale_ms: i64,

    #[serde(default = "default_true")]
    pub defer_open_until_first_frame: bool,

    #[serde(default = "default_true")]
    pub republish_on_stale: bool,
}

/// Cloud API and compensation configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CloudConfig {
    #[serde(default)]
    pub api_id: String,

    #[serde(default)]
    pub api_secret: String,

    #[serde(default = "default_base_uri")]
    #[validate(length(min = 1))]
    pub base_uri: String,

    /// Serial number of the neighbouring inverter whose flows we follow.
    #[serde(default)]
    pub sn: String,

    #[serde(default = "default_fetch_period_s")]
    #[validate(range(min = 1, max = 3600))]
    pub fetch_period_s: u64,

    #[serde(default = "default_min_import_kw")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_import_kw: f64,

    #[serde(default = "default_max_data_age_ms")]
    #[validate(range(min = 1000, max = 86400000))]
    pub max_data_age_ms: i64,

    #[serde(default = "default_smoothing_factor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub smoothing_factor: f64,

    #[serde(default = "default_clamp_max_kw")]
    #[validate(range(min = 0.0, max = 1000.0))]
    pub clamp_max_kw: f64,

    #[serde(default = "default_delta_max_kw_per_sec")]
    #[validate(range(min = 0.001, max = 100.0))]
    pub delta_max_kw_per_sec: f64,

    #[serde(default = "default_true")]
    pub override_enabled: bool,

    #[serde(default = "default_cloud_request_timeout_ms")]
    #[validate(range(min = 500, max = 60000))]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,
}

/// Power-control transform configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TransformConfig {
    /// Potential-transformer ratio applied to raw voltage/power words.
    #[serde(default = "default_scale")]
    #[validate(range(min = 0.001, max = 10000.0))]
    pub scale_pt: f64,

    /// Current-transformer ratio applied to raw current/power words.
    #[serde(default = "default_scale")]
    #[validate(range(min = 0.001, max = 10000.0))]
    pub scale_ct: f64,

    #[serde(default = "default_min_power_factor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_power_factor: f64,

    #[serde(default = "default_stale_to_zero_ms")]
    #[validate(range(min = 1000, max = 86400000))]
    pub stale_to_zero_ms: i64,

    #[serde(default = "default_phase_min_volt")]
    #[validate(range(min = 1.0, max = 100000.0))]
    pub phase_min_volt: f64,

    #[serde(default = "default_safe_div_min_volt")]
    #[validate(range(min = 1.0, max = 100000.0))]
    pub safe_div_min_volt: f64,
}

/// Alert sink configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AlertsConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,

    #[serde(default = "default_true")]
    pub startup_ping: bool,

    #[serde(default = "default_true")]
    pub shutdown_ping: bool,

    #[serde(default = "default_true")]
    pub heartbeat_enabled: bool,

    /// Local hour of day (0-23) at which the daily heartbeat fires.
    #[serde(default = "default_heartbeat_hour")]
    #[validate(range(min = 0, max = 23))]
    pub heartbeat_hour: u32,
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }
fn default_workers() -> usize { 8 }
fn default_summary_interval_s() -> u64 { 30 }
fn default_baud_rate() -> u32 { 9600 }
fn default_slave_id() -> u8 { 1 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_initial_open_delay_ms() -> u64 { 2000 }
fn default_reopen_backoff_ms() -> u64 { 5000 }
fn default_warmup_ms() -> u64 { 5000 }
fn default_timeouts_before_reopen() -> u32 { 3 }
fn default_meter_stale_ms() -> i64 { 30_000 }
fn default_stale_alert_min_period_ms() -> i64 { 60_000 }
fn default_max_window_errors_before_reopen() -> u32 { 2 }
fn default_meter_request_timeout_ms() -> u64 { 1200 }
fn default_init_registers() -> usize { 400 }
fn default_max_sm_age_for_write_ms() -> i64 { 60_000 }
fn default_out_stale_ms() -> i64 { 30_000 }
fn default_base_uri() -> String { "https://www.soliscloud.com:13333".to_string() }
fn default_fetch_period_s() -> u64 { 10 }
fn default_min_import_kw() -> f64 { 0.2 }
fn default_max_data_age_ms() -> i64 { 300_000 }
fn default_smoothing_factor() -> f64 { 0.8 }
fn default_clamp_max_kw() -> f64 { 50.0 }
fn default_delta_max_kw_per_sec() -> f64 { 2.0 }
fn default_cloud_request_timeout_ms() -> u64 { 6000 }
fn default_max_clock_skew_ms() -> i64 { 90_000 }
fn default_scale() -> f64 { 1.0 }
fn default_min_power_factor() -> f64 { 0.95 }
fn default_stale_to_zero_ms() -> i64 { 300_000 }
fn default_phase_min_volt() -> f64 { 100.0 }
fn default_safe_div_min_volt() -> f64 { 100.0 }
fn default_cooldown_ms() -> i64 { 900_000 }
fn default_heartbeat_hour() -> u32 { 8 }
fn default_true() -> bool { true }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/local.toml (site-specific overrides, optional)
    /// 3. Environment variables with METER_BRIDGE__ prefix
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("METER_BRIDGE__").split("__"));

        let config: AppConfig = figment
            .extract()
            .context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}
