//! Cloud polling and compensation computation.
//!
//! A periodic job fetches the neighbouring inverter's power flow from the
//! vendor cloud, feeds it through the set-point pipeline and keeps the
//! `SOLIS_*` alert keys honest. The poller owns the retry schedule so each
//! failed attempt is accounted against the right alert before the retry
//! fires.

pub mod client;
pub mod setpoint;

pub use client::{CloudClient, CloudError, CloudReading};
pub use setpoint::{Commit, Compensator};

use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::{AlertEngine, Severity};
use crate::config::CloudConfig;
use crate::util::now_ms;

pub const ALERT_SOLIS_DOWN: &str = "SOLIS_DOWN";
pub const ALERT_SOLIS_AUTH: &str = "SOLIS_AUTH";
pub const ALERT_SOLIS_RATE_LIMIT: &str = "SOLIS_RATE_LIMIT";
pub const ALERT_SOLIS_CLOCK_SKEW: &str = "SOLIS_CLOCK_SKEW";
pub const ALERT_SOLIS_STALE: &str = "SOLIS_STALE";
pub const ALERT_SOLIS_ALARM: &str = "SOLIS_ALARM";

/// Base delays between attempts of one poll; each gets +-100 ms of jitter.
const RETRY_DELAYS_MS: [u64; 3] = [0, 500, 1000];
const RETRY_JITTER_MS: i64 = 100;

pub struct CloudPoller {
    client: CloudClient,
    compensator: Compensator,
    alerts: Arc<AlertEngine>,
    cfg: CloudConfig,
    last_reading: Mutex<Option<CloudReading>>,
}

impl CloudPoller {
    pub fn new(cfg: CloudConfig, alerts: Arc<AlertEngine>) -> anyhow::Result<Self> {
        Ok(Self {
            client: CloudClient::new(cfg.clone())?,
            compensator: Compensator::new(cfg.clone()),
            alerts,
            cfg,
            last_reading: Mutex::new(None),
        })
    }

    /// One poll cycle: fetch with retries, update the set-point, maintain
    /// the cloud alert keys. Cloud trouble is not an error of the job.
    pub async fn poll_once(&self) -> anyhow::Result<()> {
        let mut last_error: Option<CloudError> = None;

        for base_delay in RETRY_DELAYS_MS {
            if base_delay > 0 {
                tokio::time::sleep(jittered(base_delay)).await;
            }
            match self.client.attempt_fetch().await {
                Ok(fetched) => {
                    self.on_fetch_success(fetched);
                    return Ok(());
                }
                Err(error) => {
                    warn!(error = %error, "cloud fetch attempt failed");
                    self.raise_for_error(&error);
                    let retry = error.retryable();
                    last_error = Some(error);
                    if !retry {
                        break;
                    }
                }
            }
        }

        if let Some(error) = last_error {
            debug!(error = %error, "cloud poll gave up");
        }
        if self.compensator.mark_failure(now_ms()) {
            self.alerts.raise(
                ALERT_SOLIS_STALE,
                Severity::Warn,
                "cloud data too old, compensation forced to zero",
            );
        }
        Ok(())
    }

    fn on_fetch_success(&self, fetched: client::FetchedDetail) {
        match fetched.server_skew_ms {
            Some(skew) if skew.abs() > self.cfg.max_clock_skew_ms => {
                self.alerts.raise(
                    ALERT_SOLIS_CLOCK_SKEW,
                    Severity::Warn,
                    format!("server clock differs by {skew} ms"),
                );
            }
            Some(_) => self.alerts.resolve(ALERT_SOLIS_CLOCK_SKEW),
            None => {}
        }

        self.alerts.resolve(ALERT_SOLIS_DOWN);
        self.alerts.resolve(ALERT_SOLIS_AUTH);
        self.alerts.resolve(ALERT_SOLIS_RATE_LIMIT);

        let now = now_ms();
        match self.compensator.apply_reading(&fetched.reading, now) {
            Commit::Alarm => {
                self.alerts.raise(
                    ALERT_SOLIS_ALARM,
                    Severity::Warn,
                    format!(
                        "inverter reports state {:?}, warning {:?}",
                        fetched.reading.state, fetched.reading.warning_info
                    ),
                );
            }
            Commit::Updated { delta_kw } => {
                self.alerts.resolve(ALERT_SOLIS_ALARM);
                debug!(delta_kw, psum_kw = fetched.reading.psum_kw, "set-point updated");
            }
        }
        self.alerts.resolve(ALERT_SOLIS_STALE);

        *self.last_reading.lock() = Some(fetched.reading);
    }

    fn raise_for_error(&self, error: &CloudError) {
        match error {
            CloudError::Status { status: 401 } | CloudError::Status { status: 403 } => {
                self.alerts.raise(
                    ALERT_SOLIS_AUTH,
                    Severity::Error,
                    format!("cloud rejected credentials ({error})"),
                );
            }
            CloudError::Status { status: 429 } => {
                self.alerts
                    .raise(ALERT_SOLIS_RATE_LIMIT, Severity::Warn, "cloud rate limit hit");
            }
            CloudError::Status { status } if *status >= 500 => {
                self.alerts.raise(
                    ALERT_SOLIS_DOWN,
                    Severity::Error,
                    format!("cloud server error {status}"),
                );
            }
            other => {
                self.alerts
                    .raise(ALERT_SOLIS_DOWN, Severity::Warn, other.to_string());
            }
        }
    }

    /// Safety-gated compensation in kW for the feeder.
    pub fn current_delta_kw(&self) -> f64 {
        self.compensator.current_delta_kw(now_ms())
    }

    pub fn last_reading(&self) -> Option<CloudReading> {
        self.last_reading.lock().clone()
    }

    pub fn override_enabled(&self) -> bool {
        self.cfg.override_enabled
    }

    pub fn min_import_kw(&self) -> f64 {
        self.cfg.min_import_kw
    }
}

fn jittered(base_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER_MS..=RETRY_JITTER_MS);
    Duration::from_millis((base_ms as i64 + jitter).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::EventKind;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_cfg(base_uri: String) -> CloudConfig {
        CloudConfig {
            api_id: "test-id".to_string(),
            api_secret: "test-secret".to_string(),
            base_uri,
            sn: "INV123".to_string(),
            fetch_period_s: 10,
            min_import_kw: 0.2,
            max_data_age_ms: 300_000,
            smoothing_factor: 0.8,
            clamp_max_kw: 50.0,
            delta_max_kw_per_sec: 2.0,
            override_enabled: true,
            request_timeout_ms: 2000,
            max_clock_skew_ms: 90_000,
        }
    }

    fn poller(base_uri: String) -> (CloudPoller, Arc<AlertEngine>) {
        let alerts = Arc::new(AlertEngine::new());
        let poller = CloudPoller::new(test_cfg(base_uri), alerts.clone()).unwrap();
        (poller, alerts)
    }

    fn detail_body(psum: f64) -> serde_json::Value {
        serde_json::json!({
            "code": "0",
            "msg": "success",
            "data": { "psum": psum, "state": 1, "warningInfoData": 0 }
        })
    }

    #[tokio::test]
    async fn successful_poll_updates_set_point() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(-2.5)))
            .expect(1)
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        // EMA 0.8 from 0 toward 2.5 kW of import.
        assert!((poller.current_delta_kw() - 2.0).abs() < 1e-9);
        assert!(!alerts.is_active(ALERT_SOLIS_DOWN));
        let reading = poller.last_reading().expect("reading stored");
        assert!((reading.psum_kw + 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn requests_are_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .and(header_exists("Content-MD5"))
            .and(header_exists("Date"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(0.0)))
            .expect(1)
            .mount(&server)
            .await;

        let (poller, _alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("Authorization").unwrap();
        let auth = auth.to_str().unwrap();
        assert!(auth.starts_with("API test-id:"), "got {auth}");
        let content_type = requests[0].headers.get("Content-Type").unwrap();
        assert_eq!(content_type.to_str().unwrap(), "application/json");
        assert_eq!(requests[0].body.as_slice(), br#"{"sn":"INV123"}"#);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_and_resolved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(-2.5)))
            .expect(1)
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        assert!(!alerts.is_active(ALERT_SOLIS_RATE_LIMIT));
        let recent = alerts.snapshot().recent;
        let raised = recent
            .iter()
            .any(|e| e.key == ALERT_SOLIS_RATE_LIMIT && e.kind == EventKind::Raise);
        let resolved = recent
            .iter()
            .any(|e| e.key == ALERT_SOLIS_RATE_LIMIT && e.kind == EventKind::Resolve);
        assert!(raised && resolved);
        assert!((poller.current_delta_kw() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        assert!(alerts.is_active(ALERT_SOLIS_AUTH));
        assert_eq!(poller.current_delta_kw(), 0.0);
    }

    #[tokio::test]
    async fn server_errors_exhaust_all_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        assert!(alerts.is_active(ALERT_SOLIS_DOWN));
    }

    #[tokio::test]
    async fn application_error_code_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "B0302",
                "msg": "account abnormal",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        assert!(alerts.is_active(ALERT_SOLIS_DOWN));
    }

    #[tokio::test]
    async fn alarm_state_pauses_compensation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0",
                "data": { "psum": -5.0, "state": 3, "warningInfoData": 42 }
            })))
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();

        assert!(alerts.is_active(ALERT_SOLIS_ALARM));
        assert_eq!(poller.current_delta_kw(), 0.0);
    }

    #[tokio::test]
    async fn alarm_resolves_on_healthy_reading() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0",
                "data": { "psum": -5.0, "state": 3, "warningInfoData": 42 }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(client::DETAIL_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(detail_body(-5.0)))
            .mount(&server)
            .await;

        let (poller, alerts) = poller(server.uri());
        poller.poll_once().await.unwrap();
        assert!(alerts.is_active(ALERT_SOLIS_ALARM));
        poller.poll_once().await.unwrap();
        assert!(!alerts.is_active(ALERT_SOLIS_ALARM));
        assert!(poller.current_delta_kw() > 0.0);
    }
}
