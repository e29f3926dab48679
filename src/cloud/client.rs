//! Signed HTTP client for the inverter cloud API.
//!
//! Every request is a POST with an HMAC-SHA1 signature over the canonical
//! string `"POST\n" + Content-MD5 + "\n" + Content-Type + "\n" + Date +
//! "\n" + path`. One call here is one attempt; the poller owns the retry
//! schedule so it can account per-attempt failures.

use base64::prelude::*;
use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::CloudConfig;
use crate::util::now_ms;

type HmacSha1 = Hmac<Sha1>;

pub const DETAIL_PATH: &str = "/v1/api/inverterDetail";
const CONTENT_TYPE: &str = "application/json";

/// Cloud-side failure, classified for retry and alert mapping.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status}")]
    Status { status: u16 },
    #[error("api error code {code}: {msg}")]
    Api { code: String, msg: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl CloudError {
    /// Worth another attempt: rate limiting, server errors and transport
    /// trouble. Auth failures and application errors are not.
    pub fn retryable(&self) -> bool {
        match self {
            CloudError::Timeout | CloudError::Transport(_) => true,
            CloudError::Status { status } => *status == 429 || *status >= 500,
            CloudError::Api { .. } | CloudError::Decode(_) => false,
        }
    }
}

/// One successfully fetched and interpreted cloud reading.
#[derive(Debug, Clone)]
pub struct CloudReading {
    /// Net grid power in kW, positive export, negative import.
    pub psum_kw: f64,
    pub pac_kw: Option<f64>,
    pub pv_kw: Option<f64>,
    pub load_kw: Option<f64>,
    /// 1 = online, 2 = offline, 3 = alarm.
    pub state: Option<i64>,
    pub warning_info: Option<i64>,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct FetchedDetail {
    pub reading: CloudReading,
    /// Server wall-clock minus ours, when the response carried a Date.
    pub server_skew_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<DetailData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailData {
    psum: Option<f64>,
    pac: Option<f64>,
    dc_pac: Option<f64>,
    dc_pac_str: Option<String>,
    family_load_power: Option<f64>,
    total_load_power: Option<f64>,
    pow_total: Option<f64>,
    dc_ac_power: Option<f64>,
    state: Option<i64>,
    warning_info_data: Option<i64>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

pub struct CloudClient {
    http: reqwest::Client,
    cfg: CloudConfig,
}

impl CloudClient {
    pub fn new(cfg: CloudConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("meter-bridge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, cfg })
    }

    /// Single signed request for the inverter detail. No retries here.
    pub async fn attempt_fetch(&self) -> Result<FetchedDetail, CloudError> {
        let body = serde_json::json!({ "sn": self.cfg.sn }).to_string();
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_md5 = BASE64_STANDARD.encode(Md5::digest(body.as_bytes()));
        let canonical = canonical_string(&content_md5, CONTENT_TYPE, &date, DETAIL_PATH);
        let authorization = format!(
            "API {}:{}",
            self.cfg.api_id,
            sign(&self.cfg.api_secret, &canonical)
        );
        let url = format!("{}{}", self.cfg.base_uri.trim_end_matches('/'), DETAIL_PATH);

        let response = self
            .http
            .post(url)
            .timeout(Duration::from_millis(self.cfg.request_timeout_ms))
            .header("Content-MD5", content_md5)
            .header("Content-Type", CONTENT_TYPE)
            .header("Date", date)
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    CloudError::Timeout
                } else {
                    CloudError::Transport(err.to_string())
                }
            })?;

        let server_skew_ms = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| chrono::DateTime::parse_from_rfc2822(value).ok())
            .map(|server| server.timestamp_millis() - Utc::now().timestamp_millis());

        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
            });
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|err| CloudError::Decode(err.to_string()))?;
        if envelope.code != "0" {
            return Err(CloudError::Api {
                code: envelope.code,
                msg: envelope.msg.unwrap_or_default(),
            });
        }
        let data = envelope
            .data
            .ok_or_else(|| CloudError::Decode("missing data object".to_string()))?;
        let psum_kw = data
            .psum
            .ok_or_else(|| CloudError::Decode("missing psum".to_string()))?;

        let pv_kw = resolve_pv_kw(&data);
        let load_kw = resolve_load_kw(&data, psum_kw, pv_kw);

        Ok(FetchedDetail {
            reading: CloudReading {
                psum_kw,
                pac_kw: data.pac,
                pv_kw,
                load_kw,
                state: data.state,
                warning_info: data.warning_info_data,
                fetched_at_ms: now_ms(),
            },
            server_skew_ms,
        })
    }
}

fn canonical_string(content_md5: &str, content_type: &str, date: &str, path: &str) -> String {
    format!("POST\n{content_md5}\n{content_type}\n{date}\n{path}")
}

fn sign(secret: &str, canonical: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// PV power in kW, first source with real magnitude wins; a merely present
/// source is the fallback. `dcPac` carries its own unit, `powTotal`, the
/// per-string `pow<N>` fields and `dcAcPower` are watts.
fn resolve_pv_kw(data: &DetailData) -> Option<f64> {
    let candidates = [
        data.pac,
        data.dc_pac.map(|value| {
            let is_watts = data
                .dc_pac_str
                .as_deref()
                .is_some_and(|unit| unit.eq_ignore_ascii_case("w"));
            if is_watts {
                value / 1000.0
            } else {
                value
            }
        }),
        string_total_kw(data),
        data.dc_ac_power.map(|value| value / 1000.0),
    ];
    candidates
        .iter()
        .flatten()
        .find(|value| value.abs() > 0.05)
        .or_else(|| candidates.iter().flatten().next())
        .copied()
}

fn string_total_kw(data: &DetailData) -> Option<f64> {
    if let Some(total) = data.pow_total {
        return Some(total / 1000.0);
    }
    let strings: Vec<f64> = (1..=32)
        .filter_map(|i| data.extra.get(&format!("pow{i}")))
        .filter_map(serde_json::Value::as_f64)
        .collect();
    if strings.is_empty() {
        None
    } else {
        Some(strings.iter().sum::<f64>() / 1000.0)
    }
}

/// Site load in kW. Reported figures are trusted only when they roughly
/// agree with the energy balance `pv + import - export`.
fn resolve_load_kw(data: &DetailData, psum_kw: f64, pv_kw: Option<f64>) -> Option<f64> {
    let import = (-psum_kw).max(0.0);
    let export = psum_kw.max(0.0);
    let balance = pv_kw.unwrap_or(0.0) + import - export;
    let tolerance = 0.6f64.max(balance.abs() * 0.35);

    for candidate in [data.family_load_power, data.total_load_power] {
        if let Some(value) = candidate {
            if (value - balance).abs() <= tolerance {
                return Some(value);
            }
        }
    }
    Some(balance)
}
