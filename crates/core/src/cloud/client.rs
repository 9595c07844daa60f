//! Blocking HTTP client for the cloud backend.
//!
//! Every request carries the `X-API-Key` header and a per-endpoint
//! timeout (5 s health, 10 s alerts/heartbeat/beacons, 30 s images).
//! Failed requests retry with linear back-off
//! (`retry_delay * (attempt + 1)`), then surface as a `CloudError`.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use image::codecs::jpeg::JpegEncoder;
use log::{info, warn};
use reqwest::blocking::multipart;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::alert::event::AlertEvent;
use crate::beacon::whitelist::WhitelistEntry;
use crate::config::CloudConfig;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const JSON_TIMEOUT: Duration = Duration::from_secs(10);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Monitoring snapshots tolerate a larger upload than event snapshots.
pub const MONITORING_SIZE_MULTIPLIER: f64 = 2.0;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned {status} for {url}")]
    Status { url: String, status: StatusCode },
    #[error("unexpected response from {url}: {message}")]
    BadResponse { url: String, message: String },
    #[error("cannot read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot re-encode image {path}: {source}")]
    ImageEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Deserialize)]
struct AlertResponse {
    id: i64,
}

#[derive(Deserialize)]
struct ImageResponse {
    path: Option<String>,
    url: Option<String>,
}

pub struct CloudClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    retry_attempts: u32,
    retry_delay: Duration,
    max_image_size_mb: f64,
    enable_image_upload: bool,
    enable_alert_upload: bool,
}

impl CloudClient {
    pub fn new(config: &CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(CloudError::Client)?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_secs_f64(config.retry_delay.max(0.0)),
            max_image_size_mb: config.max_image_size_mb,
            enable_image_upload: config.enable_image_upload,
            enable_alert_upload: config.enable_alert_upload,
        })
    }

    /// `GET /health`; any 2xx means reachable.
    pub fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("health check failed: {e}");
                false
            }
        }
    }

    /// POSTs one alert; returns the cloud-assigned id. The client never
    /// invents ids.
    pub fn send_alert(&self, event: &AlertEvent) -> Result<Option<i64>, CloudError> {
        if !self.enable_alert_upload {
            return Ok(None);
        }
        let url = format!("{}/api/alerts", self.base_url);
        let response: AlertResponse = self.with_retries(|| {
            let resp = self
                .http
                .post(&url)
                .header("X-API-Key", &self.api_key)
                .timeout(JSON_TIMEOUT)
                .json(event)
                .send()
                .map_err(|e| CloudError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            parse_json(resp, &url)
        })?;
        info!("alert uploaded, id {}", response.id);
        Ok(Some(response.id))
    }

    /// Uploads an image via multipart `POST /api/images`, re-encoding it
    /// first when it exceeds the configured size cap. Returns the
    /// server-relative path (`YYYY-MM-DD/filename`).
    pub fn upload_image(
        &self,
        path: &Path,
        alert_id: Option<i64>,
        image_type: Option<&str>,
        device_id: Option<&str>,
        size_multiplier: f64,
    ) -> Result<Option<String>, CloudError> {
        if !self.enable_image_upload {
            return Ok(None);
        }
        let cap_mb = self.max_image_size_mb * size_multiplier;
        let bytes = self.read_image_bounded(path, cap_mb)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot.jpg".to_string());

        let url = format!("{}/api/images", self.base_url);
        let response: ImageResponse = self.with_retries(|| {
            let part = multipart::Part::bytes(bytes.clone())
                .file_name(filename.clone())
                .mime_str("image/jpeg")
                .map_err(|e| CloudError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            let mut form = multipart::Form::new().part("file", part);
            if let Some(id) = alert_id {
                form = form.text("alert_id", id.to_string());
            }
            if let Some(t) = image_type {
                form = form.text("image_type", t.to_string());
            }
            if let Some(d) = device_id {
                form = form.text("device_id", d.to_string());
            }
            let resp = self
                .http
                .post(&url)
                .header("X-API-Key", &self.api_key)
                .timeout(IMAGE_TIMEOUT)
                .multipart(form)
                .send()
                .map_err(|e| CloudError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            parse_json(resp, &url)
        })?;

        match response.path.or(response.url) {
            Some(p) => {
                info!("image uploaded: {p}");
                Ok(Some(p))
            }
            None => Err(CloudError::BadResponse {
                url,
                message: "missing path".into(),
            }),
        }
    }

    /// `POST /api/heartbeat` with system metrics and a stats snapshot.
    pub fn send_heartbeat(
        &self,
        device_id: &str,
        system_status: serde_json::Value,
        stats: serde_json::Value,
    ) -> Result<(), CloudError> {
        let url = format!("{}/api/heartbeat", self.base_url);
        let body = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "device_id": device_id,
            "system_status": system_status,
            "stats": stats,
        });
        self.with_retries(|| {
            let resp = self
                .http
                .post(&url)
                .header("X-API-Key", &self.api_key)
                .timeout(JSON_TIMEOUT)
                .json(&body)
                .send()
                .map_err(|e| CloudError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            check_status(resp, &url).map(|_| ())
        })
    }

    /// `GET /api/beacons` — the whitelist pull.
    pub fn fetch_beacons(&self) -> Result<Vec<WhitelistEntry>, CloudError> {
        let url = format!("{}/api/beacons", self.base_url);
        self.with_retries(|| {
            let resp = self
                .http
                .get(&url)
                .header("X-API-Key", &self.api_key)
                .timeout(JSON_TIMEOUT)
                .send()
                .map_err(|e| CloudError::Http {
                    url: url.clone(),
                    source: e,
                })?;
            parse_json(resp, &url)
        })
    }

    fn with_retries<T>(
        &self,
        op: impl Fn() -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(
                        "cloud request failed (attempt {}/{}): {e}",
                        attempt + 1,
                        self.retry_attempts
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.retry_attempts {
                        std::thread::sleep(self.retry_delay * (attempt + 1));
                    }
                }
            }
        }
        Err(last_err.unwrap_or(CloudError::BadResponse {
            url: self.base_url.clone(),
            message: "no attempts made".into(),
        }))
    }

    /// Reads an image file, re-encoding it down when it exceeds the cap.
    fn read_image_bounded(&self, path: &Path, cap_mb: f64) -> Result<Vec<u8>, CloudError> {
        let bytes = std::fs::read(path).map_err(|e| CloudError::ImageRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cap_bytes = (cap_mb * 1024.0 * 1024.0) as usize;
        if bytes.len() <= cap_bytes {
            return Ok(bytes);
        }

        warn!(
            "image {} is {:.2} MB, re-encoding under {:.1} MB cap",
            path.display(),
            bytes.len() as f64 / (1024.0 * 1024.0),
            cap_mb
        );
        let img = image::load_from_memory(&bytes)
            .map_err(|e| CloudError::ImageEncode {
                path: path.to_path_buf(),
                source: e,
            })?
            .into_rgb8();

        let mut quality = 95u8;
        loop {
            let mut out = Vec::new();
            JpegEncoder::new_with_quality(Cursor::new(&mut out), quality)
                .encode(
                    img.as_raw(),
                    img.width(),
                    img.height(),
                    image::ExtendedColorType::Rgb8,
                )
                .map_err(|e| CloudError::ImageEncode {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            if out.len() <= cap_bytes || quality <= 70 {
                return Ok(out);
            }
            quality -= 5;
        }
    }
}

fn check_status(
    resp: reqwest::blocking::Response,
    url: &str,
) -> Result<reqwest::blocking::Response, CloudError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(CloudError::Status {
            url: url.to_string(),
            status: resp.status(),
        })
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::blocking::Response,
    url: &str,
) -> Result<T, CloudError> {
    let resp = check_status(resp, url)?;
    resp.json().map_err(|e| CloudError::BadResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}
