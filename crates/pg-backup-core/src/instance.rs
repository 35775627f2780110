//! Clients for the instance manager running next to Postgres.
//!
//! Two HTTP endpoints are used:
//! - `/pg/mode/backup` on the backup port: start (`POST`), stop (`PUT`)
//!   and status (`GET`) of the physical backup mode
//! - `/pg/controldata` on the status port: `pg_controldata` output, from
//!   which the current WAL file is read
//!
//! Every response is wrapped in a `{ "data": ..., "error": ... }` envelope.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::InstanceConfig;
use crate::error::InstanceError;
use crate::retry::cancellable;
use crate::{Error, Result};

/// Control-data key holding the WAL file of the latest checkpoint's REDO
pub const CURRENT_WAL_FILE_KEY: &str = "Latest checkpoint's REDO WAL file";

/// Body of a start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBackupRequest {
    pub immediate_checkpoint: bool,
    pub wait_for_archive: bool,
    pub backup_name: String,
    pub force: bool,
}

impl StartBackupRequest {
    /// Immediate checkpoint, wait for archive, and take over any session
    /// that still looks active.
    pub fn forced(backup_name: impl Into<String>) -> Self {
        Self {
            immediate_checkpoint: true,
            wait_for_archive: true,
            backup_name: backup_name.into(),
            force: true,
        }
    }
}

/// Body of a stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBackupRequest {
    pub backup_name: String,
}

/// Phase of the backup mode as reported by the instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupModePhase {
    Starting,
    Started,
    Closing,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for BackupModePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Closing => "closing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Backup mode status; once completed it carries the backup result
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupModePhase,
    #[serde(default)]
    pub backup_name: String,
    #[serde(default, rename = "beginLSN")]
    pub begin_lsn: String,
    #[serde(default, rename = "endLSN")]
    pub end_lsn: String,
    /// Contents of `backup_label`
    #[serde(default, deserialize_with = "base64_bytes")]
    pub label_file: Vec<u8>,
    /// Contents of `tablespace_map`
    #[serde(default, deserialize_with = "base64_bytes")]
    pub spcmap_file: Vec<u8>,
}

fn base64_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code.is_empty(), self.message.is_empty()) {
            (false, false) => write!(f, "{}: {}", self.code, self.message),
            (false, true) => f.write_str(&self.code),
            _ => f.write_str(&self.message),
        }
    }
}

/// Parse `pg_controldata` output into key/value pairs.
///
/// Each line is split at its first `:`; lines without one are skipped.
pub fn parse_control_data(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Operations of the instance manager used by the backup executor
#[async_trait]
pub trait InstanceClient: Send + Sync {
    /// Current `pg_controldata` key/value pairs
    async fn control_data(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>>;

    /// Ask the instance to enter backup mode
    async fn start_backup(
        &self,
        request: &StartBackupRequest,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Ask the instance to leave backup mode
    async fn stop_backup(&self, request: &StopBackupRequest, cancel: &CancellationToken)
        -> Result<()>;

    /// Current backup mode status
    async fn backup_status(&self, cancel: &CancellationToken) -> Result<BackupStatus>;

    /// WAL file of the latest checkpoint's REDO record
    async fn current_wal_file(&self, cancel: &CancellationToken) -> Result<String> {
        let mut pairs = self.control_data(cancel).await?;
        pairs.remove(CURRENT_WAL_FILE_KEY).ok_or_else(|| {
            InstanceError::InvalidResponse {
                url: "pg/controldata".to_string(),
                message: format!("missing {:?}", CURRENT_WAL_FILE_KEY),
            }
            .into()
        })
    }
}

/// [`InstanceClient`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpInstanceClient {
    client: reqwest::Client,
    control_data_url: String,
    backup_mode_url: String,
    request_timeout: Duration,
}

impl HttpInstanceClient {
    /// Build a client with the configured connect and total timeouts
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            control_data_url: config.control_data_url(),
            backup_mode_url: config.backup_mode_url(),
            request_timeout: config.request_timeout(),
        })
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            InstanceError::Timeout {
                url: url.to_string(),
                timeout: self.request_timeout,
            }
            .into()
        } else {
            InstanceError::Connection {
                url: url.to_string(),
                message: e.to_string(),
            }
            .into()
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(StatusCode, Bytes)> {
        cancellable(cancel, async {
            let response = request
                .send()
                .await
                .map_err(|e| self.transport_error(url, e))?;
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| self.transport_error(url, e))?;
            debug!("{} answered {} ({} bytes)", url, status, body.len());
            Ok((status, body))
        })
        .await
    }
}

/// Unwrap a response envelope, turning error envelopes and non-2xx
/// statuses into [`InstanceError::Status`].
fn open_envelope<T: DeserializeOwned>(url: &str, status: StatusCode, body: &[u8]) -> Result<Option<T>> {
    let status_error = |message: String| -> Error {
        InstanceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            message,
        }
        .into()
    };

    if status.is_success() && body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match serde_json::from_slice::<Envelope<T>>(body) {
        Ok(Envelope {
            error: Some(error), ..
        }) => Err(status_error(error.to_string())),
        Ok(_) if !status.is_success() => {
            Err(status_error(String::from_utf8_lossy(body).trim().to_string()))
        }
        Ok(Envelope { data, .. }) => Ok(data),
        Err(_) if !status.is_success() => {
            Err(status_error(String::from_utf8_lossy(body).trim().to_string()))
        }
        Err(e) => Err(InstanceError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        }
        .into()),
    }
}

fn missing_data(url: &str) -> Error {
    InstanceError::InvalidResponse {
        url: url.to_string(),
        message: "response carries no data".to_string(),
    }
    .into()
}

#[async_trait]
impl InstanceClient for HttpInstanceClient {
    async fn control_data(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let url = &self.control_data_url;
        let (status, body) = self.send(self.client.get(url), url, cancel).await?;
        let output: String = open_envelope(url, status, &body)?.ok_or_else(|| missing_data(url))?;
        Ok(parse_control_data(&output))
    }

    async fn start_backup(
        &self,
        request: &StartBackupRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = &self.backup_mode_url;
        debug!("Requesting backup mode start for {}", request.backup_name);
        let (status, body) = self
            .send(self.client.post(url).json(request), url, cancel)
            .await?;
        open_envelope::<serde_json::Value>(url, status, &body)?;
        Ok(())
    }

    async fn stop_backup(
        &self,
        request: &StopBackupRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = &self.backup_mode_url;
        debug!("Requesting backup mode stop for {}", request.backup_name);
        let (status, body) = self
            .send(self.client.put(url).json(request), url, cancel)
            .await?;
        open_envelope::<serde_json::Value>(url, status, &body)?;
        Ok(())
    }

    async fn backup_status(&self, cancel: &CancellationToken) -> Result<BackupStatus> {
        let url = &self.backup_mode_url;
        let (status, body) = self.send(self.client.get(url), url, cancel).await?;
        open_envelope(url, status, &body)?.ok_or_else(|| missing_data(url))
    }
}
