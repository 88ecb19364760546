//! Remote mirror to a Firebase Realtime Database.
//!
//! Every fresh per-board sample is written to
//! `<stage>/<substance>/<test_id>/<board>/readings/<seq>` as
//!
//! ```json
//! {"timestamp": "HH-MM-SS DD-MM-YYYY", "readings": {"NO2 (ppm)": 0.4}, "battery": {"percent": 87, "volts": 3.9}}
//! ```
//!
//! The mirror is best-effort. Local CSV files stay authoritative, and after
//! `error_budget` consecutive failed calls the mirror goes offline for the rest
//! of the session.

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::sample::{round3, Sample, REMOTE_TIMESTAMP_FORMAT};
use crate::store::StatusBoard;
use crate::sync::Header;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hierarchical key-value store the mirror writes to.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Highest numeric child key under `path`, `None` if there are none.
    async fn max_key(&self, path: &str) -> Result<Option<u64>, RemoteError>;

    /// Write `value` at `path`, replacing what was there.
    async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError>;
}

/// Whether remote mirroring is available.
#[derive(Clone, Default)]
pub enum RemoteCapability {
    /// Configuration not read yet
    #[default]
    Uninitialized,
    /// A store is configured and its credentials parsed
    Ready(Arc<dyn RemoteStore>),
    /// Mirroring is off for the given reason
    Disabled(String),
}

impl fmt::Debug for RemoteCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCapability::Uninitialized => write!(f, "Uninitialized"),
            RemoteCapability::Ready(_) => write!(f, "Ready"),
            RemoteCapability::Disabled(reason) => f.debug_tuple("Disabled").field(reason).finish(),
        }
    }
}

impl RemoteCapability {
    /// Resolve the capability from configuration.
    ///
    /// A missing database URL disables mirroring quietly; unusable
    /// credentials disable it with the reason in the status line.
    pub fn from_config(config: &RemoteConfig) -> Self {
        let Some(url) = config
            .database_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            info!("Remote mirror not configured; writing local files only");
            return RemoteCapability::Disabled("not configured".to_string());
        };

        match build_store(url, config) {
            Ok(store) => {
                info!(url, "Remote mirror ready");
                RemoteCapability::Ready(store)
            }
            Err(e) => {
                warn!(error = %e, "Remote mirror disabled");
                RemoteCapability::Disabled(e.to_string())
            }
        }
    }

    /// Status text before any remote call is made.
    pub fn status(&self) -> String {
        match self {
            RemoteCapability::Uninitialized => "uninitialized".to_string(),
            RemoteCapability::Ready(_) => "ready".to_string(),
            RemoteCapability::Disabled(reason) => format!("disabled ({reason})"),
        }
    }
}

#[cfg(feature = "remote_firebase")]
fn build_store(url: &str, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    let auth = firebase::load_credentials(config)?;
    let store = firebase::FirebaseStore::new(
        url,
        auth,
        std::time::Duration::from_millis(config.request_timeout_ms),
    )?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "remote_firebase"))]
fn build_store(_url: &str, _config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    Err(RemoteError::FeatureDisabled)
}

/// How requests authenticate against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirebaseAuth {
    /// Legacy database secret, sent as `auth=`
    DatabaseSecret(String),
    /// OAuth2 access token, sent as `access_token=`
    AccessToken(String),
}

#[derive(Debug, Deserialize)]
struct CredentialFile {
    database_secret: Option<String>,
    access_token: Option<String>,
}

/// Parse a credential JSON document.
pub fn parse_credentials(raw: &[u8]) -> Result<FirebaseAuth, RemoteError> {
    let file: CredentialFile =
        serde_json::from_slice(raw).map_err(|e| RemoteError::Credentials(e.to_string()))?;
    let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());

    if let Some(secret) = non_empty(file.database_secret) {
        Ok(FirebaseAuth::DatabaseSecret(secret))
    } else if let Some(token) = non_empty(file.access_token) {
        Ok(FirebaseAuth::AccessToken(token))
    } else {
        Err(RemoteError::Credentials(
            "expected a database_secret or access_token field".to_string(),
        ))
    }
}

/// Make a string safe as a single database key.
///
/// Firebase keys may not contain `.`, `$`, `#`, `[`, `]` or `/`.
pub fn encode_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '$' | '#' | '[' | ']' | '/' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Leaf record for one board's sample.
///
/// `readings` holds the header columns owned by the sample's board, keyed by
/// column name without the board prefix.
pub fn payload(sample: &Sample, header: &Header) -> Value {
    let readings: Map<String, Value> = header
        .columns()
        .iter()
        .filter(|column| column.board == sample.board_id && !column.is_battery())
        .filter_map(|column| {
            sample
                .value_for(column)
                .map(|v| (encode_key(&column.short_name()), json!(round3(v))))
        })
        .collect();

    let mut record = json!({
        "timestamp": sample.captured_at.format(REMOTE_TIMESTAMP_FORMAT).to_string(),
        "readings": readings,
    });
    if let Some(battery) = sample.battery {
        record["battery"] = json!({
            "percent": round3(battery.percent),
            "volts": round3(battery.volts),
        });
    }
    record
}

/// Highest numeric key of a shallow listing (object) or array snapshot.
pub fn max_numeric_key(value: &Value) -> Option<u64> {
    match value {
        Value::Object(map) => map.keys().filter_map(|k| k.parse::<u64>().ok()).max(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .rev()
            .find(|(_, v)| !v.is_null())
            .map(|(i, _)| i as u64),
        _ => None,
    }
}

/// Per-session mirror state: sequence counters and the error budget.
///
/// Shared by the session's writers; one instance per session so a new
/// session starts online again.
pub struct RemoteMirror {
    capability: RemoteCapability,
    base_path: String,
    error_budget: u32,
    consecutive_failures: u32,
    offline_reason: Option<String>,
    sequences: BTreeMap<String, u64>,
    status: Arc<StatusBoard>,
}

impl fmt::Debug for RemoteMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMirror")
            .field("capability", &self.capability)
            .field("base_path", &self.base_path)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("offline_reason", &self.offline_reason)
            .field("sequences", &self.sequences)
            .finish()
    }
}

impl RemoteMirror {
    /// Mirror writing under `base_path` (`<stage>/<substance>/<test_id>`).
    pub fn new(
        capability: RemoteCapability,
        base_path: impl Into<String>,
        error_budget: u32,
        status: Arc<StatusBoard>,
    ) -> Self {
        status.set_remote(capability.status());
        Self {
            capability,
            base_path: base_path.into(),
            error_budget: error_budget.max(1),
            consecutive_failures: 0,
            offline_reason: None,
            sequences: BTreeMap::new(),
            status,
        }
    }

    /// True once the error budget is spent.
    pub fn is_offline(&self) -> bool {
        self.offline_reason.is_some()
    }

    /// Sequence number the next write for `board` will use.
    pub fn next_sequence(&self, board: &str) -> u64 {
        self.sequences.get(board).copied().unwrap_or(1)
    }

    fn readings_path(&self, board: &str) -> String {
        format!("{}/{}/readings", self.base_path, encode_key(board))
    }

    fn active_store(&self) -> Option<Arc<dyn RemoteStore>> {
        match (&self.capability, &self.offline_reason) {
            (RemoteCapability::Ready(store), None) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    /// Prime each board's counter from the highest key already stored.
    ///
    /// Boards whose listing fails start at 1; the failure counts against the
    /// error budget.
    pub async fn prime(&mut self, boards: &[String]) {
        for board in boards {
            if self.sequences.contains_key(board) {
                continue;
            }
            let next = match self.active_store() {
                Some(store) => {
                    let path = self.readings_path(board);
                    match store.max_key(&path).await {
                        Ok(max) => {
                            self.record_success();
                            max.map_or(1, |k| k.saturating_add(1))
                        }
                        Err(e) => {
                            self.record_failure(&e);
                            1
                        }
                    }
                }
                None => 1,
            };
            debug!(board = %board, seq = next, "Remote sequence primed");
            self.sequences.insert(board.clone(), next);
        }
    }

    /// Write one board's sample under its next sequence number.
    ///
    /// The counter advances whether or not the write succeeds.
    pub async fn mirror(&mut self, sample: &Sample, header: &Header) {
        let Some(store) = self.active_store() else {
            return;
        };

        let board = sample.board_id.as_str();
        let seq = self.next_sequence(board);
        self.sequences.insert(board.to_string(), seq + 1);

        let path = format!("{}/{}", self.readings_path(board), seq);
        match store.put(&path, &payload(sample, header)).await {
            Ok(()) => {
                debug!(board, seq, "Remote write ok");
                self.record_success();
            }
            Err(e) => self.record_failure(&e),
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.status.set_remote("online");
    }

    fn record_failure(&mut self, error: &RemoteError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.error_budget {
            warn!(
                error = %error,
                failures = self.consecutive_failures,
                "Remote mirror offline for the rest of the session"
            );
            self.status.set_remote(format!("offline ({error})"));
            self.offline_reason = Some(error.to_string());
        } else {
            warn!(error = %error, failures = self.consecutive_failures, "Remote write failed");
            self.status.set_remote(format!(
                "degraded ({}/{} failures: {error})",
                self.consecutive_failures, self.error_budget
            ));
        }
    }
}

#[cfg(feature = "remote_firebase")]
mod firebase {
    use super::{max_numeric_key, parse_credentials, FirebaseAuth, RemoteStore};
    use crate::config::RemoteConfig;
    use crate::error::RemoteError;
    use async_trait::async_trait;
    use base64::Engine;
    use serde_json::Value;
    use std::time::Duration;

    /// Read credentials from the base64 blob or, failing that, the file.
    pub(super) fn load_credentials(
        config: &RemoteConfig,
    ) -> Result<Option<FirebaseAuth>, RemoteError> {
        let raw = if let Some(blob) = config.credentials_base64.as_deref().map(str::trim) {
            base64::engine::general_purpose::STANDARD
                .decode(blob)
                .map_err(|e| RemoteError::Credentials(format!("invalid base64: {e}")))?
        } else if let Some(path) = &config.credentials_path {
            std::fs::read(path).map_err(|e| {
                RemoteError::Credentials(format!("cannot read {}: {e}", path.display()))
            })?
        } else {
            return Ok(None);
        };
        parse_credentials(&raw).map(Some)
    }

    /// Realtime Database REST client.
    pub(super) struct FirebaseStore {
        client: reqwest::Client,
        base_url: String,
        auth: Option<FirebaseAuth>,
    }

    impl FirebaseStore {
        pub(super) fn new(
            base_url: &str,
            auth: Option<FirebaseAuth>,
            timeout: Duration,
        ) -> Result<Self, RemoteError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| RemoteError::Network(e.to_string()))?;
            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                auth,
            })
        }

        fn url(&self, path: &str) -> String {
            format!("{}/{}.json", self.base_url, path.trim_matches('/'))
        }

        fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
            match &self.auth {
                Some(FirebaseAuth::DatabaseSecret(secret)) => request.query(&[("auth", secret)]),
                Some(FirebaseAuth::AccessToken(token)) => request.query(&[("access_token", token)]),
                None => request,
            }
        }

        async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
            let response = self
                .authorize(request)
                .send()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RemoteError::Http(status.as_u16(), error_message(&body)));
            }
            Ok(response)
        }
    }

    /// Firebase wraps errors as `{"error": "..."}`.
    fn error_message(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string())
    }

    #[async_trait]
    impl RemoteStore for FirebaseStore {
        async fn max_key(&self, path: &str) -> Result<Option<u64>, RemoteError> {
            let request = self.client.get(self.url(path)).query(&[("shallow", "true")]);
            let body: Value = self
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| RemoteError::Parse(e.to_string()))?;
            Ok(max_numeric_key(&body))
        }

        async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
            let request = self.client.put(self.url(path)).json(value);
            self.send(request).await.map(|_| ())
        }
    }
}
