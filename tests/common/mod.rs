//! Shared fixtures for the capture integration tests: scripted serial ports,
//! an in-memory remote store and a fast test configuration.

#![allow(dead_code)]

use async_trait::async_trait;
use enose_capture::board::{DynSerial, PortOpener};
use enose_capture::config::AppConfig;
use enose_capture::error::{AppResult, CaptureError, RemoteError};
use enose_capture::storage::RemoteStore;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Configuration with short timeouts writing under `dir`.
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.capture.output_dir = dir.to_path_buf();
    config.capture.header_wait_secs = 3.0;
    config.capture.read_timeout_ms = 50;
    config.capture.join_timeout_ms = 500;
    config.capture.watcher_poll_ms = 20;
    config.capture.read_backoff_ms = 20;
    config.families.standard.settle_ms = 0;
    config.families.libelium.settle_ms = 0;
    config
}

/// Lines a fake board sends: each block once, the last block forever.
#[derive(Debug, Clone)]
pub struct Script {
    blocks: Vec<Vec<String>>,
    period: Duration,
}

impl Script {
    /// Send `lines` every `period`.
    pub fn repeating(lines: &[&str], period: Duration) -> Self {
        Self::sequence(&[lines], period)
    }

    /// Send each block in turn every `period`, then keep repeating the last.
    pub fn sequence(blocks: &[&[&str]], period: Duration) -> Self {
        Self {
            blocks: blocks
                .iter()
                .map(|b| b.iter().map(|l| l.to_string()).collect())
                .collect(),
            period,
        }
    }
}

/// Hands out in-memory duplex streams fed by a [`Script`].
///
/// Ports without a script fail to open like a missing device; ports marked
/// with [`ScriptedOpener::block`] stall their worker thread inside the open,
/// like a driver call stuck in the OS, before opening normally.
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: Mutex<HashMap<String, Script>>,
    blocking: Mutex<HashMap<String, Duration>>,
    opened: Mutex<Vec<(String, u32)>>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, port: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(port.to_string(), script);
        self
    }

    pub fn block(self, port: &str, duration: Duration) -> Self {
        self.blocking.lock().unwrap().insert(port.to_string(), duration);
        self
    }

    /// `(port, baud_rate)` of every successful open.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial> {
        let blocked_for = self.blocking.lock().unwrap().get(port).copied();
        if let Some(duration) = blocked_for {
            // not cancellable by the stop signal
            std::thread::sleep(duration);
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(port)
            .cloned()
            .ok_or_else(|| CaptureError::Serial(format!("{port}: No such file or directory")))?;
        self.opened.lock().unwrap().push((port.to_string(), baud_rate));

        let (client, mut device) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut index = 0;
            loop {
                let block = &script.blocks[index.min(script.blocks.len() - 1)];
                let mut text = block.join("\r\n");
                text.push_str("\r\n");
                // fails once the reader has dropped its end
                if device.write_all(text.as_bytes()).await.is_err() {
                    return;
                }
                index += 1;
                tokio::time::sleep(script.period).await;
            }
        });
        Ok(Box::new(client))
    }
}

/// In-memory remote store recording every call.
#[derive(Default)]
pub struct RecordingStore {
    pub fail: bool,
    pub existing_max: Option<u64>,
    calls: Mutex<Vec<String>>,
    writes: Mutex<Vec<(String, Value)>>,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_existing(max: u64) -> Self {
        Self {
            existing_max: Some(max),
            ..Default::default()
        }
    }

    /// `"GET <path>"` / `"PUT <path>"` in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Successful writes in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for RecordingStore {
    async fn max_key(&self, path: &str) -> Result<Option<u64>, RemoteError> {
        self.calls.lock().unwrap().push(format!("GET {path}"));
        if self.fail {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(self.existing_max)
    }

    async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(format!("PUT {path}"));
        if self.fail {
            return Err(RemoteError::Http(401, "Permission denied".into()));
        }
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), value.clone()));
        Ok(())
    }
}

/// Poll `condition` every 20 ms until it holds or `within` passes.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
