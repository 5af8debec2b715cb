//! Firmware update check and staged download.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::application::AppContext;
use crate::state_machine::DeviceState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub current_version: String,
    pub firmware_version: String,
    pub firmware_url: String,
}

impl VersionInfo {
    pub fn has_new_version(&self) -> bool {
        !self.firmware_url.is_empty() && is_newer(&self.current_version, &self.firmware_version)
    }
}

/// Dotted numeric comparison, "1.10.0" > "1.9.3". Non-numeric parts count as 0.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    let parts = |v: &str| -> Vec<u32> {
        v.trim()
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    parts(candidate) > parts(current)
}

#[async_trait]
pub trait UpgradeService: Send + Sync {
    async fn check_version(&self) -> Result<VersionInfo>;

    /// Download and stage the firmware at `url`. `progress` receives the
    /// percentage and the bytes/s over the last report window.
    async fn upgrade(&self, url: &str, progress: &(dyn Fn(u32, u64) + Send + Sync)) -> Result<()>;

    fn mark_current_version_valid(&self) {}
}

#[derive(Debug, Clone)]
pub struct HttpUpgradeConfig {
    pub url: String,
    pub device_id: String,
    pub client_id: String,
    pub app_name: String,
    pub app_version: String,
    pub board_type: String,
    pub board_name: String,
    /// Downloaded image lands here; a `.part` file is used while in flight
    pub staging_path: PathBuf,
}

#[derive(Deserialize)]
struct VersionResponse {
    firmware: Option<Firmware>,
}

#[derive(Deserialize)]
struct Firmware {
    version: String,
    #[serde(default)]
    url: String,
}

fn parse_version_response(current_version: &str, body: Value) -> Result<VersionInfo> {
    let response: VersionResponse =
        serde_json::from_value(body).context("Invalid version response")?;
    let firmware = response
        .firmware
        .ok_or_else(|| anyhow!("Missing firmware section"))?;
    Ok(VersionInfo {
        current_version: current_version.to_string(),
        firmware_version: firmware.version,
        firmware_url: firmware.url,
    })
}

pub struct HttpUpgradeService {
    client: Client,
    config: HttpUpgradeConfig,
}

impl HttpUpgradeService {
    pub fn new(config: HttpUpgradeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn request_body(&self) -> Value {
        json!({
            "uuid": self.config.client_id,
            "application": {
                "name": self.config.app_name,
                "version": self.config.app_version
            },
            "ota": {},
            "board": {
                "type": self.config.board_type,
                "name": self.config.board_name
            }
        })
    }
}

#[async_trait]
impl UpgradeService for HttpUpgradeService {
    async fn check_version(&self) -> Result<VersionInfo> {
        log::info!("Checking version via HTTP: {}", self.config.url);
        let response = self
            .client
            .post(&self.config.url)
            .header("Device-Id", &self.config.device_id)
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                format!("{}/{}", self.config.board_type, self.config.app_version),
            )
            .header("Accept-Language", "zh-CN")
            .json(&self.request_body())
            .send()
            .await
            .context("Request failed")?
            .error_for_status()?;

        let body: Value = response.json().await.context("JSON parse error")?;
        parse_version_response(&self.config.app_version, body)
    }

    async fn upgrade(&self, url: &str, progress: &(dyn Fn(u32, u64) + Send + Sync)) -> Result<()> {
        log::info!("Downloading firmware from {}", url);
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let total = response
            .content_length()
            .filter(|&len| len > 0)
            .ok_or_else(|| anyhow!("Missing content length"))?;

        let partial = self.config.staging_path.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;

        let mut received = 0u64;
        let mut window = 0u64;
        let mut window_start = Instant::now();
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            window += chunk.len() as u64;

            // 每秒报告一次进度
            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) || received >= total {
                let percent = (received.min(total) * 100 / total) as u32;
                let speed = (window as f64 / elapsed.as_secs_f64().max(0.001)) as u64;
                progress(percent, speed);
                window = 0;
                window_start = Instant::now();
            }
        }
        file.flush().await?;

        if received != total {
            bail!("Firmware truncated: {} of {} bytes", received, total);
        }
        tokio::fs::rename(&partial, &self.config.staging_path).await?;
        log::info!("Firmware staged at {}", self.config.staging_path.display());
        Ok(())
    }

    fn mark_current_version_valid(&self) {
        log::info!("Running version {} marked valid", self.config.app_version);
    }
}

#[derive(Debug, Clone)]
pub struct OtaOptions {
    /// Delay between failed version checks
    pub retry_interval: Duration,
    /// Poll period while waiting for the device to go idle
    pub idle_poll_interval: Duration,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(3),
        }
    }
}

/// Check for new firmware and install it once the device is idle.
///
/// A successful upgrade leaves the device in `Upgrading` until restart.
pub async fn check_new_version(
    ctx: Arc<AppContext>,
    service: Arc<dyn UpgradeService>,
    options: OtaOptions,
) {
    let info = loop {
        match service.check_version().await {
            Ok(info) => break info,
            Err(e) => {
                log::warn!("Check version failed: {:#}, retrying", e);
                tokio::time::sleep(options.retry_interval).await;
            }
        }
    };

    if !info.has_new_version() {
        service.mark_current_version_valid();
        ctx.display()
            .show_notification(&format!("版本 {}", info.current_version));
        return;
    }
    log::info!(
        "New firmware {} (running {})",
        info.firmware_version,
        info.current_version
    );

    // 等待设备状态空闲
    loop {
        tokio::time::sleep(options.idle_poll_interval).await;
        if ctx.device_state() != DeviceState::Idle {
            continue;
        }
        let (tx, rx) = oneshot::channel();
        let version = info.firmware_version.clone();
        ctx.schedule(move |app| {
            let _ = tx.send(app.begin_upgrade(&version));
        });
        match rx.await {
            Ok(true) => break,
            Ok(false) => continue,
            Err(_) => return,
        }
    }

    let display = ctx.display().clone();
    let report = move |percent: u32, speed: u64| {
        display.set_status(&format!("{}% {}KB/s", percent, speed / 1024));
    };
    match service.upgrade(&info.firmware_url, &report).await {
        Ok(()) => log::info!("Firmware upgrade done, waiting for restart"),
        Err(e) => {
            log::error!("Firmware upgrade failed: {:#}", e);
            ctx.schedule(|app| app.set_device_state(DeviceState::Idle));
        }
    }
}
