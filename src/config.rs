use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use mac_address::get_mac_address;
use uuid::Uuid;

use crate::application::AppOptions;
use crate::ota::{HttpUpgradeConfig, OtaOptions};
use crate::protocol::AudioParams;
use crate::websocket_protocol::{DEFAULT_HANDSHAKE_TIMEOUT, WebsocketConfig};

const UNKNOWN_DEVICE: &str = "unknown-device";
const UNKNOWN_CLIENT: &str = "unknown-client";

/// UDP peer of a companion process (GUI or IoT).
#[derive(Debug, Clone)]
pub struct UdpPeer {
    pub local_ip: &'static str,
    pub local_port: u16,
    pub remote_ip: &'static str,
    pub remote_port: u16,
    pub buffer_size: usize,
}

impl UdpPeer {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // 应用和板子信息
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub assets_dir: &'static str,
    pub background_queue_depth: usize,
    pub board_type: &'static str,
    pub board_name: &'static str,

    // 音频设备配置
    #[cfg(feature = "alsa")]
    pub audio: AudioDeviceConfig,

    // GUI进程配置
    pub gui: UdpPeer,
    // IoT进程配置
    pub iot: UdpPeer,

    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub ws_token: &'static str,
    pub client_id_file: &'static str,
    pub handshake_timeout: Duration,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    // Hello消息参数
    pub hello_format: &'static str,
    pub hello_sample_rate: u32,
    pub hello_channels: u8,
    pub hello_frame_duration: u32,

    // OTA
    pub ota_url: &'static str,
    pub ota_staging_path: &'static str,
    pub ota_retry_interval: Duration,
    pub ota_idle_poll: Duration,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            assets_dir: env!("APP_ASSETS_DIR"),
            background_queue_depth: env!("APP_BACKGROUND_QUEUE_DEPTH")
                .parse()
                .context("Failed to parse APP_BACKGROUND_QUEUE_DEPTH")?,
            board_type: env!("BOARD_TYPE"),
            board_name: env!("BOARD_NAME"),

            #[cfg(feature = "alsa")]
            audio: AudioDeviceConfig::from_env()?,

            gui: UdpPeer {
                local_ip: env!("GUI_LOCAL_IP"),
                local_port: env!("GUI_LOCAL_PORT")
                    .parse()
                    .context("Failed to parse GUI_LOCAL_PORT")?,
                remote_ip: env!("GUI_REMOTE_IP"),
                remote_port: env!("GUI_REMOTE_PORT")
                    .parse()
                    .context("Failed to parse GUI_REMOTE_PORT")?,
                buffer_size: env!("GUI_BUFFER_SIZE")
                    .parse()
                    .context("Failed to parse GUI_BUFFER_SIZE")?,
            },
            iot: UdpPeer {
                local_ip: env!("IOT_LOCAL_IP"),
                local_port: env!("IOT_LOCAL_PORT")
                    .parse()
                    .context("Failed to parse IOT_LOCAL_PORT")?,
                remote_ip: env!("IOT_REMOTE_IP"),
                remote_port: env!("IOT_REMOTE_PORT")
                    .parse()
                    .context("Failed to parse IOT_REMOTE_PORT")?,
                buffer_size: env!("IOT_BUFFER_SIZE")
                    .parse()
                    .context("Failed to parse IOT_BUFFER_SIZE")?,
            },

            ws_url: env!("WS_URL"),
            ws_token: env!("WS_TOKEN"),
            client_id_file: env!("CLIENT_ID_FILE"),
            handshake_timeout: match env!("HANDSHAKE_TIMEOUT_MS")
                .parse::<u64>()
                .context("Failed to parse HANDSHAKE_TIMEOUT_MS")?
            {
                0 => DEFAULT_HANDSHAKE_TIMEOUT,
                ms => Duration::from_millis(ms),
            },

            // 设备标识初始化为config.toml中的值
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            hello_format: env!("HELLO_FORMAT"),
            hello_sample_rate: env!("HELLO_SAMPLE_RATE")
                .parse()
                .context("Failed to parse HELLO_SAMPLE_RATE")?,
            hello_channels: env!("HELLO_CHANNELS")
                .parse()
                .context("Failed to parse HELLO_CHANNELS")?,
            hello_frame_duration: env!("HELLO_FRAME_DURATION")
                .parse()
                .context("Failed to parse HELLO_FRAME_DURATION")?,

            ota_url: env!("OTA_URL"),
            ota_staging_path: env!("OTA_STAGING_PATH"),
            ota_retry_interval: Duration::from_secs(
                env!("OTA_RETRY_INTERVAL_SECS")
                    .parse()
                    .context("Failed to parse OTA_RETRY_INTERVAL_SECS")?,
            ),
            ota_idle_poll: Duration::from_secs(
                env!("OTA_IDLE_POLL_SECS")
                    .parse()
                    .context("Failed to parse OTA_IDLE_POLL_SECS")?,
            ),
        })
    }

    /// Fill in placeholder identities: device id from the MAC address (or a
    /// random UUID), client id from `client_id_file`.
    pub fn resolve_identity(&mut self) {
        if self.device_id == UNKNOWN_DEVICE {
            self.device_id = match get_mac_address() {
                Ok(Some(mac)) => mac.to_string().to_lowercase(),
                _ => Uuid::new_v4().to_string(),
            };
        }
        if self.client_id == UNKNOWN_CLIENT {
            self.client_id = load_or_create_client_id(Path::new(self.client_id_file));
        }
        log::info!("Device ID: {}, Client ID: {}", self.device_id, self.client_id);
    }

    pub fn audio_params(&self) -> AudioParams {
        AudioParams {
            format: self.hello_format.to_string(),
            sample_rate: self.hello_sample_rate,
            channels: self.hello_channels,
            frame_duration: self.hello_frame_duration,
        }
    }

    pub fn websocket_config(&self) -> WebsocketConfig {
        WebsocketConfig {
            url: self.ws_url.to_string(),
            token: self.ws_token.to_string(),
            device_id: self.device_id.clone(),
            client_id: self.client_id.clone(),
            audio_params: self.audio_params(),
            handshake_timeout: self.handshake_timeout,
        }
    }

    pub fn app_options(&self) -> AppOptions {
        AppOptions {
            frame_duration_ms: self.hello_frame_duration,
            assets_dir: Some(PathBuf::from(self.assets_dir)),
            background_queue_depth: self.background_queue_depth,
        }
    }

    pub fn upgrade_config(&self) -> HttpUpgradeConfig {
        HttpUpgradeConfig {
            url: self.ota_url.to_string(),
            device_id: self.device_id.clone(),
            client_id: self.client_id.clone(),
            app_name: self.app_name.to_string(),
            app_version: self.app_version.to_string(),
            board_type: self.board_type.to_string(),
            board_name: self.board_name.to_string(),
            staging_path: PathBuf::from(self.ota_staging_path),
        }
    }

    pub fn ota_options(&self) -> OtaOptions {
        OtaOptions {
            retry_interval: self.ota_retry_interval,
            idle_poll_interval: self.ota_idle_poll,
        }
    }

    #[cfg(feature = "alsa")]
    pub fn alsa_config(&self) -> crate::audio::AlsaConfig {
        let audio = &self.audio;
        crate::audio::AlsaConfig {
            capture_device: audio.capture_device.to_string(),
            playback_device: audio.playback_device.to_string(),
            input_sample_rate: audio.input_sample_rate,
            input_channels: audio.input_channels,
            input_reference: audio.input_reference,
            output_sample_rate: audio.output_sample_rate,
            output_channels: audio.output_channels,
            frame_duration_ms: self.hello_frame_duration,
        }
    }
}

/// `[audio]` section, only read by the ALSA backend.
#[cfg(feature = "alsa")]
#[derive(Debug, Clone)]
pub struct AudioDeviceConfig {
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_sample_rate: u32,
    pub input_channels: u32,
    pub input_reference: bool,
    pub output_sample_rate: u32,
    pub output_channels: u32,
}

#[cfg(feature = "alsa")]
impl AudioDeviceConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            input_sample_rate: env!("AUDIO_INPUT_SAMPLE_RATE")
                .parse()
                .context("Failed to parse AUDIO_INPUT_SAMPLE_RATE")?,
            input_channels: env!("AUDIO_INPUT_CHANNELS")
                .parse()
                .context("Failed to parse AUDIO_INPUT_CHANNELS")?,
            input_reference: env!("AUDIO_INPUT_REFERENCE")
                .parse()
                .context("Failed to parse AUDIO_INPUT_REFERENCE")?,
            output_sample_rate: env!("AUDIO_OUTPUT_SAMPLE_RATE")
                .parse()
                .context("Failed to parse AUDIO_OUTPUT_SAMPLE_RATE")?,
            output_channels: env!("AUDIO_OUTPUT_CHANNELS")
                .parse()
                .context("Failed to parse AUDIO_OUTPUT_CHANNELS")?,
        })
    }
}

/// 设备端UUID，先从本地文件读取以保持重启间身份一致，如果不存在则生成新的并保存
fn load_or_create_client_id(path: &Path) -> String {
    if let Ok(content) = std::fs::read_to_string(path) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            log::info!("Loaded Client ID from {}", path.display());
            return trimmed.to_string();
        }
    }

    let client_id = Uuid::new_v4().to_string();
    match std::fs::write(path, &client_id) {
        Ok(()) => log::info!("Saved new Client ID to {}", path.display()),
        Err(e) => log::warn!("Failed to save Client ID to {}: {}", path.display(), e),
    }
    client_id
}
