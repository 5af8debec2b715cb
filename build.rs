use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    audio: Audio,
    gui: Udp,
    iot: Udp,
    network: Network,
    hello_message: HelloMessage,
    ota: Ota,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
    assets_dir: String,
    background_queue_depth: usize,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    input_channels: u32,
    input_reference: bool,
    output_sample_rate: u32,
    output_channels: u32,
}

// GUI 和 IoT 进程共用同一种 UDP 配置
#[derive(Deserialize)]
struct Udp {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    client_id_file: String,
    handshake_timeout_ms: u64,
}

#[derive(Deserialize)]
struct HelloMessage {
    format: String,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
}

#[derive(Deserialize)]
struct Ota {
    url: String,
    staging_path: String,
    retry_interval_secs: u64,
    idle_poll_secs: u64,
}

fn export_udp(prefix: &str, udp: &Udp) {
    println!("cargo:rustc-env={}_LOCAL_PORT={}", prefix, udp.local_port);
    println!("cargo:rustc-env={}_REMOTE_PORT={}", prefix, udp.remote_port);
    println!("cargo:rustc-env={}_LOCAL_IP={}", prefix, udp.local_ip);
    println!("cargo:rustc-env={}_REMOTE_IP={}", prefix, udp.remote_ip);
    println!("cargo:rustc-env={}_BUFFER_SIZE={}", prefix, udp.buffer_size);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=APP_ASSETS_DIR={}", config.application.assets_dir);
    println!(
        "cargo:rustc-env=APP_BACKGROUND_QUEUE_DEPTH={}",
        config.application.background_queue_depth
    );
    println!("cargo:rustc-env=BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=BOARD_NAME={}", config.board.name);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=AUDIO_INPUT_CHANNELS={}", config.audio.input_channels);
    println!("cargo:rustc-env=AUDIO_INPUT_REFERENCE={}", config.audio.input_reference);
    println!("cargo:rustc-env=AUDIO_OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=AUDIO_OUTPUT_CHANNELS={}", config.audio.output_channels);

    // GUI / IoT 配置
    export_udp("GUI", &config.gui);
    export_udp("IOT", &config.iot);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);
    println!("cargo:rustc-env=CLIENT_ID_FILE={}", config.network.client_id_file);
    println!(
        "cargo:rustc-env=HANDSHAKE_TIMEOUT_MS={}",
        config.network.handshake_timeout_ms
    );

    // Hello 消息配置
    println!("cargo:rustc-env=HELLO_FORMAT={}", config.hello_message.format);
    println!("cargo:rustc-env=HELLO_SAMPLE_RATE={}", config.hello_message.sample_rate);
    println!("cargo:rustc-env=HELLO_CHANNELS={}", config.hello_message.channels);
    println!("cargo:rustc-env=HELLO_FRAME_DURATION={}", config.hello_message.frame_duration);

    // OTA 配置
    println!("cargo:rustc-env=OTA_URL={}", config.ota.url);
    println!("cargo:rustc-env=OTA_STAGING_PATH={}", config.ota.staging_path);
    println!("cargo:rustc-env=OTA_RETRY_INTERVAL_SECS={}", config.ota.retry_interval_secs);
    println!("cargo:rustc-env=OTA_IDLE_POLL_SECS={}", config.ota.idle_poll_secs);
}
