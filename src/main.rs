mod application;
mod audio;
mod background_task;
mod board;
mod config;
mod gui_bridge;
mod iot;
mod iot_bridge;
mod main_loop;
mod ota;
mod protocol;
mod state_machine;
#[cfg(test)]
mod testing;
mod util;
mod websocket_protocol;

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use application::Application;
use audio::AudioDevice;
use board::Board;
use config::Config;
use gui_bridge::{GuiBridge, GuiEvent};
use iot_bridge::IotBridge;
use ota::HttpUpgradeService;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use websocket_protocol::WebsocketProtocol;

#[cfg(feature = "alsa")]
fn open_audio_device(config: &Config) -> anyhow::Result<Arc<dyn AudioDevice>> {
    let device = audio::AlsaAudioDevice::open(&config.alsa_config())?;
    Ok(Arc::new(device))
}

#[cfg(not(feature = "alsa"))]
fn open_audio_device(_config: &Config) -> anyhow::Result<Arc<dyn AudioDevice>> {
    anyhow::bail!("No audio backend, build with the alsa feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new()?;
    config.resolve_identity();
    log::info!("{} {} on {}", config.app_name, config.app_version, config.board_name);

    // 启动GUI桥，与GUI进程通信
    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(100);
    let gui_bridge = Arc::new(GuiBridge::new(&config.gui, tx_gui_event).await?);
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {:#}", e);
        }
    });

    // 启动IOT桥，与IOT进程通信
    let iot_bridge = Arc::new(IotBridge::new(&config.iot).await?);
    let iot_bridge_clone = iot_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = iot_bridge_clone.run().await {
            log::error!("IotBridge error: {:#}", e);
        }
    });

    let board = Board {
        audio: open_audio_device(&config)?,
        display: gui_bridge.clone(),
        led: gui_bridge,
        things: iot_bridge,
    };
    let protocol = Arc::new(WebsocketProtocol::new(
        config.websocket_config(),
        Handle::current(),
    ));
    let mut app = Application::new(board, protocol, &config.app_options())?;
    let ctx = app.context();

    // 主循环运行在独立线程，音频处理不占用 tokio 工作线程
    let (started_tx, started_rx) = oneshot::channel();
    let main_loop = thread::Builder::new()
        .name("main_loop".into())
        .spawn(move || match app.start() {
            Ok(()) => {
                let _ = started_tx.send(Ok(()));
                app.run();
            }
            Err(e) => {
                let _ = started_tx.send(Err(e));
            }
        })?;
    started_rx.await.context("Main loop exited during start")??;
    log::info!("Xiaozhi Core Started. State: {}", ctx.device_state());

    tokio::spawn(ota::check_new_version(
        ctx.clone(),
        Arc::new(HttpUpgradeService::new(config.upgrade_config())),
        config.ota_options(),
    ));

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            // 监听来自GUI桥的按键事件
            Some(event) = rx_gui_event.recv() => match event {
                GuiEvent::ToggleChat => ctx.toggle_chat_state(),
                GuiEvent::StartListening => ctx.start_listening(),
                GuiEvent::StopListening => ctx.stop_listening(),
                GuiEvent::Abort => ctx.abort_speaking(),
            },
        }
    }

    ctx.shutdown();
    // 主循环关闭音频通道时仍需要 runtime
    tokio::task::spawn_blocking(move || main_loop.join())
        .await?
        .map_err(|_| anyhow::anyhow!("Main loop panicked"))?;
    Ok(())
}
