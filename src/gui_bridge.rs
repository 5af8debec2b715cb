use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::board::{Display, Led};
use crate::config::UdpPeer;
use crate::state_machine::DeviceState;

/// Button presses coming from the GUI process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuiEvent {
    ToggleChat,
    StartListening,
    StopListening,
    Abort,
}

pub struct GuiBridge {
    socket: UdpSocket,
    target_addr: SocketAddr,
    buffer_size: usize,
    tx: mpsc::Sender<GuiEvent>,
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
impl GuiBridge {
    pub async fn new(peer: &UdpPeer, tx: mpsc::Sender<GuiEvent>) -> Result<Self> {
        let socket = UdpSocket::bind(peer.local_addr())
            .await
            .with_context(|| format!("Failed to bind GUI socket {}", peer.local_addr()))?;
        let target_addr = peer
            .remote_addr()
            .parse()
            .with_context(|| format!("Invalid GUI address {}", peer.remote_addr()))?;

        Ok(Self {
            socket,
            target_addr,
            buffer_size: peer.buffer_size,
            tx,
        })
    }

    #[cfg(test)]
    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let event = match serde_json::from_slice::<GuiEvent>(&buf[..len]) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!(
                        "Ignoring GUI message: {}, data: {}",
                        e,
                        String::from_utf8_lossy(&buf[..len])
                    );
                    continue;
                }
            };
            log::debug!("GUI event: {:?}", event);
            if self.tx.send(event).await.is_err() {
                log::info!("GUI event receiver dropped, stopping bridge");
                break;
            }
        }
        Ok(())
    }

    /// Fire-and-forget: called from the main loop, which must not block on
    /// the GUI process.
    fn send_json(&self, message: Value) {
        let text = message.to_string();
        if let Err(e) = self.socket.try_send_to(text.as_bytes(), self.target_addr) {
            log::warn!("Failed to send to GUI: {}", e);
        }
    }
}

impl Display for GuiBridge {
    fn set_status(&self, status: &str) {
        self.send_json(json!({"type": "status", "text": status}));
    }

    fn set_emotion(&self, emotion: &str) {
        self.send_json(json!({"type": "emotion", "emotion": emotion}));
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.send_json(json!({"type": "chat", "role": role, "text": content}));
    }

    fn show_notification(&self, message: &str) {
        self.send_json(json!({"type": "toast", "text": message}));
    }

    fn set_icon(&self, icon: &str) {
        self.send_json(json!({"type": "icon", "icon": icon}));
    }
}

impl Led for GuiBridge {
    fn on_state_changed(&self, state: DeviceState, _voice_detected: bool) {
        self.send_json(json!({"state": state as u8}));
    }
}
