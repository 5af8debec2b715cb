use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UdpSocket;

use crate::config::UdpPeer;
use crate::iot::ThingManager;
use crate::util::lock;

/// Snapshots pushed by the IoT process.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IotMessage {
    Descriptors { descriptors: Value },
    States { states: Value },
}

/// [`ThingManager`] backed by the IoT process over local UDP.
pub struct IotBridge {
    socket: UdpSocket,
    target_addr: SocketAddr,
    buffer_size: usize,
    descriptors: Mutex<String>,
    states: Mutex<String>,
}

impl IotBridge {
    pub async fn new(peer: &UdpPeer) -> Result<Self> {
        let socket = UdpSocket::bind(peer.local_addr())
            .await
            .with_context(|| format!("Failed to bind IoT socket {}", peer.local_addr()))?;
        let target_addr = peer
            .remote_addr()
            .parse()
            .with_context(|| format!("Invalid IoT address {}", peer.remote_addr()))?;

        Ok(Self {
            socket,
            target_addr,
            buffer_size: peer.buffer_size,
            descriptors: Mutex::new("[]".to_string()),
            states: Mutex::new("[]".to_string()),
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
            match serde_json::from_slice::<IotMessage>(&buf[..len]) {
                Ok(IotMessage::Descriptors { descriptors }) => {
                    log::info!("IoT descriptors updated");
                    *lock(&self.descriptors) = descriptors.to_string();
                }
                Ok(IotMessage::States { states }) => {
                    log::debug!("IoT states updated: {}", states);
                    *lock(&self.states) = states.to_string();
                }
                Err(e) => log::warn!(
                    "Ignoring IoT message: {}, data: {}",
                    e,
                    String::from_utf8_lossy(&buf[..len])
                ),
            }
        }
    }
}

impl ThingManager for IotBridge {
    fn descriptors_json(&self) -> String {
        lock(&self.descriptors).clone()
    }

    fn states_json(&self) -> String {
        lock(&self.states).clone()
    }

    fn invoke(&self, command: &Value) {
        log::info!("Processing IoT Command: {}", command);
        let message = json!({"type": "iot", "command": command}).to_string();
        if let Err(e) = self.socket.try_send_to(message.as_bytes(), self.target_addr) {
            log::warn!("Failed to send to IoT: {}", e);
        }
    }
}
