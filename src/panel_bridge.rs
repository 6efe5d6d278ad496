use crate::config::Config;
use crate::events::{ControlCommand, SessionEvent};
use crate::indicator::{Indicator, IndicatorStatus};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Commands the panel process may send, one JSON object per datagram.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum PanelMessage {
    Call { target: String },
    Hangup,
    Record { path: PathBuf },
    RecordOff,
}

pub fn parse_control(msg: &str) -> Option<ControlCommand> {
    let msg: PanelMessage = serde_json::from_str(msg).ok()?;
    match msg {
        PanelMessage::Call { target } if !target.trim().is_empty() => {
            Some(ControlCommand::Call(target.trim().to_string()))
        }
        PanelMessage::Call { .. } => None,
        PanelMessage::Hangup => Some(ControlCommand::HangUp),
        PanelMessage::Record { path } => Some(ControlCommand::Record(path)),
        PanelMessage::RecordOff => Some(ControlCommand::RecordOff),
    }
}

/// LED/status panel process bridge.
///
/// The panel and the core talk over local UDP: status updates go out,
/// control commands (directed calls, recording) come in.
pub struct PanelBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<SessionEvent>,
    buffer_size: usize,
}

impl PanelBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<SessionEvent>) -> anyhow::Result<Self> {
        let socket =
            UdpSocket::bind(format!("{}:{}", config.panel_local_ip, config.panel_local_port))
                .await?;
        let target_addr = format!("{}:{}", config.panel_remote_ip, config.panel_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
            buffer_size: config.panel_buffer_size,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_control(msg) {
                Some(cmd) => {
                    if let Err(e) = self.tx.send(SessionEvent::Control(cmd)).await {
                        log::error!("Failed to forward panel command: {}", e);
                        break;
                    }
                }
                None => log::warn!("Ignoring panel message: {}", msg.trim()),
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket
            .send_to(msg.as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Indicator for PanelBridge {
    async fn set_status(&self, status: IndicatorStatus) {
        let msg = format!(r#"{{"type":"status","status":"{}"}}"#, status.as_str());
        if let Err(e) = self.send_message(&msg).await {
            log::warn!("Failed to update indicator to {}: {}", status.as_str(), e);
        }
    }
}
