use crate::config::Config;
use crate::events::{Gesture, SessionEvent};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[derive(Deserialize)]
struct GestureMessage {
    gesture: String,
}

/// Accepts either a bare gesture name or `{"gesture":"short_press"}`.
pub fn parse_gesture(msg: &str) -> Option<Gesture> {
    let msg = msg.trim();
    if msg.starts_with('{') {
        let parsed: GestureMessage = serde_json::from_str(msg).ok()?;
        return Gesture::parse(&parsed.gesture);
    }
    Gesture::parse(msg)
}

/// Receives classified gestures from the GPIO button process.
///
/// Press timing (long press threshold, multi-press window) is classified on
/// the other side; every datagram is one finished gesture.
pub struct ButtonBridge {
    socket: UdpSocket,
    tx: mpsc::Sender<SessionEvent>,
    buffer_size: usize,
}

impl ButtonBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<SessionEvent>) -> anyhow::Result<Self> {
        let socket =
            UdpSocket::bind(format!("{}:{}", config.button_local_ip, config.button_local_port))
                .await?;

        Ok(Self {
            socket,
            tx,
            buffer_size: config.button_buffer_size,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(msg) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_gesture(msg) {
                Some(gesture) => {
                    log::debug!("Button gesture: {:?}", gesture);
                    if let Err(e) = self.tx.send(SessionEvent::Gesture(gesture)).await {
                        log::error!("Failed to forward button gesture: {}", e);
                        break;
                    }
                }
                None => log::warn!("Unknown button message: {}", msg.trim()),
            }
        }
        Ok(())
    }
}
