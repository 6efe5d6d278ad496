use crate::config::Config;
use crate::events::{SessionEvent, SignalingEvent};
use crate::protocol::{CallEnded, InboundMessage, IncomingCall, OutboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Outbound half of the signaling channel, as the session manager sees it.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn accept_call(&self, call_id: &str, room_name: &str, token: &str) -> anyhow::Result<()>;
    async fn reject_call(&self, call_id: &str, room_name: &str) -> anyhow::Result<()>;
}

/// Persistent WebSocket to the call backend. Inbound notifications become
/// `SessionEvent::Signaling`; outbound messages arrive from `SignalingHandle`.
pub struct SignalingLink {
    url: &'static str,
    api_token: &'static str,
    user_id: &'static str,
    device_id: String,
    events: mpsc::Sender<SessionEvent>,
    rx_cmd: mpsc::Receiver<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct SignalingHandle {
    tx_cmd: mpsc::Sender<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

pub fn link(config: &Config, events: mpsc::Sender<SessionEvent>) -> (SignalingLink, SignalingHandle) {
    let (tx_cmd, rx_cmd) = mpsc::channel(32);
    let connected = Arc::new(AtomicBool::new(false));
    let link = SignalingLink {
        url: config.signaling_url,
        api_token: config.api_token,
        user_id: config.user_id,
        device_id: config.device_id.clone(),
        events,
        rx_cmd,
        connected: connected.clone(),
    };
    (link, SignalingHandle { tx_cmd, connected })
}

// 指数退避，上限 60 秒
fn next_retry_delay(current: u64) -> u64 {
    std::cmp::min(current * 2, MAX_RETRY_DELAY_SECS)
}

/// Turn a text frame into a session event. Malformed or incomplete
/// notifications are logged and dropped.
pub fn parse_inbound(text: &str) -> Option<SignalingEvent> {
    let msg = match serde_json::from_str::<InboundMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Discarding unparseable signaling message ({}): {}", e, text);
            return None;
        }
    };
    match msg {
        InboundMessage::IncomingCall(payload) => match IncomingCall::try_from(payload) {
            Ok(call) => Some(SignalingEvent::IncomingCall(call)),
            Err(e) => {
                log::warn!("Discarding incoming-call: {}", e);
                None
            }
        },
        InboundMessage::CallEnded(payload) => match CallEnded::try_from(payload) {
            Ok(ended) => Some(SignalingEvent::CallEnded(ended)),
            Err(e) => {
                log::warn!("Discarding call-ended: {}", e);
                None
            }
        },
        InboundMessage::Unknown => {
            log::debug!("Ignoring signaling message: {}", text);
            None
        }
    }
}

impl SignalingLink {
    pub async fn run(mut self) {
        let mut retry_delay = 1;
        loop {
            match self.connect_and_loop().await {
                Ok(()) => {
                    log::info!("Signaling link shut down");
                    break;
                }
                Err(e) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        // 曾经连上过，重置退避
                        retry_delay = 1;
                        if self
                            .events
                            .send(SessionEvent::Signaling(SignalingEvent::Disconnected))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    log::warn!("Signaling error: {}. Retrying in {}s...", e, retry_delay);
                    tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay)).await;
                    retry_delay = next_retry_delay(retry_delay);
                }
            }
        }
    }

    /// Returns `Ok` only when the outbound command channel has closed.
    async fn connect_and_loop(&mut self) -> anyhow::Result<()> {
        let url = Url::parse(self.url)?;
        let host = url.host_str().unwrap_or("localhost");

        let mut builder = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Device-Id", &self.device_id);
        if !self.api_token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_token));
        }
        let request = builder.body(())?;

        log::info!("Connecting to signaling server {}...", self.url);
        let (ws_stream, _) = connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        // 连接后先注册本设备
        let register = OutboundMessage::RegisterUser {
            user_id: self.user_id.to_string(),
            device_type: "device".to_string(),
        };
        write.send(Message::Text(serde_json::to_string(&register)?.into())).await?;

        self.connected.store(true, Ordering::SeqCst);
        log::info!("Signaling connected, registered as {}", self.user_id);
        self.events
            .send(SessionEvent::Signaling(SignalingEvent::Connected))
            .await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_inbound(text.as_str()) {
                                self.events.send(SessionEvent::Signaling(event)).await?;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Signaling server closed connection: {:?}", frame);
                            return Err(anyhow::anyhow!("Connection closed"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(anyhow::anyhow!("Connection closed")),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    let Some(cmd) = cmd else { break };
                    let text = serde_json::to_string(&cmd)?;
                    log::debug!("Signaling send: {}", text);
                    write.send(Message::Text(text.into())).await?;
                }
            }
        }
        let _ = write.send(Message::Close(None)).await;
        Ok(())
    }
}

impl SignalingHandle {
    async fn send(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            anyhow::bail!("signaling channel not connected");
        }
        self.tx_cmd
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("signaling link stopped"))
    }
}

#[async_trait]
impl SignalingChannel for SignalingHandle {
    async fn accept_call(&self, call_id: &str, room_name: &str, token: &str) -> anyhow::Result<()> {
        self.send(OutboundMessage::AcceptCall {
            call_id: call_id.to_string(),
            room_name: room_name.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn reject_call(&self, call_id: &str, room_name: &str) -> anyhow::Result<()> {
        self.send(OutboundMessage::RejectCall {
            call_id: call_id.to_string(),
            room_name: room_name.to_string(),
        })
        .await
    }
}
