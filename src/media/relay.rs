//! WebSocket media relay.
//!
//! One connection per joined room. Outbound binary frames are raw Opus
//! packets of the local track. Inbound binary frames carry a remote
//! participant's packet prefixed with its identity:
//!
//! ```text
//! [u8 identity_len][identity (utf-8)][opus packet]
//! ```
//!
//! Inbound text frames announce presence:
//! `{"type":"participant-joined","identity":"userB"}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{MediaClient, MediaEvent, RemoteFrame};
use crate::audio::{frame, AudioFrame, OpusDecoder, OpusEncoder};
use crate::config::Config;
use crate::events::SessionEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_millis(500);
const OUTBOUND_CAPACITY: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum RoomNotice {
    ParticipantJoined { identity: String },
    ParticipantLeft { identity: String },
}

/// Split an inbound binary frame into the sender identity and its packet.
fn split_remote_packet(data: Bytes) -> Option<(String, Bytes)> {
    let len = *data.first()? as usize;
    if len == 0 || data.len() <= 1 + len {
        return None;
    }
    let identity = std::str::from_utf8(&data[1..1 + len]).ok()?.to_string();
    Some((identity, data.slice(1 + len..)))
}

fn parse_notice(text: &str) -> Option<MediaEvent> {
    match serde_json::from_str::<RoomNotice>(text) {
        Ok(RoomNotice::ParticipantJoined { identity }) => Some(MediaEvent::ParticipantJoined(identity)),
        Ok(RoomNotice::ParticipantLeft { identity }) => Some(MediaEvent::ParticipantLeft(identity)),
        Err(_) => {
            log::debug!("Ignoring relay message: {}", text);
            None
        }
    }
}

struct RoomConnection {
    room_name: String,
    outbound: mpsc::Sender<Message>,
    leaving: Arc<AtomicBool>,
    task: JoinHandle<()>,
    publisher: Option<JoinHandle<()>>,
}

pub struct RelayMediaClient {
    media_url: &'static str,
    device_id: String,
    sample_rate: u32,
    opus_bitrate: i32,
    events: mpsc::Sender<SessionEvent>,
    downlink: broadcast::Sender<RemoteFrame>,
    room: Mutex<Option<RoomConnection>>,
}

impl RelayMediaClient {
    pub fn new(config: &Config, events: mpsc::Sender<SessionEvent>) -> Self {
        let (downlink, _) = broadcast::channel(config.downlink_capacity.max(1));
        Self {
            media_url: config.media_url,
            device_id: config.device_id.clone(),
            sample_rate: config.sample_rate,
            opus_bitrate: config.opus_bitrate,
            events,
            downlink,
            room: Mutex::new(None),
        }
    }

    fn room(&self) -> std::sync::MutexGuard<'_, Option<RoomConnection>> {
        self.room.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect(&self, room_name: &str, token: &str) -> anyhow::Result<RoomConnection> {
        let mut url = Url::parse(self.media_url)?;
        url.query_pairs_mut().append_pair("room", room_name);
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("media url has no host"))?
            .to_string();

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", token))
            .header("Device-Id", &self.device_id)
            .body(())?;

        log::info!("Joining room {} via {}", room_name, self.media_url);
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to media relay"))??;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let leaving = Arc::new(AtomicBool::new(false));
        let room = RoomSocket {
            sample_rate: self.sample_rate,
            events: self.events.clone(),
            downlink: self.downlink.clone(),
            leaving: leaving.clone(),
            decoders: HashMap::new(),
        };
        let task = tokio::spawn(room.run(ws_stream, outbound_rx));

        Ok(RoomConnection {
            room_name: room_name.to_string(),
            outbound,
            leaving,
            task,
            publisher: None,
        })
    }
}

#[async_trait]
impl MediaClient for RelayMediaClient {
    async fn join(&self, room_name: &str, token: &str) -> bool {
        let in_room = self.room().is_some();
        if in_room {
            log::warn!("Already in a room, leaving it before joining {}", room_name);
            self.leave().await;
        }
        match self.connect(room_name, token).await {
            Ok(connection) => {
                *self.room() = Some(connection);
                log::info!("Joined room {}", room_name);
                let _ = self.events.send(SessionEvent::Media(MediaEvent::Connected)).await;
                true
            }
            Err(e) => {
                log::error!("Failed to join room {}: {}", room_name, e);
                false
            }
        }
    }

    async fn leave(&self) {
        let taken = self.room().take();
        let Some(mut connection) = taken else {
            return;
        };
        connection.leaving.store(true, Ordering::SeqCst);
        if let Some(publisher) = connection.publisher.take() {
            publisher.abort();
        }
        let _ = connection.outbound.try_send(Message::Close(None));
        drop(connection.outbound);

        if tokio::time::timeout(CLOSE_GRACE, &mut connection.task).await.is_err() {
            log::warn!("Media relay did not close in time, aborting");
            connection.task.abort();
        }
        log::info!("Left room {}", connection.room_name);
    }

    fn publish(&self, mut frames: mpsc::Receiver<AudioFrame>) -> anyhow::Result<()> {
        let mut guard = self.room();
        let connection = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("cannot publish: not in a room"))?;
        if connection.publisher.is_some() {
            anyhow::bail!("local track already published");
        }

        let mut encoder = OpusEncoder::new(self.sample_rate, 1, self.opus_bitrate)?;
        let outbound = connection.outbound.clone();
        connection.publisher = Some(tokio::spawn(async move {
            let mut dropped: u64 = 0;
            let mut encode_failures: u64 = 0;
            while let Some(frame) = frames.recv().await {
                let packet = match encoder.encode(&frame.samples) {
                    Ok(packet) => packet,
                    Err(e) => {
                        encode_failures += 1;
                        if encode_failures % 50 == 1 {
                            log::warn!(
                                "Opus encode failed for {} frames so far ({} samples at {}Hz): {}",
                                encode_failures,
                                frame.samples.len(),
                                frame.sample_rate,
                                e
                            );
                        }
                        continue;
                    }
                };
                match outbound.try_send(Message::Binary(packet.into())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            log::debug!("Relay busy, {} outbound packets dropped so far", dropped);
                        }
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            log::info!("Local track unpublished");
        }));
        log::info!("Local track published to {}", connection.room_name);
        Ok(())
    }

    fn subscribe(&self) -> anyhow::Result<broadcast::Receiver<RemoteFrame>> {
        if self.room().is_none() {
            anyhow::bail!("cannot subscribe: not in a room");
        }
        Ok(self.downlink.subscribe())
    }
}

/// The reader/writer half of one room connection, run as a task.
struct RoomSocket {
    sample_rate: u32,
    events: mpsc::Sender<SessionEvent>,
    downlink: broadcast::Sender<RemoteFrame>,
    leaving: Arc<AtomicBool>,
    // 每个远端参与者一个解码器
    decoders: HashMap<String, OpusDecoder>,
}

impl RoomSocket {
    async fn run(mut self, ws_stream: WsStream, mut outbound: mpsc::Receiver<Message>) {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => self.on_packet(data),
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_notice(text.as_str()) {
                                let _ = self.events.send(SessionEvent::Media(event)).await;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Media relay closed connection: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Media relay error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                cmd = outbound.recv() => {
                    let Some(msg) = cmd else { break };
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = write.send(msg).await {
                        log::warn!("Media relay send failed: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            }
        }

        if !self.leaving.load(Ordering::SeqCst) {
            log::warn!("Media relay disconnected");
            let _ = self.events.send(SessionEvent::Media(MediaEvent::Disconnected)).await;
        }
    }

    fn on_packet(&mut self, data: Bytes) {
        let Some((identity, packet)) = split_remote_packet(data) else {
            log::debug!("Dropping malformed relay packet");
            return;
        };

        if !self.decoders.contains_key(&identity) {
            match OpusDecoder::new(self.sample_rate, 1) {
                Ok(decoder) => {
                    self.decoders.insert(identity.clone(), decoder);
                }
                Err(e) => {
                    log::error!("Failed to create decoder for {}: {}", identity, e);
                    return;
                }
            }
        }
        let Some(decoder) = self.decoders.get_mut(&identity) else {
            return;
        };

        match decoder.decode(&packet) {
            Ok(pcm) if !pcm.is_empty() => {
                let frame = AudioFrame::new(pcm, self.sample_rate, 1, frame::monotonic_us());
                // 没有订阅者时直接丢弃
                let _ = self.downlink.send(RemoteFrame {
                    participant: identity,
                    frame,
                });
            }
            Ok(_) => {}
            Err(e) => log::debug!("Opus decode error from {}: {}", identity, e),
        }
    }
}
