//! Call session manager: the one owner of the device's call state.
//!
//! Gestures, signaling notifications, media room events and the results of
//! background setup work all arrive on one `SessionEvent` channel and are
//! applied here one at a time. Long-running work (the initiation request,
//! the room join) is spawned and reports back through the same channel,
//! tagged with the call_id it was started for.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioDevice, AudioLinks};
use crate::call_api::CallInitiator;
use crate::config::Config;
use crate::events::{ControlCommand, Gesture, SessionEvent, SignalingEvent};
use crate::indicator::Indicator;
use crate::media::{MediaClient, MediaEvent};
use crate::protocol::{CallTicket, IncomingCall};
use crate::recording::CallRecording;
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Connected,
    Error,
}

/// The record of the current call. Exists exactly when the state is not Idle.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub room_name: String,
    pub local_party: String,
    pub remote_party: String,
    pub remote_display_name: Option<String>,
    pub state: CallState,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub media_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Another call already owns the device.
    Busy(CallState),
    NoIncomingCall,
    /// The incoming call is already being answered.
    SetupInProgress,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Busy(state) => write!(f, "device busy ({:?})", state),
            CallError::NoIncomingCall => write!(f, "no incoming call to answer"),
            CallError::SetupInProgress => write!(f, "call setup already in progress"),
        }
    }
}

impl std::error::Error for CallError {}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_party: String,
    /// How long the error status is shown before returning to Idle.
    pub error_reset: Duration,
    pub uplink_capacity: usize,
    pub sample_rate: u32,
    pub recording_window_ms: u64,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            local_party: config.user_id.to_string(),
            error_reset: Duration::from_millis(config.error_reset_ms),
            uplink_capacity: config.uplink_capacity.max(1),
            sample_rate: config.sample_rate,
            recording_window_ms: config.recording_window_ms,
        }
    }
}

/// Everything the session manager drives.
pub struct Collaborators {
    pub initiator: Arc<dyn CallInitiator>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: Arc<dyn MediaClient>,
    pub audio: Box<dyn AudioDevice>,
    pub indicator: Arc<dyn Indicator>,
}

pub struct CallSessionManager {
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    initiator: Arc<dyn CallInitiator>,
    signaling: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaClient>,
    // 启停会阻塞（打开 PCM、join 线程），只在阻塞线程池里调用
    audio: Arc<Mutex<Box<dyn AudioDevice>>>,
    indicator: Arc<dyn Indicator>,

    state: CallState,
    session: Option<CallSession>,
    participants: HashSet<String>,
    // 正在进行的发起请求或入会任务
    pending: Option<JoinHandle<()>>,
    audio_active: bool,
    armed_recording: Option<PathBuf>,
    recording: Option<CallRecording>,
}

impl CallSessionManager {
    pub fn new(
        config: SessionConfig,
        events: mpsc::Sender<SessionEvent>,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            initiator,
            signaling,
            media,
            audio,
            indicator,
        } = collaborators;
        Self {
            config,
            events,
            initiator,
            signaling,
            media,
            audio: Arc::new(Mutex::new(audio)),
            indicator,
            state: CallState::Idle,
            session: None,
            participants: HashSet::new(),
            pending: None,
            audio_active: false,
            armed_recording: None,
            recording: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Apply events until `Shutdown`, then hang up.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        self.indicator.set_status(self.state.into()).await;
        log::info!("Call session manager ready as {}", self.config.local_party);

        while let Some(event) = rx.recv().await {
            if let SessionEvent::Shutdown = event {
                log::info!("Shutting down call session manager");
                self.hang_up().await;
                break;
            }
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Gesture(gesture) => self.on_gesture(gesture).await,
            SessionEvent::Signaling(event) => self.on_signaling(event).await,
            SessionEvent::Media(event) => self.on_media(event).await,
            SessionEvent::Control(command) => self.on_control(command).await,
            SessionEvent::InitiationFinished { call_id, result } => {
                self.on_initiation_finished(call_id, result).await
            }
            SessionEvent::JoinFinished { call_id, joined } => {
                self.on_join_finished(call_id, joined).await
            }
            SessionEvent::ErrorElapsed { call_id } => self.on_error_elapsed(call_id).await,
            SessionEvent::Shutdown => self.hang_up().await,
        }
    }

    // ======================== Operations ========================

    /// Start an outbound call. The initiation request and the room join
    /// continue in the background.
    pub async fn initiate_call(&mut self, target: &str) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            log::warn!("Cannot call {}: {:?}", target, self.state);
            return Err(CallError::Busy(self.state));
        }

        // 后端返回真实 call_id 之前先用本地占位 id
        let call_id = Uuid::new_v4().to_string();
        log::info!("Calling {} (pending call {})", target, call_id);
        self.session = Some(CallSession {
            call_id: call_id.clone(),
            room_name: String::new(),
            local_party: self.config.local_party.clone(),
            remote_party: target.to_string(),
            remote_display_name: None,
            state: CallState::Outgoing,
            start_time: SystemTime::now(),
            end_time: None,
            media_token: String::new(),
        });
        self.set_state(CallState::Outgoing).await;

        let initiator = self.initiator.clone();
        let events = self.events.clone();
        let target = target.to_string();
        self.pending = Some(tokio::spawn(async move {
            let result = initiator.initiate_call(&target).await;
            let _ = events
                .send(SessionEvent::InitiationFinished { call_id, result })
                .await;
        }));
        Ok(())
    }

    /// Ring for an inbound call. While busy the new call is rejected
    /// back to the backend and the current call is untouched.
    pub async fn handle_inbound_call(&mut self, call: IncomingCall) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            log::warn!(
                "Rejecting call {} from {}: {:?}",
                call.call_id,
                call.from_party,
                self.state
            );
            if let Err(e) = self.signaling.reject_call(&call.call_id, &call.room_name).await {
                log::error!("Failed to reject call {}: {}", call.call_id, e);
            }
            return Err(CallError::Busy(self.state));
        }

        log::info!(
            "Incoming call {} from {} ({})",
            call.call_id,
            call.from_party,
            call.from_display_name.as_deref().unwrap_or("unknown")
        );
        self.session = Some(CallSession {
            call_id: call.call_id,
            room_name: call.room_name,
            local_party: self.config.local_party.clone(),
            remote_party: call.from_party,
            remote_display_name: call.from_display_name,
            state: CallState::Incoming,
            start_time: SystemTime::now(),
            end_time: None,
            media_token: call.access_token,
        });
        self.set_state(CallState::Incoming).await;
        Ok(())
    }

    pub async fn answer_call(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Incoming {
            return Err(CallError::NoIncomingCall);
        }
        if self.pending.is_some() {
            return Err(CallError::SetupInProgress);
        }
        let Some(session) = &self.session else {
            return Err(CallError::NoIncomingCall);
        };

        log::info!("Answering call {}", session.call_id);
        let accepted = self
            .signaling
            .accept_call(&session.call_id, &session.room_name, &session.media_token)
            .await;
        if let Err(e) = accepted {
            log::error!("Failed to accept call: {}", e);
            self.fail_setup().await;
            return Ok(());
        }
        self.start_join();
        Ok(())
    }

    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Incoming {
            return Err(CallError::NoIncomingCall);
        }
        if let Some(session) = &self.session {
            log::info!("Rejecting call {} from {}", session.call_id, session.remote_party);
            if let Err(e) = self
                .signaling
                .reject_call(&session.call_id, &session.room_name)
                .await
            {
                log::error!("Failed to send reject-call: {}", e);
            }
        }
        self.release_resources().await;
        self.end_session().await;
        Ok(())
    }

    /// Tear down whatever exists. Safe from any state, including mid-setup,
    /// and always ends Idle.
    pub async fn hang_up(&mut self) {
        if self.state == CallState::Idle && self.session.is_none() {
            log::debug!("hang_up: no active call");
            return;
        }
        if let Some(session) = &self.session {
            log::info!("Hanging up call {} with {}", session.call_id, session.remote_party);
        }
        self.release_resources().await;
        self.end_session().await;
    }

    // ======================== Event handlers ========================

    async fn on_gesture(&mut self, gesture: Gesture) {
        let result = match (gesture, self.state) {
            (Gesture::ShortPress, CallState::Incoming) => self.answer_call().await,
            (Gesture::ShortPress, CallState::Connected) => {
                self.hang_up().await;
                Ok(())
            }
            (Gesture::LongPress, CallState::Incoming) => self.reject_call().await,
            (Gesture::LongPress, CallState::Outgoing | CallState::Connected) => {
                self.hang_up().await;
                Ok(())
            }
            (gesture, state) => {
                log::debug!("Gesture {:?} has no binding in {:?}", gesture, state);
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("Gesture {:?} ignored: {}", gesture, e);
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => log::info!("Signaling channel up"),
            SignalingEvent::Disconnected => log::warn!("Signaling channel down"),
            SignalingEvent::IncomingCall(call) => {
                let _ = self.handle_inbound_call(call).await;
            }
            SignalingEvent::CallEnded(ended) => {
                let current = self.session.as_ref().map(|s| s.call_id.as_str());
                if current == Some(ended.call_id.as_str()) {
                    log::info!(
                        "Call {} ended remotely ({})",
                        ended.call_id,
                        ended.reason.as_deref().unwrap_or("no reason")
                    );
                    self.hang_up().await;
                } else {
                    log::debug!("Ignoring call-ended for {}", ended.call_id);
                }
            }
        }
    }

    async fn on_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Connected => log::debug!("Media transport connected"),
            MediaEvent::Disconnected => {
                if self.state == CallState::Connected {
                    log::warn!("Media transport lost, ending call");
                    self.hang_up().await;
                }
            }
            MediaEvent::ParticipantJoined(identity) => {
                if self.session.is_some() {
                    log::info!("Participant joined: {}", identity);
                    self.participants.insert(identity);
                }
            }
            MediaEvent::ParticipantLeft(identity) => {
                if !self.participants.remove(&identity) {
                    return;
                }
                log::info!("Participant left: {}", identity);
                if self.state == CallState::Connected && self.participants.is_empty() {
                    log::info!("Everyone else left the room, ending call");
                    self.hang_up().await;
                }
            }
        }
    }

    async fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Call(target) => {
                if let Err(e) = self.initiate_call(&target).await {
                    log::warn!("Call to {} refused: {}", target, e);
                }
            }
            ControlCommand::HangUp => self.hang_up().await,
            ControlCommand::Record(path) => {
                log::info!("Recording armed for the next call: {}", path.display());
                self.armed_recording = Some(path);
            }
            ControlCommand::RecordOff => {
                if self.armed_recording.take().is_some() {
                    log::info!("Recording disarmed");
                }
            }
        }
    }

    async fn on_initiation_finished(&mut self, call_id: String, result: anyhow::Result<CallTicket>) {
        if self.state != CallState::Outgoing || !self.is_current(&call_id) {
            log::debug!("Discarding stale initiation result for {}", call_id);
            return;
        }
        self.pending = None;

        let ticket = match result {
            Ok(ticket) => ticket,
            Err(e) => {
                log::error!("Call initiation failed: {:#}", e);
                self.fail_setup().await;
                return;
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.call_id = ticket.call_id;
            session.room_name = ticket.room_name;
            session.media_token = ticket.access_token;
        }
        self.start_join();
    }

    async fn on_join_finished(&mut self, call_id: String, joined: bool) {
        let expected = matches!(self.state, CallState::Outgoing | CallState::Incoming)
            && self.pending.is_some()
            && self.is_current(&call_id);
        if !expected {
            log::debug!("Discarding stale join result for {}", call_id);
            // 没有通话在使用房间时，迟到的成功入会需要退出
            if joined && matches!(self.state, CallState::Idle | CallState::Error) {
                self.media.leave().await;
            }
            return;
        }
        self.pending = None;

        if !joined {
            log::error!("Failed to join room for call {}", call_id);
            self.fail_setup().await;
            return;
        }

        self.set_state(CallState::Connected).await;
        if let Err(e) = self.start_media().await {
            log::error!("Failed to start call audio: {:#}", e);
            self.fail_setup().await;
        }
    }

    async fn on_error_elapsed(&mut self, call_id: String) {
        if self.state == CallState::Error && self.is_current(&call_id) {
            self.end_session().await;
        }
    }

    // ======================== Internals ========================

    fn is_current(&self, call_id: &str) -> bool {
        self.session.as_ref().is_some_and(|s| s.call_id == call_id)
    }

    fn start_join(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let media = self.media.clone();
        let events = self.events.clone();
        let call_id = session.call_id.clone();
        let room_name = session.room_name.clone();
        let token = session.media_token.clone();
        self.pending = Some(tokio::spawn(async move {
            let joined = media.join(&room_name, &token).await;
            let _ = events.send(SessionEvent::JoinFinished { call_id, joined }).await;
        }));
    }

    /// Wire capture to publish and subscribe to playback.
    async fn start_media(&mut self) -> anyhow::Result<()> {
        if let Some(path) = self.armed_recording.take() {
            self.recording = Some(CallRecording::start(
                path,
                self.config.sample_rate,
                self.config.recording_window_ms,
            ));
        }

        let (uplink, frames) = mpsc::channel(self.config.uplink_capacity);
        self.media.publish(frames)?;
        let downlink = self.media.subscribe()?;
        let links = AudioLinks {
            uplink,
            downlink,
            recording: self.recording.as_ref().map(|r| r.tap()),
        };
        let audio = self.audio.clone();
        tokio::task::spawn_blocking(move || match audio.lock() {
            Ok(mut audio) => audio.start(links),
            Err(_) => Err(anyhow::anyhow!("audio device lock poisoned")),
        })
        .await??;
        self.audio_active = true;
        Ok(())
    }

    /// Setup failed: drop everything, show the error, and schedule the
    /// return to Idle.
    async fn fail_setup(&mut self) {
        self.release_resources().await;
        self.set_state(CallState::Error).await;

        let Some(session) = &self.session else {
            return;
        };
        let call_id = session.call_id.clone();
        let events = self.events.clone();
        let delay = self.config.error_reset;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ErrorElapsed { call_id }).await;
        });
    }

    /// Each step logs its own failure and the next one still runs.
    async fn release_resources(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        if self.audio_active {
            self.audio_active = false;
            let audio = self.audio.clone();
            let stopped = tokio::task::spawn_blocking(move || {
                if let Ok(mut audio) = audio.lock() {
                    audio.stop();
                }
            })
            .await;
            if let Err(e) = stopped {
                log::error!("Audio stop task failed: {}", e);
            }
        }
        if let Some(recording) = self.recording.take() {
            // 混音和写文件放到阻塞线程，不拖慢挂断
            tokio::task::spawn_blocking(move || {
                let path = recording.path().to_path_buf();
                if let Err(e) = recording.finish() {
                    log::error!("Failed to save call recording {}: {:#}", path.display(), e);
                }
            });
        }
        self.media.leave().await;
        self.participants.clear();
    }

    async fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let end = SystemTime::now();
            session.end_time = Some(end);
            let duration = end.duration_since(session.start_time).unwrap_or_default();
            log::info!(
                "Call {} with {} finished after {:.1}s",
                session.call_id,
                session.remote_party,
                duration.as_secs_f32()
            );
        }
        self.set_state(CallState::Idle).await;
    }

    async fn set_state(&mut self, state: CallState) {
        if self.state != state {
            log::info!("Call state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
        self.indicator.set_status(state.into()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::indicator::IndicatorStatus;
    use crate::media::RemoteFrame;
    use crate::recording::{FrameSource, RecordingTap};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn count(log: &Log, entry: &str) -> usize {
        log.lock().unwrap().iter().filter(|e| e.as_str() == entry).count()
    }

    struct MockInitiator {
        response: Result<CallTicket, String>,
        log: Log,
    }

    #[async_trait]
    impl CallInitiator for MockInitiator {
        async fn initiate_call(&self, target_user_id: &str) -> anyhow::Result<CallTicket> {
            self.log.lock().unwrap().push(format!("initiate:{}", target_user_id));
            self.response.clone().map_err(anyhow::Error::msg)
        }
    }

    struct MockSignaling {
        accept_fails: bool,
        log: Log,
    }

    #[async_trait]
    impl SignalingChannel for MockSignaling {
        async fn accept_call(&self, call_id: &str, room_name: &str, token: &str) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("accept:{}:{}:{}", call_id, room_name, token));
            if self.accept_fails {
                anyhow::bail!("signaling disconnected");
            }
            Ok(())
        }

        async fn reject_call(&self, call_id: &str, room_name: &str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("reject:{}:{}", call_id, room_name));
            Ok(())
        }
    }

    struct MockMedia {
        join_result: bool,
        publish_fails: bool,
        subscribe_fails: bool,
        log: Log,
        downlink: broadcast::Sender<RemoteFrame>,
    }

    #[async_trait]
    impl MediaClient for MockMedia {
        async fn join(&self, room_name: &str, token: &str) -> bool {
            self.log.lock().unwrap().push(format!("join:{}:{}", room_name, token));
            self.join_result
        }

        async fn leave(&self) {
            self.log.lock().unwrap().push("leave".into());
        }

        fn publish(&self, _frames: mpsc::Receiver<AudioFrame>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("publish".into());
            if self.publish_fails {
                anyhow::bail!("cannot publish: not in a room");
            }
            Ok(())
        }

        fn subscribe(&self) -> anyhow::Result<broadcast::Receiver<RemoteFrame>> {
            self.log.lock().unwrap().push("subscribe".into());
            if self.subscribe_fails {
                anyhow::bail!("cannot subscribe: not in a room");
            }
            Ok(self.downlink.subscribe())
        }
    }

    /// Stands in for the sound card. When recording, it feeds one frame
    /// per direction into the tap.
    struct MockAudio {
        start_fails: bool,
        log: Log,
        stopped_on: Arc<Mutex<Option<std::thread::ThreadId>>>,
    }

    impl AudioDevice for MockAudio {
        fn start(&mut self, links: AudioLinks) -> anyhow::Result<()> {
            if self.start_fails {
                self.log.lock().unwrap().push("start-failed".into());
                anyhow::bail!("capture device failed to open");
            }
            match &links.recording {
                Some(tap) => {
                    feed(tap);
                    self.log.lock().unwrap().push("start:recording".into());
                }
                None => self.log.lock().unwrap().push("start".into()),
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().unwrap().push("stop".into());
            *self.stopped_on.lock().unwrap() = Some(std::thread::current().id());
        }
    }

    fn feed(tap: &RecordingTap) {
        tap.push(FrameSource::Microphone, &AudioFrame::new(vec![100, -100], 48000, 1, 0));
        tap.push(FrameSource::Remote, &AudioFrame::new(vec![300, 300], 48000, 1, 10_000));
    }

    struct MockIndicator {
        statuses: Arc<Mutex<Vec<IndicatorStatus>>>,
    }

    #[async_trait]
    impl Indicator for MockIndicator {
        async fn set_status(&self, status: IndicatorStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    struct Harness {
        manager: CallSessionManager,
        rx: mpsc::Receiver<SessionEvent>,
        initiator: Log,
        signaling: Log,
        media: Log,
        audio: Log,
        audio_stopped_on: Arc<Mutex<Option<std::thread::ThreadId>>>,
        statuses: Arc<Mutex<Vec<IndicatorStatus>>>,
    }

    /// Which collaborator calls fail.
    #[derive(Debug, Default, Clone, Copy)]
    struct Faults {
        accept: bool,
        publish: bool,
        subscribe: bool,
        audio_start: bool,
    }

    fn ticket() -> CallTicket {
        CallTicket {
            room_name: "r1".into(),
            access_token: "tok1".into(),
            call_id: "c1".into(),
        }
    }

    fn inbound(call_id: &str, room: &str) -> IncomingCall {
        IncomingCall {
            from_party: "userA".into(),
            from_display_name: Some("Alice".into()),
            room_name: room.into(),
            access_token: "tok2".into(),
            call_id: call_id.into(),
        }
    }

    fn harness(response: Result<CallTicket, String>, join_result: bool) -> Harness {
        harness_with(response, join_result, Faults::default())
    }

    fn harness_with(response: Result<CallTicket, String>, join_result: bool, faults: Faults) -> Harness {
        let (tx, rx) = mpsc::channel(32);
        let (initiator, signaling, media, audio) =
            (Log::default(), Log::default(), Log::default(), Log::default());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let audio_stopped_on = Arc::new(Mutex::new(None));
        let (downlink, _) = broadcast::channel(4);

        let collaborators = Collaborators {
            initiator: Arc::new(MockInitiator {
                response,
                log: initiator.clone(),
            }),
            signaling: Arc::new(MockSignaling {
                accept_fails: faults.accept,
                log: signaling.clone(),
            }),
            media: Arc::new(MockMedia {
                join_result,
                publish_fails: faults.publish,
                subscribe_fails: faults.subscribe,
                log: media.clone(),
                downlink,
            }),
            audio: Box::new(MockAudio {
                start_fails: faults.audio_start,
                log: audio.clone(),
                stopped_on: audio_stopped_on.clone(),
            }),
            indicator: Arc::new(MockIndicator {
                statuses: statuses.clone(),
            }),
        };
        let config = SessionConfig {
            local_party: "device-1".into(),
            error_reset: Duration::from_millis(10),
            uplink_capacity: 4,
            sample_rate: 48000,
            recording_window_ms: 50,
        };
        Harness {
            manager: CallSessionManager::new(config, tx, collaborators),
            rx,
            initiator,
            signaling,
            media,
            audio,
            audio_stopped_on,
            statuses,
        }
    }

    impl Harness {
        /// Deliver queued events until the loop has been quiet for a while.
        async fn pump(&mut self) {
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await
            {
                self.manager.handle_event(event).await;
            }
        }

        async fn connect_outgoing(&mut self) {
            self.manager.initiate_call("userB").await.unwrap();
            self.pump().await;
            assert_eq!(self.manager.state(), CallState::Connected);
        }

        fn statuses(&self) -> Vec<IndicatorStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn outgoing_call_connects_to_the_returned_room() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.initiate_call("userB").await.unwrap();
        assert_eq!(h.manager.state(), CallState::Outgoing);
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Connected);
        let session = h.manager.session().unwrap();
        assert_eq!(session.room_name, "r1");
        assert_eq!(session.call_id, "c1");
        assert_eq!(session.media_token, "tok1");
        assert_eq!(session.remote_party, "userB");
        assert_eq!(session.local_party, "device-1");
        assert_eq!(session.state, CallState::Connected);

        assert_eq!(entries(&h.initiator), vec!["initiate:userB"]);
        assert_eq!(entries(&h.media), vec!["join:r1:tok1", "publish", "subscribe"]);
        assert_eq!(entries(&h.audio), vec!["start"]);
        assert_eq!(
            h.statuses(),
            vec![IndicatorStatus::Connecting, IndicatorStatus::InCall]
        );
    }

    #[tokio::test]
    async fn second_call_is_refused_without_touching_the_first() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;

        assert_eq!(
            h.manager.initiate_call("userC").await,
            Err(CallError::Busy(CallState::Connected))
        );
        assert_eq!(h.manager.state(), CallState::Connected);
        let session = h.manager.session().unwrap();
        assert_eq!(session.remote_party, "userB");
        assert_eq!(session.call_id, "c1");
        assert_eq!(entries(&h.initiator), vec!["initiate:userB"]);
    }

    #[tokio::test]
    async fn failed_join_shows_error_then_returns_to_idle() {
        let mut h = harness(Ok(ticket()), false);
        h.manager.initiate_call("userB").await.unwrap();
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert!(entries(&h.audio).is_empty());
        assert_eq!(
            h.statuses(),
            vec![
                IndicatorStatus::Connecting,
                IndicatorStatus::Error,
                IndicatorStatus::Ready
            ]
        );
    }

    /// Outgoing call whose room join succeeds but whose media cannot start.
    async fn assert_media_failure_tears_down(faults: Faults) -> Harness {
        let mut h = harness_with(Ok(ticket()), true, faults);
        h.manager.initiate_call("userB").await.unwrap();
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(
            h.statuses(),
            vec![
                IndicatorStatus::Connecting,
                IndicatorStatus::InCall,
                IndicatorStatus::Error,
                IndicatorStatus::Ready
            ]
        );
        assert_eq!(count(&h.media, "leave"), 1);
        assert_eq!(count(&h.audio, "stop"), 0);
        h
    }

    #[tokio::test]
    async fn audio_start_failure_leaves_the_room() {
        let h = assert_media_failure_tears_down(Faults {
            audio_start: true,
            ..Faults::default()
        })
        .await;
        assert_eq!(entries(&h.audio), vec!["start-failed"]);
        assert_eq!(
            entries(&h.media),
            vec!["join:r1:tok1", "publish", "subscribe", "leave"]
        );
    }

    #[tokio::test]
    async fn publish_failure_leaves_the_room() {
        let h = assert_media_failure_tears_down(Faults {
            publish: true,
            ..Faults::default()
        })
        .await;
        assert!(entries(&h.audio).is_empty());
        assert_eq!(entries(&h.media), vec!["join:r1:tok1", "publish", "leave"]);
    }

    #[tokio::test]
    async fn subscribe_failure_leaves_the_room() {
        let h = assert_media_failure_tears_down(Faults {
            subscribe: true,
            ..Faults::default()
        })
        .await;
        assert!(entries(&h.audio).is_empty());
    }

    #[tokio::test]
    async fn answered_call_that_cannot_join_resets() {
        let mut h = harness(Ok(ticket()), false);
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();
        h.manager.answer_call().await.unwrap();
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(entries(&h.signaling), vec!["accept:c2:r2:tok2"]);
        assert_eq!(count(&h.media, "join:r2:tok2"), 1);
        assert_eq!(count(&h.media, "leave"), 1);
        assert!(entries(&h.audio).is_empty());
        assert_eq!(
            h.statuses(),
            vec![
                IndicatorStatus::IncomingCall,
                IndicatorStatus::Error,
                IndicatorStatus::Ready
            ]
        );
    }

    #[tokio::test]
    async fn unsent_accept_never_joins() {
        let mut h = harness_with(
            Ok(ticket()),
            true,
            Faults {
                accept: true,
                ..Faults::default()
            },
        );
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();
        h.manager.answer_call().await.unwrap();
        assert_eq!(h.manager.state(), CallState::Error);
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(!entries(&h.media).iter().any(|e| e.starts_with("join")));
        assert_eq!(count(&h.media, "leave"), 1);
        assert!(entries(&h.audio).is_empty());
        assert_eq!(
            h.statuses(),
            vec![
                IndicatorStatus::IncomingCall,
                IndicatorStatus::Error,
                IndicatorStatus::Ready
            ]
        );
    }

    #[tokio::test]
    async fn audio_stops_off_the_session_thread() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;
        h.manager.hang_up().await;

        let stopped_on = h.audio_stopped_on.lock().unwrap().expect("audio was stopped");
        assert_ne!(stopped_on, std::thread::current().id());
        assert_eq!(entries(&h.audio), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn failed_initiation_never_joins() {
        let mut h = harness(Err("HTTP 500".into()), true);
        h.manager.initiate_call("userB").await.unwrap();
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(!entries(&h.media).iter().any(|e| e.starts_with("join")));
        assert!(h.statuses().contains(&IndicatorStatus::Error));
    }

    #[tokio::test]
    async fn hang_up_is_idempotent() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.hang_up().await;
        h.manager.hang_up().await;
        assert_eq!(h.manager.state(), CallState::Idle);

        h.connect_outgoing().await;
        h.manager.hang_up().await;
        h.manager.hang_up().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(entries(&h.audio), vec!["start", "stop"]);
        assert_eq!(count(&h.media, "leave"), 1);
        assert_eq!(h.statuses().last(), Some(&IndicatorStatus::Ready));
    }

    #[tokio::test]
    async fn hang_up_during_setup_discards_late_results() {
        let mut h = harness(Ok(ticket()), true);
        let placeholder = {
            h.manager.initiate_call("userB").await.unwrap();
            h.manager.session().unwrap().call_id.clone()
        };
        h.manager.hang_up().await;
        assert_eq!(h.manager.state(), CallState::Idle);

        // results for the abandoned call must not revive it
        h.manager
            .handle_event(SessionEvent::InitiationFinished {
                call_id: placeholder,
                result: Ok(ticket()),
            })
            .await;
        h.manager
            .handle_event(SessionEvent::JoinFinished {
                call_id: "c1".into(),
                joined: true,
            })
            .await;
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert!(entries(&h.audio).is_empty());
        // the stray successful join is left again
        assert_eq!(entries(&h.media).last().map(String::as_str), Some("leave"));
    }

    #[tokio::test]
    async fn inbound_call_rings_when_idle() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();

        assert_eq!(h.manager.state(), CallState::Incoming);
        let session = h.manager.session().unwrap();
        assert_eq!(session.remote_party, "userA");
        assert_eq!(session.remote_display_name.as_deref(), Some("Alice"));
        assert_eq!(session.room_name, "r2");
        assert_eq!(session.media_token, "tok2");
        assert_eq!(session.call_id, "c2");
        assert_eq!(h.statuses(), vec![IndicatorStatus::IncomingCall]);
    }

    #[tokio::test]
    async fn inbound_call_while_busy_is_rejected() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();

        assert_eq!(
            h.manager.handle_inbound_call(inbound("c3", "r3")).await,
            Err(CallError::Busy(CallState::Incoming))
        );
        assert_eq!(h.manager.state(), CallState::Incoming);
        assert_eq!(h.manager.session().unwrap().call_id, "c2");
        assert_eq!(entries(&h.signaling), vec!["reject:c3:r3"]);
    }

    #[tokio::test]
    async fn empty_room_ends_the_call() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;

        h.manager
            .handle_event(SessionEvent::Media(MediaEvent::ParticipantJoined("userB".into())))
            .await;
        assert_eq!(h.manager.state(), CallState::Connected);
        h.manager
            .handle_event(SessionEvent::Media(MediaEvent::ParticipantLeft("userB".into())))
            .await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(count(&h.media, "leave"), 1);
        assert_eq!(entries(&h.audio), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn unknown_participant_leaving_changes_nothing() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;
        h.manager
            .handle_event(SessionEvent::Media(MediaEvent::ParticipantLeft("ghost".into())))
            .await;
        assert_eq!(h.manager.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn media_disconnect_ends_the_call() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;
        h.manager
            .handle_event(SessionEvent::Media(MediaEvent::Disconnected))
            .await;
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(entries(&h.audio), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn call_ended_only_for_the_current_call() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;

        let ended = |id: &str| {
            SessionEvent::Signaling(SignalingEvent::CallEnded(crate::protocol::CallEnded {
                call_id: id.into(),
                reason: None,
            }))
        };
        h.manager.handle_event(ended("c9")).await;
        assert_eq!(h.manager.state(), CallState::Connected);
        h.manager.handle_event(ended("c1")).await;
        assert_eq!(h.manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn short_press_answers_incoming_exactly_once() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();

        h.manager.handle_event(SessionEvent::Gesture(Gesture::ShortPress)).await;
        // a second press while the join is in flight must not answer again
        h.manager.handle_event(SessionEvent::Gesture(Gesture::ShortPress)).await;
        h.pump().await;

        assert_eq!(h.manager.state(), CallState::Connected);
        assert_eq!(entries(&h.signaling), vec!["accept:c2:r2:tok2"]);
        assert_eq!(count(&h.media, "join:r2:tok2"), 1);
        assert_eq!(entries(&h.audio), vec!["start"]);
    }

    #[tokio::test]
    async fn long_press_hangs_up_connected_exactly_once() {
        let mut h = harness(Ok(ticket()), true);
        h.connect_outgoing().await;

        h.manager.handle_event(SessionEvent::Gesture(Gesture::DoublePress)).await;
        h.manager.handle_event(SessionEvent::Gesture(Gesture::TriplePress)).await;
        assert_eq!(h.manager.state(), CallState::Connected);

        h.manager.handle_event(SessionEvent::Gesture(Gesture::LongPress)).await;
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(count(&h.audio, "stop"), 1);
        assert_eq!(count(&h.media, "leave"), 1);
        assert!(entries(&h.signaling).is_empty());
    }

    #[tokio::test]
    async fn long_press_rejects_incoming() {
        let mut h = harness(Ok(ticket()), true);
        h.manager.handle_inbound_call(inbound("c2", "r2")).await.unwrap();
        h.manager.handle_event(SessionEvent::Gesture(Gesture::LongPress)).await;

        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(h.manager.session().is_none());
        assert_eq!(entries(&h.signaling), vec!["reject:c2:r2"]);
        assert!(entries(&h.audio).is_empty());
    }

    #[tokio::test]
    async fn gestures_without_binding_do_nothing_when_idle() {
        let mut h = harness(Ok(ticket()), true);
        for gesture in [
            Gesture::ShortPress,
            Gesture::LongPress,
            Gesture::DoublePress,
            Gesture::TriplePress,
        ] {
            h.manager.handle_event(SessionEvent::Gesture(gesture)).await;
        }
        assert_eq!(h.manager.state(), CallState::Idle);
        assert!(entries(&h.signaling).is_empty());
        assert!(entries(&h.media).is_empty());
        assert!(h.statuses().is_empty());
    }

    #[tokio::test]
    async fn answer_and_reject_need_a_ringing_call() {
        let mut h = harness(Ok(ticket()), true);
        assert_eq!(h.manager.answer_call().await, Err(CallError::NoIncomingCall));
        assert_eq!(h.manager.reject_call().await, Err(CallError::NoIncomingCall));
    }

    #[tokio::test]
    async fn control_commands_place_and_end_calls() {
        let mut h = harness(Ok(ticket()), true);
        h.manager
            .handle_event(SessionEvent::Control(ControlCommand::Call("userB".into())))
            .await;
        h.pump().await;
        assert_eq!(h.manager.state(), CallState::Connected);

        h.manager
            .handle_event(SessionEvent::Control(ControlCommand::HangUp))
            .await;
        assert_eq!(h.manager.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn armed_recording_covers_one_call() {
        let path = std::env::temp_dir().join(format!("callbox-session-{}.wav", Uuid::new_v4()));
        let mut h = harness(Ok(ticket()), true);
        h.manager
            .handle_event(SessionEvent::Control(ControlCommand::Record(path.clone())))
            .await;

        h.connect_outgoing().await;
        h.manager.hang_up().await;

        // the file is written off the session loop
        let mut samples = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(mut reader) = hound::WavReader::open(&path) {
                samples = reader.samples::<i16>().filter_map(Result::ok).collect();
                if !samples.is_empty() {
                    break;
                }
            }
        }
        assert_eq!(samples, vec![200, 100]);
        let _ = std::fs::remove_file(&path);

        h.connect_outgoing().await;
        assert_eq!(entries(&h.audio), vec!["start:recording", "stop", "start"]);
    }

    #[tokio::test]
    async fn disarmed_recording_does_not_start() {
        let path = std::env::temp_dir().join(format!("callbox-off-{}.wav", Uuid::new_v4()));
        let mut h = harness(Ok(ticket()), true);
        h.manager
            .handle_event(SessionEvent::Control(ControlCommand::Record(path)))
            .await;
        h.manager
            .handle_event(SessionEvent::Control(ControlCommand::RecordOff))
            .await;
        h.connect_outgoing().await;
        assert_eq!(entries(&h.audio), vec!["start"]);
    }

    #[tokio::test]
    async fn hang_up_from_error_skips_the_wait() {
        let mut h = harness(Ok(ticket()), false);
        h.manager.initiate_call("userB").await.unwrap();
        // deliver only the initiation and join results
        for _ in 0..2 {
            let event = h.rx.recv().await.unwrap();
            h.manager.handle_event(event).await;
        }
        assert_eq!(h.manager.state(), CallState::Error);

        h.manager.hang_up().await;
        assert_eq!(h.manager.state(), CallState::Idle);
        // the pending reset is now stale
        h.pump().await;
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.statuses().last(), Some(&IndicatorStatus::Ready));
    }

    #[tokio::test]
    async fn shutdown_hangs_up_and_stops_the_loop() {
        let h = harness(Ok(ticket()), true);
        let Harness {
            manager,
            rx,
            statuses,
            ..
        } = h;
        let tx = manager.events.clone();
        let run = tokio::spawn(manager.run(rx));
        tx.send(SessionEvent::Signaling(SignalingEvent::IncomingCall(inbound("c2", "r2"))))
            .await
            .unwrap();
        tx.send(SessionEvent::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            statuses.lock().unwrap().clone(),
            vec![
                IndicatorStatus::Ready,
                IndicatorStatus::IncomingCall,
                IndicatorStatus::Ready
            ]
        );
    }
}
