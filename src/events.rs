//! Everything that can wake the call session loop.
//!
//! Button, panel, signaling and media collaborators each hold a clone of
//! one `mpsc::Sender<SessionEvent>`; the session manager is the only
//! receiver.

use crate::media::MediaEvent;
use crate::protocol::{CallEnded, CallTicket, IncomingCall};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    ShortPress,
    LongPress,
    DoublePress,
    TriplePress,
}

impl Gesture {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "short" | "short_press" => Some(Gesture::ShortPress),
            "long" | "long_press" => Some(Gesture::LongPress),
            "double" | "double_press" => Some(Gesture::DoublePress),
            "triple" | "triple_press" => Some(Gesture::TriplePress),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SignalingEvent {
    Connected,
    Disconnected,
    IncomingCall(IncomingCall),
    CallEnded(CallEnded),
}

/// Commands from the local panel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Place an outbound call to a user id.
    Call(String),
    HangUp,
    /// Arm a mixed recording of the next call into this WAV file.
    Record(PathBuf),
    RecordOff,
}

#[derive(Debug)]
pub enum SessionEvent {
    Gesture(Gesture),
    Signaling(SignalingEvent),
    Media(MediaEvent),
    Control(ControlCommand),
    /// The call initiation request started for `call_id` has completed.
    InitiationFinished {
        call_id: String,
        result: anyhow::Result<CallTicket>,
    },
    /// The room join started for `call_id` has completed.
    JoinFinished { call_id: String, joined: bool },
    /// The error display period for `call_id` is over.
    ErrorElapsed { call_id: String },
    Shutdown,
}
