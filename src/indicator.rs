use async_trait::async_trait;

use crate::session::CallState;

/// Status names understood by the LED/panel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorStatus {
    Ready,
    Connecting,
    IncomingCall,
    InCall,
    Error,
}

impl IndicatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorStatus::Ready => "ready",
            IndicatorStatus::Connecting => "connecting",
            IndicatorStatus::IncomingCall => "incoming_call",
            IndicatorStatus::InCall => "in_call",
            IndicatorStatus::Error => "error",
        }
    }
}

impl From<CallState> for IndicatorStatus {
    fn from(state: CallState) -> Self {
        match state {
            CallState::Idle => IndicatorStatus::Ready,
            CallState::Outgoing => IndicatorStatus::Connecting,
            CallState::Incoming => IndicatorStatus::IncomingCall,
            CallState::Connected => IndicatorStatus::InCall,
            CallState::Error => IndicatorStatus::Error,
        }
    }
}

/// Last-writer-wins status light. Failures are the implementation's to log.
#[async_trait]
pub trait Indicator: Send + Sync {
    async fn set_status(&self, status: IndicatorStatus);
}
