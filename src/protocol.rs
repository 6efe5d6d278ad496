//! Wire messages exchanged with the companion backend.
//!
//! The backend has grown two naming styles over time (`room_name` vs
//! `roomName`, `token` vs `calleeToken`, ...) and some payloads carry both.
//! Every spelling gets its own field; validation picks the first non-empty
//! one, camelCase first.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Room credentials for one call, returned by the call initiation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTicket {
    pub room_name: String,
    pub access_token: String,
    pub call_id: String,
}

/// A validated `incoming-call` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from_party: String,
    pub from_display_name: Option<String>,
    pub room_name: String,
    pub access_token: String,
    pub call_id: String,
}

/// A validated `call-ended` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnded {
    pub call_id: String,
    pub reason: Option<String>,
}

/// Required fields that were absent or empty in an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFields(pub Vec<&'static str>);

impl fmt::Display for MissingFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing required fields: {}", self.0.join(", "))
    }
}

impl std::error::Error for MissingFields {}

/// First spelling that is present and not blank.
fn first_present<const N: usize>(spellings: [Option<String>; N]) -> Option<String> {
    spellings
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
}

fn required(
    value: Option<String>,
    name: &'static str,
    missing: &mut Vec<&'static str>,
) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

// ======================== Call initiation API ========================

#[derive(Debug, Default, Deserialize)]
pub struct InitiateCallResponse {
    #[serde(default, rename = "roomName")]
    pub room_name_camel: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default, rename = "callerToken")]
    pub caller_token: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, rename = "callLogId")]
    pub call_log_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

impl TryFrom<InitiateCallResponse> for CallTicket {
    type Error = MissingFields;

    fn try_from(resp: InitiateCallResponse) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let ticket = CallTicket {
            room_name: required(
                first_present([resp.room_name_camel, resp.room_name]),
                "room_name",
                &mut missing,
            ),
            access_token: required(
                first_present([resp.caller_token, resp.token, resp.access_token]),
                "access_token",
                &mut missing,
            ),
            call_id: required(
                first_present([resp.call_log_id, resp.call_id]),
                "call_id",
                &mut missing,
            ),
        };
        if missing.is_empty() {
            Ok(ticket)
        } else {
            Err(MissingFields(missing))
        }
    }
}

// ======================== Signaling channel ========================

#[derive(Debug, Default, Deserialize)]
pub struct IncomingCallPayload {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_user: Option<String>,
    #[serde(default)]
    pub from_party: Option<String>,
    #[serde(default, rename = "fromName")]
    pub from_name_camel: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default, rename = "roomName")]
    pub room_name_camel: Option<String>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default, rename = "calleeToken")]
    pub callee_token: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, rename = "callLogId")]
    pub call_log_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

impl TryFrom<IncomingCallPayload> for IncomingCall {
    type Error = MissingFields;

    fn try_from(p: IncomingCallPayload) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let call = IncomingCall {
            from_party: required(
                first_present([p.from, p.from_user, p.from_party]),
                "from_party",
                &mut missing,
            ),
            from_display_name: first_present([p.from_name_camel, p.from_name]),
            room_name: required(
                first_present([p.room_name_camel, p.room_name]),
                "room_name",
                &mut missing,
            ),
            access_token: required(
                first_present([p.callee_token, p.token, p.access_token]),
                "access_token",
                &mut missing,
            ),
            call_id: required(
                first_present([p.call_log_id, p.call_id]),
                "call_id",
                &mut missing,
            ),
        };
        if missing.is_empty() {
            Ok(call)
        } else {
            Err(MissingFields(missing))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CallEndedPayload {
    #[serde(default, rename = "callLogId")]
    pub call_log_id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TryFrom<CallEndedPayload> for CallEnded {
    type Error = MissingFields;

    fn try_from(p: CallEndedPayload) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let call_id = required(
            first_present([p.call_log_id, p.call_id]),
            "call_id",
            &mut missing,
        );
        if missing.is_empty() {
            Ok(CallEnded { call_id, reason: p.reason })
        } else {
            Err(MissingFields(missing))
        }
    }
}

/// Text frames received on the signaling channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "incoming-call")]
    IncomingCall(IncomingCallPayload),
    #[serde(rename = "call-ended")]
    CallEnded(CallEndedPayload),
    #[serde(other)]
    Unknown,
}

/// Text frames sent on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "register-user")]
    RegisterUser {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "deviceType")]
        device_type: String,
    },
    #[serde(rename = "accept-call")]
    AcceptCall {
        call_id: String,
        room_name: String,
        token: String,
    },
    #[serde(rename = "reject-call")]
    RejectCall { call_id: String, room_name: String },
}
