use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{CallId, CallKind, Credential, UserId},
    error::ApiError,
};

/// Body returned by `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl From<RefreshResponse> for Credential {
    fn from(value: RefreshResponse) -> Self {
        Credential::new(value.access_token, value.expires_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    Declined,
}

/// Payload shared by every call signaling event, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    pub call_id: CallId,
    pub seq: u64,
    pub kind: CallKind,
    pub peer_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Accept,
    Reject,
    End,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "call-offer",
            SignalKind::Accept => "call-accept",
            SignalKind::Reject => "call-reject",
            SignalKind::End => "call-end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Handshake acknowledgement; nothing else is accepted before it.
    Authenticated {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Full snapshot of online users, never a diff.
    OnlineUsers(Vec<UserId>),
    CallOffer(CallSignal),
    CallAccept(CallSignal),
    CallReject(CallSignal),
    CallEnd(CallSignal),
    Error(ApiError),
}

impl ServerEvent {
    pub fn call_signal(&self) -> Option<(SignalKind, &CallSignal)> {
        match self {
            ServerEvent::CallOffer(signal) => Some((SignalKind::Offer, signal)),
            ServerEvent::CallAccept(signal) => Some((SignalKind::Accept, signal)),
            ServerEvent::CallReject(signal) => Some((SignalKind::Reject, signal)),
            ServerEvent::CallEnd(signal) => Some((SignalKind::End, signal)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Authenticated { .. } => "authenticated",
            ServerEvent::OnlineUsers(_) => "online-users",
            ServerEvent::Error(_) => "error",
            other => other
                .call_signal()
                .map(|(kind, _)| kind.as_str())
                .unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    CallOffer(CallSignal),
    CallAccept(CallSignal),
    CallReject(CallSignal),
    CallEnd(CallSignal),
}

impl ClientRequest {
    pub fn signal(kind: SignalKind, signal: CallSignal) -> Self {
        match kind {
            SignalKind::Offer => ClientRequest::CallOffer(signal),
            SignalKind::Accept => ClientRequest::CallAccept(signal),
            SignalKind::Reject => ClientRequest::CallReject(signal),
            SignalKind::End => ClientRequest::CallEnd(signal),
        }
    }

    pub fn call_signal(&self) -> (SignalKind, &CallSignal) {
        match self {
            ClientRequest::CallOffer(signal) => (SignalKind::Offer, signal),
            ClientRequest::CallAccept(signal) => (SignalKind::Accept, signal),
            ClientRequest::CallReject(signal) => (SignalKind::Reject, signal),
            ClientRequest::CallEnd(signal) => (SignalKind::End, signal),
        }
    }
}
