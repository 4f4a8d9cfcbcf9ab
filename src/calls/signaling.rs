//! Relay signaling message definitions.
//!
//! Every relay message is one JSON frame of the form
//! `{"event": "<kind>", "data": {...}, "ackId": 7}`. Payload keys are
//! camelCase. `ackId` is set by the relay on delivered frames and answered
//! with an `ack` frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::error::CallError;
use crate::identity::PeerId;

/// Signaling message kinds exchanged with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Outbound: ask the relay to ring a user.
    Start,
    /// Inbound: someone is ringing us.
    Incoming,
    /// Outbound: we accept the ringing call.
    Accept,
    /// Inbound: the user we rang accepted.
    Accepted,
    /// Outbound: we are terminating the session.
    End,
    /// Inbound: the other party terminated the session.
    Ended,
    /// Outbound: delivery acknowledgement for a frame carrying `ackId`.
    Ack,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "call:start",
            Self::Incoming => "call:incoming",
            Self::Accept => "call:accept",
            Self::Accepted => "call:accepted",
            Self::End => "call:end",
            Self::Ended => "call:ended",
            Self::Ack => "ack",
        }
    }

    /// Whether the kind travels from the relay to us.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Incoming | Self::Accepted | Self::Ended)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call:start" => Ok(Self::Start),
            "call:incoming" => Ok(Self::Incoming),
            "call:accept" => Ok(Self::Accept),
            "call:accepted" => Ok(Self::Accepted),
            "call:end" => Ok(Self::End),
            "call:ended" => Ok(Self::Ended),
            "ack" => Ok(Self::Ack),
            other => Err(CallError::Parse(format!("unknown relay event: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub recipient_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayload {
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptPayload {
    pub caller_id: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedPayload {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPayload {
    pub other_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub id: u64,
}

/// Messages we send to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    Start(StartPayload),
    Accept(AcceptPayload),
    End(EndPayload),
    Ack(AckPayload),
}

impl OutboundSignal {
    pub fn start(recipient_id: &str, sender_name: &str, peer_id: &PeerId) -> Self {
        Self::Start(StartPayload {
            recipient_id: recipient_id.to_string(),
            sender_name: sender_name.to_string(),
            peer_id: peer_id.clone(),
        })
    }

    pub fn accept(caller_id: &str, peer_id: &PeerId) -> Self {
        Self::Accept(AcceptPayload {
            caller_id: caller_id.to_string(),
            peer_id: peer_id.clone(),
        })
    }

    pub fn end(other_user_id: &str) -> Self {
        Self::End(EndPayload {
            other_user_id: other_user_id.to_string(),
        })
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Start(_) => SignalKind::Start,
            Self::Accept(_) => SignalKind::Accept,
            Self::End(_) => SignalKind::End,
            Self::Ack(_) => SignalKind::Ack,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CallError> {
        let data = match self {
            Self::Start(p) => serde_json::to_value(p)?,
            Self::Accept(p) => serde_json::to_value(p)?,
            Self::End(p) => serde_json::to_value(p)?,
            Self::Ack(p) => serde_json::to_value(p)?,
        };
        RelayFrame::new(self.kind(), data, None).encode()
    }

    /// Parse a frame a client sent to the relay.
    pub fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        let frame = RelayFrame::decode(bytes)?;
        match frame.kind()? {
            SignalKind::Start => Ok(Self::Start(frame.payload()?)),
            SignalKind::Accept => Ok(Self::Accept(frame.payload()?)),
            SignalKind::End => Ok(Self::End(frame.payload()?)),
            SignalKind::Ack => Ok(Self::Ack(frame.payload()?)),
            inbound => Err(CallError::Parse(format!(
                "{inbound} is not a client-to-relay event"
            ))),
        }
    }
}

/// Messages the relay delivers to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Incoming(IncomingPayload),
    Accepted(AcceptedPayload),
    Ended,
}

impl InboundSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Incoming(_) => SignalKind::Incoming,
            Self::Accepted(_) => SignalKind::Accepted,
            Self::Ended => SignalKind::Ended,
        }
    }

    /// Encode as the relay would deliver it.
    pub fn encode(&self, ack_id: Option<u64>) -> Result<Vec<u8>, CallError> {
        let data = match self {
            Self::Incoming(p) => serde_json::to_value(p)?,
            Self::Accepted(p) => serde_json::to_value(p)?,
            Self::Ended => Value::Null,
        };
        RelayFrame::new(self.kind(), data, ack_id).encode()
    }
}

/// A delivered frame after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignal {
    pub signal: InboundSignal,
    pub ack_id: Option<u64>,
}

impl ParsedSignal {
    pub fn parse(bytes: &[u8]) -> Result<Self, CallError> {
        let frame = RelayFrame::decode(bytes)?;
        let signal = match frame.kind()? {
            SignalKind::Incoming => InboundSignal::Incoming(frame.payload()?),
            SignalKind::Accepted => InboundSignal::Accepted(frame.payload()?),
            // call:ended needs no payload; whatever is there is ignored
            SignalKind::Ended => InboundSignal::Ended,
            outbound => {
                return Err(CallError::Parse(format!(
                    "{outbound} is not a relay-to-client event"
                )));
            }
        };
        Ok(Self {
            signal,
            ack_id: frame.ack_id,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RelayFrame {
    event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(default, rename = "ackId", skip_serializing_if = "Option::is_none")]
    ack_id: Option<u64>,
}

impl RelayFrame {
    fn new(kind: SignalKind, data: Value, ack_id: Option<u64>) -> Self {
        Self {
            event: kind.as_str().to_string(),
            data,
            ack_id,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, CallError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn kind(&self) -> Result<SignalKind, CallError> {
        self.event.parse()
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        if self.data.is_null() {
            return Err(CallError::Parse(format!("{} requires a payload", self.event)));
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
