//! Hub messages and their SignalR JSON-protocol framing.
//!
//! Every record on the wire is a JSON object terminated by `0x1E`; one
//! websocket text message may carry several records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Hub-to-client invocations this client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AnswerFromTaker(SessionDescription),
    AnswerFromProctor {
        proctor: String,
        answer: SessionDescription,
    },
    IceCandidateFromTaker(IceCandidate),
    IceCandidateFromProctor {
        proctor: String,
        candidate: IceCandidate,
    },
    ExamEnded,
}

/// Client-to-hub invocations.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    OfferToTaker(SessionDescription),
    OfferToProctor {
        proctor: String,
        offer: SessionDescription,
    },
}

impl OutboundMessage {
    pub fn target(&self) -> &'static str {
        match self {
            OutboundMessage::OfferToTaker(_) => "CameraOfferToTaker",
            OutboundMessage::OfferToProctor { .. } => "CameraOfferToProctor",
        }
    }

    fn arguments(&self) -> Result<Vec<Value>> {
        Ok(match self {
            OutboundMessage::OfferToTaker(offer) => vec![serde_json::to_value(offer)?],
            OutboundMessage::OfferToProctor { proctor, offer } => {
                vec![Value::String(proctor.clone()), serde_json::to_value(offer)?]
            }
        })
    }
}

/// One decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Invocation(InboundMessage),
    Ping,
    Close(Option<String>),
    /// Well-formed but not something this client acts on.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

pub fn ping_record() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}

/// Splits a websocket payload into its non-empty records.
pub fn split_records(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
}

/// Checks the server's handshake reply: `{}` on success, `{"error": ...}` otherwise.
pub fn check_handshake(record: &str) -> Result<()> {
    let value: Value = serde_json::from_str(record)?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(Error::SignalingTransport(format!("hub handshake rejected: {error}"))),
        None => Ok(()),
    }
}

pub fn encode(message: &OutboundMessage) -> Result<String> {
    let record = json!({
        "type": INVOCATION,
        "target": message.target(),
        "arguments": message.arguments()?,
    });
    Ok(format!("{record}{RECORD_SEPARATOR}"))
}

pub fn decode(record: &str) -> Result<HubFrame> {
    let raw: RawRecord = serde_json::from_str(record)?;
    match raw.kind {
        INVOCATION => decode_invocation(raw.target.as_deref().unwrap_or_default(), raw.arguments),
        PING => Ok(HubFrame::Ping),
        CLOSE => Ok(HubFrame::Close(raw.error)),
        _ => Ok(HubFrame::Ignored),
    }
}

fn decode_invocation(target: &str, arguments: Vec<Value>) -> Result<HubFrame> {
    let mut args = arguments.into_iter();
    let message = match target {
        "CameraAnswerFromTaker" => InboundMessage::AnswerFromTaker(description(args.next())?),
        "CameraAnswerFromProctor" => InboundMessage::AnswerFromProctor {
            proctor: viewer_id(args.next())?,
            answer: description(args.next())?,
        },
        "CameraIceCandidateFromTaker" => InboundMessage::IceCandidateFromTaker(candidate(args.next())?),
        "CameraIceCandidateFromProctor" => InboundMessage::IceCandidateFromProctor {
            proctor: viewer_id(args.next())?,
            candidate: candidate(args.next())?,
        },
        "ExamEnded" => InboundMessage::ExamEnded,
        _ => return Ok(HubFrame::Ignored),
    };
    Ok(HubFrame::Invocation(message))
}

fn missing(what: &str) -> Error {
    Error::SignalingTransport(format!("hub invocation missing {what}"))
}

// Proctor ids arrive as strings or bare numbers depending on the server build.
fn viewer_id(value: Option<Value>) -> Result<String> {
    match value.ok_or_else(|| missing("viewer id"))? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(Error::SignalingTransport(format!("unexpected viewer id {other}"))),
    }
}

fn description(value: Option<Value>) -> Result<SessionDescription> {
    match value.ok_or_else(|| missing("session description"))? {
        Value::String(sdp) => Ok(SessionDescription::answer(sdp)),
        other => Ok(serde_json::from_value(other)?),
    }
}

fn candidate(value: Option<Value>) -> Result<IceCandidate> {
    Ok(serde_json::from_value(value.ok_or_else(|| missing("ice candidate"))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_to_proctor_is_an_invocation_record() {
        let encoded = encode(&OutboundMessage::OfferToProctor {
            proctor: "p-7".into(),
            offer: SessionDescription::offer("v=0"),
        })
        .unwrap();

        assert!(encoded.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(encoded.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["target"], "CameraOfferToProctor");
        assert_eq!(value["arguments"][0], "p-7");
        assert_eq!(value["arguments"][1]["type"], "offer");
        assert_eq!(value["arguments"][1]["sdp"], "v=0");
    }

    #[test]
    fn payload_with_several_records_splits() {
        let payload = format!(
            "{}{RECORD_SEPARATOR}{}{RECORD_SEPARATOR}",
            r#"{"type":6}"#, r#"{"type":1,"target":"ExamEnded","arguments":[]}"#
        );
        let frames: Vec<HubFrame> = split_records(&payload).map(|r| decode(r).unwrap()).collect();
        assert_eq!(
            frames,
            vec![HubFrame::Ping, HubFrame::Invocation(InboundMessage::ExamEnded)]
        );
    }

    #[test]
    fn proctor_answer_and_candidate_decode() {
        let answer = decode(
            r#"{"type":1,"target":"CameraAnswerFromProctor","arguments":[42,{"sdp":"v=0 a","type":"answer"}]}"#,
        )
        .unwrap();
        assert_eq!(
            answer,
            HubFrame::Invocation(InboundMessage::AnswerFromProctor {
                proctor: "42".into(),
                answer: SessionDescription::answer("v=0 a"),
            })
        );

        let ice = decode(
            r#"{"type":1,"target":"CameraIceCandidateFromTaker","arguments":[{"candidate":"candidate:1 1 udp","sdpMid":"0","sdpMLineIndex":0}]}"#,
        )
        .unwrap();
        assert_eq!(
            ice,
            HubFrame::Invocation(InboundMessage::IceCandidateFromTaker(IceCandidate {
                candidate: "candidate:1 1 udp".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }))
        );
    }

    #[test]
    fn unknown_targets_and_types_are_ignored() {
        assert_eq!(
            decode(r#"{"type":1,"target":"SomethingElse","arguments":[]}"#).unwrap(),
            HubFrame::Ignored
        );
        assert_eq!(decode(r#"{"type":3,"invocationId":"1"}"#).unwrap(), HubFrame::Ignored);
    }

    #[test]
    fn close_carries_the_server_error() {
        assert_eq!(
            decode(r#"{"type":7,"error":"Connection closed with an error."}"#).unwrap(),
            HubFrame::Close(Some("Connection closed with an error.".into()))
        );
    }

    #[test]
    fn malformed_invocation_is_an_error() {
        assert!(decode(r#"{"type":1,"target":"CameraAnswerFromProctor","arguments":["p"]}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn handshake_reply_errors_surface() {
        assert!(check_handshake("{}").is_ok());
        assert!(matches!(
            check_handshake(r#"{"error":"unsupported protocol"}"#),
            Err(Error::SignalingTransport(_))
        ));
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }
}
