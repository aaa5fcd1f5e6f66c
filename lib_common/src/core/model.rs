//! # Wire and Domain Model
//!
//! The JSON control envelope exchanged with the upstream feed, the
//! [`RealTimeUpdate`] produced from every inbound `data` message, and the
//! [`Scope`] context (active sport) that filters and stamps them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::utils::misc::utils::{generate_id, millis_to_rfc3339, now_millis, parse_timestamp};

/// The `type` field of a control envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Authenticate,
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Data,
    Error,
}

/// `{type, channel?, data?, id?, timestamp}` as sent and received on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// RFC 3339 on the way out; inbound frames may carry epoch millis instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl ControlMessage {
    /// Builds an outbound envelope stamped with a fresh id and the current time.
    pub fn outbound(kind: MessageType, channel: Option<String>, data: Option<Value>) -> Self {
        Self {
            kind,
            channel,
            data,
            id: Some(generate_id()),
            timestamp: Some(Value::String(millis_to_rfc3339(now_millis()))),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unrecognized frame: {0}")]
    Unrecognized(#[source] serde_json::Error),
    #[error("data message without a string `type`")]
    UntypedUpdate,
    #[error("data message without an object payload")]
    MissingData,
}

/// An inbound frame, classified for the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Pong { id: Option<String> },
    Data(Value),
    Error(String),
    /// A well-formed frame of a type the client does not act on.
    Ignored(MessageType),
}

/// Parses one text frame from the transport.
pub fn parse_inbound(text: &str) -> Result<Inbound, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    let message: ControlMessage = serde_json::from_value(value).map_err(FrameError::Unrecognized)?;
    Ok(match message.kind {
        MessageType::Pong => Inbound::Pong { id: message.id },
        MessageType::Data => match message.data {
            Some(data @ Value::Object(_)) => Inbound::Data(data),
            _ => return Err(FrameError::MissingData),
        },
        MessageType::Error => Inbound::Error(
            message
                .data
                .as_ref()
                .and_then(|d| d.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        ),
        other => Inbound::Ignored(other),
    })
}

/// The kind of a live update. Unrecognized kinds are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateKind {
    Score,
    Stat,
    Event,
    Injury,
    Substitution,
    Penalty,
    Other(String),
}

impl UpdateKind {
    pub fn as_str(&self) -> &str {
        match self {
            UpdateKind::Score => "score",
            UpdateKind::Stat => "stat",
            UpdateKind::Event => "event",
            UpdateKind::Injury => "injury",
            UpdateKind::Substitution => "substitution",
            UpdateKind::Penalty => "penalty",
            UpdateKind::Other(s) => s,
        }
    }

    /// Flush ordering weight; higher goes first.
    pub fn priority(&self) -> u8 {
        match self {
            UpdateKind::Score => 10,
            UpdateKind::Injury => 9,
            UpdateKind::Event => 7,
            UpdateKind::Substitution | UpdateKind::Penalty => 6,
            UpdateKind::Stat => 5,
            UpdateKind::Other(_) => 1,
        }
    }
}

impl From<String> for UpdateKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "score" => UpdateKind::Score,
            "stat" => UpdateKind::Stat,
            "event" => UpdateKind::Event,
            "injury" => UpdateKind::Injury,
            "substitution" => UpdateKind::Substitution,
            "penalty" => UpdateKind::Penalty,
            _ => UpdateKind::Other(s),
        }
    }
}

impl From<&str> for UpdateKind {
    fn from(s: &str) -> Self {
        UpdateKind::from(s.to_string())
    }
}

impl From<UpdateKind> for String {
    fn from(kind: UpdateKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active context of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub sport: Option<String>,
}

impl Scope {
    pub fn sport(sport: impl Into<String>) -> Self {
        Self { sport: Some(sport.into()) }
    }
}

/// Which sport/game/player/team an update is about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// One live update. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub scope: UpdateScope,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub payload: Value,
    pub source: String,
    pub reliability: f64,
}

impl RealTimeUpdate {
    /// Builds an update from the `data` object of an inbound `data` message.
    ///
    /// Missing fields fall back to: a generated id, the active sport, now,
    /// the whole data object as payload, source `websocket`, reliability 1.0.
    pub fn from_data(data: &Value, active: &Scope) -> Result<Self, FrameError> {
        let obj = data.as_object().ok_or(FrameError::MissingData)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::UntypedUpdate)?;

        Ok(Self {
            id: string_field(obj, "id").unwrap_or_else(generate_id),
            kind: UpdateKind::from(kind),
            scope: UpdateScope {
                sport: string_field(obj, "sport").or_else(|| active.sport.clone()),
                game_id: string_field(obj, "gameId"),
                player_id: string_field(obj, "playerId"),
                team_id: string_field(obj, "teamId"),
            },
            timestamp: obj.get("timestamp").and_then(parse_timestamp).unwrap_or_else(now_millis),
            payload: obj.get("payload").cloned().unwrap_or_else(|| data.clone()),
            source: string_field(obj, "source").unwrap_or_else(|| "websocket".to_string()),
            reliability: obj.get("reliability").and_then(Value::as_f64).unwrap_or(1.0),
        })
    }
}

/// Ids may arrive as strings or numbers.
fn string_field(obj: &Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Per-channel filter template sent with every `subscribe`.
pub fn channel_filters(channel: &str) -> Value {
    match channel {
        "live_scores" => json!({"includeInProgress": true, "includeFinal": false}),
        "player_stats" => json!({"includeAdvanced": true, "realTimeOnly": true}),
        "game_events" => json!({"includeMinor": false, "priority": "high"}),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_the_table() {
        let order: Vec<u8> = ["score", "injury", "event", "substitution", "penalty", "stat", "weather"]
            .iter()
            .map(|k| UpdateKind::from(*k).priority())
            .collect();
        assert_eq!(order, vec![10, 9, 7, 6, 6, 5, 1]);
    }

    #[test]
    fn update_kind_serializes_as_plain_string() {
        assert_eq!(serde_json::to_value(UpdateKind::Injury).unwrap(), json!("injury"));
        let kind: UpdateKind = serde_json::from_value(json!("weather")).unwrap();
        assert_eq!(kind, UpdateKind::Other("weather".into()));
    }

    #[test]
    fn update_defaults_fill_missing_fields() {
        let data = json!({"type": "score", "gameId": 77, "home": 3});
        let update = RealTimeUpdate::from_data(&data, &Scope::sport("NFL")).unwrap();
        assert_eq!(update.kind, UpdateKind::Score);
        assert_eq!(update.scope.sport.as_deref(), Some("NFL"));
        assert_eq!(update.scope.game_id.as_deref(), Some("77"));
        assert_eq!(update.payload, data);
        assert_eq!(update.source, "websocket");
        assert_eq!(update.reliability, 1.0);
        assert_eq!(update.id.len(), 9);
    }

    #[test]
    fn update_keeps_explicit_fields() {
        let data = json!({
            "id": "u1", "type": "injury", "sport": "NBA", "playerId": "p9",
            "timestamp": 1_700_000_000_000i64, "payload": {"status": "out"},
            "source": "feed", "reliability": 0.8
        });
        let update = RealTimeUpdate::from_data(&data, &Scope::sport("NFL")).unwrap();
        assert_eq!(update.id, "u1");
        assert_eq!(update.scope.sport.as_deref(), Some("NBA"));
        assert_eq!(update.timestamp, 1_700_000_000_000);
        assert_eq!(update.payload, json!({"status": "out"}));
        assert_eq!(update.source, "feed");
        assert_eq!(update.reliability, 0.8);
    }

    #[test]
    fn untyped_data_is_rejected() {
        let err = RealTimeUpdate::from_data(&json!({"home": 1}), &Scope::default()).unwrap_err();
        assert!(matches!(err, FrameError::UntypedUpdate));
    }

    #[test]
    fn inbound_frames_are_classified() {
        assert_eq!(
            parse_inbound(r#"{"type":"pong","id":"abc"}"#).unwrap(),
            Inbound::Pong { id: Some("abc".into()) }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"error","data":{"message":"rate limited"}}"#).unwrap(),
            Inbound::Error("rate limited".into())
        );
        assert_eq!(parse_inbound(r#"{"type":"error"}"#).unwrap(), Inbound::Error("Unknown error".into()));
        assert!(matches!(
            parse_inbound(r#"{"type":"data","data":{"type":"stat"},"timestamp":5}"#).unwrap(),
            Inbound::Data(_)
        ));
        assert!(matches!(parse_inbound("{oops"), Err(FrameError::Malformed(_))));
        assert!(matches!(parse_inbound(r#"{"type":"teleport"}"#), Err(FrameError::Unrecognized(_))));
        assert!(matches!(parse_inbound(r#"{"type":"data"}"#), Err(FrameError::MissingData)));
    }

    #[test]
    fn outbound_envelope_shape() {
        let msg = ControlMessage::outbound(MessageType::Subscribe, Some("live_scores".into()), None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["channel"], "live_scores");
        assert!(value.get("data").is_none());
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn filter_templates() {
        assert_eq!(channel_filters("live_scores")["includeFinal"], json!(false));
        assert_eq!(channel_filters("game_events")["priority"], json!("high"));
        assert_eq!(channel_filters("anything"), json!({}));
    }
}
