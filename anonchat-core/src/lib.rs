use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of messages requested per history page.
pub const HISTORY_PAGE_SIZE: usize = 30;
/// Scroll distance from the top of the message list (in UI units) below
/// which the next older history page is requested.
pub const SCROLL_TOP_THRESHOLD: f32 = 50.0;
/// WebSocket close code for a clean, intentional shutdown.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Upper bound on a single inbound text frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

pub type UserId = String;
/// Opaque server-issued timestamp. The backend emits ISO-8601 strings,
/// which order lexicographically, so cursor comparisons stay string-based.
pub type Timestamp = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "IMAGE")]
    Image,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// One chat message as it appears on the wire and in the history endpoint.
///
/// Live broadcasts may omit the timestamp; persisted history always carries
/// one. The sender is absent for server-generated content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserInfo>,
    pub content: String,
    #[serde(rename = "messageType", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Frames pushed by the server, discriminated by the `type` field.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "message")]
    Message(ChatMessage),
    #[serde(rename = "user_list_update")]
    UserListUpdate { users: Vec<UserInfo> },
    #[serde(rename = "system")]
    System { content: String },
}

/// Frames the client transmits.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "message")]
    Message {
        content: String,
        #[serde(rename = "messageType")]
        message_type: MessageKind,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no `type` discriminant")]
    MissingType,
    #[error("unrecognized frame type `{0}`")]
    UnknownType(String),
    #[error("malformed `{frame_type}` frame: {detail}")]
    MalformedFrame { frame_type: String, detail: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Decode one inbound text frame.
///
/// The discriminant is inspected before deserializing so that an unknown
/// `type` is reported distinctly from a malformed payload; the caller drops
/// both without tearing down the connection.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

    let frame_type = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match frame_type {
        "message" | "user_list_update" | "system" => serde_json::from_value(value.clone())
            .map_err(|err| ProtocolError::MalformedFrame {
                frame_type: frame_type.to_owned(),
                detail: err.to_string(),
            }),
        other => Err(ProtocolError::UnknownType(other.to_owned())),
    }
}

pub fn encode_frame(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|err| ProtocolError::Serialization(err.to_string()))
}

/// Close code `1000` is the only clean shutdown; everything else, including
/// a connection dropped without a close handshake (`None`), is abnormal.
pub fn close_is_normal(code: Option<u16>) -> bool {
    code == Some(NORMAL_CLOSE_CODE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    Chat,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineItem {
    pub message: ChatMessage,
    pub category: MessageCategory,
}

/// The merged, ordered message sequence the rendering layer displays.
///
/// Live messages are appended in arrival order; history pages are prepended
/// in front of everything already held. A page is expected to arrive
/// oldest-to-newest, so prepending keeps the whole sequence
/// timestamp-ascending.
#[derive(Debug, Default)]
pub struct Timeline {
    items: Vec<TimelineItem>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn push_live(&mut self, message: ChatMessage) -> &TimelineItem {
        self.items.push(TimelineItem {
            message,
            category: MessageCategory::Chat,
        });
        self.items.last().expect("push_live just appended")
    }

    pub fn push_system(&mut self, content: String) -> &TimelineItem {
        self.items.push(TimelineItem {
            message: ChatMessage {
                sender: None,
                content,
                kind: MessageKind::Text,
                timestamp: None,
            },
            category: MessageCategory::System,
        });
        self.items.last().expect("push_system just appended")
    }

    /// Prepend an ascending history page, returning how many items landed.
    ///
    /// Never reorders messages already held.
    pub fn prepend_page(&mut self, page: Vec<ChatMessage>) -> usize {
        let count = page.len();
        let mut merged: Vec<TimelineItem> = page
            .into_iter()
            .map(|message| TimelineItem {
                message,
                category: MessageCategory::Chat,
            })
            .collect();
        merged.append(&mut self.items);
        self.items = merged;
        count
    }
}
