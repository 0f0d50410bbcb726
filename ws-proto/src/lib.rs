use serde::{Deserialize, Serialize};

/// Messages sent by a participant to the hub.
#[derive(Clone, Debug, Deserialize, Serialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Image(Image),
    OnlineUsersCheck(OnlineUsersCheck),
    ChatMessage(ChatMessage),
}

/// Messages sent by the hub to a participant.
#[derive(Clone, Debug, Deserialize, Serialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Image(Image),
    OnlineUsers(OnlineUsers),
    ChatMessage(ChatMessage),
    Error(ErrorReport),
}

/// Latest media snapshot of a participant.
///
/// `data` is opaque to the hub, in practice a `data:` URL of a jpeg. `seq` is
/// issued by the hub when it accepts a publish and is absent on the way in.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Image {
    pub data: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OnlineUsersCheck {
    #[serde(default)]
    pub username: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OnlineUsers {
    pub users: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub content: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorReport {
    pub error: String,
}

impl ErrorReport {
    pub fn invalid_json() -> Self {
        Self {
            error: "Invalid JSON format".into(),
        }
    }
}

/// Body of `POST /api/login`. Both fields are hex encoded SHA-512 digests.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoginResponse {
    pub success: bool,
}

pub trait MessageExt {
    fn as_bytes(&self) -> &[u8];
    fn json<'a, T>(&'a self) -> Result<T, serde_json::Error>
    where
        T: Deserialize<'a> + 'a,
    {
        serde_json::from_slice(self.as_bytes())
    }
}

#[cfg(feature = "client")]
impl MessageExt for tungstenite::Message {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(string) => string.as_bytes(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data,
            Self::Close(None) => &[],
            Self::Close(Some(frame)) => frame.reason.as_bytes(),
            Self::Frame(frame) => frame.payload(),
        }
    }
}
