use crate::transport::types::{Channel, ConnState, User};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessage {
    pub actor_id: Option<u32>,
    pub actor_name: Option<String>,
    pub message: String,
}

/// Notifications for the host, delivered in order on a single channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    ConnectionState(ConnState),
    Channels(Vec<Channel>),
    Users(Vec<User>),
    Text(TextMessage),
    Ping(f32),
    Error(String),
}
