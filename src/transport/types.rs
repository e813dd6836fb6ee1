use serde::Serialize;

/// Channel tree node handed to the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub max_users: u32,
    pub position: i32,
    pub is_enter_restricted: bool,
    pub can_enter: bool,
    pub children: Vec<Channel>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub session: u32,
    pub external_id: i32,
    pub name: String,
    pub channel_id: u32,
    pub muted: bool,
    pub deafened: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub suppressed: bool,
    pub talking: bool,
    pub active_stream: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    SyncingRoster,
    Ready,
    Error,
}
