use std::collections::HashMap;

use crate::transport::types::User;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RosterUser {
    pub session: u32,
    pub name: String,
    pub user_id: Option<u32>,
    pub channel_id: u32,
    pub muted: bool,
    pub deafened: bool,
    pub suppressed: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub comment: Option<String>,
    pub texture: Option<Vec<u8>>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
}

impl RosterUser {
    /// Numeric id the host knows this user by; names are numeric ids there.
    pub fn external_id(&self) -> i32 {
        self.name.trim().parse().unwrap_or(-1)
    }
}

/// User delta; `None` fields leave the cached value untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserStateUpdate {
    pub session: u32,
    pub name: Option<String>,
    pub user_id: Option<u32>,
    pub channel_id: Option<u32>,
    pub muted: Option<bool>,
    pub deafened: Option<bool>,
    pub suppressed: Option<bool>,
    pub self_muted: Option<bool>,
    pub self_deafened: Option<bool>,
    pub comment: Option<String>,
    pub texture: Option<Vec<u8>>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserChange {
    pub inserted: bool,
    pub channel_changed: bool,
    pub mute_changed: bool,
}

#[derive(Debug, Default)]
pub struct Roster {
    users: HashMap<u32, RosterUser>,
    local_session: Option<u32>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_session(&mut self, session: u32) {
        self.local_session = Some(session);
    }

    pub fn local_session(&self) -> Option<u32> {
        self.local_session
    }

    pub fn local_user(&self) -> Option<&RosterUser> {
        self.local_session.and_then(|session| self.users.get(&session))
    }

    pub fn user(&self, session: u32) -> Option<&RosterUser> {
        self.users.get(&session)
    }

    pub fn by_external_id(&self, external_id: i32) -> Option<&RosterUser> {
        self.users
            .values()
            .find(|user| user.external_id() == external_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn sessions(&self) -> Vec<u32> {
        self.users.keys().copied().collect()
    }

    pub fn apply_user_state(&mut self, update: UserStateUpdate) -> UserChange {
        let mut change = UserChange::default();
        let entry = self.users.entry(update.session).or_insert_with(|| {
            change.inserted = true;
            RosterUser {
                session: update.session,
                ..RosterUser::default()
            }
        });

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(user_id) = update.user_id {
            entry.user_id = Some(user_id);
        }
        if let Some(channel_id) = update.channel_id {
            change.channel_changed = entry.channel_id != channel_id || change.inserted;
            entry.channel_id = channel_id;
        }
        if let Some(muted) = update.muted {
            change.mute_changed |= entry.muted != muted;
            entry.muted = muted;
        }
        if let Some(deafened) = update.deafened {
            entry.deafened = deafened;
        }
        if let Some(suppressed) = update.suppressed {
            entry.suppressed = suppressed;
        }
        if let Some(self_muted) = update.self_muted {
            change.mute_changed |= entry.self_muted != self_muted;
            entry.self_muted = self_muted;
        }
        if let Some(self_deafened) = update.self_deafened {
            entry.self_deafened = self_deafened;
        }
        if let Some(comment) = update.comment {
            entry.comment = Some(comment);
        }
        if let Some(texture) = update.texture {
            entry.texture = Some(texture);
        }
        if let Some(plugin_context) = update.plugin_context {
            entry.plugin_context = Some(plugin_context);
        }
        if let Some(plugin_identity) = update.plugin_identity {
            entry.plugin_identity = Some(plugin_identity);
        }
        change
    }

    pub fn apply_user_remove(&mut self, session: u32) -> Option<RosterUser> {
        self.users.remove(&session)
    }

    /// Users with the local user first, then by external id.
    pub fn sorted(&self) -> Vec<&RosterUser> {
        let local = self.local_session;
        let mut users: Vec<&RosterUser> = self.users.values().collect();
        users.sort_by_key(|user| (Some(user.session) != local, user.external_id(), user.session));
        users
    }

    pub fn users(&self, talking: impl Fn(u32) -> (bool, bool)) -> Vec<User> {
        self.sorted()
            .into_iter()
            .map(|user| {
                let (active_stream, is_talking) = talking(user.session);
                User {
                    session: user.session,
                    external_id: user.external_id(),
                    name: user.name.clone(),
                    channel_id: user.channel_id,
                    muted: user.muted,
                    deafened: user.deafened,
                    self_muted: user.self_muted,
                    self_deafened: user.self_deafened,
                    suppressed: user.suppressed,
                    talking: is_talking,
                    active_stream,
                }
            })
            .collect()
    }
}
