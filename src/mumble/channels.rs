use std::collections::{BTreeSet, HashMap, HashSet};

use crate::transport::types::Channel;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    pub position: i32,
    pub description: Option<String>,
    pub max_users: u32,
    pub temporary: bool,
    pub is_enter_restricted: bool,
    /// `None` until the server says whether we may enter.
    pub can_enter: Option<bool>,
    pub links: BTreeSet<u32>,
}

/// Channel delta with set-if-present fields. `links` replaces the whole set;
/// `links_add` and `links_remove` patch it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStateUpdate {
    pub id: u32,
    pub name: Option<String>,
    pub parent_id: Option<u32>,
    pub position: Option<i32>,
    pub description: Option<String>,
    pub max_users: Option<u32>,
    pub temporary: Option<bool>,
    pub is_enter_restricted: Option<bool>,
    pub can_enter: Option<bool>,
    pub links: Option<Vec<u32>>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
}

/// Channels plus the derived "shares audio with" sets. Links are followed in
/// both directions when the sets are rebuilt.
#[derive(Debug, Default)]
pub struct ChannelGraph {
    channels: HashMap<u32, ChannelInfo>,
    audience: HashMap<u32, HashSet<u32>>,
}

impl ChannelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<&ChannelInfo> {
        self.channels.get(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn apply(&mut self, update: ChannelStateUpdate) {
        let entry = self
            .channels
            .entry(update.id)
            .or_insert_with(|| ChannelInfo {
                id: update.id,
                ..ChannelInfo::default()
            });

        if let Some(name) = update.name {
            entry.name = name;
        }
        if let Some(parent_id) = update.parent_id {
            entry.parent_id = Some(parent_id);
        }
        if let Some(position) = update.position {
            entry.position = position;
        }
        if let Some(description) = update.description {
            entry.description = Some(description);
        }
        if let Some(max_users) = update.max_users {
            entry.max_users = max_users;
        }
        if let Some(temporary) = update.temporary {
            entry.temporary = temporary;
        }
        if let Some(restricted) = update.is_enter_restricted {
            entry.is_enter_restricted = restricted;
        }
        if update.can_enter.is_some() {
            entry.can_enter = update.can_enter;
        }
        if let Some(links) = update.links {
            entry.links = links.into_iter().collect();
        }
        entry.links.extend(update.links_add);
        for id in update.links_remove {
            entry.links.remove(&id);
        }

        self.recompute();
    }

    pub fn remove(&mut self, id: u32) -> Option<ChannelInfo> {
        let removed = self.channels.remove(&id)?;
        for channel in self.channels.values_mut() {
            channel.links.remove(&id);
        }
        self.recompute();
        Some(removed)
    }

    /// Rebuilds every channel's audience from the current links.
    fn recompute(&mut self) {
        let mut adjacency: HashMap<u32, Vec<u32>> = HashMap::new();
        for channel in self.channels.values() {
            for &link in &channel.links {
                if !self.channels.contains_key(&link) {
                    continue;
                }
                adjacency.entry(channel.id).or_default().push(link);
                adjacency.entry(link).or_default().push(channel.id);
            }
        }

        self.audience.clear();
        for &start in self.channels.keys() {
            if self.audience.contains_key(&start) {
                continue;
            }
            let mut component = HashSet::new();
            let mut stack = vec![start];
            while let Some(id) = stack.pop() {
                if !component.insert(id) {
                    continue;
                }
                if let Some(neighbours) = adjacency.get(&id) {
                    stack.extend(neighbours.iter().copied());
                }
            }
            for &member in &component {
                self.audience.insert(member, component.clone());
            }
        }
    }

    pub fn shares_audio(&self, from: u32, to: u32) -> bool {
        if from == to {
            return true;
        }
        self.audience
            .get(&from)
            .is_some_and(|audience| audience.contains(&to))
    }

    pub fn shared_audience(&self, id: u32) -> Vec<u32> {
        let mut members: Vec<u32> = self
            .audience
            .get(&id)
            .map(|audience| audience.iter().copied().collect())
            .unwrap_or_else(|| vec![id]);
        members.sort_unstable();
        members
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels.values().find(|channel| channel.name == name)
    }

    /// Nested tree for the host, siblings ordered by position then name.
    pub fn tree(&self) -> Vec<Channel> {
        let mut children: HashMap<Option<u32>, Vec<&ChannelInfo>> = HashMap::new();
        for channel in self.channels.values() {
            let parent = channel
                .parent_id
                .filter(|parent| *parent != channel.id && self.channels.contains_key(parent));
            children.entry(parent).or_default().push(channel);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        }
        self.build_level(None, &children, &mut HashSet::new())
    }

    fn build_level(
        &self,
        parent: Option<u32>,
        children: &HashMap<Option<u32>, Vec<&ChannelInfo>>,
        visited: &mut HashSet<u32>,
    ) -> Vec<Channel> {
        let Some(siblings) = children.get(&parent) else {
            return Vec::new();
        };
        let mut level = Vec::with_capacity(siblings.len());
        for info in siblings {
            if !visited.insert(info.id) {
                continue;
            }
            level.push(Channel {
                id: info.id,
                name: info.name.clone(),
                description: info.description.clone(),
                max_users: info.max_users,
                position: info.position,
                is_enter_restricted: info.is_enter_restricted,
                can_enter: info.can_enter.unwrap_or(true),
                children: self.build_level(Some(info.id), children, visited),
            });
        }
        level
    }
}
