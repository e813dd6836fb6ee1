//! Connection session: roster and channel graph kept in sync with the server,
//! audibility of every remote user, and the host actions that turn into
//! control requests.
//!
//! All state lives behind one lock. The control read loop and the host tick
//! both go through it, so roster patches and audibility passes never
//! interleave.

use crate::mumble::capture::{MicGate, Microphone};
use crate::mumble::channels::ChannelGraph;
use crate::mumble::commands::Command;
use crate::mumble::config::MumbleConfig;
use crate::mumble::control::{ControlMessage, ControlRequest, ControlSink, UserStateCommand};
use crate::mumble::crypt::CryptState;
use crate::mumble::decode::DecodeHandle;
use crate::mumble::encode::EncodePipeline;
use crate::mumble::events::{SessionEvent, TextMessage};
use crate::mumble::playback::{AudioSink, SpeakerBuffer};
use crate::mumble::pool::BufferPool;
use crate::mumble::state::{Roster, UserStateUpdate};
use crate::mumble::udp::{dispatch_plain, MediaConnector};
use crate::mumble::varint::Vec3;
use crate::mumble::voice::SpeechTarget;
use crate::transport::errors::{SessionOutcome, TransportError};
use crate::transport::types::{Channel, ConnState, User};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Host frame counter must move at least this often.
pub const HOST_TIMEOUT: Duration = Duration::from_secs(5);
const PING_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Local user changes requested before the server finished syncing. Replayed
/// in field order once it has.
#[derive(Debug, Default)]
struct PendingActions {
    channel: Option<String>,
    self_mute: Option<bool>,
    plugin_context: Option<Vec<u8>>,
    plugin_identity: Option<String>,
    comment: Option<String>,
    texture: Option<Vec<u8>>,
}

struct SessionState {
    conn_state: ConnState,
    roster: Roster,
    channels: ChannelGraph,
    speakers: HashMap<u32, Arc<SpeakerBuffer>>,
    /// Per-user volume overrides by external id; absent means 1.0.
    volumes: HashMap<i32, f32>,
    pending: PendingActions,
    loopback: bool,
    server_configured: bool,
    outcome: Option<SessionOutcome>,
    roster_dirty: bool,
    channels_dirty: bool,
    since_ping_report: Duration,
}

/// Collaborators the session drives. Swapped for fakes in tests.
pub struct SessionDeps {
    pub control: Arc<dyn ControlSink>,
    pub media: Arc<dyn MediaConnector>,
    pub decode: DecodeHandle,
    pub encode: EncodePipeline,
    pub events: Sender<SessionEvent>,
}

pub struct Session {
    username: String,
    password: Option<String>,
    user_agent: String,
    output_channels: usize,
    send_position: bool,
    state: Mutex<SessionState>,
    microphone: Mutex<Option<Microphone>>,
    control: Arc<dyn ControlSink>,
    media: Arc<dyn MediaConnector>,
    decode: DecodeHandle,
    voice_pool: BufferPool<u8>,
    events: Sender<SessionEvent>,
}

impl Session {
    pub fn new(config: &MumbleConfig, deps: SessionDeps) -> Self {
        let pending = PendingActions {
            comment: config.admin_comment.clone(),
            ..PendingActions::default()
        };
        let gate = MicGate::new(config.input_mode, config.min_amplitude);
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            user_agent: config.user_agent.clone(),
            output_channels: config.output_channels,
            send_position: config.send_position,
            state: Mutex::new(SessionState {
                conn_state: ConnState::Connecting,
                roster: Roster::new(),
                channels: ChannelGraph::new(),
                speakers: HashMap::new(),
                volumes: HashMap::new(),
                pending,
                loopback: config.loopback,
                server_configured: false,
                outcome: None,
                roster_dirty: false,
                channels_dirty: false,
                since_ping_report: Duration::ZERO,
            }),
            microphone: Mutex::new(Some(Microphone::new(gate, deps.encode))),
            control: deps.control,
            media: deps.media,
            decode: deps.decode,
            voice_pool: BufferPool::new("tunnel", 256),
            events: deps.events,
        }
    }

    /// Opens the exchange; the server answers with its version.
    pub fn start(&self) -> Result<(), TransportError> {
        self.control.send(ControlRequest::Version {
            release: self.user_agent.clone(),
            os: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
        })?;
        let mut state = self.state.lock();
        self.set_conn_state(&mut state, ConnState::Authenticating);
        Ok(())
    }

    pub fn conn_state(&self) -> ConnState {
        self.state.lock().conn_state
    }

    pub fn is_server_configured(&self) -> bool {
        self.state.lock().server_configured
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.state.lock().outcome.clone()
    }

    /// Records why the session ends. The first cause wins.
    pub fn fail(&self, outcome: SessionOutcome) {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            return;
        }
        let next = match outcome {
            SessionOutcome::Closed => ConnState::Disconnected,
            _ => ConnState::Error,
        };
        if next == ConnState::Error {
            self.emit(SessionEvent::Error(format!("{outcome:?}")));
        }
        state.outcome = Some(outcome);
        self.set_conn_state(&mut state, next);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn send(&self, request: ControlRequest) {
        if let Err(err) = self.control.send(request) {
            error!("failed to send control message: {err}");
        }
    }

    fn set_conn_state(&self, state: &mut SessionState, next: ConnState) {
        if state.conn_state == next {
            return;
        }
        debug!("connection state {:?} -> {next:?}", state.conn_state);
        state.conn_state = next;
        self.emit(SessionEvent::ConnectionState(next));
    }

    fn note_syncing(&self, state: &mut SessionState) {
        if state.conn_state == ConnState::Authenticating {
            self.set_conn_state(state, ConnState::SyncingRoster);
        }
    }

    /// Local session id once the server has finished syncing.
    fn ready_session(state: &SessionState) -> Option<u32> {
        match state.conn_state {
            ConnState::Ready => state.roster.local_session(),
            _ => None,
        }
    }

    pub fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Version { release } => {
                debug!("server version {}", release.as_deref().unwrap_or("unknown"));
                self.send(ControlRequest::Authenticate {
                    username: self.username.clone(),
                    password: self.password.clone(),
                });
            }
            ControlMessage::Tunnel(voice) => {
                if let Err(err) = dispatch_plain(&voice, &self.decode, &self.voice_pool) {
                    warn!("dropping tunnelled voice: {err}");
                }
            }
            ControlMessage::CryptSetup {
                key,
                client_nonce,
                server_nonce,
            } => self.handle_crypt_setup(key, client_nonce, server_nonce),
            ControlMessage::Reject { reason } => {
                error!("server rejected connection: {reason}");
                self.fail(SessionOutcome::from_reject_reason(&reason));
            }
            ControlMessage::PermissionDenied { reason, name } => {
                let reason = reason
                    .or(name)
                    .unwrap_or_else(|| "permission denied".to_string());
                warn!("permission denied: {reason}");
                self.emit(SessionEvent::Error(reason));
            }
            ControlMessage::UserRemove { session, reason } => {
                let mut state = self.state.lock();
                if state.roster.local_session() == Some(session) {
                    drop(state);
                    let reason = reason.unwrap_or_else(|| "removed from server".to_string());
                    warn!("removed from server: {reason}");
                    self.fail(SessionOutcome::from_reject_reason(&reason));
                    return;
                }
                if state.roster.apply_user_remove(session).is_some() {
                    debug!("user {session} left");
                }
                self.remove_decoding_buffer(&mut state, session);
                state.roster_dirty = true;
            }
            other => {
                let mut state = self.state.lock();
                self.apply_state_message(&mut state, other);
            }
        }
    }

    fn apply_state_message(&self, state: &mut SessionState, message: ControlMessage) {
        match message {
            ControlMessage::ServerSync {
                session,
                max_bandwidth,
                welcome_text,
            } => {
                info!("connected as session {session}");
                if let Some(text) = welcome_text.filter(|text| !text.is_empty()) {
                    info!("welcome message: {text}");
                }
                if let Some(bandwidth) = max_bandwidth {
                    debug!("server bandwidth limit {bandwidth}");
                }
                state.roster.set_local_session(session);
                state.roster_dirty = true;
                self.set_conn_state(state, ConnState::Ready);
                self.reevaluate_locked(state);
                self.replay_pending(state);
            }
            ControlMessage::ServerConfig => {
                debug!("server config received");
                state.server_configured = true;
            }
            ControlMessage::ChannelState(update) => {
                self.note_syncing(state);
                let links_changed = update.links.is_some()
                    || !update.links_add.is_empty()
                    || !update.links_remove.is_empty();
                state.channels.apply(update);
                state.channels_dirty = true;
                if links_changed && Self::ready_session(state).is_some() {
                    self.reevaluate_locked(state);
                }
            }
            ControlMessage::ChannelRemove { id } => {
                if state.channels.remove(id).is_some() {
                    state.channels_dirty = true;
                    self.reevaluate_locked(state);
                }
            }
            ControlMessage::UserState(update) => {
                self.note_syncing(state);
                self.apply_user_state(state, update);
            }
            ControlMessage::TextMessage { actor, message } => {
                let actor_name = actor
                    .and_then(|session| state.roster.user(session))
                    .map(|user| user.name.clone());
                info!(
                    "message from {}: {message}",
                    actor_name.as_deref().unwrap_or("server")
                );
                self.emit(SessionEvent::Text(TextMessage {
                    actor_id: actor,
                    actor_name,
                    message,
                }));
            }
            other => debug!("ignoring control message {other:?}"),
        }
    }

    fn apply_user_state(&self, state: &mut SessionState, update: UserStateUpdate) {
        let session = update.session;
        let change = state.roster.apply_user_state(update);
        state.roster_dirty = true;
        if change.inserted {
            debug!("user {session} joined");
        }

        let Some(local) = state.roster.local_session() else {
            return;
        };
        if local == session && change.channel_changed {
            self.reevaluate_locked(state);
        } else {
            self.evaluate_user(state, session);
        }
    }

    fn handle_crypt_setup(
        &self,
        key: Option<Vec<u8>>,
        client_nonce: Option<Vec<u8>>,
        server_nonce: Option<Vec<u8>>,
    ) {
        {
            let mut state = self.state.lock();
            self.note_syncing(&mut state);
        }
        match (key, client_nonce, server_nonce) {
            (Some(key), Some(client_nonce), Some(server_nonce)) => {
                let connected = CryptState::new(&key, &client_nonce, &server_nonce)
                    .map_err(TransportError::from)
                    .and_then(|crypt| self.media.connect(crypt));
                match connected {
                    Ok(()) => info!("voice encryption keyed"),
                    Err(err) => {
                        error!("failed to open media channel: {err}");
                        self.emit(SessionEvent::Error(err.to_string()));
                    }
                }
            }
            (_, _, Some(server_nonce)) => {
                debug!("server resynchronised crypt nonce");
                if let Err(err) = self.media.set_server_nonce(&server_nonce) {
                    warn!("failed to apply server nonce: {err}");
                }
            }
            _ => match self.media.client_nonce() {
                Some(client_nonce) => {
                    debug!("server requested crypt resync");
                    self.send(ControlRequest::CryptSetup { client_nonce });
                }
                None => warn!("crypt resync requested before crypt setup"),
            },
        }
    }

    fn should_add(state: &SessionState, session: u32) -> bool {
        let (Some(local), Some(user)) = (state.roster.local_user(), state.roster.user(session))
        else {
            return false;
        };
        (user.session != local.session || state.loopback)
            && state.channels.shares_audio(local.channel_id, user.channel_id)
            && !user.muted
            && !user.self_muted
            && state
                .volumes
                .get(&user.external_id())
                .map_or(true, |volume| *volume > 0.0)
    }

    /// `true` when voice from `session` should currently be decoded and played.
    pub fn should_add_audio_player(&self, session: u32) -> bool {
        Self::should_add(&self.state.lock(), session)
    }

    fn evaluate_user(&self, state: &mut SessionState, session: u32) {
        if Self::should_add(state, session) {
            self.add_decoding_buffer(state, session);
        } else {
            self.remove_decoding_buffer(state, session);
        }
    }

    fn reevaluate_locked(&self, state: &mut SessionState) {
        for session in state.roster.sessions() {
            self.evaluate_user(state, session);
        }
    }

    /// Re-applies the audibility rule to every known user.
    pub fn reevaluate_all(&self) {
        let mut state = self.state.lock();
        self.reevaluate_locked(&mut state);
    }

    fn add_decoding_buffer(&self, state: &mut SessionState, session: u32) {
        if state.speakers.contains_key(&session) {
            return;
        }
        let volume = state
            .roster
            .user(session)
            .and_then(|user| state.volumes.get(&user.external_id()).copied())
            .unwrap_or(1.0);
        let speaker = Arc::new(SpeakerBuffer::new(session, self.output_channels));
        speaker.set_volume(volume);
        state.speakers.insert(session, Arc::clone(&speaker));
        debug!("decoding voice from {session}");
        self.decode
            .start_decoding(session, speaker as Arc<dyn AudioSink>);
    }

    fn remove_decoding_buffer(&self, state: &mut SessionState, session: u32) {
        if let Some(speaker) = state.speakers.remove(&session) {
            speaker.close();
            debug!("stopped decoding voice from {session}");
            self.decode.stop_decoding(session);
        }
    }

    fn replay_pending(&self, state: &mut SessionState) {
        if let Some(channel) = state.pending.channel.take() {
            self.join_channel_locked(state, &channel);
        }
        if let Some(mute) = state.pending.self_mute.take() {
            self.set_self_mute_locked(state, mute);
        }
        if let Some(context) = state.pending.plugin_context.take() {
            self.push_local_state(state, |command| command.plugin_context = Some(context));
        }
        if let Some(identity) = state.pending.plugin_identity.take() {
            self.push_local_state(state, |command| command.plugin_identity = Some(identity));
        }
        if let Some(comment) = state.pending.comment.take() {
            self.push_local_state(state, |command| command.comment = Some(comment));
        }
        if let Some(texture) = state.pending.texture.take() {
            self.push_local_state(state, |command| command.texture = Some(texture));
        }
    }

    /// Applies a local-user change to the roster and sends it to the server.
    fn push_local_state(&self, state: &mut SessionState, fill: impl FnOnce(&mut UserStateCommand)) {
        let Some(session) = Self::ready_session(state) else {
            return;
        };
        let mut command = UserStateCommand {
            session_id: session,
            ..UserStateCommand::default()
        };
        fill(&mut command);
        state.roster.apply_user_state(UserStateUpdate {
            session,
            self_muted: command.self_mute,
            comment: command.comment.clone(),
            texture: command.texture.clone(),
            plugin_context: command.plugin_context.clone(),
            plugin_identity: command.plugin_identity.clone(),
            ..UserStateUpdate::default()
        });
        state.roster_dirty = true;
        self.send(ControlRequest::UserState(command));
    }

    fn join_channel_locked(&self, state: &mut SessionState, name: &str) {
        let Some(session) = Self::ready_session(state) else {
            state.pending.channel = Some(name.to_string());
            return;
        };
        let Some(channel) = state.channels.find_by_name(name) else {
            warn!("channel not found: {name}");
            return;
        };
        if channel.can_enter == Some(false) {
            warn!("not allowed to enter channel {name}");
            return;
        }
        let channel_id = channel.id;
        let local = state.roster.local_user().cloned().unwrap_or_default();
        let self_mute = state.pending.self_mute.take().unwrap_or(local.self_muted);
        let plugin_context = state.pending.plugin_context.take().or(local.plugin_context);
        let plugin_identity = state.pending.plugin_identity.take().or(local.plugin_identity);
        info!("joining channel {name}");
        self.send(ControlRequest::UserState(UserStateCommand {
            session_id: session,
            channel_id: Some(channel_id),
            self_mute: Some(self_mute),
            plugin_context,
            plugin_identity,
            ..UserStateCommand::default()
        }));
    }

    pub fn join_channel(&self, name: &str) {
        let mut state = self.state.lock();
        self.join_channel_locked(&mut state, name);
    }

    fn set_self_mute_locked(&self, state: &mut SessionState, mute: bool) {
        if Self::ready_session(state).is_none() {
            state.pending.self_mute = Some(mute);
            return;
        }
        self.push_local_state(state, |command| command.self_mute = Some(mute));
    }

    pub fn set_self_mute(&self, mute: bool) {
        let mut state = self.state.lock();
        self.set_self_mute_locked(&mut state, mute);
    }

    pub fn set_plugin_context(&self, context: Vec<u8>) {
        let mut state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            state.pending.plugin_context = Some(context);
            return;
        }
        self.push_local_state(&mut state, |command| command.plugin_context = Some(context));
    }

    pub fn set_plugin_identity(&self, identity: String) {
        let mut state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            state.pending.plugin_identity = Some(identity);
            return;
        }
        self.push_local_state(&mut state, |command| command.plugin_identity = Some(identity));
    }

    pub fn set_comment(&self, comment: String) {
        let mut state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            state.pending.comment = Some(comment);
            return;
        }
        self.push_local_state(&mut state, |command| command.comment = Some(comment));
    }

    pub fn set_texture(&self, texture: Vec<u8>) {
        let mut state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            state.pending.texture = Some(texture);
            return;
        }
        self.push_local_state(&mut state, |command| command.texture = Some(texture));
    }

    /// Sends a text message to everyone in our current channel.
    pub fn send_text_message(&self, message: String) {
        let state = self.state.lock();
        let Some(channel_id) = Self::ready_session(&state)
            .and(state.roster.local_user())
            .map(|user| user.channel_id)
        else {
            warn!("not connected, dropping text message");
            return;
        };
        self.send(ControlRequest::TextMessage {
            channel_id,
            message,
        });
    }

    pub fn create_channel(
        &self,
        name: &str,
        parent: u32,
        temporary: bool,
        description: Option<String>,
        max_users: Option<u32>,
    ) {
        let state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            warn!("not connected, cannot create channel {name}");
            return;
        }
        self.send(ControlRequest::CreateChannel {
            parent,
            name: name.to_string(),
            temporary,
            description,
            max_users,
        });
    }

    pub fn destroy_channel(&self, name: &str) {
        let state = self.state.lock();
        if Self::ready_session(&state).is_none() {
            warn!("not connected, cannot remove channel {name}");
            return;
        }
        match state.channels.find_by_name(name) {
            Some(channel) => self.send(ControlRequest::RemoveChannel {
                channel_id: channel.id,
            }),
            None => error!("channel to remove not found: {name}"),
        }
    }

    /// Sets the playback volume for a user by external id. `1.0` clears the
    /// override and `0.0` stops decoding them entirely.
    pub fn configure_user(&self, external_id: i32, volume: f32) {
        let mut state = self.state.lock();
        if volume == 1.0 {
            state.volumes.remove(&external_id);
        } else {
            state.volumes.insert(external_id, volume);
        }
        let Some(session) = state
            .roster
            .by_external_id(external_id)
            .map(|user| user.session)
        else {
            return;
        };
        if volume <= 0.0 {
            self.remove_decoding_buffer(&mut state, session);
            return;
        }
        match state.speakers.get(&session).cloned() {
            Some(speaker) => speaker.set_volume(volume),
            None => self.evaluate_user(&mut state, session),
        }
    }

    pub fn set_loopback(&self, loopback: bool) {
        let mut state = self.state.lock();
        if state.loopback == loopback {
            return;
        }
        info!("server loopback {}", if loopback { "on" } else { "off" });
        state.loopback = loopback;
        self.reevaluate_locked(&mut state);
    }

    pub fn set_force_tcp(&self, force: bool) {
        info!("force tcp {}", if force { "on" } else { "off" });
        self.media.set_force_tcp(force);
    }

    fn with_microphone(&self, f: impl FnOnce(&mut Microphone)) {
        match self.microphone.lock().as_mut() {
            Some(microphone) => f(microphone),
            None => debug!("microphone closed"),
        }
    }

    pub fn apply_command(&self, command: Command) {
        debug!("applying {command:?}");
        match command {
            Command::ForceTcp(force) => self.set_force_tcp(force),
            Command::Loopback(loopback) => self.set_loopback(loopback),
            Command::SendMessage(message) => self.send_text_message(message),
            Command::ConfigureUser {
                external_id,
                volume,
            } => self.configure_user(external_id, volume),
            Command::CreateChannel(name) => self.create_channel(&name, 0, false, None, None),
            Command::DestroyChannel(name) => self.destroy_channel(&name),
            Command::JoinChannel(name) => self.join_channel(&name),
            Command::SetComment(comment) => self.set_comment(comment),
            Command::SetPluginContext(context) => self.set_plugin_context(context),
            Command::SetPluginIdentity(identity) => self.set_plugin_identity(identity),
            Command::SetSelfMute(mute) => self.set_self_mute(mute),
            Command::SetTexture(texture) => self.set_texture(texture),
            Command::SetBitrate(bitrate) => self.with_microphone(|mic| mic.set_bitrate(bitrate)),
            Command::SetInputMode(mode) => self.with_microphone(|mic| mic.set_mode(mode)),
            Command::SetMinAmplitude(min) => {
                self.with_microphone(|mic| mic.gate_mut().set_min_amplitude(min))
            }
            Command::PushToTalk(pressed) => {
                self.with_microphone(|mic| mic.gate_mut().set_push_to_talk(pressed))
            }
            Command::SetPosition(position) => self.set_position(position),
        }
    }

    pub fn set_position(&self, position: Vec3) {
        if self.send_position {
            self.with_microphone(|mic| mic.set_position(position));
        }
    }

    /// Feeds captured mono samples into the microphone path. Ignored until
    /// the server has synced.
    pub fn push_microphone(&self, samples: &[f32]) {
        let (muted, target) = {
            let state = self.state.lock();
            if Self::ready_session(&state).is_none() {
                return;
            }
            let muted = state
                .roster
                .local_user()
                .map_or(true, |user| user.self_muted || user.muted || user.suppressed);
            let target = if state.loopback {
                SpeechTarget::ServerLoopback
            } else {
                SpeechTarget::Normal
            };
            (muted, target)
        };
        self.with_microphone(|mic| mic.push(samples, muted, target));
    }

    pub fn speaker(&self, session: u32) -> Option<Arc<SpeakerBuffer>> {
        self.state.lock().speakers.get(&session).cloned()
    }

    pub fn speakers(&self) -> Vec<Arc<SpeakerBuffer>> {
        let state = self.state.lock();
        let mut speakers: Vec<_> = state.speakers.values().cloned().collect();
        speakers.sort_by_key(|speaker| speaker.session());
        speakers
    }

    pub fn users(&self) -> Vec<User> {
        let state = self.state.lock();
        Self::users_locked(&state)
    }

    fn users_locked(state: &SessionState) -> Vec<User> {
        state.roster.users(|session| match state.speakers.get(&session) {
            Some(speaker) => (speaker.is_playing(), speaker.is_talking()),
            None => (false, false),
        })
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.state.lock().channels.tree()
    }

    pub fn ping_ms(&self) -> Option<f32> {
        self.media.ping_ms()
    }

    /// Advances speaker activity and publishes any changed snapshots.
    pub fn tick(&self, elapsed: Duration) {
        let ping = self.media.ping_ms();
        let mut state = self.state.lock();
        let mut talking_changed = false;
        for speaker in state.speakers.values() {
            let was_talking = speaker.is_talking();
            speaker.tick(elapsed.as_secs_f32());
            talking_changed |= was_talking != speaker.is_talking();
        }

        if state.channels_dirty && !state.channels.is_empty() {
            state.channels_dirty = false;
            self.emit(SessionEvent::Channels(state.channels.tree()));
        }
        if state.roster_dirty || talking_changed {
            state.roster_dirty = false;
            self.emit(SessionEvent::Users(Self::users_locked(&state)));
        }

        state.since_ping_report += elapsed;
        if state.since_ping_report >= PING_REPORT_INTERVAL {
            state.since_ping_report = Duration::ZERO;
            if let Some(ping) = ping {
                self.emit(SessionEvent::Ping(ping));
            }
        }
    }

    /// Stops all audio: no more frames are accepted, the encode worker is
    /// joined and every speaker is closed.
    pub fn close_audio(&self) {
        self.decode.stop_accepting();
        if let Some(mut microphone) = self.microphone.lock().take() {
            microphone.shutdown();
        }
        let mut state = self.state.lock();
        for (session, speaker) in state.speakers.drain() {
            speaker.close();
            self.decode.stop_decoding(session);
        }
    }

    pub fn close_media(&self) {
        self.media.close();
        self.voice_pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionDeps};
    use crate::mumble::channels::ChannelStateUpdate;
    use crate::mumble::commands::Command;
    use crate::mumble::config::MumbleConfig;
    use crate::mumble::control::tests::RecordingSink;
    use crate::mumble::control::{ControlMessage, ControlRequest, UserStateCommand};
    use crate::mumble::decode::{DecodeCommand, DecodeHandle};
    use crate::mumble::encode::tests::{CollectingOutlet, FakeEncoder};
    use crate::mumble::encode::EncodePipeline;
    use crate::mumble::events::SessionEvent;
    use crate::mumble::state::UserStateUpdate;
    use crate::mumble::udp::tests::{FakeMedia, CLIENT_NONCE, KEY, SERVER_NONCE};
    use crate::transport::errors::{ExitCode, SessionOutcome};
    use crate::transport::types::ConnState;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        session: Arc<Session>,
        control: Arc<RecordingSink>,
        media: Arc<FakeMedia>,
        decode: Receiver<DecodeCommand>,
        events: Receiver<SessionEvent>,
    }

    fn fixture() -> Fixture {
        let control = Arc::new(RecordingSink::default());
        let media = Arc::new(FakeMedia::default());
        let (decode_tx, decode) = unbounded();
        let (events_tx, events) = unbounded();
        let encoder = FakeEncoder {
            resets: Arc::new(AtomicUsize::new(0)),
            bitrate: 24_000,
        };
        let encode = EncodePipeline::spawn(Box::new(encoder), Arc::new(CollectingOutlet::default()))
            .expect("spawn failed");
        let config = MumbleConfig::new("localhost".to_string(), 64738, "7".to_string());
        let session = Arc::new(Session::new(
            &config,
            SessionDeps {
                control: control.clone(),
                media: media.clone(),
                decode: DecodeHandle::new(decode_tx),
                encode,
                events: events_tx,
            },
        ));
        Fixture {
            session,
            control,
            media,
            decode,
            events,
        }
    }

    fn user(session: u32, channel_id: u32) -> ControlMessage {
        ControlMessage::UserState(UserStateUpdate {
            session,
            name: Some(session.to_string()),
            channel_id: Some(channel_id),
            ..UserStateUpdate::default()
        })
    }

    fn channel(id: u32, name: &str) -> ControlMessage {
        ControlMessage::ChannelState(ChannelStateUpdate {
            id,
            name: Some(name.to_string()),
            parent_id: (id != 0).then_some(0),
            ..ChannelStateUpdate::default()
        })
    }

    fn sync(session: u32) -> ControlMessage {
        ControlMessage::ServerSync {
            session,
            max_bandwidth: None,
            welcome_text: None,
        }
    }

    fn drain(receiver: &Receiver<DecodeCommand>) -> Vec<DecodeCommand> {
        receiver.try_iter().collect()
    }

    /// Server version is answered with our credentials.
    #[test]
    fn version_triggers_authentication() {
        // Arrange
        let fixture = fixture();
        fixture.session.start().expect("start failed");

        // Act
        fixture
            .session
            .handle_message(ControlMessage::Version { release: None });

        // Assert
        let requests = fixture.control.requests.lock();
        assert!(matches!(requests[0], ControlRequest::Version { .. }));
        assert_eq!(
            requests[1],
            ControlRequest::Authenticate {
                username: "7".to_string(),
                password: None,
            }
        );
        assert_eq!(fixture.session.conn_state(), ConnState::Authenticating);
    }

    /// A user sharing our channel gets a decoder; muting them queues a stop.
    #[test]
    fn mute_delta_stops_decoding_remote_user() {
        // Arrange
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 1));
        assert!(fixture.session.should_add_audio_player(9));
        assert!(!fixture.session.should_add_audio_player(7));
        let started = drain(&fixture.decode);

        // Act
        fixture
            .session
            .handle_message(ControlMessage::UserState(UserStateUpdate {
                session: 9,
                muted: Some(true),
                ..UserStateUpdate::default()
            }));

        // Assert
        assert!(started
            .iter()
            .any(|command| matches!(command, DecodeCommand::Start { session: 9, .. })));
        let stopped = drain(&fixture.decode);
        assert!(matches!(stopped.as_slice(), [DecodeCommand::Stop { session: 9 }]));
        assert!(!fixture.session.should_add_audio_player(9));
        assert!(fixture.session.speaker(9).is_none());
    }

    /// Users in other channels are heard only through links.
    #[test]
    fn linked_channels_share_audio() {
        // Arrange
        let fixture = fixture();
        fixture.session.handle_message(channel(1, "A"));
        fixture.session.handle_message(channel(2, "B"));
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 2));
        let before = fixture.session.should_add_audio_player(9);

        // Act
        fixture
            .session
            .handle_message(ControlMessage::ChannelState(ChannelStateUpdate {
                id: 1,
                links_add: vec![2],
                ..ChannelStateUpdate::default()
            }));

        // Assert
        assert!(!before);
        assert!(fixture.session.should_add_audio_player(9));
        assert!(fixture.session.speaker(9).is_some());
    }

    /// Moving ourselves re-evaluates everyone.
    #[test]
    fn local_channel_change_reevaluates_all() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 2));
        assert!(fixture.session.speaker(9).is_none());

        fixture.session.handle_message(user(7, 2));

        assert!(fixture.session.speaker(9).is_some());
    }

    /// Loopback makes our own voice audible and toggling it re-evaluates.
    #[test]
    fn loopback_toggles_own_playback() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));

        fixture.session.apply_command(Command::Loopback(true));
        let enabled = fixture.session.speaker(7).is_some();
        fixture.session.apply_command(Command::Loopback(false));

        assert!(enabled);
        assert!(fixture.session.speaker(7).is_none());
    }

    /// Actions requested before sync are replayed afterwards in order.
    #[test]
    fn pending_actions_replay_after_sync() {
        // Arrange
        let fixture = fixture();
        fixture.session.set_comment("hello".to_string());
        fixture.session.set_self_mute(true);
        fixture.session.join_channel("Pit");
        fixture.session.set_plugin_identity("car".to_string());
        fixture.session.handle_message(channel(3, "Pit"));
        fixture.session.handle_message(user(7, 0));
        assert!(fixture.control.requests.lock().is_empty());

        // Act
        fixture.session.handle_message(sync(7));

        // Assert
        let requests = fixture.control.requests.lock();
        assert_eq!(
            requests.as_slice(),
            &[
                ControlRequest::UserState(UserStateCommand {
                    session_id: 7,
                    channel_id: Some(3),
                    self_mute: Some(true),
                    plugin_identity: Some("car".to_string()),
                    ..UserStateCommand::default()
                }),
                ControlRequest::UserState(UserStateCommand {
                    session_id: 7,
                    comment: Some("hello".to_string()),
                    ..UserStateCommand::default()
                }),
            ]
        );
    }

    /// Once ready, setters go straight to the server and update our record.
    #[test]
    fn self_mute_after_sync_is_sent_immediately() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 0));

        fixture.session.set_self_mute(true);

        assert_eq!(
            fixture.control.requests.lock().as_slice(),
            &[ControlRequest::UserState(UserStateCommand {
                session_id: 7,
                self_mute: Some(true),
                ..UserStateCommand::default()
            })]
        );
        assert!(fixture.session.users()[0].self_muted);
    }

    #[test]
    fn unknown_channel_is_not_joined() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 0));

        fixture.session.join_channel("Nowhere");

        assert!(fixture.control.requests.lock().is_empty());
    }

    /// A channel the server marks as closed to us is not joined.
    #[test]
    fn restricted_channel_is_not_joined() {
        // Arrange
        let fixture = fixture();
        fixture.session.handle_message(ControlMessage::ChannelState(ChannelStateUpdate {
            id: 3,
            name: Some("Marshals".to_string()),
            parent_id: Some(0),
            is_enter_restricted: Some(true),
            can_enter: Some(false),
            ..ChannelStateUpdate::default()
        }));
        fixture.session.handle_message(channel(4, "Pit"));
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 0));

        // Act
        fixture.session.join_channel("Marshals");
        let refused = fixture.control.requests.lock().len();
        fixture.session.join_channel("Pit");

        // Assert
        assert_eq!(refused, 0);
        let channels: Vec<Option<u32>> = fixture
            .control
            .requests
            .lock()
            .iter()
            .filter_map(|request| match request {
                ControlRequest::UserState(command) => Some(command.channel_id),
                _ => None,
            })
            .collect();
        assert_eq!(channels, vec![Some(4)]);
    }

    /// Text goes to our current channel.
    #[test]
    fn text_message_targets_current_channel() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 4));

        fixture.session.send_text_message("hi".to_string());

        assert_eq!(
            fixture.control.requests.lock().as_slice(),
            &[ControlRequest::TextMessage {
                channel_id: 4,
                message: "hi".to_string(),
            }]
        );
    }

    /// Channels are created under the root and removed by name.
    #[test]
    fn channels_are_created_and_destroyed() {
        let fixture = fixture();
        fixture.session.handle_message(channel(0, "Root"));
        fixture.session.handle_message(channel(5, "Lobby"));
        fixture.session.handle_message(sync(7));

        fixture
            .session
            .apply_command(Command::CreateChannel("Race".to_string()));
        fixture
            .session
            .apply_command(Command::DestroyChannel("Lobby".to_string()));
        fixture
            .session
            .apply_command(Command::DestroyChannel("Missing".to_string()));

        let requests = fixture.control.requests.lock();
        assert_eq!(
            requests.as_slice(),
            &[
                ControlRequest::CreateChannel {
                    parent: 0,
                    name: "Race".to_string(),
                    temporary: false,
                    description: None,
                    max_users: None,
                },
                ControlRequest::RemoveChannel { channel_id: 5 },
            ]
        );
    }

    /// Volume zero stops decoding, 1.0 clears the override, other values
    /// scale the existing speaker.
    #[test]
    fn configure_user_adjusts_playback() {
        // Arrange
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 1));

        // Act
        fixture.session.configure_user(9, 0.5);
        let scaled = fixture.session.speaker(9).map(|speaker| speaker.volume());
        fixture.session.configure_user(9, 0.0);
        let silenced = fixture.session.speaker(9).is_none();
        fixture.session.configure_user(9, 1.0);

        // Assert
        assert_eq!(scaled, Some(0.5));
        assert!(silenced);
        let speaker = fixture.session.speaker(9).expect("speaker missing");
        assert_eq!(speaker.volume(), 1.0);
    }

    /// Overrides set before a user arrives apply when they join.
    #[test]
    fn volume_override_applies_to_late_joiner() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.configure_user(12, 0.25);

        fixture.session.handle_message(user(12, 1));

        let speaker = fixture.session.speaker(12).expect("speaker missing");
        assert_eq!(speaker.volume(), 0.25);
    }

    /// A full crypt setup keys the media channel; partial ones resync.
    #[test]
    fn crypt_setup_paths() {
        // Arrange
        let fixture = fixture();

        // Act
        fixture.session.handle_message(ControlMessage::CryptSetup {
            key: None,
            client_nonce: None,
            server_nonce: None,
        });
        let before_key = fixture.control.requests.lock().len();
        fixture.session.handle_message(ControlMessage::CryptSetup {
            key: Some(KEY.to_vec()),
            client_nonce: Some(CLIENT_NONCE.to_vec()),
            server_nonce: Some(SERVER_NONCE.to_vec()),
        });
        fixture.session.handle_message(ControlMessage::CryptSetup {
            key: None,
            client_nonce: None,
            server_nonce: Some(vec![9; 16]),
        });
        fixture.session.handle_message(ControlMessage::CryptSetup {
            key: None,
            client_nonce: None,
            server_nonce: None,
        });

        // Assert
        assert_eq!(before_key, 0);
        assert_eq!(fixture.media.keys.lock().as_slice(), &[KEY.to_vec()]);
        assert_eq!(fixture.media.server_nonces.lock().as_slice(), &[vec![9; 16]]);
        assert_eq!(
            fixture.control.requests.lock().as_slice(),
            &[ControlRequest::CryptSetup {
                client_nonce: CLIENT_NONCE.to_vec(),
            }]
        );
    }

    /// Reject reasons end the session with the matching exit code.
    #[test]
    fn reject_sets_outcome() {
        let fixture = fixture();

        fixture.session.handle_message(ControlMessage::Reject {
            reason: "Username already in use".to_string(),
        });
        fixture
            .session
            .fail(SessionOutcome::Disconnected("later".to_string()));

        let outcome = fixture.session.outcome().expect("no outcome");
        assert_eq!(outcome.exit_code(), ExitCode::UserNameTaken);
        assert_eq!(fixture.session.conn_state(), ConnState::Error);
    }

    /// Being removed from the server ends the session.
    #[test]
    fn own_removal_ends_session() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));

        fixture.session.handle_message(ControlMessage::UserRemove {
            session: 7,
            reason: Some("kicked".to_string()),
        });

        assert_eq!(
            fixture.session.outcome(),
            Some(SessionOutcome::Rejected("kicked".to_string()))
        );
    }

    /// Remote users leaving release their decoder.
    #[test]
    fn user_remove_stops_decoding() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 1));
        drain(&fixture.decode);

        fixture.session.handle_message(ControlMessage::UserRemove {
            session: 9,
            reason: None,
        });

        assert!(matches!(
            drain(&fixture.decode).as_slice(),
            [DecodeCommand::Stop { session: 9 }]
        ));
        assert_eq!(fixture.session.users().len(), 1);
    }

    /// Connection states are reported to the host in order.
    #[test]
    fn state_changes_are_emitted() {
        // Arrange
        let fixture = fixture();
        fixture.session.start().expect("start failed");

        // Act
        fixture.session.handle_message(channel(0, "Root"));
        fixture.session.handle_message(sync(7));
        fixture.session.tick(Duration::from_millis(20));

        // Assert
        let events: Vec<SessionEvent> = fixture.events.try_iter().collect();
        let states: Vec<ConnState> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::ConnectionState(state) => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnState::Authenticating,
                ConnState::SyncingRoster,
                ConnState::Ready
            ]
        );
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Channels(tree) if tree.len() == 1)));
    }

    /// Inbound text resolves the sender's name.
    #[test]
    fn text_message_is_forwarded_with_actor_name() {
        let fixture = fixture();
        fixture.session.handle_message(user(3, 0));

        fixture.session.handle_message(ControlMessage::TextMessage {
            actor: Some(3),
            message: "go".to_string(),
        });

        let text = fixture
            .events
            .try_iter()
            .find_map(|event| match event {
                SessionEvent::Text(text) => Some(text),
                _ => None,
            })
            .expect("no text event");
        assert_eq!(text.actor_name.as_deref(), Some("3"));
        assert_eq!(text.message, "go");
    }

    /// Roster patches from the read loop and full audibility passes from the
    /// host never lose an update.
    #[test]
    fn concurrent_patches_and_reevaluation_keep_state_consistent() {
        // Arrange
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        let patcher = {
            let session = Arc::clone(&fixture.session);
            std::thread::spawn(move || {
                for round in 0..400u32 {
                    let target = 100 + round % 40;
                    session.handle_message(ControlMessage::UserState(UserStateUpdate {
                        session: target,
                        name: Some(target.to_string()),
                        channel_id: Some(1),
                        muted: Some(round % 3 == 0),
                        comment: Some(round.to_string()),
                        ..UserStateUpdate::default()
                    }));
                }
            })
        };
        let evaluator = {
            let session = Arc::clone(&fixture.session);
            std::thread::spawn(move || {
                for _ in 0..400 {
                    session.reevaluate_all();
                }
            })
        };

        // Act
        patcher.join().expect("patcher panicked");
        evaluator.join().expect("evaluator panicked");

        // Assert
        let mut last: HashMap<u32, bool> = HashMap::new();
        for command in drain(&fixture.decode) {
            match command {
                DecodeCommand::Start { session, .. } => {
                    assert_ne!(last.insert(session, true), Some(true));
                }
                DecodeCommand::Stop { session } => {
                    assert_ne!(last.insert(session, false), Some(false));
                }
                _ => {}
            }
        }
        for target in 100..140u32 {
            let final_round = (0..400u32).rev().find(|round| 100 + round % 40 == target);
            let final_round = final_round.expect("no round");
            let muted = final_round % 3 == 0;
            assert_eq!(fixture.session.should_add_audio_player(target), !muted);
            assert_eq!(fixture.session.speaker(target).is_some(), !muted);
            assert_eq!(last.get(&target).copied().unwrap_or(false), !muted);
        }
        assert_eq!(fixture.session.users().len(), 41);
    }

    /// Closing audio stops every decoder and the encode worker.
    #[test]
    fn close_audio_releases_speakers() {
        let fixture = fixture();
        fixture.session.handle_message(sync(7));
        fixture.session.handle_message(user(7, 1));
        fixture.session.handle_message(user(9, 1));
        drain(&fixture.decode);

        fixture.session.close_audio();
        fixture.session.close_media();

        let commands = drain(&fixture.decode);
        assert!(commands
            .iter()
            .any(|command| matches!(command, DecodeCommand::Stop { session: 9 })));
        assert!(fixture.session.speakers().is_empty());
        assert!(*fixture.media.closed.lock());
        fixture.session.push_microphone(&[0.0; 960]);
    }
}
