use crate::mumble::channels::ChannelStateUpdate;
use crate::mumble::state::UserStateUpdate;
use crate::transport::errors::TransportError;
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use mumble_protocol_2x::control::{msgs, ControlPacket, RawControlCodec, RawControlPacket};
use mumble_protocol_2x::voice::{Clientbound, Serverbound};
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslStream, SslVerifyMode};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Read timeout on the control socket; the reader gives up the stream lock this often.
pub const READ_POLL: Duration = Duration::from_millis(10);

fn frame_error(err: std::io::Error) -> TransportError {
    TransportError::Protocol(format!("control framing failed: {err}"))
}

/// Local user fields to push to the server. `None` fields are left out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserStateCommand {
    pub session_id: u32,
    pub channel_id: Option<u32>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub comment: Option<String>,
    pub texture: Option<Vec<u8>>,
    pub plugin_context: Option<Vec<u8>>,
    pub plugin_identity: Option<String>,
}

/// Everything the client sends over the control channel, tunnelled voice aside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    Version {
        release: String,
        os: String,
        os_version: String,
    },
    Authenticate {
        username: String,
        password: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    CryptSetup {
        client_nonce: Vec<u8>,
    },
    UserState(UserStateCommand),
    TextMessage {
        channel_id: u32,
        message: String,
    },
    CreateChannel {
        parent: u32,
        name: String,
        temporary: bool,
        description: Option<String>,
        max_users: Option<u32>,
    },
    RemoveChannel {
        channel_id: u32,
    },
}

impl ControlRequest {
    pub fn into_packet(self) -> ControlPacket<Serverbound> {
        match self {
            ControlRequest::Version {
                release,
                os,
                os_version,
            } => {
                let mut msg = msgs::Version::new();
                msg.release = Some(release);
                msg.os = Some(os);
                msg.os_version = Some(os_version);
                ControlPacket::Version(Box::new(msg))
            }
            ControlRequest::Authenticate { username, password } => {
                let mut msg = msgs::Authenticate::new();
                msg.username = Some(username);
                msg.password = password;
                msg.opus = Some(true);
                ControlPacket::Authenticate(Box::new(msg))
            }
            ControlRequest::Ping { timestamp } => {
                let mut msg = msgs::Ping::new();
                msg.timestamp = Some(timestamp);
                ControlPacket::Ping(Box::new(msg))
            }
            ControlRequest::CryptSetup { client_nonce } => {
                let mut msg = msgs::CryptSetup::new();
                msg.client_nonce = Some(client_nonce);
                ControlPacket::CryptSetup(Box::new(msg))
            }
            ControlRequest::UserState(command) => {
                let mut msg = msgs::UserState::new();
                msg.session = Some(command.session_id);
                msg.channel_id = command.channel_id;
                msg.self_mute = command.self_mute;
                msg.self_deaf = command.self_deaf;
                msg.comment = command.comment;
                msg.texture = command.texture;
                msg.plugin_context = command.plugin_context;
                msg.plugin_identity = command.plugin_identity;
                ControlPacket::UserState(Box::new(msg))
            }
            ControlRequest::TextMessage {
                channel_id,
                message,
            } => {
                let mut msg = msgs::TextMessage::new();
                msg.channel_id = vec![channel_id];
                msg.message = Some(message);
                ControlPacket::TextMessage(Box::new(msg))
            }
            ControlRequest::CreateChannel {
                parent,
                name,
                temporary,
                description,
                max_users,
            } => {
                let mut msg = msgs::ChannelState::new();
                msg.parent = Some(parent);
                msg.name = Some(name);
                msg.temporary = Some(temporary);
                msg.description = description;
                msg.max_users = max_users;
                ControlPacket::ChannelState(Box::new(msg))
            }
            ControlRequest::RemoveChannel { channel_id } => {
                let mut msg = msgs::ChannelRemove::new();
                msg.channel_id = Some(channel_id);
                ControlPacket::ChannelRemove(Box::new(msg))
            }
        }
    }
}

/// Inbound control traffic after decoding, in client terms.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    Version {
        release: Option<String>,
    },
    ServerSync {
        session: u32,
        max_bandwidth: Option<u32>,
        welcome_text: Option<String>,
    },
    ServerConfig,
    ChannelState(ChannelStateUpdate),
    ChannelRemove {
        id: u32,
    },
    UserState(UserStateUpdate),
    UserRemove {
        session: u32,
        reason: Option<String>,
    },
    CryptSetup {
        key: Option<Vec<u8>>,
        client_nonce: Option<Vec<u8>>,
        server_nonce: Option<Vec<u8>>,
    },
    Reject {
        reason: String,
    },
    PermissionDenied {
        reason: Option<String>,
        name: Option<String>,
    },
    TextMessage {
        actor: Option<u32>,
        message: String,
    },
    /// Plain voice datagram carried over the control channel.
    Tunnel(Bytes),
}

/// Turns a raw frame into a message. `Ok(None)` for traffic the client only
/// acknowledges or for messages missing their key field.
pub fn decode_frame(raw: RawControlPacket) -> Result<Option<ControlMessage>, TransportError> {
    if raw.id == msgs::id::UDPTunnel {
        return Ok(Some(ControlMessage::Tunnel(raw.bytes)));
    }
    let id = raw.id;
    let packet = ControlPacket::<Clientbound>::try_from(raw).map_err(|err| {
        TransportError::Protocol(format!("failed to parse control message {id}: {err}"))
    })?;
    Ok(map_control_packet(packet))
}

pub fn map_control_packet(packet: ControlPacket<Clientbound>) -> Option<ControlMessage> {
    match packet {
        ControlPacket::Version(msg) => Some(ControlMessage::Version {
            release: msg.release.clone(),
        }),
        ControlPacket::ServerSync(msg) => {
            let session = msg.session?;
            Some(ControlMessage::ServerSync {
                session,
                max_bandwidth: msg.max_bandwidth,
                welcome_text: msg.welcome_text.clone(),
            })
        }
        ControlPacket::ServerConfig(_) => Some(ControlMessage::ServerConfig),
        ControlPacket::ChannelState(msg) => {
            let id = msg.channel_id?;
            let msg = *msg;
            Some(ControlMessage::ChannelState(ChannelStateUpdate {
                id,
                name: msg.name,
                parent_id: msg.parent,
                position: msg.position,
                description: msg.description,
                max_users: msg.max_users,
                temporary: msg.temporary,
                is_enter_restricted: msg.is_enter_restricted,
                can_enter: msg.can_enter,
                links: (!msg.links.is_empty()).then_some(msg.links),
                links_add: msg.links_add,
                links_remove: msg.links_remove,
            }))
        }
        ControlPacket::ChannelRemove(msg) => Some(ControlMessage::ChannelRemove {
            id: msg.channel_id?,
        }),
        ControlPacket::UserState(msg) => {
            let session = msg.session?;
            let msg = *msg;
            Some(ControlMessage::UserState(UserStateUpdate {
                session,
                name: msg.name,
                user_id: msg.user_id,
                channel_id: msg.channel_id,
                muted: msg.mute,
                deafened: msg.deaf,
                suppressed: msg.suppress,
                self_muted: msg.self_mute,
                self_deafened: msg.self_deaf,
                comment: msg.comment,
                texture: msg.texture,
                plugin_context: msg.plugin_context,
                plugin_identity: msg.plugin_identity,
            }))
        }
        ControlPacket::UserRemove(msg) => Some(ControlMessage::UserRemove {
            session: msg.session?,
            reason: msg.reason.clone(),
        }),
        ControlPacket::CryptSetup(msg) => {
            let msg = *msg;
            Some(ControlMessage::CryptSetup {
                key: msg.key,
                client_nonce: msg.client_nonce,
                server_nonce: msg.server_nonce,
            })
        }
        ControlPacket::Reject(msg) => Some(ControlMessage::Reject {
            reason: msg.reason.clone().unwrap_or_default(),
        }),
        ControlPacket::PermissionDenied(msg) => Some(ControlMessage::PermissionDenied {
            reason: msg.reason.clone(),
            name: msg.name.clone(),
        }),
        ControlPacket::TextMessage(msg) => Some(ControlMessage::TextMessage {
            actor: msg.actor,
            message: msg.message.clone().unwrap_or_default(),
        }),
        ControlPacket::Ping(_)
        | ControlPacket::CodecVersion(_)
        | ControlPacket::PermissionQuery(_)
        | ControlPacket::SuggestConfig(_) => None,
        other => {
            debug!("ignoring control message {}", RawControlPacket::from(other).id);
            None
        }
    }
}

/// Byte stream the control channel runs over.
pub trait ControlStream: Read + Write + Send + 'static {
    fn peer_addr(&self) -> std::io::Result<SocketAddr>;
    /// Closes both directions so a blocked reader wakes up.
    fn shutdown(&mut self) -> std::io::Result<()>;
}

impl ControlStream for TcpStream {
    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl ControlStream for SslStream<TcpStream> {
    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.get_ref().peer_addr()
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        if let Err(err) = SslStream::shutdown(self) {
            debug!("tls close_notify failed: {err}");
        }
        self.get_ref().shutdown(Shutdown::Both)
    }
}

/// Outbound half of the control channel as the session sees it.
pub trait ControlSink: Send + Sync {
    fn send(&self, request: ControlRequest) -> Result<(), TransportError>;
    /// Sends a plain voice datagram inside a tunnel frame.
    fn send_tunnel(&self, voice: &[u8]) -> Result<(), TransportError>;
}

pub enum ReadEvent {
    Frame(RawControlPacket),
    Idle,
    Closed,
}

/// A control stream shared by the read loop and every writer. Writes are
/// serialized on the stream lock; reads hold it for at most one poll.
pub struct ControlConnection<S> {
    stream: Mutex<S>,
}

impl<S: Read + Write + Send> ControlConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    fn write_raw(&self, raw: RawControlPacket) -> Result<(), TransportError> {
        let mut out = BytesMut::with_capacity(6 + raw.bytes.len());
        Encoder::encode(&mut RawControlCodec, raw, &mut out).map_err(frame_error)?;
        let mut stream = self.stream.lock();
        stream.write_all(&out)?;
        stream.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    pub fn with_stream<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.stream.lock())
    }
}

impl<S: Read + Write + Send> ControlSink for ControlConnection<S> {
    fn send(&self, request: ControlRequest) -> Result<(), TransportError> {
        self.write_raw(RawControlPacket::from(request.into_packet()))
    }

    fn send_tunnel(&self, voice: &[u8]) -> Result<(), TransportError> {
        self.write_raw(RawControlPacket {
            id: msgs::id::UDPTunnel,
            bytes: Bytes::copy_from_slice(voice),
        })
    }
}

/// Read-side buffer state; owned by the read loop only.
#[derive(Debug, Default)]
pub struct ControlReader {
    codec: RawControlCodec,
    read_buf: BytesMut,
}

impl ControlReader {
    pub fn new() -> Self {
        Self {
            codec: RawControlCodec,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Returns the next frame, `Idle` when the socket timed out without one,
    /// or `Closed` at end of stream.
    pub fn poll<S: Read + Write + Send>(
        &mut self,
        connection: &ControlConnection<S>,
    ) -> Result<ReadEvent, TransportError> {
        loop {
            if let Some(raw) =
                Decoder::decode(&mut self.codec, &mut self.read_buf).map_err(frame_error)?
            {
                return Ok(ReadEvent::Frame(raw));
            }

            let mut buffer = [0u8; 4096];
            let read = connection.with_stream(|stream| stream.read(&mut buffer));
            match read {
                Ok(0) => return Ok(ReadEvent::Closed),
                Ok(count) => self.read_buf.extend_from_slice(&buffer[..count]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(ReadEvent::Idle)
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err.to_string())),
            }
        }
    }
}

/// Paces the control-channel ping once the server has reported ready.
#[derive(Debug)]
pub struct Keepalive {
    interval: Duration,
    last: Option<Instant>,
    enabled: bool,
}

impl Keepalive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            enabled: false,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `true` when a ping should go out now; records the send.
    pub fn due(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn is_reset(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Opens the TLS control connection. The server certificate is not verified;
/// voice servers commonly run with self-signed certificates.
pub fn tls_connect(host: &str, port: u16) -> Result<SslStream<TcpStream>, TransportError> {
    let address = (host, port)
        .to_socket_addrs()
        .map_err(|err| TransportError::AddressNotFound(format!("{host}: {err}")))?
        .next()
        .ok_or_else(|| TransportError::AddressNotFound(host.to_string()))?;

    info!("connecting to {address}");
    let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)
        .map_err(|err| TransportError::Unreachable(format!("{address}: {err}")))?;
    tcp.set_nodelay(true)?;
    tcp.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    tcp.set_write_timeout(Some(CONNECT_TIMEOUT))?;

    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| TransportError::Handshake(format!("tls connector init failed: {err}")))?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();

    let stream = connector.connect(host, tcp).map_err(|err| match err {
        HandshakeError::Failure(mid) => {
            let reset = mid
                .error()
                .io_error()
                .is_some_and(|io| is_reset(io.kind()));
            if reset {
                TransportError::Rejected(format!("connection reset during tls handshake: {}", mid.error()))
            } else {
                TransportError::Handshake(format!("tls handshake failed: {}", mid.error()))
            }
        }
        HandshakeError::WouldBlock(_) => {
            TransportError::Handshake("tls handshake timed out".to_string())
        }
        HandshakeError::SetupFailure(stack) => {
            TransportError::Handshake(format!("tls setup failed: {stack}"))
        }
    })?;

    stream.get_ref().set_read_timeout(Some(READ_POLL))?;
    if let Err(err) = stream.get_ref().set_write_timeout(None) {
        warn!("failed to clear control write timeout: {err}");
    }
    Ok(stream)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        decode_frame, map_control_packet, ControlConnection, ControlMessage, ControlReader,
        ControlRequest, ControlSink, Keepalive, ReadEvent, UserStateCommand,
    };
    use crate::transport::errors::TransportError;
    use bytes::{Bytes, BytesMut};
    use mumble_protocol_2x::control::{
        msgs, ControlPacket, RawControlCodec, RawControlPacket, ServerControlCodec,
    };
    use mumble_protocol_2x::voice::{Clientbound, Serverbound};
    use parking_lot::Mutex;
    use std::io::{Cursor, ErrorKind, Read, Write};
    use std::time::{Duration, Instant};
    use tokio_util::codec::{Decoder, Encoder};

    /// Records everything the session sends.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub requests: Mutex<Vec<ControlRequest>>,
        pub tunnelled: Mutex<Vec<Vec<u8>>>,
    }

    impl ControlSink for RecordingSink {
        fn send(&self, request: ControlRequest) -> Result<(), TransportError> {
            self.requests.lock().push(request);
            Ok(())
        }

        fn send_tunnel(&self, voice: &[u8]) -> Result<(), TransportError> {
            self.tunnelled.lock().push(voice.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryStream {
        read: Cursor<Vec<u8>>,
        written: Vec<u8>,
        idle_at_end: bool,
        /// Caps every read at this many bytes.
        chunk: Option<usize>,
    }

    impl MemoryStream {
        fn with_read_data(data: Vec<u8>) -> Self {
            Self {
                read: Cursor::new(data),
                ..Self::default()
            }
        }
    }

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let limit = self.chunk.unwrap_or(buf.len()).min(buf.len());
            let read = self.read.read(&mut buf[..limit])?;
            if read == 0 && self.idle_at_end {
                return Err(std::io::Error::new(ErrorKind::WouldBlock, "no data"));
            }
            Ok(read)
        }
    }

    impl Write for MemoryStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Frames a server packet the way it arrives on the wire.
    pub(crate) fn frame(packet: ControlPacket<Clientbound>) -> Vec<u8> {
        let mut out = BytesMut::new();
        Encoder::encode(&mut ServerControlCodec::new(), packet, &mut out).expect("encode failed");
        out.to_vec()
    }

    /// A frame split across reads is reassembled before it is returned.
    #[test]
    fn reader_waits_for_full_frame() {
        // Arrange
        let mut sync = msgs::ServerSync::new();
        sync.session = Some(3);
        let data = frame(ControlPacket::ServerSync(Box::new(sync)));
        let stream = MemoryStream {
            read: Cursor::new(data),
            chunk: Some(4),
            ..MemoryStream::default()
        };
        let connection = ControlConnection::new(stream);
        let mut reader = ControlReader::new();

        // Act
        let event = reader.poll(&connection).expect("poll failed");

        // Assert
        let ReadEvent::Frame(raw) = event else {
            panic!("expected a frame");
        };
        assert_eq!(raw.id, msgs::id::ServerSync);
        assert!(matches!(
            decode_frame(raw).expect("decode failed"),
            Some(ControlMessage::ServerSync { session: 3, .. })
        ));
    }

    #[test]
    fn reader_rejects_oversized_length() {
        let stream = MemoryStream::with_read_data(vec![0, 7, 0xff, 0xff, 0xff, 0xff]);
        let connection = ControlConnection::new(stream);
        let mut reader = ControlReader::new();

        let err = match reader.poll(&connection) {
            Err(err) => err,
            Ok(_) => panic!("expected error"),
        };

        assert!(matches!(err, TransportError::Protocol(_)));
    }

    /// Tunnel frames are handed over untouched.
    #[test]
    fn tunnel_frames_are_not_parsed() {
        let raw = RawControlPacket {
            id: msgs::id::UDPTunnel,
            bytes: Bytes::from_static(&[0x80, 0x09, 0x00]),
        };

        let message = decode_frame(raw).expect("decode failed");

        assert_eq!(
            message,
            Some(ControlMessage::Tunnel(Bytes::from_static(&[0x80, 0x09, 0x00])))
        );
    }

    /// User state deltas keep absent fields as `None`.
    #[test]
    fn user_state_maps_present_fields_only() {
        // Arrange
        let mut msg = msgs::UserState::new();
        msg.session = Some(9);
        msg.mute = Some(true);

        // Act
        let message = map_control_packet(ControlPacket::UserState(Box::new(msg)));

        // Assert
        let Some(ControlMessage::UserState(update)) = message else {
            panic!("expected user state");
        };
        assert_eq!(update.session, 9);
        assert_eq!(update.muted, Some(true));
        assert!(update.name.is_none());
        assert!(update.channel_id.is_none());
    }

    /// Channel state keeps link patches apart from full link lists.
    #[test]
    fn channel_state_maps_links() {
        // Arrange
        let mut msg = msgs::ChannelState::new();
        msg.channel_id = Some(4);
        msg.name = Some("Pit".to_string());
        msg.links_add = vec![2, 3];
        msg.can_enter = Some(false);

        // Act
        let message = map_control_packet(ControlPacket::ChannelState(Box::new(msg)));

        // Assert
        let Some(ControlMessage::ChannelState(update)) = message else {
            panic!("expected channel state");
        };
        assert_eq!(update.id, 4);
        assert_eq!(update.name.as_deref(), Some("Pit"));
        assert!(update.links.is_none());
        assert_eq!(update.links_add, vec![2, 3]);
        assert_eq!(update.can_enter, Some(false));
        assert!(update.is_enter_restricted.is_none());
    }

    /// Messages missing their key field are skipped so partial state does not leak.
    #[test]
    fn incomplete_messages_are_skipped() {
        let sync = msgs::ServerSync::new();
        let channel = msgs::ChannelState::new();
        let user = msgs::UserState::new();

        assert!(map_control_packet(ControlPacket::ServerSync(Box::new(sync))).is_none());
        assert!(map_control_packet(ControlPacket::ChannelState(Box::new(channel))).is_none());
        assert!(map_control_packet(ControlPacket::UserState(Box::new(user))).is_none());
    }

    #[test]
    fn acknowledged_messages_map_to_none() {
        let ping = msgs::Ping::new();
        let query = msgs::PermissionQuery::new();
        assert!(map_control_packet(ControlPacket::Ping(Box::new(ping))).is_none());
        assert!(map_control_packet(ControlPacket::PermissionQuery(Box::new(query))).is_none());
    }

    /// The reader decodes consecutive frames and reports end of stream.
    #[test]
    fn reader_decodes_frames_then_closes() {
        // Arrange
        let mut sync = msgs::ServerSync::new();
        sync.session = Some(7);
        let mut reject = msgs::Reject::new();
        reject.reason = Some("Username already in use".to_string());
        let mut data = frame(ControlPacket::ServerSync(Box::new(sync)));
        data.extend(frame(ControlPacket::Reject(Box::new(reject))));
        let connection = ControlConnection::new(MemoryStream::with_read_data(data));
        let mut reader = ControlReader::new();

        // Act
        let mut messages = Vec::new();
        let closed = loop {
            match reader.poll(&connection).expect("poll failed") {
                ReadEvent::Frame(raw) => messages.push(decode_frame(raw).expect("decode failed")),
                ReadEvent::Idle => continue,
                ReadEvent::Closed => break true,
            }
        };

        // Assert
        assert!(closed);
        assert_eq!(
            messages,
            vec![
                Some(ControlMessage::ServerSync {
                    session: 7,
                    max_bandwidth: None,
                    welcome_text: None,
                }),
                Some(ControlMessage::Reject {
                    reason: "Username already in use".to_string(),
                }),
            ]
        );
    }

    #[test]
    fn reader_reports_idle_on_timeout() {
        let stream = MemoryStream {
            idle_at_end: true,
            ..MemoryStream::default()
        };
        let connection = ControlConnection::new(stream);
        let mut reader = ControlReader::new();

        let event = reader.poll(&connection).expect("poll failed");

        assert!(matches!(event, ReadEvent::Idle));
    }

    /// Requests are written as framed protobuf packets the server can read back.
    #[test]
    fn connection_writes_framed_requests() {
        // Arrange
        let connection = ControlConnection::new(MemoryStream::default());

        // Act
        connection
            .send(ControlRequest::Authenticate {
                username: "alice".to_string(),
                password: Some("pw".to_string()),
            })
            .expect("send failed");
        connection.send_tunnel(&[0x80, 0x00]).expect("tunnel failed");

        // Assert
        let written = connection.into_inner().written;
        let mut buf = BytesMut::from(&written[..]);
        assert_eq!(&written[..2], &[0, 2]);
        let auth = Decoder::decode(&mut RawControlCodec, &mut buf)
            .expect("decode failed")
            .expect("auth missing");
        let tunnel = Decoder::decode(&mut RawControlCodec, &mut buf)
            .expect("decode failed")
            .expect("tunnel missing");
        assert_eq!(auth.id, msgs::id::Authenticate);
        let packet = ControlPacket::<Serverbound>::try_from(auth).expect("parse failed");
        assert!(matches!(
            packet,
            ControlPacket::Authenticate(msg)
                if msg.username.as_deref() == Some("alice")
                    && msg.password.as_deref() == Some("pw")
                    && msg.opus == Some(true)
        ));
        assert_eq!(tunnel.id, msgs::id::UDPTunnel);
        assert_eq!(&tunnel.bytes[..], &[0x80, 0x00]);
    }

    /// User state commands only carry the fields that were set.
    #[test]
    fn user_state_command_builds_sparse_packet() {
        let command = UserStateCommand {
            session_id: 7,
            self_mute: Some(true),
            ..UserStateCommand::default()
        };

        let packet = ControlRequest::UserState(command).into_packet();

        assert!(matches!(
            packet,
            ControlPacket::UserState(msg)
                if msg.session == Some(7)
                    && msg.self_mute == Some(true)
                    && msg.channel_id.is_none()
                    && msg.comment.is_none()
        ));
    }

    /// Keepalive stays quiet until enabled, then fires once per interval.
    #[test]
    fn keepalive_fires_after_enable() {
        // Arrange
        let mut keepalive = Keepalive::new(Duration::from_secs(1));
        let start = Instant::now();

        // Act
        let before = keepalive.due(start);
        keepalive.enable();
        let first = keepalive.due(start);
        let soon = keepalive.due(start + Duration::from_millis(500));
        let later = keepalive.due(start + Duration::from_millis(1000));

        // Assert
        assert!(!before);
        assert!(first);
        assert!(!soon);
        assert!(later);
    }
}
