use crate::mumble::codec::{opus_decoder_factory, DecoderFactory, DecoderParams, OpusVoiceEncoder, VoiceEncoder};
use crate::mumble::commands::Command;
use crate::mumble::config::MumbleConfig;
use crate::mumble::control::{
    decode_frame, tls_connect, ControlConnection, ControlReader, ControlRequest, ControlSink,
    ControlStream, Keepalive, ReadEvent,
};
use crate::mumble::decode::DecodePipeline;
use crate::mumble::encode::EncodePipeline;
use crate::mumble::events::SessionEvent;
use crate::mumble::pool::BufferPool;
use crate::mumble::session::{Session, SessionDeps, HOST_TIMEOUT};
use crate::mumble::udp::{MediaSlot, UdpMediaConnector};
use crate::mumble::voice::{unix_ticks_now, PING_INTERVAL_MS, SAMPLE_RATE};
use crate::transport::errors::{SessionOutcome, TransportError};
use crate::transport::types::ConnState;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, error, info, warn};
use openssl::ssl::SslStream;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Voice codecs for one connection.
pub struct Codecs {
    pub encoder: Box<dyn VoiceEncoder>,
    pub decoders: DecoderFactory,
}

impl Codecs {
    pub fn opus(bitrate: i32) -> Result<Self, TransportError> {
        Ok(Self {
            encoder: Box::new(OpusVoiceEncoder::new(bitrate)?),
            decoders: opus_decoder_factory(),
        })
    }
}

/// Ends the session when the host frame counter stops moving.
#[derive(Debug)]
pub struct HostWatchdog {
    timeout: Duration,
    enabled: bool,
    last_index: Option<u64>,
    last_change: Option<Instant>,
}

impl HostWatchdog {
    /// Disabled in debug builds, where the host is often paused in a debugger.
    pub fn new(timeout: Duration) -> Self {
        Self::with_enabled(timeout, !cfg!(debug_assertions))
    }

    pub fn with_enabled(timeout: Duration, enabled: bool) -> Self {
        Self {
            timeout,
            enabled,
            last_index: None,
            last_change: None,
        }
    }

    /// `true` once the same index has been seen for longer than the timeout.
    pub fn observe(&mut self, index: u64, now: Instant) -> bool {
        if self.last_index != Some(index) {
            self.last_index = Some(index);
            self.last_change = Some(now);
            return false;
        }
        self.enabled
            && self
                .last_change
                .is_some_and(|changed| now.duration_since(changed) > self.timeout)
    }
}

/// A live connection: the session plus the threads and sockets serving it.
pub struct MumbleTransport<S: ControlStream> {
    session: Arc<Session>,
    connection: Arc<ControlConnection<S>>,
    decode: DecodePipeline,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    watchdog: HostWatchdog,
    events: Receiver<SessionEvent>,
    closed: bool,
}

impl MumbleTransport<SslStream<TcpStream>> {
    pub fn connect(config: MumbleConfig) -> Result<Self, TransportError> {
        let codecs = Codecs::opus(config.bitrate)?;
        Self::connect_with(config, tls_connect, codecs)
    }
}

impl<S: ControlStream> MumbleTransport<S> {
    pub fn connect_with(
        config: MumbleConfig,
        connect: impl FnOnce(&str, u16) -> Result<S, TransportError>,
        codecs: Codecs,
    ) -> Result<Self, TransportError> {
        let server = config.server.trim();
        if server.is_empty() {
            return Err(TransportError::InvalidConfig(
                "server is required".to_string(),
            ));
        }
        if config.username.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "username is required".to_string(),
            ));
        }

        let (events_tx, events) = unbounded();
        if events_tx
            .send(SessionEvent::ConnectionState(ConnState::Connecting))
            .is_err()
        {
            debug!("event receiver dropped");
        }
        info!("connecting to {server}:{} as {}", config.port, config.username);
        let stream = connect(server, config.port)?;
        let server_addr = stream.peer_addr()?;
        let connection = Arc::new(ControlConnection::new(stream));

        let decode = DecodePipeline::spawn(
            DecoderParams::new(SAMPLE_RATE, config.output_channels),
            codecs.decoders,
        )?;
        let slot = Arc::new(MediaSlot::new());
        let encode = EncodePipeline::spawn(codecs.encoder, slot.clone())?;
        let media = Arc::new(UdpMediaConnector::new(
            server_addr,
            decode.handle(),
            BufferPool::new("udp", 256),
            connection.clone(),
            config.force_tcp,
            slot,
        ));
        let session = Arc::new(Session::new(
            &config,
            SessionDeps {
                control: connection.clone(),
                media,
                decode: decode.handle(),
                encode,
                events: events_tx,
            },
        ));

        session.start()?;
        for command in &config.commands {
            session.apply_command(command.clone());
        }

        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let connection = Arc::clone(&connection);
            let session = Arc::clone(&session);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("control-read".to_string())
                .spawn(move || read_loop(&connection, &session, &running))?
        };

        Ok(Self {
            session,
            connection,
            decode,
            running,
            reader: Some(reader),
            watchdog: HostWatchdog::new(HOST_TIMEOUT),
            events,
            closed: false,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn conn_state(&self) -> ConnState {
        self.session.conn_state()
    }

    pub fn take_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    pub fn apply_command(&self, command: Command) {
        self.session.apply_command(command);
    }

    pub fn push_microphone(&self, samples: &[f32]) {
        self.session.push_microphone(samples);
    }

    /// Runs one host tick. Returns the outcome once the session has ended.
    pub fn tick(&mut self, elapsed: Duration, host_frame: Option<u64>) -> Option<SessionOutcome> {
        if let Some(index) = host_frame {
            if self.watchdog.observe(index, Instant::now()) {
                error!("host frame index stalled at {index}");
                self.session.fail(SessionOutcome::HostTimeout);
            }
        }
        self.session.tick(elapsed);
        self.session.outcome()
    }

    /// Tears the connection down: audio first, then the worker threads, then
    /// the sockets and pools.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing connection");

        self.session.close_audio();
        self.decode.shutdown();

        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("control read thread panicked");
            }
        }
        if let Err(err) = self.connection.with_stream(|stream| stream.shutdown()) {
            debug!("control stream shutdown: {err}");
        }
        self.session.close_media();
        self.session.fail(SessionOutcome::Closed);
    }
}

impl<S: ControlStream> Drop for MumbleTransport<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop<S: ControlStream>(
    connection: &ControlConnection<S>,
    session: &Session,
    running: &AtomicBool,
) {
    let mut reader = ControlReader::new();
    let mut keepalive = Keepalive::new(Duration::from_millis(PING_INTERVAL_MS));
    while running.load(Ordering::Acquire) {
        match reader.poll(connection) {
            Ok(ReadEvent::Frame(raw)) => match decode_frame(raw) {
                Ok(Some(message)) => session.handle_message(message),
                Ok(None) => {}
                Err(err) => warn!("dropping control frame: {err}"),
            },
            Ok(ReadEvent::Idle) => {}
            Ok(ReadEvent::Closed) => {
                if running.load(Ordering::Acquire) {
                    warn!("server closed the control connection");
                    session.fail(SessionOutcome::Disconnected(
                        "server closed the connection".to_string(),
                    ));
                }
                break;
            }
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    error!("control read failed: {err}");
                    session.fail(SessionOutcome::from(&err));
                }
                break;
            }
        }

        if !keepalive.is_enabled() && session.is_server_configured() {
            keepalive.enable();
        }
        if keepalive.due(Instant::now()) {
            let ping = ControlRequest::Ping {
                timestamp: unix_ticks_now(),
            };
            if let Err(err) = connection.send(ping) {
                warn!("failed to send control ping: {err}");
            }
        }
    }
    debug!("control read thread exiting");
}
