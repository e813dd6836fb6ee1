//! Encrypted UDP media channel with ping keep-alive and fallback to tunnelling
//! voice through the control connection.

use crate::mumble::control::ControlSink;
use crate::mumble::crypt::{CryptState, CryptStats};
use crate::mumble::decode::DecodeHandle;
use crate::mumble::encode::VoiceOutlet;
use crate::mumble::pool::BufferPool;
use crate::mumble::voice::{
    parse_datagram, unix_ticks_now, write_ping, Datagram, MAX_CONSECUTIVE_MISSED_UDP_PINGS,
    PING_INTERVAL_MS,
};
use crate::transport::errors::TransportError;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const MAX_DATAGRAM: usize = 0x10000;
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const TICKS_PER_MS: f32 = 10_000.0;
const RTT_SMOOTHING: f32 = 0.125;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaState {
    Disconnected = 0,
    Connecting = 1,
    Active = 2,
}

impl MediaState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MediaState::Connecting,
            2 => MediaState::Active,
            _ => MediaState::Disconnected,
        }
    }
}

/// Hands a plaintext voice or ping datagram to its consumer. Voice goes to the
/// decode queue; the ping timestamp is returned.
pub fn dispatch_plain(
    plain: &[u8],
    decode: &DecodeHandle,
    pool: &BufferPool<u8>,
) -> Result<Option<u64>, TransportError> {
    match parse_datagram(plain, pool)? {
        Datagram::Voice(frame) => {
            decode.add_compressed(frame);
            Ok(None)
        }
        Datagram::Ping { timestamp } => Ok(Some(timestamp)),
    }
}

/// Socket-independent media logic: crypto, ping bookkeeping and routing.
pub struct MediaCore {
    crypt: Mutex<CryptState>,
    decode: DecodeHandle,
    pool: BufferPool<u8>,
    tunnel: Arc<dyn ControlSink>,
    state: AtomicU8,
    pings_outstanding: AtomicU32,
    use_tcp: AtomicBool,
    force_tcp: AtomicBool,
    rtt_ms: Mutex<Option<f32>>,
}

impl MediaCore {
    pub fn new(
        crypt: CryptState,
        decode: DecodeHandle,
        pool: BufferPool<u8>,
        tunnel: Arc<dyn ControlSink>,
        force_tcp: bool,
    ) -> Self {
        Self {
            crypt: Mutex::new(crypt),
            decode,
            pool,
            tunnel,
            state: AtomicU8::new(MediaState::Connecting as u8),
            pings_outstanding: AtomicU32::new(0),
            use_tcp: AtomicBool::new(false),
            force_tcp: AtomicBool::new(force_tcp),
            rtt_ms: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MediaState {
        MediaState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Decrypts and dispatches one received datagram.
    pub fn receive(&self, encrypted: &[u8]) -> Result<(), TransportError> {
        let plain = self.crypt.lock().decrypt(encrypted)?;
        if let Some(timestamp) = dispatch_plain(&plain, &self.decode, &self.pool)? {
            self.on_pong(timestamp);
        }
        Ok(())
    }

    fn on_pong(&self, timestamp: u64) {
        self.pings_outstanding.store(0, Ordering::Release);
        if self.state() != MediaState::Active {
            info!("udp media channel active");
        }
        self.state.store(MediaState::Active as u8, Ordering::Release);

        let sample = unix_ticks_now().saturating_sub(timestamp) as f32 / TICKS_PER_MS;
        let mut rtt = self.rtt_ms.lock();
        *rtt = Some(match *rtt {
            Some(previous) => previous + (sample - previous) * RTT_SMOOTHING,
            None => sample,
        });
    }

    /// Builds the next encrypted ping, or `None` when pings are off or the
    /// channel just degraded to tunnelled voice.
    pub fn next_ping(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.force_tcp.load(Ordering::Acquire) {
            return Ok(None);
        }
        if !self.use_tcp.load(Ordering::Acquire)
            && self.pings_outstanding.load(Ordering::Acquire) >= MAX_CONSECUTIVE_MISSED_UDP_PINGS
        {
            warn!("udp pings unanswered, tunnelling voice over the control channel");
            self.use_tcp.store(true, Ordering::Release);
            return Ok(None);
        }

        let mut plain = Vec::with_capacity(9);
        write_ping(&mut plain, unix_ticks_now());
        let encrypted = self.crypt.lock().encrypt(&plain)?;
        self.pings_outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(Some(encrypted))
    }

    pub fn is_tunnelling(&self) -> bool {
        self.use_tcp.load(Ordering::Acquire) || self.force_tcp.load(Ordering::Acquire)
    }

    pub fn set_force_tcp(&self, force: bool) {
        self.force_tcp.store(force, Ordering::Release);
    }

    /// Voice goes through the tunnel when degraded or forced; otherwise the
    /// encrypted datagram is returned for the socket.
    pub fn route_voice(&self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if self.is_tunnelling() {
            self.tunnel.send_tunnel(packet)?;
            return Ok(None);
        }
        Ok(Some(self.crypt.lock().encrypt(packet)?))
    }

    pub fn set_server_nonce(&self, nonce: &[u8]) -> Result<(), TransportError> {
        self.crypt.lock().set_server_nonce(nonce)?;
        Ok(())
    }

    pub fn client_nonce(&self) -> Vec<u8> {
        self.crypt.lock().client_nonce().to_vec()
    }

    pub fn crypt_stats(&self) -> CryptStats {
        self.crypt.lock().stats()
    }

    pub fn ping_ms(&self) -> Option<f32> {
        *self.rtt_ms.lock()
    }

    fn disconnect(&self) {
        self.state
            .store(MediaState::Disconnected as u8, Ordering::Release);
    }
}

/// Connected UDP socket plus its receive and ping threads.
pub struct MediaChannel {
    core: Arc<MediaCore>,
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    stop_ping: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaChannel {
    pub fn start(server: SocketAddr, core: MediaCore) -> Result<Self, TransportError> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        info!("udp media channel connecting to {server}");

        let core = Arc::new(core);
        let socket = Arc::new(socket);
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let receiver = {
            let core = Arc::clone(&core);
            let socket = Arc::clone(&socket);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("udp-receive".to_string())
                .spawn(move || receive_loop(&core, &socket, &running))?
        };
        let pinger = {
            let core = Arc::clone(&core);
            let socket = Arc::clone(&socket);
            std::thread::Builder::new()
                .name("udp-ping".to_string())
                .spawn(move || {
                    let interval = Duration::from_millis(PING_INTERVAL_MS);
                    loop {
                        send_ping(&core, &socket);
                        match stop_rx.recv_timeout(interval) {
                            Err(RecvTimeoutError::Timeout) => continue,
                            _ => break,
                        }
                    }
                    debug!("udp ping thread exiting");
                })?
        };

        Ok(Self {
            core,
            socket,
            running,
            stop_ping: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(vec![receiver, pinger]),
        })
    }

    pub fn core(&self) -> &MediaCore {
        &self.core
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_ping.lock().take();
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                error!("udp thread panicked");
            }
        }
        self.core.disconnect();
        debug!("udp media channel closed: {:?}", self.core.crypt_stats());
    }
}

impl VoiceOutlet for MediaChannel {
    fn send_voice(&self, packet: &[u8]) {
        match self.core.route_voice(packet) {
            Ok(Some(encrypted)) => {
                if let Err(err) = self.socket.send(&encrypted) {
                    warn!("failed to send voice datagram: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => error!("failed to send voice packet: {err}"),
        }
    }
}

impl Drop for MediaChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_ping(core: &MediaCore, socket: &UdpSocket) {
    match core.next_ping() {
        Ok(Some(ping)) => {
            if let Err(err) = socket.send(&ping) {
                warn!("failed to send udp ping: {err}");
            }
        }
        Ok(None) => {}
        Err(err) => error!("failed to build udp ping: {err}"),
    }
}

fn receive_loop(core: &MediaCore, socket: &UdpSocket, running: &AtomicBool) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Acquire) {
        match socket.recv(&mut buffer) {
            Ok(len) => {
                if let Err(err) = core.receive(&buffer[..len]) {
                    warn!("dropping {len} byte datagram: {err}");
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    warn!("udp receive failed: {err}");
                    std::thread::sleep(RECV_TIMEOUT);
                }
            }
        }
    }
    debug!("udp receive thread exiting");
}

/// Voice outlet that forwards to the media channel once one exists.
#[derive(Default)]
pub struct MediaSlot {
    media: Mutex<Option<Arc<MediaChannel>>>,
}

impl MediaSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, media: Arc<MediaChannel>) -> Option<Arc<MediaChannel>> {
        self.media.lock().replace(media)
    }

    pub fn get(&self) -> Option<Arc<MediaChannel>> {
        self.media.lock().clone()
    }

    pub fn take(&self) -> Option<Arc<MediaChannel>> {
        self.media.lock().take()
    }
}

impl VoiceOutlet for MediaSlot {
    fn send_voice(&self, packet: &[u8]) {
        match self.get() {
            Some(media) => media.send_voice(packet),
            None => debug!("media channel not connected, dropping voice packet"),
        }
    }
}

/// Opens and steers the voice media path on behalf of the session.
pub trait MediaConnector: Send + Sync {
    /// Starts a media channel keyed with a complete crypt setup, replacing any
    /// previous one.
    fn connect(&self, crypt: CryptState) -> Result<(), TransportError>;
    fn set_server_nonce(&self, nonce: &[u8]) -> Result<(), TransportError>;
    /// `None` until a media channel has been keyed.
    fn client_nonce(&self) -> Option<Vec<u8>>;
    fn set_force_tcp(&self, force: bool);
    fn ping_ms(&self) -> Option<f32>;
    fn close(&self);
}

pub struct UdpMediaConnector {
    server: SocketAddr,
    decode: DecodeHandle,
    pool: BufferPool<u8>,
    tunnel: Arc<dyn ControlSink>,
    force_tcp: AtomicBool,
    slot: Arc<MediaSlot>,
}

impl UdpMediaConnector {
    pub fn new(
        server: SocketAddr,
        decode: DecodeHandle,
        pool: BufferPool<u8>,
        tunnel: Arc<dyn ControlSink>,
        force_tcp: bool,
        slot: Arc<MediaSlot>,
    ) -> Self {
        Self {
            server,
            decode,
            pool,
            tunnel,
            force_tcp: AtomicBool::new(force_tcp),
            slot,
        }
    }
}

impl MediaConnector for UdpMediaConnector {
    fn connect(&self, crypt: CryptState) -> Result<(), TransportError> {
        let core = MediaCore::new(
            crypt,
            self.decode.clone(),
            self.pool.clone(),
            Arc::clone(&self.tunnel),
            self.force_tcp.load(Ordering::Acquire),
        );
        let media = Arc::new(MediaChannel::start(self.server, core)?);
        if let Some(previous) = self.slot.set(media) {
            previous.close();
        }
        Ok(())
    }

    fn set_server_nonce(&self, nonce: &[u8]) -> Result<(), TransportError> {
        match self.slot.get() {
            Some(media) => media.core().set_server_nonce(nonce),
            None => Err(TransportError::Crypt(
                "server nonce received before crypt setup".to_string(),
            )),
        }
    }

    fn client_nonce(&self) -> Option<Vec<u8>> {
        self.slot.get().map(|media| media.core().client_nonce())
    }

    fn set_force_tcp(&self, force: bool) {
        self.force_tcp.store(force, Ordering::Release);
        if let Some(media) = self.slot.get() {
            media.core().set_force_tcp(force);
        }
    }

    fn ping_ms(&self) -> Option<f32> {
        self.slot.get().and_then(|media| media.core().ping_ms())
    }

    fn close(&self) {
        if let Some(media) = self.slot.take() {
            media.close();
        }
    }
}
