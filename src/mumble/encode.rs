//! Microphone frames queue up here and one worker encodes, frames and sends
//! them at a steady cadence.

use crate::mumble::codec::{VoiceEncoder, MAX_ENCODED_SIZE};
use crate::mumble::pool::PooledBuf;
use crate::mumble::varint::Vec3;
use crate::mumble::voice::{write_voice_frame, SpeechTarget, FRAMES_PER_OUTGOING_PACKET};
use crate::transport::errors::TransportError;
use bytes::BytesMut;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const QUEUE_SIZE: usize = 64;
pub const MIN_SEND_GAP: Duration = Duration::from_millis(5);
/// Above this many pending frames the worker never sleeps between sends.
pub const MAX_PENDING_FOR_SLEEP: usize = 4;
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Destination for finished voice packets, usually the media channel.
pub trait VoiceOutlet: Send + Sync {
    fn send_voice(&self, packet: &[u8]);
}

#[derive(Debug)]
pub struct PcmFrame {
    pub pcm: PooledBuf<f32>,
    pub position: Vec3,
}

#[derive(Debug)]
struct QueuedSpeech {
    frame: Option<PcmFrame>,
    target: SpeechTarget,
    is_stop: bool,
}

/// Frame pulled off the queue, with the burst-end flag resolved.
#[derive(Debug)]
pub struct PendingFrame {
    pub frame: Option<PcmFrame>,
    pub target: SpeechTarget,
    pub is_last: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueuedSpeech>,
    waiting_to_send_last: bool,
    closing: bool,
}

#[derive(Debug, Default)]
pub struct EncodingBuffer {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EncodingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(state: &mut QueueState, speech: QueuedSpeech) {
        if state.queue.len() == QUEUE_SIZE {
            warn!("encode queue full, dropping oldest frame");
            state.queue.pop_front();
        }
        state.queue.push_back(speech);
    }

    pub fn add(&self, frame: PcmFrame, target: SpeechTarget, is_last: bool) {
        let mut state = self.state.lock();
        if state.closing {
            debug!("encode queue closing, dropping frame");
            return;
        }
        Self::enqueue(
            &mut state,
            QueuedSpeech {
                frame: Some(frame),
                target,
                is_stop: is_last,
            },
        );
        self.ready.notify_one();
    }

    /// Ends the current burst: the newest queued frame becomes the last one,
    /// or an empty stop frame is queued when nothing is pending.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.closing {
            return;
        }
        state.waiting_to_send_last = true;
        if state.queue.is_empty() {
            debug!("queueing stop frame");
            Self::enqueue(
                &mut state,
                QueuedSpeech {
                    frame: None,
                    target: SpeechTarget::Normal,
                    is_stop: true,
                },
            );
        }
        self.ready.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Waits up to `timeout` for a frame. `None` on timeout or once a closed
    /// queue has drained.
    pub fn next(&self, timeout: Duration) -> Option<PendingFrame> {
        let mut state = self.state.lock();
        if state.queue.is_empty() && !state.closing {
            self.ready.wait_for(&mut state, timeout);
        }
        let speech = state.queue.pop_front()?;
        let is_last = (state.queue.is_empty() && state.waiting_to_send_last) || speech.is_stop;
        if is_last {
            state.waiting_to_send_last = false;
        }
        Some(PendingFrame {
            frame: speech.frame,
            target: speech.target,
            is_last,
        })
    }

    /// Stops accepting frames. Whatever is queued is still handed out, the
    /// final one marked as the end of the burst.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closing = true;
        if !state.queue.is_empty() {
            state.waiting_to_send_last = true;
        }
        self.ready.notify_all();
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closing && state.queue.is_empty()
    }
}

/// Encoder state owned by the worker thread.
pub struct EncodeWorker {
    encoder: Box<dyn VoiceEncoder>,
    outlet: Arc<dyn VoiceOutlet>,
    sequence: i64,
    encoded: Vec<u8>,
    packet: BytesMut,
    last_send: Option<Instant>,
    /// Target of a burst that has not sent its last frame yet.
    open_burst: Option<SpeechTarget>,
}

impl EncodeWorker {
    pub fn new(encoder: Box<dyn VoiceEncoder>, outlet: Arc<dyn VoiceOutlet>) -> Self {
        Self {
            encoder,
            outlet,
            sequence: 0,
            encoded: vec![0u8; MAX_ENCODED_SIZE],
            packet: BytesMut::with_capacity(MAX_ENCODED_SIZE + 32),
            last_send: None,
            open_burst: None,
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn apply_bitrate(&mut self, bitrate: i32) {
        if bitrate == self.encoder.bitrate() {
            return;
        }
        if let Err(err) = self.encoder.set_bitrate(bitrate) {
            warn!("bitrate change to {bitrate} failed: {err}");
        }
    }

    /// Encodes and sends one frame. `pending` is the queue depth after the pull.
    pub fn process(&mut self, pending: PendingFrame, queue_depth: usize) -> Result<(), TransportError> {
        let (length, position) = match &pending.frame {
            Some(frame) => (
                self.encoder.encode(&frame.pcm, &mut self.encoded)?,
                frame.position,
            ),
            None => (0, Vec3::INVALID),
        };
        if pending.is_last {
            debug!("resetting encoder after burst");
            self.encoder.reset();
        }
        drop(pending.frame);

        self.packet.clear();
        write_voice_frame(
            &mut self.packet,
            pending.target,
            self.sequence,
            &self.encoded[..length],
            pending.is_last,
            position,
        )?;

        if let Some(last_send) = self.last_send {
            let elapsed = last_send.elapsed();
            if elapsed < MIN_SEND_GAP && queue_depth < MAX_PENDING_FOR_SLEEP {
                std::thread::sleep(MIN_SEND_GAP - elapsed);
            }
        }

        self.outlet.send_voice(&self.packet);
        self.sequence = if pending.is_last {
            0
        } else {
            self.sequence + FRAMES_PER_OUTGOING_PACKET
        };
        self.last_send = Some(Instant::now());
        self.open_burst = (!pending.is_last).then_some(pending.target);
        Ok(())
    }

    /// Sends a bare last frame if the previous burst never ended.
    pub fn finish_burst(&mut self) -> Result<(), TransportError> {
        let Some(target) = self.open_burst else {
            return Ok(());
        };
        debug!("ending open burst before exit");
        self.process(
            PendingFrame {
                frame: None,
                target,
                is_last: true,
            },
            0,
        )
    }

    fn run(mut self, buffer: Arc<EncodingBuffer>, shared: Arc<EncodeShared>) {
        loop {
            let Some(pending) = buffer.next(IDLE_WAIT) else {
                if buffer.is_drained() {
                    break;
                }
                continue;
            };
            self.apply_bitrate(shared.bitrate.load(Ordering::Acquire));
            if let Err(err) = self.process(pending, buffer.pending()) {
                error!("failed to encode voice frame: {err}");
            }
        }
        if let Err(err) = self.finish_burst() {
            error!("failed to send final voice frame: {err}");
        }
        debug!("encode worker exiting");
    }
}

struct EncodeShared {
    running: AtomicBool,
    bitrate: AtomicI32,
}

/// Owns the encode queue and worker thread.
pub struct EncodePipeline {
    buffer: Arc<EncodingBuffer>,
    shared: Arc<EncodeShared>,
    worker: Option<JoinHandle<()>>,
}

impl EncodePipeline {
    pub fn spawn(
        encoder: Box<dyn VoiceEncoder>,
        outlet: Arc<dyn VoiceOutlet>,
    ) -> Result<Self, TransportError> {
        let buffer = Arc::new(EncodingBuffer::new());
        let shared = Arc::new(EncodeShared {
            running: AtomicBool::new(true),
            bitrate: AtomicI32::new(encoder.bitrate()),
        });
        let worker = EncodeWorker::new(encoder, outlet);
        let thread = {
            let buffer = Arc::clone(&buffer);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("audio-encode".to_string())
                .spawn(move || worker.run(buffer, shared))?
        };
        Ok(Self {
            buffer,
            shared,
            worker: Some(thread),
        })
    }

    pub fn send_voice(&self, frame: PcmFrame, target: SpeechTarget, is_last: bool) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.buffer.add(frame, target, is_last);
    }

    pub fn send_stop(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.buffer.stop();
    }

    pub fn set_bitrate(&self, bitrate: i32) {
        self.shared.bitrate.store(bitrate, Ordering::Release);
    }

    pub fn bitrate(&self) -> i32 {
        self.shared.bitrate.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.buffer.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("encode worker panicked");
            }
        }
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
