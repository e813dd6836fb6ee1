//! Decode worker: one thread owns every remote speaker's decoder and applies
//! the sequence-gap policy before handing PCM to the speaker's sink.

use crate::mumble::codec::{DecoderFactory, DecoderParams, VoiceDecoder, MAX_DECODED_SAMPLES};
use crate::mumble::playback::AudioSink;
use crate::mumble::voice::VoiceFrame;
use crate::transport::errors::TransportError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Sequence steps a stream may jump before it counts as a restart.
pub const MAX_MISSING_PACKETS: i64 = 25;

pub enum DecodeCommand {
    Start {
        session: u32,
        sink: Arc<dyn AudioSink>,
    },
    Stop {
        session: u32,
    },
    Frame(VoiceFrame),
    Shutdown,
}

impl std::fmt::Debug for DecodeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeCommand::Start { session, .. } => write!(f, "Start({session})"),
            DecodeCommand::Stop { session } => write!(f, "Stop({session})"),
            DecodeCommand::Frame(frame) => write!(f, "Frame({}, seq {})", frame.session, frame.sequence),
            DecodeCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Cloneable producer side of the decode queue.
#[derive(Clone)]
pub struct DecodeHandle {
    sender: Sender<DecodeCommand>,
    accepting: Arc<AtomicBool>,
}

impl DecodeHandle {
    pub fn new(sender: Sender<DecodeCommand>) -> Self {
        Self {
            sender,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn start_decoding(&self, session: u32, sink: Arc<dyn AudioSink>) {
        self.send(DecodeCommand::Start { session, sink });
    }

    pub fn stop_decoding(&self, session: u32) {
        self.send(DecodeCommand::Stop { session });
    }

    /// Queues a frame; the opus buffer goes back to its pool if the worker is gone.
    pub fn add_compressed(&self, frame: VoiceFrame) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        self.send(DecodeCommand::Frame(frame));
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    fn send(&self, command: DecodeCommand) {
        if self.sender.send(command).is_err() {
            debug!("decode worker gone, command dropped");
        }
    }
}

struct DecoderState {
    sink: Arc<dyn AudioSink>,
    decoder: Option<Box<dyn VoiceDecoder>>,
    next_sequence: i64,
    last_received: i64,
    was_prev_last: bool,
}

impl DecoderState {
    fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            decoder: None,
            next_sequence: 0,
            last_received: 0,
            was_prev_last: true,
        }
    }
}

pub struct DecodeWorker {
    params: DecoderParams,
    factory: DecoderFactory,
    free: HashMap<DecoderParams, Vec<Box<dyn VoiceDecoder>>>,
    active: HashMap<u32, DecoderState>,
    pcm: Vec<f32>,
}

impl DecodeWorker {
    pub fn new(params: DecoderParams, factory: DecoderFactory) -> Self {
        Self {
            params,
            factory,
            free: HashMap::new(),
            active: HashMap::new(),
            pcm: vec![0f32; MAX_DECODED_SAMPLES],
        }
    }

    pub fn is_decoding(&self, session: u32) -> bool {
        self.active.contains_key(&session)
    }

    pub fn free_decoders(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Applies one command; returns `false` once the worker should exit.
    pub fn handle(&mut self, command: DecodeCommand) -> bool {
        match command {
            DecodeCommand::Start { session, sink } => {
                if let Some(previous) = self.active.insert(session, DecoderState::new(sink)) {
                    self.recycle(previous.decoder);
                }
            }
            DecodeCommand::Stop { session } => {
                if let Some(state) = self.active.remove(&session) {
                    self.recycle(state.decoder);
                }
            }
            DecodeCommand::Frame(frame) => self.decode(frame),
            DecodeCommand::Shutdown => return false,
        }
        true
    }

    fn recycle(&mut self, decoder: Option<Box<dyn VoiceDecoder>>) {
        if let Some(decoder) = decoder {
            self.free.entry(decoder.params()).or_default().push(decoder);
        }
    }

    fn acquire(&mut self) -> Result<Box<dyn VoiceDecoder>, TransportError> {
        if let Some(mut decoder) = self.free.get_mut(&self.params).and_then(Vec::pop) {
            decoder.reset();
            return Ok(decoder);
        }
        (self.factory)(self.params)
    }

    fn decode(&mut self, frame: VoiceFrame) {
        let session = frame.session;
        let Some(state) = self.active.get(&session) else {
            return;
        };

        if !state.sink.ready_to_receive() {
            if let Some(state) = self.active.get_mut(&session) {
                state.was_prev_last = true;
                state.next_sequence = 0;
                let decoder = state.decoder.take();
                self.recycle(decoder);
            }
            return;
        }

        if state.decoder.is_none() {
            match self.acquire() {
                Ok(decoder) => {
                    if let Some(state) = self.active.get_mut(&session) {
                        state.decoder = Some(decoder);
                    }
                }
                Err(err) => {
                    error!("failed to create decoder for #{session}: {err}");
                    return;
                }
            }
        }

        let step = self.params.samples_per_step().max(1) as i64;
        let pcm = &mut self.pcm;
        let Some(state) = self.active.get_mut(&session) else {
            return;
        };
        let Some(decoder) = state.decoder.as_mut() else {
            return;
        };

        let sequence = frame.sequence;
        let is_last = frame.is_last;
        let opus: &[u8] = &frame.opus;
        let mut reevaluate = state.was_prev_last;

        if state.next_sequence != 0 {
            let diff = sequence - state.next_sequence;
            if diff < -MAX_MISSING_PACKETS {
                info!("sequence for #{session} has possibly reset, diff {diff}");
                decoder.reset();
                reevaluate = true;
            } else if sequence > state.last_received && diff < 0 && !is_last {
                info!("sample rate for #{session} may have changed");
            } else if diff > MAX_MISSING_PACKETS {
                info!(
                    "sequence for #{session} changed abruptly: {sequence}, last {}",
                    state.last_received
                );
                reevaluate = true;
            } else if diff < 0 && !is_last {
                warn!(
                    "dropping old packet {sequence} from #{session}, expecting {}",
                    state.next_sequence
                );
                return;
            } else if diff > 0 {
                warn!(
                    "lost packets from #{session}: received {sequence}, expected {}",
                    state.next_sequence
                );
                match decoder.decode(opus, &mut pcm[..], true) {
                    Ok(recovered) => {
                        state.next_sequence = sequence + recovered as i64 / step;
                        state.sink.receive(&mut pcm[..recovered], frame.position, reevaluate, false);
                        reevaluate = false;
                    }
                    Err(err) => warn!("fec decode for #{session} failed: {err}"),
                }
            }
        }

        let mut decoded = 0;
        if !opus.is_empty() {
            match decoder.decode(opus, &mut pcm[..], false) {
                Ok(count) => decoded = count,
                Err(err) => {
                    warn!("decode for #{session} failed: {err}");
                    return;
                }
            }
            state.sink.receive(&mut pcm[..decoded], frame.position, reevaluate, is_last);
        }

        state.was_prev_last = is_last;
        state.last_received = sequence;
        if is_last {
            debug!("resetting #{session} decoder after burst");
            state.next_sequence = 0;
            decoder.reset();
            if opus.is_empty() {
                state.sink.receive(&mut [], frame.position, false, true);
            }
        } else {
            state.next_sequence = sequence + decoded as i64 / step;
        }
    }

    /// Runs until `Shutdown` arrives or every sender is dropped.
    pub fn run(mut self, receiver: Receiver<DecodeCommand>) {
        while let Ok(command) = receiver.recv() {
            if !self.handle(command) {
                break;
            }
        }
        debug!(
            "decode worker exiting, {} active, {} idle decoders",
            self.active.len(),
            self.free_decoders()
        );
    }
}

/// Owns the decode thread.
pub struct DecodePipeline {
    handle: DecodeHandle,
    worker: Option<JoinHandle<()>>,
}

impl DecodePipeline {
    pub fn spawn(params: DecoderParams, factory: DecoderFactory) -> Result<Self, TransportError> {
        let (sender, receiver) = unbounded();
        let worker = DecodeWorker::new(params, factory);
        let thread = std::thread::Builder::new()
            .name("audio-decode".to_string())
            .spawn(move || worker.run(receiver))?;
        Ok(Self {
            handle: DecodeHandle::new(sender),
            worker: Some(thread),
        })
    }

    pub fn handle(&self) -> DecodeHandle {
        self.handle.clone()
    }

    /// Stops taking frames, lets the worker drain what is queued, then joins it.
    pub fn shutdown(&mut self) {
        self.handle.stop_accepting();
        self.handle.send(DecodeCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("decode worker panicked");
            }
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
