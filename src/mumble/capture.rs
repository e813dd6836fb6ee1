//! Microphone gating: decides which captured frames become voice and where a
//! talk burst begins and ends.

use crate::mumble::encode::{EncodePipeline, PcmFrame};
use crate::mumble::pool::{BufferPool, PoolStats};
use crate::mumble::varint::Vec3;
use crate::mumble::voice::{SpeechTarget, FRAME_SIZE_MS, SAMPLE_RATE};
use log::debug;
use std::str::FromStr;
use std::time::Duration;

/// Mono samples in one captured frame.
pub const CAPTURE_FRAME_SAMPLES: usize = (SAMPLE_RATE as u64 * FRAME_SIZE_MS / 1000) as usize;
pub const PUSH_TO_TALK_HOLD: Duration = Duration::from_secs(1);
pub const AMPLITUDE_HOLD: Duration = Duration::from_millis(500);
pub const DEFAULT_MIN_AMPLITUDE: f32 = 0.05;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputMode {
    None,
    #[default]
    PushToTalk,
    AlwaysSend,
    Amplitude,
    VoiceActivity,
}

impl InputMode {
    fn hold(self) -> Duration {
        match self {
            InputMode::PushToTalk => PUSH_TO_TALK_HOLD,
            InputMode::Amplitude | InputMode::VoiceActivity => AMPLITUDE_HOLD,
            InputMode::None | InputMode::AlwaysSend => Duration::ZERO,
        }
    }
}

impl FromStr for InputMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(InputMode::None),
            "pushToTalk" => Ok(InputMode::PushToTalk),
            "alwaysSend" => Ok(InputMode::AlwaysSend),
            "amplitude" => Ok(InputMode::Amplitude),
            "voiceActivity" => Ok(InputMode::VoiceActivity),
            other => Err(format!("unknown input mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateAction {
    /// Frame is discarded.
    Silent,
    /// Frame is voice. `first` opens a new burst.
    Send { first: bool },
    /// Frame closes the burst and goes out marked as the last one.
    Release,
}

#[derive(Debug)]
pub struct MicGate {
    mode: InputMode,
    min_amplitude: f32,
    push_to_talk: bool,
    open: bool,
    hold: Duration,
}

impl MicGate {
    pub fn new(mode: InputMode, min_amplitude: f32) -> Self {
        Self {
            mode,
            min_amplitude,
            push_to_talk: false,
            open: false,
            hold: Duration::ZERO,
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// Switching modes closes any open burst.
    pub fn set_mode(&mut self, mode: InputMode) {
        self.mode = mode;
        self.hold = Duration::ZERO;
        self.open = false;
    }

    pub fn set_min_amplitude(&mut self, min_amplitude: f32) {
        self.min_amplitude = min_amplitude;
    }

    pub fn set_push_to_talk(&mut self, pressed: bool) {
        self.push_to_talk = pressed;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn triggered(&self, pcm: &[f32]) -> bool {
        match self.mode {
            InputMode::None => false,
            InputMode::PushToTalk => self.push_to_talk,
            InputMode::AlwaysSend => true,
            InputMode::Amplitude | InputMode::VoiceActivity => peak(pcm) >= self.min_amplitude,
        }
    }

    /// Classifies one mono frame, fading it in or out in place at burst edges.
    /// `muted` closes the gate regardless of mode.
    pub fn process(&mut self, pcm: &mut [f32], muted: bool) -> GateAction {
        let frame = Duration::from_micros(pcm.len() as u64 * 1_000_000 / SAMPLE_RATE as u64);
        let triggered = !muted && self.triggered(pcm);
        if triggered {
            self.hold = self.mode.hold();
        } else if muted {
            self.hold = Duration::ZERO;
        } else {
            self.hold = self.hold.saturating_sub(frame);
        }
        let active = triggered || !self.hold.is_zero();

        match (active, self.open) {
            (true, false) => {
                self.open = true;
                fade_in(pcm);
                GateAction::Send { first: true }
            }
            (true, true) => GateAction::Send { first: false },
            (false, true) => {
                self.open = false;
                fade_out(pcm);
                GateAction::Release
            }
            (false, false) => GateAction::Silent,
        }
    }
}

/// Cuts an arbitrary sample stream into whole capture frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32], mut on_frame: impl FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        let whole = self.pending.len() / CAPTURE_FRAME_SAMPLES * CAPTURE_FRAME_SAMPLES;
        for frame in self.pending[..whole].chunks_exact(CAPTURE_FRAME_SAMPLES) {
            on_frame(frame);
        }
        self.pending.drain(..whole);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Captured samples in, gated frames out to the encode queue.
pub struct Microphone {
    gate: MicGate,
    assembler: FrameAssembler,
    pool: BufferPool<f32>,
    encode: EncodePipeline,
    position: Vec3,
}

impl Microphone {
    pub fn new(gate: MicGate, encode: EncodePipeline) -> Self {
        Self {
            gate,
            assembler: FrameAssembler::new(),
            pool: BufferPool::new("pcm", CAPTURE_FRAME_SAMPLES),
            encode,
            position: Vec3::INVALID,
        }
    }

    pub fn gate(&self) -> &MicGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut MicGate {
        &mut self.gate
    }

    /// Changes the input mode, ending the current burst on the encode queue.
    pub fn set_mode(&mut self, mode: InputMode) {
        if self.gate.is_open() {
            self.encode.send_stop();
        }
        self.gate.set_mode(mode);
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn set_bitrate(&self, bitrate: i32) {
        self.encode.set_bitrate(bitrate);
    }

    pub fn bitrate(&self) -> i32 {
        self.encode.bitrate()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn push(&mut self, samples: &[f32], muted: bool, target: SpeechTarget) {
        let Self {
            gate,
            assembler,
            pool,
            encode,
            position,
        } = self;
        assembler.push(samples, |frame| {
            let mut pcm = pool.checkout_from(frame);
            match gate.process(&mut pcm, muted) {
                GateAction::Silent => {}
                GateAction::Send { first } => {
                    if first {
                        debug!("microphone burst started");
                    }
                    let frame = PcmFrame {
                        pcm,
                        position: *position,
                    };
                    encode.send_voice(frame, target, false);
                }
                GateAction::Release => {
                    let frame = PcmFrame {
                        pcm,
                        position: *position,
                    };
                    encode.send_voice(frame, target, true);
                    debug!("microphone burst ended");
                }
            }
        });
    }

    /// Stops the encode worker and returns the pcm buffers to a closed pool.
    pub fn shutdown(&mut self) {
        self.assembler.clear();
        self.encode.shutdown();
        self.pool.close();
    }
}

fn peak(pcm: &[f32]) -> f32 {
    pcm.iter().fold(0f32, |max, sample| max.max(sample.abs()))
}

fn fade_in(pcm: &mut [f32]) {
    let len = pcm.len() as f32;
    for (i, sample) in pcm.iter_mut().enumerate() {
        *sample *= (i as f32 + 1.0) / len;
    }
}

fn fade_out(pcm: &mut [f32]) {
    let len = pcm.len() as f32;
    for (i, sample) in pcm.iter_mut().enumerate() {
        *sample *= 1.0 - i as f32 / len;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FrameAssembler, GateAction, InputMode, MicGate, Microphone, CAPTURE_FRAME_SAMPLES,
    };
    use crate::mumble::encode::tests::{CollectingOutlet, FakeEncoder};
    use crate::mumble::encode::EncodePipeline;
    use crate::mumble::voice::SpeechTarget;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn frame(level: f32) -> Vec<f32> {
        vec![level; CAPTURE_FRAME_SAMPLES]
    }

    /// Push-to-talk keeps sending for a second after release, then closes.
    #[test]
    fn push_to_talk_holds_after_release() {
        // Arrange
        let mut gate = MicGate::new(InputMode::PushToTalk, 0.0);
        gate.set_push_to_talk(true);
        let opened = gate.process(&mut frame(0.5), false);
        gate.set_push_to_talk(false);

        // Act
        let mut held = Vec::new();
        for _ in 0..60 {
            held.push(gate.process(&mut frame(0.5), false));
        }

        // Assert
        assert_eq!(opened, GateAction::Send { first: true });
        let sent = held
            .iter()
            .filter(|action| **action == GateAction::Send { first: false })
            .count();
        assert_eq!(sent, 49);
        assert_eq!(held[49], GateAction::Release);
        assert_eq!(held[50], GateAction::Silent);
    }

    /// Amplitude mode opens on a loud frame and fades the first frame in.
    #[test]
    fn amplitude_opens_on_loud_frame() {
        // Arrange
        let mut gate = MicGate::new(InputMode::Amplitude, 0.2);
        let mut quiet = frame(0.1);
        let mut loud = frame(0.4);

        // Act
        let first = gate.process(&mut quiet, false);
        let second = gate.process(&mut loud, false);

        // Assert
        assert_eq!(first, GateAction::Silent);
        assert_eq!(second, GateAction::Send { first: true });
        assert!(loud[0] < 0.01);
        assert_eq!(loud[CAPTURE_FRAME_SAMPLES - 1], 0.4);
    }

    /// Muting closes an open gate immediately with a faded final frame.
    #[test]
    fn mute_releases_open_gate() {
        let mut gate = MicGate::new(InputMode::AlwaysSend, 0.0);
        gate.process(&mut frame(0.5), false);
        let mut last = frame(0.5);

        let action = gate.process(&mut last, true);

        assert_eq!(action, GateAction::Release);
        assert_eq!(last[0], 0.5);
        assert!(last[CAPTURE_FRAME_SAMPLES - 1] < 0.01);
        assert!(!gate.is_open());
    }

    #[test]
    fn none_mode_never_sends() {
        let mut gate = MicGate::new(InputMode::None, 0.0);
        gate.set_push_to_talk(true);
        assert_eq!(gate.process(&mut frame(1.0), false), GateAction::Silent);
    }

    #[test]
    fn input_mode_parses_host_names() {
        assert_eq!("alwaysSend".parse::<InputMode>(), Ok(InputMode::AlwaysSend));
        assert_eq!("voiceActivity".parse::<InputMode>(), Ok(InputMode::VoiceActivity));
        assert!("loud".parse::<InputMode>().is_err());
    }

    /// Samples are emitted in whole frames and the remainder is kept.
    #[test]
    fn assembler_emits_whole_frames() {
        // Arrange
        let mut assembler = FrameAssembler::new();
        let mut frames = 0;

        // Act
        assembler.push(&vec![0.0; CAPTURE_FRAME_SAMPLES + 10], |_| frames += 1);
        assembler.push(&vec![0.0; CAPTURE_FRAME_SAMPLES - 10], |_| frames += 1);

        // Assert
        assert_eq!(frames, 2);
        assert_eq!(assembler.pending(), 0);
    }

    /// A short always-send burst reaches the outlet ending with a last frame.
    #[test]
    fn microphone_sends_gated_burst() {
        // Arrange
        let outlet = Arc::new(CollectingOutlet::default());
        let encoder = FakeEncoder {
            resets: Arc::new(AtomicUsize::new(0)),
            bitrate: 24_000,
        };
        let pipeline = EncodePipeline::spawn(Box::new(encoder), outlet.clone())
            .expect("spawn failed");
        let mut microphone = Microphone::new(MicGate::new(InputMode::AlwaysSend, 0.0), pipeline);

        // Act
        microphone.push(&frame(0.3), false, SpeechTarget::Normal);
        microphone.push(&frame(0.3), false, SpeechTarget::Normal);
        microphone.push(&frame(0.3), true, SpeechTarget::Normal);
        let deadline = Instant::now() + Duration::from_secs(2);
        while outlet.packets.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        microphone.shutdown();

        // Assert
        let packets = outlet.packets.lock();
        assert_eq!(packets.len(), 3);
        let last = packets.last().expect("no packets");
        assert_eq!(&last[..], &[0x80, 0x04, 0xA0, 0x01, 0xC0]);
        assert_eq!(microphone.pool_stats().outstanding, 0);
    }
}
