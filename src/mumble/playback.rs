//! Per-speaker output buffers filled by the decode worker and drained by the
//! external mixer.

use crate::mumble::varint::Vec3;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Peak above which a speaker counts as talking.
pub const ACTIVE_THRESHOLD: f32 = 0.001;
/// Seconds a speaker stays "talking" after the last loud frame.
pub const ACTIVE_PERIOD: f32 = 1.0;
const MAX_BUFFERED_PER_CHANNEL: usize = 1024 * 64;

/// Receiver of decoded PCM for one remote speaker.
pub trait AudioSink: Send + Sync {
    /// `false` when frames would be thrown away anyway (muted, volume zero,
    /// closed). The decode worker then drops the payload and frees its decoder.
    fn ready_to_receive(&self) -> bool;

    /// Delivers interleaved samples. `first` starts a talk burst, `last` ends it.
    /// `pcm` may be empty for a bare end-of-burst marker.
    fn receive(&self, pcm: &mut [f32], position: Vec3, first: bool, last: bool);
}

#[derive(Debug)]
struct SpeakerState {
    samples: VecDeque<f32>,
    volume: f32,
    closed: bool,
    playing: bool,
    peak: f32,
    active_for: f32,
    position: Vec3,
}

#[derive(Debug)]
pub struct SpeakerBuffer {
    session: u32,
    capacity: usize,
    state: Mutex<SpeakerState>,
}

impl SpeakerBuffer {
    pub fn new(session: u32, channels: usize) -> Self {
        Self {
            session,
            capacity: MAX_BUFFERED_PER_CHANNEL * channels.max(1),
            state: Mutex::new(SpeakerState {
                samples: VecDeque::new(),
                volume: 1.0,
                closed: false,
                playing: false,
                peak: 0.0,
                active_for: 0.0,
                position: Vec3::INVALID,
            }),
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume.max(0.0);
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.samples.clear();
        state.playing = false;
    }

    /// Moves up to `out.len()` buffered samples into `out`.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut state = self.state.lock();
        let count = out.len().min(state.samples.len());
        for (slot, sample) in out.iter_mut().zip(state.samples.drain(..count)) {
            *slot = sample;
        }
        count
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// Advances the talking hold timer.
    pub fn tick(&self, elapsed_secs: f32) {
        let mut state = self.state.lock();
        state.active_for = (state.active_for - elapsed_secs).max(0.0);
    }

    pub fn is_talking(&self) -> bool {
        self.state.lock().active_for > 0.0
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn peak(&self) -> f32 {
        self.state.lock().peak
    }

    pub fn position(&self) -> Vec3 {
        self.state.lock().position
    }
}

fn ramp_in(pcm: &mut [f32]) {
    let len = pcm.len() as f32;
    for (i, sample) in pcm.iter_mut().enumerate() {
        *sample *= (i as f32 + 1.0) / len;
    }
}

fn ramp_out(pcm: &mut [f32]) {
    let len = pcm.len() as f32;
    for (i, sample) in pcm.iter_mut().enumerate() {
        *sample *= 1.0 - i as f32 / len;
    }
}

impl AudioSink for SpeakerBuffer {
    fn ready_to_receive(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.volume <= 0.0 {
            state.samples.clear();
            state.playing = false;
            return false;
        }
        true
    }

    fn receive(&self, pcm: &mut [f32], position: Vec3, first: bool, last: bool) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if first {
            state.samples.clear();
        }

        if !pcm.is_empty() {
            state.playing = true;
            if first {
                ramp_in(pcm);
            }
            if last {
                ramp_out(pcm);
            }

            let peak = pcm.iter().fold(0f32, |max, sample| max.max(sample.abs()));
            state.peak = peak;
            if peak > ACTIVE_THRESHOLD {
                state.active_for = ACTIVE_PERIOD;
            }
            state.position = position;

            let volume = state.volume;
            state.samples.extend(pcm.iter().map(|sample| sample * volume));
            let overflow = state.samples.len().saturating_sub(self.capacity);
            if overflow > 0 {
                state.samples.drain(..overflow);
            }
        }

        if last {
            state.playing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AudioSink, SpeakerBuffer};
    use crate::mumble::varint::Vec3;

    /// The first frame of a burst ramps in and the last ramps out.
    #[test]
    fn bursts_are_faded_in_and_out() {
        // Arrange
        let speaker = SpeakerBuffer::new(9, 1);
        let mut first = vec![1.0; 4];
        let mut last = vec![1.0; 4];

        // Act
        speaker.receive(&mut first, Vec3::INVALID, true, false);
        speaker.receive(&mut last, Vec3::INVALID, false, true);
        let mut out = vec![0.0; 8];
        let read = speaker.read(&mut out);

        // Assert
        assert_eq!(read, 8);
        assert_eq!(&out[..4], &[0.25, 0.5, 0.75, 1.0]);
        assert_eq!(&out[4..], &[1.0, 0.75, 0.5, 0.25]);
        assert!(!speaker.is_playing());
    }

    /// Volume scales samples and loud frames mark the speaker as talking.
    #[test]
    fn volume_and_talking_follow_frames() {
        // Arrange
        let speaker = SpeakerBuffer::new(9, 1);
        speaker.set_volume(0.5);
        let mut pcm = vec![0.5; 2];

        // Act
        speaker.receive(&mut pcm, Vec3::new(1.0, 2.0, 3.0), false, false);

        // Assert
        let mut out = vec![0.0; 2];
        speaker.read(&mut out);
        assert_eq!(out, vec![0.25, 0.25]);
        assert!(speaker.is_talking());
        assert_eq!(speaker.peak(), 0.5);
        assert_eq!(speaker.position(), Vec3::new(1.0, 2.0, 3.0));

        speaker.tick(1.5);
        assert!(!speaker.is_talking());
    }

    /// Zero volume refuses frames and drops what the speaker holds.
    #[test]
    fn not_ready_when_silent() {
        let speaker = SpeakerBuffer::new(1, 2);
        speaker.receive(&mut [0.1; 4], Vec3::INVALID, false, false);
        assert!(speaker.ready_to_receive());

        speaker.set_volume(0.0);

        assert!(!speaker.ready_to_receive());
        assert_eq!(speaker.buffered(), 0);
    }

    #[test]
    fn closed_speaker_ignores_frames() {
        let speaker = SpeakerBuffer::new(1, 1);
        speaker.close();
        speaker.receive(&mut [0.3; 4], Vec3::INVALID, true, false);
        assert_eq!(speaker.buffered(), 0);
        assert!(!speaker.ready_to_receive());
    }
}
