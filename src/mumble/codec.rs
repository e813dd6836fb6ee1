//! Opus encoder and decoder behind small traits so the pipelines can be
//! exercised without libopus state.

use crate::mumble::voice::{MAX_CHANNELS, MAX_FRAMES_PER_PACKET, OUTPUT_FRAME_SIZE, SAMPLE_RATE};
use crate::transport::errors::TransportError;
use log::warn;
use opus::{Application, Bitrate, Channels, Decoder, Encoder};

/// Largest decoded packet, interleaved.
pub const MAX_DECODED_SAMPLES: usize = OUTPUT_FRAME_SIZE * MAX_FRAMES_PER_PACKET * MAX_CHANNELS;
/// Upper bound for one encoded opus packet.
pub const MAX_ENCODED_SIZE: usize = 1024;
pub const DEFAULT_BITRATE: i32 = 24_000;

/// Output format a decoder is created for. Free decoders are pooled by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DecoderParams {
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecoderParams {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }

    /// Interleaved samples in one 10 ms sequence step.
    pub fn samples_per_step(&self) -> usize {
        (self.sample_rate / 100) as usize * self.channels
    }
}

impl Default for DecoderParams {
    fn default() -> Self {
        Self::new(SAMPLE_RATE, MAX_CHANNELS)
    }
}

pub trait VoiceDecoder: Send {
    /// Decodes into `out` and returns the interleaved sample count. With `fec`
    /// set, recovers the frame preceding `data` from its redundancy.
    fn decode(&mut self, data: &[u8], out: &mut [f32], fec: bool) -> Result<usize, TransportError>;
    fn reset(&mut self);
    fn params(&self) -> DecoderParams;
}

pub trait VoiceEncoder: Send {
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, TransportError>;
    fn set_bitrate(&mut self, bitrate: i32) -> Result<(), TransportError>;
    fn bitrate(&self) -> i32;
    fn reset(&mut self);
}

pub type DecoderFactory =
    Box<dyn Fn(DecoderParams) -> Result<Box<dyn VoiceDecoder>, TransportError> + Send>;

fn channels_for(count: usize) -> Channels {
    if count == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

fn codec_error(context: &str, error: opus::Error) -> TransportError {
    TransportError::Codec(format!("{context}: {error}"))
}

pub struct OpusVoiceDecoder {
    decoder: Decoder,
    params: DecoderParams,
}

impl OpusVoiceDecoder {
    pub fn new(params: DecoderParams) -> Result<Self, TransportError> {
        let decoder = Decoder::new(params.sample_rate, channels_for(params.channels))
            .map_err(|err| codec_error("failed to create opus decoder", err))?;
        Ok(Self { decoder, params })
    }
}

impl VoiceDecoder for OpusVoiceDecoder {
    fn decode(&mut self, data: &[u8], out: &mut [f32], fec: bool) -> Result<usize, TransportError> {
        let channels = self.params.channels;
        let out = if fec {
            // FEC recovers exactly one packet's duration.
            match opus::packet::get_nb_samples(data, self.params.sample_rate) {
                Ok(samples) => {
                    let len = (samples * channels).min(out.len());
                    &mut out[..len]
                }
                Err(err) => return Err(codec_error("unreadable packet for fec", err)),
            }
        } else {
            out
        };
        let per_channel = self
            .decoder
            .decode_float(data, out, fec)
            .map_err(|err| codec_error("opus decode failed", err))?;
        Ok(per_channel * channels)
    }

    fn reset(&mut self) {
        if let Err(err) = self.decoder.reset_state() {
            warn!("opus decoder reset failed: {err}");
        }
    }

    fn params(&self) -> DecoderParams {
        self.params
    }
}

pub fn opus_decoder_factory() -> DecoderFactory {
    Box::new(|params| {
        OpusVoiceDecoder::new(params).map(|decoder| Box::new(decoder) as Box<dyn VoiceDecoder>)
    })
}

pub struct OpusVoiceEncoder {
    encoder: Encoder,
    bitrate: i32,
}

impl OpusVoiceEncoder {
    /// Mono voice encoder at the protocol sample rate, FEC disabled.
    pub fn new(bitrate: i32) -> Result<Self, TransportError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|err| codec_error("failed to create opus encoder", err))?;
        encoder
            .set_inband_fec(false)
            .map_err(|err| codec_error("failed to disable fec", err))?;
        encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .map_err(|err| codec_error("failed to set bitrate", err))?;
        Ok(Self { encoder, bitrate })
    }
}

impl VoiceEncoder for OpusVoiceEncoder {
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, TransportError> {
        self.encoder
            .encode_float(pcm, out)
            .map_err(|err| codec_error("opus encode failed", err))
    }

    fn set_bitrate(&mut self, bitrate: i32) -> Result<(), TransportError> {
        if bitrate == self.bitrate {
            return Ok(());
        }
        self.encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .map_err(|err| codec_error("failed to set bitrate", err))?;
        self.bitrate = bitrate;
        Ok(())
    }

    fn bitrate(&self) -> i32 {
        self.bitrate
    }

    fn reset(&mut self) {
        if let Err(err) = self.encoder.reset_state() {
            warn!("opus encoder reset failed: {err}");
        }
    }
}
