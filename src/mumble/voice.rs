//! Plaintext UDP payloads: voice frames and pings.

use crate::mumble::pool::{BufferPool, PooledBuf};
use crate::mumble::varint::{Vec3, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mumble_protocol_2x::voice::{ClientVoiceCodec, Serverbound, VoicePacket, VoicePacketPayload};
use std::io;
use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::codec::{Decoder, Encoder};

pub const PING_INTERVAL_MS: u64 = 1000;
pub const MAX_CONSECUTIVE_MISSED_UDP_PINGS: u32 = 5;
pub const SAMPLE_RATE: u32 = 48_000;
pub const OUTPUT_FRAME_SIZE: usize = (SAMPLE_RATE / 100) as usize;
pub const MAX_FRAMES_PER_PACKET: usize = 6;
pub const FRAMES_PER_OUTGOING_PACKET: i64 = 2;
pub const FRAME_SIZE_MS: u64 = FRAMES_PER_OUTGOING_PACKET as u64 * 10;
pub const MAX_CHANNELS: usize = 2;

const TYPE_SHIFT: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpMessageType {
    CeltAlpha = 0,
    Ping = 1,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

impl UdpMessageType {
    pub fn from_header(byte: u8) -> Result<Self, WireError> {
        match (byte >> TYPE_SHIFT) & 0x7 {
            0 => Ok(UdpMessageType::CeltAlpha),
            1 => Ok(UdpMessageType::Ping),
            2 => Ok(UdpMessageType::Speex),
            3 => Ok(UdpMessageType::CeltBeta),
            4 => Ok(UdpMessageType::Opus),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Low five bits of the voice header byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpeechTarget {
    #[default]
    Normal,
    Whisper(u8),
    ServerLoopback,
}

impl SpeechTarget {
    pub fn tag(self) -> u8 {
        match self {
            SpeechTarget::Normal => 0,
            SpeechTarget::Whisper(slot) => slot.clamp(1, 30),
            SpeechTarget::ServerLoopback => 31,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag & 0x1f {
            0 => SpeechTarget::Normal,
            31 => SpeechTarget::ServerLoopback,
            slot => SpeechTarget::Whisper(slot),
        }
    }
}

/// Decrypted voice frame, opus bytes held in a pooled buffer.
#[derive(Debug)]
pub struct VoiceFrame {
    pub session: u32,
    pub target: SpeechTarget,
    pub sequence: i64,
    pub opus: PooledBuf<u8>,
    pub is_last: bool,
    pub position: Vec3,
}

#[derive(Debug)]
pub enum Datagram {
    Voice(VoiceFrame),
    Ping { timestamp: u64 },
}

/// Parses a plaintext datagram received from the server.
pub fn parse_datagram(plain: &[u8], pool: &BufferPool<u8>) -> Result<Datagram, WireError> {
    let header = *plain.first().ok_or(WireError::Empty)?;
    match UdpMessageType::from_header(header)? {
        UdpMessageType::Ping => {
            let mut src = &plain[1..];
            if src.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            Ok(Datagram::Ping {
                timestamp: src.get_u64_le(),
            })
        }
        UdpMessageType::Opus => parse_voice(plain, pool),
        other => Err(WireError::UnknownType(other as u8)),
    }
}

fn codec_error(err: io::Error) -> WireError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => WireError::Truncated,
        _ => WireError::Codec(err.to_string()),
    }
}

fn parse_voice(plain: &[u8], pool: &BufferPool<u8>) -> Result<Datagram, WireError> {
    let mut src = BytesMut::from(plain);
    let packet = Decoder::decode(&mut ClientVoiceCodec::new(), &mut src)
        .map_err(codec_error)?
        .ok_or(WireError::Truncated)?;
    let VoicePacket::Audio {
        target,
        session_id,
        seq_num,
        payload: VoicePacketPayload::Opus(opus, is_last),
        position_info,
        ..
    } = packet
    else {
        return Err(WireError::UnknownType(plain[0] >> TYPE_SHIFT));
    };
    let position = match position_info {
        Some(mut trailing) => Vec3::read_trailing(&mut trailing),
        None => Vec3::INVALID,
    };

    Ok(Datagram::Voice(VoiceFrame {
        session: session_id,
        target: SpeechTarget::from_tag(target),
        sequence: seq_num as i64,
        opus: pool.checkout_from(&opus),
        is_last,
        position,
    }))
}

/// Writes an outbound opus frame. Outbound frames never carry a session id.
pub fn write_voice_frame(
    dst: &mut BytesMut,
    target: SpeechTarget,
    sequence: i64,
    opus: &[u8],
    is_last: bool,
    position: Vec3,
) -> Result<(), WireError> {
    let position_info = position.is_valid().then(|| {
        let mut trailing = BytesMut::with_capacity(Vec3::SIZE);
        position.write(&mut trailing);
        trailing.freeze()
    });
    let packet = VoicePacket::<Serverbound>::Audio {
        _dst: PhantomData,
        target: target.tag(),
        session_id: (),
        seq_num: sequence as u64,
        payload: VoicePacketPayload::Opus(Bytes::copy_from_slice(opus), is_last),
        position_info,
    };
    Encoder::encode(&mut ClientVoiceCodec::new(), packet, dst).map_err(codec_error)
}

pub fn write_ping<B: BufMut>(dst: &mut B, timestamp: u64) {
    dst.put_u8((UdpMessageType::Ping as u8) << TYPE_SHIFT);
    dst.put_u64_le(timestamp);
}

/// 100 ns ticks since the Unix epoch.
pub fn unix_ticks_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.as_nanos() / 100) as u64)
        .unwrap_or_default()
}
