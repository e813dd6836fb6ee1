//! OCB2-AES128 state for the UDP media channel.
//!
//! Every datagram is `[nonce byte 0][tag 0..3][ciphertext]`. The peer only
//! transmits the low byte of its nonce, so [`CryptState::decrypt`] infers the
//! rest from the last accepted nonce, tolerating loss, late packets and
//! wraparound within a small window.

use crate::transport::errors::TransportError;
use log::debug;
use openssl::symm::{Cipher, Crypter, Mode};
use thiserror::Error;

pub const AES_BLOCK_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4;

/// How far behind the current nonce a late packet may still be accepted.
const LATE_WINDOW: i32 = 30;

type Block = [u8; AES_BLOCK_SIZE];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecryptFailure {
    /// Shorter than the four byte header.
    TooShort,
    /// Nonce byte could not be placed relative to the current nonce.
    OutOfOrder,
    /// Nonce was already accepted once.
    Replay,
    /// Recomputed tag differs from the received one.
    TagMismatch,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptError {
    #[error("key must be 16 bytes, got {0}")]
    InvalidKey(usize),
    #[error("nonce must be 16 bytes, got {0}")]
    InvalidNonce(usize),
    #[error("decrypt failed: {0:?}")]
    Decrypt(DecryptFailure),
    #[error("cipher failure: {0}")]
    Cipher(String),
}

impl From<openssl::error::ErrorStack> for CryptError {
    fn from(error: openssl::error::ErrorStack) -> Self {
        CryptError::Cipher(error.to_string())
    }
}

impl From<CryptError> for TransportError {
    fn from(error: CryptError) -> Self {
        TransportError::Crypt(error.to_string())
    }
}

/// Counters for accepted, late and lost datagrams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
}

struct BlockCipher {
    encryptor: Crypter,
    decryptor: Crypter,
    scratch: [u8; AES_BLOCK_SIZE * 2],
}

impl BlockCipher {
    fn new(key: &Block) -> Result<Self, CryptError> {
        let cipher = Cipher::aes_128_ecb();
        let mut encryptor = Crypter::new(cipher, Mode::Encrypt, key, None)?;
        encryptor.pad(false);
        let mut decryptor = Crypter::new(cipher, Mode::Decrypt, key, None)?;
        decryptor.pad(false);
        Ok(Self {
            encryptor,
            decryptor,
            scratch: [0u8; AES_BLOCK_SIZE * 2],
        })
    }

    fn encrypt(&mut self, input: &Block) -> Result<Block, CryptError> {
        let written = self.encryptor.update(input, &mut self.scratch)?;
        Self::take_block(&self.scratch, written)
    }

    fn decrypt(&mut self, input: &Block) -> Result<Block, CryptError> {
        let written = self.decryptor.update(input, &mut self.scratch)?;
        Self::take_block(&self.scratch, written)
    }

    fn take_block(scratch: &[u8], written: usize) -> Result<Block, CryptError> {
        if written != AES_BLOCK_SIZE {
            return Err(CryptError::Cipher(format!(
                "block transform produced {written} bytes"
            )));
        }
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&scratch[..AES_BLOCK_SIZE]);
        Ok(out)
    }
}

fn s2(block: &mut Block) {
    let carry = block[0] >> 7;
    for i in 0..AES_BLOCK_SIZE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[AES_BLOCK_SIZE - 1] = (block[AES_BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
}

fn s3(block: &mut Block) {
    let carry = block[0] >> 7;
    for i in 0..AES_BLOCK_SIZE - 1 {
        block[i] ^= (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[AES_BLOCK_SIZE - 1] ^= (block[AES_BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
}

fn xor_into(dst: &mut Block, other: &[u8]) {
    for (d, o) in dst.iter_mut().zip(other) {
        *d ^= o;
    }
}

fn to_block(bytes: &[u8]) -> Block {
    let mut block = [0u8; AES_BLOCK_SIZE];
    block.copy_from_slice(&bytes[..AES_BLOCK_SIZE]);
    block
}

fn length_block(remaining: usize, delta: &Block) -> Block {
    let bits = (remaining * 8) as u16;
    let mut block = [0u8; AES_BLOCK_SIZE];
    block[AES_BLOCK_SIZE - 2..].copy_from_slice(&bits.to_be_bytes());
    xor_into(&mut block, delta);
    block
}

fn increment(bytes: &mut [u8]) {
    for byte in bytes {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

fn decrement(bytes: &mut [u8]) {
    for byte in bytes {
        let before = *byte;
        *byte = byte.wrapping_sub(1);
        if before != 0 {
            break;
        }
    }
}

fn block_from_slice(bytes: &[u8], make_error: fn(usize) -> CryptError) -> Result<Block, CryptError> {
    if bytes.len() != AES_BLOCK_SIZE {
        return Err(make_error(bytes.len()));
    }
    Ok(to_block(bytes))
}

pub struct CryptState {
    key: Block,
    client_nonce: Block,
    server_nonce: Block,
    history: [u8; 256],
    cipher: BlockCipher,
    stats: CryptStats,
}

impl std::fmt::Debug for CryptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptState")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CryptState {
    pub fn new(key: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> Result<Self, CryptError> {
        let key = block_from_slice(key, CryptError::InvalidKey)?;
        Ok(Self {
            key,
            client_nonce: block_from_slice(client_nonce, CryptError::InvalidNonce)?,
            server_nonce: block_from_slice(server_nonce, CryptError::InvalidNonce)?,
            history: [0u8; 256],
            cipher: BlockCipher::new(&key)?,
            stats: CryptStats::default(),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn client_nonce(&self) -> &[u8] {
        &self.client_nonce
    }

    pub fn server_nonce(&self) -> &[u8] {
        &self.server_nonce
    }

    pub fn stats(&self) -> CryptStats {
        self.stats
    }

    /// Replaces the decrypt nonce after the server announces a resync.
    pub fn set_server_nonce(&mut self, nonce: &[u8]) -> Result<(), CryptError> {
        self.server_nonce = block_from_slice(nonce, CryptError::InvalidNonce)?;
        debug!("server nonce resynchronised");
        Ok(())
    }

    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptError> {
        increment(&mut self.client_nonce);
        let mut out = vec![0u8; plain.len() + HEADER_SIZE];
        let nonce = self.client_nonce;
        let tag = self.ocb_encrypt(plain, &mut out[HEADER_SIZE..], &nonce)?;
        out[0] = nonce[0];
        out[1..HEADER_SIZE].copy_from_slice(&tag[..3]);
        Ok(out)
    }

    pub fn decrypt(&mut self, source: &[u8]) -> Result<Vec<u8>, CryptError> {
        if source.len() < HEADER_SIZE {
            return Err(CryptError::Decrypt(DecryptFailure::TooShort));
        }

        let saved = self.server_nonce;
        let ivbyte = source[0];
        let current = self.server_nonce[0];
        let mut restore = false;
        let mut late = 0;
        let mut lost = 0i32;

        if current.wrapping_add(1) == ivbyte {
            if ivbyte > current {
                self.server_nonce[0] = ivbyte;
            } else if ivbyte < current {
                self.server_nonce[0] = ivbyte;
                increment(&mut self.server_nonce[1..]);
            } else {
                return Err(CryptError::Decrypt(DecryptFailure::OutOfOrder));
            }
        } else {
            let mut diff = i32::from(ivbyte) - i32::from(current);
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if ivbyte < current && diff > -LATE_WINDOW && diff < 0 {
                self.server_nonce[0] = ivbyte;
                late = 1;
                lost = -1;
                restore = true;
            } else if ivbyte > current && diff > -LATE_WINDOW && diff < 0 {
                self.server_nonce[0] = ivbyte;
                decrement(&mut self.server_nonce[1..]);
                late = 1;
                lost = -1;
                restore = true;
            } else if ivbyte > current && diff > 0 {
                self.server_nonce[0] = ivbyte;
                lost = diff - 1;
            } else if ivbyte < current && diff > 0 {
                self.server_nonce[0] = ivbyte;
                increment(&mut self.server_nonce[1..]);
                lost = diff - 1;
            } else {
                return Err(CryptError::Decrypt(DecryptFailure::OutOfOrder));
            }

            if self.history[usize::from(self.server_nonce[0])] == self.server_nonce[1] {
                self.server_nonce = saved;
                return Err(CryptError::Decrypt(DecryptFailure::Replay));
            }
        }

        let mut plain = vec![0u8; source.len() - HEADER_SIZE];
        let nonce = self.server_nonce;
        let tag = match self.ocb_decrypt(&source[HEADER_SIZE..], &mut plain, &nonce) {
            Ok(tag) => tag,
            Err(error) => {
                self.server_nonce = saved;
                return Err(error);
            }
        };

        if tag[..3] != source[1..HEADER_SIZE] {
            self.server_nonce = saved;
            return Err(CryptError::Decrypt(DecryptFailure::TagMismatch));
        }

        self.history[usize::from(self.server_nonce[0])] = self.server_nonce[1];
        if restore {
            self.server_nonce = saved;
        }

        self.stats.good += 1;
        self.stats.late += late;
        self.stats.lost = self.stats.lost.saturating_add_signed(lost);
        Ok(plain)
    }

    fn ocb_encrypt(&mut self, plain: &[u8], out: &mut [u8], nonce: &Block) -> Result<Block, CryptError> {
        let mut checksum = [0u8; AES_BLOCK_SIZE];
        let mut delta = self.cipher.encrypt(nonce)?;
        let mut offset = 0;
        let mut remaining = plain.len();

        while remaining > AES_BLOCK_SIZE {
            s2(&mut delta);
            let chunk = &plain[offset..offset + AES_BLOCK_SIZE];
            xor_into(&mut checksum, chunk);
            let mut tmp = delta;
            xor_into(&mut tmp, chunk);
            let mut encrypted = self.cipher.encrypt(&tmp)?;
            xor_into(&mut encrypted, &delta);
            out[offset..offset + AES_BLOCK_SIZE].copy_from_slice(&encrypted);
            offset += AES_BLOCK_SIZE;
            remaining -= AES_BLOCK_SIZE;
        }

        s2(&mut delta);
        let pad = self.cipher.encrypt(&length_block(remaining, &delta))?;
        let mut tmp = pad;
        tmp[..remaining].copy_from_slice(&plain[offset..]);
        xor_into(&mut checksum, &tmp);
        xor_into(&mut tmp, &pad);
        out[offset..].copy_from_slice(&tmp[..remaining]);

        s3(&mut delta);
        xor_into(&mut delta, &checksum);
        self.cipher.encrypt(&delta)
    }

    fn ocb_decrypt(&mut self, encrypted: &[u8], out: &mut [u8], nonce: &Block) -> Result<Block, CryptError> {
        let mut checksum = [0u8; AES_BLOCK_SIZE];
        let mut delta = self.cipher.encrypt(nonce)?;
        let mut offset = 0;
        let mut remaining = encrypted.len();

        while remaining > AES_BLOCK_SIZE {
            s2(&mut delta);
            let mut tmp = delta;
            xor_into(&mut tmp, &encrypted[offset..offset + AES_BLOCK_SIZE]);
            let mut decrypted = self.cipher.decrypt(&tmp)?;
            xor_into(&mut decrypted, &delta);
            xor_into(&mut checksum, &decrypted);
            out[offset..offset + AES_BLOCK_SIZE].copy_from_slice(&decrypted);
            offset += AES_BLOCK_SIZE;
            remaining -= AES_BLOCK_SIZE;
        }

        s2(&mut delta);
        let pad = self.cipher.encrypt(&length_block(remaining, &delta))?;
        let mut tmp = [0u8; AES_BLOCK_SIZE];
        tmp[..remaining].copy_from_slice(&encrypted[offset..]);
        xor_into(&mut tmp, &pad);
        xor_into(&mut checksum, &tmp);
        out[offset..].copy_from_slice(&tmp[..remaining]);

        s3(&mut delta);
        xor_into(&mut delta, &checksum);
        self.cipher.encrypt(&delta)
    }
}
