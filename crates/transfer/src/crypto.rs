//! Per-block streaming encryption.
//!
//! Each block is transformed in place using only the file IV and the block's
//! absolute offset, so blocks can be processed in any order and a range
//! download decrypts without touching earlier bytes.

use std::fmt;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use parking_lot::Mutex;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A length-preserving, offset-addressable transform.
pub trait BlockTransform: Send {
    /// Transforms `data` in place; `offset` is the absolute position of
    /// `data[0]` within the file.
    fn transform(&mut self, iv: u64, offset: u64, data: &mut [u8]);
}

/// AES-256 in counter mode.
///
/// The counter block is the IV as 8 big-endian bytes followed by the 16-byte
/// block number as 8 big-endian bytes. Applying it twice restores the input.
pub struct AesCtrTransform {
    key: [u8; 32],
}

impl AesCtrTransform {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl BlockTransform for AesCtrTransform {
    fn transform(&mut self, iv: u64, offset: u64, data: &mut [u8]) {
        let mut nonce = [0u8; 16];
        nonce[..8].copy_from_slice(&iv.to_be_bytes());
        let mut cipher = Aes256Ctr::new(&self.key.into(), &nonce.into());
        cipher.seek(offset);
        cipher.apply_keystream(data);
    }
}

/// Encryption context for one file.
///
/// Calls for one file serialize on the transform's lock.
pub struct FileEncryption {
    iv: u64,
    transform: Mutex<Box<dyn BlockTransform>>,
}

impl FileEncryption {
    pub fn new(iv: u64, transform: Box<dyn BlockTransform>) -> Self {
        Self {
            iv,
            transform: Mutex::new(transform),
        }
    }

    /// AES-256-CTR context for `key` and `iv`.
    pub fn aes_ctr(key: [u8; 32], iv: u64) -> Self {
        Self::new(iv, Box::new(AesCtrTransform::new(key)))
    }

    pub fn iv(&self) -> u64 {
        self.iv
    }

    /// Transforms `data`, which starts at absolute `offset` in the file.
    pub fn apply(&self, offset: u64, data: &mut [u8]) {
        self.transform.lock().transform(self.iv, offset, data);
    }
}

impl fmt::Debug for FileEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEncryption")
            .field("iv", &self.iv)
            .finish_non_exhaustive()
    }
}
