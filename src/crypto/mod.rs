//! Block-level encryption for upper-layer file bodies.
//!
//! File content is stored as fixed-size encrypted blocks. Full blocks use
//! AES-CBC; the trailing partial block uses AES-CFB with a two-pass
//! XOR-cascade-and-reverse construction so every ciphertext byte depends on
//! the whole block in both directions. Each block's IV is derived from the
//! schedule's base IV and the block number with HMAC-SHA1.
//!
//! The key schedule is derived once at startup from an embedded password;
//! confidentiality against readers of the upper directory is explicitly not
//! a goal.

pub mod blockio;

use std::io;

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::NoPadding;
use cipher::{BlockCipher, BlockDecrypt, BlockEncrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::AsyncStreamCipher;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::Zeroizing;

/// AES block length; also the IV length for both modes.
pub const IV_LEN: usize = 16;

const KDF_SALT: &[u8] = b"jailfs-block-key";
const KDF_ROUNDS: u32 = 4096;

/// Embedded password the upper-layer key schedule is derived from.
pub const DEFAULT_PASSWORD: &[u8] = b"darkforest";

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_KEY_BITS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLen {
    Bits128,
    Bits192,
    Bits256,
}

impl KeyLen {
    fn from_bits(bits: usize) -> Self {
        match bits {
            128 => KeyLen::Bits128,
            192 => KeyLen::Bits192,
            _ => KeyLen::Bits256,
        }
    }

    fn key_bytes(self) -> usize {
        match self {
            KeyLen::Bits128 => 16,
            KeyLen::Bits192 => 24,
            KeyLen::Bits256 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CryptoParams {
    pub block_size: usize,
    pub key_bits: usize,
    pub allow_holes: bool,
}

impl Default for CryptoParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            key_bits: DEFAULT_KEY_BITS,
            allow_holes: true,
        }
    }
}

fn bad_message() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADMSG)
}

/// Key material plus derivation state, shared by every node.
pub struct KeySchedule {
    key: Zeroizing<Vec<u8>>,
    base_iv: [u8; IV_LEN],
    key_len: KeyLen,
    block_size: usize,
    allow_holes: bool,
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule")
            .field("key_len", &self.key_len)
            .field("block_size", &self.block_size)
            .field("allow_holes", &self.allow_holes)
            .finish()
    }
}

impl KeySchedule {
    pub fn from_password(password: &[u8], params: CryptoParams) -> Self {
        let key_len = KeyLen::from_bits(params.key_bits);
        let mut material = Zeroizing::new(vec![0u8; key_len.key_bytes() + IV_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha1>(password, KDF_SALT, KDF_ROUNDS, &mut material);

        let mut base_iv = [0u8; IV_LEN];
        base_iv.copy_from_slice(&material[key_len.key_bytes()..]);
        let key = Zeroizing::new(material[..key_len.key_bytes()].to_vec());

        Self {
            key,
            base_iv,
            key_len,
            block_size: params.block_size,
            allow_holes: params.allow_holes,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn allow_holes(&self) -> bool {
        self.allow_holes
    }

    /// Per-block IV: HMAC-SHA1 of (base IV, block number LE) keyed with the
    /// data key, truncated to the IV length.
    fn derive_iv(&self, seed: u64) -> [u8; IV_LEN] {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
            .expect("hmac accepts any key length");
        mac.update(&self.base_iv);
        mac.update(&seed.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        iv
    }

    /// Encrypt a whole number of cipher blocks in place.
    pub fn block_encode(&self, buf: &mut [u8], block_num: u64) -> io::Result<()> {
        if buf.len() % IV_LEN != 0 {
            return Err(bad_message());
        }
        let iv = self.derive_iv(block_num);
        let ok = match self.key_len {
            KeyLen::Bits128 => cbc_encrypt::<Aes128>(&self.key, &iv, buf),
            KeyLen::Bits192 => cbc_encrypt::<Aes192>(&self.key, &iv, buf),
            KeyLen::Bits256 => cbc_encrypt::<Aes256>(&self.key, &iv, buf),
        };
        if ok {
            Ok(())
        } else {
            Err(bad_message())
        }
    }

    /// Decrypt a whole number of cipher blocks in place.
    pub fn block_decode(&self, buf: &mut [u8], block_num: u64) -> io::Result<()> {
        if buf.len() % IV_LEN != 0 {
            return Err(bad_message());
        }
        let iv = self.derive_iv(block_num);
        let ok = match self.key_len {
            KeyLen::Bits128 => cbc_decrypt::<Aes128>(&self.key, &iv, buf),
            KeyLen::Bits192 => cbc_decrypt::<Aes192>(&self.key, &iv, buf),
            KeyLen::Bits256 => cbc_decrypt::<Aes256>(&self.key, &iv, buf),
        };
        if ok {
            Ok(())
        } else {
            Err(bad_message())
        }
    }

    /// Encrypt a partial block in place. Two stream passes with an
    /// XOR-cascade and byte reversal between them tie the ends of the block
    /// to each other.
    pub fn stream_encode(&self, buf: &mut [u8], block_num: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        shuffle_bytes(buf);
        self.cfb_encrypt(buf, self.derive_iv(block_num));
        flip_bytes(buf);
        shuffle_bytes(buf);
        self.cfb_encrypt(buf, self.derive_iv(block_num.wrapping_add(1)));
        Ok(())
    }

    /// Inverse of [`stream_encode`].
    pub fn stream_decode(&self, buf: &mut [u8], block_num: u64) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.cfb_decrypt(buf, self.derive_iv(block_num.wrapping_add(1)));
        unshuffle_bytes(buf);
        flip_bytes(buf);
        self.cfb_decrypt(buf, self.derive_iv(block_num));
        unshuffle_bytes(buf);
        Ok(())
    }

    fn cfb_encrypt(&self, buf: &mut [u8], iv: [u8; IV_LEN]) {
        match self.key_len {
            KeyLen::Bits128 => cfb_encrypt::<Aes128>(&self.key, &iv, buf),
            KeyLen::Bits192 => cfb_encrypt::<Aes192>(&self.key, &iv, buf),
            KeyLen::Bits256 => cfb_encrypt::<Aes256>(&self.key, &iv, buf),
        }
    }

    fn cfb_decrypt(&self, buf: &mut [u8], iv: [u8; IV_LEN]) {
        match self.key_len {
            KeyLen::Bits128 => cfb_decrypt::<Aes128>(&self.key, &iv, buf),
            KeyLen::Bits192 => cfb_decrypt::<Aes192>(&self.key, &iv, buf),
            KeyLen::Bits256 => cfb_decrypt::<Aes256>(&self.key, &iv, buf),
        }
    }
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> bool
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    let len = buf.len();
    match cbc::Encryptor::<C>::new_from_slices(key, iv) {
        Ok(enc) => enc.encrypt_padded_mut::<NoPadding>(buf, len).is_ok(),
        Err(_) => false,
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> bool
where
    C: BlockCipher + BlockDecrypt + KeyInit,
{
    match cbc::Decryptor::<C>::new_from_slices(key, iv) {
        Ok(dec) => dec.decrypt_padded_mut::<NoPadding>(buf).is_ok(),
        Err(_) => false,
    }
}

fn cfb_encrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8])
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    if let Ok(enc) = cfb_mode::Encryptor::<C>::new_from_slices(key, iv) {
        enc.encrypt(buf);
    }
}

fn cfb_decrypt<C>(key: &[u8], iv: &[u8], buf: &mut [u8])
where
    C: BlockCipher + BlockEncrypt + KeyInit,
{
    if let Ok(dec) = cfb_mode::Decryptor::<C>::new_from_slices(key, iv) {
        dec.decrypt(buf);
    }
}

/// Forward XOR cascade: each byte absorbs the one before it.
fn shuffle_bytes(buf: &mut [u8]) {
    for i in 0..buf.len().saturating_sub(1) {
        buf[i + 1] ^= buf[i];
    }
}

fn unshuffle_bytes(buf: &mut [u8]) {
    for i in (1..buf.len()).rev() {
        buf[i] ^= buf[i - 1];
    }
}

/// Reverse the buffer in runs of up to 64 bytes.
fn flip_bytes(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(64) {
        chunk.reverse();
    }
}
