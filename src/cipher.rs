//! Symmetric decryption of media blobs and message rows.

use std::fmt;

use aes::{Aes128, Aes256};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use cipher::consts::U16;
use cipher::{BlockDecrypt, BlockSizeUser, KeyInit, KeyIvInit, StreamCipher};
use ctr::{Ctr128BE, Ctr32BE, Ctr64BE};
use serde::{Deserialize, Serialize};

use crate::error::DecryptError;
use crate::media_keys::MediaKeys;
use crate::record::OpaqueData;

const BLOCK_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

/// Media downloads carry a truncated HMAC after the ciphertext.
pub const MEDIA_MAC_LEN: usize = 10;

/// Decrypts a downloaded media object. The trailing MAC is dropped, not
/// verified.
pub fn decrypt_media(keys: &MediaKeys, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if ciphertext.len() < MEDIA_MAC_LEN {
        return Err(DecryptError::TooShort(ciphertext.len()));
    }
    let body = &ciphertext[..ciphertext.len() - MEDIA_MAC_LEN];
    cbc_decrypt::<Aes256>(&keys.enc_key, &keys.iv, body)
}

/// Algorithm used for message rows, without the per-row IV. Serialized the
/// way the web client describes it (`{"name": "AES-CBC"}` and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum RowAlgorithm {
    #[serde(rename = "AES-CBC")]
    AesCbc,
    #[serde(rename = "AES-CTR")]
    AesCtr {
        #[serde(rename = "length")]
        counter_bits: u32,
    },
    #[serde(rename = "AES-GCM")]
    AesGcm {
        #[serde(rename = "tagLength", default = "default_tag_bits")]
        tag_bits: u32,
    },
}

fn default_tag_bits() -> u32 {
    128
}

impl RowAlgorithm {
    /// Decrypts `data` with this algorithm, `key` and the given IV.
    pub fn decrypt(&self, key: &RowKey, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let key = key.as_bytes();
        match (*self, key.len()) {
            (RowAlgorithm::AesCbc, 16) => cbc_decrypt::<Aes128>(key, iv, data),
            (RowAlgorithm::AesCbc, 32) => cbc_decrypt::<Aes256>(key, iv, data),
            (RowAlgorithm::AesCtr { counter_bits: 32 }, 16) => {
                ctr_decrypt::<Ctr32BE<Aes128>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits: 32 }, 32) => {
                ctr_decrypt::<Ctr32BE<Aes256>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits: 64 }, 16) => {
                ctr_decrypt::<Ctr64BE<Aes128>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits: 64 }, 32) => {
                ctr_decrypt::<Ctr64BE<Aes256>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits: 128 }, 16) => {
                ctr_decrypt::<Ctr128BE<Aes128>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits: 128 }, 32) => {
                ctr_decrypt::<Ctr128BE<Aes256>>(key, iv, data)
            }
            (RowAlgorithm::AesCtr { counter_bits }, 16 | 32) => Err(DecryptError::Unsupported(
                format!("AES-CTR with a {counter_bits}-bit counter"),
            )),
            (RowAlgorithm::AesGcm { tag_bits: 128 }, 16 | 32) => gcm_decrypt(key, iv, data),
            (RowAlgorithm::AesGcm { tag_bits }, 16 | 32) => Err(DecryptError::Unsupported(
                format!("AES-GCM with a {tag_bits}-bit tag"),
            )),
            (_, len) => Err(DecryptError::InvalidKeyLength(len)),
        }
    }
}

impl fmt::Display for RowAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowAlgorithm::AesCbc => f.write_str("AES-CBC"),
            RowAlgorithm::AesCtr { counter_bits } => write!(f, "AES-CTR/{counter_bits}"),
            RowAlgorithm::AesGcm { tag_bits } => write!(f, "AES-GCM/{tag_bits}"),
        }
    }
}

/// Raw AES key for message rows.
#[derive(Clone, PartialEq, Eq)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({} bytes)", self.0.len())
    }
}

/// Everything needed to decrypt message rows, minus the per-row IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionContext {
    pub algorithm: RowAlgorithm,
    pub key: RowKey,
}

impl DecryptionContext {
    pub fn new(algorithm: RowAlgorithm, key: RowKey) -> Self {
        Self { algorithm, key }
    }
}

/// Decrypts a message row with the row's own IV.
pub fn decrypt_row(context: &DecryptionContext, opaque: &OpaqueData) -> Result<Vec<u8>, DecryptError> {
    context
        .algorithm
        .decrypt(&context.key, &opaque.iv, &opaque.data)
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError>
where
    C: BlockDecrypt + KeyInit + BlockSizeUser<BlockSize = U16>,
{
    if iv.len() != BLOCK_LEN {
        return Err(DecryptError::InvalidIv(iv.len()));
    }
    if data.is_empty() {
        return Err(DecryptError::TooShort(0));
    }
    if data.len() % BLOCK_LEN != 0 {
        return Err(DecryptError::NotBlockAligned(data.len()));
    }
    let cipher = C::new_from_slice(key).map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;

    let mut previous = [0u8; BLOCK_LEN];
    previous.copy_from_slice(iv);
    let mut plaintext = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(BLOCK_LEN) {
        let mut block = aes::Block::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (byte, prev) in block.iter_mut().zip(previous.iter()) {
            *byte ^= prev;
        }
        plaintext.extend_from_slice(&block);
        previous.copy_from_slice(chunk);
    }

    strip_pkcs7(&mut plaintext)?;
    Ok(plaintext)
}

fn strip_pkcs7(plaintext: &mut Vec<u8>) -> Result<(), DecryptError> {
    let pad = *plaintext.last().ok_or(DecryptError::Padding)? as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > plaintext.len() {
        return Err(DecryptError::Padding);
    }
    let start = plaintext.len() - pad;
    if plaintext[start..].iter().any(|&b| b as usize != pad) {
        return Err(DecryptError::Padding);
    }
    plaintext.truncate(start);
    Ok(())
}

fn ctr_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError>
where
    C: KeyIvInit + StreamCipher,
{
    if iv.len() != BLOCK_LEN {
        return Err(DecryptError::InvalidIv(iv.len()));
    }
    let mut ctr =
        C::new_from_slices(key, iv).map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;
    let mut plaintext = data.to_vec();
    ctr.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

fn gcm_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if iv.len() != GCM_NONCE_LEN {
        return Err(DecryptError::InvalidIv(iv.len()));
    }
    let nonce = Nonce::from_slice(iv);
    let result = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| DecryptError::InvalidKeyLength(key.len()))?
            .decrypt(nonce, data),
        _ => Aes256Gcm::new_from_slice(key)
            .map_err(|_| DecryptError::InvalidKeyLength(key.len()))?
            .decrypt(nonce, data),
    };
    result.map_err(|_| DecryptError::Aead)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use cipher::BlockEncrypt;

    pub fn cbc_encrypt_256(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256::new_from_slice(key).unwrap();
        let pad = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
        let mut padded = plaintext.to_vec();
        padded.extend(std::iter::repeat(pad as u8).take(pad));

        let mut previous = *iv;
        let mut out = Vec::with_capacity(padded.len());
        for chunk in padded.chunks_exact(BLOCK_LEN) {
            let mut block = aes::Block::clone_from_slice(chunk);
            for (byte, prev) in block.iter_mut().zip(previous.iter()) {
                *byte ^= prev;
            }
            cipher.encrypt_block(&mut block);
            previous.copy_from_slice(&block);
            out.extend_from_slice(&block);
        }
        out
    }
}
