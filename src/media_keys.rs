//! Per-item key material for encrypted media.

use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::KeyError;

const HKDF_HASH_LEN: usize = 32;
const MEDIA_KEY_MATERIAL_LEN: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Image,
    Sticker,
    Ptt,
    Audio,
    Video,
    Document,
}

impl MediaType {
    pub const ALL: [MediaType; 6] = [
        MediaType::Image,
        MediaType::Sticker,
        MediaType::Ptt,
        MediaType::Audio,
        MediaType::Video,
        MediaType::Document,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Sticker => "sticker",
            MediaType::Ptt => "ptt",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Document => "document",
        }
    }

    /// HKDF info string for this kind of media.
    pub fn hkdf_info(self) -> &'static str {
        match self {
            MediaType::Image | MediaType::Sticker => "WhatsApp Image Keys",
            MediaType::Ptt | MediaType::Audio => "WhatsApp Audio Keys",
            MediaType::Video => "WhatsApp Video Keys",
            MediaType::Document => "WhatsApp Document Keys",
        }
    }
}

impl FromStr for MediaType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| KeyError::UnsupportedType(s.to_string()))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_media_type(kind: &str) -> bool {
    kind.parse::<MediaType>().is_ok()
}

#[derive(Clone, PartialEq, Eq)]
pub struct MediaKeys {
    pub iv: [u8; 16],
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub ref_key: [u8; 32],
}

// Key material stays out of logs.
impl fmt::Debug for MediaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaKeys").finish_non_exhaustive()
    }
}

/// HKDF-SHA256 (RFC 5869). A missing salt is `HashLen` zero bytes.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    okm: &mut [u8],
) -> Result<(), KeyError> {
    let zero_salt = [0u8; HKDF_HASH_LEN];
    let hkdf = Hkdf::<Sha256>::new(Some(salt.unwrap_or(&zero_salt)), ikm);
    hkdf.expand(info, okm).map_err(|_| KeyError::Expand)
}

/// Derives the IV and keys for one media item from its base64 `mediaKey`.
pub fn derive_media_keys(type_tag: &str, media_key_b64: &str) -> Result<MediaKeys, KeyError> {
    let media_type: MediaType = type_tag.parse()?;
    let media_key = BASE64_STANDARD.decode(media_key_b64)?;
    derive_media_keys_raw(media_type, &media_key)
}

pub fn derive_media_keys_raw(media_type: MediaType, media_key: &[u8]) -> Result<MediaKeys, KeyError> {
    let mut okm = [0u8; MEDIA_KEY_MATERIAL_LEN];
    hkdf_sha256(media_key, None, media_type.hkdf_info().as_bytes(), &mut okm)?;

    let mut keys = MediaKeys {
        iv: [0u8; 16],
        enc_key: [0u8; 32],
        mac_key: [0u8; 32],
        ref_key: [0u8; 32],
    };
    keys.iv.copy_from_slice(&okm[..16]);
    keys.enc_key.copy_from_slice(&okm[16..48]);
    keys.mac_key.copy_from_slice(&okm[48..80]);
    keys.ref_key.copy_from_slice(&okm[80..112]);
    Ok(keys)
}
