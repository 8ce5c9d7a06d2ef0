use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::DumpError;

/// What to do with a message row that decrypts but does not decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Abort the whole run (no archive is written).
    #[default]
    Abort,
    /// Log the failure and keep the record without a decoded `msgRow`.
    Skip,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DumpConfig {
    /// Save media on top of text messages.
    pub dump_media: bool,
    /// Only dump media already in the local cache. Only relevant with
    /// `dump_media`.
    pub dump_only_cached_media: bool,
    /// Put newly downloaded media into the cache. Only relevant when
    /// downloads are allowed.
    pub save_downloaded_media_to_cache: bool,
    pub on_decode_error: DecodeErrorPolicy,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dump_media: false,
            dump_only_cached_media: true,
            save_downloaded_media_to_cache: true,
            on_decode_error: DecodeErrorPolicy::Abort,
        }
    }
}

impl DumpConfig {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, DumpError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| DumpError::Config(format!("{}: {e}", path.display())))
    }
}
