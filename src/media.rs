//! Getting plaintext bytes for media messages: local cache first, then the
//! CDN.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::cipher::decrypt_media;
use crate::config::DumpConfig;
use crate::error::{CacheError, FetchError, MediaError};
use crate::media_keys::derive_media_keys;
use crate::record::EncodedRecord;
use crate::stats::Stats;

/// Fallback CDN host for media.
pub const MEDIA_HOSTNAME: &str = "mmg.whatsapp.net";
pub const MEDIA_CACHE_NAME: &str = "lru-media-array-buffer-cache";
const MEDIA_CACHE_URL_PREFIX: &str = "https://_media_cache_v2_.whatsapp.com/";

/// Content-addressed byte cache.
pub trait MediaCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn put(&self, key: &str, body: &[u8]) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrieves a remote object. Transport failures are errors; anything the
/// server answered is a response.
pub trait MediaFetcher {
    fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// Cache key the web client uses for a media file.
pub fn cache_key(filehash: Option<&str>) -> String {
    let entry = format!("{MEDIA_CACHE_NAME}_{}", filehash.unwrap_or("undefined"));
    format!("{MEDIA_CACHE_URL_PREFIX}{}", encode_uri_component(&entry))
}

pub fn media_url(direct_path: &str) -> String {
    format!("https://{MEDIA_HOSTNAME}{direct_path}")
}

/// Percent-encodes everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
pub fn encode_uri_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Resolves the plaintext of one media record, or `None` when it cannot be
/// had. Every `None` is recorded in `stats`; errors are reserved for cache
/// failures and for downloads that do not decrypt.
pub fn acquire_media(
    config: &DumpConfig,
    cache: &dyn MediaCache,
    fetcher: &dyn MediaFetcher,
    stats: &mut Stats,
    record: &EncodedRecord,
) -> Result<Option<Vec<u8>>, MediaError> {
    let id = record.id_string();
    let Some(media_key) = record.media_key.as_deref() else {
        stats.no_media_key.insert(id);
        return Ok(None);
    };
    if record.filehash.is_none() {
        stats.no_file_hash.insert(id.clone());
    }

    let key = cache_key(record.filehash.as_deref());
    if let Some(cached) = cache.get(&key)? {
        debug!(%id, "media served from cache");
        stats.cached_media_downloads.insert(id);
        return Ok(Some(cached));
    }
    if config.dump_only_cached_media {
        return Ok(None);
    }

    let keys = derive_media_keys(record.kind(), media_key)?;
    let Some(direct_path) = record.direct_path.as_deref() else {
        warn!(%id, "media message has no direct path");
        stats.failed_media_downloads.insert(id);
        return Ok(None);
    };
    let url = media_url(direct_path);
    let response = match fetcher.fetch(&url) {
        Ok(response) if response.ok() => response,
        Ok(response) => {
            warn!(%id, %url, status = response.status, "media download failed");
            stats.failed_media_downloads.insert(id);
            return Ok(None);
        }
        Err(e) => {
            warn!(%id, %url, error = %e, "media download failed");
            stats.failed_media_downloads.insert(id);
            return Ok(None);
        }
    };

    stats.successful_media_downloads.insert(id);
    let plaintext = decrypt_media(&keys, &response.body)?;
    if config.save_downloaded_media_to_cache {
        cache.put(&key, &plaintext)?;
    }
    Ok(Some(plaintext))
}

/// Media cache kept in a SQLite file.
pub struct SqliteMediaCache {
    conn: Connection,
}

impl SqliteMediaCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media_cache (
                 key TEXT PRIMARY KEY,
                 body BLOB NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }
}

impl MediaCache for SqliteMediaCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self
            .conn
            .query_row(
                "SELECT body FROM media_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO media_cache (key, body) VALUES (?1, ?2)",
            params![key, body],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMediaCache {
    entries: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryMediaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl MediaCache for MemoryMediaCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), CacheError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }
}

/// Serves encrypted media from a local directory laid out like the CDN
/// (`<root>/v/t62.7118-24/...`). A missing file is a 404.
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local_path(&self, url: &str) -> Option<PathBuf> {
        let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let path = without_scheme.find('/').map_or("", |i| &without_scheme[i..]);
        let path = path.split(['?', '#']).next().unwrap_or("");
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl MediaFetcher for MirrorFetcher {
    fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let Some(path) = self.local_path(url) else {
            return Ok(FetchResponse {
                status: 400,
                body: Vec::new(),
            });
        };
        if !path.is_file() {
            return Ok(FetchResponse {
                status: 404,
                body: Vec::new(),
            });
        }
        Ok(FetchResponse {
            status: 200,
            body: fs::read(&path)?,
        })
    }
}

/// Fetcher for runs without network access: every fetch fails.
pub struct OfflineFetcher;

impl MediaFetcher for OfflineFetcher {
    fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        Err(FetchError::Transport {
            url: url.to_string(),
            reason: "network access is disabled".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::test_support::cbc_encrypt_256;
    use crate::cipher::MEDIA_MAC_LEN;
    use crate::media_keys::{derive_media_keys_raw, MediaType};
    use base64::prelude::*;
    use std::cell::Cell;

    const SECRET: [u8; 32] = [0x42; 32];

    struct CountingCache {
        inner: MemoryMediaCache,
        gets: Cell<usize>,
    }

    impl CountingCache {
        fn new() -> Self {
            Self {
                inner: MemoryMediaCache::new(),
                gets: Cell::new(0),
            }
        }
    }

    impl MediaCache for CountingCache {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.gets.set(self.gets.get() + 1);
            self.inner.get(key)
        }

        fn put(&self, key: &str, body: &[u8]) -> Result<(), CacheError> {
            self.inner.put(key, body)
        }
    }

    struct StubFetcher {
        response: Option<FetchResponse>,
        calls: Cell<usize>,
    }

    impl StubFetcher {
        fn new(response: Option<FetchResponse>) -> Self {
            Self {
                response,
                calls: Cell::new(0),
            }
        }
    }

    impl MediaFetcher for StubFetcher {
        fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
            self.calls.set(self.calls.get() + 1);
            self.response.clone().ok_or_else(|| FetchError::Transport {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            })
        }
    }

    fn image_record() -> EncodedRecord {
        EncodedRecord {
            id: Some("img-1".into()),
            kind: Some("image".to_string()),
            media_key: Some(BASE64_STANDARD.encode(SECRET)),
            direct_path: Some("/v/t62.7118-24/photo.enc".to_string()),
            filehash: Some("n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg=".to_string()),
            ..Default::default()
        }
    }

    fn encrypted_blob(plaintext: &[u8]) -> Vec<u8> {
        let keys = derive_media_keys_raw(MediaType::Image, &SECRET).unwrap();
        let mut blob = cbc_encrypt_256(&keys.enc_key, &keys.iv, plaintext);
        blob.extend_from_slice(&[0u8; MEDIA_MAC_LEN]);
        blob
    }

    fn downloads_allowed() -> DumpConfig {
        DumpConfig {
            dump_media: true,
            dump_only_cached_media: false,
            ..DumpConfig::default()
        }
    }

    #[test]
    fn cache_key_matches_web_client() {
        assert_eq!(
            cache_key(Some("ab+c/d=")),
            "https://_media_cache_v2_.whatsapp.com/lru-media-array-buffer-cache_ab%2Bc%2Fd%3D"
        );
        assert_eq!(
            cache_key(None),
            "https://_media_cache_v2_.whatsapp.com/lru-media-array-buffer-cache_undefined"
        );
    }

    #[test]
    fn encode_uri_component_leaves_marks_alone() {
        assert_eq!(encode_uri_component("a-b_c.d!e~f*g'h(i)"), "a-b_c.d!e~f*g'h(i)");
        assert_eq!(encode_uri_component("a b&é"), "a%20b%26%C3%A9");
    }

    #[test]
    fn no_media_key_short_circuits() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(None);
        let mut stats = Stats::default();
        let record = EncodedRecord {
            media_key: None,
            ..image_record()
        };

        let out = acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &record).unwrap();
        assert_eq!(out, None);
        assert!(stats.no_media_key.contains("img-1"));
        assert_eq!(cache.gets.get(), 0);
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn cache_hit_never_fetches() {
        let cache = CountingCache::new();
        let record = image_record();
        cache
            .put(&cache_key(record.filehash.as_deref()), b"cached bytes")
            .unwrap();
        let fetcher = StubFetcher::new(None);
        let mut stats = Stats::default();

        let out = acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &record).unwrap();
        assert_eq!(out.as_deref(), Some(&b"cached bytes"[..]));
        assert!(stats.cached_media_downloads.contains("img-1"));
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn cached_only_mode_does_not_fetch() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(None);
        let mut stats = Stats::default();
        let config = DumpConfig {
            dump_media: true,
            ..DumpConfig::default()
        };

        let out = acquire_media(&config, &cache, &fetcher, &mut stats, &image_record()).unwrap();
        assert_eq!(out, None);
        assert_eq!(cache.gets.get(), 1);
        assert_eq!(fetcher.calls.get(), 0);
        assert_eq!(stats.summary(), Default::default());
    }

    #[test]
    fn transport_failure_is_classified() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(None);
        let mut stats = Stats::default();

        let out =
            acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &image_record()).unwrap();
        assert_eq!(out, None);
        assert!(stats.failed_media_downloads.contains("img-1"));
        assert!(stats.successful_media_downloads.is_empty());
    }

    #[test]
    fn error_status_is_classified() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(Some(FetchResponse {
            status: 404,
            body: Vec::new(),
        }));
        let mut stats = Stats::default();

        let out =
            acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &image_record()).unwrap();
        assert_eq!(out, None);
        assert_eq!(stats.summary().failed_media_downloads, 1);
    }

    #[test]
    fn download_is_decrypted_and_written_back() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(Some(FetchResponse {
            status: 200,
            body: encrypted_blob(b"JFIF photo bytes"),
        }));
        let mut stats = Stats::default();
        let record = image_record();

        let out = acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &record).unwrap();
        assert_eq!(out.as_deref(), Some(&b"JFIF photo bytes"[..]));
        assert!(stats.successful_media_downloads.contains("img-1"));
        assert_eq!(
            cache.get(&cache_key(record.filehash.as_deref())).unwrap().as_deref(),
            Some(&b"JFIF photo bytes"[..])
        );
    }

    #[test]
    fn write_back_can_be_disabled() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(Some(FetchResponse {
            status: 200,
            body: encrypted_blob(b"voice note"),
        }));
        let mut stats = Stats::default();
        let config = DumpConfig {
            save_downloaded_media_to_cache: false,
            ..downloads_allowed()
        };

        acquire_media(&config, &cache, &fetcher, &mut stats, &image_record()).unwrap();
        assert!(cache.inner.is_empty());
    }

    #[test]
    fn missing_hash_is_noted_but_not_fatal() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(Some(FetchResponse {
            status: 200,
            body: encrypted_blob(b"doc"),
        }));
        let mut stats = Stats::default();
        let record = EncodedRecord {
            filehash: None,
            ..image_record()
        };

        let out = acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &record).unwrap();
        assert_eq!(out.as_deref(), Some(&b"doc"[..]));
        assert!(stats.no_file_hash.contains("img-1"));
        assert!(stats.successful_media_downloads.contains("img-1"));
    }

    #[test]
    fn undecryptable_download_is_an_error() {
        let cache = CountingCache::new();
        let fetcher = StubFetcher::new(Some(FetchResponse {
            status: 200,
            body: vec![0u8; 3],
        }));
        let mut stats = Stats::default();

        let err = acquire_media(&downloads_allowed(), &cache, &fetcher, &mut stats, &image_record())
            .unwrap_err();
        assert!(matches!(err, MediaError::Decrypt(_)));
    }

    #[test]
    fn mirror_fetcher_maps_url_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("v/t62")).unwrap();
        fs::write(dir.path().join("v/t62/blob.enc"), b"ciphertext").unwrap();
        let fetcher = MirrorFetcher::new(dir.path());

        let hit = fetcher
            .fetch("https://mmg.whatsapp.net/v/t62/blob.enc?ccb=11-4&oh=abc")
            .unwrap();
        assert!(hit.ok());
        assert_eq!(hit.body, b"ciphertext");

        let miss = fetcher.fetch("https://mmg.whatsapp.net/v/t62/other.enc").unwrap();
        assert_eq!(miss.status, 404);

        let escape = fetcher.fetch("https://mmg.whatsapp.net/../secret").unwrap();
        assert_eq!(escape.status, 400);
    }

    #[test]
    fn sqlite_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteMediaCache::open(&dir.path().join("cache.sqlite")).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        cache.put("k", b"one").unwrap();
        cache.put("k", b"two").unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"two"[..]));
    }
}
