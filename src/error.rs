use thiserror::Error;

/// Failure while parsing a decrypted message row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("non-specced field {0}")]
    UnknownField(u32),

    #[error("varint wider than 4 bytes, field numbers and lengths must fit in 32 bits")]
    VarintTooWide,

    #[error("unexpected end of buffer at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("bad type for wire type {wire_type} data in field {field}: declared {declared}")]
    TypeMismatch {
        field: &'static str,
        wire_type: u8,
        declared: &'static str,
    },

    #[error("unimplemented wire type {0}")]
    UnimplementedWireType(u8),

    #[error("mismatching cursor {cursor} and length {length}")]
    CursorMismatch { cursor: usize, length: usize },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Failure while deriving media keys.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("bad media type {0}")]
    UnsupportedType(String),

    #[error("media key is not valid base64: {0}")]
    InvalidMediaKey(#[from] base64::DecodeError),

    #[error("HKDF expand failed")]
    Expand,
}

/// Failure while decrypting a media blob or a message row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("invalid key length {0}")]
    InvalidKeyLength(usize),

    #[error("invalid IV length {0}")]
    InvalidIv(usize),

    #[error("ciphertext too short ({0} bytes)")]
    TooShort(usize),

    #[error("ciphertext length {0} is not a multiple of the block size")]
    NotBlockAligned(usize),

    #[error("bad padding")]
    Padding,

    #[error("AEAD decryption failed")]
    Aead,

    #[error("unsupported algorithm: {0}")]
    Unsupported(String),
}

/// Why one observed decrypt operation was rejected as the row key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("test data did not decrypt: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("test data decrypted but did not decode: {0}")]
    Decode(#[from] DecodeError),
}

/// Failure of the key-discovery procedure as a whole. Individual probe
/// failures are never surfaced through this type.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no chat row with opaque data to probe against")]
    NoProbeRecord,

    #[error("observer ran out of decrypt operations before a key was found")]
    ObserverExhausted,

    #[error("decrypt interception was already installed and restored in this process")]
    InterceptorSpent,

    #[error("observer error: {0}")]
    Observer(String),
}

/// Failure of the external record source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record {index} in store {store} is not valid JSON: {source}")]
    Json {
        store: &'static str,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of the content-addressed media cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport failure of the media fetch collaborator. Non-success
/// responses are not errors; they come back as a status code.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetching {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure in the media pipeline that is not a per-item download problem.
/// Download problems are classified into stats instead.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("media cache: {0}")]
    Cache(#[from] CacheError),

    #[error("media keys: {0}")]
    Keys(#[from] KeyError),

    #[error("media decryption: {0}")]
    Decrypt(#[from] DecryptError),
}

/// Structural failure while writing or reading an archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("tar name too long ({len}): {name}")]
    NameTooLong { name: String, len: usize },

    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error("duplicate entry name {0}")]
    DuplicateName(String),

    #[error("bad header at offset {offset}: {reason}")]
    BadHeader { offset: usize, reason: String },

    #[error("entry {name} is truncated")]
    Truncated { name: String },

    #[error("could not find file {0} in tar archive")]
    MissingDocument(&'static str),

    #[error("could not decode UTF-8 contents of file {document}")]
    InvalidUtf8 { document: &'static str },

    #[error("could not decode JSON in file {document}: {source}")]
    InvalidJson {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level error: names the stage that aborted the dump.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("key discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("record source failed: {0}")]
    Source(#[from] SourceError),

    #[error("could not decrypt message {id}: {source}")]
    Decrypt {
        id: String,
        #[source]
        source: DecryptError,
    },

    #[error("could not decode message {id}: {source}")]
    Decode {
        id: String,
        #[source]
        source: DecodeError,
    },

    #[error("could not download and decrypt media for message {id}: {source}")]
    Media {
        id: String,
        #[source]
        source: MediaError,
    },

    #[error("could not serialize {document}: {source}")]
    Serialize {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DumpError>;
