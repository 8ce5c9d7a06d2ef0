//! Get all the messages, chats, contacts and media out of a WhatsApp Web
//! data store and into a single tar file.

pub mod archive;
pub mod cipher;
pub mod config;
pub mod discovery;
pub mod dump;
pub mod error;
pub mod media;
pub mod media_keys;
pub mod protobuf;
pub mod record;
pub mod source;
pub mod stats;

pub use archive::{read_archive, write_archive, ArchiveEntry};
pub use config::{DecodeErrorPolicy, DumpConfig};
pub use discovery::{ContextCell, DecryptObserver, ReplayObserver};
pub use dump::{extract_dump, Dump, DumpData, Dumper};
pub use error::{DumpError, Result};
