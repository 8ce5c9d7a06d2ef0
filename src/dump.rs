//! Putting it together: discover the row key, decrypt every message, pull in
//! media, and pack everything into an archive. Also the reverse direction,
//! turning an archive back into the four collections.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use base64::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::{filehash_from_entry_name, media_entry_name, ArchiveEntry, MEDIA_DIR};
use crate::cipher::{decrypt_row, DecryptionContext};
use crate::config::{DecodeErrorPolicy, DumpConfig};
use crate::discovery::{discover, ContextCell, DecryptObserver};
use crate::error::{ArchiveError, DiscoveryError, DumpError, Result};
use crate::media::{acquire_media, MediaCache, MediaFetcher};
use crate::protobuf::decode_message_row;
use crate::record::EncodedRecord;
use crate::source::{ObjectStore, RecordSource};
use crate::stats::{Stats, StatsSummary};

pub const MESSAGE_DOCUMENT: &str = "message.json";
pub const CHAT_DOCUMENT: &str = "chat.json";
pub const CONTACT_DOCUMENT: &str = "contact.json";
pub const GROUP_DOCUMENT: &str = "group-metadata.json";

/// Decrypted messages plus what came out of the media pipeline.
#[derive(Debug, Default)]
pub struct MessageDump {
    pub messages: Vec<EncodedRecord>,
    /// Plaintext media keyed by content hash.
    pub media: BTreeMap<String, Vec<u8>>,
    pub stats: Stats,
    pub seen_kinds: BTreeSet<String>,
    /// Chat rows kept without `msgRow` because they did not decode.
    pub undecodable: BTreeSet<String>,
}

/// Everything that goes into one archive.
#[derive(Debug, Default)]
pub struct Dump {
    pub messages: MessageDump,
    pub chats: Vec<Value>,
    pub contacts: Vec<Value>,
    pub groups: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub messages: usize,
    pub chats: usize,
    pub contacts: usize,
    pub groups: usize,
    pub media: usize,
    pub undecodable: usize,
    pub stats: StatsSummary,
    pub seen_kinds: Vec<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} messages decoded", self.messages)?;
        if self.undecodable > 0 {
            writeln!(f, "{} chat messages kept without a decoded row", self.undecodable)?;
        }
        writeln!(f, "{}", self.stats)?;
        writeln!(f, "{} media files", self.media)?;
        writeln!(
            f,
            "{} chats, {} contacts, {} groups",
            self.chats, self.contacts, self.groups
        )?;
        write!(f, "seen message types: {}", self.seen_kinds.join(", "))
    }
}

impl Dump {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            messages: self.messages.messages.len(),
            chats: self.chats.len(),
            contacts: self.contacts.len(),
            groups: self.groups.len(),
            media: self.messages.media.len(),
            undecodable: self.messages.undecodable.len(),
            stats: self.messages.stats.summary(),
            seen_kinds: self.messages.seen_kinds.iter().cloned().collect(),
        }
    }

    /// The four JSON documents followed by one `media/` entry per content
    /// hash, in hash order.
    pub fn into_archive_entries(self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = vec![
            ArchiveEntry::new(
                MESSAGE_DOCUMENT,
                to_json(MESSAGE_DOCUMENT, &self.messages.messages)?,
            ),
            ArchiveEntry::new(CHAT_DOCUMENT, to_json(CHAT_DOCUMENT, &self.chats)?),
            ArchiveEntry::new(CONTACT_DOCUMENT, to_json(CONTACT_DOCUMENT, &self.contacts)?),
            ArchiveEntry::new(GROUP_DOCUMENT, to_json(GROUP_DOCUMENT, &self.groups)?),
        ];
        for (hash, bytes) in self.messages.media {
            entries.push(ArchiveEntry::new(media_entry_name(&hash), bytes));
        }
        Ok(entries)
    }
}

fn to_json<T: Serialize + ?Sized>(document: &'static str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|source| DumpError::Serialize { document, source })
}

/// One dump run over a record source.
pub struct Dumper<'a> {
    config: DumpConfig,
    source: &'a dyn RecordSource,
    cache: &'a dyn MediaCache,
    fetcher: &'a dyn MediaFetcher,
}

impl<'a> Dumper<'a> {
    pub fn new(
        config: DumpConfig,
        source: &'a dyn RecordSource,
        cache: &'a dyn MediaCache,
        fetcher: &'a dyn MediaFetcher,
    ) -> Self {
        Self {
            config,
            source,
            cache,
            fetcher,
        }
    }

    /// Full run: key discovery, messages, then the three plain stores.
    /// Nothing is returned unless every stage succeeds.
    pub fn run(&self, cell: &ContextCell, observer: &mut dyn DecryptObserver) -> Result<Dump> {
        let context = self.decryption_context(cell, observer)?;
        let messages = self.dump_messages(context)?;

        Ok(Dump {
            messages,
            chats: self.dump_object_store(ObjectStore::Chat)?,
            contacts: self.dump_object_store(ObjectStore::Contact)?,
            groups: self.dump_object_store(ObjectStore::GroupMetadata)?,
        })
    }

    fn dump_object_store(&self, store: ObjectStore) -> Result<Vec<Value>> {
        info!("fetching object store {}", store.name());
        Ok(self.source.records(store)?)
    }

    /// Returns the stored context, or samples a chat row from the source and
    /// runs discovery against it.
    pub fn decryption_context<'c>(
        &self,
        cell: &'c ContextCell,
        observer: &mut dyn DecryptObserver,
    ) -> Result<&'c DecryptionContext> {
        if let Some(context) = cell.get() {
            info!("reusing previously stored decryption arguments");
            return Ok(context);
        }
        let test = self
            .source
            .probe_record()?
            .ok_or(DiscoveryError::NoProbeRecord)?;
        Ok(discover(cell, observer, &test)?)
    }

    pub fn dump_messages(&self, context: &DecryptionContext) -> Result<MessageDump> {
        info!("fetching messages");
        let records = self.source.messages()?;
        let total = records.len();
        info!(total, "fetched all messages, decrypting");

        let mut dump = MessageDump {
            messages: Vec::with_capacity(total),
            ..MessageDump::default()
        };
        let mut last_percentage = 0;
        for (done, mut record) in records.into_iter().enumerate() {
            dump.seen_kinds
                .insert(record.kind.clone().unwrap_or_else(|| "undefined".to_string()));
            self.decrypt_message(context, &mut dump, &mut record)?;
            dump.messages.push(record);

            let percentage = percent_done(done + 1, total);
            if percentage != last_percentage {
                info!("progress: {percentage}%");
                last_percentage = percentage;
            }
        }

        info!("{} messages decoded", dump.messages.len());
        for line in dump.stats.summary().to_string().lines() {
            info!("{line}");
        }
        info!(
            "seen message types: {}",
            dump.seen_kinds.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(dump)
    }

    /// Replaces the opaque payload of `record` with its plaintext, decoding
    /// chat rows and fetching media along the way. Records without a payload
    /// are left alone.
    fn decrypt_message(
        &self,
        context: &DecryptionContext,
        dump: &mut MessageDump,
        record: &mut EncodedRecord,
    ) -> Result<()> {
        let Some(opaque) = record.opaque.take() else {
            return Ok(());
        };
        let id = record.id_string();
        let plaintext = decrypt_row(context, &opaque).map_err(|source| {
            error!(%id, error = %source, "could not decrypt message");
            DumpError::Decrypt {
                id: id.clone(),
                source,
            }
        })?;
        record.row_data = Some(BASE64_STANDARD.encode(&plaintext));

        if record.is_chat() {
            match decode_message_row(&plaintext) {
                Ok(row) => record.set_row(row),
                Err(source) => match self.config.on_decode_error {
                    DecodeErrorPolicy::Abort => {
                        error!(%id, error = %source, "could not decode message");
                        return Err(DumpError::Decode { id, source });
                    }
                    DecodeErrorPolicy::Skip => {
                        warn!(%id, error = %source, "could not decode message, keeping raw row");
                        dump.undecodable.insert(id);
                    }
                },
            }
        } else if self.config.dump_media && record.is_media() {
            let bytes = acquire_media(
                &self.config,
                self.cache,
                self.fetcher,
                &mut dump.stats,
                record,
            )
            .map_err(|source| {
                error!(%id, error = %source, "could not download and decrypt media");
                DumpError::Media {
                    id: id.clone(),
                    source,
                }
            })?;
            match (bytes, record.filehash.as_ref()) {
                (Some(bytes), Some(hash)) => {
                    dump.media.insert(hash.clone(), bytes);
                }
                (Some(_), None) => debug!(%id, "media has no filehash, leaving it out of the archive"),
                (None, _) => {}
            }
        } else {
            dump.stats.unknown_type.insert(id);
        }
        Ok(())
    }
}

/// The four collections and the media map read back from an archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpData {
    pub messages: Vec<Value>,
    pub chats: Vec<Value>,
    pub contacts: Vec<Value>,
    pub groups: Vec<Value>,
    pub media: BTreeMap<String, Vec<u8>>,
}

impl DumpData {
    /// Distinct message `type` values, sorted.
    pub fn message_kinds(&self) -> BTreeSet<&str> {
        self.messages
            .iter()
            .filter_map(|m| m.get("type").and_then(Value::as_str))
            .collect()
    }
}

/// Validates an archive's documents, restores media hashes and applies
/// display order.
pub fn extract_dump(entries: Vec<ArchiveEntry>) -> std::result::Result<DumpData, ArchiveError> {
    let mut documents = BTreeMap::new();
    let mut media = BTreeMap::new();
    for entry in entries {
        match entry.name.strip_prefix(MEDIA_DIR) {
            Some(name) if !name.is_empty() => {
                media.insert(filehash_from_entry_name(name), entry.content);
            }
            _ => {
                documents.insert(entry.name, entry.content);
            }
        }
    }

    let mut parse = |document: &'static str| -> std::result::Result<Vec<Value>, ArchiveError> {
        let bytes = documents
            .remove(document)
            .ok_or(ArchiveError::MissingDocument(document))?;
        let text = String::from_utf8(bytes).map_err(|_| ArchiveError::InvalidUtf8 { document })?;
        serde_json::from_str(&text).map_err(|source| ArchiveError::InvalidJson { document, source })
    };
    let mut data = DumpData {
        messages: parse(MESSAGE_DOCUMENT)?,
        contacts: parse(CONTACT_DOCUMENT)?,
        groups: parse(GROUP_DOCUMENT)?,
        chats: parse(CHAT_DOCUMENT)?,
        media,
    };
    sort_newest_first(&mut data.chats);
    sort_newest_first(&mut data.messages);
    Ok(data)
}

fn percent_done(done: usize, total: usize) -> usize {
    done * 100 / total.max(1)
}

fn timestamp(record: &Value) -> Option<f64> {
    record.get("t").and_then(Value::as_f64)
}

/// Sorts chats or messages newest first. Records without a `t` go after all
/// dated ones and keep their source order.
///
/// Messages and chats share this order. Listing undated messages first would
/// put them above the latest conversation in a newest-first view, so they
/// are treated the same way as undated chats.
pub fn sort_newest_first(records: &mut [Value]) {
    records.sort_by(|a, b| match (timestamp(a), timestamp(b)) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
