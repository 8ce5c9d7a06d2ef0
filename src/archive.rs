//! The output container: just enough of the ustar-era tar format to write
//! our own archives and read them back.
//!
//! Header fields used (byte offsets):
//! - `[0, 100)`   name, NUL-terminated
//! - `[100, 108)` mode, 7 octal digits + NUL, always 0644
//! - `[124, 136)` size, 11 octal digits + NUL
//! - `[148, 156)` checksum, 6 octal digits + NUL + space
//! - `156`        type flag, `'0'`
//!
//! Everything else is zero. The archive ends with two zero blocks.

use std::collections::HashSet;
use std::io::Write;

use crate::error::ArchiveError;

pub const BLOCK_SIZE: usize = 512;

const NAME_LEN: usize = 100;
const MODE_OFFSET: usize = 100;
const MODE_LEN: usize = 8;
const SIZE_OFFSET: usize = 124;
const SIZE_LEN: usize = 12;
const CHECKSUM_OFFSET: usize = 148;
const CHECKSUM_LEN: usize = 8;
const TYPE_FLAG_OFFSET: usize = 156;

const FILE_MODE: u64 = 0o644;
const REGULAR_FILE: u8 = b'0';

pub const MEDIA_DIR: &str = "media/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

fn padded_len(size: usize) -> usize {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Exact size of the archive `write_archive` produces for `entries`.
pub fn archive_len(entries: &[ArchiveEntry]) -> usize {
    entries
        .iter()
        .map(|e| BLOCK_SIZE + padded_len(e.content.len()))
        .sum::<usize>()
        + 2 * BLOCK_SIZE
}

// Writes `value` as zero-padded octal into all but the last byte of `field`,
// which stays NUL.
fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0digits$o}");
    field[..digits].copy_from_slice(&text.as_bytes()[text.len() - digits..]);
}

/// Sum of all header bytes with the checksum field counted as spaces.
pub fn header_checksum(header: &[u8; BLOCK_SIZE]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if (CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN).contains(&i) {
                u64::from(b' ')
            } else {
                u64::from(b)
            }
        })
        .sum()
}

fn header(name: &str, size: usize) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];
    header[..name.len()].copy_from_slice(name.as_bytes());
    write_octal(&mut header[MODE_OFFSET..MODE_OFFSET + MODE_LEN], FILE_MODE);
    write_octal(
        &mut header[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN],
        size as u64,
    );
    header[TYPE_FLAG_OFFSET] = REGULAR_FILE;

    let checksum = header_checksum(&header);
    let field = &mut header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN];
    write_octal(&mut field[..7], checksum);
    field[7] = b' ';
    header
}

fn validate(entries: &[ArchiveEntry]) -> Result<(), ArchiveError> {
    let mut seen = HashSet::new();
    for entry in entries {
        let len = entry.name.len();
        if len > NAME_LEN {
            return Err(ArchiveError::NameTooLong {
                name: entry.name.clone(),
                len,
            });
        }
        if entry.name.is_empty() || entry.name.contains('\0') {
            return Err(ArchiveError::InvalidName(entry.name.clone()));
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(ArchiveError::DuplicateName(entry.name.clone()));
        }
    }
    Ok(())
}

/// Streams the archive for `entries` into `out`. All names are checked
/// before anything is written.
pub fn write_archive_to<W: Write>(mut out: W, entries: &[ArchiveEntry]) -> Result<(), ArchiveError> {
    validate(entries)?;
    let zeros = [0u8; BLOCK_SIZE];
    for entry in entries {
        out.write_all(&header(&entry.name, entry.content.len()))?;
        out.write_all(&entry.content)?;
        let padding = padded_len(entry.content.len()) - entry.content.len();
        out.write_all(&zeros[..padding])?;
    }
    out.write_all(&zeros)?;
    out.write_all(&zeros)?;
    Ok(())
}

pub fn write_archive(entries: &[ArchiveEntry]) -> Result<Vec<u8>, ArchiveError> {
    let mut buf = Vec::with_capacity(archive_len(entries));
    write_archive_to(&mut buf, entries)?;
    Ok(buf)
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if text.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(text, 8).ok()
}

/// Reads every entry back, in archive order. Checksums are not verified.
/// Blocks starting with a zero byte are skipped one at a time.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut entries = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        if bytes[cursor] == 0 {
            cursor += BLOCK_SIZE;
            continue;
        }
        let bad_header = |reason: &str| ArchiveError::BadHeader {
            offset: cursor,
            reason: reason.to_string(),
        };
        let header = bytes
            .get(cursor..cursor + BLOCK_SIZE)
            .ok_or_else(|| bad_header("truncated header"))?;

        let name_field = &header[..NAME_LEN];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| bad_header("name is not UTF-8"))?
            .to_string();
        // the size proper is 11 digits; the 12th byte is the terminator
        let size = parse_octal(&header[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN - 1])
            .ok_or_else(|| bad_header("size is not octal"))? as usize;

        let start = cursor + BLOCK_SIZE;
        let content = bytes
            .get(start..start + size)
            .ok_or_else(|| ArchiveError::Truncated { name: name.clone() })?;
        entries.push(ArchiveEntry {
            name,
            content: content.to_vec(),
        });
        cursor += BLOCK_SIZE + padded_len(size);
    }
    Ok(entries)
}

/// `media/` entry name for a base64 content hash.
pub fn media_entry_name(filehash: &str) -> String {
    let safe = filehash
        .replace('/', "_")
        .replace('+', "-")
        .trim_end_matches('=')
        .to_string();
    format!("{MEDIA_DIR}{safe}")
}

/// Inverse of the name transform: restores `/`, `+` and the `=` padding.
pub fn filehash_from_entry_name(name: &str) -> String {
    let mut hash = name.replace('_', "/").replace('-', "+");
    while hash.len() % 4 != 0 {
        hash.push('=');
    }
    hash
}
