use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// Outcome buckets for one dump run. Used for reporting only.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub unknown_type: BTreeSet<String>,
    pub no_media_key: BTreeSet<String>,
    pub no_file_hash: BTreeSet<String>,
    pub failed_media_downloads: BTreeSet<String>,
    pub successful_media_downloads: BTreeSet<String>,
    pub cached_media_downloads: BTreeSet<String>,
}

impl Stats {
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            unknown_type: self.unknown_type.len(),
            no_media_key: self.no_media_key.len(),
            no_file_hash: self.no_file_hash.len(),
            failed_media_downloads: self.failed_media_downloads.len(),
            successful_media_downloads: self.successful_media_downloads.len(),
            cached_media_downloads: self.cached_media_downloads.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub unknown_type: usize,
    pub no_media_key: usize,
    pub no_file_hash: usize,
    pub failed_media_downloads: usize,
    pub successful_media_downloads: usize,
    pub cached_media_downloads: usize,
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} messages skipped because of unknown type", self.unknown_type)?;
        writeln!(f, "{} messages skipped because they had no mediaKey", self.no_media_key)?;
        writeln!(f, "{} media messages without a filehash", self.no_file_hash)?;
        writeln!(f, "{} failed media downloads", self.failed_media_downloads)?;
        writeln!(f, "{} successful media downloads", self.successful_media_downloads)?;
        write!(f, "{} cached media downloads", self.cached_media_downloads)
    }
}
