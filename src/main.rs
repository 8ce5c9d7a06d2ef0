use std::fs::{self, File};
use std::io::{self, BufReader, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use whatsapp_dump::archive::{read_archive, write_archive_to};
use whatsapp_dump::media::{
    MediaCache, MediaFetcher, MemoryMediaCache, MirrorFetcher, OfflineFetcher, SqliteMediaCache,
};
use whatsapp_dump::source::SqliteRecordSource;
use whatsapp_dump::{
    extract_dump, ContextCell, DecodeErrorPolicy, DecryptObserver, DumpConfig, DumpError, Dumper,
    ReplayObserver, Result,
};

#[derive(Parser)]
#[command(author, version, about = "Dump WhatsApp Web chats, contacts and media to a tar file", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decrypt a record store into an archive
    Dump {
        /// SQLite export of the client's object stores
        store: PathBuf,

        /// Output archive, `-` for stdout
        #[arg(short, long, default_value = "whatsapp.tar")]
        out: PathBuf,

        /// Recorded decrypt operations, one JSON object per line
        #[arg(long)]
        observations: Option<PathBuf>,

        /// SQLite media cache
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Directory mirroring the media CDN
        #[arg(long)]
        mirror: Option<PathBuf>,

        /// JSON config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        dump_media: bool,

        /// Fetch media missing from the cache
        #[arg(long)]
        allow_downloads: bool,

        /// Do not store fetched media in the cache
        #[arg(long)]
        no_cache_writeback: bool,

        /// Keep chat rows that fail to decode instead of aborting
        #[arg(long)]
        skip_undecodable: bool,
    },

    /// Validate an archive and summarize its contents
    Inspect {
        archive: PathBuf,

        /// How many recent chats to list
        #[arg(long, default_value_t = 5)]
        chats: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Dump {
            store,
            out,
            observations,
            cache,
            mirror,
            config,
            dump_media,
            allow_downloads,
            no_cache_writeback,
            skip_undecodable,
        } => {
            let mut config = match config {
                Some(path) => DumpConfig::from_file(&path),
                None => Ok(DumpConfig::default()),
            };
            if let Ok(config) = config.as_mut() {
                config.dump_media |= dump_media;
                if allow_downloads {
                    config.dump_only_cached_media = false;
                }
                if no_cache_writeback {
                    config.save_downloaded_media_to_cache = false;
                }
                if skip_undecodable {
                    config.on_decode_error = DecodeErrorPolicy::Skip;
                }
            }
            config.and_then(|config| {
                run_dump(
                    config,
                    &store,
                    &out,
                    observations.as_deref(),
                    cache.as_deref(),
                    mirror.as_deref(),
                )
            })
        }
        Commands::Inspect { archive, chats } => inspect(&archive, chats),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_dump(
    config: DumpConfig,
    store: &Path,
    out: &Path,
    observations: Option<&Path>,
    cache: Option<&Path>,
    mirror: Option<&Path>,
) -> Result<()> {
    let source = SqliteRecordSource::open(store)?;

    let cache: Box<dyn MediaCache> = match cache {
        Some(path) => Box::new(SqliteMediaCache::open(path).map_err(|e| {
            DumpError::Config(format!("media cache {}: {e}", path.display()))
        })?),
        None => Box::new(MemoryMediaCache::new()),
    };
    let fetcher: Box<dyn MediaFetcher> = match mirror {
        Some(root) => Box::new(MirrorFetcher::new(root)),
        None => {
            if config.dump_media && !config.dump_only_cached_media {
                warn!("downloads allowed but no --mirror given, every download will fail");
            }
            Box::new(OfflineFetcher)
        }
    };
    let mut observer: Box<dyn DecryptObserver> = match observations {
        Some(path) => Box::new(
            ReplayObserver::new(BufReader::new(File::open(path)?))
                .interactive(io::stdin().is_terminal()),
        ),
        None => Box::new(ReplayObserver::prompt_only()),
    };

    let dumper = Dumper::new(config, &source, cache.as_ref(), fetcher.as_ref());
    let dump = dumper.run(ContextCell::global(), observer.as_mut())?;
    for line in dump.summary().to_string().lines() {
        info!("{line}");
    }

    let entries = dump.into_archive_entries()?;
    if out == Path::new("-") {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        write_archive_to(&mut lock, &entries)?;
        lock.flush()?;
    } else {
        // written next to the target and renamed, so a failed run leaves
        // no archive behind
        let partial = out.with_extension("tar.partial");
        let mut file = io::BufWriter::new(File::create(&partial)?);
        let written = write_archive_to(&mut file, &entries)
            .map_err(DumpError::from)
            .and_then(|()| Ok(file.flush()?));
        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        drop(file);
        fs::rename(&partial, out)?;
        info!("archive written to {}", out.display());
    }
    Ok(())
}

fn inspect(path: &Path, recent: usize) -> Result<()> {
    let bytes = fs::read(path)?;
    let data = extract_dump(read_archive(&bytes)?)?;

    println!("{} messages", data.messages.len());
    println!("{} chats", data.chats.len());
    println!("{} contacts", data.contacts.len());
    println!("{} groups", data.groups.len());
    println!("{} media files", data.media.len());
    println!(
        "message types: {}",
        data.message_kinds().into_iter().collect::<Vec<_>>().join(", ")
    );

    if recent > 0 && !data.chats.is_empty() {
        println!("most recent chats:");
        for chat in data.chats.iter().take(recent) {
            let name = chat
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| display_id(chat.get("id")));
            match chat.get("t").and_then(Value::as_i64) {
                Some(t) => println!("  {name} (t={t})"),
                None => println!("  {name}"),
            }
        }
    }
    Ok(())
}

fn display_id(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("_serialized")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string(),
        Some(other) => other.to_string(),
        None => "?".to_string(),
    }
}
