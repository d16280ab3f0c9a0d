//! Durable event history: one append-only log file per channel.
//!
//! File layout:
//!
//! ```text
//! header: magic "EVL\0" | version u8 | next_id u64 | name_len u16 | name
//! entry:  len u32 | msgpack(Event) | crc32(msgpack) u32
//! ```
//!
//! `next_id` in the header is the id floor at the time the file was written,
//! so ids never regress after compaction drops every entry.

use super::window::ChannelWindow;
use super::{retention_summary, EventStore};
use crate::channels::ChannelMap;
use crate::config::RetentionPolicy;
use crate::error::{RelayError, Result};
use crate::types::{Event, EventId, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for channel logs.
const LOG_MAGIC: &[u8; 4] = b"EVL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Sanity bound for a single entry.
const MAX_ENTRY_BYTES: usize = 64 * 1024 * 1024;

/// Evicted entries tolerated on disk before compaction is considered.
const COMPACT_FLOOR: usize = 64;

/// One channel's log file and its retained window.
struct ChannelLog {
    path: PathBuf,
    name: String,
    file: File,
    size: u64,
    window: ChannelWindow,
    /// Entries still on disk that retention has already evicted.
    dead: usize,
    writes_since_sync: u64,
}

impl ChannelLog {
    fn create(path: PathBuf, name: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)?;
        write_header(&mut file, EventId(1), name)?;
        file.sync_all()?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            name: name.to_string(),
            file,
            size,
            window: ChannelWindow::new(),
            dead: 0,
            writes_since_sync: 0,
        })
    }

    /// Rebuild the retained window from disk, truncating a torn tail.
    ///
    /// Returns `None` for a file whose header was never fully written; such a
    /// file holds no events and is removed.
    fn load(path: PathBuf, policy: &RetentionPolicy) -> Result<Option<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);

        let (floor, name, header_len) = match read_header(&mut reader) {
            Ok(header) => header,
            Err(RelayError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(
                    path = %path.display(),
                    file_size,
                    "ChannelLog::load: removing log with torn header"
                );
                drop(reader);
                drop(file);
                fs::remove_file(&path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let mut window = ChannelWindow::new();
        let mut previous = EventId::ZERO;
        let mut dead = 0;
        let mut offset = header_len;

        while offset < file_size {
            match read_entry(&mut reader) {
                Ok((event, frame_len)) => {
                    if event.id <= previous {
                        return Err(RelayError::OutOfOrder {
                            channel: name,
                            previous,
                            got: event.id,
                        });
                    }
                    previous = event.id;
                    dead += window.push(event, policy);
                    offset += frame_len;
                }
                Err(e) => {
                    warn!(
                        channel = %name,
                        offset,
                        file_size,
                        error = %e,
                        "ChannelLog::load: truncating unreadable tail"
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        window.raise_next_id(floor);
        dead += window.evict(policy, Timestamp::now());
        drop(reader);
        drop(file);

        Ok(Some(Self {
            file: OpenOptions::new().append(true).open(&path)?,
            path,
            name,
            size: offset,
            window,
            dead,
            writes_since_sync: 0,
        }))
    }

    fn append(
        &mut self,
        event_type: &str,
        payload: Vec<u8>,
        policy: &RetentionPolicy,
        sync_interval: u64,
    ) -> Result<Event> {
        let event = self.window.prepare(event_type, payload);
        let frame = encode_frame(&event)?;

        if let Err(e) = self.file.write_all(&frame) {
            // Roll back a partial frame so the next append starts clean.
            let _ = self.file.set_len(self.size);
            return Err(e.into());
        }
        self.size += frame.len() as u64;
        self.dead += self.window.push(event.clone(), policy);

        // The frame is written and visible to readers, so the append has
        // happened; a failed fsync is retried on the next append.
        self.writes_since_sync += 1;
        if self.writes_since_sync >= sync_interval {
            match self.file.sync_data() {
                Ok(()) => self.writes_since_sync = 0,
                Err(e) => warn!(
                    channel = %self.name,
                    event_id = event.id.0,
                    error = %e,
                    "ChannelLog::append: sync failed"
                ),
            }
        }

        if self.dead > COMPACT_FLOOR && self.dead > self.window.len() {
            if let Err(e) = self.compact() {
                warn!(channel = %self.name, error = %e, "ChannelLog::append: compaction failed");
            }
        }

        Ok(event)
    }

    /// Rewrite the file with only the retained entries.
    fn compact(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write_header(&mut writer, self.window.next_id(), &self.name)?;
            for event in self.window.iter() {
                writer.write_all(&encode_frame(event)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        let before = self.size;
        self.size = self.file.metadata()?.len();
        debug!(
            channel = %self.name,
            dropped = self.dead,
            before,
            after = self.size,
            "ChannelLog::compact"
        );
        self.dead = 0;
        self.writes_since_sync = 0;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.writes_since_sync = 0;
        Ok(())
    }
}

/// Event history backed by per-channel log files.
pub struct LogStore {
    dir: PathBuf,
    _lock_file: File,
    channels: ChannelMap<RwLock<ChannelLog>>,
    /// Serializes creation of new channel files.
    create_lock: Mutex<()>,
    policy: RetentionPolicy,
    sync_interval: u64,
}

impl LogStore {
    /// Default sync interval: fsync every 100 appends per channel.
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a store directory with the default sync interval.
    pub fn open(path: impl AsRef<Path>, policy: RetentionPolicy) -> Result<Self> {
        Self::open_with_sync_interval(path, policy, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a store directory.
    /// - sync_interval = 0 or 1: fsync every append (safest, slowest)
    /// - sync_interval = 100: fsync every 100 appends per channel
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        policy: RetentionPolicy,
        sync_interval: u64,
    ) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock_file = Self::acquire_lock(&dir)?;

        let channels = ChannelMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry_path = entry?.path();
            let file_name = match entry_path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if file_name.ends_with(".log.tmp") {
                // Leftover from an interrupted compaction; the original is intact.
                fs::remove_file(&entry_path)?;
            } else if file_name.ends_with(".log") {
                if let Some(log) = ChannelLog::load(entry_path, &policy)? {
                    channels.insert(log.name.clone(), RwLock::new(log));
                }
            }
        }

        info!(
            path = %dir.display(),
            channels = channels.names().len(),
            retention = %retention_summary(&policy),
            "LogStore::open"
        );

        Ok(Self {
            dir,
            _lock_file: lock_file,
            channels,
            create_lock: Mutex::new(()),
            policy,
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        let digest = Sha256::digest(channel.as_bytes());
        self.dir.join(format!("{}.log", hex::encode(digest)))
    }

    fn channel_log(&self, channel: &str) -> Result<std::sync::Arc<RwLock<ChannelLog>>> {
        if let Some(log) = self.channels.get(channel) {
            return Ok(log);
        }

        let _guard = self.create_lock.lock();
        if let Some(log) = self.channels.get(channel) {
            return Ok(log);
        }
        let log = ChannelLog::create(self.channel_path(channel), channel)?;
        debug!(channel, path = %log.path.display(), "LogStore: created channel log");
        Ok(self
            .channels
            .get_or_insert_with(channel, || RwLock::new(log)))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| RelayError::Locked)?;
        Ok(lock_file)
    }
}

impl EventStore for LogStore {
    fn append(&self, channel: &str, event_type: &str, payload: Vec<u8>) -> Result<Event> {
        let log = self.channel_log(channel)?;
        let mut log = log.write();
        log.append(event_type, payload, &self.policy, self.sync_interval)
    }

    fn read_since(&self, channel: &str, last_id: EventId) -> Result<Vec<Event>> {
        Ok(match self.channels.get(channel) {
            Some(log) => log.read().window.since(last_id, &self.policy),
            None => Vec::new(),
        })
    }

    fn latest_id(&self, channel: &str) -> Result<Option<EventId>> {
        Ok(self
            .channels
            .get(channel)
            .and_then(|log| log.read().window.latest()))
    }

    fn oldest_id(&self, channel: &str) -> Result<Option<EventId>> {
        Ok(self
            .channels
            .get(channel)
            .and_then(|log| log.read().window.oldest(&self.policy)))
    }

    fn channels(&self) -> Vec<String> {
        self.channels.names()
    }

    fn sync(&self) -> Result<()> {
        for log in self.channels.values() {
            log.write().sync()?;
        }
        Ok(())
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = EventStore::sync(self);
    }
}

fn write_header<W: Write>(writer: &mut W, next_id: EventId, name: &str) -> Result<()> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() > u16::MAX as usize {
        return Err(RelayError::InvalidFormat(format!(
            "Channel name too long: {} bytes",
            name_bytes.len()
        )));
    }
    writer.write_all(LOG_MAGIC)?;
    writer.write_all(&[LOG_VERSION])?;
    writer.write_all(&next_id.0.to_le_bytes())?;
    writer.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
    writer.write_all(name_bytes)?;
    Ok(())
}

/// Returns `(next_id floor, channel name, header length)`.
fn read_header<R: Read>(reader: &mut R) -> Result<(EventId, String, u64)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(RelayError::InvalidFormat("Invalid channel log magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != LOG_VERSION {
        return Err(RelayError::InvalidFormat(format!(
            "Unsupported log version: {}",
            version[0]
        )));
    }

    let mut id_bytes = [0u8; 8];
    reader.read_exact(&mut id_bytes)?;
    let next_id = EventId(u64::from_le_bytes(id_bytes));

    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;
    let name_len = u16::from_le_bytes(len_bytes) as usize;
    let mut name_bytes = vec![0u8; name_len];
    reader.read_exact(&mut name_bytes)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| RelayError::InvalidFormat("Channel name is not UTF-8".into()))?;

    Ok((next_id, name, (4 + 1 + 8 + 2 + name_len) as u64))
}

fn encode_frame(event: &Event) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(event)?;
    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Returns the event and the number of bytes its frame occupied.
fn read_entry<R: Read>(reader: &mut R) -> Result<(Event, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_ENTRY_BYTES {
        return Err(RelayError::Corruption("Log entry too large".into()));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(RelayError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let event = rmp_serde::from_slice(&body)?;
    Ok((event, (len + 8) as u64))
}
