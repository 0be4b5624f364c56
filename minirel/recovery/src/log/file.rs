// Append-only log file.
//
// Record layout (little-endian):
// ┌────────────┬────────────┬───────────┐
// │ u32 len    │ u32 crc32  │ payload…  │
// └────────────┴────────────┴───────────┘
// - `len`    : number of bytes in payload
// - `crc32`  : checksum of payload for corruption detection
//
// The first MASTER_SLOT_SIZE bytes hold the master record in the same framing, padded
// with zeros so it can be rewritten in place. A record's LSN is its byte offset.
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::warn;

use super::{LogScan, LogStore};
use crate::error::{LogError, LogResult};
use crate::record::{LogEntry, LogRecord, Lsn, MASTER_LSN};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32
const MASTER_SLOT_SIZE: u64 = 32;

#[derive(Debug, Clone)]
pub struct FileLogConfig {
    pub log_path: PathBuf,
}

fn default_log_path() -> PathBuf {
    match temp_dir::TempDir::new() {
        Ok(tmp_dir) => {
            let path = tmp_dir.path().join("minirel-wal.log");
            tmp_dir.leak();
            path
        }
        Err(_) => std::env::temp_dir().join("minirel-wal.log"),
    }
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
        }
    }
}

struct FileLogInner {
    /// `None` once the log is closed.
    writer: Option<BufWriter<File>>,
    reader: File,
    /// Offset one past the last record.
    end: u64,
    /// Every byte before this offset is durable.
    durable: u64,
}

/// Write-ahead log stored in a single file.
pub struct FileLog {
    inner: Mutex<FileLogInner>,
    path: PathBuf,
}

fn frame(record: &LogRecord) -> LogResult<Vec<u8>> {
    let payload = record.to_bytes()?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    let len = payload.len() as u32;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.extend_from_slice(&payload);
    Ok(data)
}

fn master_slot(record: &LogRecord) -> LogResult<Vec<u8>> {
    if !matches!(record, LogRecord::Master { .. }) {
        return Err(LogError::UnexpectedRecord(format!(
            "expected a master record, got {}",
            record.log_type()
        )));
    }
    let mut data = frame(record)?;
    if data.len() as u64 > MASTER_SLOT_SIZE {
        return Err(LogError::SerializationFailed(
            "master record does not fit its slot".to_string(),
        ));
    }
    data.resize(MASTER_SLOT_SIZE as usize, 0);
    Ok(data)
}

/// Read the record framed at `offset`. Returns `None` at the end of the file, including
/// a record cut short by a crash during append, and the offset of the following record
/// otherwise.
fn read_at(reader: &mut File, offset: u64) -> LogResult<Option<(LogRecord, u64)>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let (len, checksum) = header.split_at(4);
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
    let checksum = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);

    let mut payload = Vec::new();
    Read::by_ref(reader).take(len as u64).read_to_end(&mut payload)?;
    if payload.len() < len {
        return Ok(None);
    }
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != checksum {
        return Err(LogError::ChecksumMismatch);
    }

    let next = if offset == MASTER_LSN {
        MASTER_SLOT_SIZE
    } else {
        offset + (HEADER_SIZE + len) as u64
    };
    Ok(Some((LogRecord::from_bytes(&payload)?, next)))
}

/// Offset one past the last complete record of a file `len` bytes long.
fn complete_end(reader: &mut File, len: u64) -> LogResult<u64> {
    let mut offset = MASTER_SLOT_SIZE;
    while offset < len {
        match read_at(reader, offset) {
            Ok(Some((_, next))) => offset = next,
            Ok(None) => return Ok(offset),
            Err(LogError::Io(e)) => return Err(e.into()),
            // Corrupt records are reported when they are read.
            Err(_) => return Ok(len),
        }
    }
    Ok(len)
}

impl FileLog {
    /// Open the log at the configured path, creating it (with an empty master record)
    /// if it does not exist. A partial record left at the end by a crash is cut off.
    pub fn open(config: FileLogConfig) -> LogResult<Self> {
        let path = config.log_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&master_slot(&LogRecord::Master {
                last_checkpoint_lsn: MASTER_LSN,
            })?)?;
            file.sync_data()?;
            len = MASTER_SLOT_SIZE;
        } else if len < MASTER_SLOT_SIZE {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "log file is shorter than its master record",
            )));
        }
        let mut reader = File::open(&path)?;
        let end = complete_end(&mut reader, len)?;
        if end < len {
            warn!(path = %path.display(), len, end, "truncating partial record at end of log");
            file.set_len(end)?;
            file.sync_data()?;
            len = end;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(FileLogInner {
                writer: Some(BufWriter::new(file)),
                reader,
                end: len,
                durable: len,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLogInner {
    fn writer(&mut self) -> LogResult<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or(LogError::Closed)
    }

    /// Push buffered appends to the OS so the reader sees them.
    fn flush_buffer(&mut self) -> LogResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> LogResult<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        self.durable = self.end;
        Ok(())
    }
}

impl LogStore for FileLog {
    /// If the write fails, the file is truncated back to where the record started so
    /// no partial record is left behind.
    fn append(&self, record: LogRecord) -> LogResult<Lsn> {
        if matches!(record, LogRecord::Master { .. }) {
            return Err(LogError::UnexpectedRecord(
                "master records are rewritten, not appended".to_string(),
            ));
        }
        let data = frame(&record)?;
        let mut inner = self.inner.lock();
        let lsn = inner.end;
        let writer = inner.writer()?;
        if let Err(e) = writer.write_all(&data) {
            writer.seek(SeekFrom::Start(lsn))?;
            writer.get_ref().set_len(lsn)?;
            return Err(e.into());
        }
        inner.end += data.len() as u64;
        Ok(lsn)
    }

    fn flush_to_lsn(&self, lsn: Lsn) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if lsn < inner.durable {
            return Ok(());
        }
        inner.sync()
    }

    fn fetch(&self, lsn: Lsn) -> LogResult<LogEntry> {
        let mut inner = self.inner.lock();
        if lsn >= inner.end {
            return Err(LogError::InvalidLsn(lsn));
        }
        inner.flush_buffer()?;
        let (record, _) = read_at(&mut inner.reader, lsn)?.ok_or(LogError::InvalidLsn(lsn))?;
        Ok(LogEntry { lsn, record })
    }

    fn scan_from(&self, lsn: Lsn) -> LogResult<LogScan<'_>> {
        let mut next = Some(lsn);
        Ok(Box::new(std::iter::from_fn(move || {
            let offset = next.take()?;
            let mut inner = self.inner.lock();
            if offset >= inner.end {
                return None;
            }
            let read = inner
                .flush_buffer()
                .and_then(|_| read_at(&mut inner.reader, offset));
            match read {
                Ok(Some((record, following))) => {
                    next = Some(following);
                    Some(Ok(LogEntry {
                        lsn: offset,
                        record,
                    }))
                }
                Ok(None) => None,
                // Stop after the first unreadable record.
                Err(e) => Some(Err(e)),
            }
        })))
    }

    fn rewrite_master(&self, record: LogRecord) -> LogResult<()> {
        let slot = master_slot(&record)?;
        let mut inner = self.inner.lock();
        let writer = inner.writer()?;
        writer.seek(SeekFrom::Start(MASTER_LSN))?;
        writer.write_all(&slot)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        writer.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.writer.is_none() {
            return Ok(());
        }
        inner.sync()?;
        inner.writer = None;
        Ok(())
    }
}
