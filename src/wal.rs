//! Facility log: one record per committed transaction.
//!
//! Record layout, little endian: `[u32 len][bincode Vec<Event>][u32 crc32]`.
//! A transaction's events share a record, so a crash mid-write drops the
//! whole transaction rather than half of it. Reading stops at the first
//! record that is short, fails its checksum or does not decode; that tail is
//! cut off before the log takes new appends.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Length prefix plus checksum.
const RECORD_OVERHEAD: u64 = 8;

fn encode_record(events: &[Event]) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "transaction too large for one log record"))?;
    let mut record = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(record)
}

/// `Ok(false)` when the file ends before `buf` is full.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// The intact prefix of a log file.
struct Recovered {
    events: Vec<Event>,
    valid_len: u64,
    records: u64,
}

fn read_records(path: &Path) -> io::Result<Recovered> {
    let mut recovered = Recovered {
        events: Vec::new(),
        valid_len: 0,
        records: 0,
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(recovered),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    loop {
        let mut len_buf = [0u8; 4];
        if !read_full(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u64::from(u32::from_le_bytes(len_buf));
        // A garbage length must not turn into a huge allocation.
        if recovered.valid_len + RECORD_OVERHEAD + len > file_len {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        let mut crc_buf = [0u8; 4];
        if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        let Ok(batch) = bincode::deserialize::<Vec<Event>>(&payload) else {
            break;
        };
        recovered.events.extend(batch);
        recovered.valid_len += RECORD_OVERHEAD + len;
        recovered.records += 1;
    }
    Ok(recovered)
}

/// Append handle on one facility log. Owned by the facility's writer task.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes covered by complete records.
    len: u64,
    /// Records after the base record (provisioning or snapshot).
    appends_since_compact: u64,
}

impl Wal {
    /// Open the log for appending, creating it if missing.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::recover(path)?.0)
    }

    /// Read the intact records, cut off any torn tail and open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let recovered = read_records(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > recovered.valid_len {
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            file,
            path: path.to_path_buf(),
            len: recovered.valid_len,
            appends_since_compact: recovered.records.saturating_sub(1),
        };
        Ok((wal, recovered.events))
    }

    /// Events of every intact record, in commit order.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(read_records(path)?.events)
    }

    /// Write one transaction as a single record and fsync it. On failure the
    /// file is cut back to its last complete record.
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        let record = encode_record(events)?;
        if let Err(e) = self.file.write_all(&record).and_then(|()| self.file.sync_data()) {
            if let Err(cut) = self.file.set_len(self.len) {
                return Err(io::Error::new(
                    e.kind(),
                    format!("{e}; removing the partial record also failed: {cut}"),
                ));
            }
            return Err(e);
        }
        if self.len > 0 {
            self.appends_since_compact += 1;
        }
        self.len += record.len() as u64;
        Ok(())
    }

    /// Replace the whole log with `events` as its only record. The new log
    /// is written and fsynced beside the old one, then renamed over it.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let record = encode_record(events)?;
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&record)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = record.len() as u64;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}
