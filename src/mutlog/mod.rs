//! Append-only per-instance log of mutation intents and completions.
//!
//! Record framing is `[len:u32][mutID:u64][version:u32][op_kind:u8][payload]`
//! with big-endian integers; `len` counts everything after itself, so the
//! payload is `len - 13` bytes. Intents are written when a merge or split
//! starts and completions when it ends; replaying the log after a crash
//! re-drives any mutation whose completion never landed. Per-block
//! relabeling is idempotent, so replaying an already-applied mutation leaves
//! blocks unchanged.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, StrataError};
use crate::model::{InstanceId, MutationId, VersionId};

const RECORD_HEADER: usize = 13;

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OpKind {
    MergeStart = 0,
    MergeEnd = 1,
    SplitStart = 2,
    SplitEnd = 3,
}

impl OpKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpKind::MergeStart),
            1 => Ok(OpKind::MergeEnd),
            2 => Ok(OpKind::SplitStart),
            3 => Ok(OpKind::SplitEnd),
            _ => Err(StrataError::Corruption("unknown mutation log op kind")),
        }
    }

    pub fn is_intent(self) -> bool {
        matches!(self, OpKind::MergeStart | OpKind::SplitStart)
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogRecord {
    pub mutation: MutationId,
    pub version: VersionId,
    pub kind: OpKind,
    pub payload: Vec<u8>,
}

pub struct MutationLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    fsync: bool,
}

impl MutationLog {
    /// Opens (or creates) the log for one instance under `dir`.
    pub fn open(dir: &Path, instance: InstanceId, fsync: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("instance-{:08x}.mlog", instance.0));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "mutlog.open");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let len = (RECORD_HEADER + record.payload.len()) as u32;
        let mut writer = self.writer.lock();
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&record.mutation.0.to_be_bytes())?;
        writer.write_all(&record.version.0.to_be_bytes())?;
        writer.write_all(&[record.kind as u8])?;
        writer.write_all(&record.payload)?;
        writer.flush()?;
        if self.fsync {
            writer.get_ref().sync_data()?;
        }
        trace!(
            mutation = record.mutation.0,
            version = record.version.0,
            kind = ?record.kind,
            payload_len = record.payload.len(),
            "mutlog.append"
        );
        Ok(())
    }

    /// Reads every complete record in write order. A truncated trailing
    /// record ends the scan cleanly (an interrupted append); a frame that is
    /// internally inconsistent is corruption.
    pub fn replay(&self) -> Result<Vec<LogRecord>> {
        self.writer.lock().flush()?;
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let mut records = Vec::new();
        let mut off = 0usize;
        while off + 4 <= buf.len() {
            let len = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
            if len < RECORD_HEADER {
                return Err(StrataError::Corruption("mutation log frame too short"));
            }
            if off + 4 + len > buf.len() {
                // Interrupted tail write; everything before it is intact.
                break;
            }
            let body = &buf[off + 4..off + 4 + len];
            let mutation = MutationId(u64::from_be_bytes(body[0..8].try_into().unwrap()));
            let version = VersionId(u32::from_be_bytes(body[8..12].try_into().unwrap()));
            let kind = OpKind::from_u8(body[12])?;
            records.push(LogRecord {
                mutation,
                version,
                kind,
                payload: body[RECORD_HEADER..].to_vec(),
            });
            off += 4 + len;
        }
        Ok(records)
    }

    /// Intent records whose completion never arrived, in write order.
    pub fn unfinished(&self) -> Result<Vec<LogRecord>> {
        let records = self.replay()?;
        let mut pending: Vec<LogRecord> = Vec::new();
        for record in records {
            if record.kind.is_intent() {
                pending.push(record);
            } else {
                pending.retain(|r| r.mutation != record.mutation);
            }
        }
        Ok(pending)
    }
}
