//! Journal writer
//!
//! Appends go to a buffered file under one mutex, which also owns the
//! sequence counter, so sequence order is file order. Physical flushes are
//! batched by a timer ([`JournalWriter::spawn_flusher`]) or forced with
//! [`JournalWriter::flush`].

use super::record::JournalRecord;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strata_common::{Error, JournalConfig, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct WriterState {
    file: BufWriter<File>,
    next_sequence: u32,
    size: u64,
    /// Bytes appended since the last flush
    pending: bool,
}

/// Append-only journal writer
pub struct JournalWriter {
    path: PathBuf,
    state: Mutex<WriterState>,
    config: JournalConfig,
}

impl JournalWriter {
    /// Open the journal, creating it if missing
    ///
    /// The existing log is scanned to resume the sequence counter. A torn
    /// trailing frame is cut off; a corrupt frame is an error.
    pub fn open(path: impl AsRef<Path>, config: JournalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_sequence, valid_len, file_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open journal: {e}")))?;

        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)?;
        }

        let mut file = BufWriter::with_capacity(config.write_buffer_size, file);
        file.seek(SeekFrom::Start(valid_len))?;

        info!(
            path = %path.display(),
            last_sequence,
            bytes = valid_len,
            "Opened journal"
        );

        Ok(Self {
            path,
            state: Mutex::new(WriterState {
                file,
                next_sequence: last_sequence + 1,
                size: valid_len,
                pending: false,
            }),
            config,
        })
    }

    /// Returns (last sequence, length of the valid prefix, file length)
    fn scan(path: &Path) -> Result<(u32, u64, u64)> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0, 0)),
            Err(e) => return Err(Error::storage(format!("failed to read journal: {e}"))),
        };

        let mut pos = 0usize;
        let mut last_sequence = 0u32;
        while pos < data.len() {
            match JournalRecord::decode(&data[pos..])? {
                Some((record, used)) => {
                    last_sequence = last_sequence.max(record.sequence());
                    pos += used;
                }
                None => {
                    JournalRecord::ensure_torn_tail(&data, pos)?;
                    break;
                }
            }
        }
        Ok((last_sequence, pos as u64, data.len() as u64))
    }

    /// Append a record, assigning its sequence number
    pub fn append(&self, mut record: JournalRecord) -> Result<u32> {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        record.set_sequence(sequence);
        let frame = record.encode();

        state
            .file
            .write_all(&frame)
            .map_err(|e| Error::storage(format!("journal write failed: {e}")))?;
        state.next_sequence = sequence
            .checked_add(1)
            .ok_or_else(|| Error::internal("journal sequence space exhausted"))?;
        state.size += frame.len() as u64;
        state.pending = true;

        debug!(sequence, kind = ?record.kind(), "Journal append");
        Ok(sequence)
    }

    /// Push buffered frames to the file and, if configured, to the disk
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::flush_locked(&mut state, self.config.sync_on_flush)
    }

    fn flush_locked(state: &mut WriterState, sync: bool) -> Result<()> {
        state
            .file
            .flush()
            .map_err(|e| Error::storage(format!("journal flush failed: {e}")))?;
        if sync {
            state
                .file
                .get_ref()
                .sync_data()
                .map_err(|e| Error::storage(format!("journal sync failed: {e}")))?;
        }
        state.pending = false;
        Ok(())
    }

    /// Flush on a fixed timer whenever something was appended
    ///
    /// The task stops once the writer is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let writer: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(writer) = writer.upgrade() else {
                    break;
                };
                let mut state = writer.state.lock();
                if !state.pending {
                    continue;
                }
                if let Err(e) = Self::flush_locked(&mut state, writer.config.sync_on_flush) {
                    warn!(error = %e, "Background journal flush failed");
                }
            }
        })
    }

    /// Drop all frames, keeping the sequence counter
    ///
    /// Only valid once every group in the log is closed and the pages it
    /// describes are durable.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::flush_locked(&mut state, false)?;
        state.file.get_ref().set_len(0)?;
        state.file.seek(SeekFrom::Start(0))?;
        state.file.get_ref().sync_all()?;
        state.size = 0;
        info!(
            path = %self.path.display(),
            next_sequence = state.next_sequence,
            "Journal reset"
        );
        Ok(())
    }

    /// Last assigned sequence, 0 if none
    pub fn current_sequence(&self) -> u32 {
        self.state.lock().next_sequence - 1
    }

    /// Bytes in the log, including unflushed frames
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
