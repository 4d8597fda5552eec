//! Log-structured file storage backend.
//!
//! # File layout
//!
//! ```text
//! Offset  Size  Description
//! ──────────────────────────────────────────────
//! 0x00    8     Magic: "QVDB0001"
//! 0x08    4     u32 LE  Format version (currently 1)
//! 0x0C    4     u32 LE  Reserved (zero)
//! 0x10    …     Frames, appended in arrival order
//! ```
//!
//! Each frame is `[kind: u8][payload_len: u32 LE][payload]`. Kind 1 carries
//! a whole put-batch as one JSON array — a torn batch frame is dropped
//! wholly on replay, which is what makes `put_batch` atomic. Kind 2 carries
//! a deleted id as a JSON string.
//!
//! An in-memory id → frame location map is rebuilt by replaying the log at
//! open. A truncated tail stops replay with a warning and the file is cut
//! back to the last whole frame. When dead bytes outgrow live bytes past a
//! floor, the live set is rewritten to a temp file which is renamed over
//! the log, with the parent directory fsynced.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Storage;
use crate::error::StorageError;
use crate::record::VectorRecord;

const MAGIC: [u8; 8] = *b"QVDB0001";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const FRAME_HEADER_SIZE: u64 = 5;

const FRAME_PUT_BATCH: u8 = 1;
const FRAME_DELETE: u8 = 2;

/// Compaction is considered once at least this much garbage accumulates.
const COMPACT_MIN_DEAD_BYTES: u64 = 1024 * 1024;
/// Records per frame when compaction rewrites the live set.
const COMPACT_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy)]
struct RecordLoc {
    /// Absolute offset of the frame's kind byte.
    frame_offset: u64,
    /// Whole frame length including the frame header.
    frame_len: u32,
    /// Position of this record within the frame's batch.
    slot: u32,
    /// Approximate byte share of this record, for garbage accounting.
    approx_len: u32,
}

struct Inner {
    path: PathBuf,
    file: Option<File>,
    index: BTreeMap<String, RecordLoc>,
    /// End of the last whole frame; the append position.
    end: u64,
    live_bytes: u64,
    dead_bytes: u64,
    max_bytes: Option<u64>,
}

pub struct FileStorage {
    inner: Mutex<Inner>,
}

impl FileStorage {
    /// Open or create the data file at `path`, replaying the log to rebuild
    /// the id index.
    pub fn open(path: impl AsRef<Path>, max_bytes: Option<u64>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            write_header(&mut file)?;
            file.sync_all()?;
            return Ok(Self {
                inner: Mutex::new(Inner {
                    path,
                    file: Some(file),
                    index: BTreeMap::new(),
                    end: HEADER_SIZE,
                    live_bytes: 0,
                    dead_bytes: 0,
                    max_bytes,
                }),
            });
        }

        read_header(&mut file, &path)?;
        let mut inner = Inner {
            path,
            file: Some(file),
            index: BTreeMap::new(),
            end: HEADER_SIZE,
            live_bytes: 0,
            dead_bytes: 0,
            max_bytes,
        };
        inner.replay()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Rewrite the live set, dropping garbage. Normally triggered
    /// automatically; exposed for explicit maintenance.
    pub fn compact(&self) -> Result<(), StorageError> {
        self.inner.lock().compact()
    }

    #[cfg(test)]
    fn file_len(&self) -> u64 {
        self.inner.lock().end
    }
}

fn write_header(file: &mut File) -> Result<(), StorageError> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&0u32.to_le_bytes())?;
    Ok(())
}

fn read_header(file: &mut File, path: &Path) -> Result<(), StorageError> {
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|_| {
        StorageError::Unavailable(format!("{}: file too small for header", path.display()))
    })?;
    if header[0..8] != MAGIC {
        return Err(StorageError::Unavailable(format!(
            "{}: not a quiver data file",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().expect("fixed slice"));
    if version != FORMAT_VERSION {
        return Err(StorageError::Unavailable(format!(
            "{}: unsupported format version {version}",
            path.display()
        )));
    }
    Ok(())
}

/// Encode a batch as one frame, returning the frame bytes and each record's
/// approximate payload share.
fn encode_put_batch(records: &[VectorRecord]) -> Result<(Vec<u8>, Vec<u32>), StorageError> {
    let mut payload = Vec::with_capacity(records.len() * 128);
    let mut shares = Vec::with_capacity(records.len());
    payload.push(b'[');
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            payload.push(b',');
        }
        let bytes = serde_json::to_vec(record)?;
        shares.push(bytes.len() as u32);
        payload.extend_from_slice(&bytes);
    }
    payload.push(b']');

    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_SIZE as usize);
    frame.push(FRAME_PUT_BATCH);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok((frame, shares))
}

fn encode_delete(id: &str) -> Result<Vec<u8>, StorageError> {
    let payload = serde_json::to_vec(id)?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_SIZE as usize);
    frame.push(FRAME_DELETE);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

impl Inner {
    fn file_mut(&mut self) -> Result<&mut File, StorageError> {
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("storage handle closed".into()))
    }

    /// Replay every frame, rebuilding the index. A torn tail truncates the
    /// file back to the last whole frame.
    fn replay(&mut self) -> Result<(), StorageError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::Unavailable("storage handle closed".into()))?;
        let result = self.replay_from(&mut file);
        self.file = Some(file);
        result
    }

    fn replay_from(&mut self, file: &mut File) -> Result<(), StorageError> {
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut offset = HEADER_SIZE;
        let mut torn = false;
        while offset < file_len {
            let mut frame_header = [0u8; FRAME_HEADER_SIZE as usize];
            if file.read_exact(&mut frame_header).is_err() {
                torn = true;
                break;
            }
            let kind = frame_header[0];
            let payload_len =
                u32::from_le_bytes(frame_header[1..5].try_into().expect("fixed slice")) as u64;
            if offset + FRAME_HEADER_SIZE + payload_len > file_len {
                torn = true;
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if file.read_exact(&mut payload).is_err() {
                torn = true;
                break;
            }
            let frame_len = (FRAME_HEADER_SIZE + payload_len) as u32;

            match kind {
                FRAME_PUT_BATCH => {
                    let records: Vec<VectorRecord> = match serde_json::from_slice(&payload) {
                        Ok(records) => records,
                        Err(err) => {
                            tracing::warn!(
                                offset,
                                error = %err,
                                "unreadable batch frame; stopping replay here"
                            );
                            torn = true;
                            break;
                        }
                    };
                    let share = if records.is_empty() {
                        frame_len
                    } else {
                        frame_len / records.len() as u32
                    };
                    for (slot, record) in records.into_iter().enumerate() {
                        self.apply_put(
                            record.id,
                            RecordLoc {
                                frame_offset: offset,
                                frame_len,
                                slot: slot as u32,
                                approx_len: share,
                            },
                        );
                    }
                }
                FRAME_DELETE => {
                    let id: String = match serde_json::from_slice(&payload) {
                        Ok(id) => id,
                        Err(err) => {
                            tracing::warn!(
                                offset,
                                error = %err,
                                "unreadable delete frame; stopping replay here"
                            );
                            torn = true;
                            break;
                        }
                    };
                    self.apply_delete(&id, frame_len as u64);
                }
                other => {
                    tracing::warn!(offset, kind = other, "unknown frame kind; stopping replay");
                    torn = true;
                    break;
                }
            }

            offset += FRAME_HEADER_SIZE + payload_len;
        }

        if torn {
            tracing::warn!(
                path = %self.path.display(),
                good_bytes = offset,
                file_bytes = file_len,
                "truncated or torn log tail; discarding partial frame"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }
        self.end = offset;
        Ok(())
    }

    fn apply_put(&mut self, id: String, loc: RecordLoc) {
        if let Some(old) = self.index.insert(id, loc) {
            self.live_bytes = self.live_bytes.saturating_sub(old.approx_len as u64);
            self.dead_bytes += old.approx_len as u64;
        }
        self.live_bytes += loc.approx_len as u64;
    }

    fn apply_delete(&mut self, id: &str, frame_overhead: u64) {
        self.dead_bytes += frame_overhead;
        if let Some(old) = self.index.remove(id) {
            self.live_bytes = self.live_bytes.saturating_sub(old.approx_len as u64);
            self.dead_bytes += old.approx_len as u64;
        }
    }

    fn append_frame(&mut self, frame: &[u8]) -> Result<u64, StorageError> {
        if let Some(limit) = self.max_bytes {
            let needed = self.end + frame.len() as u64;
            if needed > limit {
                return Err(StorageError::Quota { needed, limit });
            }
        }
        let end = self.end;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(end))?;
        file.write_all(frame)?;
        file.sync_data()?;
        let offset = self.end;
        self.end += frame.len() as u64;
        Ok(offset)
    }

    fn put_batch(&mut self, records: &[VectorRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let (frame, shares) = encode_put_batch(records)?;
        let offset = self.append_frame(&frame)?;
        let frame_len = frame.len() as u32;
        for (slot, record) in records.iter().enumerate() {
            self.apply_put(
                record.id.clone(),
                RecordLoc {
                    frame_offset: offset,
                    frame_len,
                    slot: slot as u32,
                    approx_len: shares[slot],
                },
            );
        }
        self.maybe_compact()
    }

    fn delete(&mut self, id: &str) -> Result<bool, StorageError> {
        if !self.index.contains_key(id) {
            return Ok(false);
        }
        let frame = encode_delete(id)?;
        self.append_frame(&frame)?;
        self.apply_delete(id, frame.len() as u64);
        self.maybe_compact()?;
        Ok(true)
    }

    /// Read and decode the batch frame at `offset`.
    fn read_frame_records(&mut self, offset: u64, frame_len: u32) -> Result<Vec<VectorRecord>, StorageError> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; frame_len as usize];
        file.read_exact(&mut buf)?;
        if buf[0] != FRAME_PUT_BATCH {
            return Err(StorageError::Serialization(format!(
                "expected batch frame at offset {offset}"
            )));
        }
        Ok(serde_json::from_slice(&buf[FRAME_HEADER_SIZE as usize..])?)
    }

    /// Fetch the records for `locs`, parsing each distinct frame once.
    fn fetch(&mut self, locs: &[(String, RecordLoc)]) -> Result<Vec<VectorRecord>, StorageError> {
        let mut by_frame: HashMap<u64, Vec<usize>> = HashMap::new();
        for (pos, (_, loc)) in locs.iter().enumerate() {
            by_frame.entry(loc.frame_offset).or_default().push(pos);
        }

        let mut out: Vec<Option<VectorRecord>> = vec![None; locs.len()];
        for (frame_offset, positions) in by_frame {
            let frame_len = locs[positions[0]].1.frame_len;
            let records = self.read_frame_records(frame_offset, frame_len)?;
            for pos in positions {
                let loc = locs[pos].1;
                let record = records.get(loc.slot as usize).cloned().ok_or_else(|| {
                    StorageError::Serialization(format!(
                        "record slot {} missing in frame at {}",
                        loc.slot, frame_offset
                    ))
                })?;
                out[pos] = Some(record);
            }
        }
        Ok(out.into_iter().flatten().collect())
    }

    fn get(&mut self, id: &str) -> Result<Option<VectorRecord>, StorageError> {
        let Some(loc) = self.index.get(id).copied() else {
            return Ok(None);
        };
        let records = self.read_frame_records(loc.frame_offset, loc.frame_len)?;
        Ok(records.get(loc.slot as usize).cloned())
    }

    fn page(&mut self, after: Option<&str>, limit: usize) -> Result<Vec<VectorRecord>, StorageError> {
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        let locs: Vec<(String, RecordLoc)> = self
            .index
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(id, loc)| (id.clone(), *loc))
            .collect();
        self.fetch(&locs)
    }

    fn get_all(&mut self) -> Result<Vec<VectorRecord>, StorageError> {
        let locs: Vec<(String, RecordLoc)> = self
            .index
            .iter()
            .map(|(id, loc)| (id.clone(), *loc))
            .collect();
        self.fetch(&locs)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let file = self.file_mut()?;
        file.set_len(HEADER_SIZE)?;
        file.sync_all()?;
        self.index.clear();
        self.end = HEADER_SIZE;
        self.live_bytes = 0;
        self.dead_bytes = 0;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), StorageError> {
        if self.dead_bytes >= COMPACT_MIN_DEAD_BYTES && self.dead_bytes > self.live_bytes {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite the live set to `<path>.tmp`, rename it over the log, fsync
    /// the parent directory, and reopen the handle.
    fn compact(&mut self) -> Result<(), StorageError> {
        let live = self.get_all()?;
        let tmp_path = self.path.with_extension("qdb.tmp");

        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;

        let mut new_index = BTreeMap::new();
        let mut new_live = 0u64;
        let mut end = HEADER_SIZE;
        for chunk in live.chunks(COMPACT_CHUNK) {
            let (frame, shares) = encode_put_batch(chunk)?;
            tmp.write_all(&frame)?;
            let frame_len = frame.len() as u32;
            for (slot, record) in chunk.iter().enumerate() {
                new_index.insert(
                    record.id.clone(),
                    RecordLoc {
                        frame_offset: end,
                        frame_len,
                        slot: slot as u32,
                        approx_len: shares[slot],
                    },
                );
                new_live += shares[slot] as u64;
            }
            end += frame.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        // Drop the old handle before the rename so the swap is clean on
        // every platform.
        self.file = None;
        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent(&self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file = Some(file);
        self.index = new_index;
        self.end = end;
        self.live_bytes = new_live;
        self.dead_bytes = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn sync_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, record: &VectorRecord) -> Result<(), StorageError> {
        self.inner.lock().put_batch(std::slice::from_ref(record))
    }

    async fn put_batch(&self, records: &[VectorRecord]) -> Result<(), StorageError> {
        self.inner.lock().put_batch(records)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StorageError> {
        self.inner.lock().get(id)
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.lock().delete(id)
    }

    async fn get_all(&self) -> Result<Vec<VectorRecord>, StorageError> {
        self.inner.lock().get_all()
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(StorageError::Unavailable("storage handle closed".into()));
        }
        Ok(inner.index.len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.lock().clear()
    }

    async fn scan_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, StorageError> {
        self.inner.lock().page(after, limit)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.lock().close()
    }
}
