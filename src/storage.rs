use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::Mmap;
use rkyv::{AlignedVec, Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use seahash::hash;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::model::Record;

// Frame: [Length u32][SeaHash u64][rkyv bytes]
const HEADER_LEN: usize = 12;
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One write-ahead log entry. A frame is applied entirely or not at all.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum LogEntry {
    Put(Record),
    Delete { ids: Vec<String> },
    Clear,
}

/// Append-only log file backing one collection.
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    writer: File,
    // Separate handle so readers never move the writer's cursor.
    reader: Mutex<File>,
    current_offset: u64,
    strict_durability: bool,
    failed: bool,
}

impl Segment {
    /// Opens (or creates) the segment at `path` and feeds every intact frame
    /// to `apply` in log order.
    ///
    /// A torn final frame is cut off. A damaged frame with committed frames
    /// after it fails the open with [`StorageError::Corrupt`] and leaves the
    /// file untouched.
    pub fn open<F>(path: &Path, strict_durability: bool, mut apply: F) -> Result<Self, StorageError>
    where
        F: FnMut(u64, LogEntry) -> Result<(), StorageError>,
    {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = writer.metadata()?.len();

        let valid_len = if file_len == 0 {
            0
        } else {
            // The map is only alive for the duration of the scan.
            let map = unsafe { Mmap::map(&writer)? };
            scan(&map, path, &mut apply)?
        };

        if valid_len < file_len {
            warn!(
                segment = %path.display(),
                discarded = file_len - valid_len,
                "truncating torn tail of segment"
            );
            writer.set_len(valid_len)?;
            writer.sync_all()?;
        }

        let reader = File::open(path)?;
        debug!(segment = %path.display(), bytes = valid_len, "segment opened");

        Ok(Self {
            file_path: path.to_path_buf(),
            writer,
            reader: Mutex::new(reader),
            current_offset: valid_len,
            strict_durability,
            failed: false,
        })
    }

    /// Creates an empty segment at `path`, replacing whatever was there.
    pub fn create(path: &Path, strict_durability: bool) -> Result<Self, StorageError> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let reader = File::open(path)?;
        Ok(Self {
            file_path: path.to_path_buf(),
            writer,
            reader: Mutex::new(reader),
            current_offset: 0,
            strict_durability,
            failed: false,
        })
    }

    /// Appends one frame and returns its offset. Durable on return when
    /// strict durability is on. On failure the file is rolled back to its
    /// previous length so later frames never land behind garbage.
    pub fn append(&mut self, entry: &LogEntry) -> Result<u64, StorageError> {
        if self.failed {
            return Err(StorageError::SegmentFailed(self.file_path.display().to_string()));
        }

        let bytes = rkyv::to_bytes::<_, 4096>(entry)
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(StorageError::Codec(format!(
                "frame of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&hash(&bytes).to_le_bytes());
        frame.extend_from_slice(&bytes);

        let start = self.current_offset;
        if let Err(e) = self.write_frame(start, &frame) {
            if self.writer.set_len(start).is_err() {
                self.failed = true;
            }
            return Err(e.into());
        }

        self.current_offset += frame.len() as u64;
        Ok(start)
    }

    fn write_frame(&mut self, start: u64, frame: &[u8]) -> std::io::Result<()> {
        self.writer.seek(SeekFrom::Start(start))?;
        self.writer.write_all(frame)?;
        if self.strict_durability {
            self.writer.sync_data()?;
        }
        Ok(())
    }

    pub fn read(&self, offset: u64) -> Result<LogEntry, StorageError> {
        let mut file = self
            .reader
            .lock()
            .map_err(|_| StorageError::Poisoned("segment reader"))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        let (len, checksum) = split_header(&header);

        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        if hash(&bytes) != checksum {
            return Err(self.corrupt(offset, "checksum mismatch"));
        }

        decode(&bytes).map_err(|reason| self.corrupt(offset, &reason))
    }

    pub fn read_record(&self, offset: u64) -> Result<Record, StorageError> {
        match self.read(offset)? {
            LogEntry::Put(record) => Ok(record),
            _ => Err(self.corrupt(offset, "expected a put frame")),
        }
    }

    pub fn len_bytes(&self) -> u64 {
        self.current_offset
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.writer.sync_all()?;
        Ok(())
    }

    /// Renames this segment over `target` and makes the rename durable.
    pub fn persist_as(mut self, target: &Path) -> Result<Self, StorageError> {
        self.writer.sync_all()?;
        fs::rename(&self.file_path, target)?;
        if let Some(dir) = target.parent() {
            // Directory fsync is not supported everywhere; the rename itself is atomic.
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        self.file_path = target.to_path_buf();
        Ok(self)
    }

    fn corrupt(&self, offset: u64, reason: &str) -> StorageError {
        StorageError::Corrupt {
            segment: self.file_path.display().to_string(),
            offset,
            reason: reason.to_string(),
        }
    }
}

fn split_header(header: &[u8; HEADER_LEN]) -> (usize, u64) {
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&header[4..]);
    (u32::from_le_bytes(len) as usize, u64::from_le_bytes(checksum))
}

fn decode(bytes: &[u8]) -> Result<LogEntry, String> {
    // Archived roots must be aligned; file reads and map slices are not.
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<LogEntry>(&aligned).map_err(|e| e.to_string())
}

/// Walks the frames of `data`, returning the length of the intact prefix.
/// Only the last frame may be incomplete or damaged.
fn scan<F>(data: &[u8], path: &Path, apply: &mut F) -> Result<u64, StorageError>
where
    F: FnMut(u64, LogEntry) -> Result<(), StorageError>,
{
    let mut offset = 0usize;
    while offset < data.len() {
        let Some(header) = data.get(offset..offset + HEADER_LEN) else {
            break;
        };
        let mut fixed = [0u8; HEADER_LEN];
        fixed.copy_from_slice(header);
        let (len, checksum) = split_header(&fixed);

        let body_start = offset + HEADER_LEN;
        let body_end = body_start.saturating_add(len);
        // A frame running past the end of the file is an interrupted append.
        let Some(body) = data.get(body_start..body_end) else {
            break;
        };
        let decoded = if len > MAX_FRAME_LEN {
            Err(format!("frame length {len} exceeds the limit"))
        } else if hash(body) != checksum {
            Err("checksum mismatch".to_string())
        } else {
            decode(body)
        };
        let entry = match decoded {
            Ok(entry) => entry,
            Err(reason) if body_end == data.len() => {
                warn!(segment = %path.display(), offset, %reason, "damaged final frame");
                break;
            }
            // Committed frames follow; cutting here would silently drop them.
            Err(reason) => {
                return Err(StorageError::Corrupt {
                    segment: path.display().to_string(),
                    offset: offset as u64,
                    reason,
                })
            }
        };

        apply(offset as u64, entry)?;
        offset = body_start + len;
    }
    Ok(offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn put(id: &str) -> LogEntry {
        LogEntry::Put(Record {
            id: id.to_string(),
            vector: vec![1.0, 2.0, 3.0],
            document: format!("doc {id}"),
            metadata: Metadata::new().with("user_id", "u1"),
        })
    }

    fn replay(path: &Path) -> (Segment, Vec<(u64, LogEntry)>) {
        let mut seen = Vec::new();
        let seg = Segment::open(path, true, |off, e| {
            seen.push((off, e));
            Ok(())
        })
        .unwrap();
        (seg, seen)
    }

    #[test]
    fn append_then_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.seg");
        let (mut seg, seen) = replay(&path);
        assert!(seen.is_empty());

        let a = seg.append(&put("a")).unwrap();
        let b = seg.append(&LogEntry::Delete { ids: vec!["a".into()] }).unwrap();
        assert_eq!(seg.read_record(a).unwrap().id, "a");
        drop(seg);

        let (_seg, seen) = replay(&path);
        assert_eq!(
            seen,
            vec![(a, put("a")), (b, LogEntry::Delete { ids: vec!["a".into()] })]
        );
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.seg");
        let (mut seg, _) = replay(&path);
        seg.append(&put("a")).unwrap();
        let good_len = seg.len_bytes();
        seg.append(&put("b")).unwrap();
        drop(seg);

        // Simulate a crash halfway through the second frame.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + 7).unwrap();
        drop(file);

        let (mut seg, seen) = replay(&path);
        assert_eq!(seen.len(), 1);
        assert_eq!(seg.len_bytes(), good_len);

        // New writes land right after the last intact frame.
        let c = seg.append(&put("c")).unwrap();
        assert_eq!(c, good_len);
        drop(seg);
        let (_seg, seen) = replay(&path);
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn damaged_final_frame_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.seg");
        let (mut seg, _) = replay(&path);
        seg.append(&put("a")).unwrap();
        let good_len = seg.len_bytes();
        seg.append(&put("b")).unwrap();
        drop(seg);

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let (seg, seen) = replay(&path);
        assert_eq!(seen, vec![(0, put("a"))]);
        assert_eq!(seg.len_bytes(), good_len);
    }

    #[test]
    fn damaged_middle_frame_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.seg");
        let (mut seg, _) = replay(&path);
        seg.append(&put("a")).unwrap();
        let delete = seg.append(&LogEntry::Delete { ids: vec!["a".into()] }).unwrap();
        seg.append(&put("c")).unwrap();
        drop(seg);

        let mut raw = fs::read(&path).unwrap();
        let len_before = raw.len() as u64;
        raw[delete as usize + HEADER_LEN + 1] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let err = Segment::open(&path, true, |_, _| Ok(())).unwrap_err();
        match err {
            StorageError::Corrupt { offset, .. } => assert_eq!(offset, delete),
            other => panic!("expected corruption, got {other:?}"),
        }
        // Nothing after the damaged frame was discarded.
        assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
    }

    #[test]
    fn flipped_byte_is_detected_on_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.seg");
        let (mut seg, _) = replay(&path);
        let off = seg.append(&put("a")).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(seg.read(off), Err(StorageError::Corrupt { .. })));
    }
}
