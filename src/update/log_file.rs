//! Append-only transaction log file.
//!
//! Each log is a sequence of framed records: `[len: u32 LE][serde_json
//! LogEntry][len: u32 LE]`. The trailing length copy lets the reverse
//! reader walk frames backwards from the end of the file. A record's offset
//! is the byte position of its leading length word; offsets handed out by
//! [`TransactionLog::append`] are strictly increasing within one file.
//!
//! Lifetime is governed by an explicit reference count rather than scope:
//! the update log's structural slots each hold one reference, and every
//! reader or lookup that escapes the update-log monitor takes another for
//! the duration of its use. When the count reaches zero the file is closed,
//! and unlinked if `delete_on_close` is set.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{NaginataError, Result};
use crate::update::command::{
    AddCommand, CommitCommand, DeleteCommand, ADD, COMMIT, DELETE, DELETE_BY_QUERY,
    OPERATION_MASK, UPDATE_INPLACE,
};

/// Flush policy for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncLevel {
    /// No flushing beyond the writer buffer.
    None,
    /// Flush to the OS; visible to later readers of the same file.
    #[default]
    Flush,
    /// fsync to the device; blocks until durable.
    Fsync,
}

impl SyncLevel {
    /// Parse a config string, falling back to [`SyncLevel::Flush`].
    pub fn parse(level: Option<&str>) -> SyncLevel {
        match level {
            None => SyncLevel::Flush,
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "none" => SyncLevel::None,
                "flush" => SyncLevel::Flush,
                "fsync" => SyncLevel::Fsync,
                other => {
                    log::warn!("unknown syncLevel {other:?}, defaulting to flush");
                    SyncLevel::Flush
                }
            },
        }
    }
}

/// Op-specific payload of a log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No payload (commit records).
    None,
    /// A document add: the indexed key plus the (possibly partial) document.
    Doc {
        /// Indexed id bytes of the unique key.
        id: Vec<u8>,
        /// Full document, or just the touched fields for in-place updates.
        doc: Document,
    },
    /// Id bytes of a delete-by-id.
    Id(Vec<u8>),
    /// Query string of a delete-by-query.
    Query(String),
}

/// One record of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Low 4 bits: op code; bit 3 marks an in-place ADD.
    pub flags: u32,
    /// Signed version; negative versions are tombstones.
    pub version: i64,
    /// Offset of the previous entry in an in-place chain; -1 if N/A.
    pub prev_offset: i64,
    /// Version of the previous entry in an in-place chain; -1 if N/A.
    pub prev_version: i64,
    /// Op-specific payload.
    pub payload: Payload,
}

impl LogEntry {
    /// The operation, including the in-place bit.
    pub fn op(&self) -> u32 {
        self.flags & OPERATION_MASK
    }

    /// The operation with the in-place bit masked off.
    pub fn base_op(&self) -> u32 {
        self.flags & (OPERATION_MASK & !UPDATE_INPLACE)
    }

    /// Whether the in-place bit is set.
    pub fn is_in_place(&self) -> bool {
        self.flags & UPDATE_INPLACE != 0
    }

    /// Rebuild the add command this record was written from.
    pub fn to_add_command(&self) -> Result<AddCommand> {
        let Payload::Doc { id, doc } = &self.payload else {
            return Err(NaginataError::invalid_state(format!(
                "record with flags {:#x} is not a document add",
                self.flags
            )));
        };
        if self.is_in_place() {
            Ok(AddCommand::in_place(
                id.clone(),
                doc.clone(),
                self.version,
                self.prev_version,
            ))
        } else {
            Ok(AddCommand::new(id.clone(), doc.clone(), self.version))
        }
    }

    /// Rebuild the delete command this record was written from.
    pub fn to_delete_command(&self) -> Result<DeleteCommand> {
        match &self.payload {
            Payload::Id(id) => Ok(DeleteCommand::by_id(id.clone(), self.version)),
            Payload::Query(q) => Ok(DeleteCommand::by_query(q.clone(), self.version)),
            _ => Err(NaginataError::invalid_state(format!(
                "record with flags {:#x} is not a delete",
                self.flags
            ))),
        }
    }

    /// The indexed id carried by this record, if any.
    pub fn indexed_id(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Doc { id, .. } => Some(id),
            Payload::Id(id) => Some(id),
            _ => None,
        }
    }

    /// The document carried by this record, if any.
    pub fn doc(&self) -> Option<&Document> {
        match &self.payload {
            Payload::Doc { doc, .. } => Some(doc),
            _ => None,
        }
    }

    /// The query carried by this record, if any.
    pub fn query(&self) -> Option<&str> {
        match &self.payload {
            Payload::Query(q) => Some(q),
            _ => None,
        }
    }
}

struct LogWriter {
    out: Option<BufWriter<File>>,
    /// Logical size: end offset of the last complete record.
    size: u64,
}

/// An append-only transaction log file with positional reads.
pub struct TransactionLog {
    id: u64,
    path: PathBuf,
    is_buffer: bool,
    refcount: AtomicI32,
    delete_on_close: AtomicBool,
    capped: AtomicBool,
    num_records: AtomicUsize,
    /// Mirror of the logical size for lock-free reads.
    size: AtomicU64,
    /// Bytes known to have reached the OS.
    flushed: AtomicU64,
    writer: Mutex<LogWriter>,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("refcount", &self.refcount.load(Ordering::SeqCst))
            .field("num_records", &self.num_records.load(Ordering::SeqCst))
            .field("size", &self.size.load(Ordering::SeqCst))
            .finish()
    }
}

impl TransactionLog {
    /// Create a fresh log file. Fails if the path already exists.
    ///
    /// The returned handle starts with a refcount of 1, owned by the
    /// caller, and with `delete_on_close` set: an unreferenced log removes
    /// itself unless shutdown clears the flag first.
    pub fn create(path: PathBuf, id: u64, is_buffer: bool) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                NaginataError::storage(format!("failed to create {}: {e}", path.display()))
            })?;

        Ok(Arc::new(TransactionLog {
            id,
            path,
            is_buffer,
            refcount: AtomicI32::new(1),
            delete_on_close: AtomicBool::new(true),
            capped: AtomicBool::new(false),
            num_records: AtomicUsize::new(0),
            size: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            writer: Mutex::new(LogWriter {
                out: Some(BufWriter::new(file)),
                size: 0,
            }),
        }))
    }

    /// Open an existing log file, scanning it to find the last complete
    /// record.
    ///
    /// A torn trailing frame is tolerated: it is logged and the file is
    /// truncated back to the last complete record.
    pub fn open_existing(path: PathBuf, id: u64) -> Result<Arc<Self>> {
        let (logical_size, records) = scan_frames(&path)?;

        let physical = std::fs::metadata(&path)?.len();
        if physical > logical_size {
            log::warn!(
                "{}: dropping {} trailing bytes after last complete record",
                path.display(),
                physical - logical_size
            );
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(logical_size)?;
        }

        let file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            NaginataError::storage(format!("failed to open {}: {e}", path.display()))
        })?;

        let tlog = Arc::new(TransactionLog {
            id,
            path,
            is_buffer: false,
            refcount: AtomicI32::new(1),
            delete_on_close: AtomicBool::new(true),
            capped: AtomicBool::new(false),
            num_records: AtomicUsize::new(records),
            size: AtomicU64::new(logical_size),
            flushed: AtomicU64::new(logical_size),
            writer: Mutex::new(LogWriter {
                out: Some(BufWriter::new(file)),
                size: logical_size,
            }),
        });

        if tlog.ends_with_commit().unwrap_or(false) {
            tlog.capped.store(true, Ordering::SeqCst);
        }
        Ok(tlog)
    }

    /// The log's numeric id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The log's on-disk path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this is a buffer sub-log.
    pub fn is_buffer(&self) -> bool {
        self.is_buffer
    }

    /// Number of records in the log.
    pub fn num_records(&self) -> usize {
        self.num_records.load(Ordering::SeqCst)
    }

    /// Logical size in bytes (end of the last complete record).
    pub fn log_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Current reference count; mainly for tests and shutdown checks.
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Mark whether the file should be unlinked when the refcount reaches 0.
    pub fn set_delete_on_close(&self, delete: bool) {
        self.delete_on_close.store(delete, Ordering::SeqCst);
    }

    /// Take an additional reference.
    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Take an additional reference unless the log is already closed.
    pub fn try_incref(&self) -> bool {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current <= 0 {
                return false;
            }
            match self.refcount.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference; the last one closes (and possibly unlinks) the file.
    pub fn decref(&self) {
        if self.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    fn close(&self) {
        self.close_output();
        if self.delete_on_close.load(Ordering::SeqCst) {
            crate::storage::dir::delete_file(&self.path);
        }
    }

    /// Flush and drop the append stream without touching the refcount.
    ///
    /// Used for logs that will only ever be read again (e.g. capped logs
    /// found at startup).
    pub fn close_output(&self) {
        let mut writer = self.writer.lock();
        if let Some(mut out) = writer.out.take() {
            if let Err(e) = out.flush() {
                log::error!("error flushing {} on close: {e}", self.path.display());
            }
            self.flushed.store(writer.size, Ordering::SeqCst);
        }
    }

    /// Close regardless of outstanding references; logs a leak if any.
    pub fn force_close(&self) {
        let count = self.refcount.load(Ordering::SeqCst);
        if count > 0 {
            log::error!(
                "closing {} with {count} outstanding references",
                self.path.display()
            );
        }
        self.close_output();
    }

    /// Append a record, returning its offset.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        if self.capped.load(Ordering::SeqCst) {
            return Err(NaginataError::invalid_state(format!(
                "append to committed log {}",
                self.path.display()
            )));
        }

        let bytes = serde_json::to_vec(entry)?;
        let len = bytes.len() as u32;

        let mut writer = self.writer.lock();
        let offset = writer.size;
        let out = writer.out.as_mut().ok_or_else(|| {
            NaginataError::invalid_state(format!("append to closed log {}", self.path.display()))
        })?;
        out.write_u32::<LittleEndian>(len)?;
        out.write_all(&bytes)?;
        out.write_u32::<LittleEndian>(len)?;
        writer.size = offset + 8 + bytes.len() as u64;
        self.size.store(writer.size, Ordering::SeqCst);
        self.num_records.fetch_add(1, Ordering::SeqCst);
        Ok(offset)
    }

    /// Append an add (full or in-place) built from the command.
    pub fn write_add(&self, cmd: &AddCommand, prev_offset: i64) -> Result<u64> {
        let mut flags = ADD;
        let mut prev_version = -1;
        let mut prev_ptr = -1;
        if cmd.is_in_place() {
            flags |= UPDATE_INPLACE;
            prev_version = cmd.prev_version;
            prev_ptr = prev_offset;
        }
        self.append(&LogEntry {
            flags,
            version: cmd.version,
            prev_offset: prev_ptr,
            prev_version,
            payload: Payload::Doc {
                id: cmd.id.clone(),
                doc: cmd.doc.clone(),
            },
        })
    }

    /// Append a delete-by-id built from the command.
    pub fn write_delete(&self, cmd: &DeleteCommand) -> Result<u64> {
        let id = cmd.id.clone().ok_or_else(|| {
            NaginataError::invalid_state("delete command without an id".to_string())
        })?;
        self.append(&LogEntry {
            flags: DELETE,
            version: cmd.version,
            prev_offset: -1,
            prev_version: -1,
            payload: Payload::Id(id),
        })
    }

    /// Append a delete-by-query built from the command.
    pub fn write_delete_by_query(&self, cmd: &DeleteCommand) -> Result<u64> {
        let query = cmd.query.clone().ok_or_else(|| {
            NaginataError::invalid_state("delete-by-query command without a query".to_string())
        })?;
        self.append(&LogEntry {
            flags: DELETE_BY_QUERY,
            version: cmd.version,
            prev_offset: -1,
            prev_version: -1,
            payload: Payload::Query(query),
        })
    }

    /// Append the commit record that caps this log and flush it out.
    ///
    /// After a successful cap no further appends are accepted.
    pub fn write_commit(&self, cmd: &CommitCommand) -> Result<u64> {
        let offset = self.append(&LogEntry {
            flags: COMMIT,
            version: cmd.version,
            prev_offset: -1,
            prev_version: -1,
            payload: Payload::None,
        })?;
        self.capped.store(true, Ordering::SeqCst);
        self.finish(SyncLevel::Flush)?;
        Ok(offset)
    }

    /// Apply the given flush policy to the append stream.
    pub fn finish(&self, sync: SyncLevel) -> Result<()> {
        if sync == SyncLevel::None {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        let size = writer.size;
        if let Some(out) = writer.out.as_mut() {
            out.flush()?;
            self.flushed.store(size, Ordering::SeqCst);
            if sync == SyncLevel::Fsync {
                out.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    fn ensure_flushed(&self) -> Result<()> {
        if self.flushed.load(Ordering::SeqCst) < self.size.load(Ordering::SeqCst) {
            self.finish(SyncLevel::Flush)?;
        }
        Ok(())
    }

    /// Positional read of the record at `offset`.
    ///
    /// Safe under concurrent appends: the writer buffer is flushed first
    /// when the read reaches past the flushed watermark.
    pub fn lookup(&self, offset: u64) -> Result<LogEntry> {
        self.ensure_flushed()?;
        let size = self.log_size();
        if offset + 8 > size {
            return Err(NaginataError::corrupt_log(format!(
                "offset {offset} out of bounds in {} (size {size})",
                self.path.display()
            )));
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let len = file.read_u32::<LittleEndian>()? as u64;
        if offset + 8 + len > size {
            return Err(NaginataError::corrupt_log(format!(
                "frame at {offset} overruns {} (len {len}, size {size})",
                self.path.display()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        let entry = serde_json::from_slice(&buf).map_err(|e| {
            NaginataError::corrupt_log(format!(
                "undecodable record at {offset} in {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(entry)
    }

    /// Whether the last record is a commit.
    pub fn ends_with_commit(&self) -> Result<bool> {
        self.ensure_flushed()?;
        let size = self.log_size();
        if size < 8 {
            return Ok(false);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(size - 4))?;
        let len = file.read_u32::<LittleEndian>()? as u64;
        if len + 8 > size {
            return Ok(false);
        }
        let offset = size - 8 - len;
        match self.lookup(offset) {
            Ok(entry) => Ok(entry.op() == COMMIT),
            Err(e) => {
                log::debug!("unreadable trailing record in {}: {e}", self.path.display());
                Ok(false)
            }
        }
    }

    /// Forward reader from `start` to the current logical end.
    ///
    /// The reader follows appends made after its creation; it can be
    /// restarted by constructing a new one.
    pub fn reader(self: Arc<Self>, start: u64) -> Result<LogReader> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start))?;
        self.incref();
        Ok(LogReader {
            log: self,
            reader,
            pos: start,
        })
    }

    /// Reverse reader over the records present at construction time.
    pub fn reverse_reader(self: Arc<Self>) -> Result<ReverseReader> {
        self.ensure_flushed()?;
        let file = File::open(&self.path)?;
        let pos = self.log_size();
        self.incref();
        Ok(ReverseReader {
            log: self,
            file,
            pos,
            position: 0,
        })
    }

    /// Reader that buffers the tail from `start` and yields records in
    /// ascending id order; records without an id come last, in offset order.
    pub fn sorted_reader(self: Arc<Self>, start: u64) -> Result<SortedReader> {
        let mut reader = self.reader(start)?;
        let mut entries = Vec::new();
        while let Some((offset, entry)) = reader.next_with_offset()? {
            entries.push((offset, entry));
        }
        entries.sort_by(|(ao, a), (bo, b)| match (a.indexed_id(), b.indexed_id()) {
            (Some(x), Some(y)) => x.cmp(y).then(ao.cmp(bo)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => ao.cmp(bo),
        });
        entries.reverse();
        Ok(SortedReader {
            _reader: reader,
            entries,
        })
    }
}

impl Drop for TransactionLog {
    fn drop(&mut self) {
        let count = self.refcount.load(Ordering::SeqCst);
        if count > 0 {
            log::warn!(
                "transaction log {} dropped with refcount {count}",
                self.path.display()
            );
            self.close_output();
        }
    }
}

/// Scan frames from the start of the file, returning the logical size and
/// record count up to the last complete record.
fn scan_frames(path: &Path) -> Result<(u64, usize)> {
    let file = File::open(path)
        .map_err(|e| NaginataError::storage(format!("failed to open {}: {e}", path.display())))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut pos = 0u64;
    let mut records = 0usize;
    loop {
        if pos + 8 > file_len {
            break;
        }
        let len = reader.read_u32::<LittleEndian>()? as u64;
        if len == 0 || pos + 8 + len > file_len {
            break;
        }
        reader.seek(SeekFrom::Start(pos + 4 + len))?;
        let trailing = reader.read_u32::<LittleEndian>()? as u64;
        if trailing != len {
            break;
        }
        pos += 8 + len;
        records += 1;
    }
    Ok((pos, records))
}

/// Lazy forward sequence of records.
pub struct LogReader {
    log: Arc<TransactionLog>,
    reader: BufReader<File>,
    pos: u64,
}

impl LogReader {
    /// The next record, or `None` at the current logical end.
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        Ok(self.next_with_offset()?.map(|(_, e)| e))
    }

    /// The next record together with its offset.
    pub fn next_with_offset(&mut self) -> Result<Option<(u64, LogEntry)>> {
        if self.pos + 8 > self.log.log_size() {
            return Ok(None);
        }
        // the frame is logically present but may still sit in the writer buffer
        self.log.ensure_flushed()?;

        let offset = self.pos;
        let len = self.reader.read_u32::<LittleEndian>()? as u64;
        if offset + 8 + len > self.log.log_size() {
            return Err(NaginataError::corrupt_log(format!(
                "frame at {offset} overruns {}",
                self.log.path().display()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf)?;
        let trailing = self.reader.read_u32::<LittleEndian>()? as u64;
        if trailing != len {
            return Err(NaginataError::corrupt_log(format!(
                "frame at {offset} has mismatched lengths in {}",
                self.log.path().display()
            )));
        }
        let entry: LogEntry = serde_json::from_slice(&buf).map_err(|e| {
            NaginataError::corrupt_log(format!(
                "undecodable record at {offset} in {}: {e}",
                self.log.path().display()
            ))
        })?;
        self.pos = offset + 8 + len;
        Ok(Some((offset, entry)))
    }

    /// Byte position of the reader.
    pub fn current_pos(&self) -> u64 {
        self.pos
    }

    /// Logical size of the underlying log right now.
    pub fn current_size(&self) -> u64 {
        self.log.log_size()
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.log.decref();
    }
}

/// Lazy reverse sequence of records, last appended first.
pub struct ReverseReader {
    log: Arc<TransactionLog>,
    file: File,
    /// End of the frame to be read next (walking backwards).
    pos: u64,
    /// Offset of the record most recently returned.
    position: u64,
}

impl ReverseReader {
    /// The previous record, or `None` at the beginning of the file.
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        if self.pos == 0 {
            return Ok(None);
        }
        if self.pos < 8 {
            return Err(NaginataError::corrupt_log(format!(
                "short frame at tail position {} in {}",
                self.pos,
                self.log.path().display()
            )));
        }
        self.file.seek(SeekFrom::Start(self.pos - 4))?;
        let len = self.file.read_u32::<LittleEndian>()? as u64;
        if len + 8 > self.pos {
            return Err(NaginataError::corrupt_log(format!(
                "bad trailing length {len} at position {} in {}",
                self.pos,
                self.log.path().display()
            )));
        }
        let start = self.pos - 8 - len;
        self.file.seek(SeekFrom::Start(start + 4))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf)?;
        let entry: LogEntry = serde_json::from_slice(&buf).map_err(|e| {
            NaginataError::corrupt_log(format!(
                "undecodable record at {start} in {}: {e}",
                self.log.path().display()
            ))
        })?;
        self.position = start;
        self.pos = start;
        Ok(Some(entry))
    }

    /// Offset of the record most recently returned by [`Self::next`].
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Drop for ReverseReader {
    fn drop(&mut self) {
        self.log.decref();
    }
}

/// Forward reader yielding records in ascending id order.
pub struct SortedReader {
    _reader: LogReader,
    /// Reversed so `pop` yields ascending order.
    entries: Vec<(u64, LogEntry)>,
}

impl SortedReader {
    /// The next record in id order, or `None` when exhausted.
    pub fn next(&mut self) -> Result<Option<LogEntry>> {
        Ok(self.entries.pop().map(|(_, e)| e))
    }
}
