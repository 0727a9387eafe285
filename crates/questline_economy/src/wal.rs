//! # Write-Ahead Log (WAL)
//!
//! **Crash-Safe Unit-of-Work Log**
//!
//! Every committed unit of work is written here before the in-memory tables
//! change. On open, the log is replayed to rebuild the tables:
//! - Complete records: replayed in LSN order
//! - Torn trailing record (crash mid-write): discarded and truncated away
//!
//! ## Guarantees
//!
//! 1. **Atomicity**: One unit of work is one record. It replays whole or not at all.
//! 2. **Durability**: With `sync_on_commit`, `append_commit()` returns after `fsync`.
//! 3. **Integrity**: Every record carries a CRC32; a mismatch ends recovery.
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "QWAL"]
//! [4 bytes: version]
//! [8 bytes: reserved]
//!
//! Record format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type]
//! [4 bytes: payload length]
//! [N bytes: payload (operation count + serialized operations)]
//! [4 bytes: CRC32 of above]
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use parking_lot::Mutex;

use crate::claims::ClaimKey;
use crate::error::{EconomyError, EconomyResult};
use crate::ledger::Transaction;
use crate::types::{SourceType, TransactionGroup, UserId, ItemId};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"QWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 2;

/// Header size in bytes.
const HEADER_LEN: u64 = 16;

/// Fixed bytes around a record payload: LSN + type + length + CRC.
const RECORD_OVERHEAD: u64 = 8 + 1 + 4 + 4;

/// Largest payload recovery will allocate for.
const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A committed unit of work.
    Commit = 1,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Row-level changes made by a unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalOperation {
    /// A ledger row was appended; the balance moves by its amount.
    AppendTransaction(Transaction),
    /// A claim row was inserted.
    InsertClaim(ClaimKey),
    /// An inventory row was set to an absolute quantity.
    SetQuantity {
        /// Owner of the inventory row.
        user_id: UserId,
        /// Item whose quantity changed.
        item_id: ItemId,
        /// New absolute quantity.
        quantity: u64,
        /// Economic event the change belongs to, if any.
        group: Option<TransactionGroup>,
    },
}

impl WalOperation {
    /// Returns the user this operation belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::AppendTransaction(tx) => &tx.user_id,
            Self::InsertClaim(key) => &key.user_id,
            Self::SetQuantity { user_id, .. } => user_id,
        }
    }

    fn encode(&self, out: &mut Encoder) {
        match self {
            Self::AppendTransaction(tx) => {
                out.put_u8(1);
                out.put_u64(tx.id);
                out.put_str(&tx.user_id);
                out.put_i64(tx.amount);
                out.put_u8(tx.source_type as u8);
                out.put_bytes(tx.transaction_group.as_bytes());
                out.put_i64(tx.created_at.timestamp());
                out.put_u32(tx.created_at.timestamp_subsec_nanos());
                out.put_len(tx.metadata.len());
                for (key, value) in &tx.metadata {
                    out.put_str(key);
                    out.put_str(value);
                }
            }
            Self::InsertClaim(key) => {
                out.put_u8(2);
                out.put_str(&key.user_id);
                out.put_str(&key.earning_event_id);
                match &key.period {
                    Some(period) => {
                        out.put_u8(1);
                        out.put_str(period);
                    }
                    None => out.put_u8(0),
                }
                out.put_u8(key.source_type as u8);
            }
            Self::SetQuantity { user_id, item_id, quantity, group } => {
                out.put_u8(3);
                out.put_str(user_id);
                out.put_str(item_id);
                out.put_u64(*quantity);
                match group {
                    Some(group) => {
                        out.put_u8(1);
                        out.put_bytes(group.as_bytes());
                    }
                    None => out.put_u8(0),
                }
            }
        }
    }

    fn decode(input: &mut Decoder<'_>) -> Option<Self> {
        match input.u8()? {
            1 => {
                let id = input.u64()?;
                let user_id = input.string()?;
                let amount = input.i64()?;
                let source_type = SourceType::from_u8(input.u8()?)?;
                let transaction_group = TransactionGroup::from_bytes(input.array16()?);
                let secs = input.i64()?;
                let nanos = input.u32()?;
                let created_at = DateTime::from_timestamp(secs, nanos)?;
                let pairs = input.u32()?;
                let mut metadata = BTreeMap::new();
                for _ in 0..pairs {
                    let key = input.string()?;
                    let value = input.string()?;
                    metadata.insert(key, value);
                }
                Some(Self::AppendTransaction(Transaction {
                    id,
                    user_id,
                    amount,
                    source_type,
                    transaction_group,
                    created_at,
                    metadata,
                }))
            }
            2 => {
                let user_id = input.string()?;
                let earning_event_id = input.string()?;
                let period = match input.u8()? {
                    0 => None,
                    1 => Some(input.string()?),
                    _ => return None,
                };
                let source_type = SourceType::from_u8(input.u8()?)?;
                Some(Self::InsertClaim(ClaimKey {
                    user_id,
                    earning_event_id,
                    period,
                    source_type,
                }))
            }
            3 => {
                let user_id = input.string()?;
                let item_id = input.string()?;
                let quantity = input.u64()?;
                let group = match input.u8()? {
                    0 => None,
                    1 => Some(TransactionGroup::from_bytes(input.array16()?)),
                    _ => return None,
                };
                Some(Self::SetQuantity { user_id, item_id, quantity, group })
            }
            _ => None,
        }
    }
}

/// Little-endian payload writer.
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(128) }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_len(&mut self, len: usize) {
        // Lengths are bounded by MAX_PAYLOAD_LEN long before u32 overflows.
        self.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_str(&mut self, value: &str) {
        self.put_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }
}

/// Little-endian payload reader. Every getter returns `None` on short input.
struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn array16(&mut self) -> Option<[u8; 16]> {
        self.take(16)?.try_into().ok()
    }

    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One committed unit of work recovered from disk.
#[derive(Clone, Debug)]
pub struct RecoveredCommit {
    /// Log sequence number of the commit record.
    pub lsn: u64,
    /// Row changes in the order they were made.
    pub operations: Vec<WalOperation>,
}

struct WalFile {
    file: File,
    /// Offset just past the last complete record.
    len: u64,
    next_lsn: u64,
    /// Set when a failed write could not be cut back. The tail may hold a
    /// torn record, so nothing may be appended after it.
    poisoned: bool,
}

impl WalFile {
    fn write_record(&mut self, record: &[u8], sync: bool) -> std::io::Result<()> {
        self.file.write_all(record)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cuts the file back to the last complete record.
    fn rewind_to_good_len(&mut self) -> std::io::Result<()> {
        let good_len = self.len;
        self.file.set_len(good_len)?;
        self.file.seek(SeekFrom::Start(good_len))?;
        Ok(())
    }
}

/// Write-Ahead Log for crash-safe units of work.
pub struct WriteAheadLog {
    path: PathBuf,
    sync_on_commit: bool,
    file: Mutex<WalFile>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

fn io_err(context: &str, e: &std::io::Error) -> EconomyError {
    EconomyError::Persistence(format!("{context}: {e}"))
}

impl WriteAheadLog {
    /// Opens or creates a WAL file and returns every committed unit of work in it.
    ///
    /// A torn trailing record is truncated away so later appends start on a
    /// clean boundary.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the file cannot be opened, has a foreign
    /// header, or holds a checksummed record that cannot be decoded.
    pub fn open(
        path: impl AsRef<Path>,
        sync_on_commit: bool,
    ) -> EconomyResult<(Self, Vec<RecoveredCommit>)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| io_err("failed to create WAL directory", &e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let metadata = file.metadata().map_err(|e| io_err("failed to stat WAL", &e))?;
        if metadata.len() == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN as usize);
            header.extend_from_slice(WAL_MAGIC);
            header.extend_from_slice(&WAL_VERSION.to_le_bytes());
            header.extend_from_slice(&0u64.to_le_bytes());
            file.write_all(&header)
                .map_err(|e| io_err("failed to write WAL header", &e))?;
            file.sync_all()
                .map_err(|e| io_err("failed to sync WAL header", &e))?;
        }

        let (commits, good_len) = Self::recover(&path)?;
        let next_lsn = commits.last().map_or(0, |c| c.lsn + 1);

        let file_len = file
            .metadata()
            .map_err(|e| io_err("failed to stat WAL", &e))?
            .len();
        if file_len > good_len {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = file_len - good_len,
                "WAL recovery: torn trailing record discarded"
            );
            file.set_len(good_len)
                .map_err(|e| io_err("failed to truncate WAL", &e))?;
        }
        file.seek(SeekFrom::Start(good_len))
            .map_err(|e| io_err("failed to seek WAL", &e))?;

        tracing::info!(
            path = %path.display(),
            commits = commits.len(),
            next_lsn,
            "WAL opened"
        );

        let wal = Self {
            path,
            sync_on_commit,
            file: Mutex::new(WalFile {
                file,
                len: good_len,
                next_lsn,
                poisoned: false,
            }),
        };

        Ok((wal, commits))
    }

    /// Returns the path of the WAL file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one committed unit of work.
    ///
    /// On any write failure the file is cut back to its previous length, so
    /// a failed commit never leaves a partial record behind. If the cut
    /// itself fails the log is poisoned and refuses every later append until
    /// it is reopened, which truncates the torn tail.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the record cannot be written (or synced), or
    /// if the log is poisoned.
    pub fn append_commit(&self, operations: &[WalOperation]) -> EconomyResult<u64> {
        let mut payload = Encoder::new();
        payload.put_len(operations.len());
        for op in operations {
            op.encode(&mut payload);
        }
        let payload = payload.buf;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EconomyError::Persistence(format!(
                "unit of work too large for WAL: {} bytes",
                payload.len()
            )));
        }

        let mut file = self.file.lock();
        if file.poisoned {
            return Err(EconomyError::Persistence(
                "WAL is poisoned by an earlier failed write; reopen it to recover".to_string(),
            ));
        }
        let lsn = file.next_lsn;

        let mut record = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
        record.extend_from_slice(&lsn.to_le_bytes());
        record.push(RecordType::Commit as u8);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        if let Err(e) = file.write_record(&record, self.sync_on_commit) {
            if let Err(rewind) = file.rewind_to_good_len() {
                file.poisoned = true;
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    rewind_error = %rewind,
                    "WAL write failed and could not be rewound, log poisoned"
                );
                return Err(EconomyError::Persistence(format!(
                    "WAL write failed: {e}; rewind failed: {rewind}"
                )));
            }
            return Err(io_err("WAL write failed", &e));
        }

        file.len += record.len() as u64;
        file.next_lsn += 1;
        Ok(lsn)
    }

    /// Makes every later append fail, as after an unrecoverable write error.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        self.file.lock().poisoned = true;
    }

    /// Reads every complete record. Returns the commits and the byte offset
    /// just past the last good record.
    fn recover(path: &Path) -> EconomyResult<(Vec<RecoveredCommit>, u64)> {
        let file = File::open(path).map_err(|e| io_err("failed to open WAL for recovery", &e))?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut header)
            .map_err(|e| io_err("failed to read WAL header", &e))?;
        if &header[0..4] != WAL_MAGIC {
            return Err(EconomyError::Persistence("invalid WAL magic".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != WAL_VERSION {
            return Err(EconomyError::Persistence(format!(
                "unsupported WAL version: {version}"
            )));
        }

        let mut commits = Vec::new();
        let mut good_len = HEADER_LEN;

        while let Some((lsn, payload)) = Self::read_record(&mut reader)? {
            let mut decoder = Decoder::new(&payload);
            let corrupt = || EconomyError::Persistence(format!("undecodable WAL record at LSN {lsn}"));
            let count = decoder.u32().ok_or_else(corrupt)?;
            let mut operations = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                operations.push(WalOperation::decode(&mut decoder).ok_or_else(corrupt)?);
            }
            if !decoder.is_empty() {
                return Err(corrupt());
            }
            good_len += payload.len() as u64 + RECORD_OVERHEAD;
            commits.push(RecoveredCommit { lsn, operations });
        }

        Ok((commits, good_len))
    }

    /// Reads a single record. `Ok(None)` marks the end of the usable log:
    /// clean EOF, a short read, or a checksum mismatch.
    fn read_record(reader: &mut BufReader<File>) -> EconomyResult<Option<(u64, Vec<u8>)>> {
        let mut head = [0u8; 13];
        match reader.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_err("WAL read failed", &e)),
        }

        let lsn = u64::from_le_bytes(head[0..8].try_into().unwrap_or([0; 8]));
        if RecordType::from_u8(head[8]).is_none() {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(head[9..13].try_into().unwrap_or([0; 4])) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len];
        let mut crc_bytes = [0u8; 4];
        let read = reader
            .read_exact(&mut payload)
            .and_then(|()| reader.read_exact(&mut crc_bytes));
        match read {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_err("WAL read failed", &e)),
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&head);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return Ok(None);
        }

        Ok(Some((lsn, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn temp_wal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_questline_wal_{id}.wal"))
    }

    fn sample_transaction() -> Transaction {
        let mut metadata = BTreeMap::new();
        metadata.insert("task_id".to_string(), "task1".to_string());
        Transaction {
            id: 7,
            user_id: "alice".to_string(),
            amount: -300,
            source_type: SourceType::Top3Cost,
            transaction_group: TransactionGroup::new(),
            created_at: Utc::now(),
            metadata,
        }
    }

    #[test]
    fn test_wal_create_and_reopen_empty() {
        let path = temp_wal_path();
        {
            let (_wal, commits) = WriteAheadLog::open(&path, false).unwrap();
            assert!(commits.is_empty());
        }
        let (_wal, commits) = WriteAheadLog::open(&path, false).unwrap();
        assert!(commits.is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_commit_recovery() {
        let path = temp_wal_path();
        let tx = sample_transaction();
        let ops = vec![
            WalOperation::InsertClaim(ClaimKey {
                user_id: "alice".to_string(),
                earning_event_id: "evt1".to_string(),
                period: None,
                source_type: SourceType::TaskComplete,
            }),
            WalOperation::InsertClaim(ClaimKey {
                user_id: "alice".to_string(),
                earning_event_id: "top3_lottery".to_string(),
                period: Some("2025-01-01".to_string()),
                source_type: SourceType::Top3Lottery,
            }),
            WalOperation::AppendTransaction(tx.clone()),
            WalOperation::SetQuantity {
                user_id: "alice".to_string(),
                item_id: "gem".to_string(),
                quantity: 3,
                group: Some(tx.transaction_group),
            },
        ];

        {
            let (wal, _) = WriteAheadLog::open(&path, true).unwrap();
            assert_eq!(wal.append_commit(&ops).unwrap(), 0);
            assert_eq!(wal.append_commit(&ops[..1]).unwrap(), 1);
        }

        let (wal, commits) = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].operations, ops);
        assert_eq!(commits[1].lsn, 1);
        // LSNs continue after recovery.
        assert_eq!(wal.append_commit(&ops[..1]).unwrap(), 2);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_torn_tail_is_discarded() {
        let path = temp_wal_path();
        let ops = vec![WalOperation::AppendTransaction(sample_transaction())];
        {
            let (wal, _) = WriteAheadLog::open(&path, false).unwrap();
            wal.append_commit(&ops).unwrap();
            wal.append_commit(&ops).unwrap();
        }

        // Simulate a crash halfway through the second record.
        let full_len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 5).unwrap();
        drop(file);

        {
            let (wal, commits) = WriteAheadLog::open(&path, false).unwrap();
            assert_eq!(commits.len(), 1);
            // The next commit lands on a clean boundary.
            assert_eq!(wal.append_commit(&ops).unwrap(), 1);
        }

        let (_wal, commits) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(commits.len(), 2);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_creates_missing_directory() {
        let dir = temp_wal_path().with_extension("d");
        let path = dir.join("nested").join("economy.wal");
        assert!(!dir.exists());

        {
            let (wal, commits) = WriteAheadLog::open(&path, false).unwrap();
            assert!(commits.is_empty());
            wal.append_commit(&[WalOperation::AppendTransaction(sample_transaction())])
                .unwrap();
        }
        let (_wal, commits) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(commits.len(), 1);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_rewind_poisons_the_log() {
        let path = temp_wal_path();
        let ops = vec![WalOperation::AppendTransaction(sample_transaction())];
        let (wal, _) = WriteAheadLog::open(&path, false).unwrap();
        wal.append_commit(&ops).unwrap();

        // A read-only handle fails both the write and the truncate.
        wal.file.lock().file = File::open(&path).unwrap();
        let first = wal.append_commit(&ops);
        assert!(matches!(first, Err(EconomyError::Persistence(ref msg)) if msg.contains("rewind failed")));
        assert!(wal.file.lock().poisoned);

        // Even with a writable handle back, nothing lands after a possible torn tail.
        wal.file.lock().file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let second = wal.append_commit(&ops);
        assert!(matches!(second, Err(EconomyError::Persistence(ref msg)) if msg.contains("poisoned")));
        drop(wal);

        let (wal, commits) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(wal.append_commit(&ops).unwrap(), 1);

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let path = temp_wal_path();
        fs::write(&path, b"NOPE0000000000000000").unwrap();
        let result = WriteAheadLog::open(&path, false);
        assert!(matches!(result, Err(EconomyError::Persistence(_))));
        fs::remove_file(&path).ok();
    }
}
