//! Chunked file transfer reassembly
//!
//! Tracks in-flight transfers keyed by (sender, filename) and applies
//! chunks at their declared offsets, so chunks may arrive with gaps,
//! overlaps or out of order. The index lock covers only lookup and
//! insert/remove; storage writes happen under the transfer's own lock.
//!
//! A transfer leaves the in-flight index once it is complete and every
//! byte of its declared size has arrived; only its summary is kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::message::TransferSummary;
use crate::storage::{validate_filename, ContentStore, ContentTarget};

/// Largest declared size accepted unless configured otherwise (1 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Index key: one transfer per sender and filename
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub sender: String,
    pub filename: String,
}

impl TransferKey {
    pub fn new(sender: &str, filename: &str) -> Self {
        Self {
            sender: sender.to_string(),
            filename: filename.to_string(),
        }
    }
}

/// What `begin` did with any previous transfer for the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    Started,
    /// An open transfer for the same key was discarded
    Superseded,
}

/// One offset-addressed slice of a file
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub sender: &'a str,
    pub recipient: &'a str,
    pub filename: &'a str,
    pub data: &'a [u8],
    pub offset: u64,
    /// Declared total size, used when the transfer is created lazily
    pub size: u64,
    pub last: bool,
}

/// State after applying one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub recipient: String,
    pub size: u64,
    pub bytes_written: u64,
    pub percent: u8,
    /// True only for the chunk that completed the transfer
    pub completed_now: bool,
    pub complete: bool,
}

/// Disjoint, non-adjacent byte ranges written so far
#[derive(Debug, Default)]
struct Coverage {
    /// start → end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl Coverage {
    fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let (mut start, mut end) = (start, end);
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, e)| **e >= start)
            .map(|(s, e)| (*s, *e))
            .collect();
        for (s, e) in touching {
            self.ranges.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }
}

/// In-progress reconstruction of one file
#[derive(Debug)]
pub struct Transfer {
    sender: String,
    recipient: String,
    filename: String,
    size: u64,
    coverage: Coverage,
    target: Option<Box<dyn ContentTarget>>,
    complete: bool,
}

impl Transfer {
    fn new(sender: &str, recipient: &str, filename: &str, size: u64) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            filename: filename.to_string(),
            size,
            coverage: Coverage::default(),
            target: None,
            complete: false,
        }
    }

    /// Distinct bytes written, capped at the declared size
    pub fn bytes_written(&self) -> u64 {
        self.coverage.covered().min(self.size)
    }

    /// `bytes_written * 100 / size`, 100 for an empty declared size
    pub fn percent(&self) -> u8 {
        percent(self.coverage.covered(), self.size)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Complete with no gaps left; nothing more can change the file
    fn is_settled(&self) -> bool {
        self.complete && self.coverage.covered() >= self.size
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            filename: self.filename.clone(),
            size: self.size,
            bytes_written: self.bytes_written(),
            percent: self.percent(),
            complete: self.complete,
        }
    }

    fn apply(&mut self, store: &dyn ContentStore, chunk: &Chunk<'_>) -> Result<ChunkOutcome, AppError> {
        let end = chunk
            .offset
            .checked_add(chunk.data.len() as u64)
            .ok_or_else(|| AppError::Invalid("Chunk offset out of range".to_string()))?;
        if end > self.size {
            return Err(AppError::Invalid(format!(
                "Chunk at {}..{} is beyond the declared size of {} ({} bytes)",
                chunk.offset, end, self.filename, self.size
            )));
        }

        let target = match &mut self.target {
            Some(target) => target,
            slot => slot.insert(store.open(&self.recipient, &self.sender, &self.filename)?),
        };
        target
            .write_at(chunk.offset, chunk.data)
            .map_err(AppError::Storage)?;
        self.coverage.insert(chunk.offset, end);

        let mut completed_now = false;
        if chunk.last && !self.complete {
            target.finish().map_err(AppError::Storage)?;
            self.complete = true;
            completed_now = true;
        } else if self.complete {
            // Late chunk filling a gap of a finished file
            target.finish().map_err(AppError::Storage)?;
        }

        Ok(ChunkOutcome {
            recipient: self.recipient.clone(),
            size: self.size,
            bytes_written: self.bytes_written(),
            percent: self.percent(),
            completed_now,
            complete: self.complete,
        })
    }
}

fn percent(written: u64, size: u64) -> u8 {
    if size == 0 || written >= size {
        return 100;
    }
    (u128::from(written) * 100 / u128::from(size)) as u8
}

/// Index of all transfers in flight
#[derive(Debug)]
pub struct Reassembler {
    store: Arc<dyn ContentStore>,
    max_file_size: u64,
    transfers: Mutex<HashMap<TransferKey, Arc<Mutex<Transfer>>>>,
    /// Last settled transfer per key, for listings
    finished: Mutex<HashMap<TransferKey, TransferSummary>>,
}

impl Reassembler {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self::with_max_file_size(store, DEFAULT_MAX_FILE_SIZE)
    }

    /// Reassembler refusing declared sizes above `max_file_size`
    pub fn with_max_file_size(store: Arc<dyn ContentStore>, max_file_size: u64) -> Self {
        Self {
            store,
            max_file_size,
            transfers: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    fn check_size(&self, filename: &str, size: u64) -> Result<(), AppError> {
        if size > self.max_file_size {
            return Err(AppError::Invalid(format!(
                "File {} is too large ({} bytes, limit {})",
                filename, size, self.max_file_size
            )));
        }
        Ok(())
    }

    /// Start a transfer, superseding any transfer for the same key
    pub fn begin(
        &self,
        sender: &str,
        recipient: &str,
        filename: &str,
        size: u64,
    ) -> Result<Begin, AppError> {
        validate_filename(filename)?;
        self.check_size(filename, size)?;

        let key = TransferKey::new(sender, filename);
        let transfer = Arc::new(Mutex::new(Transfer::new(sender, recipient, filename, size)));
        let previous = self.index().insert(key.clone(), transfer);
        lock(&self.finished).remove(&key);

        if previous.is_some() {
            warn!("Transfer of {} from {} restarted", filename, sender);
            Ok(Begin::Superseded)
        } else {
            info!(
                "Transfer of {} ({} bytes) from {} to {} started",
                filename, size, sender, recipient
            );
            Ok(Begin::Started)
        }
    }

    /// Write one chunk, creating the transfer if it is not known yet
    ///
    /// Performs blocking storage I/O; call from a blocking context.
    pub fn apply(&self, chunk: Chunk<'_>) -> Result<ChunkOutcome, AppError> {
        validate_filename(chunk.filename)?;

        let key = TransferKey::new(chunk.sender, chunk.filename);
        let transfer = {
            let mut index = self.index();
            match index.get(&key) {
                Some(transfer) => transfer.clone(),
                None => {
                    self.check_size(chunk.filename, chunk.size)?;
                    debug!(
                        "Implicit transfer of {} from {} to {}",
                        chunk.filename, chunk.sender, chunk.recipient
                    );
                    let transfer = Arc::new(Mutex::new(Transfer::new(
                        chunk.sender,
                        chunk.recipient,
                        chunk.filename,
                        chunk.size,
                    )));
                    index.insert(key.clone(), transfer.clone());
                    lock(&self.finished).remove(&key);
                    transfer
                }
            }
        };

        let (outcome, settled) = {
            let mut guard = lock(&transfer);
            let outcome = guard.apply(self.store.as_ref(), &chunk)?;
            let settled = guard.is_settled().then(|| guard.summary());
            (outcome, settled)
        };

        if let Some(summary) = settled {
            self.retire(key, &transfer, summary);
        }

        if outcome.completed_now {
            info!(
                "Transfer of {} from {} to {} complete ({} bytes)",
                chunk.filename, chunk.sender, outcome.recipient, outcome.bytes_written
            );
        }
        Ok(outcome)
    }

    /// Move a settled transfer out of the in-flight index
    fn retire(&self, key: TransferKey, transfer: &Arc<Mutex<Transfer>>, summary: TransferSummary) {
        let mut index = self.index();
        // A concurrent begin may already have replaced it
        if index.get(&key).is_some_and(|t| Arc::ptr_eq(t, transfer)) {
            index.remove(&key);
            lock(&self.finished).insert(key, summary);
        }
    }

    /// Percentage of the declared size written so far
    pub fn progress(&self, sender: &str, filename: &str) -> Result<u8, AppError> {
        let key = TransferKey::new(sender, filename);
        let transfer = self.index().get(&key).cloned();
        match transfer {
            Some(transfer) => Ok(lock(&transfer).percent()),
            None => lock(&self.finished)
                .get(&key)
                .map(|summary| summary.percent)
                .ok_or_else(|| AppError::TransferNotFound {
                    sender: sender.to_string(),
                    filename: filename.to_string(),
                }),
        }
    }

    /// Transfers sent or received by `user`, in flight or finished
    pub fn transfers_for(&self, user: &str) -> Vec<TransferSummary> {
        let transfers: Vec<Arc<Mutex<Transfer>>> = self.index().values().cloned().collect();
        let mut out: Vec<TransferSummary> = transfers.iter().map(|t| lock(t).summary()).collect();
        out.extend(lock(&self.finished).values().cloned());
        out.retain(|s| s.sender == user || s.recipient == user);
        out.sort_by(|a, b| (&a.sender, &a.filename).cmp(&(&b.sender, &b.filename)));
        out
    }

    /// Forget every transfer `user` sends or receives; returns how many
    /// were still in flight
    pub fn release(&self, user: &str) -> usize {
        let involves = |s: &str, r: &str| s == user || r == user;

        let transfers: Vec<(TransferKey, Arc<Mutex<Transfer>>)> = self
            .index()
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        let doomed: Vec<TransferKey> = transfers
            .into_iter()
            .filter(|(_, t)| {
                let t = lock(t);
                involves(&t.sender, &t.recipient)
            })
            .map(|(k, _)| k)
            .collect();

        let mut index = self.index();
        let released = doomed.iter().filter(|k| index.remove(*k).is_some()).count();
        drop(index);
        lock(&self.finished).retain(|_, s| !involves(&s.sender, &s.recipient));

        if released > 0 {
            debug!("Released {} transfers involving {}", released, user);
        }
        released
    }

    fn index(&self) -> MutexGuard<'_, HashMap<TransferKey, Arc<Mutex<Transfer>>>> {
        lock(&self.transfers)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn reassembler() -> (Reassembler, MemoryStore) {
        let store = MemoryStore::new();
        (Reassembler::new(Arc::new(store.clone())), store)
    }

    fn chunk<'a>(data: &'a [u8], offset: u64, size: u64, last: bool) -> Chunk<'a> {
        Chunk {
            sender: "alice",
            recipient: "bob",
            filename: "photo.jpg",
            data,
            offset,
            size,
            last,
        }
    }

    fn payload() -> (Vec<u8>, Vec<u8>) {
        let first: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let second: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8 + 100).collect();
        (first, second)
    }

    #[test]
    fn test_in_order_chunks_complete() {
        let (r, store) = reassembler();
        let (first, second) = payload();
        r.begin("alice", "bob", "photo.jpg", 6144).unwrap();

        let out = r.apply(chunk(&first, 0, 6144, false)).unwrap();
        assert_eq!(out.percent, 66);
        assert!(!out.complete);

        let out = r.apply(chunk(&second, 4096, 6144, true)).unwrap();
        assert_eq!(out.percent, 100);
        assert!(out.completed_now);
        assert_eq!(r.progress("alice", "photo.jpg").unwrap(), 100);

        let bytes = store.contents("bob", "alice", "photo.jpg").unwrap();
        assert_eq!(bytes.len(), 6144);
        assert_eq!(bytes, [first, second].concat());
    }

    #[test]
    fn test_reverse_order_chunks_same_bytes() {
        let (r, store) = reassembler();
        let (first, second) = payload();
        r.begin("alice", "bob", "photo.jpg", 6144).unwrap();

        let out = r.apply(chunk(&second, 4096, 6144, true)).unwrap();
        assert!(out.completed_now);
        assert_eq!(out.percent, 33);

        let out = r.apply(chunk(&first, 0, 6144, false)).unwrap();
        assert!(!out.completed_now);
        assert!(out.complete);
        assert_eq!(out.percent, 100);

        let bytes = store.contents("bob", "alice", "photo.jpg").unwrap();
        assert_eq!(bytes, [first, second].concat());
    }

    #[test]
    fn test_reapplying_chunk_is_idempotent() {
        let (r, _store) = reassembler();
        let (first, _) = payload();
        r.begin("alice", "bob", "photo.jpg", 6144).unwrap();

        r.apply(chunk(&first, 0, 6144, false)).unwrap();
        let out = r.apply(chunk(&first, 0, 6144, false)).unwrap();
        assert_eq!(out.bytes_written, 4096);
        assert_eq!(out.percent, 66);
    }

    #[test]
    fn test_overlapping_chunks_count_once() {
        let (r, _store) = reassembler();
        r.begin("alice", "bob", "photo.jpg", 100).unwrap();
        r.apply(chunk(&[1; 60], 0, 100, false)).unwrap();
        let out = r.apply(chunk(&[2; 60], 40, 100, false)).unwrap();
        assert_eq!(out.bytes_written, 100);
        assert!(!out.complete);
    }

    #[test]
    fn test_completion_requires_final_flag() {
        let (r, _store) = reassembler();
        r.begin("alice", "bob", "photo.jpg", 4).unwrap();
        let out = r.apply(chunk(b"abcd", 0, 4, false)).unwrap();
        assert_eq!(out.percent, 100);
        assert!(!out.complete);

        let out = r.apply(chunk(b"", 4, 4, true)).unwrap();
        assert!(out.completed_now);
    }

    #[test]
    fn test_completion_fires_once_while_gaps_remain() {
        let (r, store) = reassembler();
        r.begin("alice", "bob", "photo.jpg", 8).unwrap();

        let out = r.apply(chunk(b"efgh", 4, 8, true)).unwrap();
        assert!(out.completed_now);
        let out = r.apply(chunk(b"efgh", 4, 8, true)).unwrap();
        assert!(!out.completed_now, "completion must fire once");

        let out = r.apply(chunk(b"abcd", 0, 8, false)).unwrap();
        assert!(!out.completed_now);
        assert_eq!(out.percent, 100);
        assert_eq!(store.contents("bob", "alice", "photo.jpg").unwrap(), b"abcdefgh");
    }

    #[test]
    fn test_chunk_beyond_declared_size_is_rejected() {
        let (r, store) = reassembler();
        r.begin("alice", "bob", "photo.jpg", 10).unwrap();

        let err = r.apply(chunk(b"z", 1 << 40, 10, false)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let err = r.apply(chunk(b"too long!!!", 0, 10, true)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        // Nothing reached storage
        assert_eq!(store.contents("bob", "alice", "photo.jpg"), None);
        assert_eq!(r.progress("alice", "photo.jpg").unwrap(), 0);
    }

    #[test]
    fn test_declared_size_limit() {
        let store = MemoryStore::new();
        let r = Reassembler::with_max_file_size(Arc::new(store.clone()), 16);

        assert!(r.begin("alice", "bob", "big.bin", 17).is_err());
        assert!(r.apply(chunk(b"x", 0, 1 << 40, false)).is_err());
        assert!(r.transfers_for("alice").is_empty());
        assert!(r.begin("alice", "bob", "ok.bin", 16).is_ok());
    }

    #[test]
    fn test_resend_after_completion_starts_fresh() {
        let (r, store) = reassembler();
        let out = r.apply(chunk(b"LONG OLD CONTENT", 0, 16, true)).unwrap();
        assert!(out.completed_now);

        let out = r.apply(chunk(b"new", 0, 3, true)).unwrap();
        assert!(out.completed_now);
        assert_eq!(out.size, 3);
        assert_eq!(store.contents("bob", "alice", "photo.jpg").unwrap(), b"new");
    }

    #[test]
    fn test_begin_after_completion_is_a_fresh_start() {
        let (r, _store) = reassembler();
        r.begin("alice", "bob", "photo.jpg", 3).unwrap();
        r.apply(chunk(b"abc", 0, 3, true)).unwrap();

        // Finished transfers stay listed
        let listed = r.transfers_for("bob");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].complete);

        assert_eq!(r.begin("alice", "bob", "photo.jpg", 3).unwrap(), Begin::Started);
        let listed = r.transfers_for("bob");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].complete);
    }

    #[test]
    fn test_zero_declared_size_is_full_progress() {
        let (r, _store) = reassembler();
        r.begin("alice", "bob", "empty.txt", 0).unwrap();
        assert_eq!(r.progress("alice", "empty.txt").unwrap(), 100);
    }

    #[test]
    fn test_lazy_transfer_from_first_chunk() {
        let (r, store) = reassembler();
        let out = r.apply(chunk(b"hi", 0, 8, false)).unwrap();
        assert_eq!(out.recipient, "bob");
        assert_eq!(out.size, 8);
        assert_eq!(out.percent, 25);
        assert_eq!(store.contents("bob", "alice", "photo.jpg").unwrap(), b"hi");
    }

    #[test]
    fn test_second_begin_supersedes() {
        let (r, store) = reassembler();
        assert_eq!(r.begin("alice", "bob", "photo.jpg", 8).unwrap(), Begin::Started);
        r.apply(chunk(b"old!", 0, 8, false)).unwrap();

        assert_eq!(
            r.begin("alice", "bob", "photo.jpg", 4).unwrap(),
            Begin::Superseded
        );
        assert_eq!(r.progress("alice", "photo.jpg").unwrap(), 0);

        let out = r.apply(chunk(b"new", 0, 4, true)).unwrap();
        assert_eq!(out.size, 4);
        assert!(out.completed_now);
        assert_eq!(store.contents("bob", "alice", "photo.jpg").unwrap(), b"new");
    }

    #[test]
    fn test_same_filename_from_two_senders() {
        let (r, store) = reassembler();
        r.apply(chunk(b"from alice", 0, 10, true)).unwrap();
        r.apply(Chunk {
            sender: "carol",
            ..chunk(b"from carol", 0, 10, true)
        })
        .unwrap();

        assert_eq!(
            store.contents("bob", "alice", "photo.jpg").unwrap(),
            b"from alice"
        );
        assert_eq!(
            store.contents("bob", "carol", "photo.jpg").unwrap(),
            b"from carol"
        );
    }

    #[test]
    fn test_progress_unknown_transfer() {
        let (r, _store) = reassembler();
        assert!(matches!(
            r.progress("alice", "nothing"),
            Err(AppError::TransferNotFound { .. })
        ));
    }

    #[test]
    fn test_transfers_for_and_release() {
        let (r, _store) = reassembler();
        r.begin("alice", "bob", "a.txt", 10).unwrap();
        r.begin("carol", "alice", "b.txt", 10).unwrap();
        r.begin("carol", "dave", "c.txt", 10).unwrap();

        let mine = r.transfers_for("alice");
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].filename, "a.txt");
        assert_eq!(mine[1].filename, "b.txt");

        assert_eq!(r.release("carol"), 2);
        assert_eq!(r.transfers_for("alice").len(), 1);

        // Receivers release too
        assert_eq!(r.release("bob"), 1);
        assert!(r.transfers_for("alice").is_empty());
    }

    #[test]
    fn test_release_drops_finished_records() {
        let (r, _store) = reassembler();
        r.apply(chunk(b"abc", 0, 3, true)).unwrap();
        assert_eq!(r.transfers_for("bob").len(), 1);

        assert_eq!(r.release("bob"), 0);
        assert!(r.transfers_for("alice").is_empty());
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[derive(Debug)]
    struct BrokenTarget;

    impl ContentStore for BrokenStore {
        fn open(&self, _: &str, _: &str, _: &str) -> Result<Box<dyn ContentTarget>, AppError> {
            Ok(Box::new(BrokenTarget))
        }
    }

    impl ContentTarget for BrokenTarget {
        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn finish(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_is_storage_error() {
        let r = Reassembler::new(Arc::new(BrokenStore));
        let err = r.apply(chunk(b"abc", 0, 3, true)).unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn test_rejects_bad_filename() {
        let (r, _store) = reassembler();
        assert!(r.begin("alice", "bob", "../x", 1).is_err());
        assert!(r
            .apply(Chunk {
                filename: "a/b",
                ..chunk(b"x", 0, 1, true)
            })
            .is_err());
    }

    #[test]
    fn test_coverage_merges_ranges() {
        let mut c = Coverage::default();
        c.insert(10, 20);
        c.insert(30, 40);
        c.insert(20, 30);
        assert_eq!(c.ranges.len(), 1);
        assert_eq!(c.covered(), 30);
        c.insert(0, 5);
        c.insert(2, 12);
        assert_eq!(c.covered(), 40);
    }
}
