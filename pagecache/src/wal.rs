use std::{
	collections::HashMap,
	fs::{File, OpenOptions},
	io::{self, Write as _},
	path::Path,
	sync::atomic::{AtomicU64, Ordering},
};

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;

use crate::{error::WalError, id::PageId};

/// Contract the cache consumes from a write-ahead log. Transaction
/// management, undo and recovery content are out of scope here (non-goals);
/// only the ordering primitive the cache needs is modeled: every dirty page
/// carries the LSN of the record describing it, and the cache must not write
/// that page to disk before the WAL is durable up to that LSN.
#[cfg_attr(test, automock)]
pub trait WalApi: Send + Sync {
	/// Allocates and returns a fresh LSN for a mutation about to be applied,
	/// appending a record for it. Used by `markDirty` to stamp an entry.
	fn next_lsn(&self) -> Result<u64, WalError>;

	/// The highest LSN the WAL has made durable so far.
	fn durable_lsn(&self) -> u64;

	/// Blocks until the WAL is durable at least up to `lsn`.
	fn flush_until(&self, lsn: u64) -> Result<(), WalError>;

	/// The dirty-pages table as of the last checkpoint, consumed by
	/// `fillDirtyPages` at `openFile`.
	fn checkpoint_dirty_pages(&self) -> Result<Vec<(PageId, u64)>, WalError>;

	/// Informs the WAL that `id` is dirty as of `lsn`, for inclusion in the
	/// next checkpoint's dirty-pages table.
	fn register_dirty(&self, id: PageId, lsn: u64) -> Result<(), WalError>;
}

/// A minimal disk-backed WAL sufficient to exercise the cache's
/// WAL-before-data ordering: an append-only record file for durability and
/// an in-memory dirty-pages table for checkpointing. It carries no
/// transaction, undo or redo content.
pub struct SimpleWal {
	file: Mutex<File>,
	next_lsn: AtomicU64,
	durable_lsn: AtomicU64,
	dirty: Mutex<HashMap<PageId, u64>>,
}

impl SimpleWal {
	pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
		let file = OpenOptions::new().create(true).append(true).read(true).open(path)?;
		Ok(Self {
			file: Mutex::new(file),
			next_lsn: AtomicU64::new(1),
			durable_lsn: AtomicU64::new(0),
			dirty: Mutex::new(HashMap::new()),
		})
	}
}

impl WalApi for SimpleWal {
	fn next_lsn(&self) -> Result<u64, WalError> {
		let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
		self.file
			.lock()
			.write_all(&lsn.to_be_bytes())
			.map_err(WalError::Append)?;
		Ok(lsn)
	}

	fn durable_lsn(&self) -> u64 {
		self.durable_lsn.load(Ordering::SeqCst)
	}

	fn flush_until(&self, lsn: u64) -> Result<(), WalError> {
		self.file.lock().sync_all().map_err(|e| WalError::Flush(lsn, e))?;
		self.durable_lsn.fetch_max(lsn, Ordering::SeqCst);
		Ok(())
	}

	fn checkpoint_dirty_pages(&self) -> Result<Vec<(PageId, u64)>, WalError> {
		Ok(self.dirty.lock().iter().map(|(&id, &lsn)| (id, lsn)).collect())
	}

	fn register_dirty(&self, id: PageId, lsn: u64) -> Result<(), WalError> {
		self.dirty.lock().insert(id, lsn);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn lsns_are_monotonic() {
		let dir = tempdir().unwrap();
		let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
		let a = wal.next_lsn().unwrap();
		let b = wal.next_lsn().unwrap();
		assert!(b > a);
	}

	#[test]
	fn flush_until_advances_durable_lsn_monotonically() {
		let dir = tempdir().unwrap();
		let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
		wal.flush_until(10).unwrap();
		assert_eq!(wal.durable_lsn(), 10);
		wal.flush_until(3).unwrap();
		assert_eq!(wal.durable_lsn(), 10);
	}

	#[test]
	fn checkpoint_reflects_registered_dirty_pages() {
		let dir = tempdir().unwrap();
		let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
		let id = PageId::new(0, 4);
		wal.register_dirty(id, 7).unwrap();

		let table = wal.checkpoint_dirty_pages().unwrap();
		assert_eq!(table, vec![(id, 7)]);
	}
}
