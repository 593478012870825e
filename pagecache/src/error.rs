use std::io;

use thiserror::Error;

use crate::{consts::PageSizeBoundsError, id::PageId};

/// Errors raised by the [`PageStore`](crate::page_store::PageStore) while
/// opening, reading or writing a file.
#[derive(Debug, Error)]
pub enum PageStoreError {
	#[error("Failed to open file {0}: {1}")]
	Open(u64, io::Error),

	#[error("Failed to acquire OS file lock on file {0}: {1}")]
	Locked(u64, io::Error),

	#[error("File {0} is not open in this store")]
	NotOpen(u64),

	#[error("Failed to read page {0}: {1}")]
	Read(PageId, io::Error),

	#[error("Failed to write page {0}: {1}")]
	Write(PageId, io::Error),

	#[error("Failed to sync file {0}: {1}")]
	Sync(u64, io::Error),

	#[error("Failed to rename file {0}: {1}")]
	Rename(u64, io::Error),

	#[error("Failed to truncate file {0}: {1}")]
	Truncate(u64, io::Error),

	#[error("Failed to delete file {0}: {1}")]
	Delete(u64, io::Error),
}

/// Errors raised by the write-ahead log collaborator. Only the contract in
/// the specification is assumed; this is the error surface of whatever WAL
/// implementation is plugged in.
#[derive(Debug, Error)]
pub enum WalError {
	#[error("WAL append failed: {0}")]
	Append(io::Error),

	#[error("WAL flush up to LSN {0} failed: {1}")]
	Flush(u64, io::Error),

	#[error("WAL is not initialized")]
	NotInitialized,
}

/// The full cache error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum CacheError {
	#[error(transparent)]
	Io(#[from] io::Error),

	#[error(transparent)]
	PageStore(#[from] PageStoreError),

	#[error(transparent)]
	Wal(#[from] WalError),

	#[error(transparent)]
	Config(#[from] PageSizeBoundsError),

	/// Attempted flush encountered a pinned page.
	#[error("page {0} is in use")]
	BlockedPage(PageId),

	/// `release`/`markDirty` called without a preceding `load`/`get`.
	#[error("page {0} is not in cache")]
	NotInCache(PageId),

	/// Buffer allocation failed, or no unpinned eviction candidate exists.
	#[error("cache is exhausted: {0}")]
	ResourceExhausted(&'static str),

	#[error("file {0} is not open")]
	FileNotOpen(u64),

	#[error("illegal state: {0}")]
	IllegalState(&'static str),
}

/// One bad page discovered by [`CacheCoordinator::check_stored_pages`](crate::coordinator::CacheCoordinator::check_stored_pages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
	pub file_id: u64,
	pub page_id: PageId,
	pub kind: CorruptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
	MagicMismatch,
	CrcMismatch,
	Io,
}

impl std::fmt::Display for CorruptionKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::MagicMismatch => write!(f, "magic number mismatch"),
			Self::CrcMismatch => write!(f, "CRC mismatch"),
			Self::Io => write!(f, "I/O error"),
		}
	}
}
