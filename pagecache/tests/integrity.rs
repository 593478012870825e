//! End-to-end magic+CRC integrity scan (testable property P7): a page
//! tampered with directly on disk is reported by `check_stored_pages`, and
//! an untouched store reports nothing.

use pagecache::{consts::PAGE_HEADER_SIZE, CacheConfig, CacheCoordinator, CorruptionKind, NullProgressListener, PageId, PageStore, SimpleWal};
use std::{
	fs::OpenOptions,
	io::{Seek, SeekFrom, Write},
};

const PAGE_SIZE: usize = 64;

fn config() -> CacheConfig {
	CacheConfig {
		max_memory_bytes: PAGE_SIZE * 16,
		page_size: PAGE_SIZE,
		write_queue_length: 1024,
		sync_on_page_flush: true,
		start_flush: false,
		file_lock: false,
	}
}

#[test]
fn a_clean_store_reports_no_corruption() {
	let dir = tempfile::tempdir().unwrap();
	let store = PageStore::new(dir.path(), PAGE_SIZE, false);
	let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
	let coordinator = CacheCoordinator::open(store, wal, config()).unwrap();

	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	for idx in 0..4 {
		let id = PageId::new(file_id, idx);
		let handle = coordinator.load(id).unwrap();
		unsafe {
			handle.as_mut_slice()[PAGE_HEADER_SIZE..].fill(idx as u8);
		}
		coordinator.mark_dirty(id).unwrap();
		handle.release().unwrap();
	}
	coordinator.flush_file(file_id, true).unwrap();

	let reports = coordinator.check_stored_pages(&NullProgressListener).unwrap();
	assert!(reports.is_empty());
}

#[test]
fn a_tampered_page_is_reported_as_crc_mismatch() {
	let dir = tempfile::tempdir().unwrap();
	let store = PageStore::new(dir.path(), PAGE_SIZE, false);
	let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
	let coordinator = CacheCoordinator::open(store, wal, config()).unwrap();

	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 2);
	let handle = coordinator.load(id).unwrap();
	unsafe {
		handle.as_mut_slice()[PAGE_HEADER_SIZE..].fill(0x42);
	}
	coordinator.mark_dirty(id).unwrap();
	handle.release().unwrap();
	coordinator.flush_file(file_id, true).unwrap();
	coordinator.close_file(file_id, false).unwrap();

	// Flip a payload byte directly on disk, behind the coordinator's back.
	let path = dir.path().join(format!("{file_id}.pgc"));
	let mut file = OpenOptions::new().write(true).open(&path).unwrap();
	let offset = (2 * PAGE_SIZE + PAGE_HEADER_SIZE) as u64;
	file.seek(SeekFrom::Start(offset)).unwrap();
	file.write_all(&[0x00]).unwrap();
	drop(file);

	// Reopen the same file_id: identity is caller-owned, so this picks the
	// tampered file back up rather than starting a fresh one.
	coordinator.open_file(file_id).unwrap();
	let reports = coordinator.check_stored_pages(&NullProgressListener).unwrap();
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].file_id, file_id);
	assert_eq!(reports[0].page_id, id);
	assert_eq!(reports[0].kind, CorruptionKind::CrcMismatch);
}
