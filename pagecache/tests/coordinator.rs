//! End-to-end scenarios against `CacheCoordinator`: write-then-read,
//! blocked-flush-then-retry, dirty-read-satisfies-miss, and remove
//! semantics on truncate.

use pagecache::{CacheConfig, CacheCoordinator, CacheError, NullProgressListener, PageId, PageStore, SimpleWal};
use tempfile::TempDir;

const PAGE_SIZE: usize = 64;

fn harness() -> (TempDir, std::sync::Arc<CacheCoordinator<PageStore, SimpleWal>>) {
	let dir = tempfile::tempdir().unwrap();
	let store = PageStore::new(dir.path(), PAGE_SIZE, false);
	let wal = SimpleWal::open(dir.path().join("wal.log")).unwrap();
	let config = CacheConfig {
		max_memory_bytes: PAGE_SIZE * 16,
		page_size: PAGE_SIZE,
		write_queue_length: 1024,
		sync_on_page_flush: false,
		start_flush: false,
		file_lock: false,
	};
	let coordinator = CacheCoordinator::open(store, wal, config).unwrap();
	(dir, coordinator)
}

fn payload(byte: u8) -> Vec<u8> {
	vec![byte; PAGE_SIZE - pagecache::consts::PAGE_HEADER_SIZE]
}

#[test]
fn write_then_read_round_trips_through_a_flush() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	let handle = coordinator.load(id).unwrap();
	unsafe {
		handle.as_mut_slice()[pagecache::consts::PAGE_HEADER_SIZE..].copy_from_slice(&payload(0xAB));
	}
	coordinator.mark_dirty(id).unwrap();
	handle.release().unwrap();

	coordinator.flush_file(file_id, true).unwrap();

	let handle = coordinator.load(id).unwrap();
	let read_back = unsafe { handle.as_slice()[pagecache::consts::PAGE_HEADER_SIZE..].to_vec() };
	handle.release().unwrap();

	assert_eq!(read_back, payload(0xAB));
}

#[test]
fn flush_is_idempotent_and_leaves_no_corruption() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	let handle = coordinator.load(id).unwrap();
	unsafe {
		handle.as_mut_slice()[pagecache::consts::PAGE_HEADER_SIZE..].copy_from_slice(&payload(0x11));
	}
	coordinator.mark_dirty(id).unwrap();
	handle.release().unwrap();

	coordinator.flush_file(file_id, true).unwrap();
	coordinator.flush_file(file_id, true).unwrap();

	let reports = coordinator.check_stored_pages(&NullProgressListener).unwrap();
	assert!(reports.is_empty());
}

#[test]
fn flush_is_blocked_by_a_pinned_page_then_succeeds_after_release() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	let handle = coordinator.load(id).unwrap();
	coordinator.mark_dirty(id).unwrap();

	let err = coordinator.flush_file(file_id, false).unwrap_err();
	assert!(matches!(err, CacheError::BlockedPage(p) if p == id));

	handle.release().unwrap();
	coordinator.flush_file(file_id, false).unwrap();
}

#[test]
fn a_dirty_unflushed_page_survives_read_cache_eviction() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let dirty_id = PageId::new(file_id, 0);

	let handle = coordinator.load(dirty_id).unwrap();
	unsafe {
		handle.as_mut_slice()[pagecache::consts::PAGE_HEADER_SIZE..].copy_from_slice(&payload(0x77));
	}
	coordinator.mark_dirty(dirty_id).unwrap();
	handle.release().unwrap();

	// Cycle enough other pages through the read cache to evict dirty_id out
	// of A1in/Am; its buffer must survive because it is still write-cache
	// resident, so the next load must not fall back to a stale on-disk read.
	for idx in 1..40 {
		let id = PageId::new(file_id, idx);
		let handle = coordinator.load(id).unwrap();
		handle.release().unwrap();
	}

	let handle = coordinator.load(dirty_id).unwrap();
	let read_back = unsafe { handle.as_slice()[pagecache::consts::PAGE_HEADER_SIZE..].to_vec() };
	handle.release().unwrap();

	assert_eq!(read_back, payload(0x77));
}

#[test]
fn truncate_clears_dirty_pages_and_reads_come_back_fresh() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	let handle = coordinator.load(id).unwrap();
	unsafe {
		handle.as_mut_slice()[pagecache::consts::PAGE_HEADER_SIZE..].copy_from_slice(&payload(0x55));
	}
	coordinator.mark_dirty(id).unwrap();
	handle.release().unwrap();

	coordinator.truncate_file(file_id).unwrap();

	// Flushing after truncate must be a no-op: the dirty entry is gone.
	coordinator.flush_file(file_id, true).unwrap();

	let handle = coordinator.load(id).unwrap();
	let read_back = unsafe { handle.as_slice()[pagecache::consts::PAGE_HEADER_SIZE..].to_vec() };
	handle.release().unwrap();

	assert_eq!(read_back, vec![0u8; PAGE_SIZE - pagecache::consts::PAGE_HEADER_SIZE]);
}

#[test]
fn mark_dirty_without_a_prior_load_is_a_contract_violation() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 3);

	let err = coordinator.mark_dirty(id).unwrap_err();
	assert!(matches!(err, CacheError::NotInCache(p) if p == id));
}

#[test]
fn a_page_can_be_loaded_and_released_repeatedly() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	for _ in 0..3 {
		coordinator.load(id).unwrap().release().unwrap();
	}
}

#[test]
fn close_file_rejects_while_a_page_is_pinned() {
	let (_dir, coordinator) = harness();
	let file_id = 0;
	coordinator.open_file(file_id).unwrap();
	let id = PageId::new(file_id, 0);

	let handle = coordinator.load(id).unwrap();
	let err = coordinator.close_file(file_id, false).unwrap_err();
	assert!(matches!(err, CacheError::BlockedPage(p) if p == id));

	handle.release().unwrap();
	coordinator.close_file(file_id, false).unwrap();
}
