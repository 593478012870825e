use std::{
	collections::{BTreeSet, HashMap},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
	time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::{
	config::CacheConfig,
	consts::{PAGE_HEADER_SIZE, WRITE_CACHE_SHARE_DIVISOR},
	direct_page::DirectPageAllocator,
	entry::{CacheEntry, EntryTable},
	error::{CacheError, CorruptionKind, CorruptionReport},
	id::PageId,
	listener::ProgressListener,
	page_header,
	page_store::FileManagerApi,
	read_cache::{Admission, ReadCache},
	wal::WalApi,
	write_cache::WriteCache,
};

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const FLUSH_HYSTERESIS: Duration = Duration::from_secs(2);

struct FileState {
	softly_closed: bool,
}

struct CoordinatorState {
	entries: EntryTable,
	read_cache: ReadCache,
	write_cache: WriteCache,
	files: HashMap<u64, FileState>,
	file_pages: HashMap<u64, BTreeSet<u64>>,
	entries_locks: HashMap<PageId, Arc<RwLock<()>>>,
}

impl CoordinatorState {
	fn page_lock(&mut self, id: PageId) -> Arc<RwLock<()>> {
		Arc::clone(self.entries_locks.entry(id).or_insert_with(|| Arc::new(RwLock::new(()))))
	}

	/// Prunes `id`'s page lock once it is no longer tracked by either cache
	/// (Design Notes §9: the lock map must not grow unboundedly).
	fn prune_page_lock_if_untracked(&mut self, id: PageId) {
		if !self.read_cache.contains_resident(id) && !self.read_cache.is_ghost(id) && !self.write_cache.contains(id) {
			self.entries_locks.remove(&id);
		}
	}
}

/// The public facade over the cache: file lifecycle, `load`/`release`/
/// `markDirty`/`flush*`, per-page locking layered over the global structural
/// lock `G`, and the integrity scan.
pub struct CacheCoordinator<F: FileManagerApi, W: WalApi> {
	state: Mutex<CoordinatorState>,
	store: F,
	wal: W,
	allocator: DirectPageAllocator,
	config: CacheConfig,
	flush_stop: Arc<AtomicBool>,
	flusher: Mutex<Option<JoinHandle<()>>>,
	healthy: AtomicBool,
}

impl<F, W> CacheCoordinator<F, W>
where
	F: FileManagerApi + 'static,
	W: WalApi + 'static,
{
	pub fn open(store: F, wal: W, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
		let max_size = config.validated_max_size()?;
		let write_cache_budget = (max_size / WRITE_CACHE_SHARE_DIVISOR).max(1);
		let read_cache_budget = max_size - write_cache_budget;

		let coordinator = Arc::new(Self {
			state: Mutex::new(CoordinatorState {
				entries: EntryTable::new(),
				read_cache: ReadCache::new(read_cache_budget),
				write_cache: WriteCache::new(write_cache_budget),
				files: HashMap::new(),
				file_pages: HashMap::new(),
				entries_locks: HashMap::new(),
			}),
			allocator: DirectPageAllocator::new(config.page_size),
			store,
			wal,
			config,
			flush_stop: Arc::new(AtomicBool::new(false)),
			flusher: Mutex::new(None),
			healthy: AtomicBool::new(true),
		});

		if coordinator.config.start_flush {
			coordinator.start_flusher();
		}
		Ok(coordinator)
	}

	fn start_flusher(self: &Arc<Self>) {
		let this = Arc::clone(self);
		let stop = Arc::clone(&self.flush_stop);
		let handle = thread::spawn(move || {
			while !stop.load(Ordering::SeqCst) {
				thread::sleep(FLUSH_INTERVAL);
				if let Err(err) = this.flush_cold_groups() {
					log::warn!("background flush tick failed: {err}");
					this.healthy.store(false, Ordering::SeqCst);
				}
			}
		});
		*self.flusher.lock() = Some(handle);
	}

	/// Cooperative shutdown of the flusher: sets the stop flag and joins,
	/// letting the current group finish rather than interrupting it.
	pub fn stop_flush(&self) {
		self.flush_stop.store(true, Ordering::SeqCst);
		if let Some(handle) = self.flusher.lock().take() {
			let _ = handle.join();
		}
	}

	pub fn is_healthy(&self) -> bool {
		self.healthy.load(Ordering::SeqCst)
	}

	// ---- file lifecycle -------------------------------------------------

	/// Opens `file_id`, reusing a prior numeric identity if the caller is
	/// reopening a file it closed earlier (soft-close detection, dirty-page
	/// reinstatement and all other identity-keyed state depend on the same
	/// id being passed again). A no-op that returns `false` if already open.
	pub fn open_file(&self, file_id: u64) -> Result<bool, CacheError> {
		let mut state = self.state.lock();
		if state.files.contains_key(&file_id) {
			return Ok(false);
		}

		let unclean = self.store.open(file_id)?;
		state.files.insert(
			file_id,
			FileState {
				softly_closed: !unclean,
			},
		);
		state.file_pages.insert(file_id, BTreeSet::new());

		for (id, lsn) in self.wal.checkpoint_dirty_pages()? {
			if id.file_id != file_id {
				continue;
			}
			let mut entry = CacheEntry::new_ghost(id, lsn);
			entry.mark_dirty_now(lsn);
			state.entries.insert(entry);
			state.write_cache.mark_dirty(id, lsn);
			state.file_pages.get_mut(&file_id).expect("just inserted").insert(id.page_index);
		}

		log::debug!("opened file {file_id} (softly_closed={})", !unclean);
		Ok(true)
	}

	pub fn is_open(&self, file_id: u64) -> bool {
		self.state.lock().files.contains_key(&file_id)
	}

	pub fn was_softly_closed(&self, file_id: u64) -> bool {
		self.state.lock().files.get(&file_id).is_some_and(|f| f.softly_closed)
	}

	pub fn set_softly_closed(&self, file_id: u64, value: bool) {
		if let Some(f) = self.state.lock().files.get_mut(&file_id) {
			f.softly_closed = value;
		}
	}

	pub fn close_file(&self, file_id: u64, flush: bool) -> Result<(), CacheError> {
		if flush {
			self.flush_file(file_id, self.config.sync_on_page_flush)?;
		}

		let mut state = self.state.lock();
		self.ensure_open(&state, file_id)?;

		let pages: Vec<PageId> = state
			.file_pages
			.get(&file_id)
			.into_iter()
			.flatten()
			.map(|&idx| PageId::new(file_id, idx))
			.collect();
		for id in &pages {
			if let Some(entry) = state.entries.get(*id) {
				if entry.is_pinned() {
					return Err(CacheError::BlockedPage(*id));
				}
			}
		}
		for id in pages {
			if let Some(entry) = state.entries.remove(id) {
				if let Some(ptr) = entry.data {
					unsafe { self.allocator.free(ptr) };
				}
			}
			state.entries_locks.remove(&id);
		}
		state.read_cache.remove_file(file_id);
		state.write_cache.drain_file(file_id);
		state.file_pages.remove(&file_id);
		state.files.remove(&file_id);
		drop(state);

		self.store.close(file_id)?;
		Ok(())
	}

	pub fn delete_file(&self, file_id: u64) -> Result<(), CacheError> {
		let is_open = self.is_open(file_id);
		if is_open {
			self.close_file(file_id, false)?;
		}
		self.store.delete(file_id)?;
		Ok(())
	}

	pub fn truncate_file(&self, file_id: u64) -> Result<(), CacheError> {
		let mut state = self.state.lock();
		self.ensure_open(&state, file_id)?;

		let pages: Vec<PageId> = state
			.file_pages
			.get(&file_id)
			.into_iter()
			.flatten()
			.map(|&idx| PageId::new(file_id, idx))
			.collect();
		for id in pages {
			if let Some(entry) = state.entries.remove(id) {
				if let Some(ptr) = entry.data {
					unsafe { self.allocator.free(ptr) };
				}
			}
			state.entries_locks.remove(&id);
		}
		state.read_cache.remove_file(file_id);
		state.write_cache.drain_file(file_id);
		state.file_pages.insert(file_id, BTreeSet::new());
		drop(state);

		self.store.shrink(file_id, 0)?;
		Ok(())
	}

	pub fn rename_file(&self, file_id: u64, new_file_id: u64) -> Result<(), CacheError> {
		let state = self.state.lock();
		self.ensure_open(&state, file_id)?;
		drop(state);
		self.store.rename(file_id, new_file_id)?;
		Ok(())
	}

	fn ensure_open(&self, state: &CoordinatorState, file_id: u64) -> Result<(), CacheError> {
		if !state.files.contains_key(&file_id) {
			return Err(CacheError::FileNotOpen(file_id));
		}
		Ok(())
	}

	// ---- page access ------------------------------------------------------

	/// Pins `id` and returns a handle to its resident buffer, admitting it
	/// into the cache on a miss.
	pub fn load(&self, id: PageId) -> Result<PageHandle<'_, F, W>, CacheError> {
		let mut state = self.state.lock();
		self.ensure_open(&state, id.file_id)?;
		let lock = state.page_lock(id);
		let _read_guard = lock.read();

		if state.entries.get(id).is_some_and(|e| e.data.is_some()) {
			if state.read_cache.contains_resident(id) {
				state.read_cache.touch(id);
			} else {
				// dirty entry carrying its own buffer but never admitted to
				// the read cache (e.g. just `markDirty`-ed): adopt it into
				// Am, the same slot a ghost hit would land in.
				let outcome = state.read_cache.admit_ghost_hit(id, &state.entries)?;
				self.apply_ghost_promotion(&mut state, outcome);
			}
			let entry = state.entries.get_mut(id).expect("checked contains above");
			entry.usage_counter += 1;
			return Ok(PageHandle { coordinator: self, id });
		}

		if state.read_cache.is_ghost(id) {
			let ptr = self.allocator.allocate()?;
			self.read_verified(id, unsafe { self.allocator.as_mut_slice(ptr) })?;
			let outcome = state.read_cache.admit_ghost_hit(id, &state.entries)?;
			self.apply_ghost_promotion(&mut state, outcome);

			let entry = state.entries.get_mut(id).expect("ghost entries stay in the table");
			entry.data = Some(ptr);
			entry.usage_counter += 1;
			return Ok(PageHandle { coordinator: self, id });
		}

		if state.entries.contains(id) {
			// reinstated from the WAL's dirty-pages table at openFile: known
			// identity, no buffer yet (lazy load).
			let ptr = self.allocator.allocate()?;
			self.read_verified(id, unsafe { self.allocator.as_mut_slice(ptr) })?;
			let outcome = state.read_cache.admit_ghost_hit(id, &state.entries)?;
			self.apply_ghost_promotion(&mut state, outcome);

			let entry = state.entries.get_mut(id).expect("just checked contains");
			entry.data = Some(ptr);
			entry.usage_counter += 1;
			return Ok(PageHandle { coordinator: self, id });
		}

		let ptr = self.allocator.allocate()?;
		self.read_verified(id, unsafe { self.allocator.as_mut_slice(ptr) })?;
		let mut entry = CacheEntry::new_resident(id, ptr, 0);
		entry.usage_counter += 1;
		state.entries.insert(entry);
		state.file_pages.entry(id.file_id).or_default().insert(id.page_index);

		let outcome = state.read_cache.admit_new(id, &state.entries)?;
		if let Admission::New {
			evicted_to_ghost,
			dropped_ghost,
		} = outcome
		{
			if let Some(evicted) = evicted_to_ghost {
				self.free_buffer_unless_in_write_cache(&mut state, evicted);
			}
			if let Some(dropped) = dropped_ghost {
				self.forget_ghost(&mut state, dropped);
			}
		}

		Ok(PageHandle { coordinator: self, id })
	}

	/// Drops `id`'s entry once its ghost identity has fallen out of A1out
	/// entirely. If `id` is still write-cache-resident, the entry (and its
	/// buffer) must be kept regardless: the WriteCache remains the
	/// authority for it, and `flush_group` needs `entries` to find its
	/// buffer. Otherwise the buffer (if any) is freed and the entry dropped.
	fn forget_ghost(&self, state: &mut CoordinatorState, id: PageId) {
		if state.entries.get(id).is_some_and(|e| e.in_write_cache) {
			return;
		}
		if let Some(entry) = state.entries.remove(id) {
			if let Some(ptr) = entry.data {
				unsafe { self.allocator.free(ptr) };
			}
		}
		if let Some(pages) = state.file_pages.get_mut(&id.file_id) {
			pages.remove(&id.page_index);
		}
		state.prune_page_lock_if_untracked(id);
	}

	fn apply_ghost_promotion(&self, state: &mut CoordinatorState, outcome: Admission) {
		if let Admission::GhostPromotion { evicted_from_am } = outcome {
			if let Some(evicted) = evicted_from_am {
				self.free_buffer_unless_in_write_cache(state, evicted);
			}
		}
	}

	fn free_buffer_unless_in_write_cache(&self, state: &mut CoordinatorState, id: PageId) {
		if let Some(entry) = state.entries.get_mut(id) {
			if !entry.in_write_cache {
				if let Some(ptr) = entry.data.take() {
					unsafe { self.allocator.free(ptr) };
				}
			}
			state.prune_page_lock_if_untracked(id);
		}
	}

	fn read_verified(&self, id: PageId, buf: &mut [u8]) -> Result<(), CacheError> {
		self.store.read(id, buf)?;
		if buf.len() >= PAGE_HEADER_SIZE && buf.iter().any(|&b| b != 0) {
			if let Err(err) = page_header::verify(buf) {
				log::error!("corrupt page {id}: {err:?}");
			}
		}
		Ok(())
	}

	pub(crate) fn release(&self, id: PageId) -> Result<(), CacheError> {
		let mut state = self.state.lock();
		let entry = state.entries.get_mut(id).ok_or(CacheError::NotInCache(id))?;
		if entry.usage_counter == 0 {
			return Err(CacheError::IllegalState("release called without a matching load"));
		}
		entry.usage_counter -= 1;
		Ok(())
	}

	/// Marks `id` dirty. `id` must already be known to the cache — via a
	/// prior `load` or the dirty-pages table seeded at `openFile` — or this
	/// is a caller contract violation reported as `NotInCache`. Allocates
	/// and reads `id`'s buffer first if it is only a ghost. Blocks while
	/// `write_queue_length` is exceeded and `id` is not already dirty; if the
	/// hard `maxSize / 16` write-cache cap (P4) is reached first, flushes the
	/// oldest group to make room instead of just waiting on it.
	pub fn mark_dirty(&self, id: PageId) -> Result<(), CacheError> {
		loop {
			let mut state = self.state.lock();
			self.ensure_open(&state, id.file_id)?;

			if !state.entries.contains(id) {
				return Err(CacheError::NotInCache(id));
			}

			if !state.write_cache.contains(id) && state.write_cache.is_at_capacity() {
				drop(state);
				if !self.relieve_write_cache_pressure()? {
					thread::sleep(Duration::from_millis(10));
				}
				continue;
			}

			if !state.write_cache.contains(id) && state.write_cache.len() >= self.config.write_queue_length {
				drop(state);
				thread::sleep(Duration::from_millis(10));
				continue;
			}

			if state.entries.get(id).is_some_and(|e| e.data.is_some()) {
				let lsn = self.wal.next_lsn()?;
				self.wal.register_dirty(id, lsn)?;
				let entry = state.entries.get_mut(id).expect("just checked contains");
				entry.mark_dirty_now(lsn);
				state.write_cache.mark_dirty(id, lsn);
				return Ok(());
			}

			// a ghost (ReadCache A1out) or lazily-reinstated entry: needs a
			// buffer before it can be dirtied.
			let ptr = self.allocator.allocate()?;
			self.read_verified(id, unsafe { self.allocator.as_mut_slice(ptr) })?;

			let lsn = self.wal.next_lsn()?;
			self.wal.register_dirty(id, lsn)?;
			let entry = state.entries.get_mut(id).expect("just checked contains");
			entry.data = Some(ptr);
			entry.mark_dirty_now(lsn);
			state.write_cache.mark_dirty(id, lsn);
			return Ok(());
		}
	}

	// ---- flushing -----------------------------------------------------

	pub fn flush_file(&self, file_id: u64, sync: bool) -> Result<(), CacheError> {
		let groups = {
			let state = self.state.lock();
			self.ensure_open(&state, file_id)?;
			state.write_cache.write_groups().into_iter().filter(|g| g.id.file_id == file_id).collect::<Vec<_>>()
		};

		for group in groups {
			self.flush_group(&group.pages)?;
		}
		if sync {
			self.store.sync(file_id)?;
		}
		Ok(())
	}

	pub fn flush_buffer(&self) -> Result<(), CacheError> {
		let file_ids: Vec<u64> = self.state.lock().files.keys().copied().collect();
		for file_id in file_ids {
			self.flush_file(file_id, self.config.sync_on_page_flush)?;
		}
		Ok(())
	}

	/// Flushes every group whose oldest dirty entry has aged past the
	/// hysteresis window, skipping (not aborting on) groups containing a
	/// pinned page.
	fn flush_cold_groups(&self) -> Result<(), CacheError> {
		let groups = {
			let state = self.state.lock();
			state.write_cache.write_groups()
		};

		for group in groups {
			let is_cold = {
				let state = self.state.lock();
				match state.write_cache.group_oldest_since(&group) {
					Some(since) => since.elapsed() >= FLUSH_HYSTERESIS,
					None => false,
				}
			};
			if !is_cold {
				continue;
			}
			match self.flush_group(&group.pages) {
				Ok(()) => {}
				Err(CacheError::BlockedPage(_)) => continue,
				Err(err) => return Err(err),
			}
		}
		Ok(())
	}

	/// Flushes the longest-waiting write group to bring the dirty page count
	/// back under the `maxSize / 16` cap. Returns `false` if the only
	/// candidate group is blocked by a pinned page, so the caller should
	/// back off and retry rather than treat this as fatal.
	fn relieve_write_cache_pressure(&self) -> Result<bool, CacheError> {
		let oldest = {
			let state = self.state.lock();
			state
				.write_cache
				.write_groups()
				.into_iter()
				.min_by_key(|g| state.write_cache.group_oldest_since(g))
		};
		let Some(group) = oldest else {
			return Ok(false);
		};
		match self.flush_group(&group.pages) {
			Ok(()) => Ok(true),
			Err(CacheError::BlockedPage(_)) => Ok(false),
			Err(err) => Err(err),
		}
	}

	/// Flushes one write-group: acquires per-page write locks in ascending
	/// order, aborts the whole group on any pinned page, then writes each
	/// page back respecting WAL-before-data ordering.
	fn flush_group(&self, pages: &[PageId]) -> Result<(), CacheError> {
		let mut sorted = pages.to_vec();
		sorted.sort();

		let mut state = self.state.lock();
		let mut locks = Vec::with_capacity(sorted.len());
		for &id in &sorted {
			locks.push((id, state.page_lock(id)));
		}
		let mut guards = Vec::with_capacity(locks.len());
		for (id, lock) in &locks {
			if state.entries.get(*id).is_some_and(|e| e.is_pinned()) {
				return Err(CacheError::BlockedPage(*id));
			}
			guards.push(lock.write());
		}

		for &id in &sorted {
			let Some(lsn) = state.write_cache.lsn_of(id) else {
				continue;
			};
			self.wal.flush_until(lsn)?;

			let Some(entry) = state.entries.get(id) else { continue };
			let Some(ptr) = entry.data else { continue };
			let buf = unsafe { self.allocator.as_mut_slice(ptr) };
			page_header::stamp(buf);
			self.store.write(id, buf)?;

			state.write_cache.remove(id);
			if let Some(entry) = state.entries.get_mut(id) {
				entry.clear_dirty();
			}
			if !state.read_cache.contains_resident(id) {
				if let Some(entry) = state.entries.remove(id) {
					if let Some(ptr) = entry.data {
						unsafe { self.allocator.free(ptr) };
					}
				}
			}
			state.prune_page_lock_if_untracked(id);
		}

		drop(guards);
		Ok(())
	}

	pub fn force_sync_stored_changes(&self) -> Result<(), CacheError> {
		let file_ids: Vec<u64> = self.state.lock().files.keys().copied().collect();
		for file_id in file_ids {
			self.store.sync(file_id)?;
		}
		Ok(())
	}

	/// Verifies the magic number and CRC32 of every page of every open
	/// file, reporting progress at least once per scan and returning a
	/// report for each corrupt page found. I/O failures during the scan are
	/// folded into the report rather than aborting it.
	pub fn check_stored_pages(&self, listener: &dyn ProgressListener) -> Result<Vec<CorruptionReport>, CacheError> {
		let (file_ids, page_size) = {
			let state = self.state.lock();
			(state.files.keys().copied().collect::<Vec<_>>(), self.allocator.page_size())
		};

		let mut reports = Vec::new();
		let total: u64 = file_ids
			.iter()
			.filter_map(|&f| self.store.filled_up_to(f).ok())
			.sum();
		let mut checked = 0u64;

		for file_id in file_ids {
			let Ok(filled) = self.store.filled_up_to(file_id) else {
				reports.push(CorruptionReport {
					file_id,
					page_id: PageId::new(file_id, 0),
					kind: CorruptionKind::Io,
				});
				continue;
			};

			let mut buf = vec![0u8; page_size];
			for page_index in 0..filled {
				let id = PageId::new(file_id, page_index);
				match self.store.read(id, &mut buf) {
					Ok(()) => match page_header::verify(&buf) {
						Ok(()) => {}
						Err(crate::page_header::IntegrityError::MagicMismatch) => reports.push(CorruptionReport {
							file_id,
							page_id: id,
							kind: CorruptionKind::MagicMismatch,
						}),
						Err(crate::page_header::IntegrityError::CrcMismatch) => reports.push(CorruptionReport {
							file_id,
							page_id: id,
							kind: CorruptionKind::CrcMismatch,
						}),
					},
					Err(_) => reports.push(CorruptionReport {
						file_id,
						page_id: id,
						kind: CorruptionKind::Io,
					}),
				}
				checked += 1;
				listener.on_progress(checked, total);
			}
		}
		Ok(reports)
	}

	pub fn close(&self) -> Result<(), CacheError> {
		self.stop_flush();
		self.flush_buffer()?;

		let file_ids: Vec<u64> = self.state.lock().files.keys().copied().collect();
		for file_id in file_ids {
			self.close_file(file_id, false)?;
		}
		let mut state = self.state.lock();
		state.entries = EntryTable::new();
		state.write_cache.clear();
		Ok(())
	}
}

/// A pinned handle to a loaded page's buffer. Dropping it does not release
/// the pin: callers must call [`CacheCoordinator::release`] explicitly, in
/// keeping with the paired `load`/`release` contract this cache exposes.
pub struct PageHandle<'a, F: FileManagerApi, W: WalApi> {
	coordinator: &'a CacheCoordinator<F, W>,
	id: PageId,
}

impl<'a, F: FileManagerApi + 'static, W: WalApi + 'static> PageHandle<'a, F, W> {
	pub fn id(&self) -> PageId {
		self.id
	}

	pub fn release(self) -> Result<(), CacheError> {
		self.coordinator.release(self.id)
	}

	/// # Safety
	///
	/// The caller must not retain the returned slice past the matching
	/// `release`, and must not read outside of an active pin.
	pub unsafe fn as_slice(&self) -> &[u8] {
		let state = self.coordinator.state.lock();
		let ptr = state.entries.get(self.id).and_then(|e| e.data).expect("handle implies residency");
		self.coordinator.allocator.as_slice(ptr)
	}

	/// # Safety
	///
	/// The caller must not retain the returned slice past the matching
	/// `release`, must hold exclusive access, and must call
	/// [`CacheCoordinator::mark_dirty`] after mutating.
	pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
		let state = self.coordinator.state.lock();
		let ptr = state.entries.get(self.id).and_then(|e| e.data).expect("handle implies residency");
		self.coordinator.allocator.as_mut_slice(ptr)
	}
}
