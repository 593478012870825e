use std::{collections::HashMap, time::Instant};

use crate::{direct_page::PagePtr, id::PageId};

/// Descriptor for one cached page. `data` is `None` for a ghost: an A1out
/// entry that still carries identity and LSN but has had its buffer
/// reclaimed.
#[derive(Debug)]
pub(crate) struct CacheEntry {
	pub id: PageId,
	pub data: Option<PagePtr>,
	pub usage_counter: u32,
	pub recently_changed: bool,
	pub in_write_cache: bool,
	pub lsn: u64,
	/// When `recently_changed` was last set; drives the flusher's hysteresis
	/// window. `None` whenever `recently_changed` is `false`.
	pub dirty_since: Option<Instant>,
}

impl CacheEntry {
	pub fn new_ghost(id: PageId, lsn: u64) -> Self {
		Self {
			id,
			data: None,
			usage_counter: 0,
			recently_changed: false,
			in_write_cache: false,
			lsn,
			dirty_since: None,
		}
	}

	pub fn new_resident(id: PageId, data: PagePtr, lsn: u64) -> Self {
		Self {
			id,
			data: Some(data),
			usage_counter: 0,
			recently_changed: false,
			in_write_cache: false,
			lsn,
			dirty_since: None,
		}
	}

	#[inline]
	pub fn is_pinned(&self) -> bool {
		self.usage_counter > 0
	}

	#[inline]
	pub fn is_ghost(&self) -> bool {
		self.data.is_none()
	}

	pub fn mark_dirty_now(&mut self, lsn: u64) {
		self.recently_changed = true;
		self.in_write_cache = true;
		self.lsn = lsn;
		self.dirty_since = Some(Instant::now());
	}

	pub fn clear_dirty(&mut self) {
		self.recently_changed = false;
		self.in_write_cache = false;
		self.dirty_since = None;
	}
}

/// The entry arena: every `CacheEntry` currently known to the cache, keyed
/// by its identity. `ReadCache`/`WriteCache` track membership by `PageId`
/// only and look the descriptor up here, so there is exactly one owner of
/// each entry (invariant 1).
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
	entries: HashMap<PageId, CacheEntry>,
}

impl EntryTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, id: PageId) -> Option<&CacheEntry> {
		self.entries.get(&id)
	}

	pub fn get_mut(&mut self, id: PageId) -> Option<&mut CacheEntry> {
		self.entries.get_mut(&id)
	}

	pub fn insert(&mut self, entry: CacheEntry) {
		self.entries.insert(entry.id, entry);
	}

	pub fn remove(&mut self, id: PageId) -> Option<CacheEntry> {
		self.entries.remove(&id)
	}

	pub fn contains(&self, id: PageId) -> bool {
		self.entries.contains_key(&id)
	}
}
