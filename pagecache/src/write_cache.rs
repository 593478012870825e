use std::{
	collections::{BTreeMap, BTreeSet},
	time::Instant,
};

use crate::{
	consts::DEFAULT_WRITE_GROUP_SIZE,
	id::{PageId, WriteGroupId},
};

#[derive(Debug, Clone, Copy)]
struct DirtyMeta {
	lsn: u64,
	/// When this page was *first* dirtied since its last flush; used for the
	/// flusher's hysteresis window. Not updated by re-marking.
	since: Instant,
}

/// A contiguous run of dirty pages belonging to one file, chunked by
/// `group_size`. Flushing groups instead of individual pages keeps writes to
/// a file roughly sequential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteGroup {
	pub id: WriteGroupId,
	pub pages: Vec<PageId>,
}

/// Write-ordered dirty-page set (WoW): every page marked dirty is kept in a
/// map ordered by `PageId`, which (since `PageId`'s `Ord` sorts by
/// `(file_id, page_index)`) clusters pages belonging to the same write group
/// together without a separate index. Iteration order is insertion-order
/// *within identity order*, which is what the background flusher walks.
#[derive(Debug)]
pub(crate) struct WriteCache {
	group_size: u64,
	/// `maxSize / 16` page budget (spec §4.3/P4): the hard cap on dirty page
	/// count, distinct from `write_queue_length`'s softer backpressure knob.
	capacity: usize,
	dirty: BTreeMap<PageId, DirtyMeta>,
}

impl WriteCache {
	/// `capacity` is the write cache's share of `maxSize` (`maxSize / 16`,
	/// per the capacity split the coordinator applies).
	pub fn new(capacity: usize) -> Self {
		Self {
			group_size: DEFAULT_WRITE_GROUP_SIZE,
			capacity,
			dirty: BTreeMap::new(),
		}
	}

	#[cfg(test)]
	pub fn with_group_size(group_size: u64) -> Self {
		Self {
			group_size,
			capacity: usize::MAX,
			dirty: BTreeMap::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.dirty.len()
	}

	pub fn is_empty(&self) -> bool {
		self.dirty.is_empty()
	}

	/// Whether admitting one more never-before-dirty page would exceed the
	/// `maxSize / 16` cap (spec §4.3/P4).
	pub fn is_at_capacity(&self) -> bool {
		self.dirty.len() >= self.capacity
	}

	pub fn contains(&self, id: PageId) -> bool {
		self.dirty.contains_key(&id)
	}

	/// Records `id` as dirty at `lsn`. If already present, the LSN is bumped
	/// only forward: a page re-dirtied after a partial flush must not regress
	/// to an older WAL watermark. The hysteresis timestamp is set only on
	/// first insertion.
	pub fn mark_dirty(&mut self, id: PageId, lsn: u64) {
		self.dirty
			.entry(id)
			.and_modify(|meta| meta.lsn = meta.lsn.max(lsn))
			.or_insert(DirtyMeta {
				lsn,
				since: Instant::now(),
			});
	}

	/// Drops `id` from the dirty set without writing it back (used when a
	/// page is deleted or a file is truncated past it).
	pub fn remove(&mut self, id: PageId) -> Option<u64> {
		self.dirty.remove(&id).map(|meta| meta.lsn)
	}

	pub fn lsn_of(&self, id: PageId) -> Option<u64> {
		self.dirty.get(&id).map(|meta| meta.lsn)
	}

	/// Removes and returns every dirty page belonging to `file_id`, in
	/// ascending `page_index` order. Used by `flushFile`.
	pub fn drain_file(&mut self, file_id: u64) -> Vec<(PageId, u64)> {
		let ids: Vec<PageId> = self
			.dirty
			.range(PageId::new(file_id, 0)..PageId::new(file_id + 1, 0))
			.map(|(&id, _)| id)
			.collect();
		ids.into_iter()
			.map(|id| (id, self.dirty.remove(&id).expect("id came from the map").lsn))
			.collect()
	}

	pub fn clear(&mut self) {
		self.dirty.clear();
	}

	/// The highest LSN any currently-dirty page was last marked at. The WAL
	/// must be durable up to this point before any of these pages may be
	/// written back.
	pub fn max_dirty_lsn(&self) -> Option<u64> {
		self.dirty.values().map(|meta| meta.lsn).max()
	}

	/// Buckets the current dirty set into write groups in ascending order,
	/// ready for the flusher to pick up.
	pub fn write_groups(&self) -> Vec<WriteGroup> {
		let mut groups: BTreeMap<WriteGroupId, Vec<PageId>> = BTreeMap::new();
		for &id in self.dirty.keys() {
			groups.entry(id.group(self.group_size)).or_default().push(id);
		}
		groups
			.into_iter()
			.map(|(id, pages)| WriteGroup { id, pages })
			.collect()
	}

	/// The oldest `since` timestamp among a group's member pages, i.e. how
	/// long the group's longest-dirty page has been waiting for a flush.
	pub fn group_oldest_since(&self, group: &WriteGroup) -> Option<Instant> {
		group.pages.iter().filter_map(|id| self.dirty.get(id)).map(|m| m.since).min()
	}

	/// The distinct set of dirty page ids, used to answer `fillDirtyPages`
	/// and to build the WAL's dirty-pages-table checkpoint record.
	pub fn dirty_page_ids(&self) -> BTreeSet<PageId> {
		self.dirty.keys().copied().collect()
	}
}
