use std::{
	collections::HashMap,
	fs::{self, File, OpenOptions},
	path::{Path, PathBuf},
	thread,
	time::Duration,
};

use fs2::FileExt as _;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use static_assertions::assert_impl_all;

use crate::{error::PageStoreError, id::PageId, io::IoTarget};

const RENAME_RETRY_ATTEMPTS: u32 = 5;
const RENAME_RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Uniform handle over the file manager, mocked in coordinator tests the
/// same way the teacher mocks `StorageApi`.
#[cfg_attr(test, automock)]
pub trait FileManagerApi: Send + Sync {
	fn page_size(&self) -> usize;
	fn is_open(&self, file_id: u64) -> bool;
	fn exists(&self, file_id: u64) -> bool;
	fn open(&self, file_id: u64) -> Result<bool, PageStoreError>;
	fn close(&self, file_id: u64) -> Result<(), PageStoreError>;
	fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), PageStoreError>;
	fn write(&self, id: PageId, buf: &[u8]) -> Result<(), PageStoreError>;
	fn filled_up_to(&self, file_id: u64) -> Result<u64, PageStoreError>;
	fn shrink(&self, file_id: u64, num_pages: u64) -> Result<(), PageStoreError>;
	fn sync(&self, file_id: u64) -> Result<(), PageStoreError>;
	fn rename(&self, old_id: u64, new_id: u64) -> Result<(), PageStoreError>;
	fn delete(&self, file_id: u64) -> Result<(), PageStoreError>;
}

/// File-naming convention for the directory a [`PageStore`] manages. Each
/// logical file gets a data file and a marker file that exists only while
/// the data file is open; its absence on the next `open` is read as a clean
/// shutdown (soft-close).
struct PageStoreDir {
	path: PathBuf,
}

impl PageStoreDir {
	fn new(path: PathBuf) -> Self {
		Self { path }
	}

	fn data_file(&self, file_id: u64) -> PathBuf {
		self.path.join(format!("{file_id}.pgc"))
	}

	fn marker_file(&self, file_id: u64) -> PathBuf {
		self.path.join(format!("{file_id}.pgc.open"))
	}
}

struct OpenFile {
	handle: File,
}

/// The disk-backed file manager underlying the cache: one data file per
/// `file_id`, addressed by fixed-size pages. Positional reads past the
/// current length are zero-filled rather than erroring (see [`IoTarget`]).
pub struct PageStore {
	dir: PageStoreDir,
	page_size: usize,
	file_lock: bool,
	files: RwLock<HashMap<u64, OpenFile>>,
}

assert_impl_all!(PageStore: Send, Sync);

impl PageStore {
	/// `file_lock` controls whether an OS-level advisory exclusive lock is
	/// taken on each data file while it is open, guarding against two
	/// processes managing the same directory at once. Off in tests so
	/// multiple stores can share a directory.
	pub fn new(root: impl AsRef<Path>, page_size: usize, file_lock: bool) -> Self {
		Self {
			dir: PageStoreDir::new(root.as_ref().into()),
			page_size,
			file_lock,
			files: RwLock::new(HashMap::new()),
		}
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn is_open(&self, file_id: u64) -> bool {
		self.files.read().contains_key(&file_id)
	}

	pub fn exists(&self, file_id: u64) -> bool {
		self.dir.data_file(file_id).exists()
	}

	/// Returns whether the data file's marker was still present before this
	/// open call, i.e. the previous session did not close it cleanly.
	pub fn open(&self, file_id: u64) -> Result<bool, PageStoreError> {
		if self.is_open(file_id) {
			return Ok(false);
		}
		let unclean = self.dir.marker_file(file_id).exists();

		let handle = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(self.dir.data_file(file_id))
			.map_err(|e| PageStoreError::Open(file_id, e))?;
		if self.file_lock {
			handle.try_lock_exclusive().map_err(|e| PageStoreError::Locked(file_id, e))?;
		}
		fs::write(self.dir.marker_file(file_id), []).map_err(|e| PageStoreError::Open(file_id, e))?;

		self.files.write().insert(file_id, OpenFile { handle });
		Ok(unclean)
	}

	/// Flushes and closes `file_id`, removing its open-marker (clean
	/// soft-close).
	pub fn close(&self, file_id: u64) -> Result<(), PageStoreError> {
		let mut files = self.files.write();
		let Some(open) = files.get(&file_id) else {
			return Err(PageStoreError::NotOpen(file_id));
		};
		IoTarget::sync_all(&open.handle).map_err(|e| PageStoreError::Sync(file_id, e))?;
		files.remove(&file_id);
		let _ = fs::remove_file(self.dir.marker_file(file_id));
		Ok(())
	}

	pub fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), PageStoreError> {
		let files = self.files.read();
		let open = files.get(&id.file_id).ok_or(PageStoreError::NotOpen(id.file_id))?;
		open.handle
			.read_at(buf, id.page_index * self.page_size as u64)
			.map_err(|e| PageStoreError::Read(id, e))?;
		Ok(())
	}

	pub fn write(&self, id: PageId, buf: &[u8]) -> Result<(), PageStoreError> {
		let mut files = self.files.write();
		let open = files.get_mut(&id.file_id).ok_or(PageStoreError::NotOpen(id.file_id))?;
		open.handle
			.write_at(buf, id.page_index * self.page_size as u64)
			.map_err(|e| PageStoreError::Write(id, e))?;
		Ok(())
	}

	/// Number of whole pages currently stored in `file_id`.
	pub fn filled_up_to(&self, file_id: u64) -> Result<u64, PageStoreError> {
		let files = self.files.read();
		let open = files.get(&file_id).ok_or(PageStoreError::NotOpen(file_id))?;
		let len = IoTarget::len(&open.handle).map_err(|e| PageStoreError::Read(PageId::new(file_id, 0), e))?;
		Ok(len / self.page_size as u64)
	}

	/// Truncates `file_id` to exactly `num_pages` pages.
	pub fn shrink(&self, file_id: u64, num_pages: u64) -> Result<(), PageStoreError> {
		let mut files = self.files.write();
		let open = files.get_mut(&file_id).ok_or(PageStoreError::NotOpen(file_id))?;
		open.handle
			.set_len(num_pages * self.page_size as u64)
			.map_err(|e| PageStoreError::Truncate(file_id, e))
	}

	pub fn sync(&self, file_id: u64) -> Result<(), PageStoreError> {
		let files = self.files.read();
		let open = files.get(&file_id).ok_or(PageStoreError::NotOpen(file_id))?;
		IoTarget::sync_all(&open.handle).map_err(|e| PageStoreError::Sync(file_id, e))
	}

	/// Renames the data file for `old_id` to `new_id` on disk. `old_id` must
	/// not be open. Retries with bounded exponential backoff on a transient
	/// OS failure (REDESIGN: bounded, not unbounded).
	pub fn rename(&self, old_id: u64, new_id: u64) -> Result<(), PageStoreError> {
		if self.is_open(old_id) {
			return Err(PageStoreError::NotOpen(old_id));
		}
		let from = self.dir.data_file(old_id);
		let to = self.dir.data_file(new_id);

		let mut attempt = 0;
		loop {
			match fs::rename(&from, &to) {
				Ok(()) => return Ok(()),
				Err(e) if attempt < RENAME_RETRY_ATTEMPTS && e.kind() == std::io::ErrorKind::Other => {
					thread::sleep(RENAME_RETRY_BASE_DELAY * 2u32.pow(attempt));
					attempt += 1;
				}
				Err(e) => return Err(PageStoreError::Rename(old_id, e)),
			}
		}
	}

	pub fn delete(&self, file_id: u64) -> Result<(), PageStoreError> {
		if self.is_open(file_id) {
			self.close(file_id)?;
		}
		let _ = fs::remove_file(self.dir.marker_file(file_id));
		fs::remove_file(self.dir.data_file(file_id)).map_err(|e| PageStoreError::Delete(file_id, e))
	}
}

impl FileManagerApi for PageStore {
	fn page_size(&self) -> usize {
		PageStore::page_size(self)
	}

	fn is_open(&self, file_id: u64) -> bool {
		PageStore::is_open(self, file_id)
	}

	fn exists(&self, file_id: u64) -> bool {
		PageStore::exists(self, file_id)
	}

	fn open(&self, file_id: u64) -> Result<bool, PageStoreError> {
		PageStore::open(self, file_id)
	}

	fn close(&self, file_id: u64) -> Result<(), PageStoreError> {
		PageStore::close(self, file_id)
	}

	fn read(&self, id: PageId, buf: &mut [u8]) -> Result<(), PageStoreError> {
		PageStore::read(self, id, buf)
	}

	fn write(&self, id: PageId, buf: &[u8]) -> Result<(), PageStoreError> {
		PageStore::write(self, id, buf)
	}

	fn filled_up_to(&self, file_id: u64) -> Result<u64, PageStoreError> {
		PageStore::filled_up_to(self, file_id)
	}

	fn shrink(&self, file_id: u64, num_pages: u64) -> Result<(), PageStoreError> {
		PageStore::shrink(self, file_id, num_pages)
	}

	fn sync(&self, file_id: u64) -> Result<(), PageStoreError> {
		PageStore::sync(self, file_id)
	}

	fn rename(&self, old_id: u64, new_id: u64) -> Result<(), PageStoreError> {
		PageStore::rename(self, old_id, new_id)
	}

	fn delete(&self, file_id: u64) -> Result<(), PageStoreError> {
		PageStore::delete(self, file_id)
	}
}
