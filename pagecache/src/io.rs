use std::{fs::File, io, ops::Range};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Minimal positional-I/O contract a [`PageStore`](crate::page_store::PageStore)
/// needs from its underlying file manager. Reading past the high-water mark
/// yields zeros rather than an error; writing past it grows the target.
pub(crate) trait IoTarget {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

	fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

	fn set_len(&mut self, len: u64) -> io::Result<()>;

	fn len(&self) -> io::Result<u64>;

	fn sync_all(&self) -> io::Result<()>;
}

pub(crate) fn get_buf_range(len: usize, buf_len: usize, offset: u64) -> Range<usize> {
	if offset >= len as u64 {
		return 0..0;
	}
	let start = offset as usize;
	start..usize::min(start + buf_len, len)
}

#[cfg(unix)]
impl IoTarget for File {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
		let file_len = self.metadata()?.len();
		let range = get_buf_range(file_len as usize, buf.len(), offset);
		buf.fill(0);
		if range.is_empty() {
			return Ok(buf.len());
		}
		let num_read = FileExt::read_at(self, &mut buf[..range.len()], offset)?;
		Ok(usize::max(num_read, buf.len().min(range.len())))
	}

	fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
		FileExt::write_at(self, buf, offset)
	}

	fn set_len(&mut self, len: u64) -> io::Result<()> {
		File::set_len(self, len)
	}

	fn len(&self) -> io::Result<u64> {
		Ok(self.metadata()?.len())
	}

	fn sync_all(&self) -> io::Result<()> {
		File::sync_all(self)
	}
}

#[cfg(windows)]
impl IoTarget for File {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
		let file_len = self.metadata()?.len();
		let range = get_buf_range(file_len as usize, buf.len(), offset);
		buf.fill(0);
		if range.is_empty() {
			return Ok(buf.len());
		}
		let num_read = FileExt::seek_read(self, &mut buf[..range.len()], offset)?;
		Ok(usize::max(num_read, buf.len().min(range.len())))
	}

	fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
		FileExt::seek_write(self, buf, offset)
	}

	fn set_len(&mut self, len: u64) -> io::Result<()> {
		File::set_len(self, len)
	}

	fn len(&self) -> io::Result<u64> {
		Ok(self.metadata()?.len())
	}

	fn sync_all(&self) -> io::Result<()> {
		File::sync_all(self)
	}
}

#[cfg(test)]
mod tests {
	use std::{fs::OpenOptions, io::Write};

	use super::*;

	fn rw_file(path: &std::path::Path) -> File {
		OpenOptions::new().read(true).write(true).create(true).open(path).unwrap()
	}

	#[test]
	fn buf_range_clamps_to_target_length() {
		assert_eq!(get_buf_range(10, 8, 5), 5..10);
		assert_eq!(get_buf_range(10, 8, 20), 0..0);
		assert_eq!(get_buf_range(10, 4, 0), 0..4);
	}

	#[test]
	fn read_at_past_the_file_end_zero_fills_the_whole_buffer() {
		let dir = tempfile::tempdir().unwrap();
		let file = rw_file(&dir.path().join("f"));
		file.set_len(4).unwrap();

		let mut buf = [0xffu8; 8];
		let n = IoTarget::read_at(&file, &mut buf, 0).unwrap();
		assert_eq!(n, 8);
		assert_eq!(buf, [0u8; 8]);
	}

	#[test]
	fn read_at_partially_past_the_file_end_zero_fills_the_tail() {
		let dir = tempfile::tempdir().unwrap();
		let mut file = rw_file(&dir.path().join("f"));
		file.write_all(&[1, 2, 3, 4]).unwrap();

		let mut buf = [0xffu8; 8];
		let n = IoTarget::read_at(&file, &mut buf, 0).unwrap();
		assert_eq!(n, 8);
		assert_eq!(buf, [1, 2, 3, 4, 0, 0, 0, 0]);
	}
}
