use byte_view::{ByteView, ViewBuf};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::consts::{PAGE_HEADER_SIZE, PAGE_MAGIC};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The 12-byte system header every on-disk page begins with: an 8-byte
/// big-endian magic number followed by a 4-byte CRC32 of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ByteView)]
#[repr(C)]
pub(crate) struct PageHeader {
	magic: [u8; 8],
	crc: [u8; 4],
}

impl PageHeader {
	#[inline]
	fn magic(&self) -> u64 {
		u64::from_be_bytes(self.magic)
	}

	#[inline]
	fn crc(&self) -> u32 {
		u32::from_be_bytes(self.crc)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntegrityError {
	MagicMismatch,
	CrcMismatch,
}

/// Recomputes and writes the magic number and CRC32 for `page` in place.
/// `page` must be exactly one page in length.
pub(crate) fn stamp(page: &mut [u8]) {
	debug_assert!(page.len() >= PAGE_HEADER_SIZE);
	let crc = CRC32.checksum(&page[PAGE_HEADER_SIZE..]);
	let mut header: ViewBuf<PageHeader> = ViewBuf::new();
	*header = PageHeader {
		magic: PAGE_MAGIC.to_be_bytes(),
		crc: crc.to_be_bytes(),
	};
	page[..PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());
}

/// Verifies the magic number and CRC32 of `page`, returning the first
/// mismatch found, if any.
pub(crate) fn verify(page: &[u8]) -> Result<(), IntegrityError> {
	debug_assert!(page.len() >= PAGE_HEADER_SIZE);
	let header = PageHeader::from_bytes(&page[..PAGE_HEADER_SIZE]);
	if header.magic() != PAGE_MAGIC {
		return Err(IntegrityError::MagicMismatch);
	}
	let expected_crc = CRC32.checksum(&page[PAGE_HEADER_SIZE..]);
	if header.crc() != expected_crc {
		return Err(IntegrityError::CrcMismatch);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stamp_then_verify_round_trips() {
		let mut page = vec![0u8; 64];
		page[PAGE_HEADER_SIZE..].fill(0x42);
		stamp(&mut page);
		assert_eq!(verify(&page), Ok(()));
	}

	#[test]
	fn corrupting_payload_is_detected_as_crc_mismatch() {
		let mut page = vec![0u8; 64];
		page[PAGE_HEADER_SIZE..].fill(0x42);
		stamp(&mut page);
		page[PAGE_HEADER_SIZE] ^= 0xff;
		assert_eq!(verify(&page), Err(IntegrityError::CrcMismatch));
	}

	#[test]
	fn corrupting_header_is_detected_as_magic_mismatch() {
		let mut page = vec![0u8; 64];
		page[PAGE_HEADER_SIZE..].fill(0x42);
		stamp(&mut page);
		page[0] ^= 0xff;
		assert_eq!(verify(&page), Err(IntegrityError::MagicMismatch));
	}
}
