use std::ops::RangeInclusive;

use thiserror::Error;

use crate::utils::units::*;

/// Big-endian system header magic number every page begins with.
pub const PAGE_MAGIC: u64 = 0xFACB_03FE;

/// Size in bytes of the magic + CRC header prefixed to every on-disk page.
pub const PAGE_HEADER_SIZE: usize = 12;

pub const DEFAULT_PAGE_SIZE: usize = 16 * KiB;
pub const PAGE_SIZE_RANGE: RangeInclusive<usize> = (512 * B)..=(64 * KiB);

/// Lower/upper bound on the number of pages the 2Q read cache may track.
pub const MIN_MAX_SIZE: usize = 16;
pub const MAX_MAX_SIZE: usize = i32::MAX as usize;

/// Share of `maxSize` reserved for the write cache; the remainder is the
/// read cache's operational budget.
pub const WRITE_CACHE_SHARE_DIVISOR: usize = 16;

/// Default number of consecutive pages grouped into one write-group.
pub const DEFAULT_WRITE_GROUP_SIZE: u64 = 16;

#[derive(Debug, Error)]
#[error(
	"Page size {0} is invalid; must be a power of two between {} and {}",
	display_size(*PAGE_SIZE_RANGE.start()),
	display_size(*PAGE_SIZE_RANGE.end())
)]
pub struct PageSizeBoundsError(pub usize);

#[inline]
pub fn validate_page_size(size: usize) -> Result<(), PageSizeBoundsError> {
	if size < PAGE_HEADER_SIZE || !size.is_power_of_two() || !PAGE_SIZE_RANGE.contains(&size) {
		return Err(PageSizeBoundsError(size));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_non_power_of_two() {
		assert!(validate_page_size(1000).is_err());
	}

	#[test]
	fn rejects_out_of_range() {
		assert!(validate_page_size(256).is_err());
		assert!(validate_page_size(128 * KiB).is_err());
	}

	#[test]
	fn accepts_default() {
		assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
	}
}
