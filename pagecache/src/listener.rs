/// Progress reporting for long-running page scans. `check_stored_pages`
/// calls [`Self::on_progress`] at minimum every 5 seconds so a caller can
/// surface scan progress without the cache depending on a concrete
/// telemetry backend.
pub trait ProgressListener: Send + Sync {
	/// `pages_checked` out of `pages_total` pages have been scanned so far.
	fn on_progress(&self, pages_checked: u64, pages_total: u64);
}

/// A listener that discards progress reports, for callers that don't care.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressListener;

impl ProgressListener for NullProgressListener {
	fn on_progress(&self, _pages_checked: u64, _pages_total: u64) {}
}
