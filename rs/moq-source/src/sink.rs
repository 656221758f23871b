/// One decoded picture, packed RGBA.
///
/// The buffer belongs to the pipeline and is overwritten by the next picture, so it is only
/// borrowed for the duration of [FrameSink::output].
#[derive(Debug, Clone, Copy)]
pub struct OutputFrame<'a> {
	pub data: &'a [u8],
	pub width: u32,
	pub height: u32,
	/// Bytes per row.
	pub stride: usize,
	pub timestamp_us: u64,
}

/// The host surface that shows decoded video.
///
/// Called from whichever thread delivered the event, possibly with the session lock held.
/// Implementations must be cheap and must never call back into the [crate::SessionManager].
pub trait FrameSink: Send + Sync {
	fn output(&self, frame: &OutputFrame<'_>);

	/// Show nothing until the next [FrameSink::output].
	fn blank(&self);
}
