//! The publish/subscribe capability surface the client is built on.
//!
//! Resources are opaque [Id]s, created and closed explicitly. Long running requests
//! (session connect, catalog subscribe, track subscribe) report back through callbacks
//! invoked on the transport's own thread(s).
//!
//! Contract for implementations:
//! - A callback is never invoked from inside one of the trait methods, so callers may hold
//!   their own locks while calling in.
//! - Closing a resource stops its callbacks. A delivery already in progress may still
//!   arrive once; the final delivery for a closed subscription is `Err(Error::Closed)`.
//! - Callbacks for one subscription are delivered in order.

pub mod memory;

#[cfg(feature = "moq")]
pub mod moq;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::{EncodedFrame, Error, Id, Resource, VideoConfig};

/// Session status: `Ok(())` once connected, then an error when the session ends.
pub type OnStatus = Box<dyn FnMut(Result<(), Error>) + Send>;

/// A new catalog snapshot id for every catalog update.
pub type OnCatalog = Box<dyn FnMut(Result<Id, Error>) + Send>;

/// A new frame id for every frame, in order.
pub type OnFrame = Box<dyn FnMut(Result<Id, Error>) + Send>;

/// One chunk of a frame's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
	pub payload: Bytes,
	pub timestamp_us: u64,
	pub keyframe: bool,
}

pub trait Transport: Send + Sync {
	fn origin_create(&self) -> Result<Id, Error>;
	fn origin_close(&self, origin: Id) -> Result<(), Error>;

	/// Connect to `url`, resolving consumed broadcasts into `origin`.
	fn session_connect(&self, url: &Url, origin: Id, on_status: OnStatus) -> Result<Id, Error>;
	fn session_close(&self, session: Id) -> Result<(), Error>;

	/// Look up a broadcast by path within the origin.
	fn consume(&self, origin: Id, path: &str) -> Result<Id, Error>;
	fn consume_close(&self, broadcast: Id) -> Result<(), Error>;

	/// Follow the broadcast's catalog. Returns the subscription task.
	fn catalog_subscribe(&self, broadcast: Id, on_catalog: OnCatalog) -> Result<Id, Error>;
	fn catalog_subscribe_close(&self, task: Id) -> Result<(), Error>;

	/// Release one catalog snapshot delivered to [OnCatalog].
	fn catalog_close(&self, catalog: Id) -> Result<(), Error>;

	fn video_config(&self, catalog: Id, index: usize) -> Result<VideoConfig, Error>;

	/// Subscribe to the `index`th video rendition, buffering up to `latency` to absorb jitter.
	fn video_subscribe(&self, catalog: Id, index: usize, latency: Duration, on_frame: OnFrame) -> Result<Id, Error>;
	fn video_close(&self, track: Id) -> Result<(), Error>;

	/// Returns [Error::NoIndex] past the last chunk.
	fn frame_chunk(&self, frame: Id, index: usize) -> Result<FrameChunk, Error>;
	fn frame_close(&self, frame: Id) -> Result<(), Error>;

	fn close(&self, resource: Resource, id: Id) -> Result<(), Error> {
		match resource {
			Resource::Origin => self.origin_close(id),
			Resource::Session => self.session_close(id),
			Resource::Broadcast => self.consume_close(id),
			Resource::CatalogTask => self.catalog_subscribe_close(id),
			Resource::Catalog => self.catalog_close(id),
			Resource::Track => self.video_close(id),
			Resource::Frame => self.frame_close(id),
		}
	}
}

/// Read every chunk of a frame into one contiguous payload.
///
/// The common single chunk case is not copied.
pub fn read_frame(transport: &dyn Transport, frame: Id) -> Result<EncodedFrame, Error> {
	let first = transport.frame_chunk(frame, 0)?;
	let mut rest = Vec::new();

	for index in 1.. {
		match transport.frame_chunk(frame, index) {
			Ok(chunk) => rest.push(chunk.payload),
			Err(Error::NoIndex) => break,
			Err(err) => return Err(err),
		}
	}

	let payload = match rest.is_empty() {
		true => first.payload,
		false => {
			let size = first.payload.len() + rest.iter().map(Bytes::len).sum::<usize>();
			let mut payload = BytesMut::with_capacity(size);
			payload.extend_from_slice(&first.payload);
			for chunk in rest {
				payload.extend_from_slice(&chunk);
			}
			payload.freeze()
		}
	};

	Ok(EncodedFrame {
		payload,
		timestamp_us: first.timestamp_us,
		keyframe: first.keyframe,
	})
}
