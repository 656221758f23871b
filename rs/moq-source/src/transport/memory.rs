//! A deterministic in-process [Transport].
//!
//! Nothing happens on its own: sessions complete, catalogs arrive and frames are pushed
//! only when the owner says so, on the owner's thread. That makes every race in the
//! client reproducible. Failures can be injected per operation, hooks can run inside an
//! operation, and every close is recorded in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use super::{FrameChunk, OnCatalog, OnFrame, OnStatus, Transport};
use crate::{EncodedFrame, Error, Id, NonZeroSlab, Resource, VideoConfig};

/// A transport operation that can be failed or hooked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
	OriginCreate,
	SessionConnect,
	Consume,
	CatalogSubscribe,
	VideoConfig,
	VideoSubscribe,
	FrameChunk,
}

type Slot<T> = Arc<Mutex<Box<dyn FnMut(Result<T, Error>) + Send>>>;
type Hook = Box<dyn FnOnce() + Send>;

struct Session {
	url: Url,
	origin: Id,
	on_status: Slot<()>,
}

struct CatalogTask {
	path: String,
	on_catalog: Slot<Id>,
}

struct Track {
	config: VideoConfig,
	latency: Duration,
	on_frame: Slot<Id>,
}

#[derive(Default)]
struct State {
	origins: NonZeroSlab<()>,
	sessions: NonZeroSlab<Session>,
	broadcasts: NonZeroSlab<String>,
	catalog_tasks: NonZeroSlab<CatalogTask>,
	catalogs: NonZeroSlab<Option<VideoConfig>>,
	tracks: NonZeroSlab<Track>,
	frames: NonZeroSlab<FrameChunk>,

	// Subscriptions closed by the client that still owe a final `Err(Closed)`.
	ended_status: Vec<Slot<()>>,
	ended: Vec<Slot<Id>>,

	failures: HashMap<Op, Error>,
	close_failures: HashSet<Resource>,
	hooks: HashMap<Op, Hook>,

	calls: Vec<Op>,
	closed: Vec<(Resource, Id)>,
}

#[derive(Default)]
pub struct MemoryTransport {
	state: Mutex<State>,
}

impl MemoryTransport {
	pub fn new() -> Self {
		Self::default()
	}

	/// Fail the next call of `op` with `err`.
	pub fn fail(&self, op: Op, err: Error) {
		self.state.lock().failures.insert(op, err);
	}

	/// Fail the next close of any `resource`. The resource is released anyway.
	pub fn fail_close(&self, resource: Resource) {
		self.state.lock().close_failures.insert(resource);
	}

	/// Run `hook` at the start of the next call of `op`, before it takes effect.
	pub fn before(&self, op: Op, hook: impl FnOnce() + Send + 'static) {
		self.state.lock().hooks.insert(op, Box::new(hook));
	}

	/// Every operation called so far, in order.
	pub fn calls(&self) -> Vec<Op> {
		self.state.lock().calls.clone()
	}

	/// Every resource closed so far, in order.
	pub fn closed(&self) -> Vec<(Resource, Id)> {
		self.state.lock().closed.clone()
	}

	pub fn is_open(&self, resource: Resource, id: Id) -> bool {
		let state = self.state.lock();
		match resource {
			Resource::Origin => state.origins.contains(id),
			Resource::Session => state.sessions.contains(id),
			Resource::Broadcast => state.broadcasts.contains(id),
			Resource::CatalogTask => state.catalog_tasks.contains(id),
			Resource::Catalog => state.catalogs.contains(id),
			Resource::Track => state.tracks.contains(id),
			Resource::Frame => state.frames.contains(id),
		}
	}

	/// The ids of every open resource of one kind, oldest slot first.
	pub fn open(&self, resource: Resource) -> Vec<Id> {
		let state = self.state.lock();
		match resource {
			Resource::Origin => state.origins.iter().map(|(id, _)| id).collect(),
			Resource::Session => state.sessions.iter().map(|(id, _)| id).collect(),
			Resource::Broadcast => state.broadcasts.iter().map(|(id, _)| id).collect(),
			Resource::CatalogTask => state.catalog_tasks.iter().map(|(id, _)| id).collect(),
			Resource::Catalog => state.catalogs.iter().map(|(id, _)| id).collect(),
			Resource::Track => state.tracks.iter().map(|(id, _)| id).collect(),
			Resource::Frame => state.frames.iter().map(|(id, _)| id).collect(),
		}
	}

	/// The URL and origin a session was connected with.
	pub fn session_info(&self, session: Id) -> Option<(Url, Id)> {
		let state = self.state.lock();
		let session = state.sessions.get(session)?;
		Some((session.url.clone(), session.origin))
	}

	/// The buffering latency a track was subscribed with.
	pub fn track_latency(&self, track: Id) -> Option<Duration> {
		Some(self.state.lock().tracks.get(track)?.latency)
	}

	pub fn track_config(&self, track: Id) -> Option<VideoConfig> {
		Some(self.state.lock().tracks.get(track)?.config.clone())
	}

	/// Report a connect result (or a later session failure). Returns false if the session was closed.
	pub fn complete_session(&self, session: Id, result: Result<(), Error>) -> bool {
		let slot = match self.state.lock().sessions.get(session) {
			Some(session) => session.on_status.clone(),
			None => return false,
		};

		call(&slot, result);
		true
	}

	/// Publish a catalog update to every subscription of `path`.
	///
	/// `None` models a catalog without a video track. Returns the delivered snapshot ids.
	pub fn publish_catalog(&self, path: &str, video: Option<VideoConfig>) -> Vec<Id> {
		let mut deliveries = Vec::new();
		{
			let mut state = self.state.lock();
			let slots: Vec<_> = state
				.catalog_tasks
				.iter()
				.filter(|(_, task)| task.path == path)
				.map(|(_, task)| task.on_catalog.clone())
				.collect();

			for slot in slots {
				match state.catalogs.insert(video.clone()) {
					Ok(id) => deliveries.push((id, slot)),
					Err(err) => tracing::warn!(%err, "failed to allocate catalog"),
				}
			}
		}

		for (id, slot) in &deliveries {
			call(&slot, Ok(*id));
		}

		deliveries.into_iter().map(|(id, _)| id).collect()
	}

	/// End a catalog subscription with `err`, as if the broadcast went away.
	pub fn fail_catalog(&self, task: Id, err: Error) -> bool {
		let slot = match self.state.lock().catalog_tasks.remove(task) {
			Some(task) => task.on_catalog,
			None => return false,
		};

		call(&slot, Err(err));
		true
	}

	/// Deliver a frame to one track. Returns the frame id, or `None` if the track is closed.
	pub fn push_frame_to(&self, track: Id, frame: EncodedFrame) -> Option<Id> {
		let (id, slot) = {
			let mut state = self.state.lock();
			let slot = state.tracks.get(track)?.on_frame.clone();
			let id = state
				.frames
				.insert(FrameChunk {
					payload: frame.payload,
					timestamp_us: frame.timestamp_us,
					keyframe: frame.keyframe,
				})
				.ok()?;
			(id, slot)
		};

		call(&slot, Ok(id));
		Some(id)
	}

	/// Deliver a frame to every open track.
	pub fn push_frame(&self, frame: EncodedFrame) -> Vec<Id> {
		self.open(Resource::Track)
			.into_iter()
			.filter_map(|track| self.push_frame_to(track, frame.clone()))
			.collect()
	}

	/// End a track subscription with `err`.
	pub fn fail_track(&self, track: Id, err: Error) -> bool {
		let slot = match self.state.lock().tracks.remove(track) {
			Some(track) => track.on_frame,
			None => return false,
		};

		call(&slot, Err(err));
		true
	}

	/// Deliver the final `Err(Closed)` owed to every subscription the client closed.
	///
	/// These late deliveries are exactly the ones the client must ignore.
	pub fn drain_closed(&self) -> usize {
		let (status, ended) = {
			let mut state = self.state.lock();
			(
				std::mem::take(&mut state.ended_status),
				std::mem::take(&mut state.ended),
			)
		};

		let count = status.len() + ended.len();
		for slot in status {
			call(&slot, Err(Error::Closed));
		}
		for slot in ended {
			call(&slot, Err(Error::Closed));
		}
		count
	}

	// Runs the hook outside the lock, then records the call and applies any injected failure.
	fn enter(&self, op: Op) -> Result<parking_lot::MutexGuard<'_, State>, Error> {
		let hook = self.state.lock().hooks.remove(&op);
		if let Some(hook) = hook {
			hook();
		}

		let mut state = self.state.lock();
		state.calls.push(op);

		let failure = state.failures.remove(&op);
		match failure {
			Some(err) => Err(err),
			None => Ok(state),
		}
	}

	fn release(&self, resource: Resource, id: Id) -> Result<(), Error> {
		let mut state = self.state.lock();

		let found = match resource {
			Resource::Origin => state.origins.remove(id).is_some(),
			Resource::Session => match state.sessions.remove(id) {
				Some(session) => {
					state.ended_status.push(session.on_status);
					true
				}
				None => false,
			},
			Resource::Broadcast => state.broadcasts.remove(id).is_some(),
			Resource::CatalogTask => match state.catalog_tasks.remove(id) {
				Some(task) => {
					state.ended.push(task.on_catalog);
					true
				}
				None => false,
			},
			Resource::Catalog => state.catalogs.remove(id).is_some(),
			Resource::Track => match state.tracks.remove(id) {
				Some(track) => {
					state.ended.push(track.on_frame);
					true
				}
				None => false,
			},
			Resource::Frame => state.frames.remove(id).is_some(),
		};

		if !found {
			return Err(Error::NotFound);
		}

		state.closed.push((resource, id));

		match state.close_failures.remove(&resource) {
			true => Err(Error::transport(anyhow::anyhow!("injected {resource} close failure"))),
			false => Ok(()),
		}
	}
}

fn call<T>(slot: &Slot<T>, value: Result<T, Error>) {
	let mut callback = slot.lock();
	(*callback)(value);
}

impl Transport for MemoryTransport {
	fn origin_create(&self) -> Result<Id, Error> {
		let mut state = self.enter(Op::OriginCreate)?;
		state.origins.insert(())
	}

	fn origin_close(&self, origin: Id) -> Result<(), Error> {
		self.release(Resource::Origin, origin)
	}

	fn session_connect(&self, url: &Url, origin: Id, on_status: OnStatus) -> Result<Id, Error> {
		let mut state = self.enter(Op::SessionConnect)?;
		if !state.origins.contains(origin) {
			return Err(Error::NotFound);
		}

		state.sessions.insert(Session {
			url: url.clone(),
			origin,
			on_status: Arc::new(Mutex::new(on_status)),
		})
	}

	fn session_close(&self, session: Id) -> Result<(), Error> {
		self.release(Resource::Session, session)
	}

	fn consume(&self, origin: Id, path: &str) -> Result<Id, Error> {
		let mut state = self.enter(Op::Consume)?;
		if !state.origins.contains(origin) {
			return Err(Error::NotFound);
		}

		state.broadcasts.insert(path.to_string())
	}

	fn consume_close(&self, broadcast: Id) -> Result<(), Error> {
		self.release(Resource::Broadcast, broadcast)
	}

	fn catalog_subscribe(&self, broadcast: Id, on_catalog: OnCatalog) -> Result<Id, Error> {
		let mut state = self.enter(Op::CatalogSubscribe)?;
		let path = state.broadcasts.get(broadcast).ok_or(Error::NotFound)?.clone();

		state.catalog_tasks.insert(CatalogTask {
			path,
			on_catalog: Arc::new(Mutex::new(on_catalog)),
		})
	}

	fn catalog_subscribe_close(&self, task: Id) -> Result<(), Error> {
		self.release(Resource::CatalogTask, task)
	}

	fn catalog_close(&self, catalog: Id) -> Result<(), Error> {
		self.release(Resource::Catalog, catalog)
	}

	fn video_config(&self, catalog: Id, index: usize) -> Result<VideoConfig, Error> {
		let state = self.enter(Op::VideoConfig)?;
		let video = state.catalogs.get(catalog).ok_or(Error::NotFound)?;
		let video = video.as_ref().ok_or(Error::NoVideo)?;

		match index {
			0 => Ok(video.clone()),
			_ => Err(Error::NoIndex),
		}
	}

	fn video_subscribe(&self, catalog: Id, index: usize, latency: Duration, on_frame: OnFrame) -> Result<Id, Error> {
		let mut state = self.enter(Op::VideoSubscribe)?;
		let video = state.catalogs.get(catalog).ok_or(Error::NotFound)?;
		let config = video.as_ref().ok_or(Error::NoVideo)?.clone();
		if index != 0 {
			return Err(Error::NoIndex);
		}

		state.tracks.insert(Track {
			config,
			latency,
			on_frame: Arc::new(Mutex::new(on_frame)),
		})
	}

	fn video_close(&self, track: Id) -> Result<(), Error> {
		self.release(Resource::Track, track)
	}

	fn frame_chunk(&self, frame: Id, index: usize) -> Result<FrameChunk, Error> {
		let state = self.enter(Op::FrameChunk)?;
		let chunk = state.frames.get(frame).ok_or(Error::NotFound)?;

		match index {
			0 => Ok(chunk.clone()),
			_ => Err(Error::NoIndex),
		}
	}

	fn frame_close(&self, frame: Id) -> Result<(), Error> {
		self.release(Resource::Frame, frame)
	}
}
