//! The production [Transport], on top of `moq-lite`, `hang` and `moq-native`.
//!
//! Every long running request is a task on a private current-thread runtime. The task
//! owns the receiving half of a oneshot channel, and the sending half lives in a slab
//! under the returned [Id]. Closing the id drops the sender, which cancels the task and
//! makes it report [Error::Closed] exactly once.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

use super::{FrameChunk, OnCatalog, OnFrame, OnStatus, Transport};
use crate::{Error, Id, NonZeroSlab, VideoConfig};

struct Catalog {
	broadcast: moq_lite::BroadcastConsumer,
	catalog: hang::catalog::Catalog,
}

struct Frame {
	chunks: Vec<Bytes>,
	timestamp_us: u64,
	keyframe: bool,
}

#[derive(Default)]
struct State {
	origins: NonZeroSlab<moq_lite::OriginProducer>,
	broadcasts: NonZeroSlab<moq_lite::BroadcastConsumer>,
	catalogs: NonZeroSlab<Catalog>,
	frames: NonZeroSlab<Frame>,

	// Cancellation channels, one per background task.
	sessions: NonZeroSlab<oneshot::Sender<()>>,
	catalog_tasks: NonZeroSlab<oneshot::Sender<()>>,
	tracks: NonZeroSlab<oneshot::Sender<()>>,
}

pub struct MoqTransport {
	client: moq_native::ClientConfig,
	runtime: tokio::runtime::Handle,
	state: Arc<Mutex<State>>,

	// Dropping this stops the runtime thread.
	_stop: oneshot::Sender<()>,
}

impl MoqTransport {
	/// Start the runtime thread. Sessions are configured with `client`.
	pub fn new(client: moq_native::ClientConfig) -> Result<Self, Error> {
		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.map_err(Error::transport)?;
		let handle = runtime.handle().clone();

		let (stop, stopped) = oneshot::channel::<()>();
		std::thread::Builder::new()
			.name("moq-source".into())
			.spawn(move || {
				runtime.block_on(async move {
					let _ = stopped.await;
				});
			})
			.map_err(Error::transport)?;

		Ok(Self {
			client,
			runtime: handle,
			state: Default::default(),
			_stop: stop,
		})
	}

	async fn run_session(
		client: moq_native::ClientConfig,
		url: Url,
		origin: moq_lite::OriginProducer,
		on_status: &mut OnStatus,
	) -> Result<(), Error> {
		let client = client.init().map_err(|err| Error::Connect(Arc::new(err)))?;
		let connection = client.connect(url).await.map_err(|err| Error::Connect(Arc::new(err)))?;

		// Consume only; nothing is published.
		let session = moq_lite::Session::connect(connection, None::<moq_lite::OriginConsumer>, origin)
			.await
			.map_err(|err| Error::Connect(Arc::new(err.into())))?;

		// Important: the state lock is never held during a callback.
		on_status(Ok(()));

		session.closed().await.map_err(Error::transport)?;
		Ok(())
	}

	async fn run_catalog(
		state: Arc<Mutex<State>>,
		broadcast: moq_lite::BroadcastConsumer,
		on_catalog: &mut OnCatalog,
	) -> Result<(), Error> {
		let track = broadcast.subscribe_track(&hang::catalog::Catalog::default_track());
		let mut consumer = hang::catalog::CatalogConsumer::new(track);

		while let Some(catalog) = consumer.next().await.map_err(Error::transport)? {
			let id = state.lock().catalogs.insert(Catalog {
				broadcast: broadcast.clone(),
				catalog,
			})?;
			on_catalog(Ok(id));
		}

		Ok(())
	}

	async fn run_track(
		state: Arc<Mutex<State>>,
		mut track: hang::TrackConsumer,
		on_frame: &mut OnFrame,
	) -> Result<(), Error> {
		while let Some(mut frame) = track.read_frame().await.map_err(Error::transport)? {
			let timestamp_us = u64::try_from(frame.timestamp.as_micros())
				.map_err(|_| Error::transport(anyhow::anyhow!("timestamp overflow")))?;

			let chunks = match frame.payload.num_chunks() {
				1 => (0..1).filter_map(|index| frame.payload.get_chunk(index).cloned()).collect(),
				_ => vec![frame.payload.copy_to_bytes(frame.payload.num_bytes())],
			};

			let id = state.lock().frames.insert(Frame {
				chunks,
				timestamp_us,
				keyframe: frame.keyframe,
			})?;
			on_frame(Ok(id));
		}

		Ok(())
	}
}

// Wrap a task result as the final delivery: a clean end is still the end.
fn finished(res: Option<Result<(), Error>>) -> Error {
	match res {
		Some(Err(err)) => err,
		Some(Ok(())) | None => Error::Closed,
	}
}

impl Transport for MoqTransport {
	fn origin_create(&self) -> Result<Id, Error> {
		self.state.lock().origins.insert(moq_lite::OriginProducer::default())
	}

	fn origin_close(&self, origin: Id) -> Result<(), Error> {
		self.state.lock().origins.remove(origin).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn session_connect(&self, url: &Url, origin: Id, mut on_status: OnStatus) -> Result<Id, Error> {
		let mut state = self.state.lock();
		let origin = state.origins.get(origin).ok_or(Error::NotFound)?.clone();

		let (cancel, cancelled) = oneshot::channel();
		let id = state.sessions.insert(cancel)?;

		let client = self.client.clone();
		let url = url.clone();

		self.runtime.spawn(async move {
			let res = tokio::select! {
				// No more sender, which means session_close was called.
				_ = cancelled => None,
				res = Self::run_session(client, url, origin, &mut on_status) => Some(res),
			};
			on_status(Err(finished(res)));
		});

		Ok(id)
	}

	fn session_close(&self, session: Id) -> Result<(), Error> {
		self.state.lock().sessions.remove(session).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn consume(&self, origin: Id, path: &str) -> Result<Id, Error> {
		let mut state = self.state.lock();
		let origin = state.origins.get(origin).ok_or(Error::NotFound)?;
		let broadcast = origin.consume().consume_broadcast(path).ok_or(Error::NotFound)?;
		state.broadcasts.insert(broadcast)
	}

	fn consume_close(&self, broadcast: Id) -> Result<(), Error> {
		self.state.lock().broadcasts.remove(broadcast).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn catalog_subscribe(&self, broadcast: Id, mut on_catalog: OnCatalog) -> Result<Id, Error> {
		let mut state = self.state.lock();
		let broadcast = state.broadcasts.get(broadcast).ok_or(Error::NotFound)?.clone();

		let (cancel, cancelled) = oneshot::channel();
		let id = state.catalog_tasks.insert(cancel)?;

		let shared = self.state.clone();
		self.runtime.spawn(async move {
			let res = tokio::select! {
				_ = cancelled => None,
				res = Self::run_catalog(shared, broadcast, &mut on_catalog) => Some(res),
			};
			on_catalog(Err(finished(res)));
		});

		Ok(id)
	}

	fn catalog_subscribe_close(&self, task: Id) -> Result<(), Error> {
		self.state.lock().catalog_tasks.remove(task).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn catalog_close(&self, catalog: Id) -> Result<(), Error> {
		self.state.lock().catalogs.remove(catalog).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn video_config(&self, catalog: Id, index: usize) -> Result<VideoConfig, Error> {
		let state = self.state.lock();
		let catalog = state.catalogs.get(catalog).ok_or(Error::NotFound)?;
		let video = catalog.catalog.video.as_ref().ok_or(Error::NoVideo)?;
		let config = video.renditions.values().nth(index).ok_or(Error::NoIndex)?;

		Ok(VideoConfig {
			codec: config.codec.to_string(),
			coded_width: config.coded_width,
			coded_height: config.coded_height,
			description: config.description.clone(),
		})
	}

	fn video_subscribe(&self, catalog: Id, index: usize, latency: Duration, mut on_frame: OnFrame) -> Result<Id, Error> {
		let mut state = self.state.lock();
		let catalog = state.catalogs.get(catalog).ok_or(Error::NotFound)?;
		let video = catalog.catalog.video.as_ref().ok_or(Error::NoVideo)?;
		let rendition = video.renditions.keys().nth(index).ok_or(Error::NoIndex)?;

		let track = catalog.broadcast.subscribe_track(&moq_lite::Track {
			name: rendition.clone(),
			priority: video.priority,
		});
		let track = hang::TrackConsumer::new(track, latency);

		let (cancel, cancelled) = oneshot::channel();
		let id = state.tracks.insert(cancel)?;

		let shared = self.state.clone();
		self.runtime.spawn(async move {
			let res = tokio::select! {
				_ = cancelled => None,
				res = Self::run_track(shared, track, &mut on_frame) => Some(res),
			};
			on_frame(Err(finished(res)));
		});

		Ok(id)
	}

	fn video_close(&self, track: Id) -> Result<(), Error> {
		self.state.lock().tracks.remove(track).ok_or(Error::NotFound)?;
		Ok(())
	}

	fn frame_chunk(&self, frame: Id, index: usize) -> Result<FrameChunk, Error> {
		let state = self.state.lock();
		let frame = state.frames.get(frame).ok_or(Error::NotFound)?;
		let payload = frame.chunks.get(index).ok_or(Error::NoIndex)?.clone();

		Ok(FrameChunk {
			payload,
			timestamp_us: frame.timestamp_us,
			keyframe: frame.keyframe,
		})
	}

	fn frame_close(&self, frame: Id) -> Result<(), Error> {
		self.state.lock().frames.remove(frame).ok_or(Error::NotFound)?;
		Ok(())
	}
}
