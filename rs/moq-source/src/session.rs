use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
	BroadcastConsumer, CodecFactory, DecodePipeline, Decoder, Error, Fence, FrameSink, Generation, Handle, Id, OnStatus,
	PipelineState, PipelineStats, Resource, ShutdownCoordinator, SourceConfig, Target, Token, Transport, Tuning,
};

/// Where a [SessionManager] is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
	#[default]
	Idle,
	/// Origin and session requested, waiting for the status callback.
	Connecting,
	Connected,
	/// Broadcast consumed, waiting for a catalog.
	Consuming,
	/// A decoder is installed, waiting for the first picture.
	CatalogReady,
	Streaming,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Phase::Idle => "idle",
			Phase::Connecting => "connecting",
			Phase::Connected => "connected",
			Phase::Consuming => "consuming",
			Phase::CatalogReady => "catalog ready",
			Phase::Streaming => "streaming",
		};
		f.write_str(name)
	}
}

/// A consistent view of a [SessionManager], taken under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
	pub generation: Generation,
	/// False once the generation was revoked by a failure, disconnect or shutdown.
	pub live: bool,
	pub reconnecting: bool,
	pub phase: Phase,
	pub origin: Option<Id>,
	pub session: Option<Id>,
	pub broadcast: Option<Id>,
	pub catalog_task: Option<Id>,
	pub catalog: Option<Id>,
	pub track: Option<Id>,
	pub track_serial: u64,
	pub pipeline: PipelineState,
	pub stats: PipelineStats,
}

pub(crate) struct State {
	pub(crate) fence: Fence,
	pub(crate) phase: Phase,
	pub(crate) tuning: Tuning,
	pub(crate) consumer: Option<BroadcastConsumer>,
	pub(crate) pipeline: DecodePipeline,

	reconnecting: bool,
	// The url and broadcast last asked for, valid or not.
	requested: Option<(String, String)>,
	target: Option<Target>,
	origin: Option<Handle>,
	session: Option<Handle>,
}

impl State {
	fn new(tuning: Tuning) -> Self {
		Self {
			fence: Fence::default(),
			phase: Phase::Idle,
			pipeline: DecodePipeline::new(tuning.clone()),
			tuning,
			consumer: None,
			reconnecting: false,
			requested: None,
			target: None,
			origin: None,
			session: None,
		}
	}

	// Detach everything owned by the current attempt. The pipeline goes uninitialized
	// under the lock so no frame decodes mid-teardown, but the decoder is released last.
	fn teardown(&mut self) -> Teardown {
		Teardown {
			consumer: self.consumer.take(),
			session: self.session.take(),
			origin: self.origin.take(),
			decoder: self.pipeline.reset(),
		}
	}
}

/// Resources detached from the state, closed in the mandatory order.
///
/// Dropping it has the same effect as [Teardown::run]; the fields are declared in order.
#[derive(Default)]
struct Teardown {
	consumer: Option<BroadcastConsumer>,
	session: Option<Handle>,
	origin: Option<Handle>,
	decoder: Option<Decoder>,
}

impl Teardown {
	fn is_empty(&self) -> bool {
		self.consumer.is_none() && self.session.is_none() && self.origin.is_none() && self.decoder.is_none()
	}

	fn run(self) {
		let Self {
			consumer,
			session,
			origin,
			decoder,
		} = self;

		// Failures are logged by the consumer and do not stop the rest.
		if let Some(mut consumer) = consumer {
			let _ = consumer.close();
		}

		for mut handle in [session, origin].into_iter().flatten() {
			if let Err(err) = handle.close() {
				tracing::warn!(resource = %handle.resource(), %err, "teardown step failed");
			}
		}

		drop(decoder);
	}
}

pub(crate) struct Shared {
	pub(crate) transport: Arc<dyn Transport>,
	pub(crate) codecs: Arc<dyn CodecFactory>,
	pub(crate) sink: Arc<dyn FrameSink>,
	pub(crate) shutdown: ShutdownCoordinator,
	pub(crate) state: Mutex<State>,
}

/// Owns the connection to one relay and everything consumed through it.
///
/// Every request made to the [Transport] captures the [Token] of the attempt that made
/// it. Completions check the token against the live [Fence] under the lock before doing
/// anything else, so a reconnect turns all older completions into no-ops that only
/// release what they were handed.
///
/// Dropping the manager shuts it down and blocks until running callbacks return.
pub struct SessionManager {
	shared: Arc<Shared>,
}

impl SessionManager {
	pub fn new(
		transport: Arc<dyn Transport>,
		codecs: Arc<dyn CodecFactory>,
		sink: Arc<dyn FrameSink>,
		tuning: Tuning,
	) -> Self {
		Self {
			shared: Arc::new(Shared {
				transport,
				codecs,
				sink,
				shutdown: ShutdownCoordinator::new(),
				state: Mutex::new(State::new(tuning)),
			}),
		}
	}

	/// Tear down whatever is running and start a new connection attempt.
	///
	/// Returns the new generation, or `None` if another attempt is still being set up.
	/// The outcome of the attempt arrives later through the transport.
	pub fn connect(&self, url: &str, broadcast: &str) -> Result<Option<Generation>, Error> {
		self.shared.state.lock().requested = Some((url.to_string(), broadcast.to_string()));

		let target = Target::parse(url, broadcast).inspect_err(|err| {
			tracing::error!(%err, kind = ?err.kind(), "invalid connection settings");
		})?;

		self.shared.connect(target)
	}

	/// Apply new settings. Reconnects only if the url or broadcast changed.
	///
	/// Tuning changes take effect on the next connection attempt. Invalid settings
	/// disconnect and blank the output.
	pub fn update(&self, config: &SourceConfig) -> Result<Option<Generation>, Error> {
		{
			let mut state = self.shared.state.lock();
			state.tuning = config.tuning.clone();

			let requested = (config.url.clone(), config.broadcast.clone());
			if state.requested.as_ref() == Some(&requested) {
				tracing::debug!("settings unchanged");
				return Ok(None);
			}
			state.requested = Some(requested);
		}

		match config.target() {
			Ok(target) => self.shared.connect(target),
			Err(err) => {
				tracing::warn!(%err, "invalid settings, disconnecting");
				self.disconnect();
				Err(err)
			}
		}
	}

	/// Stop the current attempt without starting another one.
	pub fn disconnect(&self) {
		let teardown = {
			let mut state = self.shared.state.lock();
			state.fence.revoke();
			state.phase = Phase::Idle;
			state.teardown()
		};

		tracing::info!("disconnecting");
		teardown.run();
		self.shared.sink.blank();
	}

	/// Close everything and wait for in-flight callbacks to finish.
	///
	/// After this returns the sink is never called again. Must not be called from inside
	/// a [crate::FrameSink] or any other transport callback.
	pub fn shutdown(&self) {
		if self.shared.shutdown.begin() {
			let mut state = self.shared.state.lock();
			state.fence.revoke();
			state.phase = Phase::Idle;
			state.target = None;

			// Closed under the lock so no callback can slip in between.
			state.teardown().run();
			tracing::info!(generation = %state.fence.generation(), "shutting down");
		}

		self.shared.shutdown.wait_idle();
	}

	pub fn is_shutdown(&self) -> bool {
		self.shared.shutdown.is_closing()
	}

	pub fn snapshot(&self) -> Snapshot {
		let state = self.shared.state.lock();
		let consumer = state.consumer.as_ref();
		let catalog = consumer.and_then(BroadcastConsumer::catalog);

		Snapshot {
			generation: state.fence.generation(),
			live: state.fence.is_live(),
			reconnecting: state.reconnecting,
			phase: state.phase,
			origin: state.origin.as_ref().and_then(Handle::id),
			session: state.session.as_ref().and_then(Handle::id),
			broadcast: consumer.and_then(BroadcastConsumer::broadcast),
			catalog_task: catalog.and_then(|catalog| catalog.task()),
			catalog: catalog.and_then(|catalog| catalog.snapshot()),
			track: consumer.and_then(BroadcastConsumer::track).and_then(|track| track.id()),
			track_serial: consumer.map(BroadcastConsumer::serial).unwrap_or_default(),
			pipeline: state.pipeline.state(),
			stats: state.pipeline.stats(),
		}
	}
}

impl Drop for SessionManager {
	fn drop(&mut self) {
		self.shutdown();
	}
}

impl Shared {
	fn connect(self: &Arc<Self>, target: Target) -> Result<Option<Generation>, Error> {
		if self.shutdown.is_closing() {
			return Err(Error::Shutdown);
		}

		let (token, teardown, settle) = {
			let mut state = self.state.lock();
			if self.shutdown.is_closing() {
				return Err(Error::Shutdown);
			}

			if state.reconnecting {
				tracing::debug!("reconnect already in progress, skipping");
				return Ok(None);
			}

			state.reconnecting = true;
			let token = state.fence.advance();
			state.phase = Phase::Connecting;
			state.target = Some(target.clone());

			let tuning = state.tuning.clone();
			state.pipeline.set_tuning(tuning);

			(token, state.teardown(), state.tuning.settle)
		};

		tracing::info!(url = %target.url, broadcast = %target.broadcast, generation = %token.generation(), "connecting");

		let released = !teardown.is_empty();
		teardown.run();
		self.sink.blank();

		// Give the transport a moment to release what was just closed.
		if released && !settle.is_zero() {
			std::thread::sleep(settle);
		}

		let result = self.establish(token, &target);
		self.state.lock().reconnecting = false;

		match result {
			Ok(()) => Ok(Some(token.generation())),
			Err(Error::Stale) => {
				tracing::debug!(generation = %token.generation(), "connection attempt superseded");
				Err(Error::Stale)
			}
			Err(err) => {
				self.fail(token, err.clone());
				Err(err)
			}
		}
	}

	fn establish(self: &Arc<Self>, token: Token, target: &Target) -> Result<(), Error> {
		let origin = self.transport.origin_create()?;
		let origin_handle = Handle::new(self.transport.clone(), Resource::Origin, origin);
		{
			let mut state = self.state.lock();
			state.fence.check(&token)?;
			state.origin = Some(origin_handle);
		}

		let session = self
			.transport
			.session_connect(&target.url, origin, self.status_callback(token))?;
		let session_handle = Handle::new(self.transport.clone(), Resource::Session, session);
		{
			let mut state = self.state.lock();
			state.fence.check(&token)?;
			state.session = Some(session_handle);
		}

		tracing::debug!(%origin, %session, generation = %token.generation(), "session requested");
		Ok(())
	}

	fn status_callback(self: &Arc<Self>, token: Token) -> OnStatus {
		let shared = Arc::downgrade(self);
		Box::new(move |result| {
			if let Some(shared) = shared.upgrade() {
				shared.on_status(token, result);
			}
		})
	}

	fn on_status(self: &Arc<Self>, token: Token, result: Result<(), Error>) {
		let Some(_in_flight) = self.shutdown.enter() else {
			tracing::debug!("ignoring session status, shutting down");
			return;
		};

		match result {
			Ok(()) => {
				let connecting = {
					let state = self.state.lock();
					state.fence.is_current(&token) && state.phase == Phase::Connecting
				};

				match connecting {
					true => self.start_consume(token),
					false => tracing::debug!(generation = %token.generation(), "ignoring stale session status"),
				}
			}
			Err(err) => self.fail(token, err),
		}
	}

	fn start_consume(self: &Arc<Self>, token: Token) {
		let (origin, path) = {
			let mut state = self.state.lock();
			if self.shutdown.is_closing() || !state.fence.is_current(&token) {
				tracing::debug!(generation = %token.generation(), "not consuming, attempt superseded");
				return;
			}

			let Some(origin) = state.origin.as_ref().and_then(Handle::id) else {
				tracing::debug!("not consuming, origin closed");
				return;
			};

			let Some(target) = state.target.as_ref() else {
				return;
			};

			let path = target.broadcast.clone();
			state.phase = Phase::Connected;
			(origin, path)
		};

		tracing::info!(broadcast = %path, generation = %token.generation(), "connected");

		let broadcast = match self.transport.consume(origin, &path) {
			Ok(broadcast) => broadcast,
			Err(err) => return self.fail(token, err),
		};
		let broadcast_handle = Handle::new(self.transport.clone(), Resource::Broadcast, broadcast);

		let previous = {
			let mut state = self.state.lock();
			if self.shutdown.is_closing() || !state.fence.is_current(&token) {
				drop(state);
				tracing::debug!(%broadcast, "consume raced by reconnect, closing");
				return;
			}

			state.phase = Phase::Consuming;
			state.consumer.replace(BroadcastConsumer::new(broadcast_handle, path))
		};
		drop(previous);

		let task = match self.transport.catalog_subscribe(broadcast, self.catalog_callback(token)) {
			Ok(task) => Handle::new(self.transport.clone(), Resource::CatalogTask, task),
			Err(err) => return self.fail(token, err),
		};

		let stale = {
			let mut state = self.state.lock();
			let current = !self.shutdown.is_closing() && state.fence.is_current(&token);

			match state.consumer.as_mut() {
				Some(consumer) if current => Ok(consumer.set_catalog(task)),
				_ => Err(task),
			}
		};

		match stale {
			Ok(_) => tracing::debug!(%broadcast, "waiting for catalog"),
			Err(task) => {
				tracing::debug!(task = ?task.id(), "catalog raced by reconnect, closing");
				drop(task);
			}
		}
	}

	/// Abandon the attempt behind `token`: revoke it, tear down, then blank once.
	fn fail(&self, token: Token, err: Error) {
		let teardown = {
			let mut state = self.state.lock();
			if !state.fence.is_current(&token) {
				tracing::debug!(generation = %token.generation(), %err, "ignoring failure of stale attempt");
				return;
			}

			state.fence.revoke();
			state.phase = Phase::Idle;
			state.teardown()
		};

		match &err {
			Error::Closed => tracing::warn!(generation = %token.generation(), "session closed"),
			err => tracing::error!(generation = %token.generation(), %err, kind = ?err.kind(), "connection failed"),
		}

		teardown.run();
		self.sink.blank();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::mpsc;
	use std::time::Duration;

	use bytes::Bytes;

	use super::*;
	use crate::codec::CodecParams;
	use crate::transport::memory::{MemoryTransport, Op};
	use crate::{EncodedFrame, FrameCodec, OutputFrame, Picture, PixelFormat, Plane, VideoConfig};

	const URL: &str = "http://localhost:4443";

	// Emits one 2x2 RGBA picture per access unit.
	#[derive(Default)]
	struct SolidCodec {
		queued: usize,
	}

	impl FrameCodec for SolidCodec {
		fn send(&mut self, _payload: &[u8], _timestamp_us: u64) -> Result<(), Error> {
			self.queued += 1;
			Ok(())
		}

		fn receive(&mut self) -> Result<Option<Picture>, Error> {
			if self.queued == 0 {
				return Ok(None);
			}
			self.queued -= 1;

			Ok(Some(Picture {
				width: 2,
				height: 2,
				format: PixelFormat::Rgba,
				planes: vec![Plane {
					data: Bytes::from_static(&[0x80; 16]),
					stride: 8,
				}],
			}))
		}

		fn flush(&mut self) -> Result<(), Error> {
			self.queued = 0;
			Ok(())
		}

		fn name(&self) -> &str {
			"solid"
		}
	}

	struct SolidCodecs;

	impl CodecFactory for SolidCodecs {
		fn open(&self, _params: &CodecParams) -> Result<Box<dyn FrameCodec>, Error> {
			Ok(Box::<SolidCodec>::default())
		}
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	enum Event {
		Output(u64),
		Blank,
	}

	#[derive(Default)]
	struct Recorder {
		events: Mutex<Vec<Event>>,
		// Blocks output until released, when set.
		gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
	}

	impl Recorder {
		fn events(&self) -> Vec<Event> {
			self.events.lock().clone()
		}

		fn outputs(&self) -> usize {
			self.events().iter().filter(|event| matches!(event, Event::Output(_))).count()
		}

		fn blanks(&self) -> usize {
			self.events().iter().filter(|event| **event == Event::Blank).count()
		}
	}

	impl FrameSink for Recorder {
		fn output(&self, frame: &OutputFrame<'_>) {
			assert_eq!((frame.width, frame.height, frame.data.len()), (2, 2, 16));

			if let Some((entered, release)) = self.gate.lock().take() {
				entered.send(()).unwrap();
				release.recv().unwrap();
			}

			self.events.lock().push(Event::Output(frame.timestamp_us));
		}

		fn blank(&self) {
			self.events.lock().push(Event::Blank);
		}
	}

	fn setup() -> (Arc<MemoryTransport>, Arc<Recorder>, SessionManager) {
		let transport = Arc::new(MemoryTransport::new());
		let sink = Arc::new(Recorder::default());
		let tuning = Tuning {
			settle: Duration::ZERO,
			..Default::default()
		};
		let manager = SessionManager::new(transport.clone(), Arc::new(SolidCodecs), sink.clone(), tuning);
		(transport, sink, manager)
	}

	fn video() -> VideoConfig {
		VideoConfig {
			codec: "avc1.64001f".into(),
			coded_width: Some(2),
			coded_height: Some(2),
			description: None,
		}
	}

	fn frame(timestamp_us: u64, keyframe: bool) -> EncodedFrame {
		EncodedFrame {
			payload: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
			timestamp_us,
			keyframe,
		}
	}

	// Connect, complete the session and publish a catalog.
	fn stream(transport: &MemoryTransport, manager: &SessionManager) -> Snapshot {
		manager.connect(URL, "demo").unwrap();
		let session = manager.snapshot().session.unwrap();
		assert!(transport.complete_session(session, Ok(())));
		assert_eq!(transport.publish_catalog("demo", Some(video())).len(), 1);
		manager.snapshot()
	}

	#[test]
	fn connect_then_consume() {
		let (transport, _sink, manager) = setup();

		let generation = manager.connect(URL, "demo").unwrap().unwrap();
		assert_eq!(generation.get(), 1);

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Connecting);
		let session = snapshot.session.unwrap();
		assert_eq!(transport.session_info(session).unwrap().1, snapshot.origin.unwrap());

		assert!(transport.complete_session(session, Ok(())));
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Consuming);
		assert!(snapshot.broadcast.is_some());
		assert!(snapshot.catalog_task.is_some());
	}

	#[test]
	fn frames_reach_the_sink() {
		let (transport, sink, manager) = setup();

		let snapshot = stream(&transport, &manager);
		assert_eq!(snapshot.phase, Phase::CatalogReady);
		assert_eq!(snapshot.pipeline, PipelineState::WaitingKeyframe);
		assert_eq!(snapshot.track_serial, 1);

		let track = snapshot.track.unwrap();
		assert_eq!(transport.track_latency(track), Some(Duration::from_millis(100)));
		assert_eq!(transport.track_config(track), Some(video()));

		transport.push_frame(frame(1, false));
		transport.push_frame(frame(2, true));
		transport.push_frame(frame(3, false));

		assert_eq!(sink.events(), vec![Event::Blank, Event::Output(2), Event::Output(3)]);

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Streaming);
		assert_eq!(snapshot.pipeline, PipelineState::Streaming);
		assert_eq!(snapshot.stats.skipped, 1);
		assert_eq!(snapshot.stats.delivered, 2);

		assert!(transport.open(Resource::Frame).is_empty());
	}

	#[test]
	fn unchanged_catalog_keeps_track() {
		let (transport, _sink, manager) = setup();

		let first = stream(&transport, &manager);
		let snapshot = transport.publish_catalog("demo", Some(video()))[0];

		let second = manager.snapshot();
		assert_eq!(second.track, first.track);
		assert_eq!(second.track_serial, 1);
		assert_eq!(second.catalog, Some(snapshot));
		assert!(!transport.is_open(Resource::Catalog, first.catalog.unwrap()));

		let config = VideoConfig {
			coded_width: Some(4),
			..video()
		};
		transport.publish_catalog("demo", Some(config.clone()));

		// The old track is closed before its successor is opened, so the id may be reused.
		let third = manager.snapshot();
		assert_eq!(third.track_serial, 2);
		assert!(transport.closed().contains(&(Resource::Track, first.track.unwrap())));
		assert_eq!(transport.open(Resource::Track).len(), 1);
		assert_eq!(transport.track_config(third.track.unwrap()), Some(config));
		assert_eq!(third.pipeline, PipelineState::WaitingKeyframe);
	}

	#[test]
	fn unreadable_video_config_keeps_track() {
		let (transport, sink, manager) = setup();

		let before = stream(&transport, &manager);
		transport.push_frame(frame(1, true));

		transport.fail(Op::VideoConfig, Error::transport(anyhow::anyhow!("bad catalog")));
		let config = VideoConfig {
			coded_width: Some(4),
			..video()
		};
		transport.publish_catalog("demo", Some(config));

		let after = manager.snapshot();
		assert_eq!(after.track, before.track);
		assert_eq!(after.track_serial, 1);
		assert_eq!(after.catalog, before.catalog);
		assert_eq!(after.pipeline, PipelineState::Streaming);

		transport.push_frame(frame(2, false));
		assert_eq!(sink.outputs(), 2);
	}

	#[test]
	fn unknown_codec_keeps_streaming() {
		let (transport, sink, manager) = setup();

		let before = stream(&transport, &manager);
		transport.push_frame(frame(1, true));

		let config = VideoConfig {
			codec: "mp4a.40.2".into(),
			..video()
		};
		transport.publish_catalog("demo", Some(config));

		let after = manager.snapshot();
		assert_eq!(after.phase, Phase::Streaming);
		assert_eq!(after.track, before.track);
		assert_eq!(after.track_serial, 1);
		assert!(transport.is_open(Resource::Session, before.session.unwrap()));
		assert_eq!(transport.open(Resource::Catalog), vec![before.catalog.unwrap()]);

		transport.push_frame(frame(2, false));
		assert_eq!(sink.outputs(), 2);
	}

	#[test]
	fn track_subscribe_failure_leaves_fresh_pipeline_uninitialized() {
		let (transport, _sink, manager) = setup();

		manager.connect(URL, "demo").unwrap();
		transport.complete_session(manager.snapshot().session.unwrap(), Ok(()));

		transport.fail(Op::VideoSubscribe, Error::transport(anyhow::anyhow!("no track")));
		transport.publish_catalog("demo", Some(video()));

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Consuming);
		assert_eq!(snapshot.pipeline, PipelineState::Uninitialized);
		assert!(snapshot.track.is_none());
		assert!(transport.open(Resource::Track).is_empty());
		assert!(transport.open(Resource::Catalog).is_empty());

		// The next catalog update tries again.
		transport.publish_catalog("demo", Some(video()));
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::CatalogReady);
		assert_eq!(snapshot.pipeline, PipelineState::WaitingKeyframe);
		assert!(snapshot.track.is_some());
	}

	#[test]
	fn track_subscribe_failure_restores_working_decoder() {
		let (transport, sink, manager) = setup();

		let before = stream(&transport, &manager);
		transport.push_frame(frame(1, true));

		transport.fail(Op::VideoSubscribe, Error::transport(anyhow::anyhow!("no track")));
		let config = VideoConfig {
			coded_width: Some(4),
			..video()
		};
		transport.publish_catalog("demo", Some(config.clone()));

		// Only one track may be live, so the old one is already gone.
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Consuming);
		assert_eq!(snapshot.pipeline, PipelineState::Streaming);
		assert!(snapshot.track.is_none());
		assert!(transport.closed().contains(&(Resource::Track, before.track.unwrap())));
		assert_eq!(sink.blanks(), 1);

		transport.publish_catalog("demo", Some(config.clone()));
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.pipeline, PipelineState::WaitingKeyframe);
		assert_eq!(transport.track_config(snapshot.track.unwrap()), Some(config));

		transport.push_frame(frame(2, true));
		assert_eq!(sink.outputs(), 2);
	}

	#[test]
	fn failed_track_is_resubscribed() {
		let (transport, sink, manager) = setup();

		let before = stream(&transport, &manager);
		transport.push_frame(frame(1, true));

		assert!(transport.fail_track(before.track.unwrap(), Error::transport(anyhow::anyhow!("reset"))));
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Consuming);
		assert!(snapshot.track.is_none());

		// Same config as before, which must still reopen the track.
		transport.publish_catalog("demo", Some(video()));
		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::CatalogReady);
		assert_eq!(transport.open(Resource::Track), vec![snapshot.track.unwrap()]);

		assert_eq!(transport.push_frame(frame(2, true)).len(), 1);
		assert_eq!(sink.outputs(), 2);
		assert_eq!(manager.snapshot().phase, Phase::Streaming);
	}

	#[test]
	fn catalog_without_video_is_ignored() {
		let (transport, _sink, manager) = setup();

		manager.connect(URL, "demo").unwrap();
		transport.complete_session(manager.snapshot().session.unwrap(), Ok(()));
		transport.publish_catalog("demo", None);

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Consuming);
		assert!(snapshot.track.is_none());
		assert!(transport.open(Resource::Catalog).is_empty());
	}

	#[test]
	fn invalid_settings_touch_nothing() {
		let (transport, sink, manager) = setup();

		assert!(matches!(manager.connect("localhost", "demo"), Err(Error::InvalidUrl(_))));
		assert!(matches!(manager.connect(URL, "/"), Err(Error::InvalidBroadcast(_))));
		assert!(transport.calls().is_empty());
		assert!(sink.events().is_empty());
		assert_eq!(manager.snapshot().generation.get(), 0);
	}

	#[test]
	fn origin_failure_blanks() {
		let (transport, sink, manager) = setup();
		transport.fail(Op::OriginCreate, Error::transport(anyhow::anyhow!("offline")));

		assert!(manager.connect(URL, "demo").is_err());

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Idle);
		assert!(!snapshot.live);
		assert!(!snapshot.reconnecting);

		// Once for the reconnect, once for the failure.
		assert_eq!(sink.blanks(), 2);
	}

	#[test]
	fn session_failure_closes_in_order() {
		let (transport, _sink, manager) = setup();

		manager.connect(URL, "demo").unwrap();
		let snapshot = manager.snapshot();
		let (origin, session) = (snapshot.origin.unwrap(), snapshot.session.unwrap());

		transport.fail(Op::Consume, Error::NotFound);
		transport.complete_session(session, Ok(()));

		assert_eq!(
			transport.closed(),
			vec![(Resource::Session, session), (Resource::Origin, origin)]
		);
		assert_eq!(manager.snapshot().phase, Phase::Idle);
	}

	#[test]
	fn session_error_blanks_once() {
		let (transport, sink, manager) = setup();

		let snapshot = stream(&transport, &manager);
		transport.push_frame(frame(1, true));
		let before = sink.events();

		assert!(transport.complete_session(
			snapshot.session.unwrap(),
			Err(Error::transport(anyhow::anyhow!("connection reset")))
		));

		let closed: Vec<_> = transport
			.closed()
			.into_iter()
			.filter(|(resource, _)| *resource != Resource::Frame)
			.collect();
		assert_eq!(
			closed,
			vec![
				(Resource::Track, snapshot.track.unwrap()),
				(Resource::Catalog, snapshot.catalog.unwrap()),
				(Resource::CatalogTask, snapshot.catalog_task.unwrap()),
				(Resource::Broadcast, snapshot.broadcast.unwrap()),
				(Resource::Session, snapshot.session.unwrap()),
				(Resource::Origin, snapshot.origin.unwrap()),
			]
		);

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.phase, Phase::Idle);
		assert_eq!(snapshot.pipeline, PipelineState::Uninitialized);

		// Nothing reaches the sink after the blank, including the owed final deliveries.
		assert!(transport.push_frame(frame(2, true)).is_empty());
		assert_eq!(transport.drain_closed(), 3);

		let mut expected = before;
		expected.push(Event::Blank);
		assert_eq!(sink.events(), expected);
	}

	// Records what the transport had closed when each codec was dropped.
	struct ClosingCodecs {
		transport: Arc<MemoryTransport>,
		dropped: Arc<Mutex<Vec<Vec<(Resource, Id)>>>>,
	}

	struct ClosingCodec {
		inner: SolidCodec,
		transport: Arc<MemoryTransport>,
		dropped: Arc<Mutex<Vec<Vec<(Resource, Id)>>>>,
	}

	impl CodecFactory for ClosingCodecs {
		fn open(&self, _params: &CodecParams) -> Result<Box<dyn FrameCodec>, Error> {
			Ok(Box::new(ClosingCodec {
				inner: SolidCodec::default(),
				transport: self.transport.clone(),
				dropped: self.dropped.clone(),
			}))
		}
	}

	impl FrameCodec for ClosingCodec {
		fn send(&mut self, payload: &[u8], timestamp_us: u64) -> Result<(), Error> {
			self.inner.send(payload, timestamp_us)
		}

		fn receive(&mut self) -> Result<Option<Picture>, Error> {
			self.inner.receive()
		}

		fn flush(&mut self) -> Result<(), Error> {
			self.inner.flush()
		}

		fn name(&self) -> &str {
			"closing"
		}
	}

	impl Drop for ClosingCodec {
		fn drop(&mut self) {
			self.dropped.lock().push(self.transport.closed());
		}
	}

	#[test]
	fn decoder_is_released_after_the_origin() {
		let transport = Arc::new(MemoryTransport::new());
		let dropped = Arc::new(Mutex::new(Vec::new()));
		let codecs = Arc::new(ClosingCodecs {
			transport: transport.clone(),
			dropped: dropped.clone(),
		});
		let tuning = Tuning {
			settle: Duration::ZERO,
			..Default::default()
		};
		let manager = SessionManager::new(transport.clone(), codecs, Arc::new(Recorder::default()), tuning);

		let before = stream(&transport, &manager);
		manager.disconnect();

		assert_eq!(manager.snapshot().pipeline, PipelineState::Uninitialized);
		let dropped = dropped.lock().clone();
		assert_eq!(dropped.len(), 1);
		assert_eq!(dropped[0].last(), Some(&(Resource::Origin, before.origin.unwrap())));
		assert!(dropped[0].contains(&(Resource::Track, before.track.unwrap())));
	}

	#[test]
	fn teardown_continues_past_close_failures() {
		let (transport, _sink, manager) = setup();

		assert!(stream(&transport, &manager).track.is_some());
		transport.fail_close(Resource::Catalog);
		transport.fail_close(Resource::Session);

		manager.disconnect();

		for resource in [
			Resource::Track,
			Resource::Catalog,
			Resource::CatalogTask,
			Resource::Broadcast,
			Resource::Session,
			Resource::Origin,
		] {
			assert!(transport.open(resource).is_empty(), "{resource} left open");
		}

		let closed: Vec<_> = transport.closed().into_iter().map(|(resource, _)| resource).collect();
		assert_eq!(
			closed,
			vec![
				Resource::Track,
				Resource::Catalog,
				Resource::CatalogTask,
				Resource::Broadcast,
				Resource::Session,
				Resource::Origin,
			]
		);
	}

	#[test]
	fn reconnects_fence_older_generations() {
		let (transport, sink, manager) = setup();

		for expected in 1..=5 {
			let generation = manager.connect(URL, "demo").unwrap().unwrap();
			assert_eq!(generation.get(), expected);
		}

		// Closed sessions still owe a final status; none of them may fail the live attempt.
		assert_eq!(transport.drain_closed(), 4);

		let snapshot = manager.snapshot();
		assert!(snapshot.live);
		assert_eq!(snapshot.phase, Phase::Connecting);
		assert_eq!(transport.open(Resource::Origin).len(), 1);
		assert_eq!(transport.open(Resource::Session).len(), 1);
		assert_eq!(sink.blanks(), 5);

		assert!(transport.complete_session(snapshot.session.unwrap(), Ok(())));
		assert_eq!(manager.snapshot().phase, Phase::Consuming);
	}

	#[test]
	fn reconnect_during_catalog_subscribe() {
		let (transport, _sink, manager) = setup();
		let manager = Arc::new(manager);

		manager.connect(URL, "demo").unwrap();
		let session = manager.snapshot().session.unwrap();

		let inner = Arc::downgrade(&manager);
		transport.before(Op::CatalogSubscribe, move || {
			if let Some(manager) = inner.upgrade() {
				manager.connect(URL, "other").unwrap();
			}
		});
		transport.complete_session(session, Ok(()));

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.generation.get(), 2);
		assert_eq!(snapshot.phase, Phase::Connecting);
		assert!(snapshot.broadcast.is_none());
		assert!(transport.open(Resource::Broadcast).is_empty());
		assert!(transport.open(Resource::CatalogTask).is_empty());
	}

	#[test]
	fn reconnect_during_track_subscribe() {
		let (transport, sink, manager) = setup();
		let manager = Arc::new(manager);

		manager.connect(URL, "demo").unwrap();
		transport.complete_session(manager.snapshot().session.unwrap(), Ok(()));

		let inner = Arc::downgrade(&manager);
		transport.before(Op::VideoSubscribe, move || {
			if let Some(manager) = inner.upgrade() {
				manager.connect(URL, "demo").unwrap();
			}
		});
		transport.publish_catalog("demo", Some(video()));

		let snapshot = manager.snapshot();
		assert_eq!(snapshot.generation.get(), 2);
		assert_eq!(snapshot.pipeline, PipelineState::Uninitialized);
		assert!(transport.open(Resource::Track).is_empty());
		assert!(transport.open(Resource::Catalog).is_empty());

		// The orphaned track was closed, so nothing can reach the sink.
		assert!(transport.push_frame(frame(1, true)).is_empty());
		transport.drain_closed();
		assert_eq!(sink.outputs(), 0);
	}

	#[test]
	fn frame_in_flight_during_reconnect_is_released() {
		let (transport, sink, manager) = setup();
		let manager = Arc::new(manager);

		let snapshot = stream(&transport, &manager);

		let inner = Arc::downgrade(&manager);
		transport.before(Op::FrameChunk, move || {
			if let Some(manager) = inner.upgrade() {
				manager.connect(URL, "demo").unwrap();
			}
		});
		let frames = transport.push_frame_to(snapshot.track.unwrap(), frame(1, true));

		assert!(frames.is_some());
		assert!(transport.open(Resource::Frame).is_empty());
		assert_eq!(sink.outputs(), 0);
		assert_eq!(manager.snapshot().phase, Phase::Connecting);
	}

	#[test]
	fn catalog_failure_blanks_without_teardown() {
		let (transport, sink, manager) = setup();

		let snapshot = stream(&transport, &manager);
		assert!(transport.fail_catalog(
			snapshot.catalog_task.unwrap(),
			Error::transport(anyhow::anyhow!("broadcast gone"))
		));

		assert_eq!(sink.blanks(), 2);
		assert!(transport.is_open(Resource::Session, snapshot.session.unwrap()));
		assert!(manager.snapshot().live);
	}

	#[test]
	fn update_only_reconnects_on_change() {
		let (transport, sink, manager) = setup();

		let mut config = SourceConfig {
			broadcast: "demo".into(),
			..Default::default()
		};
		assert!(manager.update(&config).unwrap().is_some());
		assert!(manager.update(&config).unwrap().is_none());
		assert_eq!(manager.snapshot().generation.get(), 1);

		config.broadcast = "".into();
		assert!(manager.update(&config).is_err());
		assert!(transport.open(Resource::Origin).is_empty());
		assert_eq!(manager.snapshot().phase, Phase::Idle);

		// Reconnect blank plus disconnect blank.
		assert_eq!(sink.blanks(), 2);
	}

	#[test]
	fn tuning_applies_to_next_attempt() {
		let (transport, _sink, manager) = setup();

		let mut config = SourceConfig {
			broadcast: "demo".into(),
			..Default::default()
		};
		config.tuning.settle = Duration::ZERO;
		manager.update(&config).unwrap();

		config.tuning.latency = Duration::from_millis(250);
		config.broadcast = "demo2".into();
		manager.update(&config).unwrap();

		transport.complete_session(manager.snapshot().session.unwrap(), Ok(()));
		transport.publish_catalog("demo2", Some(video()));

		let track = manager.snapshot().track.unwrap();
		assert_eq!(transport.track_latency(track), Some(Duration::from_millis(250)));
	}

	#[test]
	fn disconnect_then_reconnect() {
		let (transport, sink, manager) = setup();

		stream(&transport, &manager);
		manager.disconnect();

		let snapshot = manager.snapshot();
		assert!(!snapshot.live);
		assert_eq!(snapshot.phase, Phase::Idle);
		assert!(transport.open(Resource::Origin).is_empty());
		assert_eq!(sink.blanks(), 2);

		let generation = manager.connect(URL, "demo").unwrap().unwrap();
		assert_eq!(generation.get(), 2);
		assert!(manager.snapshot().live);
	}

	#[test]
	fn shutdown_is_final() {
		let (transport, _sink, manager) = setup();
		manager.connect(URL, "demo").unwrap();
		let session = manager.snapshot().session.unwrap();

		manager.shutdown();
		assert!(manager.is_shutdown());
		assert!(transport.open(Resource::Session).is_empty());
		assert!(transport.open(Resource::Origin).is_empty());
		assert!(matches!(manager.connect(URL, "demo"), Err(Error::Shutdown)));

		// Late deliveries are ignored.
		assert!(!transport.complete_session(session, Ok(())));
		transport.drain_closed();
		manager.shutdown();
	}

	#[test]
	fn shutdown_waits_for_running_callbacks() {
		let (transport, sink, manager) = setup();
		let manager = Arc::new(manager);

		let track = stream(&transport, &manager).track.unwrap();

		let (entered, entered_rx) = mpsc::channel();
		let (release, release_rx) = mpsc::channel();
		*sink.gate.lock() = Some((entered, release_rx));

		let pusher = {
			let transport = transport.clone();
			std::thread::spawn(move || transport.push_frame_to(track, frame(1, true)))
		};
		entered_rx.recv().unwrap();

		let closer = {
			let manager = manager.clone();
			std::thread::spawn(move || manager.shutdown())
		};

		std::thread::sleep(Duration::from_millis(50));
		assert!(manager.is_shutdown());
		assert!(!closer.is_finished());

		release.send(()).unwrap();
		assert!(pusher.join().unwrap().is_some());
		closer.join().unwrap();

		assert_eq!(sink.outputs(), 1);
		assert!(transport.open(Resource::Track).is_empty());
		assert!(transport.open(Resource::Frame).is_empty());
	}
}
