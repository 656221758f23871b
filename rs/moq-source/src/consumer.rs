use std::sync::Arc;

use crate::session::{Phase, Shared, State};
use crate::transport::read_frame;
use crate::{Decoded, Decoder, Error, Handle, Id, OnCatalog, OnFrame, Resource, Token};

/// The live video track of a [BroadcastConsumer].
#[derive(Debug)]
pub struct TrackSubscription {
	track: Handle,
	serial: u64,
}

impl TrackSubscription {
	pub fn id(&self) -> Option<Id> {
		self.track.id()
	}

	/// Frames tagged with any other serial belong to a replaced track.
	pub fn serial(&self) -> u64 {
		self.serial
	}
}

/// The catalog task of a [BroadcastConsumer], plus the snapshot the track was opened from.
#[derive(Debug)]
pub struct CatalogSubscription {
	task: Handle,
	snapshot: Option<Handle>,
}

impl CatalogSubscription {
	pub fn task(&self) -> Option<Id> {
		self.task.id()
	}

	pub fn snapshot(&self) -> Option<Id> {
		self.snapshot.as_ref().and_then(Handle::id)
	}
}

/// One subscribed broadcast: its catalog and at most one video track.
///
/// Dropping it closes everything in teardown order, child before parent.
#[derive(Debug)]
pub struct BroadcastConsumer {
	path: String,
	broadcast: Handle,
	catalog: Option<CatalogSubscription>,
	track: Option<TrackSubscription>,
	serial: u64,
}

impl BroadcastConsumer {
	pub(crate) fn new(broadcast: Handle, path: String) -> Self {
		Self {
			path,
			broadcast,
			catalog: None,
			track: None,
			serial: 0,
		}
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn broadcast(&self) -> Option<Id> {
		self.broadcast.id()
	}

	pub fn catalog(&self) -> Option<&CatalogSubscription> {
		self.catalog.as_ref()
	}

	pub fn track(&self) -> Option<&TrackSubscription> {
		self.track.as_ref()
	}

	pub fn serial(&self) -> u64 {
		self.serial
	}

	/// Returns the previous subscription, if any, to be dropped outside the lock.
	pub(crate) fn set_catalog(&mut self, task: Handle) -> Option<CatalogSubscription> {
		self.catalog.replace(CatalogSubscription { task, snapshot: None })
	}

	/// Start a new track generation. Returns the new serial and the track it retires.
	fn next_serial(&mut self) -> (u64, Option<TrackSubscription>) {
		self.serial += 1;
		(self.serial, self.track.take())
	}

	fn replace_snapshot(&mut self, snapshot: Handle) -> Option<Handle> {
		self.catalog.as_mut()?.snapshot.replace(snapshot)
	}

	fn install(&mut self, track: TrackSubscription, snapshot: Handle) -> (Option<TrackSubscription>, Option<Handle>) {
		let previous = self.track.replace(track);
		(previous, self.replace_snapshot(snapshot))
	}

	/// Close track, catalog snapshot, catalog task, then the broadcast.
	///
	/// Every step runs even if an earlier one fails. Returns the first failure.
	pub fn close(&mut self) -> Result<(), Error> {
		let mut result = Ok(());

		if let Some(mut track) = self.track.take() {
			step(&mut result, track.track.close());
		}

		if let Some(mut catalog) = self.catalog.take() {
			if let Some(mut snapshot) = catalog.snapshot.take() {
				step(&mut result, snapshot.close());
			}
			step(&mut result, catalog.task.close());
		}

		step(&mut result, self.broadcast.close());
		result
	}
}

fn step(result: &mut Result<(), Error>, outcome: Result<(), Error>) {
	if let Err(err) = outcome {
		tracing::warn!(%err, "teardown step failed");
		if result.is_ok() {
			*result = Err(err);
		}
	}
}

impl Drop for BroadcastConsumer {
	fn drop(&mut self) {
		let _ = self.close();
	}
}

impl Shared {
	/// Accept work for `token` only while it is live and a broadcast is being consumed.
	fn consuming(&self, state: &State, token: &Token) -> bool {
		!self.shutdown.is_closing() && state.fence.is_current(token) && state.consumer.is_some()
	}

	pub(crate) fn catalog_callback(self: &Arc<Self>, token: Token) -> OnCatalog {
		let shared = Arc::downgrade(self);
		Box::new(move |result| {
			if let Some(shared) = shared.upgrade() {
				shared.on_catalog(token, result);
			}
		})
	}

	fn frame_callback(self: &Arc<Self>, token: Token, serial: u64) -> OnFrame {
		let shared = Arc::downgrade(self);
		Box::new(move |result| {
			if let Some(shared) = shared.upgrade() {
				shared.on_frame(token, serial, result);
			}
		})
	}

	fn on_catalog(self: &Arc<Self>, token: Token, result: Result<Id, Error>) {
		let Some(_in_flight) = self.shutdown.enter() else {
			if let Ok(id) = result {
				drop(Handle::new(self.transport.clone(), Resource::Catalog, id));
			}
			tracing::debug!("ignoring catalog, shutting down");
			return;
		};

		let id = match result {
			Ok(id) => id,
			Err(err) => return self.catalog_failed(token, err),
		};
		let catalog = Handle::new(self.transport.clone(), Resource::Catalog, id);

		if !self.consuming(&self.state.lock(), &token) {
			tracing::debug!(generation = %token.generation(), %id, "ignoring stale catalog");
			return;
		}

		let config = match self.transport.video_config(id, 0) {
			Ok(config) => config,
			Err(err) => {
				tracing::warn!(%err, kind = ?err.kind(), "failed to read video config");
				return;
			}
		};

		tracing::info!(%id, codec = %config.codec, width = ?config.coded_width, height = ?config.coded_height, "catalog update");

		{
			let mut guard = self.state.lock();
			let state = &mut *guard;
			if !self.consuming(state, &token) {
				drop(guard);
				tracing::debug!(generation = %token.generation(), "catalog raced by reconnect");
				return;
			}

			let unchanged = state.pipeline.config() == Some(&config)
				&& state.consumer.as_ref().is_some_and(|consumer| consumer.track.is_some());

			if unchanged {
				let previous = state.consumer.as_mut().and_then(|consumer| consumer.replace_snapshot(catalog));
				drop(guard);

				tracing::debug!("video config unchanged, keeping track");
				drop(previous);
				return;
			}
		}

		let decoder = match Decoder::open(self.codecs.as_ref(), config) {
			Ok(decoder) => decoder,
			Err(err) => {
				tracing::error!(%err, kind = ?err.kind(), "failed to initialize decoder");
				return;
			}
		};

		let (serial, latency, track, previous) = {
			let mut guard = self.state.lock();
			let state = &mut *guard;
			if !self.consuming(state, &token) {
				drop(guard);
				tracing::debug!(generation = %token.generation(), "catalog raced by reconnect");
				return;
			}

			let Some(consumer) = state.consumer.as_mut() else {
				return;
			};

			let (serial, track) = consumer.next_serial();
			let previous = state.pipeline.install(decoder);
			state.phase = Phase::CatalogReady;

			(serial, state.tuning.latency, track, previous)
		};

		// The replaced track is closed before its successor is opened.
		// The replaced decoder is kept until the new track exists.
		drop(track);

		let on_frame = self.frame_callback(token, serial);
		let track = match self.transport.video_subscribe(id, 0, latency, on_frame) {
			Ok(track) => Handle::new(self.transport.clone(), Resource::Track, track),
			Err(err) => {
				tracing::error!(%err, kind = ?err.kind(), "failed to subscribe to video track");
				return self.subscribe_failed(&token, serial, previous);
			}
		};
		drop(previous);

		let outcome = {
			let mut guard = self.state.lock();
			let state = &mut *guard;
			let accepted = self.consuming(state, &token);

			match state.consumer.as_mut() {
				Some(consumer) if accepted && consumer.serial == serial => {
					tracing::info!(track = ?track.id(), serial, ?latency, "subscribed to video track");
					Ok(consumer.install(TrackSubscription { track, serial }, catalog))
				}
				_ => Err((track, catalog)),
			}
		};

		if let Err(stale) = outcome {
			tracing::debug!(generation = %token.generation(), serial, "track raced by reconnect, closing");
			drop(stale);
		}
	}

	// Put back the decoder that was working before the catalog update, or go uninitialized.
	fn subscribe_failed(&self, token: &Token, serial: u64, previous: Option<Decoder>) {
		let mut guard = self.state.lock();
		let state = &mut *guard;

		let current = self.consuming(state, token)
			&& state.consumer.as_ref().is_some_and(|consumer| consumer.serial == serial);
		if !current {
			drop(guard);
			drop(previous);
			return;
		}

		let failed = match previous {
			Some(decoder) => state.pipeline.install(decoder),
			None => state.pipeline.reset(),
		};
		state.phase = Phase::Consuming;
		tracing::debug!(pipeline = %state.pipeline.state(), "video track unavailable, waiting for the next catalog");

		drop(guard);
		drop(failed);
	}

	fn catalog_failed(&self, token: Token, err: Error) {
		if !self.consuming(&self.state.lock(), &token) {
			tracing::debug!(generation = %token.generation(), %err, "ignoring stale catalog failure");
			return;
		}

		match err {
			Error::Closed => tracing::info!("catalog ended"),
			err => tracing::error!(%err, kind = ?err.kind(), "catalog subscription failed"),
		}

		self.sink.blank();
	}

	fn on_frame(&self, token: Token, serial: u64, result: Result<Id, Error>) {
		let Some(_in_flight) = self.shutdown.enter() else {
			if let Ok(id) = result {
				drop(Handle::new(self.transport.clone(), Resource::Frame, id));
			}
			return;
		};

		let id = match result {
			Ok(id) => id,
			Err(err) => return self.track_ended(&token, serial, err),
		};

		// Released on every path below, after the lock.
		let frame = Handle::new(self.transport.clone(), Resource::Frame, id);

		let encoded = match read_frame(self.transport.as_ref(), id) {
			Ok(encoded) => encoded,
			Err(err) => {
				tracing::warn!(%err, %id, "failed to read frame");
				return;
			}
		};

		let mut guard = self.state.lock();
		let state = &mut *guard;

		let current = self.consuming(state, &token)
			&& state.consumer.as_ref().is_some_and(|consumer| consumer.serial == serial);
		if !current {
			drop(guard);
			tracing::trace!(generation = %token.generation(), serial, "ignoring stale frame");
			return;
		}

		match state.pipeline.decode(&encoded, self.sink.as_ref()) {
			Ok(Decoded::Delivered) if state.phase == Phase::CatalogReady => {
				state.phase = Phase::Streaming;
				tracing::info!(timestamp_us = encoded.timestamp_us, "streaming");
			}
			Ok(decoded) => tracing::trace!(?decoded, timestamp_us = encoded.timestamp_us, "frame"),
			Err(err) => tracing::trace!(%err, "frame dropped"),
		}

		drop(guard);
		drop(frame);
	}

	// A terminal delivery. If it belongs to the live track, forget the track so the
	// next catalog update subscribes again even when the config is unchanged.
	fn track_ended(&self, token: &Token, serial: u64, err: Error) {
		let retired = {
			let mut guard = self.state.lock();
			let state = &mut *guard;

			let current = self.consuming(state, token)
				&& state.consumer.as_ref().is_some_and(|consumer| consumer.serial == serial);
			if !current {
				drop(guard);
				tracing::debug!(serial, %err, "replaced video track ended");
				return;
			}

			// Bumping the serial also rejects a subscription still waiting to be installed.
			let retired = state.consumer.as_mut().and_then(|consumer| consumer.next_serial().1);
			state.phase = Phase::Consuming;
			retired
		};

		match err {
			Error::Closed => tracing::info!(serial, "video track ended"),
			err => tracing::warn!(%err, kind = ?err.kind(), serial, "video track failed"),
		}

		drop(retired);
	}
}
