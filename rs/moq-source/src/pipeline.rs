use std::fmt;

use crate::codec::annexb::{self, Container};
use crate::codec::convert::Converter;
use crate::codec::{CodecFactory, CodecKind, CodecParams, EncodedFrame, FrameCodec, Picture};
use crate::{Error, FrameSink, OutputFrame, Tuning, VideoConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
	/// No decoder installed.
	Uninitialized,
	/// Dropping frames until a keyframe arrives.
	WaitingKeyframe,
	Streaming,
	/// At least one decode failed since the last success.
	ErrorRecovery,
}

impl fmt::Display for PipelineState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			PipelineState::Uninitialized => "uninitialized",
			PipelineState::WaitingKeyframe => "waiting for keyframe",
			PipelineState::Streaming => "streaming",
			PipelineState::ErrorRecovery => "error recovery",
		};
		f.write_str(name)
	}
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
	/// No decoder installed; the frame was ignored.
	Idle,
	/// Dropped while waiting for a keyframe.
	Skipped,
	/// Accepted by the decoder, no picture yet.
	Pending,
	/// A picture was delivered to the sink.
	Delivered,
}

/// Counters since the pipeline was created. They survive reconfiguration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
	pub delivered: u64,
	pub skipped: u64,
	pub decode_errors: u64,
	pub malformed: u64,
	pub recoveries: u64,
	pub reinits: u64,
}

/// The decoder, converter and output buffer for one [VideoConfig].
///
/// Built entirely outside the session lock by [Decoder::open], then moved into the
/// [DecodePipeline] in one step. The converter and buffer are derived from the first
/// picture, not from the config.
pub struct Decoder {
	config: VideoConfig,
	kind: CodecKind,
	container: Container,
	codec: Box<dyn FrameCodec>,
	output: Option<Output>,

	got_keyframe: bool,
	waiting: u64,
	errors: u32,
}

struct Output {
	converter: Converter,
	buffer: Vec<u8>,
}

impl Output {
	fn new(picture: &Picture) -> Result<Self, Error> {
		let converter = Converter::new(picture.width, picture.height, &picture.format)?;
		let buffer = vec![0; converter.output_len()];
		Ok(Self { converter, buffer })
	}
}

impl Decoder {
	pub fn open(codecs: &dyn CodecFactory, config: VideoConfig) -> Result<Self, Error> {
		let kind = CodecKind::from_codec_str(&config.codec)?;
		let container = Container::select(kind, &config);

		let extradata = match (container, &config.description) {
			(Container::LengthPrefixed, Some(record)) => Some(annexb::parameter_sets(kind, record)?),
			(_, description) => description.clone(),
		};

		let params = CodecParams {
			kind,
			coded_width: config.coded_width,
			coded_height: config.coded_height,
			extradata,
		};

		let codec = codecs.open(&params)?;

		tracing::info!(
			codec = %config.codec,
			decoder = codec.name(),
			width = ?config.coded_width,
			height = ?config.coded_height,
			?container,
			"opened decoder"
		);

		if config.coded_width.is_none() || config.coded_height.is_none() {
			match codec.dimensions() {
				Some((width, height)) => tracing::info!(width, height, "provisional dimensions from decoder"),
				None => tracing::debug!("dimensions unknown until the first picture"),
			}
		}

		Ok(Self {
			config,
			kind,
			container,
			codec,
			output: None,
			got_keyframe: false,
			waiting: 0,
			errors: 0,
		})
	}

	pub fn config(&self) -> &VideoConfig {
		&self.config
	}

	pub fn kind(&self) -> CodecKind {
		self.kind
	}

	fn state(&self) -> PipelineState {
		if !self.got_keyframe {
			PipelineState::WaitingKeyframe
		} else if self.errors > 0 {
			PipelineState::ErrorRecovery
		} else {
			PipelineState::Streaming
		}
	}

	fn flush(&mut self) {
		if let Err(err) = self.codec.flush() {
			tracing::warn!(%err, "failed to flush decoder");
		}
	}

	// Counts a decode failure; at the threshold, flush and go back to waiting for a keyframe.
	fn failed(&mut self, err: Error, tuning: &Tuning, stats: &mut PipelineStats) -> Error {
		self.errors += 1;
		stats.decode_errors += 1;

		if self.errors >= tuning.error_threshold {
			tracing::warn!(errors = self.errors, "too many decode errors, flushing and waiting for keyframe");
			self.flush();
			self.got_keyframe = false;
			self.errors = 0;
			stats.recoveries += 1;
		} else if self.errors == 1 {
			tracing::error!(%err, "decode error");
		} else {
			tracing::debug!(%err, errors = self.errors, "decode error");
		}

		err
	}

	fn decode(
		&mut self,
		frame: &EncodedFrame,
		sink: &dyn FrameSink,
		tuning: &Tuning,
		stats: &mut PipelineStats,
	) -> Result<Decoded, Error> {
		if !self.got_keyframe && !frame.keyframe {
			self.waiting += 1;
			stats.skipped += 1;

			let interval = tuning.keyframe_log_interval.max(1);
			if self.waiting == 1 || self.waiting % interval == 0 {
				tracing::info!(skipped = self.waiting, "waiting for keyframe");
			}
			return Ok(Decoded::Skipped);
		}

		if frame.keyframe {
			if !self.got_keyframe {
				tracing::info!(skipped = self.waiting, size = frame.payload.len(), "got keyframe");
				self.flush();
			}
			self.got_keyframe = true;
			self.waiting = 0;
			self.errors = 0;
		}

		let payload = match self.container {
			Container::LengthPrefixed => match annexb::length_prefixed_to_annexb(&frame.payload) {
				Ok(payload) => payload,
				Err(err) => {
					stats.malformed += 1;
					tracing::warn!(%err, size = frame.payload.len(), "dropping malformed frame");
					return Err(err);
				}
			},
			Container::Raw => frame.payload.clone(),
		};

		match self.codec.send(&payload, frame.timestamp_us) {
			Ok(()) => {}
			Err(Error::Again) => tracing::trace!("decoder busy"),
			Err(err) => return Err(self.failed(err, tuning, stats)),
		}

		let picture = match self.codec.receive() {
			Ok(Some(picture)) => picture,
			Ok(None) => return Ok(Decoded::Pending),
			Err(Error::Again) => return Ok(Decoded::Pending),
			Err(err) => return Err(self.failed(err, tuning, stats)),
		};

		self.errors = 0;

		let mut output = match self.output.take() {
			Some(output) if output.converter.matches(&picture) => output,
			previous => match Output::new(&picture) {
				Ok(output) => {
					match &previous {
						Some(previous) => tracing::info!(
							old_width = previous.converter.width(),
							old_height = previous.converter.height(),
							old_format = %previous.converter.format(),
							width = picture.width,
							height = picture.height,
							format = %picture.format,
							"decoded format changed"
						),
						None => tracing::info!(
							width = picture.width,
							height = picture.height,
							format = %picture.format,
							"first decoded picture"
						),
					}
					stats.reinits += 1;
					output
				}
				Err(err) => {
					// Keep whatever was installed; only this picture is lost.
					self.output = previous;
					tracing::error!(%err, "unusable decoded picture");
					return Err(err);
				}
			},
		};

		let converted = output.converter.convert(&picture, &mut output.buffer);
		let result = match converted {
			Ok(()) => {
				sink.output(&OutputFrame {
					data: &output.buffer,
					width: output.converter.width(),
					height: output.converter.height(),
					stride: output.converter.stride(),
					timestamp_us: frame.timestamp_us,
				});
				stats.delivered += 1;
				Ok(Decoded::Delivered)
			}
			Err(err) => {
				tracing::warn!(%err, "failed to convert picture");
				Err(err)
			}
		};

		self.output = Some(output);
		result
	}
}

/// Turns compressed frames into [OutputFrame]s for the sink.
///
/// Owns at most one [Decoder]. Installing a new one replaces the old one wholesale, so
/// no frame ever sees a half-updated decoder, converter or buffer.
pub struct DecodePipeline {
	tuning: Tuning,
	active: Option<Decoder>,
	stats: PipelineStats,
}

impl DecodePipeline {
	pub fn new(tuning: Tuning) -> Self {
		Self {
			tuning,
			active: None,
			stats: PipelineStats::default(),
		}
	}

	pub fn set_tuning(&mut self, tuning: Tuning) {
		self.tuning = tuning;
	}

	pub fn state(&self) -> PipelineState {
		match &self.active {
			Some(decoder) => decoder.state(),
			None => PipelineState::Uninitialized,
		}
	}

	pub fn stats(&self) -> PipelineStats {
		self.stats
	}

	pub fn config(&self) -> Option<&VideoConfig> {
		self.active.as_ref().map(Decoder::config)
	}

	/// Frames skipped since the pipeline last started waiting for a keyframe.
	pub fn waiting(&self) -> u64 {
		self.active.as_ref().map(|decoder| decoder.waiting).unwrap_or_default()
	}

	pub fn consecutive_errors(&self) -> u32 {
		self.active.as_ref().map(|decoder| decoder.errors).unwrap_or_default()
	}

	/// The current output size, once a picture has been decoded.
	pub fn dimensions(&self) -> Option<(u32, u32)> {
		let output = self.active.as_ref()?.output.as_ref()?;
		Some((output.converter.width(), output.converter.height()))
	}

	/// Replace the active decoder. Returns the previous one so the caller can drop it later.
	#[must_use = "the previous decoder should be dropped outside the lock"]
	pub fn install(&mut self, decoder: Decoder) -> Option<Decoder> {
		self.active.replace(decoder)
	}

	/// Back to [PipelineState::Uninitialized]. Returns the previous decoder.
	#[must_use = "the previous decoder should be dropped outside the lock"]
	pub fn reset(&mut self) -> Option<Decoder> {
		self.active.take()
	}

	/// Open and install a decoder in one step.
	pub fn configure(&mut self, codecs: &dyn CodecFactory, config: VideoConfig) -> Result<(), Error> {
		let decoder = Decoder::open(codecs, config)?;
		drop(self.install(decoder));
		Ok(())
	}

	pub fn decode(&mut self, frame: &EncodedFrame, sink: &dyn FrameSink) -> Result<Decoded, Error> {
		match self.active.as_mut() {
			Some(decoder) => decoder.decode(frame, sink, &self.tuning, &mut self.stats),
			None => Ok(Decoded::Idle),
		}
	}
}

impl fmt::Debug for Decoder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Decoder")
			.field("codec", &self.config.codec)
			.field("decoder", &self.codec.name())
			.field("state", &self.state())
			.finish()
	}
}
