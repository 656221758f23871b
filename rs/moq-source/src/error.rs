use std::sync::Arc;

/// How far a failure unwinds.
///
/// Each [Error] belongs to exactly one kind, which decides whether the session is torn
/// down, only the subscription is unwound, or just the current frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Malformed URL or broadcast path, rejected before connecting.
	Configuration,
	/// An origin, session, consume or catalog request failed.
	TransportConnect,
	/// The catalog could not be read or the track could not be subscribed.
	Subscription,
	/// The decoder could not be created for a catalog's video config.
	DecoderInit,
	/// A frame's container framing is broken.
	Payload,
	/// The decoder rejected a frame or produced an unusable picture.
	Decode,
	/// The event belongs to an older generation or arrived during shutdown.
	Stale,
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
	#[error("closed")]
	Closed,

	#[error("transport error: {0}")]
	Transport(Arc<anyhow::Error>),

	#[error("connect error: {0}")]
	Connect(Arc<anyhow::Error>),

	#[error("url error: {0}")]
	Url(#[from] url::ParseError),

	#[error("invalid url: {0:?}")]
	InvalidUrl(String),

	#[error("invalid broadcast path: {0:?}")]
	InvalidBroadcast(String),

	#[error("config error: {0}")]
	Config(Arc<anyhow::Error>),

	#[error("invalid id")]
	InvalidId,

	#[error("not found")]
	NotFound,

	#[error("no index")]
	NoIndex,

	#[error("catalog has no video track")]
	NoVideo,

	#[error("unknown codec: {0}")]
	UnknownCodec(String),

	#[error("decoder init failed: {0}")]
	DecoderInit(Arc<anyhow::Error>),

	#[error("malformed payload: {0}")]
	MalformedPayload(&'static str),

	#[error("decoder needs more input")]
	Again,

	#[error("decode failed: {0}")]
	Decode(Arc<anyhow::Error>),

	#[error("invalid picture: {width}x{height}")]
	InvalidPicture { width: u32, height: u32 },

	#[error("unsupported pixel format: {0}")]
	UnsupportedPixelFormat(String),

	#[error("stale generation")]
	Stale,

	#[error("shutting down")]
	Shutdown,
}

impl Error {
	/// A negative status code, matching the convention of the C bindings.
	pub fn code(&self) -> i32 {
		match self {
			Error::Closed => -1,
			Error::Transport(_) => -2,
			Error::Url(_) => -3,
			Error::Connect(_) => -5,
			Error::InvalidId => -7,
			Error::NotFound => -8,
			Error::UnknownCodec(_) => -9,
			Error::DecoderInit(_) => -10,
			Error::Decode(_) => -11,
			Error::NoIndex => -12,
			Error::InvalidUrl(_) => -17,
			Error::InvalidBroadcast(_) => -18,
			Error::Config(_) => -19,
			Error::NoVideo => -20,
			Error::MalformedPayload(_) => -21,
			Error::Again => -22,
			Error::InvalidPicture { .. } => -23,
			Error::UnsupportedPixelFormat(_) => -24,
			Error::Stale => -25,
			Error::Shutdown => -26,
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Url(_) | Error::InvalidUrl(_) | Error::InvalidBroadcast(_) | Error::Config(_) => {
				ErrorKind::Configuration
			}
			Error::Closed | Error::Transport(_) | Error::Connect(_) => ErrorKind::TransportConnect,
			Error::InvalidId | Error::NotFound | Error::NoIndex | Error::NoVideo => ErrorKind::Subscription,
			Error::UnknownCodec(_) | Error::DecoderInit(_) => ErrorKind::DecoderInit,
			Error::MalformedPayload(_) => ErrorKind::Payload,
			Error::Again | Error::Decode(_) | Error::InvalidPicture { .. } | Error::UnsupportedPixelFormat(_) => {
				ErrorKind::Decode
			}
			Error::Stale | Error::Shutdown => ErrorKind::Stale,
		}
	}

	pub(crate) fn transport(err: impl Into<anyhow::Error>) -> Self {
		Error::Transport(Arc::new(err.into()))
	}

	pub(crate) fn decoder_init(err: impl Into<anyhow::Error>) -> Self {
		Error::DecoderInit(Arc::new(err.into()))
	}

	pub(crate) fn decode(err: impl Into<anyhow::Error>) -> Self {
		Error::Decode(Arc::new(err.into()))
	}
}
