use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

pub const DEFAULT_URL: &str = "http://localhost:4443";
pub const DEFAULT_BROADCAST: &str = "obs/test";

/// Where to connect and what to watch.
#[derive(clap::Args, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SourceConfig {
	/// The URL of the relay.
	///
	/// If `http` is used, the TLS certificate fingerprint is fetched first (insecure).
	/// If `https` is used, a WebTransport connection is made directly.
	#[arg(long, env = "MOQ_SOURCE_URL", default_value = DEFAULT_URL)]
	pub url: String,

	/// The path of the broadcast to consume.
	#[arg(long, env = "MOQ_SOURCE_BROADCAST", default_value = DEFAULT_BROADCAST)]
	pub broadcast: String,

	#[command(flatten)]
	pub tuning: Tuning,
}

impl Default for SourceConfig {
	fn default() -> Self {
		Self {
			url: DEFAULT_URL.to_string(),
			broadcast: DEFAULT_BROADCAST.to_string(),
			tuning: Tuning::default(),
		}
	}
}

/// Timing and recovery knobs. The defaults are the values the plugin has always shipped with.
#[derive(clap::Args, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Tuning {
	/// How much the video track may buffer to absorb jitter.
	#[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
	#[serde(with = "humantime_serde")]
	pub latency: Duration,

	/// Consecutive decode failures before the decoder is flushed and waits for a keyframe.
	#[arg(long, default_value_t = 5)]
	pub error_threshold: u32,

	/// While waiting for a keyframe, log every this many skipped frames.
	#[arg(long, default_value_t = 30)]
	pub keyframe_log_interval: u64,

	/// Pause between tearing down the old session and creating the new one.
	#[arg(long, default_value = "50ms", value_parser = humantime::parse_duration)]
	#[serde(with = "humantime_serde")]
	pub settle: Duration,
}

impl Default for Tuning {
	fn default() -> Self {
		Self {
			latency: Duration::from_millis(100),
			error_threshold: 5,
			keyframe_log_interval: 30,
			settle: Duration::from_millis(50),
		}
	}
}

/// A validated connection target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
	pub url: Url,
	pub broadcast: String,
}

impl Target {
	/// Validate a URL and broadcast path without touching the network.
	///
	/// The URL must look like `scheme://host...`; the broadcast path must be non-empty
	/// once surrounding slashes are removed.
	pub fn parse(url: &str, broadcast: &str) -> Result<Self, Error> {
		let url = url.trim();
		let (scheme, rest) = url.split_once("://").ok_or_else(|| Error::InvalidUrl(url.to_string()))?;

		let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
		if scheme.is_empty() || host.is_empty() {
			return Err(Error::InvalidUrl(url.to_string()));
		}

		let url = Url::parse(url)?;

		let broadcast = broadcast.trim().trim_matches('/');
		if broadcast.is_empty() {
			return Err(Error::InvalidBroadcast(broadcast.to_string()));
		}

		Ok(Self {
			url,
			broadcast: broadcast.to_string(),
		})
	}
}

impl SourceConfig {
	pub fn target(&self) -> Result<Target, Error> {
		Target::parse(&self.url, &self.broadcast)
	}

	pub fn validate(&self) -> Result<(), Error> {
		self.target().map(|_| ())
	}

	pub fn from_toml(s: &str) -> Result<Self, Error> {
		toml::from_str(s).map_err(|err| Error::Config(Arc::new(err.into())))
	}

	pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();
		let contents = std::fs::read_to_string(path)
			.map_err(|err| Error::Config(Arc::new(anyhow::Error::new(err).context(path.display().to_string()))))?;
		Self::from_toml(&contents)
	}
}
