use serde::{Deserialize, Serialize};
use serde_with::DisplayFromStr;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration, shared by the CLI and config files.
#[serde_with::serde_as]
#[derive(clap::Args, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Log {
	/// The default level; `RUST_LOG` directives still take precedence.
	#[serde_as(as = "DisplayFromStr")]
	#[arg(id = "log-level", long = "log-level", default_value = "info", env = "MOQ_SOURCE_LOG")]
	pub level: Level,
}

impl Default for Log {
	fn default() -> Self {
		Self { level: Level::INFO }
	}
}

impl Log {
	pub fn level(&self) -> LevelFilter {
		LevelFilter::from_level(self.level)
	}

	pub fn filter(&self) -> anyhow::Result<EnvFilter> {
		let filter = EnvFilter::builder()
			.with_default_directive(self.level().into())
			.from_env_lossy()
			.add_directive("h2=warn".parse()?)
			.add_directive("quinn=info".parse()?)
			.add_directive("tokio=info".parse()?);
		Ok(filter)
	}

	/// Install a global stderr subscriber. Fails if one is already installed.
	pub fn init(&self) -> anyhow::Result<()> {
		tracing_subscriber::fmt()
			.with_writer(std::io::stderr)
			.with_env_filter(self.filter()?)
			.try_init()
			.map_err(|err| anyhow::anyhow!(err))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_from_toml() {
		let log: Log = toml::from_str(r#"level = "debug""#).unwrap();
		assert_eq!(log.level, Level::DEBUG);
		assert_eq!(log.level(), LevelFilter::DEBUG);

		let log: Log = toml::from_str("").unwrap();
		assert_eq!(log, Log::default());

		assert!(toml::from_str::<Log>(r#"level = "loud""#).is_err());
	}
}
