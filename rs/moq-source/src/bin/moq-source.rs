use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use moq_source::transport::moq::MoqTransport;
use moq_source::{CodecFactory, FrameSink, Log, OutputFrame, SessionManager, SourceConfig};
use parking_lot::Mutex;

#[derive(Parser, Clone)]
#[command(name = "moq-source", version, about = "Decode a live MoQ broadcast into raw RGBA frames")]
pub struct Cli {
	#[command(flatten)]
	log: Log,

	#[command(flatten)]
	source: SourceConfig,

	/// The MoQ client configuration.
	#[command(flatten)]
	client: moq_native::ClientConfig,

	/// Read the url, broadcast and tuning from a TOML file instead of the flags.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Append every decoded frame to this file as packed RGBA.
	#[arg(long)]
	output: Option<PathBuf>,

	/// Prefer hardware decoders, falling back to software.
	#[arg(long)]
	hardware: bool,

	/// How often to log frame statistics.
	#[arg(long, default_value = "5s", value_parser = parse_interval)]
	stats: Duration,
}

fn parse_interval(s: &str) -> Result<Duration, String> {
	let interval = humantime::parse_duration(s).map_err(|err| err.to_string())?;
	if interval.is_zero() {
		return Err("interval must be greater than zero".into());
	}
	Ok(interval)
}

/// Counts frames and optionally writes them to a file.
struct FileSink {
	writer: Mutex<Option<BufWriter<File>>>,
	frames: AtomicU64,
	blanks: AtomicU64,
}

impl FileSink {
	fn create(path: Option<&Path>) -> anyhow::Result<Self> {
		let writer = match path {
			Some(path) => {
				let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
				Some(BufWriter::new(file))
			}
			None => None,
		};

		Ok(Self {
			writer: Mutex::new(writer),
			frames: AtomicU64::new(0),
			blanks: AtomicU64::new(0),
		})
	}
}

impl FrameSink for FileSink {
	fn output(&self, frame: &OutputFrame<'_>) {
		self.frames.fetch_add(1, Ordering::Relaxed);

		let mut writer = self.writer.lock();
		if let Some(file) = writer.as_mut() {
			if let Err(err) = file.write_all(frame.data) {
				tracing::warn!(%err, "failed to write frame, disabling output");
				*writer = None;
			}
		}
	}

	fn blank(&self) {
		self.blanks.fetch_add(1, Ordering::Relaxed);
	}
}

#[cfg(feature = "ffmpeg")]
fn codecs(hardware: bool) -> anyhow::Result<Arc<dyn CodecFactory>> {
	Ok(Arc::new(moq_source::codec::ffmpeg::FfmpegCodecs::new(hardware)))
}

#[cfg(not(feature = "ffmpeg"))]
fn codecs(_hardware: bool) -> anyhow::Result<Arc<dyn CodecFactory>> {
	anyhow::bail!("moq-source was built without the `ffmpeg` feature, so no decoder is available")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init()?;

	let source = match &cli.config {
		Some(path) => SourceConfig::load(path)?,
		None => cli.source.clone(),
	};
	source.validate()?;

	let codecs = codecs(cli.hardware)?;
	let sink = Arc::new(FileSink::create(cli.output.as_deref())?);
	let transport = Arc::new(MoqTransport::new(cli.client.clone())?);

	let manager = Arc::new(SessionManager::new(transport, codecs, sink.clone(), source.tuning.clone()));
	manager.update(&source)?;

	let mut stats = tokio::time::interval(cli.stats);
	stats.tick().await;

	loop {
		tokio::select! {
			_ = stats.tick() => {
				let snapshot = manager.snapshot();
				tracing::info!(
					phase = %snapshot.phase,
					generation = %snapshot.generation,
					pipeline = %snapshot.pipeline,
					frames = sink.frames.load(Ordering::Relaxed),
					blanks = sink.blanks.load(Ordering::Relaxed),
					skipped = snapshot.stats.skipped,
					errors = snapshot.stats.decode_errors,
					"stats"
				);
			}
			_ = tokio::signal::ctrl_c() => break,
		}
	}

	tracing::info!("interrupted, shutting down");
	tokio::task::spawn_blocking(move || manager.shutdown()).await?;

	if let Some(file) = sink.writer.lock().as_mut() {
		file.flush()?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stats_interval_must_be_positive() {
		assert_eq!(parse_interval("250ms"), Ok(Duration::from_millis(250)));
		assert!(parse_interval("0s").is_err());
		assert!(parse_interval("soon").is_err());
		assert!(Cli::try_parse_from(["moq-source", "--stats", "0s"]).is_err());
		let cli = Cli::try_parse_from(["moq-source", "--stats", "2s"]).unwrap();
		assert_eq!(cli.stats, Duration::from_secs(2));
	}
}
