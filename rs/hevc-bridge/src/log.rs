use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Clone, Debug, clap::Args)]
pub struct Log {
	/// The minimum level to log; RUST_LOG overrides it when set.
	#[arg(
		id = "log-level",
		long = "log-level",
		env = "HEVC_LOG_LEVEL",
		default_value = "info",
		value_parser = Level::from_str
	)]
	pub level: Level,
}

impl Default for Log {
	fn default() -> Self {
		Self { level: Level::INFO }
	}
}

impl Log {
	/// Install a global subscriber writing to stderr.
	///
	/// Does nothing if a subscriber was already installed.
	pub fn init(&self) {
		let filter = EnvFilter::builder()
			.with_default_directive(self.level.into())
			.from_env_lossy();

		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.with_thread_names(true)
			.try_init()
			.ok();
	}
}
