use std::path::PathBuf;

use crate::{InitError, OutputMode};

/// Decoder construction parameters.
#[derive(Clone, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct DecoderConfig {
	/// The number of input buffers; queuing more waits for one to be returned.
	#[arg(
		id = "input-buffers",
		long = "input-buffers",
		env = "HEVC_INPUT_BUFFERS",
		default_value_t = 8
	)]
	pub input_buffers: usize,

	/// The number of output buffers; decoding stalls while the consumer holds all of them.
	#[arg(
		id = "output-buffers",
		long = "output-buffers",
		env = "HEVC_OUTPUT_BUFFERS",
		default_value_t = 16
	)]
	pub output_buffers: usize,

	/// The initial capacity of each input buffer in bytes; buffers grow past it as needed.
	#[arg(
		id = "initial-input-size",
		long = "initial-input-size",
		env = "HEVC_INITIAL_INPUT_SIZE",
		default_value_t = 768 * 1024
	)]
	pub initial_input_size: usize,

	/// The pixel format of decoded frames.
	#[arg(
		id = "output-mode",
		long = "output-mode",
		env = "HEVC_OUTPUT_MODE",
		value_enum,
		default_value_t = OutputMode::Yuv
	)]
	pub output_mode: OutputMode,

	/// A directory the engine may use for intermediate frame data.
	///
	/// Defaults to `hevcyuv` inside the system temp directory.
	#[serde(skip_serializing_if = "Option::is_none")]
	#[arg(id = "scratch-dir", long = "scratch-dir", env = "HEVC_SCRATCH_DIR")]
	pub scratch_dir: Option<PathBuf>,
}

impl DecoderConfig {
	pub fn validate(&self) -> Result<(), InitError> {
		if self.input_buffers == 0 {
			return Err(InitError::InvalidConfig("input_buffers must be at least 1"));
		}

		if self.output_buffers == 0 {
			return Err(InitError::InvalidConfig("output_buffers must be at least 1"));
		}

		Ok(())
	}

	pub fn scratch_dir(&self) -> PathBuf {
		self.scratch_dir
			.clone()
			.unwrap_or_else(|| std::env::temp_dir().join("hevcyuv"))
	}
}

impl Default for DecoderConfig {
	fn default() -> Self {
		Self {
			input_buffers: 8,
			output_buffers: 16,
			initial_input_size: 768 * 1024,
			output_mode: OutputMode::Yuv,
			scratch_dir: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		decoder: DecoderConfig,
	}

	#[test]
	fn test_defaults() {
		let cli = Cli::try_parse_from(["test"]).unwrap();
		let config = cli.decoder;

		assert_eq!(config.input_buffers, 8);
		assert_eq!(config.output_buffers, 16);
		assert_eq!(config.initial_input_size, 768 * 1024);
		assert_eq!(config.output_mode, OutputMode::Yuv);
		assert!(config.scratch_dir().ends_with("hevcyuv"));
		config.validate().unwrap();
	}

	#[test]
	fn test_flags() {
		let cli = Cli::try_parse_from([
			"test",
			"--input-buffers",
			"2",
			"--output-mode",
			"rgb",
			"--scratch-dir",
			"/var/tmp/frames",
		])
		.unwrap();

		assert_eq!(cli.decoder.input_buffers, 2);
		assert_eq!(cli.decoder.output_mode, OutputMode::Rgb);
		assert_eq!(cli.decoder.scratch_dir(), PathBuf::from("/var/tmp/frames"));
	}

	#[test]
	fn test_toml() {
		let config: DecoderConfig = toml::from_str(
			r#"
			output_buffers = 4
			output_mode = "none"
			"#,
		)
		.unwrap();

		assert_eq!(config.input_buffers, 8);
		assert_eq!(config.output_buffers, 4);
		assert_eq!(config.output_mode, OutputMode::None);

		assert!(toml::from_str::<DecoderConfig>("threads = 4").is_err());
	}

	#[test]
	fn test_validate() {
		let config = DecoderConfig {
			output_buffers: 0,
			..Default::default()
		};

		assert!(matches!(config.validate(), Err(InitError::InvalidConfig(_))));
	}
}
