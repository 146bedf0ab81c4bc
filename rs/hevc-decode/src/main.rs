mod annexb;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use hevc_bridge::{Buffer, DecoderConfig, Flags, HevcDecoder, NativeEngine, OutputBuffer, OutputMode};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Parser, Clone)]
#[command(version, about)]
pub struct Cli {
	/// The engine shared library to load.
	#[arg(long, env = "HEVC_LIBRARY")]
	library: PathBuf,

	/// Codec initialization data, concatenated in order.
	///
	/// May be given multiple times; defaults to the parameter sets at the start of the input.
	#[arg(long)]
	init: Vec<PathBuf>,

	/// The Annex-B input, or stdin if omitted.
	#[arg(long)]
	input: Option<PathBuf>,

	/// Write raw decoded planes here, or discard frames if omitted.
	#[arg(long)]
	output: Option<PathBuf>,

	/// The frame rate used to generate timestamps.
	#[arg(long, default_value_t = 30.0)]
	fps: f64,

	/// Load the decoder settings from a TOML file instead of the flags.
	#[arg(long)]
	config: Option<PathBuf>,

	#[command(flatten)]
	decoder: DecoderConfig,

	#[command(flatten)]
	log: hevc_bridge::Log,
}

#[derive(Debug, Default)]
struct Summary {
	units: u64,
	frames: u64,
	skipped: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	anyhow::ensure!(cli.fps > 0.0, "fps must be positive");

	let config = match &cli.config {
		Some(path) => {
			let raw = tokio::fs::read_to_string(path)
				.await
				.with_context(|| format!("failed to read {}", path.display()))?;
			toml::from_str(&raw).context("failed to parse config")?
		}
		None => cli.decoder.clone(),
	};

	let input = read_input(cli.input.as_ref()).await?;

	let init = match cli.init.is_empty() {
		true => annexb::parameter_sets(input.clone())?,
		false => {
			let mut init = Vec::new();
			for path in &cli.init {
				let segment = tokio::fs::read(path)
					.await
					.with_context(|| format!("failed to read {}", path.display()))?;
				init.push(Bytes::from(segment));
			}
			init
		}
	};
	anyhow::ensure!(!init.is_empty(), "no codec initialization data");

	let engine = Arc::new(NativeEngine::load(&cli.library)?);
	let decoder = HevcDecoder::new(&config, engine, None, &init)?;

	let output = match &cli.output {
		Some(path) => {
			let file = tokio::fs::File::create(path)
				.await
				.with_context(|| format!("failed to create {}", path.display()))?;
			Some(tokio::io::BufWriter::new(file))
		}
		None => None,
	};

	let mut summary = Summary::default();

	tokio::select! {
		res = async { tokio::try_join!(feed(&decoder, input, cli.fps), drain(&decoder, output)) } => {
			let (units, (frames, skipped)) = res?;
			summary = Summary { units, frames, skipped };
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::warn!("interrupted");
		}
	}

	let stats = decoder.stats();
	decoder.release()?;

	tracing::info!(
		name = decoder.name(),
		units = summary.units,
		frames = summary.frames,
		skipped = summary.skipped,
		?stats,
		"done"
	);

	Ok(())
}

async fn read_input(path: Option<&PathBuf>) -> anyhow::Result<Bytes> {
	let mut buf = Vec::new();

	match path {
		Some(path) => {
			buf = tokio::fs::read(path)
				.await
				.with_context(|| format!("failed to read {}", path.display()))?
		}
		None => {
			tokio::io::stdin()
				.read_to_end(&mut buf)
				.await
				.context("failed to read stdin")?;
		}
	}

	Ok(buf.into())
}

// Queue every access unit, then the end of stream marker.
async fn feed(decoder: &HevcDecoder, input: Bytes, fps: f64) -> anyhow::Result<u64> {
	let mut splitter = annexb::Splitter::default();
	let mut count = 0;

	for nal in annexb::NalIterator::new(input) {
		if let Some(unit) = splitter.push(nal)? {
			queue(decoder, unit, count, fps).await?;
			count += 1;
		}
	}

	if let Some(unit) = splitter.finish() {
		queue(decoder, unit, count, fps).await?;
		count += 1;
	}

	decoder.finish().await?;
	tracing::debug!(count, "queued all access units");

	Ok(count)
}

async fn queue(decoder: &HevcDecoder, unit: annexb::AccessUnit, index: u64, fps: f64) -> anyhow::Result<()> {
	let timestamp = (index as f64 * 1_000_000.0 / fps) as i64;
	let flags = match unit.keyframe {
		true => Flags::KEY_FRAME,
		false => Flags::NONE,
	};

	tracing::trace!(index, timestamp, size = unit.data.len(), keyframe = unit.keyframe, "queue");
	decoder.enqueue(&unit.data, timestamp, None, flags).await?;

	Ok(())
}

// Write every frame until the end of stream marker.
async fn drain<W: AsyncWrite + Unpin>(decoder: &HevcDecoder, mut output: Option<W>) -> anyhow::Result<(u64, u64)> {
	let mut frames = 0;
	let mut skipped = 0;

	loop {
		let frame = decoder.output().await?;
		if frame.is_end_of_stream() {
			break;
		}

		skipped += frame.skipped as u64;
		frames += 1;

		tracing::trace!(timestamp = frame.timestamp, width = frame.width(), height = frame.height(), "frame");

		if let Some(output) = output.as_mut() {
			write_frame(output, &frame).await?;
		}
	}

	if let Some(output) = output.as_mut() {
		output.flush().await?;
	}

	Ok((frames, skipped))
}

// Write each plane row by row, without the stride padding.
async fn write_frame<W: AsyncWrite + Unpin>(output: &mut W, frame: &OutputBuffer) -> anyhow::Result<()> {
	let width = frame.width() as usize;

	for (i, plane) in frame.planes().iter().enumerate() {
		let row = match (frame.mode(), i) {
			// Packed 32-bit pixels.
			(Some(OutputMode::Rgb), _) => width * 4,
			// 8-bit 4:2:0 chroma.
			(_, 1 | 2) => width.div_ceil(2),
			_ => width,
		};

		for bytes in plane.rows(row) {
			output.write_all(bytes).await?;
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_cli() {
		let cli = Cli::try_parse_from([
			"hevc-decode",
			"--library",
			"libopenhevc.so",
			"--init",
			"vps.bin",
			"--init",
			"sps.bin",
			"--output-buffers",
			"4",
			"--fps",
			"25",
		])
		.unwrap();

		assert_eq!(cli.init.len(), 2);
		assert_eq!(cli.decoder.output_buffers, 4);
		assert_eq!(cli.fps, 25.0);
		assert!(cli.input.is_none());
	}
}
