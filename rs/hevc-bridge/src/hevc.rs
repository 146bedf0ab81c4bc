use std::{
	ops::Deref,
	path::PathBuf,
	sync::{
		Arc,
		atomic::{AtomicI32, Ordering},
	},
};

use crate::{
	Buffer, CryptoInfo, Decode, DecodeContext, DecodeOutcome, Decoder, DecoderConfig, Engine, Error, Flags, InitError,
	InputBuffer, MediaCrypto, OutputBuffer, OutputMode, Pool, Result,
};

/// The HEVC decode function, run on the worker thread.
pub struct Hevc {
	context: DecodeContext,
	crypto: Option<Arc<dyn MediaCrypto>>,
	output_mode: Arc<AtomicI32>,
	scratch: PathBuf,
}

impl Hevc {
	fn output_mode(&self) -> OutputMode {
		OutputMode::try_from(self.output_mode.load(Ordering::Relaxed)).unwrap_or_default()
	}
}

impl Decode for Hevc {
	type Input = InputBuffer;
	type Output = OutputBuffer;

	fn decode(&mut self, input: &mut InputBuffer, output: &mut OutputBuffer, _reset: bool) -> Result<()> {
		// The engine keeps no state that needs resetting; a flush only discards buffers.
		let code = match input.crypto.take() {
			Some(info) => {
				let covered = info.total_bytes();
				if covered > input.len() as u64 {
					return Err(Error::Decode(format!(
						"subsample layout covers {covered} bytes, access unit has {}",
						input.len()
					)));
				}

				self.context.secure_decode(input.data_mut(), self.crypto.as_deref(), &info)
			}
			None => self.context.decode(input.data(), input.timestamp),
		};

		let outcome = DecodeOutcome::classify(code, &self.context).into_result()?;

		if input.is_decode_only() {
			return Ok(());
		}

		let mode = self.output_mode();
		output.init(input.timestamp, mode);

		let code = self.context.get_frame(output, &self.scratch);
		if let DecodeOutcome::Success { decode_only: true, .. } = outcome.with_frame(code).into_result()? {
			tracing::trace!(timestamp = input.timestamp, "no frame yet");
			output.add_flag(Flags::DECODE_ONLY);
		}

		output.color = input.color.take();

		Ok(())
	}
}

/// Whether [HevcDecoder::enqueue_input] accepted the access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
	Queued,
	/// Every input buffer is in use; try again after dequeuing output.
	Busy,
}

/// An asynchronous HEVC decoder backed by an external engine.
///
/// Derefs to the generic [Decoder] for the buffer level API ([Decoder::input], [Decoder::output], [Decoder::flush]...).
pub struct HevcDecoder {
	decoder: Decoder<Hevc>,
	name: String,
	output_mode: Arc<AtomicI32>,
}

impl HevcDecoder {
	/// Open a decode context and start the worker.
	///
	/// `init` is the codec initialization data (ex. VPS, SPS and PPS), in any number of segments.
	/// Supplying `crypto` requires an engine with secure decode support.
	pub fn new<I, S>(
		config: &DecoderConfig,
		engine: Arc<dyn Engine>,
		crypto: Option<Arc<dyn MediaCrypto>>,
		init: I,
	) -> Result<Self>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<[u8]>,
	{
		config.validate()?;

		let scratch = config.scratch_dir();
		std::fs::create_dir_all(&scratch).map_err(|err| InitError::ScratchDir(Arc::new(err)))?;

		let context = DecodeContext::open(engine.clone(), crypto.is_some(), init)?;
		let name = format!("{}{}", engine.name(), engine.version());
		let output_mode = Arc::new(AtomicI32::new(config.output_mode.into()));

		let hevc = Hevc {
			context,
			crypto,
			output_mode: output_mode.clone(),
			scratch,
		};

		let initial_input_size = config.initial_input_size;
		let inputs = Pool::new(config.input_buffers, || InputBuffer::new(initial_input_size));
		let outputs = Pool::new(config.output_buffers, OutputBuffer::new);

		let decoder = Decoder::new("hevc-decode", hevc, inputs, outputs)?;

		tracing::info!(
			%name,
			inputs = config.input_buffers,
			outputs = config.output_buffers,
			mode = ?config.output_mode,
			"decoder started"
		);

		Ok(Self {
			decoder,
			name,
			output_mode,
		})
	}

	/// The engine identity and version, for diagnostics.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Change the format of frames decoded from now on.
	///
	/// Frames already queued keep the format they were decoded with.
	pub fn set_output_mode(&self, mode: OutputMode) {
		tracing::debug!(?mode, "output mode");
		self.output_mode.store(mode.into(), Ordering::Relaxed);
	}

	pub fn output_mode(&self) -> OutputMode {
		OutputMode::try_from(self.output_mode.load(Ordering::Relaxed)).unwrap_or_default()
	}

	/// Copy an access unit into a free input buffer and queue it.
	///
	/// Returns [Enqueue::Busy] instead of waiting when every input buffer is in use.
	pub fn enqueue_input(
		&self,
		data: &[u8],
		timestamp: i64,
		crypto: Option<CryptoInfo>,
		flags: Flags,
	) -> Result<Enqueue> {
		let Some(mut input) = self.decoder.dequeue_input()? else {
			return Ok(Enqueue::Busy);
		};

		fill(&mut input, data, timestamp, crypto, flags);
		self.decoder.queue_input(input)?;

		Ok(Enqueue::Queued)
	}

	/// Like [Self::enqueue_input], but waits for a free input buffer.
	pub async fn enqueue(&self, data: &[u8], timestamp: i64, crypto: Option<CryptoInfo>, flags: Flags) -> Result<()> {
		let mut input = self.decoder.input().await?;
		fill(&mut input, data, timestamp, crypto, flags);
		self.decoder.queue_input(input)
	}

	/// Queue an end of stream marker, delivered as an empty output after every earlier frame.
	pub async fn finish(&self) -> Result<()> {
		self.enqueue(&[], 0, None, Flags::END_OF_STREAM).await
	}
}

fn fill(input: &mut InputBuffer, data: &[u8], timestamp: i64, crypto: Option<CryptoInfo>, mut flags: Flags) {
	if crypto.is_some() {
		flags.insert(Flags::ENCRYPTED);
	}

	input.write(data);
	input.timestamp = timestamp;
	input.crypto = crypto;
	input.set_flags(flags);
}

impl Deref for HevcDecoder {
	type Target = Decoder<Hevc>;

	fn deref(&self) -> &Self::Target {
		&self.decoder
	}
}

impl std::fmt::Debug for HevcDecoder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HevcDecoder")
			.field("name", &self.name)
			.field("decoder", &self.decoder)
			.finish()
	}
}
