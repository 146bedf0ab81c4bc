//! A generic asynchronous decoder, split into a caller-facing [Decoder] and a dedicated worker thread.
//!
//! The caller queues input buffers and dequeues output buffers; the worker pulls one input at a time,
//! runs the pluggable [Decode] function, and queues the result.
//! All shared state (pools, queues, the pending error) lives behind a single [watch::Sender],
//! so every handoff is one atomic modification and waiters are woken on change.

use std::{
	collections::VecDeque,
	fmt,
	ops::{Deref, DerefMut},
	panic::AssertUnwindSafe,
	thread,
};

use tokio::sync::watch;

use crate::{Buffer, Error, Flags, Pool, Result};

/// A decode function plugged into a [Decoder].
pub trait Decode: Send + 'static {
	type Input: Buffer;
	type Output: Buffer;

	/// Decode one input into `output`.
	///
	/// Only ever called from the worker thread, one input at a time.
	/// `reset` is true for the first call after a flush.
	/// Flag `output` as [Flags::DECODE_ONLY] to drop it instead of delivering it.
	fn decode(&mut self, input: &mut Self::Input, output: &mut Self::Output, reset: bool) -> Result<()>;
}

/// What the worker thread is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	/// Waiting for an input (and a free output).
	Idle,
	/// A decode call is in flight.
	Decoding,
	/// Queuing the result for the consumer.
	Delivering,
	/// The last attempt failed; nothing is decoded until a flush.
	Failed,
	/// A flush was requested and not yet observed by the worker.
	Resetting,
	/// Terminal.
	Released,
}

/// A snapshot of the decoder, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
	pub worker: WorkerState,
	pub inputs_available: usize,
	pub inputs_outstanding: usize,
	pub outputs_available: usize,
	pub outputs_outstanding: usize,
	pub queued_inputs: usize,
	pub queued_outputs: usize,
	pub decoded: u64,
	pub skipped: u64,
}

struct State<D: Decode> {
	inputs: Pool<D::Input>,
	outputs: Pool<D::Output>,

	// Waiting for the worker.
	queued_inputs: VecDeque<D::Input>,

	// Waiting for the consumer.
	queued_outputs: VecDeque<D::Output>,

	worker: WorkerState,

	// Set when an attempt fails, cleared by a flush.
	error: Option<Error>,

	released: bool,

	// +1 on every flush or release; results from an older epoch are discarded.
	epoch: u64,

	// Passed to the next decode call.
	reset: bool,

	// Decode-only outputs dropped since the last delivered output.
	skipped: usize,

	decoded: u64,
	skipped_total: u64,
}

impl<D: Decode> State<D> {
	fn new(inputs: Pool<D::Input>, outputs: Pool<D::Output>) -> Self {
		Self {
			inputs,
			outputs,
			queued_inputs: VecDeque::new(),
			queued_outputs: VecDeque::new(),
			worker: WorkerState::Idle,
			error: None,
			released: false,
			epoch: 0,
			reset: false,
			skipped: 0,
			decoded: 0,
			skipped_total: 0,
		}
	}

	fn can_decode(&self) -> bool {
		!self.released && self.error.is_none() && !self.queued_inputs.is_empty() && self.outputs.available() > 0
	}

	// The error returned by caller operations, if any.
	fn check(&self) -> Result<()> {
		if self.released {
			return Err(Error::Released);
		}

		match &self.error {
			Some(err) => Err(err.clone()),
			None => Ok(()),
		}
	}

	// Return every queued buffer to its pool.
	fn drain(&mut self) {
		while let Some(input) = self.queued_inputs.pop_front() {
			self.inputs.release(input);
		}

		while let Some(output) = self.queued_outputs.pop_front() {
			self.outputs.release(output);
		}
	}

	fn finish(&mut self, input: D::Input, output: D::Output, epoch: u64, result: Result<()>) {
		self.inputs.release(input);

		if epoch != self.epoch {
			// Flushed or released while decoding; the result belongs to buffers that no longer exist.
			tracing::trace!("discarding result from before flush");
			self.outputs.release(output);
			return;
		}

		match result {
			Err(err) => {
				tracing::warn!(%err, "decode failed");
				self.outputs.release(output);
				self.error = Some(err);
				self.worker = WorkerState::Failed;
			}
			Ok(()) if output.is_decode_only() => {
				self.skipped += 1;
				self.skipped_total += 1;
				self.outputs.release(output);
				self.worker = WorkerState::Idle;
			}
			Ok(()) => {
				let mut output = output;
				output.set_skipped(std::mem::take(&mut self.skipped));
				self.queued_outputs.push_back(output);
				self.decoded += 1;
				self.worker = WorkerState::Delivering;
			}
		}
	}

	fn stats(&self) -> Stats {
		Stats {
			worker: self.worker,
			inputs_available: self.inputs.available(),
			inputs_outstanding: self.inputs.outstanding(),
			outputs_available: self.outputs.available(),
			outputs_outstanding: self.outputs.outstanding(),
			queued_inputs: self.queued_inputs.len(),
			queued_outputs: self.queued_outputs.len(),
			decoded: self.decoded,
			skipped: self.skipped_total,
		}
	}
}

enum Next<D: Decode> {
	Exit,
	Wait,
	Decode {
		input: D::Input,
		output: D::Output,
		epoch: u64,
		reset: bool,
	},
}

/// The caller side of an asynchronous decoder.
///
/// Dropping the decoder releases it.
pub struct Decoder<D: Decode> {
	state: watch::Sender<State<D>>,
	worker: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl<D: Decode> Decoder<D> {
	/// Start a worker thread named `name` that owns `decode` until the decoder is released.
	pub fn new(name: &str, decode: D, inputs: Pool<D::Input>, outputs: Pool<D::Output>) -> Result<Self> {
		let state = watch::Sender::new(State::new(inputs, outputs));

		let worker = {
			let state = state.clone();
			thread::Builder::new()
				.name(name.to_string())
				.spawn(move || Self::run(decode, state))
				.map_err(Error::unexpected)?
		};

		Ok(Self {
			state,
			worker: parking_lot::Mutex::new(Some(worker)),
		})
	}

	fn run(mut decode: D, state: watch::Sender<State<D>>) {
		let mut changed = state.subscribe();

		loop {
			let ready = futures::executor::block_on(changed.wait_for(|s| {
				s.released || s.worker == WorkerState::Resetting || s.can_decode()
			}))
			.is_ok();

			if !ready {
				break;
			}

			let mut next = Next::<D>::Wait;
			state.send_if_modified(|s| {
				if s.released {
					s.worker = WorkerState::Released;
					next = Next::Exit;
					return true;
				}

				let modified = s.worker == WorkerState::Resetting;
				if modified {
					tracing::trace!("reset");
					s.worker = WorkerState::Idle;
				}

				if !s.can_decode() {
					return modified;
				}

				if let (Some(input), Some(output)) = (s.queued_inputs.pop_front(), s.outputs.acquire()) {
					next = Next::Decode {
						input,
						output,
						epoch: s.epoch,
						reset: std::mem::take(&mut s.reset),
					};
					s.worker = WorkerState::Decoding;
				}

				true
			});

			let (mut input, mut output, epoch, reset) = match next {
				Next::Exit => break,
				Next::Wait => continue,
				Next::Decode {
					input,
					output,
					epoch,
					reset,
				} => (input, output, epoch, reset),
			};

			let result = if input.is_end_of_stream() {
				output.add_flag(Flags::END_OF_STREAM);
				Ok(())
			} else {
				if input.is_decode_only() {
					output.add_flag(Flags::DECODE_ONLY);
				}

				std::panic::catch_unwind(AssertUnwindSafe(|| decode.decode(&mut input, &mut output, reset)))
					.unwrap_or_else(|panic| Err(Error::unexpected(anyhow::anyhow!("{}", panic_message(&panic)))))
			};

			state.send_modify(|s| s.finish(input, output, epoch, result));

			state.send_if_modified(|s| {
				if s.worker != WorkerState::Delivering {
					return false;
				}

				s.worker = WorkerState::Idle;
				true
			});
		}

		tracing::debug!("decode worker exited");
	}

	/// Take an empty input buffer, or None if they are all in use.
	///
	/// Returns the pending error if the last decode failed.
	pub fn dequeue_input(&self) -> Result<Option<Input<D>>> {
		let mut result = Ok(None);

		self.state.send_if_modified(|s| {
			result = s.check().map(|_| s.inputs.acquire());
			false
		});

		Ok(result?.map(|buffer| Input {
			buffer: Some(buffer),
			state: self.state.clone(),
		}))
	}

	/// Wait for an empty input buffer.
	pub async fn input(&self) -> Result<Input<D>> {
		let mut changed = self.state.subscribe();

		loop {
			if let Some(input) = self.dequeue_input()? {
				return Ok(input);
			}

			changed
				.wait_for(|s| s.released || s.error.is_some() || s.inputs.available() > 0)
				.await
				.map_err(|_| Error::Released)?;
		}
	}

	/// Queue a filled input buffer for decoding.
	///
	/// The input must have been leased from this decoder.
	pub fn queue_input(&self, mut input: Input<D>) -> Result<()> {
		if !input.state.same_channel(&self.state) {
			// Dropping it returns it to the decoder it came from.
			return Err(Error::unexpected(anyhow::anyhow!("input buffer leased from another decoder")));
		}

		let Some(buffer) = input.buffer.take() else {
			return Ok(());
		};

		let mut result = Ok(());

		self.state.send_modify(|s| {
			result = s.check();
			match result {
				Ok(()) => s.queued_inputs.push_back(buffer),
				Err(_) => s.inputs.release(buffer),
			}
		});

		result
	}

	/// Take the next decoded output, or None if nothing is ready.
	///
	/// Outputs queued before a failure are delivered first, then the error is returned until a flush.
	pub fn dequeue_output(&self) -> Result<Option<Output<D>>> {
		let mut result = Ok(None);

		self.state.send_if_modified(|s| {
			if s.released {
				result = Err(Error::Released);
			} else if let Some(output) = s.queued_outputs.pop_front() {
				result = Ok(Some(output));
			} else {
				result = s.check().map(|_| None);
			}

			false
		});

		Ok(result?.map(|buffer| Output {
			buffer: Some(buffer),
			state: self.state.clone(),
		}))
	}

	/// Wait for the next decoded output.
	pub async fn output(&self) -> Result<Output<D>> {
		let mut changed = self.state.subscribe();

		loop {
			if let Some(output) = self.dequeue_output()? {
				return Ok(output);
			}

			changed
				.wait_for(|s| s.released || s.error.is_some() || !s.queued_outputs.is_empty())
				.await
				.map_err(|_| Error::Released)?;
		}
	}

	/// Discard every queued and in-flight buffer and clear any pending error.
	///
	/// The engine is not told; an in-flight decode runs to completion and its result is dropped.
	pub fn flush(&self) -> Result<()> {
		let mut result = Ok(());

		self.state.send_if_modified(|s| {
			if s.released {
				result = Err(Error::Released);
				return false;
			}

			s.drain();
			s.epoch += 1;
			s.reset = true;
			s.skipped = 0;
			s.error = None;
			s.worker = WorkerState::Resetting;

			true
		});

		tracing::debug!(ok = result.is_ok(), "flush");
		result
	}

	/// Stop the worker and return every queued buffer to its pool.
	///
	/// Blocks until an in-flight decode finishes. Every later operation fails with [Error::Released].
	pub fn release(&self) -> Result<()> {
		let mut result = Ok(());

		self.state.send_if_modified(|s| {
			if s.released {
				result = Err(Error::Released);
				return false;
			}

			s.released = true;
			s.epoch += 1;
			s.error = None;
			s.drain();

			true
		});

		result?;

		if let Some(worker) = self.worker.lock().take() {
			if worker.join().is_err() {
				tracing::error!("decode worker panicked");
			}
		}

		tracing::debug!("released");
		Ok(())
	}

	pub fn is_released(&self) -> bool {
		self.state.borrow().released
	}

	pub fn stats(&self) -> Stats {
		self.state.borrow().stats()
	}
}

impl<D: Decode> Drop for Decoder<D> {
	fn drop(&mut self) {
		self.release().ok();
	}
}

impl<D: Decode> fmt::Debug for Decoder<D> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Decoder").field("stats", &self.stats()).finish()
	}
}

/// An input buffer leased from a [Decoder].
///
/// Fill it and pass it to [Decoder::queue_input]; dropping it returns it to the pool instead.
pub struct Input<D: Decode> {
	// Only None after being queued.
	buffer: Option<D::Input>,
	state: watch::Sender<State<D>>,
}

impl<D: Decode> Deref for Input<D> {
	type Target = D::Input;

	fn deref(&self) -> &Self::Target {
		self.buffer.as_ref().expect("input buffer already queued")
	}
}

impl<D: Decode> DerefMut for Input<D> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.buffer.as_mut().expect("input buffer already queued")
	}
}

impl<D: Decode> Drop for Input<D> {
	fn drop(&mut self) {
		if let Some(buffer) = self.buffer.take() {
			self.state.send_modify(|s| s.inputs.release(buffer));
		}
	}
}

/// A decoded output buffer.
///
/// Returned to the pool when dropped, including after the decoder was released.
pub struct Output<D: Decode> {
	buffer: Option<D::Output>,
	state: watch::Sender<State<D>>,
}

impl<D: Decode> Output<D> {
	/// Return the buffer to the pool now.
	pub fn release(self) {
		drop(self)
	}
}

impl<D: Decode> Deref for Output<D> {
	type Target = D::Output;

	fn deref(&self) -> &Self::Target {
		self.buffer.as_ref().expect("output buffer already released")
	}
}

impl<D: Decode> DerefMut for Output<D> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.buffer.as_mut().expect("output buffer already released")
	}
}

impl<D: Decode> Drop for Output<D> {
	fn drop(&mut self) {
		if let Some(buffer) = self.buffer.take() {
			self.state.send_modify(|s| s.outputs.release(buffer));
		}
	}
}

impl<D: Decode> fmt::Debug for Input<D>
where
	D::Input: fmt::Debug,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.buffer.fmt(f)
	}
}

impl<D: Decode> fmt::Debug for Output<D>
where
	D::Output: fmt::Debug,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.buffer.fmt(f)
	}
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
	if let Some(msg) = panic.downcast_ref::<&str>() {
		return format!("decoder panicked: {msg}");
	}

	if let Some(msg) = panic.downcast_ref::<String>() {
		return format!("decoder panicked: {msg}");
	}

	"decoder panicked".to_string()
}
