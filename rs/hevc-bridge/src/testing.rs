//! A scripted engine for exercising the decoder without a native library.

use std::{collections::VecDeque, path::Path, sync::Arc};

use parking_lot::{Condvar, Mutex};

use crate::{CryptoInfo, DecryptionError, Engine, Handle, MediaCrypto, OutputBuffer};

#[derive(Default)]
struct Script {
	available: bool,
	secure_supported: bool,
	fail_open: bool,

	// Codes returned by decode calls, in order; 0 once empty.
	decode_codes: VecDeque<i32>,
	frame_codes: VecDeque<i32>,

	error_code: i32,
	error_message: String,

	next_handle: u64,
	init: Vec<u8>,
	opened: usize,
	closed: Vec<Handle>,

	// Timestamps passed to decode, or -1 for secure decode.
	decoded: Vec<i64>,
	secure: Vec<CryptoInfo>,
	frames: usize,
	threads: Vec<Option<String>>,
	after_close: usize,

	// Decode calls wait while set.
	blocked: bool,
	waiting: usize,
}

pub struct ScriptedEngine {
	script: Mutex<Script>,
	changed: Condvar,
}

impl ScriptedEngine {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(Script {
				available: true,
				secure_supported: true,
				next_handle: 1,
				..Default::default()
			}),
			changed: Condvar::new(),
		})
	}

	pub fn set_available(&self, available: bool) {
		self.script.lock().available = available;
	}

	pub fn set_secure_decode_supported(&self, supported: bool) {
		self.script.lock().secure_supported = supported;
	}

	pub fn fail_open(&self) {
		self.script.lock().fail_open = true;
	}

	pub fn set_error(&self, code: i32, message: &str) {
		let mut script = self.script.lock();
		script.error_code = code;
		script.error_message = message.to_string();
	}

	/// Queue the result of the next decode call.
	pub fn push_decode(&self, code: i32) {
		self.script.lock().decode_codes.push_back(code);
	}

	/// Queue the result of the next get frame call.
	pub fn push_frame(&self, code: i32) {
		self.script.lock().frame_codes.push_back(code);
	}

	pub fn init_data(&self) -> Vec<u8> {
		self.script.lock().init.clone()
	}

	pub fn opened(&self) -> usize {
		self.script.lock().opened
	}

	pub fn closed(&self) -> Vec<Handle> {
		self.script.lock().closed.clone()
	}

	pub fn decoded(&self) -> Vec<i64> {
		self.script.lock().decoded.clone()
	}

	pub fn secure_decodes(&self) -> Vec<CryptoInfo> {
		self.script.lock().secure.clone()
	}

	pub fn frames(&self) -> usize {
		self.script.lock().frames
	}

	/// The names of the threads that made decode calls.
	pub fn threads(&self) -> Vec<Option<String>> {
		self.script.lock().threads.clone()
	}

	/// The number of calls made with a handle after it was closed.
	pub fn calls_after_close(&self) -> usize {
		self.script.lock().after_close
	}

	/// Hold every decode call until [Self::unblock].
	pub fn block(&self) {
		self.script.lock().blocked = true;
	}

	pub fn unblock(&self) {
		self.script.lock().blocked = false;
		self.changed.notify_all();
	}

	/// Wait until a decode call is held by [Self::block].
	pub fn wait_blocked(&self) {
		let mut script = self.script.lock();
		while script.waiting == 0 {
			self.changed.wait(&mut script);
		}
	}

	fn call(&self, context: Handle) -> parking_lot::MutexGuard<'_, Script> {
		let mut script = self.script.lock();
		if script.closed.contains(&context) {
			script.after_close += 1;
		}
		script
	}

	fn decode_code(&self, context: Handle) -> i32 {
		let mut script = self.call(context);
		script.threads.push(std::thread::current().name().map(str::to_string));

		if script.blocked {
			script.waiting += 1;
			self.changed.notify_all();
			while script.blocked {
				self.changed.wait(&mut script);
			}
			script.waiting -= 1;
		}

		script.decode_codes.pop_front().unwrap_or(0)
	}
}

impl Engine for ScriptedEngine {
	fn version(&self) -> String {
		"-test".to_string()
	}

	fn is_available(&self) -> bool {
		self.script.lock().available
	}

	fn is_secure_decode_supported(&self) -> bool {
		self.script.lock().secure_supported
	}

	fn open(&self, init: &[u8]) -> u64 {
		let mut script = self.script.lock();
		if script.fail_open {
			return 0;
		}

		script.init = init.to_vec();
		script.opened += 1;
		script.next_handle += 1;
		script.next_handle
	}

	fn close(&self, context: Handle) {
		self.call(context).closed.push(context);
	}

	fn decode(&self, context: Handle, _data: &[u8], timestamp: i64) -> i32 {
		let code = self.decode_code(context);
		self.script.lock().decoded.push(timestamp);
		code
	}

	fn secure_decode(
		&self,
		context: Handle,
		data: &mut [u8],
		crypto: Option<&dyn MediaCrypto>,
		info: &CryptoInfo,
	) -> i32 {
		let code = self.decode_code(context);

		let mut script = self.script.lock();
		script.decoded.push(-1);
		script.secure.push(info.clone());

		let Some(crypto) = crypto else {
			script.error_code = 1;
			script.error_message = "no crypto".to_string();
			return -2;
		};

		if let Err(err) = crypto.decrypt(info, data) {
			script.error_code = err.code;
			script.error_message = err.message;
			return -2;
		}

		code
	}

	fn get_frame(&self, context: Handle, output: &mut OutputBuffer, _scratch: &Path) -> i32 {
		let mut script = self.call(context);
		script.frames += 1;

		let code = script.frame_codes.pop_front().unwrap_or(0);
		if code == 0 {
			// A 4x2 frame with 4:2:0 chroma, luma padded to a stride of 8.
			let planes = output.init_yuv(4, 2, [8, 2, 2], [2, 1, 1]);
			for plane in planes {
				plane.data.fill(0x80);
			}
		}

		code
	}

	fn error_code(&self, context: Handle) -> i32 {
		self.call(context).error_code
	}

	fn error_message(&self, context: Handle) -> String {
		self.call(context).error_message.clone()
	}
}

/// Inverts the encrypted spans, or fails if the key is empty.
pub struct FakeCrypto;

impl MediaCrypto for FakeCrypto {
	fn decrypt(&self, info: &CryptoInfo, data: &mut [u8]) -> Result<(), DecryptionError> {
		if info.key.is_empty() {
			return Err(DecryptionError::new(6, "missing key"));
		}

		let mut offset = 0;
		for subsample in &info.subsamples {
			offset += subsample.clear as usize;
			let end = (offset + subsample.encrypted as usize).min(data.len());
			for byte in data.get_mut(offset..end).unwrap_or_default() {
				*byte = !*byte;
			}
			offset = end;
		}

		Ok(())
	}
}
