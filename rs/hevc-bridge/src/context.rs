use std::{fmt, path::Path, sync::Arc};

use crate::{CryptoInfo, Engine, Handle, InitError, MediaCrypto, OutputBuffer, Result};

/// An open engine context.
///
/// The handle is valid for as long as this value exists and is closed exactly once on drop.
/// Calls take `&mut self`, so a context can never have two calls in flight.
pub struct DecodeContext {
	engine: Arc<dyn Engine>,
	handle: Handle,
}

impl DecodeContext {
	/// Open a context from the codec initialization data.
	///
	/// The segments are concatenated into one buffer; their boundaries mean nothing to the engine.
	/// Fails if a `crypto` capability was supplied but the engine can't do secure decode.
	pub fn open<I, S>(engine: Arc<dyn Engine>, crypto: bool, init: I) -> Result<Self>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<[u8]>,
	{
		if !engine.is_available() {
			return Err(InitError::Unavailable.into());
		}

		if crypto && !engine.is_secure_decode_supported() {
			return Err(InitError::SecureDecodeUnsupported.into());
		}

		let init = init.into_iter().fold(Vec::new(), |mut buf, segment| {
			buf.extend_from_slice(segment.as_ref());
			buf
		});

		let handle = Handle::new(engine.open(&init)).ok_or(InitError::OpenFailed)?;
		tracing::debug!(size = init.len(), %handle, "opened decode context");

		Ok(Self { engine, handle })
	}

	pub fn handle(&self) -> Handle {
		self.handle
	}

	pub fn decode(&mut self, data: &[u8], timestamp: i64) -> i32 {
		self.engine.decode(self.handle, data, timestamp)
	}

	pub fn secure_decode(&mut self, data: &mut [u8], crypto: Option<&dyn MediaCrypto>, info: &CryptoInfo) -> i32 {
		self.engine.secure_decode(self.handle, data, crypto, info)
	}

	pub fn get_frame(&mut self, output: &mut OutputBuffer, scratch: &Path) -> i32 {
		self.engine.get_frame(self.handle, output, scratch)
	}

	pub fn error_code(&self) -> i32 {
		self.engine.error_code(self.handle)
	}

	pub fn error_message(&self) -> String {
		self.engine.error_message(self.handle)
	}

	/// Close the context now instead of waiting for drop.
	pub fn close(self) {
		drop(self)
	}
}

impl Drop for DecodeContext {
	fn drop(&mut self) {
		tracing::debug!(handle = %self.handle, "closing decode context");
		self.engine.close(self.handle);
	}
}

impl fmt::Debug for DecodeContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DecodeContext")
			.field("engine", &self.engine.name())
			.field("handle", &self.handle)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Error, testing::ScriptedEngine};

	#[test]
	fn test_concatenates_init() {
		let engine = ScriptedEngine::new();
		let context = DecodeContext::open(engine.clone(), false, [&b"vps"[..], b"sps", b"pps"]).unwrap();

		assert_eq!(engine.init_data(), b"vpsspspps");
		assert_eq!(engine.opened(), 1);
		drop(context);
	}

	#[test]
	fn test_closes_once() {
		let engine = ScriptedEngine::new();
		let context = DecodeContext::open(engine.clone(), false, [b"init"]).unwrap();
		let handle = context.handle();

		context.close();

		assert_eq!(engine.closed(), vec![handle]);
	}

	#[test]
	fn test_open_failure() {
		let engine = ScriptedEngine::new();
		engine.fail_open();

		let err = DecodeContext::open(engine.clone(), false, [b"init"]).unwrap_err();
		assert!(matches!(err, Error::Init(InitError::OpenFailed)));
		assert!(engine.closed().is_empty());
	}

	#[test]
	fn test_unavailable() {
		let engine = ScriptedEngine::new();
		engine.set_available(false);

		let err = DecodeContext::open(engine.clone(), false, [b"init"]).unwrap_err();
		assert!(matches!(err, Error::Init(InitError::Unavailable)));
		assert_eq!(engine.opened(), 0);
	}

	#[test]
	fn test_secure_decode_required() {
		let engine = ScriptedEngine::new();
		engine.set_secure_decode_supported(false);

		let err = DecodeContext::open(engine.clone(), true, [b"init"]).unwrap_err();
		assert!(matches!(err, Error::Init(InitError::SecureDecodeUnsupported)));

		// Unencrypted content is still fine.
		DecodeContext::open(engine.clone(), false, [b"init"]).unwrap();
	}
}
