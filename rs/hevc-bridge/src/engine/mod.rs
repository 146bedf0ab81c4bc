//! The boundary with the external decoding engine.
//!
//! The engine is an opaque native library reached through synchronous calls.
//! Every call keeps the engine's numeric contract: [Engine::open] returns 0 on failure,
//! decode calls return the codes in [crate::Status] and [crate::FrameStatus].
//! Nothing here is reentrant; [crate::DecodeContext] makes sure only one call is in flight per handle.

#[cfg(feature = "native")]
mod native;

#[cfg(feature = "native")]
pub use native::*;

use std::{num::NonZeroU64, path::Path};

use crate::{CryptoInfo, DecryptionError, OutputBuffer};

/// A raw context handle, as returned by the engine.
pub type Handle = NonZeroU64;

/// The foreign-call surface of a decoding engine.
pub trait Engine: Send + Sync + 'static {
	/// A short identifier for the library, used in diagnostics.
	fn name(&self) -> &str {
		"libopenhevc"
	}

	fn version(&self) -> String;

	/// Whether the native library was loaded and is usable.
	fn is_available(&self) -> bool {
		true
	}

	fn is_secure_decode_supported(&self) -> bool;

	/// Create a context from the (already concatenated) initialization data.
	///
	/// Returns 0 on failure.
	fn open(&self, init: &[u8]) -> u64;

	fn close(&self, context: Handle);

	fn decode(&self, context: Handle, data: &[u8], timestamp: i64) -> i32;

	/// Decrypt in place using `crypto`, then decode.
	///
	/// `crypto` is passed through as given; the engine reports a DRM error if it needs one.
	fn secure_decode(
		&self,
		context: Handle,
		data: &mut [u8],
		crypto: Option<&dyn MediaCrypto>,
		info: &CryptoInfo,
	) -> i32;

	/// Write the next decoded frame into `output`.
	///
	/// `scratch` is a directory the engine may use for intermediate files.
	fn get_frame(&self, context: Handle, output: &mut OutputBuffer, scratch: &Path) -> i32;

	/// The structured code for the last DRM error.
	fn error_code(&self, context: Handle) -> i32;

	/// A human readable message for the last error.
	fn error_message(&self, context: Handle) -> String;
}

/// The decryption capability consumed by secure decode.
pub trait MediaCrypto: Send + Sync + 'static {
	/// Decrypt the encrypted spans of `data` in place, as described by the subsample layout.
	fn decrypt(&self, info: &CryptoInfo, data: &mut [u8]) -> Result<(), DecryptionError>;
}
