use std::sync::Arc;

/// A structured DRM failure reported by the engine or the crypto capability.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("decryption failed code={code}: {message}")]
pub struct DecryptionError {
	/// Engine specific error code, used by upstream key policy.
	pub code: i32,
	pub message: String,
}

impl DecryptionError {
	pub fn new(code: i32, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}
}

/// Reasons a decoder could not be constructed.
///
/// All of these are fatal: no decoder exists afterwards.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum InitError {
	#[error("decoder library is not available")]
	Unavailable,

	#[error("decoder does not support secure decode")]
	SecureDecodeUnsupported,

	#[error("failed to open decode context")]
	OpenFailed,

	#[error("invalid config: {0}")]
	InvalidConfig(&'static str),

	#[error("failed to load library: {0}")]
	Load(String),

	#[error("failed to create scratch dir: {0}")]
	ScratchDir(Arc<std::io::Error>),
}

/// A list of possible errors returned by the decoder.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	#[error("init error: {0}")]
	Init(#[from] InitError),

	/// The engine failed to decode, or failed to hand back a decoded frame.
	#[error("decode error: {0}")]
	Decode(String),

	/// The engine reported a DRM error; the cause carries the structured code.
	#[error("drm error: {}", .0.message)]
	Drm(#[source] DecryptionError),

	/// Something went wrong inside the bridge itself during a decode attempt.
	#[error("unexpected decode error: {0}")]
	Unexpected(Arc<anyhow::Error>),

	#[error("released")]
	Released,
}

impl Error {
	pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
		Self::Unexpected(Arc::new(err.into()))
	}

	/// True if the caller should apply DRM recovery (ex. re-request keys).
	pub fn is_drm(&self) -> bool {
		matches!(self, Self::Drm(_))
	}

	/// True if no further operation can succeed on this decoder.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Init(_) | Self::Released)
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;
	use std::error::Error as _;

	#[test]
	fn test_drm_source() {
		let err = Error::Drm(DecryptionError::new(6, "key expired"));
		assert!(err.is_drm());
		assert!(!err.is_fatal());
		assert_eq!(err.to_string(), "drm error: key expired");

		let source = err.source().expect("drm error has a cause");
		assert_eq!(source.to_string(), "decryption failed code=6: key expired");
	}

	#[test]
	fn test_fatal() {
		assert!(Error::Released.is_fatal());
		assert!(Error::from(InitError::OpenFailed).is_fatal());
		assert!(!Error::Decode("bad slice".into()).is_fatal());
		assert!(!Error::unexpected(anyhow::anyhow!("oops")).is_drm());
	}
}
