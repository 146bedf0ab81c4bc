//! Maps engine result codes to typed outcomes.
//!
//! The numeric values are a fixed contract with the native engine.
//! DO NOT renumber them without changing the native side too.

use crate::{DecodeContext, DecryptionError, Error};

/// The result of a decode or secure decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(i32)]
pub enum Status {
	NoError = 0,
	DecodeError = -1,
	DrmError = -2,
}

/// The result of asking the engine for a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(i32)]
pub enum FrameStatus {
	Produced = 0,
	/// Nothing to output yet; treated as decode-only.
	NoFrame = 1,
	Failed = -1,
}

/// The outcome of exactly one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
	Success { produced_frame: bool, decode_only: bool },
	DrmFailure { code: i32, message: String },
	DecodeFailure { message: String },
}

impl DecodeOutcome {
	/// Classify the code returned by a decode call.
	///
	/// DRM errors query the context for the structured code and message.
	/// A success here has not produced a frame yet; see [Self::with_frame].
	pub fn classify(code: i32, context: &DecodeContext) -> Self {
		match Status::try_from(code) {
			Ok(Status::NoError) => Self::Success {
				produced_frame: false,
				decode_only: false,
			},
			Ok(Status::DrmError) => Self::DrmFailure {
				code: context.error_code(),
				message: or_unspecified(context.error_message()),
			},
			Ok(Status::DecodeError) => Self::DecodeFailure {
				message: or_unspecified(context.error_message()),
			},
			Err(_) => Self::DecodeFailure {
				message: format!("unknown result code: {code}"),
			},
		}
	}

	/// Fold in the result of retrieving the frame after a successful decode.
	pub fn with_frame(self, code: i32) -> Self {
		match self {
			Self::Success { .. } => match FrameStatus::try_from(code) {
				Ok(FrameStatus::Produced) => Self::Success {
					produced_frame: true,
					decode_only: false,
				},
				Ok(FrameStatus::NoFrame) => Self::Success {
					produced_frame: false,
					decode_only: true,
				},
				Ok(FrameStatus::Failed) => Self::DecodeFailure {
					message: "get frame failed".to_string(),
				},
				Err(_) => Self::DecodeFailure {
					message: format!("unknown frame code: {code}"),
				},
			},
			failure => failure,
		}
	}

	pub fn into_result(self) -> Result<Self, Error> {
		match self {
			Self::DrmFailure { code, message } => Err(Error::Drm(DecryptionError::new(code, message))),
			Self::DecodeFailure { message } => Err(Error::Decode(message)),
			success => Ok(success),
		}
	}
}

// The engine may not have a message, but the consumer always gets one.
fn or_unspecified(message: String) -> String {
	match message.is_empty() {
		true => "unspecified".to_string(),
		false => message,
	}
}
