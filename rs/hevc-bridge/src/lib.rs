//! # hevc-bridge: an asynchronous decode bridge for an external HEVC engine
//!
//! Compressed access units go in, decoded frames (or classified errors) come out,
//! and the decode itself runs on a dedicated worker thread so the caller never blocks on it.
//!
//! The engine is an opaque native library reached through the [Engine] trait.
//! [HevcDecoder] is the entry point: it opens a [DecodeContext], starts the worker and hands out
//! pooled [InputBuffer]s and [OutputBuffer]s.
//!
//! Errors are classified so DRM failures ([Error::Drm]) can be told apart from a corrupt stream
//! ([Error::Decode]); either halts decoding until [Decoder::flush].

mod buffer;
mod classify;
mod config;
mod context;
mod engine;
mod error;
mod hevc;
mod log;
mod pool;
mod worker;

#[cfg(test)]
mod testing;

pub use buffer::*;
pub use classify::*;
pub use config::*;
pub use context::*;
pub use engine::*;
pub use error::*;
pub use hevc::*;
pub use log::*;
pub use pool::*;
pub use worker::*;
