//! An [Engine] backed by a C shared library, loaded at runtime with `libloading`.
//!
//! The library exports:
//!
//! ```c
//! uint64_t hevc_init(const uint8_t *init, size_t len);
//! void hevc_close(uint64_t ctx);
//! int32_t hevc_decode(uint64_t ctx, const uint8_t *data, size_t len, int64_t time_us);
//! int32_t hevc_secure_decode(uint64_t ctx, uint8_t *data, size_t len, const hevc_crypto *crypto,
//!     const hevc_crypto_info *info);
//! int32_t hevc_get_frame(uint64_t ctx, int32_t output_mode, const char *scratch, hevc_frame *frame);
//! int32_t hevc_get_error_code(uint64_t ctx);
//! const char *hevc_get_error_message(uint64_t ctx);
//! int32_t hevc_is_secure_decode_supported(void);
//! const char *hevc_get_version(void);
//! ```
//!
//! Frame planes are owned by the library and only valid until the next call on the same context,
//! so they are copied into the [OutputBuffer] immediately.

use std::{
	ffi::{CStr, CString, c_char, c_void},
	path::Path,
};

use libloading::Library;
use parking_lot::Mutex;

use crate::{CryptoInfo, DecryptionError, Engine, Handle, InitError, MediaCrypto, OutputBuffer, OutputMode};

type InitFn = unsafe extern "C" fn(init: *const u8, len: usize) -> u64;
type CloseFn = unsafe extern "C" fn(ctx: u64);
type DecodeFn = unsafe extern "C" fn(ctx: u64, data: *const u8, len: usize, time_us: i64) -> i32;
type SecureDecodeFn =
	unsafe extern "C" fn(ctx: u64, data: *mut u8, len: usize, crypto: *const RawCrypto, info: *const RawCryptoInfo) -> i32;
type GetFrameFn = unsafe extern "C" fn(ctx: u64, output_mode: i32, scratch: *const c_char, frame: *mut RawFrame) -> i32;
type ErrorCodeFn = unsafe extern "C" fn(ctx: u64) -> i32;
type ErrorMessageFn = unsafe extern "C" fn(ctx: u64) -> *const c_char;
type SecureSupportedFn = unsafe extern "C" fn() -> i32;
type VersionFn = unsafe extern "C" fn() -> *const c_char;

type DecryptFn =
	unsafe extern "C" fn(user_data: *mut c_void, info: *const RawCryptoInfo, data: *mut u8, len: usize) -> i32;

/// The decryption capability, handed to the library for the duration of one secure decode call.
///
/// A null pointer is passed when no capability was supplied.
#[repr(C)]
struct RawCrypto {
	user_data: *mut c_void,
	decrypt: DecryptFn,
}

#[repr(C)]
struct RawCryptoInfo {
	mode: i32,
	key: *const u8,
	key_len: usize,
	iv: *const u8,
	iv_len: usize,
	subsamples: usize,
	clear_bytes: *const u32,
	encrypted_bytes: *const u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawPlane {
	data: *const u8,
	stride: usize,
	rows: usize,
}

#[repr(C)]
struct RawFrame {
	time_us: i64,
	width: u32,
	height: u32,
	planes: u32,
	plane: [RawPlane; 3],
}

impl Default for RawFrame {
	fn default() -> Self {
		let plane = RawPlane {
			data: std::ptr::null(),
			stride: 0,
			rows: 0,
		};

		Self {
			time_us: 0,
			width: 0,
			height: 0,
			planes: 0,
			plane: [plane; 3],
		}
	}
}

// The symbols, copied out of the library. Only valid while `NativeEngine::_lib` is loaded.
struct Functions {
	init: InitFn,
	close: CloseFn,
	decode: DecodeFn,
	secure_decode: SecureDecodeFn,
	get_frame: GetFrameFn,
	error_code: ErrorCodeFn,
	error_message: ErrorMessageFn,
	secure_supported: SecureSupportedFn,
	version: VersionFn,
}

impl Functions {
	/// # Safety
	/// The library must export every symbol with the signature above.
	unsafe fn load(lib: &Library) -> Result<Self, InitError> {
		unsafe {
			Ok(Self {
				init: symbol(lib, b"hevc_init\0")?,
				close: symbol(lib, b"hevc_close\0")?,
				decode: symbol(lib, b"hevc_decode\0")?,
				secure_decode: symbol(lib, b"hevc_secure_decode\0")?,
				get_frame: symbol(lib, b"hevc_get_frame\0")?,
				error_code: symbol(lib, b"hevc_get_error_code\0")?,
				error_message: symbol(lib, b"hevc_get_error_message\0")?,
				secure_supported: symbol(lib, b"hevc_is_secure_decode_supported\0")?,
				version: symbol(lib, b"hevc_get_version\0")?,
			})
		}
	}
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, InitError> {
	// SAFETY: the caller guarantees T matches the exported signature.
	let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| {
		let name = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
		InitError::Load(format!("missing symbol {name}: {err}"))
	})?;

	Ok(*symbol)
}

/// A decoding engine loaded from a shared library.
pub struct NativeEngine {
	fns: Functions,
	version: String,
	secure: bool,

	decrypt_error: LastDecryptError,

	// Must outlive `fns`.
	_lib: Library,
}

impl NativeEngine {
	pub fn load(path: &Path) -> Result<Self, InitError> {
		tracing::info!(path = %path.display(), "loading engine library");

		// SAFETY: loading runs the library's initializers; the caller asserts it is a decoder engine.
		let lib = unsafe { Library::new(path) }.map_err(|err| InitError::Load(format!("{}: {err}", path.display())))?;

		// SAFETY: the symbols are declared with the signatures documented above.
		let fns = unsafe { Functions::load(&lib)? };

		// SAFETY: both take no arguments; the version string is static.
		let version = unsafe { string((fns.version)()) };
		let secure = unsafe { (fns.secure_supported)() } != 0;

		tracing::debug!(%version, secure, "loaded engine library");

		Ok(Self {
			fns,
			version,
			secure,
			decrypt_error: LastDecryptError::default(),
			_lib: lib,
		})
	}
}

/// The last failure reported by the crypto capability, which the library only sees as a code.
///
/// Only describes the most recent decode call on its context.
#[derive(Default)]
struct LastDecryptError(Mutex<Option<(Handle, DecryptionError)>>);

impl LastDecryptError {
	// Forget any failure from an earlier call on this context.
	fn clear(&self, context: Handle) {
		self.take(context);
	}

	// Record the outcome of a secure decode call.
	fn settle(&self, context: Handle, code: i32, err: Option<DecryptionError>) {
		let Some(err) = err else {
			return;
		};

		if code == 0 {
			tracing::debug!(%err, "decrypt callback failed but the decode succeeded");
			return;
		}

		tracing::debug!(%err, code, "decrypt callback failed");
		*self.0.lock() = Some((context, err));
	}

	fn code(&self, context: Handle) -> Option<i32> {
		self.0.lock().as_ref().filter(|(handle, _)| *handle == context).map(|(_, err)| err.code)
	}

	fn take(&self, context: Handle) -> Option<DecryptionError> {
		let mut last = self.0.lock();
		match last.take() {
			Some((handle, err)) if handle == context => Some(err),
			other => {
				*last = other;
				None
			}
		}
	}
}

impl Engine for NativeEngine {
	fn version(&self) -> String {
		self.version.clone()
	}

	fn is_secure_decode_supported(&self) -> bool {
		self.secure
	}

	fn open(&self, init: &[u8]) -> u64 {
		unsafe { (self.fns.init)(init.as_ptr(), init.len()) }
	}

	fn close(&self, context: Handle) {
		self.decrypt_error.clear(context);
		unsafe { (self.fns.close)(context.get()) }
	}

	fn decode(&self, context: Handle, data: &[u8], timestamp: i64) -> i32 {
		self.decrypt_error.clear(context);
		unsafe { (self.fns.decode)(context.get(), data.as_ptr(), data.len(), timestamp) }
	}

	fn secure_decode(
		&self,
		context: Handle,
		data: &mut [u8],
		crypto: Option<&dyn MediaCrypto>,
		info: &CryptoInfo,
	) -> i32 {
		self.decrypt_error.clear(context);

		let clear = info.clear_bytes();
		let encrypted = info.encrypted_bytes();

		let raw_info = RawCryptoInfo {
			mode: info.mode.into(),
			key: info.key.as_ptr(),
			key_len: info.key.len(),
			iv: info.iv.as_ptr(),
			iv_len: info.iv.len(),
			subsamples: info.subsamples.len(),
			clear_bytes: clear.as_ptr(),
			encrypted_bytes: encrypted.as_ptr(),
		};

		let mut callback = crypto.map(|crypto| Callback {
			crypto,
			info,
			error: None,
		});

		let raw_crypto = callback.as_mut().map(|callback| RawCrypto {
			user_data: callback as *mut Callback as *mut c_void,
			decrypt: decrypt_trampoline,
		});

		let crypto_ptr = raw_crypto.as_ref().map_or(std::ptr::null(), |raw| raw as *const RawCrypto);

		// SAFETY: every pointer refers to locals that outlive the call.
		let code = unsafe {
			(self.fns.secure_decode)(context.get(), data.as_mut_ptr(), data.len(), crypto_ptr, &raw_info)
		};

		self.decrypt_error.settle(context, code, callback.and_then(|callback| callback.error));

		code
	}

	fn get_frame(&self, context: Handle, output: &mut OutputBuffer, scratch: &Path) -> i32 {
		let mode = output.mode().unwrap_or_default();

		let Ok(scratch) = CString::new(scratch.to_string_lossy().into_owned()) else {
			tracing::warn!(scratch = %scratch.display(), "scratch path contains a nul byte");
			return -1;
		};

		let mut frame = RawFrame::default();

		// SAFETY: the frame is a plain out parameter, the scratch string outlives the call.
		let code = unsafe { (self.fns.get_frame)(context.get(), mode.into(), scratch.as_ptr(), &mut frame) };
		if code != 0 {
			return code;
		}

		// SAFETY: on success the planes point at library memory valid until the next call.
		unsafe { copy_frame(&frame, mode, output) };
		code
	}

	fn error_code(&self, context: Handle) -> i32 {
		if let Some(code) = self.decrypt_error.code(context) {
			return code;
		}

		unsafe { (self.fns.error_code)(context.get()) }
	}

	fn error_message(&self, context: Handle) -> String {
		if let Some(err) = self.decrypt_error.take(context) {
			return err.message;
		}

		unsafe { string((self.fns.error_message)(context.get())) }
	}
}

impl std::fmt::Debug for NativeEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NativeEngine")
			.field("version", &self.version)
			.field("secure", &self.secure)
			.finish()
	}
}

struct Callback<'a> {
	crypto: &'a dyn MediaCrypto,
	info: &'a CryptoInfo,
	error: Option<DecryptionError>,
}

unsafe extern "C" fn decrypt_trampoline(
	user_data: *mut c_void,
	_info: *const RawCryptoInfo,
	data: *mut u8,
	len: usize,
) -> i32 {
	// Never unwind into the library.
	let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
		// SAFETY: user_data is the Callback created by secure_decode, alive for the whole call.
		let callback = unsafe { &mut *(user_data as *mut Callback) };

		let data: &mut [u8] = if data.is_null() {
			&mut []
		} else {
			// SAFETY: the library passes the buffer it was given, or a span of it.
			unsafe { std::slice::from_raw_parts_mut(data, len) }
		};

		match callback.crypto.decrypt(callback.info, data) {
			Ok(()) => 0,
			Err(err) => {
				let code = if err.code == 0 { -1 } else { err.code };
				callback.error = Some(err);
				code
			}
		}
	}));

	result.unwrap_or(-1)
}

unsafe fn copy_frame(frame: &RawFrame, mode: OutputMode, output: &mut OutputBuffer) {
	output.timestamp = frame.time_us;

	let count = (frame.planes as usize).min(frame.plane.len());
	let raw = &frame.plane[..count];

	let planes = match mode {
		OutputMode::Rgb => {
			let stride = raw.first().map_or(0, |p| p.stride);
			std::slice::from_mut(output.init_rgb(frame.width, frame.height, stride))
		}
		OutputMode::Yuv | OutputMode::None => {
			let mut strides = [0; 3];
			let mut rows = [0; 3];
			for (i, plane) in raw.iter().enumerate() {
				strides[i] = plane.stride;
				rows[i] = plane.rows;
			}
			output.init_yuv(frame.width, frame.height, strides, rows)
		}
	};

	for (plane, raw) in planes.iter_mut().zip(raw) {
		if raw.data.is_null() {
			continue;
		}

		// SAFETY: the library guarantees stride * rows readable bytes per plane.
		let src = unsafe { std::slice::from_raw_parts(raw.data, raw.stride * raw.rows) };
		let len = src.len().min(plane.data.len());
		plane.data[..len].copy_from_slice(&src[..len]);
	}
}

unsafe fn string(ptr: *const c_char) -> String {
	if ptr.is_null() {
		return String::new();
	}

	// SAFETY: the library returns nul terminated strings.
	unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::FakeCrypto;
	use crate::{CryptoMode, Subsample};

	#[test]
	fn test_missing_library() {
		let err = NativeEngine::load(Path::new("/nonexistent/libopenhevc.so")).unwrap_err();
		assert!(matches!(err, InitError::Load(ref msg) if msg.contains("/nonexistent/libopenhevc.so")));
	}

	#[test]
	fn test_trampoline() {
		let info = CryptoInfo {
			mode: CryptoMode::AesCtr,
			key: vec![1],
			iv: vec![0; 16],
			subsamples: vec![Subsample::new(1, 2)],
		};

		let mut callback = Callback {
			crypto: &FakeCrypto,
			info: &info,
			error: None,
		};

		let mut data = [0x00, 0x0f, 0xf0, 0x55];
		let code = unsafe {
			decrypt_trampoline(
				&mut callback as *mut Callback as *mut c_void,
				std::ptr::null(),
				data.as_mut_ptr(),
				data.len(),
			)
		};

		assert_eq!(code, 0);
		assert_eq!(data, [0x00, 0xf0, 0x0f, 0x55]);
		assert!(callback.error.is_none());
	}

	#[test]
	fn test_trampoline_error() {
		let info = CryptoInfo::default();
		let mut callback = Callback {
			crypto: &FakeCrypto,
			info: &info,
			error: None,
		};

		let code = unsafe {
			decrypt_trampoline(
				&mut callback as *mut Callback as *mut c_void,
				std::ptr::null(),
				std::ptr::null_mut(),
				0,
			)
		};

		assert_eq!(code, 6);
		assert_eq!(callback.error.unwrap().message, "missing key");
	}

	#[test]
	fn test_decrypt_error_tolerated() {
		let last = LastDecryptError::default();
		let context = Handle::new(7).unwrap();

		// The library shrugged off the failed callback, so nothing is kept.
		last.settle(context, 0, Some(DecryptionError::new(6, "missing key")));
		assert_eq!(last.code(context), None);
		assert!(last.take(context).is_none());
	}

	#[test]
	fn test_decrypt_error_per_call() {
		let last = LastDecryptError::default();
		let context = Handle::new(7).unwrap();
		let other = Handle::new(8).unwrap();

		last.settle(context, -2, Some(DecryptionError::new(6, "missing key")));
		assert_eq!(last.code(other), None);
		assert_eq!(last.code(context), Some(6));

		// The next call on the context starts clean, so the library's own cause is reported.
		last.clear(context);
		assert_eq!(last.code(context), None);

		last.settle(context, -2, Some(DecryptionError::new(6, "missing key")));
		assert_eq!(last.take(context).unwrap().message, "missing key");
		assert!(last.take(context).is_none());
	}

	#[test]
	fn test_copy_frame() {
		let luma = [1u8; 8 * 2];
		let chroma = [2u8; 4];
		let frame = RawFrame {
			time_us: 33_000,
			width: 4,
			height: 2,
			planes: 3,
			plane: [
				RawPlane {
					data: luma.as_ptr(),
					stride: 8,
					rows: 2,
				},
				RawPlane {
					data: chroma.as_ptr(),
					stride: 4,
					rows: 1,
				},
				RawPlane {
					data: chroma.as_ptr(),
					stride: 4,
					rows: 1,
				},
			],
		};

		let mut output = OutputBuffer::new();
		output.init(0, OutputMode::Yuv);
		unsafe { copy_frame(&frame, OutputMode::Yuv, &mut output) };

		assert_eq!(output.timestamp, 33_000);
		assert_eq!(output.width(), 4);
		assert_eq!(output.planes()[0].data, luma);
		assert_eq!(output.planes()[2].data, chroma);
	}
}
