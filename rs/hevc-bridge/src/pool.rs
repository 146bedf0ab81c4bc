use crate::Buffer;

/// A fixed set of recyclable buffers.
///
/// Every buffer is allocated up front; running out means waiting for one to come back, never allocating.
/// The pool itself is not synchronized; it lives inside the decoder state and is guarded by it.
pub struct Pool<T: Buffer> {
	free: Vec<T>,
	capacity: usize,
}

impl<T: Buffer> Pool<T> {
	pub fn new(capacity: usize, create: impl FnMut() -> T) -> Self {
		Self {
			free: std::iter::repeat_with(create).take(capacity).collect(),
			capacity,
		}
	}

	/// Take a cleared buffer, or None if they are all in use.
	pub fn acquire(&mut self) -> Option<T> {
		let mut buffer = self.free.pop()?;
		buffer.clear();
		Some(buffer)
	}

	/// Return a buffer previously handed out by [Self::acquire].
	pub fn release(&mut self, mut buffer: T) {
		if self.free.len() >= self.capacity {
			// Only possible if a buffer from another pool was returned here.
			tracing::warn!(capacity = self.capacity, "dropping buffer returned to a full pool");
			return;
		}

		buffer.clear();
		self.free.push(buffer);
	}

	pub fn available(&self) -> usize {
		self.free.len()
	}

	/// The number of buffers currently handed out.
	pub fn outstanding(&self) -> usize {
		self.capacity - self.free.len()
	}
}

impl<T: Buffer> std::fmt::Debug for Pool<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Pool")
			.field("available", &self.free.len())
			.field("capacity", &self.capacity)
			.finish()
	}
}
