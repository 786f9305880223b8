//! The decoder seam.
//!
//! Decoding itself lives outside this crate. The cache hands a [`Decoder`]
//! the raw bytes of a record together with a [`ReuseHint`] and expects a
//! [`Buffer`] back.

use std::sync::Arc;

use thiserror::Error;

use crate::buffer::{Buffer, PixelFormat, PixelHeap};

/// Errors a decoder can report.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a well-formed image.
    #[error("malformed image data: {0}")]
    Malformed(String),

    /// The image format is not supported by this decoder.
    #[error("unsupported image format: {0}")]
    Unsupported(String),
}

/// Turns encoded bytes into a decoded buffer.
pub trait Decoder: Send + Sync + 'static {
    /// Decodes `bytes`. Implementations should obtain their output buffer
    /// through [`ReuseHint::allocate`] so evicted storage gets recycled.
    fn decode(&self, bytes: &[u8], hint: ReuseHint) -> Result<Buffer, DecodeError>;
}

impl<F> Decoder for F
where
    F: Fn(&[u8], ReuseHint) -> Result<Buffer, DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, bytes: &[u8], hint: ReuseHint) -> Result<Buffer, DecodeError> {
        self(bytes, hint)
    }
}

/// What a decoder gets besides the bytes: the requested output format, an
/// optional reuse candidate from the reclaim pool and the heap to allocate from.
pub struct ReuseHint {
    candidate: Option<Arc<Buffer>>,
    heap: Arc<PixelHeap>,
    format: PixelFormat,
    mutable: bool,
}

impl ReuseHint {
    pub fn new(
        candidate: Option<Arc<Buffer>>,
        heap: Arc<PixelHeap>,
        format: PixelFormat,
        mutable: bool,
    ) -> Self {
        Self {
            candidate,
            heap,
            format,
            mutable,
        }
    }

    /// The reuse candidate, if the pool had one for this request.
    pub fn candidate(&self) -> Option<&Buffer> {
        self.candidate.as_deref()
    }

    /// Pixel format the cache asked for.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Allocates the output buffer, recycling the candidate's storage when the
    /// candidate is no longer referenced anywhere else and is large enough.
    pub fn allocate(self, width: u32, height: u32, format: PixelFormat) -> Buffer {
        let needed = (u64::from(width) * u64::from(height) * format.bytes_per_pixel()) as usize;

        if let Some(candidate) = self.candidate {
            // A candidate still shown somewhere cannot be written into.
            if let Ok(mut owned) = Arc::try_unwrap(candidate) {
                if let Some(mut storage) = owned.take_storage() {
                    if storage.reshape(needed) {
                        tracing::trace!(width, height, "decoding into recycled storage");
                        return Buffer::with_storage(storage, width, height, format, self.mutable);
                    }
                }
            }
        }

        Buffer::allocate(&self.heap, width, height, format, self.mutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_without_candidate() {
        let heap = PixelHeap::new();
        let hint = ReuseHint::new(None, Arc::clone(&heap), PixelFormat::Argb8888, true);

        let buffer = hint.allocate(4, 4, PixelFormat::Argb8888);
        assert_eq!(buffer.byte_count(), 64);
        assert!(buffer.is_mutable());
        assert_eq!(heap.allocations(), 1);
    }

    #[test]
    fn test_allocate_reuses_exclusive_candidate() {
        let heap = PixelHeap::new();
        let candidate = Arc::new(Buffer::allocate(&heap, 8, 8, PixelFormat::Argb8888, true));
        let hint = ReuseHint::new(Some(candidate), Arc::clone(&heap), PixelFormat::Argb8888, true);

        let buffer = hint.allocate(4, 4, PixelFormat::Argb8888);
        assert_eq!(buffer.byte_count(), 64);
        assert_eq!(buffer.allocation_byte_count(), 256);
        assert_eq!(heap.allocations(), 1);
        assert_eq!(heap.releases(), 0);
    }

    #[test]
    fn test_allocate_skips_shared_candidate() {
        let heap = PixelHeap::new();
        let candidate = Arc::new(Buffer::allocate(&heap, 8, 8, PixelFormat::Argb8888, true));
        let displayed = Arc::clone(&candidate);
        let hint = ReuseHint::new(Some(candidate), Arc::clone(&heap), PixelFormat::Argb8888, true);

        let buffer = hint.allocate(4, 4, PixelFormat::Argb8888);
        assert_eq!(buffer.allocation_byte_count(), 64);
        assert_eq!(heap.allocations(), 2);
        assert!(!displayed.is_recycled());
    }

    #[test]
    fn test_allocate_skips_small_candidate() {
        let heap = PixelHeap::new();
        let candidate = Arc::new(Buffer::allocate(&heap, 2, 2, PixelFormat::Argb8888, true));
        let hint = ReuseHint::new(Some(candidate), Arc::clone(&heap), PixelFormat::Argb8888, true);

        let buffer = hint.allocate(4, 4, PixelFormat::Argb8888);
        assert_eq!(buffer.allocation_byte_count(), 64);
        assert_eq!(heap.allocations(), 2);
        assert_eq!(heap.releases(), 1);
    }
}
