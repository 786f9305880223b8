//! Decoded pixel buffers and their native storage.
//!
//! A [`Buffer`] owns a [`PixelStorage`] block obtained from a [`PixelHeap`].
//! The heap stands in for the native allocator behind decoded images: it
//! counts every byte handed out and every byte given back, so leaks and
//! double releases are observable.
//!
//! Storage is released exactly once, when the [`PixelStorage`] value is
//! dropped. For an ordinary buffer that happens when the last reference to
//! it goes away. A buffer tracked by the reclaim pool instead hands its
//! storage to the pool's sweep worker, which either parks it for reuse or
//! releases it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::channel::Sender;

use crate::cache::ReclaimNotice;

/// Pixel layout of a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 32-bit, 8 bits per channel.
    #[default]
    Argb8888,
    /// 16-bit, no alpha.
    Rgb565,
    /// 16-bit, 4 bits per channel.
    Argb4444,
    /// 8-bit alpha mask.
    Alpha8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Argb8888 => 4,
            PixelFormat::Rgb565 | PixelFormat::Argb4444 => 2,
            PixelFormat::Alpha8 => 1,
        }
    }
}

/// Accounting for native pixel memory.
#[derive(Debug, Default)]
pub struct PixelHeap {
    live_bytes: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl PixelHeap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocate(self: &Arc<Self>, bytes: usize) -> PixelStorage {
        self.live_bytes.fetch_add(bytes as u64, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        PixelStorage {
            data: vec![0u8; bytes],
            allocated: bytes,
            heap: Arc::clone(self),
        }
    }

    fn release(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes as u64, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    /// Bytes currently held by storage blocks that have not been released.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

/// One block of native pixel memory. Dropping it returns the block to its heap.
pub struct PixelStorage {
    data: Vec<u8>,
    allocated: usize,
    heap: Arc<PixelHeap>,
}

impl PixelStorage {
    /// Size of the underlying allocation, independent of the current view.
    pub fn capacity(&self) -> usize {
        self.allocated
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Re-views the block as `len` zeroed bytes. Returns false if the block is too small.
    pub fn reshape(&mut self, len: usize) -> bool {
        if len > self.allocated {
            return false;
        }
        self.data.clear();
        self.data.resize(len, 0);
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PixelStorage {
    fn drop(&mut self) {
        self.heap.release(self.allocated);
    }
}

impl std::fmt::Debug for PixelStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelStorage")
            .field("len", &self.data.len())
            .field("capacity", &self.allocated)
            .finish()
    }
}

struct Registration {
    token: u64,
    notices: Sender<ReclaimNotice>,
}

/// A decoded image.
///
/// Buffers are shared as `Arc<Buffer>` between the memory tier and whoever
/// displays them. Only mutable buffers are eligible for reuse.
pub struct Buffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: u64,
    mutable: bool,
    storage: Option<PixelStorage>,
    reclaim: OnceLock<Registration>,
}

impl Buffer {
    /// Allocates a zeroed buffer with tightly packed rows.
    pub fn allocate(
        heap: &Arc<PixelHeap>,
        width: u32,
        height: u32,
        format: PixelFormat,
        mutable: bool,
    ) -> Self {
        let stride = u64::from(width) * format.bytes_per_pixel();
        let storage = heap.allocate((stride * u64::from(height)) as usize);
        Self::with_storage(storage, width, height, format, mutable)
    }

    /// Builds a buffer over an existing storage block, which must already
    /// hold `width * height` pixels.
    pub fn with_storage(
        storage: PixelStorage,
        width: u32,
        height: u32,
        format: PixelFormat,
        mutable: bool,
    ) -> Self {
        let stride = u64::from(width) * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            stride,
            mutable,
            storage: Some(storage),
            reclaim: OnceLock::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// True once the storage has been taken away from this buffer.
    pub fn is_recycled(&self) -> bool {
        self.storage.is_none()
    }

    /// Bytes per row as laid out in storage.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Bytes per row with no padding.
    pub fn row_bytes(&self) -> u64 {
        u64::from(self.width) * self.format.bytes_per_pixel()
    }

    /// Bytes covered by the pixels of this image.
    pub fn byte_count(&self) -> u64 {
        self.stride * u64::from(self.height)
    }

    /// Size of the backing allocation, which can exceed `byte_count` for
    /// buffers decoded into reused storage.
    pub fn allocation_byte_count(&self) -> u64 {
        self.storage.as_ref().map_or(0, |s| s.capacity() as u64)
    }

    pub fn pixels(&self) -> &[u8] {
        self.storage.as_ref().map_or(&[], |s| s.as_slice())
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match self.storage.as_mut() {
            Some(storage) => storage.as_mut_slice(),
            None => &mut [],
        }
    }

    /// Moves the storage out, leaving this buffer recycled.
    pub fn take_storage(&mut self) -> Option<PixelStorage> {
        self.storage.take()
    }

    /// Ties the buffer to the reclaim pool. Once registered, the buffer's
    /// storage goes to the pool's sweep worker when the last reference drops,
    /// wrapped in a new unregistered buffer of the same shape.
    pub(crate) fn register_reclaim(&self, token: u64, notices: Sender<ReclaimNotice>) -> bool {
        self.reclaim.set(Registration { token, notices }).is_ok()
    }

    pub(crate) fn reclaim_token(&self) -> Option<u64> {
        self.reclaim.get().map(|r| r.token)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        if let Some(registration) = self.reclaim.take() {
            let remains =
                Buffer::with_storage(storage, self.width, self.height, self.format, self.mutable);
            let notice = ReclaimNotice::Unreachable {
                token: registration.token,
                remains,
            };
            // If the sweep worker is gone the notice comes back and is dropped
            // here, which releases the storage inline.
            if let Err(returned) = registration.notices.send(notice) {
                drop(returned.into_inner());
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("mutable", &self.mutable)
            .field("allocation", &self.allocation_byte_count())
            .finish()
    }
}

/// How the memory tier measures a buffer. Chosen once from the host's
/// capabilities, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeStrategy {
    /// Exact size of the backing allocation.
    AllocationSize,
    /// Row stride times height.
    Stride,
    /// Packed row bytes times height.
    RowBytes,
}

impl SizeStrategy {
    pub fn measure(self, buffer: &Buffer) -> u64 {
        match self {
            SizeStrategy::AllocationSize => buffer.allocation_byte_count(),
            SizeStrategy::Stride => buffer.stride() * u64::from(buffer.height()),
            SizeStrategy::RowBytes => buffer.row_bytes() * u64::from(buffer.height()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_accounts_bytes() {
        let heap = PixelHeap::new();
        let buffer = Buffer::allocate(&heap, 10, 4, PixelFormat::Argb8888, true);

        assert_eq!(buffer.byte_count(), 160);
        assert_eq!(buffer.allocation_byte_count(), 160);
        assert_eq!(buffer.pixels().len(), 160);
        assert_eq!(heap.live_bytes(), 160);

        drop(buffer);
        assert_eq!(heap.live_bytes(), 0);
        assert_eq!(heap.releases(), 1);
    }

    #[test]
    fn test_format_bytes_per_pixel() {
        assert_eq!(PixelFormat::Argb8888.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgb565.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Argb4444.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Alpha8.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_reshape_within_capacity() {
        let heap = PixelHeap::new();
        let mut storage = heap.allocate(100);

        assert!(storage.reshape(40));
        assert_eq!(storage.len(), 40);
        assert_eq!(storage.capacity(), 100);
        assert!(!storage.reshape(101));

        drop(storage);
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_size_strategies() {
        let heap = PixelHeap::new();
        let mut storage = heap.allocate(1000);
        assert!(storage.reshape(2 * 3 * 2));
        let buffer = Buffer::with_storage(storage, 2, 3, PixelFormat::Rgb565, true);

        assert_eq!(SizeStrategy::AllocationSize.measure(&buffer), 1000);
        assert_eq!(SizeStrategy::Stride.measure(&buffer), 12);
        assert_eq!(SizeStrategy::RowBytes.measure(&buffer), 12);
    }

    #[test]
    fn test_take_storage_marks_recycled() {
        let heap = PixelHeap::new();
        let mut buffer = Buffer::allocate(&heap, 1, 1, PixelFormat::Alpha8, true);
        assert!(!buffer.is_recycled());

        let storage = buffer.take_storage();
        assert!(buffer.is_recycled());
        assert_eq!(buffer.allocation_byte_count(), 0);
        drop(buffer);
        assert_eq!(heap.releases(), 0);

        drop(storage);
        assert_eq!(heap.releases(), 1);
    }

    #[test]
    fn test_registered_drop_hands_storage_over() {
        let heap = PixelHeap::new();
        let (notices, queue) = crossbeam::channel::unbounded();
        let buffer = Buffer::allocate(&heap, 3, 2, PixelFormat::Argb8888, true);
        assert!(buffer.register_reclaim(7, notices.clone()));
        assert!(!buffer.register_reclaim(8, notices));

        drop(buffer);
        assert_eq!(heap.releases(), 0);

        match queue.try_recv().unwrap() {
            ReclaimNotice::Unreachable { token, remains } => {
                assert_eq!(token, 7);
                assert_eq!((remains.width(), remains.height()), (3, 2));
                assert_eq!(remains.allocation_byte_count(), 24);
                assert_eq!(remains.reclaim_token(), None);
            }
            _ => panic!("expected an unreachable notice"),
        }
        assert_eq!(heap.releases(), 1);
    }
}
