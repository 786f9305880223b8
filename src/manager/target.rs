use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::Buffer;

/// Where a requested image is going to be shown.
///
/// The cache only asks a target how large the image will be drawn, to pick a
/// reuse candidate of the right size. Whether a delivered buffer is still
/// wanted is for the result callback to decide.
pub trait Target: Send + Sync + 'static {
    /// Display size in pixels.
    fn size_hint(&self) -> (u32, u32);

    /// Downsampling factor the decoder will apply. Values below 1 mean 1.
    fn sample_factor(&self) -> u32 {
        1
    }
}

/// Proof of one assignment of a [`TargetSlot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    generation: u64,
    source_id: String,
}

impl Assignment {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

/// A display slot that can be reassigned to another source at any time,
/// such as a recycled list cell.
///
/// Each [`assign`](Self::assign) starts a new generation. A result arriving
/// for an older assignment is stale and [`show`](Self::show) drops it.
#[derive(Debug)]
pub struct TargetSlot {
    size: (u32, u32),
    generation: AtomicU64,
    shown: Mutex<Option<Arc<Buffer>>>,
}

impl TargetSlot {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            size: (width, height),
            generation: AtomicU64::new(0),
            shown: Mutex::new(None),
        })
    }

    /// Points the slot at `source_id`, invalidating every earlier assignment
    /// and clearing whatever is shown.
    pub fn assign(&self, source_id: impl Into<String>) -> Assignment {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.shown.lock() = None;
        Assignment {
            generation,
            source_id: source_id.into(),
        }
    }

    pub fn is_current(&self, assignment: &Assignment) -> bool {
        self.generation.load(Ordering::Acquire) == assignment.generation
    }

    /// Shows `buffer` if `assignment` is still current. Returns false and
    /// drops the buffer otherwise.
    pub fn show(&self, assignment: &Assignment, buffer: Arc<Buffer>) -> bool {
        let mut shown = self.shown.lock();
        if !self.is_current(assignment) {
            return false;
        }
        *shown = Some(buffer);
        true
    }

    /// The buffer currently on display.
    pub fn displayed(&self) -> Option<Arc<Buffer>> {
        self.shown.lock().clone()
    }

    /// Stops showing anything. The slot keeps its current assignment.
    pub fn clear(&self) {
        *self.shown.lock() = None;
    }
}

impl Target for TargetSlot {
    fn size_hint(&self) -> (u32, u32) {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PixelFormat, PixelHeap};

    #[test]
    fn test_stale_assignment_dropped() {
        let heap = PixelHeap::new();
        let slot = TargetSlot::new(4, 4);

        let first = slot.assign("img-a");
        let second = slot.assign("img-b");
        assert!(!slot.is_current(&first));
        assert!(slot.is_current(&second));

        let late = Arc::new(Buffer::allocate(&heap, 4, 4, PixelFormat::Argb8888, true));
        assert!(!slot.show(&first, late));
        assert!(slot.displayed().is_none());

        let fresh = Arc::new(Buffer::allocate(&heap, 4, 4, PixelFormat::Argb8888, true));
        assert!(slot.show(&second, Arc::clone(&fresh)));
        assert!(Arc::ptr_eq(&slot.displayed().unwrap(), &fresh));
    }

    #[test]
    fn test_reassign_clears_display() {
        let heap = PixelHeap::new();
        let slot = TargetSlot::new(4, 4);
        let a = slot.assign("img-a");
        slot.show(&a, Arc::new(Buffer::allocate(&heap, 4, 4, PixelFormat::Argb8888, true)));
        assert!(slot.displayed().is_some());

        slot.assign("img-b");
        assert!(slot.displayed().is_none());
        assert_eq!(heap.live_bytes(), 0);
    }
}
