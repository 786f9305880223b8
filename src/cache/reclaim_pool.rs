use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::buffer::{Buffer, PixelFormat};

/// Name of the dedicated sweep thread.
pub const SWEEP_THREAD_NAME: &str = "pixtier-reclaim";

/// Messages consumed by the sweep worker.
pub enum ReclaimNotice {
    /// A pooled buffer lost its last reference. `remains` is a fresh,
    /// unregistered buffer over the same storage.
    Unreachable { token: u64, remains: Buffer },
    /// Parked storage the pool no longer wants.
    Discard(Vec<Buffer>),
    /// Acknowledged once every earlier notice has been processed.
    Barrier(Sender<()>),
    /// Releases everything parked and stops the worker.
    Shutdown,
}

/// Rule deciding whether a pooled buffer can hold a new decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReuseMode {
    /// Same width and height, no downsampling.
    Strict,
    /// Any buffer whose allocation covers the requested footprint.
    #[default]
    ByteBudget,
}

impl ReuseMode {
    pub fn is_eligible(
        self,
        candidate: &Buffer,
        width: u32,
        height: u32,
        sample_factor: u32,
        format: PixelFormat,
    ) -> bool {
        match self {
            ReuseMode::Strict => {
                candidate.width() == width && candidate.height() == height && sample_factor == 1
            }
            ReuseMode::ByteBudget => {
                let sample = u64::from(sample_factor.max(1));
                let footprint = (u64::from(width) / sample)
                    * (u64::from(height) / sample)
                    * format.bytes_per_pixel();
                footprint <= candidate.allocation_byte_count()
            }
        }
    }
}

/// Counters exposed by [`ReclaimPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed to the pool by the memory tier.
    pub offered: u64,
    /// Candidates handed out for reuse.
    pub reused: u64,
    /// Storage blocks released by the sweep worker.
    pub finalized: u64,
    /// Entries dropped by a candidate scan because they did not fit.
    pub pruned: u64,
    /// Entries currently tracked, live or parked.
    pub tracked: usize,
    /// Bytes of storage the pool owns outright.
    pub parked_bytes: u64,
}

enum Slot {
    /// Evicted, still referenced by someone else.
    Live(Weak<Buffer>),
    /// Nobody else holds it; the pool owns the storage.
    Parked(Buffer),
}

struct Slots {
    by_token: BTreeMap<u64, Slot>,
    parked_bytes: u64,
}

struct PoolShared {
    slots: Mutex<Slots>,
    parked_limit: u64,
    offered: AtomicU64,
    reused: AtomicU64,
    finalized: AtomicU64,
    pruned: AtomicU64,
}

impl PoolShared {
    /// Takes over the storage of a buffer that just became unreachable.
    /// Returns whatever must be released: the storage itself if its entry is
    /// gone, plus the oldest parked storage once the limit is exceeded.
    fn park(&self, token: u64, remains: Buffer) -> Vec<Buffer> {
        let mut discarded = Vec::new();
        let mut guard = self.slots.lock();
        let slots = &mut *guard;

        match slots.by_token.get_mut(&token) {
            Some(slot) if matches!(slot, Slot::Live(_)) => {
                slots.parked_bytes += remains.allocation_byte_count();
                *slot = Slot::Parked(remains);
                trace!(token, "storage parked for reuse");
            }
            // Withdrawn, pruned or handed out as a candidate.
            _ => discarded.push(remains),
        }

        while slots.parked_bytes > self.parked_limit {
            let oldest = slots
                .by_token
                .iter()
                .find(|(_, slot)| matches!(slot, Slot::Parked(_)))
                .map(|(&token, _)| token);
            let Some(token) = oldest else {
                break;
            };
            if let Some(Slot::Parked(buffer)) = slots.by_token.remove(&token) {
                slots.parked_bytes -= buffer.allocation_byte_count();
                discarded.push(buffer);
            }
        }
        discarded
    }

    fn drain_parked(&self) -> Vec<Buffer> {
        let mut guard = self.slots.lock();
        let slots = &mut *guard;
        let parked: Vec<u64> = slots
            .by_token
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Parked(_)))
            .map(|(&token, _)| token)
            .collect();

        let mut drained = Vec::with_capacity(parked.len());
        for token in parked {
            if let Some(Slot::Parked(buffer)) = slots.by_token.remove(&token) {
                drained.push(buffer);
            }
        }
        slots.parked_bytes = 0;
        drained
    }

    fn finalize(&self, buffers: Vec<Buffer>) {
        for buffer in buffers {
            let bytes = buffer.allocation_byte_count();
            drop(buffer);
            self.finalized.fetch_add(1, Ordering::Relaxed);
            trace!(bytes, "released pooled storage");
        }
    }
}

/// Holds mutable buffers evicted from the memory tier until a decode can
/// reuse their storage.
///
/// An evicted buffer that is still on screen is tracked weakly; the pool
/// never keeps it alive. When its last reference drops, its storage arrives
/// on the notification queue and the sweep worker parks it in the pool,
/// which from then on owns it outright. Parked storage beyond the configured
/// byte limit, storage whose entry was pruned or withdrawn, and everything
/// still parked at shutdown is released by the sweep worker, exactly once.
pub struct ReclaimPool {
    shared: Arc<PoolShared>,
    notices: Sender<ReclaimNotice>,
    next_token: AtomicU64,
    mode: ReuseMode,
    format: PixelFormat,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReclaimPool {
    /// Creates the pool and starts its sweep worker.
    ///
    /// `format` is the pixel format decodes are requested in; the byte-budget
    /// rule sizes requests with it. At most `parked_limit` bytes of storage
    /// are kept parked.
    pub fn new(mode: ReuseMode, format: PixelFormat, parked_limit: u64) -> io::Result<Arc<Self>> {
        let shared = Arc::new(PoolShared {
            slots: Mutex::new(Slots {
                by_token: BTreeMap::new(),
                parked_bytes: 0,
            }),
            parked_limit,
            offered: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        });
        let (notices, queue) = channel::unbounded();

        let worker_shared = Arc::clone(&shared);
        let sweeper = std::thread::Builder::new()
            .name(SWEEP_THREAD_NAME.to_string())
            .spawn(move || sweep(worker_shared, queue))?;

        Ok(Arc::new(Self {
            shared,
            notices,
            next_token: AtomicU64::new(1),
            mode,
            format,
            sweeper: Mutex::new(Some(sweeper)),
        }))
    }

    pub fn mode(&self) -> ReuseMode {
        self.mode
    }

    pub fn parked_limit(&self) -> u64 {
        self.shared.parked_limit
    }

    /// Starts tracking an evicted buffer. Immutable buffers are refused and
    /// simply dropped.
    pub fn offer(&self, buffer: Arc<Buffer>) {
        if !buffer.is_mutable() {
            return;
        }

        let token = match buffer.reclaim_token() {
            Some(token) => token,
            None => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                buffer.register_reclaim(token, self.notices.clone());
                token
            }
        };

        self.shared
            .slots
            .lock()
            .by_token
            .insert(token, Slot::Live(Arc::downgrade(&buffer)));
        self.shared.offered.fetch_add(1, Ordering::Relaxed);
        trace!(token, "buffer tracked by reclaim pool");
    }

    /// Stops tracking a buffer without releasing anything, used when a
    /// pooled buffer becomes resident in the memory tier again.
    pub fn withdraw(&self, buffer: &Buffer) -> bool {
        match buffer.reclaim_token() {
            Some(token) => self.shared.slots.lock().by_token.remove(&token).is_some(),
            None => false,
        }
    }

    /// Hands out the oldest entry that can hold a decode of the given size.
    ///
    /// A parked entry comes back as a buffer nobody else references, so the
    /// decoder can write into it. Every entry inspected on the way that does
    /// not fit is dropped from the pool. Live entries whose buffer already
    /// died are skipped: their storage is on its way to the sweep.
    pub fn acquire_candidate(
        &self,
        width: u32,
        height: u32,
        sample_factor: u32,
    ) -> Option<Arc<Buffer>> {
        let eligible = |buffer: &Buffer| {
            self.mode
                .is_eligible(buffer, width, height, sample_factor, self.format)
        };

        // Upgraded live buffers are dropped only after the lock is released.
        let mut upgraded = Vec::new();
        let mut rejected = Vec::new();
        let mut found = None;
        let inspected_count;
        {
            let mut guard = self.shared.slots.lock();
            let slots = &mut *guard;

            let mut inspected = Vec::new();
            let mut hit = None;
            for (&token, slot) in slots.by_token.iter() {
                let fits = match slot {
                    Slot::Live(weak) => {
                        let Some(buffer) = weak.upgrade() else {
                            continue;
                        };
                        let fits = eligible(&buffer);
                        upgraded.push(buffer);
                        fits
                    }
                    Slot::Parked(buffer) => eligible(buffer),
                };
                inspected.push(token);
                if fits {
                    hit = Some(token);
                    break;
                }
            }

            for &token in &inspected {
                let Some(slot) = slots.by_token.remove(&token) else {
                    continue;
                };
                match slot {
                    Slot::Parked(buffer) => {
                        slots.parked_bytes -= buffer.allocation_byte_count();
                        if hit == Some(token) {
                            found = Some(Arc::new(buffer));
                        } else {
                            rejected.push(buffer);
                        }
                    }
                    Slot::Live(_) => {
                        if hit == Some(token) {
                            // The scan stopped right after upgrading the hit.
                            found = upgraded.pop();
                        }
                    }
                }
            }
            inspected_count = inspected.len();
        }
        drop(upgraded);

        if !rejected.is_empty() {
            if let Err(returned) = self.notices.send(ReclaimNotice::Discard(rejected)) {
                drop(returned.into_inner());
            }
        }

        let pruned = inspected_count - usize::from(found.is_some());
        self.shared
            .pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
        if found.is_some() {
            self.shared.reused.fetch_add(1, Ordering::Relaxed);
            debug!(width, height, pruned, "reuse candidate acquired");
        }
        found
    }

    /// Blocks until the sweep worker has handled every notice queued before
    /// this call. Returns immediately once the worker has stopped.
    pub fn sync(&self) {
        let (ack, done) = channel::bounded(1);
        if self.notices.send(ReclaimNotice::Barrier(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Stops the sweep worker and waits for it to exit. Parked storage is
    /// released; buffers dropped afterwards release their storage inline.
    pub fn shutdown(&self) {
        let Some(handle) = self.sweeper.lock().take() else {
            return;
        };
        let _ = self.notices.send(ReclaimNotice::Shutdown);
        let _ = handle.join();
    }

    pub fn len(&self) -> usize {
        self.shared.slots.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parked_bytes(&self) -> u64 {
        self.shared.slots.lock().parked_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let (tracked, parked_bytes) = {
            let slots = self.shared.slots.lock();
            (slots.by_token.len(), slots.parked_bytes)
        };
        PoolStats {
            offered: self.shared.offered.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            finalized: self.shared.finalized.load(Ordering::Relaxed),
            pruned: self.shared.pruned.load(Ordering::Relaxed),
            tracked,
            parked_bytes,
        }
    }
}

impl Drop for ReclaimPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep(shared: Arc<PoolShared>, queue: Receiver<ReclaimNotice>) {
    info!("reclaim sweep started");
    while let Ok(notice) = queue.recv() {
        match notice {
            ReclaimNotice::Unreachable { token, remains } => {
                let discarded = shared.park(token, remains);
                shared.finalize(discarded);
            }
            ReclaimNotice::Discard(buffers) => shared.finalize(buffers),
            ReclaimNotice::Barrier(ack) => {
                let _ = ack.send(());
            }
            ReclaimNotice::Shutdown => {
                let parked = shared.drain_parked();
                shared.finalize(parked);
                break;
            }
        }
    }
    info!("reclaim sweep stopped");
}
