use super::*;
use crate::constants::JOURNAL_FILE;
use crate::decode::DecodeError;
use crate::fetch::DownloadError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

/// Serves canned bodies and counts calls per url. A gated origin takes one
/// permit per fetch before answering.
struct TestOrigin {
    bodies: parking_lot::Mutex<HashMap<String, Vec<u8>>>,
    calls: parking_lot::Mutex<HashMap<String, usize>>,
    gate: Option<Arc<Semaphore>>,
}

impl TestOrigin {
    fn new() -> Arc<Self> {
        Self::build(None)
    }

    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Self::build(Some(gate))
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            bodies: parking_lot::Mutex::new(HashMap::new()),
            calls: parking_lot::Mutex::new(HashMap::new()),
            gate,
        })
    }

    fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().insert(url.to_string(), body);
    }

    fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl Origin for TestOrigin {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, DownloadError> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| {
                DownloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            permit.forget();
        }

        let body = self.bodies.lock().get(url).cloned();
        match body {
            Some(body) => {
                sink.write_all(&body).await?;
                Ok(body.len() as u64)
            }
            None => Err(DownloadError::Status(reqwest::StatusCode::NOT_FOUND)),
        }
    }
}

/// Test image format: `PXT <width> <height> <fill>`.
fn image(width: u32, height: u32, fill: u8) -> Vec<u8> {
    format!("PXT {} {} {}", width, height, fill).into_bytes()
}

fn decode_pxt(bytes: &[u8], hint: ReuseHint) -> Result<Buffer, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::Malformed("not text".into()))?;
    let mut parts = text.split(' ');
    if parts.next() != Some("PXT") {
        return Err(DecodeError::Unsupported("missing PXT magic".into()));
    }
    let mut field = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| DecodeError::Malformed("bad header".into()))
    };
    let width = field()?;
    let height = field()?;
    let fill = field()? as u8;

    let format = hint.format();
    let mut buffer = hint.allocate(width, height, format);
    buffer.pixels_mut().fill(fill);
    Ok(buffer)
}

struct Harness {
    _temp: TempDir,
    origin: Arc<TestOrigin>,
    cache: ImageCache,
}

async fn harness(origin: Arc<TestOrigin>) -> Harness {
    harness_with(origin, |config| config).await
}

async fn harness_with(
    origin: Arc<TestOrigin>,
    configure: impl FnOnce(CacheConfig) -> CacheConfig,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let config = configure(CacheConfig::new(temp.path().join("images")));
    let cache = ImageCacheBuilder::new(config)
        .decoder(decode_pxt)
        .origin(origin.clone())
        .build()
        .await
        .unwrap();
    Harness {
        _temp: temp,
        origin,
        cache,
    }
}

/// Requests `source` for `slot` and forwards the outcome.
fn request_into(
    cache: &ImageCache,
    source: &str,
    slot: &Arc<TargetSlot>,
    results: &mpsc::UnboundedSender<Result<Arc<Buffer>, CacheError>>,
) {
    let assignment = slot.assign(source);
    let results = results.clone();
    cache.request(source, Arc::clone(slot), move |slot, result| {
        if let Ok(buffer) = &result {
            slot.show(&assignment, Arc::clone(buffer));
        }
        let _ = results.send(result);
    });
}

/// A display target drawn at `size`, decoded with `sample` downsampling.
struct Thumbnail {
    size: (u32, u32),
    sample: u32,
}

impl Target for Thumbnail {
    fn size_hint(&self) -> (u32, u32) {
        self.size
    }

    fn sample_factor(&self) -> u32 {
        self.sample
    }
}

fn assert_send_sync<T: Send + Sync>() {}

/// Memory holds a single 4x4 ARGB buffer and the pool may park one more.
async fn single_slot_harness() -> Harness {
    harness_with(TestOrigin::new(), |c| {
        c.with_working_set(64)
            .with_memory_fraction(1.0)
            .with_reclaim_fraction(1.0)
    })
    .await
}

/// Loads A then B so that A's storage ends up parked in the pool.
async fn park_first_image(h: &Harness) {
    h.origin.serve("img-A", image(4, 4, 1));
    h.origin.serve("img-B", image(4, 4, 2));
    drop(h.cache.load_sized("img-A", 4, 4).await.unwrap());
    drop(h.cache.load_sized("img-B", 4, 4).await.unwrap());
    h.cache.reclaim_pool().sync();
    assert_eq!(h.cache.reclaim_pool().parked_bytes(), 64);
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_request_fetches_and_fills_both_tiers() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 7));

    let slot = TargetSlot::new(4, 4);
    let (tx, mut rx) = mpsc::unbounded_channel();
    request_into(&h.cache, "img-A", &slot, &tx);

    let buffer = rx.recv().await.unwrap().unwrap();
    assert_eq!((buffer.width(), buffer.height()), (4, 4));
    assert!(buffer.pixels().iter().all(|&p| p == 7));
    assert_eq!(h.origin.calls("img-A"), 1);

    let key = h.cache.key_for("img-A");
    assert!(h.cache.memory().contains(&key));
    assert!(h.cache.disk().unwrap().contains(key.as_str()));
    assert!(Arc::ptr_eq(&slot.displayed().unwrap(), &buffer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeat_request_is_a_synchronous_memory_hit() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 7));
    let first = h.cache.load("img-A").await.unwrap();

    let delivered = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(parking_lot::Mutex::new(None));
    {
        let delivered = Arc::clone(&delivered);
        let seen = Arc::clone(&seen);
        h.cache
            .request("img-A", TargetSlot::new(4, 4), move |_, result| {
                *seen.lock() = result.ok();
                delivered.store(true, Ordering::SeqCst);
            });
    }

    // Resolved before `request` returned.
    assert!(delivered.load(Ordering::SeqCst));
    let second = seen.lock().take().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.origin.total_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_fetch() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(TestOrigin::gated(Arc::clone(&gate))).await;
    h.origin.serve("img-B", image(8, 8, 1));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let slots: Vec<_> = (0..10).map(|_| TargetSlot::new(8, 8)).collect();
    for slot in &slots {
        request_into(&h.cache, "img-B", slot, &tx);
    }
    assert_eq!(h.cache.stats().in_flight, 1);

    gate.add_permits(1);
    let mut outcomes = Vec::new();
    for _ in 0..10 {
        outcomes.push(rx.recv().await.unwrap().unwrap());
    }

    assert_eq!(h.origin.calls("img-B"), 1);
    for buffer in &outcomes {
        assert!(Arc::ptr_eq(buffer, &outcomes[0]));
    }
    for slot in &slots {
        assert!(Arc::ptr_eq(&slot.displayed().unwrap(), &outcomes[0]));
    }
    assert_eq!(h.cache.stats().in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_fetch_fans_out_to_every_waiter() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(TestOrigin::gated(Arc::clone(&gate))).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let slot = TargetSlot::new(4, 4);
    for _ in 0..5 {
        request_into(&h.cache, "img-missing", &slot, &tx);
    }

    gate.add_permits(1);
    for _ in 0..5 {
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(err.is_network(), "unexpected error: {}", err);
    }
    assert_eq!(h.origin.calls("img-missing"), 1);
    assert_eq!(h.cache.stats().in_flight, 0);

    let key = h.cache.key_for("img-missing");
    assert!(!h.cache.disk().unwrap().contains(key.as_str()));

    // No automatic retry; asking again fetches again.
    gate.add_permits(1);
    assert!(h.cache.load("img-missing").await.is_err());
    assert_eq!(h.origin.calls("img-missing"), 2);
}

#[tokio::test]
async fn test_invalidate_unknown_is_noop() {
    let h = harness(TestOrigin::new()).await;
    h.cache.invalidate("never-requested").await;
    h.cache.invalidate("never-requested").await;
    assert_eq!(h.cache.stats().memory.entries, 0);
}

#[tokio::test]
async fn test_invalidate_clears_both_tiers() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 7));
    h.cache.load("img-A").await.unwrap();

    h.cache.invalidate("img-A").await;
    let key = h.cache.key_for("img-A");
    assert!(!h.cache.memory().contains(&key));
    assert!(!h.cache.disk().unwrap().contains(key.as_str()));
    assert!(h.cache.get_if_present("img-A").is_none());

    h.cache.load("img-A").await.unwrap();
    assert_eq!(h.origin.calls("img-A"), 2);
}

#[tokio::test]
async fn test_disk_hit_after_memory_cleared() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 7));
    h.cache.load("img-A").await.unwrap();

    h.cache.clear_memory();
    assert!(h.cache.get_if_present("img-A").is_none());

    let again = h.cache.load("img-A").await.unwrap();
    assert!(again.pixels().iter().all(|&p| p == 7));
    assert_eq!(h.origin.calls("img-A"), 1);
    assert!(h.cache.get_if_present("img-A").is_some());
}

#[tokio::test]
async fn test_records_survive_restart() {
    let temp = TempDir::new().unwrap();
    let origin = TestOrigin::new();
    origin.serve("img-A", image(4, 4, 7));
    let config = CacheConfig::new(temp.path().join("images"));

    {
        let cache = ImageCacheBuilder::new(config.clone())
            .decoder(decode_pxt)
            .origin(origin.clone())
            .build()
            .await
            .unwrap();
        cache.load("img-A").await.unwrap();
    }

    let cache = ImageCacheBuilder::new(config)
        .decoder(decode_pxt)
        .origin(origin.clone())
        .build()
        .await
        .unwrap();
    cache.load("img-A").await.unwrap();
    assert_eq!(origin.calls("img-A"), 1);
}

#[tokio::test]
async fn test_corrupt_disk_record_refetched() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 9));

    let key = h.cache.key_for("img-A");
    let disk = h.cache.disk().unwrap();
    let mut tx = disk.begin_write(key.as_str()).await.unwrap().unwrap();
    tx.sink().write_all(b"\x00\x01 not an image").await.unwrap();
    tx.commit().await.unwrap();

    let buffer = h.cache.load("img-A").await.unwrap();
    assert!(buffer.pixels().iter().all(|&p| p == 9));
    assert_eq!(h.origin.calls("img-A"), 1);

    let snapshot = disk.read(key.as_str()).await.unwrap().unwrap();
    assert!(snapshot.read_all().await.unwrap().starts_with(b"PXT"));
}

#[tokio::test]
async fn test_undecodable_download_not_kept() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-bad", b"GIF89a".to_vec());

    let err = h.cache.load("img-bad").await.unwrap_err();
    assert!(err.is_decode(), "unexpected error: {}", err);

    let key = h.cache.key_for("img-bad");
    assert!(!h.cache.disk().unwrap().contains(key.as_str()));
    assert!(!h.cache.memory().contains(&key));
}

#[tokio::test]
async fn test_memory_only_mode() {
    let h = harness_with(TestOrigin::new(), |c| c.with_memory_only(true)).await;
    h.origin.serve("img-A", image(4, 4, 3));

    assert!(!h.cache.disk_enabled());
    let first = h.cache.load("img-A").await.unwrap();
    let second = h.cache.load("img-A").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.origin.calls("img-A"), 1);
    assert_eq!(h.cache.stats().disk_entries, 0);
    assert!(h.cache.flush().await.is_ok());
}

#[tokio::test]
async fn test_disk_open_failure_degrades_to_memory_only() {
    let temp = TempDir::new().unwrap();
    let blocker = temp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let origin = TestOrigin::new();
    origin.serve("img-A", image(4, 4, 3));
    let cache = ImageCacheBuilder::new(CacheConfig::new(blocker.join("images")))
        .decoder(decode_pxt)
        .origin(origin.clone())
        .build()
        .await
        .unwrap();

    assert!(!cache.disk_enabled());
    assert!(cache.load("img-A").await.is_ok());
}

#[tokio::test]
async fn test_invalid_config_fails_build() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let result = ImageCacheBuilder::new(CacheConfig::new(file.path()))
        .decoder(decode_pxt)
        .origin(TestOrigin::new())
        .build()
        .await;
    assert!(matches!(result, Err(CacheError::InvalidConfig(_))));

    let temp = TempDir::new().unwrap();
    let result = ImageCacheBuilder::new(CacheConfig::new(temp.path()))
        .origin(TestOrigin::new())
        .build()
        .await;
    assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_target_discards_delivery() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(TestOrigin::gated(Arc::clone(&gate))).await;
    h.origin.serve("img-A", image(4, 4, 1));

    let slot = TargetSlot::new(4, 4);
    let assignment = slot.assign("img-A");
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.cache.request("img-A", Arc::clone(&slot), move |slot, result| {
        let shown = match result {
            Ok(buffer) => slot.show(&assignment, buffer),
            Err(_) => false,
        };
        let _ = tx.send(shown);
    });

    // The cell scrolls to another image before the first one arrives.
    let _newer = slot.assign("img-B");
    gate.add_permits(1);

    assert!(!rx.recv().await.unwrap());
    assert!(slot.displayed().is_none());
    // The image is still cached for whoever asks next.
    assert!(h.cache.get_if_present("img-A").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_evicted_buffer_storage_reused_for_next_decode() {
    // Room for exactly one 4x4 ARGB buffer; the first two fetches pass.
    let gate = Arc::new(Semaphore::new(2));
    let h = harness_with(TestOrigin::gated(Arc::clone(&gate)), |c| {
        c.with_working_set(64).with_memory_fraction(1.0)
    })
    .await;
    h.origin.serve("img-A", image(4, 4, 1));
    h.origin.serve("img-B", image(4, 4, 2));
    h.origin.serve("img-C", image(4, 4, 3));
    let cache = Arc::new(h.cache);

    let shown_a = cache.load_sized("img-A", 4, 4).await.unwrap();
    cache.load_sized("img-B", 4, 4).await.unwrap();
    // A left memory while still on screen, so it waits in the pool.
    assert_eq!(cache.reclaim_pool().len(), 1);

    let loader = Arc::clone(&cache);
    let pending = tokio::spawn(async move { loader.load_sized("img-C", 4, 4).await });

    // Once C is at the origin its request already holds A as candidate.
    let origin = Arc::clone(&h.origin);
    wait_for(|| origin.calls("img-C") == 1).await;
    assert_eq!(cache.reclaim_pool().stats().reused, 1);

    // The screen lets go of A while C downloads.
    drop(shown_a);
    gate.add_permits(1);

    let c = pending.await.unwrap().unwrap();
    assert!(c.pixels().iter().all(|&p| p == 3));
    assert_eq!(cache.heap().allocations(), 2);

    // Putting C pushed B out. Nobody held B, and the pool keeps at most half
    // the memory tier parked, so the sweep releases it.
    cache.reclaim_pool().sync();
    assert_eq!(cache.heap().releases(), 1);
    assert_eq!(cache.heap().live_bytes(), 64);
    assert_eq!(cache.reclaim_pool().stats().finalized, 1);
}

#[tokio::test]
async fn test_immutable_buffers_bypass_pool() {
    let h = harness_with(TestOrigin::new(), |c| {
        c.with_working_set(64)
            .with_memory_fraction(1.0)
            .with_mutable_buffers(false)
    })
    .await;
    h.origin.serve("img-A", image(4, 4, 1));
    h.origin.serve("img-B", image(4, 4, 2));

    let a = h.cache.load("img-A").await.unwrap();
    assert!(!a.is_mutable());
    drop(a);
    h.cache.load("img-B").await.unwrap();

    assert!(h.cache.reclaim_pool().is_empty());
    assert_eq!(h.cache.reclaim_pool().stats().offered, 0);
    assert_eq!(h.cache.heap().releases(), 1);
}

#[tokio::test]
async fn test_stats_track_tiers() {
    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 1));

    h.cache.load("img-A").await.unwrap();
    h.cache.load("img-A").await.unwrap();

    let stats = h.cache.stats();
    assert_eq!(stats.memory.entries, 1);
    assert!(stats.memory.hits >= 1);
    assert_eq!(stats.disk_entries, 1);
    assert_eq!(stats.disk_bytes, image(4, 4, 1).len() as u64);
    assert_eq!(stats.origin_fetches, 1);
    assert_eq!(stats.origin_failures, 0);
}

#[tokio::test]
async fn test_unreferenced_evicted_storage_recycled() {
    let h = single_slot_harness().await;
    park_first_image(&h).await;
    // A left memory with nobody holding it; the pool owns its storage now.
    assert_eq!(h.cache.heap().releases(), 0);
    assert_eq!(h.cache.heap().allocations(), 2);

    h.origin.serve("img-C", image(4, 4, 3));
    let c = h.cache.load_sized("img-C", 4, 4).await.unwrap();
    assert!(c.pixels().iter().all(|&p| p == 3));
    assert_eq!(h.cache.heap().allocations(), 2);
    assert_eq!(h.cache.reclaim_pool().stats().reused, 1);

    // C pushed B out, and B is parked in turn.
    h.cache.reclaim_pool().sync();
    assert_eq!(h.cache.heap().releases(), 0);
    assert_eq!(h.cache.reclaim_pool().parked_bytes(), 64);
    assert_eq!(h.cache.heap().live_bytes(), 128);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sample_factor_widens_reuse() {
    let h = single_slot_harness().await;
    park_first_image(&h).await;
    h.origin.serve("img-C", image(4, 4, 3));

    // Drawn at 8x8 but decoded at half size, so 64 bytes are enough.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let target = Arc::new(Thumbnail {
        size: (8, 8),
        sample: 2,
    });
    h.cache.request("img-C", target, move |_, result| {
        let _ = tx.send(result);
    });

    let c = rx.recv().await.unwrap().unwrap();
    assert_eq!((c.width(), c.height()), (4, 4));
    assert_eq!(h.cache.reclaim_pool().stats().reused, 1);
    assert_eq!(h.cache.heap().allocations(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_size_request_skips_small_storage() {
    let h = single_slot_harness().await;
    park_first_image(&h).await;
    h.origin.serve("img-C", image(4, 4, 3));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let target = Arc::new(Thumbnail {
        size: (8, 8),
        sample: 1,
    });
    h.cache.request("img-C", target, move |_, result| {
        let _ = tx.send(result);
    });

    rx.recv().await.unwrap().unwrap();
    let stats = h.cache.reclaim_pool().stats();
    assert_eq!(stats.reused, 0);
    assert_eq!(stats.pruned, 1);
    assert_eq!(h.cache.heap().allocations(), 3);
}

#[tokio::test]
async fn test_manual_flush_policy_defers_index_writes() {
    let h = harness_with(TestOrigin::new(), |c| c.with_flush_policy(FlushPolicy::Manual)).await;
    h.origin.serve("img-A", image(4, 4, 7));
    h.cache.load("img-A").await.unwrap();

    let key = h.cache.key_for("img-A");
    let journal_path = h.cache.disk().unwrap().directory().join(JOURNAL_FILE);
    let committed = format!("CLEAN {} ", key.as_str());
    let on_disk = || std::fs::read_to_string(&journal_path).unwrap();
    assert!(!on_disk().contains(&committed));

    h.cache.flush().await.unwrap();
    assert!(on_disk().contains(&committed));
}

#[tokio::test]
async fn test_every_commit_flush_policy_writes_index() {
    let h = harness(TestOrigin::new()).await;
    assert_eq!(h.cache.config().flush_policy, FlushPolicy::EveryCommit);
    h.origin.serve("img-A", image(4, 4, 7));
    h.cache.load("img-A").await.unwrap();

    let key = h.cache.key_for("img-A");
    let journal_path = h.cache.disk().unwrap().directory().join(JOURNAL_FILE);
    let journal = std::fs::read_to_string(journal_path).unwrap();
    assert!(journal.contains(&format!("CLEAN {} ", key.as_str())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalidate_during_fetch_drops_record() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(TestOrigin::gated(Arc::clone(&gate))).await;
    h.origin.serve("img-A", image(4, 4, 5));
    let cache = Arc::new(h.cache);

    let loader = Arc::clone(&cache);
    let pending = tokio::spawn(async move { loader.load("img-A").await });
    let origin = Arc::clone(&h.origin);
    wait_for(|| origin.calls("img-A") == 1).await;

    cache.invalidate("img-A").await;
    gate.add_permits(1);

    // Waiters still get the image, but it is not kept on disk.
    let buffer = pending.await.unwrap().unwrap();
    assert!(buffer.pixels().iter().all(|&p| p == 5));
    let key = cache.key_for("img-A");
    let disk = cache.disk().unwrap();
    assert!(!disk.contains(key.as_str()));
    assert!(!disk.record_path(key.as_str()).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cache_shared_across_tasks() {
    assert_send_sync::<ImageCache>();

    let h = harness(TestOrigin::new()).await;
    h.origin.serve("img-A", image(4, 4, 1));
    let cache = Arc::new(h.cache);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.load("img-A").await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    assert_eq!(h.origin.calls("img-A"), 1);
}
