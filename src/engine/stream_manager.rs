//! Stream Manager: creates, tracks, and forcibly terminates concurrent
//! download/upload streams, and accounts bytes per stream.
//!
//! The registry (two maps keyed by monotonic stream id, one per direction)
//! is touched only synchronously -- never while holding the lock across an
//! `.await` -- so registry mutations are atomic between suspension points,
//! per the concurrency model.

use crate::engine::bus::{Bus, EngineEvent, LifecycleKind};
use crate::engine::origin_client::OriginClient;
use crate::model::{Direction, ParameterSet};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

const UPLOAD_MIN_BUFFER: u64 = 4 * 1024;
const UPLOAD_MAX_BUFFER: u64 = 64 * 1024;
const UPLOAD_SLOW_START_BUFFERS: u64 = 30;
const UPLOAD_QUEUE_LOW_WATERMARK: usize = 5;
const UPLOAD_QUEUE_STALL: Duration = Duration::from_millis(300);
const UPLOAD_POST_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_MAX_RETRIES: u32 = 2;
const UPLOAD_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const INTER_SPAWN_DELAY: Duration = Duration::from_millis(100);
const BIDIRECTIONAL_GAP: Duration = Duration::from_millis(200);

const BARRIER_QUIESCENCE: Duration = Duration::from_millis(200);
const BARRIER_MAX_ROUNDS: u32 = 15;
const BARRIER_INITIAL_DELAY: Duration = Duration::from_millis(100);

struct StreamEntry {
    direction: Direction,
    created_at: Instant,
    active: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
    handle: JoinHandle<()>,
    /// Child tasks the stream's own driver has spawned (one per in-flight
    /// `POST /upload`; always empty for downloads). Aborting `handle` kills
    /// the driver loop but not tasks it already spawned off of it, so the
    /// registry has to reach in here too on termination.
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveCounts {
    pub download: usize,
    pub upload: usize,
    pub total: usize,
}

pub struct StreamManager {
    bus: Bus,
    client: OriginClient,
    session_start: Instant,
    next_id: AtomicU64,
    downloads: Mutex<HashMap<u64, StreamEntry>>,
    uploads: Mutex<HashMap<u64, StreamEntry>>,
}

impl StreamManager {
    pub fn new(bus: Bus, client: OriginClient, session_start: Instant) -> Self {
        Self {
            bus,
            client,
            session_start,
            next_id: AtomicU64::new(1),
            downloads: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn elapsed(&self) -> Duration {
        self.session_start.elapsed()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn registry(&self, direction: Direction) -> &Mutex<HashMap<u64, StreamEntry>> {
        match direction {
            Direction::Download => &self.downloads,
            Direction::Upload => &self.uploads,
        }
    }

    /// Per-stream byte totals for a direction, taken synchronously. Used by
    /// the Throughput Monitor each sampling tick.
    pub fn snapshot_bytes(&self, direction: Direction) -> Vec<(u64, u64)> {
        self.registry(direction)
            .lock()
            .expect("registry poisoned")
            .iter()
            .map(|(id, e)| (*id, e.bytes.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn active_counts(&self) -> ActiveCounts {
        let download = self.downloads.lock().expect("registry poisoned").len();
        let upload = self.uploads.lock().expect("registry poisoned").len();
        ActiveCounts {
            download,
            upload,
            total: download + upload,
        }
    }

    fn insert(&self, direction: Direction, id: u64, entry: StreamEntry) {
        self.registry(direction)
            .lock()
            .expect("registry poisoned")
            .insert(id, entry);
        self.bus.publish(EngineEvent::StreamLifecycle {
            kind: LifecycleKind::Created,
            stream_id: id,
            direction,
            elapsed_time: self.elapsed(),
        });
    }

    /// Terminate a single stream. Idempotent: terminating an id that is no
    /// longer registered (or never was) is a silent no-op.
    pub fn terminate_stream(&self, id: u64, direction: Direction) {
        let entry = self
            .registry(direction)
            .lock()
            .expect("registry poisoned")
            .remove(&id);
        let Some(entry) = entry else { return };
        entry.active.store(false, Ordering::Relaxed);
        entry.handle.abort();
        for h in entry.inflight.lock().expect("inflight poisoned").drain(..) {
            h.abort();
        }
        self.bus.publish(EngineEvent::StreamLifecycle {
            kind: LifecycleKind::Terminated,
            stream_id: id,
            direction,
            elapsed_time: self.elapsed(),
        });
    }

    /// Terminate every registered stream. If anything is still present
    /// afterwards (it shouldn't be -- abort is immediate) force a reset.
    pub fn terminate_all(&self) {
        let download_ids: Vec<u64> = self
            .downloads
            .lock()
            .expect("registry poisoned")
            .keys()
            .copied()
            .collect();
        for id in download_ids {
            self.terminate_stream(id, Direction::Download);
        }
        let upload_ids: Vec<u64> = self
            .uploads
            .lock()
            .expect("registry poisoned")
            .keys()
            .copied()
            .collect();
        for id in upload_ids {
            self.terminate_stream(id, Direction::Upload);
        }

        if self.active_counts().total > 0 {
            self.reset_registry();
        }
    }

    /// Emergency path: unconditionally clear both maps, aborting every
    /// handle regardless of whether `terminate_stream` already tried.
    pub fn reset_registry(&self) {
        {
            let mut map = self.downloads.lock().expect("registry poisoned");
            for (_, entry) in map.drain() {
                entry.active.store(false, Ordering::Relaxed);
                entry.handle.abort();
                for h in entry.inflight.lock().expect("inflight poisoned").drain(..) {
                    h.abort();
                }
            }
        }
        {
            let mut map = self.uploads.lock().expect("registry poisoned");
            for (_, entry) in map.drain() {
                entry.active.store(false, Ordering::Relaxed);
                entry.handle.abort();
                for h in entry.inflight.lock().expect("inflight poisoned").drain(..) {
                    h.abort();
                }
            }
        }
        self.bus.publish(EngineEvent::StreamReset {
            elapsed_time: self.elapsed(),
        });
    }

    /// The Phase Barrier: terminate everything, wait for quiescence, then
    /// poll the registry with exponentially spaced delays until it drains.
    /// Never fails outward -- a verification failure is logged and resolved
    /// with an emergency reset, and the transition proceeds regardless.
    pub async fn run_barrier(&self) {
        self.terminate_all();
        tokio::time::sleep(BARRIER_QUIESCENCE).await;

        let mut delay = BARRIER_INITIAL_DELAY;
        for _ in 0..BARRIER_MAX_ROUNDS {
            if self.active_counts().total == 0 {
                return;
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        if self.active_counts().total > 0 {
            self.bus.publish(EngineEvent::Info {
                message: "phase barrier: registry did not drain, forcing reset".into(),
            });
            self.reset_registry();
        }
    }

    pub async fn start_download_saturation(&self, params: ParameterSet) {
        for _ in 0..params.stream_count {
            self.spawn_download_stream();
            tokio::time::sleep(INTER_SPAWN_DELAY).await;
        }
    }

    pub async fn start_upload_saturation(&self, params: ParameterSet) {
        for _ in 0..params.stream_count {
            self.spawn_upload_stream(params.pending_depth, false);
            tokio::time::sleep(INTER_SPAWN_DELAY).await;
        }
    }

    /// Same as `start_upload_saturation` but buffers ramp through slow-start
    /// sizing; used while Parameter Discovery is exploring.
    pub async fn start_upload_warmup(&self, params: ParameterSet) {
        for _ in 0..params.stream_count {
            self.spawn_upload_stream(params.pending_depth, true);
            tokio::time::sleep(INTER_SPAWN_DELAY).await;
        }
    }

    pub async fn start_bidirectional_saturation(
        &self,
        download_params: ParameterSet,
        upload_params: ParameterSet,
    ) {
        self.start_download_saturation(download_params).await;
        tokio::time::sleep(BIDIRECTIONAL_GAP).await;
        self.start_upload_saturation(upload_params).await;
    }

    /// Add or remove download streams to reach `target` without disturbing
    /// the ones already running. Used by Parameter Discovery when it
    /// increases or backs off `stream_count` mid-warmup.
    pub fn adjust_download_streams(&self, target: usize) {
        let current = self.downloads.lock().expect("registry poisoned").len();
        if current < target {
            for _ in current..target {
                self.spawn_download_stream();
            }
        } else if current > target {
            let extra: Vec<u64> = self
                .downloads
                .lock()
                .expect("registry poisoned")
                .keys()
                .take(current - target)
                .copied()
                .collect();
            for id in extra {
                self.terminate_stream(id, Direction::Download);
            }
        }
    }

    /// Add or remove upload streams to reach `target`, and/or change the
    /// in-flight depth of the existing ones is not supported in place --
    /// Parameter Discovery re-spawns affected streams instead, which is
    /// simpler and matches the "per-stream queue" model (a live queue
    /// doesn't survive a depth change anyway).
    pub fn adjust_upload_streams(&self, target: usize, pending_depth: usize, warmup: bool) {
        let current = self.uploads.lock().expect("registry poisoned").len();
        if current < target {
            for _ in current..target {
                self.spawn_upload_stream(pending_depth, warmup);
            }
        } else if current > target {
            let extra: Vec<u64> = self
                .uploads
                .lock()
                .expect("registry poisoned")
                .keys()
                .take(current - target)
                .copied()
                .collect();
            for id in extra {
                self.terminate_stream(id, Direction::Upload);
            }
        }
    }

    fn spawn_download_stream(&self) {
        let id = self.alloc_id();
        let active = Arc::new(AtomicBool::new(true));
        let bytes = Arc::new(AtomicU64::new(0));
        let client = self.client.clone();
        let active2 = active.clone();
        let bytes2 = bytes.clone();

        let handle = tokio::spawn(async move {
            run_download_stream(client, id, active2, bytes2).await;
        });

        self.insert(
            Direction::Download,
            id,
            StreamEntry {
                direction: Direction::Download,
                created_at: Instant::now(),
                active,
                bytes,
                handle,
                inflight: Arc::new(Mutex::new(Vec::new())),
            },
        );
    }

    fn spawn_upload_stream(&self, pending_depth: usize, warmup: bool) {
        let id = self.alloc_id();
        let active = Arc::new(AtomicBool::new(true));
        let bytes = Arc::new(AtomicU64::new(0));
        let inflight = Arc::new(Mutex::new(Vec::new()));
        let client = self.client.clone();
        let active2 = active.clone();
        let bytes2 = bytes.clone();
        let inflight2 = inflight.clone();

        let handle = tokio::spawn(async move {
            run_upload_stream(
                client,
                id,
                active2,
                bytes2,
                pending_depth.max(1),
                warmup,
                inflight2,
            )
            .await;
        });

        self.insert(
            Direction::Upload,
            id,
            StreamEntry {
                direction: Direction::Upload,
                created_at: Instant::now(),
                active,
                bytes,
                handle,
                inflight,
            },
        );
    }
}

async fn run_download_stream(
    client: OriginClient,
    id: u64,
    active: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
) {
    let mut url = client.download_url();
    url.query_pairs_mut().append_pair("measId", &client.meas_id);
    let tag = id.to_string();

    while active.load(Ordering::Relaxed) {
        let resp = match client
            .http
            .get(url.clone())
            .header("Cache-Control", "no-store")
            .header("X-Stream-ID", &tag)
            .send()
            .await
        {
            Ok(r) => r,
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            if !active.load(Ordering::Relaxed) {
                return;
            }
            match chunk {
                Ok(b) => {
                    bytes.fetch_add(b.len() as u64, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }
    }
}

/// Buffer size for the `n`th buffer drawn (0-indexed) during a warmup's
/// slow-start: logarithmic ramp from 4 KiB to 64 KiB over the first ~30
/// buffers, fixed at 64 KiB afterwards.
fn slow_start_buffer_len(buffers_drawn: u64, warmup: bool) -> usize {
    if !warmup || buffers_drawn >= UPLOAD_SLOW_START_BUFFERS {
        return UPLOAD_MAX_BUFFER as usize;
    }
    let ratio = buffers_drawn as f64 / UPLOAD_SLOW_START_BUFFERS as f64;
    let min = UPLOAD_MIN_BUFFER as f64;
    let max = UPLOAD_MAX_BUFFER as f64;
    (min * (max / min).powf(ratio)).round() as usize
}

struct UploadQueue {
    buffers: VecDeque<Bytes>,
    buffers_drawn: u64,
    last_progress: Instant,
    warmup: bool,
}

impl UploadQueue {
    fn new(warmup: bool) -> Self {
        Self {
            buffers: VecDeque::new(),
            buffers_drawn: 0,
            last_progress: Instant::now(),
            warmup,
        }
    }

    fn refill_if_needed(&mut self) {
        let stalled = self.last_progress.elapsed() >= UPLOAD_QUEUE_STALL;
        if self.buffers.len() >= UPLOAD_QUEUE_LOW_WATERMARK && !stalled {
            return;
        }
        while self.buffers.len() < UPLOAD_QUEUE_LOW_WATERMARK * 2 {
            let len = slow_start_buffer_len(self.buffers_drawn, self.warmup);
            self.buffers.push_back(Bytes::from(vec![0u8; len]));
            self.buffers_drawn += 1;
        }
    }

    fn pop(&mut self) -> Bytes {
        self.refill_if_needed();
        self.buffers
            .pop_front()
            .unwrap_or_else(|| Bytes::from(vec![0u8; UPLOAD_MAX_BUFFER as usize]))
    }

    fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
    }
}

async fn post_with_retry(client: &OriginClient, url: reqwest::Url, body: Bytes, tag: &str) -> bool {
    let mut attempt = 0;
    loop {
        let result = client
            .http
            .post(url.clone())
            .header("X-Stream-ID", tag)
            .header("X-Retry", attempt.to_string())
            .timeout(UPLOAD_POST_TIMEOUT)
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => return true,
            _ if attempt >= UPLOAD_MAX_RETRIES => return false,
            _ => {
                attempt += 1;
                tokio::time::sleep(UPLOAD_RETRY_BACKOFF).await;
            }
        }
    }
}

async fn run_upload_stream(
    client: OriginClient,
    id: u64,
    active: Arc<AtomicBool>,
    bytes: Arc<AtomicU64>,
    pending_depth: usize,
    warmup: bool,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let url = client.upload_url();
    let tag = id.to_string();
    let semaphore = Arc::new(Semaphore::new(pending_depth));
    let mut queue = UploadQueue::new(warmup);

    while active.load(Ordering::Relaxed) {
        let buf = queue.pop();
        let buf_len = buf.len() as u64;

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        let client2 = client.clone();
        let url2 = url.clone();
        let tag2 = tag.clone();
        let bytes2 = bytes.clone();
        let active2 = active.clone();

        let task = tokio::spawn(async move {
            let _permit = permit;
            if !active2.load(Ordering::Relaxed) {
                return;
            }
            if post_with_retry(&client2, url2, buf, &tag2).await {
                bytes2.fetch_add(buf_len, Ordering::Relaxed);
            }
        });
        queue.mark_progress();

        // Tracked in the entry's shared list so `terminate_stream` can abort
        // these too -- aborting this driver task alone would otherwise leave
        // whatever POSTs are mid-flight to run to completion in the
        // background, crediting bytes after the stream is gone.
        let mut guard = inflight.lock().expect("inflight poisoned");
        guard.retain(|h: &JoinHandle<()>| !h.is_finished());
        guard.push(task);
    }

    // Reached only on graceful exit (semaphore closed); external
    // termination aborts this task before the loop condition is re-checked,
    // so `terminate_stream`/`reset_registry` own draining `inflight` there.
    for h in inflight.lock().expect("inflight poisoned").drain(..) {
        h.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunConfig;

    fn test_client() -> OriginClient {
        let cfg = RunConfig {
            base_url: "http://127.0.0.1:9".into(),
            meas_id: "t".into(),
            comments: None,
            user_agent: "test".into(),
            max_download_streams: 8,
            max_upload_streams: 8,
            max_pending_depth: 4,
            baseline_duration: Duration::from_secs(1),
            load_phase_duration: Duration::from_secs(1),
            min_warmup_duration: Duration::from_millis(100),
            probe_interval_ms: 100,
            probe_timeout_min_ms: 1000,
            probe_timeout_max_ms: 2000,
        };
        OriginClient::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn stream_ids_are_monotonic_and_never_reused() {
        let mgr = StreamManager::new(Bus::new(), test_client(), Instant::now());

        mgr.adjust_download_streams(3);
        let first: Vec<u64> = mgr
            .snapshot_bytes(Direction::Download)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(first.len(), 3);
        let max_first = *first.iter().max().unwrap();

        for id in &first {
            mgr.terminate_stream(*id, Direction::Download);
        }
        assert_eq!(mgr.active_counts().download, 0);

        mgr.adjust_download_streams(2);
        let second: Vec<u64> = mgr
            .snapshot_bytes(Direction::Download)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert!(second.iter().all(|id| *id > max_first));
        assert!(second.iter().all(|id| !first.contains(id)));
    }

    #[tokio::test]
    async fn terminate_all_is_idempotent() {
        let mgr = StreamManager::new(Bus::new(), test_client(), Instant::now());
        mgr.adjust_download_streams(2);
        mgr.adjust_upload_streams(2, 1, false);
        assert_eq!(mgr.active_counts().total, 4);

        mgr.terminate_all();
        assert_eq!(mgr.active_counts().total, 0);
        mgr.terminate_all();
        assert_eq!(mgr.active_counts().total, 0);
    }

    #[tokio::test]
    async fn barrier_drains_registry_to_zero() {
        let mgr = StreamManager::new(Bus::new(), test_client(), Instant::now());
        mgr.adjust_download_streams(3);
        mgr.adjust_upload_streams(2, 2, true);
        assert_eq!(mgr.active_counts().total, 5);

        mgr.run_barrier().await;
        assert_eq!(mgr.active_counts().total, 0);
    }

    /// Regression test for the registry bypassing child upload tasks: a
    /// stream's driver loop (`handle`) gets force-aborted by
    /// `terminate_stream`, which drops the future mid-await without ever
    /// reaching its own cleanup. Anything it had spawned into `inflight`
    /// must be aborted by `terminate_stream` itself, or those child tasks
    /// (and the bytes they'd credit on success) outlive the stream.
    #[tokio::test]
    async fn terminate_stream_aborts_tracked_inflight_tasks() {
        let mgr = StreamManager::new(Bus::new(), test_client(), Instant::now());

        let ticks = Arc::new(AtomicU64::new(0));
        let ticks2 = ticks.clone();
        let child = tokio::spawn(async move {
            loop {
                ticks2.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let inflight = Arc::new(Mutex::new(vec![child]));

        let outer = tokio::spawn(std::future::pending::<()>());
        let id = mgr.alloc_id();
        mgr.insert(
            Direction::Upload,
            id,
            StreamEntry {
                direction: Direction::Upload,
                created_at: Instant::now(),
                active: Arc::new(AtomicBool::new(true)),
                bytes: Arc::new(AtomicU64::new(0)),
                handle: outer,
                inflight: inflight.clone(),
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.terminate_stream(id, Direction::Upload);
        assert!(inflight.lock().expect("inflight poisoned").is_empty());

        let after_abort = ticks.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), after_abort);
    }
}
