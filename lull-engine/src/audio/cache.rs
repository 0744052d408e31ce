//! Content-addressed cache of decoded buffers.
//!
//! One decode per URI: concurrent `get` calls for the same key share a
//! single in-flight load through a watch slot. Entries are bounded by count
//! with LRU eviction; buffers referenced by a playing slot or the overlay
//! are pinned and never evicted. Normalization, when configured, runs once
//! at load time so the cost is paid off the audio path.

use crate::audio::decode::PcmReader;
use crate::audio::types::DecodedBuffer;
use crate::dsp::{normalize_buffer, NormalizationConfig};
use crate::error::{PlayerError, Result};
use lull_common::{EngineEvent, EventBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Requested urgency of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPriority {
    /// Background warm-up; failures only logged
    Prefetch,
    /// A player is waiting on the result
    Immediate,
}

#[derive(Clone)]
enum LoadState {
    Pending,
    Done(Arc<DecodedBuffer>),
    Failed(String),
}

enum EntryState {
    Loading {
        load_id: u64,
        rx: watch::Receiver<LoadState>,
    },
    Ready(Arc<DecodedBuffer>),
}

struct CacheEntry {
    state: EntryState,
    last_used: u64,
    pins: usize,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
}

/// URI-keyed store of shared decoded buffers.
pub struct BufferCache {
    reader: Arc<dyn PcmReader>,
    normalization: Option<NormalizationConfig>,
    max_entries: usize,
    events: Option<EventBus>,
    inner: Mutex<CacheInner>,
    clock: AtomicU64,
    next_load_id: AtomicU64,
}

impl BufferCache {
    pub fn new(
        reader: Arc<dyn PcmReader>,
        normalization: Option<NormalizationConfig>,
        max_entries: usize,
    ) -> Self {
        Self {
            reader,
            normalization,
            max_entries: max_entries.max(1),
            events: None,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
            }),
            clock: AtomicU64::new(0),
            next_load_id: AtomicU64::new(0),
        }
    }

    /// Attach an event bus for load-lifecycle events.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn normalization_enabled(&self) -> bool {
        self.normalization.is_some()
    }

    fn touch(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.emit_lossy(event);
        }
    }

    /// Fetch the buffer for `uri`, decoding on miss.
    ///
    /// Waits at most `timeout`; on expiry the in-flight load is abandoned
    /// and `FileLoadTimeout` is returned.
    pub async fn get(
        self: &Arc<Self>,
        uri: &str,
        priority: LoadPriority,
        timeout: Duration,
    ) -> Result<Arc<DecodedBuffer>> {
        let (rx, load_id, fresh) = {
            let mut inner = self.inner.lock().unwrap();
            let tick = self.touch();

            match inner.entries.get_mut(uri) {
                Some(entry) => {
                    entry.last_used = tick;
                    match &entry.state {
                        EntryState::Ready(buffer) => return Ok(Arc::clone(buffer)),
                        EntryState::Loading { load_id, rx } => (rx.clone(), *load_id, false),
                    }
                }
                None => {
                    let load_id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(LoadState::Pending);
                    inner.entries.insert(
                        uri.to_string(),
                        CacheEntry {
                            state: EntryState::Loading {
                                load_id,
                                rx: rx.clone(),
                            },
                            last_used: tick,
                            pins: 0,
                        },
                    );
                    self.spawn_load(uri.to_string(), load_id, tx);
                    (rx, load_id, true)
                }
            }
        };

        if fresh {
            debug!(uri, ?priority, "cache miss, load started");
        } else {
            debug!(uri, ?priority, "joining in-flight load");
        }

        let mut rx = rx;
        let wait = async {
            loop {
                {
                    let state = rx.borrow().clone();
                    match state {
                        LoadState::Pending => {}
                        LoadState::Done(buffer) => return Ok(buffer),
                        LoadState::Failed(message) => {
                            return Err(PlayerError::FileLoadFailed {
                                uri: uri.to_string(),
                                source: anyhow::anyhow!(message),
                            });
                        }
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(PlayerError::FileLoadFailed {
                        uri: uri.to_string(),
                        source: anyhow::anyhow!("load task dropped"),
                    });
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                // Abandon the load so a later get can retry cleanly
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.entries.get(uri) {
                    if matches!(&entry.state, EntryState::Loading { load_id: id, .. } if *id == load_id)
                    {
                        inner.entries.remove(uri);
                    }
                }
                warn!(uri, ?timeout, "buffer load timed out");
                Err(PlayerError::FileLoadTimeout {
                    uri: uri.to_string(),
                    duration: timeout,
                })
            }
        }
    }

    fn spawn_load(self: &Arc<Self>, uri: String, load_id: u64, tx: watch::Sender<LoadState>) {
        let cache = Arc::clone(self);
        self.emit(EngineEvent::FileLoadStarted {
            uri: uri.clone(),
            timestamp: chrono::Utc::now(),
        });

        tokio::spawn(async move {
            let reader = Arc::clone(&cache.reader);
            let normalization = cache.normalization;
            let blocking_uri = uri.clone();

            let result = tokio::task::spawn_blocking(move || {
                let decoded = reader.read(&blocking_uri)?;
                match &normalization {
                    Some(config) => normalize_buffer(&decoded, config)
                        .map(Arc::new)
                        .map_err(|e| PlayerError::from(e)),
                    None => Ok(Arc::new(decoded)),
                }
            })
            .await
            .unwrap_or_else(|e| {
                Err(PlayerError::FileLoadFailed {
                    uri: uri.clone(),
                    source: anyhow::anyhow!("decode task panicked: {e}"),
                })
            });

            match result {
                Ok(buffer) => {
                    {
                        let mut inner = cache.inner.lock().unwrap();
                        let installed = match inner.entries.get_mut(&uri) {
                            Some(entry)
                                if matches!(&entry.state, EntryState::Loading { load_id: id, .. } if *id == load_id) =>
                            {
                                entry.state = EntryState::Ready(Arc::clone(&buffer));
                                true
                            }
                            _ => false,
                        };
                        if installed {
                            Self::evict_locked(&mut inner, cache.max_entries);
                        }
                    }
                    info!(
                        %uri,
                        seconds = buffer.duration_seconds(),
                        "buffer loaded"
                    );
                    cache.emit(EngineEvent::FileLoadCompleted {
                        uri: uri.clone(),
                        duration_seconds: buffer.duration_seconds(),
                        timestamp: chrono::Utc::now(),
                    });
                    let _ = tx.send(LoadState::Done(buffer));
                }
                Err(error) => {
                    {
                        let mut inner = cache.inner.lock().unwrap();
                        if let Some(entry) = inner.entries.get(&uri) {
                            if matches!(&entry.state, EntryState::Loading { load_id: id, .. } if *id == load_id)
                            {
                                inner.entries.remove(&uri);
                            }
                        }
                    }
                    warn!(%uri, %error, "buffer load failed");
                    cache.emit(EngineEvent::FileLoadFailed {
                        uri: uri.clone(),
                        error: error.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                    let _ = tx.send(LoadState::Failed(error.to_string()));
                }
            }
        });
    }

    /// Warm the cache in the background.
    pub fn preload(self: &Arc<Self>, uri: &str) {
        let cache = Arc::clone(self);
        let uri = uri.to_string();
        tokio::spawn(async move {
            if let Err(error) = cache
                .get(&uri, LoadPriority::Prefetch, Duration::from_secs(120))
                .await
            {
                warn!(%uri, %error, "preload failed");
            }
        });
    }

    /// Protect `uri` from eviction while a player references it.
    pub fn pin(&self, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(uri) {
            entry.pins += 1;
        }
    }

    pub fn unpin(&self, uri: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(uri) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Number of resident entries (loading or ready).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(inner: &mut CacheInner, max_entries: usize) {
        while inner.entries.len() > max_entries {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.pins == 0 && matches!(e.state, EntryState::Ready(_)))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(uri, _)| uri.clone());

            match victim {
                Some(uri) => {
                    debug!(uri, "evicting LRU buffer");
                    inner.entries.remove(&uri);
                }
                // Everything left is pinned or still loading
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use std::sync::atomic::AtomicUsize;

    /// Reader that synthesizes one second of audio per URI and counts calls.
    struct CountingReader {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingReader {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Some(delay),
            }
        }
    }

    impl PcmReader for CountingReader {
        fn read(&self, uri: &str) -> std::result::Result<DecodedBuffer, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if uri.contains("missing") {
                return Err(DecodeError::FileNotFound {
                    uri: uri.to_string(),
                });
            }
            Ok(DecodedBuffer::silence(44_100, 44_100))
        }
    }

    fn cache_with(reader: CountingReader, max: usize) -> (Arc<BufferCache>, Arc<CountingReader>) {
        let reader = Arc::new(reader);
        let cache = Arc::new(BufferCache::new(
            Arc::clone(&reader) as Arc<dyn PcmReader>,
            None,
            max,
        ));
        (cache, reader)
    }

    #[tokio::test]
    async fn test_second_get_hits_cache() {
        let (cache, reader) = cache_with(CountingReader::new(), 4);

        let a = cache
            .get("a.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap();
        let b = cache
            .get("a.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_coalesce() {
        let (cache, reader) = cache_with(CountingReader::slow(Duration::from_millis(50)), 4);

        let c1 = Arc::clone(&cache);
        let c2 = Arc::clone(&cache);
        let (r1, r2) = tokio::join!(
            c1.get("a.wav", LoadPriority::Immediate, Duration::from_secs(5)),
            c2.get("a.wav", LoadPriority::Immediate, Duration::from_secs(5)),
        );

        assert!(r1.is_ok() && r2.is_ok());
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_propagates_and_retries() {
        let (cache, reader) = cache_with(CountingReader::new(), 4);

        let err = cache
            .get("missing.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::FileLoadFailed { .. }));

        // Failed entries do not stick; a retry hits the reader again
        let _ = cache
            .get("missing.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(reader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_surfaces() {
        let (cache, _) = cache_with(CountingReader::slow(Duration::from_millis(300)), 4);

        let err = cache
            .get("a.wav", LoadPriority::Immediate, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::FileLoadTimeout { .. }));
    }

    #[tokio::test]
    async fn test_lru_eviction_bounded() {
        let (cache, _) = cache_with(CountingReader::new(), 2);

        for uri in ["a.wav", "b.wav", "c.wav"] {
            cache
                .get(uri, LoadPriority::Immediate, Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_eviction() {
        let (cache, reader) = cache_with(CountingReader::new(), 1);

        cache
            .get("a.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap();
        cache.pin("a.wav");

        cache
            .get("b.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap();

        // Pinned "a" stays; a re-get must not re-decode it
        cache
            .get("a.wav", LoadPriority::Immediate, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            reader
                .calls
                .load(Ordering::SeqCst),
            2,
            "pinned entry was evicted and re-decoded"
        );
    }
}
