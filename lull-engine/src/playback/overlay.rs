//! Overlay layer: an independent looping player for ambience and bells.
//!
//! One player/mixer pair, handed off from the graph at construction and
//! owned here exclusively. A cooperative loop task runs the cycle: fade in,
//! play the buffer to completion, drain, fade out, wait out the loop delay,
//! repeat. Pause and resume act on the player node and leave the task
//! blocked at its completion wait; stop cancels the task and cleans up.

use crate::audio::cache::{BufferCache, LoadPriority};
use crate::audio::types::DecodedBuffer;
use crate::config::OverlayConfig;
use crate::dsp::{normalize_buffer, resample_buffer, NormalizationConfig};
use crate::error::Result;
use crate::host::{MixerNode, PlayerNode};
use crate::playback::engine::run_fade;
use lull_common::{EngineEvent, EventBus, FadeCurve, LoopMode, OverlayState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Wait after each iteration's completion callback for the hardware buffer
/// to actually drain; completion fires when data is handed off, not heard.
const DRAIN_GUARD: Duration = Duration::from_millis(600);

/// Fade-out applied when a new file replaces the current one.
const REPLACE_FADE_OUT_SECONDS: f64 = 1.0;

/// Buffer-load deadline for overlay content.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

struct OverlayInner {
    config: OverlayConfig,
    buffer: Option<Arc<DecodedBuffer>>,
    uri: Option<String>,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Loop scheduler for the overlay audio layer.
pub struct OverlayScheduler {
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    cache: Arc<BufferCache>,
    events: EventBus,
    output_sample_rate: u32,
    inner: Mutex<OverlayInner>,
    state_tx: watch::Sender<OverlayState>,
    wake: Arc<Notify>,
}

impl OverlayScheduler {
    pub fn new(
        player: Arc<dyn PlayerNode>,
        mixer: Arc<dyn MixerNode>,
        cache: Arc<BufferCache>,
        config: OverlayConfig,
        events: EventBus,
        output_sample_rate: u32,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(OverlayState::Idle);
        Arc::new(Self {
            player,
            mixer,
            cache,
            events,
            output_sample_rate,
            inner: Mutex::new(OverlayInner {
                config,
                buffer: None,
                uri: None,
                cancelled: Arc::new(AtomicBool::new(true)),
                task: None,
            }),
            state_tx,
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn state(&self) -> OverlayState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OverlayState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, new_state: OverlayState) {
        let old_state = *self.state_tx.borrow();
        if old_state == new_state {
            return;
        }
        let _ = self.state_tx.send(new_state);
        self.events.emit_lossy(EngineEvent::OverlayStateChanged {
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Sleep that aborts early on cancellation. Returns true when cancelled.
    async fn cancellable_sleep(
        duration: Duration,
        wake: &Notify,
        cancelled: &AtomicBool,
    ) -> bool {
        if cancelled.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = sleep(duration) => cancelled.load(Ordering::SeqCst),
            _ = wake.notified() => true,
        }
    }

    async fn load_buffer(&self, uri: &str) -> Result<Arc<DecodedBuffer>> {
        let (normalized_wanted, already_normalizing) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.config.normalized,
                self.cache.normalization_enabled(),
            )
        };

        let mut buffer = self
            .cache
            .get(uri, LoadPriority::Immediate, LOAD_TIMEOUT)
            .await?;

        // Overlay-specific normalization when the cache was not configured
        // to do it globally
        if normalized_wanted && !already_normalizing {
            let input = Arc::clone(&buffer);
            let normalized = tokio::task::spawn_blocking(move || {
                normalize_buffer(&input, &NormalizationConfig::default())
            })
            .await
            .map_err(|e| crate::error::PlayerError::FileLoadFailed {
                uri: uri.to_string(),
                source: anyhow::anyhow!("normalization task panicked: {e}"),
            })??;
            buffer = Arc::new(normalized);
        }

        // Mismatched buffers are never scheduled directly; convert up front
        if buffer.sample_rate != self.output_sample_rate {
            debug!(
                from = buffer.sample_rate,
                to = self.output_sample_rate,
                "converting overlay buffer to output rate"
            );
            let input = Arc::clone(&buffer);
            let target = self.output_sample_rate;
            let converted =
                tokio::task::spawn_blocking(move || resample_buffer(&input, target))
                    .await
                    .map_err(|e| crate::error::PlayerError::FileLoadFailed {
                        uri: uri.to_string(),
                        source: anyhow::anyhow!("conversion task panicked: {e}"),
                    })??;
            buffer = Arc::new(converted);
        }

        self.cache.pin(uri);
        Ok(buffer)
    }

    /// Load `uri` and enter the loop cycle.
    pub async fn play(self: &Arc<Self>, uri: &str) -> Result<()> {
        self.set_state(OverlayState::Preparing);
        let buffer = match self.load_buffer(uri).await {
            Ok(buffer) => buffer,
            Err(error) => {
                self.set_state(OverlayState::Idle);
                return Err(error);
            }
        };

        self.cancel_task().await;

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(previous) = inner.uri.replace(uri.to_string()) {
                if previous != uri {
                    self.cache.unpin(&previous);
                }
            }
            inner.buffer = Some(buffer);
            inner.cancelled = Arc::clone(&cancelled);
        }

        self.set_state(OverlayState::Playing);
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            scheduler.loop_cycle(cancelled).await;
        });
        self.inner.lock().unwrap().task = Some(task);
        info!(uri, "overlay playing");
        Ok(())
    }

    /// The loop cycle. Runs until the loop mode is exhausted or the task is
    /// cancelled; every sleep and wait is a cancellation point.
    async fn loop_cycle(self: Arc<Self>, cancelled: Arc<AtomicBool>) {
        let mut iteration: u32 = 0;

        loop {
            let (config, buffer) = {
                let inner = self.inner.lock().unwrap();
                match &inner.buffer {
                    Some(buffer) => (inner.config, Arc::clone(buffer)),
                    None => break,
                }
            };

            if cancelled.load(Ordering::SeqCst)
                || !config.loop_mode.should_continue(iteration)
                || self.state() == OverlayState::Stopping
            {
                break;
            }

            // Entry fade, or a hard volume restore: a prior iteration's
            // fade-out leaves the mixer at 0
            if config.fade_in_duration > 0.0 {
                run_fade(
                    Arc::clone(&self.mixer),
                    0.0,
                    config.volume,
                    config.fade_in_duration,
                    config.fade_curve,
                    Some(Arc::clone(&cancelled)),
                )
                .await;
            } else {
                self.mixer.set_volume(config.volume);
            }

            // Schedule this iteration and wait for its completion signal
            let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
            let completion = Box::new(move || {
                let _ = done_tx.try_send(());
            });
            if let Err(error) = self.player.schedule(buffer, 0, Some(completion)) {
                warn!(%error, "overlay schedule failed");
                break;
            }
            self.player.play();

            if done_rx.recv().await.is_none() {
                break;
            }
            if cancelled.load(Ordering::SeqCst) {
                break;
            }

            if Self::cancellable_sleep(DRAIN_GUARD, &self.wake, &cancelled).await {
                break;
            }

            if config.fade_out_duration > 0.0 {
                run_fade(
                    Arc::clone(&self.mixer),
                    config.volume,
                    0.0,
                    config.fade_out_duration,
                    config.fade_curve,
                    Some(Arc::clone(&cancelled)),
                )
                .await;
            }

            iteration += 1;

            let more_to_come = config.loop_mode.target().map_or(true, |t| iteration < t);
            if more_to_come && config.loop_delay > 0.0 {
                if Self::cancellable_sleep(
                    Duration::from_secs_f64(config.loop_delay),
                    &self.wake,
                    &cancelled,
                )
                .await
                {
                    break;
                }
            }
        }

        // Natural exit: a bounded loop ran out of iterations
        if !cancelled.load(Ordering::SeqCst) {
            self.player.stop();
            self.player.reset();
            self.mixer.set_volume(0.0);
            self.set_state(OverlayState::Idle);
            debug!("overlay loop finished");
        }
    }

    async fn cancel_task(&self) {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancelled.store(true, Ordering::SeqCst);
            inner.task.take()
        };
        self.wake.notify_waiters();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop the overlay: cancel the loop, optionally fade out from the
    /// current mixer volume, then halt and reset the player.
    pub async fn stop(&self, fade_out: f64) {
        if self.state() == OverlayState::Idle {
            return;
        }
        self.set_state(OverlayState::Stopping);
        self.cancel_task().await;

        if fade_out > 0.0 {
            run_fade(
                Arc::clone(&self.mixer),
                self.mixer.volume(),
                0.0,
                fade_out,
                FadeCurve::Linear,
                None,
            )
            .await;
        }

        self.player.stop();
        self.player.reset();
        self.mixer.set_volume(0.0);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.buffer = None;
            if let Some(uri) = inner.uri.take() {
                self.cache.unpin(&uri);
            }
        }
        self.set_state(OverlayState::Idle);
        info!("overlay stopped");
    }

    /// Pause the player node; the loop task stays parked at its wait.
    pub fn pause(&self) {
        if self.state() != OverlayState::Playing {
            return;
        }
        self.player.pause();
        self.set_state(OverlayState::Paused);
    }

    pub fn resume(&self) {
        if self.state() != OverlayState::Paused {
            return;
        }
        self.player.play();
        self.set_state(OverlayState::Playing);
    }

    /// Swap in a new file: fade the current sound down, then restart the
    /// cycle with the new buffer.
    pub async fn replace_file(self: &Arc<Self>, uri: &str) -> Result<()> {
        if self.state() == OverlayState::Playing || self.state() == OverlayState::Paused {
            run_fade(
                Arc::clone(&self.mixer),
                self.mixer.volume(),
                0.0,
                REPLACE_FADE_OUT_SECONDS,
                FadeCurve::Linear,
                None,
            )
            .await;
            self.cancel_task().await;
            self.player.stop();
            self.player.reset();
        }
        self.play(uri).await
    }

    pub fn set_config(&self, config: OverlayConfig) {
        self.inner.lock().unwrap().config = config;
    }

    pub fn config(&self) -> OverlayConfig {
        self.inner.lock().unwrap().config
    }

    /// Overlay volume; applied immediately while audible.
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        self.inner.lock().unwrap().config.volume = clamped;
        if self.state() == OverlayState::Playing {
            self.mixer.set_volume(clamped);
        }
    }

    pub fn set_loop_mode(&self, loop_mode: LoopMode) {
        self.inner.lock().unwrap().config.loop_mode = loop_mode;
    }

    pub fn set_loop_delay(&self, loop_delay: f64) {
        self.inner.lock().unwrap().config.loop_delay = loop_delay.max(0.0);
    }
}
