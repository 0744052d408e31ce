//! One-shot sound effects layer.
//!
//! A single player/mixer pair: at most one effect sounds at a time, and a
//! new `play` displaces whatever is still running. Effects are registered
//! up front and their buffers held in a small LRU so a bell or chime starts
//! without a decode hiccup.

use crate::audio::cache::{BufferCache, LoadPriority};
use crate::audio::types::DecodedBuffer;
use crate::error::Result;
use crate::host::{MixerNode, PlayerNode};
use crate::playback::engine::run_fade;
use lull_common::FadeCurve;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Default number of resident effect buffers.
const DEFAULT_CAPACITY: usize = 10;

/// Buffer-load deadline for effects.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered sound effect: where it lives and how loud it wants to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundEffect {
    pub name: String,
    pub uri: String,
    /// Intrinsic volume, multiplied by the layer's master volume
    pub volume: f32,
}

struct LoadedEffect {
    effect: SoundEffect,
    buffer: Arc<DecodedBuffer>,
    last_used: u64,
}

struct SfxInner {
    effects: HashMap<String, LoadedEffect>,
    master_volume: f32,
    current: Option<String>,
    clock: u64,
}

/// One-at-a-time effect playback backed by a preload cache.
pub struct SfxPlayer {
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    cache: Arc<BufferCache>,
    capacity: usize,
    inner: Mutex<SfxInner>,
}

impl SfxPlayer {
    pub fn new(
        player: Arc<dyn PlayerNode>,
        mixer: Arc<dyn MixerNode>,
        cache: Arc<BufferCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            player,
            mixer,
            cache,
            capacity: DEFAULT_CAPACITY,
            inner: Mutex::new(SfxInner {
                effects: HashMap::new(),
                master_volume: 1.0,
                current: None,
                clock: 0,
            }),
        })
    }

    /// Decode and register effects ahead of playback.
    pub async fn preload(&self, effects: &[SoundEffect]) -> Result<()> {
        for effect in effects {
            let buffer = self
                .cache
                .get(&effect.uri, LoadPriority::Prefetch, LOAD_TIMEOUT)
                .await?;
            let mut inner = self.inner.lock().unwrap();
            inner.clock += 1;
            let tick = inner.clock;
            inner.effects.insert(
                effect.name.clone(),
                LoadedEffect {
                    effect: effect.clone(),
                    buffer,
                    last_used: tick,
                },
            );
            Self::evict_locked(&mut inner, self.capacity);
            debug!(name = %effect.name, "sound effect preloaded");
        }
        Ok(())
    }

    fn evict_locked(inner: &mut SfxInner, capacity: usize) {
        while inner.effects.len() > capacity {
            let victim = inner
                .effects
                .iter()
                .filter(|(name, _)| inner.current.as_deref() != Some(name.as_str()))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());
            match victim {
                Some(name) => {
                    inner.effects.remove(&name);
                }
                None => break,
            }
        }
    }

    /// Play an effect, stopping whatever is currently sounding. Unknown
    /// names are loaded on demand and registered with unit volume.
    pub async fn play(&self, name: &str, fade_in: f64) -> Result<()> {
        let (buffer, level) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.clock += 1;
            let tick = inner.clock;
            if let Some(loaded) = inner.effects.get_mut(name) {
                loaded.last_used = tick;
                (
                    Some(Arc::clone(&loaded.buffer)),
                    inner.master_volume * loaded.effect.volume,
                )
            } else {
                (None, inner.master_volume)
            }
        };

        let (buffer, level) = match buffer {
            Some(buffer) => (buffer, level),
            None => {
                // Treat the name as a URI for ad-hoc playback
                let buffer = self
                    .cache
                    .get(name, LoadPriority::Immediate, LOAD_TIMEOUT)
                    .await?;
                let mut inner = self.inner.lock().unwrap();
                inner.clock += 1;
                let tick = inner.clock;
                inner.effects.insert(
                    name.to_string(),
                    LoadedEffect {
                        effect: SoundEffect {
                            name: name.to_string(),
                            uri: name.to_string(),
                            volume: 1.0,
                        },
                        buffer: Arc::clone(&buffer),
                        last_used: tick,
                    },
                );
                Self::evict_locked(&mut inner, self.capacity);
                let level = inner.master_volume;
                (buffer, level)
            }
        };

        // Displace the current effect
        self.player.stop();
        self.player.reset();

        self.inner.lock().unwrap().current = Some(name.to_string());
        self.player.schedule(buffer, 0, None)?;
        self.player.play();

        if fade_in > 0.0 {
            self.mixer.set_volume(0.0);
            run_fade(
                Arc::clone(&self.mixer),
                0.0,
                level,
                fade_in,
                FadeCurve::Linear,
                None,
            )
            .await;
        } else {
            self.mixer.set_volume(level);
        }
        info!(name, "sound effect playing");
        Ok(())
    }

    /// Fade the current effect down and stop the player.
    pub async fn stop(&self, fade_out: f64) {
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
        self.inner.lock().unwrap().current = None;
    }

    pub fn pause(&self) {
        self.player.pause();
    }

    pub fn resume(&self) {
        self.player.play();
    }

    /// Master volume multiplier over each effect's intrinsic volume.
    pub fn set_master_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        let current_level = {
            let mut inner = self.inner.lock().unwrap();
            inner.master_volume = clamped;
            inner.current.as_ref().and_then(|name| {
                inner
                    .effects
                    .get(name)
                    .map(|loaded| clamped * loaded.effect.volume)
            })
        };
        if let Some(level) = current_level {
            if self.player.is_playing() {
                self.mixer.set_volume(level);
            }
        }
    }

    /// Evict effects by name, stopping playback first when the evicted
    /// effect is the one sounding.
    pub async fn unload(&self, names: &[String]) {
        let stop_first = {
            let inner = self.inner.lock().unwrap();
            inner
                .current
                .as_ref()
                .map(|current| names.contains(current))
                .unwrap_or(false)
        };
        if stop_first {
            self.stop(0.0).await;
        }
        let mut inner = self.inner.lock().unwrap();
        for name in names {
            inner.effects.remove(name);
            debug!(name = %name, "sound effect unloaded");
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.lock().unwrap().effects.len()
    }

    pub fn current(&self) -> Option<String> {
        self.inner.lock().unwrap().current.clone()
    }
}
