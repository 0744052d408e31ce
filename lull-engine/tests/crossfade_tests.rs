//! Crossfade orchestration: the full transition walk, pause-and-resume of
//! an in-flight fade, rollback, and fast-forward.

mod helpers;

use helpers::{sine_track, SineReader};
use lull_engine::audio::cache::BufferCache;
use lull_engine::host::sim::SimGraph;
use lull_engine::playback::crossfade::{CrossfadeOrchestrator, CrossfadeOutcome};
use lull_engine::playback::engine::{EngineCore, SlotId};
use lull_engine::{CrossfadeKind, EventBus, FadeCurve};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

async fn playing_engine(
    track_seconds: f64,
) -> (Arc<EngineCore>, Arc<CrossfadeOrchestrator>, Arc<SimGraph>) {
    let graph = Arc::new(SimGraph::new());
    let cache = Arc::new(BufferCache::new(Arc::new(SineReader), None, 8));
    let engine = EngineCore::new(Arc::clone(&graph) as _, cache).unwrap();
    engine.setup();
    engine.start().unwrap();
    engine.set_volume(1.0);

    engine
        .load_into_slot(engine.active_slot(), &sine_track(track_seconds), LOAD_TIMEOUT)
        .await
        .unwrap();
    engine.schedule_active(None, FadeCurve::EqualPower).unwrap();

    let orchestrator = CrossfadeOrchestrator::new(Arc::clone(&engine), EventBus::new(32));
    (engine, orchestrator, graph)
}

/// Spawn a crossfade and hand back the handle to its outcome.
fn drive_crossfade(
    orchestrator: &Arc<CrossfadeOrchestrator>,
    to_seconds: f64,
    duration: f64,
) -> tokio::task::JoinHandle<CrossfadeOutcome> {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        orchestrator
            .start_crossfade(
                &sine_track(to_seconds),
                duration,
                FadeCurve::Linear,
                CrossfadeKind::ManualChange,
                LOAD_TIMEOUT,
            )
            .await
            .expect("crossfade runs")
    })
}

#[tokio::test(start_paused = true)]
async fn completed_crossfade_switches_slots_and_cleans_up() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(2)).await;

    let handle = drive_crossfade(&orchestrator, 20.0, 4.0);
    let outcome = handle.await.unwrap();

    assert_eq!(outcome, CrossfadeOutcome::Completed);
    assert_eq!(engine.active_slot(), SlotId::B);
    // New active at target, outgoing silenced and stopped
    assert!((engine.mixer_volume(SlotId::B) - 1.0).abs() < 0.01);
    assert_eq!(engine.mixer_volume(SlotId::A), 0.0);
    assert!(!engine.is_slot_playing(SlotId::A));
    assert!(engine.is_slot_playing(SlotId::B));
    assert!(!engine.is_crossfade_in_progress());
}

#[tokio::test(start_paused = true)]
async fn mid_fade_volumes_are_complementary() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(1)).await;

    let handle = drive_crossfade(&orchestrator, 20.0, 4.0);
    sleep(Duration::from_secs(2)).await;

    // Half way through a linear fade both mixers sit near 0.5
    let active = engine.mixer_volume(SlotId::A);
    let inactive = engine.mixer_volume(SlotId::B);
    assert!((active - 0.5).abs() < 0.15, "active mid-fade {active}");
    assert!((inactive - 0.5).abs() < 0.15, "inactive mid-fade {inactive}");

    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pause_during_fade_snapshots_and_resume_completes() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(1)).await;

    // 5 s crossfade, paused at ≈2 s
    let handle = drive_crossfade(&orchestrator, 20.0, 5.0);
    sleep(Duration::from_secs(2)).await;

    assert!(orchestrator.pause_current().await);
    let outcome = handle.await.unwrap();
    assert_eq!(outcome, CrossfadeOutcome::Paused);

    // Both players frozen, snapshot captured mid-fade
    assert!(!engine.is_slot_playing(SlotId::A));
    assert!(!engine.is_slot_playing(SlotId::B));
    let snapshot = orchestrator.paused_snapshot().expect("snapshot exists");
    assert!(snapshot.active_volume > 0.2 && snapshot.active_volume < 0.9);
    assert!(snapshot.inactive_volume > 0.1 && snapshot.inactive_volume < 0.8);
    assert!(
        (snapshot.remaining - 3.0).abs() < 0.5,
        "remaining {}",
        snapshot.remaining
    );

    // A long sit in pause must not advance anything
    sleep(Duration::from_secs(3)).await;

    let resumed = orchestrator.resume_crossfade().await.unwrap();
    assert!(resumed);

    // Fade finished over the remaining ≈3 s and switched
    assert_eq!(engine.active_slot(), SlotId::B);
    assert!((engine.mixer_volume(SlotId::B) - 1.0).abs() < 0.01);
    assert_eq!(engine.mixer_volume(SlotId::A), 0.0);
    assert!(orchestrator.paused_snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn rollback_restores_outgoing_track() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(1)).await;

    let handle = drive_crossfade(&orchestrator, 20.0, 5.0);
    sleep(Duration::from_millis(2_500)).await;

    assert!(orchestrator.rollback_current(0.3).await);
    let outcome = handle.await.unwrap();
    assert_eq!(outcome, CrossfadeOutcome::Cancelled);

    // Active slot unchanged, back at target volume; incoming silenced
    sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.active_slot(), SlotId::A);
    assert!((engine.mixer_volume(SlotId::A) - 1.0).abs() < 0.01);
    assert_eq!(engine.mixer_volume(SlotId::B), 0.0);
    assert!(!engine.is_slot_playing(SlotId::B));
    assert!(engine.is_slot_playing(SlotId::A));
}

#[tokio::test(start_paused = true)]
async fn fast_forward_completes_to_incoming_track() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(1)).await;

    let handle = drive_crossfade(&orchestrator, 20.0, 5.0);
    sleep(Duration::from_millis(2_500)).await;

    assert!(orchestrator.fast_forward(0.3).await);
    let outcome = handle.await.unwrap();
    assert_eq!(outcome, CrossfadeOutcome::Completed);

    assert_eq!(engine.active_slot(), SlotId::B);
    assert!((engine.mixer_volume(SlotId::B) - 1.0).abs() < 0.01);
    assert_eq!(engine.mixer_volume(SlotId::A), 0.0);
}

#[tokio::test(start_paused = true)]
async fn second_crossfade_rejected_while_one_runs() {
    let (_engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(1)).await;

    let handle = drive_crossfade(&orchestrator, 20.0, 5.0);
    sleep(Duration::from_secs(1)).await;

    let result = orchestrator
        .start_crossfade(
            &sine_track(15.0),
            3.0,
            FadeCurve::Linear,
            CrossfadeKind::ManualChange,
            LOAD_TIMEOUT,
        )
        .await;
    assert!(result.is_err(), "guard must reject concurrent crossfades");

    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fade_seek_fade_lands_on_target() {
    let (engine, orchestrator, _graph) = playing_engine(30.0).await;
    sleep(Duration::from_secs(2)).await;

    orchestrator
        .perform_fade_seek_fade(10.0, 0.3, 0.3, FadeCurve::Linear)
        .await
        .unwrap();

    let position = engine.position();
    assert!(
        position >= 10.0 && position < 11.0,
        "position after fade-seek-fade {position}"
    );
    assert!((engine.mixer_volume(SlotId::A) - 1.0).abs() < 0.01);
}
