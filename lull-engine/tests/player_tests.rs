//! Facade behavior: transport state machine, skip rate limiting, gapless
//! looping, and playlist advancement.

mod helpers;

use helpers::{make_player, sine_track};
use lull_engine::host::AudioGraph;
use lull_engine::playback::engine::SlotId;
use lull_engine::{PlayerConfig, PlayerError, PlayerState, RepeatMode};
use std::time::Duration;
use tokio::time::sleep;

fn config() -> PlayerConfig {
    PlayerConfig::default()
}

#[tokio::test(start_paused = true)]
async fn start_with_empty_playlist_fails() {
    let (player, _graph, _session) = make_player(config());
    let err = player.start_playing(0.0).await.unwrap_err();
    assert!(matches!(err, PlayerError::EmptyPlaylist));
    assert_eq!(player.state(), PlayerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_invalid_state() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    assert_eq!(player.state(), PlayerState::Playing);

    let err = player.start_playing(0.0).await.unwrap_err();
    assert!(matches!(err, PlayerError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn start_publishes_track_and_position() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    let track = player.current_track().expect("track subject set");
    assert!(track.uri.contains("sine-30s"));
    assert!((track.info.unwrap().duration_seconds - 30.0).abs() < 0.01);

    sleep(Duration::from_secs(3)).await;
    let position = player.position();
    assert!(
        (position.current_time - 3.0).abs() < 0.6,
        "position subject at {}",
        position.current_time
    );
    assert!((position.duration - 30.0).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_round_trip() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    player.pause().await.unwrap();
    assert_eq!(player.state(), PlayerState::Paused);
    let at_pause = player.diagnostics().position_seconds;

    sleep(Duration::from_secs(5)).await;
    player.resume().await.unwrap();
    assert_eq!(player.state(), PlayerState::Playing);

    sleep(Duration::from_secs(1)).await;
    let after = player.diagnostics().position_seconds;
    assert!(
        (after - (at_pause + 1.0)).abs() < 0.5,
        "paused at {at_pause}, resumed to {after}"
    );
}

#[tokio::test(start_paused = true)]
async fn transport_ops_idempotent_in_terminal_states() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    player.stop(0.0).await.unwrap();
    assert_eq!(player.state(), PlayerState::Finished);

    player.pause().await.unwrap();
    player.resume().await.unwrap();
    assert_eq!(player.state(), PlayerState::Finished);
}

#[tokio::test(start_paused = true)]
async fn stop_lands_in_finished_with_everything_silent() {
    let (player, graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    player.stop(0.5).await.unwrap();

    assert_eq!(player.state(), PlayerState::Finished);
    assert!(player.current_track().is_none());
    let diagnostics = player.diagnostics();
    assert_eq!(diagnostics.active_mixer_volume, 0.0);
    assert_eq!(diagnostics.inactive_mixer_volume, 0.0);
    assert!(!graph.is_running());
}

#[tokio::test(start_paused = true)]
async fn finish_requires_playing_or_paused() {
    let (player, _graph, _session) = make_player(config());
    let err = player.finish(1.0).await.unwrap_err();
    assert!(matches!(err, PlayerError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn volume_is_clamped_and_mirrored_to_main_mixer() {
    let (player, graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    player.set_volume(2.0);
    assert_eq!(graph.main_volume(), 1.0);
    assert_eq!(player.diagnostics().target_volume, 1.0);

    player.set_volume(0.25);
    assert_eq!(graph.main_volume(), 0.25);
    assert_eq!(player.diagnostics().active_mixer_volume, 0.25);
}

/// Two skips 0.3 s apart: the second is rate-limited; a third 0.6 s later
/// succeeds even though the first crossfade is still in flight.
#[tokio::test(start_paused = true)]
async fn skip_rate_limit_window() {
    let (player, _graph, _session) = make_player(config());
    player
        .load_playlist(vec![sine_track(60.0), sine_track(50.0), sine_track(40.0)])
        .unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    let first = player.skip_to_next().await;
    assert!(first.is_ok(), "first skip: {first:?}");

    sleep(Duration::from_millis(300)).await;
    let second = player.skip_to_next().await;
    assert!(
        matches!(second, Err(PlayerError::RateLimited)),
        "second skip 0.3s later: {second:?}"
    );

    sleep(Duration::from_millis(600)).await;
    let third = player.skip_to_next().await;
    assert!(third.is_ok(), "third skip 0.6s later: {third:?}");
}

#[tokio::test(start_paused = true)]
async fn skip_returns_peek_metadata_synchronously() {
    let (player, _graph, _session) = make_player(config());
    player
        .load_playlist(vec![sine_track(60.0), sine_track(50.0)])
        .unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    let next = player.skip_to_next().await.unwrap();
    assert!(next.uri.contains("sine-50s"));

    // Give the asynchronous transition time to run its course
    sleep(Duration::from_secs(8)).await;
    let current = player.current_track().unwrap();
    assert!(current.uri.contains("sine-50s"));
}

#[tokio::test(start_paused = true)]
async fn skip_past_end_reports_no_next_track() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(60.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    let err = player.skip_to_next().await.unwrap_err();
    assert!(matches!(err, PlayerError::NoNextTrack));
}

/// Gapless loop: a 10 s track with a 3 s crossfade and SingleTrack repeat
/// starts its loop fade at ≈7 s and lands the switch at the boundary.
#[tokio::test(start_paused = true)]
async fn gapless_single_track_loop() {
    let mut config = config();
    config.repeat_mode = RepeatMode::SingleTrack;
    config.crossfade_duration = 3.0;

    let (player, _graph, _session) = make_player(config);
    player.load_playlist(vec![sine_track(10.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    // Before the trigger point nothing is fading
    sleep(Duration::from_millis(6_400)).await;
    assert!(!player.diagnostics().crossfade_in_progress);
    assert_eq!(player.diagnostics().active_slot, SlotId::A);

    // Past 7 s the loop crossfade must be in flight
    sleep(Duration::from_millis(1_200)).await;
    assert!(
        player.diagnostics().crossfade_in_progress,
        "crossfade did not start by 7.6s"
    );

    // After the boundary the slots have flipped and position restarted
    sleep(Duration::from_millis(3_400)).await;
    let diagnostics = player.diagnostics();
    assert_eq!(diagnostics.active_slot, SlotId::B);
    assert!(
        diagnostics.position_seconds < 5.0,
        "position should restart near zero, got {}",
        diagnostics.position_seconds
    );
    assert_eq!(player.state(), PlayerState::Playing);
}

/// Repeat Off: the playlist advances through its tracks and finishes.
#[tokio::test(start_paused = true)]
async fn playlist_advances_and_finishes_in_off_mode() {
    let (player, _graph, _session) = make_player(config());
    player
        .load_playlist(vec![sine_track(4.0), sine_track(4.0)])
        .unwrap();
    player.start_playing(0.0).await.unwrap();

    // Mid-way through the second track
    sleep(Duration::from_millis(5_500)).await;
    assert_eq!(player.state(), PlayerState::Playing);

    // Well past both tracks
    sleep(Duration::from_secs(6)).await;
    assert_eq!(player.state(), PlayerState::Finished);
}

#[tokio::test(start_paused = true)]
async fn load_playlist_rejected_while_playing() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    let err = player.load_playlist(vec![sine_track(10.0)]).unwrap_err();
    assert!(matches!(err, PlayerError::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn replace_playlist_crossfades_into_new_content() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(60.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    player
        .replace_playlist(vec![sine_track(45.0), sine_track(30.0)])
        .await
        .unwrap();

    sleep(Duration::from_secs(8)).await;
    let current = player.current_track().unwrap();
    assert!(current.uri.contains("sine-45s"), "got {}", current.uri);
    assert_eq!(player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn update_configuration_stops_playback_first() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(30.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();

    let mut new_config = PlayerConfig::default();
    new_config.crossfade_duration = 8.0;
    player.update_configuration(new_config).await.unwrap();

    assert_eq!(player.state(), PlayerState::Finished);
    assert_eq!(player.configuration().crossfade_duration, 8.0);
}

#[tokio::test(start_paused = true)]
async fn seek_lands_within_tolerance() {
    let (player, _graph, _session) = make_player(config());
    player.load_playlist(vec![sine_track(60.0)]).unwrap();
    player.start_playing(0.0).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    player.seek(20.0, 0.1).await.unwrap();
    sleep(Duration::from_millis(500)).await;

    let position = player.position();
    assert!(
        (position.current_time - 20.0).abs() < 1.0,
        "seek landed at {}",
        position.current_time
    );
}
