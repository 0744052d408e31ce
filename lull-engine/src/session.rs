//! Audio session coordination.
//!
//! Owns the process-wide session on behalf of the engine. In Managed mode
//! it configures and activates exactly once and never deactivates — the
//! session stays live for the lifetime of the process. In External mode it
//! never mutates the session, only validates it and reports what it sees.
//!
//! Host notifications arrive on arbitrary threads; the coordinator rehomes
//! them onto its own task and turns them into [`ControlSignal`]s for the
//! facade: pause on interruption/unplug, recover on media-services reset.

use crate::config::SessionMode;
use crate::error::{PlayerError, Result};
use crate::host::{
    AudioSession, RouteChangeReason, SessionCategory, SessionNotification, SessionOptions,
};
use lull_common::{EngineEvent, EventBus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Debounce window for route changes that add rather than remove a device.
const ROUTE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Preferred I/O buffer duration in Managed mode.
const PREFERRED_BUFFER_SECONDS: f64 = 0.02;

/// Preferred hardware sample rate in Managed mode.
const PREFERRED_SAMPLE_RATE: f64 = 44_100.0;

/// Commands the coordinator issues to the facade.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// Stop making sound now; `should_resume` marks interruptions the
    /// platform expects us to resume from
    Pause { should_resume: bool },
    /// The interruption ended and resumption is sanctioned
    Resume,
    /// Media services were reset; rebuild the graph and session
    Recover,
    /// External session drifted to an incompatible category
    CategoryIncompatible { current: String },
}

/// Result of validating an externally-managed session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValidation {
    Valid,
    CategoryChanged {
        current: SessionCategory,
        expected: SessionCategory,
    },
}

/// Callback surface for category drift, mirroring a delegate protocol.
pub type CategoryChangeHandler = Box<dyn Fn(SessionValidation) + Send + Sync>;

/// Coordinates the host audio session for the engine.
pub struct SessionCoordinator {
    session: Arc<dyn AudioSession>,
    mode: SessionMode,
    events: EventBus,
    signal_tx: mpsc::UnboundedSender<ControlSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlSignal>>>,
    configured_options: Mutex<Option<SessionOptions>>,
    is_activating: AtomicBool,
    /// Coalesces overlapping debounced revalidations
    debounce_epoch: AtomicU64,
    category_handler: Mutex<Option<CategoryChangeHandler>>,
}

impl SessionCoordinator {
    pub fn new(session: Arc<dyn AudioSession>, mode: SessionMode, events: EventBus) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session,
            mode,
            events,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            configured_options: Mutex::new(None),
            is_activating: AtomicBool::new(false),
            debounce_epoch: AtomicU64::new(0),
            category_handler: Mutex::new(None),
        })
    }

    /// Take the control-signal receiver; the facade consumes it.
    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<ControlSignal>> {
        self.signal_rx.lock().unwrap().take()
    }

    /// Install the category-drift delegate.
    pub fn set_category_change_handler(&self, handler: CategoryChangeHandler) {
        *self.category_handler.lock().unwrap() = Some(handler);
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Configure and (in Managed mode) activate the session.
    ///
    /// The first configuration wins: reconfiguring with different options is
    /// a warning, not an error, unless `force` is set for recovery.
    pub fn configure(&self, options: SessionOptions, force: bool) -> Result<()> {
        match self.mode {
            SessionMode::Managed => self.configure_managed(options, force),
            SessionMode::External => self.validate_external().map(|_| ()),
        }
    }

    fn configure_managed(&self, options: SessionOptions, force: bool) -> Result<()> {
        {
            let mut configured = self.configured_options.lock().unwrap();
            if let Some(existing) = *configured {
                if !force {
                    if existing != options {
                        warn!(?existing, ?options, "session already configured; keeping first configuration");
                        self.events.emit_lossy(EngineEvent::SessionWarning {
                            message: "session reconfiguration ignored; first configuration wins"
                                .to_string(),
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    return self.activate_once();
                }
            }
            *configured = Some(options);
        }

        self.session
            .set_preferred_buffer_duration(PREFERRED_BUFFER_SECONDS)
            .map_err(|e| PlayerError::SessionConfigurationFailed {
                reason: format!("preferred buffer duration: {e}"),
            })?;
        self.session
            .set_preferred_sample_rate(PREFERRED_SAMPLE_RATE)
            .map_err(|e| PlayerError::SessionConfigurationFailed {
                reason: format!("preferred sample rate: {e}"),
            })?;
        self.session
            .set_category(SessionCategory::Playback, options)
            .map_err(|e| PlayerError::SessionConfigurationFailed {
                reason: format!("set category: {e}"),
            })?;

        info!(?options, "session configured (managed)");
        self.activate_once()
    }

    /// Activation is reentrancy-guarded and happens at most once; the
    /// session then stays active for the process lifetime. Deactivation is
    /// deliberately not offered.
    fn activate_once(&self) -> Result<()> {
        if self.is_activating.swap(true, Ordering::SeqCst) {
            debug!("activation already in progress");
            return Ok(());
        }
        let result = if self.session.is_active() {
            Ok(())
        } else {
            self.session
                .activate()
                .map_err(|e| PlayerError::SessionConfigurationFailed {
                    reason: format!("activate: {e}"),
                })
        };
        self.is_activating.store(false, Ordering::SeqCst);
        if result.is_ok() {
            debug!("session active");
        }
        result
    }

    /// Validate an externally-managed session without mutating it.
    pub fn validate_external(&self) -> Result<SessionValidation> {
        let category = self.session.category();
        let compatible = matches!(
            category,
            SessionCategory::Playback | SessionCategory::PlayAndRecord | SessionCategory::MultiRoute
        );
        if !compatible {
            return Err(PlayerError::SessionConfigurationFailed {
                reason: format!(
                    "external session category '{}' cannot sustain background playback",
                    category.name()
                ),
            });
        }

        let options = self.session.options();
        if !options.allow_bluetooth {
            self.warn("external session does not enable Bluetooth output");
        }
        if category == SessionCategory::PlayAndRecord && !options.default_to_speaker {
            self.warn("play-and-record session does not default to speaker");
        }
        if !self.session.is_active() {
            self.warn("external session is not active");
        }

        if category == SessionCategory::Playback {
            Ok(SessionValidation::Valid)
        } else {
            Ok(SessionValidation::CategoryChanged {
                current: category,
                expected: SessionCategory::Playback,
            })
        }
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
        self.events.emit_lossy(EngineEvent::SessionWarning {
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    fn signal(&self, signal: ControlSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// Spawn the notification listener. Values arriving from host threads
    /// are already owned; this task is the single place that interprets
    /// them.
    pub fn run(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut notifications = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => coordinator.handle_notification(notification),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "session notifications lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("session notification stream closed");
        });
    }

    fn handle_notification(self: &Arc<Self>, notification: SessionNotification) {
        debug!(?notification, "session notification");
        match notification {
            SessionNotification::InterruptionBegan => {
                self.signal(ControlSignal::Pause {
                    should_resume: false,
                });
            }
            SessionNotification::InterruptionEnded { should_resume } => {
                // Absent flag means the platform made no promise: stay
                // paused (a voice-assistant pause looks exactly like this)
                if should_resume == Some(true) {
                    self.signal(ControlSignal::Resume);
                } else {
                    debug!("interruption ended without resume sanction");
                }
            }
            SessionNotification::RouteChanged { reason } => self.handle_route_change(reason),
            SessionNotification::MediaServicesReset => {
                self.signal(ControlSignal::Recover);
            }
        }
    }

    fn handle_route_change(self: &Arc<Self>, reason: RouteChangeReason) {
        match reason {
            // Unplugging must mute immediately; the platform keeps playing
            // through the built-in speaker otherwise
            RouteChangeReason::OldDeviceUnavailable => {
                info!("output device disappeared, pausing");
                self.signal(ControlSignal::Pause {
                    should_resume: false,
                });
            }
            RouteChangeReason::NewDeviceAvailable | RouteChangeReason::Override => {
                let epoch = self.debounce_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    sleep(ROUTE_CHANGE_DEBOUNCE).await;
                    if coordinator.debounce_epoch.load(Ordering::SeqCst) != epoch {
                        return; // superseded by a newer route change
                    }
                    coordinator.revalidate_after_route_change();
                });
            }
            RouteChangeReason::CategoryChange => self.revalidate_after_route_change(),
            RouteChangeReason::Unknown => {}
        }
    }

    fn revalidate_after_route_change(&self) {
        if self.mode != SessionMode::External {
            return;
        }
        match self.validate_external() {
            Ok(SessionValidation::Valid) => {}
            Ok(SessionValidation::CategoryChanged { current, expected }) => {
                self.events.emit_lossy(EngineEvent::SessionCategoryChanged {
                    current: current.name().to_string(),
                    expected: expected.name().to_string(),
                    timestamp: chrono::Utc::now(),
                });
                if let Some(handler) = self.category_handler.lock().unwrap().as_ref() {
                    handler(SessionValidation::CategoryChanged { current, expected });
                }
            }
            Err(error) => {
                warn!(%error, "session became incompatible, pausing");
                self.signal(ControlSignal::Pause {
                    should_resume: false,
                });
                self.signal(ControlSignal::CategoryIncompatible {
                    current: self.session.category().name().to_string(),
                });
                if let Some(handler) = self.category_handler.lock().unwrap().as_ref() {
                    handler(SessionValidation::CategoryChanged {
                        current: self.session.category(),
                        expected: SessionCategory::Playback,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimSession;

    fn coordinator(mode: SessionMode) -> (Arc<SessionCoordinator>, Arc<SimSession>, EventBus) {
        let session = Arc::new(SimSession::new());
        let events = EventBus::new(32);
        let coordinator = SessionCoordinator::new(
            Arc::clone(&session) as Arc<dyn AudioSession>,
            mode,
            events.clone(),
        );
        (coordinator, session, events)
    }

    #[tokio::test]
    async fn test_managed_configure_activates_once() {
        let (coordinator, session, _) = coordinator(SessionMode::Managed);

        coordinator
            .configure(SessionOptions::default(), false)
            .unwrap();

        assert!(session.is_active());
        assert_eq!(session.category(), SessionCategory::Playback);
        assert_eq!(session.preferred_sample_rate(), Some(44_100.0));
        assert_eq!(session.preferred_buffer_duration(), Some(0.02));
    }

    #[tokio::test]
    async fn test_reconfigure_with_different_options_warns_not_errors() {
        let (coordinator, _, events) = coordinator(SessionMode::Managed);
        let mut rx = events.subscribe();

        coordinator
            .configure(SessionOptions::default(), false)
            .unwrap();
        let different = SessionOptions {
            mix_with_others: true,
            ..SessionOptions::default()
        };
        coordinator.configure(different, false).unwrap();

        let mut saw_warning = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "SessionWarning" {
                saw_warning = true;
            }
        }
        assert!(saw_warning, "expected a reconfiguration warning");
    }

    #[tokio::test]
    async fn test_external_mode_never_mutates_session() {
        let (coordinator, session, _) = coordinator(SessionMode::External);
        session
            .set_category(SessionCategory::PlayAndRecord, SessionOptions::default())
            .unwrap();

        let _ = coordinator.configure(SessionOptions::default(), false);

        assert_eq!(session.category(), SessionCategory::PlayAndRecord);
        assert!(!session.is_active(), "external mode must not activate");
        assert_eq!(session.preferred_sample_rate(), None);
    }

    #[tokio::test]
    async fn test_external_incompatible_category_rejected() {
        let (coordinator, session, _) = coordinator(SessionMode::External);
        session
            .set_category(SessionCategory::Record, SessionOptions::default())
            .unwrap();

        let err = coordinator.validate_external().unwrap_err();
        match err {
            PlayerError::SessionConfigurationFailed { reason } => {
                assert!(reason.contains("record"), "reason was: {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interruption_maps_to_pause_and_gated_resume() {
        let (coordinator, session, _) = coordinator(SessionMode::Managed);
        let mut signals = coordinator.take_signals().unwrap();
        coordinator.run();

        session.post(SessionNotification::InterruptionBegan);
        assert_eq!(
            signals.recv().await.unwrap(),
            ControlSignal::Pause {
                should_resume: false
            }
        );

        // No resume sanction: nothing is emitted
        session.post(SessionNotification::InterruptionEnded {
            should_resume: None,
        });
        session.post(SessionNotification::InterruptionEnded {
            should_resume: Some(true),
        });
        assert_eq!(signals.recv().await.unwrap(), ControlSignal::Resume);
    }

    #[tokio::test]
    async fn test_unplug_pauses_immediately() {
        let (coordinator, session, _) = coordinator(SessionMode::Managed);
        let mut signals = coordinator.take_signals().unwrap();
        coordinator.run();

        session.post(SessionNotification::RouteChanged {
            reason: RouteChangeReason::OldDeviceUnavailable,
        });
        assert_eq!(
            signals.recv().await.unwrap(),
            ControlSignal::Pause {
                should_resume: false
            }
        );
    }

    #[tokio::test]
    async fn test_media_services_reset_signals_recover() {
        let (coordinator, session, _) = coordinator(SessionMode::Managed);
        let mut signals = coordinator.take_signals().unwrap();
        coordinator.run();

        session.post(SessionNotification::MediaServicesReset);
        assert_eq!(signals.recv().await.unwrap(), ControlSignal::Recover);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_hijack_pauses_external_session() {
        let (coordinator, session, _) = coordinator(SessionMode::External);
        let mut signals = coordinator.take_signals().unwrap();
        coordinator.run();

        session.hijack_category(SessionCategory::Record);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            signals.recv().await.unwrap(),
            ControlSignal::Pause {
                should_resume: false
            }
        );
        match signals.recv().await.unwrap() {
            ControlSignal::CategoryIncompatible { current } => {
                assert_eq!(current, "record");
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }
}
