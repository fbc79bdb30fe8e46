//! # Coaching Rules Engine
//!
//! Turns the live heart rate stream into spoken cues.
//!
//! ## Pipeline per sample
//! 1. Push into the 5 s `SignalWindow`, prune, average (rounded to whole bpm)
//! 2. Classify the average into a `CoachingZone`; a zone change restarts the dwell clock
//! 3. Once the shared cue cooldown has elapsed:
//!    - High for `persistence_high_seconds`: drift cue (own cooldown) when drift is
//!      detected, otherwise the generic ease-off cue unless the warm-up buffer mutes it
//!    - Low for `persistence_low_seconds`: speed-up cue, never muted
//!
//! Cues are suppressed entirely when coaching is disabled or the current phase
//! is not in `CoachingTuning::eligible_phases`.

use crate::config::Settings;
use crate::cues::Cue;
use crate::session::SessionPhase;
use crate::timeseries::SignalWindow;
use crate::zones::CoachingZone;

pub const BPM_WINDOW_MS: i64 = 5_000;

/// What the engine needs to know about the session for one decision.
#[derive(Debug, Clone, Copy)]
pub struct CoachingContext<'a> {
    pub settings: &'a Settings,
    pub phase: SessionPhase,
    pub session_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoachingState {
    pub current_zone: CoachingZone,
    pub zone_enter_ms: i64,
    pub last_cue_ms: Option<i64>,
    /// Live bpm sampled once at the baseline capture second
    pub baseline_hr: Option<u16>,
    pub last_drift_cue_ms: Option<i64>,
}

impl Default for CoachingState {
    fn default() -> Self {
        Self {
            current_zone: CoachingZone::Unknown,
            zone_enter_ms: 0,
            last_cue_ms: None,
            baseline_hr: None,
            last_drift_cue_ms: None,
        }
    }
}

/// Snapshot-friendly view of the engine for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct CoachingDebug {
    pub avg_bpm: u16,
    pub zone: String,
    pub time_in_zone_seconds: u64,
    pub cooldown_remaining_seconds: u64,
}

pub struct CoachingEngine {
    window: SignalWindow,
    state: CoachingState,
    avg_bpm: Option<u16>,
}

impl CoachingEngine {
    pub fn new() -> Self {
        Self {
            window: SignalWindow::new(BPM_WINDOW_MS),
            state: CoachingState::default(),
            avg_bpm: None,
        }
    }

    pub fn state(&self) -> &CoachingState {
        &self.state
    }

    /// Smoothed bpm over the last window, if any samples are retained.
    pub fn avg_bpm(&self) -> Option<u16> {
        self.avg_bpm
    }

    /// Fresh state for a new session.
    pub fn reset(&mut self) {
        self.window.clear();
        self.state = CoachingState::default();
        self.avg_bpm = None;
    }

    /// Forget buffered samples and the current zone after a disconnect.
    /// Cue history and the drift baseline survive until the next session.
    pub fn clear_signal(&mut self) {
        self.window.clear();
        self.avg_bpm = None;
        self.state.current_zone = CoachingZone::Unknown;
    }

    /// Record a sample without making any cue decision.
    pub fn observe(&mut self, bpm: u16, now: i64) -> Option<u16> {
        self.avg_bpm = self
            .window
            .push_and_average(now, f64::from(bpm))
            .map(|avg| avg.round() as u16);
        self.avg_bpm
    }

    pub fn capture_baseline(&mut self, bpm: u16) -> bool {
        if self.state.baseline_hr.is_some() || bpm == 0 {
            return false;
        }
        self.state.baseline_hr = Some(bpm);
        log::debug!("Baseline HR captured: {} BPM", bpm);
        true
    }

    /// Fold a sample into the window and decide whether a cue is due.
    pub fn ingest(&mut self, bpm: u16, now: i64, ctx: &CoachingContext<'_>) -> Option<Cue> {
        let avg = self.observe(bpm, now)?;
        let settings = ctx.settings;

        let zone = CoachingZone::classify(avg, settings);
        if zone != self.state.current_zone {
            self.state.current_zone = zone;
            self.state.zone_enter_ms = now;
        }

        if !settings.coaching_enabled || !settings.coaching.eligible_phases.contains(&ctx.phase) {
            return None;
        }

        let time_in_zone = now - self.state.zone_enter_ms;
        if self.cooldown_remaining_ms(now, settings) > 0 {
            return None;
        }

        let tuning = &settings.coaching;
        match zone {
            CoachingZone::High if time_in_zone >= secs_to_ms(settings.persistence_high_seconds) => {
                let drifting = ctx.session_seconds > tuning.drift_after_seconds
                    && self
                        .state
                        .baseline_hr
                        .map_or(false, |base| avg < base.saturating_add(tuning.drift_margin_bpm));

                if drifting {
                    let drift_ready = self
                        .state
                        .last_drift_cue_ms
                        .map_or(true, |last| now - last >= secs_to_ms(tuning.drift_cooldown_seconds));
                    if drift_ready {
                        log::info!(
                            "Drift cue (time: {}s, avg: {}, base: {:?})",
                            ctx.session_seconds,
                            avg,
                            self.state.baseline_hr
                        );
                        self.state.last_drift_cue_ms = Some(now);
                        self.state.last_cue_ms = Some(now);
                        return Some(Cue::Drift);
                    }
                    log::debug!("Drift detected but suppressed by drift cooldown");
                    return None;
                }

                let buffer_active = ctx.session_seconds < tuning.warm_up_buffer_seconds;
                let critical = settings.zone2_high.saturating_add(tuning.critical_offset_bpm);
                if !buffer_active || avg > critical {
                    self.state.last_cue_ms = Some(now);
                    Some(Cue::EaseOff)
                } else {
                    log::debug!(
                        "Warm-up buffer active: muting high HR cue (time: {}s, avg: {}, limit: {})",
                        ctx.session_seconds,
                        avg,
                        critical
                    );
                    None
                }
            }
            CoachingZone::Low if time_in_zone >= secs_to_ms(settings.persistence_low_seconds) => {
                self.state.last_cue_ms = Some(now);
                Some(Cue::SpeedUp)
            }
            _ => None,
        }
    }

    fn cooldown_remaining_ms(&self, now: i64, settings: &Settings) -> i64 {
        match self.state.last_cue_ms {
            Some(last) => last + secs_to_ms(settings.cooldown_seconds) - now,
            None => 0,
        }
    }

    pub fn debug_info(&self, now: i64, settings: &Settings) -> CoachingDebug {
        let avg_bpm = self.avg_bpm.unwrap_or(0);
        if self.avg_bpm.is_none() {
            return CoachingDebug {
                avg_bpm,
                zone: "No Data".to_string(),
                time_in_zone_seconds: 0,
                cooldown_remaining_seconds: 0,
            };
        }
        if !settings.coaching_enabled {
            return CoachingDebug {
                avg_bpm,
                zone: "Disabled".to_string(),
                time_in_zone_seconds: 0,
                cooldown_remaining_seconds: 0,
            };
        }

        CoachingDebug {
            avg_bpm,
            zone: self.state.current_zone.label().to_string(),
            time_in_zone_seconds: ((now - self.state.zone_enter_ms).max(0) / 1000) as u64,
            cooldown_remaining_seconds: (self.cooldown_remaining_ms(now, settings).max(0) / 1000)
                as u64,
        }
    }
}

fn secs_to_ms(seconds: u64) -> i64 {
    seconds as i64 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_000_000;

    fn settings() -> Settings {
        Settings {
            zone2_low: 120,
            zone2_high: 140,
            persistence_high_seconds: 30,
            persistence_low_seconds: 45,
            cooldown_seconds: 75,
            ..Settings::default()
        }
    }

    fn ctx(settings: &Settings, session_seconds: u64) -> CoachingContext<'_> {
        CoachingContext {
            settings,
            phase: SessionPhase::Main,
            session_seconds,
        }
    }

    /// Feeds one sample per second from `from_s` to `to_s` inclusive and returns (second, cue) pairs.
    fn feed(
        engine: &mut CoachingEngine,
        settings: &Settings,
        bpm: u16,
        from_s: i64,
        to_s: i64,
        session_start_s: u64,
    ) -> Vec<(i64, Cue)> {
        let mut cues = Vec::new();
        for s in from_s..=to_s {
            let c = ctx(settings, session_start_s + s as u64);
            if let Some(cue) = engine.ingest(bpm, T0 + s * 1000, &c) {
                cues.push((s, cue));
            }
        }
        cues
    }

    #[test]
    fn test_high_cue_respects_persistence_and_cooldown() {
        let s = settings();
        let mut engine = CoachingEngine::new();

        let cues = feed(&mut engine, &s, 150, 0, 104, 600);
        assert_eq!(cues, vec![(30, Cue::EaseOff)]);

        let later = feed(&mut engine, &s, 150, 105, 105, 600);
        assert_eq!(later, vec![(105, Cue::EaseOff)]);
    }

    #[test]
    fn test_zone_change_restarts_dwell() {
        let s = settings();
        let mut engine = CoachingEngine::new();

        assert!(feed(&mut engine, &s, 150, 0, 20, 600).is_empty());
        // Back to target long enough for the 5 s average to settle
        assert!(feed(&mut engine, &s, 130, 21, 40, 600).is_empty());
        let cues = feed(&mut engine, &s, 150, 41, 90, 600);
        assert_eq!(cues.len(), 1);
        // Average crosses 140 a few seconds after the raw jump, dwell counts from there
        let (second, cue) = &cues[0];
        assert_eq!(*cue, Cue::EaseOff);
        assert!(*second >= 41 + 30 && *second <= 41 + 35, "fired at {}", second);
    }

    #[test]
    fn test_low_cue_fires_during_warm_up_buffer() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        let cues = feed(&mut engine, &s, 100, 0, 45, 0);
        assert_eq!(cues, vec![(45, Cue::SpeedUp)]);
    }

    #[test]
    fn test_warm_up_buffer_mutes_moderate_high() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        // Session second 170..=200, persistence reached at second 200
        let cues = feed(&mut engine, &s, s.zone2_high + 5, 0, 30, 170);
        assert!(cues.is_empty());
    }

    #[test]
    fn test_critical_high_overrides_warm_up_buffer() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        let cues = feed(&mut engine, &s, s.zone2_high + 20, 0, 30, 170);
        assert_eq!(cues, vec![(30, Cue::EaseOff)]);
    }

    #[test]
    fn test_drift_cue_replaces_generic_and_has_own_cooldown() {
        let s = Settings {
            cooldown_seconds: 10,
            ..settings()
        };
        let mut engine = CoachingEngine::new();
        assert!(engine.capture_baseline(140));
        assert!(!engine.capture_baseline(150));

        // 145 < 140 + 12 after 1200 s: drift
        let cues = feed(&mut engine, &s, 145, 0, 120, 1300);
        assert_eq!(cues, vec![(30, Cue::Drift)]);

        // Drift cooldown (300 s) expires at second 330
        let cues = feed(&mut engine, &s, 145, 121, 330, 1300);
        assert_eq!(cues, vec![(330, Cue::Drift)]);
    }

    #[test]
    fn test_no_drift_without_baseline() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        let cues = feed(&mut engine, &s, 145, 0, 30, 1300);
        assert_eq!(cues, vec![(30, Cue::EaseOff)]);
    }

    #[test]
    fn test_disabled_coaching_and_ineligible_phase_emit_nothing() {
        let disabled = Settings {
            coaching_enabled: false,
            ..settings()
        };
        let mut engine = CoachingEngine::new();
        assert!(feed(&mut engine, &disabled, 100, 0, 100, 600).is_empty());
        assert_eq!(engine.avg_bpm(), Some(100));

        let s = settings();
        let mut engine = CoachingEngine::new();
        for sec in 0..=100 {
            let c = CoachingContext {
                settings: &s,
                phase: SessionPhase::CoolDown,
                session_seconds: 600 + sec as u64,
            };
            assert!(engine.ingest(100, T0 + sec * 1000, &c).is_none());
        }
    }

    #[test]
    fn test_debug_info_reports_cooldown() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        assert_eq!(engine.debug_info(T0, &s).zone, "No Data");

        feed(&mut engine, &s, 150, 0, 30, 600);
        let info = engine.debug_info(T0 + 40_000, &s);
        assert_eq!(info.zone, "HIGH");
        assert_eq!(info.avg_bpm, 150);
        assert_eq!(info.time_in_zone_seconds, 40);
        assert_eq!(info.cooldown_remaining_seconds, 65);
    }

    #[test]
    fn test_reset_clears_state() {
        let s = settings();
        let mut engine = CoachingEngine::new();
        feed(&mut engine, &s, 150, 0, 30, 600);
        engine.capture_baseline(150);
        engine.reset();
        assert_eq!(engine.state(), &CoachingState::default());
        assert!(engine.avg_bpm().is_none());
    }
}
