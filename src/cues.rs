//! Audio coaching cues.
//!
//! `Cue` carries what to say, `CueSink` is the audio boundary. Speaking is
//! best-effort: a sink error is logged by the caller and never escalated.

use crate::config::VoiceStyle;
use crate::error::CueError;
use crate::session::SessionPhase;
#[cfg(test)]
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    /// Sustained heart rate above the target band
    EaseOff,
    /// Sustained heart rate below the target band
    SpeedUp,
    /// Cardiac drift detected late in the session
    Drift,
    /// Ten seconds left in a timed phase
    PhaseEndingSoon(SessionPhase),
    MainWorkoutStarting,
    WarmUpSkipped,
    CoolDownStarting,
    /// Completed kilometre with the pace over that kilometre, if known
    Split { km: u32, pace_min_per_km: Option<f64> },
}

impl Cue {
    pub fn text(&self, style: VoiceStyle) -> String {
        match (self, style) {
            (Cue::EaseOff, VoiceStyle::Short) => "Ease off".to_string(),
            (Cue::EaseOff, VoiceStyle::Detailed) => "Ease off slightly.".to_string(),
            (Cue::SpeedUp, VoiceStyle::Short) => "Faster".to_string(),
            (Cue::SpeedUp, VoiceStyle::Detailed) => "Gently increase pace.".to_string(),
            (Cue::Drift, _) => {
                "Heart rate drifting up. Keep effort steady, or take a short walk break."
                    .to_string()
            }
            (Cue::PhaseEndingSoon(phase), _) => {
                format!("10 seconds of {} remaining", phase.spoken_name())
            }
            (Cue::MainWorkoutStarting, _) => "Starting main workout".to_string(),
            (Cue::WarmUpSkipped, _) => "Warm up skipped. Starting workout.".to_string(),
            (Cue::CoolDownStarting, _) => "Starting cool down.".to_string(),
            (Cue::Split { km, pace_min_per_km }, _) => match pace_min_per_km {
                Some(pace) if *pace > 0.0 => {
                    let total_seconds = (pace * 60.0).round() as u64;
                    format!(
                        "Split {} kilometer. Pace {} minutes {} seconds per kilometer.",
                        km,
                        total_seconds / 60,
                        total_seconds % 60
                    )
                }
                _ => format!("Split {} kilometer.", km),
            },
        }
    }
}

/// Audio output boundary: play this phrase now.
pub trait CueSink: Send {
    fn speak(&self, text: &str) -> Result<(), CueError>;
}

/// Default sink for headless runs: cues go to the log.
pub struct LogCueSink;

impl CueSink for LogCueSink {
    fn speak(&self, text: &str) -> Result<(), CueError> {
        if text.trim().is_empty() {
            return Err(CueError::Unavailable("empty phrase".to_string()));
        }
        log::info!("Playing Cue: {}", text);
        Ok(())
    }
}

/// Keeps every spoken phrase; shared so tests can inspect it from outside.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingCueSink {
    spoken: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl RecordingCueSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
impl CueSink for RecordingCueSink {
    fn speak(&self, text: &str) -> Result<(), CueError> {
        self.spoken
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_rejects_empty_phrase() {
        assert!(LogCueSink.speak("Ease off").is_ok());
        assert!(LogCueSink.speak("  ").is_err());
    }

    #[test]
    fn test_voice_style_changes_wording() {
        assert_eq!(Cue::EaseOff.text(VoiceStyle::Short), "Ease off");
        assert_eq!(Cue::EaseOff.text(VoiceStyle::Detailed), "Ease off slightly.");
        assert_eq!(Cue::SpeedUp.text(VoiceStyle::Short), "Faster");
        assert_eq!(Cue::Drift.text(VoiceStyle::Short), Cue::Drift.text(VoiceStyle::Detailed));
    }

    #[test]
    fn test_split_text_with_and_without_pace() {
        let with_pace = Cue::Split {
            km: 3,
            pace_min_per_km: Some(5.5),
        };
        assert_eq!(
            with_pace.text(VoiceStyle::Detailed),
            "Split 3 kilometer. Pace 5 minutes 30 seconds per kilometer."
        );

        let without = Cue::Split {
            km: 1,
            pace_min_per_km: None,
        };
        assert_eq!(without.text(VoiceStyle::Short), "Split 1 kilometer.");
    }

    #[test]
    fn test_phase_warning_names_phase() {
        let cue = Cue::PhaseEndingSoon(SessionPhase::CoolDown);
        assert_eq!(cue.text(VoiceStyle::Detailed), "10 seconds of cool down remaining");
    }

    #[test]
    fn test_recording_sink_collects_phrases() {
        let sink = RecordingCueSink::new();
        sink.speak("one").unwrap();
        sink.clone().speak("two").unwrap();
        assert_eq!(sink.spoken(), vec!["one".to_string(), "two".to_string()]);
    }
}
