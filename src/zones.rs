//! Heart rate zone classification.
//!
//! Two schemes read the same bpm value:
//! - `CoachingZone` is relative to the configured zone 2 band and only drives cue timing.
//! - `absolute_zone` (1..=5) feeds session statistics. Zone 2 is the configured band,
//!   zones 3..=5 split the range above it by percentage of max HR.

use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoachingZone {
    Low,
    Target,
    High,
    Unknown,
}

impl CoachingZone {
    pub fn classify(avg_bpm: u16, settings: &Settings) -> Self {
        if avg_bpm < settings.zone2_low {
            CoachingZone::Low
        } else if avg_bpm > settings.zone2_high {
            CoachingZone::High
        } else {
            CoachingZone::Target
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CoachingZone::Low => "LOW",
            CoachingZone::Target => "TARGET",
            CoachingZone::High => "HIGH",
            CoachingZone::Unknown => "UNKNOWN",
        }
    }
}

/// Absolute zone 1..=5, or 0 when there is no usable reading.
pub fn absolute_zone(bpm: u16, settings: &Settings) -> u8 {
    if settings.max_hr == 0 || bpm == 0 {
        return 0;
    }
    if bpm >= settings.zone2_low && bpm <= settings.zone2_high {
        return 2;
    }
    if bpm < settings.zone2_low {
        return 1;
    }

    let percent = u32::from(bpm) * 100 / u32::from(settings.max_hr);
    if percent < 80 {
        3
    } else if percent < 90 {
        4
    } else {
        5
    }
}
