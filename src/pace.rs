//! Outdoor pace and distance from location fixes.
//!
//! Fixes are gated by reported accuracy, accumulated into total distance with
//! the haversine formula and fed into a 15 s speed window. Whole kilometres
//! produce split cues when enabled.

use crate::cues::Cue;
use crate::timeseries::SignalWindow;

pub const SPEED_WINDOW_MS: i64 = 15_000;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

const ACCURACY_LIMIT_M: f64 = 100.0;
const RELAXED_ACCURACY_LIMIT_M: f64 = 250.0;
/// After this long without an accepted fix the relaxed accuracy limit applies
const RELAX_AFTER_MS: i64 = 30_000;

const MIN_DEVICE_SPEED_MPS: f64 = 0.1;
const MIN_DERIVED_DT_S: f64 = 0.5;
/// Window entries at or below this count as standing still
const STANDING_SPEED_MPS: f64 = 0.2;
const MIN_AVG_SPEED_MPS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    /// Device-reported ground speed
    pub speed_mps: Option<f64>,
}

/// Great-circle distance in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub struct PaceEngine {
    speeds: SignalWindow,
    total_distance_m: f64,
    last_fix: Option<LocationFix>,
    last_accepted_ms: Option<i64>,
    last_split_km: u32,
    split_start_ms: Option<i64>,
}

impl PaceEngine {
    pub fn new() -> Self {
        Self {
            speeds: SignalWindow::new(SPEED_WINDOW_MS),
            total_distance_m: 0.0,
            last_fix: None,
            last_accepted_ms: None,
            last_split_km: 0,
            split_start_ms: None,
        }
    }

    pub fn total_distance_m(&self) -> f64 {
        self.total_distance_m
    }

    /// Minutes per kilometre over the speed window, 0.0 when standing still.
    pub fn pace_min_per_km(&self) -> f64 {
        match self.speeds.average() {
            Some(avg) if avg > MIN_AVG_SPEED_MPS => 1000.0 / (avg * 60.0),
            _ => 0.0,
        }
    }

    /// Drop the previous fix so the next one does not bridge a gap (pause, restart).
    pub fn reset_anchor(&mut self) {
        self.last_fix = None;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Mark the start of the first split, normally the session start time.
    pub fn start_splits_at(&mut self, now: i64) {
        self.split_start_ms = Some(now);
    }

    fn accuracy_limit(&self, now: i64) -> f64 {
        match self.last_accepted_ms {
            Some(last) if now - last <= RELAX_AFTER_MS => ACCURACY_LIMIT_M,
            _ => RELAXED_ACCURACY_LIMIT_M,
        }
    }

    /// Fold a fix into distance, speed and splits. Returns a split cue when a
    /// new whole kilometre is crossed and `splits_enabled` is set.
    ///
    /// The split counter and split start advance on every crossed kilometre
    /// whether or not announcements are enabled, so turning them on mid-run
    /// announces the next kilometre, never one already passed, and its pace
    /// covers only that kilometre.
    pub fn ingest(&mut self, fix: LocationFix, splits_enabled: bool) -> Option<Cue> {
        let previous = match self.last_fix.replace(fix) {
            Some(previous) => previous,
            None => {
                if fix.accuracy_m <= self.accuracy_limit(fix.timestamp_ms) {
                    self.last_accepted_ms = Some(fix.timestamp_ms);
                }
                return None;
            }
        };

        let distance = haversine_m(
            previous.latitude,
            previous.longitude,
            fix.latitude,
            fix.longitude,
        );
        let dt_s = (fix.timestamp_ms - previous.timestamp_ms) as f64 / 1000.0;

        let speed = match fix.speed_mps {
            Some(device) if device > MIN_DEVICE_SPEED_MPS => device,
            _ if dt_s > MIN_DERIVED_DT_S => distance / dt_s,
            _ => 0.0,
        };
        let windowed = if speed <= STANDING_SPEED_MPS { 0.0 } else { speed };
        self.speeds.push_and_average(fix.timestamp_ms, windowed);

        if fix.accuracy_m > self.accuracy_limit(fix.timestamp_ms) {
            log::debug!(
                "Rejected location fix with accuracy {:.0} m",
                fix.accuracy_m
            );
            return None;
        }
        self.last_accepted_ms = Some(fix.timestamp_ms);
        self.total_distance_m += distance;

        let km = (self.total_distance_m / 1000.0).floor() as u32;
        if km <= self.last_split_km {
            return None;
        }

        let split_pace = self.split_start_ms.and_then(|start| {
            let minutes = (fix.timestamp_ms - start) as f64 / 60_000.0;
            let kms = f64::from(km - self.last_split_km);
            (minutes > 0.0).then(|| minutes / kms)
        });
        self.last_split_km = km;
        self.split_start_ms = Some(fix.timestamp_ms);

        if splits_enabled {
            log::info!("Split {} km reached", km);
            Some(Cue::Split {
                km,
                pace_min_per_km: split_pace,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Metres of latitude per degree on the haversine sphere
    const M_PER_DEG: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

    fn fix(t_ms: i64, north_m: f64, accuracy_m: f64) -> LocationFix {
        LocationFix {
            timestamp_ms: t_ms,
            latitude: north_m / M_PER_DEG,
            longitude: 0.0,
            accuracy_m,
            speed_mps: None,
        }
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - M_PER_DEG).abs() < 1e-6);
    }

    #[test]
    fn test_derived_speed_gives_pace() {
        let mut engine = PaceEngine::new();
        assert!(engine.ingest(fix(0, 0.0, 10.0), false).is_none());
        engine.ingest(fix(50_000, 100.0, 10.0), false);

        // 2 m/s => 8.33 min/km
        assert!((engine.pace_min_per_km() - 8.333).abs() < 0.01);
        assert!((engine.total_distance_m() - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_device_speed_preferred() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 10.0), false);
        let mut second = fix(1_000, 2.0, 10.0);
        second.speed_mps = Some(4.0);
        engine.ingest(second, false);
        assert!((engine.pace_min_per_km() - 1000.0 / 240.0).abs() < 1e-9);
    }

    #[test]
    fn test_standing_still_has_zero_pace() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 5.0), false);
        engine.ingest(fix(10_000, 1.0, 5.0), false);
        assert_eq!(engine.pace_min_per_km(), 0.0);
    }

    #[test]
    fn test_inaccurate_fix_adds_no_distance() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 10.0), false);
        engine.ingest(fix(5_000, 10.0, 150.0), false);
        assert_eq!(engine.total_distance_m(), 0.0);

        engine.ingest(fix(10_000, 20.0, 10.0), false);
        assert!((engine.total_distance_m() - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_accuracy_gate_relaxes_after_gap() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 10.0), false);
        // 31 s since the last accepted fix: 200 m accuracy is accepted
        engine.ingest(fix(31_000, 50.0, 200.0), false);
        assert!((engine.total_distance_m() - 50.0).abs() < 0.01);
        // Back within 30 s: 200 m is rejected again
        engine.ingest(fix(40_000, 100.0, 200.0), false);
        assert!((engine.total_distance_m() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_split_cue_on_whole_kilometre() {
        let mut engine = PaceEngine::new();
        engine.start_splits_at(0);
        engine.ingest(fix(0, 0.0, 5.0), true);

        let mut cues = Vec::new();
        // 260 m every 78 s; the first kilometre is crossed at 1040 m after 312 s
        for i in 1..=9 {
            if let Some(cue) = engine.ingest(fix(i * 78_000, i as f64 * 260.0, 5.0), true) {
                cues.push(cue);
            }
        }

        assert_eq!(cues.len(), 2);
        match &cues[0] {
            Cue::Split { km, pace_min_per_km } => {
                assert_eq!(*km, 1);
                assert!((pace_min_per_km.unwrap() - 5.2).abs() < 0.01);
            }
            other => panic!("unexpected cue {:?}", other),
        }
        assert!(matches!(cues[1], Cue::Split { km: 2, .. }));
    }

    #[test]
    fn test_splits_disabled_still_tracks_progress() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 5.0), false);
        assert!(engine.ingest(fix(300_000, 1_100.0, 5.0), false).is_none());
        // Enabling later does not replay the kilometre already passed
        assert!(engine.ingest(fix(360_000, 1_200.0, 5.0), true).is_none());
    }

    #[test]
    fn test_reset_anchor_skips_gap() {
        let mut engine = PaceEngine::new();
        engine.ingest(fix(0, 0.0, 5.0), false);
        engine.reset_anchor();
        engine.ingest(fix(60_000, 500.0, 5.0), false);
        assert_eq!(engine.total_distance_m(), 0.0);
    }
}
