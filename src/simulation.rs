//! Synthetic heart rate for running a session without a sensor.

pub const SIM_START_BPM: u16 = 60;
const SIM_STEP_BPM: u16 = 5;

/// Sawtooth generator: climbs 5 bpm per tick up to `max_hr + 10`, then falls
/// back to 60 and climbs again.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateSimulator {
    bpm: u16,
    rising: bool,
}

impl HeartRateSimulator {
    pub fn new() -> Self {
        Self {
            bpm: SIM_START_BPM,
            rising: true,
        }
    }

    /// Advance one tick and return the new value.
    pub fn next_bpm(&mut self, max_hr: u16) -> u16 {
        let ceiling = max_hr.saturating_add(10);
        if self.rising {
            self.bpm = self.bpm.saturating_add(SIM_STEP_BPM);
            if self.bpm >= ceiling {
                self.rising = false;
            }
        } else {
            self.bpm = self.bpm.saturating_sub(SIM_STEP_BPM);
            if self.bpm <= SIM_START_BPM {
                self.rising = true;
            }
        }
        self.bpm
    }
}

impl Default for HeartRateSimulator {
    fn default() -> Self {
        Self::new()
    }
}
