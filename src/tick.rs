//! 1 Hz timing authority.
//!
//! `TickClock` runs on its own thread and posts a `Pulse` into the session
//! event channel, then blocks until the controller has processed it. It
//! re-arms only while the reported status keeps the session alive, so the
//! loop cannot outlive a stopped session. Catch-up of skipped seconds is the
//! controller's job: a pulse carries the current monotonic time, not a count.

use crate::session::{SessionEvent, SessionStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Monotonic milliseconds since process start. Shared by every producer so
/// heart rate, location and pulse timestamps are comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TickClock {
    stop: Arc<AtomicBool>,
}

impl TickClock {
    pub fn start(events: mpsc::Sender<SessionEvent>, clock: Clock, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        thread::spawn(move || {
            log::debug!("Tick clock started");
            loop {
                thread::sleep(interval);
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let (ack_tx, ack_rx) = mpsc::sync_channel(1);
                let pulse = SessionEvent::Pulse {
                    now_ms: clock.now_ms(),
                    ack: ack_tx,
                };
                if events.send(pulse).is_err() {
                    break;
                }

                match ack_rx.recv() {
                    Ok(status) if keeps_ticking(&status) => {}
                    Ok(status) => {
                        log::debug!("Tick clock not re-armed, session is {:?}", status);
                        break;
                    }
                    Err(_) => break,
                }
            }
            log::debug!("Tick clock stopped");
        });

        Self { stop }
    }

    /// Ask the thread to exit at its next wake-up. Does not join: the thread
    /// may be waiting on the very controller that calls this.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for TickClock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn keeps_ticking(status: &SessionStatus) -> bool {
    !matches!(status, SessionStatus::Stopped | SessionStatus::Idle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_pulse(rx: &mpsc::Receiver<SessionEvent>) -> (i64, mpsc::SyncSender<SessionStatus>) {
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(SessionEvent::Pulse { now_ms, ack }) => (now_ms, ack),
            Ok(_) => panic!("unexpected event"),
            Err(e) => panic!("no pulse: {:?}", e),
        }
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.now_ms() >= a + 5);
    }

    #[test]
    fn test_pulses_until_session_stops() {
        let (tx, rx) = mpsc::channel();
        let _ticker = TickClock::start(tx, Clock::new(), Duration::from_millis(10));

        let (first, ack) = expect_pulse(&rx);
        ack.send(SessionStatus::Running).unwrap();
        let (second, ack) = expect_pulse(&rx);
        assert!(second > first);
        ack.send(SessionStatus::Stopped).unwrap();

        // Thread exits and drops its sender
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let (tx, rx) = mpsc::channel();
        let ticker = TickClock::start(tx, Clock::new(), Duration::from_millis(10));
        let (_, ack) = expect_pulse(&rx);
        ticker.stop();
        ack.send(SessionStatus::Running).unwrap();

        // At most one pulse can already be in flight
        let mut extra = 0;
        loop {
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(SessionEvent::Pulse { ack, .. }) => {
                    extra += 1;
                    let _ = ack.send(SessionStatus::Running);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(extra <= 1);
    }
}
