//! # Session Controller
//!
//! Top-level workout state machine. A single `SessionController` owns the
//! connection manager, the coaching and pace engines and all per-session
//! counters. Every producer (transport thread, location source, tick clock,
//! retry timers, control surface) talks to it through one `SessionEvent`
//! queue, so the controller is the only mutator of its own state.
//!
//! ## Pulse
//! `pulse(now)` advances the session one whole second at a time from the
//! previous pulse, so a throttled timer never loses seconds:
//! - `Running`: phase clock, phase cues, baseline capture, statistics and
//!   one persisted sample per second
//! - `Paused`: paused seconds only
//! - `Connecting`/`Paused` with a retrying link: reconnect timeout check
//!
//! Each handled event publishes a fresh `SessionSnapshot` through a `watch`
//! channel (whole-value replace).

use crate::coaching::{CoachingContext, CoachingDebug, CoachingEngine};
use crate::config::{RunMode, Settings, SettingsHandle};
use crate::connection::{ConnectionAction, ConnectionManager, ConnectionState, RetryTicket};
use crate::cues::{Cue, CueSink};
use crate::device_scanner::{BluetoothDevice, DiscoveredDevices};
use crate::heart_rate::{BitWidth, HeartRateSample};
use crate::pace::{LocationFix, PaceEngine};
use crate::recorder::{HrSample, Recorder, SessionId, SessionRecord, SessionSummary};
use crate::sensor::{LinkEvent, TransportCommand};
use crate::simulation::HeartRateSimulator;
use crate::tick::{Clock, TickClock, TICK_INTERVAL};
use crate::zones::absolute_zone;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Running,
    Paused,
    Stopping,
    Stopped,
    /// Terminal until an explicit restart
    Error(String),
}

impl SessionStatus {
    pub fn label(&self) -> &str {
        match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Running => "Running",
            SessionStatus::Paused => "Paused",
            SessionStatus::Stopping => "Stopping",
            SessionStatus::Stopped => "Stopped",
            SessionStatus::Error(reason) => reason,
        }
    }

    /// A session exists and has not ended.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Connecting | SessionStatus::Running | SessionStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    WarmUp,
    Main,
    CoolDown,
}

impl SessionPhase {
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::WarmUp => "Warm Up",
            SessionPhase::Main => "Main",
            SessionPhase::CoolDown => "Cool Down",
        }
    }

    pub fn spoken_name(&self) -> &'static str {
        match self {
            SessionPhase::WarmUp => "warm up",
            SessionPhase::Main => "main workout",
            SessionPhase::CoolDown => "cool down",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionCounters {
    pub seconds_running: u64,
    pub seconds_paused: u64,
    pub max_bpm: u16,
    pub bpm_sum: u64,
    pub sample_count: u64,
    /// Seconds in absolute zones 1..=5
    pub zone_seconds: [u64; 5],
    pub no_data_seconds: u64,
    pub target_zone_seconds: u64,
    pub distance_meters: f64,
    pub last_split_km: u32,
}

impl SessionCounters {
    /// Account one running second at `bpm` (0 = no data).
    pub fn record_second(&mut self, bpm: u16, settings: &Settings) {
        if bpm == 0 {
            self.no_data_seconds += 1;
            return;
        }
        self.max_bpm = self.max_bpm.max(bpm);
        self.bpm_sum += u64::from(bpm);
        self.sample_count += 1;

        let zone = absolute_zone(bpm, settings);
        if (1..=5).contains(&zone) {
            self.zone_seconds[usize::from(zone - 1)] += 1;
        }
        if zone == 2 {
            self.target_zone_seconds += 1;
        }
    }

    pub fn avg_bpm(&self) -> u16 {
        if self.sample_count == 0 {
            0
        } else {
            (self.bpm_sum as f64 / self.sample_count as f64).round() as u16
        }
    }

    fn summary(&self) -> SessionSummary {
        let distance_km = self.distance_meters / 1000.0;
        let avg_pace_min_per_km = if distance_km > 0.0 && self.seconds_running > 0 {
            (self.seconds_running as f64 / 60.0) / distance_km
        } else {
            0.0
        };
        SessionSummary {
            end_time: Utc::now(),
            duration_seconds: self.seconds_running,
            avg_bpm: self.avg_bpm(),
            max_bpm: self.max_bpm,
            target_zone_seconds: self.target_zone_seconds,
            zone_seconds: self.zone_seconds,
            no_data_seconds: self.no_data_seconds,
            distance_km,
            avg_pace_min_per_km,
        }
    }
}

/// Immutable view of the whole session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub connection_status: String,
    pub status: SessionStatus,
    pub bpm: u16,
    pub avg_bpm: u16,
    pub bit_width: Option<BitWidth>,
    pub coaching: Option<CoachingDebug>,
    pub seconds_running: u64,
    pub seconds_paused: u64,
    pub reconnect_attempts: u32,
    pub last_hr_age_seconds: Option<u64>,
    pub error_message: Option<String>,
    pub zone_seconds: [u64; 5],
    pub simulating: bool,
    pub phase: SessionPhase,
    pub phase_seconds_remaining: Option<u64>,
    pub distance_km: f64,
    pub pace_min_per_km: f64,
    pub run_mode: RunMode,
    pub discovered_devices: Vec<BluetoothDevice>,
    pub connected_device: Option<String>,
    pub session_id: Option<SessionId>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            connection_status: "Disconnected".to_string(),
            status: SessionStatus::Idle,
            bpm: 0,
            avg_bpm: 0,
            bit_width: None,
            coaching: None,
            seconds_running: 0,
            seconds_paused: 0,
            reconnect_attempts: 0,
            last_hr_age_seconds: None,
            error_message: None,
            zone_seconds: [0; 5],
            simulating: false,
            phase: SessionPhase::WarmUp,
            phase_seconds_remaining: None,
            distance_km: 0.0,
            pace_min_per_km: 0.0,
            run_mode: RunMode::Treadmill,
            discovered_devices: Vec::new(),
            connected_device: None,
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start(Option<String>),
    Pause,
    Resume,
    TogglePause,
    Stop,
    SkipPhase,
    ToggleSimulation,
    Scan,
    SelectDevice(String),
    Shutdown,
}

#[derive(Debug)]
pub enum SessionEvent {
    Control(ControlCommand),
    Link(LinkEvent),
    Location(LocationFix),
    RetryDue(RetryTicket),
    /// Tick clock wants the status back before it re-arms
    Pulse {
        now_ms: i64,
        ack: mpsc::SyncSender<SessionStatus>,
    },
}

pub struct SessionController {
    settings: SettingsHandle,
    clock: Clock,
    events: mpsc::Sender<SessionEvent>,
    transport: mpsc::Sender<TransportCommand>,
    recorder: Recorder,
    cue_sink: Box<dyn CueSink>,
    snapshot: watch::Sender<SessionSnapshot>,
    tick_interval: Option<Duration>,
    ticker: Option<TickClock>,

    connection: ConnectionManager,
    coaching: CoachingEngine,
    pace: PaceEngine,
    discovered: DiscoveredDevices,
    simulator: HeartRateSimulator,

    status: SessionStatus,
    phase: SessionPhase,
    phase_elapsed: u64,
    phase_warning_given: bool,
    counters: SessionCounters,
    session_id: Option<SessionId>,
    last_pulse_ms: Option<i64>,
    bpm: u16,
    bit_width: Option<BitWidth>,
    last_hr_ms: Option<i64>,
    simulating: bool,
    location_active: bool,
    last_fix: Option<LocationFix>,
    error_message: Option<String>,
}

impl SessionController {
    pub fn new(
        settings: SettingsHandle,
        recorder: Recorder,
        cue_sink: Box<dyn CueSink>,
        transport: mpsc::Sender<TransportCommand>,
        events: mpsc::Sender<SessionEvent>,
        clock: Clock,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let controller = Self {
            settings,
            clock,
            events,
            transport,
            recorder,
            cue_sink,
            snapshot,
            tick_interval: Some(TICK_INTERVAL),
            ticker: None,
            connection: ConnectionManager::new(),
            coaching: CoachingEngine::new(),
            pace: PaceEngine::new(),
            discovered: DiscoveredDevices::default(),
            simulator: HeartRateSimulator::new(),
            status: SessionStatus::Idle,
            phase: SessionPhase::WarmUp,
            phase_elapsed: 0,
            phase_warning_given: false,
            counters: SessionCounters::default(),
            session_id: None,
            last_pulse_ms: None,
            bpm: 0,
            bit_width: None,
            last_hr_ms: None,
            simulating: false,
            location_active: false,
            last_fix: None,
            error_message: None,
        };
        (controller, snapshot_rx)
    }

    /// `None` disables the internal tick clock; pulses must then be delivered by hand.
    pub fn with_tick_interval(mut self, interval: Option<Duration>) -> Self {
        self.tick_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    #[cfg(test)]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    #[cfg(test)]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[cfg(test)]
    pub fn coaching(&self) -> &CoachingEngine {
        &self.coaching
    }

    /// Process events until `Shutdown`, then end the session so its final
    /// record is written before the recorder drains.
    pub fn run(mut self, events: mpsc::Receiver<SessionEvent>) {
        while let Ok(event) = events.recv() {
            if !self.handle(event) {
                break;
            }
        }
        let now = self.clock.now_ms();
        self.stop(now);
        log::info!("Session controller: shutting down");
    }

    /// Returns false once the controller should exit.
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Control(ControlCommand::Shutdown) => return false,
            SessionEvent::Control(command) => {
                let now = self.clock.now_ms();
                self.control(command, now);
            }
            SessionEvent::Link(event) => {
                let now = self.clock.now_ms();
                self.on_link_event(event, now);
            }
            SessionEvent::Location(fix) => self.on_location(fix),
            SessionEvent::RetryDue(ticket) => {
                let actions = self.connection.on_retry_due(&ticket);
                self.dispatch(actions);
            }
            SessionEvent::Pulse { now_ms, ack } => {
                self.pulse(now_ms);
                let _ = ack.send(self.status.clone());
            }
        }
        self.publish(self.clock.now_ms());
        true
    }

    fn control(&mut self, command: ControlCommand, now: i64) {
        match command {
            ControlCommand::Start(address) => self.start(address, now),
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::TogglePause => self.toggle_pause(),
            ControlCommand::Stop => self.stop(now),
            ControlCommand::SkipPhase => self.skip_phase(now),
            ControlCommand::ToggleSimulation => self.toggle_simulation(now),
            ControlCommand::Scan => self.scan(),
            ControlCommand::SelectDevice(address) => self.select_device(address, now),
            ControlCommand::Shutdown => {}
        }
    }

    /// Begin a session: connect to `address` or the saved device, scan otherwise.
    pub fn start(&mut self, address: Option<String>, now: i64) {
        if self.status.is_active() {
            log::warn!("Session already {}, start ignored", self.status.label());
            return;
        }
        let settings = self.settings.current();
        self.begin_session(now, &settings);

        if self.simulating || settings.simulation_enabled {
            self.simulating = true;
            self.enter_running(&settings);
        } else {
            self.status = SessionStatus::Connecting;
            match address.or(settings.active_device_address) {
                Some(address) => {
                    let actions = self.connection.connect(&address);
                    self.dispatch(actions);
                }
                None => self.scan(),
            }
        }
        self.ensure_ticker();
    }

    pub fn pause(&mut self) {
        if self.status != SessionStatus::Running {
            return;
        }
        log::info!("Session paused");
        self.status = SessionStatus::Paused;
        self.stop_location();
    }

    pub fn resume(&mut self) {
        if self.status != SessionStatus::Paused {
            return;
        }
        log::info!("Session resumed");
        if self.simulating || self.connection.is_connected() {
            let settings = self.settings.current();
            self.enter_running(&settings);
        } else {
            self.status = SessionStatus::Connecting;
        }
    }

    pub fn toggle_pause(&mut self) {
        match self.status {
            SessionStatus::Running => self.pause(),
            SessionStatus::Paused => self.resume(),
            _ => {}
        }
    }

    /// End the session and finalize its record. The store write completes
    /// before this returns.
    pub fn stop(&mut self, now: i64) {
        self.end_session(SessionStatus::Stopped, now);
    }

    /// Forward-only manual phase change.
    pub fn skip_phase(&mut self, now: i64) {
        if !matches!(self.status, SessionStatus::Running | SessionStatus::Paused) {
            return;
        }
        let settings = self.settings.current();
        match self.phase {
            SessionPhase::WarmUp => {
                self.enter_phase(SessionPhase::Main);
                self.speak(Cue::WarmUpSkipped, &settings);
            }
            SessionPhase::Main => {
                self.enter_phase(SessionPhase::CoolDown);
                self.speak(Cue::CoolDownStarting, &settings);
            }
            SessionPhase::CoolDown => self.stop(now),
        }
    }

    pub fn toggle_simulation(&mut self, now: i64) {
        let enable = !self.simulating;
        if let Err(e) = self.settings.update(|s| s.simulation_enabled = enable) {
            log::warn!("Failed to persist simulation setting: {}", e);
        }

        if enable {
            log::info!("Simulation enabled");
            let actions = self.connection.disconnect();
            self.dispatch(actions);
            self.simulating = true;
            self.simulator = HeartRateSimulator::new();
            if self.status == SessionStatus::Connecting {
                let settings = self.settings.current();
                self.enter_running(&settings);
            } else if !self.status.is_active() {
                self.start(None, now);
            }
        } else {
            log::info!("Simulation disabled");
            self.stop(now);
        }
    }

    pub fn scan(&mut self) {
        match self.connection.scan() {
            Ok(actions) => {
                self.discovered.clear();
                self.dispatch(actions);
            }
            Err(e) => {
                log::warn!("{}", e);
                self.error_message = Some(e.to_string());
            }
        }
    }

    /// Device picked from the scan list. Starts a session if none is active.
    pub fn select_device(&mut self, address: String, now: i64) {
        if !self.status.is_active() {
            self.start(Some(address), now);
            return;
        }
        let actions = self.connection.connect(&address);
        if actions.is_empty() {
            return;
        }
        if self.status == SessionStatus::Running {
            self.status = SessionStatus::Connecting;
        }
        self.dispatch(actions);
    }

    /// Advance the session by every whole second elapsed since the previous pulse.
    pub fn pulse(&mut self, now: i64) {
        let settings = self.settings.current();

        match self.last_pulse_ms {
            None => self.last_pulse_ms = Some(now),
            Some(last) if now < last => {
                log::warn!("Clock went backwards by {} ms, resetting pulse baseline", last - now);
                self.last_pulse_ms = Some(now);
            }
            Some(last) => {
                let delta_seconds = (now - last) / 1000;
                if delta_seconds >= 1 {
                    self.last_pulse_ms = Some(last + delta_seconds * 1000);

                    if self.simulating && self.status == SessionStatus::Running {
                        let bpm = self.simulator.next_bpm(settings.max_hr);
                        self.ingest_bpm(bpm, now, None);
                    }

                    for _ in 0..delta_seconds {
                        match self.status {
                            SessionStatus::Running => {
                                if !self.run_second(now, &settings) {
                                    break;
                                }
                            }
                            SessionStatus::Paused => self.counters.seconds_paused += 1,
                            _ => break,
                        }
                    }
                }
            }
        }

        let retrying = matches!(
            self.status,
            SessionStatus::Connecting | SessionStatus::Paused
        );
        if retrying && self.connection.retry_timed_out(now) {
            let error = self.connection.timeout_error();
            log::error!("{}", error);
            self.fail(error.to_string(), now);
        }

        log::debug!(
            "Timer heartbeat: running={}s age={}s status={}",
            self.counters.seconds_running,
            self.last_hr_age_seconds(now).map_or(-1, |age| age as i64),
            self.status.label()
        );
    }

    /// One running second. Returns false when the session ended during it;
    /// the second that completes the cool down is not accounted.
    fn run_second(&mut self, now: i64, settings: &Settings) -> bool {
        self.phase_elapsed += 1;
        let elapsed = self.counters.seconds_running + 1;

        if let Some(duration) = settings.phase_duration_seconds(self.phase) {
            let remaining = duration.saturating_sub(self.phase_elapsed);
            if remaining == 10 && !self.phase_warning_given {
                self.phase_warning_given = true;
                self.speak(Cue::PhaseEndingSoon(self.phase), settings);
            }
            if remaining == 0 {
                match self.phase {
                    SessionPhase::WarmUp => {
                        log::info!("Warm up complete at {}s", elapsed);
                        self.enter_phase(SessionPhase::Main);
                        self.speak(Cue::MainWorkoutStarting, settings);
                    }
                    SessionPhase::CoolDown => {
                        log::info!("Cool down complete at {}s", elapsed);
                        self.stop(now);
                        return false;
                    }
                    SessionPhase::Main => {}
                }
            }
        }

        self.counters.seconds_running = elapsed;
        if elapsed >= settings.coaching.baseline_capture_second
            && self.coaching.state().baseline_hr.is_none()
        {
            self.coaching.capture_baseline(self.bpm);
        }

        self.record_second(settings);
        true
    }

    fn record_second(&mut self, settings: &Settings) {
        self.counters.record_second(self.bpm, settings);

        let Some(session_id) = self.session_id else {
            return;
        };
        let pace = self.pace.pace_min_per_km();
        self.recorder.record_sample(HrSample {
            session_id,
            elapsed_seconds: self.counters.seconds_running,
            raw_bpm: self.bpm,
            smoothed_bpm: self.coaching.avg_bpm().unwrap_or(0),
            connection_state: self.connection_label().to_string(),
            latitude: self.last_fix.map(|f| f.latitude),
            longitude: self.last_fix.map(|f| f.longitude),
            pace_min_per_km: (pace > 0.0).then_some(pace),
        });
    }

    fn on_link_event(&mut self, event: LinkEvent, now: i64) {
        match event {
            LinkEvent::DeviceDiscovered { address, name } => {
                self.discovered.observe(&address, name.as_deref());
            }
            LinkEvent::ScanStopped => self.connection.on_scan_stopped(),
            LinkEvent::ScanFailed(error) => {
                self.connection.on_scan_failed(&error);
                if self.status == SessionStatus::Connecting
                    && self.connection.target().address().is_none()
                {
                    self.fail(error.to_string(), now);
                } else {
                    self.error_message = Some(error.to_string());
                }
            }
            LinkEvent::LinkUp { address } => self.connection.on_link_up(&address),
            LinkEvent::ServiceVerified { address, name } => {
                if !self.connection.on_service_verified(&address, &name) {
                    return;
                }
                if let Err(e) = self.settings.save_device(&address, &name) {
                    log::warn!("Failed to save device: {}", e);
                }
                self.error_message = None;
                if self.status == SessionStatus::Connecting {
                    let settings = self.settings.current();
                    self.enter_running(&settings);
                }
            }
            LinkEvent::ServiceMissing { address } => {
                if let Some(error) = self.connection.on_service_missing(&address) {
                    if self.status.is_active() {
                        self.fail(error.to_string(), now);
                    } else {
                        self.error_message = Some(error.to_string());
                    }
                }
            }
            LinkEvent::LinkLost { address } => {
                let actions = self.connection.on_link_lost(&address, now);
                let retrying = !actions.is_empty();
                self.dispatch(actions);
                if retrying {
                    self.bpm = 0;
                    self.bit_width = None;
                    self.coaching.clear_signal();
                    if self.status == SessionStatus::Running {
                        self.status = SessionStatus::Connecting;
                    }
                }
            }
            LinkEvent::Notification {
                data, timestamp_ms, ..
            } => {
                if self.simulating {
                    return;
                }
                match HeartRateSample::parse(&data, timestamp_ms) {
                    Some(sample) => {
                        self.ingest_bpm(sample.bpm, sample.timestamp_ms, Some(sample.bit_width))
                    }
                    None => log::debug!("Dropped malformed heart rate payload {:?}", data),
                }
            }
            LinkEvent::TransportError(error) => {
                self.connection.on_transport_error(&error);
                if self.status == SessionStatus::Connecting {
                    self.fail(error.to_string(), now);
                } else {
                    self.error_message = Some(error.to_string());
                }
            }
        }
    }

    fn ingest_bpm(&mut self, bpm: u16, now: i64, bit_width: Option<BitWidth>) {
        self.bpm = bpm;
        self.bit_width = bit_width;
        self.last_hr_ms = Some(now);

        if self.status != SessionStatus::Running {
            self.coaching.observe(bpm, now);
            return;
        }

        let settings = self.settings.current();
        let ctx = CoachingContext {
            settings: &settings,
            phase: self.phase,
            session_seconds: self.counters.seconds_running,
        };
        if let Some(cue) = self.coaching.ingest(bpm, now, &ctx) {
            self.speak(cue, &settings);
        }
    }

    fn on_location(&mut self, fix: LocationFix) {
        if self.status != SessionStatus::Running || !self.location_active {
            return;
        }
        let settings = self.settings.current();
        let cue = self.pace.ingest(fix, settings.split_announcements_enabled);
        self.last_fix = Some(fix);
        self.counters.distance_meters = self.pace.total_distance_m();
        self.counters.last_split_km = (self.counters.distance_meters / 1000.0).floor() as u32;
        if let Some(cue) = cue {
            self.speak(cue, &settings);
        }
    }

    fn begin_session(&mut self, now: i64, settings: &Settings) {
        self.counters = SessionCounters::default();
        self.coaching.reset();
        self.pace.reset();
        self.pace.start_splits_at(now);
        self.phase = SessionPhase::WarmUp;
        self.phase_elapsed = 0;
        self.phase_warning_given = false;
        self.last_pulse_ms = Some(now);
        self.last_fix = None;
        self.error_message = None;

        let record = SessionRecord::new(Utc::now(), settings.run_mode);
        self.session_id = match self.recorder.start_session(record) {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("Could not create session record: {}", e);
                None
            }
        };
        log::info!("Session started ({:?})", self.session_id);
    }

    fn enter_running(&mut self, settings: &Settings) {
        self.status = SessionStatus::Running;
        if settings.run_mode == RunMode::Outdoor && !self.location_active {
            log::info!("Location updates started");
            self.location_active = true;
        }
    }

    fn enter_phase(&mut self, phase: SessionPhase) {
        log::info!("Phase: {} -> {}", self.phase.label(), phase.label());
        self.phase = phase;
        self.phase_elapsed = 0;
        self.phase_warning_given = false;
    }

    fn stop_location(&mut self) {
        if self.location_active {
            log::info!("Location updates stopped");
        }
        self.location_active = false;
        self.pace.reset_anchor();
    }

    fn fail(&mut self, reason: String, now: i64) {
        self.error_message = Some(reason.clone());
        self.end_session(SessionStatus::Error(reason), now);
    }

    fn end_session(&mut self, final_status: SessionStatus, now: i64) {
        if !self.status.is_active() {
            if let SessionStatus::Error(_) = final_status {
                self.status = final_status;
            }
            return;
        }
        self.status = SessionStatus::Stopping;
        self.publish(now);

        let actions = self.connection.disconnect();
        self.dispatch(actions);
        self.stop_location();
        self.simulating = false;
        self.bpm = 0;
        self.ticker = None;

        if let Some(id) = self.session_id {
            if let Err(e) = self.recorder.finalize(id, self.counters.summary()) {
                log::error!("Failed to finalize session {}: {}", id, e);
            }
        }
        log::info!(
            "Session ended: {}s running, {}s paused, avg {} bpm",
            self.counters.seconds_running,
            self.counters.seconds_paused,
            self.counters.avg_bpm()
        );
        self.status = final_status;
    }

    fn ensure_ticker(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        if let Some(interval) = self.tick_interval {
            self.ticker = Some(TickClock::start(self.events.clone(), self.clock, interval));
        }
    }

    fn dispatch(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Transport(command) => {
                    if self.transport.send(command).is_err() {
                        log::error!("Sensor link is not running");
                    }
                }
                ConnectionAction::ScheduleRetry { ticket, delay_ms } => {
                    let events = self.events.clone();
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(delay_ms));
                        let _ = events.send(SessionEvent::RetryDue(ticket));
                    });
                }
            }
        }
    }

    fn speak(&self, cue: Cue, settings: &Settings) {
        let text = cue.text(settings.voice_style);
        if let Err(e) = self.cue_sink.speak(&text) {
            log::warn!("Cue not played: {}", e);
        }
    }

    fn connection_label(&self) -> &'static str {
        if self.simulating {
            "simulated"
        } else {
            self.connection.state().label()
        }
    }

    fn last_hr_age_seconds(&self, now: i64) -> Option<u64> {
        self.last_hr_ms
            .map(|last| ((now - last).max(0) / 1000) as u64)
    }

    fn publish(&self, now: i64) {
        let settings = self.settings.current();
        let avg_bpm = self.coaching.avg_bpm().unwrap_or(0);
        let connection_status = if self.simulating {
            "Simulating".to_string()
        } else {
            self.connection.status_text()
        };
        let reconnect_attempts = match self.connection.state() {
            ConnectionState::Retrying { attempt, .. } => *attempt,
            _ => self.connection.policy().attempt_count(),
        };

        self.snapshot.send_replace(SessionSnapshot {
            connection_state: self.connection.state().clone(),
            connection_status,
            status: self.status.clone(),
            bpm: self.bpm,
            avg_bpm,
            bit_width: self.bit_width,
            coaching: self
                .coaching
                .avg_bpm()
                .map(|_| self.coaching.debug_info(now, &settings)),
            seconds_running: self.counters.seconds_running,
            seconds_paused: self.counters.seconds_paused,
            reconnect_attempts,
            last_hr_age_seconds: self.last_hr_age_seconds(now),
            error_message: self.error_message.clone(),
            zone_seconds: self.counters.zone_seconds,
            simulating: self.simulating,
            phase: self.phase,
            phase_seconds_remaining: settings
                .phase_duration_seconds(self.phase)
                .map(|d| d.saturating_sub(self.phase_elapsed)),
            distance_km: self.counters.distance_meters / 1000.0,
            pace_min_per_km: self.pace.pace_min_per_km(),
            run_mode: settings.run_mode,
            discovered_devices: self.discovered.devices().to_vec(),
            connected_device: self.connection.connected_device().map(|d| d.name.clone()),
            session_id: self.session_id,
        });
    }
}

/// Clonable control surface for a controller running on its own thread.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn new(events: mpsc::Sender<SessionEvent>, snapshot: watch::Receiver<SessionSnapshot>) -> Self {
        Self { events, snapshot }
    }

    fn send(&self, command: ControlCommand) {
        if self.events.send(SessionEvent::Control(command)).is_err() {
            log::warn!("Session controller is not running");
        }
    }

    pub fn start(&self, address: Option<String>) {
        self.send(ControlCommand::Start(address));
    }

    pub fn pause(&self) {
        self.send(ControlCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(ControlCommand::Resume);
    }

    pub fn toggle_pause(&self) {
        self.send(ControlCommand::TogglePause);
    }

    pub fn stop(&self) {
        self.send(ControlCommand::Stop);
    }

    pub fn skip_phase(&self) {
        self.send(ControlCommand::SkipPhase);
    }

    pub fn toggle_simulation(&self) {
        self.send(ControlCommand::ToggleSimulation);
    }

    pub fn scan(&self) {
        self.send(ControlCommand::Scan);
    }

    pub fn select_device(&self, address: String) {
        self.send(ControlCommand::SelectDevice(address));
    }

    pub fn push_location(&self, fix: LocationFix) {
        if self.events.send(SessionEvent::Location(fix)).is_err() {
            log::warn!("Session controller is not running");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn shutdown(&self) {
        self.send(ControlCommand::Shutdown);
    }
}
