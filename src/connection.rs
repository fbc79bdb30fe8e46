//! # Connection Management Module
//!
//! Owns the heart rate sensor connection lifecycle: scanning, connecting,
//! service verification and reconnection with exponential backoff.
//!
//! ## Key Components
//! - `ConnectionManager`: the connection state machine. It never touches the
//!   radio itself; every transition returns `ConnectionAction`s that the
//!   session controller forwards to the transport thread or the retry timers.
//! - `TargetDevice`: whether we want to be connected at all. Clearing the
//!   target bumps the retry generation, so timers already in flight are stale
//!   when they fire.
//! - `ReconnectPolicy`: backoff delay and the reconnect timeout window.
//!
//! ## States
//! ```text
//! Disconnected --scan()--> Scanning --connect()--> Connecting
//! Connecting --link up + service verified--> Connected
//! Connected --link lost (targeting)--> Retrying --retry due--> Connecting
//! any --disconnect()--> Disconnected
//! ```

use crate::error::{ConnectionError, ScanError};
use crate::sensor::TransportCommand;

pub const INITIAL_RETRY_DELAY_MS: u64 = 3_000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const RECONNECT_TIMEOUT_MS: i64 = 120_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Retrying { attempt: u32, next_delay_ms: u64 },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Retrying { .. } => "retrying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDevice {
    NotTargeting,
    Targeting(String),
}

impl TargetDevice {
    pub fn address(&self) -> Option<&str> {
        match self {
            TargetDevice::NotTargeting => None,
            TargetDevice::Targeting(address) => Some(address),
        }
    }

    fn is(&self, address: &str) -> bool {
        self.address() == Some(address)
    }
}

/// Identifies one scheduled reconnect. Only the ticket matching the current
/// target and generation may act when its timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTicket {
    pub address: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    Transport(TransportCommand),
    ScheduleRetry { ticket: RetryTicket, delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    delay_ms: u64,
    attempt_count: u32,
    first_disconnect_ms: Option<i64>,
    timeout_ms: i64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: INITIAL_RETRY_DELAY_MS,
            attempt_count: 0,
            first_disconnect_ms: None,
            timeout_ms: RECONNECT_TIMEOUT_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for the next attempt; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.delay_ms;
        self.delay_ms = (self.delay_ms * 2).min(MAX_RETRY_DELAY_MS);
        self.attempt_count += 1;
        delay
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn mark_disconnect(&mut self, now: i64) {
        if self.first_disconnect_ms.is_none() {
            self.first_disconnect_ms = Some(now);
        }
    }

    pub fn timed_out(&self, now: i64) -> bool {
        self.first_disconnect_ms
            .map_or(false, |first| now - first > self.timeout_ms)
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// A successful connection ends the retry window.
    fn reset(&mut self) {
        *self = Self {
            timeout_ms: self.timeout_ms,
            ..Self::default()
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub address: String,
    pub name: String,
}

pub struct ConnectionManager {
    state: ConnectionState,
    target: TargetDevice,
    policy: ReconnectPolicy,
    generation: u64,
    connected: Option<ConnectedDevice>,
    last_error: Option<String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target: TargetDevice::NotTargeting,
            policy: ReconnectPolicy::default(),
            generation: 0,
            connected: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn target(&self) -> &TargetDevice {
        &self.target
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn connected_device(&self) -> Option<&ConnectedDevice> {
        self.connected.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Human-readable connection status for the snapshot.
    pub fn status_text(&self) -> String {
        match &self.state {
            ConnectionState::Disconnected => match &self.last_error {
                Some(error) => error.clone(),
                None => "Disconnected".to_string(),
            },
            ConnectionState::Scanning => "Scanning...".to_string(),
            ConnectionState::Connecting => match self.target.address() {
                Some(address) => format!("Connecting to {}...", address),
                None => "Connecting...".to_string(),
            },
            ConnectionState::Connected => match &self.connected {
                Some(device) => format!("Connected to {}", device.name),
                None => "Connected".to_string(),
            },
            ConnectionState::Retrying {
                attempt,
                next_delay_ms,
            } => format!(
                "Connection lost. Reconnecting (attempt {}) in {}s",
                attempt,
                next_delay_ms / 1000
            ),
        }
    }

    /// Start discovering devices. Clears the target so no reconnect survives a rescan.
    pub fn scan(&mut self) -> Result<Vec<ConnectionAction>, ScanError> {
        if self.is_connected() {
            return Err(ScanError::AlreadyConnected);
        }
        log::info!("Starting device scan");
        self.clear_target();
        self.last_error = None;
        self.state = ConnectionState::Scanning;
        Ok(vec![ConnectionAction::Transport(TransportCommand::StartScan)])
    }

    pub fn on_scan_stopped(&mut self) {
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Disconnected;
        }
    }

    pub fn on_scan_failed(&mut self, error: &ScanError) {
        log::warn!("{}", error);
        if self.state == ConnectionState::Scanning {
            self.state = ConnectionState::Disconnected;
        }
        self.last_error = Some(error.to_string());
    }

    /// User picked a device (or start() found a saved one).
    pub fn connect(&mut self, address: &str) -> Vec<ConnectionAction> {
        if self.is_connected() && self.target.is(address) {
            log::debug!("Already connected to {}", address);
            return Vec::new();
        }

        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Scanning => {
                actions.push(ConnectionAction::Transport(TransportCommand::StopScan))
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                actions.push(ConnectionAction::Transport(TransportCommand::Disconnect))
            }
            _ => {}
        }

        log::info!("Connecting to device: {}", address);
        self.clear_target();
        self.target = TargetDevice::Targeting(address.to_string());
        self.connected = None;
        self.last_error = None;
        self.state = ConnectionState::Connecting;
        actions.push(ConnectionAction::Transport(TransportCommand::Connect(
            address.to_string(),
        )));
        actions
    }

    /// Link established; still waiting on heart rate service discovery.
    pub fn on_link_up(&mut self, address: &str) {
        if self.target.is(address) {
            log::info!("Link up with {}, discovering services", address);
        }
    }

    /// Heart rate service found: the connection is usable. Returns false for
    /// a device we are no longer targeting.
    pub fn on_service_verified(&mut self, address: &str, name: &str) -> bool {
        if !self.target.is(address) {
            log::debug!("Ignoring service verification from stale device {}", address);
            return false;
        }
        log::info!("Connected to {} ({})", name, address);
        self.state = ConnectionState::Connected;
        self.policy.reset();
        self.connected = Some(ConnectedDevice {
            address: address.to_string(),
            name: name.to_string(),
        });
        true
    }

    /// The device does not expose the heart rate service; give up on it.
    pub fn on_service_missing(&mut self, address: &str) -> Option<ConnectionError> {
        if !self.target.is(address) {
            return None;
        }
        let error = ConnectionError::ServiceMissing {
            device_id: address.to_string(),
        };
        log::error!("{}", error);
        self.clear_target();
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(error.to_string());
        Some(error)
    }

    /// Adapter missing or permission denied: surfaced, never retried.
    pub fn on_transport_error(&mut self, error: &ConnectionError) {
        log::error!("{}", error);
        self.clear_target();
        self.connected = None;
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(error.to_string());
    }

    /// Unexpected link loss or failed connection attempt.
    pub fn on_link_lost(&mut self, address: &str, now: i64) -> Vec<ConnectionAction> {
        if !self.target.is(address) {
            log::debug!("Link to {} closed while not targeting it", address);
            return Vec::new();
        }
        self.connected = None;

        self.policy.mark_disconnect(now);
        let delay_ms = self.policy.next_delay();
        let attempt = self.policy.attempt_count();
        log::warn!(
            "Link to {} lost, reconnect attempt {} in {} ms",
            address,
            attempt,
            delay_ms
        );
        self.state = ConnectionState::Retrying {
            attempt,
            next_delay_ms: delay_ms,
        };
        vec![ConnectionAction::ScheduleRetry {
            ticket: RetryTicket {
                address: address.to_string(),
                generation: self.generation,
            },
            delay_ms,
        }]
    }

    /// A reconnect timer fired. Acts only if the ticket is still current.
    pub fn on_retry_due(&mut self, ticket: &RetryTicket) -> Vec<ConnectionAction> {
        if ticket.generation != self.generation || !self.target.is(&ticket.address) {
            log::debug!("Dropping stale reconnect for {}", ticket.address);
            return Vec::new();
        }
        if !matches!(self.state, ConnectionState::Retrying { .. }) {
            return Vec::new();
        }
        log::info!("Reconnecting to {}", ticket.address);
        self.state = ConnectionState::Connecting;
        vec![ConnectionAction::Transport(TransportCommand::Connect(
            ticket.address.clone(),
        ))]
    }

    /// Explicit disconnect: stop targeting and cancel pending retries.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        log::info!("Disconnect requested");
        let was_idle = self.state == ConnectionState::Disconnected;
        self.clear_target();
        self.connected = None;
        self.state = ConnectionState::Disconnected;
        if was_idle {
            Vec::new()
        } else {
            vec![ConnectionAction::Transport(TransportCommand::Disconnect)]
        }
    }

    /// True once the retry window has exceeded the reconnect timeout.
    pub fn retry_timed_out(&self, now: i64) -> bool {
        self.target.address().is_some() && self.policy.timed_out(now)
    }

    pub fn timeout_error(&self) -> ConnectionError {
        ConnectionError::ReconnectTimeout {
            seconds: (self.policy.timeout_ms() / 1000) as u64,
        }
    }

    fn clear_target(&mut self) {
        self.target = TargetDevice::NotTargeting;
        self.generation += 1;
        self.policy.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn connected_manager() -> ConnectionManager {
        let mut manager = ConnectionManager::new();
        manager.connect(ADDR);
        manager.on_link_up(ADDR);
        assert!(manager.on_service_verified(ADDR, "Strap"));
        manager
    }

    fn scheduled(actions: &[ConnectionAction]) -> (RetryTicket, u64) {
        match actions {
            [ConnectionAction::ScheduleRetry { ticket, delay_ms }] => (ticket.clone(), *delay_ms),
            other => panic!("expected a scheduled retry, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_flow_reaches_connected() {
        let manager = connected_manager();
        assert_eq!(manager.state(), &ConnectionState::Connected);
        assert_eq!(manager.status_text(), "Connected to Strap");
        assert_eq!(manager.connected_device().map(|d| d.address.as_str()), Some(ADDR));
    }

    #[test]
    fn test_backoff_sequence_caps_at_thirty_seconds() {
        let mut manager = connected_manager();
        let mut delays = Vec::new();

        let mut actions = manager.on_link_lost(ADDR, 0);
        for attempt in 1..=5 {
            let (ticket, delay) = scheduled(&actions);
            delays.push(delay);
            assert_eq!(
                manager.state(),
                &ConnectionState::Retrying {
                    attempt,
                    next_delay_ms: delay
                }
            );
            let reconnect = manager.on_retry_due(&ticket);
            assert_eq!(
                reconnect,
                vec![ConnectionAction::Transport(TransportCommand::Connect(ADDR.to_string()))]
            );
            actions = manager.on_link_lost(ADDR, 1_000 * attempt as i64);
        }

        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 30_000]);
        assert_eq!(scheduled(&actions).1, 30_000);
    }

    #[test]
    fn test_successful_reconnect_resets_backoff() {
        let mut manager = connected_manager();
        let (ticket, _) = scheduled(&manager.on_link_lost(ADDR, 0));
        manager.on_retry_due(&ticket);
        let (ticket, _) = scheduled(&manager.on_link_lost(ADDR, 3_000));
        manager.on_retry_due(&ticket);
        assert!(manager.on_service_verified(ADDR, "Strap"));
        // The retry window starts over
        assert!(!manager.policy().timed_out(1_000_000));

        let (_, delay) = scheduled(&manager.on_link_lost(ADDR, 60_000));
        assert_eq!(delay, 3_000);
    }

    #[test]
    fn test_reconnect_timeout_from_first_disconnect() {
        let mut manager = connected_manager();
        manager.on_link_lost(ADDR, 10_000);
        manager.on_link_lost(ADDR, 50_000);

        assert!(!manager.retry_timed_out(130_000));
        assert!(manager.retry_timed_out(130_001));
        assert_eq!(manager.timeout_error().to_string(), "Reconnect timeout (2m)");
    }

    #[test]
    fn test_disconnect_cancels_pending_retry() {
        let mut manager = connected_manager();
        let (ticket, _) = scheduled(&manager.on_link_lost(ADDR, 0));

        let actions = manager.disconnect();
        assert_eq!(
            actions,
            vec![ConnectionAction::Transport(TransportCommand::Disconnect)]
        );
        assert!(manager.on_retry_due(&ticket).is_empty());
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert!(!manager.retry_timed_out(1_000_000));
    }

    #[test]
    fn test_retarget_invalidates_old_ticket() {
        let mut manager = connected_manager();
        let (ticket, _) = scheduled(&manager.on_link_lost(ADDR, 0));

        manager.disconnect();
        manager.connect(ADDR);
        // Same address, but the old timer belongs to a previous generation
        assert!(manager.on_retry_due(&ticket).is_empty());
        assert_eq!(manager.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_to_connected_device_is_noop() {
        let mut manager = connected_manager();
        assert!(manager.connect(ADDR).is_empty());
        assert_eq!(manager.state(), &ConnectionState::Connected);
    }

    #[test]
    fn test_connect_to_other_device_drops_current_link() {
        let mut manager = connected_manager();
        let actions = manager.connect("11:22:33:44:55:66");
        assert_eq!(
            actions,
            vec![
                ConnectionAction::Transport(TransportCommand::Disconnect),
                ConnectionAction::Transport(TransportCommand::Connect(
                    "11:22:33:44:55:66".to_string()
                )),
            ]
        );
        // Late loss of the old link must not start a retry
        assert!(manager.on_link_lost(ADDR, 0).is_empty());
    }

    #[test]
    fn test_scan_rejected_while_connected() {
        let mut manager = connected_manager();
        assert_eq!(manager.scan(), Err(ScanError::AlreadyConnected));
    }

    #[test]
    fn test_scan_clears_retry_target() {
        let mut manager = connected_manager();
        let (ticket, _) = scheduled(&manager.on_link_lost(ADDR, 0));

        let actions = manager.scan().unwrap();
        assert_eq!(
            actions,
            vec![ConnectionAction::Transport(TransportCommand::StartScan)]
        );
        assert_eq!(manager.target(), &TargetDevice::NotTargeting);
        assert!(manager.on_retry_due(&ticket).is_empty());
        assert_eq!(manager.state(), &ConnectionState::Scanning);

        let actions = manager.connect(ADDR);
        assert_eq!(
            actions[0],
            ConnectionAction::Transport(TransportCommand::StopScan)
        );
    }

    #[test]
    fn test_missing_service_stops_targeting() {
        let mut manager = ConnectionManager::new();
        manager.connect(ADDR);
        let error = manager.on_service_missing(ADDR);
        assert!(matches!(error, Some(ConnectionError::ServiceMissing { .. })));
        assert_eq!(manager.target(), &TargetDevice::NotTargeting);
        assert!(manager.on_link_lost(ADDR, 0).is_empty());
    }
}
