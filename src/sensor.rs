//! # Sensor Transport
//!
//! Radio-facing half of the connection. `SensorLink` runs on a dedicated
//! thread with its own tokio runtime, executes `TransportCommand`s from the
//! session controller and reports everything it observes as `LinkEvent`s.
//! Heart rate notifications are forwarded as raw bytes stamped with the shared
//! monotonic clock; decoding happens in the controller.
//!
//! With the `ble` feature the transport drives btleplug. Without it, every
//! scan or connect reports a missing adapter so simulation still works.

use crate::error::{ConnectionError, ScanError};
use crate::session::SessionEvent;
use crate::tick::Clock;
use std::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    DeviceDiscovered { address: String, name: Option<String> },
    ScanStopped,
    ScanFailed(ScanError),
    LinkUp { address: String },
    ServiceVerified { address: String, name: String },
    ServiceMissing { address: String },
    /// Link dropped, or a connection attempt failed
    LinkLost { address: String },
    Notification { address: String, data: Vec<u8>, timestamp_ms: i64 },
    TransportError(ConnectionError),
}

/// Forwards link events into the session controller's queue.
#[derive(Clone)]
pub struct Handler {
    sender: mpsc::Sender<SessionEvent>,
    clock: Clock,
}

impl Handler {
    pub fn new(sender: mpsc::Sender<SessionEvent>, clock: Clock) -> Self {
        Self { sender, clock }
    }

    pub fn emit(&self, event: LinkEvent) {
        if let Err(why) = self.sender.send(SessionEvent::Link(event)) {
            log::debug!("Could not deliver link event: {:?}", why.0);
        }
    }

    pub fn notification(&self, address: String, data: Vec<u8>) {
        self.emit(LinkEvent::Notification {
            address,
            data,
            timestamp_ms: self.clock.now_ms(),
        });
    }
}

pub struct SensorLink {
    command_receiver: mpsc::Receiver<TransportCommand>,
    handler: Handler,
}

impl SensorLink {
    /// Returns the link and a sender for issuing transport commands.
    pub fn new(handler: Handler) -> (Self, mpsc::Sender<TransportCommand>) {
        let (command_sender, command_receiver) = mpsc::channel();
        (
            SensorLink {
                command_receiver,
                handler,
            },
            command_sender,
        )
    }

    /// Blocks until the command channel closes. Call from a spawned thread.
    #[cfg(feature = "ble")]
    pub fn run(self) {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                let error = ConnectionError::RuntimeCreation(e.to_string());
                log::error!("{}", error);
                self.handler.emit(LinkEvent::TransportError(error));
                return;
            }
        };

        let mut radio = ble::Radio::new(self.handler.clone());
        while let Ok(command) = self.command_receiver.recv() {
            log::debug!("Transport command: {:?}", command);
            radio.execute(&rt, command);
        }
        radio.shutdown(&rt);
        log::info!("Sensor link: command channel closed, shutting down");
    }

    #[cfg(not(feature = "ble"))]
    pub fn run(self) {
        while let Ok(command) = self.command_receiver.recv() {
            log::debug!("Transport command: {:?}", command);
            match command {
                TransportCommand::StartScan => {
                    crate::device_scanner::report_unavailable(&self.handler)
                }
                TransportCommand::Connect(_) => self
                    .handler
                    .emit(LinkEvent::TransportError(ConnectionError::NoAdapter)),
                TransportCommand::StopScan | TransportCommand::Disconnect => {}
            }
        }
        log::info!("Sensor link: command channel closed, shutting down");
    }
}

#[cfg(feature = "ble")]
mod ble {
    use super::{Handler, LinkEvent, TransportCommand};
    use crate::device_scanner::scan_devices;
    use crate::error::{ConnectionError, ScanError};
    use crate::heart_rate::HEART_RATE_MEASUREMENT;
    use btleplug::api::bleuuid::uuid_from_u16;
    use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _};
    use btleplug::platform::{Adapter, Manager, Peripheral};
    use futures_util::{Stream, StreamExt};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio::task::JoinHandle;

    const SCAN_DURATION: Duration = Duration::from_secs(10);
    const LOOKUP_SCAN: Duration = Duration::from_secs(5);

    pub struct Radio {
        handler: Handler,
        central: Option<Adapter>,
        scan_task: Option<JoinHandle<()>>,
        link_task: Option<JoinHandle<()>>,
        peripheral: Option<Peripheral>,
    }

    impl Radio {
        pub fn new(handler: Handler) -> Self {
            Self {
                handler,
                central: None,
                scan_task: None,
                link_task: None,
                peripheral: None,
            }
        }

        fn central(&mut self, rt: &Runtime) -> Result<Adapter, ConnectionError> {
            if let Some(central) = &self.central {
                return Ok(central.clone());
            }
            let central = rt.block_on(async {
                let manager = Manager::new()
                    .await
                    .map_err(|e| map_btle_error(e, ConnectionError::NoAdapter))?;
                let adapters = manager
                    .adapters()
                    .await
                    .map_err(|e| map_btle_error(e, ConnectionError::NoAdapter))?;
                adapters.into_iter().next().ok_or(ConnectionError::NoAdapter)
            })?;
            self.central = Some(central.clone());
            Ok(central)
        }

        pub fn execute(&mut self, rt: &Runtime, command: TransportCommand) {
            match command {
                TransportCommand::StartScan => self.start_scan(rt),
                TransportCommand::StopScan => {
                    if let Some(task) = self.scan_task.take() {
                        task.abort();
                        if let Some(central) = &self.central {
                            let _ = rt.block_on(central.stop_scan());
                        }
                        self.handler.emit(LinkEvent::ScanStopped);
                    }
                }
                TransportCommand::Connect(address) => self.connect(rt, address),
                TransportCommand::Disconnect => self.disconnect(rt),
            }
        }

        fn start_scan(&mut self, rt: &Runtime) {
            let central = match self.central(rt) {
                Ok(central) => central,
                Err(ConnectionError::PermissionDenied) => {
                    self.handler
                        .emit(LinkEvent::ScanFailed(ScanError::PermissionDenied));
                    return;
                }
                Err(_) => {
                    self.handler.emit(LinkEvent::ScanFailed(ScanError::NoAdapters));
                    return;
                }
            };
            if let Some(task) = self.scan_task.take() {
                task.abort();
            }
            let handler = self.handler.clone();
            self.scan_task = Some(rt.spawn(async move {
                if let Err(e) = scan_devices(&central, SCAN_DURATION, &handler).await {
                    handler.emit(LinkEvent::ScanFailed(e));
                }
                handler.emit(LinkEvent::ScanStopped);
            }));
        }

        fn connect(&mut self, rt: &Runtime, address: String) {
            let central = match self.central(rt) {
                Ok(central) => central,
                Err(e) => {
                    self.handler.emit(LinkEvent::TransportError(e));
                    return;
                }
            };
            self.disconnect(rt);

            let handler = self.handler.clone();
            let peripheral = rt.block_on(find_peripheral(&central, &address));
            let peripheral = match peripheral {
                Some(peripheral) => peripheral,
                None => {
                    log::warn!("Device {} not found", address);
                    handler.emit(LinkEvent::LinkLost { address });
                    return;
                }
            };
            self.peripheral = Some(peripheral.clone());
            self.link_task = Some(rt.spawn(run_link(central, peripheral, address, handler)));
        }

        fn disconnect(&mut self, rt: &Runtime) {
            if let Some(task) = self.link_task.take() {
                task.abort();
            }
            if let Some(peripheral) = self.peripheral.take() {
                if let Err(e) = rt.block_on(peripheral.disconnect()) {
                    log::debug!("Disconnect failed: {}", e);
                }
            }
        }

        pub fn shutdown(&mut self, rt: &Runtime) {
            if let Some(task) = self.scan_task.take() {
                task.abort();
            }
            self.disconnect(rt);
        }
    }

    fn map_btle_error(error: btleplug::Error, fallback: ConnectionError) -> ConnectionError {
        match error {
            btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied,
            other => {
                log::debug!("Bluetooth error: {}", other);
                fallback
            }
        }
    }

    async fn find_peripheral(central: &Adapter, address: &str) -> Option<Peripheral> {
        let known = |peripherals: Vec<Peripheral>| {
            peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
        };
        if let Some(found) = central.peripherals().await.ok().and_then(known) {
            return Some(found);
        }

        // Not cached yet: a short scan lets the adapter see it advertise
        let _ = central.start_scan(Default::default()).await;
        tokio::time::sleep(LOOKUP_SCAN).await;
        let _ = central.stop_scan().await;
        central.peripherals().await.ok().and_then(known)
    }

    async fn run_link(central: Adapter, peripheral: Peripheral, address: String, handler: Handler) {
        // Subscribed before connecting so an early disconnect is not missed
        let mut central_events = match central.events().await {
            Ok(events) => Some(events),
            Err(e) => {
                log::warn!("Adapter events unavailable, relying on the notification stream: {}", e);
                None
            }
        };

        if let Err(e) = peripheral.connect().await {
            let error = ConnectionError::DeviceConnection {
                device_id: address.clone(),
                reason: e.to_string(),
            };
            log::warn!("{}", error);
            handler.emit(LinkEvent::LinkLost { address });
            return;
        }
        handler.emit(LinkEvent::LinkUp {
            address: address.clone(),
        });

        if let Err(e) = peripheral.discover_services().await {
            log::warn!("Service discovery failed on {}: {}", address, e);
            let _ = peripheral.disconnect().await;
            handler.emit(LinkEvent::LinkLost { address });
            return;
        }

        let measurement_uuid = uuid_from_u16(HEART_RATE_MEASUREMENT);
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == measurement_uuid);
        let characteristic = match characteristic {
            Some(characteristic) => characteristic,
            None => {
                let _ = peripheral.disconnect().await;
                handler.emit(LinkEvent::ServiceMissing { address });
                return;
            }
        };

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Could not open notification stream: {}", e);
                handler.emit(LinkEvent::LinkLost { address });
                return;
            }
        };
        if let Err(e) = peripheral.subscribe(&characteristic).await {
            log::warn!("Could not subscribe to heart rate notifications: {}", e);
            handler.emit(LinkEvent::LinkLost { address });
            return;
        }

        let name = match peripheral.properties().await {
            Ok(Some(props)) => props.local_name.unwrap_or_else(|| address.clone()),
            _ => address.clone(),
        };
        handler.emit(LinkEvent::ServiceVerified {
            address: address.clone(),
            name,
        });

        let peripheral_id = peripheral.id();
        let disconnected = async move {
            loop {
                match next_central_event(&mut central_events).await {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => return,
                    Some(_) => {}
                    None => {
                        log::debug!("Adapter event stream closed");
                        central_events = None;
                    }
                }
            }
        };
        let values = notifications.filter_map(move |notification| async move {
            (notification.uuid == measurement_uuid).then_some(notification.value)
        });

        forward_until_lost(values, disconnected, &address, &handler).await;
        handler.emit(LinkEvent::LinkLost { address });
    }

    /// Forwards heart rate payloads until the notification stream ends or
    /// `disconnected` resolves, whichever comes first. Some backends keep the
    /// stream open after the peripheral is gone.
    async fn forward_until_lost<N, D>(values: N, disconnected: D, address: &str, handler: &Handler)
    where
        N: Stream<Item = Vec<u8>>,
        D: Future<Output = ()>,
    {
        tokio::pin!(values);
        tokio::pin!(disconnected);
        loop {
            tokio::select! {
                value = values.next() => match value {
                    Some(data) => handler.notification(address.to_string(), data),
                    None => {
                        log::info!("Notification stream from {} ended", address);
                        return;
                    }
                },
                _ = &mut disconnected => {
                    log::info!("Adapter reported {} disconnected", address);
                    return;
                }
            }
        }
    }

    /// Next adapter event, or pending forever once the stream is gone.
    async fn next_central_event(
        events: &mut Option<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>,
    ) -> Option<CentralEvent> {
        match events {
            Some(stream) => stream.next().await,
            None => std::future::pending().await,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::session::SessionEvent;
        use crate::tick::Clock;
        use futures_util::stream;
        use std::sync::mpsc;

        fn notifications(rx: &mpsc::Receiver<SessionEvent>) -> Vec<Vec<u8>> {
            rx.try_iter()
                .filter_map(|event| match event {
                    SessionEvent::Link(LinkEvent::Notification { data, .. }) => Some(data),
                    _ => None,
                })
                .collect()
        }

        #[test]
        fn test_adapter_disconnect_ends_open_stream() {
            let rt = Runtime::new().unwrap();
            let (tx, rx) = mpsc::channel();
            let handler = Handler::new(tx, Clock::new());

            // The notification stream never closes on its own
            let values = stream::iter(vec![vec![0x00, 80]]).chain(stream::pending());
            let disconnected = tokio::time::sleep(Duration::from_millis(20));
            rt.block_on(async {
                tokio::time::timeout(
                    Duration::from_secs(2),
                    forward_until_lost(values, disconnected, "AA", &handler),
                )
                .await
                .expect("link loss was not detected");
            });
            assert_eq!(notifications(&rx), vec![vec![0x00, 80]]);
        }

        #[test]
        fn test_stream_end_is_link_loss() {
            let rt = Runtime::new().unwrap();
            let (tx, rx) = mpsc::channel();
            let handler = Handler::new(tx, Clock::new());

            let values = stream::iter(vec![vec![0x00, 70], vec![0x00, 72]]);
            rt.block_on(forward_until_lost(values, std::future::pending(), "AA", &handler));
            assert_eq!(notifications(&rx), vec![vec![0x00, 70], vec![0x00, 72]]);
        }
    }
}
