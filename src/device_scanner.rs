use crate::sensor::{Handler, LinkEvent};

#[cfg(feature = "ble")]
use crate::error::ScanError;
#[cfg(feature = "ble")]
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: String,
}

impl BluetoothDevice {
    pub fn new(address: String, name: String) -> Self {
        Self { address, name }
    }
}

/// Scan results de-duplicated by hardware address. Devices without a
/// readable name are never surfaced.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredDevices {
    devices: Vec<BluetoothDevice>,
}

impl DiscoveredDevices {
    /// Returns true when the visible list changed.
    pub fn observe(&mut self, address: &str, name: Option<&str>) -> bool {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => return false,
        };

        match self.devices.iter_mut().find(|d| d.address == address) {
            Some(existing) if existing.name == name => false,
            Some(existing) => {
                existing.name = name.to_string();
                true
            }
            None => {
                log::debug!("Discovered {} ({})", name, address);
                self.devices
                    .push(BluetoothDevice::new(address.to_string(), name.to_string()));
                true
            }
        }
    }

    pub fn devices(&self) -> &[BluetoothDevice] {
        &self.devices
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

/// Scans for heart rate peripherals for `duration`, reporting each
/// advertisement as it arrives.
#[cfg(feature = "ble")]
pub async fn scan_devices(
    central: &btleplug::platform::Adapter,
    duration: Duration,
    handler: &Handler,
) -> Result<(), ScanError> {
    use btleplug::api::bleuuid::uuid_from_u16;
    use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
    use futures_util::StreamExt;

    let mut events = central
        .events()
        .await
        .map_err(|e| ScanError::ScanFailed(e.to_string()))?;

    let filter = ScanFilter {
        services: vec![uuid_from_u16(crate::heart_rate::HEART_RATE_SERVICE)],
    };
    central.start_scan(filter).await.map_err(|e| match e {
        btleplug::Error::PermissionDenied => ScanError::PermissionDenied,
        other => ScanError::ScanFailed(other.to_string()),
    })?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    if let Ok(peripheral) = central.peripheral(&id).await {
                        if let Ok(Some(props)) = peripheral.properties().await {
                            handler.emit(LinkEvent::DeviceDiscovered {
                                address: peripheral.address().to_string(),
                                name: props.local_name,
                            });
                        }
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    if let Err(e) = central.stop_scan().await {
        log::warn!("Failed to stop scan: {}", e);
    }
    Ok(())
}

/// Without a radio backend every scan reports a missing adapter.
#[cfg(not(feature = "ble"))]
pub fn report_unavailable(handler: &Handler) {
    handler.emit(LinkEvent::ScanFailed(crate::error::ScanError::NoAdapters));
    handler.emit(LinkEvent::ScanStopped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_by_address() {
        let mut found = DiscoveredDevices::default();
        assert!(found.observe("AA", Some("Strap")));
        assert!(!found.observe("AA", Some("Strap")));
        assert!(found.observe("BB", Some("Watch")));
        assert_eq!(found.devices().len(), 2);
    }

    #[test]
    fn test_unnamed_devices_are_hidden() {
        let mut found = DiscoveredDevices::default();
        assert!(!found.observe("AA", None));
        assert!(!found.observe("BB", Some("  ")));
        assert!(found.devices().is_empty());
    }

    #[test]
    fn test_name_refresh_keeps_single_entry() {
        let mut found = DiscoveredDevices::default();
        found.observe("AA", Some("HRM"));
        assert!(found.observe("AA", Some("HRM Pro")));
        assert_eq!(found.devices().len(), 1);
        assert_eq!(found.devices()[0].name, "HRM Pro");

        found.clear();
        assert!(found.devices().is_empty());
    }
}
