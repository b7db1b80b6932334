//! BLE transport backed by btleplug.
//!
//! The bootloader exposes one service with a single write/notify
//! characteristic. btleplug is async; the `Transport` trait is not, so the
//! transport owns a tokio runtime and blocks on it. Notifications are pumped
//! from the btleplug stream into a std channel by a task on that runtime.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use cydfu_core::protocol::{BOOTLOADER_SERVICE_UUID, DEFAULT_WRITE_FRAGMENT_LEN};
use cydfu_core::transport::{ChannelId, Notification, Transport, TransportError};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A peripheral seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(name) = &self.name {
            write!(f, "  {name}")?;
        }
        if let Some(rssi) = self.rssi {
            write!(f, "  ({rssi} dBm)")?;
        }
        Ok(())
    }
}

fn service_uuid() -> Result<Uuid, TransportError> {
    Uuid::parse_str(BOOTLOADER_SERVICE_UUID)
        .map_err(|e| TransportError::CharacteristicNotFound(e.to_string()))
}

fn runtime() -> Result<Runtime, TransportError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

async fn first_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new()
        .await
        .map_err(|e| TransportError::DeviceNotFound(format!("BLE manager: {e}")))?;
    manager
        .adapters()
        .await
        .map_err(|e| TransportError::DeviceNotFound(format!("BLE adapters: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::DeviceNotFound("no BLE adapter".into()))
}

/// Address used to identify a peripheral: the MAC where the platform has one.
async fn peripheral_address(peripheral: &Peripheral) -> String {
    match peripheral.properties().await {
        Ok(Some(props)) => props.address.to_string(),
        _ => peripheral.id().to_string(),
    }
}

/// Scan for `timeout` and return peripherals advertising the bootloader service.
pub fn scan(timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
    let rt = runtime()?;
    rt.block_on(async {
        let service = service_uuid()?;
        let adapter = first_adapter().await?;
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| TransportError::DeviceNotFound(format!("scan: {e}")))?;
        tokio::time::sleep(timeout).await;
        let _ = adapter.stop_scan().await;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::DeviceNotFound(format!("peripherals: {e}")))?;

        let mut found = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if !props.services.contains(&service) {
                continue;
            }
            found.push(DiscoveredDevice {
                address: props.address.to_string(),
                name: props.local_name,
                rssi: props.rssi,
            });
        }
        Ok(found)
    })
}

/// Connection to a bootloader over BLE.
pub struct BleTransport {
    runtime: Runtime,
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: Mutex<Receiver<Notification>>,
    max_write_len: usize,
}

impl BleTransport {
    /// Find `address` (scanning for up to `scan_timeout`), connect and enable
    /// notifications on the bootloader characteristic.
    pub fn connect(address: &str, scan_timeout: Duration) -> Result<Self, TransportError> {
        let runtime = runtime()?;
        let service = service_uuid()?;

        let (peripheral, characteristic) = runtime.block_on(async {
            let adapter = first_adapter().await?;
            let peripheral = find_peripheral(&adapter, address, scan_timeout).await?;

            info!(address, "Connecting");
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            peripheral
                .discover_services()
                .await
                .map_err(|e| TransportError::ConnectFailed(format!("service discovery: {e}")))?;

            let characteristic = peripheral
                .services()
                .into_iter()
                .find(|s| s.uuid == service)
                .and_then(|s| s.characteristics.into_iter().next())
                .ok_or_else(|| {
                    TransportError::CharacteristicNotFound(format!(
                        "bootloader service {service} not present"
                    ))
                })?;
            debug!(uuid = %characteristic.uuid, "DFU characteristic");

            peripheral
                .subscribe(&characteristic)
                .await
                .map_err(|e| TransportError::NotifyFailed(e.to_string()))?;

            Ok::<_, TransportError>((peripheral, characteristic))
        })?;

        let mut stream = runtime
            .block_on(peripheral.notifications())
            .map_err(|e| TransportError::NotifyFailed(e.to_string()))?;
        let (tx, rx) = mpsc::channel();
        runtime.spawn(async move {
            while let Some(n) = stream.next().await {
                let notification = Notification::new(ChannelId(n.uuid.as_u128()), n.value);
                if tx.send(notification).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            runtime,
            peripheral,
            characteristic,
            notifications: Mutex::new(rx),
            max_write_len: DEFAULT_WRITE_FRAGMENT_LEN,
        })
    }

    /// Raise the fragment size when the link negotiated a larger MTU.
    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len.max(1);
        self
    }
}

async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    timeout: Duration,
) -> Result<Peripheral, TransportError> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| TransportError::DeviceNotFound(format!("scan: {e}")))?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::DeviceNotFound(format!("peripherals: {e}")))?;
        let mut hit = None;
        for peripheral in peripherals {
            if peripheral_address(&peripheral).await.eq_ignore_ascii_case(address)
                || peripheral.id().to_string().eq_ignore_ascii_case(address)
            {
                hit = Some(peripheral);
                break;
            }
        }
        if hit.is_some() || Instant::now() >= deadline {
            break hit;
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    };

    let _ = adapter.stop_scan().await;
    found.ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))
}

impl Transport for BleTransport {
    fn write(&self, fragment: &[u8]) -> Result<(), TransportError> {
        self.runtime
            .block_on(self.peripheral.write(
                &self.characteristic,
                fragment,
                WriteType::WithoutResponse,
            ))
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    fn recv_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        let rx = self
            .notifications
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(notification) => Ok(Some(notification)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn channel(&self) -> ChannelId {
        ChannelId(self.characteristic.uuid.as_u128())
    }

    fn is_connected(&self) -> bool {
        self.runtime
            .block_on(self.peripheral.is_connected())
            .unwrap_or(false)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.block_on(self.peripheral.disconnect()) {
            warn!("Disconnect failed: {}", e);
        }
    }
}
