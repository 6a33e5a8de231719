//! `btleplug`-backed implementation of [`crate::transport::DfuTransport`].

use crate::transport::{CharacteristicKind, CharacteristicSet, DfuTransport, DfuTransportManager, dfu_uuids};

use anyhow::{Result, anyhow};
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::Adapter;
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc;

async fn find_peripheral<P>(central: &Adapter, predicate: P) -> Result<Peripheral>
where
    P: Fn(PeripheralProperties) -> bool,
{
    central.start_scan(ScanFilter::default()).await?;
    let mut events = central.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            if let Some(properties) = peripheral.properties().await? {
                if predicate(properties) {
                    central.stop_scan().await?;
                    return Ok(peripheral);
                }
            }
        }
    }
    Err(anyhow!("Scanning stopped unexpectedly"))
}

fn print_peripheral_properties(properties: &PeripheralProperties) {
    let name = properties.local_name.as_deref().unwrap_or("None");
    let addr = properties.address;
    let rssi = properties.rssi.unwrap_or(-99);
    log::trace!("rssi: {}, address: {}, name: {: <32}", rssi, addr, name);
}

#[cfg(target_os = "macos")]
async fn find_peripheral_by_address(_central: &Adapter, _addr: &BDAddr) -> Result<Peripheral> {
    Err(anyhow!("BLE MAC addresses are not supported on macOS"))
}

#[cfg(not(target_os = "macos"))]
async fn find_peripheral_by_address(central: &Adapter, addr: &BDAddr) -> Result<Peripheral> {
    log::debug!("searching for {} by address...", addr);
    find_peripheral(central, |props| {
        print_peripheral_properties(&props);
        props.address_type.is_some() && props.address.eq(addr)
    })
    .await
}

async fn find_peripheral_by_name(central: &Adapter, name: &str) -> Result<Peripheral> {
    log::debug!("searching for {} by name...", name);
    find_peripheral(central, |props| {
        print_peripheral_properties(&props);
        props.local_name.is_some() && props.local_name.unwrap().eq(name)
    })
    .await
}

fn kind_uuid(kind: CharacteristicKind) -> uuid::Uuid {
    match kind {
        CharacteristicKind::Control => dfu_uuids::CTRL_PT,
        CharacteristicKind::Packet => dfu_uuids::DATA_PT,
        CharacteristicKind::Buttonless => dfu_uuids::BTTNLSS,
    }
}

fn uuid_kind(uuid: uuid::Uuid) -> Option<CharacteristicKind> {
    match uuid {
        u if u == dfu_uuids::CTRL_PT => Some(CharacteristicKind::Control),
        u if u == dfu_uuids::DATA_PT => Some(CharacteristicKind::Packet),
        u if u == dfu_uuids::BTTNLSS => Some(CharacteristicKind::Buttonless),
        _ => None,
    }
}

/// Connects to a named/addressed BLE peripheral and classifies its
/// characteristics against the Secure DFU service UUIDs.
pub struct DfuTransportManagerBtleplug;

impl DfuTransportManager for DfuTransportManagerBtleplug {
    type Transport = DfuTransportBtleplug;

    async fn connect(&self, target: &str) -> Result<Self::Transport> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters.into_iter().next().ok_or_else(|| anyhow!("no BLE adapter available"))?;

        let peripheral = if let Ok(addr) = BDAddr::from_str(target) {
            find_peripheral_by_address(&central, &addr).await?
        } else {
            find_peripheral_by_name(&central, target).await?
        };

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        DfuTransportBtleplug::new(peripheral).await
    }
}

/// A connected peer, with Control/Packet/Buttonless characteristics
/// classified by UUID and notifications forwarded onto an internal
/// channel tagged by [`CharacteristicKind`].
pub struct DfuTransportBtleplug {
    peripheral: Peripheral,
    control: Option<Characteristic>,
    packet: Option<Characteristic>,
    buttonless: Option<Characteristic>,
    connected: Arc<AtomicBool>,
    notifications: Mutex<mpsc::UnboundedReceiver<(CharacteristicKind, Vec<u8>)>>,
}

impl DfuTransportBtleplug {
    async fn new(peripheral: Peripheral) -> Result<Self> {
        let mut control = None;
        let mut packet = None;
        let mut buttonless = None;
        for characteristic in peripheral.characteristics() {
            match uuid_kind(characteristic.uuid) {
                Some(CharacteristicKind::Control) => control = Some(characteristic),
                Some(CharacteristicKind::Packet) => packet = Some(characteristic),
                Some(CharacteristicKind::Buttonless) => buttonless = Some(characteristic),
                None => {}
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut notification_stream = peripheral.notifications().await?;
        let forward_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(notification) = notification_stream.next().await {
                if let Some(kind) = uuid_kind(notification.uuid) {
                    if tx.send((kind, notification.value)).is_err() {
                        break;
                    }
                }
            }
            forward_connected.store(false, Ordering::SeqCst);
        });

        Ok(Self { peripheral, control, packet, buttonless, connected, notifications: Mutex::new(rx) })
    }

    fn characteristic(&self, kind: CharacteristicKind) -> Result<&Characteristic> {
        match kind {
            CharacteristicKind::Control => self.control.as_ref(),
            CharacteristicKind::Packet => self.packet.as_ref(),
            CharacteristicKind::Buttonless => self.buttonless.as_ref(),
        }
        .ok_or_else(|| anyhow!("characteristic not found"))
    }
}

impl DfuTransport for DfuTransportBtleplug {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn characteristics(&self) -> CharacteristicSet {
        CharacteristicSet {
            control: self.control.is_some(),
            packet: self.packet.is_some(),
            buttonless: self.buttonless.is_some(),
        }
    }

    async fn write(&self, characteristic: CharacteristicKind, bytes: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = match characteristic.properties.contains(btleplug::api::CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            true => WriteType::WithoutResponse,
            false => WriteType::WithResponse,
        };
        self.peripheral.write(characteristic, bytes, write_type).await.map_err(|e| anyhow!(e))
    }

    async fn subscribe(&self, characteristic: CharacteristicKind) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    async fn next_notification(&self) -> Option<(CharacteristicKind, Vec<u8>)> {
        let mut notifications = self.notifications.lock().await;
        notifications.recv().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
