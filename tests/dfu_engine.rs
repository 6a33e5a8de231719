//! End-to-end coverage of the Control Dialog, Object Transfer Engine, Image
//! Driver, Smart Speed Controller and Session Orchestrator, driven against
//! an in-memory bootloader simulator rather than a real BLE peer.

use anyhow::{anyhow, Result as AnyResult};
use nrfdfu_ble::transport::{CharacteristicKind, CharacteristicSet, DfuTransport};
use nrfdfu_ble::{DfuConfig, DfuDriver, Event};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

/// `1` addresses the Init (Command) object, `2` addresses the Firmware
/// (Data) object; matches the sub-opcode bytes `control::ControlRequest`
/// actually puts on the wire.
const INIT_KIND: u8 = 1;
const FIRMWARE_KIND: u8 = 2;

#[derive(Default)]
struct ObjectFlash {
    committed: Vec<u8>,
}

struct Inner {
    flash: HashMap<u8, ObjectFlash>,
    pending: Vec<u8>,
    current_kind: Option<u8>,
    max_object_size: u32,
    create_calls: u32,
    packet_writes: u32,

    busy_every: Option<u32>,
    mtu: Option<usize>,
    crc_mismatches_remaining: u32,
    fail_every_create: Option<u8>,
}

/// Shared state behind a [`MockTransport`], kept alive past the point the
/// transport itself is moved into a `DfuDriver` so tests can both drive
/// failure injection and inspect the resulting "flash" afterwards.
pub struct Shared {
    inner: Mutex<Inner>,
    tx: mpsc::UnboundedSender<(CharacteristicKind, Vec<u8>)>,
    rx: Mutex<mpsc::UnboundedReceiver<(CharacteristicKind, Vec<u8>)>>,
    write_in_flight: AtomicBool,
    characteristics: CharacteristicSet,
}

impl Shared {
    fn new(max_object_size: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(Inner {
                flash: HashMap::new(),
                pending: Vec::new(),
                current_kind: None,
                max_object_size,
                create_calls: 0,
                packet_writes: 0,
                busy_every: None,
                mtu: None,
                crc_mismatches_remaining: 0,
                fail_every_create: None,
            }),
            tx,
            rx: Mutex::new(rx),
            write_in_flight: AtomicBool::new(false),
            characteristics: CharacteristicSet { control: true, packet: true, buttonless: false },
        }
    }

    async fn seed_flash(&self, kind: u8, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.flash.entry(kind).or_default().committed = bytes.to_vec();
    }

    async fn set_busy_every(&self, every: u32) {
        self.inner.lock().await.busy_every = Some(every);
    }

    async fn set_mtu(&self, mtu: usize) {
        self.inner.lock().await.mtu = Some(mtu);
    }

    async fn set_crc_mismatches(&self, count: u32) {
        self.inner.lock().await.crc_mismatches_remaining = count;
    }

    async fn fail_every_create_with(&self, extended_code: u8) {
        self.inner.lock().await.fail_every_create = Some(extended_code);
    }

    async fn flash_of(&self, kind: u8) -> Vec<u8> {
        self.inner.lock().await.flash.entry(kind).or_default().committed.clone()
    }

    async fn create_calls(&self) -> u32 {
        self.inner.lock().await.create_calls
    }

    async fn handle_control(&self, bytes: &[u8]) -> AnyResult<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        match bytes[0] {
            0x01 => {
                let sub = bytes[1];
                inner.create_calls += 1;
                if let Some(code) = inner.fail_every_create {
                    return Ok(vec![0x60, 0x01, 0x0B, code]);
                }
                inner.current_kind = Some(sub);
                inner.pending.clear();
                Ok(vec![0x60, 0x01, 0x01])
            }
            0x02 => Ok(vec![0x60, 0x02, 0x01]),
            0x03 => {
                let kind = inner.current_kind.expect("CALCULATE_CHECKSUM without a prior CREATE");
                let committed = inner.flash.entry(kind).or_default().committed.clone();
                let mut so_far = committed;
                so_far.extend_from_slice(&inner.pending);
                let offset = so_far.len() as u32;
                let mut crc = crc32fast::hash(&so_far) as i32;
                if inner.crc_mismatches_remaining > 0 {
                    inner.crc_mismatches_remaining -= 1;
                    crc = crc.wrapping_add(1);
                }
                let mut payload = vec![0x60, 0x03, 0x01];
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                Ok(payload)
            }
            0x04 => {
                let kind = inner.current_kind.expect("EXECUTE without a prior CREATE");
                let pending = std::mem::take(&mut inner.pending);
                inner.flash.entry(kind).or_default().committed.extend_from_slice(&pending);
                Ok(vec![0x60, 0x04, 0x01])
            }
            0x06 => {
                let sub = bytes[1];
                let committed = inner.flash.entry(sub).or_default().committed.clone();
                let max_size = inner.max_object_size;
                let offset = committed.len() as u32;
                let crc = crc32fast::hash(&committed) as i32;
                let mut payload = vec![0x60, 0x06, 0x01];
                payload.extend_from_slice(&max_size.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                Ok(payload)
            }
            other => Err(anyhow!("mock does not implement opcode 0x{other:02X}")),
        }
    }

    async fn write(&self, characteristic: CharacteristicKind, bytes: &[u8]) -> AnyResult<()> {
        match characteristic {
            CharacteristicKind::Control => {
                let response = self.handle_control(bytes).await?;
                let _ = self.tx.send((CharacteristicKind::Control, response));
                Ok(())
            }
            CharacteristicKind::Packet => {
                let mut inner = self.inner.lock().await;
                if let Some(mtu) = inner.mtu {
                    if bytes.len() > mtu {
                        return Err(anyhow!("write failed: value too long; longer than maximum length"));
                    }
                }
                inner.packet_writes += 1;
                if let Some(every) = inner.busy_every {
                    if every > 0 && inner.packet_writes % every == 0 {
                        return Err(anyhow!("GATT write failed: operation in progress"));
                    }
                }
                inner.current_kind.expect("packet write without a prior CREATE");
                inner.pending.extend_from_slice(bytes);
                // The mock never emits spontaneous PRN notifications; any
                // `wait_for_prn` call here times out and the engine proceeds
                // without flow control, which is itself a documented path.
                Ok(())
            }
            CharacteristicKind::Buttonless => Ok(()),
        }
    }
}

/// A bootloader simulator standing in for a real BLE peer: answers Control
/// opcodes with the same wire responses a device would, and accumulates
/// Packet writes into per-object flash. Deliberately hand-rolled (no mock
/// framework in the dependency stack) to match the rest of the suite.
pub struct MockTransport(Arc<Shared>);

impl MockTransport {
    fn paired(max_object_size: u32) -> (Self, Arc<Shared>) {
        let shared = Arc::new(Shared::new(max_object_size));
        (MockTransport(shared.clone()), shared)
    }
}

impl DfuTransport for MockTransport {
    fn is_connected(&self) -> bool {
        true
    }

    fn characteristics(&self) -> CharacteristicSet {
        self.0.characteristics
    }

    async fn write(&self, characteristic: CharacteristicKind, bytes: &[u8]) -> AnyResult<()> {
        if self.0.write_in_flight.swap(true, Ordering::SeqCst) {
            panic!("WriteSerializer allowed two overlapping writes");
        }
        let result = self.0.write(characteristic, bytes).await;
        self.0.write_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn subscribe(&self, _characteristic: CharacteristicKind) -> AnyResult<()> {
        Ok(())
    }

    async fn next_notification(&self) -> Option<(CharacteristicKind, Vec<u8>)> {
        self.0.rx.lock().await.recv().await
    }

    async fn disconnect(&self) -> AnyResult<()> {
        Ok(())
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

fn log_lines(events: &StdMutex<Vec<String>>) -> Vec<String> {
    events.lock().unwrap().clone()
}

fn driver_with_logs(transport: MockTransport, config: DfuConfig) -> (DfuDriver<MockTransport>, Arc<StdMutex<Vec<String>>>) {
    let driver = DfuDriver::new(transport, config);
    let log = Arc::new(StdMutex::new(Vec::new()));
    let sink = log.clone();
    driver.events().on(move |event| {
        if let Event::Log { message } = event {
            sink.lock().unwrap().push(message.clone());
        }
    });
    (driver, log)
}

#[tokio::test]
async fn happy_path_uploads_init_and_firmware() {
    let (transport, shared) = MockTransport::paired(4096);
    let init = pattern(64);
    let firmware = pattern(8192);

    let config = DfuConfig { packet_size: 244, ..DfuConfig::default() };
    let (driver, _log) = driver_with_logs(transport, config);

    driver.update(&init, &firmware).await.unwrap();

    assert_eq!(shared.flash_of(INIT_KIND).await, init);
    assert_eq!(shared.flash_of(FIRMWARE_KIND).await, firmware);
}

#[tokio::test]
async fn already_present_init_packet_is_skipped() {
    let (transport, shared) = MockTransport::paired(4096);
    let init = pattern(32);
    let firmware = pattern(512);
    shared.seed_flash(INIT_KIND, &init).await;

    let config = DfuConfig { packet_size: 64, ..DfuConfig::default() };
    let (driver, log) = driver_with_logs(transport, config);

    driver.update(&init, &firmware).await.unwrap();

    assert!(log_lines(&log).iter().any(|line| line.contains("already available, skipping")));
    assert_eq!(shared.flash_of(FIRMWARE_KIND).await, firmware);
    // Only the firmware image's single window should ever have reached CREATE.
    assert_eq!(shared.create_calls().await, 512usize.div_ceil(4096) as u32);
}

#[tokio::test]
async fn transient_busy_writes_are_retried_transparently() {
    let (transport, shared) = MockTransport::paired(4096);
    shared.set_busy_every(10).await;
    let firmware = pattern(2048);

    let config = DfuConfig { packet_size: 32, ..DfuConfig::default() };
    let (driver, _log) = driver_with_logs(transport, config);

    driver.update(&[], &firmware).await.unwrap();

    assert_eq!(shared.flash_of(FIRMWARE_KIND).await, firmware);
}

#[tokio::test]
async fn oversized_packet_write_eventually_fails_once_degrading_cannot_help() {
    // The MTU floor (10 bytes) sits below Smart Speed's packet-size floor
    // (20 bytes), so no amount of retrying or degrading can ever produce a
    // write the mock peer will accept; the failure must still surface.
    let (transport, shared) = MockTransport::paired(4096);
    shared.set_mtu(10).await;
    let firmware = pattern(64);

    let config = DfuConfig { packet_size: 25, ..DfuConfig::default() };
    let (driver, _log) = driver_with_logs(transport, config);

    let err = driver.update(&[], &firmware).await.unwrap_err();
    assert!(err.to_string().contains("longer than maximum length"));
}

#[tokio::test(start_paused = true)]
async fn smart_speed_degrades_packet_size_before_prn() {
    // Window size is an exact multiple of packet_size * prn_interval so the
    // four induced-failure attempts never cross a PRN threshold mid-window
    // (only the post-degrade attempt, at the smaller packet size, does).
    let (transport, shared) = MockTransport::paired(1000);
    shared.set_crc_mismatches(4).await;
    let firmware = pattern(1000);

    let config = DfuConfig { packet_size: 100, prn_interval: 10, ..DfuConfig::default() };
    let (driver, log) = driver_with_logs(transport, config);

    driver.update(&[], &firmware).await.unwrap();

    assert_eq!(shared.flash_of(FIRMWARE_KIND).await, firmware);
    let lines = log_lines(&log);
    assert!(lines.iter().any(|line| line.contains("packetSize 100 -> 50")));
}

#[tokio::test(start_paused = true)]
async fn smart_speed_degrades_prn_once_packet_size_floors_out() {
    let (transport, shared) = MockTransport::paired(200);
    shared.set_crc_mismatches(4).await;
    let firmware = pattern(200);

    let config = DfuConfig { packet_size: 20, prn_interval: 10, ..DfuConfig::default() };
    let (driver, log) = driver_with_logs(transport, config);

    driver.update(&[], &firmware).await.unwrap();

    assert_eq!(shared.flash_of(FIRMWARE_KIND).await, firmware);
    let lines = log_lines(&log);
    assert!(lines.iter().any(|line| line.contains("prn 10 -> 5")));
}

#[tokio::test]
async fn device_rejection_surfaces_after_exhausting_retry_and_degrade_budget() {
    let (transport, shared) = MockTransport::paired(4096);
    shared.fail_every_create_with(0x05).await;
    let firmware = pattern(1024);

    let config = DfuConfig { packet_size: 20, prn_interval: 0, ..DfuConfig::default() };
    let (driver, _log) = driver_with_logs(transport, config);

    let err = driver.update(&[], &firmware).await.unwrap_err();
    assert!(err.to_string().contains("Firmware version failure"));
}
