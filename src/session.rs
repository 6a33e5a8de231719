//! Session Orchestrator: connect, optionally trigger Buttonless DFU,
//! enable notifications, configure PRN, run both image drivers in order,
//! then disconnect. The only entry point most callers need.

use crate::control::ControlDialog;
use crate::error::{DfuError, Result};
use crate::events::EventSink;
use crate::image;
use crate::serializer::WriteSerializer;
use crate::smart_speed::SmartSpeedConfig;
use crate::state::ImageKind;
use crate::transfer::{CrcFn, TransferContext, default_crc};
use crate::transport::{CharacteristicKind, DfuTransport};

use std::sync::Arc;
use std::time::Duration;

const POST_INIT_PAUSE: Duration = Duration::from_millis(500);
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
const BUTTONLESS_ACK: [u8; 3] = [0x20, 0x01, 0x01];

/// Every tunable knob the engine exposes: CRC override, per-packet delay,
/// packet size, PRN interval, force-restart, and the Smart Speed policy.
#[derive(Clone)]
pub struct DfuConfig {
    /// Bytes written to the Packet characteristic per write. Conservative
    /// default (20) works over the minimum negotiated BLE ATT MTU; raise
    /// it once the link's MTU is known to be larger.
    pub packet_size: usize,
    /// PRN interval in packets; `0` disables Packet Receipt Notifications.
    pub prn_interval: u16,
    /// Delay applied after each packet write.
    pub delay: Duration,
    /// Delay applied after every successful control response.
    pub response_delay: Duration,
    /// If the device reports a nonzero resume offset, restart the image
    /// from byte 0 instead of resuming.
    pub force_restart: bool,
    pub smart_speed: SmartSpeedConfig,
    /// Injectable CRC-32 implementation; defaults to CRC-32/IEEE 802.3.
    pub crc: CrcFn,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            packet_size: 20,
            prn_interval: 0,
            delay: Duration::ZERO,
            response_delay: Duration::ZERO,
            force_restart: false,
            smart_speed: SmartSpeedConfig::default(),
            crc: default_crc(),
        }
    }
}

/// Drives one Secure DFU update over a connected [`DfuTransport`]. Not
/// safe for concurrent `update` calls on the same instance: pending
/// control responses are keyed only by opcode byte, which assumes images
/// are uploaded strictly sequentially.
pub struct DfuDriver<T: DfuTransport + 'static> {
    transport: Arc<T>,
    serializer: Arc<WriteSerializer>,
    events: Arc<EventSink>,
    config: DfuConfig,
}

impl<T: DfuTransport + 'static> DfuDriver<T> {
    pub fn new(transport: T, config: DfuConfig) -> Self {
        Self { transport: Arc::new(transport), serializer: Arc::new(WriteSerializer::new()), events: Arc::new(EventSink::new()), config }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Trigger Buttonless DFU: ask an application-mode device to reboot
    /// into the bootloader. If the device has no Buttonless characteristic
    /// but already exposes Control and Packet, it is already in DFU mode
    /// and this is a no-op.
    pub async fn enter_dfu_mode(&self) -> Result<()> {
        let characteristics = self.transport.characteristics();
        if characteristics.buttonless {
            self.transport.subscribe(CharacteristicKind::Buttonless).await.map_err(DfuError::Transport)?;
            self.transport.write(CharacteristicKind::Buttonless, &[0x01]).await.map_err(DfuError::Transport)?;
            self.events.log("buttonless DFU triggered, waiting for device to reboot");
            match self.transport.next_notification().await {
                Some((CharacteristicKind::Buttonless, bytes)) if bytes == BUTTONLESS_ACK => Ok(()),
                Some((CharacteristicKind::Buttonless, bytes)) => {
                    Err(DfuError::ProtocolViolation(format!("unexpected buttonless response: {bytes:?}")))
                }
                _ => Err(DfuError::Disconnected),
            }
        } else if characteristics.has_dfu_mode_characteristics() {
            Ok(())
        } else {
            Err(DfuError::UnsupportedDevice)
        }
    }

    /// Run the full update: init packet, then firmware image, then
    /// disconnect. `init`/`firmware` are the raw `.dat`/`.bin` bytes for
    /// one component, as returned by [`crate::package::FirmwarePackage::get_image`].
    pub async fn update(&self, init: &[u8], firmware: &[u8]) -> Result<()> {
        if !self.transport.characteristics().has_dfu_mode_characteristics() {
            return Err(DfuError::MissingCharacteristics);
        }

        self.serializer.reconnect();
        self.transport.subscribe(CharacteristicKind::Control).await.map_err(DfuError::Transport)?;

        let dialog = ControlDialog::new(self.transport.clone(), self.serializer.clone(), self.events.clone(), self.config.response_delay);

        if self.config.prn_interval > 0 {
            dialog.set_prn(self.config.prn_interval).await?;
            self.events.log(format!("configured PRN interval: {}", self.config.prn_interval));
        }

        let ctx = TransferContext {
            dialog: &dialog,
            serializer: &self.serializer,
            transport: self.transport.as_ref(),
            events: &self.events,
            crc: &self.config.crc,
            delay: self.config.delay,
        };

        let result = self.run_both_images(&ctx, init, firmware).await;

        let disconnect = self.transport.disconnect();
        if tokio::time::timeout(DISCONNECT_TIMEOUT, disconnect).await.is_err() {
            self.events.log("timed out waiting for disconnect, proceeding anyway");
        }
        self.serializer.mark_disconnected();

        result
    }

    async fn run_both_images(&self, ctx: &TransferContext<'_, T>, init: &[u8], firmware: &[u8]) -> Result<()> {
        image::run_image(
            ctx,
            init,
            ImageKind::Init,
            self.config.force_restart,
            self.config.packet_size,
            self.config.prn_interval,
            &self.config.smart_speed,
        )
        .await?;

        tokio::time::sleep(POST_INIT_PAUSE).await;

        image::run_image(
            ctx,
            firmware,
            ImageKind::Firmware,
            self.config.force_restart,
            self.config.packet_size,
            self.config.prn_interval,
            &self.config.smart_speed,
        )
        .await
    }
}
