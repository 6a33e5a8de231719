//! Control Dialog: sends control opcodes and correlates them to the next
//! notification with a matching response opcode. Owns the single
//! notification handler attached to the Control characteristic, modeled
//! as a background task forwarding tagged notifications onto internal
//! channels rather than re-entering from the transport's own callback.

use crate::error::{DfuError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::serializer::WriteSerializer;
use crate::state::ImageKind;
use crate::transport::{CharacteristicKind, DfuTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// One control request, as a closed tagged variant rather than a raw
/// opcode byte. Keeps the single-waiter-per-opcode-byte invariant
/// explicit at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    CreateCommand(u32),
    CreateData(u32),
    SetPrn(u16),
    CalculateChecksum,
    Execute,
    SelectCommand,
    SelectData,
}

impl ControlRequest {
    fn opcode_byte(self) -> u8 {
        match self {
            ControlRequest::CreateCommand(_) | ControlRequest::CreateData(_) => 0x01,
            ControlRequest::SetPrn(_) => 0x02,
            ControlRequest::CalculateChecksum => 0x03,
            ControlRequest::Execute => 0x04,
            ControlRequest::SelectCommand | ControlRequest::SelectData => 0x06,
        }
    }

    fn encode(self) -> Vec<u8> {
        match self {
            ControlRequest::CreateCommand(size) => {
                let mut buf = vec![0x01, 0x01];
                buf.extend_from_slice(&size.to_le_bytes());
                buf
            }
            ControlRequest::CreateData(size) => {
                let mut buf = vec![0x01, 0x02];
                buf.extend_from_slice(&size.to_le_bytes());
                buf
            }
            ControlRequest::SetPrn(interval) => {
                let mut buf = vec![0x02];
                buf.extend_from_slice(&interval.to_le_bytes());
                buf
            }
            ControlRequest::CalculateChecksum => vec![0x03],
            ControlRequest::Execute => vec![0x04],
            ControlRequest::SelectCommand => vec![0x06, 0x01],
            ControlRequest::SelectData => vec![0x06, 0x02],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResponse {
    pub offset: u32,
    pub crc: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectResponse {
    pub max_size: u32,
    pub offset: u32,
    pub crc: i32,
}

fn describe_result(code: u8) -> &'static str {
    match code {
        0x00 => "invalid opcode",
        0x02 => "opcode not supported",
        0x03 => "invalid parameter",
        0x04 => "out of memory",
        0x05 => "invalid object",
        0x07 => "invalid type",
        0x08 => "wrong state",
        0x0A => "operation failed",
        0x0B => "extended error",
        _ => "unknown error",
    }
}

fn describe_extended(code: u8) -> &'static str {
    match code {
        0x00 => "no error",
        0x01 => "invalid error code",
        0x02 => "wrong command format",
        0x03 => "unknown command",
        0x04 => "init command invalid",
        0x05 => "Firmware version failure",
        0x06 => "hardware version failure",
        0x07 => "softdevice version failure",
        0x08 => "signature missing",
        0x09 => "wrong hash type",
        0x0A => "hash failed",
        0x0B => "wrong signature type",
        0x0C => "CRC mismatch",
        0x0D => "insufficient space",
        _ => "unknown extended error",
    }
}

type PendingMap = Mutex<HashMap<u8, oneshot::Sender<Result<Vec<u8>>>>>;
type PrnWaiter = Mutex<Option<oneshot::Sender<u32>>>;

/// The minimum the notification pump needs to turn a spontaneous PRN
/// notification into a [`ProgressEvent`]: which image is in flight, its
/// total size, and how much of it has been sent so far. Kept up to date
/// by [`crate::transfer::transfer_window`] via [`ControlDialog::set_progress_context`].
#[derive(Debug, Clone, Copy)]
struct ProgressContext {
    kind: ImageKind,
    total_bytes: u32,
    sent_bytes: u32,
}

type ProgressContextCell = StdMutex<Option<ProgressContext>>;

/// Sends control opcodes on the Control characteristic and correlates each
/// to its response notification. Runs one background pump task for the
/// lifetime of a connection; dropping the dialog stops the pump.
pub struct ControlDialog<T: DfuTransport + 'static> {
    transport: Arc<T>,
    serializer: Arc<WriteSerializer>,
    pending: Arc<PendingMap>,
    prn_waiter: Arc<PrnWaiter>,
    last_validated_bytes: Arc<AtomicU32>,
    progress_context: Arc<ProgressContextCell>,
    response_delay: Duration,
    pump: JoinHandle<()>,
}

impl<T: DfuTransport + 'static> ControlDialog<T> {
    pub fn new(transport: Arc<T>, serializer: Arc<WriteSerializer>, events: Arc<EventSink>, response_delay: Duration) -> Self {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let prn_waiter: Arc<PrnWaiter> = Arc::new(Mutex::new(None));
        let last_validated_bytes = Arc::new(AtomicU32::new(0));
        let progress_context: Arc<ProgressContextCell> = Arc::new(StdMutex::new(None));

        let pump = {
            let transport = transport.clone();
            let pending = pending.clone();
            let prn_waiter = prn_waiter.clone();
            let last_validated_bytes = last_validated_bytes.clone();
            let progress_context = progress_context.clone();
            tokio::spawn(async move {
                loop {
                    match transport.next_notification().await {
                        Some((CharacteristicKind::Control, bytes)) => {
                            if let Err(e) =
                                handle_notification(bytes, &pending, &prn_waiter, &last_validated_bytes, &progress_context, &events)
                                    .await
                            {
                                log::warn!("{e}");
                            }
                        }
                        Some(_) => {
                            // Notifications from other characteristics are not this dialog's concern.
                        }
                        None => {
                            fail_all_pending(&pending).await;
                            if let Some(tx) = prn_waiter.lock().await.take() {
                                drop(tx);
                            }
                            break;
                        }
                    }
                }
            })
        };

        Self { transport, serializer, pending, prn_waiter, last_validated_bytes, progress_context, response_delay, pump }
    }

    /// Record the image currently in flight and its byte counters, so a
    /// spontaneous PRN notification (one that arrives outside
    /// [`Self::wait_for_prn`]) can still be turned into a [`ProgressEvent`].
    pub fn set_progress_context(&self, kind: ImageKind, total_bytes: u32, sent_bytes: u32) {
        *self.progress_context.lock().unwrap() = Some(ProgressContext { kind, total_bytes, sent_bytes });
    }

    async fn send(&self, request: ControlRequest) -> Result<Vec<u8>> {
        let opcode_byte = request.opcode_byte();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&opcode_byte) {
                return Err(DfuError::ProtocolViolation(format!(
                    "opcode 0x{opcode_byte:02X} already has an outstanding waiter"
                )));
            }
            pending.insert(opcode_byte, tx);
        }

        let bytes = request.encode();
        if let Err(e) = self.serializer.submit(self.transport.as_ref(), CharacteristicKind::Control, &bytes).await {
            self.pending.lock().await.remove(&opcode_byte);
            return Err(e);
        }

        let outcome = rx.await.map_err(|_| DfuError::Disconnected)?;
        let payload = outcome?;

        if !self.response_delay.is_zero() {
            tokio::time::sleep(self.response_delay).await;
        }

        Ok(payload)
    }

    pub async fn select(&self, kind: ImageKind) -> Result<SelectResponse> {
        let request = match kind {
            ImageKind::Init => ControlRequest::SelectCommand,
            ImageKind::Firmware => ControlRequest::SelectData,
        };
        let payload = self.send(request).await?;
        if payload.len() < 12 {
            return Err(DfuError::ProtocolViolation("select response too short".to_string()));
        }
        Ok(SelectResponse {
            max_size: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            offset: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
            crc: i32::from_le_bytes(payload[8..12].try_into().unwrap()),
        })
    }

    pub async fn create(&self, kind: ImageKind, size: u32) -> Result<()> {
        let request = match kind {
            ImageKind::Init => ControlRequest::CreateCommand(size),
            ImageKind::Firmware => ControlRequest::CreateData(size),
        };
        self.send(request).await.map(|_| ())
    }

    pub async fn set_prn(&self, interval: u16) -> Result<()> {
        self.send(ControlRequest::SetPrn(interval)).await.map(|_| ())
    }

    pub async fn calculate_checksum(&self) -> Result<ChecksumResponse> {
        let payload = self.send(ControlRequest::CalculateChecksum).await?;
        if payload.len() < 8 {
            return Err(DfuError::ProtocolViolation("checksum response too short".to_string()));
        }
        Ok(ChecksumResponse {
            offset: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            crc: i32::from_le_bytes(payload[4..8].try_into().unwrap()),
        })
    }

    pub async fn execute(&self) -> Result<()> {
        self.send(ControlRequest::Execute).await.map(|_| ())
    }

    /// The `validatedBytes` carried by the most recent PRN notification.
    pub fn last_validated_bytes(&self) -> u32 {
        self.last_validated_bytes.load(Ordering::SeqCst)
    }

    /// Wait for the next PRN notification (first byte `0x03`), or `None`
    /// on timeout. Spurious PRN notifications received outside a waiting
    /// state are not queued; they only update [`Self::last_validated_bytes`]
    /// and emit a progress event.
    pub async fn wait_for_prn(&self, timeout: Duration) -> Option<u32> {
        let (tx, rx) = oneshot::channel();
        *self.prn_waiter.lock().await = Some(tx);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(validated)) => Some(validated),
            _ => {
                self.prn_waiter.lock().await.take();
                None
            }
        }
    }
}

impl<T: DfuTransport + 'static> Drop for ControlDialog<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn fail_all_pending(pending: &PendingMap) {
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(DfuError::Disconnected));
    }
}

async fn handle_notification(
    bytes: Vec<u8>,
    pending: &PendingMap,
    prn_waiter: &PrnWaiter,
    last_validated_bytes: &AtomicU32,
    progress_context: &ProgressContextCell,
    events: &EventSink,
) -> Result<()> {
    let Some(&leading) = bytes.first() else {
        return Err(DfuError::ProtocolViolation("empty control notification".to_string()));
    };

    if leading == 0x03 {
        if bytes.len() < 5 {
            return Err(DfuError::ProtocolViolation("short PRN notification".to_string()));
        }
        let validated = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        last_validated_bytes.store(validated, Ordering::SeqCst);
        if let Some(tx) = prn_waiter.lock().await.take() {
            let _ = tx.send(validated);
        }
        if let Some(context) = *progress_context.lock().unwrap() {
            events.progress(ProgressEvent {
                object: context.kind,
                total_bytes: context.total_bytes,
                sent_bytes: context.sent_bytes,
                validated_bytes: validated,
            });
        }
        return Ok(());
    }

    if leading == 0x60 {
        if bytes.len() < 3 {
            return Err(DfuError::ProtocolViolation("short control response header".to_string()));
        }
        let opcode = bytes[1];
        let result = bytes[2];

        let outcome = if result == 0x01 {
            Ok(bytes[3..].to_vec())
        } else if result == 0x0B {
            let extended = bytes.get(3).copied();
            let message = match extended {
                Some(code) => format!("Error 0x{code:02X}: {}", describe_extended(code)),
                None => "Error 0x0B: extended error (peer sent no extended code)".to_string(),
            };
            Err(DfuError::ControlRejected { code: result, extended, message })
        } else {
            let message = format!("Error 0x{result:02X}: {}", describe_result(result));
            Err(DfuError::ControlRejected { code: result, extended: None, message })
        };

        if let Some(tx) = pending.lock().await.remove(&opcode) {
            let _ = tx.send(outcome);
        }
        return Ok(());
    }

    Err(DfuError::ProtocolViolation(format!("unrecognised control response (leading byte 0x{leading:02X})")))
}
