//! Object Transfer Engine: for a single object window, CREATE, stream
//! packets with PRN pacing, request and verify CHECKSUM, then EXECUTE.
//! Transfers exactly one window per call; iterating across windows and
//! recovering from a failed window is the Smart Speed Controller's job
//! (`crate::smart_speed`), which wraps each call here.

use crate::control::ControlDialog;
use crate::error::{DfuError, Result};
use crate::events::{EventSink, ProgressEvent};
use crate::serializer::WriteSerializer;
use crate::state::{ImageKind, TransferState};
use crate::transport::{CharacteristicKind, DfuTransport};

use std::sync::Arc;
use std::time::Duration;

/// CRC-32 implementation injected into the engine. Defaults to
/// CRC-32/IEEE 802.3 seeded at zero, matching Nordic's reference
/// implementation; callers may supply a host-provided implementation.
pub type CrcFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

pub fn default_crc() -> CrcFn {
    Arc::new(|bytes: &[u8]| crc32fast::hash(bytes))
}

fn emit_progress<T: DfuTransport + 'static>(ctx: &TransferContext<'_, T>, state: &TransferState) {
    ctx.dialog.set_progress_context(state.current_object_kind, state.total_bytes, state.sent_bytes);
    ctx.events.progress(ProgressEvent {
        object: state.current_object_kind,
        total_bytes: state.total_bytes,
        sent_bytes: state.sent_bytes,
        validated_bytes: state.validated_bytes,
    });
}

/// Collaborators a window transfer needs; bundled so call sites in
/// `smart_speed` and `image` don't have to thread five parameters through.
pub struct TransferContext<'a, T: DfuTransport + 'static> {
    pub dialog: &'a ControlDialog<T>,
    pub serializer: &'a WriteSerializer,
    pub transport: &'a T,
    pub events: &'a EventSink,
    pub crc: &'a CrcFn,
    pub delay: Duration,
}

/// Transfer the window `[start, min(start + max_object_size, image.len()))`:
/// CREATE, stream, CHECKSUM, EXECUTE. Returns the offset just past the
/// window on success.
///
/// A CRC mismatch is fatal for this attempt (no per-window retry happens
/// here); the caller decides whether to retry or degrade.
pub async fn transfer_window<T: DfuTransport + 'static>(
    ctx: &TransferContext<'_, T>,
    image: &[u8],
    kind: ImageKind,
    start: usize,
    max_object_size: usize,
    state: &mut TransferState,
) -> Result<usize> {
    let end = (start + max_object_size).min(image.len());
    let chunk = &image[start..end];

    ctx.dialog.create(kind, chunk.len() as u32).await?;

    for packet in chunk.chunks(state.packet_size.max(1)) {
        if state.prn_interval > 0 && state.packets_sent_since_prn >= u32::from(state.prn_interval) {
            if ctx.dialog.wait_for_prn(Duration::from_secs(3)).await.is_none() {
                ctx.events.log("PRN wait timed out, proceeding without flow control");
            }
            state.packets_sent_since_prn = 0;
        }

        ctx.serializer.submit(ctx.transport, CharacteristicKind::Packet, packet).await?;
        state.packets_sent_since_prn += 1;
        state.sent_bytes += packet.len() as u32;

        if !ctx.delay.is_zero() {
            tokio::time::sleep(ctx.delay).await;
        }
        emit_progress(ctx, state);
    }

    let checksum = ctx.dialog.calculate_checksum().await?;
    let expected = (ctx.crc)(&image[..checksum.offset as usize]) as i32;
    if checksum.crc != expected {
        return Err(DfuError::CrcMismatch { offset: checksum.offset });
    }

    state.validated_bytes = checksum.offset;
    emit_progress(ctx, state);

    ctx.dialog.execute().await?;

    Ok(end)
}
