//! Image Driver: SELECT, decide restart vs. resume vs. skip, seed
//! transfer counters, and delegate window-by-window transfer to the Smart
//! Speed Controller. Run once per image (`init`, then `firmware`).

use crate::error::Result;
use crate::events::ProgressEvent;
use crate::smart_speed::{self, SmartSpeedConfig};
use crate::state::{ImageKind, TransferState};
use crate::transfer::TransferContext;
use crate::transport::DfuTransport;

/// Run SELECT, the restart/resume/skip decision, and (unless skipped) the
/// full transfer of `image` as image kind `kind`.
pub async fn run_image<T: DfuTransport + 'static>(
    ctx: &TransferContext<'_, T>,
    image: &[u8],
    kind: ImageKind,
    force_restart: bool,
    packet_size: usize,
    prn_interval: u16,
    smart_speed_config: &SmartSpeedConfig,
) -> Result<()> {
    let select = ctx.dialog.select(kind).await?;
    let max_object_size = (select.max_size as usize).max(1);
    let mut offset = select.offset as usize;

    if force_restart && select.offset > 0 {
        ctx.events.log(format!("force restart requested: re-uploading {kind} image from byte 0"));
        offset = 0;
    } else if kind == ImageKind::Init && select.offset as usize == image.len() && (ctx.crc)(image) as i32 == select.crc {
        ctx.events.log("init packet already available, skipping transfer");
        return Ok(());
    } else if offset == 0 {
        ctx.events.log(format!("starting fresh transfer of {kind} image ({} bytes)", image.len()));
    } else {
        ctx.events.log(format!("resuming {kind} image transfer from offset {offset}"));
    }

    // Align the window start to the device's pages when resuming, so the
    // engine recreates the current (incomplete) object from its start
    // rather than from the mid-window byte the device last reported.
    let window_start = if offset == 0 { 0 } else { offset - (offset % max_object_size) };

    let mut state = TransferState::new(kind, image.len() as u32, window_start as u32, packet_size, prn_interval);
    ctx.dialog.set_progress_context(kind, state.total_bytes, state.sent_bytes);
    ctx.events.progress(ProgressEvent {
        object: kind,
        total_bytes: state.total_bytes,
        sent_bytes: state.sent_bytes,
        validated_bytes: state.validated_bytes,
    });

    smart_speed::drive_image(ctx, image, kind, window_start, max_object_size, &mut state, smart_speed_config).await
}
