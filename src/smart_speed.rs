//! Smart Speed Controller: wraps each window transfer with a bounded
//! same-speed retry, then a degrade-and-retry ladder once that budget is
//! exhausted. Owns the loop across windows for one image; the Object
//! Transfer Engine (`crate::transfer`) only knows how to attempt a single
//! window.

use crate::error::Result;
use crate::state::{ImageKind, TransferState};
use crate::transfer::{TransferContext, transfer_window};
use crate::transport::DfuTransport;

use std::sync::Arc;

const RETRIES_BEFORE_DEGRADE: u8 = 3;

/// User-supplied degradation policy: given the error message and current
/// (prn, packetSize), returns new parameters, or `None` to stop retrying.
pub type DegradePolicy = Arc<dyn Fn(&str, u16, usize) -> Option<(u16, usize)> + Send + Sync>;

#[derive(Clone)]
pub struct SmartSpeedConfig {
    pub enabled: bool,
    pub policy: Option<DegradePolicy>,
}

impl Default for SmartSpeedConfig {
    fn default() -> Self {
        Self { enabled: true, policy: None }
    }
}

/// The built-in degradation ladder: halve the packet size down to a floor
/// of 20 bytes, then halve the PRN interval down to 1, then (if PRN was
/// disabled) enable it at 12. Returns `None` once none of these change
/// anything, meaning the caller should give up.
fn default_degrade(prn: u16, packet_size: usize) -> Option<(u16, usize)> {
    if packet_size > 20 {
        Some((prn, packet_size.div_ceil(2).max(20)))
    } else if prn > 1 {
        Some((prn.div_ceil(2), packet_size))
    } else if prn == 0 {
        Some((12, packet_size))
    } else {
        None
    }
}

/// Run the Object Transfer Engine over `image`, starting at `offset`,
/// until the whole image is transferred or the retry/degrade budget is
/// exhausted.
pub async fn drive_image<T: DfuTransport + 'static>(
    ctx: &TransferContext<'_, T>,
    image: &[u8],
    kind: ImageKind,
    mut offset: usize,
    max_object_size: usize,
    state: &mut TransferState,
    smart_speed: &SmartSpeedConfig,
) -> Result<()> {
    let events = ctx.events;
    while offset < image.len() {
        match transfer_window(ctx, image, kind, offset, max_object_size, state).await {
            Ok(next_offset) => {
                offset = next_offset;
                state.retries_at_current_speed = 0;
            }
            Err(error) => {
                if !smart_speed.enabled {
                    return Err(error);
                }

                state.retries_at_current_speed += 1;
                if state.retries_at_current_speed <= RETRIES_BEFORE_DEGRADE {
                    events.log(format!(
                        "Retrying with same parameters (Attempt {}/{RETRIES_BEFORE_DEGRADE}): {error}",
                        state.retries_at_current_speed
                    ));
                    ctx.serializer.reset();
                    state.packets_sent_since_prn = 0;
                    if state.prn_interval > 0 {
                        ctx.dialog.set_prn(state.prn_interval).await?;
                    }
                    continue;
                }

                state.retries_at_current_speed = 0;
                let degraded = match &smart_speed.policy {
                    Some(policy) => policy(&error.to_string(), state.prn_interval, state.packet_size),
                    None => default_degrade(state.prn_interval, state.packet_size),
                };

                match degraded {
                    Some((prn, packet_size)) => {
                        events.log(format!(
                            "Degrading speed after repeated failures: prn {} -> {prn}, packetSize {} -> {packet_size}",
                            state.prn_interval, state.packet_size
                        ));
                        state.prn_interval = prn;
                        state.packet_size = packet_size;
                        state.packets_sent_since_prn = 0;
                        ctx.serializer.reset();
                        if state.prn_interval > 0 {
                            ctx.dialog.set_prn(state.prn_interval).await?;
                        }
                    }
                    None => return Err(error),
                }
            }
        }
    }

    Ok(())
}
