//! Image/window vocabulary shared across the rest of the crate.

/// Determines which SELECT/CREATE opcode pair addresses an image, and
/// doubles as the `object` label on progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Init,
    Firmware,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ImageKind::Init => "init",
            ImageKind::Firmware => "firmware",
        })
    }
}

/// The window geometry reported by SELECT for the image currently being
/// transferred: the maximum number of bytes the peer can buffer before an
/// EXECUTE, and the offset/CRC the peer already holds (for resume).
pub type DeviceObjectWindow = crate::control::SelectResponse;

/// Per-image transfer bookkeeping, owned by the Session Orchestrator and
/// mutated by the Smart Speed Controller and Object Transfer Engine.
/// Reset at image boundaries.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub total_bytes: u32,
    pub sent_bytes: u32,
    pub validated_bytes: u32,
    pub current_object_kind: ImageKind,
    pub packets_sent_since_prn: u32,
    pub prn_interval: u16,
    pub packet_size: usize,
    pub retries_at_current_speed: u8,
}

impl TransferState {
    pub fn new(kind: ImageKind, total_bytes: u32, offset: u32, packet_size: usize, prn_interval: u16) -> Self {
        Self {
            total_bytes: total_bytes.max(1),
            sent_bytes: offset,
            validated_bytes: offset,
            current_object_kind: kind,
            packets_sent_since_prn: 0,
            prn_interval,
            packet_size,
            retries_at_current_speed: 0,
        }
    }
}
