use thiserror::Error;

/// Errors surfaced by the DFU engine.
///
/// Variants correspond one-to-one to the error kinds classified by the
/// protocol: transport-level busyness and disconnects are recovered where
/// possible (see [`crate::serializer`] and [`crate::smart_speed`]) and only
/// escalate to this type once recovery is exhausted.
#[derive(Debug, Error)]
pub enum DfuError {
    #[error("malformed DFU package: {0}")]
    MalformedPackage(String),

    #[error("required GATT characteristics not found on peer")]
    MissingCharacteristics,

    #[error("device does not expose a supported DFU interface")]
    UnsupportedDevice,

    #[error("peer disconnected while an operation was pending")]
    Disconnected,

    #[error("transport busy: exhausted retries waiting for peer to become ready")]
    TransportBusy,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{message}")]
    ControlRejected { code: u8, extended: Option<u8>, message: String },

    #[error("CRC mismatch at offset {offset}")]
    CrcMismatch { offset: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DfuError>;
