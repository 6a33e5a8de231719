//! Connection, service/characteristic discovery, notifications, and raw
//! writes are external collaborators; this module only defines the
//! interface the rest of the crate needs from them.

use anyhow::Result;

/// The three logical characteristics the Secure DFU service exposes.
/// UUIDs are fixed by the protocol; see [`dfu_uuids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    Control,
    Packet,
    Buttonless,
}

/// Which optional/required characteristics a connected peer actually
/// exposes, as discovered by `getCharacteristics` + UUID match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharacteristicSet {
    pub control: bool,
    pub packet: bool,
    pub buttonless: bool,
}

impl CharacteristicSet {
    /// The engine requires Control and Packet; Buttonless is optional.
    pub fn has_dfu_mode_characteristics(&self) -> bool {
        self.control && self.packet
    }
}

/// A connected DFU transport manager: discovers a peer and hands back a
/// connected [`DfuTransport`].
pub trait DfuTransportManager {
    type Transport: DfuTransport;

    /// Connect to the target device by name or address.
    async fn connect(&self, target: &str) -> Result<Self::Transport>;
}

/// Operations the engine requires from a connected peer.
///
/// Writes may fail transiently (the peer reports a busy condition,
/// conventionally surfaced as an error message containing "in progress")
/// or fatally (a payload exceeding the negotiated MTU, conventionally
/// surfaced as a message containing "longer than maximum length", see
/// [`is_busy`] and [`is_value_too_long`]). The engine distinguishes these
/// by inspecting the error text rather than a transport-specific error
/// type, since the error originates below this trait.
pub trait DfuTransport: Send + Sync {
    /// Whether the peer is currently connected.
    fn is_connected(&self) -> bool;

    /// Which characteristics were found on the peer after connecting.
    fn characteristics(&self) -> CharacteristicSet;

    /// Write `bytes` to the named characteristic.
    async fn write(&self, characteristic: CharacteristicKind, bytes: &[u8]) -> Result<()>;

    /// Subscribe to notifications on the named characteristic.
    async fn subscribe(&self, characteristic: CharacteristicKind) -> Result<()>;

    /// Await the next notification from any subscribed characteristic.
    /// Resolves to `None` once the peer disconnects and no further
    /// notifications will arrive.
    async fn next_notification(&self) -> Option<(CharacteristicKind, Vec<u8>)>;

    /// Request the peer to disconnect and wait for the link to drop, up
    /// to an implementation-defined bound.
    async fn disconnect(&self) -> Result<()>;
}

/// `true` if `err` represents the transport's "operation in progress"
/// busy signal, which [`crate::serializer::WriteSerializer`] retries
/// transparently rather than propagating.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.to_string().contains("in progress")
}

/// `true` if `err` represents a write rejected for exceeding the
/// negotiated MTU. Unlike [`is_busy`], this is never retried.
pub fn is_value_too_long(err: &anyhow::Error) -> bool {
    err.to_string().contains("longer than maximum length")
}

/// nRF DFU service & characteristic UUIDs, as defined by
/// [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html).
pub mod dfu_uuids {
    use uuid::Uuid;

    /// DFU Service (16 bit UUID 0xFE59)
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control Point characteristic (write + notify)
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Packet characteristic (write, preferably without response)
    pub const DATA_PT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds characteristic (write + notify)
    pub const BTTNLSS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
}
