//! Client-side driver for Nordic Semiconductor's Secure DFU protocol over
//! a Bluetooth Low Energy GATT transport.
//!
//! Given a firmware update package and a handle to a connected peer
//! exposing the Secure DFU service, [`DfuDriver::update`] uploads the
//! init packet and firmware image in the protocol-mandated order,
//! validating each transferred window with a CRC-32 checksum and
//! instructing the device to execute it.

pub mod control;
pub mod error;
pub mod events;
pub mod image;
pub mod package;
pub mod serializer;
pub mod session;
pub mod smart_speed;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod transport_btleplug;

pub use error::{DfuError, Result};
pub use events::{Event, EventSink, ProgressEvent};
pub use package::{ComponentEntry, ComponentKind, FirmwarePackage, Manifest};
pub use session::{DfuConfig, DfuDriver};
pub use smart_speed::SmartSpeedConfig;
pub use state::{DeviceObjectWindow, ImageKind, TransferState};
pub use transport::{CharacteristicKind, CharacteristicSet, DfuTransport, DfuTransportManager};
