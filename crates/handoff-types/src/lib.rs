//! Shared data model for device-to-device transfer.
//!
//! Entity shapes, the `TransferItem` union that travels inside message
//! frames, control `Command`s, the pairing payload shown as a QR code, and
//! the persistence collaborator traits implemented by the storage layer.

pub mod command;
pub mod item;
pub mod models;
pub mod pairing;
pub mod store;

pub use command::{Action, Command, PROTOCOL_VERSION, PushContext};
pub use item::{ItemKind, Record, TransferItem};
pub use pairing::{PairingError, PairingPayload};
pub use store::{RecordSource, RecordStore, StoreError};
