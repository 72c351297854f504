/// BLE GATT peripheral exposing the pairing and data characteristics
pub mod gatt;

pub use gatt::{start_peripheral, Peripheral};
