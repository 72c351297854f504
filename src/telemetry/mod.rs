pub mod decoder;
pub mod rtd;

pub use decoder::{DecodeError, Decoder};
