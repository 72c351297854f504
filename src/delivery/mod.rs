pub mod backlog;
pub mod client;
pub mod queue;

pub use backlog::Backlog;
pub use client::HttpBackend;
pub use queue::{Delivery, DeliveryQueue};
