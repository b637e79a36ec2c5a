pub mod connection;
pub mod manager;
pub mod messages;

pub use connection::{CdpEvent, CdpSession};
pub use manager::CdpManager;
