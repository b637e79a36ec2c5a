pub mod socket;
pub mod tab;

pub use socket::serve_socket;
pub use tab::{Bridge, BridgeExit};
