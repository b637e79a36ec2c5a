//! Captures P2P operations and the session credential from a trading page and
//! relays both to registered consumer tabs.

pub mod api;
pub mod bridge;
pub mod broker;
pub mod cdp;
pub mod config;
pub mod db;
pub mod dom;
pub mod error;
pub mod intercept;
pub mod page;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod types;
