pub mod normalizer;
pub mod relay;
pub mod storage;
pub mod token;

pub use normalizer::{canonicalize, fingerprint, Normalizer, Verdict};
pub use relay::PageRelay;
pub use storage::StoragePoller;
pub use token::TokenTracker;
