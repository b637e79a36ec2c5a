pub mod card;
pub mod scanner;

pub use card::{locate_card, scan_document};
pub use scanner::DomScanner;
