pub mod credential;

pub use credential::{connect, CredentialStore};
