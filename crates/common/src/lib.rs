// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod credentials;
pub mod types;

pub use config::{ApiConfig, ConsoleConfig, StreamConfig};
pub use credentials::{authorization_header, CredentialProvider, SessionCredentials, StaticToken};
pub use types::*;
