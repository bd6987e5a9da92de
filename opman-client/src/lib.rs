//! Operator console client
//!
//! REST access to the execution and auth endpoints of the console backend,
//! plus re-exports of the task log channel for binaries built on top.

pub mod api;
pub mod error;

pub use api::{ApiClient, DEFAULT_PAGE_SIZE};
pub use error::ClientError;
pub use opman_common as common;
pub use opman_tasklog as tasklog;
